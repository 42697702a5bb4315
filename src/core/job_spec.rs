//! Job identity - what a pipeline run builds and tests

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Environment variable carrying the serialized job identity
pub const JOB_SPEC_ENV: &str = "JOB_SPEC";

/// Errors raised while resolving the job identity
#[derive(Debug, Error)]
pub enum JobSpecError {
    #[error("${0} unset")]
    Missing(&'static str),

    #[error("malformed ${var}: {source}")]
    Malformed {
        var: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Kind of job that triggered the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Presubmit,
    Postsubmit,
    Periodic,
    Batch,
}

/// A pull request merged on top of the base ref
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Pull {
    #[serde(skip_serializing_if = "is_zero")]
    pub number: u64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub sha: String,
}

/// Source references under test
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Refs {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub org: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub repo: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_ref: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_sha: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pulls: Vec<Pull>,

    /// Alternate checkout directory (relative to `/go/src`)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path_alias: String,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Refs {
    /// Directory the source is checked out to, relative to `/go/src`
    pub fn checkout_path(&self) -> String {
        if self.path_alias.is_empty() {
            format!("github.com/{}/{}", self.org, self.repo)
        } else {
            self.path_alias.clone()
        }
    }

    /// Clone URL of the repository
    pub fn clone_url(&self) -> String {
        format!("https://github.com/{}/{}.git", self.org, self.repo)
    }
}

impl fmt::Display for Refs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.base_ref, self.base_sha)?;
        for pull in &self.pulls {
            write!(f, ",{}:{}", pull.number, pull.sha)?;
        }
        Ok(())
    }
}

/// Object that owns everything a run creates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub controller: bool,
}

impl OwnerReference {
    /// Parse `KIND/NAME/UID`
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, '/');
        let kind = parts.next().filter(|s| !s.is_empty())?;
        let name = parts.next().filter(|s| !s.is_empty())?;
        let uid = parts.next().filter(|s| !s.is_empty())?;
        Some(Self {
            api_version: "v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
            controller: true,
        })
    }
}

/// Ordered description of what a run (or a step) consumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDefinition(pub Vec<String>);

impl InputDefinition {
    pub fn new(entries: Vec<String>) -> Self {
        Self(entries)
    }

    pub fn entries(&self) -> &[String] {
        &self.0
    }

    /// Append another definition's entries
    pub fn extend(&mut self, other: InputDefinition) {
        self.0.extend(other.0);
    }

    /// Hex SHA-256 over all entries
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for entry in &self.0 {
            hasher.update(entry.as_bytes());
            // entry separator; keeps ["ab","c"] and ["a","bc"] apart
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Namespace derived from the digest
    pub fn namespace(&self) -> String {
        format!("ci-op-{}", &self.digest()[..8])
    }
}

/// The serialized identity fields
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawJobSpec {
    #[serde(rename = "type")]
    job_type: Option<JobType>,
    job: String,
    #[serde(rename = "buildid")]
    build_id: String,
    #[serde(rename = "prowjobid")]
    prow_job_id: String,
    refs: Refs,
}

/// Used by [`JobSpec::inputs`]: serializes only the refs
#[derive(Serialize)]
struct RefsOnly<'a> {
    refs: &'a Refs,
}

/// Immutable description of the job a run operates on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobSpec {
    job_type: Option<JobType>,
    job: String,
    build_id: String,
    prow_job_id: String,
    refs: Refs,
    raw: String,
    namespace: String,
    base_namespace: String,
    grace_period: Option<Duration>,
    owner: Option<OwnerReference>,
}

impl JobSpec {
    /// Parse a serialized job identity
    ///
    /// `None` means the value was never supplied, which is reported separately from a value
    /// that fails to parse.
    pub fn resolve(raw: Option<&str>) -> Result<Self, JobSpecError> {
        let raw = raw.ok_or(JobSpecError::Missing(JOB_SPEC_ENV))?;
        let parsed: RawJobSpec =
            serde_json::from_str(raw).map_err(|source| JobSpecError::Malformed {
                var: JOB_SPEC_ENV,
                source,
            })?;

        Ok(Self {
            job_type: parsed.job_type,
            job: parsed.job,
            build_id: parsed.build_id,
            prow_job_id: parsed.prow_job_id,
            refs: parsed.refs,
            raw: raw.to_string(),
            namespace: String::new(),
            base_namespace: String::new(),
            grace_period: None,
            owner: None,
        })
    }

    /// Target the run at a namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>, base_namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self.base_namespace = base_namespace.into();
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = Some(grace_period);
        self
    }

    /// Attach the owner of every artifact created by the run
    pub fn with_owner(mut self, owner: OwnerReference) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn job_type(&self) -> Option<JobType> {
        self.job_type
    }

    pub fn job(&self) -> &str {
        &self.job
    }

    pub fn build_id(&self) -> &str {
        &self.build_id
    }

    pub fn prow_job_id(&self) -> &str {
        &self.prow_job_id
    }

    pub fn refs(&self) -> &Refs {
        &self.refs
    }

    /// The serialized form exactly as it was supplied
    pub fn raw_spec(&self) -> &str {
        &self.raw
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn base_namespace(&self) -> &str {
        &self.base_namespace
    }

    pub fn grace_period(&self) -> Option<Duration> {
        self.grace_period
    }

    pub fn owner(&self) -> Option<&OwnerReference> {
        self.owner.as_ref()
    }

    /// Definition of the job as an input to the execution graph
    ///
    /// Only the refs participate: two runs over the same refs consume the same source.
    pub fn inputs(&self) -> InputDefinition {
        // Refs holds only strings, integers and vectors of those
        let raw = serde_json::to_string(&RefsOnly { refs: &self.refs }).unwrap_or_default();
        InputDefinition(vec![raw])
    }

    /// Labels attached to every object the run creates
    pub fn labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert("job".to_string(), self.job.clone());
        labels.insert("build-id".to_string(), self.build_id.clone());
        labels.insert("prow.k8s.io/id".to_string(), self.prow_job_id.clone());
        labels.insert("created-by-ci".to_string(), "true".to_string());
        labels
    }
}

/// Resolve the job identity from `$JOB_SPEC`
pub fn resolve_spec_from_env() -> Result<JobSpec, JobSpecError> {
    let raw = std::env::var(JOB_SPEC_ENV).ok();
    JobSpec::resolve(raw.as_deref())
}
