//! Check out the refs under test on top of the build root

use crate::clients::{BuildClient, BuildSource, ImageClient};
use crate::core::config::ResourceConfiguration;
use crate::core::job_spec::Refs;
use crate::core::link::{PipelineImageTag, StepLink, ROOT_TAG, SOURCE_TAG};
use crate::core::{JobSpec, Step, StepContext, StepError};
use crate::steps::build::{build_from_source, handle_build, image_stream_tag_exists};
use async_trait::async_trait;
use std::sync::Arc;

/// Single-quote `value` for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quote a refs value for the RUN line; line breaks would end the instruction
fn quoted(value: &str) -> Result<String, StepError> {
    if value.chars().any(char::is_control) {
        return Err(StepError::InvalidRefs(format!("{:?} contains control characters", value)));
    }
    Ok(shell_quote(value))
}

/// Dockerfile cloning `refs` into the source directory of the build root
pub fn source_dockerfile(from: &PipelineImageTag, refs: &Refs) -> Result<String, StepError> {
    let checkout = format!("/go/src/{}", refs.checkout_path());
    let dir = quoted(&checkout)?;
    let mut script = vec![
        "umask 0002".to_string(),
        format!("mkdir -p {}", dir),
        format!("git clone {} {}", quoted(&refs.clone_url())?, dir),
        format!("cd {}", dir),
        format!("git checkout {}", quoted(&refs.base_sha)?),
    ];
    for pull in &refs.pulls {
        script.push(format!("git fetch origin pull/{}/head", pull.number));
        script.push(format!("git merge {}", quoted(&pull.sha)?));
    }

    Ok(format!(
        "FROM {}\nENV GIT_COMMITTER_NAME=developer GIT_COMMITTER_EMAIL=developer@redhat.com\nRUN {}\nWORKDIR {}/\n",
        from.stream_tag(),
        script.join(" && "),
        checkout
    ))
}

pub struct SourceStep {
    resources: ResourceConfiguration,
    builds: Arc<dyn BuildClient>,
    images: Arc<dyn ImageClient>,
    job_spec: Arc<JobSpec>,
}

impl SourceStep {
    pub fn new(
        resources: ResourceConfiguration,
        builds: Arc<dyn BuildClient>,
        images: Arc<dyn ImageClient>,
        job_spec: Arc<JobSpec>,
    ) -> Self {
        Self {
            resources,
            builds,
            images,
            job_spec,
        }
    }
}

#[async_trait]
impl Step for SourceStep {
    fn name(&self) -> &str {
        SOURCE_TAG
    }

    fn description(&self) -> String {
        format!("Clone {} into the build root", self.job_spec.refs())
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::internal(ROOT_TAG)]
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(SOURCE_TAG)]
    }

    async fn done(&self) -> Result<bool, StepError> {
        image_stream_tag_exists(self.images.as_ref(), self.job_spec.namespace(), &SOURCE_TAG.into()).await
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        let root = PipelineImageTag::new(ROOT_TAG);
        let dockerfile = source_dockerfile(&root, self.job_spec.refs())?;
        let build = build_from_source(
            &self.job_spec,
            Some(&root),
            &SOURCE_TAG.into(),
            BuildSource {
                dockerfile: Some(dockerfile),
                images: Vec::new(),
            },
            None,
            &self.resources,
        );
        handle_build(self.builds.as_ref(), build, ctx).await
    }
}
