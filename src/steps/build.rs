//! Shared build plumbing for image-producing steps

use crate::clients::{Build, BuildClient, BuildSource, BuildStatus, ImageClient};
use crate::core::config::ResourceConfiguration;
use crate::core::job_spec::{JobSpec, Refs};
use crate::core::link::{PipelineImageTag, PIPELINE_IMAGE_STREAM};
use crate::core::{Parameter, StepContext, StepError};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Label naming the pipeline tag a build creates
pub const CREATES_LABEL: &str = "creates";

pub const SOURCE_LABEL: &str = "org.opencontainers.image.source";
pub const REVISION_LABEL: &str = "org.opencontainers.image.revision";
pub const COMMIT_REF_LABEL: &str = "io.openshift.build.commit.ref";

/// Name of the parameter exposing the registry reference of `to`
///
/// `LOCAL_IMAGE_` followed by the tag upper-cased, with `-` replaced by `_`.
pub fn parameter_name(to: &PipelineImageTag) -> String {
    format!("LOCAL_IMAGE_{}", to.as_str().replace('-', "_").to_uppercase())
}

/// Provenance labels for images built from `refs`
///
/// Builds of a base branch carry the real commit metadata. Builds that include any pull
/// request carry the same keys with empty values.
pub fn provenance_labels(refs: &Refs) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    if refs.pulls.is_empty() {
        labels.insert(
            SOURCE_LABEL.to_string(),
            format!("https://github.com/{}/{}", refs.org, refs.repo),
        );
        labels.insert(REVISION_LABEL.to_string(), refs.base_sha.clone());
        labels.insert(COMMIT_REF_LABEL.to_string(), refs.base_ref.clone());
    } else {
        for key in [SOURCE_LABEL, REVISION_LABEL, COMMIT_REF_LABEL] {
            labels.insert(key.to_string(), String::new());
        }
    }
    labels
}

/// Compose a build of the pipeline tag `to`
pub fn build_from_source(
    job_spec: &JobSpec,
    from: Option<&PipelineImageTag>,
    to: &PipelineImageTag,
    source: BuildSource,
    dockerfile_path: Option<String>,
    resources: &ResourceConfiguration,
) -> Build {
    let mut labels = job_spec.labels();
    labels.insert(CREATES_LABEL.to_string(), to.to_string());

    Build {
        namespace: job_spec.namespace().to_string(),
        name: to.to_string(),
        labels,
        owner: job_spec.owner().cloned(),
        from: from.map(PipelineImageTag::stream_tag),
        to: to.stream_tag(),
        source,
        dockerfile_path,
        output_labels: BTreeMap::new(),
        resources: resources.requirements_for(to.as_str()),
    }
}

/// Submit `build` and wait for it, or only log it in dry runs
pub async fn handle_build(client: &dyn BuildClient, build: Build, ctx: &StepContext) -> Result<(), StepError> {
    if ctx.dry_run {
        info!("Dry run: would create build {}/{}", build.namespace, build.name);
        debug!("{}", serde_json::to_string_pretty(&build).unwrap_or_default());
        return Ok(());
    }

    ctx.check_cancelled()?;
    client.create_build(&build).await?;
    info!("Created build {}/{}", build.namespace, build.name);

    let status = tokio::select! {
        status = client.wait_for_build(&build.namespace, &build.name) => status?,
        _ = ctx.cancel.cancelled() => {
            warn!("Stopped waiting for build {} after cancellation", build.name);
            return Err(StepError::Cancelled);
        }
    };

    match status {
        BuildStatus::Complete => Ok(()),
        BuildStatus::Failed { reason, log_snippet } => {
            if !log_snippet.is_empty() {
                warn!("Build {} failed:\n{}", build.name, log_snippet);
            }
            Err(StepError::BuildFailed {
                name: build.name,
                reason,
            })
        }
    }
}

/// Whether `pipeline:<tag>` exists in `namespace`
pub async fn image_stream_tag_exists(
    client: &dyn ImageClient,
    namespace: &str,
    tag: &PipelineImageTag,
) -> Result<bool, StepError> {
    Ok(client
        .get_image_stream_tag(namespace, PIPELINE_IMAGE_STREAM, tag.as_str())
        .await?
        .is_some())
}

/// Fully qualified reference of `pipeline:<tag>`
///
/// Prefers the stream's public repository over its internal one.
pub async fn registry_reference(
    client: &dyn ImageClient,
    namespace: &str,
    tag: &PipelineImageTag,
) -> Result<String, StepError> {
    let stream = client
        .get_image_stream(namespace, PIPELINE_IMAGE_STREAM)
        .await
        .map_err(|e| StepError::Lookup(format!("could not retrieve output imagestream: {}", e)))?
        .ok_or_else(|| {
            StepError::Lookup(format!(
                "could not retrieve output imagestream: {}/{} not found",
                namespace, PIPELINE_IMAGE_STREAM
            ))
        })?;

    let registry = if !stream.public_docker_image_repository.is_empty() {
        stream.public_docker_image_repository
    } else if !stream.docker_image_repository.is_empty() {
        stream.docker_image_repository
    } else {
        return Err(StepError::Lookup(format!(
            "image stream {} has no accessible image registry value",
            tag
        )));
    };
    Ok(format!("{}:{}", registry, tag))
}

/// Lazily resolved `LOCAL_IMAGE_*` parameter for `to`
pub fn local_image_parameter(client: Arc<dyn ImageClient>, namespace: &str, to: &PipelineImageTag) -> Parameter {
    let placeholder = format!("dry-fake.invalid/{}/{}", namespace, to.stream_tag());
    let namespace = namespace.to_string();
    let to = to.clone();
    Parameter::new(placeholder, move || {
        let client = client.clone();
        let namespace = namespace.clone();
        let to = to.clone();
        async move { registry_reference(client.as_ref(), &namespace, &to).await }
    })
}
