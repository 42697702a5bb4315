//! Build an image from a directory of the checked out source

use crate::clients::{BuildClient, BuildSource, ImageClient, ImageSource, ImageSourcePath};
use crate::core::config::{ProjectDirectoryImageBuildStepConfiguration, ResourceConfiguration};
use crate::core::link::{PipelineImageTag, StepLink, PIPELINE_IMAGE_STREAM, SOURCE_TAG};
use crate::core::{JobSpec, ParameterMap, Provides, Step, StepContext, StepError};
use crate::steps::build::{
    build_from_source, handle_build, image_stream_tag_exists, local_image_parameter, parameter_name,
    provenance_labels,
};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

/// Working directory used in place of the real one during dry runs
pub const DRY_RUN_WORKING_DIR: &str = "dry-fake";

#[derive(Debug, Default, Deserialize)]
struct DockerImageMetadata {
    #[serde(rename = "Config", default)]
    config: DockerConfig,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(rename = "WorkingDir", default)]
    working_dir: String,
}

pub struct ProjectDirectoryImageBuildStep {
    config: ProjectDirectoryImageBuildStepConfiguration,
    resources: ResourceConfiguration,
    builds: Arc<dyn BuildClient>,
    images: Arc<dyn ImageClient>,
    job_spec: Arc<JobSpec>,
}

impl ProjectDirectoryImageBuildStep {
    pub fn new(
        config: ProjectDirectoryImageBuildStepConfiguration,
        resources: ResourceConfiguration,
        builds: Arc<dyn BuildClient>,
        images: Arc<dyn ImageClient>,
        job_spec: Arc<JobSpec>,
    ) -> Self {
        Self {
            config,
            resources,
            builds,
            images,
            job_spec,
        }
    }

    /// Working directory recorded in the source image's metadata
    async fn source_working_dir(&self) -> Result<String, StepError> {
        let source = format!("{}:{}", PIPELINE_IMAGE_STREAM, SOURCE_TAG);
        let tag = self
            .images
            .get_image_stream_tag(self.job_spec.namespace(), PIPELINE_IMAGE_STREAM, SOURCE_TAG)
            .await
            .map_err(|e| StepError::Lookup(format!("could not fetch source ImageStreamTag: {}", e)))?
            .ok_or_else(|| StepError::MissingArtifact(source.clone()))?;

        if tag.image.docker_image_metadata.is_empty() {
            return Err(StepError::MalformedMetadata(format!(
                "could not fetch Docker image metadata for ImageStreamTag {}",
                source
            )));
        }
        let metadata: DockerImageMetadata = serde_json::from_str(&tag.image.docker_image_metadata)
            .map_err(|e| {
                StepError::MalformedMetadata(format!("malformed Docker image metadata on ImageStreamTag: {}", e))
            })?;
        Ok(metadata.config.working_dir)
    }

    fn image_sources(&self, working_dir: &str) -> Vec<ImageSource> {
        let mut images: Vec<ImageSource> = self
            .config
            .inputs
            .iter()
            .map(|(name, inputs)| ImageSource {
                from: PipelineImageTag::new(name.as_str()).stream_tag(),
                paths: inputs.paths.clone(),
            })
            .collect();

        if !self.config.inputs.contains_key(SOURCE_TAG) {
            images.push(ImageSource {
                from: PipelineImageTag::new(SOURCE_TAG).stream_tag(),
                paths: vec![ImageSourcePath {
                    source_path: format!("{}/{}/.", working_dir, self.config.context_dir),
                    destination_dir: ".".to_string(),
                }],
            });
        }
        images
    }
}

#[async_trait]
impl Step for ProjectDirectoryImageBuildStep {
    fn name(&self) -> &str {
        self.config.to.as_str()
    }

    fn description(&self) -> String {
        format!("Build image {} from the repository", self.config.to)
    }

    fn requires(&self) -> Vec<StepLink> {
        let mut links = vec![StepLink::internal(SOURCE_TAG)];
        if let Some(from) = &self.config.from {
            links.push(StepLink::internal(from));
        }
        links.extend(self.config.inputs.keys().map(|name| StepLink::internal(name.as_str())));
        links
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.to)]
    }

    fn provides(&self) -> Option<Provides> {
        if self.config.to.is_empty() {
            return None;
        }
        let mut parameters = ParameterMap::new();
        parameters.insert(
            parameter_name(&self.config.to),
            local_image_parameter(self.images.clone(), self.job_spec.namespace(), &self.config.to),
        );
        Some(Provides {
            parameters,
            link: StepLink::internal(&self.config.to),
        })
    }

    async fn done(&self) -> Result<bool, StepError> {
        image_stream_tag_exists(self.images.as_ref(), self.job_spec.namespace(), &self.config.to).await
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        let working_dir = if ctx.dry_run {
            DRY_RUN_WORKING_DIR.to_string()
        } else {
            self.source_working_dir().await?
        };

        let mut build = build_from_source(
            &self.job_spec,
            self.config.from.as_ref(),
            &self.config.to,
            BuildSource {
                dockerfile: None,
                images: self.image_sources(&working_dir),
            },
            self.config.dockerfile_path.clone(),
            &self.resources,
        );
        build.output_labels.extend(provenance_labels(self.job_spec.refs()));

        handle_build(self.builds.as_ref(), build, ctx).await
    }
}
