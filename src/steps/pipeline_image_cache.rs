//! Build a pipeline image by running commands on top of another pipeline image

use crate::clients::{BuildClient, BuildSource, ImageClient};
use crate::core::config::{PipelineImageCacheStepConfiguration, ResourceConfiguration};
use crate::core::link::{PipelineImageTag, StepLink};
use crate::core::{InputDefinition, JobSpec, Step, StepContext, StepError};
use crate::steps::build::{build_from_source, handle_build, image_stream_tag_exists};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Dockerfile running `commands` in a bash shell on top of `pipeline:<from>`
pub fn raw_command_dockerfile(from: &PipelineImageTag, commands: &str) -> String {
    let script = Value::String(format!("set -o errexit; umask 0002; {}", commands));
    format!("FROM {}\nRUN [\"/bin/bash\", \"-c\", {}]", from.stream_tag(), script)
}

pub struct PipelineImageCacheStep {
    config: PipelineImageCacheStepConfiguration,
    resources: ResourceConfiguration,
    builds: Arc<dyn BuildClient>,
    images: Arc<dyn ImageClient>,
    job_spec: Arc<JobSpec>,
}

impl PipelineImageCacheStep {
    pub fn new(
        config: PipelineImageCacheStepConfiguration,
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
}

#[async_trait]
impl Step for PipelineImageCacheStep {
    fn name(&self) -> &str {
        self.config.to.as_str()
    }

    fn description(&self) -> String {
        format!(
            "Store build results into a layer on top of {} and save as {}",
            self.config.from, self.config.to
        )
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.from)]
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.config.to)]
    }

    fn inputs(&self) -> Option<InputDefinition> {
        Some(InputDefinition::new(vec![self.config.commands.clone()]))
    }

    async fn done(&self) -> Result<bool, StepError> {
        image_stream_tag_exists(self.images.as_ref(), self.job_spec.namespace(), &self.config.to).await
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        let build = build_from_source(
            &self.job_spec,
            Some(&self.config.from),
            &self.config.to,
            BuildSource {
                dockerfile: Some(raw_command_dockerfile(&self.config.from, &self.config.commands)),
                images: Vec::new(),
            },
            None,
            &self.resources,
        );
        handle_build(self.builds.as_ref(), build, ctx).await
    }
}
