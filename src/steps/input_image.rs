//! Import an external image into the pipeline image stream

use crate::clients::ImageClient;
use crate::core::link::{ImageStreamTagReference, PipelineImageTag, StepLink, PIPELINE_IMAGE_STREAM};
use crate::core::{InputDefinition, JobSpec, Step, StepContext, StepError};
use crate::steps::build::image_stream_tag_exists;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

pub struct InputImageTagStep {
    name: String,
    from: ImageStreamTagReference,
    to: PipelineImageTag,
    images: Arc<dyn ImageClient>,
    job_spec: Arc<JobSpec>,
}

impl InputImageTagStep {
    pub fn new(
        from: ImageStreamTagReference,
        to: PipelineImageTag,
        images: Arc<dyn ImageClient>,
        job_spec: Arc<JobSpec>,
    ) -> Self {
        Self {
            name: format!("[input:{}]", to),
            from,
            to,
            images,
            job_spec,
        }
    }
}

#[async_trait]
impl Step for InputImageTagStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        format!("Find the input image {} and tag it into the pipeline", self.to)
    }

    fn requires(&self) -> Vec<StepLink> {
        vec![StepLink::external(self.from.clone())]
    }

    fn creates(&self) -> Vec<StepLink> {
        vec![StepLink::internal(&self.to)]
    }

    fn inputs(&self) -> Option<InputDefinition> {
        Some(InputDefinition::new(vec![self.from.to_string()]))
    }

    async fn done(&self) -> Result<bool, StepError> {
        image_stream_tag_exists(self.images.as_ref(), self.job_spec.namespace(), &self.to).await
    }

    async fn run(&self, ctx: &StepContext) -> Result<(), StepError> {
        if ctx.dry_run {
            info!(
                "Dry run: would tag {} into {}/{}",
                self.from,
                self.job_spec.namespace(),
                self.to.stream_tag()
            );
            return Ok(());
        }

        let exists = self
            .images
            .get_image_stream_tag(&self.from.namespace, &self.from.name, &self.from.tag)
            .await?
            .is_some();
        if !exists {
            return Err(StepError::MissingArtifact(self.from.to_string()));
        }

        ctx.check_cancelled()?;
        self.images
            .tag_image(&self.from, self.job_spec.namespace(), PIPELINE_IMAGE_STREAM, self.to.as_str())
            .await?;
        info!("Tagged {} into {}", self.from, self.to.stream_tag());
        Ok(())
    }
}
