//! Step variants and their construction from configuration

pub mod build;
pub mod input_image;
pub mod pipeline_image_cache;
pub mod project_image;
pub mod source;

use crate::clients::{BuildClient, ImageClient, PodClient};
use crate::core::config::{PipelineConfig, PipelineImageCacheStepConfiguration};
use crate::core::link::{PipelineImageTag, BINARIES_TAG, ROOT_TAG, SOURCE_TAG, TEST_BINARIES_TAG};
use crate::core::{JobSpec, Step};
use std::sync::Arc;

pub use input_image::InputImageTagStep;
pub use pipeline_image_cache::PipelineImageCacheStep;
pub use project_image::ProjectDirectoryImageBuildStep;
pub use source::SourceStep;
pub use test::TestStep;

/// Cluster clients handed to steps at construction
#[derive(Clone)]
pub struct Clients {
    pub images: Arc<dyn ImageClient>,
    pub builds: Arc<dyn BuildClient>,
    pub pods: Arc<dyn PodClient>,
}

impl Clients {
    /// Use one cluster implementation for every client
    pub fn from_cluster<C>(cluster: Arc<C>) -> Self
    where
        C: ImageClient + BuildClient + PodClient + 'static,
    {
        Self {
            images: cluster.clone(),
            builds: cluster.clone(),
            pods: cluster,
        }
    }
}

/// Build every step `config` describes
///
/// Steps are returned in declaration order: input images, source, binaries, raw image
/// builds, repository images, then tests.
pub fn from_config(config: &PipelineConfig, job_spec: Arc<JobSpec>, clients: &Clients) -> Vec<Arc<dyn Step>> {
    let mut steps: Vec<Arc<dyn Step>> = Vec::new();

    if let Some(build_root) = &config.build_root {
        steps.push(Arc::new(InputImageTagStep::new(
            build_root.clone(),
            PipelineImageTag::new(ROOT_TAG),
            clients.images.clone(),
            job_spec.clone(),
        )));
    }

    for (tag, image) in &config.base_images {
        steps.push(Arc::new(InputImageTagStep::new(
            image.clone(),
            PipelineImageTag::new(tag.as_str()),
            clients.images.clone(),
            job_spec.clone(),
        )));
    }

    if config.build_root.is_some() && config.needs_source() {
        steps.push(Arc::new(SourceStep::new(
            config.resources.clone(),
            clients.builds.clone(),
            clients.images.clone(),
            job_spec.clone(),
        )));
    }

    let binaries = [
        (&config.binary_build_commands, BINARIES_TAG),
        (&config.test_binary_build_commands, TEST_BINARIES_TAG),
    ];
    let raw_steps = binaries
        .into_iter()
        .filter_map(|(commands, to)| {
            commands.as_ref().map(|commands| PipelineImageCacheStepConfiguration {
                from: PipelineImageTag::new(SOURCE_TAG),
                to: PipelineImageTag::new(to),
                commands: commands.clone(),
            })
        })
        .chain(config.raw_steps.iter().cloned());

    for raw in raw_steps {
        steps.push(Arc::new(PipelineImageCacheStep::new(
            raw,
            config.resources.clone(),
            clients.builds.clone(),
            clients.images.clone(),
            job_spec.clone(),
        )));
    }

    for image in &config.images {
        steps.push(Arc::new(ProjectDirectoryImageBuildStep::new(
            image.clone(),
            config.resources.clone(),
            clients.builds.clone(),
            clients.images.clone(),
            job_spec.clone(),
        )));
    }

    for test in &config.tests {
        steps.push(Arc::new(TestStep::new(
            test.clone(),
            config.resources.clone(),
            clients.pods.clone(),
            clients.images.clone(),
            job_spec.clone(),
        )));
    }

    steps
}
