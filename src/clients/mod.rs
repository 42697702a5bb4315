//! Cluster clients used by steps
//!
//! Steps only see these traits. `OcClient` drives a real cluster through the `oc` CLI and
//! `InMemoryCluster` keeps everything in process.

pub mod memory;
pub mod oc;

use crate::core::job_spec::OwnerReference;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use memory::InMemoryCluster;
pub use oc::{OcClient, OcClientConfig};

/// Error types for cluster operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{command} exited with code {code}: {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Timeout after {0} seconds")]
    Timeout(u64),

    #[error("Failed to decode response: {0}")]
    Decode(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Image metadata attached to an image stream tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Pull spec of the image
    pub docker_image_reference: String,

    /// Raw Docker image metadata document
    pub docker_image_metadata: String,
}

/// An image stream tag as seen by the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStreamTag {
    pub namespace: String,
    /// `stream:tag`
    pub name: String,
    pub image: Image,
}

/// Registry locations of an image stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStream {
    pub namespace: String,
    pub name: String,
    pub public_docker_image_repository: String,
    pub docker_image_repository: String,
}

/// Compute resources requested by a build or pod
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,

    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Files copied out of an image into the build context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSourcePath {
    pub source_path: String,
    pub destination_dir: String,
}

/// An image used as build input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    /// `stream:tag` in the build namespace
    pub from: String,
    pub paths: Vec<ImageSourcePath>,
}

/// Where the build context comes from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSource {
    /// Inline Dockerfile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
}

/// A container image build request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Build {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,

    /// Base image as `stream:tag`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,

    /// Output image as `stream:tag`
    pub to: String,
    pub source: BuildSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dockerfile_path: Option<String>,
    pub output_labels: BTreeMap<String, String>,
    pub resources: ResourceRequirements,
}

/// Terminal state of a build
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildStatus {
    Complete,
    Failed { reason: String, log_snippet: String },
}

/// A single container run to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSpec {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<OwnerReference>,
    pub image: String,
    pub commands: String,
    pub env: BTreeMap<String, String>,
    pub resources: ResourceRequirements,
}

/// Lifecycle phase of a pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Terminal state of a pod run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOutcome {
    Succeeded,
    Failed { reason: String },
}

/// Image registry and image stream access
#[async_trait]
pub trait ImageClient: Send + Sync {
    /// Fetch an image stream tag, `None` when it does not exist
    async fn get_image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<Option<ImageStreamTag>, ClientError>;

    /// Fetch an image stream, `None` when it does not exist
    async fn get_image_stream(
        &self,
        namespace: &str,
        stream: &str,
    ) -> Result<Option<ImageStream>, ClientError>;

    /// Point `namespace/stream:tag` at the image behind `from`
    async fn tag_image(
        &self,
        from: &crate::core::link::ImageStreamTagReference,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<(), ClientError>;
}

/// Build service access
#[async_trait]
pub trait BuildClient: Send + Sync {
    /// Submit a build; an existing build of the same name is not an error
    async fn create_build(&self, build: &Build) -> Result<(), ClientError>;

    /// Wait for a build to reach a terminal state
    async fn wait_for_build(&self, namespace: &str, name: &str) -> Result<BuildStatus, ClientError>;
}

/// Pod execution access
#[async_trait]
pub trait PodClient: Send + Sync {
    /// Current phase of a pod, `None` when it does not exist
    async fn get_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>, ClientError>;

    /// Create a pod and wait for it to finish
    async fn run_pod(&self, pod: &PodSpec) -> Result<PodOutcome, ClientError>;
}
