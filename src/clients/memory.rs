//! In-memory cluster (for testing or offline dry runs)

use crate::clients::{
    Build, BuildClient, BuildStatus, ClientError, Image, ImageClient, ImageStream, ImageStreamTag,
    PodClient, PodOutcome, PodPhase, PodSpec,
};
use crate::core::link::ImageStreamTagReference;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// Registry host reported for every in-memory image stream
pub const IN_MEMORY_REGISTRY: &str = "registry.ci.local";

type TagKey = (String, String, String);

/// Cluster state kept in process
///
/// Records every mutating call so tests can assert on side effects, and counts lookups so
/// tests can assert on laziness. Successful builds create their output tag.
pub struct InMemoryCluster {
    working_dir: String,
    tags: RwLock<HashMap<TagKey, ImageStreamTag>>,
    streams: RwLock<HashMap<(String, String), ImageStream>>,
    builds: RwLock<Vec<Build>>,
    build_failures: RwLock<HashMap<String, String>>,
    pods: RwLock<Vec<PodSpec>>,
    pod_phases: RwLock<HashMap<(String, String), PodPhase>>,
    pod_failures: RwLock<HashMap<String, String>>,
    mutations: AtomicUsize,
    tag_lookups: AtomicUsize,
    stream_lookups: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self {
            working_dir: "/go/src".to_string(),
            tags: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
            builds: RwLock::new(Vec::new()),
            build_failures: RwLock::new(HashMap::new()),
            pods: RwLock::new(Vec::new()),
            pod_phases: RwLock::new(HashMap::new()),
            pod_failures: RwLock::new(HashMap::new()),
            mutations: AtomicUsize::new(0),
            tag_lookups: AtomicUsize::new(0),
            stream_lookups: AtomicUsize::new(0),
        }
    }

    /// Working directory recorded in the metadata of images built here
    pub fn with_working_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    fn metadata(working_dir: &str) -> String {
        serde_json::json!({ "Config": { "WorkingDir": working_dir } }).to_string()
    }

    /// Seed an image stream tag with the default metadata
    pub async fn add_tag(&self, namespace: &str, stream: &str, tag: &str) {
        let metadata = Self::metadata(&self.working_dir);
        self.add_tag_with_metadata(namespace, stream, tag, &metadata).await;
    }

    /// Seed an image stream tag with explicit raw metadata
    pub async fn add_tag_with_metadata(&self, namespace: &str, stream: &str, tag: &str, metadata: &str) {
        self.ensure_stream(namespace, stream).await;
        let image = Image {
            docker_image_reference: format!("{}/{}/{}@sha256:{}", IN_MEMORY_REGISTRY, namespace, stream, tag),
            docker_image_metadata: metadata.to_string(),
        };
        self.tags.write().await.insert(
            (namespace.to_string(), stream.to_string(), tag.to_string()),
            ImageStreamTag {
                namespace: namespace.to_string(),
                name: format!("{}:{}", stream, tag),
                image,
            },
        );
    }

    /// Replace an image stream's registry locations
    pub async fn set_image_stream(&self, stream: ImageStream) {
        self.streams
            .write()
            .await
            .insert((stream.namespace.clone(), stream.name.clone()), stream);
    }

    async fn ensure_stream(&self, namespace: &str, stream: &str) {
        self.streams
            .write()
            .await
            .entry((namespace.to_string(), stream.to_string()))
            .or_insert_with(|| ImageStream {
                namespace: namespace.to_string(),
                name: stream.to_string(),
                public_docker_image_repository: format!("{}/{}/{}", IN_MEMORY_REGISTRY, namespace, stream),
                docker_image_repository: format!("image-registry.svc:5000/{}/{}", namespace, stream),
            });
    }

    /// Make the named build fail
    pub async fn fail_build(&self, name: &str, reason: &str) {
        self.build_failures
            .write()
            .await
            .insert(name.to_string(), reason.to_string());
    }

    /// Make the named pod fail
    pub async fn fail_pod(&self, name: &str, reason: &str) {
        self.pod_failures
            .write()
            .await
            .insert(name.to_string(), reason.to_string());
    }

    /// Record a pod as already finished
    pub async fn set_pod_phase(&self, namespace: &str, name: &str, phase: PodPhase) {
        self.pod_phases
            .write()
            .await
            .insert((namespace.to_string(), name.to_string()), phase);
    }

    pub async fn has_tag(&self, namespace: &str, stream: &str, tag: &str) -> bool {
        self.tags
            .read()
            .await
            .contains_key(&(namespace.to_string(), stream.to_string(), tag.to_string()))
    }

    /// Builds submitted so far
    pub async fn builds(&self) -> Vec<Build> {
        self.builds.read().await.clone()
    }

    /// Pods run so far
    pub async fn pods(&self) -> Vec<PodSpec> {
        self.pods.read().await.clone()
    }

    /// Number of mutating calls received
    pub fn mutating_calls(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    pub fn tag_lookups(&self) -> usize {
        self.tag_lookups.load(Ordering::SeqCst)
    }

    pub fn stream_lookups(&self) -> usize {
        self.stream_lookups.load(Ordering::SeqCst)
    }

    fn split_stream_tag(value: &str) -> Result<(&str, &str), ClientError> {
        value
            .split_once(':')
            .ok_or_else(|| ClientError::Internal(format!("invalid image stream tag: {}", value)))
    }
}

impl Default for InMemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageClient for InMemoryCluster {
    async fn get_image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<Option<ImageStreamTag>, ClientError> {
        self.tag_lookups.fetch_add(1, Ordering::SeqCst);
        let tags = self.tags.read().await;
        Ok(tags
            .get(&(namespace.to_string(), stream.to_string(), tag.to_string()))
            .cloned())
    }

    async fn get_image_stream(
        &self,
        namespace: &str,
        stream: &str,
    ) -> Result<Option<ImageStream>, ClientError> {
        self.stream_lookups.fetch_add(1, Ordering::SeqCst);
        let streams = self.streams.read().await;
        Ok(streams.get(&(namespace.to_string(), stream.to_string())).cloned())
    }

    async fn tag_image(
        &self,
        from: &ImageStreamTagReference,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<(), ClientError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let source = self
            .tags
            .read()
            .await
            .get(&(from.namespace.clone(), from.name.clone(), from.tag.clone()))
            .cloned()
            .ok_or_else(|| ClientError::Internal(format!("imagestreamtag {} not found", from)))?;

        self.add_tag_with_metadata(namespace, stream, tag, &source.image.docker_image_metadata)
            .await;
        Ok(())
    }
}

#[async_trait]
impl BuildClient for InMemoryCluster {
    async fn create_build(&self, build: &Build) -> Result<(), ClientError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        let mut builds = self.builds.write().await;
        if builds
            .iter()
            .any(|b| b.namespace == build.namespace && b.name == build.name)
        {
            return Ok(());
        }
        builds.push(build.clone());
        Ok(())
    }

    async fn wait_for_build(&self, namespace: &str, name: &str) -> Result<BuildStatus, ClientError> {
        let build = self
            .builds
            .read()
            .await
            .iter()
            .find(|b| b.namespace == namespace && b.name == name)
            .cloned()
            .ok_or_else(|| ClientError::Internal(format!("build {} not found", name)))?;

        if let Some(reason) = self.build_failures.read().await.get(name) {
            return Ok(BuildStatus::Failed {
                reason: reason.clone(),
                log_snippet: format!("error: {}", reason),
            });
        }

        let (stream, tag) = Self::split_stream_tag(&build.to)?;
        let metadata = Self::metadata(&self.working_dir);
        self.add_tag_with_metadata(namespace, stream, tag, &metadata).await;
        Ok(BuildStatus::Complete)
    }
}

#[async_trait]
impl PodClient for InMemoryCluster {
    async fn get_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>, ClientError> {
        Ok(self
            .pod_phases
            .read()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .copied())
    }

    async fn run_pod(&self, pod: &PodSpec) -> Result<PodOutcome, ClientError> {
        self.mutations.fetch_add(1, Ordering::SeqCst);
        self.pods.write().await.push(pod.clone());

        let failure = self.pod_failures.read().await.get(&pod.name).cloned();
        let (phase, outcome) = match failure {
            Some(reason) => (PodPhase::Failed, PodOutcome::Failed { reason }),
            None => (PodPhase::Succeeded, PodOutcome::Succeeded),
        };
        self.set_pod_phase(&pod.namespace, &pod.name, phase).await;
        Ok(outcome)
    }
}
