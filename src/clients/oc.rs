//! `oc` CLI client - drives a real cluster through subprocess calls

use crate::clients::{
    Build, BuildClient, BuildStatus, ClientError, Image, ImageClient, ImageStream, ImageStreamTag,
    PodClient, PodOutcome, PodPhase, PodSpec, ResourceRequirements,
};
use crate::core::job_spec::OwnerReference;
use crate::core::link::ImageStreamTagReference;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Settings for [`OcClient`]
#[derive(Debug, Clone)]
pub struct OcClientConfig {
    /// Path to the oc executable
    pub oc_path: String,

    /// Timeout for a single oc invocation in seconds
    pub timeout_secs: u64,

    /// Delay between status polls of builds and pods
    pub poll_interval: Duration,
}

impl Default for OcClientConfig {
    fn default() -> Self {
        Self {
            oc_path: "oc".to_string(),
            timeout_secs: 60,
            poll_interval: Duration::from_secs(5),
        }
    }
}

/// Cluster client backed by the `oc` executable
#[derive(Debug, Clone)]
pub struct OcClient {
    config: OcClientConfig,
}

impl OcClient {
    pub fn new(config: OcClientConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OcClientConfig {
        &self.config
    }

    /// Run oc with `args`, optionally feeding `stdin`, and return stdout
    async fn oc(&self, args: &[&str], stdin: Option<&str>) -> Result<String, ClientError> {
        let command = format!("{} {}", self.config.oc_path, args.join(" "));
        debug!("Running {}", command);

        let mut child = Command::new(&self.config.oc_path)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Internal(format!("Failed to execute {}: {}", command, e)))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())
                .await
                .map_err(|e| ClientError::Internal(format!("Failed to write to oc: {}", e)))?;
        }

        let output = timeout(
            Duration::from_secs(self.config.timeout_secs),
            child.wait_with_output(),
        )
        .await
        .map_err(|_| ClientError::Timeout(self.config.timeout_secs))?
        .map_err(|e| ClientError::Internal(format!("Failed to wait for oc: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ClientError::Command {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr,
            });
        }

        String::from_utf8(output.stdout)
            .map_err(|e| ClientError::Decode(format!("oc output is not UTF-8: {}", e)))
    }

    /// `oc get <kind> <name> -n <namespace> -o json`, `None` on NotFound
    async fn get_json(&self, kind: &str, namespace: &str, name: &str) -> Result<Option<Value>, ClientError> {
        match self
            .oc(&["get", kind, name, "-n", namespace, "-o", "json"], None)
            .await
        {
            Ok(stdout) => serde_json::from_str(&stdout)
                .map(Some)
                .map_err(|e| ClientError::Decode(format!("{} {}/{}: {}", kind, namespace, name, e))),
            Err(err) if is_not_found(&err) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// `oc create -f -`, tolerating objects that already exist
    async fn create(&self, manifest: &Value) -> Result<(), ClientError> {
        match self.oc(&["create", "-f", "-"], Some(&manifest.to_string())).await {
            Ok(_) => Ok(()),
            Err(err) if is_already_exists(&err) => {
                debug!("Object already exists, reusing it");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn is_not_found(err: &ClientError) -> bool {
    matches!(err, ClientError::Command { stderr, .. } if stderr.contains("NotFound") || stderr.contains("not found"))
}

fn is_already_exists(err: &ClientError) -> bool {
    matches!(err, ClientError::Command { stderr, .. } if stderr.contains("AlreadyExists") || stderr.contains("already exists"))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn metadata(namespace: &str, name: &str, labels: &BTreeMap<String, String>, owner: Option<&OwnerReference>) -> Value {
    let mut metadata = json!({
        "namespace": namespace,
        "name": name,
        "labels": labels,
    });
    if let Some(owner) = owner {
        metadata["ownerReferences"] = json!([owner]);
    }
    metadata
}

fn resources(resources: &ResourceRequirements) -> Value {
    json!({ "requests": resources.requests, "limits": resources.limits })
}

fn istag(namespace: &str, name: &str) -> Value {
    json!({ "kind": "ImageStreamTag", "namespace": namespace, "name": name })
}

fn build_manifest(build: &Build) -> Value {
    let mut source = json!({});
    if let Some(dockerfile) = &build.source.dockerfile {
        source["type"] = json!("Dockerfile");
        source["dockerfile"] = json!(dockerfile);
    } else {
        source["type"] = json!("Image");
    }
    if !build.source.images.is_empty() {
        source["images"] = build
            .source
            .images
            .iter()
            .map(|image| {
                json!({
                    "from": istag(&build.namespace, &image.from),
                    "paths": image.paths.iter().map(|p| json!({
                        "sourcePath": p.source_path,
                        "destinationDir": p.destination_dir,
                    })).collect::<Vec<_>>(),
                })
            })
            .collect();
    }

    let mut strategy = json!({
        "forcePull": true,
        "noCache": true,
        "imageOptimizationPolicy": "SkipLayers",
    });
    if let Some(from) = &build.from {
        strategy["from"] = istag(&build.namespace, from);
    }
    if let Some(path) = &build.dockerfile_path {
        strategy["dockerfilePath"] = json!(path);
    }

    let image_labels: Vec<Value> = build
        .output_labels
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "apiVersion": "build.openshift.io/v1",
        "kind": "Build",
        "metadata": metadata(&build.namespace, &build.name, &build.labels, build.owner.as_ref()),
        "spec": {
            "resources": resources(&build.resources),
            "source": source,
            "strategy": { "type": "Docker", "dockerStrategy": strategy },
            "output": {
                "to": istag(&build.namespace, &build.to),
                "imageLabels": image_labels,
            },
        },
    })
}

fn pod_manifest(pod: &PodSpec) -> Value {
    let env: Vec<Value> = pod
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata(&pod.namespace, &pod.name, &pod.labels, pod.owner.as_ref()),
        "spec": {
            "restartPolicy": "Never",
            "containers": [{
                "name": "test",
                "image": pod.image,
                "command": ["/bin/bash", "-c", format!("#!/bin/bash\nset -eu\n{}", pod.commands)],
                "env": env,
                "resources": resources(&pod.resources),
            }],
        },
    })
}

fn parse_pod_phase(phase: &str) -> Option<PodPhase> {
    match phase {
        "Pending" => Some(PodPhase::Pending),
        "Running" => Some(PodPhase::Running),
        "Succeeded" => Some(PodPhase::Succeeded),
        "Failed" => Some(PodPhase::Failed),
        _ => None,
    }
}

#[async_trait]
impl ImageClient for OcClient {
    async fn get_image_stream_tag(
        &self,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<Option<ImageStreamTag>, ClientError> {
        let name = format!("{}:{}", stream, tag);
        let Some(value) = self.get_json("imagestreamtag", namespace, &name).await? else {
            return Ok(None);
        };

        let image_metadata = value
            .pointer("/image/dockerImageMetadata")
            .map(Value::to_string)
            .unwrap_or_default();

        Ok(Some(ImageStreamTag {
            namespace: namespace.to_string(),
            name,
            image: Image {
                docker_image_reference: str_at(&value, "/image/dockerImageReference").to_string(),
                docker_image_metadata: image_metadata,
            },
        }))
    }

    async fn get_image_stream(&self, namespace: &str, stream: &str) -> Result<Option<ImageStream>, ClientError> {
        let Some(value) = self.get_json("imagestream", namespace, stream).await? else {
            return Ok(None);
        };
        Ok(Some(ImageStream {
            namespace: namespace.to_string(),
            name: stream.to_string(),
            public_docker_image_repository: str_at(&value, "/status/publicDockerImageRepository").to_string(),
            docker_image_repository: str_at(&value, "/status/dockerImageRepository").to_string(),
        }))
    }

    async fn tag_image(
        &self,
        from: &ImageStreamTagReference,
        namespace: &str,
        stream: &str,
        tag: &str,
    ) -> Result<(), ClientError> {
        let source = format!("{}/{}:{}", from.namespace, from.name, from.tag);
        let destination = format!("{}/{}:{}", namespace, stream, tag);
        self.oc(&["tag", "--source=istag", &source, &destination], None)
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl BuildClient for OcClient {
    async fn create_build(&self, build: &Build) -> Result<(), ClientError> {
        self.create(&build_manifest(build)).await
    }

    async fn wait_for_build(&self, namespace: &str, name: &str) -> Result<BuildStatus, ClientError> {
        loop {
            let value = self
                .get_json("build", namespace, name)
                .await?
                .ok_or_else(|| ClientError::Internal(format!("build {}/{} disappeared", namespace, name)))?;

            match str_at(&value, "/status/phase") {
                "Complete" => return Ok(BuildStatus::Complete),
                phase @ ("Failed" | "Error" | "Cancelled") => {
                    let reason = match str_at(&value, "/status/message") {
                        "" => phase.to_string(),
                        message => message.to_string(),
                    };
                    warn!("Build {}/{} ended in phase {}", namespace, name, phase);
                    return Ok(BuildStatus::Failed {
                        reason,
                        log_snippet: str_at(&value, "/status/logSnippet").to_string(),
                    });
                }
                phase => debug!("Build {}/{} is {}", namespace, name, phase),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}

#[async_trait]
impl PodClient for OcClient {
    async fn get_pod_phase(&self, namespace: &str, name: &str) -> Result<Option<PodPhase>, ClientError> {
        Ok(self
            .get_json("pod", namespace, name)
            .await?
            .and_then(|value| parse_pod_phase(str_at(&value, "/status/phase"))))
    }

    async fn run_pod(&self, pod: &PodSpec) -> Result<PodOutcome, ClientError> {
        self.create(&pod_manifest(pod)).await?;

        loop {
            let value = self
                .get_json("pod", &pod.namespace, &pod.name)
                .await?
                .ok_or_else(|| ClientError::Internal(format!("pod {}/{} disappeared", pod.namespace, pod.name)))?;

            match parse_pod_phase(str_at(&value, "/status/phase")) {
                Some(PodPhase::Succeeded) => return Ok(PodOutcome::Succeeded),
                Some(PodPhase::Failed) => {
                    let reason = match str_at(&value, "/status/containerStatuses/0/state/terminated/reason") {
                        "" => "pod failed".to_string(),
                        reason => reason.to_string(),
                    };
                    return Ok(PodOutcome::Failed { reason });
                }
                phase => debug!("Pod {}/{} is {:?}", pod.namespace, pod.name, phase),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
