//! Artifact links - how steps name what they need and what they make

use serde::{Deserialize, Serialize};
use std::fmt;

/// Image stream holding every image the pipeline builds
pub const PIPELINE_IMAGE_STREAM: &str = "pipeline";

/// Tag of the build root image
pub const ROOT_TAG: &str = "root";

/// Tag of the checked out source image
pub const SOURCE_TAG: &str = "src";

/// Tag of the compiled binaries image
pub const BINARIES_TAG: &str = "bin";

/// Tag of the compiled test binaries image
pub const TEST_BINARIES_TAG: &str = "test-bin";

/// A tag in the pipeline image stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineImageTag(String);

impl PipelineImageTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `pipeline:<tag>`
    pub fn stream_tag(&self) -> String {
        format!("{}:{}", PIPELINE_IMAGE_STREAM, self.0)
    }
}

impl fmt::Display for PipelineImageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PipelineImageTag {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// A tag in an arbitrary image stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageStreamTagReference {
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    pub tag: String,
}

impl ImageStreamTagReference {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ImageStreamTagReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.tag)
    }
}

/// Identifies an artifact slot
///
/// Links carry no behavior. Two links match when they are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StepLink {
    /// A tag in this run's pipeline image stream
    Internal { tag: PipelineImageTag },
    /// An image stream tag outside the pipeline
    External { image: ImageStreamTagReference },
}

impl StepLink {
    pub fn internal(tag: impl Into<PipelineImageTag>) -> Self {
        StepLink::Internal { tag: tag.into() }
    }

    pub fn external(image: ImageStreamTagReference) -> Self {
        StepLink::External { image }
    }

    /// Whether this link names the same artifact as `other`
    pub fn matches(&self, other: &StepLink) -> bool {
        self == other
    }
}

impl fmt::Display for StepLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepLink::Internal { tag } => write!(f, "{}", tag.stream_tag()),
            StepLink::External { image } => write!(f, "{}", image),
        }
    }
}

impl From<String> for PipelineImageTag {
    fn from(tag: String) -> Self {
        Self(tag)
    }
}

impl From<&PipelineImageTag> for PipelineImageTag {
    fn from(tag: &PipelineImageTag) -> Self {
        tag.clone()
    }
}
