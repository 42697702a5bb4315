//! Pipeline configuration from YAML

use crate::clients::{ImageSourcePath, ResourceRequirements};
use crate::core::link::{
    ImageStreamTagReference, PipelineImageTag, BINARIES_TAG, ROOT_TAG, SOURCE_TAG, TEST_BINARIES_TAG,
};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Resource key that applies to every step without its own entry
pub const DEFAULT_RESOURCES_KEY: &str = "*";

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Image the source is checked out and compiled in
    #[serde(default)]
    pub build_root: Option<ImageStreamTagReference>,

    /// External images imported into the pipeline under the given tag
    #[serde(default)]
    pub base_images: BTreeMap<String, ImageStreamTagReference>,

    /// Commands building `bin` from `src`
    #[serde(default)]
    pub binary_build_commands: Option<String>,

    /// Commands building `test-bin` from `src`
    #[serde(default)]
    pub test_binary_build_commands: Option<String>,

    /// Images built from the repository
    #[serde(default)]
    pub images: Vec<ProjectDirectoryImageBuildStepConfiguration>,

    /// Images built by running commands on top of another pipeline image
    #[serde(default)]
    pub raw_steps: Vec<PipelineImageCacheStepConfiguration>,

    /// Test suites
    #[serde(default)]
    pub tests: Vec<TestStepConfiguration>,

    /// Resources per step name
    #[serde(default)]
    pub resources: ResourceConfiguration,
}

/// Build an image from a directory in the repository
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectDirectoryImageBuildStepConfiguration {
    /// Base image tag
    #[serde(default)]
    pub from: Option<PipelineImageTag>,

    /// Output image tag
    pub to: PipelineImageTag,

    /// Directory inside the source holding the build context
    #[serde(default)]
    pub context_dir: String,

    /// Dockerfile relative to the context directory
    #[serde(default)]
    pub dockerfile_path: Option<String>,

    /// Other pipeline images whose contents are copied into the build context
    #[serde(default)]
    pub inputs: BTreeMap<String, ImageBuildInputs>,
}

/// Paths copied out of an input image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageBuildInputs {
    #[serde(default)]
    pub paths: Vec<ImageSourcePath>,
}

/// Build an image by running commands on top of another pipeline image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineImageCacheStepConfiguration {
    pub from: PipelineImageTag,
    pub to: PipelineImageTag,
    pub commands: String,
}

/// Run commands in a pipeline image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStepConfiguration {
    /// Test name
    #[serde(rename = "as")]
    pub as_name: String,

    /// Image the commands run in
    #[serde(default = "default_test_from")]
    pub from: PipelineImageTag,

    pub commands: String,

    /// Parameters injected into the test environment
    #[serde(default)]
    pub parameters: Vec<String>,
}

fn default_test_from() -> PipelineImageTag {
    PipelineImageTag::new(SOURCE_TAG)
}

/// Resources per step name, `*` as the fallback
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceConfiguration(pub BTreeMap<String, ResourceRequirements>);

impl ResourceConfiguration {
    /// Resources for `name`, falling back to the `*` entry
    pub fn requirements_for(&self, name: &str) -> ResourceRequirements {
        self.0
            .get(name)
            .or_else(|| self.0.get(DEFAULT_RESOURCES_KEY))
            .cloned()
            .unwrap_or_default()
    }
}

fn tag_pattern() -> Result<Regex> {
    Ok(Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9._-]{0,127}$")?)
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid pipeline configuration in {}", path.display()))
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Whether any step needs the checked out source
    pub fn needs_source(&self) -> bool {
        !self.images.is_empty()
            || !self.tests.is_empty()
            || self.binary_build_commands.is_some()
            || self.test_binary_build_commands.is_some()
    }

    /// Tags produced by steps built from this configuration, in declaration order
    pub fn produced_tags(&self) -> Vec<PipelineImageTag> {
        let mut tags = Vec::new();
        if self.build_root.is_some() {
            tags.push(PipelineImageTag::new(ROOT_TAG));
            tags.push(PipelineImageTag::new(SOURCE_TAG));
        }
        tags.extend(self.base_images.keys().map(|k| PipelineImageTag::new(k.as_str())));
        if self.binary_build_commands.is_some() {
            tags.push(PipelineImageTag::new(BINARIES_TAG));
        }
        if self.test_binary_build_commands.is_some() {
            tags.push(PipelineImageTag::new(TEST_BINARIES_TAG));
        }
        tags.extend(self.raw_steps.iter().map(|s| s.to.clone()));
        tags.extend(self.images.iter().map(|i| i.to.clone()));
        tags
    }

    /// Validate the pipeline configuration
    ///
    /// Dependency problems between steps (cycles, duplicate producers) are left to the graph
    /// resolver; this only rejects configurations that cannot be turned into steps.
    pub fn validate(&self) -> Result<()> {
        let pattern = tag_pattern()?;

        if self.needs_source() && self.build_root.is_none() {
            anyhow::bail!("build_root is required when images, tests or build commands are configured");
        }

        for name in self.base_images.keys() {
            if name == ROOT_TAG || name == SOURCE_TAG {
                anyhow::bail!("base image '{}' uses a reserved tag name", name);
            }
        }

        let produced = self.produced_tags();
        let mut seen = HashSet::new();
        for tag in &produced {
            if !pattern.is_match(tag.as_str()) {
                anyhow::bail!("Invalid image tag name: '{}'", tag);
            }
            if !seen.insert(tag.clone()) {
                anyhow::bail!("Image tag '{}' is produced more than once", tag);
            }
        }

        let known = |tag: &PipelineImageTag| seen.contains(tag);

        for image in &self.images {
            if let Some(from) = &image.from {
                if !known(from) {
                    anyhow::bail!("Image '{}' builds from unknown tag '{}'", image.to, from);
                }
            }
            for input in image.inputs.keys() {
                if !known(&PipelineImageTag::new(input.as_str())) {
                    anyhow::bail!("Image '{}' uses unknown input image '{}'", image.to, input);
                }
            }
        }

        for raw in &self.raw_steps {
            if !known(&raw.from) {
                anyhow::bail!("Image '{}' builds from unknown tag '{}'", raw.to, raw.from);
            }
        }

        let mut test_names = HashSet::new();
        for test in &self.tests {
            if !pattern.is_match(&test.as_name) {
                anyhow::bail!("Invalid test name: '{}'", test.as_name);
            }
            if !test_names.insert(&test.as_name) {
                anyhow::bail!("Duplicate test name: {}", test.as_name);
            }
            if !known(&test.from) {
                anyhow::bail!("Test '{}' runs in unknown tag '{}'", test.as_name, test.from);
            }
            if test.commands.trim().is_empty() {
                anyhow::bail!("Test '{}' has no commands", test.as_name);
            }
        }

        Ok(())
    }
}
