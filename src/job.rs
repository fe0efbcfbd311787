use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Prefix marking structured metadata lines in a job script header.
pub const HEADER_PREFIX: &str = "#:";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobDescriptor {
    pub name: String,
    #[serde(default)]
    pub variety: Option<String>,
    #[serde(alias = "target_platform")]
    pub target: String,
    #[serde(alias = "toolchain_version")]
    pub rust_toolchain: String,
    pub output_rules: Vec<OutputRule>,
    #[serde(default)]
    pub settings: JobSettings,
}

impl JobDescriptor {
    /// Load a descriptor. YAML files are parsed whole; anything else is treated
    /// as a job script whose `#:` header lines form a TOML document.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read job file: {}", path.display()))?;
        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"))
            .unwrap_or(false);

        if is_yaml {
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse job YAML: {}", path.display()))
        } else {
            Self::from_script_header(&content)
                .with_context(|| format!("Failed to parse job header: {}", path.display()))
        }
    }

    pub fn from_script_header(script: &str) -> Result<Self> {
        let header = extract_header(script);
        if header.trim().is_empty() {
            bail!("No '{HEADER_PREFIX}' metadata lines found");
        }
        let job: JobDescriptor = toml::from_str(&header)?;
        Ok(job)
    }

    pub fn toolchain(&self) -> &str {
        self.rust_toolchain.trim()
    }
}

/// Collect the `#:` lines of a script, stripped of their prefix. Collection stops
/// at the first line that is neither a comment, a shebang, nor blank.
fn extract_header(script: &str) -> String {
    let mut header = String::new();
    for line in script.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix(HEADER_PREFIX) {
            header.push_str(rest.strip_prefix(' ').unwrap_or(rest));
            header.push('\n');
        } else if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        } else {
            break;
        }
    }
    header
}

/// A glob rule naming output that the surrounding automation should keep.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum OutputRule {
    Pattern(String),
    Mapped {
        pattern: String,
        #[serde(default)]
        destination: Option<PathBuf>,
    },
}

impl OutputRule {
    pub fn pattern(&self) -> &str {
        match self {
            OutputRule::Pattern(pattern) | OutputRule::Mapped { pattern, .. } => pattern,
        }
    }

    /// Subdirectory of the collection root that matches of this rule land in.
    pub fn destination(&self) -> Option<&Path> {
        match self {
            OutputRule::Pattern(_) => None,
            OutputRule::Mapped { destination, .. } => destination.as_deref(),
        }
    }
}

impl From<&str> for OutputRule {
    fn from(pattern: &str) -> Self {
        OutputRule::Pattern(pattern.to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct JobSettings {
    pub artifact: String,
    pub cargo: String,
    pub rustc: String,
    pub git: String,
    pub manifest_file: String,
    pub build_output_dir: String,
    pub build_executor: Vec<String>,
    pub measure_wrapper: Vec<String>,
    pub fetch: FetchSpec,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            artifact: "eos".to_string(),
            cargo: "cargo".to_string(),
            rustc: "rustc".to_string(),
            git: "git".to_string(),
            manifest_file: "build.ninja".to_string(),
            build_output_dir: "bld".to_string(),
            build_executor: vec!["ninja".to_string()],
            measure_wrapper: vec!["/usr/bin/time".to_string(), "-v".to_string()],
            fetch: FetchSpec::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchSpec {
    pub repository: String,
    pub branch: String,
    pub scratch_dir: PathBuf,
}

impl Default for FetchSpec {
    fn default() -> Self {
        Self {
            repository: String::new(),
            branch: "main".to_string(),
            scratch_dir: PathBuf::from("scratch"),
        }
    }
}
