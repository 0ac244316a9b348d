//! Agent configuration stored in `patch-agent.toml` at the repository root.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::validate::{MarkerRule, default_marker_rules};

/// Default config file name, resolved against the repository root.
pub const DEFAULT_CONFIG_FILE: &str = "patch-agent.toml";

/// Agent configuration (TOML).
///
/// Missing fields fall back to defaults, so an absent file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Generation-attempt ceiling per round.
    pub max_diff_attempts: u32,

    /// Sampling temperature sent with every request.
    pub temperature: f32,

    /// Bytes of test output folded into a repair prompt (tail kept).
    pub prompt_output_limit_bytes: usize,

    /// Attempt log root. Defaults to `<git-dir>/patch-agent/runs`.
    ///
    /// Relative paths resolve against the repository. A location inside the
    /// working tree must be ignored by git.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    pub model: ModelConfig,
    pub harness: HarnessConfig,
    pub publish: PublishConfig,
    pub github: GitHubConfig,
    pub validator: ValidatorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    /// Base URL of the Ollama server.
    pub url: String,
    pub model: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Build/test command, run from the repository root.
    pub command: Vec<String>,
    /// Kill the harness after this many seconds. Unbounded when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Per-stream capture limit.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MergeMethod {
    Merge,
    Squash,
    Rebase,
}

impl MergeMethod {
    /// Enum value expected by the GitHub GraphQL API.
    pub fn graphql_name(self) -> &'static str {
        match self {
            MergeMethod::Merge => "MERGE",
            MergeMethod::Squash => "SQUASH",
            MergeMethod::Rebase => "REBASE",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublishConfig {
    pub remote: String,
    /// Pull request base branch.
    pub base: String,
    pub commit_message: String,
    pub pr_title: String,
    pub pr_body: String,
    pub auto_merge: bool,
    pub merge_method: MergeMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GitHubConfig {
    pub owner: String,
    pub repo: String,
    pub api_url: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ValidatorConfig {
    pub min_patch_bytes: usize,
    pub balanced: Vec<MarkerRule>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_diff_attempts: 3,
            temperature: 0.2,
            prompt_output_limit_bytes: 12_000,
            log_dir: None,
            model: ModelConfig::default(),
            harness: HarnessConfig::default(),
            publish: PublishConfig::default(),
            github: GitHubConfig::default(),
            validator: ValidatorConfig::default(),
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:11434".to_string(),
            model: "qwen3-coder:30b".to_string(),
            timeout_secs: 600,
        }
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            command: [
                "dotnet",
                "test",
                "core/CoreSim.Tests/CoreSim.Tests.csproj",
                "-c",
                "Release",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            timeout_secs: None,
            output_limit_bytes: 200_000,
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            remote: "origin".to_string(),
            base: "main".to_string(),
            commit_message: "agent: apply generated change".to_string(),
            pr_title: "Agent change".to_string(),
            pr_body: "Automated change produced and verified by patch-agent.".to_string(),
            auto_merge: true,
            merge_method: MergeMethod::Squash,
        }
    }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            api_url: "https://api.github.com".to_string(),
            timeout_secs: 60,
        }
    }
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_patch_bytes: 32,
            balanced: default_marker_rules(),
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_diff_attempts == 0 {
            return Err(anyhow!("max_diff_attempts must be > 0"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(anyhow!("temperature must be within 0.0..=2.0"));
        }
        if self.prompt_output_limit_bytes == 0 {
            return Err(anyhow!("prompt_output_limit_bytes must be > 0"));
        }
        if self.model.url.trim().is_empty() {
            return Err(anyhow!("model.url must be set"));
        }
        if self.model.model.trim().is_empty() {
            return Err(anyhow!("model.model must be set"));
        }
        if self.model.timeout_secs == 0 {
            return Err(anyhow!("model.timeout_secs must be > 0"));
        }
        if self.harness.command.is_empty() || self.harness.command[0].trim().is_empty() {
            return Err(anyhow!("harness.command must be a non-empty array"));
        }
        if self.harness.timeout_secs == Some(0) {
            return Err(anyhow!("harness.timeout_secs must be > 0 when set"));
        }
        if self.harness.output_limit_bytes == 0 {
            return Err(anyhow!("harness.output_limit_bytes must be > 0"));
        }
        if self.publish.remote.trim().is_empty() {
            return Err(anyhow!("publish.remote must be set"));
        }
        if self.publish.commit_message.trim().is_empty() {
            return Err(anyhow!("publish.commit_message must be set"));
        }
        if self.github.timeout_secs == 0 {
            return Err(anyhow!("github.timeout_secs must be > 0"));
        }
        for rule in &self.validator.balanced {
            if rule.extensions.is_empty() {
                return Err(anyhow!(
                    "validator.balanced rule for `{}` needs at least one extension",
                    rule.open
                ));
            }
            if rule.open.trim().is_empty() || rule.close.trim().is_empty() {
                return Err(anyhow!("validator.balanced markers must be non-empty"));
            }
        }
        Ok(())
    }

    /// Apply `OLLAMA_URL`, `OLLAMA_MODEL`, `GITHUB_OWNER` and `GITHUB_REPO`.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty("OLLAMA_URL") {
            debug!(url = %url, "model url from environment");
            self.model.url = url;
        }
        if let Some(model) = non_empty("OLLAMA_MODEL") {
            self.model.model = model;
        }
        if let Some(owner) = non_empty("GITHUB_OWNER") {
            self.github.owner = owner;
        }
        if let Some(repo) = non_empty("GITHUB_REPO") {
            self.github.repo = repo;
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        debug!(path = %path.display(), "config file missing, using defaults");
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Load, override from the environment, and re-validate.
pub fn load_effective_config(path: &Path) -> Result<AgentConfig> {
    let mut cfg = load_config(path)?;
    cfg.apply_env_overrides();
    cfg.validate()?;
    Ok(cfg)
}

/// Render config as TOML with a trailing newline.
pub fn render_config(cfg: &AgentConfig) -> Result<String> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    if !buf.ends_with('\n') {
        buf.push('\n');
    }
    Ok(buf)
}
