//! Daemon configuration: TOML file with flag/env overrides.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

use crate::profile::{ExecutorProfile, ProfileRegistry};

const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_STOP_GRACE_MS: u64 = 5_000;

#[derive(Parser, Debug, Default)]
#[command(name = "attemptd", version, about = "Task-attempt execution orchestrator")]
pub struct Args {
    /// Path to config.toml.
    #[arg(long, env = "ATTEMPTD_CONFIG")]
    pub config: Option<PathBuf>,

    /// Repository to orchestrate attempts in.
    #[arg(long, env = "ATTEMPTD_REPO")]
    pub repo: Option<PathBuf>,

    /// State directory for worktrees and logs. Defaults to {repo}/.attemptd.
    #[arg(long, env = "ATTEMPTD_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Default base branch for new attempts.
    #[arg(long)]
    pub base_branch: Option<String>,

    /// Directory for rolling log files (logs go to stderr when unset).
    #[arg(long)]
    pub log_dir: Option<PathBuf>,

    /// Emit logs as JSON.
    #[arg(long)]
    pub json_logs: bool,
}

/// On-disk shape of config.toml.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    pub repo: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
    pub base_branch: Option<String>,
    /// Run in a fresh worktree before the first coding-agent turn.
    pub setup_script: Option<String>,
    /// Chained after every coding-agent turn that completes.
    pub cleanup_script: Option<String>,
    pub dev_server_script: Option<String>,
    /// Grace period between SIGTERM and the forced kill, in milliseconds.
    pub stop_grace_ms: Option<u64>,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub profile: HashMap<String, ExecutorProfile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct LogSection {
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub json: bool,
}

/// Fully-resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub repo: PathBuf,
    pub data_dir: PathBuf,
    pub base_branch: String,
    pub setup_script: Option<String>,
    pub cleanup_script: Option<String>,
    pub dev_server_script: Option<String>,
    pub stop_grace: Duration,
    pub log_dir: Option<PathBuf>,
    pub json_logs: bool,
    pub profiles: HashMap<String, ExecutorProfile>,
}

impl OrchestratorConfig {
    pub fn load(args: Args) -> anyhow::Result<Self> {
        let file = match &args.config {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parse config file {}", path.display()))?
            }
            None => TomlConfig::default(),
        };
        Self::merge(args, file)
    }

    /// Flags and env beat the file; the file beats built-in defaults.
    fn merge(args: Args, file: TomlConfig) -> anyhow::Result<Self> {
        let repo = args
            .repo
            .or(file.repo)
            .context("no repository configured; pass --repo or set repo in config.toml")?;
        let data_dir = args
            .data_dir
            .or(file.data_dir)
            .unwrap_or_else(|| repo.join(".attemptd"));
        let profiles = if file.profile.is_empty() {
            default_profiles()
        } else {
            file.profile
        };
        Ok(Self {
            data_dir,
            base_branch: args
                .base_branch
                .or(file.base_branch)
                .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
            setup_script: file.setup_script,
            cleanup_script: file.cleanup_script,
            dev_server_script: file.dev_server_script,
            stop_grace: Duration::from_millis(file.stop_grace_ms.unwrap_or(DEFAULT_STOP_GRACE_MS)),
            log_dir: args.log_dir.or(file.log.dir),
            json_logs: args.json_logs || file.log.json,
            profiles,
            repo,
        })
    }

    pub fn registry(&self) -> ProfileRegistry {
        ProfileRegistry::new(self.profiles.clone())
    }
}

fn default_profiles() -> HashMap<String, ExecutorProfile> {
    let mut profiles = HashMap::new();
    profiles.insert(
        "claude-code".to_string(),
        ExecutorProfile {
            command: "claude".into(),
            args: vec![
                "-p".into(),
                "--output-format".into(),
                "stream-json".into(),
                "--verbose".into(),
            ],
            resume_args: vec!["--continue".into()],
            model_flag: Some("--model".into()),
            variant: HashMap::new(),
        },
    );
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_fill_in_and_flags_win() {
        let file: TomlConfig = toml::from_str(
            r#"
            repo = "/srv/project"
            base_branch = "develop"
            setup_script = "npm ci"
            stop_grace_ms = 1000

            [log]
            dir = "/var/log/attemptd"
            json = true

            [profile.claude-code]
            command = "claude"
            args = ["-p"]
            model_flag = "--model"

            [profile.claude-code.variant.plan]
            args = ["--plan"]
            "#,
        )
        .unwrap();
        let args = Args {
            base_branch: Some("release".into()),
            ..Args::default()
        };
        let config = OrchestratorConfig::merge(args, file).unwrap();
        assert_eq!(config.repo, PathBuf::from("/srv/project"));
        assert_eq!(config.data_dir, PathBuf::from("/srv/project/.attemptd"));
        assert_eq!(config.base_branch, "release");
        assert_eq!(config.setup_script.as_deref(), Some("npm ci"));
        assert_eq!(config.stop_grace, Duration::from_millis(1000));
        assert!(config.json_logs);
        let profile = &config.profiles["claude-code"];
        assert_eq!(profile.command, "claude");
        assert!(profile.variant.contains_key("plan"));
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let args = Args {
            repo: Some("/srv/project".into()),
            ..Args::default()
        };
        let config = OrchestratorConfig::merge(args, TomlConfig::default()).unwrap();
        assert_eq!(config.base_branch, "main");
        assert_eq!(config.stop_grace, Duration::from_millis(5000));
        assert!(config.profiles.contains_key("claude-code"));
    }

    #[test]
    fn missing_repo_is_an_error() {
        assert!(OrchestratorConfig::merge(Args::default(), TomlConfig::default()).is_err());
    }
}
