//! Executor profile registry.
//!
//! Maps an agent identifier (+ optional variant) to the concrete command and
//! arguments the process supervisor runs. Profiles come from config; the
//! lookup is a plain capability table, not dispatch baked into process types.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifies which agent (and which configured variant of it) runs a turn.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutorProfileId {
    pub executor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl ExecutorProfileId {
    pub fn new(executor: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            variant: None,
        }
    }

    pub fn with_variant(executor: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            executor: executor.into(),
            variant: Some(variant.into()),
        }
    }
}

impl fmt::Display for ExecutorProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.variant {
            Some(v) => write!(f, "{}:{}", self.executor, v),
            None => write!(f, "{}", self.executor),
        }
    }
}

/// One configured agent command. Parsed from `[profile.<name>]` (and
/// `[profile.<name>.variant.<label>]`) sections of config.toml.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorProfile {
    /// Program to invoke, e.g. `"claude"`.
    pub command: String,
    /// Base arguments, prompt appended last.
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra arguments for resuming a prior session (follow-ups).
    #[serde(default)]
    pub resume_args: Vec<String>,
    /// Argument that carries a model override; the model name is appended
    /// after it, e.g. `"--model"`. None = overrides ignored.
    #[serde(default)]
    pub model_flag: Option<String>,
    /// Named variants that replace the base args wholesale.
    #[serde(default)]
    pub variant: HashMap<String, ExecutorVariant>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutorVariant {
    #[serde(default)]
    pub args: Vec<String>,
}

/// A fully-resolved invocation, ready for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, ExecutorProfile>,
}

impl ProfileRegistry {
    pub fn new(profiles: HashMap<String, ExecutorProfile>) -> Self {
        Self { profiles }
    }

    pub fn get(&self, executor: &str) -> Option<&ExecutorProfile> {
        self.profiles.get(executor)
    }

    /// Resolve a profile id into a concrete command line.
    ///
    /// `follow_up` switches in the resume arguments; `model_override` is
    /// appended behind the profile's model flag when one is configured.
    pub fn resolve(
        &self,
        id: &ExecutorProfileId,
        model_override: Option<&str>,
        follow_up: bool,
        prompt: &str,
    ) -> Option<ResolvedCommand> {
        let profile = self.profiles.get(&id.executor)?;
        let mut args = match &id.variant {
            Some(label) => profile.variant.get(label)?.args.clone(),
            None => profile.args.clone(),
        };
        if follow_up {
            args.extend(profile.resume_args.iter().cloned());
        }
        if let (Some(flag), Some(model)) = (&profile.model_flag, model_override) {
            args.push(flag.clone());
            args.push(model.to_string());
        }
        args.push(prompt.to_string());
        Some(ResolvedCommand {
            program: profile.command.clone(),
            args,
        })
    }
}
