use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::EngineError;

/// One named command with its execution metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
    #[serde(default)]
    pub continue_on_error: bool,
    #[serde(default)]
    pub interactive: bool,
    /// Exported before the command, in order.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Pre-configured answers for prompts the command may raise.
    #[serde(default)]
    pub inputs: Vec<StepInput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepInput {
    /// Case-insensitive substring looked for in the detected prompt text.
    pub prompt_match: String,
    #[serde(default)]
    pub value: String,
    /// A required input must carry a value before the run starts.
    #[serde(default)]
    pub required: bool,
}

fn default_working_dir() -> String {
    ".".to_string()
}

impl Step {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            working_dir: default_working_dir(),
            continue_on_error: false,
            interactive: false,
            env: Vec::new(),
            inputs: Vec::new(),
        }
    }

    pub fn in_dir(mut self, working_dir: impl Into<String>) -> Self {
        self.working_dir = working_dir.into();
        self
    }

    pub fn continue_on_error(mut self) -> Self {
        self.continue_on_error = true;
        self
    }

    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn with_input(mut self, prompt_match: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.push(StepInput {
            prompt_match: prompt_match.into(),
            value: value.into(),
            required: false,
        });
        self
    }

    /// Find the first configured input whose `prompt_match` occurs in the
    /// prompt text, ignoring case.
    pub fn find_input(&self, prompt: &str) -> Option<&StepInput> {
        let prompt = prompt.to_lowercase();
        self.inputs
            .iter()
            .find(|input| prompt.contains(&input.prompt_match.to_lowercase()))
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation(&self.name, "name is empty"));
        }
        if self.command.trim().is_empty() {
            return Err(EngineError::validation(&self.name, "command is empty"));
        }
        for var in &self.env {
            if !is_valid_env_name(&var.name) {
                return Err(EngineError::validation(
                    &self.name,
                    format!("invalid environment variable name '{}'", var.name),
                ));
            }
        }
        for input in &self.inputs {
            if input.prompt_match.trim().is_empty() {
                return Err(EngineError::validation(&self.name, "input has an empty prompt_match"));
            }
            if input.required && input.value.is_empty() {
                return Err(EngineError::validation(
                    &self.name,
                    format!("required input '{}' has no value", input.prompt_match),
                ));
            }
        }
        Ok(())
    }
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Validate every step and reject duplicate names within the run.
pub fn validate_steps(steps: &[Step]) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for step in steps {
        step.validate()?;
        if !seen.insert(step.name.as_str()) {
            return Err(EngineError::validation(&step.name, "duplicate step name"));
        }
    }
    Ok(())
}

/// `(step index, input index)` of every required input still lacking a value.
pub fn missing_required_inputs(steps: &[Step]) -> Vec<(usize, usize)> {
    let mut missing = Vec::new();
    for (step_idx, step) in steps.iter().enumerate() {
        for (input_idx, input) in step.inputs.iter().enumerate() {
            if input.required && input.value.is_empty() {
                missing.push((step_idx, input_idx));
            }
        }
    }
    missing
}

#[derive(Debug, Deserialize)]
struct StepFile {
    #[serde(default)]
    steps: Vec<Step>,
}

/// Load a step list from a YAML (`.yaml`/`.yml`) or TOML file.
pub fn load_steps(path: &Path) -> Result<Vec<Step>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read step file: {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let file: StepFile = if is_yaml {
        serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML step file: {}", path.display()))?
    } else {
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML step file: {}", path.display()))?
    };
    Ok(file.steps)
}
