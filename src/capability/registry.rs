//! Capability registry loading, validation and per-user layering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use walkdir::WalkDir;

use super::prompt::PromptOverride;
use super::schema::SchemaError;
use super::CapabilitySpec;
use crate::datasource::DataSources;

const MANIFEST_FILE: &str = "workflow.yaml";
const CAPABILITIES_DIR: &str = "capabilities";
const USERS_DIR: &str = "users";
const USER_TOGGLES_FILE: &str = "agents_required.yaml";
const USER_OVERRIDES_DIR: &str = "overrides";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("capability '{0}' is defined more than once")]
    DuplicateCapability(String),

    #[error("capability '{capability}' has an invalid output descriptor: {source}")]
    InvalidOutput {
        capability: String,
        #[source]
        source: SchemaError,
    },

    #[error("capability '{capability}' is bound to unknown data source '{source_id}'")]
    UnknownDataSource { capability: String, source_id: String },

    #[error("invalid user name '{0}'")]
    InvalidUser(String),

    #[error("capability name '{0}' cannot be stored as an override")]
    UnstorableName(String),
}

/// Capabilities that play fixed roles in every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRoles {
    #[serde(default = "default_planner")]
    pub planner: String,
    #[serde(default = "default_validator")]
    pub validator: String,
    #[serde(default = "default_escalation")]
    pub escalation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub history_summarizer: Option<String>,
}

fn default_planner() -> String {
    "supervisor_agent".to_string()
}

fn default_validator() -> String {
    "observer_agent".to_string()
}

fn default_escalation() -> String {
    "human_agent".to_string()
}

impl Default for WorkflowRoles {
    fn default() -> Self {
        Self {
            planner: default_planner(),
            validator: default_validator(),
            escalation: default_escalation(),
            history_summarizer: None,
        }
    }
}

/// Whether the planner may pick a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentToggle {
    pub name: String,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// Where an aggregator input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputSource {
    UserInput,
    /// Every task output, or one field projected from each.
    TaskOutputs {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
    ConversationHistory,
    UserDetails,
    Literal { value: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    pub param: String,
    #[serde(flatten)]
    pub source: InputSource,
}

/// A post-validation aggregator such as the cross-task summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplicitAgentSpec {
    pub name: String,
    /// Field of the result recorded in the transcript; the whole result if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_field: Option<String>,
    #[serde(default)]
    pub inputs: Vec<InputBinding>,
    /// Invoke once per task output instead of once over all of them.
    #[serde(default)]
    pub per_task: bool,
}

/// Contents of `workflow.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowManifest {
    #[serde(default)]
    pub roles: WorkflowRoles,
    #[serde(default)]
    pub agents_required: Vec<AgentToggle>,
    #[serde(default)]
    pub explicit_agents: Vec<ExplicitAgentSpec>,
}

/// Per-user changes to one capability, saved by the configure endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub prompts: PromptOverride,
}

/// A validated, read-only view of every capability for one user.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    manifest: WorkflowManifest,
    capabilities: HashMap<String, CapabilitySpec>,
}

impl CapabilityRegistry {
    /// Build a registry, rejecting any dangling reference.
    pub fn from_parts(
        manifest: WorkflowManifest,
        specs: Vec<CapabilitySpec>,
    ) -> Result<Self, RegistryError> {
        let mut capabilities = HashMap::with_capacity(specs.len());
        for spec in specs {
            spec.output
                .validate()
                .map_err(|source| RegistryError::InvalidOutput {
                    capability: spec.name.clone(),
                    source,
                })?;
            if capabilities.contains_key(&spec.name) {
                return Err(RegistryError::DuplicateCapability(spec.name));
            }
            capabilities.insert(spec.name.clone(), spec);
        }

        let registry = Self {
            manifest,
            capabilities,
        };
        registry.check_references()?;
        Ok(registry)
    }

    fn check_references(&self) -> Result<(), RegistryError> {
        let roles = &self.manifest.roles;
        let mut referenced: Vec<&str> = vec![
            roles.planner.as_str(),
            roles.validator.as_str(),
            roles.escalation.as_str(),
        ];
        referenced.extend(roles.history_summarizer.as_deref());
        referenced.extend(self.manifest.agents_required.iter().map(|a| a.name.as_str()));
        referenced.extend(self.manifest.explicit_agents.iter().map(|a| a.name.as_str()));
        referenced.extend(
            self.capabilities
                .values()
                .filter_map(|c| c.data_source.as_ref())
                .filter_map(|b| b.table_selector.as_deref()),
        );

        for name in referenced {
            if !self.capabilities.contains_key(name) {
                return Err(RegistryError::UnknownCapability(name.to_string()));
            }
        }
        Ok(())
    }

    /// Reject bindings to data sources that are not configured.
    pub fn check_data_sources(&self, sources: &DataSources) -> Result<(), RegistryError> {
        for spec in self.capabilities.values() {
            if let Some(binding) = &spec.data_source {
                if !sources.contains(&binding.source) {
                    return Err(RegistryError::UnknownDataSource {
                        capability: spec.name.clone(),
                        source_id: binding.source.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&CapabilitySpec, RegistryError> {
        self.capabilities
            .get(name)
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    pub fn roles(&self) -> &WorkflowRoles {
        &self.manifest.roles
    }

    pub fn explicit_agents(&self) -> &[ExplicitAgentSpec] {
        &self.manifest.explicit_agents
    }

    /// Capabilities the planner may choose from, with their enable flags.
    pub fn agents(&self) -> &[AgentToggle] {
        &self.manifest.agents_required
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.manifest
            .agents_required
            .iter()
            .any(|a| a.name == name && a.enabled)
    }

    pub fn enabled_agents(&self) -> impl Iterator<Item = &CapabilitySpec> {
        self.manifest
            .agents_required
            .iter()
            .filter(|a| a.enabled)
            .filter_map(|a| self.capabilities.get(&a.name))
    }

    /// Text listing every enabled task capability, for the planning prompt.
    pub fn function_catalogue(&self) -> String {
        let mut out = String::new();
        for spec in self.enabled_agents() {
            out.push_str(&format!("- function_name: {}\n", spec.name));
            if !spec.description.trim().is_empty() {
                out.push_str(&format!("  description: {}\n", spec.description.trim()));
            }
            out.push_str(&format!("  function_params: [{}]\n", spec.parameters.join(", ")));
        }
        out
    }

    fn apply_toggles(&mut self, toggles: &[AgentToggle]) {
        for toggle in toggles {
            match self
                .manifest
                .agents_required
                .iter_mut()
                .find(|a| a.name == toggle.name)
            {
                Some(agent) => agent.enabled = toggle.enabled,
                None => tracing::warn!(agent = %toggle.name, "Ignoring toggle for unknown agent"),
            }
        }
    }

    fn apply_override(&mut self, name: &str, change: &CapabilityOverride) {
        let Some(spec) = self.capabilities.get_mut(name) else {
            tracing::warn!(agent = %name, "Ignoring override for unknown capability");
            return;
        };
        if let Some(description) = &change.description {
            spec.description = description.clone();
        }
        spec.prompts.apply(&change.prompts);
    }
}

/// Reads registries from a config directory.
#[derive(Debug, Clone)]
pub struct RegistryLoader {
    root: PathBuf,
}

impl RegistryLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load the base registry, layered with `user`'s toggles and overrides.
    pub fn load(&self, user: Option<&str>) -> Result<CapabilityRegistry, RegistryError> {
        let manifest: WorkflowManifest = read_yaml(&self.root.join(MANIFEST_FILE))?;
        let specs = self.read_capabilities()?;
        let mut registry = CapabilityRegistry::from_parts(manifest, specs)?;

        if let Some(user) = user {
            let user_dir = self.user_dir(user)?;

            let toggles_path = user_dir.join(USER_TOGGLES_FILE);
            if toggles_path.is_file() {
                let toggles: Vec<AgentToggle> = read_yaml(&toggles_path)?;
                registry.apply_toggles(&toggles);
            }

            let overrides_dir = user_dir.join(USER_OVERRIDES_DIR);
            for path in yaml_files(&overrides_dir) {
                let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let change: CapabilityOverride = read_yaml(&path)?;
                registry.apply_override(name, &change);
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            user = user.unwrap_or("-"),
            capabilities = registry.capabilities.len(),
            "Loaded capability registry"
        );
        Ok(registry)
    }

    fn read_capabilities(&self) -> Result<Vec<CapabilitySpec>, RegistryError> {
        yaml_files(&self.root.join(CAPABILITIES_DIR))
            .into_iter()
            .map(|path| read_yaml(&path))
            .collect()
    }

    fn user_dir(&self, user: &str) -> Result<PathBuf, RegistryError> {
        let segment = sanitize_segment(user);
        if segment.is_empty() {
            return Err(RegistryError::InvalidUser(user.to_string()));
        }
        Ok(self.root.join(USERS_DIR).join(segment))
    }

    /// Persist `user`'s enable flag for one agent and return the effective list.
    pub fn save_toggle(
        &self,
        user: &str,
        agent: &str,
        enabled: bool,
    ) -> Result<Vec<AgentToggle>, RegistryError> {
        let mut registry = self.load(Some(user))?;
        if !registry.agents().iter().any(|a| a.name == agent) {
            return Err(RegistryError::UnknownCapability(agent.to_string()));
        }
        registry.apply_toggles(&[AgentToggle {
            name: agent.to_string(),
            enabled,
        }]);

        let toggles = registry.agents().to_vec();
        let path = self.user_dir(user)?.join(USER_TOGGLES_FILE);
        write_yaml(&path, &toggles)?;
        tracing::info!(user, agent, enabled, "Saved agent toggle");
        Ok(toggles)
    }

    /// Persist a per-user override for one capability.
    pub fn save_override(
        &self,
        user: &str,
        agent: &str,
        change: &CapabilityOverride,
    ) -> Result<PathBuf, RegistryError> {
        let registry = self.load(None)?;
        registry.get(agent)?;
        // Overrides are applied by file stem, so the name must survive as one.
        if sanitize_segment(agent) != agent {
            return Err(RegistryError::UnstorableName(agent.to_string()));
        }

        let path = self
            .user_dir(user)?
            .join(USER_OVERRIDES_DIR)
            .join(format!("{}.yaml", agent));
        write_yaml(&path, change)?;
        tracing::info!(user, agent, "Saved capability override");
        Ok(path)
    }
}

fn sanitize_segment(value: &str) -> String {
    value
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@') {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}

fn yaml_files(dir: &Path) -> Vec<PathBuf> {
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();
    files
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, RegistryError> {
    let text = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&text).map_err(|e| RegistryError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> Result<(), RegistryError> {
    let io_err = |source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let text = serde_yaml::to_string(value).map_err(|e| RegistryError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    std::fs::write(path, text).map_err(io_err)
}
