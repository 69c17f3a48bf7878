//! Persisted provider profiles.
//!
//! A profile snapshots provider, model, model parameters, and ephemeral
//! settings as a versioned JSON document at
//! `<profiles_dir>/<name>.json` (default `~/.llxprt/profiles`).
//! Loading an invalid or missing profile yields a typed error naming
//! the profile.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LlxprtError;
use crate::provider::ModelParams;

/// Current profile schema version.
pub const PROFILE_VERSION: u32 = 1;

/// A saved provider configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    /// Schema version; always [`PROFILE_VERSION`] when written.
    pub version: u32,
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Sampling parameters.
    #[serde(default, skip_serializing_if = "ModelParams::is_empty")]
    pub model_params: ModelParams,
    /// Ephemeral settings (`"base-url"`, `"auth-key"`,
    /// `"tools.allowed"`, …).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ephemeral_settings: HashMap<String, Value>,
}

impl Profile {
    /// A minimal profile at the current schema version.
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            version: PROFILE_VERSION,
            provider: provider.into(),
            model: model.into(),
            model_params: ModelParams::default(),
            ephemeral_settings: HashMap::new(),
        }
    }
}

/// Loads and saves profiles under one directory.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    /// A store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The default store at `~/.llxprt/profiles`.
    pub fn default_dir() -> Self {
        let base = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(base.join(".llxprt").join("profiles"))
    }

    /// The directory profiles live in.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }

    /// Writes `profile` as `<dir>/<name>.json`, creating the directory
    /// if needed.
    pub fn save(&self, name: &str, profile: &Profile) -> Result<(), LlxprtError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            LlxprtError::Config(format!(
                "cannot create profiles directory {}: {e}",
                self.dir.display()
            ))
        })?;
        let json = serde_json::to_string_pretty(profile)
            .map_err(|e| LlxprtError::Config(format!("cannot serialize profile '{name}': {e}")))?;
        std::fs::write(self.path_for(name), json)
            .map_err(|e| LlxprtError::Config(format!("cannot write profile '{name}': {e}")))
    }

    /// Reads `<dir>/<name>.json` back into a [`Profile`].
    pub fn load(&self, name: &str) -> Result<Profile, LlxprtError> {
        let path = self.path_for(name);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| LlxprtError::Config(format!("profile '{name}' not readable: {e}")))?;
        serde_json::from_str(&text)
            .map_err(|e| LlxprtError::Config(format!("profile '{name}' is invalid: {e}")))
    }

    /// Names of all saved profiles.
    pub fn list(&self) -> Result<Vec<String>, LlxprtError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(LlxprtError::Config(format!(
                    "cannot list profiles in {}: {e}",
                    self.dir.display()
                )));
            }
        };
        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let file_name = entry.file_name();
                let file_name = file_name.to_str()?;
                file_name.strip_suffix(".json").map(String::from)
            })
            .collect();
        names.sort();
        Ok(names)
    }

    /// Deletes a saved profile. Missing profiles error.
    pub fn delete(&self, name: &str) -> Result<(), LlxprtError> {
        std::fs::remove_file(self.path_for(name))
            .map_err(|e| LlxprtError::Config(format!("cannot delete profile '{name}': {e}")))
    }
}
