//! Detector profile persistence
//!
//! A profile is a named JSON snapshot of one detector's parameters and, for the
//! adaptive detector, its learned templates. Profiles live in
//! `<config dir>/TextRegionEngine/profiles/<name>.json` by default.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::EngineConfig;
use crate::detection::RegionTemplate;
use crate::error::ProfileError;
use crate::params::ParamValue;

/// Persisted detector state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorProfile {
    /// Format version (for future migrations)
    pub version: u32,
    pub detector: String,
    pub parameters: BTreeMap<String, ParamValue>,
    #[serde(default)]
    pub templates: Vec<RegionTemplate>,
}

impl DetectorProfile {
    /// Current profile format version
    pub const VERSION: u32 = 1;

    pub fn new(detector: &str, parameters: BTreeMap<String, ParamValue>) -> Self {
        Self {
            version: Self::VERSION,
            detector: detector.to_string(),
            parameters,
            templates: Vec::new(),
        }
    }

    pub fn with_templates(mut self, templates: Vec<RegionTemplate>) -> Self {
        self.templates = templates;
        self
    }

    pub fn ensure_detector(&self, expected: &str) -> Result<(), ProfileError> {
        if self.detector != expected {
            return Err(ProfileError::DetectorMismatch {
                expected: expected.to_string(),
                found: self.detector.clone(),
            });
        }
        Ok(())
    }
}

/// File-system backed profile directory
#[derive(Debug, Clone)]
pub struct ProfileStore {
    dir: PathBuf,
}

impl ProfileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Store under the platform config directory
    pub fn default_location() -> Result<Self, ProfileError> {
        EngineConfig::profiles_dir()
            .map(Self::new)
            .ok_or(ProfileError::NoProfileDir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a profile name (non-filename characters replaced)
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", file))
    }

    pub fn save(&self, name: &str, profile: &DetectorProfile) -> Result<PathBuf, ProfileError> {
        let path = self.path_for(name);
        let io_err = |source| ProfileError::Io {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let json = serde_json::to_string_pretty(profile).map_err(ProfileError::Serialize)?;
        fs::write(&path, json).map_err(io_err)?;

        tracing::info!(
            "Saved profile '{}' for detector {} ({} parameters, {} templates)",
            name,
            profile.detector,
            profile.parameters.len(),
            profile.templates.len()
        );
        Ok(path)
    }

    pub fn load(&self, name: &str) -> Result<DetectorProfile, ProfileError> {
        let path = self.path_for(name);
        let json = fs::read_to_string(&path).map_err(|source| ProfileError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let profile: DetectorProfile =
            serde_json::from_str(&json).map_err(|source| ProfileError::Deserialize {
                path: path.display().to_string(),
                source,
            })?;

        if profile.version != DetectorProfile::VERSION {
            tracing::warn!(
                "Profile '{}' has version {} (expected {})",
                name,
                profile.version,
                DetectorProfile::VERSION
            );
        }
        tracing::debug!("Loaded profile '{}' from {}", name, path.display());
        Ok(profile)
    }

    /// Names of all stored profiles, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().map(|ext| ext == "json").unwrap_or(false))
                    .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }
}
