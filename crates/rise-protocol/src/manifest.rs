//! Manifest Model (spec §4.C) — parsing, validation, and atomic rewriting
//! of a plugin's `manifest.json`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("manifest missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unsupported protocol_version `{0}`, expected \"2.0\"")]
    UnsupportedProtocolVersion(String),

    #[error("duplicate function name `{0}`")]
    DuplicateFunction(String),

    #[error("function `{function}` requires undeclared parameter `{param}`")]
    RequiredParamNotDeclared { function: String, param: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDecl {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub required: Vec<String>,
}

impl FunctionDecl {
    fn validate(&self) -> Result<(), ManifestError> {
        let properties: HashSet<&str> = self.properties.keys().map(String::as_str).collect();
        for req in &self.required {
            if !properties.contains(req.as_str()) {
                return Err(ManifestError::RequiredParamNotDeclared {
                    function: self.name.clone(),
                    param: req.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MCPConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdio_command: Option<String>,
    #[serde(default)]
    pub launch_on_startup: bool,
    #[serde(default, rename = "poll_interval")]
    pub poll_interval_s: u64,
    #[serde(default)]
    pub auto_refresh_session: bool,
    #[serde(default = "default_refresh_margin")]
    pub session_refresh_margin_s: u64,
}

fn default_refresh_margin() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TetherConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub onboarding_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_passthrough: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "manifestVersion")]
    pub manifest_version: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    pub executable: String,
    #[serde(default)]
    pub persistent: bool,
    pub protocol_version: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mcp: Option<MCPConfig>,
    #[serde(default)]
    pub tether_config: Option<TetherConfig>,
    #[serde(default)]
    pub functions: Vec<FunctionDecl>,

    /// Directory the manifest was loaded from (not serialized); absent for
    /// manifests constructed in memory before being written for the first
    /// time.
    #[serde(skip)]
    pub source_dir: Option<PathBuf>,
}

impl Manifest {
    /// Parse and validate a manifest from its in-memory JSON text.
    ///
    /// Validation enforces spec §3's invariants: required fields present,
    /// `protocol_version == "2.0"`, function names unique, and each
    /// function's `required` set is a subset of its declared properties.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_json::from_str(text).map_err(|e| ManifestError::Json {
            path: PathBuf::new(),
            source: e,
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn load_file(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut manifest = Self::parse(&text).map_err(|e| match e {
            ManifestError::Json { source, .. } => ManifestError::Json {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        manifest.source_dir = path.parent().map(Path::to_path_buf);
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.executable.is_empty() {
            return Err(ManifestError::MissingField("executable"));
        }
        if self.protocol_version != "2.0" {
            return Err(ManifestError::UnsupportedProtocolVersion(
                self.protocol_version.clone(),
            ));
        }

        let mut seen = HashSet::new();
        for function in &self.functions {
            if !seen.insert(function.name.clone()) {
                return Err(ManifestError::DuplicateFunction(function.name.clone()));
            }
            function.validate()?;
        }
        Ok(())
    }

    /// Merge MCP-discovered functions into this manifest's static function
    /// list, deduplicated by name with the discovered function winning on
    /// collision (spec §4.C).
    pub fn merge_discovered(&mut self, discovered: Vec<FunctionDecl>) {
        let discovered_names: HashSet<&str> =
            discovered.iter().map(|f| f.name.as_str()).collect();
        self.functions
            .retain(|f| !discovered_names.contains(f.name.as_str()));
        self.functions.extend(discovered);
    }

    /// Atomically rewrite the manifest file backing this value: write to a
    /// temp file in the same directory, then rename over the original, so
    /// a concurrent reader (the Manifest Watcher, or another host process)
    /// never observes a half-written file.
    pub fn write_atomic(&self, path: &Path) -> Result<(), ManifestError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let tmp_path = dir.join(format!(
            ".{}.tmp",
            path.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "manifest.json".to_string())
        ));

        let body = serde_json::to_string_pretty(self).map_err(|e| ManifestError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;

        std::fs::write(&tmp_path, body).map_err(|e| ManifestError::Io {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, path).map_err(|e| ManifestError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "manifestVersion": 1,
            "name": "weather",
            "version": "1.0.0",
            "description": "weather plugin",
            "executable": "weather.exe",
            "persistent": true,
            "protocol_version": "2.0",
            "functions": [
                {
                    "name": "get_forecast",
                    "description": "fetch forecast",
                    "tags": [],
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }
            ]
        }"#
    }

    #[test]
    fn parses_a_minimal_manifest() {
        let manifest = Manifest::parse(minimal_json()).unwrap();
        assert_eq!(manifest.functions.len(), 1);
        assert_eq!(manifest.functions[0].name, "get_forecast");
    }

    #[test]
    fn rejects_wrong_protocol_version() {
        let bad = minimal_json().replace("2.0", "1.0");
        let err = Manifest::parse(&bad).unwrap_err();
        assert!(matches!(err, ManifestError::UnsupportedProtocolVersion(_)));
    }

    #[test]
    fn rejects_duplicate_function_names() {
        let mut manifest = Manifest::parse(minimal_json()).unwrap();
        let dup = manifest.functions[0].clone();
        manifest.functions.push(dup);
        assert!(matches!(
            manifest.validate(),
            Err(ManifestError::DuplicateFunction(_))
        ));
    }

    #[test]
    fn rejects_required_param_not_declared() {
        let bad = minimal_json().replace("\"city\"", "\"citystate\"");
        // required still says "city" but properties now has "citystate"
        let result = Manifest::parse(&bad);
        assert!(matches!(
            result,
            Err(ManifestError::RequiredParamNotDeclared { .. })
        ));
    }

    #[test]
    fn merge_discovered_dedupes_with_discovered_winning() {
        let mut manifest = Manifest::parse(minimal_json()).unwrap();
        let replacement = FunctionDecl {
            name: "get_forecast".to_string(),
            description: "mcp-discovered version".to_string(),
            tags: vec![],
            properties: Default::default(),
            required: vec![],
        };
        manifest.merge_discovered(vec![replacement]);
        assert_eq!(manifest.functions.len(), 1);
        assert_eq!(manifest.functions[0].description, "mcp-discovered version");
    }

    #[test]
    fn write_atomic_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let manifest = Manifest::parse(minimal_json()).unwrap();
        manifest.write_atomic(&path).unwrap();

        let reloaded = Manifest::load_file(&path).unwrap();
        assert_eq!(reloaded.name, manifest.name);
        assert_eq!(reloaded.functions.len(), manifest.functions.len());
    }

    #[test]
    fn empty_functions_array_is_valid_for_mcp_auto_populated_plugins() {
        let json = minimal_json().replace(
            r#""functions": [
                {
                    "name": "get_forecast",
                    "description": "fetch forecast",
                    "tags": [],
                    "properties": {"city": {"type": "string"}},
                    "required": ["city"]
                }
            ]"#,
            r#""functions": []"#,
        );
        let manifest = Manifest::parse(&json).unwrap();
        assert!(manifest.functions.is_empty());
    }
}
