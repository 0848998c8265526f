/// Configuration for runtime bootstrap: where the engine looks for modules
/// and support glue.
use crate::types::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    /// Host-computed directory holding this application's runtime modules.
    /// Prepended to the search paths ahead of everything else.
    pub host_module_dir: PathBuf,
    /// The platform's runtime home (standard library location of the
    /// embedded engine).
    pub runtime_home: PathBuf,
    /// Additional search paths appended after the two above.
    #[serde(default)]
    pub extra_search_paths: Vec<PathBuf>,
}

impl GateConfig {
    /// Runtime root directory scoped by effective UID.
    /// Prevents root and non-root runs from colliding on a shared temp dir.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("scriptgate-uid-{}", euid))
    }

    /// Load configuration from a JSON file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GateError::Config(format!("failed to read config file: {}", e)))?;

        let config: GateConfig = serde_json::from_str(&content)
            .map_err(|e| GateError::Config(format!("failed to parse config JSON: {}", e)))?;

        Ok(config)
    }

    /// Load `./scriptgate.json` if present.
    pub fn load_default() -> Result<Self> {
        let config_path = std::env::current_dir()
            .map_err(|e| GateError::Config(format!("failed to get current directory: {}", e)))?
            .join("scriptgate.json");

        if !config_path.exists() {
            return Err(GateError::Config(
                "scriptgate.json not found in current directory".to_string(),
            ));
        }

        Self::load_from_file(config_path)
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        let root = Self::runtime_root_dir();
        let runtime_home = std::env::var_os("SCRIPTGATE_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("home"));
        Self {
            host_module_dir: root.join("modules"),
            runtime_home,
            extra_search_paths: Vec::new(),
        }
    }
}
