//! Configuration system for oxidized-xenon

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub cpu: CpuConfig,
    pub gpu: GpuConfig,
    pub audio: AudioConfig,
    pub paths: PathConfig,
    pub debug: DebugConfig,
}

/// General emulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Executable to launch from a disc image or package instead of
    /// `default.xex` or the module named by the game. Empty means default.
    pub launch_module: String,
    /// Apply XEX patches found in installed title updates
    pub apply_patches: bool,
    /// Scalar used to speed or slow guest time (1x, 2x, 1/2x, etc)
    pub time_scalar: f64,
}

/// CPU backend settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CpuConfig {
    pub backend: CpuBackend,
}

/// CPU backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum CpuBackend {
    #[default]
    Any,
    Null,
}

/// GPU settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    pub backend: GpuBackend,
    pub shader_cache: bool,
}

/// GPU backend type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum GpuBackend {
    #[default]
    Null,
}

/// Audio settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub enable: bool,
}

/// Path configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    pub storage_root: PathBuf,
    pub content_root: PathBuf,
    pub cache_root: PathBuf,
}

/// Debug settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub log_level: LogLevel,
    pub log_to_file: bool,
    pub log_path: PathBuf,
}

/// Logging level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// Directive string understood by `EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }
}

/// Per-title overrides, loaded from `games/<TITLEID>.toml`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TitleConfig {
    pub launch_module: Option<String>,
    pub apply_patches: Option<bool>,
    pub time_scalar: Option<f64>,
    pub shader_cache: Option<bool>,
    pub audio_enable: Option<bool>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            launch_module: String::new(),
            apply_patches: true,
            time_scalar: 1.0,
        }
    }
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            backend: GpuBackend::default(),
            shader_cache: true,
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self { enable: true }
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        let base = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-xenon");

        Self {
            storage_root: base.clone(),
            content_root: base.join("content"),
            cache_root: base.join("cache"),
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::default(),
            log_to_file: false,
            log_path: PathBuf::from("oxidized-xenon.log"),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from an explicit path, creating it if missing
    pub fn load_from(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<(), Box<dyn std::error::Error>> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to an explicit path
    pub fn save_to(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Directory holding the configuration and per-title overrides
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("oxidized-xenon")
    }

    /// Apply per-title overrides from `<config_dir>/games/<title_id>.toml`.
    ///
    /// A missing file is not an error. Returns whether an override file
    /// was found and applied.
    pub fn load_title_config(
        &mut self,
        config_dir: &Path,
        title_id: &str,
    ) -> Result<bool, Box<dyn std::error::Error>> {
        let path = config_dir.join("games").join(format!("{}.toml", title_id));
        if !path.exists() {
            return Ok(false);
        }

        let content = std::fs::read_to_string(&path)?;
        let overrides: TitleConfig = toml::from_str(&content)?;
        self.apply_title_config(&overrides);

        tracing::info!("Loaded per-title configuration from {}", path.display());
        Ok(true)
    }

    /// Merge per-title overrides into this configuration
    pub fn apply_title_config(&mut self, overrides: &TitleConfig) {
        if let Some(module) = &overrides.launch_module {
            self.general.launch_module = module.clone();
        }
        if let Some(apply) = overrides.apply_patches {
            self.general.apply_patches = apply;
        }
        if let Some(scalar) = overrides.time_scalar {
            self.general.time_scalar = scalar;
        }
        if let Some(cache) = overrides.shader_cache {
            self.gpu.shader_cache = cache;
        }
        if let Some(enable) = overrides.audio_enable {
            self.audio.enable = enable;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.general.launch_module.is_empty());
        assert!(config.general.apply_patches);
        assert_eq!(config.general.time_scalar, 1.0);
        assert_eq!(config.cpu.backend, CpuBackend::Any);
        assert!(config.audio.enable);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.general.launch_module = "alt.xex".to_string();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.general.launch_module, "alt.xex");
    }

    #[test]
    fn test_title_config_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("games")).unwrap();
        std::fs::write(
            dir.path().join("games").join("4D5307E6.toml"),
            "apply_patches = false\ntime_scalar = 2.0\n",
        )
        .unwrap();

        let mut config = Config::default();
        assert!(config.load_title_config(dir.path(), "4D5307E6").unwrap());
        assert!(!config.general.apply_patches);
        assert_eq!(config.general.time_scalar, 2.0);

        assert!(!config.load_title_config(dir.path(), "00000000").unwrap());
    }
}
