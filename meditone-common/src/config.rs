//! Configuration loading and root folder resolution
//!
//! Bootstrap configuration comes from a single TOML file. Every section is
//! optional; the service crates fill gaps from environment variables and
//! built-in defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable naming an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "MEDITONE_CONFIG";

/// Environment variable naming the root folder
pub const ROOT_FOLDER_ENV_VAR: &str = "MEDITONE_ROOT_FOLDER";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder holding the database and scratch space
    pub root_folder: Option<PathBuf>,

    /// HTTP listen port
    pub port: Option<u16>,

    /// Number of queue workers
    pub workers: Option<usize>,

    pub logging: LoggingConfig,
    pub openai: OpenAiSection,
    pub elevenlabs: ElevenLabsSection,
    pub suno: SunoSection,
    pub google_drive: GoogleDriveSection,
    pub audio: AudioSection,
    pub mix: MixSection,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Text generation collaborator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
}

/// Voice synthesis collaborator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ElevenLabsSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    /// PCM sample rate requested from the service (Hz)
    pub sample_rate: Option<u32>,
}

/// Music generation collaborator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SunoSection {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub callback_url: Option<String>,
    pub webhook_token: Option<String>,
    pub model: Option<String>,
}

/// Object storage collaborator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GoogleDriveSection {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub folder_id: Option<String>,
    /// Sub-folder (found or created under `folder_id`) receiving uploads
    pub folder_name: Option<String>,
}

/// Media tool settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSection {
    pub ffmpeg_bin: Option<String>,
    pub ffprobe_bin: Option<String>,
    /// Voice duration used when probing fails twice. Absent means fail.
    pub duration_fallback_secs: Option<f64>,
    /// Mixing subprocess timeout (seconds)
    pub mix_timeout_secs: Option<u64>,
}

/// Mix parameters for a pipeline run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MixSection {
    pub offset_ms: Option<u64>,
    pub tail_ms: Option<u64>,
    pub voice_volume: Option<f64>,
    pub music_volume: Option<f64>,
    pub fade_out: Option<bool>,
    pub fade_ms: Option<u64>,
    pub format: Option<String>,
}

/// Load and parse a TOML configuration file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    parse_toml_config(&content)
}

/// Parse TOML configuration text
pub fn parse_toml_config(content: &str) -> Result<TomlConfig> {
    toml::from_str(content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
}

/// Locate the configuration file
///
/// Priority:
/// 1. Command-line argument
/// 2. `MEDITONE_CONFIG` environment variable
/// 3. `<platform config dir>/meditone/meditone.toml` if it exists
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir()
        .map(|d| d.join("meditone").join("meditone.toml"))
        .filter(|p| p.exists())
}

/// Load configuration from the resolved path, or defaults when none exists
pub fn load_or_default(cli_arg: Option<&Path>) -> Result<TomlConfig> {
    match resolve_config_path(cli_arg) {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        None => {
            debug!("No configuration file found, using defaults");
            Ok(TomlConfig::default())
        }
    }
}

/// Root folder resolution
///
/// Priority:
/// 1. Command-line argument
/// 2. `MEDITONE_ROOT_FOLDER` environment variable
/// 3. TOML `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(cli_arg: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(ROOT_FOLDER_ENV_VAR) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("meditone"))
        .unwrap_or_else(|| PathBuf::from("./meditone_data"))
}

/// Paths derived from the root folder
#[derive(Debug, Clone)]
pub struct RootLayout {
    pub root: PathBuf,
    pub database_path: PathBuf,
    /// Scratch space for stage hand-off files
    pub temp_dir: PathBuf,
}

impl RootLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            database_path: root.join("meditone.db"),
            temp_dir: root.join("tmp"),
            root,
        }
    }

    /// Create the root and temp directories if missing
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.temp_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = parse_toml_config("").unwrap();
        assert!(config.root_folder.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.mix.voice_volume.is_none());
    }

    #[test]
    fn test_parse_sections() {
        let config = parse_toml_config(
            r#"
            port = 8080

            [logging]
            level = "debug"

            [suno]
            api_key = "suno-key"
            webhook_token = "secret"

            [audio]
            duration_fallback_secs = 60.0

            [mix]
            voice_volume = 0.9
            format = "wav"
            "#,
        )
        .unwrap();

        assert_eq!(config.port, Some(8080));
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.suno.api_key.as_deref(), Some("suno-key"));
        assert_eq!(config.suno.webhook_token.as_deref(), Some("secret"));
        assert_eq!(config.audio.duration_fallback_secs, Some(60.0));
        assert_eq!(config.mix.voice_volume, Some(0.9));
        assert_eq!(config.mix.format.as_deref(), Some("wav"));
    }

    #[test]
    fn test_parse_invalid_toml_is_config_error() {
        let err = parse_toml_config("port = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    #[serial]
    fn test_root_folder_cli_wins() {
        std::env::set_var(ROOT_FOLDER_ENV_VAR, "/from/env");
        let config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        let root = resolve_root_folder(Some(Path::new("/from/cli")), &config);
        std::env::remove_var(ROOT_FOLDER_ENV_VAR);
        assert_eq!(root, PathBuf::from("/from/cli"));
    }

    #[test]
    #[serial]
    fn test_root_folder_env_beats_toml() {
        std::env::set_var(ROOT_FOLDER_ENV_VAR, "/from/env");
        let config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        let root = resolve_root_folder(None, &config);
        std::env::remove_var(ROOT_FOLDER_ENV_VAR);
        assert_eq!(root, PathBuf::from("/from/env"));
    }

    #[test]
    #[serial]
    fn test_root_folder_toml_fallback() {
        std::env::remove_var(ROOT_FOLDER_ENV_VAR);
        let config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        assert_eq!(resolve_root_folder(None, &config), PathBuf::from("/from/toml"));
    }

    #[test]
    fn test_root_layout_creates_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let layout = RootLayout::new(dir.path().join("root"));
        layout.ensure_directories().unwrap();
        assert!(layout.temp_dir.is_dir());
        assert_eq!(layout.database_path, dir.path().join("root").join("meditone.db"));
    }
}
