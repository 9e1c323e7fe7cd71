use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use vesper_audio::StagingPolicy;
use vesper_types::{SoundcardFormat, StagingProgram};

const DEFAULT_CONFIG: &str = include_str!("../config.toml");

const SAMPLERATE_RANGE: (u32, u32) = (8_000, 192_000);
const BUFFER_SIZE_RANGE: (u32, u32) = (16, 8_192);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    audio: AudioConfig,
    #[serde(default)]
    plugins: PluginsConfig,
    #[serde(default)]
    staging: StagingConfig,
}

#[derive(Deserialize, Default)]
struct AudioConfig {
    samplerate: Option<u32>,
    buffer_size: Option<u32>,
    format: Option<String>,
    overclock: Option<u32>,
    realtime_safe: Option<bool>,
}

#[derive(Deserialize, Default)]
struct PluginsConfig {
    ladspa_path: Option<Vec<PathBuf>>,
    dssi_path: Option<Vec<PathBuf>>,
    vst3_path: Option<Vec<PathBuf>>,
}

#[derive(Deserialize, Default)]
struct StagingConfig {
    program: Option<Vec<String>>,
}

/// Engine settings: embedded defaults with the user's file layered on top.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    samplerate: u32,
    buffer_size: u32,
    format: SoundcardFormat,
    overclock: u32,
    realtime_safe: bool,
    ladspa_path: Vec<PathBuf>,
    dssi_path: Vec<PathBuf>,
    vst3_path: Vec<PathBuf>,
    program: StagingProgram,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::resolve(base_file())
    }
}

impl EngineConfig {
    /// Defaults, overridden by the user config if one exists. A malformed or
    /// unreadable user file is logged and ignored.
    pub fn load() -> Self {
        let Some(path) = user_config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => {
                log::info!(target: "core::config", "loaded {}", path.display());
                config
            }
            Err(e) => {
                log::warn!(target: "core::config", "ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    /// Defaults overridden by the file at `path`.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Defaults overridden by the keys present in `contents`.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let user: ConfigFile = toml::from_str(contents)?;
        let mut base = base_file();
        merge_audio(&mut base.audio, user.audio);
        merge_plugins(&mut base.plugins, user.plugins);
        if user.staging.program.is_some() {
            base.staging.program = user.staging.program;
        }
        Ok(Self::resolve(base))
    }

    fn resolve(file: ConfigFile) -> Self {
        let fallback_format = SoundcardFormat::default();
        let format = match file.audio.format.as_deref() {
            Some(name) => SoundcardFormat::from_name(name).unwrap_or_else(|| {
                log::warn!(target: "core::config", "unknown sample format '{}'", name);
                fallback_format
            }),
            None => fallback_format,
        };

        let program = match file.staging.program {
            Some(names) if !names.is_empty() => {
                StagingProgram::from_names(&names).unwrap_or_else(|e| {
                    log::warn!(target: "core::config", "{}; using the default program", e);
                    StagingProgram::default()
                })
            }
            _ => StagingProgram::default(),
        };

        Self {
            samplerate: file
                .audio
                .samplerate
                .unwrap_or(44_100)
                .clamp(SAMPLERATE_RANGE.0, SAMPLERATE_RANGE.1),
            buffer_size: file
                .audio
                .buffer_size
                .unwrap_or(512)
                .clamp(BUFFER_SIZE_RANGE.0, BUFFER_SIZE_RANGE.1),
            format,
            overclock: file.audio.overclock.unwrap_or(0),
            realtime_safe: file.audio.realtime_safe.unwrap_or(false),
            ladspa_path: file.plugins.ladspa_path.unwrap_or_default(),
            dssi_path: file.plugins.dssi_path.unwrap_or_default(),
            vst3_path: file.plugins.vst3_path.unwrap_or_default(),
            program,
        }
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn format(&self) -> SoundcardFormat {
        self.format
    }

    pub fn overclock(&self) -> u32 {
        self.overclock
    }

    pub fn realtime_safe(&self) -> bool {
        self.realtime_safe
    }

    pub fn staging_policy(&self) -> StagingPolicy {
        if self.realtime_safe {
            StagingPolicy::RealtimeSafe
        } else {
            StagingPolicy::NonRealtime
        }
    }

    /// Extra LADSPA directories, searched before the standard ones.
    pub fn ladspa_path(&self) -> &[PathBuf] {
        &self.ladspa_path
    }

    pub fn dssi_path(&self) -> &[PathBuf] {
        &self.dssi_path
    }

    pub fn vst3_path(&self) -> &[PathBuf] {
        &self.vst3_path
    }

    pub fn program(&self) -> &StagingProgram {
        &self.program
    }
}

fn base_file() -> ConfigFile {
    toml::from_str(DEFAULT_CONFIG).unwrap_or_else(|e| {
        log::error!(target: "core::config", "embedded config.toml is malformed: {}", e);
        ConfigFile::default()
    })
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("vesper").join("config.toml"))
}

fn merge_audio(base: &mut AudioConfig, user: AudioConfig) {
    if user.samplerate.is_some() {
        base.samplerate = user.samplerate;
    }
    if user.buffer_size.is_some() {
        base.buffer_size = user.buffer_size;
    }
    if user.format.is_some() {
        base.format = user.format;
    }
    if user.overclock.is_some() {
        base.overclock = user.overclock;
    }
    if user.realtime_safe.is_some() {
        base.realtime_safe = user.realtime_safe;
    }
}

fn merge_plugins(base: &mut PluginsConfig, user: PluginsConfig) {
    if user.ladspa_path.is_some() {
        base.ladspa_path = user.ladspa_path;
    }
    if user.dssi_path.is_some() {
        base.dssi_path = user.dssi_path;
    }
    if user.vst3_path.is_some() {
        base.vst3_path = user.vst3_path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vesper_types::StagingStage;

    #[test]
    fn embedded_defaults_parse() {
        let config = EngineConfig::default();
        assert_eq!(config.samplerate(), 44_100);
        assert_eq!(config.buffer_size(), 512);
        assert_eq!(config.format(), SoundcardFormat::Signed16);
        assert_eq!(config.overclock(), 0);
        assert_eq!(config.staging_policy(), StagingPolicy::NonRealtime);
        assert_eq!(config.program(), &StagingProgram::default());
        assert!(config.ladspa_path().is_empty());
    }

    #[test]
    fn user_keys_override_field_by_field() {
        let config = EngineConfig::from_toml_str(
            r#"
            [audio]
            buffer_size = 256
            format = "float"

            [plugins]
            ladspa_path = ["/opt/ladspa"]
            "#,
        )
        .unwrap();
        assert_eq!(config.buffer_size(), 256);
        assert_eq!(config.format(), SoundcardFormat::Float);
        assert_eq!(config.samplerate(), 44_100);
        assert_eq!(config.ladspa_path(), &[PathBuf::from("/opt/ladspa")]);
        assert!(config.dssi_path().is_empty());
    }

    #[test]
    fn sizes_are_clamped() {
        let config = EngineConfig::from_toml_str(
            "[audio]\nbuffer_size = 4\nsamplerate = 1000000\n",
        )
        .unwrap();
        assert_eq!(config.buffer_size(), 16);
        assert_eq!(config.samplerate(), 192_000);
    }

    #[test]
    fn bad_values_fall_back() {
        let config = EngineConfig::from_toml_str(
            "[audio]\nformat = \"mp3\"\n[staging]\nprogram = [\"run-pre\", \"warp\"]\n",
        )
        .unwrap();
        assert_eq!(config.format(), SoundcardFormat::Signed16);
        assert_eq!(config.program(), &StagingProgram::default());
    }

    #[test]
    fn custom_program() {
        let config =
            EngineConfig::from_toml_str("[staging]\nprogram = [\"run-pre\", \"run_post\"]\n")
                .unwrap();
        assert_eq!(
            config.program().stages(),
            &[StagingStage::RunPre, StagingStage::RunPost]
        );
    }

    #[test]
    fn malformed_text_is_an_error() {
        assert!(matches!(
            EngineConfig::from_toml_str("[audio\nsamplerate = "),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            EngineConfig::from_toml_str("[audio]\nsamplerate = \"fast\"\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
