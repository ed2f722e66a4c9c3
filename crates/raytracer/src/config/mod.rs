//! Renderer and application settings on disk
//!
//! Settings files are TOML or RON, chosen by extension. Missing fields take
//! their `Default` values, so a file only has to name what it changes.

use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};

/// On-disk settings syntax
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    /// `.toml`
    Toml,
    /// `.ron`
    Ron,
}

impl ConfigFormat {
    /// Pick the format from a file extension, case-insensitively
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("toml") => Ok(Self::Toml),
            Some("ron") => Ok(Self::Ron),
            _ => Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        }
    }
}

/// Settings that can be read from and written to TOML or RON
pub trait Config: Serialize + DeserializeOwned + Default {
    /// Read and parse a settings file
    fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)?;
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text, format)?;
        log::debug!("Loaded settings from {}", path.display());
        Ok(config)
    }

    /// Parse settings text in the given format
    fn parse(text: &str, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Toml => toml::from_str(text).map_err(|e| ConfigError::Parse {
                format,
                message: e.to_string(),
            }),
            ConfigFormat::Ron => ron::from_str(text).map_err(|e| ConfigError::Parse {
                format,
                message: e.to_string(),
            }),
        }
    }

    /// Pretty-printed settings text
    fn to_text(&self, format: ConfigFormat) -> Result<String, ConfigError> {
        let text = match format {
            ConfigFormat::Toml => toml::to_string_pretty(self).map_err(|e| e.to_string()),
            ConfigFormat::Ron => ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| e.to_string()),
        };
        text.map_err(ConfigError::Serialize)
    }

    /// Write settings in the format named by the extension
    fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = self.to_text(ConfigFormat::from_path(path)?)?;
        std::fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Settings load and save failures
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// File could not be read or written
    #[error("reading or writing {path:?}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying IO failure
        #[source]
        source: std::io::Error,
    },

    /// Text is not valid for its format
    #[error("malformed {format:?} settings: {message}")]
    Parse {
        /// Format the text was parsed as
        format: ConfigFormat,
        /// Parser diagnostic
        message: String,
    },

    /// Values could not be written out
    #[error("settings could not be serialized: {0}")]
    Serialize(String),

    /// Extension is neither `.toml` nor `.ron`
    #[error("no settings format for {0:?}")]
    UnsupportedFormat(PathBuf),

    /// Values parsed but are out of range
    #[error("invalid settings: {0}")]
    Invalid(String),
}
