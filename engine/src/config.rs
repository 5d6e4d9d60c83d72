//! Engine configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it changes.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::limiter::TransferLimiter;
use crate::model::PartialPolicy;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
pub const DEFAULT_TEMP_FILE_NAME: &str = "temp_download";
pub const DEFAULT_AUDIO_EXTENSION: &str = "mp3";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Read buffer size; one chunk is the unit between checkpoints
    pub chunk_size: usize,

    /// Name of the temp artifact inside the destination directory
    pub temp_file_name: String,

    /// Extension given to audio-only artifacts, without the dot
    pub audio_extension: String,

    /// What happens to the temp artifact on cancel
    pub partial_policy: PartialPolicy,

    /// Continue from an existing temp artifact when possible
    pub resume_partial: bool,

    /// User-Agent header for HTTP sources
    pub user_agent: String,

    /// Connect timeout for HTTP sources, in seconds
    pub connect_timeout_secs: u64,

    /// Default limits for requests built from this config
    pub limits: TransferLimiter,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: DEFAULT_CHUNK_SIZE,
            temp_file_name: DEFAULT_TEMP_FILE_NAME.to_string(),
            audio_extension: DEFAULT_AUDIO_EXTENSION.to_string(),
            partial_policy: PartialPolicy::Keep,
            resume_partial: true,
            user_agent: concat!("mediafetch/", env!("CARGO_PKG_VERSION")).to_string(),
            connect_timeout_secs: 30,
            limits: TransferLimiter::default(),
        }
    }
}

impl EngineConfig {
    /// Load and validate a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path).map_err(|e| EngineError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let config: EngineConfig =
            serde_json::from_str(raw).map_err(|e| EngineError::InvalidConfig {
                reason: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let invalid = |reason: &str| {
            Err(EngineError::InvalidConfig {
                reason: reason.to_string(),
            })
        };

        if self.chunk_size == 0 {
            return invalid("chunk_size must be greater than zero");
        }
        if self.temp_file_name.is_empty()
            || self.temp_file_name.contains(['/', '\\'])
            || self.temp_file_name == "."
            || self.temp_file_name == ".."
        {
            return invalid("temp_file_name must be a plain file name");
        }
        if self.audio_extension.is_empty()
            || self.audio_extension.contains(['.', '/', '\\'])
        {
            return invalid("audio_extension must be non-empty and without a dot");
        }
        Ok(())
    }
}
