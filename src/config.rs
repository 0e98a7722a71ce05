//! Decoder configuration.
//!
//! Everything has a usable default; JSON documents only need to name the
//! fields they change.

use serde::{Deserialize, Serialize};

use crate::error::{DecodeBudget, MachscopeError, Result};
use crate::io::IOLimits;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeConfig {
    /// File access limits
    pub io: IOConfig,
    /// Decoder work limits
    pub decode: DecodeBudget,
}

/// File access configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IOConfig {
    /// Largest file that will be mapped
    pub max_file_size: u64,
}

impl Default for IOConfig {
    fn default() -> Self {
        Self {
            max_file_size: IOLimits::default().max_file_size,
        }
    }
}

impl IOConfig {
    pub fn limits(&self) -> IOLimits {
        IOLimits {
            max_file_size: self.max_file_size,
        }
    }
}

impl DecodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject limits that would make every decode fail
    pub fn validate(&self) -> Result<()> {
        let zero = |name: &str| Err(MachscopeError::Config(format!("{name} must be non-zero")));
        if self.io.max_file_size == 0 {
            return zero("io.max_file_size");
        }
        if self.decode.max_trie_depth == 0 {
            return zero("decode.max_trie_depth");
        }
        if self.decode.max_actions == 0 {
            return zero("decode.max_actions");
        }
        if self.decode.max_load_commands == 0 {
            return zero("decode.max_load_commands");
        }
        Ok(())
    }
}
