//! Error types for machscope.
//!
//! Format-level failures live in [`MachOError`] and file access failures in
//! [`IoError`]; [`MachscopeError`] wraps both for callers that go from a path
//! to decoded results in one step.

use std::fmt;
use thiserror::Error;

use crate::formats::macho::MachOError;
use crate::io::error::IoError;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum MachscopeError {
    /// Malformed Mach-O or fat data
    #[error("Mach-O error: {0}")]
    MachO(#[from] MachOError),

    /// Opening or mapping the input failed
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Configuration (de)serialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input is neither a thin Mach-O nor a fat archive
    #[error("Unrecognized input format (magic {magic:#010x})")]
    UnrecognizedFormat { magic: u32 },
}

/// Result type alias for top-level operations
pub type Result<T> = std::result::Result<T, MachscopeError>;

/// Work limits applied while decoding one image
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DecodeBudget {
    /// Export trie nesting ceiling
    pub max_trie_depth: usize,
    /// Actions produced per bind or rebase stream
    pub max_actions: usize,
    /// Load commands accepted per image
    pub max_load_commands: u32,
}

impl Default for DecodeBudget {
    fn default() -> Self {
        Self {
            max_trie_depth: 128,
            max_actions: 10_000_000,
            max_load_commands: 65_536,
        }
    }
}

impl fmt::Display for DecodeBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Budget: trie depth {}, {} actions, {} load commands",
            self.max_trie_depth, self.max_actions, self.max_load_commands
        )
    }
}
