//! machscope: read-only Mach-O metadata decoding.
//!
//! The core decoders live in [`formats::macho`]: the segment address space,
//! the export trie walker and the bind/rebase opcode interpreters. The
//! [`analysis`] module strings them together for whole-file summaries.

pub mod analysis;
pub mod config;
pub mod error;
pub mod formats;
pub mod io;
pub mod logging;

pub use config::DecodeConfig;
pub use error::{DecodeBudget, MachscopeError, Result};
pub use formats::macho::MachOParser;
