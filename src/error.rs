//! Unified error handling for artscope
//!
//! Most failures in this crate are expected negative results (a library that
//! is not mapped, a symbol that is not exported) and travel as `Option`s.
//! The variants below cover the cases that are reported back to a caller.

use std::io;
use thiserror::Error;

/// Main error type for artscope operations
#[derive(Debug, Error)]
pub enum ArtscopeError {
    /// No executable mapping matched the library name
    #[error("Library '{0}' is not mapped")]
    LibraryNotMapped(String),

    /// None of the symbol candidates were exported by the library
    #[error("No symbol candidate found in {library}: {candidates:?}")]
    SymbolNotFound {
        library: String,
        candidates: Vec<String>,
    },

    /// The on-disk library could not be parsed as ELF
    #[error("Failed to parse ELF file '{path}': {reason}")]
    ElfParse { path: String, reason: String },

    /// The platform loader refused a plugin
    #[error("Failed to load plugin '{path}': {reason}")]
    PluginLoad { path: String, reason: String },

    /// A plugin's init function returned non-zero
    #[error("Plugin '{name}' init returned {status}")]
    PluginInit { name: String, status: i32 },

    /// The command registry has no free slot
    #[error("Command registry full ({capacity} entries)")]
    RegistryFull { capacity: usize },

    /// Command names are bounded at compile time
    #[error("Command name '{name}' exceeds {max} bytes")]
    NameTooLong { name: String, max: usize },

    /// The control channel has no live connection
    #[error("Not connected to agent")]
    NotConnected,

    /// Connect, send or receive failed on the control channel
    #[error("Transport error with {target}: {source}")]
    Transport {
        target: String,
        #[source]
        source: io::Error,
    },

    /// A command needing a target process ran before one was set
    #[error("No target PID set")]
    NoTargetPid,

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// File I/O error
    #[error("File I/O error for '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for artscope operations
pub type Result<T> = std::result::Result<T, ArtscopeError>;

impl ArtscopeError {
    /// Expected negative outcomes that callers treat as valid results
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ArtscopeError::LibraryNotMapped(_) | ArtscopeError::SymbolNotFound { .. }
        )
    }

    /// Check if this error is recoverable (can retry)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ArtscopeError::NotConnected | ArtscopeError::Transport { .. } | ArtscopeError::NoTargetPid
        ) || self.is_not_found()
    }

    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            ArtscopeError::NoTargetPid => {
                "No target PID set. Please attach/spawn first.".to_string()
            }
            ArtscopeError::NotConnected | ArtscopeError::Transport { .. } => {
                "Failed to connect to agent".to_string()
            }
            ArtscopeError::RegistryFull { capacity } => {
                format!("Command registry full ({capacity} commands); registration dropped")
            }
            _ => self.to_string(),
        }
    }

    pub fn from_io_error(path: impl Into<String>, error: io::Error) -> Self {
        ArtscopeError::Io {
            path: path.into(),
            source: error,
        }
    }

    pub fn transport(target: impl Into<String>, error: io::Error) -> Self {
        ArtscopeError::Transport {
            target: target.into(),
            source: error,
        }
    }
}
