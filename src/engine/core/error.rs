use std::path::PathBuf;
use thiserror::Error;

use super::state::Phase;
use crate::config::ConfigError;

/// Engine-level errors. Scan problems are `ScanWarning`s and never fatal;
/// per-job problems become job states at the worker boundary. Only the
/// control and pre-batch variants reach callers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no free output name for {} after {attempts} attempts", path.display())]
    Collision { path: PathBuf, attempts: u32 },

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("input directory {} is not readable: {message}", path.display())]
    InputRoot { path: PathBuf, message: String },

    #[error("encoder unavailable: {0}")]
    EncoderUnavailable(String),

    #[error("cannot {action} while batch is {phase}")]
    InvalidTransition { action: &'static str, phase: Phase },

    #[error("configuration is locked while a batch is active")]
    ConfigLocked,

    #[error("batch has not been started")]
    NotStarted,

    #[error("engine aggregator is no longer running")]
    Disconnected,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
