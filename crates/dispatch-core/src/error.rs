use thiserror::Error;

/// Crate-wide error type. Workers never propagate `EngineFailure` as a panic
/// or a process-ending error — it is downgraded into an `AbortedStore` entry.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine invocation failed: {0}")]
    EngineFailure(String),

    #[error("free system memory below watchdog threshold ({free_kb} KB < {threshold_kb} KB)")]
    OutOfMemory { free_kb: u64, threshold_kb: u64 },

    #[error("shutdown requested")]
    Shutdown,
}

impl DispatchError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        DispatchError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
