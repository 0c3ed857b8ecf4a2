use crate::pool::UnitId;
use thiserror::Error;

/// Unified error type for the pool API surface
#[derive(Debug, Error)]
pub enum ParallelError {
    /// Dispatch against a pool with no usable execution unit
    #[error("No workers available in pool '{namespace}'")]
    NoWorkersAvailable { namespace: String },

    /// A pool is already registered under this namespace
    #[error("Pool namespace already registered: {namespace}")]
    DuplicateNamespace { namespace: String },

    /// Lookup of a namespace that has no pool
    #[error("Pool not found: {namespace}")]
    PoolNotFound { namespace: String },

    /// `send` after `end_of_input`
    #[error("Input already ended for pool '{namespace}'")]
    InputEnded { namespace: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Serialization errors on the caller side of the boundary
    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors (config files, unit thread spawning)
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Pool operations that need a tokio runtime were called outside one
    #[error("Runtime unavailable: {message}")]
    Runtime { message: String },

    /// Generic internal errors
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

impl ParallelError {
    pub fn no_workers<S: Into<String>>(namespace: S) -> Self {
        Self::NoWorkersAvailable {
            namespace: namespace.into(),
        }
    }

    pub fn duplicate_namespace<S: Into<String>>(namespace: S) -> Self {
        Self::DuplicateNamespace {
            namespace: namespace.into(),
        }
    }

    pub fn pool_not_found<S: Into<String>>(namespace: S) -> Self {
        Self::PoolNotFound {
            namespace: namespace.into(),
        }
    }

    pub fn input_ended<S: Into<String>>(namespace: S) -> Self {
        Self::InputEnded {
            namespace: namespace.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error
    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn runtime<S: Into<String>>(message: S) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NoWorkersAvailable { .. } => "no_workers",
            Self::DuplicateNamespace { .. } => "duplicate_namespace",
            Self::PoolNotFound { .. } => "pool_not_found",
            Self::InputEnded { .. } => "input_ended",
            Self::Configuration { .. } => "configuration",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Runtime { .. } => "runtime",
            Self::Internal { .. } => "internal",
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, ParallelError>;

impl From<std::io::Error> for ParallelError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for ParallelError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for ParallelError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

impl From<bincode::Error> for ParallelError {
    fn from(err: bincode::Error) -> Self {
        Self::serialization("bincode", err)
    }
}

impl From<anyhow::Error> for ParallelError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal(format!("{:#}", err))
    }
}

/// Per-payload and per-unit failures.
///
/// These travel through the pool's event stream next to successful results,
/// so they are cloneable and carry rendered messages instead of sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// Context initializer failed when the unit started; the unit is unusable
    #[error("Worker bootstrap failed on unit {unit}: {message}")]
    Bootstrap { unit: UnitId, message: String },

    /// Handler returned an error or panicked; the unit stays usable
    #[error("Handler failed on unit {unit}: {message}")]
    Runtime { unit: UnitId, message: String },

    /// Unit terminated unexpectedly
    #[error("Unit {unit} exited: {reason}")]
    Exit { unit: UnitId, reason: String },

    /// Payload or result failed to deserialize
    #[error("Decode failed on unit {unit} ({format}): {message}")]
    Decode {
        unit: UnitId,
        format: String,
        message: String,
    },

    /// Payload was accepted but every unit was lost before it could be flushed
    #[error("No workers available to take payload: {message}")]
    Unavailable { message: String },
}

impl WorkerError {
    /// Stable tag for the failure kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bootstrap { .. } => "WorkerBootstrapFailure",
            Self::Runtime { .. } => "WorkerRuntimeError",
            Self::Exit { .. } => "WorkerExit",
            Self::Decode { .. } => "DecodeError",
            Self::Unavailable { .. } => "NoWorkersAvailable",
        }
    }

    /// Unit the failure happened on, if any
    pub fn unit(&self) -> Option<UnitId> {
        match self {
            Self::Bootstrap { unit, .. }
            | Self::Runtime { unit, .. }
            | Self::Exit { unit, .. }
            | Self::Decode { unit, .. } => Some(*unit),
            Self::Unavailable { .. } => None,
        }
    }
}
