use thiserror::Error;

/// Broad class of a [`GraphError`].
///
/// Numeric problems (a branch producing a non-finite contribution) are not
/// errors at all: they surface as an invalid aggregate that the driver rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The model graph is malformed. Detected at construction or at the first
    /// evaluation and never retried.
    Configuration,
    /// The graph was driven in a way the protocol does not allow.
    Usage,
}

#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("`{model}` received a change event from an unregistered source `{source_name}`")]
    UnknownSource { model: String, source_name: String },

    #[error("a listener of `{0}` was dropped before the graph was torn down")]
    DanglingListener(String),

    #[error("`{0}` is already borrowed; the model graph was re-entered during dispatch or evaluation")]
    Reentrant(String),

    #[error("`{0}` is sealed; dependencies can only be added during graph construction")]
    Sealed(String),

    #[error("`{0}` was evaluated before graph construction completed")]
    NotSealed(String),

    #[error("`{0}` has no evaluated values; call evaluate first")]
    NotEvaluated(String),

    #[error("`{model}`: {message}")]
    Configuration { model: String, message: String },

    #[error("`{0}` was stored twice without an intervening restore or accept")]
    AlreadyStored(String),

    #[error("`{0}` was restored or accepted without a matching store")]
    NotStored(String),

    #[error("`{name}`: index {index} out of range for dimension {dim}")]
    IndexOutOfRange {
        name: String,
        index: usize,
        dim: usize,
    },

    #[error("invalid tree: {0}")]
    InvalidTree(String),

    #[error("full evaluation of `{model}` gave {full} but the cached value was {cached}")]
    EvaluationMismatch { model: String, cached: f64, full: f64 },
}

impl GraphError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::UnknownSource { .. }
            | GraphError::DanglingListener(_)
            | GraphError::Configuration { .. }
            | GraphError::InvalidTree(_)
            | GraphError::EvaluationMismatch { .. } => ErrorKind::Configuration,
            GraphError::Reentrant(_)
            | GraphError::Sealed(_)
            | GraphError::NotSealed(_)
            | GraphError::NotEvaluated(_)
            | GraphError::AlreadyStored(_)
            | GraphError::NotStored(_)
            | GraphError::IndexOutOfRange { .. } => ErrorKind::Usage,
        }
    }

    pub(crate) fn configuration(model: &str, message: impl Into<String>) -> Self {
        GraphError::Configuration {
            model: model.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
