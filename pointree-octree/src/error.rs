use crate::node::NodeId;

/// Everything that can go wrong while building, merging or querying point cloud octrees.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input, e.g. a point batch without positions.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal consistency check failed.
    ///
    /// Never recovered from, since continuing would corrupt the immutable index.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The node lifecycle was misused, e.g. merging a durable node.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A serialized filter carried a `Type` tag that is not known.
    #[error("unknown filter type: '{0}'")]
    UnknownFilterType(String),

    /// The operation does not make sense for derived data such as filtered views.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The import was cancelled through its configuration.
    #[error("import was cancelled")]
    Cancelled,

    /// A referenced node is missing from storage.
    #[error("node {0} not found in storage")]
    MissingNode(NodeId),

    #[error("failed to encode or decode a stored record: {0}")]
    Codec(#[from] bincode::Error),

    #[error("failed to encode or decode JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }

    pub(crate) fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation(message.into())
    }
}
