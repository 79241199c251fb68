//! Typed error taxonomy for pipelines, stores, and the answer service.
//!
//! Adapters and node bodies work with [`anyhow::Result`]; the variants here
//! are the failures callers are expected to match on. A node failure keeps
//! its original cause, which [`Error::node_cause`] recovers when that cause
//! was itself one of these variants.

/// Result type for pipeline and service operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The MDL string is not JSON, not an object, or has malformed collections.
    #[error("invalid MDL: {0}")]
    InvalidSchema(String),

    /// A node or pipeline input could not be resolved.
    #[error("node '{node}' depends on '{name}', which is neither a node nor a supplied input")]
    MissingDependency { node: String, name: String },

    #[error("node '{0}' is registered more than once")]
    DuplicateNode(String),

    #[error("pipeline graph contains a cycle through: {}", .0.join(", "))]
    CyclicGraph(Vec<String>),

    /// A node body returned an error; the run was aborted.
    #[error("node '{node}' failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: anyhow::Error,
    },

    /// The LLM reply was not the expected `{reasoning, answer}` object.
    #[error("could not parse generation output: {0}")]
    GenerationParse(String),

    #[error("document store operation failed: {0}")]
    StoreOperation(String),

    #[error("{0} is not found")]
    NotFound(String),
}

impl Error {
    /// Returns the typed cause of a [`Error::NodeFailed`], if the node
    /// failed with one of this module's errors.
    pub fn node_cause(&self) -> Option<&Error> {
        match self {
            Error::NodeFailed { source, .. } => source.downcast_ref::<Error>(),
            _ => None,
        }
    }

    /// The node that aborted the run, for [`Error::NodeFailed`].
    pub fn failed_node(&self) -> Option<&str> {
        match self {
            Error::NodeFailed { node, .. } => Some(node),
            _ => None,
        }
    }
}
