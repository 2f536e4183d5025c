//! Error types for the host bridge

use std::time::Duration;

use thiserror::Error;

use crate::Version;

/// Host bridge errors
#[derive(Error, Debug)]
pub enum BridgeError {
    // Unsupported requests
    #[error("method not supported")]
    MethodNotSupported,

    #[error("endpoint not supported")]
    EndpointNotSupported,

    // Collaborator failures
    #[error("{op}: {source}")]
    Collaborator {
        op: &'static str,
        #[source]
        source: Box<BridgeError>,
    },

    #[error("light block fetch failure: {0}")]
    LightBlockFetch(#[source] Box<BridgeError>),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    // Malformed data
    #[error("malformed TEE constraints: {0}")]
    MalformedTeeConstraints(String),

    // Host lifecycle errors
    #[error("runtime not available")]
    RuntimeNotAvailable,

    #[error("runtime already provisioned")]
    AlreadyProvisioned,

    #[error("unknown runtime version: {0}")]
    UnknownVersion(Version),

    #[error("no runtime versions configured")]
    NoVersions,

    // Cancellation
    #[error("context canceled")]
    Cancelled,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),
}

impl BridgeError {
    /// Wrap a downstream error with the name of the failed operation.
    pub fn collaborator(op: &'static str, source: BridgeError) -> Self {
        BridgeError::Collaborator {
            op,
            source: Box::new(source),
        }
    }

    /// Innermost error of a wrapped chain.
    pub fn root(&self) -> &BridgeError {
        match self {
            BridgeError::Collaborator { source, .. } => source.root(),
            BridgeError::LightBlockFetch(source) => source.root(),
            other => other,
        }
    }

    /// Whether this is one of the unsupported-request sentinels.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            BridgeError::MethodNotSupported | BridgeError::EndpointNotSupported
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), BridgeError::Cancelled)
    }
}

/// Attach the failed operation's name to a collaborator result.
pub trait ResultExt<T> {
    fn context(self, op: &'static str) -> BridgeResult<T>;
}

impl<T> ResultExt<T> for BridgeResult<T> {
    fn context(self, op: &'static str) -> BridgeResult<T> {
        self.map_err(|e| BridgeError::collaborator(op, e))
    }
}

/// Result type for host bridge operations
pub type BridgeResult<T> = Result<T, BridgeError>;
