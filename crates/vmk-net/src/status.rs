//! Return-status taxonomy and error types.
//!
//! Every fallible operation in the switching core reports one of a closed set
//! of status codes. [`NetError`] carries the code together with a message so
//! that administrative callers can log something useful, while data-path
//! callers only look at [`NetError::status`].

use std::fmt;
use thiserror::Error;

/// Result type alias for switching operations.
pub type NetResult<T> = Result<T, NetError>;

/// Closed set of status codes reported by the switching core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReturnStatus {
    /// Success
    Ok,
    /// Generic failure
    Failure,
    /// Name lookup miss
    NotFound,
    /// Name already in use
    Exists,
    /// Resource already claimed
    Busy,
    /// No free slot in a fixed-size table
    NoResources,
    /// Allocation failure
    NoMemory,
    /// No free handle left
    NoFreeHandles,
    /// Fixed capacity reached
    LimitExceeded,
    /// Malformed request
    BadParam,
    /// Stale or malformed handle
    InvalidHandle,
    /// Port is not connected
    IsDisconnected,
    /// Operation not implemented by this policy
    NotImplemented,
}

impl ReturnStatus {
    /// Returns true for `Ok`.
    pub fn is_ok(&self) -> bool {
        matches!(self, ReturnStatus::Ok)
    }

    /// Returns true if the condition is transient and the caller may retry
    /// the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReturnStatus::NotFound
                | ReturnStatus::NoResources
                | ReturnStatus::NoMemory
                | ReturnStatus::NoFreeHandles
        )
    }

    /// Stable upper-case name used in control-protocol replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Ok => "OK",
            ReturnStatus::Failure => "FAILURE",
            ReturnStatus::NotFound => "NOT_FOUND",
            ReturnStatus::Exists => "EXISTS",
            ReturnStatus::Busy => "BUSY",
            ReturnStatus::NoResources => "NO_RESOURCES",
            ReturnStatus::NoMemory => "NO_MEMORY",
            ReturnStatus::NoFreeHandles => "NO_FREE_HANDLES",
            ReturnStatus::LimitExceeded => "LIMIT_EXCEEDED",
            ReturnStatus::BadParam => "BAD_PARAM",
            ReturnStatus::InvalidHandle => "INVALID_HANDLE",
            ReturnStatus::IsDisconnected => "IS_DISCONNECTED",
            ReturnStatus::NotImplemented => "NOT_IMPLEMENTED",
        }
    }
}

impl fmt::Display for ReturnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the switching core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetError {
    /// Generic failure.
    #[error("{message}")]
    Failure {
        /// What went wrong.
        message: String,
    },

    /// A named object does not exist (yet).
    #[error("{what} not found")]
    NotFound {
        /// The missing object.
        what: String,
    },

    /// A named object already exists.
    #[error("{what} already exists")]
    Exists {
        /// The duplicate object.
        what: String,
    },

    /// A resource is already claimed.
    #[error("{what} is busy")]
    Busy {
        /// The claimed resource.
        what: String,
    },

    /// No free slot in a fixed-size table.
    #[error("no resources: {message}")]
    NoResources {
        /// Which table ran out.
        message: String,
    },

    /// Allocation failure.
    #[error("out of memory: {message}")]
    NoMemory {
        /// Which allocation failed.
        message: String,
    },

    /// No free handle left.
    #[error("no free handles: {message}")]
    NoFreeHandles {
        /// Which handle space ran out.
        message: String,
    },

    /// A fixed capacity was reached.
    #[error("limit exceeded: {message}")]
    LimitExceeded {
        /// Which limit.
        message: String,
    },

    /// Malformed request.
    #[error("bad parameter: {message}")]
    BadParam {
        /// Why the request was rejected.
        message: String,
    },

    /// Stale or malformed port handle.
    #[error("invalid handle 0x{port_id:08x}")]
    InvalidHandle {
        /// The rejected port ID.
        port_id: u32,
    },

    /// Port is not connected.
    #[error("port 0x{port_id:08x} is disconnected")]
    IsDisconnected {
        /// The port ID.
        port_id: u32,
    },

    /// Operation not implemented by the active policy.
    #[error("not implemented: {what}")]
    NotImplemented {
        /// The missing operation.
        what: String,
    },
}

impl NetError {
    /// Creates a generic failure.
    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates an already-exists error.
    pub fn exists(what: impl Into<String>) -> Self {
        Self::Exists { what: what.into() }
    }

    /// Creates a busy error.
    pub fn busy(what: impl Into<String>) -> Self {
        Self::Busy { what: what.into() }
    }

    /// Creates a no-resources error.
    pub fn no_resources(message: impl Into<String>) -> Self {
        Self::NoResources {
            message: message.into(),
        }
    }

    /// Creates a limit-exceeded error.
    pub fn limit_exceeded(message: impl Into<String>) -> Self {
        Self::LimitExceeded {
            message: message.into(),
        }
    }

    /// Creates a bad-parameter error.
    pub fn bad_param(message: impl Into<String>) -> Self {
        Self::BadParam {
            message: message.into(),
        }
    }

    /// Creates a not-implemented error.
    pub fn not_implemented(what: impl Into<String>) -> Self {
        Self::NotImplemented { what: what.into() }
    }

    /// Maps the error onto its status code.
    pub fn status(&self) -> ReturnStatus {
        match self {
            NetError::Failure { .. } => ReturnStatus::Failure,
            NetError::NotFound { .. } => ReturnStatus::NotFound,
            NetError::Exists { .. } => ReturnStatus::Exists,
            NetError::Busy { .. } => ReturnStatus::Busy,
            NetError::NoResources { .. } => ReturnStatus::NoResources,
            NetError::NoMemory { .. } => ReturnStatus::NoMemory,
            NetError::NoFreeHandles { .. } => ReturnStatus::NoFreeHandles,
            NetError::LimitExceeded { .. } => ReturnStatus::LimitExceeded,
            NetError::BadParam { .. } => ReturnStatus::BadParam,
            NetError::InvalidHandle { .. } => ReturnStatus::InvalidHandle,
            NetError::IsDisconnected { .. } => ReturnStatus::IsDisconnected,
            NetError::NotImplemented { .. } => ReturnStatus::NotImplemented,
        }
    }

    /// Returns true if the error is a not-found miss.
    pub fn is_not_found(&self) -> bool {
        matches!(self, NetError::NotFound { .. })
    }

    /// Returns true if the caller may retry later.
    pub fn is_retryable(&self) -> bool {
        self.status().is_retryable()
    }
}

/// Collapses a result into its status code.
pub fn status_of<T>(result: &NetResult<T>) -> ReturnStatus {
    match result {
        Ok(_) => ReturnStatus::Ok,
        Err(e) => e.status(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NetError::not_found("uplink vmnic3");
        assert_eq!(err.to_string(), "uplink vmnic3 not found");

        let err = NetError::InvalidHandle { port_id: 0x8000_0003 };
        assert_eq!(err.to_string(), "invalid handle 0x80000003");
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(NetError::failure("x").status(), ReturnStatus::Failure);
        assert_eq!(NetError::exists("bond0").status(), ReturnStatus::Exists);
        assert_eq!(NetError::bad_param("argc").status(), ReturnStatus::BadParam);
        assert_eq!(
            NetError::IsDisconnected { port_id: 1 }.status(),
            ReturnStatus::IsDisconnected
        );
        assert_eq!(status_of::<()>(&Ok(())), ReturnStatus::Ok);
    }

    #[test]
    fn test_is_retryable() {
        assert!(NetError::not_found("vmnic0").is_retryable());
        assert!(NetError::no_resources("ports").is_retryable());
        assert!(!NetError::bad_param("verb").is_retryable());
        assert!(!NetError::failure("cycle").is_retryable());
    }

    #[test]
    fn test_status_names() {
        assert_eq!(ReturnStatus::NotFound.to_string(), "NOT_FOUND");
        assert_eq!(ReturnStatus::BadParam.as_str(), "BAD_PARAM");
        assert!(ReturnStatus::Ok.is_ok());
    }
}
