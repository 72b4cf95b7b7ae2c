//! Error types for frame delivery and messenger lifecycle operations.
//!
//! Every fallible operation in this crate returns [`CoreError`]. Errors are
//! grouped by *cause* rather than by the component that raised them, so
//! callers can react uniformly:
//!
//! - **InvalidArgument**: malformed input, unmanaged frame handles
//! - **InvalidOperation**: wrong lifecycle state (double init, operate after close)
//! - **NotFound**: unmanaged publisher, unknown sequence number, missing config
//! - **Aborted**: the monitor task could not be started
//! - **TimedOut**: a remote reply did not arrive in time
//! - **Disconnected**: the server connection is gone
//! - **ResourceExhausted**: no frame slot or queue entry available
//! - **Remote**: a failure status carried back in a server reply
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use framelink::{Cause, CoreError};
//!
//! let error = CoreError::timed_out("open publisher", std::time::Duration::from_secs(30));
//! assert_eq!(error.cause(), Cause::TimedOut);
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! ## Call-site tracing
//!
//! [`ResultExt::traced`] records the caller location of a failure as a
//! `tracing` debug event and passes the result through unchanged:
//!
//! ```rust
//! use framelink::{CoreError, ResultExt};
//!
//! fn lookup() -> framelink::Result<u32> {
//!     Err(CoreError::not_found("unmanaged publisher"))
//! }
//!
//! let result = lookup().traced();
//! assert!(result.is_err());
//! ```

use std::panic::Location;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Result type alias for framelink operations.
pub type Result<T, E = CoreError> = std::result::Result<T, E>;

/// Failure cause taxonomy shared by local and remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cause {
    InvalidArgument,
    InvalidOperation,
    NotFound,
    Aborted,
    TimedOut,
    Disconnected,
    ResourceExhausted,
}

impl std::fmt::Display for Cause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cause::InvalidArgument => "invalid argument",
            Cause::InvalidOperation => "invalid operation",
            Cause::NotFound => "not found",
            Cause::Aborted => "aborted",
            Cause::TimedOut => "timed out",
            Cause::Disconnected => "disconnected",
            Cause::ResourceExhausted => "resource exhausted",
        };
        f.write_str(name)
    }
}

/// Main error type for frame management and messaging.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CoreError {
    #[error("Invalid argument: {context}")]
    InvalidArgument { context: String },

    #[error("Invalid operation: {context}")]
    InvalidOperation { context: String },

    #[error("Not found: {context}")]
    NotFound { context: String },

    #[error("Aborted: {context}")]
    Aborted {
        context: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("{operation} timed out after {duration:?}")]
    TimedOut { operation: String, duration: Duration },

    #[error("Connection lost: {context}")]
    Disconnected { context: String },

    #[error("Resource exhausted: {context}")]
    ResourceExhausted { context: String },

    #[error("Server replied with {cause}: {message}")]
    Remote { cause: Cause, message: String },
}

impl CoreError {
    /// Returns the cause category of this error.
    pub fn cause(&self) -> Cause {
        match self {
            CoreError::InvalidArgument { .. } => Cause::InvalidArgument,
            CoreError::InvalidOperation { .. } => Cause::InvalidOperation,
            CoreError::NotFound { .. } => Cause::NotFound,
            CoreError::Aborted { .. } => Cause::Aborted,
            CoreError::TimedOut { .. } => Cause::TimedOut,
            CoreError::Disconnected { .. } => Cause::Disconnected,
            CoreError::ResourceExhausted { .. } => Cause::ResourceExhausted,
            CoreError::Remote { cause, .. } => *cause,
        }
    }

    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self.cause() {
            Cause::TimedOut => true,
            Cause::Disconnected => true,
            Cause::ResourceExhausted => true,
            Cause::Aborted => true,
            Cause::InvalidArgument => false,
            Cause::InvalidOperation => false,
            Cause::NotFound => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self.cause() {
            Cause::InvalidArgument => vec![
                "Check that the frame was obtained from this manager",
                "Verify the argument values passed to the call",
            ],
            Cause::InvalidOperation => vec![
                "Check the lifecycle state before calling",
                "Initialize the manager before opening publishers",
                "Do not reopen a publisher that is already open",
            ],
            Cause::NotFound => vec![
                "Verify the topic has a matching publisher instance config",
                "Check that the frame has not already been released",
                "Make sure the publisher has not been reclaimed",
            ],
            Cause::Aborted => vec![
                "Run inside a tokio runtime",
                "Check system resources for task creation",
            ],
            Cause::TimedOut => vec![
                "Increase reply_timeout_ms for the client instance",
                "Check that the server is responding",
            ],
            Cause::Disconnected => vec![
                "Check the server address and that the server is running",
                "Reopen the publisher to establish a new connection",
            ],
            Cause::ResourceExhausted => vec![
                "Release frames that are no longer needed",
                "Increase the buffer capacity",
            ],
        }
    }

    /// Helper constructor for invalid argument errors.
    pub fn invalid_argument(context: impl Into<String>) -> Self {
        CoreError::InvalidArgument { context: context.into() }
    }

    /// Helper constructor for wrong-state errors.
    pub fn invalid_operation(context: impl Into<String>) -> Self {
        CoreError::InvalidOperation { context: context.into() }
    }

    /// Helper constructor for lookup failures.
    pub fn not_found(context: impl Into<String>) -> Self {
        CoreError::NotFound { context: context.into() }
    }

    /// Helper constructor for aborted operations with an underlying source.
    pub fn aborted(
        context: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        CoreError::Aborted { context: context.into(), source }
    }

    /// Helper constructor for timeouts.
    pub fn timed_out(operation: impl Into<String>, duration: Duration) -> Self {
        CoreError::TimedOut { operation: operation.into(), duration }
    }

    /// Helper constructor for lost connections.
    pub fn disconnected(context: impl Into<String>) -> Self {
        CoreError::Disconnected { context: context.into() }
    }

    /// Helper constructor for exhausted resources.
    pub fn resource_exhausted(context: impl Into<String>) -> Self {
        CoreError::ResourceExhausted { context: context.into() }
    }

    /// Helper constructor for failures reported by the server.
    pub fn remote(cause: Cause, message: impl Into<String>) -> Self {
        CoreError::Remote { cause, message: message.into() }
    }
}

/// Call-site annotation for fallible results.
pub trait ResultExt {
    /// Log the caller location when the result is an error.
    fn traced(self) -> Self;
}

impl<T> ResultExt for Result<T> {
    #[track_caller]
    fn traced(self) -> Self {
        if let Err(e) = &self {
            let location = Location::caller();
            debug!(
                file = location.file(),
                line = location.line(),
                cause = %e.cause(),
                "status trace: {}",
                e
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(test)]
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
          #[test]
          fn error_messages_carry_their_context(
            context in ".*",
            operation in "\\w+",
            duration_ms in 1u64..60000u64
          ) {
            let not_found = CoreError::not_found(context.clone());
            let invalid = CoreError::invalid_operation(context.clone());
            let timeout = CoreError::timed_out(operation.clone(), Duration::from_millis(duration_ms));

            prop_assert!(not_found.to_string().contains(&context));
            prop_assert!(invalid.to_string().contains(&context));
            prop_assert!(timeout.to_string().contains(&operation));
          }

          #[test]
          fn remote_errors_report_the_carried_cause(
            message in ".*",
            cause in prop::sample::select(vec![
                Cause::InvalidArgument, Cause::InvalidOperation, Cause::NotFound,
                Cause::Aborted, Cause::TimedOut, Cause::Disconnected,
                Cause::ResourceExhausted,
            ])
          ) {
            let error = CoreError::remote(cause, message.clone());
            prop_assert_eq!(error.cause(), cause);
            prop_assert!(error.to_string().contains(&message));
          }
        }
    }

    #[test]
    fn constructors_map_to_causes() {
        assert_eq!(CoreError::invalid_argument("x").cause(), Cause::InvalidArgument);
        assert_eq!(CoreError::invalid_operation("x").cause(), Cause::InvalidOperation);
        assert_eq!(CoreError::not_found("x").cause(), Cause::NotFound);
        assert_eq!(CoreError::aborted("x", None).cause(), Cause::Aborted);
        assert_eq!(CoreError::timed_out("x", Duration::from_secs(1)).cause(), Cause::TimedOut);
        assert_eq!(CoreError::disconnected("x").cause(), Cause::Disconnected);
        assert_eq!(CoreError::resource_exhausted("x").cause(), Cause::ResourceExhausted);
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<CoreError>();

        let error = CoreError::not_found("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn recovery_methods_work() {
        let timeout = CoreError::timed_out("close publisher", Duration::from_secs(30));
        let not_found = CoreError::not_found("unmanaged frame: seqnum=3");

        assert!(timeout.is_retryable());
        assert!(!not_found.is_retryable());

        for suggestion in timeout.recovery_suggestions() {
            assert!(suggestion.len() > 5);
        }
        assert!(!not_found.recovery_suggestions().is_empty());
    }

    #[test]
    fn aborted_preserves_source() {
        let io = std::io::Error::other("spawn failed");
        let error = CoreError::aborted("monitor task", Some(Box::new(io)));
        let source = std::error::Error::source(&error).expect("source should be kept");
        assert_eq!(source.to_string(), "spawn failed");
    }

    #[test]
    fn traced_passes_results_through() {
        let ok: Result<u8> = Ok(7);
        assert_eq!(ok.traced().ok(), Some(7));

        let err: Result<u8> = Err(CoreError::not_found("gone"));
        assert_eq!(err.traced().unwrap_err().cause(), Cause::NotFound);
    }
}
