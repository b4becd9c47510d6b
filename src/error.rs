//! Error types for the receiver core.
//!
//! All errors implement the `std::error::Error` trait and carry structured
//! context for debugging and recovery guidance.
//!
//! ## Error Categories
//!
//! - **Pool Errors**: hardware buffer allocation, surface binding or decoder
//!   registration failures. These are fatal: there is no degraded mode for a
//!   missing display surface.
//! - **Decoder / Display Errors**: failures reported by the hardware collaborators
//! - **Source Errors**: transport/demux failures while reading access units
//! - **Repair Errors**: socket creation or send failures for keyframe requests
//!   (always recoverable, usually only logged)
//! - **Config Errors**: invalid or unreadable configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use fpv_rx::ReceiverError;
//!
//! let error = ReceiverError::source_failed("socket closed");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! assert!(!error.is_fatal());
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{HardwareIdentity, SurfaceId};

/// Result type alias for receiver operations.
pub type Result<T, E = ReceiverError> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for receiver operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReceiverError {
    #[error("Buffer allocation failed for slot {slot}: {reason}")]
    PoolAllocation {
        slot: usize,
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Display surface binding failed for slot {slot}")]
    SurfaceBinding {
        slot: usize,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Decoder rejected external buffer set of {count} buffers")]
    BufferRegistration {
        count: usize,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Decoded picture references unknown buffer {identity}")]
    UnknownBuffer { identity: HardwareIdentity },

    #[error("Decoder error during {operation}")]
    Decoder {
        operation: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Display commit failed for {surface}")]
    Display {
        surface: SurfaceId,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Access unit source failed: {reason}")]
    Source {
        reason: String,
        #[source]
        source: Option<BoxError>,
    },

    #[error("Keyframe request to {target} failed")]
    Repair {
        target: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error in {context}: {details}")]
    Config { context: String, details: String },

    #[error("Config file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{operation} requires a running Tokio runtime")]
    NoRuntime { operation: String },

    #[error("Failed to spawn thread {name}")]
    Thread {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl ReceiverError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReceiverError::PoolAllocation { .. } => false,
            ReceiverError::SurfaceBinding { .. } => false,
            ReceiverError::BufferRegistration { .. } => false,
            ReceiverError::UnknownBuffer { .. } => false,
            ReceiverError::Decoder { .. } => true,
            ReceiverError::Display { .. } => true,
            ReceiverError::Source { .. } => true,
            ReceiverError::Repair { .. } => true,
            ReceiverError::Config { .. } => false,
            ReceiverError::File { .. } => false,
            ReceiverError::NoRuntime { .. } => false,
            ReceiverError::Thread { .. } => false,
        }
    }

    /// Returns whether the process must stop rather than continue degraded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReceiverError::PoolAllocation { .. }
                | ReceiverError::SurfaceBinding { .. }
                | ReceiverError::BufferRegistration { .. }
        )
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ReceiverError::PoolAllocation { .. } => vec![
                "Check available CMA / DMA heap memory",
                "Lower the stream resolution",
                "Restart the receiver",
            ],
            ReceiverError::SurfaceBinding { .. } => vec![
                "Verify the display plane supports the pixel format",
                "Check DRM master permissions",
                "Restart the receiver",
            ],
            ReceiverError::BufferRegistration { .. } => vec![
                "Verify the decoder supports external buffers",
                "Check buffer size against the announced strides",
            ],
            ReceiverError::UnknownBuffer { .. } => vec![
                "Report a decoder contract violation",
                "Ensure the pool is rebuilt on every format change",
            ],
            ReceiverError::Decoder { .. } => vec![
                "Wait for the next keyframe",
                "Reset the decoder if errors persist",
            ],
            ReceiverError::Display { .. } => vec![
                "Check the display connector is still attached",
                "Retry on the next frame",
            ],
            ReceiverError::Source { .. } => vec![
                "Check the radio link and network interface",
                "Verify the sender is streaming",
                "Reconnect the source",
            ],
            ReceiverError::Repair { .. } => vec![
                "Check the sender is reachable",
                "Verify the repair port matches the sender configuration",
            ],
            ReceiverError::Config { .. } => vec![
                "Check configuration syntax",
                "Compare against the documented defaults",
            ],
            ReceiverError::File { .. } => vec![
                "Check file exists and is readable",
                "Check file permissions",
            ],
            ReceiverError::NoRuntime { .. } => {
                vec!["Construct the receiver from inside a Tokio runtime"]
            }
            ReceiverError::Thread { .. } => vec![
                "Check the process thread limit",
                "Check available memory",
            ],
        }
    }

    /// Helper constructor for allocation failures.
    pub fn allocation_failed(slot: usize, reason: impl Into<String>) -> Self {
        ReceiverError::PoolAllocation { slot, reason: reason.into(), source: None }
    }

    /// Helper constructor for allocation failures with source.
    pub fn allocation_failed_with_source(
        slot: usize,
        reason: impl Into<String>,
        source: BoxError,
    ) -> Self {
        ReceiverError::PoolAllocation { slot, reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for surface binding failures.
    pub fn binding_failed(slot: usize, source: Option<BoxError>) -> Self {
        ReceiverError::SurfaceBinding { slot, source }
    }

    /// Helper constructor for decoder errors.
    pub fn decoder_error(operation: impl Into<String>) -> Self {
        ReceiverError::Decoder { operation: operation.into(), source: None }
    }

    /// Helper constructor for decoder errors with source.
    pub fn decoder_error_with_source(operation: impl Into<String>, source: BoxError) -> Self {
        ReceiverError::Decoder { operation: operation.into(), source: Some(source) }
    }

    /// Helper constructor for source errors.
    pub fn source_failed(reason: impl Into<String>) -> Self {
        ReceiverError::Source { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors.
    pub fn config_error(context: impl Into<String>, details: impl Into<String>) -> Self {
        ReceiverError::Config { context: context.into(), details: details.into() }
    }
}

impl From<serde_yaml_ng::Error> for ReceiverError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        ReceiverError::Config { context: "YAML".to_string(), details: err.to_string() }
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
          fn error_messages_format_correctly_with_arbitrary_context(
            reason in ".*",
            slot in 0usize..64usize,
            identity in any::<u64>(),
            details in ".*"
          ) {
            let allocation = ReceiverError::allocation_failed(slot, reason.clone());
            let unknown = ReceiverError::UnknownBuffer { identity: HardwareIdentity(identity) };
            let config = ReceiverError::config_error("receiver", details.clone());

            let allocation_msg = allocation.to_string();
            prop_assert!(allocation_msg.contains(&reason));
            prop_assert!(allocation_msg.contains(&slot.to_string()));

            let unknown_msg = unknown.to_string();
            let identity_hex = format!("{:#x}", identity);
            prop_assert!(unknown_msg.contains(&identity_hex));

            prop_assert!(config.to_string().contains(&details));
          }

          #[test]
          fn source_chaining_preserves_the_base_message(base_message in ".*") {
            let error = ReceiverError::decoder_error_with_source(
              "submit",
              Box::new(std::io::Error::other(base_message.clone())),
            );

            let source = std::error::Error::source(&error);
            prop_assert!(source.is_some());
            prop_assert_eq!(source.map(|s| s.to_string()), Some(base_message));
          }
        }
    }

    #[test]
    fn fatal_errors_are_never_retryable() {
        let errors = [
            ReceiverError::allocation_failed(0, "out of memory"),
            ReceiverError::binding_failed(3, None),
            ReceiverError::BufferRegistration { count: 24, source: None },
        ];

        for error in &errors {
            assert!(error.is_fatal(), "{error} should be fatal");
            assert!(!error.is_retryable(), "{error} should not be retryable");
        }
    }

    #[test]
    fn recovery_methods_work() {
        let source_error = ReceiverError::source_failed("link lost");
        let unknown = ReceiverError::UnknownBuffer { identity: HardwareIdentity(7) };

        assert!(source_error.is_retryable());
        assert!(!unknown.is_retryable());
        assert!(!unknown.is_fatal());

        for suggestion in source_error.recovery_suggestions() {
            assert!(suggestion.len() > 5);
        }
        assert!(!unknown.recovery_suggestions().is_empty());
    }

    #[test]
    fn error_traits_validation() {
        fn assert_send_sync_static<T: Send + Sync + 'static>() {}
        assert_send_sync_static::<ReceiverError>();

        let error = ReceiverError::source_failed("test");
        let _: &dyn std::error::Error = &error;
    }

    #[test]
    fn yaml_errors_convert_to_config() {
        let yaml_err = serde_yaml_ng::from_str::<u32>("not a number").unwrap_err();
        let error: ReceiverError = yaml_err.into();
        assert!(matches!(error, ReceiverError::Config { .. }));
    }
}
