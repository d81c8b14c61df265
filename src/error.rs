//! Integrator error types and result handling.

use thiserror::Error;

/// Errors surfaced by the integrator and its device backends.
#[derive(Debug, Error)]
pub enum IntegratorError {
    /// A status prerequisite of the requested operation is not set.
    #[error("Integrator not configured: {missing} is missing")]
    NotConfigured {
        /// Name of the first missing status flag.
        missing: &'static str,
    },

    /// A method was called out of the required order.
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message
        message: String,
    },

    /// A supplied array does not have the expected length.
    #[error("Size mismatch for {buffer}: expected {expected} elements, got {actual}")]
    SizeMismatch {
        /// Buffer or argument name
        buffer: &'static str,
        /// Expected element count
        expected: usize,
        /// Supplied element count
        actual: usize,
    },

    /// The device rejected an allocation.
    #[error("Device allocation failed for {buffer}: requested {requested} bytes, {available} available")]
    Allocation {
        /// Buffer name
        buffer: &'static str,
        /// Requested bytes
        requested: usize,
        /// Free bytes left on the device
        available: usize,
    },

    /// The device-selection collaborator found nothing matching.
    #[error("No suitable {class} device (double precision required: {fp64})")]
    NoSuitableDevice {
        /// Requested device class
        class: &'static str,
        /// Whether double precision was required
        fp64: bool,
    },

    /// Kernel source could not be resolved.
    #[error("Kernel source not found: {name} (searched {searched})")]
    KernelSourceNotFound {
        /// Kernel identifier as given
        name: String,
        /// Locations that were searched
        searched: String,
    },

    /// The device reported a failed kernel run.
    #[error("Kernel {kernel} failed: {message}")]
    KernelExecution {
        /// Kernel entry point
        kernel: &'static str,
        /// Error message
        message: String,
    },

    /// An argument value is outside its valid domain.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Error message
        message: String,
    },

    /// The caller gave up waiting on an execution.
    #[error("Execution timed out")]
    Timeout,
}

impl IntegratorError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    pub(crate) fn check_len(buffer: &'static str, expected: usize, actual: usize) -> IntegratorResult<()> {
        if expected == actual {
            Ok(())
        } else {
            Err(Self::SizeMismatch {
                buffer,
                expected,
                actual,
            })
        }
    }
}

/// Result type for integrator operations
pub type IntegratorResult<T> = Result<T, IntegratorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IntegratorError::NotConfigured { missing: "sized" };
        assert_eq!(err.to_string(), "Integrator not configured: sized is missing");

        let err = IntegratorError::SizeMismatch {
            buffer: "mask",
            expected: 4,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Size mismatch for mask: expected 4 elements, got 3"
        );

        let err = IntegratorError::Allocation {
            buffer: "image",
            requested: 1024,
            available: 512,
        };
        assert_eq!(
            err.to_string(),
            "Device allocation failed for image: requested 1024 bytes, 512 available"
        );
    }

    #[test]
    fn test_check_len() {
        assert!(IntegratorError::check_len("tth", 3, 3).is_ok());
        assert!(matches!(
            IntegratorError::check_len("tth", 3, 2),
            Err(IntegratorError::SizeMismatch {
                buffer: "tth",
                expected: 3,
                actual: 2
            })
        ));
    }

    #[test]
    fn test_error_is_send_sync() {
        let err: Box<dyn std::error::Error + Send + Sync> = Box::new(IntegratorError::Timeout);
        assert_eq!(err.to_string(), "Execution timed out");
    }
}
