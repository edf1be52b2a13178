//! Driver error types.

use std::fmt;

/// Errors that can occur in the submission core.
///
/// Caller-contract violations (segment overruns, count-field overflow,
/// double frees) are not represented here; those are driver bugs and are
/// caught by assertions at the offending call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The device-memory allocator could not satisfy a request, or a
    /// growable pool hit its hard cap.
    OutOfDeviceMemory,
    /// A host-side allocation failed.
    OutOfHostMemory,
    /// The kernel reported the device (or its channel) gone.
    DeviceLost,
    /// A wait helper ran out its timeout before completion.
    Timeout,
    /// The kernel rejected a submission with the given errno.
    SubmissionFailed(i32),
    /// An invalid parameter was provided.
    InvalidParameter(String),
    /// An internal error occurred.
    Internal(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),
            Self::OutOfHostMemory => write!(f, "out of host memory"),
            Self::DeviceLost => write!(f, "GPU device lost"),
            Self::Timeout => write!(f, "wait timed out"),
            Self::SubmissionFailed(errno) => {
                write!(f, "kernel rejected submission: errno {errno}")
            }
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for DriverError {}
