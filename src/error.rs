//! Error types for conditions the runtime allows to surface as `Result`.
//!
//! Most error conditions this runtime can hit are not representable as a
//! `Result`: allocation failure and invariant violations are fatal and
//! abort the process (mirroring `snow-rt`'s `snow_panic`), and transient
//! contention is fully internal to `try_input`/`try_output`. `PiRtError`
//! covers what's left: misuse of the ABI before the runtime is initialized.

use std::fmt;

/// Recoverable errors reported by the public API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PiRtError {
    /// An ABI entry point was called before `pirt_init`.
    NotInitialized,
}

impl fmt::Display for PiRtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => {
                write!(f, "pi-rt: runtime not initialized -- call pirt_init() first")
            }
        }
    }
}

impl std::error::Error for PiRtError {}
