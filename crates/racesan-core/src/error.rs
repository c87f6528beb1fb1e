//! Error types for the platform layer and the runtime engine.
//!
//! Nothing here is recoverable in the running program: errors travel up with
//! `?` to the hook boundary, where [`fatal`] prints one diagnostic line and
//! terminates the process.

use std::fmt::Display;

use thiserror::Error;

use crate::thread_registry::ThreadStatus;
use crate::vector_clock::Tid;

/// Failures while setting up or tearing down reserved address space.
#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("can not reserve {size:#x} bytes at {addr:#x} (errno {errno})")]
    Reserve { addr: usize, size: usize, errno: i32 },

    #[error("can not protect [{beg:#x}, {end:#x}) (errno {errno}); make sure you are not using unlimited stack")]
    Protect { beg: usize, end: usize, errno: i32 },

    #[error("can not release {size:#x} bytes at {addr:#x} (errno {errno})")]
    Release { addr: usize, size: usize, errno: i32 },

    #[error(
        "can not mmap the shadow memory (something is mapped at {addr:#x}); \
         make sure to compile with -fPIE and to link with -pie"
    )]
    LayoutConflict { addr: usize, end: usize },

    #[error(
        "program memory at {addr:#x} lies outside the application window \
         [{app_beg:#x}, {app_end:#x}); compile with -fPIE and link with -pie, \
         or set RACESAN_SHADOW=relocatable and RACESAN_APP_RANGE"
    )]
    OutsideAppWindow {
        addr: usize,
        end: usize,
        app_beg: usize,
        app_end: usize,
    },

    #[error("shadow layout is malformed: {0}")]
    BadLayout(&'static str),

    #[error("can not read the process memory map: {0}")]
    Maps(#[from] std::io::Error),
}

/// Failures of the race-check engine itself.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("epoch overflow on thread T{tid}")]
    EpochOverflow { tid: Tid },

    #[error("too many live threads (limit {limit})")]
    ThreadLimit { limit: usize },

    #[error("unknown thread T{tid}")]
    UnknownThread { tid: Tid },

    #[error("invalid thread id {raw}")]
    InvalidThreadId { raw: i64 },

    #[error("thread T{tid} is already detached")]
    AlreadyDetached { tid: Tid },

    #[error("thread T{tid} is {found:?}, expected {expected:?}")]
    BadThreadState {
        tid: Tid,
        found: ThreadStatus,
        expected: ThreadStatus,
    },

    #[error("unlock of mutex {id:#x} that is not locked by thread T{tid}")]
    UnmatchedRelease { id: usize, tid: Tid },

    #[error("unbalanced ignore begin/end")]
    UnbalancedIgnore,

    #[error("function exit without entry on thread T{tid}")]
    UnbalancedFuncExit { tid: Tid },

    #[error("CHECK failed: {file}:{line} \"{cond}\"")]
    CheckFailed {
        file: &'static str,
        line: u32,
        cond: &'static str,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),
}

impl RuntimeError {
    /// Program misuse of the hook API: warned about, then ignored.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::UnknownThread { .. }
                | Self::InvalidThreadId { .. }
                | Self::AlreadyDetached { .. }
                | Self::BadThreadState { .. }
                | Self::UnmatchedRelease { .. }
                | Self::UnbalancedIgnore
                | Self::UnbalancedFuncExit { .. }
        )
    }
}

/// Print `WARNING: racesan: <err>`.
pub fn warn(err: impl Display) {
    crate::report!("WARNING: racesan: {err}");
}

/// Print `FATAL: racesan: <err>` and terminate the process.
pub fn fatal(err: impl Display) -> ! {
    crate::report!("FATAL: racesan: {err}");
    crate::platform::die()
}

/// Internal invariant check. A failed check is fatal.
#[macro_export]
macro_rules! racesan_check {
    ($cond:expr) => {
        if !$cond {
            $crate::error::fatal($crate::error::RuntimeError::CheckFailed {
                file: file!(),
                line: line!(),
                cond: stringify!($cond),
            });
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_conflict_names_the_offending_address() {
        let err = PlatformError::LayoutConflict {
            addr: 0x5555_0000_0000,
            end: 0x5555_0000_1000,
        };
        let text = err.to_string();
        assert!(text.contains("0x555500000000"), "{text}");
        assert!(text.contains("-fPIE"));
    }

    #[test]
    fn platform_errors_convert_into_runtime_errors() {
        let err: RuntimeError = PlatformError::BadLayout("empty").into();
        assert_eq!(err.to_string(), "shadow layout is malformed: empty");
    }

    #[test]
    fn misuse_is_told_apart_from_fatal_errors() {
        assert!(RuntimeError::UnknownThread { tid: 3 }.is_misuse());
        assert!(RuntimeError::UnmatchedRelease { id: 0x10, tid: 1 }.is_misuse());
        assert!(!RuntimeError::ThreadLimit { limit: 128 }.is_misuse());
        assert!(!RuntimeError::EpochOverflow { tid: 0 }.is_misuse());
    }

    #[test]
    fn epoch_overflow_mentions_thread() {
        let err = RuntimeError::EpochOverflow { tid: 7 };
        assert_eq!(err.to_string(), "epoch overflow on thread T7");
    }
}
