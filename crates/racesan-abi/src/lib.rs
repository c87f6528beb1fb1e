//! # racesan-abi
//!
//! `extern "C"` hook surface for the racesan engine.
//!
//! This crate produces a `cdylib` that instrumented programs link against.
//! Each hook finds the global runtime and the calling thread's state, then
//! delegates to [`racesan_core::Runtime`].
//!
//! # Architecture
//!
//! ```text
//! instrumented code -> hook (this crate) -> runtime bridge -> engine
//! ```
//!
//! Hooks never fail outward. Misuse (unmatched unlock, join of an unknown
//! thread) prints a warning and is otherwise ignored; internal failures are
//! fatal and end the process with status 1.

mod macros;
mod runtime_bridge;

pub mod access_abi;
pub mod startup_abi;
pub mod sync_abi;
pub mod thread_abi;
