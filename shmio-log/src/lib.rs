//! Logging facade of shmio.
//!
//! The engine logs at three levels only: `trace!` for driver lifecycle,
//! `debug!` for soft failures and retries, `warn!` for hard failures and
//! teardown leftovers. Without the `enable_log` feature the [`dummy`]
//! macros shadow the `tracing` ones and compile to nothing, so completion
//! paths carry no tracing dispatch.

#[cfg_attr(not(feature = "enable_log"), doc(hidden))]
pub use tracing::*;

#[cfg(not(feature = "enable_log"))]
pub mod dummy;
