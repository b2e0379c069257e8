//! Server-authoritative file sync.
//!
//! A server offers a fixed set of files; clients compare them with their
//! local copies, pull whatever differs and ask the user to restart.

pub mod config;
pub mod error;
pub mod exchange;
pub mod server;
pub mod sync;
pub mod transport;

pub use config::Config;
pub use error::{Result, SyncError};
