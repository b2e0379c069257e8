pub mod client_mode;

pub use client_mode::{sync_over, sync_pull, ClientSession, PullReport};
