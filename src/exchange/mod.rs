//! File exchange between a server and its clients.
//!
//! The server advertises a set of files, the client requests the ones it is
//! missing, the server sends them and the client writes them to disk and
//! asks for a restart.

pub mod apply;
pub mod channel;
pub mod chunker;
pub mod generator;
pub mod manifest;
pub mod pipeline;
pub mod protocol;
pub mod receiver;
pub mod registry;
pub mod sender;
pub mod token;

pub use apply::{Applier, ApplyReport, ConsolePrompt, ReceivedFile, RestartPrompt};
pub use channel::{MainLoop, MainLoopOutcome, SyncStats};
pub use generator::{Generator, GeneratorConfig};
pub use manifest::{Manifest, SyncEntry};
pub use pipeline::{Connection, ConnectionStats, SessionHandler};
pub use receiver::{Receiver, ReceiverConfig};
pub use registry::{DescriptorRegistry, Side};
pub use sender::Sender;
