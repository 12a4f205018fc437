//! Connection manager actor, its frame writer and the application handle.

pub mod actor;
pub mod handle;
pub mod writer;

pub use actor::{
    ConnectionManager, ConnectionManagerArgs, ConnectWaiter, MAX_ATTEMPTS_REASON, SyncStatus,
};
pub use handle::{ListenerHandle, SyncClient};
pub use writer::FrameWriter;
