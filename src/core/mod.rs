pub mod backoff;
pub mod dispatch;
pub mod event;
pub mod frame;
pub mod health;
pub mod history;
pub mod latency;
pub mod topic;
pub mod types;

pub use backoff::*;
pub use dispatch::*;
pub use event::*;
pub use frame::*;
pub use health::*;
pub use history::*;
pub use latency::*;
pub use topic::*;
pub use types::*;
