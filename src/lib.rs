pub mod config;
pub mod sync;

pub use config::{ConfigIssue, ConnectionConfig};
pub use sync::{
    Command, CommandBinding, ConnectionState, Handler, HandlerId, InboundMessage, Multiplayer,
    SyncError, SyncEvent, Topic,
};
