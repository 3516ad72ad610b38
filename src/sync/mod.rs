//! # Synchronization Module
//!
//! Shares game state and remote commands between clients through an MQTT broker.
//! All clients that know the same password and channel meet on the same topic; a
//! message is either plain data handed to the application or a command that is
//! dispatched to a registered handler method by name.
//!
//! ## Why This Module Exists
//!
//! A multiplayer prototype should not need its own server. A public MQTT broker
//! already provides fan-out, QoS and reachability. What is left to the client is:
//! - Deriving one topic per game session and validating wildcard use
//! - Connecting with a fallback broker when the first choice is down
//! - Turning received payloads into handler calls on the game's own thread
//!
//! ## Module Architecture
//!
//! ```text
//! sync/
//! ├── topic.rs       - Topic building and wildcard rules
//! ├── command.rs     - Command envelope codec and payload classification
//! ├── dispatch.rs    - Handler/binding registry and invocation
//! ├── inbound.rs     - Queue between the session task and the host tick
//! ├── session.rs     - One broker attempt as a typed state machine
//! ├── connection.rs  - Primary/backup failover and session ownership
//! ├── client.rs      - Host-facing `Multiplayer` API and the drain loop
//! └── error.rs       - Error taxonomy
//! ```
//!
//! ## Threading
//!
//! The rumqttc event loop runs in its own tokio task and only pushes raw payloads
//! into the inbound queue. Handlers and events run exclusively inside
//! [`Multiplayer::tick`], which the host calls from its own loop.

pub mod client;
pub mod command;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod inbound;
pub mod session;
pub mod topic;

pub use client::{Multiplayer, SyncEvent};
pub use command::{Command, Payload, COMMAND_MARKER, FIELD_DELIMITER};
pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::{BindingStatus, CommandBinding, Handler, HandlerId};
pub use error::SyncError;
pub use inbound::InboundMessage;
pub use topic::Topic;
