//! Error taxonomy for the synchronization layer
//!
//! Every failure in this crate degrades to one of these variants. None of them is
//! fatal to the host: configuration and topic errors are reported before any
//! network action, receive-side errors are logged and the message is dropped, and
//! connection errors leave the client in a state from which `connect` can be
//! attempted again.

use crate::config::ConfigIssue;
use thiserror::Error;

/// Errors surfaced by the topic builder, codec, connection manager and dispatcher
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Configuration failed validation; carries every issue found, not only the first
    #[error("Invalid configuration: {}", format_issues(.0))]
    InvalidConfig(Vec<ConfigIssue>),

    /// A topic segment violates the character or wildcard rules
    #[error("Invalid topic segment '{segment}': {reason}")]
    InvalidTopicSegment { segment: String, reason: String },

    /// Neither the primary nor the backup broker accepted a session
    #[error("Broker unreachable: primary '{primary}'{}", format_backup(.backup))]
    BrokerUnreachable {
        primary: String,
        backup: Option<String>,
    },

    /// A payload carried the command marker but did not decode
    #[error("Malformed command: expected at least 3 fields, got {fields}")]
    MalformedCommand { fields: usize },

    /// A command could not be encoded so that it round-trips
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The binding's handler or method is no longer invocable
    #[error("Dispatch target missing: handler '{handler}' has no method '{method}'")]
    DispatchTargetMissing { handler: String, method: String },

    /// An identical (handler, method, command) binding already exists
    #[error("Duplicate binding: {handler}.{method} is already bound to '{command}'")]
    DuplicateBinding {
        handler: String,
        method: String,
        command: String,
    },

    /// Publish attempted without a live broker session
    #[error("Not connected to a broker")]
    NotConnected,

    /// A connection attempt is still marked as running
    #[error("A connection attempt is already in progress")]
    ConnectInProgress,

    /// A client for the same topic already exists in this process
    #[error("A client for topic '{0}' already exists")]
    AlreadyInstantiated(String),

    /// The connection attempt was aborted by shutdown
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// The MQTT client rejected an outgoing request
    #[error("Publish failed: {0}")]
    Publish(String),
}

fn format_issues(issues: &[ConfigIssue]) -> String {
    issues
        .iter()
        .map(|issue| issue.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

fn format_backup(backup: &Option<String>) -> String {
    match backup {
        Some(backup) => format!(" and backup '{}'", backup),
        None => ", no backup configured".to_string(),
    }
}
