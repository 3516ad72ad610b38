//! Host-facing client
//!
//! [`Multiplayer`] is constructed once by the host application and driven from the
//! host's own loop. Everything that touches application state (callbacks, events)
//! happens inside [`Multiplayer::tick`], on the caller's thread.
//!
//! ```text
//! session task ──push──► inbound queue ──tick()──► classify ──┬─► Dispatcher ──► handler method
//!                                                              └─► SyncEvent::MessageReceived
//! ```

use super::command::{Command, Payload};
use super::connection::{ConnectionManager, ConnectionState};
use super::dispatch::{BindingStatus, CommandBinding, Dispatcher, Handler, HandlerId};
use super::error::SyncError;
use super::inbound::{inbound_queue, Inbound, InboundMessage, InboundReceiver, InboundSender};
use super::topic::Topic;
use crate::config::ConnectionConfig;
use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, OnceLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Notifications handed to the host from `tick`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Connected { broker: String, used_backup: bool },
    Disconnected,
    MessageReceived(InboundMessage),
}

fn active_topics() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Claims a topic for the lifetime of one client
#[derive(Debug)]
struct InstanceGuard {
    topic: String,
}

impl InstanceGuard {
    fn claim(topic: &Topic) -> Result<Self, SyncError> {
        let mut active = active_topics()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(topic.to_string()) {
            return Err(SyncError::AlreadyInstantiated(topic.to_string()));
        }
        Ok(Self {
            topic: topic.to_string(),
        })
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let mut active = active_topics()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.topic);
    }
}

pub struct Multiplayer {
    config: ConnectionConfig,
    topic: Topic,
    connection: ConnectionManager,
    dispatcher: Dispatcher,
    inbound: InboundReceiver,
    inbound_tx: InboundSender,
    pending: VecDeque<SyncEvent>,
    _instance: InstanceGuard,
}

impl Multiplayer {
    /// Validates the configuration and claims its topic for this process
    pub fn new(config: ConnectionConfig) -> Result<Self, SyncError> {
        config.ensure_valid()?;
        let topic = config.topic()?;
        let instance = InstanceGuard::claim(&topic)?;

        let (inbound_tx, inbound) = inbound_queue();
        info!("Created client for topic '{}'", topic);

        Ok(Self {
            connection: ConnectionManager::new(inbound_tx.clone()),
            dispatcher: Dispatcher::new(config.log_events),
            config,
            topic,
            inbound,
            inbound_tx,
            pending: VecDeque::new(),
            _instance: instance,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection.watch_state()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.connection.shutdown_token()
    }

    /// Connects, closing a live session first; that close is reported as `Disconnected`
    pub async fn connect(&mut self) -> Result<ConnectionState, SyncError> {
        if self.connection.state() == ConnectionState::Connected {
            info!("Reconnecting: closing current session first");
            self.disconnect();
        }
        match self.connection.connect(&self.config).await {
            Ok(connected) => {
                if self.config.log_events {
                    info!("Connected to server {}", connected.broker);
                }
                self.pending.push_back(SyncEvent::Connected {
                    broker: connected.broker,
                    used_backup: connected.used_backup,
                });
                Ok(self.connection.state())
            }
            Err(e) => {
                error!("Connect failed: {}", e);
                Err(e)
            }
        }
    }

    /// Idempotent; a `Disconnected` event is queued only on an actual transition
    pub fn disconnect(&mut self) {
        if self.connection.disconnect() {
            self.pending.push_back(SyncEvent::Disconnected);
        }
    }

    pub async fn test_connection(&self) -> bool {
        self.connection.test_connection(&self.config).await
    }

    pub fn send_data(&self, data: impl AsRef<[u8]>) -> Result<(), SyncError> {
        let data = data.as_ref();
        match self.connection.publish(&self.topic, data.to_vec()) {
            Ok(()) => {
                if self.config.log_events {
                    info!("Data sent: {}", String::from_utf8_lossy(data));
                } else {
                    debug!("Data sent ({} bytes)", data.len());
                }
                Ok(())
            }
            Err(e) => {
                error!("An error occurred while sending data: {}", e);
                Err(e)
            }
        }
    }

    pub fn send_command(&self, command_name: &str, parameter: &str) -> Result<(), SyncError> {
        let wire = Command::new(command_name, parameter).encode()?;
        match self.connection.publish(&self.topic, wire.into_bytes()) {
            Ok(()) => {
                if self.config.log_events {
                    info!(
                        "Sent command {} with parameter {}",
                        command_name, parameter
                    );
                }
                Ok(())
            }
            Err(e) => {
                error!("An error occurred while sending the command: {}", e);
                Err(e)
            }
        }
    }

    pub fn add_handler(&mut self, handler: Handler) {
        self.dispatcher.add_handler(handler);
    }

    pub fn remove_handler(&mut self, id: &HandlerId) -> Option<Handler> {
        self.dispatcher.remove_handler(id)
    }

    pub fn selectable_methods(&self, id: &HandlerId) -> Vec<String> {
        self.dispatcher.selectable_methods(id)
    }

    pub fn register_binding(
        &mut self,
        handler: impl Into<HandlerId>,
        method: &str,
        command: &str,
    ) -> Result<(), SyncError> {
        self.dispatcher
            .register_binding(CommandBinding::new(handler, method, command))
    }

    pub fn unregister_binding(
        &mut self,
        handler: impl Into<HandlerId>,
        method: &str,
        command: &str,
    ) -> bool {
        self.dispatcher
            .unregister_binding(&CommandBinding::new(handler, method, command))
    }

    pub fn bindings(&self) -> &[CommandBinding] {
        self.dispatcher.bindings()
    }

    pub fn binding_status(&self, binding: &CommandBinding) -> BindingStatus {
        self.dispatcher.binding_status(binding)
    }

    /// Drains what is queued right now, dispatches commands and returns the events
    pub fn tick(&mut self) -> Vec<SyncEvent> {
        let mut events: Vec<SyncEvent> = self.pending.drain(..).collect();

        for item in self.inbound.drain() {
            match item {
                Inbound::Message(message) => {
                    if let Some(event) = self.route(message) {
                        events.push(event);
                    }
                }
                Inbound::SessionClosed { session } => {
                    if self.connection.on_session_closed(session) {
                        if self.config.log_events {
                            info!("Connection lost.");
                        }
                        events.push(SyncEvent::Disconnected);
                    }
                }
            }
        }

        events
    }

    fn route(&mut self, message: InboundMessage) -> Option<SyncEvent> {
        let text = message.text();
        match Payload::classify(&text) {
            Payload::Command(raw) => {
                match Command::decode(raw) {
                    Ok(command) => {
                        self.dispatcher.dispatch(&command);
                    }
                    Err(e) => warn!("Dropping message on {}: {}", message.topic, e),
                }
                None
            }
            Payload::Data(data) => {
                if self.config.log_events {
                    info!("Data received: {}", data);
                }
                Some(SyncEvent::MessageReceived(message))
            }
        }
    }

    /// Producer side of the inbound queue, for feeding payloads from another transport
    pub fn inbound_sender(&self) -> InboundSender {
        self.inbound_tx.clone()
    }
}
