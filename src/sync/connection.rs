//! Connection manager: primary/backup failover and session ownership
//!
//! ```text
//!                 connect()
//! Disconnected ──────────────► ConnectingPrimary ──ok──────────────► Connected
//!      ▲                             │                                   │
//!      │                           fail                                  │
//!      │                             ▼                                   │
//!      │◄──────── both fail ── ConnectingBackup ──ok (used_backup)──►    │
//!      │                                                                 │
//!      └──────────────── disconnect() / session closed ◄─────────────────┘
//! ```
//!
//! The manager never retries on its own. When both brokers fail the state returns
//! to `Disconnected` and `BrokerUnreachable` is handed back to the caller.

use super::error::SyncError;
use super::inbound::InboundSender;
use super::session::{probe_tcp, AttemptError, BrokerAttempt, BrokerRole, LiveSession};
use super::topic::Topic;
use crate::config::ConnectionConfig;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    ConnectingPrimary,
    ConnectingBackup,
    Connected,
}

/// Successful connection outcome
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Connected {
    pub broker: String,
    /// The primary failed and the backup broker is in use
    pub used_backup: bool,
}

/// Resets the state to `Disconnected` if a connect future is dropped mid-attempt
struct AttemptGuard<'a> {
    state: &'a watch::Sender<ConnectionState>,
    armed: bool,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Connection attempt abandoned, resetting state");
            self.state.send_replace(ConnectionState::Disconnected);
        }
    }
}

pub struct ConnectionManager {
    state: watch::Sender<ConnectionState>,
    session: Option<LiveSession>,
    next_session_id: u64,
    inbound: InboundSender,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    pub fn new(inbound: InboundSender) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state,
            session: None,
            next_session_id: 1,
            inbound,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Observer for state changes, usable from any task
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Cancelling this token aborts any in-flight attempt and ends the live session
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some() && self.state() == ConnectionState::Connected
    }

    pub fn active_broker(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.host.as_str())
    }

    /// Probes the primary broker only; never touches connection state
    pub async fn test_connection(&self, config: &ConnectionConfig) -> bool {
        let host = config.primary_broker();
        match probe_tcp(host, config.port, config.timeouts.probe(), &self.shutdown).await {
            Ok(()) => {
                info!("Test successful: {} is reachable", host);
                true
            }
            Err(e) => {
                info!("Test failed: {} did not respond ({})", host, e);
                false
            }
        }
    }

    /// Connects to the primary broker, falling back to the backup
    pub async fn connect(&mut self, config: &ConnectionConfig) -> Result<Connected, SyncError> {
        config.ensure_valid()?;
        let topic = config.topic()?;

        match self.state() {
            ConnectionState::ConnectingPrimary | ConnectionState::ConnectingBackup => {
                warn!("Rejected connect: an attempt is already running");
                return Err(SyncError::ConnectInProgress);
            }
            ConnectionState::Connected => {
                info!("Reconnecting: closing current session first");
                self.teardown();
            }
            ConnectionState::Disconnected => {}
        }

        if self.shutdown.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let primary = config.primary_broker().to_string();
        let backup = config.backup_broker().map(str::to_string);

        let mut guard = AttemptGuard {
            state: &self.state,
            armed: true,
        };

        guard.state.send_replace(ConnectionState::ConnectingPrimary);
        let primary_err = match attempt(
            BrokerRole::Primary,
            &primary,
            config,
            &topic,
            &mut self.next_session_id,
            &self.inbound,
            &self.shutdown,
        )
        .await
        {
            Ok(session) => {
                guard.armed = false;
                drop(guard);
                return Ok(self.establish(session, false));
            }
            Err(e) => e,
        };

        if matches!(primary_err, AttemptError::Cancelled) {
            guard.armed = false;
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(SyncError::Cancelled);
        }

        let Some(backup) = backup else {
            error!(
                "Unable to connect to the main server ({}). Backup server not configured.",
                primary_err
            );
            guard.armed = false;
            self.state.send_replace(ConnectionState::Disconnected);
            return Err(SyncError::BrokerUnreachable {
                primary,
                backup: None,
            });
        };

        warn!(
            "Primary broker {} failed ({}), trying backup {}",
            primary, primary_err, backup
        );
        guard.state.send_replace(ConnectionState::ConnectingBackup);
        let result = attempt(
            BrokerRole::Backup,
            &backup,
            config,
            &topic,
            &mut self.next_session_id,
            &self.inbound,
            &self.shutdown,
        )
        .await;
        guard.armed = false;
        drop(guard);

        match result {
            Ok(session) => {
                warn!("Unable to connect to the main server. Switched to backup server.");
                Ok(self.establish(session, true))
            }
            Err(AttemptError::Cancelled) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(SyncError::Cancelled)
            }
            Err(backup_err) => {
                error!(
                    "Unable to connect to both the main server ({}) and the backup server ({}).",
                    primary_err, backup_err
                );
                self.state.send_replace(ConnectionState::Disconnected);
                Err(SyncError::BrokerUnreachable {
                    primary,
                    backup: Some(backup),
                })
            }
        }
    }

    fn establish(&mut self, session: LiveSession, used_backup: bool) -> Connected {
        let broker = session.host.clone();
        info!(
            "Connected to {} broker {} (session {})",
            session.role, broker, session.id
        );
        self.session = Some(session);
        self.state.send_replace(ConnectionState::Connected);
        Connected {
            broker,
            used_backup,
        }
    }

    /// Closes the live session; returns true only on an actual state transition
    pub fn disconnect(&mut self) -> bool {
        if self.state() == ConnectionState::Disconnected && self.session.is_none() {
            debug!("Disconnect ignored: already disconnected");
            return false;
        }
        self.teardown();
        info!("Disconnected from broker");
        true
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Handles a close reported by a session task; stale session ids are ignored
    pub fn on_session_closed(&mut self, session_id: u64) -> bool {
        match &self.session {
            Some(session) if session.id == session_id => {
                warn!("Connection lost to {}", session.host);
                self.session = None;
                self.state.send_replace(ConnectionState::Disconnected);
                true
            }
            _ => {
                debug!("Ignoring close of stale session {}", session_id);
                false
            }
        }
    }

    /// QoS 2 publish on the live session
    pub fn publish(&self, topic: &Topic, payload: Vec<u8>) -> Result<(), SyncError> {
        let Some(session) = self.session.as_ref() else {
            return Err(SyncError::NotConnected);
        };
        if topic.is_filter() {
            return Err(SyncError::InvalidTopicSegment {
                segment: topic.to_string(),
                reason: "wildcard topics can only be subscribed to".to_string(),
            });
        }
        if session.is_finished() {
            return Err(SyncError::NotConnected);
        }
        session
            .publish(topic.as_str(), payload)
            .map_err(|e| SyncError::Publish(e.to_string()))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
    }
}

async fn attempt(
    role: BrokerRole,
    host: &str,
    config: &ConnectionConfig,
    topic: &Topic,
    next_session_id: &mut u64,
    inbound: &InboundSender,
    shutdown: &CancellationToken,
) -> Result<LiveSession, AttemptError> {
    let session_id = *next_session_id;
    *next_session_id += 1;

    BrokerAttempt::create(
        role,
        host,
        config.port,
        config.timeouts.clone(),
        shutdown.child_token(),
    )
    .probe()
    .await?
    .handshake()
    .await?
    .subscribe(topic, session_id, inbound.clone())
    .await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sync::inbound::{inbound_queue, Inbound};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal MQTT 3.1.1 broker: accepts, acks CONNECT and SUBSCRIBE, then
    /// publishes the given payloads at QoS 0 and holds the connection open.
    pub(crate) async fn spawn_fake_broker(publishes: Vec<String>) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let publishes = publishes.clone();
                tokio::spawn(serve_client(stream, publishes));
            }
        });
        port
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        body.extend_from_slice(topic.as_bytes());
        body.extend_from_slice(payload.as_bytes());
        assert!(body.len() < 128);
        let mut packet = vec![0x30, body.len() as u8];
        packet.extend(body);
        packet
    }

    async fn serve_client(mut stream: TcpStream, publishes: Vec<String>) {
        let mut topic = String::new();
        while let Some((header, body)) = read_packet(&mut stream).await {
            match header >> 4 {
                // CONNECT
                1 => {
                    if stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.is_err() {
                        return;
                    }
                }
                // SUBSCRIBE
                8 => {
                    let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    topic = String::from_utf8_lossy(&body[4..4 + topic_len]).into_owned();
                    let ack = [0x90, 0x03, body[0], body[1], 0x02];
                    if stream.write_all(&ack).await.is_err() {
                        return;
                    }
                    for payload in &publishes {
                        if stream
                            .write_all(&publish_packet(&topic, payload))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                }
                // PINGREQ
                12 => {
                    let _ = stream.write_all(&[0xd0, 0x00]).await;
                }
                // DISCONNECT
                14 => return,
                _ => {}
            }
        }
        let _ = topic;
    }

    /// Acks CONNECT and SUBSCRIBE on every client, then drops the socket
    pub(crate) async fn spawn_closing_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(close_after_suback(stream));
            }
        });
        port
    }

    async fn close_after_suback(mut stream: TcpStream) {
        while let Some((header, body)) = read_packet(&mut stream).await {
            match header >> 4 {
                1 => {
                    let _ = stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await;
                }
                8 => {
                    let _ = stream.write_all(&[0x90, 0x03, body[0], body[1], 0x02]).await;
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    return;
                }
                _ => {}
            }
        }
    }

    /// Accepts TCP but never answers CONNECT
    async fn spawn_silent_broker() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let _stream = stream;
                    tokio::time::sleep(Duration::from_secs(30)).await;
                });
            }
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    pub(crate) fn local_config(primary: &str, port: u16, channel: &str) -> ConnectionConfig {
        let mut config = ConnectionConfig::new(primary, "testpw", channel).with_port(port);
        config.timeouts.probe_secs = 2;
        config.timeouts.handshake_secs = 2;
        config
    }

    #[tokio::test]
    async fn connects_to_primary() {
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);

        let connected = manager
            .connect(&local_config("127.0.0.1", port, "primary"))
            .await
            .unwrap();

        assert!(!connected.used_backup);
        assert_eq!(connected.broker, "127.0.0.1");
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert!(manager.is_connected());
    }

    #[tokio::test]
    async fn falls_back_to_backup_when_primary_unreachable() {
        // the fake broker listens on 127.0.0.1 only, so 127.0.0.2 refuses
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        let config = local_config("127.0.0.2", port, "failover").with_backup("127.0.0.1");

        let connected = manager.connect(&config).await.unwrap();

        assert!(connected.used_backup);
        assert_eq!(manager.active_broker(), Some("127.0.0.1"));
        assert_eq!(manager.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn both_unreachable_is_reported_and_stays_disconnected() {
        let port = closed_port().await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        let config = local_config("127.0.0.1", port, "nowhere").with_backup("127.0.0.2");

        let err = manager.connect(&config).await.unwrap_err();

        assert_eq!(
            err,
            SyncError::BrokerUnreachable {
                primary: "127.0.0.1".to_string(),
                backup: Some("127.0.0.2".to_string()),
            }
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_network() {
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        let config = ConnectionConfig::new("localhost", "", "chan");

        let err = manager.connect(&config).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidConfig(ref issues) if issues.len() == 2));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_idempotent() {
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        manager
            .connect(&local_config("127.0.0.1", port, "idem"))
            .await
            .unwrap();

        assert!(manager.disconnect());
        assert!(!manager.disconnect());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn publish_without_session_is_not_connected() {
        let (tx, _rx) = inbound_queue();
        let manager = ConnectionManager::new(tx);
        let topic = Topic::build::<&str>("pw", "chan", &[]).unwrap();

        assert_eq!(
            manager.publish(&topic, b"hi".to_vec()),
            Err(SyncError::NotConnected)
        );
    }

    #[tokio::test]
    async fn publish_to_wildcard_topic_is_rejected() {
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        manager
            .connect(&local_config("127.0.0.1", port, "wild"))
            .await
            .unwrap();

        let topic = Topic::build("pw", "chan", &["#"]).unwrap();
        assert!(matches!(
            manager.publish(&topic, b"hi".to_vec()),
            Err(SyncError::InvalidTopicSegment { .. })
        ));
        let plain = Topic::build::<&str>("pw", "chan", &[]).unwrap();
        assert!(manager.publish(&plain, b"hi".to_vec()).is_ok());
    }

    #[tokio::test]
    async fn received_publishes_land_in_queue() {
        let port = spawn_fake_broker(vec!["one".into(), "two".into()]).await;
        let (tx, mut rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        manager
            .connect(&local_config("127.0.0.1", port, "recv"))
            .await
            .unwrap();

        let mut texts = Vec::new();
        for _ in 0..100 {
            for item in rx.drain() {
                if let Inbound::Message(msg) = item {
                    assert_eq!(msg.topic, "testpw/recv");
                    texts.push(msg.text());
                }
            }
            if texts.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn remote_close_is_reported_once() {
        let port = spawn_closing_broker().await;
        let (tx, mut rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        manager
            .connect(&local_config("127.0.0.1", port, "closing"))
            .await
            .unwrap();

        let mut closed = None;
        for _ in 0..100 {
            if let Some(Inbound::SessionClosed { session }) = rx
                .drain()
                .into_iter()
                .find(|i| matches!(i, Inbound::SessionClosed { .. }))
            {
                closed = Some(session);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let session = closed.expect("session close not reported");

        assert!(manager.on_session_closed(session));
        assert!(!manager.on_session_closed(session));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!manager.disconnect());
    }

    #[tokio::test]
    async fn shutdown_token_cancels_attempts() {
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        manager.shutdown_token().cancel();

        let err = manager
            .connect(&local_config("127.0.0.1", port, "cancelled"))
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::Cancelled);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn dropped_connect_resets_state() {
        let port = spawn_silent_broker().await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        let mut config = local_config("127.0.0.1", port, "abandoned");
        config.timeouts.handshake_secs = 1;

        let abandoned =
            tokio::time::timeout(Duration::from_millis(300), manager.connect(&config)).await;
        assert!(abandoned.is_err());
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        // the next attempt runs to completion instead of being rejected
        let err = manager.connect(&config).await.unwrap_err();
        assert!(matches!(err, SyncError::BrokerUnreachable { backup: None, .. }));
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn connect_during_running_attempt_is_rejected() {
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let mut manager = ConnectionManager::new(tx);
        let config = local_config("127.0.0.1", port, "overlap");

        for running in [
            ConnectionState::ConnectingPrimary,
            ConnectionState::ConnectingBackup,
        ] {
            manager.state.send_replace(running);
            assert_eq!(
                manager.connect(&config).await,
                Err(SyncError::ConnectInProgress)
            );
            assert_eq!(manager.state(), running);
            assert!(!manager.is_connected());
        }
    }

    #[tokio::test]
    async fn test_connection_only_probes() {
        let port = spawn_fake_broker(vec![]).await;
        let (tx, _rx) = inbound_queue();
        let manager = ConnectionManager::new(tx);
        let states = manager.watch_state();

        assert!(
            manager
                .test_connection(&local_config("127.0.0.1", port, "probe"))
                .await
        );
        assert!(
            !manager
                .test_connection(&local_config("127.0.0.1", closed_port().await, "probe"))
                .await
        );
        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(!states.has_changed().unwrap());
    }
}
