//! Single broker attempt as a statum state machine
//!
//! ```text
//! Probing ──probe()──► Handshaking ──handshake()──► Subscribing ──subscribe()──► LiveSession
//!    │                     │                             │
//!    └─────────────────────┴──── AttemptError ───────────┘
//! ```
//!
//! Every await point is bounded by a timeout and raced against the attempt's
//! cancellation token, so a shutdown never waits on a dead broker.

use super::inbound::{Inbound, InboundMessage, InboundSender};
use super::topic::Topic;
use crate::config::TimeoutConfig;
use rumqttc::{
    AsyncClient, ClientError, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS,
};
use statum::{machine, state};
use std::fmt;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Capacity of the rumqttc request channel
const REQUEST_CAPACITY: usize = 100;
const DISCONNECT_FLUSH: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerRole {
    Primary,
    Backup,
}

impl fmt::Display for BrokerRole {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerRole::Primary => write!(f, "primary"),
            BrokerRole::Backup => write!(f, "backup"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("Reachability probe failed: {0}")]
    Probe(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Attempt cancelled")]
    Cancelled,
}

#[state]
#[derive(Debug, Clone)]
pub enum AttemptState {
    Probing,     // TCP reachability check
    Handshaking, // MQTT CONNECT / CONNACK
    Subscribing, // SUBSCRIBE and hand-off to the session task
}

#[machine]
pub struct BrokerAttempt<S: AttemptState> {
    role: BrokerRole,
    host: String,
    port: u16,
    timeouts: TimeoutConfig,
    cancel: CancellationToken,
    client: Option<AsyncClient>,
    eventloop: Option<EventLoop>,
}

impl<S: AttemptState> BrokerAttempt<S> {
    pub fn role(&self) -> BrokerRole {
        self.role
    }

    pub fn host(&self) -> &str {
        &self.host
    }
}

impl BrokerAttempt<Probing> {
    pub fn create(
        role: BrokerRole,
        host: &str,
        port: u16,
        timeouts: TimeoutConfig,
        cancel: CancellationToken,
    ) -> Self {
        debug!("Preparing {} broker attempt for {}:{}", role, host, port);
        Self::new(
            role,
            host.to_string(),
            port,
            timeouts,
            cancel,
            None, // client
            None, // eventloop
        )
    }

    pub async fn probe(self) -> Result<BrokerAttempt<Handshaking>, AttemptError> {
        probe_tcp(&self.host, self.port, self.timeouts.probe(), &self.cancel).await?;
        debug!("{} broker {} is reachable", self.role, self.host);
        Ok(self.transition())
    }
}

impl BrokerAttempt<Handshaking> {
    /// Opens the MQTT session with a fresh random client id and waits for CONNACK
    pub async fn handshake(mut self) -> Result<BrokerAttempt<Subscribing>, AttemptError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let mut options = MqttOptions::new(client_id.clone(), self.host.clone(), self.port);
        options
            .set_keep_alive(self.timeouts.keep_alive())
            .set_clean_session(true);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        debug!("Connecting to {} as client {}", self.host, client_id);

        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AttemptError::Cancelled),
            result = tokio::time::timeout(self.timeouts.handshake(), wait_for_connack(&mut eventloop)) => {
                match result {
                    Ok(result) => result,
                    Err(_) => Err(AttemptError::Timeout("CONNACK")),
                }
            }
        };
        outcome?;

        self.client = Some(client);
        self.eventloop = Some(eventloop);
        Ok(self.transition())
    }
}

impl BrokerAttempt<Subscribing> {
    /// Subscribes at exactly-once and spawns the task that feeds the inbound queue
    pub async fn subscribe(
        mut self,
        topic: &Topic,
        session: u64,
        inbound: InboundSender,
    ) -> Result<LiveSession, AttemptError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| AttemptError::Subscribe("no client".to_string()))?;
        let eventloop = self
            .eventloop
            .take()
            .ok_or_else(|| AttemptError::Subscribe("no event loop".to_string()))?;

        client
            .subscribe(topic.as_str(), QoS::ExactlyOnce)
            .await
            .map_err(|e| AttemptError::Subscribe(e.to_string()))?;
        info!("Subscribed to '{}' on {} broker {}", topic, self.role, self.host);

        let cancel = self.cancel.child_token();
        let task = tokio::spawn(run_session(eventloop, inbound, session, cancel.clone()));

        Ok(LiveSession {
            id: session,
            role: self.role,
            host: self.host.clone(),
            client,
            cancel,
            task,
        })
    }
}

/// Established broker session; dropping it cancels the session task
#[derive(Debug)]
pub struct LiveSession {
    pub id: u64,
    pub role: BrokerRole,
    pub host: String,
    client: AsyncClient,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LiveSession {
    /// Queues a QoS 2 publish without waiting on the network
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), ClientError> {
        self.client
            .try_publish(topic, QoS::ExactlyOnce, false, payload)
    }

    /// Sends DISCONNECT and stops the session task
    pub fn close(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Could not queue DISCONNECT: {}", e);
        }
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens and immediately drops a TCP connection to `host:port`
pub async fn probe_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), AttemptError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AttemptError::Cancelled),
        result = tokio::time::timeout(timeout, TcpStream::connect((host, port))) => {
            match result {
                Ok(Ok(stream)) => {
                    drop(stream);
                    Ok(())
                }
                Ok(Err(e)) => Err(AttemptError::Probe(e.to_string())),
                Err(_) => Err(AttemptError::Timeout("TCP probe")),
            }
        }
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), AttemptError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(AttemptError::Handshake(format!("{:?}", ack.code)))
                };
            }
            Ok(event) => debug!("Pre-CONNACK event: {:?}", event),
            Err(e) => return Err(AttemptError::Handshake(e.to_string())),
        }
    }
}

/// Owns the event loop; only ever pushes into the inbound queue
async fn run_session(
    mut eventloop: EventLoop,
    inbound: InboundSender,
    session: u64,
    cancel: CancellationToken,
) {
    debug!("Session {} task started", session);
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                flush_disconnect(&mut eventloop).await;
                debug!("Session {} closed locally", session);
                break;
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    inbound.push(Inbound::Message(InboundMessage::new(
                        publish.topic.clone(),
                        publish.payload.to_vec(),
                    )));
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    debug!("Subscription acknowledged: {:?}", ack.return_codes);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker closed session {}", session);
                    inbound.push(Inbound::SessionClosed { session });
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    // rumqttc would reconnect on the next poll; reconnect policy belongs to the caller
                    warn!("Session {} lost: {}", session, e);
                    inbound.push(Inbound::SessionClosed { session });
                    break;
                }
            }
        }
    }
}

/// Polls until the queued DISCONNECT is written, bounded by a short timeout
async fn flush_disconnect(eventloop: &mut EventLoop) {
    let flushed = tokio::time::timeout(DISCONNECT_FLUSH, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        debug!("DISCONNECT not flushed before timeout");
    }
}
