//! Connection task
//!
//! Owns the broker stream. Commands arrive on an mpsc channel, each with a
//! oneshot for its outcome; acknowledgements are matched to commands by
//! packet identifier. Dropping a pending oneshot (connection lost) is seen
//! by the caller as a lost connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{ConnectionStatus, MqttOptions, SubscriptionRegistry};
use crate::codec::{Decoder, Encoder};
use crate::protocol::{
    Connect, Disconnect, EncodeError, Incoming, Outgoing, Properties, PubAck, Publish, QoS,
    ReasonCode, Subscribe, SubscriptionOptions, Subscription, Unsubscribe,
};
use crate::pubsub::PubSubError;
use crate::transport::{self, BoxedStream};

const READ_BUFFER_SIZE: usize = 8 * 1024;

pub(super) type Reply<T> = oneshot::Sender<Result<T, PubSubError>>;

/// Work sent from the client handle to the connection task
#[derive(Debug)]
pub(super) enum Command {
    Publish {
        publish: Publish,
        reply: Reply<()>,
    },
    Subscribe {
        subscriptions: Vec<Subscription>,
        reply: Reply<Vec<ReasonCode>>,
    },
    Unsubscribe {
        filters: Vec<String>,
        reply: Reply<Vec<ReasonCode>>,
    },
}

impl Command {
    fn fail(self, err: PubSubError) {
        match self {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(err));
            }
            Command::Subscribe { reply, .. } | Command::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// A request waiting for its acknowledgement
enum Pending {
    Publish(Reply<()>),
    Subscribe(Reply<Vec<ReasonCode>>),
    Unsubscribe(Reply<Vec<ReasonCode>>),
    /// Subscriptions restored after a reconnect; nobody waits on them
    Resubscribe(Vec<String>),
}

impl Pending {
    /// The caller gave up waiting (ack timeout)
    fn is_abandoned(&self) -> bool {
        match self {
            Pending::Publish(reply) => reply.is_closed(),
            Pending::Subscribe(reply) | Pending::Unsubscribe(reply) => reply.is_closed(),
            Pending::Resubscribe(_) => false,
        }
    }

    fn fail(self, err: PubSubError) {
        match self {
            Pending::Publish(reply) => {
                let _ = reply.send(Err(err));
            }
            Pending::Subscribe(reply) | Pending::Unsubscribe(reply) => {
                let _ = reply.send(Err(err));
            }
            Pending::Resubscribe(_) => {}
        }
    }
}

fn connection_lost(e: impl std::fmt::Display) -> PubSubError {
    PubSubError::ConnectionLost(e.to_string())
}

/// Background task state for one broker
pub(super) struct Connection {
    options: MqttOptions,
    status: watch::Sender<ConnectionStatus>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    command_rx: mpsc::Receiver<Command>,
    stop_rx: watch::Receiver<bool>,
    decoder: Decoder,
}

impl Connection {
    pub(super) fn new(
        options: MqttOptions,
        status: watch::Sender<ConnectionStatus>,
        registry: Arc<RwLock<SubscriptionRegistry>>,
        command_rx: mpsc::Receiver<Command>,
        stop_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            options,
            status,
            registry,
            command_rx,
            stop_rx,
            decoder: Decoder::new(),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    /// Run the connection loop until stopped
    pub(super) async fn run(mut self) {
        let mut retry_interval = self.options.reconnect_interval;

        loop {
            if *self.stop_rx.borrow() {
                break;
            }

            self.set_status(ConnectionStatus::Connecting);
            debug!("'{}': connecting to {}", self.options.name, self.options.endpoint);

            match self.connect_and_run(&mut retry_interval).await {
                Ok(()) => break,
                Err(e) => {
                    error!("'{}': connection failed: {}", self.options.name, e);
                    self.set_status(ConnectionStatus::Backoff);
                    debug!(
                        "'{}': reconnecting in {:?}",
                        self.options.name, retry_interval
                    );

                    if !self.backoff(retry_interval).await {
                        break;
                    }
                    retry_interval =
                        std::cmp::min(retry_interval * 2, self.options.max_reconnect_interval);
                }
            }
        }

        self.set_status(ConnectionStatus::Stopped);
        self.command_rx.close();
        while let Ok(command) = self.command_rx.try_recv() {
            command.fail(PubSubError::Stopped);
        }
        info!("'{}': stopped", self.options.name);
    }

    /// Wait out a reconnect delay, failing commands meanwhile.
    /// Returns false when a stop was requested.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.stop_rx.changed() => return false,
                Some(command) = self.command_rx.recv() => {
                    command.fail(PubSubError::ConnectionLost(format!(
                        "not connected to {}",
                        self.options.endpoint
                    )));
                }
            }
        }
    }

    /// Connect to the broker and run the message loop.
    /// `Ok` means a requested stop; every error leads to a reconnect.
    async fn connect_and_run(&mut self, retry_interval: &mut Duration) -> Result<(), PubSubError> {
        let stream = transport::connect(
            &self.options.endpoint,
            &self.options.auth,
            self.options.connect_timeout,
        )
        .await
        .map_err(connection_lost)?;

        let (mut reader, writer) = tokio::io::split(stream);
        let mut session = Session::new(self.options.name.clone(), writer);
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        session
            .send(&Outgoing::Connect(Connect {
                client_id: self.options.client_id.clone(),
                clean_start: true,
                keep_alive: self.options.keep_alive,
                ..Default::default()
            }))
            .await?;
        debug!("'{}': CONNECT sent", self.options.name);

        let connack = timeout(
            self.options.connect_timeout,
            read_packet(&mut reader, &mut read_buf, &self.decoder),
        )
        .await
        .map_err(|_| PubSubError::Timeout)??;

        let keep_alive = match connack {
            Incoming::ConnAck(connack) => {
                if connack.reason_code.is_error() {
                    return Err(PubSubError::Rejected(format!(
                        "CONNACK: {}",
                        connack.reason_code
                    )));
                }
                info!(
                    "'{}': connected to {} (session_present={})",
                    self.options.name, self.options.endpoint, connack.session_present
                );
                connack
                    .properties
                    .server_keep_alive
                    .unwrap_or(self.options.keep_alive)
            }
            _ => {
                return Err(PubSubError::ConnectionLost(
                    "expected CONNACK".to_string(),
                ))
            }
        };

        // Restored before reporting Connected; filters registered afterwards
        // are subscribed by their own SUBSCRIBE
        let filters = self.registry.read().filters();
        if !filters.is_empty() {
            session.resubscribe(filters, self.options.qos).await?;
        }

        self.set_status(ConnectionStatus::Connected);
        *retry_interval = self.options.reconnect_interval;

        let keep_alive_enabled = keep_alive > 0;
        let period = Duration::from_secs(u64::from(keep_alive.max(1)));
        let mut keepalive_timer = interval_at(Instant::now() + period, period);
        keepalive_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Anything already buffered (e.g. sent right after CONNACK)
            while let Some((packet, consumed)) = self
                .decoder
                .decode(&read_buf)
                .map_err(|e| PubSubError::ConnectionLost(format!("Decode error: {}", e)))?
            {
                read_buf.advance(consumed);
                session.handle_incoming(packet, &self.registry).await?;
            }

            tokio::select! {
                _ = self.stop_rx.changed() => {
                    session.disconnect().await;
                    return Ok(());
                }

                command = self.command_rx.recv() => match command {
                    Some(command) => session.handle_command(command).await?,
                    None => {
                        // Every client handle is gone
                        session.disconnect().await;
                        return Ok(());
                    }
                },

                result = reader.read_buf(&mut read_buf) => {
                    let n = result.map_err(connection_lost)?;
                    if n == 0 {
                        return Err(PubSubError::ConnectionLost(
                            "connection closed by broker".to_string(),
                        ));
                    }
                }

                _ = keepalive_timer.tick(), if keep_alive_enabled => {
                    session.ping().await?;
                }
            }
        }
    }
}

/// Read until one complete packet is decoded
async fn read_packet<R: AsyncRead + Unpin>(
    reader: &mut R,
    read_buf: &mut BytesMut,
    decoder: &Decoder,
) -> Result<Incoming, PubSubError> {
    loop {
        if let Some((packet, consumed)) = decoder
            .decode(read_buf)
            .map_err(|e| PubSubError::ConnectionLost(format!("Decode error: {}", e)))?
        {
            read_buf.advance(consumed);
            return Ok(packet);
        }
        let n = reader.read_buf(read_buf).await.map_err(connection_lost)?;
        if n == 0 {
            return Err(PubSubError::ConnectionLost(
                "connection closed by broker".to_string(),
            ));
        }
    }
}

/// Write side and in-flight state of one established connection
struct Session {
    name: String,
    writer: WriteHalf<BoxedStream>,
    encoder: Encoder,
    write_buf: BytesMut,
    pending: HashMap<u16, Pending>,
    next_packet_id: u16,
    awaiting_pingresp: bool,
}

impl Session {
    fn new(name: String, writer: WriteHalf<BoxedStream>) -> Self {
        Self {
            name,
            writer,
            encoder: Encoder::new(),
            write_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            pending: HashMap::new(),
            next_packet_id: 1,
            awaiting_pingresp: false,
        }
    }

    fn encode(&mut self, packet: &Outgoing) -> Result<(), EncodeError> {
        self.write_buf.clear();
        self.encoder.encode(packet, &mut self.write_buf)
    }

    async fn flush(&mut self) -> Result<(), PubSubError> {
        self.writer
            .write_all(&self.write_buf)
            .await
            .map_err(connection_lost)?;
        self.writer.flush().await.map_err(connection_lost)
    }

    async fn send(&mut self, packet: &Outgoing) -> Result<(), PubSubError> {
        self.encode(packet)
            .map_err(|e| PubSubError::Other(format!("Encode error: {}", e)))?;
        self.flush().await
    }

    /// Next free packet identifier, skipping ones still in flight
    fn allocate_packet_id(&mut self) -> Option<u16> {
        self.pending.retain(|_, pending| !pending.is_abandoned());

        for _ in 0..u16::MAX {
            let id = self.next_packet_id;
            self.next_packet_id = if id == u16::MAX { 1 } else { id + 1 };
            if !self.pending.contains_key(&id) {
                return Some(id);
            }
        }
        None
    }

    async fn handle_command(&mut self, command: Command) -> Result<(), PubSubError> {
        let Some(packet_id) = self.allocate_packet_id() else {
            command.fail(PubSubError::QueueFull);
            return Ok(());
        };

        let (packet, pending) = match command {
            Command::Publish { mut publish, reply } => {
                if publish.qos == QoS::AtMostOnce {
                    // Nothing to wait for; done once written
                    if let Err(e) = self.encode(&Outgoing::Publish(publish)) {
                        let _ = reply.send(Err(PubSubError::Other(format!("Encode error: {}", e))));
                        return Ok(());
                    }
                    self.flush().await?;
                    let _ = reply.send(Ok(()));
                    return Ok(());
                }
                publish.packet_id = Some(packet_id);
                (Outgoing::Publish(publish), Pending::Publish(reply))
            }
            Command::Subscribe {
                subscriptions,
                reply,
            } => (
                Outgoing::Subscribe(Subscribe {
                    packet_id,
                    subscriptions,
                    properties: Properties::default(),
                }),
                Pending::Subscribe(reply),
            ),
            Command::Unsubscribe { filters, reply } => (
                Outgoing::Unsubscribe(Unsubscribe {
                    packet_id,
                    filters,
                    properties: Properties::default(),
                }),
                Pending::Unsubscribe(reply),
            ),
        };

        if let Err(e) = self.encode(&packet) {
            pending.fail(PubSubError::Other(format!("Encode error: {}", e)));
            return Ok(());
        }
        // Registered before writing so a fast ack always finds it
        self.pending.insert(packet_id, pending);
        self.flush().await
    }

    async fn resubscribe(&mut self, filters: Vec<String>, qos: QoS) -> Result<(), PubSubError> {
        let packet_id = self.allocate_packet_id().ok_or(PubSubError::QueueFull)?;
        let subscriptions = filters
            .iter()
            .map(|filter| Subscription {
                filter: filter.clone(),
                options: SubscriptionOptions::with_qos(qos),
            })
            .collect();

        self.send(&Outgoing::Subscribe(Subscribe {
            packet_id,
            subscriptions,
            properties: Properties::default(),
        }))
        .await?;
        debug!("'{}': restoring {} subscriptions", self.name, filters.len());
        self.pending.insert(packet_id, Pending::Resubscribe(filters));
        Ok(())
    }

    async fn ping(&mut self) -> Result<(), PubSubError> {
        if self.awaiting_pingresp {
            return Err(PubSubError::ConnectionLost(
                "no PINGRESP within keep alive".to_string(),
            ));
        }
        self.send(&Outgoing::PingReq).await?;
        self.awaiting_pingresp = true;
        debug!("'{}': PINGREQ sent", self.name);
        Ok(())
    }

    /// Best-effort DISCONNECT before closing
    async fn disconnect(&mut self) {
        let disconnect = Outgoing::Disconnect(Disconnect {
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        });
        if let Err(e) = self.send(&disconnect).await {
            debug!("'{}': DISCONNECT not sent: {}", self.name, e);
        }
        let _ = self.writer.shutdown().await;
        for (_, pending) in self.pending.drain() {
            pending.fail(PubSubError::Stopped);
        }
    }

    async fn handle_incoming(
        &mut self,
        packet: Incoming,
        registry: &RwLock<SubscriptionRegistry>,
    ) -> Result<(), PubSubError> {
        match packet {
            Incoming::Publish(publish) => {
                let callbacks = registry.read().matching(&publish.topic);
                if callbacks.is_empty() {
                    debug!("'{}': no subscriber for '{}'", self.name, publish.topic);
                }
                for callback in callbacks {
                    callback(publish.topic.clone(), publish.payload.clone());
                }

                match (publish.qos, publish.packet_id) {
                    (QoS::AtLeastOnce, Some(packet_id)) => {
                        self.send(&Outgoing::PubAck(PubAck::new(packet_id))).await?;
                    }
                    (QoS::ExactlyOnce, _) => {
                        warn!(
                            "'{}': QoS 2 message on '{}' was not requested",
                            self.name, publish.topic
                        );
                    }
                    _ => {}
                }
            }

            Incoming::PubAck(ack) => match self.pending.remove(&ack.packet_id) {
                Some(Pending::Publish(reply)) => {
                    let result = if ack.reason_code.is_error() {
                        Err(PubSubError::Rejected(format!("PUBACK: {}", ack.reason_code)))
                    } else {
                        Ok(())
                    };
                    let _ = reply.send(result);
                }
                other => self.unexpected_ack("PUBACK", ack.packet_id, other),
            },

            Incoming::SubAck(ack) => match self.pending.remove(&ack.packet_id) {
                Some(Pending::Subscribe(reply)) => {
                    let _ = reply.send(Ok(ack.reason_codes));
                }
                Some(Pending::Resubscribe(filters)) => {
                    for (filter, code) in filters.iter().zip(&ack.reason_codes) {
                        if code.is_error() {
                            warn!(
                                "'{}': broker refused restored subscription '{}': {}",
                                self.name, filter, code
                            );
                        }
                    }
                }
                other => self.unexpected_ack("SUBACK", ack.packet_id, other),
            },

            Incoming::UnsubAck(ack) => match self.pending.remove(&ack.packet_id) {
                Some(Pending::Unsubscribe(reply)) => {
                    let _ = reply.send(Ok(ack.reason_codes));
                }
                other => self.unexpected_ack("UNSUBACK", ack.packet_id, other),
            },

            Incoming::PingResp => {
                self.awaiting_pingresp = false;
                debug!("'{}': PINGRESP received", self.name);
            }

            Incoming::Disconnect(disconnect) => {
                warn!(
                    "'{}': broker sent DISCONNECT: {}",
                    self.name, disconnect.reason_code
                );
                return Err(PubSubError::ConnectionLost(format!(
                    "broker disconnected: {}",
                    disconnect.reason_code
                )));
            }

            Incoming::ConnAck(_) => {
                return Err(PubSubError::ConnectionLost(
                    "unexpected CONNACK".to_string(),
                ));
            }
        }
        Ok(())
    }

    fn unexpected_ack(&mut self, kind: &str, packet_id: u16, pending: Option<Pending>) {
        match pending {
            Some(pending) => {
                warn!(
                    "'{}': {} does not match the request with packet id {}",
                    self.name, kind, packet_id
                );
                pending.fail(PubSubError::Other(format!("unexpected {}", kind)));
            }
            None => debug!("'{}': {} for unknown packet id {}", self.name, kind, packet_id),
        }
    }
}
