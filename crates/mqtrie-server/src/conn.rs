//! Per-connection protocol state machine.
//!
//! Each accepted connection runs two threads: the reader (this file's
//! `io_loop`), which decodes one control packet at a time under a heartbeat
//! deadline and drives the handlers synchronously, and the outbound message
//! pump, which drains a bounded frame channel into a buffered writer and
//! flushes on a ticker.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use mqtrie_core::packet::{
    self, Connack, ConnackCode, Connect, Packet, Publish, QoS, Suback, Subscribe, SUBACK_FAILURE,
};

use crate::auth::AuthContext;
use crate::error::{BrokerError, Result};
use crate::luid;
use crate::message::{Message, PublishEnvelope};
use crate::ring::MessageIdRing;
use crate::server::Shared;
use crate::topic::{Parser, Ssid, TopicKind};
use crate::trie::{Subscriber, SubscriberKind};

const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Bound of the outbound frame channel. A full channel blocks the sending
/// handler, which throttles publishers.
const SEND_QUEUE_SIZE: usize = 16;

const STATE_INIT: u8 = 0;
const STATE_CONNECTED: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Close-once signal: receivers observe the drop of the sole sender.
struct ExitChan {
    tx: Mutex<Option<Sender<()>>>,
    rx: Receiver<()>,
}

impl ExitChan {
    fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            tx: Mutex::new(Some(tx)),
            rx,
        }
    }

    fn close(&self) {
        self.tx.lock().take();
    }

    fn is_closed(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    fn receiver(&self) -> Receiver<()> {
        self.rx.clone()
    }
}

/// A broker connection.
pub struct Conn {
    shared: Arc<Shared>,
    socket: TcpStream,
    remote_addr: SocketAddr,

    /// Local unique id of this connection.
    luid: u64,
    /// Global unique id of this connection.
    guid: String,

    /// Read/write deadline; already halved from the configured heartbeat.
    /// Zero disables deadlines.
    heartbeat_timeout: Duration,
    flush_interval: Duration,
    max_msg_size: usize,
    structured_payload: bool,

    state: AtomicU8,
    username: Mutex<String>,
    client_id: Mutex<String>,

    send_tx: Sender<Bytes>,
    send_rx: Mutex<Option<Receiver<Bytes>>>,
    exit: ExitChan,

    /// Topics this connection subscribed, for clean teardown.
    sub_topics: Mutex<HashMap<String, Ssid>>,
    message_ids: Mutex<MessageIdRing>,
}

impl Conn {
    pub fn new(shared: Arc<Shared>, socket: TcpStream, remote_addr: SocketAddr) -> Result<Arc<Conn>> {
        let cfg = shared.get_cfg();
        let (send_tx, send_rx) = bounded(SEND_QUEUE_SIZE);

        shared.incr_conn_count();

        Ok(Arc::new(Conn {
            shared,
            socket,
            remote_addr,
            luid: luid::next_luid(),
            guid: Uuid::new_v4().to_string(),
            heartbeat_timeout: cfg.heartbeat_timeout() / 2,
            flush_interval: cfg.flush_interval(),
            max_msg_size: cfg.max_msg_size,
            structured_payload: cfg.structured_payload,
            state: AtomicU8::new(STATE_INIT),
            username: Mutex::new(String::new()),
            client_id: Mutex::new(String::new()),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            exit: ExitChan::new(),
            sub_topics: Mutex::new(HashMap::new()),
            message_ids: Mutex::new(MessageIdRing::new()),
        }))
    }

    /// Local UID of this connection.
    pub fn luid(&self) -> u64 {
        self.luid
    }

    #[allow(dead_code)] // Diagnostics surface
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn username(&self) -> String {
        self.username.lock().clone()
    }

    pub fn client_id(&self) -> String {
        self.client_id.lock().clone()
    }

    fn is_connected(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CONNECTED
    }

    fn set_connected(&self, username: String, client_id: String) {
        *self.username.lock() = username;
        *self.client_id.lock() = client_id;
        self.state.store(STATE_CONNECTED, Ordering::Release);
    }

    /// Inbound reader loop. Spawns the outbound pump, then decodes and
    /// dispatches one packet at a time until close, error, heartbeat expiry
    /// or broker shutdown.
    pub fn io_loop(self: &Arc<Self>) -> Result<()> {
        let reader_stream = self.socket.try_clone()?;
        let writer_stream = self.socket.try_clone()?;
        let mut reader = BufReader::with_capacity(DEFAULT_BUFFER_SIZE, reader_stream);

        let Some(send_rx) = self.send_rx.lock().take() else {
            return Err(BrokerError::ConnClosed);
        };

        let (pump_result_tx, pump_result_rx) = bounded::<Result<()>>(1);
        let pump_conn = Arc::clone(self);
        let pump_handle = thread::Builder::new()
            .name(format!("mqtrie-pump-{}", self.luid))
            .spawn(move || {
                let result = pump_conn.message_pump(writer_stream, send_rx);
                if result.is_err() {
                    // Unblock a reader waiting on the socket.
                    let _ = pump_conn.socket.shutdown(Shutdown::Both);
                }
                let _ = pump_result_tx.send(result);
            })?;

        let shutdown_rx = self.shared.shutdown_rx();
        let mut result = Ok(());

        loop {
            if self.exit.is_closed() {
                break;
            }
            if matches!(shutdown_rx.try_recv(), Err(TryRecvError::Disconnected)) {
                result = Err(BrokerError::Shutdown);
                break;
            }
            if let Ok(pump_result) = pump_result_rx.try_recv() {
                result = pump_result;
                break;
            }

            if self.heartbeat_timeout > Duration::ZERO {
                self.socket.set_read_timeout(Some(self.heartbeat_timeout))?;
            } else {
                self.socket.set_read_timeout(None)?;
            }

            match packet::read_packet(&mut reader, self.max_msg_size) {
                Ok(Some(frame)) => match self.on_packet(frame) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        result = Err(e);
                        break;
                    }
                },
                // Clean EOF at a frame boundary.
                Ok(None) => break,
                Err(mqtrie_core::Error::Io(e))
                    if self.heartbeat_timeout > Duration::ZERO
                        && matches!(
                            e.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                {
                    result = Err(BrokerError::HeartbeatExpired);
                    break;
                }
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }

        // Teardown: stop the pump (it drains and flushes), then release
        // subscriptions and the socket.
        self.exit.close();
        let _ = pump_handle.join();
        if result.is_ok() {
            if let Ok(Err(pump_err)) = pump_result_rx.try_recv() {
                result = Err(pump_err);
            }
        }
        self.close();

        match result {
            Ok(()) => debug!("[conn {}] io loop exit", self.luid),
            Err(ref e) => info!("[conn {}] io loop exit: {}", self.luid, e),
        }
        result
    }

    /// Outbound pump: drains the frame channel into a buffered writer and
    /// flushes on the ticker. Skips the flush when nothing was written since
    /// the previous tick.
    fn message_pump(&self, writer_stream: TcpStream, send_rx: Receiver<Bytes>) -> Result<()> {
        let mut writer = BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, writer_stream);
        let flush_ticker = tick(self.flush_interval);
        let exit_rx = self.exit.receiver();
        let mut dirty = false;

        loop {
            select! {
                recv(exit_rx) -> _ => break,
                recv(flush_ticker) -> _ => {
                    if dirty {
                        self.flush(&mut writer)?;
                        dirty = false;
                    }
                }
                recv(send_rx) -> frame => match frame {
                    Ok(frame) => {
                        writer.write_all(&frame)?;
                        dirty = true;
                    }
                    Err(_) => break,
                },
            }
        }

        // Drain frames enqueued before the exit signal, then flush.
        while let Ok(frame) = send_rx.try_recv() {
            writer.write_all(&frame)?;
            dirty = true;
        }
        if dirty {
            self.flush(&mut writer)?;
        }

        debug!("[conn {}] message pump exit", self.luid);
        Ok(())
    }

    fn flush(&self, writer: &mut BufWriter<TcpStream>) -> Result<()> {
        if self.heartbeat_timeout > Duration::ZERO {
            self.socket.set_write_timeout(Some(self.heartbeat_timeout))?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Enqueue serialized bytes for the pump. Blocks when the channel is
    /// full; connection close and broker shutdown unblock it.
    fn send(&self, frame: Bytes) -> Result<()> {
        let exit_rx = self.exit.receiver();
        let shutdown_rx = self.shared.shutdown_rx();
        select! {
            send(self.send_tx, frame) -> res => res.map_err(|_| BrokerError::ConnClosed),
            recv(exit_rx) -> _ => Err(BrokerError::ConnClosed),
            recv(shutdown_rx) -> _ => Err(BrokerError::Shutdown),
        }
    }

    fn send_packet(&self, packet: &Packet) -> Result<()> {
        let mut buf = Vec::with_capacity(64);
        packet::encode_packet(packet, &mut buf);
        self.send(Bytes::from(buf))
    }

    /// Dispatch one inbound frame. Returns `Ok(false)` when the connection
    /// should close cleanly.
    fn on_packet(self: &Arc<Self>, frame: Packet) -> Result<bool> {
        match frame {
            Packet::Connect(connect) => self.on_connect(connect),
            Packet::Publish(publish) => self.on_publish(publish).map(|()| true),
            Packet::Puback { packet_id } => self.on_puback(packet_id).map(|()| true),
            Packet::Subscribe(subscribe) => self.on_subscribe(subscribe).map(|()| true),
            Packet::Pingreq => {
                if !self.is_connected() {
                    return Err(BrokerError::NotConnected);
                }
                self.send_packet(&Packet::Pingresp).map(|()| true)
            }
            Packet::Disconnect => {
                if !self.is_connected() {
                    return Err(BrokerError::NotConnected);
                }
                debug!("[conn {}] client disconnect", self.luid);
                Ok(false)
            }
            other => Err(BrokerError::ProtocolViolation(format!(
                "unexpected {} frame",
                other.type_name()
            ))),
        }
    }

    fn on_connect(&self, connect: Connect) -> Result<bool> {
        if self.is_connected() {
            return Err(BrokerError::ProtocolViolation("duplicate CONNECT".into()));
        }

        let ctx = AuthContext {
            client_id: &connect.client_id,
            username: connect.username.as_deref(),
            password: connect.password.as_deref(),
            remote_addr: self.remote_addr,
        };
        if !self.shared.auth().authenticate(&ctx) {
            info!(
                "[conn {}] connect refused for client '{}'",
                self.luid, connect.client_id
            );
            self.send_packet(&Packet::Connack(Connack {
                session_present: false,
                code: ConnackCode::NotAuthorized,
            }))?;
            return Ok(false);
        }

        self.set_connected(connect.username.unwrap_or_default(), connect.client_id);
        debug!(
            "[conn {}] connected as '{}' ({})",
            self.luid,
            self.client_id(),
            self.remote_addr
        );
        self.send_packet(&Packet::Connack(Connack {
            session_present: false,
            code: ConnackCode::Accepted,
        }))?;
        Ok(true)
    }

    fn on_publish(&self, publish: Publish) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        debug!(
            "[conn {}] publish topic={} qos={:?} len={}",
            self.luid,
            publish.topic,
            publish.qos,
            publish.payload.len()
        );

        let topic = Parser::new(&publish.topic).parse()?;
        if topic.kind() != TopicKind::Static {
            return Err(BrokerError::InvalidTopic(format!(
                "publish topic '{}' must be static",
                publish.topic
            )));
        }
        let ssid = topic.to_ssid();

        let username = self.username();
        let client_id = self.client_id();

        if self.structured_payload {
            let checked = PublishEnvelope::decode(&publish.payload).and_then(|env| {
                env.validate(&username, &client_id, topic.topic_name(), publish.qos as u8)
            });
            if let Err(e) = checked {
                // The op fails; the connection continues.
                warn!(
                    "[conn {}] publish rejected on '{}': {}",
                    self.luid, publish.topic, e
                );
                return Ok(());
            }
        }

        let ttl_until = topic
            .options()
            .get("ttl")
            .and_then(|v| v.parse::<i64>().ok())
            .map(|secs| crate::message::now_ns() + secs.saturating_mul(1_000_000_000));

        let mut msg = Message::new(
            Uuid::new_v4().to_string(),
            username,
            client_id,
            topic.topic_name().to_string(),
            ssid.clone(),
            publish.qos as u8,
            ttl_until,
            publish.payload.to_vec(),
        );
        if let Some(message_type) = topic.options().get("type") {
            msg.message_type = message_type.clone();
        }

        // Sequence and persistence come before fan-out; their failure aborts
        // the publish and surfaces to the publisher.
        let message_seq = self.shared.seqgen().gen_message_seq(&topic)?;
        msg.set_message_seq(message_seq);
        self.shared.mstore().store_message(&msg)?;

        let subscribers = self.shared.sub_trie().lookup(&ssid);
        for subscriber in subscribers.iter() {
            // Per-subscriber send errors do not abort the fan-out.
            if let Err(e) = subscriber.send_message(&msg) {
                info!(
                    "[conn {}] send to subscriber {} failed: {}",
                    self.luid,
                    subscriber.id(),
                    e
                );
            }
        }

        if publish.qos != QoS::AtMostOnce {
            if let Some(packet_id) = publish.packet_id {
                self.send_packet(&Packet::Puback { packet_id })?;
            }
        }

        Ok(())
    }

    fn on_subscribe(self: &Arc<Self>, subscribe: Subscribe) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }

        // One topic per SUBSCRIBE frame.
        if subscribe.topics.len() != 1 {
            warn!(
                "[conn {}] subscribe with {} topics",
                self.luid,
                subscribe.topics.len()
            );
            return self.send_packet(&Packet::Suback(Suback {
                packet_id: subscribe.packet_id,
                return_codes: vec![SUBACK_FAILURE],
            }));
        }
        let (topic_name, requested_qos) = &subscribe.topics[0];

        let topic = match Parser::new(topic_name).parse() {
            Ok(topic) => topic,
            Err(e) => {
                warn!(
                    "[conn {}] invalid subscribe topic '{}': {}",
                    self.luid, topic_name, e
                );
                return self.send_packet(&Packet::Suback(Suback {
                    packet_id: subscribe.packet_id,
                    return_codes: vec![SUBACK_FAILURE],
                }));
            }
        };

        // Persist first; the ack goes out only after both the store and the
        // trie insert succeed.
        self.shared
            .sstore()
            .store_subscription(&self.client_id(), &topic)?;

        let ssid = topic.to_ssid();
        self.shared
            .sub_trie()
            .subscribe(&ssid, Arc::clone(self) as Arc<dyn Subscriber>)?;
        self.sub_topics.lock().insert(topic_name.clone(), ssid);

        let granted = (*requested_qos).min(QoS::AtLeastOnce);
        self.send_packet(&Packet::Suback(Suback {
            packet_id: subscribe.packet_id,
            return_codes: vec![granted as u8],
        }))
    }

    fn on_puback(&self, packet_id: u16) -> Result<()> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        debug!("[conn {}] puback id={}", self.luid, packet_id);
        self.message_ids.lock().free_id(packet_id);
        Ok(())
    }

    /// Close the connection: signal the pump, unsubscribe every tracked
    /// topic, and shut the socket down. Idempotent.
    pub fn close(&self) {
        let prev = self.state.swap(STATE_CLOSING, Ordering::AcqRel);
        if prev == STATE_CLOSING || prev == STATE_CLOSED {
            return;
        }

        self.exit.close();

        for (topic_name, ssid) in self.sub_topics.lock().drain() {
            debug!("[conn {}] close unsubscribe '{}'", self.luid, topic_name);
            if let Err(e) = self.shared.sub_trie().unsubscribe(&ssid, self.luid) {
                warn!(
                    "[conn {}] unsubscribe '{}' on close: {}",
                    self.luid, topic_name, e
                );
            }
        }

        let _ = self.socket.shutdown(Shutdown::Both);
        self.state.store(STATE_CLOSED, Ordering::Release);
    }
}

impl Subscriber for Conn {
    fn id(&self) -> u64 {
        self.luid
    }

    fn kind(&self) -> SubscriberKind {
        SubscriberKind::Local
    }

    /// Serialize a PUBLISH for this subscriber and enqueue it on the
    /// outbound pump. QoS > 0 deliveries take a packet id from the ring;
    /// the id is freed by the peer's PUBACK.
    fn send_message(&self, msg: &Message) -> Result<()> {
        let qos = if msg.qos == 0 {
            QoS::AtMostOnce
        } else {
            QoS::AtLeastOnce
        };
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.message_ids.lock().get_id()?),
        };

        let publish = Publish {
            dup: false,
            qos,
            retain: false,
            topic: msg.topic_name.clone(),
            packet_id,
            payload: Bytes::from(msg.payload.clone()),
        };
        let mut buf = Vec::with_capacity(64 + publish.payload.len());
        packet::encode_publish(&publish, &mut buf);

        let sent = self.send(Bytes::from(buf));
        if sent.is_err() {
            if let Some(packet_id) = packet_id {
                self.message_ids.lock().free_id(packet_id);
            }
        }
        sent
    }
}
