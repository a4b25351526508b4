//! Broker server: the composition root of the core.

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{info, warn};
use parking_lot::{Mutex, RwLock};

use crate::auth::{AllowAll, Authenticator};
use crate::config::Config;
use crate::error::Result;
use crate::storage::{
    self, MessageStore, SequenceGenerator, SubscriptionStore,
};
use crate::tcp::{self, TcpServer};
use crate::trie::SubTrie;

/// State shared by every connection: the swappable config, the subscription
/// trie, the storage collaborators, the auth hook, and the broker-wide
/// cancellation signal.
pub struct Shared {
    cfg: RwLock<Arc<Config>>,
    sub_trie: SubTrie,
    mstore: Box<dyn MessageStore>,
    sstore: Box<dyn SubscriptionStore>,
    seqgen: Box<dyn SequenceGenerator>,
    auth: Box<dyn Authenticator>,
    shutdown_rx: Receiver<()>,
    conn_count: AtomicI64,
}

impl Shared {
    pub fn get_cfg(&self) -> Arc<Config> {
        Arc::clone(&self.cfg.read())
    }

    /// Swap the whole config value.
    #[allow(dead_code)] // Reserved for config reload
    pub fn swap_cfg(&self, cfg: Arc<Config>) {
        *self.cfg.write() = cfg;
    }

    pub fn sub_trie(&self) -> &SubTrie {
        &self.sub_trie
    }

    pub fn mstore(&self) -> &dyn MessageStore {
        self.mstore.as_ref()
    }

    pub fn sstore(&self) -> &dyn SubscriptionStore {
        self.sstore.as_ref()
    }

    pub fn seqgen(&self) -> &dyn SequenceGenerator {
        self.seqgen.as_ref()
    }

    pub fn auth(&self) -> &dyn Authenticator {
        self.auth.as_ref()
    }

    /// Cancellation signal: disconnects when the broker shuts down.
    pub fn shutdown_rx(&self) -> Receiver<()> {
        self.shutdown_rx.clone()
    }

    pub fn incr_conn_count(&self) {
        self.conn_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr_conn_count(&self) {
        self.conn_count.fetch_sub(1, Ordering::Relaxed);
    }

    #[allow(dead_code)] // Diagnostics surface
    pub fn conn_count(&self) -> i64 {
        self.conn_count.load(Ordering::Relaxed)
    }
}

/// The broker server.
pub struct Server {
    shared: Arc<Shared>,
    tcp_server: Arc<TcpServer>,
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    accept_handle: Mutex<Option<JoinHandle<io::Result<()>>>>,
    start_time: Instant,
}

impl Server {
    /// Bind the listener and load the storage providers named in the config.
    pub fn new(cfg: Config) -> Result<Server> {
        Self::with_auth(cfg, Box::new(AllowAll))
    }

    pub fn with_auth(cfg: Config, auth: Box<dyn Authenticator>) -> Result<Server> {
        let listener = TcpListener::bind(&cfg.tcp_address)?;
        let local_addr = listener.local_addr()?;
        info!("mqtrie listening on {}", local_addr);

        let mstore = storage::load_message_store(&cfg.mstorage)?;
        let sstore = storage::load_subscription_store(&cfg.sstorage)?;
        let seqgen = storage::load_sequence_generator(&cfg.seqgen)?;

        let (shutdown_tx, shutdown_rx) = bounded(0);

        let shared = Arc::new(Shared {
            cfg: RwLock::new(Arc::new(cfg)),
            sub_trie: SubTrie::new(),
            mstore,
            sstore,
            seqgen,
            auth,
            shutdown_rx,
            conn_count: AtomicI64::new(0),
        });
        let tcp_server = Arc::new(TcpServer::new(Arc::clone(&shared)));

        Ok(Server {
            shared,
            tcp_server,
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            accept_handle: Mutex::new(None),
            start_time: Instant::now(),
        })
    }

    /// Launch the accept loop.
    pub fn start(&self) -> Result<()> {
        let Some(listener) = self.listener.lock().take() else {
            return Ok(()); // already started
        };
        let tcp_server = Arc::clone(&self.tcp_server);
        let shutdown_rx = self.shared.shutdown_rx();
        let handle = thread::Builder::new()
            .name("mqtrie-accept".to_string())
            .spawn(move || tcp::serve(listener, tcp_server, shutdown_rx))?;
        *self.accept_handle.lock() = Some(handle);
        Ok(())
    }

    /// Start and block until the accept loop returns.
    pub fn run(&self) -> Result<()> {
        self.start()?;
        let handle = self.accept_handle.lock().take();
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| io::Error::other("accept loop panicked"))??;
        }
        Ok(())
    }

    /// Graceful shutdown: cancel the broker-wide token (which also ends the
    /// accept loop), close all live connections, join outstanding handler
    /// threads, and close the storage providers.
    #[allow(dead_code)] // Used in tests and intended for supervised shutdown
    pub fn exit(&self) {
        info!(
            "mqtrie exiting after {:.1}s",
            self.start_time.elapsed().as_secs_f64()
        );

        self.shutdown_tx.lock().take();
        self.tcp_server.close_all();
        if let Some(handle) = self.accept_handle.lock().take() {
            let _ = handle.join();
        }

        if let Err(e) = self.shared.mstore().close() {
            warn!("message store close: {}", e);
        }
        if let Err(e) = self.shared.sstore().close() {
            warn!("subscription store close: {}", e);
        }
        if let Err(e) = self.shared.seqgen().close() {
            warn!("sequence generator close: {}", e);
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[allow(dead_code)] // Used in tests
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    #[allow(dead_code)] // Used in tests
    pub fn conn_count(&self) -> usize {
        self.tcp_server.conn_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{BufReader, Write};
    use std::net::TcpStream;
    use std::time::Duration;

    use bytes::Bytes;

    use mqtrie_core::packet::{
        self, Connack, ConnackCode, Connect, Packet, Publish, QoS, Suback, Subscribe,
        SUBACK_FAILURE,
    };

    use crate::message::PublishEnvelope;
    use crate::topic::Parser;

    fn test_config() -> Config {
        Config {
            tcp_address: "127.0.0.1:0".to_string(),
            flush_interval: 10,
            ..Default::default()
        }
    }

    fn start_server(cfg: Config) -> Server {
        let server = Server::new(cfg).unwrap();
        server.start().unwrap();
        server
    }

    struct TestClient {
        stream: TcpStream,
        reader: BufReader<TcpStream>,
    }

    impl TestClient {
        fn open(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream.set_nodelay(true).unwrap();
            let reader = BufReader::new(stream.try_clone().unwrap());
            Self { stream, reader }
        }

        fn connect(addr: SocketAddr, client_id: &str, username: &str) -> Self {
            let mut client = Self::open(addr);
            client.send(&Packet::Connect(Connect {
                protocol_name: "MQTT".to_string(),
                protocol_version: 4,
                clean_session: true,
                keep_alive: 60,
                client_id: client_id.to_string(),
                will: None,
                username: Some(username.to_string()),
                password: None,
            }));
            match client.recv() {
                Packet::Connack(Connack {
                    code: ConnackCode::Accepted,
                    ..
                }) => {}
                other => panic!("expected CONNACK accepted, got {}", other.type_name()),
            }
            client
        }

        fn send(&mut self, frame: &Packet) {
            let mut buf = Vec::new();
            packet::encode_packet(frame, &mut buf);
            self.stream.write_all(&buf).unwrap();
        }

        fn recv(&mut self) -> Packet {
            packet::read_packet(&mut self.reader, 0)
                .unwrap()
                .expect("connection closed")
        }

        /// Receive with a short deadline; `None` when nothing arrives.
        fn try_recv(&mut self, wait: Duration) -> Option<Packet> {
            self.stream.set_read_timeout(Some(wait)).unwrap();
            let result = packet::read_packet(&mut self.reader, 0);
            self.stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            match result {
                Ok(frame) => frame,
                Err(mqtrie_core::Error::Io(ref e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    None
                }
                Err(e) => panic!("read error: {}", e),
            }
        }

        fn subscribe(&mut self, topic: &str) {
            self.send(&Packet::Subscribe(Subscribe {
                packet_id: 1,
                topics: vec![(topic.to_string(), QoS::AtMostOnce)],
            }));
            match self.recv() {
                Packet::Suback(Suback { return_codes, .. }) => {
                    assert_ne!(return_codes[0], SUBACK_FAILURE, "subscribe {}", topic)
                }
                other => panic!("expected SUBACK, got {}", other.type_name()),
            }
        }

        fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>) {
            self.send(&Packet::Publish(Publish {
                dup: false,
                qos,
                retain: false,
                topic: topic.to_string(),
                packet_id,
                payload: Bytes::copy_from_slice(payload),
            }));
        }

        /// True once the server has closed this connection.
        fn closed_by_server(&mut self, wait: Duration) -> bool {
            self.stream.set_read_timeout(Some(wait)).unwrap();
            match packet::read_packet(&mut self.reader, 0) {
                Ok(None) => true,
                Ok(Some(frame)) => panic!("unexpected {} frame", frame.type_name()),
                Err(mqtrie_core::Error::Io(ref e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    false
                }
                Err(_) => true,
            }
        }
    }

    #[test]
    fn test_subscribe_publish_static_single_match() {
        let server = start_server(test_config());
        let addr = server.local_addr();

        let mut subscriber = TestClient::connect(addr, "sub-a", "alice");
        subscriber.subscribe("hello/mqtt/zqtt");

        let mut publisher = TestClient::connect(addr, "pub-b", "bob");
        publisher.publish("hello/mqtt/zqtt", b"x", QoS::AtMostOnce, None);

        match subscriber.recv() {
            Packet::Publish(publish) => {
                assert_eq!(publish.topic, "hello/mqtt/zqtt");
                assert_eq!(&publish.payload[..], b"x");
            }
            other => panic!("expected PUBLISH, got {}", other.type_name()),
        }
        // Exactly one frame.
        assert!(subscriber.try_recv(Duration::from_millis(200)).is_none());

        server.exit();
    }

    #[test]
    fn test_wildcard_match_set() {
        let server = start_server(test_config());
        let addr = server.local_addr();

        let topics = [
            "#",
            "+",
            "hello/#",
            "hello/+",
            "hello/+/zqtt",
            "hello/mqtt/#",
            "hello/mqtt/+",
            "hello/mqtt/zqtt",
            "hello/mqtt/+/+",
            "hello/mqtt/+/foo",
            "hello/mqtt/zqtt/foo",
        ];

        let mut subscribers: Vec<(&str, TestClient)> = topics
            .iter()
            .enumerate()
            .map(|(i, topic)| {
                let mut client = TestClient::connect(addr, &format!("sub-{}", i), "alice");
                client.subscribe(topic);
                (*topic, client)
            })
            .collect();

        let mut publisher = TestClient::connect(addr, "pub", "bob");

        let expect_zqtt = [
            "#",
            "hello/#",
            "hello/+/zqtt",
            "hello/mqtt/#",
            "hello/mqtt/+",
            "hello/mqtt/zqtt",
        ];
        publisher.publish("hello/mqtt/zqtt", b"m1", QoS::AtMostOnce, None);
        for (topic, client) in subscribers.iter_mut() {
            if expect_zqtt.contains(topic) {
                match client.recv() {
                    Packet::Publish(publish) => {
                        assert_eq!(publish.topic, "hello/mqtt/zqtt", "subscriber {}", topic);
                        assert_eq!(&publish.payload[..], b"m1");
                    }
                    other => panic!("{}: expected PUBLISH, got {}", topic, other.type_name()),
                }
            } else {
                assert!(
                    client.try_recv(Duration::from_millis(200)).is_none(),
                    "subscriber {} must not match hello/mqtt/zqtt",
                    topic
                );
            }
        }

        let expect_deep = ["#", "hello/#", "hello/mqtt/#", "hello/mqtt/+/+"];
        publisher.publish("hello/mqtt/ohh/bilibili", b"m2", QoS::AtMostOnce, None);
        for (topic, client) in subscribers.iter_mut() {
            if expect_deep.contains(topic) {
                match client.recv() {
                    Packet::Publish(publish) => {
                        assert_eq!(publish.topic, "hello/mqtt/ohh/bilibili");
                        assert_eq!(&publish.payload[..], b"m2");
                    }
                    other => panic!("{}: expected PUBLISH, got {}", topic, other.type_name()),
                }
            } else {
                assert!(
                    client.try_recv(Duration::from_millis(200)).is_none(),
                    "subscriber {} must not match hello/mqtt/ohh/bilibili",
                    topic
                );
            }
        }

        server.exit();
    }

    #[test]
    fn test_qos1_publish_acked_and_delivered() {
        let server = start_server(test_config());
        let addr = server.local_addr();

        let mut subscriber = TestClient::connect(addr, "sub", "alice");
        subscriber.subscribe("metrics/cpu");

        let mut publisher = TestClient::connect(addr, "pub", "bob");
        publisher.publish("metrics/cpu", b"93", QoS::AtLeastOnce, Some(11));

        match publisher.recv() {
            Packet::Puback { packet_id } => assert_eq!(packet_id, 11),
            other => panic!("expected PUBACK, got {}", other.type_name()),
        }

        match subscriber.recv() {
            Packet::Publish(publish) => {
                assert_eq!(publish.qos, QoS::AtLeastOnce);
                let packet_id = publish.packet_id.expect("QoS 1 delivery has a packet id");
                assert_ne!(packet_id, 0);
                // Acknowledge so the broker frees the ring id.
                subscriber.send(&Packet::Puback { packet_id });
            }
            other => panic!("expected PUBLISH, got {}", other.type_name()),
        }

        server.exit();
    }

    #[test]
    fn test_pingreq_pingresp() {
        let server = start_server(test_config());
        let mut client = TestClient::connect(server.local_addr(), "ping", "alice");
        client.send(&Packet::Pingreq);
        assert!(matches!(client.recv(), Packet::Pingresp));
        server.exit();
    }

    #[test]
    fn test_first_frame_must_be_connect() {
        let server = start_server(test_config());
        let mut client = TestClient::open(server.local_addr());

        client.publish("hello/mqtt/zqtt", b"x", QoS::AtMostOnce, None);
        assert!(client.closed_by_server(Duration::from_secs(5)));

        // No observable side effect: nothing was stored.
        let stored = server
            .shared()
            .mstore()
            .query_message(&Default::default())
            .unwrap();
        assert!(stored.is_empty());

        server.exit();
    }

    #[test]
    fn test_subscribe_multiple_topics_rejected() {
        let server = start_server(test_config());
        let mut client = TestClient::connect(server.local_addr(), "multi", "alice");

        client.send(&Packet::Subscribe(Subscribe {
            packet_id: 5,
            topics: vec![
                ("a/b".to_string(), QoS::AtMostOnce),
                ("c/d".to_string(), QoS::AtMostOnce),
            ],
        }));
        match client.recv() {
            Packet::Suback(Suback {
                packet_id,
                return_codes,
            }) => {
                assert_eq!(packet_id, 5);
                assert_eq!(return_codes, vec![SUBACK_FAILURE]);
            }
            other => panic!("expected SUBACK, got {}", other.type_name()),
        }

        // The connection survives the rejected subscribe.
        client.send(&Packet::Pingreq);
        assert!(matches!(client.recv(), Packet::Pingresp));

        server.exit();
    }

    #[test]
    fn test_heartbeat_close_unsubscribes() {
        let mut cfg = test_config();
        cfg.heartbeat_timeout = 300; // read deadline 150ms
        let server = start_server(cfg);

        let mut client = TestClient::connect(server.local_addr(), "idle", "alice");
        client.subscribe("hello/mqtt/zqtt");

        let ssid = Parser::new("hello/mqtt/zqtt").parse().unwrap().to_ssid();
        assert_eq!(server.shared().sub_trie().lookup(&ssid).len(), 1);

        // Send nothing; the server must drop us after the deadline.
        assert!(client.closed_by_server(Duration::from_secs(5)));

        // The close path detached the subscription from the trie.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if server.shared().sub_trie().lookup(&ssid).is_empty() {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "subscription was not removed after heartbeat close"
            );
            std::thread::sleep(Duration::from_millis(20));
        }

        server.exit();
    }

    #[test]
    fn test_structured_payload_identity_check() {
        let mut cfg = test_config();
        cfg.structured_payload = true;
        let server = start_server(cfg);
        let addr = server.local_addr();

        let mut subscriber = TestClient::connect(addr, "sub", "alice");
        subscriber.subscribe("events/audit");

        let mut publisher = TestClient::connect(addr, "pub-1", "bob");

        // Wrong username: the op fails, the connection survives.
        let bad = serde_json::to_vec(&PublishEnvelope {
            username: "mallory".to_string(),
            client_id: "pub-1".to_string(),
            topic_name: "events/audit".to_string(),
            qos: 0,
        })
        .unwrap();
        publisher.publish("events/audit", &bad, QoS::AtMostOnce, None);
        assert!(subscriber.try_recv(Duration::from_millis(200)).is_none());
        publisher.send(&Packet::Pingreq);
        assert!(matches!(publisher.recv(), Packet::Pingresp));

        // Matching identity goes through.
        let good = serde_json::to_vec(&PublishEnvelope {
            username: "bob".to_string(),
            client_id: "pub-1".to_string(),
            topic_name: "events/audit".to_string(),
            qos: 0,
        })
        .unwrap();
        publisher.publish("events/audit", &good, QoS::AtMostOnce, None);
        match subscriber.recv() {
            Packet::Publish(publish) => assert_eq!(publish.topic, "events/audit"),
            other => panic!("expected PUBLISH, got {}", other.type_name()),
        }

        server.exit();
    }

    #[test]
    fn test_publish_is_stored_with_sequence() {
        let server = start_server(test_config());
        let mut publisher = TestClient::connect(server.local_addr(), "pub", "bob");

        for payload in [b"1".as_slice(), b"2", b"3"] {
            publisher.publish("seq/topic", payload, QoS::AtMostOnce, None);
        }
        // A later publish on the same connection is ordered after the others.
        publisher.publish("seq/topic?type=sensor", b"4", QoS::AtMostOnce, None);
        publisher.send(&Packet::Pingreq);
        assert!(matches!(publisher.recv(), Packet::Pingresp));

        let stored = server
            .shared()
            .mstore()
            .query_message(&crate::storage::QueryOptions {
                topic: Some("seq/topic".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(stored.len(), 4);
        let seqs: Vec<i64> = stored.iter().map(|m| m.message_seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
        assert!(stored.iter().all(|m| m.username == "bob"));

        let typed = server
            .shared()
            .mstore()
            .query_message(&crate::storage::QueryOptions {
                message_type: Some("sensor".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(typed.len(), 1);
        assert_eq!(&typed[0].payload, b"4");

        server.exit();
    }

    #[test]
    fn test_exit_closes_connections() {
        let server = start_server(test_config());
        let mut client = TestClient::connect(server.local_addr(), "c", "alice");

        server.exit();

        assert!(client.closed_by_server(Duration::from_secs(5)));

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while server.conn_count() > 0 {
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_invalid_publish_topic_closes_connection() {
        let server = start_server(test_config());
        let mut client = TestClient::connect(server.local_addr(), "bad", "alice");

        // Publishing on a wildcard topic is invalid.
        client.publish("hello/+", b"x", QoS::AtMostOnce, None);
        assert!(client.closed_by_server(Duration::from_secs(5)));

        server.exit();
    }
}
