//! Integration Tests for the MQTT client
//!
//! Each test runs a scripted broker on a local TCP port. The broker speaks
//! just enough MQTT v5 to acknowledge what the client sends, echo published
//! messages to matching subscriptions and refuse selected filters.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;

use fanmq::codec::{read_string, read_u16, read_variable_int};
use fanmq::config::{Config, ResolvedBroker};
use fanmq::mqtt::{ConnectionStatus, MqttClient, MqttOptions};
use fanmq::pubsub::{
    create_redundant_client, ContentType, MqttTransportFactory, PubSubClient, PubSubError,
    PubSubPayload, SubscribeCallback,
};
use fanmq::transport::{BrokerAuth, Endpoint, Scheme};

/// Filters starting with this prefix are refused with "not authorized"
const FORBIDDEN_PREFIX: &str = "forbidden/";

/// What the scripted broker observed
#[derive(Debug, Clone, PartialEq)]
enum Seen {
    Connect,
    Publish {
        topic: String,
        payload: Bytes,
        properties: Vec<u8>,
    },
    Subscribe(Vec<String>),
    Unsubscribe(Vec<String>),
    PingReq,
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
enum Script {
    /// Accept the connection and serve every request
    Serve,
    /// Answer CONNECT with "not authorized"
    RefuseConnect,
    /// Close the first connection right after its SUBACK, serve later ones
    DropFirstAfterSubscribe,
}

struct ScriptedBroker {
    addr: SocketAddr,
    seen: mpsc::UnboundedReceiver<Seen>,
}

impl ScriptedBroker {
    async fn start(script: Script) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, seen) = mpsc::unbounded_channel();

        let connections = Arc::new(AtomicUsize::new(0));
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let index = connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, script, index, tx.clone()));
            }
        });

        Self { addr, seen }
    }

    fn url(&self) -> String {
        format!("mqtt://{}", self.addr)
    }

    /// Next observation that is not a keepalive
    async fn next(&mut self) -> Seen {
        loop {
            let seen = timeout(Duration::from_secs(5), self.seen.recv())
                .await
                .expect("broker observation timed out")
                .expect("broker channel closed");
            if seen != Seen::PingReq {
                return seen;
            }
        }
    }
}

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let first = stream.read_u8().await.ok()?;

    let mut len_bytes = Vec::with_capacity(4);
    loop {
        let byte = stream.read_u8().await.ok()?;
        len_bytes.push(byte);
        if byte & 0x80 == 0 {
            break;
        }
    }
    let (remaining, _) = read_variable_int(&len_bytes).ok()?;

    let mut body = vec![0u8; remaining as usize];
    stream.read_exact(&mut body).await.ok()?;
    Some((first, body))
}

fn ack_list(packet_type: u8, packet_id: u16, codes: &[u8]) -> Vec<u8> {
    let mut out = vec![packet_type, (3 + codes.len()) as u8];
    out.extend_from_slice(&packet_id.to_be_bytes());
    out.push(0);
    out.extend_from_slice(codes);
    out
}

fn outbound_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
    let remaining = 2 + topic.len() + 1 + payload.len();
    let mut out = vec![0x30, remaining as u8];
    out.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    out.extend_from_slice(topic.as_bytes());
    out.push(0);
    out.extend_from_slice(payload);
    out
}

/// Filters listed after the packet id and property block
fn filters(body: &[u8], with_options: bool) -> Vec<String> {
    let (props_len, len_bytes) = read_variable_int(&body[2..]).expect("property length");
    let mut pos = 2 + len_bytes + props_len as usize;
    let mut filters = Vec::new();
    while pos < body.len() {
        let (filter, used) = read_string(&body[pos..]).expect("filter");
        filters.push(filter.to_string());
        pos += used + usize::from(with_options);
    }
    filters
}

async fn serve(
    mut stream: TcpStream,
    script: Script,
    index: usize,
    seen: mpsc::UnboundedSender<Seen>,
) {
    let mut subscribed: Vec<String> = Vec::new();

    while let Some((first, body)) = read_packet(&mut stream).await {
        let mut close_after_reply = false;
        let reply = match first >> 4 {
            1 => {
                let _ = seen.send(Seen::Connect);
                match script {
                    Script::Serve | Script::DropFirstAfterSubscribe => {
                        vec![0x20, 0x03, 0x00, 0x00, 0x00]
                    }
                    Script::RefuseConnect => {
                        let _ = stream.write_all(&[0x20, 0x03, 0x00, 0x87, 0x00]).await;
                        return;
                    }
                }
            }
            3 => {
                let qos = (first >> 1) & 0x03;
                let (topic, mut pos) = read_string(&body).expect("topic");
                let topic = topic.to_string();
                let packet_id = if qos > 0 {
                    let id = read_u16(&body[pos..]).expect("packet id");
                    pos += 2;
                    Some(id)
                } else {
                    None
                };
                let (props_len, len_bytes) = read_variable_int(&body[pos..]).expect("props");
                let props_start = pos + len_bytes;
                let props_end = props_start + props_len as usize;
                let payload = Bytes::copy_from_slice(&body[props_end..]);

                let _ = seen.send(Seen::Publish {
                    topic: topic.clone(),
                    payload: payload.clone(),
                    properties: body[props_start..props_end].to_vec(),
                });

                let mut reply = Vec::new();
                if let Some(id) = packet_id {
                    reply.extend_from_slice(&[0x40, 0x02]);
                    reply.extend_from_slice(&id.to_be_bytes());
                }
                if subscribed.contains(&topic) {
                    reply.extend(outbound_publish(&topic, &payload));
                }
                reply
            }
            8 => {
                let packet_id = read_u16(&body).expect("packet id");
                let requested = filters(&body, true);
                let codes: Vec<u8> = requested
                    .iter()
                    .map(|f| if f.starts_with(FORBIDDEN_PREFIX) { 0x87 } else { 0x01 })
                    .collect();
                subscribed.extend(
                    requested
                        .iter()
                        .filter(|f| !f.starts_with(FORBIDDEN_PREFIX))
                        .cloned(),
                );
                let _ = seen.send(Seen::Subscribe(requested));
                close_after_reply =
                    matches!(script, Script::DropFirstAfterSubscribe) && index == 0;
                ack_list(0x90, packet_id, &codes)
            }
            10 => {
                let packet_id = read_u16(&body).expect("packet id");
                let requested = filters(&body, false);
                subscribed.retain(|f| !requested.contains(f));
                let codes = vec![0x00; requested.len()];
                let _ = seen.send(Seen::Unsubscribe(requested));
                ack_list(0xB0, packet_id, &codes)
            }
            12 => {
                let _ = seen.send(Seen::PingReq);
                vec![0xD0, 0x00]
            }
            14 => {
                let _ = seen.send(Seen::Disconnect);
                return;
            }
            _ => return,
        };

        if stream.write_all(&reply).await.is_err() || close_after_reply {
            return;
        }
    }
}

fn options(name: &str, url: &str) -> MqttOptions {
    let endpoint = Endpoint::parse(url, Scheme::Tcp).expect("endpoint");
    let mut options = MqttOptions::new(name, endpoint, BrokerAuth::Anonymous);
    options.connect_timeout = Duration::from_secs(2);
    options.ack_timeout = Duration::from_secs(2);
    options.reconnect_interval = Duration::from_millis(50);
    options.max_reconnect_interval = Duration::from_millis(200);
    options
}

/// A local address nothing listens on
async fn closed_port_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("mqtt://{}", addr)
}

fn collector() -> (SubscribeCallback, mpsc::UnboundedReceiver<(String, Bytes)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: SubscribeCallback = Arc::new(move |topic, payload| {
        let _ = tx.send((topic, payload));
    });
    (callback, rx)
}

#[tokio::test]
async fn test_publish_is_acknowledged() {
    let mut broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));

    client
        .publish(
            &[PubSubPayload::new("prices/eth", &b"{\"usd\":1}"[..])],
            ContentType::Json,
        )
        .await
        .expect("publish");

    assert_eq!(broker.next().await, Seen::Connect);
    match broker.next().await {
        Seen::Publish {
            topic,
            payload,
            properties,
        } => {
            assert_eq!(topic, "prices/eth");
            assert_eq!(payload, Bytes::from_static(b"{\"usd\":1}"));
            assert!(properties
                .windows(b"application/json".len())
                .any(|w| w == b"application/json"));
        }
        other => panic!("Expected PUBLISH, got {:?}", other),
    }
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.stop();
}

#[tokio::test]
async fn test_subscribe_receives_messages() {
    let mut broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));
    let (callback, mut received) = collector();

    client
        .subscribe(&["echo/test".to_string()], callback)
        .await
        .expect("subscribe");
    assert_eq!(broker.next().await, Seen::Connect);
    assert_eq!(
        broker.next().await,
        Seen::Subscribe(vec!["echo/test".to_string()])
    );
    assert_eq!(client.subscriptions(), vec!["echo/test".to_string()]);

    client
        .publish(&[PubSubPayload::new("echo/test", &b"hello"[..])], ContentType::Binary)
        .await
        .expect("publish");

    let (topic, payload) = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("delivery timed out")
        .expect("callback dropped");
    assert_eq!(topic, "echo/test");
    assert_eq!(payload, Bytes::from_static(b"hello"));

    client.stop();
}

/// Poll the client until it reports `expected`
async fn wait_for_status(client: &MqttClient, expected: ConnectionStatus) {
    timeout(Duration::from_secs(5), async {
        while client.status() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("client never reached {:?}", expected));
}

#[tokio::test]
async fn test_subscribe_while_connecting_sends_one_subscribe() {
    let mut broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));
    let (callback, _received) = collector();

    // Issued before the first CONNACK
    client
        .subscribe(&["prices/eth".to_string()], callback)
        .await
        .expect("subscribe");
    client
        .publish(&[PubSubPayload::new("marker", &b"1"[..])], ContentType::Json)
        .await
        .expect("publish");

    assert_eq!(broker.next().await, Seen::Connect);
    assert_eq!(
        broker.next().await,
        Seen::Subscribe(vec!["prices/eth".to_string()])
    );
    assert!(
        matches!(broker.next().await, Seen::Publish { ref topic, .. } if topic == "marker"),
        "filter was subscribed more than once"
    );

    client.stop();
}

#[tokio::test]
async fn test_reconnect_restores_subscriptions() {
    let mut broker = ScriptedBroker::start(Script::DropFirstAfterSubscribe).await;
    let mut opts = options("local", &broker.url());
    opts.reconnect_interval = Duration::from_millis(500);
    opts.max_reconnect_interval = Duration::from_secs(1);
    let client = MqttClient::spawn(opts);
    let (callback, mut received) = collector();

    client
        .subscribe(&["prices/eth".to_string()], callback)
        .await
        .expect("subscribe");
    assert_eq!(broker.next().await, Seen::Connect);
    assert_eq!(
        broker.next().await,
        Seen::Subscribe(vec!["prices/eth".to_string()])
    );

    // First connection is closed after SUBACK
    wait_for_status(&client, ConnectionStatus::Backoff).await;
    let err = client
        .publish(&[PubSubPayload::new("prices/eth", &b"0"[..])], ContentType::Json)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::ConnectionLost(_)), "{:?}", err);

    wait_for_status(&client, ConnectionStatus::Connected).await;
    assert_eq!(broker.next().await, Seen::Connect);
    assert_eq!(
        broker.next().await,
        Seen::Subscribe(vec!["prices/eth".to_string()])
    );
    assert_eq!(client.subscriptions(), vec!["prices/eth".to_string()]);

    client
        .publish(&[PubSubPayload::new("prices/eth", &b"42"[..])], ContentType::Json)
        .await
        .expect("publish after reconnect");
    let (topic, payload) = timeout(Duration::from_secs(5), received.recv())
        .await
        .expect("delivery timed out")
        .expect("callback dropped");
    assert_eq!(topic, "prices/eth");
    assert_eq!(payload, Bytes::from_static(b"42"));

    client.stop();
}

#[tokio::test]
async fn test_refused_subscription_is_rejected() {
    let broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));
    let (callback, _received) = collector();

    let err = client
        .subscribe(
            &["allowed/a".to_string(), "forbidden/b".to_string()],
            callback,
        )
        .await
        .unwrap_err();

    match err {
        PubSubError::Rejected(msg) => assert!(msg.contains("forbidden/b"), "{}", msg),
        other => panic!("Expected Rejected, got {:?}", other),
    }
    assert_eq!(client.subscriptions(), vec!["allowed/a".to_string()]);

    client.stop();
}

#[tokio::test]
async fn test_unsubscribe_drops_filter() {
    let mut broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));
    let (callback, _received) = collector();
    let topics = vec!["a/+".to_string(), "b/#".to_string()];

    client.subscribe(&topics, callback).await.expect("subscribe");
    client
        .unsubscribe(&["a/+".to_string()])
        .await
        .expect("unsubscribe");

    assert_eq!(broker.next().await, Seen::Connect);
    assert_eq!(broker.next().await, Seen::Subscribe(topics.clone()));
    assert_eq!(
        broker.next().await,
        Seen::Unsubscribe(vec!["a/+".to_string()])
    );
    assert_eq!(client.subscriptions(), vec!["b/#".to_string()]);

    client.stop();
}

#[tokio::test]
async fn test_invalid_topics_fail_locally() {
    let broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));
    let (callback, _received) = collector();

    let err = client
        .publish(&[PubSubPayload::new("prices/+", &b"x"[..])], ContentType::Json)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidTopic(_)), "{:?}", err);

    let err = client
        .subscribe(&["a/#/b".to_string()], callback)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::InvalidTopic(_)), "{:?}", err);

    client.stop();
}

#[tokio::test]
async fn test_stop_sends_disconnect() {
    let mut broker = ScriptedBroker::start(Script::Serve).await;
    let client = MqttClient::spawn(options("local", &broker.url()));

    client
        .publish(&[PubSubPayload::new("t", &b"1"[..])], ContentType::Json)
        .await
        .expect("publish");
    assert_eq!(broker.next().await, Seen::Connect);
    assert!(matches!(broker.next().await, Seen::Publish { .. }));

    client.stop();
    client.stop();
    assert_eq!(broker.next().await, Seen::Disconnect);

    let err = client
        .publish(&[PubSubPayload::new("t", &b"2"[..])], ContentType::Json)
        .await
        .unwrap_err();
    assert_eq!(err, PubSubError::Stopped);
}

#[tokio::test]
async fn test_unreachable_broker_reports_connection_lost() {
    let client = MqttClient::spawn(options("dead", &closed_port_url().await));

    let err = client
        .publish(&[PubSubPayload::new("t", &b"1"[..])], ContentType::Json)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::ConnectionLost(_)), "{:?}", err);

    client.stop();
}

#[tokio::test]
async fn test_refused_connect_reports_connection_lost() {
    let mut broker = ScriptedBroker::start(Script::RefuseConnect).await;
    let client = MqttClient::spawn(options("refused", &broker.url()));

    let err = client
        .publish(&[PubSubPayload::new("t", &b"1"[..])], ContentType::Json)
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::ConnectionLost(_)), "{:?}", err);
    assert_eq!(broker.next().await, Seen::Connect);

    client.stop();
}

#[tokio::test]
async fn test_keepalive_sends_pingreq() {
    let broker = ScriptedBroker::start(Script::Serve).await;
    let mut opts = options("local", &broker.url());
    opts.keep_alive = 1;
    let client = MqttClient::spawn(opts);
    let mut seen = broker.seen;

    client
        .publish(&[PubSubPayload::new("t", &b"1"[..])], ContentType::Json)
        .await
        .expect("publish");

    let ping = timeout(Duration::from_secs(5), async {
        while let Some(s) = seen.recv().await {
            if s == Seen::PingReq {
                return true;
            }
        }
        false
    })
    .await
    .expect("no PINGREQ within keepalive");
    assert!(ping);
    assert_eq!(client.status(), ConnectionStatus::Connected);

    client.stop();
}

#[tokio::test]
async fn test_redundant_client_survives_dead_member() {
    let mut live = ScriptedBroker::start(Script::Serve).await;
    let dead_url = closed_port_url().await;

    let mut config = Config::default();
    config.client.connect_timeout = Duration::from_secs(2);
    config.client.ack_timeout = Duration::from_secs(2);
    config.client.reconnect_interval = Duration::from_millis(50);
    config.client.max_reconnect_interval = Duration::from_millis(200);

    let brokers = vec![
        ResolvedBroker {
            name: "dead".to_string(),
            host: dead_url,
            expected_requests_per_second_per_topic: 10.0,
            auth: BrokerAuth::Anonymous,
        },
        ResolvedBroker {
            name: "live".to_string(),
            host: live.url(),
            expected_requests_per_second_per_topic: 10.0,
            auth: BrokerAuth::Anonymous,
        },
    ];

    let client =
        create_redundant_client(&brokers, &config, &MqttTransportFactory).expect("client");
    assert_eq!(client.unique_name(), "dead#live");

    client
        .publish(&[PubSubPayload::new("prices/btc", &b"1"[..])], ContentType::Json)
        .await
        .expect("publish through live member");
    assert_eq!(live.next().await, Seen::Connect);
    assert!(matches!(live.next().await, Seen::Publish { topic, .. } if topic == "prices/btc"));

    client.stop();
}
