use crate::reading::TopicMessage;
use crate::source_coordinator::TelemetrySource;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, Publish, QoS, Transport};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const REQUEST_CAPACITY: usize = 32;

/// Wire transport to the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerTransport {
    Tcp,
    WebSocket,
}

/// Broker location parsed from `mqtt://host:port` or `ws://host:port/path`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub transport: BrokerTransport,
    pub host: String,
    pub port: u16,
    /// Full URL, which the websocket transport connects to as-is
    pub url: String,
}

impl BrokerAddress {
    pub fn parse(url: &str) -> Result<Self, String> {
        let url = url.trim();
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| "expected scheme://host[:port]".to_string())?;
        let (transport, default_port) = match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => (BrokerTransport::Tcp, 1883),
            "ws" => (BrokerTransport::WebSocket, 80),
            other => return Err(format!("unsupported scheme `{other}`, expected mqtt, tcp or ws")),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>()
                    .map_err(|e| format!("invalid port `{port}`: {e}"))?,
            ),
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err("missing broker host".to_string());
        }

        Ok(Self {
            transport,
            host: host.to_string(),
            port,
            url: url.to_string(),
        })
    }
}

/// Subscribes to every channel topic on an MQTT broker and forwards each publish
pub struct MqttReader {
    broker: BrokerAddress,
    client_id: String,
    topics: Vec<String>,
}

impl MqttReader {
    pub fn new(broker: BrokerAddress, client_id: impl Into<String>, topics: Vec<String>) -> Self {
        info!("MQTT Reader Config:");
        info!("  Broker: {}", broker.url);
        for topic in &topics {
            info!("  Topic: {topic}");
        }

        Self {
            broker,
            client_id: client_id.into(),
            topics,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = match self.broker.transport {
            BrokerTransport::Tcp => {
                MqttOptions::new(&self.client_id, &self.broker.host, self.broker.port)
            }
            BrokerTransport::WebSocket => {
                let mut options =
                    MqttOptions::new(&self.client_id, &self.broker.url, self.broker.port);
                options.set_transport(Transport::Ws);
                options
            }
        };
        options.set_keep_alive(KEEP_ALIVE);
        options.set_clean_session(true);
        options
    }

    async fn run(&mut self, update_sender: Sender<TopicMessage>) {
        const MAX_CONSECUTIVE_ERRORS: u32 = 10;
        info!("Starting MQTT reader");

        let (client, mut eventloop) = AsyncClient::new(self.options(), REQUEST_CAPACITY);
        let mut consecutive_errors = 0u32;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    consecutive_errors = 0;
                    info!("Connected to MQTT broker at {}", self.broker.url);
                    // Clean sessions forget subscriptions, so every connect subscribes again
                    if let Err(e) = subscribe_all(&client, &self.topics).await {
                        warn!("MQTT subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = to_topic_message(&publish);
                    debug!("MQTT message {} = {:?}", message.topic, message.payload);
                    if update_sender.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        "MQTT connection error ({}/{}): {}",
                        consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        warn!("Too many consecutive MQTT failures. Shutting down MQTT reader.");
                        break;
                    }
                    sleep(reconnect_delay(consecutive_errors)).await;
                }
            }
        }

        if let Err(e) = client.try_disconnect() {
            debug!("MQTT disconnect not sent: {e}");
        }
        info!("MQTT reader exiting");
    }
}

impl TelemetrySource for MqttReader {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn spawn(mut self: Box<Self>, update_sender: Sender<TopicMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(update_sender).await;
        })
    }
}

async fn subscribe_all(client: &AsyncClient, topics: &[String]) -> Result<(), rumqttc::ClientError> {
    for topic in topics {
        client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
    }
    Ok(())
}

/// Exponential backoff capped at 8 seconds
fn reconnect_delay(consecutive_errors: u32) -> Duration {
    Duration::from_millis(250 << consecutive_errors.saturating_sub(1).min(5))
}

pub fn to_topic_message(publish: &Publish) -> TopicMessage {
    TopicMessage::new(
        publish.topic.clone(),
        String::from_utf8_lossy(&publish.payload).into_owned(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_broker_address() {
        let tcp = BrokerAddress::parse("mqtt://broker.local:1884").unwrap();
        assert_eq!(tcp.transport, BrokerTransport::Tcp);
        assert_eq!((tcp.host.as_str(), tcp.port), ("broker.local", 1884));

        let ws = BrokerAddress::parse("ws://raspberrypi.local:9001").unwrap();
        assert_eq!(ws.transport, BrokerTransport::WebSocket);
        assert_eq!((ws.host.as_str(), ws.port), ("raspberrypi.local", 9001));
        assert_eq!(ws.url, "ws://raspberrypi.local:9001");

        assert_eq!(BrokerAddress::parse("tcp://10.0.0.2").unwrap().port, 1883);
        assert!(BrokerAddress::parse("broker.local:1883").is_err());
        assert!(BrokerAddress::parse("http://broker.local").is_err());
        assert!(BrokerAddress::parse("mqtt://:1883").is_err());
        assert!(BrokerAddress::parse("mqtt://broker:port").is_err());
    }

    #[test]
    fn test_reconnect_delay_is_capped() {
        assert_eq!(reconnect_delay(1), Duration::from_millis(250));
        assert_eq!(reconnect_delay(2), Duration::from_millis(500));
        assert_eq!(reconnect_delay(10), Duration::from_secs(8));
    }

    #[test]
    fn test_publish_becomes_topic_message() {
        let publish = Publish::new("solar/emergency", QoS::AtMostOnce, "Critical Alert: manual");
        let message = to_topic_message(&publish);
        assert_eq!(message.topic, "solar/emergency");
        assert_eq!(message.payload, "Critical Alert: manual");
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let header = stream.read_u8().await?;
        let mut remaining = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            remaining |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0; remaining];
        stream.read_exact(&mut body).await?;
        Ok((header, body))
    }

    /// Accepts the CONNECT, acknowledges `topics` subscriptions and returns the filters
    async fn accept_session(listener: &TcpListener, topics: usize) -> (TcpStream, Vec<String>) {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, 0x10, "Expected CONNECT");
        stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut filters = Vec::new();
        while filters.len() < topics {
            let (header, body) = read_packet(&mut stream).await.unwrap();
            match header {
                0x82 => {
                    let len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    filters.push(String::from_utf8(body[4..4 + len].to_vec()).unwrap());
                    stream
                        .write_all(&[0x90, 0x03, body[0], body[1], 0x00])
                        .await
                        .unwrap();
                }
                0xC0 => stream.write_all(&[0xD0, 0x00]).await.unwrap(),
                _ => {}
            }
        }
        (stream, filters)
    }

    async fn publish(stream: &mut TcpStream, topic: &str, payload: &str) {
        let remaining = 2 + topic.len() + payload.len();
        assert!(remaining < 128);
        let mut packet = vec![0x30, remaining as u8];
        packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
        packet.extend_from_slice(topic.as_bytes());
        packet.extend_from_slice(payload.as_bytes());
        stream.write_all(&packet).await.unwrap();
    }

    #[tokio::test]
    async fn test_subscribes_forwards_and_resubscribes_after_reconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let topics = vec!["solar/voltage".to_string(), "solar/emergency".to_string()];

        let broker = tokio::spawn(async move {
            let (mut first, filters) = accept_session(&listener, 2).await;
            assert_eq!(filters, vec!["solar/voltage", "solar/emergency"]);
            publish(&mut first, "solar/voltage", "260").await;
            // Broker restarts and forgets the clean session
            drop(first);

            let (mut second, filters) = accept_session(&listener, 2).await;
            assert_eq!(filters.len(), 2);
            publish(&mut second, "solar/emergency", "Safe").await;
            // Keep the connection open until the test is done with it
            sleep(Duration::from_secs(5)).await;
        });

        let address = BrokerAddress::parse(&format!("mqtt://127.0.0.1:{port}")).unwrap();
        let reader = Box::new(MqttReader::new(address, "solar-test", topics));
        assert_eq!(reader.name(), "mqtt");
        let (tx, mut rx) = mpsc::channel(8);
        let handle = reader.spawn(tx);

        let timeout = Duration::from_secs(5);
        let first = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!((first.topic.as_str(), first.payload.as_str()), ("solar/voltage", "260"));
        let second = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!((second.topic.as_str(), second.payload.as_str()), ("solar/emergency", "Safe"));

        handle.abort();
        broker.abort();
    }
}
