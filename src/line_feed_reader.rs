use crate::reading::TopicMessage;
use crate::source_coordinator::TelemetrySource;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// How a line feed ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    /// The remote end closed the stream (or stdin hit EOF)
    Closed,
    /// The ingestion side dropped its receiver
    ReceiverGone,
}

/// Where the line feed comes from
#[derive(Debug, Clone, PartialEq)]
pub enum LineFeed {
    Tcp(SocketAddr),
    Stdin,
}

/// Reads `<topic> <payload>` lines from a TCP broker bridge or stdin
pub struct LineFeedReader {
    feed: LineFeed,
}

impl LineFeedReader {
    pub fn new(feed: LineFeed) -> Self {
        Self { feed }
    }

    async fn run(&mut self, update_sender: Sender<TopicMessage>) {
        match self.feed.clone() {
            LineFeed::Stdin => {
                info!("Reading telemetry lines from stdin");
                let reader = BufReader::new(tokio::io::stdin());
                if let Err(e) = forward_lines(reader, &update_sender).await {
                    warn!("Stdin read failed: {e}");
                }
            }
            LineFeed::Tcp(address) => Self::run_tcp(address, update_sender).await,
        }
        info!("Line feed reader exiting");
    }

    async fn run_tcp(address: SocketAddr, update_sender: Sender<TopicMessage>) {
        const MAX_CONSECUTIVE_ERRORS: u32 = 10;
        let mut consecutive_errors = 0u32;

        loop {
            let Some(stream) = connect_with_retry(address).await else {
                consecutive_errors += 1;
                warn!(
                    "Line feed unreachable ({}/{})",
                    consecutive_errors, MAX_CONSECUTIVE_ERRORS
                );
                if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                    warn!("Too many consecutive line feed failures. Shutting down line feed reader.");
                    return;
                }
                continue;
            };
            consecutive_errors = 0;

            match forward_lines(BufReader::new(stream), &update_sender).await {
                Ok(FeedEnd::ReceiverGone) => return,
                Ok(FeedEnd::Closed) => warn!("Line feed at {address} disconnected, reconnecting"),
                Err(e) => warn!("Line feed at {address} failed: {e}, reconnecting"),
            }
        }
    }
}

impl TelemetrySource for LineFeedReader {
    fn name(&self) -> &str {
        match self.feed {
            LineFeed::Tcp(_) => "tcp",
            LineFeed::Stdin => "stdin",
        }
    }

    fn spawn(mut self: Box<Self>, update_sender: Sender<TopicMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(update_sender).await;
        })
    }
}

/// Connects with exponential backoff between attempts
async fn connect_with_retry(address: SocketAddr) -> Option<TcpStream> {
    const MAX_RETRIES: u32 = 3;

    for attempt in 1..=MAX_RETRIES {
        info!(
            "Connecting to line feed at {} (attempt {}/{})",
            address, attempt, MAX_RETRIES
        );

        match TcpStream::connect(address).await {
            Ok(stream) => {
                info!("Connected to line feed at {address}");
                return Some(stream);
            }
            Err(e) => {
                warn!("Connection attempt {} failed: {}", attempt, e);
                if attempt < MAX_RETRIES {
                    sleep(Duration::from_secs(1 << (attempt - 1))).await;
                }
            }
        }
    }

    None
}

/// Splits a feed line into topic and payload. The payload is everything after the
/// first run of whitespace, so status text may contain spaces.
pub fn parse_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match line.split_once(char::is_whitespace) {
        Some((topic, payload)) => Some((topic, payload.trim())),
        None => Some((line, "")),
    }
}

/// Forwards every line of `reader` until EOF or until the receiver goes away.
pub async fn forward_lines<R>(reader: R, update_sender: &Sender<TopicMessage>) -> std::io::Result<FeedEnd>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let Some((topic, payload)) = parse_line(&line) else {
            continue;
        };
        debug!("Line feed message {topic} = {payload:?}");
        if update_sender
            .send(TopicMessage::new(topic, payload))
            .await
            .is_err()
        {
            return Ok(FeedEnd::ReceiverGone);
        }
    }
    Ok(FeedEnd::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("solar/voltage 260"), Some(("solar/voltage", "260")));
        assert_eq!(
            parse_line("solar/emergency   High Energy Surge Detected!  "),
            Some(("solar/emergency", "High Energy Surge Detected!"))
        );
        assert_eq!(parse_line("solar/smoke"), Some(("solar/smoke", "")));
        assert_eq!(parse_line("   "), None);
        assert_eq!(parse_line("solar/energy\t91.5"), Some(("solar/energy", "91.5")));
    }

    #[tokio::test]
    async fn test_forward_lines_until_eof() {
        let feed = tokio_test::io::Builder::new()
            .read(b"solar/voltage 260\nsolar/smo")
            .read(b"ke 1.5\n\nsolar/energy\n")
            .build();
        let (tx, mut rx) = mpsc::channel(8);

        let end = forward_lines(BufReader::new(feed), &tx).await.unwrap();
        assert_eq!(end, FeedEnd::Closed);

        let first = rx.recv().await.unwrap();
        assert_eq!((first.topic.as_str(), first.payload.as_str()), ("solar/voltage", "260"));
        let second = rx.recv().await.unwrap();
        assert_eq!((second.topic.as_str(), second.payload.as_str()), ("solar/smoke", "1.5"));
        // Payload-less lines are forwarded so the parser can reject them
        let third = rx.recv().await.unwrap();
        assert_eq!(third.payload, "");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_lines_stops_when_receiver_dropped() {
        let feed = tokio_test::io::Builder::new()
            .read(b"solar/voltage 230\nsolar/voltage 231\n")
            .build();
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        let end = forward_lines(BufReader::new(feed), &tx).await.unwrap();
        assert_eq!(end, FeedEnd::ReceiverGone);
    }

    #[tokio::test]
    async fn test_tcp_feed_reconnects_after_disconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for value in ["260", "100"] {
                let (mut socket, _) = listener.accept().await.unwrap();
                socket
                    .write_all(format!("solar/voltage {value}\n").as_bytes())
                    .await
                    .unwrap();
                // Dropping the socket simulates the broker bridge going away
            }
        });

        let (tx, mut rx) = mpsc::channel(8);
        let reader = Box::new(LineFeedReader::new(LineFeed::Tcp(address)));
        assert_eq!(reader.name(), "tcp");
        let handle = reader.spawn(tx);

        let timeout = Duration::from_secs(5);
        let first = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        let second = tokio::time::timeout(timeout, rx.recv()).await.unwrap().unwrap();
        assert_eq!(first.payload, "260");
        assert_eq!(second.payload, "100");
        handle.abort();
    }
}
