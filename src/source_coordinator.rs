use crate::config::{BridgeConfig, SourceConfig};
use crate::home_assistant::HomeAssistantAPI;
use crate::home_assistant_reader::HomeAssistantReader;
use crate::line_feed_reader::{LineFeed, LineFeedReader};
use crate::mqtt_reader::MqttReader;
use crate::reading::TopicMessage;
use crate::simulated_source::SimulatedSource;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tracing::info;

/// A transport that produces an unbounded, lazy sequence of raw telemetry messages.
///
/// Implementations own their connection lifecycle (connect, reconnect, cleanup) and
/// stop once the receiving side of `update_sender` is dropped.
pub trait TelemetrySource: Send + 'static {
    fn name(&self) -> &str;

    fn spawn(self: Box<Self>, update_sender: Sender<TopicMessage>) -> JoinHandle<()>;
}

/// Builds and starts the transport selected by the configuration
pub struct SourceCoordinator {
    source_name: String,
    handle: JoinHandle<()>,
}

impl SourceCoordinator {
    pub fn build_source(config: &BridgeConfig) -> Box<dyn TelemetrySource> {
        let prefix = config.subscription.topic_prefix.clone();
        match &config.source {
            SourceConfig::Simulated { interval, seed } => {
                Box::new(SimulatedSource::new(prefix, *interval, *seed))
            }
            SourceConfig::HomeAssistant {
                endpoint_url,
                auth_token,
                sensors,
                poll_interval,
            } => Box::new(HomeAssistantReader::new(
                HomeAssistantAPI::new(endpoint_url.clone(), auth_token.clone()),
                sensors.clone(),
                prefix,
                *poll_interval,
            )),
            SourceConfig::Mqtt { broker, client_id } => Box::new(MqttReader::new(
                broker.clone(),
                client_id.clone(),
                config.subscription.topics(),
            )),
            SourceConfig::Tcp { address } => Box::new(LineFeedReader::new(LineFeed::Tcp(*address))),
            SourceConfig::Stdin => Box::new(LineFeedReader::new(LineFeed::Stdin)),
        }
    }

    /// Starts the configured source feeding `update_sender`
    pub fn start(config: &BridgeConfig, update_sender: Sender<TopicMessage>) -> Self {
        Self::start_source(Self::build_source(config), update_sender)
    }

    pub fn start_source(
        source: Box<dyn TelemetrySource>,
        update_sender: Sender<TopicMessage>,
    ) -> Self {
        let source_name = source.name().to_string();
        info!("Starting {source_name} telemetry source");
        let handle = source.spawn(update_sender);
        Self {
            source_name,
            handle,
        }
    }

    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stops the source task. Messages already queued are still delivered.
    pub fn shutdown(self) {
        info!("Stopping {} telemetry source", self.source_name);
        self.handle.abort();
    }
}
