use crate::home_assistant::{HASensor, HomeAssistantAPI};
use crate::reading::{Channel, TopicMessage};
use crate::source_coordinator::TelemetrySource;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Polls one Home Assistant entity per channel and forwards state changes as readings
pub struct HomeAssistantReader {
    sensors: BTreeMap<Channel, String>,
    topic_prefix: String,
    poll_interval: Duration,
    ha_client: HomeAssistantAPI,
    /// (last_updated, state) seen for each channel on the previous poll
    last_seen: HashMap<Channel, (String, String)>,
}

impl HomeAssistantReader {
    pub fn new(
        ha_client: HomeAssistantAPI,
        sensors: BTreeMap<Channel, String>,
        topic_prefix: impl Into<String>,
        poll_interval: Duration,
    ) -> Self {
        info!("Home Assistant Reader Config:");
        for (channel, entity) in &sensors {
            info!("  {channel}: {entity}");
        }
        info!("  Poll interval: {poll_interval:?}");

        Self {
            sensors,
            topic_prefix: topic_prefix.into(),
            poll_interval,
            ha_client,
            last_seen: HashMap::new(),
        }
    }

    async fn run(&mut self, update_sender: Sender<TopicMessage>) {
        info!("Starting Home Assistant reader");

        let mut read_interval = interval(self.poll_interval);
        read_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            read_interval.tick().await;
            if let Err(e) = self.poll_once(&update_sender).await {
                warn!("{e}. Shutting down Home Assistant reader.");
                break;
            }
        }

        info!("Home Assistant reader exiting");
    }

    /// Reads every configured entity once and forwards the ones that changed.
    /// Only fails when the ingestion side has gone away.
    pub async fn poll_once(&mut self, update_sender: &Sender<TopicMessage>) -> anyhow::Result<usize> {
        let mut forwarded = 0;
        let sensors: Vec<(Channel, String)> = self
            .sensors
            .iter()
            .map(|(channel, entity)| (*channel, entity.clone()))
            .collect();

        for (channel, entity) in sensors {
            let sensor = match self.read_sensor_with_retry(&entity).await {
                Ok(sensor) => sensor,
                Err(e) => {
                    warn!("Home Assistant read error for {entity}: {e}");
                    continue;
                }
            };

            let fingerprint = (sensor.last_updated.clone(), sensor.state.clone());
            if self.last_seen.get(&channel) == Some(&fingerprint) {
                debug!("{entity} unchanged since last poll");
                continue;
            }

            update_sender
                .send(TopicMessage::new(
                    channel.topic(&self.topic_prefix),
                    sensor.state,
                ))
                .await
                .map_err(|e| anyhow::anyhow!("Failed to forward Home Assistant reading: {e}"))?;
            self.last_seen.insert(channel, fingerprint);
            forwarded += 1;
        }

        Ok(forwarded)
    }

    /// Reads a sensor with automatic retry
    async fn read_sensor_with_retry(&self, entity: &str) -> anyhow::Result<HASensor> {
        const MAX_RETRIES: u32 = 3;

        let mut attempt = 1;
        loop {
            match self.ha_client.read_sensor_value(entity).await {
                Ok(sensor) => return Ok(sensor),
                Err(e) if attempt < MAX_RETRIES => {
                    debug!("HA read attempt {attempt} for {entity} failed: {e}. Retrying...");
                    sleep(Duration::from_millis(200 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!("All {MAX_RETRIES} attempts failed")));
                }
            }
        }
    }
}

impl TelemetrySource for HomeAssistantReader {
    fn name(&self) -> &str {
        "home-assistant"
    }

    fn spawn(mut self: Box<Self>, update_sender: Sender<TopicMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(update_sender).await;
        })
    }
}
