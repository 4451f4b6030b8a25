use crate::reading::{Channel, MalformedReading, Reading, TopicMessage};
use crate::snapshot::SnapshotPublisher;
use crate::state_engine::{DerivedStateEngine, StateTransition};
use std::collections::HashSet;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The set of channels the loop accepts
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub topic_prefix: String,
    pub channels: HashSet<Channel>,
}

impl Subscription {
    pub fn all(topic_prefix: impl Into<String>) -> Self {
        Self {
            topic_prefix: topic_prefix.into(),
            channels: Channel::ALL.into_iter().collect(),
        }
    }

    /// True when `topic` is this installation's topic for a subscribed `channel`
    pub fn accepts(&self, channel: Channel, topic: &str) -> bool {
        self.channels.contains(&channel)
            && channel
                .topic(&self.topic_prefix)
                .eq_ignore_ascii_case(topic.trim())
    }

    pub fn topics(&self) -> Vec<String> {
        Channel::ALL
            .into_iter()
            .filter(|channel| self.channels.contains(channel))
            .map(|channel| channel.topic(&self.topic_prefix))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestionStats {
    pub applied: u64,
    pub rejected: u64,
    pub unsubscribed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Applied,
    Unsubscribed,
}

/// Single writer for one installation: parses each message, applies it to the engine
/// and publishes the resulting snapshot, strictly in arrival order.
pub struct IngestionLoop {
    engine: DerivedStateEngine,
    publisher: SnapshotPublisher,
    subscription: Subscription,
    stats: IngestionStats,
}

impl IngestionLoop {
    pub fn new(
        engine: DerivedStateEngine,
        publisher: SnapshotPublisher,
        subscription: Subscription,
    ) -> Self {
        Self {
            engine,
            publisher,
            subscription,
            stats: IngestionStats::default(),
        }
    }

    /// Spawns the loop on its own task. It runs until every sender is dropped.
    pub fn spawn(self, messages: Receiver<TopicMessage>) -> JoinHandle<IngestionStats> {
        tokio::spawn(self.run(messages))
    }

    pub async fn run(mut self, mut messages: Receiver<TopicMessage>) -> IngestionStats {
        info!(
            "Starting ingestion loop for topics {:?}",
            self.subscription.topics()
        );

        while let Some(message) = messages.recv().await {
            if let Err(e) = self.handle(message) {
                warn!("Dropping malformed reading: {e}");
            }
        }

        info!(
            "Ingestion loop exiting after {} applied, {} rejected, {} unsubscribed",
            self.stats.applied, self.stats.rejected, self.stats.unsubscribed
        );
        self.stats
    }

    /// Runs one message through parse, apply and publish.
    pub fn handle(&mut self, message: TopicMessage) -> Result<Disposition, MalformedReading> {
        let reading = match Reading::from_message(&message) {
            Ok(reading) => reading,
            Err(e) => {
                self.stats.rejected += 1;
                return Err(e);
            }
        };

        if !self.subscription.accepts(reading.channel, &message.topic) {
            debug!("Ignoring reading on unsubscribed topic {}", message.topic);
            self.stats.unsubscribed += 1;
            return Ok(Disposition::Unsubscribed);
        }

        debug!("Applying {} = {}", reading.channel, reading.value);
        let outcome = self.engine.apply(&reading);
        for transition in &outcome.transitions {
            log_transition(transition);
        }

        self.publisher.publish(self.engine.state());
        self.stats.applied += 1;
        Ok(Disposition::Applied)
    }

    pub fn engine(&self) -> &DerivedStateEngine {
        &self.engine
    }

    pub fn stats(&self) -> IngestionStats {
        self.stats
    }
}

fn log_transition(transition: &StateTransition) {
    match transition {
        StateTransition::EmergencyTripped { cause } => {
            warn!("Critical alert raised ({cause:?}), microgrid shutting down")
        }
        StateTransition::EmergencyCleared => info!("Emergency cleared, microgrid stable"),
        StateTransition::MaintenanceEscalated { impact } => {
            warn!("Impact reached {impact}, immediate maintenance required")
        }
        StateTransition::OverrideApplied { channel, text } => {
            info!("Operator override on {channel}: {text:?}")
        }
        StateTransition::OverrideIgnored { channel, text } => {
            debug!("Unrecognised status {text:?} on {channel}, ignoring")
        }
    }
}
