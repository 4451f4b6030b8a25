use crate::reading::{Channel, TopicMessage};
use crate::source_coordinator::TelemetrySource;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::time::Duration;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info};

/// Stand-in for real sensors: emits plausible readings on a fixed cadence.
///
/// Sensor channels tick every interval, emergency status every second tick, and
/// maintenance and microgrid status every third tick.
pub struct SimulatedSource {
    topic_prefix: String,
    tick_interval: Duration,
    rng: StdRng,
}

const VOLTAGE_MEAN: f64 = 230.0;
const VOLTAGE_STD_DEV: f64 = 12.0;
const SMOKE_MEAN: f64 = 1.5;
const SMOKE_STD_DEV: f64 = 1.2;

impl SimulatedSource {
    pub fn new(topic_prefix: impl Into<String>, tick_interval: Duration, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            topic_prefix: topic_prefix.into(),
            tick_interval,
            rng,
        }
    }

    /// Messages for tick number `tick`, counted from zero
    pub fn messages_for_tick(&mut self, tick: u64) -> Vec<TopicMessage> {
        let voltage = VOLTAGE_MEAN + VOLTAGE_STD_DEV * self.rng.sample::<f64, _>(StandardNormal);
        let smoke = (SMOKE_MEAN + SMOKE_STD_DEV * self.rng.sample::<f64, _>(StandardNormal)).abs();
        let energy = self.rng.gen::<f64>() * 100.0;

        let mut messages = vec![
            self.message(Channel::Voltage, format!("{voltage:.1}")),
            self.message(Channel::Smoke, format!("{smoke:.2}")),
            self.message(Channel::Energy, format!("{energy:.1}")),
        ];

        if tick % 2 == 0 {
            let alert = if self.rng.gen::<f64>() > 0.95 {
                "High Energy Surge Detected!"
            } else {
                "All systems operational"
            };
            messages.push(self.message(Channel::Emergency, alert.to_string()));
        }

        if tick % 3 == 0 {
            let maintenance = if self.rng.gen::<f64>() < 0.2 {
                "Performance Degradation Detected!"
            } else {
                "All systems operational"
            };
            messages.push(self.message(Channel::Maintenance, maintenance.to_string()));

            let load: f64 = self.rng.gen();
            let grid = if load > 0.8 { "Overload" } else { "Stable" };
            messages.push(self.message(Channel::Microgrid, grid.to_string()));
        }

        messages
    }

    fn message(&self, channel: Channel, payload: String) -> TopicMessage {
        TopicMessage::new(channel.topic(&self.topic_prefix), payload)
    }

    async fn run(&mut self, update_sender: Sender<TopicMessage>) {
        info!(
            "Starting simulated telemetry source, ticking every {:?}",
            self.tick_interval
        );

        let mut ticker = interval(self.tick_interval);
        let mut tick = 0u64;
        'ticks: loop {
            ticker.tick().await;
            for message in self.messages_for_tick(tick) {
                debug!("Simulated {} = {}", message.topic, message.payload);
                if update_sender.send(message).await.is_err() {
                    break 'ticks;
                }
            }
            tick += 1;
        }

        info!("Simulated telemetry source exiting");
    }
}

impl TelemetrySource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn spawn(mut self: Box<Self>, update_sender: Sender<TopicMessage>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run(update_sender).await;
        })
    }
}
