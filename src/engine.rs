use crate::aggregator::{Aggregate, Aggregator};
use crate::bus::BusEvent;
use crate::config::Config;
use crate::peer_registry::PeerRegistry;
use crate::publisher::{Publication, Publisher};
use crate::reading_cache::ReadingCache;
use std::time::Instant;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// Owns every piece of aggregation state. All mutation goes through
/// [`DcSystemEngine::handle_event`] and [`DcSystemEngine::sweep`], which the
/// event loop calls one at a time, so the aggregator never sees a half-applied
/// update.
#[derive(Debug)]
pub struct DcSystemEngine {
    registry: PeerRegistry,
    cache: ReadingCache,
    aggregator: Aggregator,
    publisher: Publisher,
    aggregate: Aggregate,
}

impl DcSystemEngine {
    pub fn new(config: &Config, now: Instant) -> Self {
        Self {
            registry: PeerRegistry::new(),
            cache: ReadingCache::new(config.freshness_window),
            aggregator: Aggregator::new(config.voltage_policy),
            publisher: Publisher::new(config.tolerances, config.max_silence, config.no_data),
            aggregate: Aggregate::NoData { timestamp: now },
        }
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn aggregate(&self) -> &Aggregate {
        &self.aggregate
    }

    /// Applies one transport event and returns what should be published, if anything.
    pub fn handle_event(&mut self, event: BusEvent, now: Instant) -> Option<Publication> {
        let changed = match event {
            BusEvent::Discovered { id, service } => {
                // A fresh record has no reading, so it cannot move the aggregate
                self.registry.on_peer_discovered(id, &service);
                false
            }
            BusEvent::Lost { id } => self.registry.on_peer_lost(&id),
            BusEvent::Changed { id, path, value } => {
                self.cache
                    .update_reading(&mut self.registry, &id, &path, value, now)
            }
        };
        if !changed {
            return None;
        }
        self.recompute(now)
    }

    /// Periodic tick: ages out quiet peers, then gives the publisher a chance
    /// to send its heartbeat.
    pub fn sweep(&mut self, now: Instant) -> Option<Publication> {
        if self.cache.sweep(&mut self.registry, now) {
            return self.recompute(now);
        }
        self.publisher.apply(&self.aggregate, now)
    }

    fn recompute(&mut self, now: Instant) -> Option<Publication> {
        self.aggregate = self.aggregator.compute(&self.registry, now);
        self.publisher.apply(&self.aggregate, now)
    }

    /// Event loop: serialises bus events with the sweep timer until the event
    /// feed closes or nobody listens for publications any more.
    pub async fn run(
        mut self,
        config: &Config,
        mut events: Receiver<BusEvent>,
        publications: Sender<Publication>,
    ) {
        info!("Starting DC system engine");
        let mut sweep_timer = interval(config.sweep_interval);
        sweep_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let publication = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, Instant::now()),
                    None => {
                        info!("Bus event feed closed, stopping DC system engine");
                        break;
                    }
                },
                _ = sweep_timer.tick() => self.sweep(Instant::now()),
            };

            if let Some(publication) = publication {
                if let Err(e) = publications.send(publication).await {
                    warn!("DC system device is gone ({e}), stopping engine");
                    break;
                }
            }
        }
    }
}
