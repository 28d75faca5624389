use crate::aggregator::{Aggregate, AggregateSnapshot, AlarmSummary};
use std::str::FromStr;
use std::time::{Duration, Instant};
use tracing::debug;

/// Energy counters only move in whole Wh steps on most devices.
const ENERGY_TOLERANCE_KWH: f64 = 0.001;

/// What to do when the aggregator has nothing to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoDataPolicy {
    /// Keep the last published values on the bus
    #[default]
    Withhold,
    /// Publish every quantity as invalid
    PublishInvalid,
}

impl FromStr for NoDataPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "withhold" => Ok(NoDataPolicy::Withhold),
            "invalid" | "publish_invalid" => Ok(NoDataPolicy::PublishInvalid),
            other => Err(format!("unknown no-data policy '{other}'")),
        }
    }
}

/// Change threshold for one quantity: `max(absolute, relative * |last|)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub absolute: f64,
    pub relative: f64,
}

impl Tolerance {
    pub const fn absolute(absolute: f64) -> Self {
        Self {
            absolute,
            relative: 0.0,
        }
    }

    /// Known <-> unknown transitions always count as a change.
    pub fn exceeded(&self, last: Option<f64>, next: Option<f64>) -> bool {
        match (last, next) {
            (Some(last), Some(next)) => {
                let threshold = self.absolute.max(self.relative * last.abs());
                (next - last).abs() > threshold
            }
            (None, None) => false,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerances {
    pub power: Tolerance,
    pub voltage: Tolerance,
    pub current: Tolerance,
}

impl Default for Tolerances {
    fn default() -> Self {
        Self {
            power: Tolerance::absolute(1.0),
            voltage: Tolerance::absolute(0.01),
            current: Tolerance::absolute(0.01),
        }
    }
}

/// The values exported by the virtual DC system device.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Publication {
    pub power: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub energy_in: Option<f64>,
    pub energy_out: Option<f64>,
    pub alarms: AlarmSummary,
    pub contributing_peers: usize,
}

impl Publication {
    /// Every quantity invalid, used for the no-data case.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn is_invalid(&self) -> bool {
        *self == Self::invalid()
    }
}

impl From<&AggregateSnapshot> for Publication {
    fn from(snapshot: &AggregateSnapshot) -> Self {
        Self {
            power: snapshot.power,
            voltage: snapshot.voltage,
            current: snapshot.current,
            energy_in: snapshot.energy_in,
            energy_out: snapshot.energy_out,
            alarms: snapshot.alarms,
            contributing_peers: snapshot.contributing_peers,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PublisherState {
    Uninitialized,
    Active {
        last: Publication,
        published_at: Instant,
    },
}

/// Decides when the aggregate goes out on the bus.
#[derive(Debug)]
pub struct Publisher {
    tolerances: Tolerances,
    max_silence: Duration,
    no_data: NoDataPolicy,
    state: PublisherState,
}

impl Publisher {
    pub fn new(tolerances: Tolerances, max_silence: Duration, no_data: NoDataPolicy) -> Self {
        Self {
            tolerances,
            max_silence,
            no_data,
            state: PublisherState::Uninitialized,
        }
    }

    pub fn state(&self) -> &PublisherState {
        &self.state
    }

    /// Returns the values to publish, or `None` when the bus should be left
    /// alone this time.
    pub fn apply(&mut self, aggregate: &Aggregate, now: Instant) -> Option<Publication> {
        let candidate = match aggregate {
            Aggregate::Snapshot(snapshot) => Publication::from(snapshot),
            Aggregate::NoData { .. } => match self.no_data {
                NoDataPolicy::Withhold => return None,
                NoDataPolicy::PublishInvalid => Publication::invalid(),
            },
        };

        let due = match &self.state {
            PublisherState::Uninitialized => true,
            PublisherState::Active { last, published_at } => {
                now.saturating_duration_since(*published_at) >= self.max_silence
                    || self.differs(last, &candidate)
            }
        };
        if !due {
            return None;
        }

        debug!(
            "Publishing DC system: power {:?}W voltage {:?}V current {:?}A from {} peers",
            candidate.power, candidate.voltage, candidate.current, candidate.contributing_peers
        );
        self.state = PublisherState::Active {
            last: candidate,
            published_at: now,
        };
        Some(candidate)
    }

    fn differs(&self, last: &Publication, next: &Publication) -> bool {
        let energy = Tolerance::absolute(ENERGY_TOLERANCE_KWH);
        self.tolerances.power.exceeded(last.power, next.power)
            || self.tolerances.voltage.exceeded(last.voltage, next.voltage)
            || self.tolerances.current.exceeded(last.current, next.current)
            || energy.exceeded(last.energy_in, next.energy_in)
            || energy.exceeded(last.energy_out, next.energy_out)
            || last.alarms != next.alarms
            || last.contributing_peers != next.contributing_peers
    }
}
