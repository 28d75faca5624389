use crate::bus::{BusValue, PeerId, PropertyPath};
use crate::peer_registry::PeerRegistry;
use std::time::{Duration, Instant};
use tracing::debug;

/// Whether a cached reading may take part in aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Validity {
    Fresh,
    /// Not updated within the freshness window
    Stale,
    /// Nothing valid received yet, or every field reported invalid
    #[default]
    Missing,
}

/// Alarm severity as published on the bus: 0 ok, 1 warning, 2 alarm.
pub type AlarmLevel = u8;

pub const ALARM_OK: AlarmLevel = 0;
pub const ALARM_ALARM: AlarmLevel = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Alarms {
    pub low_voltage: Option<AlarmLevel>,
    pub high_voltage: Option<AlarmLevel>,
    pub low_temperature: Option<AlarmLevel>,
    pub high_temperature: Option<AlarmLevel>,
}

impl Alarms {
    fn is_empty(&self) -> bool {
        self.low_voltage.is_none()
            && self.high_voltage.is_none()
            && self.low_temperature.is_none()
            && self.high_temperature.is_none()
    }
}

/// Last-known electrical values of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Reading {
    pub power: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    /// Current drawn through a solar charger's load output
    pub load_current: Option<f64>,
    pub energy_in: Option<f64>,
    pub energy_out: Option<f64>,
    pub alarms: Alarms,
    pub validity: Validity,
}

impl Reading {
    pub fn is_fresh(&self) -> bool {
        self.validity == Validity::Fresh
    }

    fn has_any_value(&self) -> bool {
        self.power.is_some()
            || self.voltage.is_some()
            || self.current.is_some()
            || self.load_current.is_some()
            || self.energy_in.is_some()
            || self.energy_out.is_some()
            || !self.alarms.is_empty()
    }

    fn set(&mut self, path: PropertyPath, value: Option<f64>) {
        match path {
            PropertyPath::DcPower => self.power = value,
            PropertyPath::DcVoltage | PropertyPath::BatteryVoltage => self.voltage = value,
            PropertyPath::DcCurrent => self.current = value,
            PropertyPath::LoadCurrent => self.load_current = value,
            PropertyPath::EnergyIn => self.energy_in = value,
            PropertyPath::EnergyOut => self.energy_out = value,
            PropertyPath::LowVoltageAlarm => self.alarms.low_voltage = value.map(alarm_level),
            PropertyPath::HighVoltageAlarm => self.alarms.high_voltage = value.map(alarm_level),
            PropertyPath::LowTemperatureAlarm => {
                self.alarms.low_temperature = value.map(alarm_level)
            }
            PropertyPath::HighTemperatureAlarm => {
                self.alarms.high_temperature = value.map(alarm_level)
            }
        }
    }
}

fn alarm_level(value: f64) -> AlarmLevel {
    value.round().clamp(ALARM_OK as f64, ALARM_ALARM as f64) as AlarmLevel
}

/// Keeps each registered peer's reading current and ages it out when the peer
/// goes quiet.
///
/// The cache does not own the records; it operates on the registry's records so
/// that removing a peer also removes its reading in the same step.
#[derive(Debug, Clone)]
pub struct ReadingCache {
    freshness_window: Duration,
}

impl ReadingCache {
    pub fn new(freshness_window: Duration) -> Self {
        Self { freshness_window }
    }

    /// Applies a value-change notification. Returns `true` when a reading
    /// changed and the aggregate has to be recomputed.
    pub fn update_reading(
        &self,
        registry: &mut PeerRegistry,
        id: &PeerId,
        path: &str,
        value: BusValue,
        now: Instant,
    ) -> bool {
        let Some(record) = registry.get_mut(id) else {
            debug!("Dropping {path} update for unregistered peer {id}");
            return false;
        };
        let Some(property) = PropertyPath::parse(path) else {
            debug!("Dropping unknown path {path} from peer {id}");
            return false;
        };
        if !record.role.subscribes_to(property) {
            debug!("Peer {id} ({}) is not subscribed to {path}", record.role);
            return false;
        }

        let value = value.as_valid();
        let reading = &mut record.reading;
        if reading.validity == Validity::Stale {
            if value.is_none() {
                // Only a valid value brings a stale reading back
                reading.set(property, None);
                if !reading.has_any_value() {
                    reading.validity = Validity::Missing;
                }
                return false;
            }
            debug!("Peer {id} reporting again, dropping its stale values");
            *reading = Reading::default();
        }
        reading.set(property, value);
        reading.validity = if reading.has_any_value() {
            Validity::Fresh
        } else {
            Validity::Missing
        };
        record.last_update = Some(now);
        true
    }

    /// Demotes fresh readings that have not been updated within the freshness
    /// window. Returns `true` if any reading changed validity.
    pub fn sweep(&self, registry: &mut PeerRegistry, now: Instant) -> bool {
        let mut changed = false;
        for record in registry.records_mut() {
            if !record.reading.is_fresh() {
                continue;
            }
            let expired = record
                .last_update
                .map_or(true, |at| now.saturating_duration_since(at) > self.freshness_window);
            if expired {
                debug!("Reading of peer {} ({}) is stale", record.id, record.role);
                record.reading.validity = Validity::Stale;
                changed = true;
            }
        }
        changed
    }
}
