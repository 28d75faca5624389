use crate::peer_registry::{PeerRecord, PeerRegistry, Role};
use crate::reading_cache::{AlarmLevel, Reading, ALARM_OK};
use std::time::Instant;

/// Voltages at or below this are a disconnected sense wire, not a bus voltage.
pub const VOLTAGE_DEADBAND: f64 = 1.0;

/// How the published bus voltage is chosen among the peers reporting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoltagePolicy {
    /// Unweighted mean over every fresh voltage-reporting peer
    Mean,
    /// Mean over the given role's peers when any of them reports, plain mean otherwise
    Reference(Role),
}

impl Default for VoltagePolicy {
    fn default() -> Self {
        VoltagePolicy::Reference(Role::BusVoltageReference)
    }
}

/// Worst alarm level reported by any contributing peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlarmSummary {
    pub low_voltage: AlarmLevel,
    pub high_voltage: AlarmLevel,
    pub low_temperature: AlarmLevel,
    pub high_temperature: AlarmLevel,
}

impl AlarmSummary {
    fn include(&mut self, reading: &Reading) {
        let alarms = &reading.alarms;
        self.low_voltage = self.low_voltage.max(alarms.low_voltage.unwrap_or(ALARM_OK));
        self.high_voltage = self.high_voltage.max(alarms.high_voltage.unwrap_or(ALARM_OK));
        self.low_temperature = self
            .low_temperature
            .max(alarms.low_temperature.unwrap_or(ALARM_OK));
        self.high_temperature = self
            .high_temperature
            .max(alarms.high_temperature.unwrap_or(ALARM_OK));
    }
}

/// The derived DC system quantities. `None` means unknown, never zero.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSnapshot {
    pub power: Option<f64>,
    pub voltage: Option<f64>,
    pub current: Option<f64>,
    pub energy_in: Option<f64>,
    pub energy_out: Option<f64>,
    pub alarms: AlarmSummary,
    pub contributing_peers: usize,
    pub timestamp: Instant,
}

/// Result of one recomputation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregate {
    /// No fresh peer contributed anything
    NoData { timestamp: Instant },
    Snapshot(AggregateSnapshot),
}

impl Aggregate {
    pub fn snapshot(&self) -> Option<&AggregateSnapshot> {
        match self {
            Aggregate::Snapshot(snapshot) => Some(snapshot),
            Aggregate::NoData { .. } => None,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, Aggregate::NoData { .. })
    }
}

/// Neumaier compensated sum, keeps the result independent of term order to
/// well within float tolerance.
#[derive(Debug, Default, Clone, Copy)]
struct CompensatedSum {
    sum: f64,
    compensation: f64,
    terms: usize,
}

impl CompensatedSum {
    fn add(&mut self, value: f64) {
        let total = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.compensation += (self.sum - total) + value;
        } else {
            self.compensation += (value - total) + self.sum;
        }
        self.sum = total;
        self.terms += 1;
    }

    fn total(&self) -> Option<f64> {
        (self.terms > 0).then(|| self.sum + self.compensation)
    }

    fn mean(&self) -> Option<f64> {
        self.total().map(|total| total / self.terms as f64)
    }
}

/// Power a peer puts on (or takes off) the bus, before the role's sign is
/// applied. Falls back to V * I when no power is reported; a solar charger's
/// load output current counts towards its production.
pub fn effective_power(reading: &Reading) -> Option<f64> {
    reading.power.or_else(|| match (reading.voltage, reading.current) {
        (Some(voltage), Some(current)) => {
            Some(voltage * (current + reading.load_current.unwrap_or(0.0)))
        }
        _ => None,
    })
}

/// Computes `(sources + chargers + wind + inverter/charger DC) - battery - loads`
/// over the fresh readings in the registry.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    voltage_policy: VoltagePolicy,
}

impl Aggregator {
    pub fn new(voltage_policy: VoltagePolicy) -> Self {
        Self { voltage_policy }
    }

    pub fn compute(&self, registry: &PeerRegistry, now: Instant) -> Aggregate {
        let mut power = CompensatedSum::default();
        let mut voltage_all = CompensatedSum::default();
        let mut voltage_reference = CompensatedSum::default();
        let mut energy_in = CompensatedSum::default();
        let mut energy_out = CompensatedSum::default();
        let mut alarms = AlarmSummary::default();
        let mut contributing_peers = 0;

        for role in Role::ALL {
            let is_reference = self.voltage_policy == VoltagePolicy::Reference(role);
            let fresh = registry.peers_of(role).filter(|record| record.reading.is_fresh());
            for PeerRecord { reading, .. } in fresh {
                let mut contributed = false;

                if let (Some(sign), Some(peer_power)) =
                    (role.power_sign(), effective_power(reading))
                {
                    power.add(sign * peer_power);
                    contributed = true;
                }
                if let Some(voltage) = reading.voltage.filter(|v| *v > VOLTAGE_DEADBAND) {
                    voltage_all.add(voltage);
                    if is_reference {
                        voltage_reference.add(voltage);
                    }
                    contributed = true;
                }
                if let Some(energy) = reading.energy_in {
                    energy_in.add(energy);
                }
                if let Some(energy) = reading.energy_out {
                    energy_out.add(energy);
                }
                alarms.include(reading);

                if contributed {
                    contributing_peers += 1;
                }
            }
        }

        if contributing_peers == 0 {
            return Aggregate::NoData { timestamp: now };
        }

        let power = power.total();
        let voltage = match self.voltage_policy {
            VoltagePolicy::Mean => voltage_all.mean(),
            VoltagePolicy::Reference(_) => voltage_reference.mean().or(voltage_all.mean()),
        };
        let current = match (power, voltage) {
            (Some(power), Some(voltage)) if voltage != 0.0 => Some(power / voltage),
            _ => None,
        };

        Aggregate::Snapshot(AggregateSnapshot {
            power,
            voltage,
            current,
            energy_in: energy_in.total(),
            energy_out: energy_out.total(),
            alarms,
            contributing_peers,
            timestamp: now,
        })
    }
}
