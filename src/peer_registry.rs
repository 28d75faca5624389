use crate::bus::{PeerId, PropertyPath};
use crate::reading_cache::Reading;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Functional category of a peer; decides which term of the DC system
/// formula its power feeds and with which sign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Role {
    Source,
    Load,
    Charger,
    InverterChargerDc,
    Wind,
    Battery,
    BusVoltageReference,
}

/// Service class prefixes and the role each one maps to.
const SERVICE_CLASSES: [(&str, Role); 9] = [
    ("com.victronenergy.solarcharger", Role::Source),
    ("com.victronenergy.alternator", Role::Source),
    ("com.victronenergy.fuelcell", Role::Source),
    ("com.victronenergy.dcsource", Role::Wind),
    ("com.victronenergy.charger", Role::Charger),
    ("com.victronenergy.vebus", Role::InverterChargerDc),
    ("com.victronenergy.dcload", Role::Load),
    ("com.victronenergy.battery", Role::Battery),
    ("com.victronenergy.system", Role::BusVoltageReference),
];

const DC_TRIPLE: &[PropertyPath] = &[
    PropertyPath::DcPower,
    PropertyPath::DcVoltage,
    PropertyPath::DcCurrent,
];
const SOURCE_PATHS: &[PropertyPath] = &[
    PropertyPath::DcPower,
    PropertyPath::DcVoltage,
    PropertyPath::DcCurrent,
    PropertyPath::LoadCurrent,
];
const CHARGER_PATHS: &[PropertyPath] = &[PropertyPath::DcVoltage, PropertyPath::DcCurrent];
const LOAD_PATHS: &[PropertyPath] = &[
    PropertyPath::DcPower,
    PropertyPath::DcVoltage,
    PropertyPath::DcCurrent,
    PropertyPath::EnergyIn,
    PropertyPath::LowVoltageAlarm,
    PropertyPath::HighVoltageAlarm,
    PropertyPath::LowTemperatureAlarm,
    PropertyPath::HighTemperatureAlarm,
];
const WIND_PATHS: &[PropertyPath] = &[
    PropertyPath::DcPower,
    PropertyPath::DcVoltage,
    PropertyPath::DcCurrent,
    PropertyPath::EnergyOut,
    PropertyPath::LowVoltageAlarm,
    PropertyPath::HighVoltageAlarm,
    PropertyPath::LowTemperatureAlarm,
    PropertyPath::HighTemperatureAlarm,
];
const REFERENCE_PATHS: &[PropertyPath] = &[PropertyPath::BatteryVoltage];

impl Role {
    pub const ALL: [Role; 7] = [
        Role::Source,
        Role::Load,
        Role::Charger,
        Role::InverterChargerDc,
        Role::Wind,
        Role::Battery,
        Role::BusVoltageReference,
    ];

    /// Maps an advertised service name onto a role. A service matches a class
    /// when it is the class itself or the class followed by a `.` suffix.
    pub fn classify(service: &str) -> Option<Role> {
        SERVICE_CLASSES.iter().find_map(|(class, role)| {
            let rest = service.strip_prefix(*class)?;
            (rest.is_empty() || rest.starts_with('.')).then_some(*role)
        })
    }

    /// Sign of this role's power in the DC system formula, `None` when the
    /// role has no power term.
    pub fn power_sign(self) -> Option<f64> {
        match self {
            Role::Source | Role::Charger | Role::Wind | Role::InverterChargerDc => Some(1.0),
            Role::Battery | Role::Load => Some(-1.0),
            Role::BusVoltageReference => None,
        }
    }

    pub fn subscribed_paths(self) -> &'static [PropertyPath] {
        match self {
            Role::Source => SOURCE_PATHS,
            Role::Load => LOAD_PATHS,
            Role::Charger => CHARGER_PATHS,
            Role::InverterChargerDc | Role::Battery => DC_TRIPLE,
            Role::Wind => WIND_PATHS,
            Role::BusVoltageReference => REFERENCE_PATHS,
        }
    }

    pub fn subscribes_to(self, path: PropertyPath) -> bool {
        self.subscribed_paths().contains(&path)
    }

    pub fn name(self) -> &'static str {
        match self {
            Role::Source => "source",
            Role::Load => "load",
            Role::Charger => "charger",
            Role::InverterChargerDc => "inverter_charger_dc",
            Role::Wind => "wind",
            Role::Battery => "battery",
            Role::BusVoltageReference => "bus_voltage_reference",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::ALL
            .into_iter()
            .find(|role| role.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown role '{s}'"))
    }
}

/// A discovered peer and its cached reading.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: PeerId,
    pub role: Role,
    pub reading: Reading,
    pub last_update: Option<Instant>,
}

impl PeerRecord {
    fn new(id: PeerId, role: Role) -> Self {
        Self {
            id,
            role,
            reading: Reading::default(),
            last_update: None,
        }
    }
}

/// The set of currently visible peers, keyed by bus identity.
///
/// Backed by an ordered map so every pass over the peers visits them in the
/// same order regardless of discovery order.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: BTreeMap<PeerId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly visible peer. Returns `true` when a record was created.
    pub fn on_peer_discovered(&mut self, id: PeerId, advertised_class: &str) -> bool {
        let Some(role) = Role::classify(advertised_class) else {
            debug!("Ignoring peer {id}: unrecognised service class '{advertised_class}'");
            return false;
        };
        if let Some(existing) = self.peers.get(&id) {
            warn!(
                "Duplicate discovery of peer {id} ({advertised_class}), already registered as {}",
                existing.role
            );
            return false;
        }
        info!("Peer {id} discovered as {role} ({advertised_class})");
        self.peers.insert(id.clone(), PeerRecord::new(id, role));
        true
    }

    /// Forgets a peer. Returns `true` when a record was removed.
    pub fn on_peer_lost(&mut self, id: &PeerId) -> bool {
        match self.peers.remove(id) {
            Some(record) => {
                info!("Peer {id} ({}) lost", record.role);
                true
            }
            None => {
                debug!("Loss of unknown peer {id} ignored");
                false
            }
        }
    }

    pub fn peers_of(&self, role: Role) -> impl Iterator<Item = &PeerRecord> + '_ {
        self.peers.values().filter(move |record| record.role == role)
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    pub(crate) fn get_mut(&mut self, id: &PeerId) -> Option<&mut PeerRecord> {
        self.peers.get_mut(id)
    }

    pub(crate) fn records_mut(&mut self) -> impl Iterator<Item = &mut PeerRecord> + '_ {
        self.peers.values_mut()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
