use crate::aggregator::VoltagePolicy;
use crate::peer_registry::Role;
use crate::publisher::{NoDataPolicy, Tolerance, Tolerances};
use anyhow::{anyhow, Context};
use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// Runtime settings of the aggregator, read from `DCSYSTEM_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub feed_addr: SocketAddr,
    pub modbus_addr: SocketAddr,
    pub freshness_window: Duration,
    pub sweep_interval: Duration,
    pub max_silence: Duration,
    pub tolerances: Tolerances,
    pub no_data: NoDataPolicy,
    pub voltage_policy: VoltagePolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed_addr: SocketAddr::from(([0, 0, 0, 0], 5503)),
            modbus_addr: SocketAddr::from(([0, 0, 0, 0], 5502)),
            freshness_window: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(1),
            max_silence: Duration::from_secs(5),
            tolerances: Tolerances::default(),
            no_data: NoDataPolicy::default(),
            voltage_policy: VoltagePolicy::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let relative: f64 = parse_or("DCSYSTEM_RELATIVE_TOLERANCE", 0.0, &lookup)?;
        let tolerance = |key: &str, absolute: Tolerance| -> anyhow::Result<Tolerance> {
            Ok(Tolerance {
                absolute: parse_or(key, absolute.absolute, &lookup)?,
                relative,
            })
        };
        let tolerances = Tolerances {
            power: tolerance("DCSYSTEM_POWER_TOLERANCE", defaults.tolerances.power)?,
            voltage: tolerance("DCSYSTEM_VOLTAGE_TOLERANCE", defaults.tolerances.voltage)?,
            current: tolerance("DCSYSTEM_CURRENT_TOLERANCE", defaults.tolerances.current)?,
        };

        let voltage_policy = match lookup("DCSYSTEM_VOLTAGE_POLICY")
            .unwrap_or_else(|| "reference".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "mean" => VoltagePolicy::Mean,
            "reference" => VoltagePolicy::Reference(parse_or(
                "DCSYSTEM_VOLTAGE_REFERENCE_ROLE",
                Role::BusVoltageReference,
                &lookup,
            )?),
            other => anyhow::bail!("DCSYSTEM_VOLTAGE_POLICY: unknown voltage policy '{other}'"),
        };

        let config = Self {
            feed_addr: parse_or("DCSYSTEM_FEED_ADDR", defaults.feed_addr, &lookup)?,
            modbus_addr: parse_or("DCSYSTEM_MODBUS_ADDR", defaults.modbus_addr, &lookup)?,
            freshness_window: millis_or(
                "DCSYSTEM_FRESHNESS_MS",
                defaults.freshness_window,
                &lookup,
            )?,
            sweep_interval: millis_or("DCSYSTEM_SWEEP_MS", defaults.sweep_interval, &lookup)?,
            max_silence: millis_or("DCSYSTEM_MAX_SILENCE_MS", defaults.max_silence, &lookup)?,
            tolerances,
            no_data: parse_or("DCSYSTEM_NO_DATA", defaults.no_data, &lookup)?,
            voltage_policy,
        };
        if config.sweep_interval.is_zero() {
            anyhow::bail!("DCSYSTEM_SWEEP_MS must be greater than zero");
        }
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("DC system aggregator config:");
        info!("  Event feed: {}", self.feed_addr);
        info!("  Modbus device: {}", self.modbus_addr);
        info!(
            "  Freshness window: {:?}, sweep every {:?}, max silence {:?}",
            self.freshness_window, self.sweep_interval, self.max_silence
        );
        info!("  Tolerances: {:?}", self.tolerances);
        info!("  No data: {:?}", self.no_data);
        info!("  Voltage: {:?}", self.voltage_policy);
    }
}

fn parse_or<T>(
    key: &str,
    default: T,
    lookup: &impl Fn(&str) -> Option<String>,
) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("{e}"))
            .with_context(|| format!("Invalid value '{raw}' for {key}")),
        _ => Ok(default),
    }
}

fn millis_or(
    key: &str,
    default: Duration,
    lookup: &impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Duration> {
    let default_ms = default.as_millis() as u64;
    parse_or(key, default_ms, lookup).map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = Config::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.voltage_policy,
            VoltagePolicy::Reference(Role::BusVoltageReference)
        );
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup_from(&[
            ("DCSYSTEM_FEED_ADDR", "127.0.0.1:7000"),
            ("DCSYSTEM_FRESHNESS_MS", "2500"),
            ("DCSYSTEM_MAX_SILENCE_MS", "60000"),
            ("DCSYSTEM_POWER_TOLERANCE", "5"),
            ("DCSYSTEM_RELATIVE_TOLERANCE", "0.02"),
            ("DCSYSTEM_NO_DATA", "invalid"),
            ("DCSYSTEM_VOLTAGE_POLICY", "Reference"),
            ("DCSYSTEM_VOLTAGE_REFERENCE_ROLE", "battery"),
        ]))
        .unwrap();

        assert_eq!(config.feed_addr, "127.0.0.1:7000".parse().unwrap());
        assert_eq!(config.freshness_window, Duration::from_millis(2500));
        assert_eq!(config.max_silence, Duration::from_secs(60));
        assert_eq!(
            config.tolerances.power,
            Tolerance {
                absolute: 5.0,
                relative: 0.02
            }
        );
        assert_eq!(config.tolerances.voltage.relative, 0.02);
        assert_eq!(config.no_data, NoDataPolicy::PublishInvalid);
        assert_eq!(config.voltage_policy, VoltagePolicy::Reference(Role::Battery));
    }

    #[test]
    fn test_mean_voltage_policy() {
        let config =
            Config::from_lookup(lookup_from(&[("DCSYSTEM_VOLTAGE_POLICY", "mean")])).unwrap();
        assert_eq!(config.voltage_policy, VoltagePolicy::Mean);
    }

    #[test]
    fn test_malformed_values_name_the_variable() {
        let err = Config::from_lookup(lookup_from(&[("DCSYSTEM_FRESHNESS_MS", "soon")]))
            .unwrap_err();
        assert!(err.to_string().contains("DCSYSTEM_FRESHNESS_MS"));

        let err = Config::from_lookup(lookup_from(&[("DCSYSTEM_VOLTAGE_REFERENCE_ROLE", "tank")]))
            .unwrap_err();
        assert!(err.to_string().contains("DCSYSTEM_VOLTAGE_REFERENCE_ROLE"));

        let err =
            Config::from_lookup(lookup_from(&[("DCSYSTEM_NO_DATA", "zero")])).unwrap_err();
        assert!(err.to_string().contains("DCSYSTEM_NO_DATA"));
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        assert!(Config::from_lookup(lookup_from(&[("DCSYSTEM_SWEEP_MS", "0")])).is_err());
    }
}
