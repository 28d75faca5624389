//! DC System Aggregator Library
//!
//! This library derives the unmeasured DC system power on a DC bus from the
//! readings of the chargers, loads, inverters and batteries sharing that bus,
//! and republishes the result as a virtual Modbus device.

pub mod aggregator;
pub mod bus;
pub mod config;
pub mod dc_system_device;
pub mod engine;
pub mod event_feed;
pub mod peer_registry;
pub mod publisher;
pub mod reading_cache;

// Re-export commonly used types for easier access
pub use aggregator::{Aggregate, AggregateSnapshot, Aggregator, VoltagePolicy};
pub use bus::{BusEvent, BusValue, PeerId};
pub use config::Config;
pub use dc_system_device::DcSystemDevice;
pub use engine::DcSystemEngine;
pub use event_feed::EventFeed;
pub use peer_registry::{PeerRegistry, Role};
pub use publisher::{NoDataPolicy, Publication, Publisher};
pub use reading_cache::{Reading, ReadingCache, Validity};
