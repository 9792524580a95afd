use std::time::Duration;

use crate::{
    DEFAULT_TTL, FINGER_TABLE_SIZE, NETWORK_ID, NETWORK_VERSION, NUM_REPLICAS,
    PREDECESSOR_TABLE_SIZE, STABILIZE_PERIOD, STORAGE_SWEEP_PERIOD, SUCCESSOR_TABLE_SIZE,
};

/// Tunables for a single node. `Config::default()` matches the crate constants.
#[derive(Clone, Debug)]
pub struct Config {
    pub successor_table_size: usize,
    pub predecessor_table_size: usize,
    pub finger_table_size: usize,
    pub num_replicas: usize,
    pub stabilize_period: Duration,
    pub storage_sweep_period: Duration,
    pub default_ttl: u8,
    /// Only the low 24 bits go on the wire.
    pub network_id: u32,
    pub network_version: u8,
    /// Lets `route_for` take finger shortcuts. Experimental.
    pub finger_routing: bool,
    pub password: String,
    pub role: String,
    pub fingerprint: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            successor_table_size: SUCCESSOR_TABLE_SIZE,
            predecessor_table_size: PREDECESSOR_TABLE_SIZE,
            finger_table_size: FINGER_TABLE_SIZE,
            num_replicas: NUM_REPLICAS,
            stabilize_period: Duration::from_secs(STABILIZE_PERIOD),
            storage_sweep_period: Duration::from_secs(STORAGE_SWEEP_PERIOD),
            default_ttl: DEFAULT_TTL,
            network_id: NETWORK_ID,
            network_version: NETWORK_VERSION,
            finger_routing: false,
            password: "guest".to_string(),
            role: "active".to_string(),
            fingerprint: 0,
        }
    }
}

impl Config {
    /// Returns the ring-offset step between consecutive fingers, as a power-of-two exponent.
    pub fn finger_shift(&self) -> usize {
        if self.finger_table_size == 0 {
            return 0;
        }
        crate::IDENTIFIER_LENGTH * 8 / self.finger_table_size
    }
}
