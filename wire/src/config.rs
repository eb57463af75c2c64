// Startup configuration for both buses and the MQTT side. Populated once
// from environment variables, read-only afterwards.

use std::env;
use std::time::Duration;

use thiserror::Error;

/// A device is re-checked when its last scan is older than this.
pub const WALLPAD_SCAN_INTERVAL: Duration = Duration::from_secs(120);
/// Minimum gap between consecutive wallpad bus writes.
pub const PACKET_RESEND_INTERVAL: Duration = Duration::from_millis(800);
/// Settle time between an aircon request and its response read.
pub const RS485_WRITE_INTERVAL: Duration = Duration::from_millis(100);
/// Scan task wakeup period (2x the RS485 write interval).
pub const SCAN_TICK_INTERVAL: Duration = Duration::from_millis(200);
/// Consecutive aircon read failures tolerated before giving up.
pub const MAX_READ_ERROR_RETRY: u32 = 3;

pub const INIT_TEMP: i32 = 22;
pub const DEFAULT_TEMPERATURE_ADJUST: f64 = 0.5;
pub const ALTERNATIVE_HEADER_DEBUG: bool = false;

pub const SERVICE_NAME: &str = "kocom";
pub const AIRCON_SERVICE_NAME: &str = "LGAircon";
pub const HA_PREFIX: &str = "homeassistant";
pub const CONTROL_PREFIX: &str = "rs485";
pub const CONTROL_BRIDGE: &str = "bridge";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: [{value}]")]
    Invalid { var: &'static str, value: String },
}

/// Ordered mapping from a bus room index to a room name. The bus numbers
/// rooms differently per device class, so the bridge carries one table for
/// lights/plugs, one for thermostats and one for aircons.
#[derive(Debug, Clone, Default)]
pub struct RoomTable {
    names: Vec<String>,
}

impl RoomTable {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self, index: u8) -> Option<&str> {
        self.names.get(index as usize).map(String::as_str)
    }

    pub fn index(&self, name: &str) -> Option<u8> {
        self.names.iter().position(|n| n == name).map(|i| i as u8)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u8, &str)> {
        self.names
            .iter()
            .enumerate()
            .map(|(i, n)| (i as u8, n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct DeviceEnables {
    pub light: bool,
    pub plug: bool,
    pub thermostat: bool,
    pub fan: bool,
    pub gas: bool,
    pub elevator: bool,
}

impl Default for DeviceEnables {
    fn default() -> Self {
        Self {
            light: true,
            plug: true,
            thermostat: true,
            fan: true,
            gas: true,
            elevator: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub mqtt_server: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub kocom_server: String,
    pub kocom_port: u16,
    /// Absent when no aircon gateway is configured; the aircon engine then
    /// stays idle.
    pub aircon_server: Option<String>,
    pub aircon_port: u16,
    pub rooms: RoomTable,
    pub thermostat_rooms: RoomTable,
    pub aircon_rooms: RoomTable,
    /// (room name, switch count) for rooms that have lights on the bus.
    pub light_sizes: Vec<(String, usize)>,
    pub plug_sizes: Vec<(String, usize)>,
    pub enables: DeviceEnables,
    pub temperature_adjust: f64,
    pub partial_debug: bool,
    pub log_level: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let rooms = RoomTable::new([
            "livingroom",
            "bedroom",
            "room2",
            "room1",
            "room3",
            "kitchen",
        ]);
        let plug_sizes = rooms.iter().map(|(_, n)| (n.to_string(), 2)).collect();
        Self {
            mqtt_server: String::new(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            kocom_server: String::new(),
            kocom_port: 8899,
            aircon_server: None,
            aircon_port: 8899,
            rooms,
            thermostat_rooms: RoomTable::new([
                "livingroom",
                "bedroom",
                "room1",
                "room2",
                "room3",
            ]),
            aircon_rooms: RoomTable::new([
                "livingroom",
                "kitchen",
                "bedroom",
                "room2",
                "room1",
                "room3",
            ]),
            light_sizes: vec![("livingroom".to_string(), 3)],
            plug_sizes,
            enables: DeviceEnables::default(),
            temperature_adjust: DEFAULT_TEMPERATURE_ADJUST,
            partial_debug: false,
            log_level: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        cfg.mqtt_server = env::var("MQTT_SERVER_IP").map_err(|_| ConfigError::Missing("MQTT_SERVER_IP"))?;
        cfg.mqtt_port = opt_port("MQTT_SERVER_PORT", cfg.mqtt_port)?;
        cfg.mqtt_username = env::var("MQTT_USERNAME").ok().filter(|s| !s.is_empty());
        cfg.mqtt_password = env::var("MQTT_PASSWORD").ok().filter(|s| !s.is_empty());

        cfg.kocom_server = env::var("KOCOM_SERVER_IP").map_err(|_| ConfigError::Missing("KOCOM_SERVER_IP"))?;
        cfg.kocom_port = opt_port("KOCOM_SERVER_PORT", cfg.kocom_port)?;

        cfg.aircon_server = env::var("LGAIRCON_SERVER_IP").ok().filter(|s| !s.is_empty());
        cfg.aircon_port = opt_port("LGAIRCON_SERVER_PORT", cfg.aircon_port)?;

        if let Ok(level) = env::var("CONF_LOGLEVEL") {
            cfg.log_level = level;
        }
        if let Ok(partial) = env::var("PARTIAL_DEBUG") {
            cfg.partial_debug = !partial.is_empty() && partial != "false";
        }
        if let Ok(adjust) = env::var("TEMPERATURE_ADJUST") {
            cfg.temperature_adjust = adjust.parse().map_err(|_| ConfigError::Invalid {
                var: "TEMPERATURE_ADJUST",
                value: adjust,
            })?;
        }

        if let Ok(rooms) = env::var("ROOMS") {
            let names = split_names(&rooms);
            cfg.rooms = RoomTable::new(names.clone());

            if let Ok(plugs) = env::var("ROOMS_PLUG_NUMBERS") {
                cfg.plug_sizes = paired_sizes(&names, &split_counts("ROOMS_PLUG_NUMBERS", &plugs)?);
            }
            if let Ok(lights) = env::var("ROOMS_LIGHT_NUMBERS") {
                cfg.light_sizes = paired_sizes(&names, &split_counts("ROOMS_LIGHT_NUMBERS", &lights)?);
            }
        }
        if let Ok(thermostats) = env::var("ROOMS_THERMOSTATS") {
            cfg.thermostat_rooms = RoomTable::new(split_names(&thermostats));
        }
        if let Ok(aircons) = env::var("ROOMS_AIRCONS") {
            cfg.aircon_rooms = RoomTable::new(split_names(&aircons));
        }

        Ok(cfg)
    }

    pub fn light_count(&self, room: &str) -> usize {
        self.light_sizes
            .iter()
            .find(|(n, _)| n == room)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }

    pub fn plug_count(&self, room: &str) -> usize {
        self.plug_sizes
            .iter()
            .find(|(n, _)| n == room)
            .map(|(_, c)| *c)
            .unwrap_or(0)
    }
}

fn opt_port(var: &'static str, default: u16) -> Result<u16, ConfigError> {
    match env::var(var) {
        Ok(value) => value.parse().map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(default),
    }
}

fn split_names(raw: &str) -> Vec<String> {
    raw.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn split_counts(var: &'static str, raw: &str) -> Result<Vec<usize>, ConfigError> {
    raw.split(':')
        .map(|s| {
            s.trim().parse().map_err(|_| ConfigError::Invalid {
                var,
                value: raw.to_string(),
            })
        })
        .collect()
}

fn paired_sizes(rooms: &[String], counts: &[usize]) -> Vec<(String, usize)> {
    rooms
        .iter()
        .zip(counts.iter())
        .filter(|(_, c)| **c > 0)
        .map(|(n, c)| (n.clone(), *c))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_table_maps_both_ways() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.rooms.name(0), Some("livingroom"));
        assert_eq!(cfg.rooms.index("kitchen"), Some(5));
        assert_eq!(cfg.rooms.name(9), None);
        // the thermostat bus numbers room1/room2 the other way around
        assert_eq!(cfg.thermostat_rooms.index("room1"), Some(2));
        assert_eq!(cfg.rooms.index("room1"), Some(3));
    }

    #[test]
    fn default_sizes() {
        let cfg = BridgeConfig::default();
        assert_eq!(cfg.light_count("livingroom"), 3);
        assert_eq!(cfg.light_count("bedroom"), 0);
        assert_eq!(cfg.plug_count("kitchen"), 2);
    }

    #[test]
    fn colon_lists() {
        assert_eq!(split_names("livingroom:bedroom"), vec!["livingroom", "bedroom"]);
        let sizes = paired_sizes(
            &split_names("a:b:c"),
            &[3, 0, 2],
        );
        assert_eq!(sizes, vec![("a".to_string(), 3), ("c".to_string(), 2)]);
    }
}
