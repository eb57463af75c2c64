// Device records for everything behind the wallpad, the value-field codecs
// and the JSON state maps the controller sees. One record per physical
// device; banks of switches (lights, plugs) are one record per room.

use std::time::Instant;

use serde_json::{Map, Value};

use crate::config::{BridgeConfig, INIT_TEMP};
use crate::kocom::{
    build_frame, Command, DeviceKind, FrameError, Packet, PacketType, FRAME_LEN, VALUE_LEN,
};

pub const ROOM_WALLPAD: &str = "wallpad";

fn on_off(on: bool) -> Value {
    Value::String(if on { "on" } else { "off" }.to_string())
}

// ---------------------------------------------------------------------------
// lights and plugs

/// A room's bank of individually switchable outputs. Index 0 is the entry
/// named `<kind>1`; the aggregate `<kind>0` is derived on decode and never
/// stored or encoded.
#[derive(Debug, Clone)]
pub struct SwitchBank {
    pub kind: DeviceKind,
    pub room: String,
    pub switches: Vec<bool>,
    pub last_scan: Option<Instant>,
}

impl SwitchBank {
    pub fn new(kind: DeviceKind, room: &str, count: usize, initial_on: bool) -> Self {
        SwitchBank {
            kind,
            room: room.to_string(),
            switches: vec![initial_on; count],
            last_scan: None,
        }
    }

    /// Apply a controller command addressed to `<kind>N`. `<kind>0` is the
    /// aggregate entry and changes nothing.
    pub fn set_named(&mut self, sub_device: &str, on: bool) -> bool {
        let Some(num) = sub_device
            .strip_prefix(self.kind.name())
            .and_then(|n| n.parse::<usize>().ok())
        else {
            return false;
        };
        if num == 0 || num > self.switches.len() {
            return false;
        }
        self.switches[num - 1] = on;
        true
    }

    /// Switch N drives value byte N-1 to 0xff.
    pub fn encode_value(&self) -> [u8; VALUE_LEN] {
        let mut value = [0u8; VALUE_LEN];
        for (i, on) in self.switches.iter().enumerate().take(VALUE_LEN) {
            if *on {
                value[i] = 0xff;
            }
        }
        value
    }

    pub fn command_frame(&self, cmd: Command, cfg: &BridgeConfig) -> Option<[u8; FRAME_LEN]> {
        let room_no = cfg.rooms.index(&self.room)?;
        let value = if cmd == Command::Check {
            [0u8; VALUE_LEN]
        } else {
            self.encode_value()
        };
        build_frame(self.kind, room_no, DeviceKind::Wallpad, cmd, value)
    }
}

pub fn decode_switch_bank(kind: DeviceKind, value: &[u8; VALUE_LEN], count: usize) -> Value {
    let mut map = Map::new();
    let mut any_on = false;
    for (i, byte) in value.iter().enumerate().take(count.min(VALUE_LEN)) {
        let on = *byte != 0x00;
        any_on |= on;
        map.insert(format!("{}{}", kind.name(), i + 1), on_off(on));
    }
    map.insert(format!("{}0", kind.name()), on_off(any_on));
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// thermostat

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeatMode {
    Off,
    Heat,
    FanOnly,
}

impl HeatMode {
    pub fn as_str(self) -> &'static str {
        match self {
            HeatMode::Off => "off",
            HeatMode::Heat => "heat",
            HeatMode::FanOnly => "fan_only",
        }
    }

    pub fn from_payload(payload: &str) -> Option<Self> {
        match payload {
            "off" => Some(HeatMode::Off),
            "heat" => Some(HeatMode::Heat),
            "fan_only" => Some(HeatMode::FanOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Thermostat {
    pub room: String,
    pub mode: HeatMode,
    pub current_temp: i32,
    pub target_temp: i32,
    pub last_scan: Option<Instant>,
}

impl Thermostat {
    pub fn new(room: &str) -> Self {
        Thermostat {
            room: room.to_string(),
            mode: HeatMode::Off,
            current_temp: INIT_TEMP,
            target_temp: INIT_TEMP,
            last_scan: None,
        }
    }

    pub fn encode_value(&self) -> [u8; VALUE_LEN] {
        let mut value = match self.mode {
            HeatMode::Heat => [0x11, 0x00, 0, 0, 0, 0, 0, 0],
            HeatMode::Off => [0x00, 0x01, 0, 0, 0, 0, 0, 0],
            HeatMode::FanOnly => [0x11, 0x01, 0, 0, 0, 0, 0, 0],
        };
        value[2] = (self.target_temp & 0xff) as u8;
        value
    }

    pub fn command_frame(&self, cmd: Command, cfg: &BridgeConfig) -> Option<[u8; FRAME_LEN]> {
        let room_no = cfg.thermostat_rooms.index(&self.room)?;
        let value = if cmd == Command::Check {
            [0u8; VALUE_LEN]
        } else {
            self.encode_value()
        };
        build_frame(DeviceKind::Thermostat, room_no, DeviceKind::Wallpad, cmd, value)
    }
}

pub fn decode_thermostat(value: &[u8; VALUE_LEN]) -> Value {
    let is_heat = value[0] == 0x11;
    let is_away = value[1] == 0x01;
    let current_temp = value[4] as i32;
    let (mode, target_temp) = if is_heat && is_away {
        // away-from-home reports as fan_only with the target frozen
        (HeatMode::FanOnly, INIT_TEMP)
    } else if is_heat {
        (HeatMode::Heat, value[2] as i32)
    } else {
        (HeatMode::Off, INIT_TEMP)
    };
    let mut map = Map::new();
    map.insert("mode".to_string(), Value::String(mode.as_str().to_string()));
    map.insert("current_temp".to_string(), Value::from(current_temp));
    map.insert("target_temp".to_string(), Value::from(target_temp));
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// ventilation fan and its CO2 sensor

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanSpeed {
    Off,
    Low,
    Medium,
    High,
}

impl FanSpeed {
    /// High nibble of value byte 2.
    pub fn code(self) -> u8 {
        match self {
            FanSpeed::Off => 0x00,
            FanSpeed::Low => 0x40,
            FanSpeed::Medium => 0x80,
            FanSpeed::High => 0xc0,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code & 0xf0 {
            0x00 => Some(FanSpeed::Off),
            0x40 => Some(FanSpeed::Low),
            0x80 => Some(FanSpeed::Medium),
            0xc0 => Some(FanSpeed::High),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FanSpeed::Off => "off",
            FanSpeed::Low => "low",
            FanSpeed::Medium => "medium",
            FanSpeed::High => "high",
        }
    }

    pub fn from_payload(payload: &str) -> Option<Self> {
        match payload {
            "off" => Some(FanSpeed::Off),
            "low" => Some(FanSpeed::Low),
            "medium" => Some(FanSpeed::Medium),
            "high" => Some(FanSpeed::High),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fan {
    pub on: bool,
    pub speed: FanSpeed,
    pub last_scan: Option<Instant>,
}

impl Fan {
    pub fn new() -> Self {
        Fan {
            on: false,
            speed: FanSpeed::Off,
            last_scan: None,
        }
    }

    pub fn encode_value(&self) -> [u8; VALUE_LEN] {
        let mut value = if self.on {
            [0x11, 0x00, 0, 0, 0, 0, 0, 0]
        } else {
            [0x00, 0x01, 0, 0, 0, 0, 0, 0]
        };
        value[2] = self.speed.code() & 0xf0;
        value
    }

    pub fn command_frame(&self, cmd: Command) -> Option<[u8; FRAME_LEN]> {
        let value = if cmd == Command::Check {
            [0u8; VALUE_LEN]
        } else {
            self.encode_value()
        };
        build_frame(DeviceKind::Fan, 0, DeviceKind::Wallpad, cmd, value)
    }
}

impl Default for Fan {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decode_fan(value: &[u8; VALUE_LEN]) -> Value {
    let mut on = value[0] == 0x11;
    let speed = FanSpeed::from_code(value[2]).unwrap_or(FanSpeed::Off);
    if speed == FanSpeed::Off {
        on = false;
    }
    let mut map = Map::new();
    map.insert("fan_mode".to_string(), on_off(on));
    map.insert(
        "fan_speed".to_string(),
        Value::String(speed.as_str().to_string()),
    );
    Value::Object(map)
}

pub fn decode_fan_sensor(value: &[u8; VALUE_LEN]) -> Value {
    let co2 = value[4] as i64 * 100 + value[5] as i64;
    let mut map = Map::new();
    map.insert("co2".to_string(), Value::from(co2));
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// gas valve

/// The bus only ever closes the valve; `on` tracks the last state the
/// controller drove, which the decode echoes back.
#[derive(Debug, Clone)]
pub struct Gas {
    pub on: bool,
    pub last_scan: Option<Instant>,
}

impl Gas {
    pub fn new() -> Self {
        Gas {
            on: true,
            last_scan: None,
        }
    }

    pub fn command_frame(&self, cmd: Command) -> Option<[u8; FRAME_LEN]> {
        let cmd = if cmd == Command::Check { cmd } else { Command::Off };
        build_frame(DeviceKind::Gas, 0, DeviceKind::Wallpad, cmd, [0u8; VALUE_LEN])
    }
}

impl Default for Gas {
    fn default() -> Self {
        Self::new()
    }
}

pub fn decode_gas(gas_on: bool) -> Value {
    let mut map = Map::new();
    map.insert("gas".to_string(), on_off(gas_on));
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// elevator call button

#[derive(Debug, Clone, Default)]
pub struct Elevator {
    pub called: bool,
}

impl Elevator {
    pub fn new() -> Self {
        Elevator { called: false }
    }

    /// The call is a SEND from the wallpad toward the elevator; only the
    /// status check goes the other way.
    pub fn command_frame(&self, cmd: Command) -> Option<[u8; FRAME_LEN]> {
        if cmd == Command::Check {
            build_frame(DeviceKind::Wallpad, 0, DeviceKind::Elevator, Command::Check, [0u8; VALUE_LEN])
        } else {
            build_frame(DeviceKind::Elevator, 0, DeviceKind::Wallpad, Command::On, [0u8; VALUE_LEN])
        }
    }
}

pub fn decode_elevator() -> Value {
    // the button is stateless from the controller's point of view
    let mut map = Map::new();
    map.insert("elevator".to_string(), on_off(false));
    Value::Object(map)
}

// ---------------------------------------------------------------------------
// frame -> state dispatch

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedUpdate {
    pub kind: DeviceKind,
    pub room: String,
    pub state: Value,
}

/// Turn a classified packet into a device update, normalising ACKs that the
/// wallpad answers on a device's behalf (source/destination swapped).
/// Returns `Ok(None)` for frames that carry nothing to report.
pub fn parse_update(
    packet: &Packet,
    ptype: PacketType,
    cfg: &BridgeConfig,
    gas_on: bool,
) -> Result<Option<ParsedUpdate>, FrameError> {
    let command = Command::from_code(packet.command);
    if ptype == PacketType::Ack && command == Some(Command::Check) {
        // just the ack for one of our checks
        return Ok(None);
    }

    let mut src_device = DeviceKind::from_code(packet.src_device)
        .ok_or(FrameError::UnknownDevice(packet.src_device))?;
    let mut dst_device = DeviceKind::from_code(packet.dst_device);
    let mut src_room = packet.src_room;

    if ptype == PacketType::Ack && src_device == DeviceKind::Wallpad {
        // the wallpad replies in the device's stead: flip to "device reports"
        let Some(dst) = dst_device else {
            return Err(FrameError::UnknownDevice(packet.dst_device));
        };
        src_device = dst;
        dst_device = Some(DeviceKind::Wallpad);
        src_room = packet.dst_room;
        log::debug!(
            "swapped src/dest ({:?} now reporting, room {})",
            src_device,
            src_room
        );
    }

    // fan frames re-addressed to themselves are the CO2 sensor reading
    if src_device == DeviceKind::Fan && dst_device == Some(DeviceKind::Fan) {
        return Ok(Some(ParsedUpdate {
            kind: DeviceKind::FanSensor,
            room: ROOM_WALLPAD.to_string(),
            state: decode_fan_sensor(&packet.value),
        }));
    }

    let update = match src_device {
        DeviceKind::Light | DeviceKind::Plug => {
            let Some(room) = cfg.rooms.name(src_room) else {
                log::debug!("no room [{src_room:#04x}] for {:?}", src_device);
                return Ok(None);
            };
            let count = match src_device {
                DeviceKind::Light => cfg.light_count(room),
                _ => cfg.plug_count(room),
            };
            ParsedUpdate {
                kind: src_device,
                room: room.to_string(),
                state: decode_switch_bank(src_device, &packet.value, count),
            }
        }
        DeviceKind::Thermostat => {
            let Some(room) = cfg.thermostat_rooms.name(src_room) else {
                log::debug!("no thermostat room [{src_room:#04x}]");
                return Ok(None);
            };
            ParsedUpdate {
                kind: DeviceKind::Thermostat,
                room: room.to_string(),
                state: decode_thermostat(&packet.value),
            }
        }
        DeviceKind::Fan => ParsedUpdate {
            kind: DeviceKind::Fan,
            room: ROOM_WALLPAD.to_string(),
            state: decode_fan(&packet.value),
        },
        DeviceKind::Gas => ParsedUpdate {
            kind: DeviceKind::Gas,
            room: ROOM_WALLPAD.to_string(),
            state: decode_gas(gas_on),
        },
        DeviceKind::Wallpad if ptype == PacketType::Send && dst_device == Some(DeviceKind::Elevator) => {
            ParsedUpdate {
                kind: DeviceKind::Elevator,
                room: ROOM_WALLPAD.to_string(),
                state: decode_elevator(),
            }
        }
        other => {
            log::debug!(
                "nothing to report for {:?} -> {:?} ({:?})",
                other,
                dst_device,
                ptype
            );
            return Ok(None);
        }
    };
    Ok(Some(update))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kocom::{classify, Packet, BODY_LEN};
    use serde_json::json;

    fn cfg() -> BridgeConfig {
        BridgeConfig::default()
    }

    fn ack_packet(dst: u8, dst_room: u8, src: u8, src_room: u8, value: [u8; 8]) -> Packet {
        Packet {
            type_and_seq: 0x30dc,
            dst_device: dst,
            dst_room,
            src_device: src,
            src_room,
            command: 0x00,
            value,
        }
    }

    #[test]
    fn light_command_frame_sets_value_byte() {
        let mut bank = SwitchBank::new(DeviceKind::Light, "livingroom", 3, false);
        assert!(bank.set_named("light2", true));
        let frame = bank.command_frame(Command::On, &cfg()).unwrap();
        assert_eq!(frame[5], 0x0e); // dest light
        assert_eq!(frame[6], 0x00); // livingroom
        assert_eq!(frame[9], 0x01); // on
        assert_eq!(&frame[10..18], &[0x00, 0xff, 0x00, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn aggregate_entry_ignores_commands() {
        let mut bank = SwitchBank::new(DeviceKind::Light, "livingroom", 3, false);
        assert!(!bank.set_named("light0", true));
        assert!(!bank.set_named("light9", true));
        assert!(!bank.set_named("plug1", true));
        assert!(bank.switches.iter().all(|s| !s));
    }

    #[test]
    fn light_round_trip() {
        let mut bank = SwitchBank::new(DeviceKind::Light, "livingroom", 3, false);
        bank.set_named("light2", true);
        let frame = bank.command_frame(Command::Status, &cfg()).unwrap();

        // the wallpad acks with the same value, addressing reversed
        let body: [u8; BODY_LEN] = frame[2..19].try_into().unwrap();
        let echo = Packet::unpack(&body);
        let ack = ack_packet(echo.src_device, 0, echo.dst_device, echo.dst_room, echo.value);
        let (ptype, _) = classify(ack.type_and_seq).unwrap();
        let update = parse_update(&ack, ptype, &cfg(), true).unwrap().unwrap();

        assert_eq!(update.kind, DeviceKind::Light);
        assert_eq!(update.room, "livingroom");
        assert_eq!(
            update.state,
            json!({"light1": "off", "light2": "on", "light3": "off", "light0": "on"})
        );
    }

    #[test]
    fn plug_round_trip_over_swapped_ack() {
        let mut bank = SwitchBank::new(DeviceKind::Plug, "kitchen", 2, true);
        bank.set_named("plug2", false);
        let value = bank.encode_value();
        // ACK straight from the wallpad: src wallpad, dest plug/kitchen
        let ack = ack_packet(0x3b, 0x05, 0x01, 0x00, value);
        let update = parse_update(&ack, PacketType::Ack, &cfg(), true)
            .unwrap()
            .unwrap();
        assert_eq!(update.kind, DeviceKind::Plug);
        assert_eq!(update.room, "kitchen");
        assert_eq!(
            update.state,
            json!({"plug1": "on", "plug2": "off", "plug0": "on"})
        );
    }

    #[test]
    fn thermostat_heat_24() {
        let mut thermostat = Thermostat::new("bedroom");
        thermostat.mode = HeatMode::Heat;
        thermostat.target_temp = 24;
        let frame = thermostat.command_frame(Command::Status, &cfg()).unwrap();
        assert_eq!(frame[5], 0x36);
        assert_eq!(frame[6], 0x01); // bedroom on the thermostat table
        assert_eq!(&frame[10..18], &[0x11, 0x00, 0x18, 0, 0, 0, 0, 0]);

        let ack = ack_packet(0x36, 0x01, 0x01, 0x00, [0x11, 0x00, 0x18, 0x00, 0x17, 0, 0, 0]);
        let update = parse_update(&ack, PacketType::Ack, &cfg(), true)
            .unwrap()
            .unwrap();
        assert_eq!(update.room, "bedroom");
        assert_eq!(
            update.state,
            json!({"mode": "heat", "current_temp": 23, "target_temp": 24})
        );
    }

    #[test]
    fn thermostat_away_freezes_target() {
        let value = [0x11, 0x01, 0x1c, 0x00, 0x15, 0, 0, 0];
        assert_eq!(
            decode_thermostat(&value),
            json!({"mode": "fan_only", "current_temp": 21, "target_temp": INIT_TEMP})
        );
    }

    #[test]
    fn fan_speed_off_forces_mode_off() {
        let value = [0x11, 0x00, 0x00, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_fan(&value),
            json!({"fan_mode": "off", "fan_speed": "off"})
        );
        let value = [0x11, 0x00, 0x80, 0, 0, 0, 0, 0];
        assert_eq!(
            decode_fan(&value),
            json!({"fan_mode": "on", "fan_speed": "medium"})
        );
    }

    #[test]
    fn fan_sensor_reads_co2() {
        let ack = ack_packet(0x48, 0x00, 0x48, 0x00, [0, 0, 0, 0, 0x04, 0x38, 0, 0]);
        let update = parse_update(&ack, PacketType::Ack, &cfg(), true)
            .unwrap()
            .unwrap();
        assert_eq!(update.kind, DeviceKind::FanSensor);
        assert_eq!(update.room, ROOM_WALLPAD);
        assert_eq!(update.state, json!({"co2": 456}));
    }

    #[test]
    fn gas_never_encodes_on() {
        let gas = Gas::new();
        for cmd in [Command::On, Command::Off, Command::Status] {
            let frame = gas.command_frame(cmd).unwrap();
            assert_eq!(frame[9], 0x02); // always off on the wire
        }
        let check = gas.command_frame(Command::Check).unwrap();
        assert_eq!(check[9], 0x3a);
    }

    #[test]
    fn elevator_call_goes_wallpad_to_elevator() {
        let elevator = Elevator::new();
        let call = elevator.command_frame(Command::Status).unwrap();
        assert_eq!(call[5], 0x44); // dest elevator
        assert_eq!(call[7], 0x01); // src wallpad
        assert_eq!(call[9], 0x01); // on

        let check = elevator.command_frame(Command::Check).unwrap();
        assert_eq!(check[5], 0x01); // dest wallpad
        assert_eq!(check[7], 0x44); // src elevator
        assert_eq!(check[9], 0x3a);
    }

    #[test]
    fn elevator_send_reports_off() {
        let send = Packet {
            type_and_seq: 0x30bc,
            dst_device: 0x44,
            dst_room: 0x00,
            src_device: 0x01,
            src_room: 0x00,
            command: 0x01,
            value: [0; 8],
        };
        let update = parse_update(&send, PacketType::Send, &cfg(), true)
            .unwrap()
            .unwrap();
        assert_eq!(update.kind, DeviceKind::Elevator);
        assert_eq!(update.state, json!({"elevator": "off"}));
    }

    #[test]
    fn ack_for_check_is_silent() {
        let mut ack = ack_packet(0x0e, 0x00, 0x01, 0x00, [0; 8]);
        ack.command = 0x3a;
        assert_eq!(parse_update(&ack, PacketType::Ack, &cfg(), true).unwrap(), None);
    }

    #[test]
    fn unknown_device_is_a_parse_fault() {
        let ack = ack_packet(0x0e, 0x00, 0x77, 0x00, [0; 8]);
        assert!(matches!(
            parse_update(&ack, PacketType::Ack, &cfg(), true),
            Err(FrameError::UnknownDevice(0x77))
        ));
    }
}
