// LG system-aircon codec. Strict request/response: an 8-byte request goes
// out, a 16-byte status frame comes back. The checksum on both directions is
// the byte sum xored with 0x55.

use serde_json::{Map, Value};
use thiserror::Error;

pub const REQUEST_MAGIC: [u8; 3] = [0x80, 0x00, 0xa3];
pub const REQUEST_LEN: usize = 8;
pub const RESPONSE_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LgacError {
    #[error("response is {0} bytes, want {RESPONSE_LEN}")]
    Length(usize),
    #[error("response checksum mismatch")]
    Checksum,
}

pub fn lgac_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b)) ^ 0x55
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Scan,
    Status,
    Off,
    On,
    LockOn,
    LockOff,
}

impl Action {
    pub fn code(self) -> u8 {
        match self {
            Action::Scan => 0x00,
            Action::Status => 0x01,
            Action::Off => 0x02,
            Action::On => 0x03,
            Action::LockOn => 0x06,
            Action::LockOff => 0x07,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => Action::Scan,
            0x02 => Action::Off,
            0x03 => Action::On,
            0x06 => Action::LockOn,
            0x07 => Action::LockOff,
            _ => Action::Status,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpMode {
    Cool,
    Dry,
    FanOnly,
    Heat,
}

impl OpMode {
    /// Low three bits of the mode byte. Auto (3) is reported as cool, the
    /// controller does not support it.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => OpMode::Dry,
            2 => OpMode::FanOnly,
            4 => OpMode::Heat,
            _ => OpMode::Cool,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            OpMode::Cool => 0,
            OpMode::Dry => 1,
            OpMode::FanOnly => 2,
            OpMode::Heat => 4,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OpMode::Cool => "cool",
            OpMode::Dry => "dry",
            OpMode::FanOnly => "fan_only",
            OpMode::Heat => "heat",
        }
    }

    pub fn from_payload(payload: &str) -> Option<Self> {
        match payload {
            "cool" => Some(OpMode::Cool),
            "dry" => Some(OpMode::Dry),
            "fan_only" => Some(OpMode::FanOnly),
            "heat" => Some(OpMode::Heat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanMove {
    Swing,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcFanSpeed {
    Off,
    Low,
    Medium,
    High,
    Silent,
    Power,
}

impl AcFanSpeed {
    /// Bits 4..6 of the mode byte. Auto (4) comes back as low.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            2 => AcFanSpeed::Medium,
            3 => AcFanSpeed::High,
            5 => AcFanSpeed::Silent,
            6 => AcFanSpeed::Power,
            _ => AcFanSpeed::Low,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            AcFanSpeed::Off => 0,
            AcFanSpeed::Low => 1,
            AcFanSpeed::Medium => 2,
            AcFanSpeed::High => 3,
            AcFanSpeed::Silent => 5,
            AcFanSpeed::Power => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AcFanSpeed::Off => "off",
            AcFanSpeed::Low => "low",
            AcFanSpeed::Medium => "medium",
            AcFanSpeed::High => "high",
            AcFanSpeed::Silent => "silent",
            AcFanSpeed::Power => "power",
        }
    }

    pub fn from_payload(payload: &str) -> Self {
        match payload {
            "low" => AcFanSpeed::Low,
            "medium" => AcFanSpeed::Medium,
            "high" => AcFanSpeed::High,
            "silent" => AcFanSpeed::Silent,
            _ => AcFanSpeed::Off,
        }
    }
}

/// One outbound exchange: what to ask of a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AirconRequest {
    pub action: Action,
    pub opmode: OpMode,
    pub fan_move: FanMove,
    pub fan_speed: AcFanSpeed,
    pub target_temp: i32,
}

impl AirconRequest {
    pub fn status_probe() -> Self {
        AirconRequest {
            action: Action::Status,
            opmode: OpMode::Cool,
            fan_move: FanMove::Fixed,
            fan_speed: AcFanSpeed::Off,
            target_temp: 25,
        }
    }
}

fn pack_mode(opmode: OpMode, fan_move: FanMove, fan_speed: AcFanSpeed) -> u8 {
    let mut mode = opmode.code();
    if fan_move == FanMove::Swing {
        mode |= 0x08;
    }
    mode | ((fan_speed.code() << 4) & 0xf0)
}

pub fn encode_request(unit: u8, req: &AirconRequest) -> [u8; REQUEST_LEN] {
    let mut out = [0u8; REQUEST_LEN];
    out[..3].copy_from_slice(&REQUEST_MAGIC);
    out[3] = unit & 0x0f; // group is always 0 here
    out[4] = req.action.code();
    out[5] = pack_mode(req.opmode, req.fan_move, req.fan_speed);
    // off-scale targets encode the sentinel raw value 10
    out[6] = if req.target_temp > 18 && req.target_temp <= 30 {
        (req.target_temp - 0x0f) as u8
    } else {
        10
    };
    out[7] = lgac_checksum(&out[..7]);
    out
}

/// Raw temperature bytes code `54.0 - raw/4` degrees C.
pub fn calc_temp(raw: u8) -> f64 {
    let celsius = 54.0 - raw as f64 / 4.0;
    (celsius * 100.0).round() / 100.0
}

#[derive(Debug, Clone, PartialEq)]
pub struct AirconStatus {
    pub unit: u8,
    pub action: Action,
    pub opmode: OpMode,
    pub fan_move: FanMove,
    pub fan_speed: AcFanSpeed,
    pub set_temp: i32,
    pub current_temp: f64,
    pub pipe1_temp: f64,
    pub pipe2_temp: f64,
}

pub fn decode_response(raw: &[u8], temperature_adjust: f64) -> Result<AirconStatus, LgacError> {
    if raw.len() != RESPONSE_LEN {
        return Err(LgacError::Length(raw.len()));
    }
    if raw[RESPONSE_LEN - 1] != lgac_checksum(&raw[..RESPONSE_LEN - 1]) {
        return Err(LgacError::Checksum);
    }
    let mode = raw[6];
    Ok(AirconStatus {
        unit: raw[4],
        action: Action::from_code(raw[1]),
        opmode: OpMode::from_bits(mode),
        fan_move: if mode & 0x08 != 0 {
            FanMove::Swing
        } else {
            FanMove::Fixed
        },
        fan_speed: AcFanSpeed::from_bits(mode >> 4),
        set_temp: (raw[7] & 0x0f) as i32 + 0x0f,
        current_temp: temperature_adjust + calc_temp(raw[8]),
        pipe1_temp: calc_temp(raw[9]),
        pipe2_temp: calc_temp(raw[10]),
    })
}

/// Project a status into the climate-entity state document.
pub fn status_json(status: &AirconStatus) -> Value {
    let mode = match status.action {
        Action::Off | Action::LockOff => "off",
        _ => status.opmode.as_str(),
    };
    let swing = if status.fan_move == FanMove::Swing {
        "on"
    } else {
        "off"
    };
    let mut map = Map::new();
    map.insert("mode".to_string(), Value::String(mode.to_string()));
    map.insert("swing_mode".to_string(), Value::String(swing.to_string()));
    map.insert(
        "fan_mode".to_string(),
        Value::String(status.fan_speed.as_str().to_string()),
    );
    map.insert(
        "current_temp".to_string(),
        Value::String(format!("{:.2}", status.current_temp)),
    );
    map.insert("target_temp".to_string(), Value::from(status.set_temp));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cool_22_low_fixed_request_bytes() {
        let req = AirconRequest {
            action: Action::On,
            opmode: OpMode::Cool,
            fan_move: FanMove::Fixed,
            fan_speed: AcFanSpeed::Low,
            target_temp: 22,
        };
        let bytes = encode_request(2, &req);
        assert_eq!(&bytes[..3], &[0x80, 0x00, 0xa3]);
        assert_eq!(bytes[3], 0x02);
        assert_eq!(bytes[4], 0x03);
        assert_eq!(bytes[5], 0x10); // cool, no swing, fan low
        assert_eq!(bytes[6], 0x07); // 22 - 0x0f
        assert_eq!(bytes[7], lgac_checksum(&bytes[..7]));
    }

    #[test]
    fn out_of_range_target_uses_sentinel() {
        let mut req = AirconRequest::status_probe();
        req.target_temp = 17;
        assert_eq!(encode_request(0, &req)[6], 10);
        req.target_temp = 31;
        assert_eq!(encode_request(0, &req)[6], 10);
        req.target_temp = 19;
        assert_eq!(encode_request(0, &req)[6], 0x04);
        req.target_temp = 30;
        assert_eq!(encode_request(0, &req)[6], 0x0f);
    }

    fn response(action: u8, mode: u8, set_temp: u8, cur_raw: u8) -> [u8; RESPONSE_LEN] {
        let mut raw = [0u8; RESPONSE_LEN];
        raw[0] = 0x80;
        raw[1] = action;
        raw[4] = 0x02;
        raw[6] = mode;
        raw[7] = set_temp;
        raw[8] = cur_raw;
        raw[9] = 0x70;
        raw[10] = 0x74;
        raw[15] = lgac_checksum(&raw[..15]);
        raw
    }

    #[test]
    fn decodes_cool_status() {
        // on, cool, no swing, fan low, set 22, current 24.5 + 0.5 adjust
        let raw = response(0x03, 0x10, 0x07, 118);
        let status = decode_response(&raw, 0.5).unwrap();
        assert_eq!(status.action, Action::On);
        assert_eq!(status.opmode, OpMode::Cool);
        assert_eq!(status.fan_move, FanMove::Fixed);
        assert_eq!(status.fan_speed, AcFanSpeed::Low);
        assert_eq!(status.set_temp, 22);
        assert_eq!(status.current_temp, 25.0);
        assert_eq!(
            status_json(&status),
            json!({
                "mode": "cool",
                "swing_mode": "off",
                "fan_mode": "low",
                "current_temp": "25.00",
                "target_temp": 22,
            })
        );
    }

    #[test]
    fn off_actions_project_mode_off() {
        let raw = response(0x02, 0x4c, 0x0a, 120);
        let status = decode_response(&raw, 0.5).unwrap();
        assert_eq!(status.opmode, OpMode::Heat);
        assert_eq!(status.fan_move, FanMove::Swing);
        assert_eq!(status.fan_speed, AcFanSpeed::Low); // auto reads as low
        assert_eq!(status_json(&status)["mode"], "off");
    }

    #[test]
    fn checksum_and_size_are_protocol_faults() {
        let mut raw = response(0x03, 0x10, 0x07, 118);
        assert_eq!(decode_response(&raw[..10], 0.0), Err(LgacError::Length(10)));
        raw[15] ^= 0x01;
        assert_eq!(decode_response(&raw, 0.0), Err(LgacError::Checksum));
    }

    #[test]
    fn temp_formula() {
        assert_eq!(calc_temp(116), 25.0);
        assert_eq!(calc_temp(117), 24.75);
        assert_eq!(calc_temp(0), 54.0);
    }

    #[test]
    fn unknown_action_reads_as_status() {
        assert_eq!(Action::from_code(0x42), Action::Status);
    }
}
