// Kocom wallpad bus framing. A frame is 21 bytes on the wire: a 2-byte
// header pair, 17 body bytes (type/sequence, reserved, addressing, command,
// 8 value bytes, checksum) and a 0x0d 0x0d trailer. Besides the canonical
// aa 55 header a number of legacy header pairs show up on real buses; those
// carry shortened bodies that need the recovery transforms below before the
// checksum matches.

use enum_iterator::Sequence;
use thiserror::Error;

pub const FRAME_LEN: usize = 21;
pub const BODY_LEN: usize = 17;
pub const VALUE_LEN: usize = 8;

const TAIL_BYTE: u8 = 0x0d;

/// Canonical header pair plus type/sequence bytes used on every frame the
/// bridge emits.
pub const SEND_PREFIX: [u8; 5] = [0xaa, 0x55, 0x30, 0xbc, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderMark {
    pub name: &'static str,
    pub b1: u8,
    pub b2: u8,
    pub body_len: usize,
}

pub const HEADERS: [HeaderMark; 11] = [
    HeaderMark { name: "Main", b1: 0xaa, b2: 0x55, body_len: 17 },
    HeaderMark { name: "D555", b1: 0xd5, b2: 0x55, body_len: 16 },
    HeaderMark { name: "B515", b1: 0xb5, b2: 0x15, body_len: 16 },
    HeaderMark { name: "ABC1", b1: 0xab, b2: 0xc1, body_len: 16 },
    HeaderMark { name: "5530", b1: 0x55, b2: 0x30, body_len: 16 },
    HeaderMark { name: "D530", b1: 0xd5, b2: 0x30, body_len: 16 },
    HeaderMark { name: "D515", b1: 0xd5, b2: 0x15, body_len: 16 },
    HeaderMark { name: "5515", b1: 0x55, b2: 0x15, body_len: 16 },
    HeaderMark { name: "AD05", b1: 0xad, b2: 0x05, body_len: 16 },
    HeaderMark { name: "55E2", b1: 0x55, b2: 0xe2, body_len: 15 },
    HeaderMark { name: "55EA", b1: 0x55, b2: 0xea, body_len: 15 },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("checksum mismatch on {header} frame")]
    Checksum { header: &'static str },
    #[error("recovered body has length {0}, want {BODY_LEN}")]
    Length(usize),
    #[error("unknown packet type [{0:#06x}]")]
    UnknownType(u16),
    #[error("unknown device code [{0:#04x}]")]
    UnknownDevice(u8),
}

/// Unsigned 8-bit sum of everything but the trailing checksum byte.
pub fn body_checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn checksum_ok(body: &[u8]) -> bool {
    match body.split_last() {
        Some((last, rest)) => *last == body_checksum(rest),
        None => false,
    }
}

// ---------------------------------------------------------------------------
// devices and commands

#[derive(Debug, Clone, Copy, PartialEq, Eq, Sequence)]
pub enum DeviceKind {
    Wallpad,
    Light,
    Thermostat,
    Plug,
    Elevator,
    Gas,
    Fan,
    Aircon,
    FanSensor,
}

impl DeviceKind {
    /// Byte code on the kocom bus. Aircon and the CO2 sensor are synthetic
    /// and never addressed directly.
    pub fn code(self) -> Option<u8> {
        match self {
            DeviceKind::Wallpad => Some(0x01),
            DeviceKind::Light => Some(0x0e),
            DeviceKind::Thermostat => Some(0x36),
            DeviceKind::Plug => Some(0x3b),
            DeviceKind::Elevator => Some(0x44),
            DeviceKind::Gas => Some(0x2c),
            DeviceKind::Fan => Some(0x48),
            DeviceKind::Aircon | DeviceKind::FanSensor => None,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(DeviceKind::Wallpad),
            0x0e => Some(DeviceKind::Light),
            0x36 => Some(DeviceKind::Thermostat),
            0x3b => Some(DeviceKind::Plug),
            0x44 => Some(DeviceKind::Elevator),
            0x2c => Some(DeviceKind::Gas),
            0x48 => Some(DeviceKind::Fan),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DeviceKind::Wallpad => "wallpad",
            DeviceKind::Light => "light",
            DeviceKind::Thermostat => "thermostat",
            DeviceKind::Plug => "plug",
            DeviceKind::Elevator => "elevator",
            DeviceKind::Gas => "gas",
            DeviceKind::Fan => "fan",
            DeviceKind::Aircon => "aircon",
            DeviceKind::FanSensor => "fansensor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Check,
    Status,
    On,
    Off,
}

impl Command {
    pub fn code(self) -> u8 {
        match self {
            Command::Check => 0x3a,
            Command::Status => 0x00,
            Command::On => 0x01,
            Command::Off => 0x02,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x3a => Some(Command::Check),
            0x00 => Some(Command::Status),
            0x01 => Some(Command::On),
            0x02 => Some(Command::Off),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Send,
    Ack,
}

/// Split the type/sequence field. Family 0x30 carries the SEND/ACK nibble
/// and a 4-bit sequence counter; anything whose high byte matches a known
/// legacy header second byte is let through permissively as an ACK.
pub fn classify(type_and_seq: u16) -> Result<(PacketType, u8), FrameError> {
    if type_and_seq & 0xff00 == 0x3000 {
        let ptype = match type_and_seq & 0x00f0 {
            0x00b0 => PacketType::Send,
            0x00d0 => PacketType::Ack,
            _ => return Err(FrameError::UnknownType(type_and_seq)),
        };
        let seq = ((type_and_seq & 0x000f) as u8).wrapping_sub(0x0c);
        return Ok((ptype, seq));
    }
    let high = (type_and_seq >> 8) as u8;
    if HEADERS.iter().any(|h| h.b2 == high) {
        return Ok((PacketType::Ack, 0));
    }
    Err(FrameError::UnknownType(type_and_seq))
}

// ---------------------------------------------------------------------------
// structural packet

/// The 17-byte canonical body, unpacked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub type_and_seq: u16,
    pub dst_device: u8,
    pub dst_room: u8,
    pub src_device: u8,
    pub src_room: u8,
    pub command: u8,
    pub value: [u8; VALUE_LEN],
}

impl Packet {
    pub fn unpack(body: &[u8; BODY_LEN]) -> Self {
        let mut value = [0u8; VALUE_LEN];
        value.copy_from_slice(&body[8..16]);
        Packet {
            type_and_seq: u16::from_be_bytes([body[0], body[1]]),
            dst_device: body[3],
            dst_room: body[4],
            src_device: body[5],
            src_room: body[6],
            command: body[7],
            value,
        }
    }

    /// Build a full 21-byte wire frame with the canonical prefix, checksum
    /// and trailer. Addressing and value come from `self`; the type/sequence
    /// field is always the canonical 0x30 0xbc.
    pub fn pack(&self) -> [u8; FRAME_LEN] {
        let mut frame = [0u8; FRAME_LEN];
        frame[..5].copy_from_slice(&SEND_PREFIX);
        frame[5] = self.dst_device;
        frame[6] = self.dst_room;
        frame[7] = self.src_device;
        frame[8] = self.src_room;
        frame[9] = self.command;
        frame[10..18].copy_from_slice(&self.value);
        frame[18] = body_checksum(&frame[2..18]);
        frame[19] = TAIL_BYTE;
        frame[20] = TAIL_BYTE;
        frame
    }
}

/// Shorthand used by every device encoder: destination device/room, source
/// wallpad, command, value.
pub fn build_frame(
    dst: DeviceKind,
    dst_room: u8,
    src: DeviceKind,
    command: Command,
    value: [u8; VALUE_LEN],
) -> Option<[u8; FRAME_LEN]> {
    let packet = Packet {
        type_and_seq: 0x30bc,
        dst_device: dst.code()?,
        dst_room,
        src_device: src.code()?,
        src_room: 0,
        command: command.code(),
        value,
    };
    Some(packet.pack())
}

// ---------------------------------------------------------------------------
// framer

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    WaitHead,
    WaitBody,
    WaitTail,
}

/// A header-delimited chunk as it came off the wire, before checksum
/// validation. The body may be shorter than the header's tabulated length
/// when the trailer pair showed up early.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub header: HeaderMark,
    pub body: Vec<u8>,
}

/// Checksum-validated frame. `alternate` marks frames that arrived under a
/// legacy header; their state updates are logged but not published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalFrame {
    pub alternate: bool,
    pub body: [u8; BODY_LEN],
}

/// Byte-at-a-time reassembly with resync. Feed every byte read from the
/// socket; a `Some` return is a complete header+body chunk whose trailer
/// matched.
#[derive(Debug)]
pub struct Framer {
    state: ReadState,
    header: Option<HeaderMark>,
    body: Vec<u8>,
    tail_len: usize,
    prev: u8,
}

impl Framer {
    pub fn new() -> Self {
        Framer {
            state: ReadState::WaitHead,
            header: None,
            body: Vec::with_capacity(BODY_LEN),
            tail_len: 0,
            prev: 0,
        }
    }

    pub fn reset(&mut self) {
        self.state = ReadState::WaitHead;
        self.header = None;
        self.body.clear();
        self.tail_len = 0;
        self.prev = 0;
    }

    pub fn push(&mut self, byte: u8) -> Option<RawFrame> {
        match self.state {
            ReadState::WaitHead => {
                if self.prev == TAIL_BYTE && byte == TAIL_BYTE {
                    // stray trailer, drop whatever led up to it
                    self.reset();
                    return None;
                }
                if let Some(h) = HEADERS.iter().find(|h| h.b1 == self.prev && h.b2 == byte) {
                    self.header = Some(*h);
                    self.body.clear();
                    self.state = ReadState::WaitBody;
                }
                self.prev = byte;
                None
            }
            ReadState::WaitBody => {
                if self.prev == TAIL_BYTE && byte == TAIL_BYTE {
                    // early trailer: accept the truncated body and let the
                    // checksum decide
                    let header = self.header.take().expect("header set in WaitBody");
                    let mut body = std::mem::take(&mut self.body);
                    body.pop();
                    self.reset();
                    return Some(RawFrame { header, body });
                }
                self.body.push(byte);
                let body_len = self.header.map(|h| h.body_len).unwrap_or(BODY_LEN);
                if self.body.len() == body_len {
                    self.state = ReadState::WaitTail;
                    self.tail_len = 0;
                }
                self.prev = byte;
                None
            }
            ReadState::WaitTail => {
                self.tail_len += 1;
                if self.prev == TAIL_BYTE && byte == TAIL_BYTE {
                    let header = self.header.take().expect("header set in WaitTail");
                    let body = std::mem::take(&mut self.body);
                    self.reset();
                    return Some(RawFrame { header, body });
                }
                if self.tail_len >= 2 {
                    log::debug!("wrong trailer after {} body, resyncing", hex(&self.body));
                    self.reset();
                }
                self.prev = byte;
                None
            }
        }
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

fn prepend(prefix: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + body.len());
    out.extend_from_slice(prefix);
    out.extend_from_slice(body);
    out
}

/// Validate the checksum, applying the legacy-header recovery transforms
/// when the plain body does not add up. Yields the 17-byte canonical body.
pub fn canonicalize(raw: RawFrame) -> Result<CanonicalFrame, FrameError> {
    let RawFrame { header, mut body } = raw;
    let alternate = header.name != "Main";

    if !checksum_ok(&body) {
        if !alternate {
            return Err(FrameError::Checksum { header: header.name });
        }
        // these prefixes were seen to make legacy frames add up in the wild
        let mut keep_prefix = false;
        let candidate = match header.name {
            "5530" | "D530" => {
                keep_prefix = true;
                prepend(&[0x30], &body)
            }
            "55E2" => prepend(&[0x0c], &body),
            "55EA" => prepend(&[0x0d], &body),
            _ => {
                if body.first() == Some(&0xdc) {
                    keep_prefix = true;
                    prepend(&[0x30], &body)
                } else if body.first() == Some(&0xe2) {
                    prepend(&[0xd5, 0x55], &body)
                } else {
                    // shift-by-two: treat the header pair as body bytes
                    prepend(&[header.b1, header.b2], &body)
                }
            }
        };
        if !checksum_ok(&candidate) {
            return Err(FrameError::Checksum { header: header.name });
        }
        body = if keep_prefix {
            candidate
        } else if header.name == "55E2" || header.name == "55EA" {
            prepend(&[0x55, 0x30], &body)
        } else {
            candidate[1..].to_vec()
        };
        log::debug!("alt header [{}] recovered to [{}]", header.name, hex(&body));
    }

    let len = body.len();
    let body: [u8; BODY_LEN] = body.try_into().map_err(|_| FrameError::Length(len))?;
    Ok(CanonicalFrame { alternate, body })
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut Framer, bytes: &[u8]) -> Vec<RawFrame> {
        bytes.iter().filter_map(|b| framer.push(*b)).collect()
    }

    fn light_ack_frame() -> [u8; FRAME_LEN] {
        // ACK from the wallpad reporting livingroom light state
        let packet = Packet {
            type_and_seq: 0x30dc,
            dst_device: 0x0e,
            dst_room: 0x00,
            src_device: 0x01,
            src_room: 0x00,
            command: 0x00,
            value: [0xff, 0x00, 0xff, 0, 0, 0, 0, 0],
        };
        let mut frame = packet.pack();
        // pack always stamps the send type; rewrite it and fix the checksum
        frame[2] = 0x30;
        frame[3] = 0xdc;
        frame[18] = body_checksum(&frame[2..18]);
        frame
    }

    #[test]
    fn frames_a_canonical_packet() {
        let mut framer = Framer::new();
        let frames = feed(&mut framer, &light_ack_frame());
        assert_eq!(frames.len(), 1);
        let raw = frames.into_iter().next().unwrap();
        assert_eq!(raw.header.name, "Main");
        assert_eq!(raw.body.len(), BODY_LEN);

        let canon = canonicalize(raw).unwrap();
        assert!(!canon.alternate);
        let packet = Packet::unpack(&canon.body);
        assert_eq!(packet.dst_device, 0x0e);
        assert_eq!(packet.value[0], 0xff);
        assert_eq!(classify(packet.type_and_seq).unwrap(), (PacketType::Ack, 0));
    }

    #[test]
    fn resyncs_after_garbage() {
        let mut framer = Framer::new();
        let mut stream = vec![0x00, 0x17, 0xaa, 0x13, 0x0d, 0x0d, 0x42];
        stream.extend_from_slice(&light_ack_frame());
        let frames = feed(&mut framer, &stream);
        assert_eq!(frames.len(), 1);
        assert!(canonicalize(frames.into_iter().next().unwrap()).is_ok());
    }

    #[test]
    fn checksum_law() {
        let mut good = light_ack_frame();
        let mut framer = Framer::new();
        assert!(canonicalize(feed(&mut framer, &good).remove(0)).is_ok());

        good[18] ^= 0x01;
        let mut framer = Framer::new();
        let err = canonicalize(feed(&mut framer, &good).remove(0)).unwrap_err();
        assert_eq!(err, FrameError::Checksum { header: "Main" });
    }

    #[test]
    fn early_trailer_is_checked_not_trusted() {
        // trailer pair inside what claimed to be the body: the truncated
        // chunk surfaces, then fails checksum and gets dropped
        let mut framer = Framer::new();
        let mut stream = vec![0xaa, 0x55, 0x30, 0xdc, 0x0d, 0x0d];
        stream.extend_from_slice(&light_ack_frame());
        let frames = feed(&mut framer, &stream);
        assert_eq!(frames.len(), 2);
        assert!(canonicalize(frames[0].clone()).is_err());
        assert!(canonicalize(frames[1].clone()).is_ok());
    }

    #[test]
    fn d555_header_recovers_by_shifting() {
        // body crafted so that (d5 55) + body passes the checksum; the
        // canonical result is 0x55 + body, classified permissively as ACK
        let mut body = vec![0x30u8, 0x00, 0x0e, 0x00, 0x01, 0x00, 0x00];
        body.extend_from_slice(&[0x00, 0x00, 0xff, 0, 0, 0, 0, 0]);
        let sum = body_checksum(&prepend(&[0xd5, 0x55], &body));
        body.push(sum);
        assert_eq!(body.len(), 16);

        let mut stream = vec![0xd5, 0x55];
        stream.extend_from_slice(&body);
        stream.extend_from_slice(&[0x0d, 0x0d]);

        let mut framer = Framer::new();
        let frames = feed(&mut framer, &stream);
        assert_eq!(frames.len(), 1);
        let canon = canonicalize(frames.into_iter().next().unwrap()).unwrap();
        assert!(canon.alternate);
        let packet = Packet::unpack(&canon.body);
        assert_eq!(classify(packet.type_and_seq).unwrap(), (PacketType::Ack, 0));
        assert_eq!(packet.dst_device, 0x0e);
        assert_eq!(packet.src_device, 0x01);
        assert_eq!(packet.value[2], 0xff);
    }

    #[test]
    fn e2_header_keeps_original_body_with_5530_prefix() {
        // 15-byte body under the 55 e2 header validates with a 0x0c
        // prepended, then goes out as 55 30 + body
        let mut body = vec![0x00u8, 0x0e, 0x00, 0x01, 0x00, 0x00];
        body.extend_from_slice(&[0x11, 0x00, 0x00, 0, 0, 0, 0, 0]);
        let sum = body_checksum(&prepend(&[0x0c], &body));
        body.push(sum);
        assert_eq!(body.len(), 15);

        let mut stream = vec![0x55, 0xe2];
        stream.extend_from_slice(&body);
        stream.extend_from_slice(&[0x0d, 0x0d]);

        let mut framer = Framer::new();
        let frames = feed(&mut framer, &stream);
        let canon = canonicalize(frames.into_iter().next().unwrap()).unwrap();
        assert!(canon.alternate);
        assert_eq!(canon.body[0], 0x55);
        assert_eq!(canon.body[1], 0x30);
        assert_eq!(&canon.body[2..], &body[..]);
    }

    #[test]
    fn unrecoverable_alternate_is_dropped() {
        let mut body = vec![0u8; 15];
        body.push(0x99); // matches no transform
        let raw = RawFrame {
            header: HEADERS[1], // D555
            body,
        };
        assert!(matches!(canonicalize(raw), Err(FrameError::Checksum { .. })));
    }

    #[test]
    fn packed_frame_has_prefix_checksum_and_tail() {
        let frame = build_frame(DeviceKind::Light, 0, DeviceKind::Wallpad, Command::On, [0; 8]).unwrap();
        assert_eq!(&frame[..5], &SEND_PREFIX);
        assert_eq!(frame[5], 0x0e);
        assert_eq!(frame[9], 0x01);
        assert_eq!(frame[18], body_checksum(&frame[2..18]));
        assert_eq!(&frame[19..], &[0x0d, 0x0d]);
    }

    #[test]
    fn classify_rejects_unknown_families() {
        assert!(classify(0x30ac).is_err()); // 0xa0 is neither send nor ack
        assert!(classify(0x1234).is_err());
        assert_eq!(classify(0x30bc).unwrap(), (PacketType::Send, 0));
        assert_eq!(classify(0x30bd).unwrap(), (PacketType::Send, 1));
        assert_eq!(classify(0x55aa).unwrap(), (PacketType::Ack, 0));
    }
}
