// Wallpad bus engine. A reader task frames and parses everything the bus
// says and forwards device updates to MQTT. A writer task drains the
// two-level priority queue with pacing. Controller commands mutate the
// device records (desired state) and enqueue the matching frames; the
// periodic scan enqueues low-priority checks so observed state is
// eventually reconciled.

use std::collections::BinaryHeap;
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use tokio::sync::Notify;
use tokio::time::sleep;

use wire::config::{
    BridgeConfig, ALTERNATIVE_HEADER_DEBUG, PACKET_RESEND_INTERVAL, WALLPAD_SCAN_INTERVAL,
};
use wire::devices::{
    parse_update, Elevator, Fan, FanSpeed, Gas, SwitchBank, Thermostat,
};
use wire::kocom::{canonicalize, classify, hex, Command, DeviceKind, Framer, Packet, FRAME_LEN};

use crate::comm::PacedConn;
use crate::mqtt::MqttHandle;

pub const PRIORITY_HIGH: u8 = 0;
pub const PRIORITY_LOW: u8 = 9;

/// Fan speed applied when the controller turns the fan on without naming
/// one.
pub const DEFAULT_FAN_SPEED: FanSpeed = FanSpeed::Low;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Light(usize),
    Plug(usize),
    Thermostat(usize),
    Fan,
    Gas,
    Elevator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueEntry {
    pub priority: u8,
    seq: u64,
    pub target: Target,
    pub command: Command,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Two priority classes, FIFO within each; the sequence number makes the
/// insertion order explicit.
pub struct CommandQueue {
    heap: Mutex<BinaryHeap<Reverse<QueueEntry>>>,
    seq: AtomicU64,
    notify: Notify,
}

impl CommandQueue {
    pub fn new() -> Self {
        CommandQueue {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, priority: u8, target: Target, command: Command) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.heap
            .lock()
            .expect("command queue lock")
            .push(Reverse(QueueEntry {
                priority,
                seq,
                target,
                command,
            }));
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> QueueEntry {
        loop {
            if let Some(Reverse(entry)) = self.heap.lock().expect("command queue lock").pop() {
                return entry;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().expect("command queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// All device records behind the wallpad plus the outbound queue. Records
/// hold controller-desired state; observed state flows from the bus straight
/// to MQTT.
pub struct Wallpad {
    pub lights: Vec<Arc<RwLock<SwitchBank>>>,
    pub plugs: Vec<Arc<RwLock<SwitchBank>>>,
    pub thermostats: Vec<Arc<RwLock<Thermostat>>>,
    pub fan: Option<Arc<RwLock<Fan>>>,
    pub gas: Option<Arc<RwLock<Gas>>>,
    pub elevator: Option<Arc<RwLock<Elevator>>>,
    pub queue: CommandQueue,
}

impl Wallpad {
    pub fn from_config(cfg: &BridgeConfig) -> Self {
        let mut lights = Vec::new();
        if cfg.enables.light {
            for (room, count) in &cfg.light_sizes {
                lights.push(Arc::new(RwLock::new(SwitchBank::new(
                    DeviceKind::Light,
                    room,
                    *count,
                    false,
                ))));
            }
        }
        let mut plugs = Vec::new();
        if cfg.enables.plug {
            for (room, count) in &cfg.plug_sizes {
                // plugs start on, matching how the wallpad leaves them
                plugs.push(Arc::new(RwLock::new(SwitchBank::new(
                    DeviceKind::Plug,
                    room,
                    *count,
                    true,
                ))));
            }
        }
        let mut thermostats = Vec::new();
        if cfg.enables.thermostat {
            for (_, room) in cfg.thermostat_rooms.iter() {
                thermostats.push(Arc::new(RwLock::new(Thermostat::new(room))));
            }
        }
        Wallpad {
            lights,
            plugs,
            thermostats,
            fan: cfg.enables.fan.then(|| Arc::new(RwLock::new(Fan::new()))),
            gas: cfg.enables.gas.then(|| Arc::new(RwLock::new(Gas::new()))),
            elevator: cfg
                .enables
                .elevator
                .then(|| Arc::new(RwLock::new(Elevator::new()))),
            queue: CommandQueue::new(),
        }
    }

    pub fn gas_on(&self) -> bool {
        self.gas
            .as_ref()
            .map(|g| g.read().expect("gas lock").on)
            .unwrap_or(true)
    }

    fn light_index(&self, room: &str) -> Option<usize> {
        self.lights
            .iter()
            .position(|b| b.read().expect("light lock").room == room)
    }

    fn plug_index(&self, room: &str) -> Option<usize> {
        self.plugs
            .iter()
            .position(|b| b.read().expect("plug lock").room == room)
    }

    /// Apply one controller command. `parts` is the full topic split on '/',
    /// e.g. ["homeassistant", "light", "livingroom_light2", "set"].
    pub fn handle_command(&self, parts: &[&str], payload: &str) {
        let kind = parts[1];
        let suffix = parts[3];
        match kind {
            "light" | "switch" => {
                let Some((room, sub_device)) = parts[2].split_once('_') else {
                    log::warn!("cannot split room/device from [{}]", parts[2]);
                    return;
                };
                self.handle_switch_command(room, sub_device, payload);
                log::info!("[from HA] {kind}/{room}/{sub_device}/{suffix} = {payload}");
            }
            "climate" => {
                self.handle_thermostat_command(parts[2], suffix, payload);
            }
            "fan" => {
                self.handle_fan_command(suffix, payload);
            }
            other => log::debug!("unhandled command kind [{other}]"),
        }
    }

    fn handle_switch_command(&self, room: &str, sub_device: &str, payload: &str) {
        let on = payload == "on";
        if sub_device.contains("light") {
            let Some(i) = self.light_index(room) else {
                log::warn!("no light bank for room [{room}]");
                return;
            };
            self.lights[i]
                .write()
                .expect("light lock")
                .set_named(sub_device, on);
            let cmd = if on { Command::On } else { Command::Off };
            self.queue.push(PRIORITY_HIGH, Target::Light(i), cmd);
            self.queue.push(PRIORITY_HIGH, Target::Light(i), Command::Check);
        } else if sub_device.contains("plug") {
            let Some(i) = self.plug_index(room) else {
                log::warn!("no plug bank for room [{room}]");
                return;
            };
            self.plugs[i]
                .write()
                .expect("plug lock")
                .set_named(sub_device, on);
            let cmd = if on { Command::On } else { Command::Off };
            self.queue.push(PRIORITY_HIGH, Target::Plug(i), cmd);
            self.queue.push(PRIORITY_HIGH, Target::Plug(i), Command::Check);
        } else if sub_device.contains("elevator") {
            let Some(elevator) = &self.elevator else { return };
            elevator.write().expect("elevator lock").called = on;
            if on {
                self.queue.push(PRIORITY_HIGH, Target::Elevator, Command::Status);
            }
        } else if sub_device.contains("gas") {
            let Some(gas) = &self.gas else { return };
            if on {
                log::warn!("[from HA] gas valve cannot be driven back on");
            }
            gas.write().expect("gas lock").on = false;
            self.queue.push(PRIORITY_HIGH, Target::Gas, Command::Status);
        } else {
            log::warn!("no device matches sub device [{sub_device}]");
        }
    }

    fn handle_thermostat_command(&self, room: &str, suffix: &str, payload: &str) {
        let Some(i) = self
            .thermostats
            .iter()
            .position(|t| t.read().expect("thermostat lock").room == room)
        else {
            log::warn!("no thermostat for room [{room}]");
            return;
        };
        {
            let mut thermostat = self.thermostats[i].write().expect("thermostat lock");
            if suffix == "mode" {
                match wire::devices::HeatMode::from_payload(payload) {
                    Some(mode) => thermostat.mode = mode,
                    None => {
                        log::warn!("unknown thermostat mode [{payload}]");
                        return;
                    }
                }
            } else {
                // a bare setpoint implies heating
                let Ok(temp) = payload.parse::<f64>() else {
                    log::warn!("bad target temp [{payload}]");
                    return;
                };
                thermostat.target_temp = (temp as i32).clamp(5, 40);
                thermostat.mode = wire::devices::HeatMode::Heat;
            }
            log::info!(
                "[from HA] thermostat/{room}/set: [mode={}, target_temp={}]",
                thermostat.mode.as_str(),
                thermostat.target_temp
            );
        }
        self.queue
            .push(PRIORITY_HIGH, Target::Thermostat(i), Command::Status);
    }

    fn handle_fan_command(&self, suffix: &str, payload: &str) {
        let Some(fan) = &self.fan else { return };
        {
            let mut fan = fan.write().expect("fan lock");
            match suffix {
                "fan_mode" => {
                    fan.on = payload == "on";
                    fan.speed = DEFAULT_FAN_SPEED;
                }
                "fan_speed" => {
                    fan.speed = if payload == "on" {
                        DEFAULT_FAN_SPEED
                    } else {
                        FanSpeed::Off
                    };
                    fan.on = true;
                }
                other => {
                    log::debug!("unhandled fan command [{other}]");
                    return;
                }
            }
            log::info!(
                "[from HA] fan/set = [mode={}, fan_mode={}]",
                if fan.on { "on" } else { "off" },
                fan.speed.as_str()
            );
        }
        self.queue.push(PRIORITY_HIGH, Target::Fan, Command::Status);
    }

    /// Enqueue a low-priority check for every device whose last scan is
    /// stale. The elevator is stateless and excluded.
    pub fn scan(&self, now: Instant) {
        for (i, bank) in self.lights.iter().enumerate() {
            let mut bank = bank.write().expect("light lock");
            if stale(&mut bank.last_scan, now) {
                self.queue.push(PRIORITY_LOW, Target::Light(i), Command::Check);
            }
        }
        for (i, bank) in self.plugs.iter().enumerate() {
            let mut bank = bank.write().expect("plug lock");
            if stale(&mut bank.last_scan, now) {
                self.queue.push(PRIORITY_LOW, Target::Plug(i), Command::Check);
            }
        }
        for (i, thermostat) in self.thermostats.iter().enumerate() {
            let mut thermostat = thermostat.write().expect("thermostat lock");
            if stale(&mut thermostat.last_scan, now) {
                self.queue
                    .push(PRIORITY_LOW, Target::Thermostat(i), Command::Check);
            }
        }
        if let Some(fan) = &self.fan {
            let mut fan = fan.write().expect("fan lock");
            if stale(&mut fan.last_scan, now) {
                self.queue.push(PRIORITY_LOW, Target::Fan, Command::Check);
            }
        }
        if let Some(gas) = &self.gas {
            let mut gas = gas.write().expect("gas lock");
            if stale(&mut gas.last_scan, now) {
                self.queue.push(PRIORITY_LOW, Target::Gas, Command::Check);
            }
        }
    }

    pub fn frame_for(&self, entry: &QueueEntry, cfg: &BridgeConfig) -> Option<[u8; FRAME_LEN]> {
        match entry.target {
            Target::Light(i) => self.lights.get(i)?.read().expect("light lock").command_frame(entry.command, cfg),
            Target::Plug(i) => self.plugs.get(i)?.read().expect("plug lock").command_frame(entry.command, cfg),
            Target::Thermostat(i) => self
                .thermostats
                .get(i)?
                .read()
                .expect("thermostat lock")
                .command_frame(entry.command, cfg),
            Target::Fan => self.fan.as_ref()?.read().expect("fan lock").command_frame(entry.command),
            Target::Gas => self.gas.as_ref()?.read().expect("gas lock").command_frame(entry.command),
            Target::Elevator => self
                .elevator
                .as_ref()?
                .read()
                .expect("elevator lock")
                .command_frame(entry.command),
        }
    }
}

fn stale(last_scan: &mut Option<Instant>, now: Instant) -> bool {
    let due = match last_scan {
        Some(tick) => now.duration_since(*tick) > WALLPAD_SCAN_INTERVAL,
        None => true,
    };
    if due {
        *last_scan = Some(now);
    }
    due
}

// ---------------------------------------------------------------------------
// tasks

pub async fn read_loop(
    wallpad: Arc<Wallpad>,
    comm: Arc<PacedConn>,
    cfg: Arc<BridgeConfig>,
    mqtt: MqttHandle,
) -> anyhow::Result<()> {
    let mut framer = Framer::new();
    loop {
        let byte = match comm.read_byte().await {
            Ok(byte) => byte,
            Err(e) => match e.kind() {
                std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::NotConnected => {
                    log::warn!("kocom socket error ({e}), reconnecting");
                    comm.reconnect().await;
                    framer.reset();
                    continue;
                }
                _ => {
                    log::warn!("kocom read error: {e}");
                    continue;
                }
            },
        };

        let Some(raw) = framer.push(byte) else { continue };
        let canon = match canonicalize(raw) {
            Ok(canon) => canon,
            Err(e) => {
                log::debug!("dropped frame: {e}");
                continue;
            }
        };
        handle_frame(&canon.body, canon.alternate, &wallpad, &cfg, &mqtt).await;
    }
}

async fn handle_frame(
    body: &[u8; wire::kocom::BODY_LEN],
    alternate: bool,
    wallpad: &Wallpad,
    cfg: &BridgeConfig,
    mqtt: &MqttHandle,
) {
    let packet = Packet::unpack(body);
    let ptype = match classify(packet.type_and_seq) {
        Ok((ptype, _seq)) => ptype,
        Err(e) => {
            log::warn!("{e}");
            return;
        }
    };
    let update = match parse_update(&packet, ptype, cfg, wallpad.gas_on()) {
        Ok(Some(update)) => update,
        Ok(None) => return,
        Err(e) => {
            log::debug!("dropped packet [{}]: {e}", hex(body));
            return;
        }
    };

    if alternate {
        // legacy-header frames are observed, never acted on
        if ALTERNATIVE_HEADER_DEBUG {
            log::warn!(
                "alt header frame: {}/{} = {}",
                update.kind.name(),
                update.room,
                update.state
            );
        }
        return;
    }

    let is_fan = update.kind == DeviceKind::Fan;
    mqtt.publish_update(&update).await;

    if is_fan {
        // every fan report doubles as a CO2 sample
        let sensor = wire::devices::ParsedUpdate {
            kind: DeviceKind::FanSensor,
            room: wire::devices::ROOM_WALLPAD.to_string(),
            state: wire::devices::decode_fan_sensor(&packet.value),
        };
        if cfg.partial_debug {
            log::warn!("fan value [{}] co2 {}", hex(&packet.value), sensor.state);
        }
        mqtt.publish_update(&sensor).await;
    }
}

pub async fn write_loop(
    wallpad: Arc<Wallpad>,
    comm: Arc<PacedConn>,
    cfg: Arc<BridgeConfig>,
) -> anyhow::Result<()> {
    loop {
        let entry = wallpad.queue.pop().await;
        match wallpad.frame_for(&entry, &cfg) {
            Some(frame) => match comm.write_paced(&frame).await {
                Ok(()) => log::debug!(
                    "sent {:?} {:?} [{}]",
                    entry.target,
                    entry.command,
                    hex(&frame)
                ),
                Err(e) => log::error!("write to kocom failed: {e}"),
            },
            None => log::warn!("could not build a frame for {:?}", entry.target),
        }
        sleep(PACKET_RESEND_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallpad() -> Wallpad {
        Wallpad::from_config(&BridgeConfig::default())
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_insertion() {
        let queue = CommandQueue::new();
        queue.push(PRIORITY_LOW, Target::Fan, Command::Check);
        queue.push(PRIORITY_HIGH, Target::Gas, Command::Status);
        queue.push(PRIORITY_HIGH, Target::Elevator, Command::Status);
        queue.push(PRIORITY_LOW, Target::Light(0), Command::Check);

        assert_eq!(queue.pop().await.target, Target::Gas);
        assert_eq!(queue.pop().await.target, Target::Elevator);
        assert_eq!(queue.pop().await.target, Target::Fan);
        assert_eq!(queue.pop().await.target, Target::Light(0));
    }

    #[test]
    fn scan_is_idempotent_within_a_tick() {
        let wallpad = wallpad();
        let now = Instant::now();
        wallpad.scan(now);
        let first = wallpad.queue.len();
        // 1 light bank + 6 plug banks + 5 thermostats + fan + gas
        assert_eq!(first, 14);
        wallpad.scan(now);
        assert_eq!(wallpad.queue.len(), first);
    }

    #[tokio::test]
    async fn light_command_queues_set_then_check() {
        let wallpad = wallpad();
        wallpad.handle_command(&["homeassistant", "light", "livingroom_light2", "set"], "on");

        let set = wallpad.queue.pop().await;
        assert_eq!(set.command, Command::On);
        assert_eq!(set.target, Target::Light(0));
        let check = wallpad.queue.pop().await;
        assert_eq!(check.command, Command::Check);
        assert_eq!(check.target, Target::Light(0));

        let frame = wallpad.frame_for(&set, &BridgeConfig::default()).unwrap();
        assert_eq!(frame[5], 0x0e);
        assert_eq!(frame[9], 0x01);
        assert_eq!(&frame[10..18], &[0x00, 0xff, 0x00, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn gas_on_command_is_converted_to_off() {
        let wallpad = wallpad();
        wallpad.handle_command(&["homeassistant", "switch", "wallpad_gas", "set"], "on");
        assert!(!wallpad.gas_on());

        let entry = wallpad.queue.pop().await;
        let frame = wallpad.frame_for(&entry, &BridgeConfig::default()).unwrap();
        assert_eq!(frame[9], 0x02); // off on the wire, never on
        assert!(wallpad.queue.is_empty());
    }

    #[tokio::test]
    async fn fan_speed_off_turns_everything_off() {
        let wallpad = wallpad();
        wallpad.handle_command(&["homeassistant", "fan", "wallpad", "fan_speed"], "off");
        let entry = wallpad.queue.pop().await;
        let frame = wallpad.frame_for(&entry, &BridgeConfig::default()).unwrap();
        assert_eq!(frame[12], 0x00); // speed nibble cleared
    }

    #[test]
    fn elevator_is_never_scanned() {
        let wallpad = wallpad();
        wallpad.scan(Instant::now());
        let mut heap = wallpad.queue.heap.lock().unwrap();
        assert!(heap.drain().all(|Reverse(e)| e.target != Target::Elevator));
    }
}
