// Aircon bus engine. Strict request/response: every exchange opens a short
// TCP session, writes one request, reads one 16-byte status, closes. At most
// one transaction is in flight; scheduled scans skip while the busy flag is
// up. Zero-byte reads count toward the escalation limit, after which the
// engine reports a fatal outcome for the supervisor.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;

use wire::config::{
    BridgeConfig, MAX_READ_ERROR_RETRY, PACKET_RESEND_INTERVAL, RS485_WRITE_INTERVAL,
    WALLPAD_SCAN_INTERVAL,
};
use wire::lgac::{
    decode_response, encode_request, AcFanSpeed, Action, AirconRequest, FanMove, OpMode,
    RESPONSE_LEN,
};

use crate::mqtt::MqttHandle;

const FATAL_HOLD: Duration = Duration::from_secs(5);

/// One room's unit: the controller-desired state a command is built from.
#[derive(Debug, Clone)]
pub struct AirconUnit {
    pub room: String,
    pub power: bool,
    pub opmode: OpMode,
    pub fan_move: FanMove,
    pub fan_speed: AcFanSpeed,
    pub target_temp: i32,
    pub last_scan: Option<Instant>,
}

impl AirconUnit {
    fn new(room: &str) -> Self {
        AirconUnit {
            room: room.to_string(),
            power: false,
            opmode: OpMode::Cool,
            fan_move: FanMove::Fixed,
            fan_speed: AcFanSpeed::Low,
            target_temp: 25,
            last_scan: None,
        }
    }

    fn request(&self) -> AirconRequest {
        AirconRequest {
            action: if self.power { Action::On } else { Action::Off },
            opmode: self.opmode,
            fan_move: self.fan_move,
            fan_speed: self.fan_speed,
            target_temp: self.target_temp,
        }
    }
}

pub type AirconCommand = (u8, String, AirconRequest);

pub struct LgacEngine {
    cfg: Arc<BridgeConfig>,
    mqtt: MqttHandle,
    pub units: Vec<Arc<RwLock<AirconUnit>>>,
    busy: AtomicBool,
    read_errors: AtomicU32,
    tx: mpsc::UnboundedSender<AirconCommand>,
}

impl LgacEngine {
    pub fn new(
        cfg: Arc<BridgeConfig>,
        mqtt: MqttHandle,
        tx: mpsc::UnboundedSender<AirconCommand>,
    ) -> Self {
        let units = if cfg.aircon_server.is_some() {
            cfg.aircon_rooms
                .iter()
                .map(|(_, room)| Arc::new(RwLock::new(AirconUnit::new(room))))
                .collect()
        } else {
            Vec::new()
        };
        LgacEngine {
            cfg,
            mqtt,
            units,
            busy: AtomicBool::new(false),
            read_errors: AtomicU32::new(0),
            tx,
        }
    }

    pub fn rooms(&self) -> Vec<String> {
        self.units
            .iter()
            .map(|u| u.read().expect("aircon lock").room.clone())
            .collect()
    }

    /// Apply one controller command addressed to LGAircon/climate/<room>/...
    pub fn handle_command(&self, parts: &[&str], payload: &str) {
        let room = parts[2];
        let suffix = parts[3];
        let Some(unit_no) = self.cfg.aircon_rooms.index(room) else {
            log::warn!("no aircon for room [{room}]");
            return;
        };
        let Some(unit) = self
            .units
            .iter()
            .find(|u| u.read().expect("aircon lock").room == room)
        else {
            return;
        };

        let request = {
            let mut unit = unit.write().expect("aircon lock");
            match suffix {
                "mode" => {
                    if payload == "off" {
                        unit.power = false;
                    } else {
                        unit.power = true;
                        if let Some(mode) = OpMode::from_payload(payload) {
                            unit.opmode = mode;
                        }
                    }
                }
                "swing_mode" => {
                    unit.fan_move = if payload == "on" {
                        FanMove::Swing
                    } else {
                        FanMove::Fixed
                    };
                }
                "fan_mode" => {
                    unit.fan_speed = AcFanSpeed::from_payload(payload);
                }
                "target_temp" => {
                    let Ok(temp) = payload.parse::<f64>() else {
                        log::warn!("bad aircon target temp [{payload}]");
                        return;
                    };
                    unit.target_temp = temp as i32;
                }
                other => {
                    log::debug!("unhandled aircon command [{other}]");
                    return;
                }
            }
            log::info!(
                "[from HA] aircon/{room}/set = [power={}, mode={}, target_temp={}]",
                unit.power,
                unit.opmode.as_str(),
                unit.target_temp
            );
            unit.request()
        };

        if self.tx.send((unit_no, room.to_string(), request)).is_err() {
            log::error!("aircon command channel closed");
        }
    }

    /// Probe every unit whose status is stale. Called from the scan tick;
    /// skips entirely while a transaction is in flight.
    pub async fn scan(&self, now: Instant) -> Result<()> {
        for unit in &self.units {
            let (unit_no, room) = {
                let mut unit = unit.write().expect("aircon lock");
                let due = match unit.last_scan {
                    Some(tick) => now.duration_since(tick) > WALLPAD_SCAN_INTERVAL,
                    None => true,
                };
                if !due {
                    continue;
                }
                unit.last_scan = Some(now);
                let Some(no) = self.cfg.aircon_rooms.index(&unit.room) else {
                    continue;
                };
                (no, unit.room.clone())
            };
            if self.busy.load(Ordering::Acquire) {
                continue;
            }
            match self.transact(unit_no, &AirconRequest::status_probe()).await? {
                Some(mut status) => {
                    // silent comes back as low on the scan path
                    if status.fan_speed == AcFanSpeed::Silent {
                        status.fan_speed = AcFanSpeed::Low;
                    }
                    self.mqtt.publish_aircon(&room, &status).await;
                }
                None => log::debug!("aircon {room} status probe failed, will rescan"),
            }
            sleep(PACKET_RESEND_INTERVAL).await;
        }
        Ok(())
    }

    /// One exchange. `Ok(None)` is a retriable protocol fault; `Err` means
    /// the engine has given up and the process must go down.
    async fn transact(
        &self,
        unit_no: u8,
        request: &AirconRequest,
    ) -> Result<Option<wire::lgac::AirconStatus>> {
        self.busy.store(true, Ordering::Release);
        let result = self.transact_inner(unit_no, request).await;
        self.busy.store(false, Ordering::Release);
        result
    }

    async fn transact_inner(
        &self,
        unit_no: u8,
        request: &AirconRequest,
    ) -> Result<Option<wire::lgac::AirconStatus>> {
        let Some(server) = self.cfg.aircon_server.as_deref() else {
            return Ok(None);
        };

        let mut stream = match TcpStream::connect((server, self.cfg.aircon_port)).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.give_up(anyhow!("connect to LGAC failed: {e}")).await),
        };

        let frame = encode_request(unit_no, request);
        if let Err(e) = stream.write_all(&frame).await {
            return Err(self.give_up(anyhow!("write to LGAC failed: {e}")).await);
        }
        sleep(RS485_WRITE_INTERVAL).await;

        let mut response = Vec::with_capacity(RESPONSE_LEN);
        loop {
            let mut chunk = [0u8; RESPONSE_LEN];
            let want = RESPONSE_LEN - response.len();
            match stream.read(&mut chunk[..want]).await {
                Ok(0) => break,
                Ok(n) => response.extend_from_slice(&chunk[..n]),
                Err(e) => return Err(self.give_up(anyhow!("read from LGAC failed: {e}")).await),
            }
            if response.len() == RESPONSE_LEN {
                break;
            }
        }

        if response.is_empty() {
            // nothing came back at all
            let errors = self.read_errors.fetch_add(1, Ordering::AcqRel) + 1;
            log::warn!("read from LGAC returned nothing ({errors} in a row)");
            if errors > MAX_READ_ERROR_RETRY {
                self.read_errors.store(0, Ordering::Release);
                return Err(self.give_up(anyhow!("LGAC stopped answering")).await);
            }
            return Ok(None);
        }

        match decode_response(&response, self.cfg.temperature_adjust) {
            Ok(status) => {
                self.read_errors.store(0, Ordering::Release);
                log::debug!("read from LGAC ==> {:?}", status);
                Ok(Some(status))
            }
            Err(e) => {
                // protocol fault: leave the retry counter alone
                log::warn!("bad LGAC response ({e}), will retry");
                Ok(None)
            }
        }
    }

    /// Hold so the supervisor restart is visible as a pause, then surface
    /// the fatal outcome.
    async fn give_up(&self, err: anyhow::Error) -> anyhow::Error {
        log::error!("{err}; shutting down for a supervised reset");
        sleep(FATAL_HOLD).await;
        err
    }
}

/// Drain controller commands. A command arriving while a scan transaction is
/// in flight is dropped; the controller's next state poll reconciles.
pub async fn write_loop(
    engine: Arc<LgacEngine>,
    mut rx: mpsc::UnboundedReceiver<AirconCommand>,
) -> Result<()> {
    while let Some((unit_no, room, request)) = rx.recv().await {
        if engine.busy.load(Ordering::Acquire) {
            log::warn!("aircon busy, dropping command for {room}");
            continue;
        }
        match engine.transact(unit_no, &request).await? {
            Some(status) => engine.mqtt.publish_aircon(&room, &status).await,
            None => log::warn!("aircon command for {room} got no valid response"),
        }
    }
    Err(anyhow!("aircon command channel closed"))
}
