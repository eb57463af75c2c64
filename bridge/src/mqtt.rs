// MQTT adapter. Announces every enabled entity through Home Assistant's
// discovery convention, subscribes to the command topics those documents
// advertise, routes inbound commands to the right bus engine and publishes
// the state documents the engines produce.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use enum_iterator::all;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use wire::config::{
    AIRCON_SERVICE_NAME, CONTROL_BRIDGE, CONTROL_PREFIX, HA_PREFIX, SERVICE_NAME,
};
use wire::devices::{ParsedUpdate, ROOM_WALLPAD};
use wire::kocom::DeviceKind;
use wire::lgac::AirconStatus;

use crate::kocom_loop::Wallpad;
use crate::lgac_loop::LgacEngine;

fn sw_version() -> String {
    format!("RS485 Bridge for Home Assistant. v{}", env!("CARGO_PKG_VERSION"))
}

pub fn level_filter(level: &str) -> log::LevelFilter {
    match level {
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        _ => log::LevelFilter::Info,
    }
}

/// Requests raised by the broker side and served from the scan tick, where
/// publishing cannot deadlock the event loop.
#[derive(Default)]
pub struct ControlFlags {
    pub discovery: AtomicBool,
    pub subscribe: AtomicBool,
    pub remove: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    Reconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttExit {
    InitialConnectFailure,
    ConnectionLost,
}

// ---------------------------------------------------------------------------
// discovery documents

#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryDoc {
    pub topic: String,
    pub payload: Value,
    pub command_topics: Vec<String>,
}

fn kocom_device_block(room: &str, device: &str) -> Value {
    json!({
        "name": format!("Kocom {room} {device}"),
        "ids": format!("kocom_{room}_{device}"),
        "mf": "KOCOM",
        "mdl": "Wallpad",
        "sw": sw_version(),
    })
}

/// One light or plug entry, including the `<kind>0` aggregate.
fn switch_entity_doc(component: &str, room: &str, entry: &str, icon: &str) -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/{component}/{room}");
    let uniq = format!("{SERVICE_NAME}_{room}_{entry}");
    let command_topic = format!("{common}_{entry}/set");
    let mut payload = json!({
        "name": &uniq,
        "uniq_id": &uniq,
        "device": kocom_device_block(room, entry),
        "stat_t": format!("{common}/state"),
        "stat_val_tpl": format!("{{{{ value_json.{entry} }}}}"),
        "cmd_t": &command_topic,
        "pl_on": "on",
        "pl_off": "off",
    });
    if !icon.is_empty() {
        payload["ic"] = icon.into();
    }
    DiscoveryDoc {
        topic: format!("{common}_{entry}/config"),
        payload,
        command_topics: vec![command_topic],
    }
}

fn elevator_doc() -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/switch/{ROOM_WALLPAD}");
    let uniq = format!("{SERVICE_NAME}_{ROOM_WALLPAD}_elevator");
    let command_topic = format!("{common}_elevator/set");
    DiscoveryDoc {
        topic: format!("{common}_elevator/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": kocom_device_block(ROOM_WALLPAD, "elevator"),
            "ic": "mdi:elevator",
            "stat_t": format!("{common}/state"),
            "val_tpl": "{{ value_json.elevator }}",
            "cmd_t": &command_topic,
            "pl_on": "on",
            "pl_off": "off",
        }),
        command_topics: vec![command_topic],
    }
}

fn gas_switch_doc() -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/switch/{ROOM_WALLPAD}");
    let uniq = format!("{SERVICE_NAME}_{ROOM_WALLPAD}_gas");
    let command_topic = format!("{common}_gas/set");
    DiscoveryDoc {
        topic: format!("{common}_gas/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": kocom_device_block(ROOM_WALLPAD, "gas"),
            "ic": "mdi:gas-cylinder",
            "stat_t": format!("{common}_gas/state"),
            "val_tpl": "{{ value_json.gas }}",
            "cmd_t": &command_topic,
            "pl_on": "on",
            "pl_off": "off",
        }),
        command_topics: vec![command_topic],
    }
}

fn gas_sensor_doc() -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/sensor/{ROOM_WALLPAD}");
    let uniq = format!("{SERVICE_NAME}_{ROOM_WALLPAD}_gas_sensor");
    DiscoveryDoc {
        topic: format!("{common}_gas/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": kocom_device_block(ROOM_WALLPAD, "gas"),
            "ic": "mdi:gas-cylinder",
            "stat_t": format!("{common}_gas/state"),
            "val_tpl": "{{ value_json.gas }}",
        }),
        command_topics: Vec::new(),
    }
}

fn fan_doc() -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/fan/{ROOM_WALLPAD}");
    let uniq = format!("{SERVICE_NAME}_{ROOM_WALLPAD}_fan");
    let mode_topic = format!("{common}/fan_mode");
    let speed_topic = format!("{common}/fan_speed");
    DiscoveryDoc {
        topic: format!("{common}_fan/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": kocom_device_block(ROOM_WALLPAD, "fan"),
            "ic": "mdi:fan",
            "stat_t": format!("{common}/state"),
            "state_value_template": "{{ value_json.fan_mode }}",
            "cmd_t": &mode_topic,
            "command_template": "{{ value_json.fan_mode }}",
            "speed_range_min": 1,
            "speed_range_max": 4,
            "percentage_state_topic": &mode_topic,
            "percentage_value_template": "{{ value_json.fan_speed }}",
            "percentage_command_topic": &speed_topic,
            "percentage_command_template": "{ 'fan_speed': {{ value }} }",
        }),
        command_topics: vec![mode_topic, speed_topic],
    }
}

fn fan_sensor_doc() -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/sensor/{ROOM_WALLPAD}");
    let uniq = format!("{SERVICE_NAME}_{ROOM_WALLPAD}_fansensor");
    DiscoveryDoc {
        topic: format!("{common}_fansensor/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": kocom_device_block(ROOM_WALLPAD, "fansensor"),
            "ic": "mdi:fan",
            "stat_t": format!("{common}_fansensor/state"),
            "unit_of_measurement": "ppm",
            "val_tpl": "{{ value_json.co2 }}",
        }),
        command_topics: Vec::new(),
    }
}

fn thermostat_doc(room: &str) -> DiscoveryDoc {
    let common = format!("{HA_PREFIX}/climate/{room}");
    let uniq = format!("{SERVICE_NAME}_{room}_thermostat");
    let state_topic = format!("{common}/state");
    let mode_topic = format!("{common}/mode");
    let temp_topic = format!("{common}/target_temp");
    DiscoveryDoc {
        topic: format!("{common}_thermostat/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": kocom_device_block(room, "thermostat"),
            "mode_cmd_t": &mode_topic,
            "mode_stat_t": &state_topic,
            "mode_stat_tpl": "{{ value_json.mode }}",
            "temp_cmd_t": &temp_topic,
            "temp_stat_t": &state_topic,
            "temp_stat_tpl": "{{ value_json.target_temp }}",
            "curr_temp_t": &state_topic,
            "curr_temp_tpl": "{{ value_json.current_temp }}",
            "min_temp": 5,
            "max_temp": 40,
            "temp_step": 1,
            "modes": ["off", "heat", "fan_only"],
        }),
        command_topics: vec![mode_topic, temp_topic],
    }
}

fn aircon_doc(room: &str) -> DiscoveryDoc {
    // the discovery document lives under the homeassistant prefix, the
    // working topics under the aircon's own
    let config_common = format!("{HA_PREFIX}/climate/{room}");
    let common = format!("{AIRCON_SERVICE_NAME}/climate/{room}");
    let uniq = format!("{AIRCON_SERVICE_NAME}_{room}_aircon");
    let state_topic = format!("{common}/state");
    let mode_topic = format!("{common}/mode");
    let temp_topic = format!("{common}/target_temp");
    let fan_topic = format!("{common}/fan_mode");
    let swing_topic = format!("{common}/swing_mode");
    DiscoveryDoc {
        topic: format!("{config_common}_aircon/config"),
        payload: json!({
            "name": &uniq,
            "uniq_id": &uniq,
            "device": {
                "name": format!("{AIRCON_SERVICE_NAME} {room} aircon"),
                "ids": &uniq,
                "mf": "LG",
                "mdl": "System Aircon",
                "sw": sw_version(),
            },
            "mode_cmd_t": &mode_topic,
            "mode_stat_t": &state_topic,
            "mode_stat_tpl": "{{ value_json.mode }}",
            "modes": ["off", "cool", "dry", "fan_only"],
            "temp_cmd_t": &temp_topic,
            "temp_stat_t": &state_topic,
            "temp_stat_tpl": "{{ value_json.target_temp }}",
            "curr_temp_t": &state_topic,
            "curr_temp_tpl": "{{ value_json.current_temp }}",
            "min_temp": 18,
            "max_temp": 33,
            "temp_step": 1,
            "fan_mode_cmd_t": &fan_topic,
            "fan_mode_stat_t": &state_topic,
            "fan_mode_stat_tpl": "{{ value_json.fan_mode }}",
            "fan_modes": ["low", "medium", "high", "off"],
            "swing_mode_cmd_t": &swing_topic,
            "swing_mode_stat_t": &state_topic,
            "swing_mode_stat_tpl": "{{ value_json.swing_mode }}",
            "swing_modes": ["on", "off"],
        }),
        command_topics: vec![mode_topic, temp_topic, fan_topic, swing_topic],
    }
}

pub fn discovery_docs(wallpad: &Wallpad, aircon_rooms: &[String]) -> Vec<DiscoveryDoc> {
    let mut docs = Vec::new();
    for kind in all::<DeviceKind>() {
        match kind {
            DeviceKind::Light => {
                for bank in &wallpad.lights {
                    let bank = bank.read().expect("light lock");
                    for n in 0..=bank.switches.len() {
                        docs.push(switch_entity_doc("light", &bank.room, &format!("light{n}"), ""));
                    }
                }
            }
            DeviceKind::Plug => {
                for bank in &wallpad.plugs {
                    let bank = bank.read().expect("plug lock");
                    for n in 0..=bank.switches.len() {
                        docs.push(switch_entity_doc(
                            "switch",
                            &bank.room,
                            &format!("plug{n}"),
                            "mdi:power-socket-eu",
                        ));
                    }
                }
            }
            DeviceKind::Thermostat => {
                for thermostat in &wallpad.thermostats {
                    docs.push(thermostat_doc(&thermostat.read().expect("thermostat lock").room));
                }
            }
            DeviceKind::Fan => {
                if wallpad.fan.is_some() {
                    docs.push(fan_doc());
                    docs.push(fan_sensor_doc());
                }
            }
            DeviceKind::Gas => {
                if wallpad.gas.is_some() {
                    docs.push(gas_switch_doc());
                    docs.push(gas_sensor_doc());
                }
            }
            DeviceKind::Elevator => {
                if wallpad.elevator.is_some() {
                    docs.push(elevator_doc());
                }
            }
            DeviceKind::Aircon => {
                for room in aircon_rooms {
                    docs.push(aircon_doc(room));
                }
            }
            DeviceKind::Wallpad | DeviceKind::FanSensor => {}
        }
    }
    docs
}

// ---------------------------------------------------------------------------
// handle

#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
}

impl MqttHandle {
    pub fn new(client: AsyncClient) -> Self {
        MqttHandle { client }
    }

    async fn publish(&self, topic: &str, payload: String) {
        log::debug!("[to HA] {topic} = {payload}");
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
        {
            log::error!("publish to [{topic}] failed: {e}");
        }
    }

    pub async fn publish_update(&self, update: &ParsedUpdate) {
        let payload = update.state.to_string();
        match update.kind {
            DeviceKind::Gas => {
                // the gas state feeds both its sensor and its switch entity
                let sensor = format!("{HA_PREFIX}/sensor/{ROOM_WALLPAD}_gas/state");
                let switch = format!("{HA_PREFIX}/switch/{ROOM_WALLPAD}_gas/state");
                self.publish(&sensor, payload.clone()).await;
                self.publish(&switch, payload).await;
            }
            DeviceKind::FanSensor => {
                let topic = format!("{HA_PREFIX}/sensor/{ROOM_WALLPAD}_fansensor/state");
                self.publish(&topic, payload).await;
            }
            DeviceKind::Aircon => {
                let topic = format!("{AIRCON_SERVICE_NAME}/climate/{}/state", update.room);
                self.publish(&topic, payload).await;
            }
            DeviceKind::Wallpad => log::debug!("no controller entity for the wallpad itself"),
            kind => {
                let component = match kind {
                    DeviceKind::Light => "light",
                    DeviceKind::Plug | DeviceKind::Elevator => "switch",
                    DeviceKind::Thermostat => "climate",
                    DeviceKind::Fan => "fan",
                    _ => unreachable!(),
                };
                let topic = format!("{HA_PREFIX}/{component}/{}/state", update.room);
                self.publish(&topic, payload).await;
            }
        }
    }

    pub async fn publish_aircon(&self, room: &str, status: &AirconStatus) {
        let topic = format!("{AIRCON_SERVICE_NAME}/climate/{room}/state");
        self.publish(&topic, wire::lgac::status_json(status).to_string()).await;
    }

    /// Publish every entity's discovery document; with `remove` the payloads
    /// are empty, retracting the entities. Subscriptions happen only on the
    /// first run after a connect.
    pub async fn publish_discovery(
        &self,
        wallpad: &Wallpad,
        aircon_rooms: &[String],
        initial: bool,
        remove: bool,
    ) -> Result<(), rumqttc::ClientError> {
        log::info!(
            "** starting device discovery{}",
            if remove { " (remove)" } else { "" }
        );
        let docs = discovery_docs(wallpad, aircon_rooms);
        if initial {
            self.client
                .subscribe(format!("{CONTROL_PREFIX}/{CONTROL_BRIDGE}/#"), QoS::AtMostOnce)
                .await?;
            for doc in &docs {
                for topic in &doc.command_topics {
                    self.client.subscribe(topic.as_str(), QoS::AtMostOnce).await?;
                }
            }
        }
        for doc in docs {
            let body = if remove { String::new() } else { doc.payload.to_string() };
            self.client
                .publish(doc.topic, QoS::AtMostOnce, false, body)
                .await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// inbound routing

fn handle_control(
    action: &str,
    payload: &str,
    flags: &ControlFlags,
    control_tx: &mpsc::UnboundedSender<ControlEvent>,
) {
    use std::sync::atomic::Ordering::SeqCst;
    match action {
        "log_level" => match payload {
            "info" | "debug" | "warn" => {
                log::set_max_level(level_filter(payload));
                log::info!("[from HA] log level set to {payload}");
            }
            other => log::warn!("[from HA] unknown log level [{other}]"),
        },
        "restart" => {
            flags.discovery.store(true, SeqCst);
            log::info!("[from HA] discovery re-publish requested");
        }
        "remove" => {
            flags.remove.store(true, SeqCst);
            log::info!("[from HA] entity removal requested");
        }
        "reconnect" => {
            log::info!("[from HA] gateway reconnect requested");
            let _ = control_tx.send(ControlEvent::Reconnect);
        }
        "check_alive" => log::info!("[from HA] bridge is alive"),
        other => log::debug!("unknown control message [{other}]"),
    }
}

pub fn route_message(
    topic: &str,
    payload: &str,
    wallpad: &Wallpad,
    lgac: &LgacEngine,
    flags: &ControlFlags,
    control_tx: &mpsc::UnboundedSender<ControlEvent>,
) {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() != 4 {
        log::warn!("cannot route topic [{topic}]");
        return;
    }
    if parts[0] == CONTROL_PREFIX && parts[1] == CONTROL_BRIDGE && parts[2] == "config" {
        handle_control(parts[3], payload, flags, control_tx);
        return;
    }
    if parts.contains(&"config") {
        // somebody else's discovery document
        return;
    }
    log::debug!("[from HA] {topic} = {payload}");
    if parts[0] == AIRCON_SERVICE_NAME {
        lgac.handle_command(&parts, payload);
    } else {
        wallpad.handle_command(&parts, payload);
    }
}

pub async fn event_loop(
    mut eventloop: EventLoop,
    wallpad: Arc<Wallpad>,
    lgac: Arc<LgacEngine>,
    flags: Arc<ControlFlags>,
    control_tx: mpsc::UnboundedSender<ControlEvent>,
) -> MqttExit {
    use std::sync::atomic::Ordering::SeqCst;
    let mut connected = false;
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                log::info!("[MQTT] connected OK");
                connected = true;
                flags.subscribe.store(true, SeqCst);
                flags.discovery.store(true, SeqCst);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = String::from_utf8_lossy(&publish.payload).to_string();
                route_message(
                    &publish.topic,
                    payload.trim(),
                    &wallpad,
                    &lgac,
                    &flags,
                    &control_tx,
                );
            }
            Ok(_) => {}
            Err(e) => {
                log::error!("[MQTT] connection error: {e}");
                return if connected {
                    MqttExit::ConnectionLost
                } else {
                    MqttExit::InitialConnectFailure
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::MqttOptions;
    use std::sync::atomic::Ordering::SeqCst;
    use wire::config::BridgeConfig;

    fn test_lgac() -> (Arc<Wallpad>, Arc<LgacEngine>, mpsc::UnboundedReceiver<crate::lgac_loop::AirconCommand>) {
        let mut cfg = BridgeConfig::default();
        cfg.aircon_server = Some("127.0.0.1".to_string());
        let cfg = Arc::new(cfg);
        let wallpad = Arc::new(Wallpad::from_config(&cfg));
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 16);
        let (tx, rx) = mpsc::unbounded_channel();
        let lgac = Arc::new(LgacEngine::new(cfg, MqttHandle::new(client), tx));
        (wallpad, lgac, rx)
    }

    #[test]
    fn light_entity_document() {
        let doc = switch_entity_doc("light", "livingroom", "light2", "");
        assert_eq!(doc.topic, "homeassistant/light/livingroom_light2/config");
        assert_eq!(doc.payload["uniq_id"], "kocom_livingroom_light2");
        assert_eq!(doc.payload["stat_t"], "homeassistant/light/livingroom/state");
        assert_eq!(doc.payload["stat_val_tpl"], "{{ value_json.light2 }}");
        assert_eq!(
            doc.command_topics,
            vec!["homeassistant/light/livingroom_light2/set".to_string()]
        );
    }

    #[test]
    fn thermostat_document_advertises_modes_and_range() {
        let doc = thermostat_doc("bedroom");
        assert_eq!(doc.topic, "homeassistant/climate/bedroom_thermostat/config");
        assert_eq!(doc.payload["modes"], json!(["off", "heat", "fan_only"]));
        assert_eq!(doc.payload["min_temp"], 5);
        assert_eq!(doc.payload["max_temp"], 40);
        assert_eq!(
            doc.command_topics,
            vec![
                "homeassistant/climate/bedroom/mode".to_string(),
                "homeassistant/climate/bedroom/target_temp".to_string(),
            ]
        );
    }

    #[test]
    fn aircon_document_uses_its_own_prefix_for_commands() {
        let doc = aircon_doc("kitchen");
        assert_eq!(doc.topic, "homeassistant/climate/kitchen_aircon/config");
        assert_eq!(doc.payload["mode_cmd_t"], "LGAircon/climate/kitchen/mode");
        assert_eq!(doc.payload["modes"], json!(["off", "cool", "dry", "fan_only"]));
        assert_eq!(doc.command_topics.len(), 4);
    }

    #[test]
    fn default_config_discovers_every_entity() {
        let (wallpad, lgac, _rx) = test_lgac();
        let docs = discovery_docs(&wallpad, &lgac.rooms());
        // lights 4 (light0..3) + plugs 6*3 + thermostats 5 + fan 2 + gas 2
        // + elevator 1 + aircons 6
        assert_eq!(docs.len(), 4 + 18 + 5 + 2 + 1 + 2 + 6);
        // every advertised command topic is 4 segments, routable
        for doc in &docs {
            for topic in &doc.command_topics {
                assert_eq!(topic.split('/').count(), 4, "bad topic {topic}");
            }
        }
    }

    #[test]
    fn routes_light_command_to_the_wallpad_queue() {
        let (wallpad, lgac, _rx) = test_lgac();
        let flags = ControlFlags::default();
        let (tx, _rx2) = mpsc::unbounded_channel();
        route_message(
            "homeassistant/light/livingroom_light1/set",
            "on",
            &wallpad,
            &lgac,
            &flags,
            &tx,
        );
        assert_eq!(wallpad.queue.len(), 2); // set + check
    }

    #[test]
    fn routes_aircon_command_to_the_lgac_engine() {
        let (wallpad, lgac, mut rx) = test_lgac();
        let flags = ControlFlags::default();
        let (tx, _rx2) = mpsc::unbounded_channel();
        route_message(
            "LGAircon/climate/bedroom/target_temp",
            "23",
            &wallpad,
            &lgac,
            &flags,
            &tx,
        );
        let (unit_no, room, request) = rx.try_recv().unwrap();
        assert_eq!(unit_no, 2); // bedroom is the third aircon room
        assert_eq!(room, "bedroom");
        assert_eq!(request.target_temp, 23);
    }

    #[test]
    fn control_messages_raise_flags_and_events() {
        let (wallpad, lgac, _rx) = test_lgac();
        let flags = ControlFlags::default();
        let (tx, mut rx2) = mpsc::unbounded_channel();
        route_message("rs485/bridge/config/restart", "", &wallpad, &lgac, &flags, &tx);
        assert!(flags.discovery.load(SeqCst));
        route_message("rs485/bridge/config/remove", "", &wallpad, &lgac, &flags, &tx);
        assert!(flags.remove.load(SeqCst));
        route_message("rs485/bridge/config/reconnect", "", &wallpad, &lgac, &flags, &tx);
        assert_eq!(rx2.try_recv().unwrap(), ControlEvent::Reconnect);
    }

    #[test]
    fn discovery_documents_are_ignored_on_the_way_in() {
        let (wallpad, lgac, _rx) = test_lgac();
        let flags = ControlFlags::default();
        let (tx, _rx2) = mpsc::unbounded_channel();
        route_message(
            "homeassistant/light/livingroom_light1/config",
            "{}",
            &wallpad,
            &lgac,
            &flags,
            &tx,
        );
        assert!(wallpad.queue.is_empty());
    }
}
