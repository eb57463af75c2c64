// Wires one run of the core together: wallpad reader/writer, aircon writer,
// MQTT event loop and the scan tick, all raced in one select so a reconnect
// request or a fatal fault tears everything down for the supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, MqttOptions};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, MissedTickBehavior};

use wire::config::{BridgeConfig, PACKET_RESEND_INTERVAL, SCAN_TICK_INTERVAL};

use crate::comm::PacedConn;
use crate::kocom_loop::{self, Wallpad};
use crate::lgac_loop::{self, LgacEngine};
use crate::mqtt::{self, ControlEvent, ControlFlags, MqttExit, MqttHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Tear down and start the core again.
    Restart,
    /// Exit the process with this code.
    Fatal(i32),
    /// Ctrl-C.
    Shutdown,
}

pub async fn run(cfg: Arc<BridgeConfig>, shutdown: Arc<AtomicBool>) -> Outcome {
    let comm = Arc::new(PacedConn::new(
        &cfg.kocom_server,
        cfg.kocom_port,
        PACKET_RESEND_INTERVAL,
    ));
    if let Err(e) = comm.connect().await {
        log::error!("error connecting the kocom gateway ({e}), check the EW11 configuration");
        return Outcome::Fatal(1);
    }

    let mut options = MqttOptions::new(
        format!("kobridge-{}", std::process::id()),
        cfg.mqtt_server.clone(),
        cfg.mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(60));
    if let (Some(user), Some(pass)) = (&cfg.mqtt_username, &cfg.mqtt_password) {
        options.set_credentials(user.clone(), pass.clone());
    }
    let (client, eventloop) = AsyncClient::new(options, 100);
    let mqtt = MqttHandle::new(client);

    let wallpad = Arc::new(Wallpad::from_config(&cfg));
    let (aircon_tx, aircon_rx) = mpsc::unbounded_channel();
    let lgac = Arc::new(LgacEngine::new(cfg.clone(), mqtt.clone(), aircon_tx));
    let flags = Arc::new(ControlFlags::default());
    let (control_tx, mut control_rx) = mpsc::unbounded_channel::<ControlEvent>();

    let reader = kocom_loop::read_loop(wallpad.clone(), comm.clone(), cfg.clone(), mqtt.clone());
    let writer = kocom_loop::write_loop(wallpad.clone(), comm.clone(), cfg.clone());
    let aircon_writer = lgac_loop::write_loop(lgac.clone(), aircon_rx);
    let mqtt_task = mqtt::event_loop(
        eventloop,
        wallpad.clone(),
        lgac.clone(),
        flags.clone(),
        control_tx.clone(),
    );
    let scanner = scan_loop(
        wallpad.clone(),
        lgac.clone(),
        comm.clone(),
        mqtt.clone(),
        flags.clone(),
    );

    log::info!("now entering the main loop");
    let outcome = tokio::select! {
        res = reader => {
            log::error!("kocom reader stopped: {res:?}");
            Outcome::Restart
        }
        res = writer => {
            log::error!("kocom writer stopped: {res:?}");
            Outcome::Restart
        }
        res = aircon_writer => fatal_or_restart(res),
        res = scanner => fatal_or_restart(res),
        exit = mqtt_task => match exit {
            MqttExit::InitialConnectFailure => {
                log::error!("cannot reach MQTT, check the broker configuration");
                Outcome::Fatal(1)
            }
            MqttExit::ConnectionLost => Outcome::Restart,
        },
        Some(event) = control_rx.recv() => match event {
            ControlEvent::Reconnect => {
                log::info!("restart requested by the controller");
                Outcome::Restart
            }
        },
        _ = watch_shutdown(shutdown) => Outcome::Shutdown,
    };
    comm.close().await;
    outcome
}

fn fatal_or_restart(res: anyhow::Result<()>) -> Outcome {
    match res {
        Ok(()) => Outcome::Restart,
        Err(e) => {
            log::error!("{e}");
            Outcome::Fatal(1)
        }
    }
}

async fn watch_shutdown(flag: Arc<AtomicBool>) {
    while !flag.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(200)).await;
    }
}

/// The periodic tick: serve pending discovery work, then walk the device
/// lists while the wallpad bus is quiet.
async fn scan_loop(
    wallpad: Arc<Wallpad>,
    lgac: Arc<LgacEngine>,
    comm: Arc<PacedConn>,
    mqtt: MqttHandle,
    flags: Arc<ControlFlags>,
) -> anyhow::Result<()> {
    use std::sync::atomic::Ordering::SeqCst;
    let mut tick = interval(SCAN_TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        if flags.remove.swap(false, SeqCst) {
            if let Err(e) = mqtt.publish_discovery(&wallpad, &lgac.rooms(), false, true).await {
                log::error!("discovery remove failed: {e}");
            }
        }
        if flags.discovery.swap(false, SeqCst) {
            let initial = flags.subscribe.swap(false, SeqCst);
            if let Err(e) = mqtt
                .publish_discovery(&wallpad, &lgac.rooms(), initial, false)
                .await
            {
                log::error!("discovery failed: {e}");
            }
        }
        if comm.quiet() {
            let now = Instant::now();
            wallpad.scan(now);
            lgac.scan(now).await?;
        }
    }
}
