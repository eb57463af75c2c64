use std::env;
use std::process;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use env_logger::Env;
use wire::config::BridgeConfig;

mod comm;
mod hub;
mod kocom_loop;
mod lgac_loop;
mod mqtt;

fn main() {
    // the logger stays wide open; the global max level does the filtering so
    // the controller can change it at runtime
    env_logger::Builder::from_env(Env::default().default_filter_or("debug")).init();
    let conf_level = env::var("CONF_LOGLEVEL").unwrap_or_else(|_| "info".to_string());
    log::set_max_level(mqtt::level_filter(&conf_level));

    log::info!(
        "starting RS485 bridge for Home Assistant v{}",
        env!("CARGO_PKG_VERSION")
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&shutdown))
        .expect("register SIGINT hook");

    loop {
        let cfg = match BridgeConfig::from_env() {
            Ok(cfg) => Arc::new(cfg),
            Err(e) => {
                log::error!("configuration is invalid! ({e})");
                process::exit(1);
            }
        };
        log::set_max_level(mqtt::level_filter(&cfg.log_level));
        log::info!("kocom gateway: [{}:{}]", cfg.kocom_server, cfg.kocom_port);
        match &cfg.aircon_server {
            Some(server) => log::info!("LGAircon gateway: [{server}:{}]", cfg.aircon_port),
            None => log::info!("no LGAircon gateway configured"),
        }
        log::info!("MQTT broker: [{}:{}]", cfg.mqtt_server, cfg.mqtt_port);

        let runtime = tokio::runtime::Runtime::new().expect("build tokio runtime");
        let outcome = runtime.block_on(hub::run(cfg, Arc::clone(&shutdown)));
        drop(runtime);

        match outcome {
            hub::Outcome::Shutdown => {
                log::info!("user sent Ctrl-C, exiting");
                process::exit(0);
            }
            hub::Outcome::Fatal(code) => process::exit(code),
            hub::Outcome::Restart => log::info!("exited the main loop, restarting"),
        }
    }
}
