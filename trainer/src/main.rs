use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch};

use trainer_core::config;
use trainer_core::debug_server::{self, DebugContext};
use trainer_core::ftms_service::{self, BleContext};
use trainer_core::hardware::{SimControls, SimulatedBridge, SimulatedMechanism};
use trainer_core::motor::HBridge;
use trainer_core::pulse::SensorInputs;
use trainer_core::trainer::{self, Trainer};

const DEFAULT_CONFIG: &str = "trainer_config.json";
const DEFAULT_DEBUG_PORT: u16 = 8826;

struct Args {
    config_path: String,
    debug_port: u16,
    simulate: bool,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = parse_args();
    log::info!(
        "Trainer daemon starting, config: {}, debug port: {}, simulate: {}",
        args.config_path,
        args.debug_port,
        args.simulate
    );

    let config = match config::load(&args.config_path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            std::process::exit(1);
        }
    };

    let inputs = SensorInputs::new();
    let notify_interval = Duration::from_millis(config.control_loop.notify_interval_ms);

    // Simulation rig or real pins. Edge registrations stay alive until exit.
    let mut mechanism = None;
    let mut sim_controls = None;
    #[cfg(all(feature = "hardware", target_os = "linux"))]
    let mut _edges = None;

    let bridge: Box<dyn HBridge> = if args.simulate {
        let bridge = SimulatedBridge::new();
        let controls = Arc::new(SimControls::default());
        mechanism = Some(SimulatedMechanism::new(
            bridge.clone(),
            inputs.clone(),
            controls.clone(),
        ));
        sim_controls = Some(controls);
        Box::new(bridge) as Box<dyn HBridge>
    } else {
        #[cfg(all(feature = "hardware", target_os = "linux"))]
        {
            use trainer_core::hardware::gpio;
            let setup = gpio::GpioBridge::new(&config.gpio).and_then(|bridge| {
                gpio::attach_edge_inputs(&config.gpio, &inputs).map(|edges| (bridge, edges))
            });
            match setup {
                Ok((bridge, edges)) => {
                    _edges = Some(edges);
                    Box::new(bridge) as Box<dyn HBridge>
                }
                Err(e) => {
                    log::error!("{}", e);
                    std::process::exit(1);
                }
            }
        }
        #[cfg(not(all(feature = "hardware", target_os = "linux")))]
        {
            log::warn!("Built without the `hardware` feature, motor output goes nowhere");
            Box::new(SimulatedBridge::new()) as Box<dyn HBridge>
        }
    };

    let (event_tx, event_rx) = mpsc::channel(64);
    let (notify_tx, _) = broadcast::channel(32);

    let core = Trainer::new(config, inputs.clone(), bridge, Instant::now());
    let (telemetry_tx, telemetry_rx) = watch::channel(core.telemetry(Instant::now()));

    let ble = BleContext {
        events: event_tx.clone(),
        telemetry: telemetry_rx.clone(),
        notifications: notify_tx.clone(),
        notify_interval,
    };
    let debug = DebugContext {
        events: event_tx,
        telemetry: telemetry_rx,
        notifications: notify_tx.clone(),
        inputs,
        sim: sim_controls,
    };

    let simulation = async move {
        match mechanism {
            Some(mechanism) => mechanism.run().await,
            None => futures::future::pending().await,
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received shutdown signal");
        }
        result = trainer::run(core, event_rx, telemetry_tx, notify_tx) => {
            if let Err(e) = result {
                log::error!("Control loop exited with error: {}", e);
            }
        }
        result = ftms_service::run(ble) => {
            if let Err(e) = result {
                log::error!("FTMS service task exited with error: {}", e);
            }
        }
        result = debug_server::run(debug, args.debug_port) => {
            if let Err(e) = result {
                log::error!("Debug server exited with error: {}", e);
            }
        }
        result = simulation => {
            if let Err(e) = result {
                log::error!("Simulated mechanism exited with error: {}", e);
            }
        }
    }

    log::info!("Trainer daemon shutting down");
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config_path: DEFAULT_CONFIG.to_string(),
        debug_port: DEFAULT_DEBUG_PORT,
        simulate: false,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                if let Some(path) = args.get(i + 1) {
                    parsed.config_path = path.clone();
                    i += 1;
                }
            }
            "--debug-port" => {
                if let Some(port) = args.get(i + 1) {
                    parsed.debug_port = port.parse().unwrap_or(DEFAULT_DEBUG_PORT);
                    i += 1;
                }
            }
            "--simulate" => parsed.simulate = true,
            _ => {}
        }
        i += 1;
    }
    parsed
}
