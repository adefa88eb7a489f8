//! Trainer core: owns every component and advances them once per tick.
//!
//! All state mutation happens on the control-loop task. Edge handlers only
//! bump the counters in [`SensorInputs`]; BLE and console input arrives as
//! [`TrainerEvent`]s on an mpsc channel. Readers get a [`Telemetry`] snapshot
//! through a `watch` channel and status events through a `broadcast`.

use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{SpeedUnit, TrainerConfig};
use crate::error::FaultKind;
use crate::gears::GearSelector;
use crate::load::{self, LoadModel};
use crate::motor::{HBridge, MotorController, MotorState};
use crate::protocol::{
    self, ControlCommand, IndoorBikeData, MachineStatus, OpCode, Rejection, ResultCode,
    StopKind, TrainingStatus, MAX_BLE_INCLINE,
};
use crate::pulse::{RateEstimator, RevolutionIntegrator, SensorInputs};
use crate::session::{ControlSessions, PairingWindow, PeerId};
use crate::speed::SpeedEstimator;

/// Local (button) incline step and range, percent.
pub const INCLINE_STEP: f64 = 5.0;
pub const MAX_LOCAL_INCLINE: f64 = 100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TrainingState {
    Idle,
    Active,
    Paused,
}

/// Classified button input from the front panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputEvent {
    GearUp,
    GearDown,
    InclineUp,
    InclineDown,
    PairingTrigger,
    /// Explicit operator reset after a motor fault.
    ResetFault,
}

impl FromStr for InputEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gear_up" | "up" => Ok(InputEvent::GearUp),
            "gear_down" | "down" => Ok(InputEvent::GearDown),
            "incline_up" => Ok(InputEvent::InclineUp),
            "incline_down" => Ok(InputEvent::InclineDown),
            "pair" | "pairing" => Ok(InputEvent::PairingTrigger),
            "reset" | "reset_fault" => Ok(InputEvent::ResetFault),
            other => Err(format!("unknown input '{other}'")),
        }
    }
}

/// Something for the control loop to act on.
#[derive(Debug)]
pub enum TrainerEvent {
    Connected(PeerId),
    Disconnected(PeerId),
    /// A Control Point write; the indication payload goes back on `reply`.
    ControlPoint {
        peer: PeerId,
        data: Vec<u8>,
        reply: oneshot::Sender<Vec<u8>>,
    },
    Input(InputEvent),
}

/// Status changes pushed to subscribed BLE clients.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    MachineStatus(MachineStatus),
    TrainingStatus(TrainingStatus),
}

impl Notification {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Notification::MachineStatus(status) => protocol::encode_machine_status(status),
            Notification::TrainingStatus(status) => protocol::encode_training_status(*status),
        }
    }
}

/// Read-only view of the trainer, rebuilt every tick.
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    /// In `speed_unit`.
    pub speed: f64,
    pub speed_unit: SpeedUnit,
    pub speed_kmh: f64,
    pub wheel_rpm: f64,
    pub crank_rpm: f64,
    pub gear: u8,
    pub gear_ratio: f64,
    /// Load implied by the motor position right now.
    pub load_percent: f64,
    pub target_load: u8,
    pub resistance_override: bool,
    /// Local incline, possibly outside the BLE range.
    pub incline_percent: f64,
    /// Incline as exposed over BLE, always within ±20%.
    pub ble_incline_percent: f64,
    pub ble_pairing_active: bool,
    pub pairing_seconds_remaining: u64,
    pub advertised_name: String,
    pub training: TrainingState,
    pub motor: MotorState,
    pub motor_position: i32,
    pub fault: Option<FaultKind>,
    pub controller: Option<PeerId>,
    pub connected_peers: usize,
    pub distance_m: f64,
    pub elapsed_secs: u64,
    pub wheel_revolutions: u64,
    pub wheel_event_1024: u16,
    pub crank_revolutions: u64,
    pub crank_event_1024: u16,
}

impl Telemetry {
    pub fn indoor_bike_data(&self) -> IndoorBikeData {
        IndoorBikeData::trainer(
            self.speed_kmh,
            self.crank_rpm,
            self.distance_m,
            self.load_percent,
            self.elapsed_secs,
        )
    }

    /// CSC counters wrap, so truncation is the wire behaviour.
    pub fn csc_measurement(&self) -> Vec<u8> {
        protocol::encode_csc_measurement(
            self.wheel_revolutions as u32,
            self.wheel_event_1024,
            self.crank_revolutions as u16,
            self.crank_event_1024,
        )
    }

    pub fn training_status(&self) -> TrainingStatus {
        match self.training {
            TrainingState::Active => TrainingStatus::ManualMode,
            TrainingState::Idle | TrainingState::Paused => TrainingStatus::Idle,
        }
    }
}

pub struct Trainer<B: HBridge> {
    config: TrainerConfig,
    inputs: SensorInputs,
    crank: RateEstimator,
    wheel: RateEstimator,
    /// Turns of the effective wheel, which CSC reports.
    wheel_turns: RevolutionIntegrator,
    speed: SpeedEstimator,
    gears: GearSelector,
    load_model: LoadModel,
    motor: MotorController<B>,
    sessions: ControlSessions,
    pairing: PairingWindow,
    incline: f64,
    resistance_override: Option<u8>,
    load_target: u8,
    training: TrainingState,
    speed_kmh: f64,
    crank_rpm: f64,
    wheel_rpm: f64,
    distance_m: f64,
    elapsed: Duration,
    last_tick: Instant,
    pending: Vec<Notification>,
}

impl<B: HBridge> Trainer<B> {
    /// Build the core and start motor calibration.
    pub fn new(config: TrainerConfig, inputs: SensorInputs, bridge: B, now: Instant) -> Self {
        let gears = GearSelector::new(&config.gears);
        let load_model = LoadModel::new(gears.min_ratio(), gears.max_ratio());
        let mut motor = MotorController::new(
            bridge,
            inputs.motor.clone(),
            inputs.motor_stop.clone(),
            &config.motor,
        );
        motor.begin_calibration(now);

        let mut trainer = Self {
            crank: RateEstimator::new(&config.sensors.crank, now),
            wheel: RateEstimator::new(&config.sensors.wheel, now),
            wheel_turns: RevolutionIntegrator::new(now),
            speed: SpeedEstimator::new(&config.wheel),
            gears,
            load_model,
            motor,
            sessions: ControlSessions::new(),
            pairing: PairingWindow::new(),
            incline: 0.0,
            resistance_override: None,
            load_target: 0,
            training: TrainingState::Idle,
            speed_kmh: 0.0,
            crank_rpm: 0.0,
            wheel_rpm: 0.0,
            distance_m: 0.0,
            elapsed: Duration::ZERO,
            last_tick: now,
            pending: Vec::new(),
            config,
            inputs,
        };
        trainer.refresh_load();
        info!(
            "Trainer ready: {} gears ({:.2}..{:.2}), speed factor {:.4}",
            trainer.gears.count(),
            trainer.gears.min_ratio(),
            trainer.gears.max_ratio(),
            trainer.speed.calibration_factor()
        );
        trainer
    }

    pub fn inputs(&self) -> &SensorInputs {
        &self.inputs
    }

    pub fn load_target(&self) -> u8 {
        self.load_target
    }

    pub fn motor(&self) -> &MotorController<B> {
        &self.motor
    }

    /// One control-loop step.
    pub fn tick(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_tick);
        self.last_tick = now;

        self.crank.sample(&self.inputs.crank, now);
        self.wheel.sample(&self.inputs.wheel, now);
        self.crank_rpm = self.crank.rpm();
        let direct_wheel = (self.config.sensors.wheel_sensor_fitted && self.wheel.is_fresh(now))
            .then(|| self.wheel.rpm());
        let ratio = self.gears.ratio();
        self.wheel_rpm = self
            .speed
            .effective_wheel_rpm(direct_wheel, self.crank_rpm, ratio);
        self.wheel_turns.advance(self.wheel_rpm, dt, now);
        self.speed_kmh = self
            .speed
            .estimate(direct_wheel, self.crank_rpm, ratio, SpeedUnit::Kmh);

        self.distance_m += self.speed_kmh / 3.6 * dt.as_secs_f64();
        if self.training == TrainingState::Active {
            self.elapsed += dt;
        }

        self.refresh_load();
        self.motor.set_hold(
            self.config.motor.halt_on_pause && self.training == TrainingState::Paused,
        );
        if let Some(fault) = self.motor.tick(now) {
            error!("Resistance motor stopped: {}", fault);
            self.pending
                .push(Notification::MachineStatus(MachineStatus::StoppedBySafetyKey));
        }

        self.pairing.update(now);
    }

    pub fn handle_event(&mut self, event: TrainerEvent, now: Instant) {
        match event {
            TrainerEvent::Connected(peer) => self.peer_connected(peer),
            TrainerEvent::Disconnected(peer) => self.peer_disconnected(peer),
            TrainerEvent::ControlPoint { peer, data, reply } => {
                let response = self.handle_control_point(peer, &data);
                if reply.send(response).is_err() {
                    debug!("Control point reply dropped (requester gone)");
                }
            }
            TrainerEvent::Input(input) => self.handle_input(input, now),
        }
    }

    pub fn peer_connected(&mut self, peer: PeerId) {
        self.sessions.connect(peer);
        self.pairing.on_connect();
    }

    pub fn peer_disconnected(&mut self, peer: PeerId) {
        self.sessions.disconnect(peer);
    }

    pub fn handle_input(&mut self, input: InputEvent, now: Instant) {
        match input {
            InputEvent::GearUp => {
                if self.gears.shift_up() {
                    info!("Gear up -> {}", self.gears.gear());
                }
            }
            InputEvent::GearDown => {
                if self.gears.shift_down() {
                    info!("Gear down -> {}", self.gears.gear());
                }
            }
            InputEvent::InclineUp => self.step_incline(INCLINE_STEP),
            InputEvent::InclineDown => self.step_incline(-INCLINE_STEP),
            InputEvent::PairingTrigger => {
                let duration = Duration::from_secs(self.config.device.pairing_duration_secs);
                self.pairing.enter_pairing(duration, now);
            }
            InputEvent::ResetFault => {
                if self.motor.reset_fault() {
                    self.motor.begin_calibration(now);
                } else {
                    debug!("Reset requested with no motor fault");
                }
            }
        }
        self.refresh_load();
    }

    fn step_incline(&mut self, delta: f64) {
        self.incline = (self.incline + delta).clamp(-MAX_LOCAL_INCLINE, MAX_LOCAL_INCLINE);
        info!("Incline {:+.0}%", self.incline);
    }

    /// Run one Control Point write to completion and return the indication.
    ///
    /// Checks run in this order: empty write, unknown op code, missing
    /// control, malformed payload. A refused write never changes state.
    pub fn handle_control_point(&mut self, peer: PeerId, bytes: &[u8]) -> Vec<u8> {
        let Some((&first, payload)) = bytes.split_first() else {
            warn!("Empty control point write from {}", peer);
            return protocol::encode_control_response(0x00, ResultCode::InvalidParameter);
        };
        let code = match self.dispatch(peer, first, payload) {
            Ok(()) => ResultCode::Success,
            Err(rejection) => {
                warn!(
                    "Control point 0x{:02x} from {} refused: {}",
                    first, peer, rejection
                );
                rejection.code()
            }
        };
        protocol::encode_control_response(first, code)
    }

    fn dispatch(&mut self, peer: PeerId, opcode: u8, payload: &[u8]) -> Result<(), Rejection> {
        let op = OpCode::from_u8(opcode).ok_or(Rejection::NotSupported(opcode))?;
        if op.requires_control() && !self.sessions.has_control(peer) {
            return Err(Rejection::NotPermitted);
        }
        let command = protocol::parse_payload(op, payload)?;
        info!("Control point from {}: {:?}", peer, command);
        self.apply(peer, command)?;
        self.refresh_load();
        Ok(())
    }

    fn apply(&mut self, peer: PeerId, command: ControlCommand) -> Result<(), Rejection> {
        let moves_resistance = matches!(
            command,
            ControlCommand::SetTargetInclination(_)
                | ControlCommand::SetTargetResistance(_)
                | ControlCommand::SetTargetPower(_)
                | ControlCommand::SetIndoorBikeSimulation(_)
        );
        if moves_resistance && self.motor.fault().is_some() {
            return Err(Rejection::Failed);
        }

        match command {
            ControlCommand::RequestControl => {
                if self.sessions.request_control(peer).is_some() {
                    self.notify(MachineStatus::ControlPermissionLost);
                }
            }
            ControlCommand::Reset => {
                self.incline = 0.0;
                self.resistance_override = None;
                self.notify(MachineStatus::Reset);
            }
            ControlCommand::SetTargetInclination(tenths) => {
                self.incline = f64::from(tenths) / 10.0;
                self.resistance_override = None;
                self.notify(MachineStatus::TargetInclinationChanged(tenths));
            }
            ControlCommand::SetTargetResistance(tenths) => {
                self.resistance_override = Some(load::quantize(f64::from(tenths) / 10.0));
                self.notify(MachineStatus::TargetResistanceChanged(tenths));
            }
            ControlCommand::SetTargetPower(watts) => {
                self.resistance_override = Some(load::power_to_load(
                    f64::from(watts),
                    self.config.load.max_power_watts,
                ));
                self.notify(MachineStatus::TargetPowerChanged(watts));
            }
            ControlCommand::StartOrResume => {
                self.set_training(TrainingState::Active);
                self.notify(MachineStatus::StartedOrResumed);
            }
            ControlCommand::StopOrPause(kind) => {
                self.set_training(TrainingState::Paused);
                self.notify(MachineStatus::StoppedOrPaused(kind));
                if kind == StopKind::Stop {
                    debug!("Stopped; elapsed {:?}", self.elapsed);
                }
            }
            ControlCommand::SetIndoorBikeSimulation(params) => {
                self.incline = params.incline_percent();
                self.resistance_override = None;
                self.notify(MachineStatus::SimulationParametersChanged(params));
            }
        }
        Ok(())
    }

    fn set_training(&mut self, state: TrainingState) {
        if self.training != state {
            info!("Training {:?} -> {:?}", self.training, state);
            self.training = state;
            let status = match state {
                TrainingState::Active => TrainingStatus::ManualMode,
                TrainingState::Idle | TrainingState::Paused => TrainingStatus::Idle,
            };
            self.pending.push(Notification::TrainingStatus(status));
        }
    }

    fn notify(&mut self, status: MachineStatus) {
        self.pending.push(Notification::MachineStatus(status));
    }

    /// Recompute the load target and hand it to the motor.
    fn refresh_load(&mut self) {
        let target = match self.resistance_override {
            Some(load) => load,
            None => self.load_model.target_load(self.gears.ratio(), self.incline),
        };
        if target != self.load_target {
            debug!("Load target {}% -> {}%", self.load_target, target);
            self.load_target = target;
        }
        self.motor.set_target_load(target);
    }

    /// Status events produced since the last call.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.pending)
    }

    pub fn advertised_name(&self) -> String {
        self.pairing
            .advertised_name(&self.config.device.name, &self.config.device.pairing_suffix)
    }

    pub fn telemetry(&self, now: Instant) -> Telemetry {
        let unit = self.config.wheel.display_unit;
        let speed = match unit {
            SpeedUnit::Kmh => self.speed_kmh,
            SpeedUnit::Mph => self.speed_kmh * 0.621371,
        };
        Telemetry {
            speed,
            speed_unit: unit,
            speed_kmh: self.speed_kmh,
            wheel_rpm: self.wheel_rpm,
            crank_rpm: self.crank_rpm,
            gear: self.gears.gear(),
            gear_ratio: self.gears.ratio(),
            load_percent: self.motor.current_load_percent(),
            target_load: self.load_target,
            resistance_override: self.resistance_override.is_some(),
            incline_percent: self.incline,
            ble_incline_percent: self.incline.clamp(-MAX_BLE_INCLINE, MAX_BLE_INCLINE),
            ble_pairing_active: self.pairing.is_active(),
            pairing_seconds_remaining: self.pairing.remaining(now).as_secs(),
            advertised_name: self.advertised_name(),
            training: self.training,
            motor: self.motor.state(),
            motor_position: self.motor.position(),
            fault: self.motor.fault(),
            controller: self.sessions.controller(),
            connected_peers: self.sessions.connected_count(),
            distance_m: self.distance_m,
            elapsed_secs: self.elapsed.as_secs(),
            wheel_revolutions: self.wheel_turns.cumulative_revolutions(),
            wheel_event_1024: self.wheel_turns.last_event_1024(),
            crank_revolutions: self.crank.cumulative_revolutions(),
            crank_event_1024: self.crank.last_event_1024(),
        }
    }
}

/// Drive the trainer until the event channel closes.
pub async fn run<B: HBridge>(
    mut trainer: Trainer<B>,
    mut events: mpsc::Receiver<TrainerEvent>,
    telemetry: watch::Sender<Telemetry>,
    notifications: broadcast::Sender<Notification>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let tick_hz = trainer.config.control_loop.tick_hz.max(1);
    let mut interval = tokio::time::interval(Duration::from_secs(1) / tick_hz);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!("Control loop running at {} Hz", tick_hz);

    loop {
        tokio::select! {
            _ = interval.tick() => trainer.tick(Instant::now()),
            event = events.recv() => match event {
                Some(event) => trainer.handle_event(event, Instant::now()),
                None => {
                    info!("Event channel closed, control loop stopping");
                    break;
                }
            },
        }

        for notification in trainer.drain_notifications() {
            // No receivers just means nobody is subscribed.
            let _ = notifications.send(notification);
        }
        telemetry.send_replace(trainer.telemetry(Instant::now()));
    }
    Ok(())
}
