//! H-bridge and edge-input backends.
//!
//! `--simulate` uses [`SimulatedBridge`] plus a [`SimulatedMechanism`] task
//! that turns drive state into motor pulses, fires the stop trigger when the
//! mechanism passes its stop position, and pedals at a settable cadence.
//! Real pins live in [`gpio`] behind the `hardware` feature.

use std::sync::atomic::{AtomicBool, AtomicI8, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::info;

use crate::motor::{Direction, HBridge};
use crate::pulse::{Sensor, SensorInputs};

/// Bridge whose pin state is a shared atomic: 0 coast, 1 forward, -1 reverse.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBridge {
    state: Arc<AtomicI8>,
}

impl SimulatedBridge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn driving(&self) -> Option<Direction> {
        match self.state.load(Ordering::Acquire) {
            1 => Some(Direction::Forward),
            -1 => Some(Direction::Reverse),
            _ => None,
        }
    }
}

impl HBridge for SimulatedBridge {
    fn drive(&mut self, direction: Direction) {
        let value = match direction {
            Direction::Forward => 1,
            Direction::Reverse => -1,
        };
        self.state.store(value, Ordering::Release);
    }

    fn coast(&mut self) {
        self.state.store(0, Ordering::Release);
    }
}

/// Knobs the debug console turns while simulating.
#[derive(Debug, Default)]
pub struct SimControls {
    cadence_rpm: AtomicU32,
    jammed: AtomicBool,
}

impl SimControls {
    pub fn set_cadence(&self, rpm: u32) {
        self.cadence_rpm.store(rpm, Ordering::Relaxed);
    }

    pub fn cadence(&self) -> u32 {
        self.cadence_rpm.load(Ordering::Relaxed)
    }

    /// A jammed mechanism produces no motor pulses even while driven.
    pub fn set_jammed(&self, jammed: bool) {
        self.jammed.store(jammed, Ordering::Relaxed);
    }

    pub fn jammed(&self) -> bool {
        self.jammed.load(Ordering::Relaxed)
    }
}

/// Motor pulses per full turn of the resistance mechanism.
const PULSES_PER_TURN: i64 = 1000;
/// Motor pulse rate while driven.
const PULSES_PER_SEC: f64 = 400.0;
/// Mechanism angle at power-on, unknown to the controller.
const START_ANGLE: i64 = 300;

pub struct SimulatedMechanism {
    bridge: SimulatedBridge,
    inputs: SensorInputs,
    controls: Arc<SimControls>,
    angle: i64,
    motor_carry: f64,
    crank_carry: f64,
}

impl SimulatedMechanism {
    pub fn new(bridge: SimulatedBridge, inputs: SensorInputs, controls: Arc<SimControls>) -> Self {
        Self {
            bridge,
            inputs,
            controls,
            angle: START_ANGLE,
            motor_carry: 0.0,
            crank_carry: 0.0,
        }
    }

    pub fn angle(&self) -> i64 {
        self.angle
    }

    /// Advance the model by `dt`.
    pub fn step(&mut self, dt: Duration) {
        let secs = dt.as_secs_f64();

        if let Some(direction) = self.bridge.driving().filter(|_| !self.controls.jammed()) {
            self.motor_carry += PULSES_PER_SEC * secs;
            let whole = self.motor_carry.floor();
            self.motor_carry -= whole;
            let step = match direction {
                Direction::Forward => 1,
                Direction::Reverse => -1,
            };
            for _ in 0..whole as u32 {
                self.angle += step;
                self.inputs.motor.on_edge();
                if self.angle.rem_euclid(PULSES_PER_TURN) == 0 {
                    self.inputs.motor_stop.on_edge();
                }
            }
        } else {
            self.motor_carry = 0.0;
        }

        self.crank_carry += f64::from(self.controls.cadence()) / 60.0 * secs;
        let revs = self.crank_carry.floor();
        self.crank_carry -= revs;
        self.inputs.inject(Sensor::Crank, revs as u32);
    }

    pub async fn run(mut self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let period = Duration::from_millis(5);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Simulated mechanism running ({} pulses/s, start angle {})",
            PULSES_PER_SEC, self.angle
        );
        let mut last = tokio::time::Instant::now();
        loop {
            interval.tick().await;
            let now = tokio::time::Instant::now();
            self.step(now - last);
            last = now;
        }
    }
}

/// Raspberry Pi GPIO via rppal.
#[cfg(all(feature = "hardware", target_os = "linux"))]
pub mod gpio {
    use log::info;
    use rppal::gpio::{Gpio, InputPin, OutputPin, Trigger};

    use crate::config::GpioConfig;
    use crate::error::HardwareError;
    use crate::motor::{Direction, HBridge};
    use crate::pulse::SensorInputs;

    fn gpio_err(e: rppal::gpio::Error) -> HardwareError {
        HardwareError::Gpio(e.to_string())
    }

    /// L298N-style direction pair. Both pins start and end low.
    pub struct GpioBridge {
        in1: OutputPin,
        in2: OutputPin,
    }

    impl GpioBridge {
        pub fn new(config: &GpioConfig) -> Result<Self, HardwareError> {
            let gpio = Gpio::new().map_err(gpio_err)?;
            let in1 = gpio.get(config.bridge_in1).map_err(gpio_err)?.into_output_low();
            let in2 = gpio.get(config.bridge_in2).map_err(gpio_err)?.into_output_low();
            info!(
                "H-bridge on GPIO {} / {}",
                config.bridge_in1, config.bridge_in2
            );
            Ok(Self { in1, in2 })
        }
    }

    impl HBridge for GpioBridge {
        fn drive(&mut self, direction: Direction) {
            match direction {
                Direction::Forward => {
                    self.in2.set_low();
                    self.in1.set_high();
                }
                Direction::Reverse => {
                    self.in1.set_low();
                    self.in2.set_high();
                }
            }
        }

        fn coast(&mut self) {
            self.in1.set_low();
            self.in2.set_low();
        }
    }

    impl Drop for GpioBridge {
        fn drop(&mut self) {
            self.coast();
        }
    }

    /// Interrupt registrations; dropping this disables them.
    pub struct EdgeInputs {
        _pins: Vec<InputPin>,
    }

    /// Pull-up inputs whose interrupt handlers do nothing but count.
    pub fn attach_edge_inputs(
        config: &GpioConfig,
        inputs: &SensorInputs,
    ) -> Result<EdgeInputs, HardwareError> {
        let gpio = Gpio::new().map_err(gpio_err)?;
        let wiring = [
            ("crank", config.crank, Trigger::RisingEdge, inputs.crank.clone()),
            ("wheel", config.wheel, Trigger::FallingEdge, inputs.wheel.clone()),
            ("motor", config.motor_count, Trigger::RisingEdge, inputs.motor.clone()),
            ("stop", config.motor_stop, Trigger::RisingEdge, inputs.motor_stop.clone()),
        ];
        let mut pins = Vec::with_capacity(wiring.len());
        for (name, pin, trigger, counter) in wiring {
            let mut input = gpio.get(pin).map_err(gpio_err)?.into_input_pullup();
            input
                .set_async_interrupt(trigger, move |_level| counter.on_edge())
                .map_err(gpio_err)?;
            info!("{} sensor on GPIO {}", name, pin);
            pins.push(input);
        }
        Ok(EdgeInputs { _pins: pins })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rig() -> (SimulatedBridge, SensorInputs, Arc<SimControls>, SimulatedMechanism) {
        let bridge = SimulatedBridge::new();
        let inputs = SensorInputs::new();
        let controls = Arc::new(SimControls::default());
        let mech = SimulatedMechanism::new(bridge.clone(), inputs.clone(), controls.clone());
        (bridge, inputs, controls, mech)
    }

    #[test]
    fn test_bridge_state() {
        let mut bridge = SimulatedBridge::new();
        assert_eq!(bridge.driving(), None);
        bridge.drive(Direction::Reverse);
        assert_eq!(bridge.driving(), Some(Direction::Reverse));
        bridge.coast();
        assert_eq!(bridge.driving(), None);
    }

    #[test]
    fn test_coasting_makes_no_pulses() {
        let (_bridge, inputs, _controls, mut mech) = rig();
        mech.step(Duration::from_secs(1));
        assert_eq!(inputs.motor.peek(), 0);
    }

    #[test]
    fn test_reverse_reaches_stop_position() {
        let (mut bridge, inputs, _controls, mut mech) = rig();
        bridge.drive(Direction::Reverse);
        mech.step(Duration::from_millis(500));
        assert_eq!(inputs.motor.take(), 200);
        assert_eq!(inputs.motor_stop.peek(), 0);
        mech.step(Duration::from_millis(500));
        assert_eq!(inputs.motor.take(), 200);
        assert_eq!(inputs.motor_stop.take(), 1);
        assert_eq!(mech.angle(), -100);
    }

    #[test]
    fn test_jam_stops_pulses() {
        let (mut bridge, inputs, controls, mut mech) = rig();
        controls.set_jammed(true);
        bridge.drive(Direction::Forward);
        mech.step(Duration::from_secs(1));
        assert_eq!(inputs.motor.peek(), 0);
    }

    #[test]
    fn test_cadence_produces_crank_pulses() {
        let (_bridge, inputs, controls, mut mech) = rig();
        controls.set_cadence(90);
        mech.step(Duration::from_secs(1));
        mech.step(Duration::from_secs(1));
        // 90 rpm for 2 s
        assert_eq!(inputs.crank.peek(), 3);
    }
}
