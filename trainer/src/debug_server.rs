//! TCP debug console for exercising the trainer without BLE hardware.
//!
//! Listens on a TCP port (default 8826) and accepts line-based text commands
//! with hex-encoded binary payloads, mirroring exactly what a BLE FTMS client
//! would send/receive via GATT characteristics. Each console client acts as
//! its own peer, so control permission works the same as over the radio.
//!
//! Usage from dev machine:
//!   nc pi 8826

use std::sync::Arc;
use std::time::Duration;

use log::info;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::hardware::SimControls;
use crate::protocol;
use crate::pulse::{Sensor, SensorInputs};
use crate::session::PeerId;
use crate::trainer::{InputEvent, Notification, Telemetry, TrainerEvent};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Handles the console needs into the running trainer.
#[derive(Clone)]
pub struct DebugContext {
    pub events: mpsc::Sender<TrainerEvent>,
    pub telemetry: watch::Receiver<Telemetry>,
    pub notifications: broadcast::Sender<Notification>,
    pub inputs: SensorInputs,
    /// Present only when running with `--simulate`.
    pub sim: Option<Arc<SimControls>>,
}

/// Run the TCP debug server.
pub async fn run(ctx: DebugContext, port: u16) -> Result<(), BoxError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Debug server listening on port {}", port);

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Debug client connected from {}", addr);

        let ctx = ctx.clone();
        let peer = console_peer(addr.port());
        tokio::spawn(async move {
            let mut client = Client {
                ctx,
                peer,
                connected: false,
            };
            if let Err(e) = client.serve(stream).await {
                info!("Debug client {} disconnected: {}", addr, e);
            }
            client.hang_up().await;
        });
    }
}

/// Synthetic address for a console client, unique per source port.
fn console_peer(port: u16) -> PeerId {
    let [hi, lo] = port.to_be_bytes();
    PeerId([0xDE, 0xB6, 0x00, 0x00, hi, lo])
}

struct Client {
    ctx: DebugContext,
    peer: PeerId,
    connected: bool,
}

impl Client {
    async fn serve(&mut self, stream: TcpStream) -> Result<(), BoxError> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        writer
            .write_all(
                format!(
                    "trainer-debug> connected as peer {}. type 'help' for commands.\n",
                    self.peer
                )
                .as_bytes(),
            )
            .await?;

        loop {
            writer.write_all(b"trainer-debug> ").await?;

            let Some(line) = lines.next_line().await? else {
                return Ok(()); // EOF
            };
            let line = line.trim().to_lowercase();
            if line.is_empty() {
                continue;
            }

            let (cmd, arg) = match line.split_once(' ') {
                Some((cmd, arg)) => (cmd, arg.trim()),
                None => (line.as_str(), ""),
            };

            let response = match cmd {
                "help" => Ok(HELP_TEXT.to_string()),
                "state" => Ok(format_state(&self.ctx.telemetry.borrow())),
                "json" => serde_json::to_string_pretty(&*self.ctx.telemetry.borrow())
                    .map_err(BoxError::from),
                "ibd" => Ok(format_ibd(&self.ctx.telemetry.borrow())),
                "csc" => Ok(format!(
                    "csc {}",
                    hex_encode(&self.ctx.telemetry.borrow().csc_measurement())
                )),
                "ts" => Ok(format!(
                    "training {}",
                    hex_encode(&protocol::encode_training_status(
                        self.ctx.telemetry.borrow().training_status()
                    ))
                )),
                "feat" => Ok(format!("feat {}", hex_encode(&protocol::encode_feature()))),
                "rr" => Ok(format!(
                    "range {}",
                    hex_encode(&protocol::encode_resistance_range())
                )),
                "ir" => Ok(format!(
                    "range {}",
                    hex_encode(&protocol::encode_incline_range())
                )),
                "cp" => self.handle_cp(arg).await,
                "btn" => self.handle_button(arg).await,
                "pulse" => self.handle_pulse(arg),
                "connect" => self.connect().await,
                "disconnect" => self.disconnect().await,
                "cadence" => self.handle_cadence(arg),
                "jam" => self.handle_jam(arg),
                "sub" => {
                    self.subscribe(&mut writer).await?;
                    continue; // subscribe handles its own output
                }
                "quit" | "exit" => return Ok(()),
                _ => Ok(format!("unknown command: '{}'. type 'help'.", line)),
            };

            match response {
                Ok(msg) => {
                    writer.write_all(msg.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                Err(e) => {
                    writer
                        .write_all(format!("error: {}\n", e).as_bytes())
                        .await?;
                }
            }
        }
    }

    async fn send(&self, event: TrainerEvent) -> Result<(), BoxError> {
        self.ctx
            .events
            .send(event)
            .await
            .map_err(|_| "control loop not running".into())
    }

    async fn connect(&mut self) -> Result<String, BoxError> {
        self.send(TrainerEvent::Connected(self.peer)).await?;
        self.connected = true;
        Ok(format!("connected as {}", self.peer))
    }

    async fn disconnect(&mut self) -> Result<String, BoxError> {
        self.send(TrainerEvent::Disconnected(self.peer)).await?;
        self.connected = false;
        Ok(format!("disconnected {}", self.peer))
    }

    /// Drop any session this client held when the socket goes away.
    async fn hang_up(&mut self) {
        if self.connected {
            let _ = self.disconnect().await;
        }
    }

    async fn handle_cp(&mut self, hex: &str) -> Result<String, BoxError> {
        let bytes = hex_decode(hex)?;
        let description = match protocol::parse_control_point(&bytes) {
            Ok(cmd) => format!("{:?}", cmd),
            Err(e) => format!("rejected before dispatch ({})", e),
        };

        if !self.connected {
            // A GATT write implies a connection.
            self.connect().await?;
        }
        let (reply, response) = oneshot::channel();
        self.send(TrainerEvent::ControlPoint {
            peer: self.peer,
            data: bytes,
            reply,
        })
        .await?;
        let response = response.await.map_err(|_| "no response from control loop")?;

        let mut output = format!("parsed: {}\nresp {}", description, hex_encode(&response));
        if response.get(2) != Some(&(protocol::ResultCode::Success as u8)) {
            output.push_str("\nwarning: command refused (see daemon log)");
        }
        Ok(output)
    }

    async fn handle_button(&self, arg: &str) -> Result<String, BoxError> {
        let input: InputEvent = arg.parse()?;
        self.send(TrainerEvent::Input(input)).await?;
        Ok(format!("input {:?}", input))
    }

    fn handle_pulse(&self, arg: &str) -> Result<String, BoxError> {
        let mut parts = arg.split_whitespace();
        let sensor: Sensor = parts.next().ok_or("usage: pulse <sensor> [n]")?.parse()?;
        let count: u32 = match parts.next() {
            Some(n) => n.parse()?,
            None => 1,
        };
        self.ctx.inputs.inject(sensor, count);
        Ok(format!("injected {} {:?} pulses", count, sensor))
    }

    fn handle_cadence(&self, arg: &str) -> Result<String, BoxError> {
        let sim = self.ctx.sim.as_ref().ok_or("not simulating")?;
        let rpm: u32 = arg.parse()?;
        sim.set_cadence(rpm);
        Ok(format!("simulated cadence {} rpm", rpm))
    }

    fn handle_jam(&self, arg: &str) -> Result<String, BoxError> {
        let sim = self.ctx.sim.as_ref().ok_or("not simulating")?;
        let jammed = match arg {
            "on" => true,
            "off" => false,
            _ => return Err("usage: jam on|off".into()),
        };
        sim.set_jammed(jammed);
        Ok(format!("mechanism {}", if jammed { "jammed" } else { "free" }))
    }

    /// Stream Indoor Bike Data at the notify rate plus status events as
    /// they happen, until the client goes away.
    async fn subscribe(&self, writer: &mut OwnedWriteHalf) -> Result<(), BoxError> {
        writer
            .write_all(b"subscribed to indoor bike data at 1 Hz and status events. ctrl-c to stop.\n")
            .await?;

        let mut statuses = self.ctx.notifications.subscribe();
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            let line = tokio::select! {
                _ = interval.tick() => format!("{}\n", format_ibd(&self.ctx.telemetry.borrow())),
                status = statuses.recv() => match status {
                    Ok(n) => format!("status {} | {:?}\n", hex_encode(&n.encode()), n),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        format!("status lagged, {} missed\n", missed)
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if writer.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

fn format_ibd(t: &Telemetry) -> String {
    let data = t.indoor_bike_data();
    format!(
        "ibd {} (speed={} cadence={} dist={}m resistance={} elapsed={}s)",
        hex_encode(&protocol::encode_indoor_bike_data(&data)),
        data.speed.unwrap_or_default(),
        data.cadence.unwrap_or_default(),
        data.total_distance.unwrap_or_default(),
        data.resistance.unwrap_or_default(),
        data.elapsed_time.unwrap_or_default(),
    )
}

fn format_state(t: &Telemetry) -> String {
    let fault = t
        .fault
        .map(|f| f.to_string())
        .unwrap_or_else(|| "none".to_string());
    let controller = t
        .controller
        .map(|p| p.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "speed:    {:.1} {:?} ({:.2} km/h)\n\
         cadence:  {:.1} rpm  wheel: {:.1} rpm\n\
         gear:     {} (ratio {:.2})\n\
         load:     {:.0}% (target {}%{})\n\
         incline:  {:+.1}% (ble {:+.1}%)\n\
         motor:    {:?} at {}\n\
         fault:    {}\n\
         training: {:?}  elapsed {}s  distance {:.0}m\n\
         name:     '{}' pairing={} ({}s left)\n\
         peers:    {} connected, controller {}",
        t.speed,
        t.speed_unit,
        t.speed_kmh,
        t.crank_rpm,
        t.wheel_rpm,
        t.gear,
        t.gear_ratio,
        t.load_percent,
        t.target_load,
        if t.resistance_override { ", app override" } else { "" },
        t.incline_percent,
        t.ble_incline_percent,
        t.motor,
        t.motor_position,
        fault,
        t.training,
        t.elapsed_secs,
        t.distance_m,
        t.advertised_name,
        t.ble_pairing_active,
        t.pairing_seconds_remaining,
        t.connected_peers,
        controller,
    )
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("")
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, BoxError> {
    let hex = hex.replace(' ', "");
    if !hex.is_ascii() {
        return Err("hex string must be ascii".into());
    }
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(BoxError::from))
        .collect()
}

const HELP_TEXT: &str = "\
commands:
  state           show current trainer state (human-readable)
  json            telemetry snapshot as JSON
  ibd             read indoor bike data (0x2AD2) as hex
  csc             read CSC measurement (0x2A5B) as hex
  ts              read training status (0x2AD3) as hex
  feat            read feature characteristic (0x2ACC) as hex
  rr              read supported resistance range (0x2AD6) as hex
  ir              read supported inclination range (0x2AD5) as hex
  cp <hex>        write to control point (0x2AD9), execute + show response
  sub             stream indoor bike data and status notifications
  connect         register this console as a connected peer
  disconnect      drop this console's session (and control)
  btn <event>     gear_up, gear_down, incline_up, incline_down, pair, reset
  pulse <s> [n]   inject n edges on crank, wheel, motor or stop
  cadence <rpm>   simulated pedalling cadence (--simulate only)
  jam on|off      block the simulated mechanism (--simulate only)
  help            this message
  quit            disconnect

control point examples:
  cp 00               Request Control
  cp 01               Reset
  cp 03 2300          Set Target Inclination 3.5% (35 = 0x0023 LE)
  cp 04 2602          Set Target Resistance 55.0 (550 = 0x0226 LE)
  cp 05 c800          Set Target Power 200 W
  cp 07               Start or Resume
  cp 08 02            Pause
  cp 11 00005e012833  Simulation: wind 0, grade 3.50%, crr 0x28, cw 0x33

all values are little-endian hex, matching raw BLE GATT writes.";
