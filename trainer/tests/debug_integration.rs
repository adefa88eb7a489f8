//! End-to-end tests through the TCP debug console.
//!
//! These connect to a running trainer-daemon's debug port (8826), send raw
//! FTMS control point bytes and console commands, and verify that the daemon:
//! 1. Answers with the right Control Point indications
//! 2. Actually moves its load/incline/pairing state
//! 3. Derives cadence from injected pulses
//!
//! Requirements:
//!   - trainer-daemon running with `--simulate` (cadence/jam need the rig)
//!
//! Run:
//!   cargo test --test debug_integration -- --ignored --test-threads=1
//!
//! Set TRAINER_HOST to override the target (default: localhost)
//! Set TRAINER_DEBUG_PORT to override the port (default: 8826)

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;

const PROMPT: &str = "trainer-debug>";

fn host() -> String {
    std::env::var("TRAINER_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn port() -> u16 {
    std::env::var("TRAINER_DEBUG_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8826)
}

struct DebugClient {
    reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl DebugClient {
    async fn connect() -> Self {
        let addr = format!("{}:{}", host(), port());
        let stream = TcpStream::connect(&addr)
            .await
            .unwrap_or_else(|e| panic!("Failed to connect to debug server at {}: {}", addr, e));

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader).lines();

        let welcome = reader.next_line().await.unwrap().unwrap();
        assert!(
            welcome.contains("connected as peer"),
            "Expected welcome message, got: {}",
            welcome
        );

        Self { reader, writer }
    }

    /// Send a command and collect response lines until the daemon goes quiet.
    async fn send_cmd(&mut self, cmd: &str) -> Vec<String> {
        self.writer
            .write_all(format!("{}\n", cmd).as_bytes())
            .await
            .unwrap();

        sleep(Duration::from_millis(50)).await;

        let mut lines = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(500), self.reader.next_line()).await {
                Ok(Ok(Some(line))) => {
                    let mut clean = line.trim();
                    while let Some(rest) = clean.strip_prefix(PROMPT) {
                        clean = rest.trim_start();
                    }
                    if !clean.is_empty() {
                        lines.push(clean.to_string());
                    }
                }
                Ok(Ok(None)) | Ok(Err(_)) | Err(_) => break,
            }
        }
        lines
    }

    /// Send a Control Point write and return the hex of the indication.
    async fn cp(&mut self, hex: &str) -> String {
        let lines = self.send_cmd(&format!("cp {}", hex)).await;
        lines
            .iter()
            .find_map(|l| l.strip_prefix("resp "))
            .map(str::to_string)
            .unwrap_or_else(|| panic!("no resp line for cp {}: {:?}", hex, lines))
    }

    async fn telemetry(&mut self) -> serde_json::Value {
        let lines = self.send_cmd("json").await;
        serde_json::from_str(&lines.join("\n"))
            .unwrap_or_else(|e| panic!("bad json ({}): {:?}", e, lines))
    }

    fn parse_state(lines: &[String]) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        for line in lines {
            if let Some((key, val)) = line.split_once(':') {
                map.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
        map
    }
}

fn read_range(line: &str) -> (i16, i16, u16) {
    let bytes = hex_to_bytes(line.trim_start_matches("range "));
    assert_eq!(bytes.len(), 6);
    (
        i16::from_le_bytes([bytes[0], bytes[1]]),
        i16::from_le_bytes([bytes[2], bytes[3]]),
        u16::from_le_bytes([bytes[4], bytes[5]]),
    )
}

// ---- Tests ----
// Run sequentially: --test-threads=1
// Each client drops its session on close, so every test starts without control.

#[tokio::test]
#[ignore]
async fn test_01_connect_and_read_state() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("state").await;
    let state = DebugClient::parse_state(&lines);
    for key in ["speed", "cadence", "gear", "load", "motor", "name", "peers"] {
        assert!(state.contains_key(key), "state should contain {}: {:?}", key, state);
    }
    println!("State: {:?}", state);
}

#[tokio::test]
#[ignore]
async fn test_02_read_feature_and_ranges() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("feat").await;
    assert_eq!(lines, vec!["feat 8e1000000e200000".to_string()]);

    let lines = client.send_cmd("rr").await;
    assert_eq!(read_range(&lines[0]), (10, 1000, 10));

    let lines = client.send_cmd("ir").await;
    assert_eq!(read_range(&lines[0]), (-200, 200, 10));
}

#[tokio::test]
#[ignore]
async fn test_03_write_without_control_is_refused() {
    sleep(Duration::from_millis(200)).await;
    let mut client = DebugClient::connect().await;

    assert_eq!(client.cp("07").await, "800705");
    assert_eq!(client.cp("00").await, "800001");
    assert_eq!(client.cp("07").await, "800701");
}

#[tokio::test]
#[ignore]
async fn test_04_set_resistance_and_observe() {
    let mut client = DebugClient::connect().await;
    client.cp("00").await;

    // 55.0% = 550 = 0x0226
    assert_eq!(client.cp("042602").await, "800401");
    let t = client.telemetry().await;
    assert_eq!(t["target_load"], 55);
    assert_eq!(t["resistance_override"], true);

    // Reset hands load back to the gears.
    assert_eq!(client.cp("01").await, "800101");
    let t = client.telemetry().await;
    assert_eq!(t["resistance_override"], false);
}

#[tokio::test]
#[ignore]
async fn test_05_simulation_grade_sets_incline() {
    let mut client = DebugClient::connect().await;
    client.cp("00").await;

    // wind 0, grade 5.00% (500 = 0x01f4), crr 0.0040, cw 0.51
    assert_eq!(client.cp("110000f4012833").await, "801101");
    let t = client.telemetry().await;
    assert_eq!(t["ble_incline_percent"], 5.0);
    assert_eq!(t["resistance_override"], false);

    client.cp("01").await;
}

#[tokio::test]
#[ignore]
async fn test_06_unknown_opcode_not_supported() {
    let mut client = DebugClient::connect().await;
    assert_eq!(client.cp("42").await, "804202");
    assert_eq!(client.cp("ff").await, "80ff02");
}

#[tokio::test]
#[ignore]
async fn test_07_bad_payload_invalid_parameter() {
    let mut client = DebugClient::connect().await;
    client.cp("00").await;
    // Set Target Resistance with three bytes
    assert_eq!(client.cp("04010203").await, "800403");
    // Simulation parameters cut short
    assert_eq!(client.cp("110000").await, "801103");
}

#[tokio::test]
#[ignore]
async fn test_08_pairing_button_changes_name() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("btn pair").await;
    assert!(lines.iter().any(|l| l.contains("Pair")), "{:?}", lines);
    let t = client.telemetry().await;
    assert_eq!(t["ble_pairing_active"], true);
    let name = t["advertised_name"].as_str().unwrap_or_default().to_string();

    // A connection closes the window.
    client.send_cmd("connect").await;
    let t = client.telemetry().await;
    assert_eq!(t["ble_pairing_active"], false);
    assert_ne!(t["advertised_name"].as_str(), Some(name.as_str()));
}

#[tokio::test]
#[ignore]
async fn test_09_gear_buttons() {
    let mut client = DebugClient::connect().await;
    let before = client.telemetry().await["gear"].as_u64().unwrap_or(0);

    client.send_cmd("btn gear_up").await;
    let after = client.telemetry().await["gear"].as_u64().unwrap_or(0);
    assert!(after >= before, "gear went {} -> {}", before, after);

    client.send_cmd("btn gear_down").await;
    let back = client.telemetry().await["gear"].as_u64().unwrap_or(0);
    assert_eq!(back, before);
}

#[tokio::test]
#[ignore]
async fn test_10_simulated_cadence() {
    let mut client = DebugClient::connect().await;
    let lines = client.send_cmd("cadence 90").await;
    assert_eq!(lines, vec!["simulated cadence 90 rpm".to_string()]);

    sleep(Duration::from_secs(3)).await;
    let t = client.telemetry().await;
    let rpm = t["crank_rpm"].as_f64().unwrap_or(0.0);
    assert!((70.0..=110.0).contains(&rpm), "crank_rpm {}", rpm);

    let lines = client.send_cmd("ibd").await;
    assert!(lines[0].starts_with("ibd "), "{:?}", lines);

    client.send_cmd("cadence 0").await;
}

#[tokio::test]
#[ignore]
async fn test_11_second_client_takes_control() {
    let mut first = DebugClient::connect().await;
    let mut second = DebugClient::connect().await;

    assert_eq!(first.cp("00").await, "800001");
    let controller = first.telemetry().await["controller"].clone();
    assert_eq!(second.cp("00").await, "800001");
    assert_ne!(second.telemetry().await["controller"], controller);

    // First client lost control.
    assert_eq!(first.cp("07").await, "800705");
}

#[tokio::test]
#[ignore]
async fn test_20_garbage_commands() {
    let mut client = DebugClient::connect().await;

    let garbage = ["", "   ", "xyz", "cp", "cp zz", "cp 0", "btn", "btn nope", "pulse crank x"];
    for cmd in garbage {
        let lines = client.send_cmd(cmd).await;
        println!("'{}' -> {:?}", cmd, lines);
    }

    // Still alive afterwards.
    let lines = client.send_cmd("feat").await;
    assert_eq!(lines.len(), 1);
}

#[tokio::test]
#[ignore]
async fn test_21_all_single_byte_opcodes() {
    let mut client = DebugClient::connect().await;
    client.cp("00").await;

    for op in 0u8..=0xFF {
        let resp = client.cp(&format!("{:02x}", op)).await;
        let bytes = hex_to_bytes(&resp);
        assert_eq!(bytes.len(), 3, "op {:02x} -> {}", op, resp);
        assert_eq!(bytes[0], 0x80);
        assert_eq!(bytes[1], op);
        assert!((1..=5).contains(&bytes[2]), "op {:02x} result {}", op, bytes[2]);
    }

    client.cp("01").await;
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .filter_map(|i| hex.get(i..i + 2))
        .filter_map(|s| u8::from_str_radix(s, 16).ok())
        .collect()
}
