/// FTMS (Fitness Machine Service) and CSC binary protocol encoding/decoding.
///
/// All multi-byte values are little-endian, as GATT requires.
/// FTMS uses metric fixed-point units: speed in km/h * 100, cadence in rpm * 2,
/// inclination in % * 10, resistance in 0.1 steps of the 1..100% load scale.

use thiserror::Error;
use uuid::Uuid;

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128,
    )
}

// FTMS service and characteristic UUIDs
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);
pub const TRAINING_STATUS_UUID: Uuid = ble_uuid(0x2AD3);
pub const INCLINE_RANGE_UUID: Uuid = ble_uuid(0x2AD5);
pub const RESISTANCE_RANGE_UUID: Uuid = ble_uuid(0x2AD6);
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

// Cycling Speed and Cadence
pub const CSC_SERVICE_UUID: Uuid = ble_uuid(0x1816);
pub const CSC_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A5B);
pub const CSC_FEATURE_UUID: Uuid = ble_uuid(0x2A5C);

pub const RESPONSE_CODE: u8 = 0x80;

/// Inclination limits exposed over BLE, percent.
pub const MAX_BLE_INCLINE: f64 = 20.0;
/// Set Target Resistance bounds in 0.1 units (1.0%..100.0%).
pub const MIN_RESISTANCE_TENTHS: i16 = 10;
pub const MAX_RESISTANCE_TENTHS: i16 = 1000;

/// Control Point op codes we understand (FTMS spec Table 4.15).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    RequestControl = 0x00,
    Reset = 0x01,
    SetTargetInclination = 0x03,
    SetTargetResistance = 0x04,
    SetTargetPower = 0x05,
    StartOrResume = 0x07,
    StopOrPause = 0x08,
    SetIndoorBikeSimulation = 0x11,
}

impl OpCode {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => OpCode::RequestControl,
            0x01 => OpCode::Reset,
            0x03 => OpCode::SetTargetInclination,
            0x04 => OpCode::SetTargetResistance,
            0x05 => OpCode::SetTargetPower,
            0x07 => OpCode::StartOrResume,
            0x08 => OpCode::StopOrPause,
            0x11 => OpCode::SetIndoorBikeSimulation,
            _ => return None,
        })
    }

    /// Only Request Control may be sent without holding control.
    pub fn requires_control(self) -> bool {
        self != OpCode::RequestControl
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopKind {
    Stop = 0x01,
    Pause = 0x02,
}

/// Indoor Bike Simulation parameters (op 0x11, status 0x12).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimulationParams {
    /// m/s * 1000
    pub wind_speed: i16,
    /// % * 100
    pub grade: i16,
    /// Rolling resistance coefficient * 10000
    pub crr: u8,
    /// Wind resistance coefficient, kg/m * 100
    pub cw: u8,
}

impl SimulationParams {
    /// Grade in percent, clamped to the advertised inclination range.
    pub fn incline_percent(&self) -> f64 {
        (f64::from(self.grade) / 100.0).clamp(-MAX_BLE_INCLINE, MAX_BLE_INCLINE)
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.wind_speed.to_le_bytes());
        buf.extend_from_slice(&self.grade.to_le_bytes());
        buf.push(self.crr);
        buf.push(self.cw);
    }
}

/// A decoded Control Point write.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    RequestControl,
    Reset,
    SetTargetInclination(i16), // percent * 10, already clamped to ±20%
    SetTargetResistance(i16),  // 0.1 units, 10..=1000
    SetTargetPower(i16),       // watts, >= 0
    StartOrResume,
    StopOrPause(StopKind),
    SetIndoorBikeSimulation(SimulationParams),
}

impl ControlCommand {
    pub fn opcode(&self) -> OpCode {
        match self {
            ControlCommand::RequestControl => OpCode::RequestControl,
            ControlCommand::Reset => OpCode::Reset,
            ControlCommand::SetTargetInclination(_) => OpCode::SetTargetInclination,
            ControlCommand::SetTargetResistance(_) => OpCode::SetTargetResistance,
            ControlCommand::SetTargetPower(_) => OpCode::SetTargetPower,
            ControlCommand::StartOrResume => OpCode::StartOrResume,
            ControlCommand::StopOrPause(_) => OpCode::StopOrPause,
            ControlCommand::SetIndoorBikeSimulation(_) => OpCode::SetIndoorBikeSimulation,
        }
    }
}

/// Control Point result codes (FTMS spec Table 4.24).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    OperationFailed = 0x04,
    ControlNotPermitted = 0x05,
}

/// Why a Control Point write was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("op code 0x{0:02x} not supported")]
    NotSupported(u8),
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("control not granted")]
    NotPermitted,
    #[error("operation failed")]
    Failed,
}

impl Rejection {
    pub fn code(self) -> ResultCode {
        match self {
            Rejection::NotSupported(_) => ResultCode::OpCodeNotSupported,
            Rejection::InvalidParameter => ResultCode::InvalidParameter,
            Rejection::NotPermitted => ResultCode::ControlNotPermitted,
            Rejection::Failed => ResultCode::OperationFailed,
        }
    }
}

/// Decode the payload that follows a known op code.
///
/// Set Target Resistance is length-sensitive (1-byte uint8 or 2-byte sint16);
/// every other op reads the bytes it needs and ignores the rest.
pub fn parse_payload(op: OpCode, payload: &[u8]) -> Result<ControlCommand, Rejection> {
    let need = |n: usize| {
        if payload.len() < n {
            Err(Rejection::InvalidParameter)
        } else {
            Ok(())
        }
    };
    match op {
        OpCode::RequestControl => Ok(ControlCommand::RequestControl),
        OpCode::Reset => Ok(ControlCommand::Reset),
        OpCode::SetTargetInclination => {
            need(2)?;
            let tenths = i16::from_le_bytes([payload[0], payload[1]]);
            let limit = (MAX_BLE_INCLINE * 10.0) as i16;
            Ok(ControlCommand::SetTargetInclination(tenths.clamp(-limit, limit)))
        }
        OpCode::SetTargetResistance => {
            let tenths = match payload {
                [level] => i16::from(*level),
                [lo, hi] => i16::from_le_bytes([*lo, *hi]),
                _ => return Err(Rejection::InvalidParameter),
            };
            if !(MIN_RESISTANCE_TENTHS..=MAX_RESISTANCE_TENTHS).contains(&tenths) {
                return Err(Rejection::InvalidParameter);
            }
            Ok(ControlCommand::SetTargetResistance(tenths))
        }
        OpCode::SetTargetPower => {
            need(2)?;
            let watts = i16::from_le_bytes([payload[0], payload[1]]);
            if watts < 0 {
                return Err(Rejection::InvalidParameter);
            }
            Ok(ControlCommand::SetTargetPower(watts))
        }
        OpCode::StartOrResume => Ok(ControlCommand::StartOrResume),
        OpCode::StopOrPause => match payload.first() {
            Some(0x01) => Ok(ControlCommand::StopOrPause(StopKind::Stop)),
            Some(0x02) => Ok(ControlCommand::StopOrPause(StopKind::Pause)),
            _ => Err(Rejection::InvalidParameter),
        },
        OpCode::SetIndoorBikeSimulation => {
            need(6)?;
            Ok(ControlCommand::SetIndoorBikeSimulation(SimulationParams {
                wind_speed: i16::from_le_bytes([payload[0], payload[1]]),
                grade: i16::from_le_bytes([payload[2], payload[3]]),
                crr: payload[4],
                cw: payload[5],
            }))
        }
    }
}

/// Parse a whole Control Point write, ignoring permission.
pub fn parse_control_point(bytes: &[u8]) -> Result<ControlCommand, Rejection> {
    let (&first, payload) = bytes.split_first().ok_or(Rejection::InvalidParameter)?;
    let op = OpCode::from_u8(first).ok_or(Rejection::NotSupported(first))?;
    parse_payload(op, payload)
}

/// Encode a Control Point response indication.
///
/// Format: `[0x80, request_opcode, result_code]`
pub fn encode_control_response(request_opcode: u8, result: ResultCode) -> Vec<u8> {
    vec![RESPONSE_CODE, request_opcode, result as u8]
}

/// Indoor Bike Data (0x2AD2) fields, in wire units. `None` fields are omitted
/// and their flag bit cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IndoorBikeData {
    /// km/h * 100
    pub speed: Option<u16>,
    pub average_speed: Option<u16>,
    /// rpm * 2
    pub cadence: Option<u16>,
    pub average_cadence: Option<u16>,
    /// meters, uint24 on the wire
    pub total_distance: Option<u32>,
    pub resistance: Option<i16>,
    /// watts
    pub power: Option<i16>,
    pub average_power: Option<i16>,
    /// (total kcal, kcal/h, kcal/min)
    pub expended_energy: Option<(u16, u16, u8)>,
    pub heart_rate: Option<u8>,
    /// MET * 10
    pub metabolic_equivalent: Option<u8>,
    /// seconds
    pub elapsed_time: Option<u16>,
    pub remaining_time: Option<u16>,
}

// Indoor Bike Data flag bits (FTMS spec Table 4.9)
const IBD_MORE_DATA: u16 = 1 << 0;
const IBD_AVG_SPEED: u16 = 1 << 1;
const IBD_CADENCE: u16 = 1 << 2;
const IBD_AVG_CADENCE: u16 = 1 << 3;
const IBD_DISTANCE: u16 = 1 << 4;
const IBD_RESISTANCE: u16 = 1 << 5;
const IBD_POWER: u16 = 1 << 6;
const IBD_AVG_POWER: u16 = 1 << 7;
const IBD_ENERGY: u16 = 1 << 8;
const IBD_HEART_RATE: u16 = 1 << 9;
const IBD_METABOLIC: u16 = 1 << 10;
const IBD_ELAPSED: u16 = 1 << 11;
const IBD_REMAINING: u16 = 1 << 12;

impl IndoorBikeData {
    /// Record produced by this trainer: flags 0x0834, 13 bytes.
    pub fn trainer(
        speed_kmh: f64,
        cadence_rpm: f64,
        distance_m: f64,
        load_percent: f64,
        elapsed_secs: u64,
    ) -> Self {
        Self {
            speed: Some(kmh_to_hundredths(speed_kmh)),
            cadence: Some(rpm_to_half_rpm(cadence_rpm)),
            total_distance: Some((distance_m.max(0.0) as u32).min(0x00FF_FFFF)),
            resistance: Some(load_percent.round().clamp(0.0, 100.0) as i16),
            elapsed_time: Some(elapsed_secs.min(u64::from(u16::MAX)) as u16),
            ..Default::default()
        }
    }

    pub fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, bit: u16| {
            if present {
                flags |= bit;
            }
        };
        set(self.speed.is_none(), IBD_MORE_DATA);
        set(self.average_speed.is_some(), IBD_AVG_SPEED);
        set(self.cadence.is_some(), IBD_CADENCE);
        set(self.average_cadence.is_some(), IBD_AVG_CADENCE);
        set(self.total_distance.is_some(), IBD_DISTANCE);
        set(self.resistance.is_some(), IBD_RESISTANCE);
        set(self.power.is_some(), IBD_POWER);
        set(self.average_power.is_some(), IBD_AVG_POWER);
        set(self.expended_energy.is_some(), IBD_ENERGY);
        set(self.heart_rate.is_some(), IBD_HEART_RATE);
        set(self.metabolic_equivalent.is_some(), IBD_METABOLIC);
        set(self.elapsed_time.is_some(), IBD_ELAPSED);
        set(self.remaining_time.is_some(), IBD_REMAINING);
        flags
    }
}

/// Encode Indoor Bike Data (0x2AD2). Field order follows the flag bit order.
pub fn encode_indoor_bike_data(data: &IndoorBikeData) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32);
    buf.extend_from_slice(&data.flags().to_le_bytes());

    if let Some(v) = data.speed {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.average_speed {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.cadence {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.average_cadence {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.total_distance {
        // uint24: low three bytes only
        buf.extend_from_slice(&v.to_le_bytes()[..3]);
    }
    if let Some(v) = data.resistance {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.power {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.average_power {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some((total, per_hour, per_minute)) = data.expended_energy {
        buf.extend_from_slice(&total.to_le_bytes());
        buf.extend_from_slice(&per_hour.to_le_bytes());
        buf.push(per_minute);
    }
    if let Some(v) = data.heart_rate {
        buf.push(v);
    }
    if let Some(v) = data.metabolic_equivalent {
        buf.push(v);
    }
    if let Some(v) = data.elapsed_time {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    if let Some(v) = data.remaining_time {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

/// Little-endian cursor over a notification payload.
struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.bytes.len() < N {
            return None;
        }
        let (head, rest) = self.bytes.split_at(N);
        self.bytes = rest;
        head.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.take::<1>().map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    fn i16(&mut self) -> Option<i16> {
        self.take::<2>().map(i16::from_le_bytes)
    }

    fn u24(&mut self) -> Option<u32> {
        self.take::<3>().map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn u32(&mut self) -> Option<u32> {
        self.take::<4>().map(u32::from_le_bytes)
    }
}

/// Decode Indoor Bike Data. Returns `None` if the payload is shorter than its
/// flags promise. Trailing bytes are ignored.
pub fn decode_indoor_bike_data(bytes: &[u8]) -> Option<IndoorBikeData> {
    let mut r = Reader { bytes };
    let flags = r.u16()?;
    let has = |bit: u16| flags & bit != 0;

    let mut data = IndoorBikeData::default();
    if !has(IBD_MORE_DATA) {
        data.speed = Some(r.u16()?);
    }
    if has(IBD_AVG_SPEED) {
        data.average_speed = Some(r.u16()?);
    }
    if has(IBD_CADENCE) {
        data.cadence = Some(r.u16()?);
    }
    if has(IBD_AVG_CADENCE) {
        data.average_cadence = Some(r.u16()?);
    }
    if has(IBD_DISTANCE) {
        data.total_distance = Some(r.u24()?);
    }
    if has(IBD_RESISTANCE) {
        data.resistance = Some(r.i16()?);
    }
    if has(IBD_POWER) {
        data.power = Some(r.i16()?);
    }
    if has(IBD_AVG_POWER) {
        data.average_power = Some(r.i16()?);
    }
    if has(IBD_ENERGY) {
        data.expended_energy = Some((r.u16()?, r.u16()?, r.u8()?));
    }
    if has(IBD_HEART_RATE) {
        data.heart_rate = Some(r.u8()?);
    }
    if has(IBD_METABOLIC) {
        data.metabolic_equivalent = Some(r.u8()?);
    }
    if has(IBD_ELAPSED) {
        data.elapsed_time = Some(r.u16()?);
    }
    if has(IBD_REMAINING) {
        data.remaining_time = Some(r.u16()?);
    }
    Some(data)
}

/// Speed in km/h to the wire's km/h * 100, saturating.
pub fn kmh_to_hundredths(kmh: f64) -> u16 {
    (kmh * 100.0).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Cadence in rpm to the wire's 0.5 rpm units, saturating.
pub fn rpm_to_half_rpm(rpm: f64) -> u16 {
    (rpm * 2.0).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

/// Encode FTMS Feature characteristic (0x2ACC).
///
/// Fitness Machine Features (uint32 LE):
///   - Bit 1: Cadence Supported
///   - Bit 2: Total Distance Supported
///   - Bit 3: Inclination Supported
///   - Bit 7: Resistance Level Supported
///   - Bit 12: Elapsed Time Supported
///   = 0x0000_108E
///
/// Target Setting Features (uint32 LE):
///   - Bit 1: Inclination Target Supported
///   - Bit 2: Resistance Target Supported
///   - Bit 3: Power Target Supported
///   - Bit 13: Indoor Bike Simulation Parameters Supported
///   = 0x0000_200E
pub fn encode_feature() -> [u8; 8] {
    let machine_features: u32 = 0x0000_108E;
    let target_features: u32 = 0x0000_200E;
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&machine_features.to_le_bytes());
    buf[4..8].copy_from_slice(&target_features.to_le_bytes());
    buf
}

/// Encode Supported Resistance Level Range (0x2AD6).
///
/// sint16 min, sint16 max, uint16 step, all in 0.1 units: 1.0 .. 100.0 step 1.0.
pub fn encode_resistance_range() -> [u8; 6] {
    encode_range(MIN_RESISTANCE_TENTHS, MAX_RESISTANCE_TENTHS, 10)
}

/// Encode Supported Inclination Range (0x2AD5).
///
/// sint16 min, sint16 max, uint16 step, percent * 10: -20.0 .. 20.0 step 1.0.
pub fn encode_incline_range() -> [u8; 6] {
    let limit = (MAX_BLE_INCLINE * 10.0) as i16;
    encode_range(-limit, limit, 10)
}

fn encode_range(min: i16, max: i16, step: u16) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..2].copy_from_slice(&min.to_le_bytes());
    buf[2..4].copy_from_slice(&max.to_le_bytes());
    buf[4..6].copy_from_slice(&step.to_le_bytes());
    buf
}

/// Training Status values (FTMS spec Table 4.25).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrainingStatus {
    Idle = 0x01,
    ManualMode = 0x0D,
}

/// Training Status format: [flags(1) = 0x00 (no string), status(1)]
pub fn encode_training_status(status: TrainingStatus) -> Vec<u8> {
    vec![0x00, status as u8]
}

/// Fitness Machine Status events (FTMS spec Table 4.16).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MachineStatus {
    Reset,
    StoppedOrPaused(StopKind),
    /// Used to report a motor fault: the machine stopped itself.
    StoppedBySafetyKey,
    StartedOrResumed,
    /// percent * 10
    TargetInclinationChanged(i16),
    /// 0.1 units
    TargetResistanceChanged(i16),
    TargetPowerChanged(i16),
    SimulationParametersChanged(SimulationParams),
    ControlPermissionLost,
}

pub fn encode_machine_status(status: &MachineStatus) -> Vec<u8> {
    let mut buf = Vec::with_capacity(7);
    match status {
        MachineStatus::Reset => buf.push(0x01),
        MachineStatus::StoppedOrPaused(kind) => {
            buf.push(0x02);
            buf.push(*kind as u8);
        }
        MachineStatus::StoppedBySafetyKey => buf.push(0x03),
        MachineStatus::StartedOrResumed => buf.push(0x04),
        MachineStatus::TargetInclinationChanged(tenths) => {
            buf.push(0x06);
            buf.extend_from_slice(&tenths.to_le_bytes());
        }
        MachineStatus::TargetResistanceChanged(tenths) => {
            buf.push(0x07);
            buf.extend_from_slice(&tenths.to_le_bytes());
        }
        MachineStatus::TargetPowerChanged(watts) => {
            buf.push(0x08);
            buf.extend_from_slice(&watts.to_le_bytes());
        }
        MachineStatus::SimulationParametersChanged(params) => {
            buf.push(0x12);
            params.encode_into(&mut buf);
        }
        MachineStatus::ControlPermissionLost => buf.push(0xFF),
    }
    buf
}

/// Encode CSC Measurement (0x2A5B) with both wheel and crank data present.
///
/// flags(1)=0x03 + wheel revs(u32) + wheel event(u16, 1/1024 s)
/// + crank revs(u16) + crank event(u16, 1/1024 s) = 11 bytes
pub fn encode_csc_measurement(
    wheel_revolutions: u32,
    wheel_event_1024: u16,
    crank_revolutions: u16,
    crank_event_1024: u16,
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(11);
    buf.push(0x03);
    buf.extend_from_slice(&wheel_revolutions.to_le_bytes());
    buf.extend_from_slice(&wheel_event_1024.to_le_bytes());
    buf.extend_from_slice(&crank_revolutions.to_le_bytes());
    buf.extend_from_slice(&crank_event_1024.to_le_bytes());
    buf
}

/// Decoded CSC Measurement, as (wheel revs, wheel event, crank revs, crank event).
pub fn decode_csc_measurement(bytes: &[u8]) -> Option<(Option<(u32, u16)>, Option<(u16, u16)>)> {
    let mut r = Reader { bytes };
    let flags = r.u8()?;
    let wheel = if flags & 0x01 != 0 {
        Some((r.u32()?, r.u16()?))
    } else {
        None
    };
    let crank = if flags & 0x02 != 0 {
        Some((r.u16()?, r.u16()?))
    } else {
        None
    };
    Some((wheel, crank))
}

/// CSC Feature (0x2A5C): wheel and crank revolution data supported.
pub fn encode_csc_feature() -> [u8; 2] {
    0x0003u16.to_le_bytes()
}

/// FTMS advertising service data (FTMS spec Section 3.1):
/// flags (bit 0 = machine available) + machine type (bit 5 = indoor bike).
pub fn encode_advertising_data() -> Vec<u8> {
    let machine_type: u16 = 1 << 5;
    let mut buf = vec![0x01];
    buf.extend_from_slice(&machine_type.to_le_bytes());
    buf
}
