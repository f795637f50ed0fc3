//! Wire format of the load cell's notification characteristic, and the
//! command opcodes it accepts on its write characteristic.
//!
//! Every notification is one frame:
//!
//! ```text
//! [kind: u8][size: u8][payload: size bytes]
//! ```
//!
//! A weight frame's payload is a run of 8-byte records, each a little-endian
//! `f32` load followed by a little-endian `u32` device timestamp in
//! microseconds. Command responses carry raw bytes whose meaning depends on
//! the command that was last sent.

use crate::error::ProgressorError;
use crate::force::ForceSample;
use nom::{
    bytes::streaming::take,
    combinator::map,
    multi::many0,
    number::{
        complete::{le_f32, le_u32},
        streaming::u8 as byte,
    },
    sequence::tuple,
    IResult, Needed,
};

const KIND_COMMAND_RESPONSE: u8 = 0;
const KIND_WEIGHT: u8 = 1;
const KIND_LOW_POWER: u8 = 4;

const RECORD_LEN: usize = 8;

/// One decoded notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Load readings, in device order
    Weights(Vec<ForceSample>),
    /// Reply to the last command sent
    CommandResponse(Vec<u8>),
    /// The device's battery is running low
    LowPower,
}

impl Frame {
    /// Decodes exactly one frame from the front of `bytes`, returning it and
    /// the number of bytes it used.
    pub fn decode(bytes: &[u8]) -> Result<(Frame, usize), ProgressorError> {
        match raw_frame(bytes) {
            Ok((rest, (kind, payload))) => {
                let frame = Self::from_parts(kind, payload)?;
                Ok((frame, bytes.len() - rest.len()))
            }
            Err(nom::Err::Incomplete(needed)) => {
                let more = match needed {
                    Needed::Size(n) => n.get(),
                    Needed::Unknown => 1,
                };
                Err(ProgressorError::Truncated {
                    needed: bytes.len() + more,
                    available: bytes.len(),
                })
            }
            // The streaming header parsers can only run out of input
            Err(_) => Err(ProgressorError::Truncated {
                needed: 2,
                available: bytes.len(),
            }),
        }
    }

    fn from_parts(kind: u8, payload: &[u8]) -> Result<Frame, ProgressorError> {
        match kind {
            KIND_WEIGHT => {
                if payload.len() % RECORD_LEN != 0 {
                    return Err(ProgressorError::RaggedPayload(payload.len()));
                }
                let samples = weight_records(payload)
                    .map(|(_, samples)| samples)
                    .map_err(|_| ProgressorError::RaggedPayload(payload.len()))?;
                Ok(Frame::Weights(samples))
            }
            KIND_COMMAND_RESPONSE => Ok(Frame::CommandResponse(payload.to_vec())),
            KIND_LOW_POWER => Ok(Frame::LowPower),
            other => Err(ProgressorError::UnknownKind(other)),
        }
    }
}

fn raw_frame(input: &[u8]) -> IResult<&[u8], (u8, &[u8])> {
    let (input, kind) = byte(input)?;
    let (input, size) = byte(input)?;
    let (input, payload) = take(size)(input)?;
    Ok((input, (kind, payload)))
}

fn weight_record(input: &[u8]) -> IResult<&[u8], ForceSample> {
    map(tuple((le_f32, le_u32)), |(load, micros)| {
        ForceSample::new(micros, load)
    })(input)
}

fn weight_records(payload: &[u8]) -> IResult<&[u8], Vec<ForceSample>> {
    many0(weight_record)(payload)
}

/// Splits a byte stream into frames as bytes arrive.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
}

impl FrameDecoder {
    /// An empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends newly received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// The next complete frame, or `None` until more bytes arrive. A frame
    /// that fails to decode is consumed and reported once.
    pub fn next_frame(&mut self) -> Option<Result<Frame, ProgressorError>> {
        let (_, (_, payload)) = raw_frame(&self.pending).ok()?;
        let used = 2 + payload.len();
        let result = Frame::decode(&self.pending[..used]).map(|(frame, _)| frame);
        self.pending.drain(..used);
        Some(result)
    }

    /// Bytes waiting for the rest of their frame.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// Opcodes understood by the load cell's write characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Command {
    TareScale,
    StartWeightMeasurement,
    StopWeightMeasurement,
    StartPeakRfdMeasurement,
    StartPeakRfdMeasurementSeries,
    AddCalibrationPoint,
    SaveCalibration,
    GetAppVersion,
    GetErrorInfo,
    ClearErrorInfo,
    Sleep,
    GetBatteryVoltage,
}

impl Command {
    /// The command's opcode.
    pub fn opcode(self) -> u8 {
        match self {
            Command::TareScale => 0x64,
            Command::StartWeightMeasurement => 0x65,
            Command::StopWeightMeasurement => 0x66,
            Command::StartPeakRfdMeasurement => 0x67,
            Command::StartPeakRfdMeasurementSeries => 0x68,
            Command::AddCalibrationPoint => 0x69,
            Command::SaveCalibration => 0x6A,
            Command::GetAppVersion => 0x6B,
            Command::GetErrorInfo => 0x6C,
            Command::ClearErrorInfo => 0x6D,
            Command::Sleep => 0x6E,
            Command::GetBatteryVoltage => 0x6F,
        }
    }

    /// Bytes to write to the device.
    pub fn encode(self) -> [u8; 2] {
        (self.opcode() as u16).to_le_bytes()
    }

    /// Whether the device answers with a command response.
    pub fn expects_response(self) -> bool {
        matches!(
            self,
            Command::GetAppVersion | Command::GetErrorInfo | Command::GetBatteryVoltage
        )
    }
}

/// Battery voltage in millivolts from a [`Command::GetBatteryVoltage`] reply.
pub fn battery_millivolts(response: &[u8]) -> Option<u32> {
    le_u32::<_, nom::error::Error<&[u8]>>(response)
        .ok()
        .map(|(_, mv)| mv)
}

/// Text payload of a version or error-info reply.
pub fn response_text(response: &[u8]) -> Option<&str> {
    std::str::from_utf8(response).ok()
}

/// Human-readable reading of a command response, given the query it answers.
/// Replies to anything but a battery, version or error-info query say nothing
/// worth reporting.
pub fn describe_response(query: Option<Command>, response: &[u8]) -> Option<String> {
    match query? {
        Command::GetBatteryVoltage => {
            battery_millivolts(response).map(|mv| format!("battery {mv} mV"))
        }
        Command::GetAppVersion => response_text(response).map(|v| format!("firmware {v}")),
        Command::GetErrorInfo => {
            response_text(response).map(|log| format!("crash log: {log}"))
        }
        _ => None,
    }
}

/// Zero offset estimated by averaging readings taken with nothing on the
/// load cell.
#[derive(Debug, Clone, Copy, Default)]
pub struct SoftTare {
    sum: f64,
    count: u32,
}

impl SoftTare {
    /// No readings yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one unloaded reading.
    pub fn push(&mut self, load: f32) {
        self.sum += load as f64;
        self.count += 1;
    }

    /// Readings collected so far.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Mean of the readings, `None` if there were none.
    pub fn offset(&self) -> Option<f32> {
        (self.count > 0).then(|| (self.sum / self.count as f64) as f32)
    }
}
