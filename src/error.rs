use crate::status::{template::InvalidTemplateAnswers, SensorKind};
use std::{io, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("mdns resolver failed: {0}")]
    Resolver(String),

    #[error("no device discovered within {timeout:?}")]
    NotFound { timeout: Duration },
}

#[derive(Debug, Error)]
pub enum TimeEchoError {
    #[error("device does not expose a time echo port")]
    ProtocolNotSupported,

    #[error("no echo response within deadline (round {round})")]
    Timeout { round: usize },

    #[error("time echo transport failed")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ComponentParseError {
    #[error("unknown component model: {model}")]
    UnknownModel { model: String },

    #[error("malformed {model} component: {source}")]
    Data {
        model: String,
        source: serde_json::Error,
    },

    #[error("component is not an object with model/data fields")]
    Envelope,
}

/// Reason classification recovered from the device message on a rejected
/// recording start.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RecordingStartReason {
    Template,
    LowBattery,
    LowStorage,
    NoWearer,
    NoWorkspace,
    SetupIncomplete,
    Other,
}
impl RecordingStartReason {
    pub fn classify(message: &str) -> Self {
        let message = message.to_lowercase();

        if message.contains("template") {
            Self::Template
        } else if message.contains("battery") {
            Self::LowBattery
        } else if message.contains("storage") || message.contains("space") {
            Self::LowStorage
        } else if message.contains("wearer") {
            Self::NoWearer
        } else if message.contains("workspace") {
            Self::NoWorkspace
        } else if message.contains("setup") {
            Self::SetupIncomplete
        } else {
            Self::Other
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("transport error")]
    Transport(#[from] reqwest::Error),

    #[error("device error: {message}")]
    Device { message: String },

    #[error("recording start rejected ({reason:?}): {message}")]
    RecordingStart {
        reason: RecordingStartReason,
        message: String,
    },

    #[error("recording stop rejected: {message}")]
    RecordingStop { message: String },

    #[error(transparent)]
    InvalidTemplateAnswers(#[from] InvalidTemplateAnswers),

    #[error("malformed device response: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("status websocket transport failed")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

#[derive(Debug, Error)]
pub enum RtspError {
    #[error("rtsp transport failed")]
    Io(#[from] io::Error),

    #[error("rtsp request rejected: {code} {reason}")]
    Status { code: u16, reason: String },

    #[error("malformed rtsp response: {0}")]
    Malformed(String),

    #[error("malformed sdp: {0}")]
    Sdp(String),

    #[error("no media with encoding {encoding} in sdp")]
    MissingMedia { encoding: String },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("rtp packet too short or malformed ({len} bytes)")]
    Rtp { len: usize },

    #[error("rtcp packet too short or malformed ({len} bytes)")]
    Rtcp { len: usize },

    #[error("gaze payload of unsupported size ({len} bytes)")]
    GazePayload { len: usize },

    #[error("eye event payload malformed ({len} bytes)")]
    EyeEventPayload { len: usize },

    #[error("unknown eye event type {event_type}")]
    EyeEventType { event_type: u8 },

    #[error("imu payload of unsupported size ({len} bytes)")]
    ImuPayload { len: usize },

    #[error("nal reassembly failed: {reason}")]
    NalReassembly { reason: String },
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("no sample within deadline")]
    Timeout,

    #[error("stream ended")]
    Ended,

    #[error("sensor {sensor:?} not present or not connected")]
    SensorUnavailable { sensor: SensorKind },
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration blob of {len} bytes, expected {expected}")]
    UnexpectedSize { len: usize, expected: usize },

    #[error("calibration blob crc mismatch")]
    CrcMismatch,
}
