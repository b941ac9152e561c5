//! Eye event payload decoding (`com.pupillabs.eventlist1`).
//!
//! One event per rtp packet: a one byte type switch followed by a fixed
//! field set in network byte order.

use super::{rtp::RtpPacket, Depacketizer};
use crate::error::DecodeError;
use bytes::{Buf, BufMut};

const EVENT_TYPE_SACCADE_END: u8 = 0;
const EVENT_TYPE_FIXATION_END: u8 = 1;
const EVENT_TYPE_SACCADE_ONSET: u8 = 2;
const EVENT_TYPE_FIXATION_ONSET: u8 = 3;
const EVENT_TYPE_BLINK: u8 = 4;

const ONSET_SIZE: usize = 1 + 8;
const SUMMARY_SIZE: usize = 1 + 2 * 8 + 10 * 4;
const BLINK_SIZE: usize = 1 + 2 * 8;

/// Full statistics of a finished fixation or saccade.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct GazeEventSummary {
    pub start_time_ns: i64,
    pub end_time_ns: i64,
    pub start_gaze: [f32; 2],
    pub end_gaze: [f32; 2],
    pub mean_gaze: [f32; 2],
    pub amplitude_pixels: f32,
    pub amplitude_angle_deg: f32,
    pub mean_velocity: f32,
    pub max_velocity: f32,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum EyeEvent {
    SaccadeEnd(GazeEventSummary),
    FixationEnd(GazeEventSummary),
    SaccadeOnset { start_time_ns: i64 },
    FixationOnset { start_time_ns: i64 },
    Blink { start_time_ns: i64, end_time_ns: i64 },
}

fn summary_parse(buffer: &mut &[u8]) -> GazeEventSummary {
    GazeEventSummary {
        start_time_ns: buffer.get_i64(),
        end_time_ns: buffer.get_i64(),
        start_gaze: [buffer.get_f32(), buffer.get_f32()],
        end_gaze: [buffer.get_f32(), buffer.get_f32()],
        mean_gaze: [buffer.get_f32(), buffer.get_f32()],
        amplitude_pixels: buffer.get_f32(),
        amplitude_angle_deg: buffer.get_f32(),
        mean_velocity: buffer.get_f32(),
        max_velocity: buffer.get_f32(),
    }
}

pub fn eye_event_decode(payload: &[u8]) -> Result<EyeEvent, DecodeError> {
    if payload.is_empty() {
        return Err(DecodeError::EyeEventPayload { len: 0 });
    }

    let event_type = payload[0];
    let expected_size = match event_type {
        EVENT_TYPE_SACCADE_END | EVENT_TYPE_FIXATION_END => SUMMARY_SIZE,
        EVENT_TYPE_SACCADE_ONSET | EVENT_TYPE_FIXATION_ONSET => ONSET_SIZE,
        EVENT_TYPE_BLINK => BLINK_SIZE,
        event_type => return Err(DecodeError::EyeEventType { event_type }),
    };
    if payload.len() != expected_size {
        return Err(DecodeError::EyeEventPayload {
            len: payload.len(),
        });
    }

    let mut buffer = &payload[1..];
    let event = match event_type {
        EVENT_TYPE_SACCADE_END => EyeEvent::SaccadeEnd(summary_parse(&mut buffer)),
        EVENT_TYPE_FIXATION_END => EyeEvent::FixationEnd(summary_parse(&mut buffer)),
        EVENT_TYPE_SACCADE_ONSET => EyeEvent::SaccadeOnset {
            start_time_ns: buffer.get_i64(),
        },
        EVENT_TYPE_FIXATION_ONSET => EyeEvent::FixationOnset {
            start_time_ns: buffer.get_i64(),
        },
        EVENT_TYPE_BLINK => EyeEvent::Blink {
            start_time_ns: buffer.get_i64(),
            end_time_ns: buffer.get_i64(),
        },
        _ => unreachable!(),
    };

    Ok(event)
}

fn summary_encode(
    buffer: &mut Vec<u8>,
    summary: &GazeEventSummary,
) {
    buffer.put_i64(summary.start_time_ns);
    buffer.put_i64(summary.end_time_ns);
    for value in [
        summary.start_gaze[0],
        summary.start_gaze[1],
        summary.end_gaze[0],
        summary.end_gaze[1],
        summary.mean_gaze[0],
        summary.mean_gaze[1],
        summary.amplitude_pixels,
        summary.amplitude_angle_deg,
        summary.mean_velocity,
        summary.max_velocity,
    ] {
        buffer.put_f32(value);
    }
}

/// Counterpart of [`eye_event_decode`], used by simulators and tests.
pub fn eye_event_encode(event: &EyeEvent) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    match event {
        EyeEvent::SaccadeEnd(summary) => {
            buffer.put_u8(EVENT_TYPE_SACCADE_END);
            summary_encode(&mut buffer, summary);
        }
        EyeEvent::FixationEnd(summary) => {
            buffer.put_u8(EVENT_TYPE_FIXATION_END);
            summary_encode(&mut buffer, summary);
        }
        EyeEvent::SaccadeOnset { start_time_ns } => {
            buffer.put_u8(EVENT_TYPE_SACCADE_ONSET);
            buffer.put_i64(*start_time_ns);
        }
        EyeEvent::FixationOnset { start_time_ns } => {
            buffer.put_u8(EVENT_TYPE_FIXATION_ONSET);
            buffer.put_i64(*start_time_ns);
        }
        EyeEvent::Blink {
            start_time_ns,
            end_time_ns,
        } => {
            buffer.put_u8(EVENT_TYPE_BLINK);
            buffer.put_i64(*start_time_ns);
            buffer.put_i64(*end_time_ns);
        }
    }
    buffer
}

#[derive(Debug)]
pub struct EyeEventDepacketizer;
impl Depacketizer for EyeEventDepacketizer {
    type Sample = EyeEvent;

    fn depacketize(
        &mut self,
        packet: &RtpPacket,
    ) -> Result<Vec<(u32, Self::Sample)>, DecodeError> {
        let event = eye_event_decode(&packet.payload)?;
        Ok(vec![(packet.timestamp, event)])
    }
}

#[cfg(test)]
mod tests_eye_event_codec {
    use super::{eye_event_decode, eye_event_encode, EyeEvent, GazeEventSummary};
    use crate::error::DecodeError;

    fn summary() -> GazeEventSummary {
        GazeEventSummary {
            start_time_ns: 1_700_000_000_000_000_000,
            end_time_ns: 1_700_000_000_250_000_000,
            start_gaze: [100.5, 200.25],
            end_gaze: [300.75, 220.5],
            mean_gaze: [200.625, 210.375],
            amplitude_pixels: 202.5,
            amplitude_angle_deg: 9.25,
            mean_velocity: 810.0,
            max_velocity: 1500.5,
        }
    }

    #[test]
    fn fixation_end_roundtrip() {
        let event = EyeEvent::FixationEnd(summary());

        let wire = eye_event_encode(&event);

        assert_eq!(wire.len(), 57);
        assert_eq!(wire[0], 1);
        assert_eq!(eye_event_decode(&wire).unwrap(), event);
    }

    #[test]
    fn saccade_end_roundtrip() {
        let event = EyeEvent::SaccadeEnd(summary());

        let wire = eye_event_encode(&event);

        assert_eq!(wire[0], 0);
        assert_eq!(eye_event_decode(&wire).unwrap(), event);
    }

    #[test]
    fn onsets_roundtrip() {
        for event in [
            EyeEvent::SaccadeOnset {
                start_time_ns: 1_700_000_000_000_000_000,
            },
            EyeEvent::FixationOnset {
                start_time_ns: 1_700_000_000_100_000_000,
            },
        ] {
            let wire = eye_event_encode(&event);
            assert_eq!(wire.len(), 9);
            assert_eq!(eye_event_decode(&wire).unwrap(), event);
        }
    }

    #[test]
    fn blink_roundtrip() {
        let event = EyeEvent::Blink {
            start_time_ns: 1_700_000_000_000_000_000,
            end_time_ns: 1_700_000_000_150_000_000,
        };

        let wire = eye_event_encode(&event);

        assert_eq!(wire.len(), 17);
        assert_eq!(eye_event_decode(&wire).unwrap(), event);
    }

    #[test]
    fn unknown_event_type() {
        let error = eye_event_decode(&[9u8, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap_err();

        assert!(matches!(error, DecodeError::EyeEventType { event_type: 9 }));
    }

    #[test]
    fn truncated_payload() {
        let error = eye_event_decode(&[1u8, 0, 0]).unwrap_err();

        assert!(matches!(error, DecodeError::EyeEventPayload { len: 3 }));
    }
}
