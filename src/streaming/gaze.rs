//! Gaze payload decoding.
//!
//! Every rtp packet carries exactly one gaze datum in network byte order.
//! The payload length selects the variant; lengths carry a reserved tail
//! behind the defined fields which the decoder ignores.

use super::{rtp::RtpPacket, Depacketizer};
use crate::error::DecodeError;
use bytes::{Buf, BufMut};

const MINIMAL_SIZE: usize = 9;
const MINIMAL_TIMESTAMPED_SIZE: usize = 21;
const EYE_STATE_SIZE: usize = 77;
const EYE_STATE_EYELIDS_SIZE: usize = 121;
const DUAL_SIZE: usize = 18;

const WORN_TRUE: u8 = 255;

/// Gaze point in scene camera pixels plus the worn bit.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct GazePoint {
    pub x: f32,
    pub y: f32,
    pub worn: bool,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct EyeState {
    pub pupil_diameter_left_mm: f32,
    pub eyeball_center_left: [f32; 3],
    pub optical_axis_left: [f32; 3],
    pub pupil_diameter_right_mm: f32,
    pub eyeball_center_right: [f32; 3],
    pub optical_axis_right: [f32; 3],
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Eyelids {
    pub angle_top_left: f32,
    pub angle_bottom_left: f32,
    pub aperture_left_mm: f32,
    pub angle_top_right: f32,
    pub angle_bottom_right: f32,
    pub aperture_right_mm: f32,
}

#[derive(Clone, Copy, PartialEq, Debug)]
pub enum GazeSample {
    Minimal {
        point: GazePoint,
        timestamp_unix_seconds: Option<f64>,
    },
    EyeState {
        point: GazePoint,
        eye_state: EyeState,
        timestamp_unix_seconds: f64,
    },
    EyeStateWithEyelids {
        point: GazePoint,
        eye_state: EyeState,
        eyelids: Eyelids,
        timestamp_unix_seconds: f64,
    },
    /// Independent per-eye points, emitted by devices without a fused gaze
    /// estimate.
    Dual { left: GazePoint, right: GazePoint },
}
impl GazeSample {
    pub fn point(&self) -> GazePoint {
        match self {
            GazeSample::Minimal { point, .. } => *point,
            GazeSample::EyeState { point, .. } => *point,
            GazeSample::EyeStateWithEyelids { point, .. } => *point,
            GazeSample::Dual { left, right } => GazePoint {
                x: (left.x + right.x) / 2.0,
                y: (left.y + right.y) / 2.0,
                worn: left.worn && right.worn,
            },
        }
    }

    pub fn worn(&self) -> bool {
        self.point().worn
    }
}

fn point_parse(buffer: &mut &[u8]) -> GazePoint {
    GazePoint {
        x: buffer.get_f32(),
        y: buffer.get_f32(),
        worn: buffer.get_u8() != 0,
    }
}

fn values_parse<const N: usize>(buffer: &mut &[u8]) -> [f32; N] {
    let mut values = [0.0f32; N];
    for value in values.iter_mut() {
        *value = buffer.get_f32();
    }
    values
}

fn eye_state_parse(buffer: &mut &[u8]) -> EyeState {
    EyeState {
        pupil_diameter_left_mm: buffer.get_f32(),
        eyeball_center_left: values_parse(buffer),
        optical_axis_left: values_parse(buffer),
        pupil_diameter_right_mm: buffer.get_f32(),
        eyeball_center_right: values_parse(buffer),
        optical_axis_right: values_parse(buffer),
    }
}

fn eyelids_parse(buffer: &mut &[u8]) -> Eyelids {
    Eyelids {
        angle_top_left: buffer.get_f32(),
        angle_bottom_left: buffer.get_f32(),
        aperture_left_mm: buffer.get_f32(),
        angle_top_right: buffer.get_f32(),
        angle_bottom_right: buffer.get_f32(),
        aperture_right_mm: buffer.get_f32(),
    }
}

pub fn gaze_decode(payload: &[u8]) -> Result<GazeSample, DecodeError> {
    let mut buffer = payload;

    let sample = match payload.len() {
        MINIMAL_SIZE => GazeSample::Minimal {
            point: point_parse(&mut buffer),
            timestamp_unix_seconds: None,
        },
        MINIMAL_TIMESTAMPED_SIZE => GazeSample::Minimal {
            point: point_parse(&mut buffer),
            timestamp_unix_seconds: Some(buffer.get_f64()),
        },
        EYE_STATE_SIZE => GazeSample::EyeState {
            point: point_parse(&mut buffer),
            eye_state: eye_state_parse(&mut buffer),
            timestamp_unix_seconds: buffer.get_f64(),
        },
        EYE_STATE_EYELIDS_SIZE => GazeSample::EyeStateWithEyelids {
            point: point_parse(&mut buffer),
            eye_state: eye_state_parse(&mut buffer),
            timestamp_unix_seconds: buffer.get_f64(),
            eyelids: eyelids_parse(&mut buffer),
        },
        DUAL_SIZE => GazeSample::Dual {
            left: point_parse(&mut buffer),
            right: point_parse(&mut buffer),
        },
        len => return Err(DecodeError::GazePayload { len }),
    };

    Ok(sample)
}

fn point_encode(
    buffer: &mut Vec<u8>,
    point: &GazePoint,
) {
    buffer.put_f32(point.x);
    buffer.put_f32(point.y);
    buffer.put_u8(if point.worn { WORN_TRUE } else { 0 });
}

fn eye_state_encode(
    buffer: &mut Vec<u8>,
    eye_state: &EyeState,
) {
    buffer.put_f32(eye_state.pupil_diameter_left_mm);
    for value in eye_state
        .eyeball_center_left
        .iter()
        .chain(eye_state.optical_axis_left.iter())
    {
        buffer.put_f32(*value);
    }
    buffer.put_f32(eye_state.pupil_diameter_right_mm);
    for value in eye_state
        .eyeball_center_right
        .iter()
        .chain(eye_state.optical_axis_right.iter())
    {
        buffer.put_f32(*value);
    }
}

/// Encodes a sample to its wire form, zero-filling the reserved tail.
/// Counterpart of [`gaze_decode`], used by simulators and tests.
pub fn gaze_encode(sample: &GazeSample) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let wire_size = match sample {
        GazeSample::Minimal {
            point,
            timestamp_unix_seconds,
        } => {
            point_encode(&mut buffer, point);
            match timestamp_unix_seconds {
                Some(timestamp) => {
                    buffer.put_f64(*timestamp);
                    MINIMAL_TIMESTAMPED_SIZE
                }
                None => MINIMAL_SIZE,
            }
        }
        GazeSample::EyeState {
            point,
            eye_state,
            timestamp_unix_seconds,
        } => {
            point_encode(&mut buffer, point);
            eye_state_encode(&mut buffer, eye_state);
            buffer.put_f64(*timestamp_unix_seconds);
            EYE_STATE_SIZE
        }
        GazeSample::EyeStateWithEyelids {
            point,
            eye_state,
            eyelids,
            timestamp_unix_seconds,
        } => {
            point_encode(&mut buffer, point);
            eye_state_encode(&mut buffer, eye_state);
            buffer.put_f64(*timestamp_unix_seconds);
            buffer.put_f32(eyelids.angle_top_left);
            buffer.put_f32(eyelids.angle_bottom_left);
            buffer.put_f32(eyelids.aperture_left_mm);
            buffer.put_f32(eyelids.angle_top_right);
            buffer.put_f32(eyelids.angle_bottom_right);
            buffer.put_f32(eyelids.aperture_right_mm);
            EYE_STATE_EYELIDS_SIZE
        }
        GazeSample::Dual { left, right } => {
            point_encode(&mut buffer, left);
            point_encode(&mut buffer, right);
            DUAL_SIZE
        }
    };

    buffer.resize(wire_size, 0);
    buffer
}

#[derive(Debug)]
pub struct GazeDepacketizer;
impl Depacketizer for GazeDepacketizer {
    type Sample = GazeSample;

    fn depacketize(
        &mut self,
        packet: &RtpPacket,
    ) -> Result<Vec<(u32, Self::Sample)>, DecodeError> {
        let sample = gaze_decode(&packet.payload)?;
        Ok(vec![(packet.timestamp, sample)])
    }
}

#[cfg(test)]
mod tests_gaze_codec {
    use super::{gaze_decode, gaze_encode, EyeState, Eyelids, GazePoint, GazeSample};
    use crate::error::DecodeError;

    fn point() -> GazePoint {
        GazePoint {
            x: 816.25,
            y: 612.5,
            worn: true,
        }
    }

    fn eye_state() -> EyeState {
        EyeState {
            pupil_diameter_left_mm: 4.25,
            eyeball_center_left: [-29.0, 11.5, -47.0],
            optical_axis_left: [0.125, 0.25, 0.875],
            pupil_diameter_right_mm: 4.5,
            eyeball_center_right: [32.0, 11.25, -46.5],
            optical_axis_right: [-0.125, 0.25, 0.9375],
        }
    }

    #[test]
    fn minimal_roundtrip() {
        let sample = GazeSample::Minimal {
            point: point(),
            timestamp_unix_seconds: None,
        };

        let wire = gaze_encode(&sample);

        assert_eq!(wire.len(), 9);
        assert_eq!(gaze_decode(&wire).unwrap(), sample);
    }

    #[test]
    fn minimal_timestamped_roundtrip() {
        let sample = GazeSample::Minimal {
            point: point(),
            timestamp_unix_seconds: Some(1_700_000_000.25),
        };

        let wire = gaze_encode(&sample);

        assert_eq!(wire.len(), 21);
        assert_eq!(gaze_decode(&wire).unwrap(), sample);
    }

    #[test]
    fn eye_state_roundtrip() {
        let sample = GazeSample::EyeState {
            point: point(),
            eye_state: eye_state(),
            timestamp_unix_seconds: 1_700_000_000.5,
        };

        let wire = gaze_encode(&sample);

        assert_eq!(wire.len(), 77);
        assert_eq!(gaze_decode(&wire).unwrap(), sample);
    }

    #[test]
    fn eye_state_with_eyelids_roundtrip() {
        let sample = GazeSample::EyeStateWithEyelids {
            point: point(),
            eye_state: eye_state(),
            eyelids: Eyelids {
                angle_top_left: 0.5,
                angle_bottom_left: -0.75,
                aperture_left_mm: 10.5,
                angle_top_right: 0.5,
                angle_bottom_right: -0.625,
                aperture_right_mm: 10.25,
            },
            timestamp_unix_seconds: 1_700_000_000.75,
        };

        let wire = gaze_encode(&sample);

        assert_eq!(wire.len(), 121);
        assert_eq!(gaze_decode(&wire).unwrap(), sample);
    }

    #[test]
    fn dual_roundtrip() {
        let sample = GazeSample::Dual {
            left: GazePoint {
                x: 100.0,
                y: 200.0,
                worn: true,
            },
            right: GazePoint {
                x: 110.0,
                y: 210.0,
                worn: false,
            },
        };

        let wire = gaze_encode(&sample);

        assert_eq!(wire.len(), 18);
        assert_eq!(gaze_decode(&wire).unwrap(), sample);
    }

    #[test]
    fn bit_pattern_preserved() {
        let sample = GazeSample::Minimal {
            point: GazePoint {
                x: f32::from_bits(0x4049_0fdb), // pi
                y: f32::MIN_POSITIVE,
                worn: false,
            },
            timestamp_unix_seconds: Some(f64::from_bits(0x3ff0_0000_0000_0001)),
        };

        let decoded = gaze_decode(&gaze_encode(&sample)).unwrap();

        match (sample, decoded) {
            (
                GazeSample::Minimal {
                    point: original,
                    timestamp_unix_seconds: original_timestamp,
                },
                GazeSample::Minimal {
                    point: decoded,
                    timestamp_unix_seconds: decoded_timestamp,
                },
            ) => {
                assert_eq!(original.x.to_bits(), decoded.x.to_bits());
                assert_eq!(original.y.to_bits(), decoded.y.to_bits());
                assert_eq!(
                    original_timestamp.unwrap().to_bits(),
                    decoded_timestamp.unwrap().to_bits()
                );
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn unknown_size_rejected() {
        let error = gaze_decode(&[0u8; 33]).unwrap_err();

        assert!(matches!(error, DecodeError::GazePayload { len: 33 }));
    }

    #[test]
    fn worn_byte_values() {
        let mut wire = gaze_encode(&GazeSample::Minimal {
            point: point(),
            timestamp_unix_seconds: None,
        });
        assert_eq!(wire[8], 255);

        wire[8] = 0;
        assert!(!gaze_decode(&wire).unwrap().worn());
    }
}
