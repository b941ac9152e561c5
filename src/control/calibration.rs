//! Camera calibration blob as served by `GET /api/calibration`.
//!
//! The blob is a fixed layout of little endian values: a version tag,
//! intrinsics/distortion/extrinsics for the scene camera and both eye
//! cameras, and a trailing CRC-32 over everything before it.

use crate::error::CalibrationError;
use bytes::Buf;
use crc::{Crc, CRC_32_ISO_HDLC};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const CAMERA_VALUES: usize = 9 + 8 + 9 + 3;
const BLOB_SIZE: usize = 4 + 3 * CAMERA_VALUES * 8 + 4;

#[derive(Clone, PartialEq, Debug)]
pub struct CameraCalibration {
    pub camera_matrix: [f64; 9],
    pub distortion_coefficients: [f64; 8],
    pub rotation: [f64; 9],
    pub translation: [f64; 3],
}

#[derive(Clone, PartialEq, Debug)]
pub struct Calibration {
    pub version: u32,
    pub scene_camera: CameraCalibration,
    pub left_eye_camera: CameraCalibration,
    pub right_eye_camera: CameraCalibration,
}

fn camera_parse(buffer: &mut &[u8]) -> CameraCalibration {
    fn values<const N: usize>(buffer: &mut &[u8]) -> [f64; N] {
        let mut values = [0.0f64; N];
        for value in values.iter_mut() {
            *value = buffer.get_f64_le();
        }
        values
    }

    CameraCalibration {
        camera_matrix: values(buffer),
        distortion_coefficients: values(buffer),
        rotation: values(buffer),
        translation: values(buffer),
    }
}

pub fn parse(blob: &[u8]) -> Result<Calibration, CalibrationError> {
    if blob.len() != BLOB_SIZE {
        return Err(CalibrationError::UnexpectedSize {
            len: blob.len(),
            expected: BLOB_SIZE,
        });
    }

    let (payload, trailer) = blob.split_at(blob.len() - 4);
    let crc_stored = u32::from_le_bytes(trailer.try_into().unwrap());
    if CRC32.checksum(payload) != crc_stored {
        return Err(CalibrationError::CrcMismatch);
    }

    let mut buffer = payload;
    let version = buffer.get_u32_le();
    let scene_camera = camera_parse(&mut buffer);
    let left_eye_camera = camera_parse(&mut buffer);
    let right_eye_camera = camera_parse(&mut buffer);

    Ok(Calibration {
        version,
        scene_camera,
        left_eye_camera,
        right_eye_camera,
    })
}
