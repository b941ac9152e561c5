//! Imu payload decoding (`com.pupillabs.imu1`).
//!
//! Fixed size big endian record: acceleration, rotation rate, orientation
//! quaternion, die temperature and the device timestamp. Older firmware
//! omits the temperature and timestamp tail, those samples fall back to
//! the rtp clock for timing.

use super::{rtp::RtpPacket, Depacketizer};
use crate::error::DecodeError;
use bytes::{Buf, BufMut};

const FULL_SIZE: usize = 10 * 4 + 4 + 8;
const BARE_SIZE: usize = 10 * 4;

#[derive(Clone, Copy, PartialEq, Debug)]
pub struct ImuSample {
    pub accel_g: [f32; 3],
    pub gyro_deg_per_s: [f32; 3],
    /// Orientation as w, x, y, z.
    pub quaternion: [f32; 4],
    pub temperature_celsius: Option<f32>,
    /// Device clock, `None` for the short record (the session tags the
    /// sample with the rtp derived wall clock instead).
    pub timestamp_unix_ns: Option<i64>,
}

fn values_parse<const N: usize>(buffer: &mut &[u8]) -> [f32; N] {
    let mut values = [0.0f32; N];
    for value in values.iter_mut() {
        *value = buffer.get_f32();
    }
    values
}

pub fn imu_decode(payload: &[u8]) -> Result<ImuSample, DecodeError> {
    match payload.len() {
        FULL_SIZE | BARE_SIZE => {}
        len => return Err(DecodeError::ImuPayload { len }),
    }

    let mut buffer = payload;
    let accel_g = values_parse(&mut buffer);
    let gyro_deg_per_s = values_parse(&mut buffer);
    let quaternion = values_parse(&mut buffer);

    let (temperature_celsius, timestamp_unix_ns) = if payload.len() == FULL_SIZE {
        let temperature_celsius = buffer.get_f32();
        let timestamp_unix_seconds = buffer.get_f64();
        (
            Some(temperature_celsius),
            Some((timestamp_unix_seconds * 1e9) as i64),
        )
    } else {
        (None, None)
    };

    Ok(ImuSample {
        accel_g,
        gyro_deg_per_s,
        quaternion,
        temperature_celsius,
        timestamp_unix_ns,
    })
}

/// Counterpart of [`imu_decode`], used by simulators and tests.
pub fn imu_encode(sample: &ImuSample) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    for value in sample
        .accel_g
        .iter()
        .chain(sample.gyro_deg_per_s.iter())
        .chain(sample.quaternion.iter())
    {
        buffer.put_f32(*value);
    }

    if let (Some(temperature_celsius), Some(timestamp_unix_ns)) =
        (sample.temperature_celsius, sample.timestamp_unix_ns)
    {
        buffer.put_f32(temperature_celsius);
        buffer.put_f64(timestamp_unix_ns as f64 / 1e9);
    }

    buffer
}

#[derive(Debug)]
pub struct ImuDepacketizer;
impl Depacketizer for ImuDepacketizer {
    type Sample = ImuSample;

    fn depacketize(
        &mut self,
        packet: &RtpPacket,
    ) -> Result<Vec<(u32, Self::Sample)>, DecodeError> {
        let sample = imu_decode(&packet.payload)?;
        Ok(vec![(packet.timestamp, sample)])
    }
}

#[cfg(test)]
mod tests_imu_codec {
    use super::{imu_decode, imu_encode, ImuSample};
    use crate::error::DecodeError;
    use approx::assert_relative_eq;

    fn sample() -> ImuSample {
        ImuSample {
            accel_g: [0.0, 0.0, 1.0],
            gyro_deg_per_s: [0.5, -0.25, 0.125],
            quaternion: [1.0, 0.0, 0.0, 0.0],
            temperature_celsius: Some(36.5),
            timestamp_unix_ns: Some(1_700_000_000_500_000_000),
        }
    }

    #[test]
    fn full_record_roundtrip() {
        let sample = sample();

        let wire = imu_encode(&sample);

        assert_eq!(wire.len(), 52);
        let decoded = imu_decode(&wire).unwrap();
        assert_eq!(decoded.accel_g, sample.accel_g);
        assert_eq!(decoded.gyro_deg_per_s, sample.gyro_deg_per_s);
        assert_eq!(decoded.quaternion, sample.quaternion);
        assert_eq!(decoded.temperature_celsius, sample.temperature_celsius);
        // timestamp passes through an f64 of seconds, good to ~100 ns here
        assert_relative_eq!(
            decoded.timestamp_unix_ns.unwrap() as f64,
            sample.timestamp_unix_ns.unwrap() as f64,
            max_relative = 1e-9
        );
    }

    #[test]
    fn bare_record() {
        let sample = ImuSample {
            temperature_celsius: None,
            timestamp_unix_ns: None,
            ..sample()
        };

        let wire = imu_encode(&sample);

        assert_eq!(wire.len(), 40);
        assert_eq!(imu_decode(&wire).unwrap(), sample);
    }

    #[test]
    fn unsupported_size() {
        let error = imu_decode(&[0u8; 44]).unwrap_err();

        assert!(matches!(error, DecodeError::ImuPayload { len: 44 }));
    }
}
