//! H.264 depacketization per the rfc 6184 subset the device emits: single
//! nal unit packets, FU-A fragmentation and STAP-A aggregation.
//!
//! Packets sharing an rtp timestamp form one access unit, the marker bit
//! closes it. A sequence gap inside an access unit drops the whole unit,
//! the next timestamp starts fresh. The sdp parameter sets are emitted as
//! their own access unit ahead of the first frame so a downstream decoder
//! can initialize without waiting for in-band sps/pps.

use super::{rtp::RtpPacket, sdp::SdpMedia, Depacketizer};
use crate::error::DecodeError;
use bytes::{BufMut, Bytes, BytesMut};

const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

#[derive(Clone, PartialEq, Debug)]
pub struct AccessUnit {
    pub nal_units: Vec<Bytes>,
}

#[derive(Debug)]
struct FragmentAssembly {
    nal_header: u8,
    data: BytesMut,
}

#[derive(Debug)]
struct AuAssembly {
    rtp_timestamp: u32,
    last_sequence_number: u16,
    nal_units: Vec<Bytes>,
    fragment: Option<FragmentAssembly>,
}

#[derive(Debug)]
pub struct VideoDepacketizer {
    parameter_sets: Option<Vec<Bytes>>,
    parameter_sets_emitted: bool,
    assembling: Option<AuAssembly>,
    drop_rtp_timestamp: Option<u32>,
}
impl VideoDepacketizer {
    pub fn new() -> Self {
        Self {
            parameter_sets: None,
            parameter_sets_emitted: false,
            assembling: None,
            drop_rtp_timestamp: None,
        }
    }

    pub fn with_parameter_sets(parameter_sets: Vec<Vec<u8>>) -> Self {
        let mut depacketizer = Self::new();
        depacketizer.parameter_sets_set(parameter_sets);
        depacketizer
    }

    fn parameter_sets_set(
        &mut self,
        parameter_sets: Vec<Vec<u8>>,
    ) {
        if self.parameter_sets_emitted || parameter_sets.is_empty() {
            return;
        }
        self.parameter_sets = Some(parameter_sets.into_iter().map(Bytes::from).collect());
    }

    fn abandon(
        &mut self,
        rtp_timestamp: u32,
        reason: String,
    ) -> DecodeError {
        self.assembling = None;
        self.drop_rtp_timestamp = Some(rtp_timestamp);

        DecodeError::NalReassembly { reason }
    }

    fn nal_units_handle(
        assembly: &mut AuAssembly,
        payload: &[u8],
    ) -> Result<(), String> {
        if payload.is_empty() {
            return Err("empty payload".to_owned());
        }

        let nal_type = payload[0] & 0x1f;
        match nal_type {
            1..=23 => {
                if assembly.fragment.is_some() {
                    return Err("single nal unit while fragment in progress".to_owned());
                }
                assembly.nal_units.push(Bytes::copy_from_slice(payload));
            }
            NAL_TYPE_STAP_A => {
                if assembly.fragment.is_some() {
                    return Err("aggregation packet while fragment in progress".to_owned());
                }

                let mut rest = &payload[1..];
                while !rest.is_empty() {
                    if rest.len() < 2 {
                        return Err("truncated stap-a size".to_owned());
                    }
                    let size = u16::from_be_bytes(rest[..2].try_into().unwrap()) as usize;
                    rest = &rest[2..];
                    if rest.len() < size || size == 0 {
                        return Err(format!("stap-a unit of {size} bytes overruns payload"));
                    }
                    assembly
                        .nal_units
                        .push(Bytes::copy_from_slice(&rest[..size]));
                    rest = &rest[size..];
                }
            }
            NAL_TYPE_FU_A => {
                if payload.len() < 2 {
                    return Err("truncated fu-a header".to_owned());
                }
                let indicator = payload[0];
                let fu_header = payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;

                if start {
                    if assembly.fragment.is_some() {
                        return Err("fu-a start while fragment in progress".to_owned());
                    }
                    // original nal header is nri from the indicator plus the
                    // fragmented type
                    let nal_header = (indicator & 0xe0) | (fu_header & 0x1f);
                    let mut data = BytesMut::new();
                    data.put_slice(&payload[2..]);
                    assembly.fragment = Some(FragmentAssembly { nal_header, data });
                } else {
                    let fragment = assembly
                        .fragment
                        .as_mut()
                        .ok_or_else(|| "fu-a continuation without start".to_owned())?;
                    fragment.data.put_slice(&payload[2..]);
                }

                if end {
                    let fragment = assembly.fragment.take().unwrap();
                    let mut nal_unit = BytesMut::with_capacity(1 + fragment.data.len());
                    nal_unit.put_u8(fragment.nal_header);
                    nal_unit.put_slice(&fragment.data);
                    assembly.nal_units.push(nal_unit.freeze());
                }
            }
            nal_type => {
                return Err(format!("unsupported nal unit type {nal_type}"));
            }
        }

        Ok(())
    }

    fn complete(
        &mut self,
        output: &mut Vec<(u32, AccessUnit)>,
    ) {
        let assembly = match self.assembling.take() {
            Some(assembly) => assembly,
            None => return,
        };

        if assembly.fragment.is_some() {
            log::warn!(
                "access unit at rtp timestamp {} ended with incomplete fragment, dropping",
                assembly.rtp_timestamp
            );
            return;
        }
        if assembly.nal_units.is_empty() {
            return;
        }

        if !self.parameter_sets_emitted {
            self.parameter_sets_emitted = true;
            if let Some(parameter_sets) = self.parameter_sets.take() {
                output.push((
                    assembly.rtp_timestamp,
                    AccessUnit {
                        nal_units: parameter_sets,
                    },
                ));
            }
        }

        output.push((
            assembly.rtp_timestamp,
            AccessUnit {
                nal_units: assembly.nal_units,
            },
        ));
    }
}
impl Depacketizer for VideoDepacketizer {
    type Sample = AccessUnit;

    fn media_handle(
        &mut self,
        media: &SdpMedia,
    ) {
        self.parameter_sets_set(media.sprop_parameter_sets.clone());
    }

    fn depacketize(
        &mut self,
        packet: &RtpPacket,
    ) -> Result<Vec<(u32, Self::Sample)>, DecodeError> {
        let mut output = Vec::<(u32, AccessUnit)>::new();

        // remainder of an already dropped access unit
        if self.drop_rtp_timestamp == Some(packet.timestamp) {
            return Ok(output);
        }
        self.drop_rtp_timestamp = None;

        let continues_unit = self
            .assembling
            .as_ref()
            .map(|assembly| assembly.rtp_timestamp == packet.timestamp)
            .unwrap_or(false);

        if continues_unit {
            let expected = self
                .assembling
                .as_ref()
                .unwrap()
                .last_sequence_number
                .wrapping_add(1);
            if packet.sequence_number != expected {
                return Err(self.abandon(
                    packet.timestamp,
                    format!(
                        "sequence gap within access unit: expected {expected}, got {}",
                        packet.sequence_number
                    ),
                ));
            }
            self.assembling.as_mut().unwrap().last_sequence_number = packet.sequence_number;
        } else {
            if self.assembling.is_some() {
                // timestamp changed without a marker, flush what we have
                self.complete(&mut output);
            }
            self.assembling = Some(AuAssembly {
                rtp_timestamp: packet.timestamp,
                last_sequence_number: packet.sequence_number,
                nal_units: Vec::new(),
                fragment: None,
            });
        }

        let handled = Self::nal_units_handle(self.assembling.as_mut().unwrap(), &packet.payload);
        if let Err(reason) = handled {
            return Err(self.abandon(packet.timestamp, reason));
        }

        if packet.marker {
            let fragment_pending = self.assembling.as_ref().unwrap().fragment.is_some();
            if fragment_pending {
                return Err(self.abandon(
                    packet.timestamp,
                    "marker while fragment in progress".to_owned(),
                ));
            }
            self.complete(&mut output);
        }

        Ok(output)
    }
}
