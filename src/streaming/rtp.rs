use crate::error::DecodeError;
use bytes::Bytes;

const RTP_VERSION: u8 = 2;
const RTP_HEADER_SIZE: usize = 12;
const RTCP_SENDER_REPORT: u8 = 200;

#[derive(Clone, PartialEq, Debug)]
pub struct RtpPacket {
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub marker: bool,
    pub payload: Bytes,
}

pub fn rtp_parse(datagram: &[u8]) -> Result<RtpPacket, DecodeError> {
    let malformed = || DecodeError::Rtp {
        len: datagram.len(),
    };

    if datagram.len() < RTP_HEADER_SIZE {
        return Err(malformed());
    }

    let byte0 = datagram[0];
    if byte0 >> 6 != RTP_VERSION {
        return Err(malformed());
    }
    let padding = byte0 & 0x20 != 0;
    let extension = byte0 & 0x10 != 0;
    let csrc_count = (byte0 & 0x0f) as usize;

    let byte1 = datagram[1];
    let marker = byte1 & 0x80 != 0;
    let payload_type = byte1 & 0x7f;

    let sequence_number = u16::from_be_bytes(datagram[2..4].try_into().unwrap());
    let timestamp = u32::from_be_bytes(datagram[4..8].try_into().unwrap());
    let ssrc = u32::from_be_bytes(datagram[8..12].try_into().unwrap());

    let mut offset = RTP_HEADER_SIZE + csrc_count * 4;
    if datagram.len() < offset {
        return Err(malformed());
    }

    if extension {
        if datagram.len() < offset + 4 {
            return Err(malformed());
        }
        let extension_words =
            u16::from_be_bytes(datagram[offset + 2..offset + 4].try_into().unwrap()) as usize;
        offset += 4 + extension_words * 4;
        if datagram.len() < offset {
            return Err(malformed());
        }
    }

    let mut end = datagram.len();
    if padding {
        let padding_len = *datagram.last().unwrap() as usize;
        if padding_len == 0 || offset + padding_len > end {
            return Err(malformed());
        }
        end -= padding_len;
    }

    Ok(RtpPacket {
        payload_type,
        sequence_number,
        timestamp,
        ssrc,
        marker,
        payload: Bytes::copy_from_slice(&datagram[offset..end]),
    })
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SenderReport {
    pub ssrc: u32,
    /// 64 bit fixed point ntp timestamp (seconds since 1900 in the high
    /// word, fraction in the low word).
    pub ntp_timestamp: u64,
    pub rtp_timestamp: u32,
}

/// Extracts sender reports from a (possibly compound) rtcp datagram,
/// skipping receiver reports, sdes and other packet types.
pub fn rtcp_sender_reports_parse(datagram: &[u8]) -> Result<Vec<SenderReport>, DecodeError> {
    let malformed = || DecodeError::Rtcp {
        len: datagram.len(),
    };

    let mut reports = Vec::<SenderReport>::new();

    let mut rest = datagram;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(malformed());
        }

        if rest[0] >> 6 != RTP_VERSION {
            return Err(malformed());
        }
        let packet_type = rest[1];
        let length_words = u16::from_be_bytes(rest[2..4].try_into().unwrap()) as usize;
        let packet_len = (length_words + 1) * 4;
        if rest.len() < packet_len {
            return Err(malformed());
        }

        if packet_type == RTCP_SENDER_REPORT {
            if packet_len < 20 {
                return Err(malformed());
            }
            let ssrc = u32::from_be_bytes(rest[4..8].try_into().unwrap());
            let ntp_timestamp = u64::from_be_bytes(rest[8..16].try_into().unwrap());
            let rtp_timestamp = u32::from_be_bytes(rest[16..20].try_into().unwrap());
            reports.push(SenderReport {
                ssrc,
                ntp_timestamp,
                rtp_timestamp,
            });
        }

        rest = &rest[packet_len..];
    }

    Ok(reports)
}

#[cfg(test)]
pub(crate) mod tests_helpers {
    use bytes::{BufMut, BytesMut};

    pub fn rtp_build(
        payload_type: u8,
        sequence_number: u16,
        timestamp: u32,
        marker: bool,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut datagram = BytesMut::new();
        datagram.put_u8(0x80);
        datagram.put_u8((marker as u8) << 7 | payload_type);
        datagram.put_u16(sequence_number);
        datagram.put_u32(timestamp);
        datagram.put_u32(0x1234_5678);
        datagram.put_slice(payload);
        datagram.to_vec()
    }

    pub fn sender_report_build(
        ssrc: u32,
        ntp_timestamp: u64,
        rtp_timestamp: u32,
    ) -> Vec<u8> {
        let mut datagram = BytesMut::new();
        datagram.put_u8(0x80);
        datagram.put_u8(200);
        datagram.put_u16(6); // 28 bytes total
        datagram.put_u32(ssrc);
        datagram.put_u64(ntp_timestamp);
        datagram.put_u32(rtp_timestamp);
        datagram.put_u32(0); // packet count
        datagram.put_u32(0); // octet count
        datagram.to_vec()
    }
}


#[cfg(test)]
mod tests_rtcp_parse {
    use super::{rtcp_sender_reports_parse, tests_helpers::sender_report_build};

    #[test]
    fn single_sender_report() {
        let datagram = sender_report_build(0xdead_beef, 0x1122_3344_5566_7788, 90_000);

        let reports = rtcp_sender_reports_parse(&datagram).unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].ssrc, 0xdead_beef);
        assert_eq!(reports[0].ntp_timestamp, 0x1122_3344_5566_7788);
        assert_eq!(reports[0].rtp_timestamp, 90_000);
    }

    #[test]
    fn compound_with_sdes() {
        let mut datagram = sender_report_build(1, 2, 3);
        // empty sdes packet behind the sender report
        datagram.extend_from_slice(&[0x81, 202, 0x00, 0x01, 0, 0, 0, 1]);

        let reports = rtcp_sender_reports_parse(&datagram).unwrap();

        assert_eq!(reports.len(), 1);
    }

    #[test]
    fn truncated_compound() {
        let mut datagram = sender_report_build(1, 2, 3);
        datagram.extend_from_slice(&[0x81, 202, 0x00, 0x10, 0, 0]);

        assert!(rtcp_sender_reports_parse(&datagram).is_err());
    }
}
