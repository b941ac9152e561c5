//! Media timestamp to wall clock conversion.
//!
//! Rtcp sender reports pair a 32 bit rtp timestamp with a 64 bit fixed
//! point ntp timestamp. From one such pair and the media clock rate every
//! subsequent rtp timestamp maps to nanoseconds since the unix epoch on the
//! device clock. The 32 bit timestamp wraps every ~13 hours at 90 kHz, so
//! both anchors and packets are tracked as 64 bit extended timestamps.

use super::rtp::SenderReport;

pub const NTP_UNIX_EPOCH_OFFSET_SECONDS: i64 = 2_208_988_800;

pub fn ntp_to_unix_ns(ntp_timestamp: u64) -> i64 {
    let seconds = (ntp_timestamp >> 32) as i64;
    let fraction = (ntp_timestamp & 0xffff_ffff) as i64;
    let fraction_ns = (fraction * 1_000_000_000) >> 32;

    (seconds - NTP_UNIX_EPOCH_OFFSET_SECONDS) * 1_000_000_000 + fraction_ns
}

#[derive(Debug)]
struct TimestampExtender {
    last: Option<u32>,
    cycles: u64,
}
impl TimestampExtender {
    fn new() -> Self {
        Self {
            last: None,
            cycles: 0,
        }
    }

    // a drop of more than half the range is a wrap, not reordering
    fn extend(
        &mut self,
        timestamp: u32,
    ) -> u64 {
        if let Some(last) = self.last {
            if last > timestamp && last - timestamp > (1 << 31) {
                self.cycles += 1;
            }
        }
        self.last = Some(timestamp);

        (self.cycles << 32) + timestamp as u64
    }
}

#[derive(Debug)]
pub struct WallClockMapper {
    clock_rate: u32,
    extender: TimestampExtender,
    offset_ns: Option<f64>,
}
impl WallClockMapper {
    pub fn new(clock_rate: u32) -> Self {
        let extender = TimestampExtender::new();

        Self {
            clock_rate,
            extender,
            offset_ns: None,
        }
    }

    pub fn has_reference(&self) -> bool {
        self.offset_ns.is_some()
    }

    pub fn sender_report_handle(
        &mut self,
        sender_report: &SenderReport,
    ) {
        let extended = self.extender.extend(sender_report.rtp_timestamp);
        let media_ns = extended as f64 * 1e9 / self.clock_rate as f64;

        self.offset_ns = Some(ntp_to_unix_ns(sender_report.ntp_timestamp) as f64 - media_ns);
    }

    /// Maps an rtp timestamp to the device wall clock, `None` until the
    /// first sender report arrived. Wrap tracking advances even without a
    /// reference.
    pub fn wall_clock_ns(
        &mut self,
        rtp_timestamp: u32,
    ) -> Option<i64> {
        let extended = self.extender.extend(rtp_timestamp);
        let offset_ns = self.offset_ns?;

        let wall_clock_ns = extended as f64 * 1e9 / self.clock_rate as f64 + offset_ns;
        Some(wall_clock_ns.round() as i64)
    }
}

#[cfg(test)]
mod tests_ntp_to_unix_ns {
    use super::{ntp_to_unix_ns, NTP_UNIX_EPOCH_OFFSET_SECONDS};

    #[test]
    fn epoch() {
        let ntp = (NTP_UNIX_EPOCH_OFFSET_SECONDS as u64) << 32;
        assert_eq!(ntp_to_unix_ns(ntp), 0);
    }

    #[test]
    fn half_second_fraction() {
        let ntp = ((NTP_UNIX_EPOCH_OFFSET_SECONDS as u64 + 1) << 32) | 0x8000_0000;
        assert_eq!(ntp_to_unix_ns(ntp), 1_500_000_000);
    }
}
