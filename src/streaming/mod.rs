pub mod clock;
pub mod eye_events;
pub mod gaze;
pub mod imu;
pub mod rtp;
pub mod rtsp;
pub mod sdp;
pub mod session;
pub mod video;

use crate::error::DecodeError;
use rtp::RtpPacket;

pub const ENCODING_H264: &str = "H264";
pub const ENCODING_GAZE: &str = "com.pupillabs.gaze1";
pub const ENCODING_IMU: &str = "com.pupillabs.imu1";
pub const ENCODING_EYE_EVENTS: &str = "com.pupillabs.eventlist1";

/// Sample tagged with its media timestamp and the reconstructed device wall
/// clock. The wall clock is `None` until the first sender report arrived
/// and the grace window expired.
#[derive(Clone, PartialEq, Debug)]
pub struct Timestamped<T> {
    pub rtp_timestamp: u32,
    pub wall_clock_ns: Option<i64>,
    pub inner: T,
}

/// Payload decoder of one media encoding.
///
/// The rtp layer is payload agnostic, each encoding consumes raw packets
/// and yields zero or more samples, each keyed by the rtp timestamp it
/// belongs to (an access unit spans multiple packets of one timestamp).
pub trait Depacketizer: Send {
    type Sample: Send + 'static;

    /// Hook called once per session with the negotiated sdp media, before
    /// any packet is delivered.
    fn media_handle(
        &mut self,
        _media: &sdp::SdpMedia,
    ) {
    }

    fn depacketize(
        &mut self,
        packet: &RtpPacket,
    ) -> Result<Vec<(u32, Self::Sample)>, DecodeError>;
}
