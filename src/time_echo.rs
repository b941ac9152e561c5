//! Clock offset estimation against the device time echo service.
//!
//! The service is a UDP echo: the client sends its current wall clock as an
//! 8 byte big endian integer, the device answers with its own clock sampled
//! on arrival. Half the round trip approximates the one way delay, the rest
//! of the difference is clock offset.

use crate::error::TimeEchoError;
use std::{
    io,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tokio::{net::UdpSocket, time};

pub const DEFAULT_ROUNDS: usize = 100;
pub const DEFAULT_ROUND_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn unix_time_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as i64
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimeEchoRound {
    pub offset_ns: i64,
    pub rtt_ns: i64,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct TimeEchoEstimate {
    pub mean_offset_ns: i64,
    pub mean_rtt_ns: i64,
    pub rounds: Vec<TimeEchoRound>,
}

/// Runs `rounds` echo exchanges against `host:port` and averages the
/// per-round estimates.
///
/// `time_echo_port` is the port advertised by the phone component, `None`
/// means the device firmware predates the protocol.
pub async fn estimate_offset(
    host: &str,
    time_echo_port: Option<u16>,
    rounds: usize,
    round_timeout: Duration,
) -> Result<TimeEchoEstimate, TimeEchoError> {
    let port = time_echo_port.ok_or(TimeEchoError::ProtocolNotSupported)?;

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect((host, port)).await?;

    let mut samples = Vec::<TimeEchoRound>::with_capacity(rounds);
    let mut response = [0u8; 8];

    for round in 0..rounds {
        let t0 = unix_time_ns();
        socket.send(&t0.to_be_bytes()).await?;

        let received = time::timeout(round_timeout, socket.recv(&mut response))
            .await
            .map_err(|_| TimeEchoError::Timeout { round })??;
        let t1 = unix_time_ns();

        if received != 8 {
            return Err(TimeEchoError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("echo response of {received} bytes, expected 8"),
            )));
        }
        let t_device = i64::from_be_bytes(response);

        let rtt_ns = t1 - t0;
        let offset_ns = t_device - (t0 + rtt_ns / 2);
        samples.push(TimeEchoRound { offset_ns, rtt_ns });
    }

    let count = samples.len().max(1) as i64;
    let mean_offset_ns = samples.iter().map(|round| round.offset_ns).sum::<i64>() / count;
    let mean_rtt_ns = samples.iter().map(|round| round.rtt_ns).sum::<i64>() / count;

    Ok(TimeEchoEstimate {
        mean_offset_ns,
        mean_rtt_ns,
        rounds: samples,
    })
}
