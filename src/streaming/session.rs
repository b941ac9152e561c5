//! Streaming session orchestration.
//!
//! One session drives one sensor url: rtsp negotiation, the udp rtp/rtcp
//! socket pair, periodic keepalives, wall clock anchoring from sender
//! reports and payload decoding. Samples are pushed into a bounded channel,
//! consumer backpressure propagates to the socket reads.
//!
//! Transport failures reopen the whole session up to a configured budget,
//! payload decode failures only drop the affected packet.

use super::{
    clock::WallClockMapper,
    rtp::{rtcp_sender_reports_parse, rtp_parse, RtpPacket},
    rtsp::RtspClient,
    sdp, Depacketizer, Timestamped,
};
use crate::error::RtspError;
use futures::{channel::mpsc, SinkExt};
use std::{collections::VecDeque, io, time::Duration};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const KEEPALIVE_MAX: Duration = Duration::from_secs(25);
const DATAGRAM_BUFFER_SIZE: usize = 65536;
const PRE_REFERENCE_DEPTH: usize = 128;
const BIND_ATTEMPTS: usize = 16;

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub url: String,
    pub encoding_name: String,
    /// Session reopen attempts after a transport failure.
    pub restart_budget: usize,
    pub restart_delay: Duration,
    /// How long samples wait for the first sender report before they flow
    /// without a wall clock.
    pub sender_report_grace: Duration,
}
impl SessionConfig {
    pub fn new(
        url: impl Into<String>,
        encoding_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            encoding_name: encoding_name.into(),
            restart_budget: 3,
            restart_delay: Duration::from_secs(1),
            sender_report_grace: Duration::from_secs(2),
        }
    }
}

enum RunEnd {
    Cancelled,
    ConsumerGone,
}

struct ConsumerGone;

async fn udp_pair_bind() -> Result<(UdpSocket, UdpSocket), io::Error> {
    for _ in 0..BIND_ATTEMPTS {
        let rtp_socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        let rtp_port = rtp_socket.local_addr()?.port();
        if rtp_port % 2 != 0 || rtp_port == u16::MAX {
            continue;
        }

        match UdpSocket::bind(("0.0.0.0", rtp_port + 1)).await {
            Ok(rtcp_socket) => return Ok((rtp_socket, rtcp_socket)),
            Err(_) => continue,
        }
    }

    Err(io::Error::new(
        io::ErrorKind::AddrInUse,
        "no free rtp/rtcp port pair",
    ))
}

pub struct Session<D: Depacketizer> {
    config: SessionConfig,
    depacketizer: D,
    sample_sender: mpsc::Sender<Timestamped<D::Sample>>,
}
impl<D: Depacketizer> Session<D> {
    pub fn new(
        config: SessionConfig,
        depacketizer: D,
        sample_sender: mpsc::Sender<Timestamped<D::Sample>>,
    ) -> Self {
        Self {
            config,
            depacketizer,
            sample_sender,
        }
    }

    async fn sample_emit(
        &mut self,
        rtp_timestamp: u32,
        inner: D::Sample,
        mapper: &mut WallClockMapper,
    ) -> Result<(), ConsumerGone> {
        let wall_clock_ns = mapper.wall_clock_ns(rtp_timestamp);
        let sample = Timestamped {
            rtp_timestamp,
            wall_clock_ns,
            inner,
        };

        self.sample_sender
            .send(sample)
            .await
            .map_err(|_| ConsumerGone)
    }

    async fn packet_process(
        &mut self,
        packet: RtpPacket,
        mapper: &mut WallClockMapper,
    ) -> Result<(), ConsumerGone> {
        let samples = match self.depacketizer.depacketize(&packet) {
            Ok(samples) => samples,
            Err(error) => {
                log::warn!("{}: dropping payload: {error}", self.config.url);
                return Ok(());
            }
        };

        for (rtp_timestamp, inner) in samples {
            self.sample_emit(rtp_timestamp, inner, mapper).await?;
        }
        Ok(())
    }

    async fn pre_reference_flush(
        &mut self,
        pre_reference: &mut VecDeque<RtpPacket>,
        mapper: &mut WallClockMapper,
    ) -> Result<(), ConsumerGone> {
        while let Some(packet) = pre_reference.pop_front() {
            self.packet_process(packet, mapper).await?;
        }
        Ok(())
    }

    async fn run_once(
        &mut self,
        exit: &CancellationToken,
    ) -> Result<RunEnd, RtspError> {
        let mut rtsp = RtspClient::connect(&self.config.url).await?;
        rtsp.options().await?;

        let sdp_text = rtsp.describe().await?;
        let medias = sdp::sdp_parse(&sdp_text)?;
        let media = sdp::media_find(&medias, &self.config.encoding_name)
            .ok_or_else(|| RtspError::MissingMedia {
                encoding: self.config.encoding_name.clone(),
            })?
            .clone();
        self.depacketizer.media_handle(&media);

        let (rtp_socket, rtcp_socket) = udp_pair_bind().await?;
        let rtp_port = rtp_socket.local_addr()?.port();
        let rtcp_port = rtcp_socket.local_addr()?.port();

        let control_url = rtsp.control_url(media.control.as_deref());
        let setup = rtsp.setup(&control_url, rtp_port, rtcp_port).await?;
        rtsp.play().await?;

        let keepalive_period = (setup.session_timeout * 2 / 3).min(KEEPALIVE_MAX);
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_period,
            keepalive_period,
        );

        let mut mapper = WallClockMapper::new(media.clock_rate);
        let grace_deadline = tokio::time::Instant::now() + self.config.sender_report_grace;
        let mut grace_expired = false;
        let mut pre_reference = VecDeque::<RtpPacket>::new();
        let mut last_sequence_number: Option<u16> = None;

        let mut rtp_buffer = vec![0u8; DATAGRAM_BUFFER_SIZE];
        let mut rtcp_buffer = vec![0u8; DATAGRAM_BUFFER_SIZE];

        loop {
            tokio::select! {
                () = exit.cancelled() => {
                    let _ = rtsp.teardown().await;
                    return Ok(RunEnd::Cancelled);
                }
                result = rtp_socket.recv_from(&mut rtp_buffer) => {
                    let (received, _) = result?;
                    let packet = match rtp_parse(&rtp_buffer[..received]) {
                        Ok(packet) => packet,
                        Err(error) => {
                            log::warn!("{}: dropping malformed rtp packet: {error}", self.config.url);
                            continue;
                        }
                    };

                    // strictly monotone delivery: late packets are dropped,
                    // gaps are reported but never reordered
                    if let Some(last) = last_sequence_number {
                        let delta = packet.sequence_number.wrapping_sub(last) as i16;
                        if delta <= 0 {
                            log::debug!(
                                "{}: dropping late packet {} (last {})",
                                self.config.url, packet.sequence_number, last
                            );
                            continue;
                        }
                        if delta > 1 {
                            log::warn!(
                                "{}: sequence gap of {} packets",
                                self.config.url,
                                delta - 1
                            );
                        }
                    }
                    last_sequence_number = Some(packet.sequence_number);

                    if !mapper.has_reference() && !grace_expired {
                        // hold samples until the clock anchor exists
                        if pre_reference.len() >= PRE_REFERENCE_DEPTH {
                            pre_reference.pop_front();
                        }
                        pre_reference.push_back(packet);
                        continue;
                    }

                    if self.packet_process(packet, &mut mapper).await.is_err() {
                        let _ = rtsp.teardown().await;
                        return Ok(RunEnd::ConsumerGone);
                    }
                }
                result = rtcp_socket.recv_from(&mut rtcp_buffer) => {
                    let (received, _) = result?;
                    let had_reference = mapper.has_reference();
                    match rtcp_sender_reports_parse(&rtcp_buffer[..received]) {
                        Ok(reports) => {
                            for report in reports {
                                mapper.sender_report_handle(&report);
                            }
                        }
                        Err(error) => {
                            log::warn!("{}: dropping malformed rtcp packet: {error}", self.config.url);
                        }
                    }

                    if !had_reference
                        && mapper.has_reference()
                        && self
                            .pre_reference_flush(&mut pre_reference, &mut mapper)
                            .await
                            .is_err()
                    {
                        let _ = rtsp.teardown().await;
                        return Ok(RunEnd::ConsumerGone);
                    }
                }
                _ = keepalive.tick() => {
                    rtsp.get_parameter().await?;
                }
                () = tokio::time::sleep_until(grace_deadline), if !grace_expired && !mapper.has_reference() => {
                    grace_expired = true;
                    log::warn!(
                        "{}: no sender report within grace window, samples will carry no wall clock",
                        self.config.url
                    );
                    if self
                        .pre_reference_flush(&mut pre_reference, &mut mapper)
                        .await
                        .is_err()
                    {
                        let _ = rtsp.teardown().await;
                        return Ok(RunEnd::ConsumerGone);
                    }
                }
            }
        }
    }

    /// Runs the session until cancelled or the consumer goes away,
    /// reopening on transport failures until the restart budget is spent.
    pub async fn run(
        mut self,
        exit: CancellationToken,
    ) -> Result<(), RtspError> {
        let mut attempts_left = self.config.restart_budget;

        loop {
            let error = match self.run_once(&exit).await {
                Ok(RunEnd::Cancelled) => return Ok(()),
                Ok(RunEnd::ConsumerGone) => return Ok(()),
                Err(error) => error,
            };
            if exit.is_cancelled() {
                return Ok(());
            }

            if attempts_left == 0 {
                log::error!("{}: streaming failed: {error:?}", self.config.url);
                return Err(error);
            }
            attempts_left -= 1;
            log::warn!("{}: streaming failed, reopening: {error:?}", self.config.url);

            tokio::select! {
                () = exit.cancelled() => return Ok(()),
                () = tokio::time::sleep(self.config.restart_delay) => {}
            }
        }
    }
}
