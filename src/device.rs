//! Blocking convenience facade.
//!
//! Owns a background runtime with a single worker thread; every method is a
//! synchronous call that posts work to it and blocks on the completion. The
//! status mirror runs permanently, sensor streams open lazily on the first
//! `receive_*` call that needs them.

use crate::{
    control::{calibration::Calibration, Control, DeviceErrorEntry, Event},
    discovery::DiscoveredDevice,
    error::{ControlError, ReceiveError, TimeEchoError},
    matching::{Matched2, Matched3, Matcher2, Matcher3, MatcherConfig, Producer},
    notifier::Notifier,
    status::{
        template::{Template, TemplateAnswers},
        BatteryState, ConnectionKind, MemoryState, SensorKind, Status,
    },
    streaming::{
        eye_events::{EyeEvent, EyeEventDepacketizer},
        gaze::{GazeDepacketizer, GazeSample},
        imu::{ImuDepacketizer, ImuSample},
        session::{Session, SessionConfig},
        video::{AccessUnit, VideoDepacketizer},
        Depacketizer, Timestamped, ENCODING_EYE_EVENTS, ENCODING_GAZE, ENCODING_H264,
        ENCODING_IMU,
    },
    time_echo::{self, TimeEchoEstimate},
};
use futures::{channel::mpsc, StreamExt};
use http::uri::Authority;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SAMPLE_CHANNEL_DEPTH: usize = 64;
const MIRROR_RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub type MatchedSceneGaze = Matched2<AccessUnit, GazeSample>;
pub type MatchedSceneEyesGaze = Matched3<AccessUnit, AccessUnit, GazeSample>;

#[derive(Default)]
struct Streams {
    exit: Option<CancellationToken>,

    gaze: Option<mpsc::Receiver<Timestamped<GazeSample>>>,
    scene: Option<mpsc::Receiver<Timestamped<AccessUnit>>>,
    eyes: Option<mpsc::Receiver<Timestamped<AccessUnit>>>,
    imu: Option<mpsc::Receiver<Timestamped<ImuSample>>>,
    eye_events: Option<mpsc::Receiver<Timestamped<EyeEvent>>>,

    matched_scene_gaze: Option<Matcher2<AccessUnit, GazeSample>>,
    matched_scene_eyes_gaze: Option<Matcher3<AccessUnit, AccessUnit, GazeSample>>,
}

pub struct Device {
    runtime: tokio::runtime::Runtime,
    host: String,

    control: Arc<Control>,
    notifier: Arc<Notifier>,

    exit: CancellationToken,
    streams: Mutex<Streams>,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device").field("host", &self.host).finish_non_exhaustive()
    }
}
impl Device {
    pub fn connect(
        host: &str,
        port: u16,
    ) -> Result<Self, ControlError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("neon-realtime-worker")
            .enable_all()
            .build()
            .unwrap();

        let authority = format!("{host}:{port}")
            .parse::<Authority>()
            .map_err(|_| ControlError::Malformed(format!("invalid device address: {host}:{port}")))?;

        let control = Control::new(authority.clone());
        let control = Arc::new(control);

        let status = runtime.block_on(control.get_status())?;

        let notifier = Notifier::new(authority, status);
        let notifier = Arc::new(notifier);

        let exit = CancellationToken::new();

        // permanent status mirror with reconnect; a reconnect refetches the
        // full snapshot because deltas were missed while disconnected
        {
            let control = control.clone();
            let notifier = notifier.clone();
            let exit = exit.child_token();
            runtime.spawn(async move {
                loop {
                    match notifier.run(exit.clone()).await {
                        Ok(()) => {}
                        Err(error) => {
                            log::warn!("status feed failed: {error:?}");
                        }
                    }
                    if exit.is_cancelled() {
                        break;
                    }

                    tokio::select! {
                        () = exit.cancelled() => break,
                        () = tokio::time::sleep(MIRROR_RECONNECT_DELAY) => {}
                    }

                    match control.get_status().await {
                        Ok(status) => notifier.status_set(status),
                        Err(error) => {
                            log::warn!("status refetch after reconnect failed: {error:?}");
                        }
                    }
                }
            });
        }

        Ok(Self {
            runtime,
            host: host.to_owned(),

            control,
            notifier,

            exit,
            streams: Mutex::new(Streams::default()),
        })
    }

    pub fn from_discovered(device: &DiscoveredDevice) -> Result<Self, ControlError> {
        Self::connect(&device.address(), device.port)
    }

    /// Cancels all background work. Dropping the device does the same.
    pub fn close(self) {
        self.exit.cancel();
    }

    // cached status, no i/o

    pub fn status(&self) -> Status {
        (*self.notifier.status_snapshot()).clone()
    }
    fn snapshot(&self) -> Arc<Status> {
        self.notifier.status_snapshot()
    }

    pub fn phone_name(&self) -> Option<String> {
        self.snapshot()
            .phone
            .as_ref()
            .map(|phone| phone.device_name.clone())
    }
    pub fn phone_id(&self) -> Option<String> {
        self.snapshot()
            .phone
            .as_ref()
            .map(|phone| phone.device_id.clone())
    }
    pub fn battery_level_percent(&self) -> Option<u8> {
        self.snapshot()
            .phone
            .as_ref()
            .map(|phone| phone.battery_level_percent)
    }
    pub fn battery_state(&self) -> Option<BatteryState> {
        self.snapshot().phone.as_ref().map(|phone| phone.battery_state)
    }
    pub fn memory_num_free_bytes(&self) -> Option<u64> {
        self.snapshot()
            .phone
            .as_ref()
            .map(|phone| phone.memory_bytes_free)
    }
    pub fn memory_state(&self) -> Option<MemoryState> {
        self.snapshot().phone.as_ref().map(|phone| phone.memory_state)
    }
    pub fn hardware_version(&self) -> Option<String> {
        self.snapshot()
            .hardware
            .as_ref()
            .map(|hardware| hardware.version.clone())
    }
    pub fn module_serial(&self) -> Option<String> {
        self.snapshot()
            .hardware
            .as_ref()
            .map(|hardware| hardware.module_serial.clone())
    }
    pub fn serial_number_glasses(&self) -> Option<String> {
        self.snapshot()
            .hardware
            .as_ref()
            .map(|hardware| hardware.glasses_serial.clone())
    }
    pub fn serial_number_scene_cam(&self) -> Option<String> {
        self.snapshot()
            .hardware
            .as_ref()
            .map(|hardware| hardware.world_camera_serial.clone())
    }
    pub fn current_recording_id(&self) -> Option<Uuid> {
        self.snapshot()
            .recording
            .as_ref()
            .map(|recording| recording.id)
    }

    // control api

    /// Refetches the full status snapshot and refreshes the cache.
    pub fn get_status(&self) -> Result<Status, ControlError> {
        let status = self.runtime.block_on(self.control.get_status())?;
        self.notifier.status_set(status.clone());
        Ok(status)
    }

    pub fn recording_start(&self) -> Result<Uuid, ControlError> {
        self.runtime.block_on(self.control.recording_start())
    }
    pub fn recording_stop_and_save(&self) -> Result<(), ControlError> {
        self.runtime.block_on(self.control.recording_stop_and_save())
    }
    pub fn recording_cancel(&self) -> Result<(), ControlError> {
        self.runtime.block_on(self.control.recording_cancel())
    }

    pub fn send_event(
        &self,
        name: &str,
        timestamp_unix_ns: Option<i64>,
    ) -> Result<Event, ControlError> {
        self.runtime
            .block_on(self.control.send_event(name, timestamp_unix_ns))
    }

    pub fn get_template(&self) -> Result<Template, ControlError> {
        self.runtime.block_on(self.control.get_template())
    }
    pub fn get_template_data(&self) -> Result<TemplateAnswers, ControlError> {
        self.runtime.block_on(self.control.get_template_data())
    }
    /// Validates against the cached template first, so invalid answers get
    /// the full per-item error list without a round trip.
    pub fn post_template_data(
        &self,
        answers: &TemplateAnswers,
    ) -> Result<(), ControlError> {
        let template = match self.snapshot().template.clone() {
            Some(template) => template,
            None => self.runtime.block_on(self.control.get_template())?,
        };
        template.validate(answers)?;

        self.runtime.block_on(self.control.post_template_data(answers))
    }

    pub fn get_calibration(&self) -> Result<Calibration, ControlError> {
        self.runtime.block_on(self.control.get_calibration())
    }
    pub fn get_errors(&self) -> Result<Vec<DeviceErrorEntry>, ControlError> {
        self.runtime.block_on(self.control.get_errors())
    }

    /// Estimates the device clock offset over the time echo service and
    /// applies it to subsequent event timestamps.
    pub fn estimate_time_offset(
        &self,
        rounds: usize,
    ) -> Result<TimeEchoEstimate, TimeEchoError> {
        let time_echo_port = self
            .snapshot()
            .phone
            .as_ref()
            .and_then(|phone| phone.time_echo_port);

        let estimate = self.runtime.block_on(time_echo::estimate_offset(
            &self.host,
            time_echo_port,
            rounds,
            time_echo::DEFAULT_ROUND_TIMEOUT,
        ))?;

        self.control.time_offset_ns_set(Some(estimate.mean_offset_ns));
        Ok(estimate)
    }

    // streaming

    fn sensor_url(
        &self,
        kind: SensorKind,
    ) -> Result<String, ReceiveError> {
        let snapshot = self.snapshot();
        let sensor = snapshot
            .sensors
            .iter()
            .find(|sensor| {
                sensor.sensor == kind
                    && sensor.connection == ConnectionKind::Direct
                    && sensor.connected
            })
            .ok_or(ReceiveError::SensorUnavailable { sensor: kind })?;

        sensor
            .url()
            .ok_or(ReceiveError::SensorUnavailable { sensor: kind })
    }

    fn streams_exit(
        &self,
        streams: &mut Streams,
    ) -> CancellationToken {
        streams
            .exit
            .get_or_insert_with(|| self.exit.child_token())
            .clone()
    }

    fn session_spawn<D>(
        &self,
        exit: &CancellationToken,
        url: String,
        encoding_name: &str,
        depacketizer: D,
    ) -> mpsc::Receiver<Timestamped<D::Sample>>
    where
        D: Depacketizer + 'static,
    {
        let (sample_sender, sample_receiver) = mpsc::channel(SAMPLE_CHANNEL_DEPTH);
        let session = Session::new(
            SessionConfig::new(url, encoding_name),
            depacketizer,
            sample_sender,
        );

        let exit = exit.child_token();
        self.runtime.spawn(async move {
            if let Err(error) = session.run(exit).await {
                log::error!("streaming session ended: {error:?}");
            }
        });

        sample_receiver
    }

    fn forwarder_spawn_leader<T: Send + 'static>(
        &self,
        mut receiver: mpsc::Receiver<Timestamped<T>>,
        producer: Producer<T>,
    ) {
        self.runtime.spawn(async move {
            while let Some(sample) = receiver.next().await {
                // unmapped samples cannot be matched by time
                let wall_clock_ns = match sample.wall_clock_ns {
                    Some(wall_clock_ns) => wall_clock_ns,
                    None => continue,
                };
                if !producer.push_wait(wall_clock_ns, sample.inner).await {
                    break;
                }
            }
        });
    }
    fn forwarder_spawn_follower<T: Send + 'static>(
        &self,
        mut receiver: mpsc::Receiver<Timestamped<T>>,
        producer: Producer<T>,
    ) {
        self.runtime.spawn(async move {
            while let Some(sample) = receiver.next().await {
                let wall_clock_ns = match sample.wall_clock_ns {
                    Some(wall_clock_ns) => wall_clock_ns,
                    None => continue,
                };
                let _ = producer.push(wall_clock_ns, sample.inner);
            }
        });
    }

    fn gaze_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.gaze.is_none() {
            let url = self.sensor_url(SensorKind::Gaze)?;
            let exit = self.streams_exit(streams);
            streams.gaze = Some(self.session_spawn(&exit, url, ENCODING_GAZE, GazeDepacketizer));
        }
        Ok(())
    }
    fn scene_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.scene.is_none() {
            let url = self.sensor_url(SensorKind::World)?;
            let exit = self.streams_exit(streams);
            streams.scene =
                Some(self.session_spawn(&exit, url, ENCODING_H264, VideoDepacketizer::new()));
        }
        Ok(())
    }
    fn eyes_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.eyes.is_none() {
            let url = self.sensor_url(SensorKind::Eyes)?;
            let exit = self.streams_exit(streams);
            streams.eyes =
                Some(self.session_spawn(&exit, url, ENCODING_H264, VideoDepacketizer::new()));
        }
        Ok(())
    }
    fn imu_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.imu.is_none() {
            let url = self.sensor_url(SensorKind::Imu)?;
            let exit = self.streams_exit(streams);
            streams.imu = Some(self.session_spawn(&exit, url, ENCODING_IMU, ImuDepacketizer));
        }
        Ok(())
    }
    fn eye_events_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.eye_events.is_none() {
            let url = self.sensor_url(SensorKind::EyeEvents)?;
            let exit = self.streams_exit(streams);
            streams.eye_events = Some(self.session_spawn(
                &exit,
                url,
                ENCODING_EYE_EVENTS,
                EyeEventDepacketizer,
            ));
        }
        Ok(())
    }

    fn receive_next<T>(
        &self,
        receiver: &mut mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, ReceiveError> {
        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, receiver.next()).await {
                Ok(Some(sample)) => Ok(sample),
                Ok(None) => Err(ReceiveError::Ended),
                Err(_) => Err(ReceiveError::Timeout),
            }
        })
    }

    pub fn receive_gaze_datum(
        &self,
        timeout: Duration,
    ) -> Result<Timestamped<GazeSample>, ReceiveError> {
        let mut streams = self.streams.lock();
        self.gaze_ensure(&mut streams)?;
        self.receive_next(streams.gaze.as_mut().unwrap(), timeout)
    }

    pub fn receive_scene_video_frame(
        &self,
        timeout: Duration,
    ) -> Result<Timestamped<AccessUnit>, ReceiveError> {
        let mut streams = self.streams.lock();
        self.scene_ensure(&mut streams)?;
        self.receive_next(streams.scene.as_mut().unwrap(), timeout)
    }

    pub fn receive_eyes_video_frame(
        &self,
        timeout: Duration,
    ) -> Result<Timestamped<AccessUnit>, ReceiveError> {
        let mut streams = self.streams.lock();
        self.eyes_ensure(&mut streams)?;
        self.receive_next(streams.eyes.as_mut().unwrap(), timeout)
    }

    pub fn receive_imu_datum(
        &self,
        timeout: Duration,
    ) -> Result<Timestamped<ImuSample>, ReceiveError> {
        let mut streams = self.streams.lock();
        self.imu_ensure(&mut streams)?;
        self.receive_next(streams.imu.as_mut().unwrap(), timeout)
    }

    pub fn receive_eye_event(
        &self,
        timeout: Duration,
    ) -> Result<Timestamped<EyeEvent>, ReceiveError> {
        let mut streams = self.streams.lock();
        self.eye_events_ensure(&mut streams)?;
        self.receive_next(streams.eye_events.as_mut().unwrap(), timeout)
    }

    fn matched_scene_gaze_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.matched_scene_gaze.is_some() {
            return Ok(());
        }

        let scene_url = self.sensor_url(SensorKind::World)?;
        let gaze_url = self.sensor_url(SensorKind::Gaze)?;
        let exit = self.streams_exit(streams);

        let scene_receiver =
            self.session_spawn(&exit, scene_url, ENCODING_H264, VideoDepacketizer::new());
        let gaze_receiver = self.session_spawn(&exit, gaze_url, ENCODING_GAZE, GazeDepacketizer);

        let (frame_producer, gaze_producer, matcher) =
            Matcher2::<AccessUnit, GazeSample>::new(MatcherConfig::default());
        self.forwarder_spawn_leader(scene_receiver, frame_producer);
        self.forwarder_spawn_follower(gaze_receiver, gaze_producer);

        streams.matched_scene_gaze = Some(matcher);
        Ok(())
    }

    fn matched_scene_eyes_gaze_ensure(
        &self,
        streams: &mut Streams,
    ) -> Result<(), ReceiveError> {
        if streams.matched_scene_eyes_gaze.is_some() {
            return Ok(());
        }

        let scene_url = self.sensor_url(SensorKind::World)?;
        let eyes_url = self.sensor_url(SensorKind::Eyes)?;
        let gaze_url = self.sensor_url(SensorKind::Gaze)?;
        let exit = self.streams_exit(streams);

        let scene_receiver =
            self.session_spawn(&exit, scene_url, ENCODING_H264, VideoDepacketizer::new());
        let eyes_receiver =
            self.session_spawn(&exit, eyes_url, ENCODING_H264, VideoDepacketizer::new());
        let gaze_receiver = self.session_spawn(&exit, gaze_url, ENCODING_GAZE, GazeDepacketizer);

        let (frame_producer, eyes_producer, gaze_producer, matcher) =
            Matcher3::<AccessUnit, AccessUnit, GazeSample>::new(MatcherConfig::default());
        self.forwarder_spawn_leader(scene_receiver, frame_producer);
        self.forwarder_spawn_follower(eyes_receiver, eyes_producer);
        self.forwarder_spawn_follower(gaze_receiver, gaze_producer);

        streams.matched_scene_eyes_gaze = Some(matcher);
        Ok(())
    }

    pub fn receive_matched_scene_video_frame_and_gaze(
        &self,
        timeout: Duration,
    ) -> Result<MatchedSceneGaze, ReceiveError> {
        let mut streams = self.streams.lock();
        self.matched_scene_gaze_ensure(&mut streams)?;
        let matcher = streams.matched_scene_gaze.as_mut().unwrap();

        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, matcher.next()).await {
                Ok(Some(matched)) => Ok(matched),
                Ok(None) => Err(ReceiveError::Ended),
                Err(_) => Err(ReceiveError::Timeout),
            }
        })
    }

    pub fn receive_matched_scene_and_eyes_video_frames_and_gaze(
        &self,
        timeout: Duration,
    ) -> Result<MatchedSceneEyesGaze, ReceiveError> {
        let mut streams = self.streams.lock();
        self.matched_scene_eyes_gaze_ensure(&mut streams)?;
        let matcher = streams.matched_scene_eyes_gaze.as_mut().unwrap();

        self.runtime.block_on(async {
            match tokio::time::timeout(timeout, matcher.next()).await {
                Ok(Some(matched)) => Ok(matched),
                Ok(None) => Err(ReceiveError::Ended),
                Err(_) => Err(ReceiveError::Timeout),
            }
        })
    }

    /// Eagerly opens every currently advertised direct sensor stream.
    /// Sensors the device does not advertise are skipped.
    pub fn streaming_start(&self) {
        let mut streams = self.streams.lock();
        let _ = self.scene_ensure(&mut streams);
        let _ = self.eyes_ensure(&mut streams);
        let _ = self.gaze_ensure(&mut streams);
        let _ = self.imu_ensure(&mut streams);
        let _ = self.eye_events_ensure(&mut streams);
    }

    /// Tears down all open sessions. Streams reopen lazily on the next
    /// `receive_*` call.
    pub fn streaming_stop(&self) {
        let mut streams = self.streams.lock();
        if let Some(exit) = streams.exit.take() {
            exit.cancel();
        }
        *streams = Streams::default();
    }
}
impl Drop for Device {
    fn drop(&mut self) {
        self.exit.cancel();
    }
}
