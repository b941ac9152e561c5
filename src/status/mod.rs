pub mod template;

use crate::error::ComponentParseError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::Ipv4Addr;
use template::Template;
use uuid::Uuid;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum BatteryState {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "NO_BATTERY")]
    NoBattery,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum MemoryState {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "CRITICAL")]
    Critical,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Phone {
    pub device_id: String,
    pub device_name: String,
    #[serde(rename = "battery_level")]
    pub battery_level_percent: u8,
    pub battery_state: BatteryState,
    pub ip: String,
    #[serde(rename = "memory")]
    pub memory_bytes_free: u64,
    pub memory_state: MemoryState,
    #[serde(default)]
    pub time_echo_port: Option<u16>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Hardware {
    pub version: String,
    pub module_serial: String,
    pub glasses_serial: String,
    pub world_camera_serial: String,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    World,
    Eyes,
    Gaze,
    Imu,
    Audio,
    EyeEvents,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum ConnectionKind {
    #[serde(rename = "DIRECT")]
    Direct,
    #[serde(rename = "WEBSOCKET")]
    WebSocket,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor: SensorKind,
    pub connection: ConnectionKind,
    pub connected: bool,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub stream_error: bool,
}
impl Sensor {
    /// Unique key of the sensor within a status.
    pub fn key(&self) -> (SensorKind, ConnectionKind) {
        (self.sensor, self.connection)
    }

    /// Media url of the sensor, available when the sensor is connected and
    /// advertises a port.
    pub fn url(&self) -> Option<String> {
        if !self.connected {
            return None;
        }
        let port = self.port?;

        let url = if self.params.is_empty() {
            format!("rtsp://{}:{}/", self.ip, port)
        } else {
            format!("rtsp://{}:{}/?{}", self.ip, port, self.params)
        };
        Some(url)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum RecordingAction {
    #[serde(rename = "START")]
    Start,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "SAVE")]
    Save,
    #[serde(rename = "CANCEL")]
    Cancel,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Recording {
    pub id: Uuid,
    pub rec_duration_ns: u64,
    pub action: RecordingAction,
    #[serde(default)]
    pub message: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct NetworkDevice {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub ipv4: Option<Ipv4Addr>,
    pub port: u16,
    #[serde(default)]
    pub txt_records: std::collections::HashMap<String, String>,
}

#[derive(Clone, PartialEq, Debug)]
pub enum Component {
    Phone(Phone),
    Hardware(Hardware),
    Sensor(Sensor),
    Recording(Recording),
    NetworkDevice(NetworkDevice),
    Template(Template),
}
impl Component {
    pub fn model(&self) -> &'static str {
        match self {
            Component::Phone(_) => "Phone",
            Component::Hardware(_) => "Hardware",
            Component::Sensor(_) => "Sensor",
            Component::Recording(_) => "Recording",
            Component::NetworkDevice(_) => "NetworkDevice",
            Component::Template(_) => "Template",
        }
    }

    pub fn to_wire(&self) -> serde_json::Value {
        let data = match self {
            Component::Phone(inner) => serde_json::to_value(inner),
            Component::Hardware(inner) => serde_json::to_value(inner),
            Component::Sensor(inner) => serde_json::to_value(inner),
            Component::Recording(inner) => serde_json::to_value(inner),
            Component::NetworkDevice(inner) => serde_json::to_value(inner),
            Component::Template(inner) => serde_json::to_value(inner),
        }
        .unwrap();

        json!({
            "model": self.model(),
            "data": data,
        })
    }
}

/// Parses a single `{model, data}` wire object into a typed component.
pub fn parse_component(value: &serde_json::Value) -> Result<Component, ComponentParseError> {
    let model = value
        .get("model")
        .and_then(|model| model.as_str())
        .ok_or(ComponentParseError::Envelope)?;
    let data = value.get("data").ok_or(ComponentParseError::Envelope)?;

    fn data_parse<T: serde::de::DeserializeOwned>(
        model: &str,
        data: &serde_json::Value,
    ) -> Result<T, ComponentParseError> {
        serde_json::from_value(data.clone()).map_err(|source| ComponentParseError::Data {
            model: model.to_owned(),
            source,
        })
    }

    let component = match model {
        "Phone" => Component::Phone(data_parse(model, data)?),
        "Hardware" => Component::Hardware(data_parse(model, data)?),
        "Sensor" => Component::Sensor(data_parse(model, data)?),
        "Recording" => Component::Recording(data_parse(model, data)?),
        "NetworkDevice" => Component::NetworkDevice(data_parse(model, data)?),
        "Template" => Component::Template(data_parse(model, data)?),
        model => {
            return Err(ComponentParseError::UnknownModel {
                model: model.to_owned(),
            })
        }
    };

    Ok(component)
}

/// Parses a list of wire components, dropping unknown models with a warning.
/// Malformed known models are dropped with a warning as well, so one bad
/// delta never poisons a whole update.
pub fn parse_components_lossy(values: &[serde_json::Value]) -> Vec<Component> {
    values
        .iter()
        .filter_map(|value| match parse_component(value) {
            Ok(component) => Some(component),
            Err(error) => {
                log::warn!("dropping status component: {error}");
                None
            }
        })
        .collect()
}

#[derive(Clone, PartialEq, Debug, Default)]
pub struct Status {
    pub phone: Option<Phone>,
    pub hardware: Option<Hardware>,
    pub sensors: Vec<Sensor>,
    pub recording: Option<Recording>,
    pub network_devices: Vec<NetworkDevice>,
    pub template: Option<Template>,
    /// Api version advertised alongside the full snapshot.
    pub api_version: Option<String>,
}
impl Status {
    pub fn from_components(components: impl IntoIterator<Item = Component>) -> Self {
        let mut status = Self::default();
        for component in components {
            status.apply(component);
        }
        status
    }

    /// Applies a single component delta.
    ///
    /// Phone / Hardware / Template overwrite their singleton slot. Sensors
    /// and network devices are upserted by key, a disconnected sensor stays
    /// in the set marked disconnected. A recording delta with a terminal
    /// action clears the active recording.
    pub fn apply(
        &mut self,
        component: Component,
    ) {
        match component {
            Component::Phone(phone) => {
                self.phone = Some(phone);
            }
            Component::Hardware(hardware) => {
                self.hardware = Some(hardware);
            }
            Component::Sensor(sensor) => {
                match self
                    .sensors
                    .iter_mut()
                    .find(|existing| existing.key() == sensor.key())
                {
                    Some(existing) => *existing = sensor,
                    None => self.sensors.push(sensor),
                }
            }
            Component::Recording(recording) => match recording.action {
                RecordingAction::Stop | RecordingAction::Save | RecordingAction::Cancel => {
                    self.recording = None;
                }
                RecordingAction::Start | RecordingAction::Error => {
                    self.recording = Some(recording);
                }
            },
            Component::NetworkDevice(network_device) => {
                match self
                    .network_devices
                    .iter_mut()
                    .find(|existing| existing.name == network_device.name)
                {
                    Some(existing) => *existing = network_device,
                    None => self.network_devices.push(network_device),
                }
            }
            Component::Template(template) => {
                self.template = Some(template);
            }
        }
    }

    fn direct_sensor(
        &self,
        kind: SensorKind,
    ) -> Option<&Sensor> {
        self.sensors
            .iter()
            .find(|sensor| sensor.sensor == kind && sensor.connection == ConnectionKind::Direct)
    }

    pub fn direct_world_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorKind::World)
    }
    pub fn direct_eyes_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorKind::Eyes)
    }
    pub fn direct_gaze_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorKind::Gaze)
    }
    pub fn direct_imu_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorKind::Imu)
    }
    pub fn direct_eye_events_sensor(&self) -> Option<&Sensor> {
        self.direct_sensor(SensorKind::EyeEvents)
    }
}

#[cfg(test)]
mod tests_parse_component {
    use super::{parse_component, BatteryState, Component, ConnectionKind, SensorKind};
    use crate::error::ComponentParseError;
    use indoc::indoc;

    #[test]
    fn phone() {
        let wire = indoc!(
            r#"
            {
                "model": "Phone",
                "data": {
                    "device_id": "1ab2c3d4e5f6a7b8",
                    "device_name": "OnePlus 8",
                    "battery_level": 80,
                    "battery_state": "OK",
                    "ip": "192.168.1.21",
                    "memory": 101001001001,
                    "memory_state": "OK",
                    "time_echo_port": 12321
                }
            }
            "#
        );
        let wire = serde_json::from_str::<serde_json::Value>(wire).unwrap();

        let component = parse_component(&wire).unwrap();

        let phone = match component {
            Component::Phone(phone) => phone,
            component => panic!("expected Phone, got {component:?}"),
        };
        assert_eq!(phone.device_name, "OnePlus 8");
        assert_eq!(phone.battery_level_percent, 80);
        assert_eq!(phone.battery_state, BatteryState::Ok);
        assert_eq!(phone.time_echo_port, Some(12321));
    }

    #[test]
    fn phone_unknown_battery_state() {
        let wire = indoc!(
            r#"
            {
                "model": "Phone",
                "data": {
                    "device_id": "1ab2c3d4e5f6a7b8",
                    "device_name": "OnePlus 8",
                    "battery_level": 80,
                    "battery_state": "SOMETHING_NEW",
                    "ip": "192.168.1.21",
                    "memory": 101001001001,
                    "memory_state": "OK"
                }
            }
            "#
        );
        let wire = serde_json::from_str::<serde_json::Value>(wire).unwrap();

        let component = parse_component(&wire).unwrap();

        let phone = match component {
            Component::Phone(phone) => phone,
            component => panic!("expected Phone, got {component:?}"),
        };
        assert_eq!(phone.battery_state, BatteryState::Unknown);
        assert_eq!(phone.time_echo_port, None);
    }

    #[test]
    fn sensor() {
        let wire = indoc!(
            r#"
            {
                "model": "Sensor",
                "data": {
                    "sensor": "gaze",
                    "connection": "DIRECT",
                    "connected": true,
                    "ip": "192.168.1.21",
                    "port": 8086,
                    "protocol": "rtsp",
                    "params": "camera=gaze",
                    "stream_error": false
                }
            }
            "#
        );
        let wire = serde_json::from_str::<serde_json::Value>(wire).unwrap();

        let component = parse_component(&wire).unwrap();

        let sensor = match component {
            Component::Sensor(sensor) => sensor,
            component => panic!("expected Sensor, got {component:?}"),
        };
        assert_eq!(sensor.sensor, SensorKind::Gaze);
        assert_eq!(sensor.connection, ConnectionKind::Direct);
        assert_eq!(
            sensor.url().unwrap(),
            "rtsp://192.168.1.21:8086/?camera=gaze"
        );
    }

    #[test]
    fn unknown_model() {
        let wire = serde_json::json!({
            "model": "Thermometer",
            "data": {},
        });

        let error = parse_component(&wire).unwrap_err();

        match error {
            ComponentParseError::UnknownModel { model } => assert_eq!(model, "Thermometer"),
            error => panic!("expected UnknownModel, got {error:?}"),
        }
    }

    #[test]
    fn roundtrip_all_models() {
        let wires = [
            serde_json::json!({"model": "Phone", "data": {
                "device_id": "a", "device_name": "b", "battery_level": 50,
                "battery_state": "LOW", "ip": "10.0.0.2", "memory": 1024,
                "memory_state": "CRITICAL", "time_echo_port": 12321,
            }}),
            serde_json::json!({"model": "Hardware", "data": {
                "version": "2.0", "module_serial": "m1", "glasses_serial": "g1",
                "world_camera_serial": "w1",
            }}),
            serde_json::json!({"model": "Sensor", "data": {
                "sensor": "world", "connection": "DIRECT", "connected": true,
                "ip": "10.0.0.2", "port": 8085, "protocol": "rtsp",
                "params": "camera=world", "stream_error": false,
            }}),
            serde_json::json!({"model": "Recording", "data": {
                "id": "00000000-0000-0000-0000-000000000001",
                "rec_duration_ns": 1000000, "action": "START", "message": "",
            }}),
            serde_json::json!({"model": "NetworkDevice", "data": {
                "name": "Monitor:Phone:1ab2", "host": "phone.local.",
                "ipv4": "192.168.1.21", "port": 8080, "txt_records": {},
            }}),
        ];

        for wire in wires {
            let component = parse_component(&wire).unwrap();
            assert_eq!(component.to_wire(), wire);
        }
    }
}

#[cfg(test)]
mod tests_status {
    use super::{
        parse_component, Component, ConnectionKind, Phone, Recording, RecordingAction, Sensor,
        SensorKind, Status,
    };
    use uuid::Uuid;

    fn phone(battery_level_percent: u8) -> Phone {
        Phone {
            device_id: "1ab2".to_owned(),
            device_name: "Phone".to_owned(),
            battery_level_percent,
            battery_state: super::BatteryState::Ok,
            ip: "192.168.1.21".to_owned(),
            memory_bytes_free: 1024,
            memory_state: super::MemoryState::Ok,
            time_echo_port: Some(12321),
        }
    }

    fn sensor(
        kind: SensorKind,
        connected: bool,
    ) -> Sensor {
        Sensor {
            sensor: kind,
            connection: ConnectionKind::Direct,
            connected,
            ip: "192.168.1.21".to_owned(),
            port: Some(8086),
            protocol: "rtsp".to_owned(),
            params: String::new(),
            stream_error: false,
        }
    }

    fn recording(action: RecordingAction) -> Recording {
        Recording {
            id: Uuid::from_u128(1),
            rec_duration_ns: 0,
            action,
            message: String::new(),
        }
    }

    #[test]
    fn phone_delta_overwrites_singleton() {
        let mut status = Status::default();
        status.apply(Component::Phone(phone(80)));

        status.apply(Component::Phone(phone(79)));

        assert_eq!(status.phone.as_ref().unwrap().battery_level_percent, 79);
        assert_eq!(status.phone.as_ref().unwrap().device_name, "Phone");
    }

    #[test]
    fn sensor_upsert_keeps_disconnected_entry() {
        let mut status = Status::default();
        status.apply(Component::Sensor(sensor(SensorKind::Gaze, true)));
        status.apply(Component::Sensor(sensor(SensorKind::World, true)));

        status.apply(Component::Sensor(sensor(SensorKind::Gaze, false)));

        assert_eq!(status.sensors.len(), 2);
        let gaze = status.direct_gaze_sensor().unwrap();
        assert!(!gaze.connected);
        assert_eq!(gaze.url(), None);
    }

    #[test]
    fn recording_lifecycle() {
        let mut status = Status::default();

        status.apply(Component::Recording(recording(RecordingAction::Start)));
        assert!(status.recording.is_some());

        status.apply(Component::Recording(recording(RecordingAction::Save)));
        assert!(status.recording.is_none());

        status.apply(Component::Recording(recording(RecordingAction::Error)));
        assert!(status.recording.is_some());

        status.apply(Component::Recording(recording(RecordingAction::Cancel)));
        assert!(status.recording.is_none());
    }

    #[test]
    fn distinct_singletons_commute() {
        let phone_wire = serde_json::json!({"model": "Phone", "data": {
            "device_id": "a", "device_name": "b", "battery_level": 50,
            "battery_state": "OK", "ip": "10.0.0.2", "memory": 1024,
            "memory_state": "OK",
        }});
        let hardware_wire = serde_json::json!({"model": "Hardware", "data": {
            "version": "2.0", "module_serial": "m1", "glasses_serial": "g1",
            "world_camera_serial": "w1",
        }});

        let mut ab = Status::default();
        ab.apply(parse_component(&phone_wire).unwrap());
        ab.apply(parse_component(&hardware_wire).unwrap());

        let mut ba = Status::default();
        ba.apply(parse_component(&hardware_wire).unwrap());
        ba.apply(parse_component(&phone_wire).unwrap());

        assert_eq!(ab, ba);
    }

    #[test]
    fn same_key_last_write_wins() {
        let mut status = Status::default();
        status.apply(Component::Sensor(sensor(SensorKind::Gaze, true)));

        let mut replacement = sensor(SensorKind::Gaze, true);
        replacement.port = Some(9000);
        status.apply(Component::Sensor(replacement));

        assert_eq!(status.sensors.len(), 1);
        assert_eq!(status.sensors[0].port, Some(9000));
    }
}
