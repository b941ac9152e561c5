pub mod calibration;

use crate::{
    error::{ControlError, RecordingStartReason},
    status::{
        parse_components_lossy,
        template::{InvalidTemplateAnswers, Template, TemplateAnswers},
        Status,
    },
};
use calibration::Calibration;
use http::uri::{self, Authority, Scheme};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Event {
    pub name: String,
    #[serde(default)]
    pub recording_id: Option<Uuid>,
    #[serde(rename = "timestamp")]
    pub timestamp_unix_ns: i64,
}

#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct DeviceErrorEntry {
    pub message: String,
    #[serde(default)]
    pub component: Option<String>,
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct RejectionBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Option<std::collections::BTreeMap<String, Vec<String>>>,
}

/// Message and optional per-item template errors recovered from a rejected
/// command response.
fn rejection_parse(body: &str) -> (String, Option<InvalidTemplateAnswers>) {
    let parsed = match serde_json::from_str::<RejectionBody>(body) {
        Ok(parsed) => parsed,
        Err(_) => {
            return (body.trim().to_owned(), None);
        }
    };

    let template_errors = parsed
        .errors
        .filter(|errors| !errors.is_empty())
        .map(|errors| InvalidTemplateAnswers { errors });

    (parsed.message, template_errors)
}

/// HTTP control client of a single device.
///
/// All operations run against `http://<host>/api`, are cancel-safe at every
/// await point and carry a per-request deadline. The underlying connection
/// pool is re-established lazily after close, so a client can be reused
/// across device reboots.
#[derive(Debug)]
pub struct Control {
    host: Authority,

    reqwest_client: reqwest::Client,

    time_offset_ns: Mutex<Option<i64>>,
}
impl Control {
    const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(host: Authority) -> Self {
        let reqwest_client = reqwest::ClientBuilder::new().build().unwrap();

        let time_offset_ns = Mutex::new(None);

        Self {
            host,

            reqwest_client,

            time_offset_ns,
        }
    }

    pub fn host(&self) -> &Authority {
        &self.host
    }

    /// Sets the clock offset (device minus local, from the time echo
    /// estimator) applied to caller-supplied event timestamps.
    pub fn time_offset_ns_set(
        &self,
        time_offset_ns: Option<i64>,
    ) {
        *self.time_offset_ns.lock() = time_offset_ns;
    }
    pub fn time_offset_ns(&self) -> Option<i64> {
        *self.time_offset_ns.lock()
    }

    fn api_url(
        &self,
        path_and_query: &str,
    ) -> String {
        uri::Builder::new()
            .scheme(Scheme::HTTP)
            .authority(self.host.clone())
            .path_and_query(path_and_query)
            .build()
            .unwrap()
            .to_string()
    }

    async fn get(
        &self,
        path_and_query: &str,
    ) -> Result<reqwest::Response, ControlError> {
        let response = self
            .reqwest_client
            .get(self.api_url(path_and_query))
            .timeout(Self::REQUEST_TIMEOUT)
            .send()
            .await?;
        Ok(response)
    }
    async fn post(
        &self,
        path_and_query: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, ControlError> {
        let mut request = self
            .reqwest_client
            .post(self.api_url(path_and_query))
            .timeout(Self::REQUEST_TIMEOUT);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        Ok(response)
    }

    async fn success_json<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<Result<T, (String, Option<InvalidTemplateAnswers>)>, ControlError> {
        if response.status().is_success() {
            let envelope = response.json::<Envelope<T>>().await?;
            Ok(Ok(envelope.result))
        } else {
            let body = response.text().await?;
            Ok(Err(rejection_parse(&body)))
        }
    }

    pub async fn get_status(&self) -> Result<Status, ControlError> {
        let response = self.get("/api/status").await?;
        if !response.status().is_success() {
            let body = response.text().await?;
            let (message, _) = rejection_parse(&body);
            return Err(ControlError::Device { message });
        }

        let body = response.json::<serde_json::Value>().await?;
        let components = body
            .get("result")
            .and_then(|result| result.as_array())
            .ok_or_else(|| {
                ControlError::Malformed("status response without result list".to_owned())
            })?;

        let mut status = Status::from_components(parse_components_lossy(components));
        status.api_version = body
            .get("api_version")
            .and_then(|api_version| api_version.as_str())
            .map(str::to_owned);

        Ok(status)
    }

    pub async fn recording_start(&self) -> Result<Uuid, ControlError> {
        #[derive(Deserialize)]
        struct RecordingStarted {
            id: Uuid,
        }

        let response = self.post("/api/recording:start", None).await?;
        match Self::success_json::<RecordingStarted>(response).await? {
            Ok(started) => Ok(started.id),
            Err((message, _)) => Err(ControlError::RecordingStart {
                reason: RecordingStartReason::classify(&message),
                message,
            }),
        }
    }

    pub async fn recording_stop_and_save(&self) -> Result<(), ControlError> {
        let response = self.post("/api/recording:stop_and_save", None).await?;
        match Self::success_json::<serde_json::Value>(response).await? {
            Ok(_) => Ok(()),
            Err((_, Some(template_errors))) => Err(template_errors.into()),
            Err((message, None)) => Err(ControlError::RecordingStop { message }),
        }
    }

    pub async fn recording_cancel(&self) -> Result<(), ControlError> {
        let response = self.post("/api/recording:cancel", None).await?;
        match Self::success_json::<serde_json::Value>(response).await? {
            Ok(_) => Ok(()),
            Err((message, _)) => Err(ControlError::RecordingStop { message }),
        }
    }

    /// Sends a labeled event.
    ///
    /// Without a timestamp the device stamps the event on arrival. A
    /// caller-supplied local timestamp is shifted by the configured clock
    /// offset before submission. The response always carries the
    /// authoritative timestamp.
    pub async fn send_event(
        &self,
        name: &str,
        timestamp_unix_ns: Option<i64>,
    ) -> Result<Event, ControlError> {
        let timestamp_unix_ns =
            timestamp_unix_ns.map(|timestamp| timestamp + self.time_offset_ns().unwrap_or(0));

        let body = match timestamp_unix_ns {
            Some(timestamp) => json!({ "name": name, "timestamp": timestamp }),
            None => json!({ "name": name }),
        };

        let response = self.post("/api/event", Some(body)).await?;
        match Self::success_json::<Event>(response).await? {
            Ok(event) => Ok(event),
            Err((message, _)) => Err(ControlError::Device { message }),
        }
    }

    pub async fn get_template(&self) -> Result<Template, ControlError> {
        let response = self.get("/api/template").await?;
        match Self::success_json::<Template>(response).await? {
            Ok(template) => Ok(template),
            Err((message, _)) => Err(ControlError::Device { message }),
        }
    }

    pub async fn get_template_data(&self) -> Result<TemplateAnswers, ControlError> {
        let response = self.get("/api/template/data").await?;
        match Self::success_json::<TemplateAnswers>(response).await? {
            Ok(answers) => Ok(answers),
            Err((message, _)) => Err(ControlError::Device { message }),
        }
    }

    /// Uploads template answers. The acknowledgement body is structurally
    /// empty, values are never read back from it.
    pub async fn post_template_data(
        &self,
        answers: &TemplateAnswers,
    ) -> Result<(), ControlError> {
        let body = serde_json::to_value(answers).unwrap();

        let response = self.post("/api/template/data", Some(body)).await?;
        if response.status().is_success() {
            return Ok(());
        }

        let body = response.text().await?;
        let (message, template_errors) = rejection_parse(&body);
        match template_errors {
            Some(template_errors) => Err(template_errors.into()),
            None => Err(ControlError::Device { message }),
        }
    }

    pub async fn get_calibration(&self) -> Result<Calibration, ControlError> {
        let response = self.get("/api/calibration").await?;
        if !response.status().is_success() {
            let body = response.text().await?;
            let (message, _) = rejection_parse(&body);
            return Err(ControlError::Device { message });
        }

        let blob = response.bytes().await?;
        let calibration = calibration::parse(&blob).map_err(|error| ControlError::Device {
            message: error.to_string(),
        })?;

        Ok(calibration)
    }

    pub async fn get_errors(&self) -> Result<Vec<DeviceErrorEntry>, ControlError> {
        let response = self.get("/api/errors").await?;
        match Self::success_json::<Vec<DeviceErrorEntry>>(response).await? {
            Ok(entries) => Ok(entries),
            Err((message, _)) => Err(ControlError::Device { message }),
        }
    }
}

#[cfg(test)]
mod tests_rejection_parse {
    use super::rejection_parse;

    #[test]
    fn message_only() {
        let (message, template_errors) =
            rejection_parse(r#"{"message": "Battery too low to start recording"}"#);

        assert_eq!(message, "Battery too low to start recording");
        assert!(template_errors.is_none());
    }

    #[test]
    fn template_errors() {
        let (message, template_errors) = rejection_parse(
            r#"{"message": "Template has invalid answers", "errors": {"Q1": ["required answer is missing"]}}"#,
        );

        assert_eq!(message, "Template has invalid answers");
        let template_errors = template_errors.unwrap();
        assert_eq!(
            template_errors.errors["Q1"],
            vec!["required answer is missing"]
        );
    }

    #[test]
    fn non_json_body() {
        let (message, template_errors) = rejection_parse("Internal Server Error\n");

        assert_eq!(message, "Internal Server Error");
        assert!(template_errors.is_none());
    }
}


#[cfg(test)]
mod tests_recording_start_reason {
    use crate::error::RecordingStartReason;

    #[test]
    fn classification() {
        assert_eq!(
            RecordingStartReason::classify("Template has invalid answers"),
            RecordingStartReason::Template
        );
        assert_eq!(
            RecordingStartReason::classify("Battery too low"),
            RecordingStartReason::LowBattery
        );
        assert_eq!(
            RecordingStartReason::classify("Not enough free storage"),
            RecordingStartReason::LowStorage
        );
        assert_eq!(
            RecordingStartReason::classify("No wearer selected"),
            RecordingStartReason::NoWearer
        );
        assert_eq!(
            RecordingStartReason::classify("No workspace selected"),
            RecordingStartReason::NoWorkspace
        );
        assert_eq!(
            RecordingStartReason::classify("Device setup incomplete"),
            RecordingStartReason::SetupIncomplete
        );
        assert_eq!(
            RecordingStartReason::classify("Something else entirely"),
            RecordingStartReason::Other
        );
    }
}
