//! Rtsp 1.0 protocol client over tcp.
//!
//! Covers the method set the device needs: OPTIONS, DESCRIBE, SETUP, PLAY,
//! TEARDOWN and GET_PARAMETER keepalives. Transport is negotiated as a
//! unicast udp rtp/rtcp port pair.

use crate::error::RtspError;
use regex::Regex;
use std::{sync::LazyLock, time::Duration};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
};

const USER_AGENT: &str = concat!("neon-realtime/", env!("CARGO_PKG_VERSION"));
const DEFAULT_RTSP_PORT: u16 = 554;
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, PartialEq, Debug)]
pub struct RtspResponse {
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}
impl RtspResponse {
    pub fn header(
        &self,
        name: &str,
    ) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

pub(crate) fn request_format(
    method: &str,
    url: &str,
    cseq: u32,
    session: Option<&str>,
    extra_headers: &[(&str, String)],
) -> String {
    let mut request = format!(
        "{method} {url} RTSP/1.0\r\n\
         CSeq: {cseq}\r\n\
         User-Agent: {USER_AGENT}\r\n"
    );
    if let Some(session) = session {
        request.push_str(&format!("Session: {session}\r\n"));
    }
    for (header, value) in extra_headers {
        request.push_str(&format!("{header}: {value}\r\n"));
    }
    request.push_str("\r\n");
    request
}

pub(crate) async fn response_read<R: AsyncBufRead + Unpin>(
    reader: &mut R
) -> Result<RtspResponse, RtspError> {
    static STATUS: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^RTSP/1\.0 (\d{3}) ?(.*)$").unwrap());

    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let captures = STATUS
        .captures(line.trim_end())
        .ok_or_else(|| RtspError::Malformed(format!("invalid status line: {line:?}")))?;
    let code = captures[1].parse::<u16>().unwrap();
    let reason = captures[2].to_owned();

    let mut headers = Vec::<(String, String)>::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }

        let (header, value) = line
            .split_once(':')
            .ok_or_else(|| RtspError::Malformed(format!("invalid header line: {line:?}")))?;
        headers.push((header.trim().to_owned(), value.trim().to_owned()));
    }

    let content_length = headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case("Content-Length"))
        .map(|(_, value)| {
            value
                .parse::<usize>()
                .map_err(|_| RtspError::Malformed(format!("invalid content length: {value:?}")))
        })
        .transpose()?
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;

    Ok(RtspResponse {
        code,
        reason,
        headers,
        body,
    })
}

/// Parsed `Session` header: id and the keepalive timeout.
pub(crate) fn session_header_parse(value: &str) -> (String, Duration) {
    let (id, parameters) = match value.split_once(';') {
        Some((id, parameters)) => (id, Some(parameters)),
        None => (value, None),
    };

    let timeout = parameters
        .and_then(|parameters| {
            parameters
                .split(';')
                .map(|parameter| parameter.trim())
                .find_map(|parameter| parameter.strip_prefix("timeout="))
        })
        .and_then(|timeout| timeout.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_SESSION_TIMEOUT);

    (id.trim().to_owned(), timeout)
}

/// Extracts the server rtp/rtcp port pair from a `Transport` header.
pub(crate) fn transport_server_ports_parse(value: &str) -> Option<(u16, u16)> {
    static SERVER_PORT: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"server_port=(\d+)-(\d+)").unwrap());

    let captures = SERVER_PORT.captures(value)?;
    let rtp = captures[1].parse::<u16>().ok()?;
    let rtcp = captures[2].parse::<u16>().ok()?;
    Some((rtp, rtcp))
}

#[derive(Clone, PartialEq, Debug)]
pub struct SetupOutcome {
    pub session_timeout: Duration,
    pub server_ports: Option<(u16, u16)>,
}

#[derive(Debug)]
pub struct RtspClient {
    url: String,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    cseq: u32,
    session: Option<String>,
    content_base: Option<String>,
}
impl RtspClient {
    pub async fn connect(url: &str) -> Result<Self, RtspError> {
        let uri = url
            .parse::<http::Uri>()
            .map_err(|error| RtspError::Malformed(format!("invalid rtsp url ({error}): {url}")))?;
        let host = uri
            .host()
            .ok_or_else(|| RtspError::Malformed(format!("rtsp url without host: {url}")))?;
        let port = uri.port_u16().unwrap_or(DEFAULT_RTSP_PORT);

        let stream = TcpStream::connect((host, port)).await?;
        let (read_half, write_half) = stream.into_split();

        Ok(Self {
            url: url.to_owned(),
            reader: BufReader::new(read_half),
            writer: write_half,
            cseq: 0,
            session: None,
            content_base: None,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn request(
        &mut self,
        method: &str,
        url: &str,
        extra_headers: &[(&str, String)],
    ) -> Result<RtspResponse, RtspError> {
        self.cseq += 1;
        let request = request_format(
            method,
            url,
            self.cseq,
            self.session.as_deref(),
            extra_headers,
        );
        self.writer.write_all(request.as_bytes()).await?;

        let response = response_read(&mut self.reader).await?;
        if !(200..300).contains(&response.code) {
            return Err(RtspError::Status {
                code: response.code,
                reason: response.reason,
            });
        }

        Ok(response)
    }

    pub async fn options(&mut self) -> Result<(), RtspError> {
        let url = self.url.clone();
        self.request("OPTIONS", &url, &[]).await?;
        Ok(())
    }

    /// Fetches the session description. The returned string is the sdp
    /// body, the content base (used to resolve relative control urls) is
    /// remembered on the client.
    pub async fn describe(&mut self) -> Result<String, RtspError> {
        let url = self.url.clone();
        let response = self
            .request(
                "DESCRIBE",
                &url,
                &[("Accept", "application/sdp".to_owned())],
            )
            .await?;

        self.content_base = response.header("Content-Base").map(str::to_owned);

        let sdp = String::from_utf8(response.body)
            .map_err(|_| RtspError::Malformed("describe body is not utf-8".to_owned()))?;
        Ok(sdp)
    }

    /// Resolves a media control attribute against the described base url.
    pub fn control_url(
        &self,
        control: Option<&str>,
    ) -> String {
        let base = self.content_base.as_deref().unwrap_or(&self.url);

        match control {
            None | Some("*") => base.to_owned(),
            Some(control) if control.starts_with("rtsp://") => control.to_owned(),
            Some(control) => {
                format!("{}/{}", base.trim_end_matches('/'), control)
            }
        }
    }

    pub async fn setup(
        &mut self,
        control_url: &str,
        rtp_port: u16,
        rtcp_port: u16,
    ) -> Result<SetupOutcome, RtspError> {
        let transport = format!("RTP/AVP;unicast;client_port={rtp_port}-{rtcp_port}");
        let response = self
            .request("SETUP", control_url, &[("Transport", transport)])
            .await?;

        let session = response
            .header("Session")
            .ok_or_else(|| RtspError::Malformed("setup response without session".to_owned()))?;
        let (session, session_timeout) = session_header_parse(session);
        self.session = Some(session);

        let server_ports = response
            .header("Transport")
            .and_then(transport_server_ports_parse);

        Ok(SetupOutcome {
            session_timeout,
            server_ports,
        })
    }

    pub async fn play(&mut self) -> Result<(), RtspError> {
        let url = self.url.clone();
        self.request("PLAY", &url, &[("Range", "npt=0.000-".to_owned())])
            .await?;
        Ok(())
    }

    pub async fn get_parameter(&mut self) -> Result<(), RtspError> {
        let url = self.url.clone();
        self.request("GET_PARAMETER", &url, &[]).await?;
        Ok(())
    }

    pub async fn teardown(&mut self) -> Result<(), RtspError> {
        let url = self.url.clone();
        self.request("TEARDOWN", &url, &[]).await?;
        self.session = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests_request_format {
    use super::request_format;

    #[test]
    fn without_session() {
        let request = request_format("OPTIONS", "rtsp://192.168.1.21:8086/", 1, None, &[]);

        assert!(request.starts_with("OPTIONS rtsp://192.168.1.21:8086/ RTSP/1.0\r\n"));
        assert!(request.contains("CSeq: 1\r\n"));
        assert!(request.ends_with("\r\n\r\n"));
        assert!(!request.contains("Session:"));
    }

    #[test]
    fn with_session_and_headers() {
        let request = request_format(
            "SETUP",
            "rtsp://192.168.1.21:8086/?camera=gaze",
            3,
            Some("F00D"),
            &[(
                "Transport",
                "RTP/AVP;unicast;client_port=40000-40001".to_owned(),
            )],
        );

        assert!(request.contains("Session: F00D\r\n"));
        assert!(request.contains("Transport: RTP/AVP;unicast;client_port=40000-40001\r\n"));
    }
}

#[cfg(test)]
mod tests_response_read {
    use super::response_read;
    use indoc::indoc;

    #[tokio::test]
    async fn ok_with_body() {
        let wire = indoc!(
            "
            RTSP/1.0 200 OK\r
            CSeq: 2\r
            Content-Base: rtsp://192.168.1.21:8086/\r
            Content-Type: application/sdp\r
            Content-Length: 11\r
            \r
            v=0\no=- 0 0"
        );
        let mut reader = wire.as_bytes();

        let response = response_read(&mut reader).await.unwrap();

        assert_eq!(response.code, 200);
        assert_eq!(response.reason, "OK");
        assert_eq!(
            response.header("content-base"),
            Some("rtsp://192.168.1.21:8086/")
        );
        assert_eq!(response.body, b"v=0\no=- 0 0");
    }

    #[tokio::test]
    async fn error_status() {
        let wire = "RTSP/1.0 454 Session Not Found\r\n\r\n";
        let mut reader = wire.as_bytes();

        let response = response_read(&mut reader).await.unwrap();

        assert_eq!(response.code, 454);
        assert_eq!(response.reason, "Session Not Found");
    }

    #[tokio::test]
    async fn garbage_rejected() {
        let wire = "HTTP/1.1 200 OK\r\n\r\n";
        let mut reader = wire.as_bytes();

        assert!(response_read(&mut reader).await.is_err());
    }
}

#[cfg(test)]
mod tests_headers {
    use super::{session_header_parse, transport_server_ports_parse};
    use std::time::Duration;

    #[test]
    fn session_with_timeout() {
        let (session, timeout) = session_header_parse("2674D1C0;timeout=30");

        assert_eq!(session, "2674D1C0");
        assert_eq!(timeout, Duration::from_secs(30));
    }

    #[test]
    fn session_without_timeout() {
        let (session, timeout) = session_header_parse("2674D1C0");

        assert_eq!(session, "2674D1C0");
        assert_eq!(timeout, Duration::from_secs(60));
    }

    #[test]
    fn transport_ports() {
        assert_eq!(
            transport_server_ports_parse(
                "RTP/AVP;unicast;client_port=40000-40001;server_port=8600-8601;ssrc=1234ABCD"
            ),
            Some((8600, 8601))
        );
        assert_eq!(
            transport_server_ports_parse("RTP/AVP;unicast;client_port=40000-40001"),
            None
        );
    }
}
