//! Sdp subset parser for the describe response.
//!
//! Only what the device emits is covered: media sections with an rtpmap,
//! an optional fmtp carrying `sprop-parameter-sets` for h264, and a
//! per-media control attribute.

use crate::error::RtspError;
use base64::Engine;
use itertools::Itertools;
use regex::Regex;
use std::sync::LazyLock;

#[derive(Clone, PartialEq, Debug)]
pub struct SdpMedia {
    pub media_type: String,
    pub payload_type: u8,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub control: Option<String>,
    /// Decoded sps/pps nal units from `sprop-parameter-sets`.
    pub sprop_parameter_sets: Vec<Vec<u8>>,
}

struct MediaBuilder {
    media_type: String,
    payload_type: u8,
    encoding_name: Option<String>,
    clock_rate: u32,
    control: Option<String>,
    sprop_parameter_sets: Vec<Vec<u8>>,
}
impl MediaBuilder {
    fn finish(self) -> Option<SdpMedia> {
        let encoding_name = match self.encoding_name {
            Some(encoding_name) => encoding_name,
            None => {
                log::warn!(
                    "sdp media {} without rtpmap, skipping",
                    self.media_type
                );
                return None;
            }
        };

        Some(SdpMedia {
            media_type: self.media_type,
            payload_type: self.payload_type,
            encoding_name,
            clock_rate: self.clock_rate,
            control: self.control,
            sprop_parameter_sets: self.sprop_parameter_sets,
        })
    }
}

pub fn sdp_parse(text: &str) -> Result<Vec<SdpMedia>, RtspError> {
    static MEDIA: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^m=(\w+) \d+ \S+ (\d+)").unwrap());
    static RTPMAP: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^a=rtpmap:(\d+) (.+)$").unwrap());
    static FMTP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^a=fmtp:(\d+) (.+)$").unwrap());

    let mut medias = Vec::<SdpMedia>::new();
    let mut current: Option<MediaBuilder> = None;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');

        if let Some(captures) = MEDIA.captures(line) {
            if let Some(previous) = current.take() {
                medias.extend(previous.finish());
            }

            let payload_type = captures[2]
                .parse::<u8>()
                .map_err(|_| RtspError::Sdp(format!("invalid payload type in: {line}")))?;
            current = Some(MediaBuilder {
                media_type: captures[1].to_owned(),
                payload_type,
                encoding_name: None,
                clock_rate: 0,
                control: None,
                sprop_parameter_sets: Vec::new(),
            });
            continue;
        }

        let media = match current.as_mut() {
            Some(media) => media,
            None => continue, // session level line
        };

        if let Some(captures) = RTPMAP.captures(line) {
            let payload_type = captures[1].parse::<u8>().unwrap_or(u8::MAX);
            if payload_type != media.payload_type {
                continue;
            }

            // encoding name, clock rate and optional channel count
            let (encoding_name, clock_rate) = captures[2]
                .splitn(3, '/')
                .take(2)
                .collect_tuple()
                .ok_or_else(|| RtspError::Sdp(format!("invalid rtpmap: {line}")))?;
            let clock_rate = clock_rate
                .parse::<u32>()
                .map_err(|_| RtspError::Sdp(format!("invalid clock rate in: {line}")))?;

            media.encoding_name = Some(encoding_name.to_owned());
            media.clock_rate = clock_rate;
        } else if let Some(captures) = FMTP.captures(line) {
            let payload_type = captures[1].parse::<u8>().unwrap_or(u8::MAX);
            if payload_type != media.payload_type {
                continue;
            }

            for parameter in captures[2].split(';') {
                let parameter = parameter.trim();
                if let Some(value) = parameter.strip_prefix("sprop-parameter-sets=") {
                    media.sprop_parameter_sets = value
                        .split(',')
                        .map(|encoded| {
                            base64::engine::general_purpose::STANDARD
                                .decode(encoded)
                                .map_err(|error| {
                                    RtspError::Sdp(format!(
                                        "invalid sprop-parameter-sets ({error}): {line}"
                                    ))
                                })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                }
            }
        } else if let Some(control) = line.strip_prefix("a=control:") {
            media.control = Some(control.to_owned());
        }
    }

    if let Some(previous) = current.take() {
        medias.extend(previous.finish());
    }

    Ok(medias)
}

/// Finds the media section carrying the given encoding.
pub fn media_find<'a>(
    medias: &'a [SdpMedia],
    encoding_name: &str,
) -> Option<&'a SdpMedia> {
    medias
        .iter()
        .find(|media| media.encoding_name.eq_ignore_ascii_case(encoding_name))
}
