//! Capture description for the encoder.
//!
//! The encoder learns what to expect on its capture ports from a small SDP
//! file written next to the output. Codec, payload type, clock rate and
//! SSRC come from the negotiated RTP parameters of the capture consumer.

use super::RecordingError;

use serde_json::Value;
use std::fmt::Write as _;
use std::net::IpAddr;

use super::ports::PortPair;

/// Output container chosen from the captured codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Webm,
    Mp4,
}

impl Container {
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Container::Webm => "webm",
            Container::Mp4 => "mp4",
        }
    }
}

/// Codec parameters of a capture consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureCodec {
    /// Codec name without the media prefix, e.g. `VP8`.
    pub name: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub ssrc: Option<u32>,
    /// Rendered `a=fmtp` parameters, if any.
    pub fmtp: Option<String>,
}

impl CaptureCodec {
    /// Read the first codec and encoding from consumer RTP parameters.
    pub fn from_rtp_parameters(rtp_parameters: &Value) -> Result<Self, RecordingError> {
        let codec = rtp_parameters
            .get("codecs")
            .and_then(Value::as_array)
            .and_then(|codecs| codecs.first())
            .ok_or_else(|| RecordingError::Capture("consumer has no codecs".to_string()))?;

        let mime_type = codec
            .get("mimeType")
            .and_then(Value::as_str)
            .ok_or_else(|| RecordingError::Capture("codec has no mimeType".to_string()))?;
        let name = mime_type
            .split_once('/')
            .map_or(mime_type, |(_, name)| name)
            .to_string();

        let payload_type = codec
            .get("payloadType")
            .or_else(|| codec.get("preferredPayloadType"))
            .and_then(Value::as_u64)
            .and_then(|pt| u8::try_from(pt).ok())
            .filter(|pt| *pt < 128)
            .ok_or_else(|| RecordingError::Capture("codec has no valid payloadType".to_string()))?;

        let clock_rate = codec
            .get("clockRate")
            .and_then(Value::as_u64)
            .and_then(|rate| u32::try_from(rate).ok())
            .unwrap_or(90_000);

        let ssrc = rtp_parameters
            .get("encodings")
            .and_then(Value::as_array)
            .and_then(|encodings| encodings.first())
            .and_then(|encoding| encoding.get("ssrc"))
            .and_then(Value::as_u64)
            .and_then(|ssrc| u32::try_from(ssrc).ok());

        let fmtp = codec
            .get("parameters")
            .and_then(Value::as_object)
            .filter(|params| !params.is_empty())
            .map(|params| {
                params
                    .iter()
                    .map(|(key, value)| match value {
                        Value::String(s) => format!("{key}={s}"),
                        other => format!("{key}={other}"),
                    })
                    .collect::<Vec<_>>()
                    .join(";")
            });

        Ok(Self {
            name,
            payload_type,
            clock_rate,
            ssrc,
            fmtp,
        })
    }

    /// Container the codec can be copied into without transcoding.
    pub fn container(&self) -> Result<Container, RecordingError> {
        match self.name.to_ascii_uppercase().as_str() {
            "VP8" | "VP9" => Ok(Container::Webm),
            "H264" => Ok(Container::Mp4),
            other => Err(RecordingError::UnsupportedCodec(other.to_string())),
        }
    }
}

/// Render the capture description for one session.
#[must_use]
pub fn render(codec: &CaptureCodec, capture_ip: IpAddr, ports: PortPair) -> String {
    let family = match capture_ip {
        IpAddr::V4(_) => "IP4",
        IpAddr::V6(_) => "IP6",
    };
    let pt = codec.payload_type;

    let mut sdp = String::new();
    // Writing to a String cannot fail.
    let _ = writeln!(sdp, "v=0");
    let _ = writeln!(sdp, "o=- 0 0 IN {family} {capture_ip}");
    let _ = writeln!(sdp, "s=camera-hub capture");
    let _ = writeln!(sdp, "c=IN {family} {capture_ip}");
    let _ = writeln!(sdp, "t=0 0");
    let _ = writeln!(sdp, "m=video {} RTP/AVP {pt}", ports.rtp);
    let _ = writeln!(sdp, "a=rtcp:{}", ports.rtcp);
    let _ = writeln!(sdp, "a=rtpmap:{pt} {}/{}", codec.name, codec.clock_rate);
    if let Some(fmtp) = &codec.fmtp {
        let _ = writeln!(sdp, "a=fmtp:{pt} {fmtp}");
    }
    if let Some(ssrc) = codec.ssrc {
        let _ = writeln!(sdp, "a=ssrc:{ssrc} cname:camera-hub");
    }
    let _ = writeln!(sdp, "a=recvonly");
    sdp
}
