// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 SSH Tunnel Manager Contributors

// SSH Tunnel Manager - Control Protocol
// Newline-delimited JSON between the client and the daemon.
//
// Every line is one JSON object. Requests carry an `action` and a
// `correlationId`; the reply echoes the `correlationId`. Lines that are not
// valid JSON objects are dropped without disturbing the framing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::error::{Error, Result};
use crate::types::TunnelSpec;

/// Well-known loopback port of the daemon's control listener
pub const DEFAULT_CONTROL_PORT: u16 = 31337;

/// Longest accepted control line; longer lines are discarded up to the next newline
pub const DEFAULT_MAX_LINE_LENGTH: usize = 64 * 1024;

/// Action names as they appear on the wire
pub mod action {
    pub const START_TUNNEL: &str = "startTunnel";
    pub const STOP_TUNNEL: &str = "stopTunnel";
    pub const LIST_TUNNELS: &str = "listTunnels";
    pub const LIST_ALL_TUNNELS: &str = "listAllTunnels";
    pub const STOP_PROFILE: &str = "stopProfile";
}

const MISSING_TUNNEL_DATA: &str = "Missing servername or tunnel data";
const MISSING_PROFILE: &str = "Missing servername";

/// Line codec used on both ends of the control connection
pub fn control_codec(max_line_length: usize) -> ControlCodec {
    ControlCodec {
        inner: LinesCodec::new_with_max_length(max_line_length),
    }
}

/// [`LinesCodec`] that skips over-long lines instead of reporting them.
///
/// A `Framed` stream ends after the first decoder error, so an over-long line
/// must never surface as one. The inner codec discards up to the next newline
/// and decoding resumes with the line after it.
#[derive(Debug)]
pub struct ControlCodec {
    inner: LinesCodec,
}

impl Decoder for ControlCodec {
    type Item = String;
    type Error = LinesCodecError;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<String>, LinesCodecError> {
        loop {
            match self.inner.decode(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!("Discarding over-long control line");
                }
                other => return other,
            }
        }
    }

    fn decode_eof(
        &mut self,
        buf: &mut BytesMut,
    ) -> std::result::Result<Option<String>, LinesCodecError> {
        loop {
            match self.inner.decode_eof(buf) {
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!("Discarding over-long control line");
                }
                other => return other,
            }
        }
    }
}

impl Encoder<String> for ControlCodec {
    type Error = LinesCodecError;

    fn encode(
        &mut self,
        line: String,
        buf: &mut BytesMut,
    ) -> std::result::Result<(), LinesCodecError> {
        self.inner.encode(line, buf)
    }
}

/// Parse one control line. `None` for blank lines and anything that is not a JSON object.
pub fn parse_frame(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Serialize a frame to a single line (without the trailing newline)
pub fn encode_frame<T: Serialize>(frame: &T) -> Result<String> {
    Ok(serde_json::to_string(frame)?)
}

/// Extract the correlation id from a raw frame, if it carries a string one
pub fn correlation_id_of(value: &Value) -> Option<String> {
    value
        .get("correlationId")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Port as it may appear on the wire: decimal string, or a bare number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortText {
    Text(String),
    Number(u64),
}

impl PortText {
    fn into_text(self) -> String {
        match self {
            PortText::Text(text) => text,
            PortText::Number(number) => number.to_string(),
        }
    }
}

impl From<u16> for PortText {
    fn from(port: u16) -> Self {
        PortText::Text(port.to_string())
    }
}

/// Tunnel object of a request, before validation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<PortText>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<PortText>,
}

impl TunnelFields {
    fn into_spec(self) -> Result<TunnelSpec> {
        let source_port = self.source_port.map(PortText::into_text);
        let destination_port = self.destination_port.map(PortText::into_text);

        match (source_port, non_empty(self.destination_host), destination_port) {
            (Some(source), Some(host), Some(destination)) => {
                TunnelSpec::parse(&source, &host, &destination)
            }
            _ => Err(Error::Validation(MISSING_TUNNEL_DATA.to_string())),
        }
    }
}

impl From<TunnelSpec> for TunnelFields {
    fn from(spec: TunnelSpec) -> Self {
        Self {
            source_port: Some(spec.source_port.into()),
            destination_host: Some(spec.destination_host),
            destination_port: Some(spec.destination_port.into()),
        }
    }
}

/// Request exactly as framed on the wire. Every field is optional so that
/// missing data can be reported back instead of failing the whole line.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFrame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, alias = "servername", skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelFields>,
}

impl RequestFrame {
    /// Validate the frame into a typed request
    pub fn into_request(self) -> Result<Request> {
        let action = self
            .action
            .ok_or_else(|| Error::Validation("Missing action".to_string()))?;
        let profile_name = non_empty(self.profile_name);

        match action.as_str() {
            action::START_TUNNEL | action::STOP_TUNNEL => {
                let (Some(profile_name), Some(fields)) = (profile_name, self.tunnel) else {
                    return Err(Error::Validation(MISSING_TUNNEL_DATA.to_string()));
                };
                let tunnel = fields.into_spec()?;

                if action == action::START_TUNNEL {
                    Ok(Request::StartTunnel {
                        profile_name,
                        tunnel,
                    })
                } else {
                    Ok(Request::StopTunnel {
                        profile_name,
                        tunnel,
                    })
                }
            }
            action::LIST_TUNNELS => Ok(Request::ListTunnels {
                profile_name: profile_name
                    .ok_or_else(|| Error::Validation(MISSING_PROFILE.to_string()))?,
            }),
            action::LIST_ALL_TUNNELS => Ok(Request::ListAllTunnels),
            action::STOP_PROFILE => Ok(Request::StopProfile {
                profile_name: profile_name
                    .ok_or_else(|| Error::Validation(MISSING_PROFILE.to_string()))?,
            }),
            other => Err(Error::UnknownAction(other.to_string())),
        }
    }
}

/// A validated control request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    StartTunnel {
        profile_name: String,
        tunnel: TunnelSpec,
    },
    StopTunnel {
        profile_name: String,
        tunnel: TunnelSpec,
    },
    ListTunnels {
        profile_name: String,
    },
    ListAllTunnels,
    StopProfile {
        profile_name: String,
    },
}

impl Request {
    /// Wire name of the action
    pub fn action(&self) -> &'static str {
        match self {
            Request::StartTunnel { .. } => action::START_TUNNEL,
            Request::StopTunnel { .. } => action::STOP_TUNNEL,
            Request::ListTunnels { .. } => action::LIST_TUNNELS,
            Request::ListAllTunnels => action::LIST_ALL_TUNNELS,
            Request::StopProfile { .. } => action::STOP_PROFILE,
        }
    }

    /// Frame the request for sending under `correlation_id`
    pub fn into_frame(self, correlation_id: impl Into<String>) -> RequestFrame {
        let action = Some(self.action().to_string());
        let (profile_name, tunnel) = match self {
            Request::StartTunnel {
                profile_name,
                tunnel,
            }
            | Request::StopTunnel {
                profile_name,
                tunnel,
            } => (Some(profile_name), Some(tunnel.into())),
            Request::ListTunnels { profile_name } | Request::StopProfile { profile_name } => {
                (Some(profile_name), None)
            }
            Request::ListAllTunnels => (None, None),
        };

        RequestFrame {
            correlation_id: Some(correlation_id.into()),
            action,
            profile_name,
            tunnel,
        }
    }
}

/// Reply to exactly one request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnels: Option<Vec<TunnelSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<BTreeMap<String, Vec<TunnelSpec>>>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            correlation_id: None,
            success: true,
            error: None,
            tunnels: None,
            profiles: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::ok()
        }
    }

    pub fn with_tunnels(mut self, tunnels: Vec<TunnelSpec>) -> Self {
        self.tunnels = Some(tunnels);
        self
    }

    pub fn with_profiles(mut self, profiles: BTreeMap<String, Vec<TunnelSpec>>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Turn a `success: false` reply into an error
    pub fn into_result(self) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(Error::Daemon(
                self.error
                    .unwrap_or_else(|| "Daemon reported an unspecified error".to_string()),
            ))
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tokio_util::codec::FramedRead;

    fn frame(value: Value) -> RequestFrame {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parse_frame_drops_malformed_lines() {
        assert!(parse_frame("").is_none());
        assert!(parse_frame("   ").is_none());
        assert!(parse_frame(r#"{"action": "listTun"#).is_none());
        assert!(parse_frame("42").is_none());
        assert!(parse_frame(r#"{"action":"listTunnels"}"#).is_some());
    }

    #[test]
    fn test_start_tunnel_request() {
        let request = frame(json!({
            "action": "startTunnel",
            "correlationId": "c-1",
            "profileName": "box1",
            "tunnel": {"sourcePort": "8080", "destinationHost": "10.0.0.5", "destinationPort": "80"}
        }))
        .into_request()
        .unwrap();

        assert_eq!(
            request,
            Request::StartTunnel {
                profile_name: "box1".to_string(),
                tunnel: TunnelSpec::new(8080, "10.0.0.5", 80),
            }
        );
    }

    #[test]
    fn test_servername_alias() {
        let request = frame(json!({"action": "listTunnels", "servername": "box1"}))
            .into_request()
            .unwrap();
        assert_eq!(
            request,
            Request::ListTunnels {
                profile_name: "box1".to_string()
            }
        );
    }

    #[test]
    fn test_missing_destination_host() {
        let err = frame(json!({
            "action": "startTunnel",
            "profileName": "box1",
            "tunnel": {"sourcePort": "8080", "destinationPort": "80"}
        }))
        .into_request()
        .unwrap_err();
        assert_eq!(err.to_string(), "Missing servername or tunnel data");
    }

    #[test]
    fn test_missing_profile_name() {
        let err = frame(json!({"action": "stopTunnel", "tunnel": {}}))
            .into_request()
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing servername or tunnel data");

        let err = frame(json!({"action": "listTunnels", "profileName": " "}))
            .into_request()
            .unwrap_err();
        assert_eq!(err.to_string(), "Missing servername");
    }

    #[test]
    fn test_invalid_port_message() {
        let err = frame(json!({
            "action": "startTunnel",
            "profileName": "box1",
            "tunnel": {"sourcePort": "99999", "destinationHost": "db", "destinationPort": "80"}
        }))
        .into_request()
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Source port must be a number between 1 and 65535"
        );
    }

    #[test]
    fn test_unknown_action() {
        let err = frame(json!({"action": "reboot"})).into_request().unwrap_err();
        assert!(matches!(err, Error::UnknownAction(ref a) if a == "reboot"));
        assert_eq!(err.to_string(), "Unknown action: reboot");
    }

    #[test]
    fn test_request_frame_wire_shape() {
        let frame = Request::StopTunnel {
            profile_name: "box1".to_string(),
            tunnel: TunnelSpec::new(8080, "10.0.0.5", 80),
        }
        .into_frame("abc");

        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({
                "correlationId": "abc",
                "action": "stopTunnel",
                "profileName": "box1",
                "tunnel": {"sourcePort": "8080", "destinationHost": "10.0.0.5", "destinationPort": "80"}
            })
        );

        let list_all = Request::ListAllTunnels.into_frame("x");
        assert_eq!(
            serde_json::to_value(&list_all).unwrap(),
            json!({"correlationId": "x", "action": "listAllTunnels"})
        );
    }

    #[test]
    fn test_reply_wire_shape() {
        let reply = Reply::ok()
            .with_tunnels(vec![TunnelSpec::new(8080, "10.0.0.5", 80)])
            .with_correlation_id(Some("c-9".to_string()));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "correlationId": "c-9",
                "success": true,
                "tunnels": [{"sourcePort": "8080", "destinationHost": "10.0.0.5", "destinationPort": "80"}]
            })
        );

        let failure = Reply::failure("Unknown action: nope");
        assert_eq!(
            serde_json::to_value(&failure).unwrap(),
            json!({"success": false, "error": "Unknown action: nope"})
        );
        assert!(matches!(failure.into_result(), Err(Error::Daemon(ref m)) if m == "Unknown action: nope"));
    }

    #[tokio::test]
    async fn test_overlong_line_does_not_break_framing() {
        let data = format!(
            "{}\n{}\n{}",
            "x".repeat(64),
            r#"{"action":"listAllTunnels"}"#,
            "y".repeat(80)
        );
        let mut lines = FramedRead::new(data.as_bytes(), control_codec(32));

        let next = lines.next().await.unwrap().unwrap();
        assert_eq!(next, r#"{"action":"listAllTunnels"}"#);
        // Trailing over-long fragment without a newline ends the stream cleanly
        assert!(lines.next().await.is_none());
    }
}
