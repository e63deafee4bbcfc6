use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{SdpDescription, SdpKind};
use crate::error::LinkError;

/// Label of the data channel both sides agree on.
pub const DATA_CHANNEL_LABEL: &str = "liquid";

/// Application-level liveness probe sent once the data channel opens.
pub const LIVENESS_PROBE: &str = "ping";

/// Which side creates the SDP offer.
///
/// The signaling server historically names roles after the artifact a side
/// ends up sending: `"answer"` is the initiator that creates the offer and
/// `"offer"` is the responder that waits for it. [`PeerRole::from_str`]
/// accepts both spellings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerRole {
    Offerer,
    Answerer,
}

impl PeerRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerRole::Offerer => "offerer",
            PeerRole::Answerer => "answerer",
        }
    }

    /// Event name used when forwarding a locally gathered ICE candidate.
    pub fn local_candidate_event(&self) -> SignalEvent {
        match self {
            PeerRole::Offerer => SignalEvent::AnswerCandidate,
            PeerRole::Answerer => SignalEvent::OfferCandidate,
        }
    }
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerRole {
    type Err = LinkError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "offerer" | "answer" => Ok(PeerRole::Offerer),
            "answerer" | "offer" => Ok(PeerRole::Answerer),
            other => Err(LinkError::Payload(format!("unknown peer role {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalEvent {
    Link,
    LinkResponse,
    OfferDescription,
    AnswerDescription,
    OfferCandidate,
    AnswerCandidate,
    Candidate,
    Error,
}

impl SignalEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalEvent::Link => "link",
            SignalEvent::LinkResponse => "link-response",
            SignalEvent::OfferDescription => "offer-description",
            SignalEvent::AnswerDescription => "answer-description",
            SignalEvent::OfferCandidate => "offer-candidate",
            SignalEvent::AnswerCandidate => "answer-candidate",
            SignalEvent::Candidate => "candidate",
            SignalEvent::Error => "error",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let event = match name {
            "link" => SignalEvent::Link,
            "link-response" => SignalEvent::LinkResponse,
            "offer-description" => SignalEvent::OfferDescription,
            "answer-description" => SignalEvent::AnswerDescription,
            "offer-candidate" => SignalEvent::OfferCandidate,
            "answer-candidate" => SignalEvent::AnswerCandidate,
            "candidate" => SignalEvent::Candidate,
            "error" => SignalEvent::Error,
            _ => return None,
        };
        Some(event)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(
            self,
            SignalEvent::OfferCandidate | SignalEvent::AnswerCandidate | SignalEvent::Candidate
        )
    }
}

impl fmt::Display for SignalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Json(Value),
    Raw(String),
}

impl EventPayload {
    pub fn json<T: Serialize>(body: &T) -> Result<Self, LinkError> {
        Ok(EventPayload::Json(serde_json::to_value(body)?))
    }

    pub fn to_value(&self) -> Value {
        match self {
            EventPayload::Json(value) => value.clone(),
            EventPayload::Raw(text) => Value::String(text.clone()),
        }
    }

    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(text) => EventPayload::Raw(text),
            other => EventPayload::Json(other),
        }
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, LinkError> {
        match self {
            EventPayload::Json(value) => Ok(T::deserialize(value)?),
            EventPayload::Raw(text) => Ok(serde_json::from_str(text)?),
        }
    }
}

/// One named event on the signaling channel.
#[derive(Debug, Clone, PartialEq)]
pub struct WireEvent {
    pub name: String,
    pub payload: EventPayload,
}

impl WireEvent {
    pub fn new(name: impl Into<String>, payload: EventPayload) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }

    pub fn signal<T: Serialize>(event: SignalEvent, body: &T) -> Result<Self, LinkError> {
        Ok(Self::new(event.as_str(), EventPayload::json(body)?))
    }

    pub fn kind(&self) -> Option<SignalEvent> {
        SignalEvent::parse(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPayload {
    pub request_id: String,
}

/// Outbound description body. The peer infers the type from the event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
}

#[derive(Debug, Deserialize)]
struct InboundSdp {
    sdp: String,
    #[serde(rename = "type", default)]
    typ: Option<String>,
}

/// Decodes a description event.
///
/// Accepts the structured `{sdp, type}` form and the legacy bare SDP string.
/// A missing `type` falls back to `default_kind`.
pub fn parse_description(
    payload: &EventPayload,
    default_kind: SdpKind,
) -> Result<SdpDescription, LinkError> {
    let (sdp, kind) = match payload {
        EventPayload::Raw(text) => (text.clone(), default_kind),
        EventPayload::Json(Value::String(text)) => (text.clone(), default_kind),
        EventPayload::Json(value) => {
            let inbound = InboundSdp::deserialize(value)?;
            let kind = match inbound.typ.as_deref() {
                Some(typ) => typ.parse()?,
                None => default_kind,
            };
            (inbound.sdp, kind)
        }
    };
    if sdp.trim().is_empty() && kind != SdpKind::Rollback {
        return Err(LinkError::Payload("description carries an empty sdp".into()));
    }
    Ok(SdpDescription { kind, sdp })
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

/// Encodes an event as the `{"event": .., "data": ..}` text frame.
pub fn encode_frame(event: &WireEvent) -> Result<String, LinkError> {
    let frame = WireFrame {
        event: event.name.clone(),
        data: event.payload.to_value(),
    };
    Ok(serde_json::to_string(&frame)?)
}

pub fn decode_frame(text: &str) -> Result<WireEvent, LinkError> {
    let frame: WireFrame = serde_json::from_str(text)?;
    if frame.event.is_empty() {
        return Err(LinkError::Payload("frame is missing an event name".into()));
    }
    Ok(WireEvent::new(frame.event, EventPayload::from_value(frame.data)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::IceCandidate;
    use serde_json::json;

    #[test]
    fn legacy_role_names_map_to_artifact_sender() {
        assert_eq!("answer".parse::<PeerRole>().unwrap(), PeerRole::Offerer);
        assert_eq!("offer".parse::<PeerRole>().unwrap(), PeerRole::Answerer);
        assert_eq!("Offerer".parse::<PeerRole>().unwrap(), PeerRole::Offerer);
        assert!("observer".parse::<PeerRole>().is_err());
    }

    #[test]
    fn local_candidates_are_named_after_the_other_side() {
        assert_eq!(
            PeerRole::Offerer.local_candidate_event(),
            SignalEvent::AnswerCandidate
        );
        assert_eq!(
            PeerRole::Answerer.local_candidate_event(),
            SignalEvent::OfferCandidate
        );
    }

    #[test]
    fn structured_answer_keeps_its_type() {
        let payload = EventPayload::Json(json!({"type": "pranswer", "sdp": "v=0\r\n"}));
        let description = parse_description(&payload, SdpKind::Answer).unwrap();
        assert_eq!(description.kind, SdpKind::ProvisionalAnswer);
        assert_eq!(description.sdp, "v=0\r\n");
    }

    #[test]
    fn bare_sdp_string_is_an_answer() {
        let payload = EventPayload::Raw("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n".into());
        let description = parse_description(&payload, SdpKind::Answer).unwrap();
        assert_eq!(description.kind, SdpKind::Answer);
    }

    #[test]
    fn description_without_sdp_is_rejected() {
        let payload = EventPayload::Json(json!({"type": "offer"}));
        assert!(matches!(
            parse_description(&payload, SdpKind::Offer),
            Err(LinkError::Payload(_))
        ));
        let empty = EventPayload::Json(json!({"type": "offer", "sdp": "  "}));
        assert!(parse_description(&empty, SdpKind::Offer).is_err());
    }

    #[test]
    fn unknown_sdp_type_is_rejected() {
        let payload = EventPayload::Json(json!({"type": "bogus", "sdp": "v=0"}));
        assert!(parse_description(&payload, SdpKind::Offer).is_err());
    }

    #[test]
    fn candidate_payload_uses_browser_field_names() {
        let payload = EventPayload::Json(json!({
            "candidate": "candidate:1 1 udp 2130706431 10.0.0.2 50000 typ host",
            "sdpMid": "0",
            "sdpMLineIndex": 0
        }));
        let candidate: IceCandidate = payload.decode().unwrap();
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));

        let encoded = WireEvent::signal(SignalEvent::OfferCandidate, &candidate).unwrap();
        assert_eq!(
            encoded.payload.to_value()["sdpMLineIndex"],
            json!(0),
            "outbound candidates keep the browser casing"
        );
    }

    #[test]
    fn frames_carry_raw_strings_and_objects() {
        let raw = decode_frame(r#"{"event":"answer-description","data":"v=0"}"#).unwrap();
        assert_eq!(raw.kind(), Some(SignalEvent::AnswerDescription));
        assert_eq!(raw.payload, EventPayload::Raw("v=0".into()));

        let link = WireEvent::signal(
            SignalEvent::Link,
            &LinkPayload {
                request_id: "abc123".into(),
            },
        )
        .unwrap();
        let text = encode_frame(&link).unwrap();
        assert_eq!(decode_frame(&text).unwrap(), link);
        assert!(text.contains(r#""requestId":"abc123""#));
    }

    #[test]
    fn frame_without_event_name_is_malformed() {
        assert!(decode_frame(r#"{"data":{}}"#).is_err());
        assert!(decode_frame(r#"{"event":"","data":{}}"#).is_err());
        assert!(decode_frame("not json").is_err());
    }
}
