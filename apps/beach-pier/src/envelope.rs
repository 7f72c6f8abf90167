use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use thiserror::Error;

/// Relay message kinds forwarded verbatim between two peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelayKind {
    Offer,
    Answer,
    Candidate,
}

impl RelayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayKind::Offer => "offer",
            RelayKind::Answer => "answer",
            RelayKind::Candidate => "candidate",
        }
    }
}

/// Routing fields of an `offer` / `answer` / `candidate` envelope.
///
/// `data` stays as the raw JSON text the sender wrote; it is never parsed.
#[derive(Debug, Clone, Serialize)]
pub struct RelayRoute {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl PartialEq for RelayRoute {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from
            && self.to == other.to
            && self.data.as_deref().map(RawValue::get) == other.data.as_deref().map(RawValue::get)
    }
}

/// Machine-readable reasons carried in `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Identity already in use.
    #[serde(rename = "UAE")]
    IdentityInUse,
}

/// Every envelope kind that can appear on the wire.
///
/// `user-list` and `error` are only ever produced by the relay; when a peer
/// sends one it decodes fine but the router ignores it. Unknown `type` values
/// decode to [`Envelope::Unrecognized`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    Register {
        from: String,
    },
    Offer(RelayRoute),
    Answer(RelayRoute),
    Candidate(RelayRoute),
    UserList {
        data: Vec<String>,
    },
    Error {
        data: ErrorCode,
    },
    #[serde(skip_serializing)]
    Unrecognized,
}

/// Flat view of an inbound frame. A tagged enum would buffer the whole
/// object into serde's generic content tree first, which re-parses `data`.
#[derive(Deserialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    to: Option<String>,
    #[serde(default, borrow)]
    data: Option<&'a RawValue>,
}

impl WireEnvelope<'_> {
    fn into_route(self) -> Result<RelayRoute, DecodeError> {
        Ok(RelayRoute {
            from: self.from,
            to: self.to.ok_or(DecodeError::MissingField("to"))?,
            data: self.data.map(ToOwned::to_owned),
        })
    }

    fn parse_data<T: serde::de::DeserializeOwned>(&self) -> Result<T, DecodeError> {
        let raw = self.data.ok_or(DecodeError::MissingField("data"))?;
        Ok(serde_json::from_str(raw.get())?)
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("frame is not a valid envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("envelope is missing `{0}`")]
    MissingField(&'static str),
    #[error("register envelope carries an empty identity")]
    EmptyIdentity,
}

impl DecodeError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DecodeError::NotUtf8 => "not_utf8",
            DecodeError::Malformed(_) => "malformed",
            DecodeError::MissingField(_) => "missing_field",
            DecodeError::EmptyIdentity => "empty_identity",
        }
    }
}

impl Envelope {
    pub fn decode(frame: &str) -> Result<Self, DecodeError> {
        let wire: WireEnvelope<'_> = serde_json::from_str(frame)?;
        let envelope = match wire.kind.as_str() {
            "register" => {
                let from = wire.from.ok_or(DecodeError::MissingField("from"))?;
                if from.is_empty() {
                    return Err(DecodeError::EmptyIdentity);
                }
                Envelope::Register { from }
            }
            "offer" => Envelope::Offer(wire.into_route()?),
            "answer" => Envelope::Answer(wire.into_route()?),
            "candidate" => Envelope::Candidate(wire.into_route()?),
            "user-list" => Envelope::UserList {
                data: wire.parse_data()?,
            },
            "error" => Envelope::Error {
                data: wire.parse_data()?,
            },
            _ => Envelope::Unrecognized,
        };
        Ok(envelope)
    }

    pub fn relay(kind: RelayKind, route: RelayRoute) -> Self {
        match kind {
            RelayKind::Offer => Envelope::Offer(route),
            RelayKind::Answer => Envelope::Answer(route),
            RelayKind::Candidate => Envelope::Candidate(route),
        }
    }

    /// Splits a relay envelope into its kind and route.
    pub fn as_relay(&self) -> Option<(RelayKind, &RelayRoute)> {
        match self {
            Envelope::Offer(route) => Some((RelayKind::Offer, route)),
            Envelope::Answer(route) => Some((RelayKind::Answer, route)),
            Envelope::Candidate(route) => Some((RelayKind::Candidate, route)),
            _ => None,
        }
    }

    pub fn user_list(identities: Vec<String>) -> Self {
        Envelope::UserList { data: identities }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_register() {
        let envelope = Envelope::decode(r#"{"type":"register","from":"alice"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::Register {
                from: "alice".into()
            }
        );
    }

    #[test]
    fn register_requires_identity() {
        assert!(matches!(
            Envelope::decode(r#"{"type":"register"}"#),
            Err(DecodeError::MissingField("from"))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"register","from":null}"#),
            Err(DecodeError::MissingField("from"))
        ));
        assert!(matches!(
            Envelope::decode(r#"{"type":"register","from":""}"#),
            Err(DecodeError::EmptyIdentity)
        ));
    }

    #[test]
    fn decodes_relay_with_opaque_payload() {
        let frame = r#"{"type":"candidate","from":"a","to":"b","data":{"candidate":"x","sdpMLineIndex":0}}"#;
        let envelope = Envelope::decode(frame).unwrap();
        let (kind, route) = envelope.as_relay().expect("relay");
        assert_eq!(kind, RelayKind::Candidate);
        assert_eq!(route.to, "b");
        assert_eq!(route.from.as_deref(), Some("a"));
        assert_eq!(
            route.data.as_deref().map(RawValue::get),
            Some(r#"{"candidate":"x","sdpMLineIndex":0}"#)
        );
    }

    #[test]
    fn relay_payload_is_kept_as_written() {
        let frame = r#"{"type":"offer","from":"a","to":"b","data":1e400}"#;
        let envelope = Envelope::decode(frame).unwrap();
        let (_, route) = envelope.as_relay().expect("relay");
        assert_eq!(route.data.as_deref().map(RawValue::get), Some("1e400"));

        let nested = format!("{}{}", "[".repeat(200), "]".repeat(200));
        let frame = format!(r#"{{"type":"answer","to":"b","data":{nested}}}"#);
        let envelope = Envelope::decode(&frame).unwrap();
        let (kind, route) = envelope.as_relay().expect("relay");
        assert_eq!(kind, RelayKind::Answer);
        assert_eq!(route.data.as_deref().map(RawValue::get), Some(nested.as_str()));
    }

    #[test]
    fn relay_envelope_encodes_payload_untouched() {
        let route = RelayRoute {
            from: Some("a".into()),
            to: "b".into(),
            data: Some(RawValue::from_string(r#"{"sdp": "v=0"}"#.into()).unwrap()),
        };
        assert_eq!(
            Envelope::relay(RelayKind::Offer, route).to_json().unwrap(),
            r#"{"type":"offer","from":"a","to":"b","data":{"sdp": "v=0"}}"#
        );
    }

    #[test]
    fn relay_without_target_is_malformed() {
        assert!(matches!(
            Envelope::decode(r#"{"type":"offer","from":"a","data":{}}"#),
            Err(DecodeError::MissingField("to"))
        ));
    }

    #[test]
    fn unknown_type_is_unrecognized() {
        let envelope = Envelope::decode(r#"{"type":"hangup","to":"b"}"#).unwrap();
        assert_eq!(envelope, Envelope::Unrecognized);
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"from":"alice"}"#).is_err());
        assert!(Envelope::decode(r#"{"type":"user-list","data":"alice"}"#).is_err());
    }

    #[test]
    fn server_envelopes_match_wire_shape() {
        let list = Envelope::user_list(vec!["alice".into(), "bob".into()]);
        assert_eq!(
            serde_json::to_value(&list).unwrap(),
            json!({"type": "user-list", "data": ["alice", "bob"]})
        );

        let error = Envelope::Error {
            data: ErrorCode::IdentityInUse,
        };
        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"type": "error", "data": "UAE"})
        );
    }
}
