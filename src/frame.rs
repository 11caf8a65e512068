//! Text-frame protocol
//!
//! Every inbound text frame has the shape `"<type>,<json-payload>"`.
//! Recognized types: `auth` (handshake payload) and `msg` (opaque
//! application payload, relayed once the connection is active).

use serde::{Deserialize, Serialize};

/// Longest accepted bearer token, in bytes
const MAX_TOKEN_LEN: usize = 1024;

/// A parsed inbound frame
#[derive(Debug)]
pub enum Frame<'a> {
    Auth(AuthOptions),
    /// Opaque payload; semantics belong to the downstream relay
    Msg(&'a str),
}

/// `auth` frame payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthOptions {
    /// Target session id
    #[serde(rename = "session")]
    pub script: i64,
    /// Short-lived bearer token or direct user identity
    pub token: String,
    /// Requested actions; must arrive empty, the gateway substitutes the
    /// fixed required set before authorizing
    pub actions: Vec<String>,
}

impl AuthOptions {
    /// Validate payload shape: session id >= 1, token non-empty printable
    /// ASCII of at most 1024 bytes, actions empty
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.script < 1 {
            return Err(FrameError::Invalid("session must be >= 1"));
        }
        if self.token.is_empty() {
            return Err(FrameError::Invalid("token must not be empty"));
        }
        if self.token.len() > MAX_TOKEN_LEN {
            return Err(FrameError::Invalid("token exceeds 1024 bytes"));
        }
        if !self.token.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
            return Err(FrameError::Invalid("token must be printable ascii"));
        }
        if !self.actions.is_empty() {
            return Err(FrameError::Invalid("actions must be empty"));
        }
        Ok(())
    }
}

/// Parse a text frame into its type and payload.
///
/// A missing separator or unknown type prefix is a protocol error; the
/// caller treats the connection as corrupted. A malformed `auth` payload is
/// a validation error.
pub fn parse(text: &str) -> Result<Frame<'_>, FrameError> {
    let (kind, payload) = text.split_once(',').ok_or(FrameError::MissingSeparator)?;

    match kind {
        "auth" => {
            let options: AuthOptions =
                serde_json::from_str(payload).map_err(FrameError::BadPayload)?;
            options.validate()?;
            Ok(Frame::Auth(options))
        }
        "msg" => Ok(Frame::Msg(payload)),
        other => Err(FrameError::UnknownType(other.to_string())),
    }
}

/// Frame parse/validation failure
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame has no type separator")]
    MissingSeparator,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("malformed payload: {0}")]
    BadPayload(#[source] serde_json::Error),
    #[error("invalid auth payload: {0}")]
    Invalid(&'static str),
}

impl FrameError {
    /// Whether this is a protocol error (bad framing) as opposed to a
    /// validation error (well-framed but rejected payload). Both abort the
    /// read loop without a close handshake.
    pub fn is_protocol(&self) -> bool {
        matches!(self, FrameError::MissingSeparator | FrameError::UnknownType(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_auth_frame() {
        let frame = parse(r#"auth,{"session":42,"token":"t","actions":[]}"#).unwrap();
        match frame {
            Frame::Auth(options) => {
                assert_eq!(options.script, 42);
                assert_eq!(options.token, "t");
                assert!(options.actions.is_empty());
            }
            other => panic!("expected auth frame, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_msg_frame_is_opaque() {
        let frame = parse(r#"msg,{"anything":"goes"}"#).unwrap();
        match frame {
            Frame::Msg(payload) => assert_eq!(payload, r#"{"anything":"goes"}"#),
            other => panic!("expected msg frame, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_separator_is_protocol_error() {
        let err = parse("garbage").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = parse("ping,{}").unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_bad_json_is_validation_error() {
        let err = parse("auth,{not json").unwrap_err();
        assert!(!err.is_protocol());
    }

    #[test]
    fn test_session_must_be_positive() {
        assert!(parse(r#"auth,{"session":0,"token":"t","actions":[]}"#).is_err());
        assert!(parse(r#"auth,{"session":-3,"token":"t","actions":[]}"#).is_err());
    }

    #[test]
    fn test_token_bounds() {
        assert!(parse(r#"auth,{"session":1,"token":"","actions":[]}"#).is_err());

        let long = "x".repeat(1025);
        let frame = format!(r#"auth,{{"session":1,"token":"{}","actions":[]}}"#, long);
        assert!(parse(&frame).is_err());

        let max = "x".repeat(1024);
        let frame = format!(r#"auth,{{"session":1,"token":"{}","actions":[]}}"#, max);
        assert!(parse(&frame).is_ok());
    }

    #[test]
    fn test_token_must_be_printable_ascii() {
        assert!(parse("auth,{\"session\":1,\"token\":\"a\\u0001b\",\"actions\":[]}").is_err());
        assert!(parse(r#"auth,{"session":1,"token":"tökén","actions":[]}"#).is_err());
    }

    #[test]
    fn test_actions_must_arrive_empty() {
        assert!(parse(r#"auth,{"session":1,"token":"t","actions":["READ"]}"#).is_err());
    }
}
