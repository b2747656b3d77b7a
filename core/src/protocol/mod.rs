//! Framed multiplex protocol.
//!
//! Every frame is one UTF-8 JSON object on its own line. A request
//! carries `{ticket, cmd, ...args}`, a response `{ticket, code,
//! ...fields}` with `code = 0` for success and `msg` alongside any
//! non-zero code. Tickets are caller-chosen opaque strings; correlation
//! is by ticket only, never by arrival order.

pub mod client;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::error::CorralError;

/// A malformed frame. Unlike [`CorralError`], this is a transport-level
/// failure: the connection that produced it is torn down rather than
/// answered.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("frame has no string `ticket`")]
    MissingTicket,

    #[error("frame has neither `cmd` nor `code`")]
    Unclassifiable,
}

/// A request frame: `{ticket, cmd, ...args}`.
#[derive(Debug, Clone)]
pub struct Request {
    pub ticket: String,
    pub cmd: String,
    pub args: Map<String, Value>,
}

/// A response frame: `{ticket, code, ...fields}`.
#[derive(Debug, Clone)]
pub struct Response {
    pub ticket: String,
    pub code: i64,
    pub fields: Map<String, Value>,
}

/// Any inbound frame, classified by the presence of `cmd`.
#[derive(Debug, Clone)]
pub enum Frame {
    Request(Request),
    Response(Response),
}

impl Frame {
    /// Parse one NDJSON line into a frame.
    pub fn parse(line: &str) -> Result<Frame, FrameError> {
        let value: Value = serde_json::from_str(line)?;
        let Value::Object(mut map) = value else {
            return Err(FrameError::NotAnObject);
        };
        let ticket = match map.remove("ticket") {
            Some(Value::String(t)) => t,
            _ => return Err(FrameError::MissingTicket),
        };
        if let Some(cmd) = map.remove("cmd") {
            let Value::String(cmd) = cmd else {
                return Err(FrameError::Unclassifiable);
            };
            return Ok(Frame::Request(Request {
                ticket,
                cmd,
                args: map,
            }));
        }
        match map.remove("code") {
            Some(Value::Number(n)) => Ok(Frame::Response(Response {
                ticket,
                code: n.as_i64().ok_or(FrameError::Unclassifiable)?,
                fields: map,
            })),
            _ => Err(FrameError::Unclassifiable),
        }
    }

    pub fn ticket(&self) -> &str {
        match self {
            Frame::Request(r) => &r.ticket,
            Frame::Response(r) => &r.ticket,
        }
    }
}

impl Request {
    /// Build a request with args taken from a JSON object.
    ///
    /// Panics if `args` serializes to anything but an object; callers
    /// pass `serde_json::json!({...})` literals.
    pub fn new(ticket: impl Into<String>, cmd: impl Into<String>, args: Value) -> Self {
        let Value::Object(args) = args else {
            panic!("request args must be a JSON object");
        };
        Self {
            ticket: ticket.into(),
            cmd: cmd.into(),
            args,
        }
    }

    /// Extract a required argument, type-checked.
    pub fn arg<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T, CorralError> {
        let value = self
            .args
            .get(name)
            .ok_or_else(|| CorralError::BadRequest(format!("missing field `{name}`")))?;
        serde_json::from_value(value.clone()).map_err(|_| {
            CorralError::BadRequest(format!(
                "field `{name}` should be {}, got {}",
                std::any::type_name::<T>(),
                type_label(value)
            ))
        })
    }

    /// Extract an optional argument; absent and `null` both read as `None`.
    pub fn opt_arg<T: serde::de::DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, CorralError> {
        match self.args.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|_| {
                CorralError::BadRequest(format!(
                    "field `{name}` should be {}, got {}",
                    std::any::type_name::<T>(),
                    type_label(value)
                ))
            }),
        }
    }

    /// Serialize to one NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> String {
        let mut map = Map::new();
        map.insert("ticket".into(), Value::String(self.ticket.clone()));
        map.insert("cmd".into(), Value::String(self.cmd.clone()));
        for (k, v) in &self.args {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map).to_string()
    }
}

impl Response {
    /// A success response; `body` must serialize to a JSON object.
    pub fn ok(ticket: impl Into<String>, body: Value) -> Self {
        let Value::Object(fields) = body else {
            panic!("response body must be a JSON object");
        };
        Self {
            ticket: ticket.into(),
            code: 0,
            fields,
        }
    }

    /// An error response carrying the error's wire code and message.
    pub fn err(ticket: impl Into<String>, err: &CorralError) -> Self {
        let mut fields = Map::new();
        fields.insert("msg".into(), Value::String(err.to_string()));
        Self {
            ticket: ticket.into(),
            code: err.code(),
            fields,
        }
    }

    /// Success fields, or the reconstructed error for non-zero codes.
    pub fn into_result(self) -> Result<Map<String, Value>, CorralError> {
        if self.code == 0 {
            Ok(self.fields)
        } else {
            let msg = self
                .fields
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            Err(CorralError::from_wire(self.code, msg))
        }
    }

    /// Serialize to one NDJSON line (without the trailing newline).
    pub fn to_line(&self) -> String {
        let mut map = Map::new();
        map.insert("ticket".into(), Value::String(self.ticket.clone()));
        map.insert("code".into(), Value::Number(self.code.into()));
        for (k, v) in &self.fields {
            map.insert(k.clone(), v.clone());
        }
        Value::Object(map).to_string()
    }
}

fn type_label(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_request_frame() {
        let line = r#"{"ticket":"t-1","cmd":"ps","filt":"alice"}"#;
        let Frame::Request(req) = Frame::parse(line).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(req.ticket, "t-1");
        assert_eq!(req.cmd, "ps");
        assert_eq!(req.arg::<String>("filt").unwrap(), "alice");
    }

    #[test]
    fn parse_response_frame() {
        let line = r#"{"ticket":"t-2","code":0,"user":"alice"}"#;
        let Frame::Response(resp) = Frame::parse(line).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.ticket, "t-2");
        assert_eq!(resp.code, 0);
        let fields = resp.into_result().unwrap();
        assert_eq!(fields["user"], "alice");
    }

    #[test]
    fn error_response_reconstructs_error() {
        let line = r#"{"ticket":"t-3","code":7,"msg":"no permission for command"}"#;
        let Frame::Response(resp) = Frame::parse(line).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(resp.into_result().unwrap_err(), CorralError::NoPermission);
    }

    #[test]
    fn frame_without_ticket_is_rejected() {
        assert!(matches!(
            Frame::parse(r#"{"cmd":"ps"}"#),
            Err(FrameError::MissingTicket)
        ));
    }

    #[test]
    fn frame_with_neither_cmd_nor_code_is_rejected() {
        assert!(matches!(
            Frame::parse(r#"{"ticket":"t"}"#),
            Err(FrameError::Unclassifiable)
        ));
    }

    #[test]
    fn request_round_trip() {
        let req = Request::new("abc", "run", json!({"name": "job", "n_gpus": 2}));
        let Frame::Request(back) = Frame::parse(&req.to_line()).unwrap() else {
            panic!("expected request");
        };
        assert_eq!(back.cmd, "run");
        assert_eq!(back.arg::<usize>("n_gpus").unwrap(), 2);
    }

    #[test]
    fn response_round_trip_keeps_fields() {
        let resp = Response::ok("abc", json!({"containers": {"deadbeef": {"name": "x"}}}));
        let Frame::Response(back) = Frame::parse(&resp.to_line()).unwrap() else {
            panic!("expected response");
        };
        assert_eq!(back.code, 0);
        assert_eq!(back.fields["containers"]["deadbeef"]["name"], "x");
    }

    #[test]
    fn typed_arg_errors_name_the_field() {
        let req = Request::new("t", "tcpconn", json!({"port": "not-a-number"}));
        let err = req.arg::<u16>("port").unwrap_err();
        assert_eq!(err.code(), 8);
        assert!(err.to_string().contains("port"));
    }

    #[test]
    fn opt_arg_treats_null_as_absent() {
        let req = Request::new("t", "ps", json!({"filt": null}));
        assert_eq!(req.opt_arg::<String>("filt").unwrap(), None);
        assert_eq!(req.opt_arg::<String>("missing").unwrap(), None);
    }
}
