//! Responses
//!
//! The terminal value of a request: status, borrowed-shape header list and
//! a body that is either complete bytes or a streaming source.

use serde::Serialize;

pub const CONTENT_TYPE: &str = "content-type";
pub const APPLICATION_JSON: &str = "application/json";
pub const TEXT_PLAIN: &str = "text/plain";

/// Pull-based streaming body. The transport drains chunks until `None`.
pub trait BodyStream: Send {
    fn next_chunk(&mut self) -> Option<Vec<u8>>;
}

/// Response body: fully materialized or streamed.
pub enum Body {
    Complete(Vec<u8>),
    Streaming(Box<dyn BodyStream>),
}

impl Body {
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::Complete(b) => Some(b.len()),
            Self::Streaming(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Complete(b) if b.is_empty())
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Self::Streaming(_))
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete(b) => write!(f, "Body::Complete({} bytes)", b.len()),
            Self::Streaming(_) => write!(f, "Body::Streaming"),
        }
    }
}

/// An HTTP response produced by a step or the error renderer.
#[derive(Debug)]
pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

impl Response {
    /// Empty response with the given status and no Content-Type.
    pub fn with_status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Body::Complete(Vec::new()),
        }
    }

    /// JSON response. Serialization of `serde_json::Value` and plain data
    /// types cannot fail here; structures with failing serializers should
    /// use `try_json`.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        let bytes = serde_json::to_vec(value).unwrap_or_default();
        Self {
            status,
            headers: vec![(CONTENT_TYPE.to_string(), APPLICATION_JSON.to_string())],
            body: Body::Complete(bytes),
        }
    }

    /// JSON response from any serializable value.
    pub fn try_json<T: Serialize>(status: u16, value: &T) -> Result<Self, serde_json::Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Self {
            status,
            headers: vec![(CONTENT_TYPE.to_string(), APPLICATION_JSON.to_string())],
            body: Body::Complete(bytes),
        })
    }

    /// Raw JSON bytes the caller already serialized.
    pub fn json_bytes(status: u16, bytes: Vec<u8>) -> Self {
        Self {
            status,
            headers: vec![(CONTENT_TYPE.to_string(), APPLICATION_JSON.to_string())],
            body: Body::Complete(bytes),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: vec![(CONTENT_TYPE.to_string(), TEXT_PLAIN.to_string())],
            body: Body::Complete(body.into().into_bytes()),
        }
    }

    pub fn streaming(status: u16, content_type: &str, stream: Box<dyn BodyStream>) -> Self {
        Self {
            status,
            headers: vec![(CONTENT_TYPE.to_string(), content_type.to_string())],
            body: Body::Streaming(stream),
        }
    }

    /// Append a header. Names are stored lowercased so transports can
    /// compare without re-folding.
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
        self
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_ascii_lowercase(), value.into()));
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == lower)
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(CONTENT_TYPE)
    }

    pub fn body_bytes(&self) -> Option<&[u8]> {
        match &self.body {
            Body::Complete(b) => Some(b),
            Body::Streaming(_) => None,
        }
    }
}
