//! Declarative Effects
//!
//! An `Effect` describes one unit of I/O the pipeline wants performed on its
//! behalf: what to do (`EffectKind`), against which service (`target`),
//! where the result bytes land (`token` slot), how long to wait, whether the
//! request can survive its failure, and how to retry.
//!
//! The core never performs the I/O itself; effects are handed to a
//! host-supplied runner.

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::retry::Retry;

/// HTTP verbs an effect may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Patch,
    Options,
    Trace,
    Connect,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
            Self::Connect => "CONNECT",
        }
    }

    fn kind_suffix(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Head => "head",
            Self::Post => "post",
            Self::Put => "put",
            Self::Delete => "delete",
            Self::Patch => "patch",
            Self::Options => "options",
            Self::Trace => "trace",
            Self::Connect => "connect",
        }
    }
}

/// Raw TCP operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum TcpOp {
    Connect,
    Send { payload: Vec<u8> },
    Receive { max_bytes: usize },
    SendReceive { payload: Vec<u8>, max_bytes: usize },
    Close,
}

/// gRPC call shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum GrpcOp {
    Unary { message: Vec<u8> },
    ServerStream { message: Vec<u8> },
}

/// WebSocket operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum WsOp {
    Connect,
    Send { payload: Vec<u8> },
    Receive,
}

/// Database operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum DbOp {
    Get {
        key: String,
    },
    Put {
        key: String,
        value: Vec<u8>,
    },
    Del {
        key: String,
    },
    Query {
        sql: String,
        params: Vec<serde_json::Value>,
    },
    Scan {
        prefix: String,
    },
}

/// JSON file operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum FileOp {
    Read { path: String },
    Write { path: String, value: serde_json::Value },
}

/// KV cache operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum KvOp {
    Get {
        key: String,
    },
    Set {
        key: String,
        value: Vec<u8>,
        ttl_ms: Option<u64>,
    },
    Delete {
        key: String,
    },
}

/// What an effect actually does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    Http {
        method: HttpMethod,
        url: String,
        body: Option<Vec<u8>>,
    },
    Tcp(TcpOp),
    Grpc {
        service: String,
        method: String,
        op: GrpcOp,
    },
    WebSocket(WsOp),
    Db(DbOp),
    File(FileOp),
    Compute {
        task: String,
        input: Vec<u8>,
    },
    Accelerator {
        task: String,
        input: Vec<u8>,
    },
    KvCache(KvOp),
}

impl EffectKind {
    /// Canonical snake-case kind string used by telemetry and the OTLP
    /// semantic-attribute mapping.
    pub fn kind_str(&self) -> &'static str {
        match self {
            Self::Http { method, .. } => match method.kind_suffix() {
                "get" => "http_get",
                "head" => "http_head",
                "post" => "http_post",
                "put" => "http_put",
                "delete" => "http_delete",
                "patch" => "http_patch",
                "options" => "http_options",
                "trace" => "http_trace",
                _ => "http_connect",
            },
            Self::Tcp(op) => match op {
                TcpOp::Connect => "tcp_connect",
                TcpOp::Send { .. } => "tcp_send",
                TcpOp::Receive { .. } => "tcp_receive",
                TcpOp::SendReceive { .. } => "tcp_send_receive",
                TcpOp::Close => "tcp_close",
            },
            Self::Grpc { op, .. } => match op {
                GrpcOp::Unary { .. } => "grpc_unary",
                GrpcOp::ServerStream { .. } => "grpc_server_stream",
            },
            Self::WebSocket(op) => match op {
                WsOp::Connect => "websocket_connect",
                WsOp::Send { .. } => "websocket_send",
                WsOp::Receive => "websocket_receive",
            },
            Self::Db(op) => match op {
                DbOp::Get { .. } => "db_get",
                DbOp::Put { .. } => "db_put",
                DbOp::Del { .. } => "db_del",
                DbOp::Query { .. } => "db_query",
                DbOp::Scan { .. } => "db_scan",
            },
            Self::File(op) => match op {
                FileOp::Read { .. } => "file_read",
                FileOp::Write { .. } => "file_write",
            },
            Self::Compute { .. } => "compute_task",
            Self::Accelerator { .. } => "accelerator_task",
            Self::KvCache(op) => match op {
                KvOp::Get { .. } => "kv_cache_get",
                KvOp::Set { .. } => "kv_cache_set",
                KvOp::Delete { .. } => "kv_cache_delete",
            },
        }
    }

    /// The most specific identifier in the operation: url, key, sql, path
    /// or task name. Used for telemetry attributes.
    pub fn detail(&self) -> Option<&str> {
        match self {
            Self::Http { url, .. } => Some(url),
            Self::Tcp(_) => None,
            Self::Grpc { method, .. } => Some(method),
            Self::WebSocket(_) => None,
            Self::Db(op) => match op {
                DbOp::Get { key } | DbOp::Put { key, .. } | DbOp::Del { key } => Some(key),
                DbOp::Query { sql, .. } => Some(sql),
                DbOp::Scan { prefix } => Some(prefix),
            },
            Self::File(op) => match op {
                FileOp::Read { path } | FileOp::Write { path, .. } => Some(path),
            },
            Self::Compute { task, .. } | Self::Accelerator { task, .. } => Some(task),
            Self::KvCache(op) => match op {
                KvOp::Get { key } | KvOp::Set { key, .. } | KvOp::Delete { key } => Some(key),
            },
        }
    }
}

/// One declarative I/O request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Effect {
    /// Service selector; also the circuit-breaker key when one is registered.
    pub target: String,
    /// Slot id where the result bytes are stored on success.
    pub token: u32,
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Required effects fail the need per its join policy; optional ones
    /// merely skip their slot.
    pub required: bool,
    pub retry: Retry,
    pub kind: EffectKind,
}

const DEFAULT_EFFECT_TIMEOUT_MS: u64 = 5_000;

impl Effect {
    pub fn new(target: impl Into<String>, token: u32, kind: EffectKind) -> Self {
        Self {
            target: target.into(),
            token,
            timeout_ms: DEFAULT_EFFECT_TIMEOUT_MS,
            required: true,
            retry: Retry::none(),
            kind,
        }
    }

    pub fn http(
        method: HttpMethod,
        target: impl Into<String>,
        url: impl Into<String>,
        token: u32,
    ) -> Self {
        Self::new(
            target,
            token,
            EffectKind::Http {
                method,
                url: url.into(),
                body: None,
            },
        )
    }

    pub fn http_get(target: impl Into<String>, url: impl Into<String>, token: u32) -> Self {
        Self::http(HttpMethod::Get, target, url, token)
    }

    pub fn http_post(
        target: impl Into<String>,
        url: impl Into<String>,
        body: Vec<u8>,
        token: u32,
    ) -> Self {
        Self::new(
            target,
            token,
            EffectKind::Http {
                method: HttpMethod::Post,
                url: url.into(),
                body: Some(body),
            },
        )
    }

    pub fn db_get(target: impl Into<String>, key: impl Into<String>, token: u32) -> Self {
        Self::new(target, token, EffectKind::Db(DbOp::Get { key: key.into() }))
    }

    pub fn db_query(
        target: impl Into<String>,
        sql: impl Into<String>,
        params: Vec<serde_json::Value>,
        token: u32,
    ) -> Self {
        Self::new(
            target,
            token,
            EffectKind::Db(DbOp::Query {
                sql: sql.into(),
                params,
            }),
        )
    }

    pub fn kv_get(target: impl Into<String>, key: impl Into<String>, token: u32) -> Self {
        Self::new(
            target,
            token,
            EffectKind::KvCache(KvOp::Get { key: key.into() }),
        )
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    /// Mark the effect as optional: its failure never fails the need.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn kind_str(&self) -> &'static str {
        self.kind.kind_str()
    }
}

/// Who owns (and therefore frees) a result buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufOwner {
    /// Owned by the request context; dropped with it.
    Context,
    /// Caller-managed; the runner retains responsibility.
    Caller,
    /// Static data, never freed.
    Static,
}

/// Terminal outcome of one effect attempt.
#[derive(Debug, Clone, PartialEq)]
#[allow(clippy::large_enum_variant)]
pub enum EffectResult {
    Success { bytes: Vec<u8>, owner: BufOwner },
    Failure(Error),
}

impl EffectResult {
    pub fn ok(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Success {
            bytes: bytes.into(),
            owner: BufOwner::Context,
        }
    }

    pub fn fail(error: Error) -> Self {
        Self::Failure(error)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn error(&self) -> Option<&Error> {
        match self {
            Self::Failure(e) => Some(e),
            Self::Success { .. } => None,
        }
    }
}
