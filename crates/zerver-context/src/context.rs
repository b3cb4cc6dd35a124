//! Request Context
//!
//! Owns all state a single request accumulates: the parsed request line,
//! header/param/query mappings, the slot store, exit callbacks, identity
//! and the last-observed error. Everything inside is owned by the context
//! and dropped in bulk when the request ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use smallvec::SmallVec;

use zerver_types::Error;

use crate::slots::SlotValue;

/// Process-wide monotonic request-id source.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Header names at or below this length lowercase on the stack.
const HEADER_NAME_STACK_LEN: usize = 64;

type ExitCallback = Box<dyn FnOnce(&mut Context) + Send>;

/// Per-request state. Owned by the request task; nothing inside outlives
/// the request.
pub struct Context {
    method: String,
    path: String,
    client_ip: Option<String>,
    body: Vec<u8>,

    /// Keys lowercased on insert; values are raw bytes (obs-text passes
    /// through untouched).
    headers: HashMap<String, Vec<u8>>,
    path_params: HashMap<String, String>,
    query_params: HashMap<String, String>,

    slots: HashMap<u32, SlotValue>,
    exit_callbacks: Vec<ExitCallback>,

    status: u16,
    request_id: String,
    user: Option<String>,
    started_at: DateTime<Utc>,
    last_error: Option<Error>,
}

impl Context {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            client_ip: None,
            body: Vec::new(),
            headers: HashMap::new(),
            path_params: HashMap::new(),
            query_params: HashMap::new(),
            slots: HashMap::new(),
            exit_callbacks: Vec::new(),
            status: 200,
            request_id: String::new(),
            user: None,
            started_at: Utc::now(),
            last_error: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    pub fn set_client_ip(&mut self, ip: impl Into<String>) {
        self.client_ip = Some(ip.into());
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_body(&mut self, body: Vec<u8>) {
        self.body = body;
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    // ── Headers ─────────────────────────────────────────────────────────

    /// Insert a header; the name is lowercased once at insert time.
    pub fn set_header(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    /// Case-insensitive header lookup. Short names lowercase into a stack
    /// buffer; long names fall back to a heap allocation.
    pub fn header(&self, name: &str) -> Option<&[u8]> {
        if name.len() <= HEADER_NAME_STACK_LEN {
            let mut buf: SmallVec<[u8; HEADER_NAME_STACK_LEN]> = SmallVec::new();
            buf.extend(name.bytes().map(|b| b.to_ascii_lowercase()));
            // Header names are ASCII tokens, so byte-wise lowercasing is a
            // valid str transformation.
            let lower = std::str::from_utf8(&buf).ok()?;
            self.headers.get(lower).map(|v| v.as_slice())
        } else {
            self.headers
                .get(&name.to_ascii_lowercase())
                .map(|v| v.as_slice())
        }
    }

    /// UTF-8 view of a header value, when it is valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.header(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    // ── Params ──────────────────────────────────────────────────────────

    pub fn set_param(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.path_params.insert(name.into(), value.into());
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.path_params.get(name).map(|s| s.as_str())
    }

    pub fn set_query(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.query_params.insert(name.into(), value.into());
    }

    pub fn query(&self, name: &str) -> Option<&str> {
        self.query_params.get(name).map(|s| s.as_str())
    }

    // ── Identity ────────────────────────────────────────────────────────

    /// Assign a request id if none is set yet. Ids from a process-wide
    /// atomic counter are unique and stable across subsequent reads.
    pub fn ensure_request_id(&mut self) -> &str {
        if self.request_id.is_empty() {
            let n = NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
            self.request_id = n.to_string();
        }
        &self.request_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Overwrite the request id with an extracted correlation value.
    pub fn set_request_id(&mut self, id: impl Into<String>) {
        self.request_id = id.into();
    }

    pub fn set_user(&mut self, sub: &str) {
        self.user = Some(sub.to_string());
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    // ── Slots ───────────────────────────────────────────────────────────

    /// Store a value at a slot. Byte values are owned copies; nothing in
    /// the store aliases caller memory.
    pub fn slot_put(&mut self, id: u32, value: impl Into<SlotValue>) {
        self.slots.insert(id, value.into());
    }

    pub fn slot_get(&self, id: u32) -> Option<&SlotValue> {
        self.slots.get(&id)
    }

    pub fn slot_contains(&self, id: u32) -> bool {
        self.slots.contains_key(&id)
    }

    // ── Exit callbacks ──────────────────────────────────────────────────

    /// Register a callback to run at request end. Callbacks run in reverse
    /// insertion order regardless of outcome.
    pub fn on_exit(&mut self, cb: impl FnOnce(&mut Context) + Send + 'static) {
        self.exit_callbacks.push(Box::new(cb));
    }

    /// Drain and run exit callbacks LIFO. Runs each at most once; calling
    /// again is a no-op.
    pub fn drain_exit_callbacks(&mut self) {
        let callbacks = std::mem::take(&mut self.exit_callbacks);
        for cb in callbacks.into_iter().rev() {
            cb(self);
        }
    }

    // ── Outcome bookkeeping ─────────────────────────────────────────────

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn record_error(&mut self, error: Error) {
        self.last_error = Some(error);
    }

    pub fn last_error(&self) -> Option<&Error> {
        self.last_error.as_ref()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("request_id", &self.request_id)
            .field("status", &self.status)
            .field("headers", &self.headers.len())
            .field("slots", &self.slots.len())
            .field("exit_callbacks", &self.exit_callbacks.len())
            .finish()
    }
}
