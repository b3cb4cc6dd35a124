//! OTLP Export
//!
//! Payload assembly plus the background exporter. Subscribers must never
//! block the request task, so finished span trees are pushed onto a
//! channel and a dedicated thread drains it, sending each payload with
//! bounded retries.

use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender};
use serde_json::{json, Value};

use super::span::Span;
use crate::config::OtlpConfig;

const MAX_SEND_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 100;
/// Exponential schedule applied between attempts.
const BACKOFF_MULTIPLIERS: [u64; 5] = [1, 2, 4, 8, 16];

/// Identity attached once per exporter as the OTLP resource.
#[derive(Debug, Clone)]
pub struct Resource {
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
}

impl Resource {
    pub fn new(environment: impl Into<String>) -> Self {
        Self {
            service_name: "zerver".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: environment.into(),
        }
    }

    fn to_json(&self) -> Value {
        let attr = |key: &str, value: &str| {
            json!({ "key": key, "value": { "stringValue": value } })
        };
        json!({
            "attributes": [
                attr("service.name", &self.service_name),
                attr("service.version", &self.service_version),
                attr("deployment.environment", &self.environment),
                attr("telemetry.sdk.name", "zerver-telemetry"),
                attr("telemetry.sdk.language", "rust"),
                attr("telemetry.sdk.version", env!("CARGO_PKG_VERSION")),
            ]
        })
    }
}

/// One request's span tree as a complete OTLP JSON document.
pub fn build_payload(resource: &Resource, spans: &[Span]) -> Value {
    json!({
        "resourceSpans": [{
            "resource": resource.to_json(),
            "scopeSpans": [{
                "scope": {
                    "name": "zerver-telemetry",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "spans": spans.iter().map(|s| s.to_json()).collect::<Vec<_>>(),
            }],
        }],
    })
}

/// Where finished payloads go. The exporter is the production sink; tests
/// swap in `MemorySink`.
pub trait ExportSink: Send + Sync {
    fn export(&self, payload: Value);
}

/// Collects payloads in memory.
#[derive(Default)]
pub struct MemorySink {
    payloads: Mutex<Vec<Value>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn payloads(&self) -> Vec<Value> {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ExportSink for MemorySink {
    fn export(&self, payload: Value) {
        self.payloads
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(payload);
    }
}

/// Transport behind the exporter thread. Returns the HTTP status.
pub trait OtlpTransport: Send + Sync {
    fn send(&self, body: &[u8]) -> Result<u16, String>;
}

/// Blocking HTTP transport. Lives on the exporter thread only.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: String,
    headers: Vec<(String, String)>,
}

impl HttpTransport {
    pub fn new(config: &OtlpConfig) -> Self {
        Self {
            client: reqwest::blocking::Client::new(),
            endpoint: config.endpoint.clone(),
            headers: config.headers.clone(),
        }
    }
}

impl OtlpTransport for HttpTransport {
    fn send(&self, body: &[u8]) -> Result<u16, String> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .body(body.to_vec());
        for (name, value) in &self.headers {
            req = req.header(name, value);
        }
        let resp = req.send().map_err(|e| e.to_string())?;
        Ok(resp.status().as_u16())
    }
}

/// Background exporter: a channel feeding one sender thread.
pub struct OtlpExporter {
    tx: Option<Sender<Value>>,
    handle: Option<JoinHandle<()>>,
}

impl OtlpExporter {
    pub fn spawn(transport: Box<dyn OtlpTransport>) -> Self {
        let (tx, rx) = unbounded::<Value>();
        let handle = std::thread::Builder::new()
            .name("otlp-export".to_string())
            .spawn(move || {
                for payload in rx {
                    send_with_retry(transport.as_ref(), &payload);
                }
            })
            .ok();
        if handle.is_none() {
            tracing::error!("failed to spawn OTLP export thread; payloads will be dropped");
        }
        Self {
            tx: Some(tx),
            handle,
        }
    }

    /// Flush the queue and stop the thread.
    pub fn shutdown(mut self) {
        self.close();
    }

    fn close(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("OTLP export thread panicked");
            }
        }
    }
}

impl ExportSink for OtlpExporter {
    fn export(&self, payload: Value) {
        if let Some(tx) = &self.tx {
            if tx.send(payload).is_err() {
                tracing::error!("OTLP export queue closed; dropping payload");
            }
        }
    }
}

impl Drop for OtlpExporter {
    fn drop(&mut self) {
        self.close();
    }
}

fn retryable(status: u16) -> bool {
    status == 429 || status >= 500
}

fn send_with_retry(transport: &dyn OtlpTransport, payload: &Value) {
    let body = payload.to_string().into_bytes();
    for attempt in 1..=MAX_SEND_ATTEMPTS {
        match transport.send(&body) {
            Ok(status) if (200..300).contains(&status) => return,
            Ok(status) if !retryable(status) => {
                tracing::error!(status, "OTLP endpoint rejected payload; dropping");
                return;
            }
            Ok(status) => {
                tracing::warn!(status, attempt, "retryable OTLP export failure");
            }
            Err(e) => {
                tracing::warn!(attempt, "OTLP transport error: {e}");
            }
        }
        if attempt < MAX_SEND_ATTEMPTS {
            let idx = (attempt as usize - 1).min(BACKOFF_MULTIPLIERS.len() - 1);
            std::thread::sleep(Duration::from_millis(
                BACKOFF_BASE_MS * BACKOFF_MULTIPLIERS[idx],
            ));
        }
    }
    tracing::error!("OTLP export failed after {MAX_SEND_ATTEMPTS} attempts; dropping payload");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otlp::span::{Span, SpanKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_payload_shape() {
        let resource = Resource::new("test");
        let mut span = Span::new("t".repeat(32), None, "zerver.request", SpanKind::Server, 0);
        span.end(1);
        let payload = build_payload(&resource, &[span]);

        let res_attrs = &payload["resourceSpans"][0]["resource"]["attributes"];
        assert_eq!(res_attrs[0]["key"], "service.name");
        assert_eq!(res_attrs[0]["value"]["stringValue"], "zerver");
        let spans = &payload["resourceSpans"][0]["scopeSpans"][0]["spans"];
        assert_eq!(spans[0]["name"], "zerver.request");
    }

    struct FlakyTransport {
        calls: Arc<AtomicU32>,
        fail_times: u32,
    }

    impl OtlpTransport for FlakyTransport {
        fn send(&self, _body: &[u8]) -> Result<u16, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Ok(503)
            } else {
                Ok(200)
            }
        }
    }

    #[test]
    fn test_exporter_retries_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let exporter = OtlpExporter::spawn(Box::new(FlakyTransport {
            calls: calls.clone(),
            fail_times: 2,
        }));
        exporter.export(json!({"x": 1}));
        exporter.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exporter_gives_up_after_three_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let exporter = OtlpExporter::spawn(Box::new(FlakyTransport {
            calls: calls.clone(),
            fail_times: u32::MAX,
        }));
        exporter.export(json!({"x": 1}));
        exporter.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    struct RejectingTransport {
        calls: Arc<AtomicU32>,
    }

    impl OtlpTransport for RejectingTransport {
        fn send(&self, _body: &[u8]) -> Result<u16, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(400)
        }
    }

    #[test]
    fn test_non_retryable_status_drops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let exporter = OtlpExporter::spawn(Box::new(RejectingTransport {
            calls: calls.clone(),
        }));
        exporter.export(json!({"x": 1}));
        exporter.shutdown();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
