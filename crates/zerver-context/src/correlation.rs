//! Correlation-Id Extraction
//!
//! Picks the request id for a context, in priority order: a strict W3C
//! `traceparent`, then `x-request-id`, then `x-correlation-id`, then a
//! freshly generated 128-bit hex id.

use uuid::Uuid;

use crate::context::Context;

const TRACEPARENT: &str = "traceparent";
const X_REQUEST_ID: &str = "x-request-id";
const X_CORRELATION_ID: &str = "x-correlation-id";

/// Parse a W3C `traceparent` header value and return the trace id.
///
/// Strict: `version(2)-traceid(32)-spanid(16)-flags(2)`, every group
/// lowercase hex, trace id and span id not all zeros. Any deviation
/// rejects the whole header.
pub fn parse_traceparent(value: &[u8]) -> Option<String> {
    let s = std::str::from_utf8(value).ok()?;
    let mut parts = s.split('-');

    let version = parts.next()?;
    let trace_id = parts.next()?;
    let span_id = parts.next()?;
    let flags = parts.next()?;
    if parts.next().is_some() {
        return None;
    }

    if version.len() != 2 || trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
        return None;
    }
    for group in [version, trace_id, span_id, flags] {
        if !group
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return None;
        }
    }
    if trace_id.bytes().all(|b| b == b'0') || span_id.bytes().all(|b| b == b'0') {
        return None;
    }

    Some(trace_id.to_string())
}

/// Generate a 128-bit hex request id from a CSPRNG.
pub fn generate_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Resolve the request id for this context and store it.
///
/// Returns the chosen id. Generation is skipped whenever any inbound
/// header supplies one.
pub fn correlate(ctx: &mut Context) -> String {
    let id = extract(ctx).unwrap_or_else(generate_request_id);
    ctx.set_request_id(id.clone());
    id
}

fn extract(ctx: &Context) -> Option<String> {
    if let Some(raw) = ctx.header(TRACEPARENT) {
        if let Some(trace_id) = parse_traceparent(raw) {
            return Some(trace_id);
        }
        tracing::debug!("rejecting malformed traceparent header");
    }
    for name in [X_REQUEST_ID, X_CORRELATION_ID] {
        if let Some(value) = ctx.header_str(name) {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01";

    #[test]
    fn test_valid_traceparent() {
        assert_eq!(
            parse_traceparent(VALID.as_bytes()),
            Some("4bf92f3577b34da6a3ce929d0e0e4736".to_string())
        );
    }

    #[test]
    fn test_rejects_malformed() {
        // Wrong group lengths
        assert_eq!(parse_traceparent(b"00-abc-def-01"), None);
        // Uppercase hex
        let upper = VALID.to_uppercase();
        assert_eq!(parse_traceparent(upper.as_bytes()), None);
        // Non-hex bytes
        let bad = VALID.replace('4', "g");
        assert_eq!(parse_traceparent(bad.as_bytes()), None);
        // Trailing group
        let extra = format!("{VALID}-00");
        assert_eq!(parse_traceparent(extra.as_bytes()), None);
        // All-zero trace id
        assert_eq!(
            parse_traceparent(b"00-00000000000000000000000000000000-00f067aa0ba902b7-01"),
            None
        );
        // All-zero span id
        assert_eq!(
            parse_traceparent(b"00-4bf92f3577b34da6a3ce929d0e0e4736-0000000000000000-01"),
            None
        );
        // Not UTF-8
        assert_eq!(parse_traceparent(&[0xff; 55]), None);
    }

    #[test]
    fn test_traceparent_wins_over_request_id() {
        let mut ctx = Context::new("GET", "/");
        ctx.set_header("traceparent", VALID.as_bytes().to_vec());
        ctx.set_header("x-request-id", b"other".to_vec());

        let id = correlate(&mut ctx);
        assert_eq!(id, "4bf92f3577b34da6a3ce929d0e0e4736");
        assert_eq!(ctx.request_id(), "4bf92f3577b34da6a3ce929d0e0e4736");
    }

    #[test]
    fn test_fallback_priority() {
        let mut ctx = Context::new("GET", "/");
        ctx.set_header("x-correlation-id", b"corr".to_vec());
        ctx.set_header("x-request-id", b"req".to_vec());
        assert_eq!(correlate(&mut ctx), "req");

        let mut ctx = Context::new("GET", "/");
        ctx.set_header("x-correlation-id", b"corr".to_vec());
        assert_eq!(correlate(&mut ctx), "corr");
    }

    #[test]
    fn test_malformed_traceparent_falls_through() {
        let mut ctx = Context::new("GET", "/");
        ctx.set_header("traceparent", b"00-bad".to_vec());
        ctx.set_header("x-request-id", b"req".to_vec());
        assert_eq!(correlate(&mut ctx), "req");
    }

    #[test]
    fn test_generated_id_shape() {
        let mut ctx = Context::new("GET", "/");
        let id = correlate(&mut ctx);
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));

        let other = generate_request_id();
        assert_ne!(id, other);
    }
}
