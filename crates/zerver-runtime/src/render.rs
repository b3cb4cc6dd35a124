//! Error Renderer
//!
//! Maps a request `Error` to its HTTP response: status from the code
//! table, JSON body with escaped context strings, and always exactly one
//! Content-Type header.

use serde_json::json;

use zerver_types::{Error, Response};

/// Render an error as the client-visible response.
///
/// The body is `{"error":{"code":K,"what":…,"key":…}}`; serialization
/// escapes both strings, so raw user input never reaches the body
/// unescaped. If JSON assembly itself fails, a plain-text 500 is
/// returned instead.
pub fn render(err: &Error) -> Response {
    let status = err.http_status();
    let body = json!({
        "error": {
            "code": status,
            "what": err.what,
            "key": err.key,
        }
    });
    match serde_json::to_vec(&body) {
        Ok(bytes) => Response::json_bytes(status, bytes),
        Err(e) => {
            tracing::error!("error body serialization failed: {e}");
            Response::text(500, "Internal Server Error")
        }
    }
}
