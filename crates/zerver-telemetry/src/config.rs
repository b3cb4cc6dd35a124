//! Telemetry Configuration
//!
//! Read once at bootstrap from `ZER_VER_*` environment variables.
//! Malformed values fall back to their defaults with a warning.

pub const ENV_PROMOTE_QUEUE_MS: &str = "ZER_VER_PROMOTE_QUEUE_MS";
pub const ENV_PROMOTE_PARK_MS: &str = "ZER_VER_PROMOTE_PARK_MS";
pub const ENV_DEBUG_JOBS: &str = "ZER_VER_DEBUG_JOBS";
pub const ENV_QUEUE_NAME_EFFECTS: &str = "ZER_VER_QUEUE_NAME_EFFECTS";
pub const ENV_QUEUE_NAME_CONT: &str = "ZER_VER_QUEUE_NAME_CONT";
pub const ENV_EXPORT_JOB_DEPTH: &str = "ZER_VER_EXPORT_JOB_DEPTH";
pub const ENV_OTLP_ENDPOINT: &str = "ZER_VER_OTLP_ENDPOINT";
pub const ENV_OTLP_HEADERS: &str = "ZER_VER_OTLP_HEADERS";
pub const ENV_ENVIRONMENT: &str = "ZER_VER_ENVIRONMENT";

const DEFAULT_PROMOTE_MS: u32 = 5;

/// OTLP transport settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtlpConfig {
    pub endpoint: String,
    /// Extra request headers, parsed from `key=value,key=value`.
    pub headers: Vec<(String, String)>,
}

/// Telemetry and job-promotion settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Promote a job span when its dequeue wait reaches this many ms.
    pub promote_queue_ms: u32,
    /// Promote a job span when its total parked time reaches this many ms.
    pub promote_park_ms: u32,
    /// Force-promote every job regardless of thresholds.
    pub debug_jobs: bool,
    pub queue_name_effects: String,
    pub queue_name_continuations: String,
    /// Attach the job's nesting depth as a span attribute.
    pub export_job_depth: bool,
    pub environment: String,
    pub otlp: Option<OtlpConfig>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            promote_queue_ms: DEFAULT_PROMOTE_MS,
            promote_park_ms: DEFAULT_PROMOTE_MS,
            debug_jobs: false,
            queue_name_effects: "effects".to_string(),
            queue_name_continuations: "continuations".to_string(),
            export_job_depth: false,
            environment: "development".to_string(),
            otlp: None,
        }
    }
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            promote_queue_ms: env_u32(ENV_PROMOTE_QUEUE_MS, defaults.promote_queue_ms),
            promote_park_ms: env_u32(ENV_PROMOTE_PARK_MS, defaults.promote_park_ms),
            debug_jobs: env_bool(ENV_DEBUG_JOBS, defaults.debug_jobs),
            queue_name_effects: env_string(ENV_QUEUE_NAME_EFFECTS, &defaults.queue_name_effects),
            queue_name_continuations: env_string(
                ENV_QUEUE_NAME_CONT,
                &defaults.queue_name_continuations,
            ),
            export_job_depth: env_bool(ENV_EXPORT_JOB_DEPTH, defaults.export_job_depth),
            environment: env_string(ENV_ENVIRONMENT, &defaults.environment),
            otlp: otlp_from_env(),
        }
    }
}

fn otlp_from_env() -> Option<OtlpConfig> {
    let endpoint = std::env::var(ENV_OTLP_ENDPOINT).ok()?;
    if endpoint.is_empty() {
        return None;
    }
    let headers = std::env::var(ENV_OTLP_HEADERS)
        .map(|raw| parse_header_list(&raw))
        .unwrap_or_default();
    Some(OtlpConfig { endpoint, headers })
}

/// Parse `key=value,key=value`; entries without `=` are skipped.
pub fn parse_header_list(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|pair| {
            let pair = pair.trim();
            if pair.is_empty() {
                return None;
            }
            match pair.split_once('=') {
                Some((k, v)) if !k.is_empty() => Some((k.trim().to_string(), v.trim().to_string())),
                _ => {
                    tracing::warn!("skipping malformed OTLP header entry: {pair:?}");
                    None
                }
            }
        })
        .collect()
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("{name}={raw:?} is not a u32; using default {default}");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" | "" => false,
            other => {
                tracing::warn!("{name}={other:?} is not a bool; using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = TelemetryConfig::default();
        assert_eq!(cfg.promote_queue_ms, 5);
        assert_eq!(cfg.promote_park_ms, 5);
        assert!(!cfg.debug_jobs);
        assert_eq!(cfg.queue_name_effects, "effects");
        assert_eq!(cfg.queue_name_continuations, "continuations");
        assert!(!cfg.export_job_depth);
        assert!(cfg.otlp.is_none());
    }

    #[test]
    fn test_parse_header_list() {
        let headers = parse_header_list("authorization=Bearer abc, x-tenant=prod");
        assert_eq!(
            headers,
            vec![
                ("authorization".to_string(), "Bearer abc".to_string()),
                ("x-tenant".to_string(), "prod".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_header_list_skips_malformed() {
        let headers = parse_header_list("ok=1,,broken,=nokey");
        assert_eq!(headers, vec![("ok".to_string(), "1".to_string())]);
        assert!(parse_header_list("").is_empty());
    }
}
