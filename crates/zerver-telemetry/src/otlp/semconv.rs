//! Semantic Attribute Mapping
//!
//! Maps the pipeline's effect-kind strings onto OpenTelemetry semantic
//! conventions. The kind prefix decides the family; the suffix is the
//! operation; `target` and the optional detail fill in the identifiers.

use super::span::KeyValue;

/// OTEL attributes for one effect, from its kind string (`http_get`,
/// `db_query`, ...), target selector and operation detail (url, key, sql,
/// path or task name).
pub fn effect_attributes(kind: &str, target: &str, detail: Option<&str>) -> Vec<KeyValue> {
    let mut attrs = Vec::new();

    if let Some(method) = kind.strip_prefix("http_") {
        attrs.push(KeyValue::new("http.method", method.to_ascii_uppercase()));
        if let Some(url) = detail {
            attrs.push(KeyValue::new("http.url", url));
        }
        attrs.push(KeyValue::new("peer.service", target));
    } else if let Some(op) = kind.strip_prefix("tcp_") {
        attrs.push(KeyValue::new("network.transport", "tcp"));
        attrs.push(KeyValue::new("network.operation", op));
        attrs.push(KeyValue::new("peer.address", target));
    } else if let Some(op) = kind.strip_prefix("grpc_") {
        attrs.push(KeyValue::new("rpc.system", "grpc"));
        attrs.push(KeyValue::new("rpc.service", target));
        if let Some(method) = detail {
            attrs.push(KeyValue::new("rpc.method", method));
        } else {
            attrs.push(KeyValue::new("rpc.method", op));
        }
    } else if let Some(op) = kind.strip_prefix("websocket_") {
        attrs.push(KeyValue::new("network.protocol.name", "websocket"));
        attrs.push(KeyValue::new("network.operation", op));
        attrs.push(KeyValue::new("peer.address", target));
    } else if let Some(op) = kind.strip_prefix("db_") {
        attrs.push(KeyValue::new("db.system", target));
        attrs.push(KeyValue::new("db.operation", op));
        if let Some(statement) = detail {
            attrs.push(KeyValue::new("db.statement", statement));
        }
    } else if let Some(op) = kind.strip_prefix("kv_cache_") {
        attrs.push(KeyValue::new("cache.system", target));
        attrs.push(KeyValue::new("cache.operation", op));
        if let Some(key) = detail {
            attrs.push(KeyValue::new("cache.key", key));
        }
    } else if let Some(op) = kind.strip_prefix("file_") {
        attrs.push(KeyValue::new("file.operation", op));
        if let Some(path) = detail {
            attrs.push(KeyValue::new("file.path", path));
        }
    } else if kind.starts_with("compute_") || kind.starts_with("accelerator_") {
        attrs.push(KeyValue::new(
            "compute.operation",
            detail.unwrap_or(kind),
        ));
        attrs.push(KeyValue::new("peer.service", target));
    } else {
        attrs.push(KeyValue::new("peer.service", target));
    }

    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::otlp::span::AttrValue;

    fn get<'a>(attrs: &'a [KeyValue], key: &str) -> Option<&'a AttrValue> {
        attrs.iter().find(|a| a.key == key).map(|a| &a.value)
    }

    #[test]
    fn test_http_mapping() {
        let attrs = effect_attributes("http_post", "payments", Some("https://pay/charge"));
        assert_eq!(get(&attrs, "http.method"), Some(&AttrValue::Str("POST".into())));
        assert_eq!(
            get(&attrs, "http.url"),
            Some(&AttrValue::Str("https://pay/charge".into()))
        );
    }

    #[test]
    fn test_tcp_mapping() {
        let attrs = effect_attributes("tcp_send_receive", "10.0.0.2:9000", None);
        assert_eq!(
            get(&attrs, "network.transport"),
            Some(&AttrValue::Str("tcp".into()))
        );
        assert_eq!(
            get(&attrs, "network.operation"),
            Some(&AttrValue::Str("send_receive".into()))
        );
        assert_eq!(
            get(&attrs, "peer.address"),
            Some(&AttrValue::Str("10.0.0.2:9000".into()))
        );
    }

    #[test]
    fn test_grpc_mapping() {
        let attrs = effect_attributes("grpc_unary", "orders.v1.Orders", Some("GetOrder"));
        assert_eq!(get(&attrs, "rpc.system"), Some(&AttrValue::Str("grpc".into())));
        assert_eq!(
            get(&attrs, "rpc.service"),
            Some(&AttrValue::Str("orders.v1.Orders".into()))
        );
        assert_eq!(
            get(&attrs, "rpc.method"),
            Some(&AttrValue::Str("GetOrder".into()))
        );
    }

    #[test]
    fn test_db_and_cache_mapping() {
        let attrs = effect_attributes("db_query", "postgres", Some("SELECT 1"));
        assert_eq!(get(&attrs, "db.operation"), Some(&AttrValue::Str("query".into())));
        assert_eq!(
            get(&attrs, "db.statement"),
            Some(&AttrValue::Str("SELECT 1".into()))
        );

        let attrs = effect_attributes("kv_cache_get", "redis", Some("session:1"));
        assert_eq!(
            get(&attrs, "cache.operation"),
            Some(&AttrValue::Str("get".into()))
        );
        assert_eq!(
            get(&attrs, "cache.key"),
            Some(&AttrValue::Str("session:1".into()))
        );
    }

    #[test]
    fn test_websocket_file_compute() {
        let attrs = effect_attributes("websocket_send", "feed", None);
        assert_eq!(
            get(&attrs, "network.protocol.name"),
            Some(&AttrValue::Str("websocket".into()))
        );

        let attrs = effect_attributes("file_read", "local", Some("/etc/app.json"));
        assert_eq!(
            get(&attrs, "file.path"),
            Some(&AttrValue::Str("/etc/app.json".into()))
        );

        let attrs = effect_attributes("compute_task", "gpu-pool", Some("resize"));
        assert_eq!(
            get(&attrs, "compute.operation"),
            Some(&AttrValue::Str("resize".into()))
        );
        let attrs = effect_attributes("accelerator_task", "npu", None);
        assert_eq!(
            get(&attrs, "compute.operation"),
            Some(&AttrValue::Str("accelerator_task".into()))
        );
    }
}
