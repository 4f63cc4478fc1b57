//! HTTP node - make one HTTP request per item.

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::types::{DataItem, ItemOutput, Node, NodeContext};
use crate::error::{Error, Result};

/// Check if SSRF protection is enabled (default: true).
/// Set ITEMFLOW_ALLOW_INTERNAL_URLS=true to disable protection.
fn is_ssrf_protection_enabled() -> bool {
    std::env::var("ITEMFLOW_ALLOW_INTERNAL_URLS")
        .map(|v| v.to_lowercase() != "true")
        .unwrap_or(true)
}

/// Validate URL to prevent SSRF attacks.
/// Blocks access to localhost, private IP ranges, and non-http(s) schemes.
fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| Error::Node(format!("Invalid URL '{}': {}", url, e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(Error::Node(format!(
                "Unsupported URL scheme '{}'. Only http and https are allowed.",
                scheme
            )));
        }
    }

    if !is_ssrf_protection_enabled() {
        return Ok(());
    }

    if let Some(host) = parsed.host_str() {
        let host_lower = host.to_lowercase();
        if host_lower == "localhost"
            || host_lower.ends_with(".localhost")
            || host_lower == "[::1]"
            || host_lower == "0.0.0.0"
        {
            warn!("Blocked SSRF attempt to localhost: {}", url);
            return Err(Error::Node(
                "Access to localhost is not allowed for security reasons.".to_string(),
            ));
        }

        let bare = host_lower.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            if is_private_or_special_ip(&ip) {
                warn!("Blocked SSRF attempt to private IP: {}", url);
                return Err(Error::Node(
                    "Access to private or internal IP addresses is not allowed for security reasons.".to_string(),
                ));
            }
        }

        if host_lower.ends_with(".local") || host_lower.ends_with(".internal") {
            warn!("Blocked SSRF attempt to internal host: {}", url);
            return Err(Error::Node(
                "Access to internal hostnames is not allowed for security reasons.".to_string(),
            ));
        }
    }

    Ok(())
}

/// Check if an IP address is private, loopback, or otherwise special.
fn is_private_or_special_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(ipv4) => {
            ipv4.is_loopback()
                || ipv4.is_private()
                || ipv4.is_link_local()
                || ipv4.is_broadcast()
                || ipv4.is_unspecified()
                || ipv4.octets()[0] == 100 && (ipv4.octets()[1] & 0xc0) == 64 // 100.64.0.0/10
        }
        IpAddr::V6(ipv6) => {
            ipv6.is_loopback()
                || ipv6.is_unspecified()
                || ipv6
                    .to_ipv4_mapped()
                    .map(|v4| is_private_or_special_ip(&IpAddr::V4(v4)))
                    .unwrap_or(false)
        }
    }
}

/// HTTP request node.
pub struct HttpNode {
    client: Client,
}

const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;
const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

impl HttpNode {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self { client }
    }
}

impl Default for HttpNode {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ResponseFormat {
    /// Parsed JSON body; a top-level array becomes one item per element
    #[default]
    Json,
    /// Body as `{"body": "<text>"}`
    Text,
    /// `{"status", "headers", "body"}`
    Full,
}

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default)]
    headers: Option<Value>,
    #[serde(default)]
    query: Option<Value>,
    #[serde(default)]
    body: Option<Value>,
    #[serde(default)]
    timeout_ms: Option<u64>,
    #[serde(default)]
    response_format: ResponseFormat,
}

fn default_method() -> String {
    "GET".to_string()
}

#[async_trait]
impl Node for HttpNode {
    fn node_type(&self) -> &str {
        "http"
    }

    fn description(&self) -> &str {
        "Make HTTP requests (GET, POST, PUT, DELETE, PATCH)"
    }

    async fn execute_item(
        &self,
        params: &Value,
        item: &DataItem,
        ctx: &NodeContext,
    ) -> Result<ItemOutput> {
        let config: HttpConfig = serde_json::from_value(params.clone())
            .map_err(|e| Error::Node(format!("Invalid HTTP config: {}", e)))?;

        validate_url(&config.url)?;

        debug!(
            node = %ctx.node_name,
            item_index = ?ctx.item_index,
            "HTTP {} {}",
            config.method,
            config.url
        );

        let url = config.url.as_str();
        let mut request = match config.method.to_uppercase().as_str() {
            "GET" => self.client.get(url),
            "POST" => self.client.post(url),
            "PUT" => self.client.put(url),
            "DELETE" => self.client.delete(url),
            "PATCH" => self.client.patch(url),
            "HEAD" => self.client.head(url),
            _ => {
                return Err(Error::Node(format!(
                    "Unknown HTTP method: {}",
                    config.method
                )))
            }
        };

        if let Some(headers) = config.headers.as_ref().and_then(|h| h.as_object()) {
            for (key, value) in headers {
                let header_value = match value {
                    Value::String(s) => s.clone(),
                    _ => value.to_string(),
                };
                request = request.header(key, header_value);
            }
        }

        if let Some(query) = config.query.as_ref().and_then(|q| q.as_object()) {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(k, v)| {
                    let v = match v {
                        Value::String(s) => s.clone(),
                        _ => v.to_string(),
                    };
                    (k.clone(), v)
                })
                .collect();
            request = request.query(&pairs);
        }

        if let Some(body) = &config.body {
            request = request.json(body);
        }

        if let Some(timeout) = config.timeout_ms {
            request = request.timeout(Duration::from_millis(timeout));
        }

        let start = std::time::Instant::now();
        let response = request.send().await?;
        let duration = start.elapsed();
        let status = response.status().as_u16();

        let headers: Value = {
            let mut map = serde_json::Map::new();
            for (k, v) in response.headers().iter() {
                map.insert(
                    k.to_string(),
                    Value::String(v.to_str().unwrap_or("").to_string()),
                );
            }
            Value::Object(map)
        };

        let body_text = response.text().await.map_err(|e| {
            Error::Node(format!(
                "Failed to read HTTP response body from {}: {}",
                url, e
            ))
        })?;

        if status >= 400 {
            return Err(Error::Node(format!(
                "HTTP {} {} -> {}: {}",
                config.method, url, status, body_text
            )));
        }

        info!(
            "HTTP {} {} -> {} ({}ms)",
            config.method,
            url,
            status,
            duration.as_millis()
        );

        build_output(config.response_format, status, headers, body_text, item)
    }
}

fn build_output(
    format: ResponseFormat,
    status: u16,
    headers: Value,
    body_text: String,
    item: &DataItem,
) -> Result<ItemOutput> {
    let parse = |text: &str| -> Result<Value> {
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(text)
            .map_err(|e| Error::Node(format!("HTTP response is not JSON: {}", e)))
    };

    let output = match format {
        ResponseFormat::Text => ItemOutput::main(DataItem::new(json!({ "body": body_text }))),
        ResponseFormat::Full => ItemOutput::main(DataItem::new(json!({
            "status": status,
            "headers": headers,
            "body": parse(&body_text)?,
        }))),
        ResponseFormat::Json => match parse(&body_text)? {
            Value::Array(values) => {
                let mut out = ItemOutput::none();
                for value in values {
                    out.push(0, DataItem::new(value));
                }
                out
            }
            // An empty body keeps the incoming item so the chain continues.
            Value::Null => ItemOutput::main(item.clone()),
            value => ItemOutput::main(DataItem::new(value)),
        },
    };
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url_rejects_schemes_and_private_hosts() {
        assert!(validate_url("ftp://example.com/file").is_err());
        assert!(validate_url("not a url").is_err());
        if is_ssrf_protection_enabled() {
            assert!(validate_url("http://localhost:8080").is_err());
            assert!(validate_url("http://10.0.0.5/admin").is_err());
            assert!(validate_url("http://[::1]/").is_err());
            assert!(validate_url("http://metadata.google.internal/").is_err());
        }
        assert!(validate_url("https://api.example.com/orders").is_ok());
    }

    #[test]
    fn test_private_ip_detection() {
        assert!(is_private_or_special_ip(&"192.168.1.1".parse().unwrap()));
        assert!(is_private_or_special_ip(&"100.64.0.1".parse().unwrap()));
        assert!(is_private_or_special_ip(&"::ffff:127.0.0.1".parse().unwrap()));
        assert!(!is_private_or_special_ip(&"8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_json_array_body_splits_into_items() {
        let out = build_output(
            ResponseFormat::Json,
            200,
            Value::Null,
            r#"[{"id": 1}, {"id": 2}]"#.to_string(),
            &DataItem::empty(),
        )
        .unwrap();
        assert_eq!(out.emits.len(), 2);
        assert_eq!(out.emits[1].1.json, json!({"id": 2}));
    }

    #[test]
    fn test_full_format_and_empty_body() {
        let out = build_output(
            ResponseFormat::Full,
            204,
            json!({}),
            String::new(),
            &DataItem::empty(),
        )
        .unwrap();
        assert_eq!(out.emits[0].1.json["status"], 204);

        let item = DataItem::new(json!({"keep": true}));
        let out = build_output(ResponseFormat::Json, 204, json!({}), String::new(), &item).unwrap();
        assert_eq!(out, ItemOutput::main(item));
    }

    #[test]
    fn test_non_json_body_is_an_error() {
        let err = build_output(
            ResponseFormat::Json,
            200,
            json!({}),
            "<html>".to_string(),
            &DataItem::empty(),
        )
        .unwrap_err();
        assert!(err.to_string().contains("not JSON"));
    }
}
