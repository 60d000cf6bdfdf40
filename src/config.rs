use anyhow::{Context, Result, anyhow};
use std::{
    env,
    net::SocketAddr,
    str::FromStr,
    time::Duration,
};

use crate::metadata::ServiceMetadata;

pub const DEFAULT_TIMESTAMP_HEADER: &str = "x-gateway-timestamp";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_format: LogFormat,
    pub validation: ValidationConfig,
    pub timestamp: TimestampConfig,
    pub route_timeout: Option<Duration>,
    pub upstreams: Vec<UpstreamConfig>,
    pub routes: Vec<RouteConfig>,
    pub metadata: ServiceMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub max_body_bytes: usize,
    pub allowed_methods: Vec<String>,
    pub require_host_header: bool,
    pub max_headers: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1_048_576,
            allowed_methods: ["GET", "POST", "PUT", "PATCH", "DELETE", "OPTIONS"]
                .into_iter()
                .map(ToString::to_string)
                .collect(),
            require_host_header: true,
            max_headers: 128,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderPolicy {
    #[default]
    Append,
    Replace,
}

impl FromStr for HeaderPolicy {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "append" => Ok(Self::Append),
            "replace" | "overwrite" => Ok(Self::Replace),
            other => Err(anyhow!("unsupported header policy: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimestampConfig {
    pub header_name: String,
    pub policy: HeaderPolicy,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            header_name: DEFAULT_TIMESTAMP_HEADER.to_string(),
            policy: HeaderPolicy::Append,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteConfig {
    pub path_prefix: String,
    pub upstreams: Vec<String>,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let bind_addr = env::var("BIND_ADDR")
            .unwrap_or_else(|_| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "compact".to_string())
            .to_ascii_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            "compact" | "text" => LogFormat::Compact,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let defaults = ValidationConfig::default();
        let validation = ValidationConfig {
            max_body_bytes: parse_env("MAX_BODY_BYTES", defaults.max_body_bytes),
            allowed_methods: parse_csv("ALLOWED_METHODS", "GET,POST,PUT,PATCH,DELETE,OPTIONS")
                .into_iter()
                .map(|m| m.to_ascii_uppercase())
                .collect(),
            require_host_header: parse_env("REQUIRE_HOST_HEADER", defaults.require_host_header),
            max_headers: parse_env("MAX_HEADERS", defaults.max_headers),
        };

        let timestamp = TimestampConfig {
            header_name: env::var("GATEWAY_TIMESTAMP_HEADER")
                .unwrap_or_else(|_| DEFAULT_TIMESTAMP_HEADER.to_string())
                .to_ascii_lowercase(),
            policy: env::var("GATEWAY_TIMESTAMP_POLICY")
                .ok()
                .map(|raw| raw.parse::<HeaderPolicy>())
                .transpose()
                .context("invalid GATEWAY_TIMESTAMP_POLICY")?
                .unwrap_or_default(),
        };
        http::HeaderName::from_bytes(timestamp.header_name.as_bytes())
            .context("invalid GATEWAY_TIMESTAMP_HEADER")?;

        let route_timeout = match parse_env("ROUTE_TIMEOUT_MS", 30_000u64) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let upstreams = parse_upstreams(
            &env::var("UPSTREAMS")
                .unwrap_or_else(|_| "svc-a=http://127.0.0.1:9001,svc-b=http://127.0.0.1:9002".into()),
        )?;

        let routes = parse_routes(
            &env::var("ROUTES").unwrap_or_else(|_| "/=svc-a|svc-b".into()),
        )?;

        for route in &routes {
            if let Some(missing) = route
                .upstreams
                .iter()
                .find(|name| !upstreams.iter().any(|u| &u.name == *name))
            {
                return Err(anyhow!(
                    "route {} references unknown upstream {missing}",
                    route.path_prefix
                ));
            }
        }

        Ok(Self {
            bind_addr,
            log_format,
            validation,
            timestamp,
            route_timeout,
            upstreams,
            routes,
            metadata: metadata_from_env(),
        })
    }
}

fn metadata_from_env() -> ServiceMetadata {
    let mut metadata = ServiceMetadata::default();
    let overrides = [
        ("API_TITLE", &mut metadata.info.title),
        ("API_DESCRIPTION", &mut metadata.info.description),
        ("API_VERSION", &mut metadata.info.version),
        ("API_CONTACT_NAME", &mut metadata.info.contact.name),
        ("API_CONTACT_EMAIL", &mut metadata.info.contact.email),
        ("API_LICENSE_NAME", &mut metadata.info.license.name),
        ("API_LICENSE_URL", &mut metadata.info.license.url),
        ("API_DOCS_DESCRIPTION", &mut metadata.external_docs.description),
        ("API_DOCS_URL", &mut metadata.external_docs.url),
    ];
    for (key, slot) in overrides {
        if let Ok(value) = env::var(key) {
            *slot = value;
        }
    }
    metadata
}

pub(crate) fn parse_upstreams(raw: &str) -> Result<Vec<UpstreamConfig>> {
    let mut out: Vec<UpstreamConfig> = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let name = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?
            .to_string();
        let rhs = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid upstream entry: {chunk}"))?;

        let fields: Vec<&str> = rhs.split('@').collect();
        let base_url = fields
            .first()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow!("invalid upstream URL for {name}"))?;
        let timeout_ms = fields
            .get(1)
            .map(|s| s.parse::<u64>().context("invalid upstream timeout"))
            .transpose()?
            .unwrap_or(3_000)
            .max(100);

        if out.iter().any(|u| u.name == name) {
            return Err(anyhow!("duplicate upstream name: {name}"));
        }

        out.push(UpstreamConfig {
            name,
            base_url,
            timeout_ms,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no upstreams configured"));
    }
    Ok(out)
}

pub(crate) fn parse_routes(raw: &str) -> Result<Vec<RouteConfig>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').filter(|c| !c.trim().is_empty()) {
        let mut parts = chunk.splitn(2, '=');
        let path_prefix = parts
            .next()
            .map(str::trim)
            .filter(|s| s.starts_with('/'))
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?
            .to_string();

        let upstreams = parts
            .next()
            .map(str::trim)
            .ok_or_else(|| anyhow!("invalid route entry: {chunk}"))?
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();

        if upstreams.is_empty() {
            return Err(anyhow!("route has no upstreams: {chunk}"));
        }

        out.push(RouteConfig {
            path_prefix,
            upstreams,
        });
    }

    if out.is_empty() {
        return Err(anyhow!("no routes configured"));
    }
    Ok(out)
}

fn parse_csv(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr,
{
    env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}
