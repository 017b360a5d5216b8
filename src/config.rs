use std::env;
use std::time::Duration;

use url::Url;

use crate::error::EndpointError;
use crate::transport::{Backoff, TransportConfig};

pub const DEFAULT_ORIGIN: &str = "http://localhost:8000";
pub const DEFAULT_PATH: &str = "ws/notify/";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Origin of the page hosting the client, e.g. `https://edd.example.org`.
    pub origin: String,
    /// Endpoint path, resolved against the origin.
    pub path: String,
    pub transport: TransportConfig,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let defaults = TransportConfig::default();
        let initial = env_millis("NOTIFY_BACKOFF_INITIAL_MS").unwrap_or(defaults.backoff.initial);
        let max = env_millis("NOTIFY_BACKOFF_MAX_MS").unwrap_or(defaults.backoff.max);
        let poll_interval = env_millis("NOTIFY_POLL_MS").unwrap_or(defaults.poll_interval);

        Self {
            origin: env::var("NOTIFY_ORIGIN").unwrap_or_else(|_| DEFAULT_ORIGIN.to_string()),
            path: env::var("NOTIFY_PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string()),
            transport: TransportConfig {
                backoff: Backoff::new(initial, max),
                poll_interval,
            },
        }
    }

    /// Websocket address for the notification endpoint.
    ///
    /// Only the scheme, host and port of `origin` are used. The scheme becomes
    /// `wss` for secure origins and `ws` otherwise.
    pub fn endpoint(&self) -> Result<Url, EndpointError> {
        endpoint_url(&self.origin, &self.path)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            path: DEFAULT_PATH.to_string(),
            transport: TransportConfig::default(),
        }
    }
}

pub fn endpoint_url(origin: &str, path: &str) -> Result<Url, EndpointError> {
    let page = Url::parse(origin).map_err(|source| EndpointError::Origin {
        origin: origin.to_string(),
        source,
    })?;
    let page_origin = page.origin();
    if !page_origin.is_tuple() {
        return Err(EndpointError::Opaque(origin.to_string()));
    }
    let base = Url::parse(&page_origin.ascii_serialization()).map_err(|source| {
        EndpointError::Origin {
            origin: origin.to_string(),
            source,
        }
    })?;

    let mut endpoint = base.join(path).map_err(|source| EndpointError::Path {
        path: path.to_string(),
        source,
    })?;
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        _ => "ws",
    };
    endpoint
        .set_scheme(scheme)
        .map_err(|_| EndpointError::Scheme(scheme))?;
    Ok(endpoint)
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|val| val.parse().ok())
        .map(Duration::from_millis)
}
