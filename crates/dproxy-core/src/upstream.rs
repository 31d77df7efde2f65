//! The process-wide upstream HTTP client. Pooled keep-alive connections,
//! cached DNS, a hard deadline for one-shot requests, and an idle guard
//! (instead of a total deadline) for streaming responses.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::StreamExt;
use http::{Method, StatusCode};
use tokio::sync::mpsc;
use wreq::Client;
use wreq::dns::{Addrs, Name, Resolve, Resolving};

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: UpstreamBody,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream timeout: {0}")]
    Timeout(String),
    #[error("upstream transport error: {0}")]
    Transport(String),
}

impl UpstreamError {
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            UpstreamError::Transport(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    /// Total deadline for non-streaming requests.
    pub request_timeout: Duration,
    /// Per-read guard on streaming bodies; streams have no total deadline.
    pub stream_idle_timeout: Duration,
    /// Idle keep-alive connections retained per upstream host. The registry
    /// bounds how many hosts exist, which bounds the pool as a whole.
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
    pub dns_cache_ttl: Duration,
    pub user_agent: String,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(120),
            stream_idle_timeout: Duration::from_secs(300),
            pool_max_idle_per_host: 20,
            pool_idle_timeout: Duration::from_secs(90),
            dns_cache_ttl: Duration::from_secs(300),
            user_agent: format!("dproxy/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    config: UpstreamClientConfig,
}

impl UpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let resolver = Arc::new(CachingDnsResolver::new(config.dns_cache_ttl));
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(config.pool_idle_timeout)
            .dns_resolver(resolver)
            .build()?;
        Ok(Self { client, config })
    }

    pub async fn send(&self, req: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        if req.is_stream {
            self.send_inner(req).await
        } else {
            let deadline = self.config.request_timeout;
            tokio::time::timeout(deadline, self.send_inner(req))
                .await
                .map_err(|_| UpstreamError::Timeout(format!("no response within {deadline:?}")))?
        }
    }

    async fn send_inner(&self, req: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let method = to_wreq_method(&req.method);
        let mut builder = self.client.request(method, &req.url);

        let mut has_user_agent = false;
        for (name, value) in &req.headers {
            if name.eq_ignore_ascii_case("user-agent") {
                has_user_agent = true;
            }
            builder = builder.header(name, value);
        }
        if !has_user_agent {
            builder = builder.header("user-agent", &self.config.user_agent);
        }
        if let Some(body) = req.body {
            builder = builder.body(body);
        }

        let resp = builder.send().await.map_err(map_wreq_error)?;
        let status = resp.status().as_u16();
        let headers = headers_to_vec(resp.headers());

        let is_success = (200..300).contains(&status);
        if !is_success || !req.is_stream {
            let body = resp.bytes().await.map_err(map_wreq_error)?;
            return Ok(UpstreamResponse {
                status,
                headers,
                body: UpstreamBody::Bytes(body),
            });
        }

        let idle = self.config.stream_idle_timeout;
        let (tx, rx) = mpsc::channel::<Bytes>(16);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            loop {
                let next = tokio::time::timeout(idle, stream.next()).await;
                let Ok(item) = next else { break };
                let Some(item) = item else { break };
                let Ok(chunk) = item else { break };
                if tx.send(chunk).await.is_err() {
                    // receiver gone: downstream client disconnected, drop
                    // the upstream read
                    break;
                }
            }
        });

        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(rx),
        })
    }
}

/// System resolver behind a fixed-TTL positive cache, shared by every
/// connection the client opens.
#[derive(Debug)]
struct CachingDnsResolver {
    ttl: Duration,
    cache: Arc<Mutex<HashMap<String, (Instant, Vec<SocketAddr>)>>>,
}

impl CachingDnsResolver {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn cached(&self, host: &str) -> Option<Vec<SocketAddr>> {
        let cache = self.cache.lock().ok()?;
        let (resolved_at, addrs) = cache.get(host)?;
        if resolved_at.elapsed() < self.ttl {
            Some(addrs.clone())
        } else {
            None
        }
    }

    fn store(&self, host: String, addrs: Vec<SocketAddr>) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(host, (Instant::now(), addrs));
        }
    }
}

impl Resolve for CachingDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        if let Some(addrs) = self.cached(&host) {
            return Box::pin(async move { Ok(Box::new(addrs.into_iter()) as Addrs) });
        }

        let cache = self.cache.clone();
        Box::pin(async move {
            let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host.as_str(), 0))
                .await
                .map_err(|err| Box::new(err) as Box<dyn std::error::Error + Send + Sync>)?
                .collect();
            if let Ok(mut cache) = cache.lock() {
                cache.insert(host, (Instant::now(), addrs.clone()));
            }
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

fn to_wreq_method(method: &Method) -> wreq::Method {
    match *method {
        Method::GET => wreq::Method::GET,
        Method::POST => wreq::Method::POST,
        Method::PUT => wreq::Method::PUT,
        Method::PATCH => wreq::Method::PATCH,
        Method::DELETE => wreq::Method::DELETE,
        Method::HEAD => wreq::Method::HEAD,
        Method::OPTIONS => wreq::Method::OPTIONS,
        _ => wreq::Method::POST,
    }
}

fn headers_to_vec(map: &wreq::header::HeaderMap) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(value) = value.to_str() {
            out.push((name.as_str().to_string(), value.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    if err.is_timeout() {
        UpstreamError::Timeout(err.to_string())
    } else {
        UpstreamError::Transport(err.to_string())
    }
}

/// Build the final upstream URL from the descriptor scheme, host, path, the
/// original query string, and the translator's `key=` addition.
pub fn build_url(
    scheme: &str,
    host: &str,
    path: &str,
    query: Option<&str>,
    query_key: Option<&str>,
) -> String {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let mut url = format!("{scheme}://{host}{path}");
    let mut separator = if path.contains('?') { '&' } else { '?' };
    if let Some(query) = query
        && !query.is_empty()
    {
        url.push(separator);
        url.push_str(query);
        separator = '&';
    }
    if let Some(key) = query_key {
        url.push(separator);
        url.push_str("key=");
        url.push_str(key);
    }
    url
}
