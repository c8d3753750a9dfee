//! Safe outbound fetch: a process-scoped concurrency cap, a wall-clock
//! timeout, SSRF defenses via a custom DNS resolver, and the
//! `x-potat-data[-N]` header fan-out for the PotatContext chain.

use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::Resolver as HickoryResolver;
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use serde_json::Value;

use crate::context::PotatContext;
use crate::error::FetchError;

const USER_AGENT: &str = "PotatBotat Eval Server (+https://potat.app)";
const DATA_HEADER_HOST_PREFIX: &str = "https://fun.joet.me";

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub with_data_headers: bool,
    pub method: Option<String>,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct FetchResult {
    pub status: u16,
    pub body: Value,
}

/// Guards every DNS resolution a fetch's connection performs, failing
/// closed the moment any resolved address is a private/loopback/link-local
/// IP. Runs per-address on every resolution for the connection, per §4.6.
#[derive(Clone)]
struct SsrfGuardResolver {
    inner: Arc<HickoryResolver<TokioConnectionProvider>>,
}

#[derive(Debug, thiserror::Error)]
#[error("Access to {0} is disallowed")]
struct SsrfBlocked(String);

impl Resolve for SsrfGuardResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let inner = self.inner.clone();
        Box::pin(async move {
            let lookup = inner
                .lookup_ip(name.as_str())
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            let mut addrs = Vec::new();
            for ip in lookup.iter() {
                if is_disallowed(ip) {
                    return Err(Box::new(SsrfBlocked(ip.to_string()))
                        as Box<dyn std::error::Error + Send + Sync>);
                }
                addrs.push(SocketAddr::new(ip, 0));
            }
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Unique-local `fc00::/7` and link-local `fe80::/10`, expressed as `ipnet`
/// prefixes (computed once) rather than hand-rolled bitmasks.
static IPV6_ULA: once_cell::sync::Lazy<ipnet::Ipv6Net> =
    once_cell::sync::Lazy::new(|| "fc00::/7".parse().expect("valid CIDR literal"));
static IPV6_LINK_LOCAL: once_cell::sync::Lazy<ipnet::Ipv6Net> =
    once_cell::sync::Lazy::new(|| "fe80::/10".parse().expect("valid CIDR literal"));

/// RFC1918 + link-local + loopback + IPv6 equivalents.
fn is_disallowed(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || IPV6_ULA.contains(&v6)
                || IPV6_LINK_LOCAL.contains(&v6)
        }
    }
}

pub struct FetchClient {
    client: reqwest::Client,
    counter: Arc<AtomicUsize>,
    max_concurrency: usize,
    timeout: Duration,
}

/// RAII guard decrementing the process-scoped concurrency counter on drop,
/// so a cancelled or panicking fetch can't leak a permit.
struct ConcurrencyGuard(Arc<AtomicUsize>);

impl Drop for ConcurrencyGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FetchClient {
    pub fn new(max_concurrency: usize, timeout_ms: u64) -> Result<Self, FetchError> {
        let resolver = HickoryResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
        )
        .with_options(ResolverOpts::default())
        .build();
        let guard = SsrfGuardResolver {
            inner: Arc::new(resolver),
        };

        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .dns_resolver(Arc::new(guard))
            .build()
            .map_err(|e| FetchError::Failed {
                name: "ClientBuildError".into(),
                detail: e.to_string(),
            })?;

        Ok(FetchClient {
            client,
            counter: Arc::new(AtomicUsize::new(0)),
            max_concurrency,
            timeout: Duration::from_millis(timeout_ms),
        })
    }

    pub async fn fetch(
        &self,
        url: &str,
        options: FetchOptions,
        context_chain: &[&PotatContext],
    ) -> Result<FetchResult, FetchError> {
        // Literal IPv4/bracketed-IPv6 hosts bypass DNS resolution entirely,
        // so they're checked directly against the URL before any request
        // is attempted.
        if let Some(host) = literal_ip_host(url) {
            if is_disallowed(host) {
                return Err(FetchError::Ssrf(host.to_string()));
            }
        }

        loop {
            let current = self.counter.load(Ordering::SeqCst);
            if current >= self.max_concurrency {
                return Ok(FetchResult {
                    status: 429,
                    body: Value::String("Too many requests.".into()),
                });
            }
            if self
                .counter
                .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        let _guard = ConcurrencyGuard(self.counter.clone());

        let mut req = self
            .client
            .request(
                reqwest::Method::from_str(options.method.as_deref().unwrap_or("GET"))
                    .unwrap_or(reqwest::Method::GET),
                url,
            )
            .timeout(self.timeout);

        for (k, v) in &options.headers {
            req = req.header(k, v);
        }

        if options.with_data_headers || url.starts_with(DATA_HEADER_HOST_PREFIX) {
            let total = context_chain.len();
            for (i, ctx) in context_chain.iter().enumerate() {
                let suffix = total - i;
                let header = if suffix == total {
                    "x-potat-data".to_string()
                } else {
                    format!("x-potat-data-{suffix}")
                };
                if let Ok(encoded) = serde_json::to_string(ctx) {
                    req = req.header(header, urlencoding_encode(&encoded));
                }
            }
        }

        if let Some(body) = options.body {
            req = req.body(body);
        }

        match tokio::time::timeout(self.timeout, req.send()).await {
            Err(_) => Ok(FetchResult {
                status: 408,
                body: Value::String("Request timed out.".into()),
            }),
            Ok(Err(e)) => {
                if let Some(ssrf) = find_ssrf_source(&e) {
                    return Err(FetchError::Ssrf(ssrf));
                }
                Ok(FetchResult {
                    status: 400,
                    body: Value::String(format!(
                        "Request failed - {}: {}",
                        error_name(&e),
                        e
                    )),
                })
            }
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let text = resp.text().await.unwrap_or_default();
                let body = serde_json::from_str::<Value>(&text)
                    .unwrap_or_else(|_| Value::String(text));
                Ok(FetchResult { status, body })
            }
        }
    }
}

fn find_ssrf_source(err: &reqwest::Error) -> Option<String> {
    let mut source: Option<&(dyn std::error::Error + 'static)> = err.source();
    while let Some(e) = source {
        if let Some(blocked) = e.downcast_ref::<SsrfBlocked>() {
            return Some(blocked.0.clone());
        }
        source = e.source();
    }
    None
}

/// Classifies a failed `reqwest` send into a short, JS-error-like name so
/// the body distinguishes DNS/connect/TLS/decode failures instead of
/// collapsing every non-SSRF failure into one generic label.
fn error_name(err: &reqwest::Error) -> &'static str {
    if err.is_timeout() {
        "TimeoutError"
    } else if err.is_connect() {
        "ConnectionError"
    } else if err.is_redirect() {
        "RedirectError"
    } else if err.is_decode() {
        "DecodeError"
    } else if err.is_body() {
        "BodyError"
    } else if err.is_request() {
        "RequestError"
    } else if err.is_builder() {
        "BuilderError"
    } else {
        "FetchError"
    }
}

fn literal_ip_host(url: &str) -> Option<IpAddr> {
    let parsed = url::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    IpAddr::from_str(bare).ok()
}

fn urlencoding_encode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_private_v4_addresses() {
        assert!(is_disallowed("10.0.0.1".parse().unwrap()));
        assert!(is_disallowed("127.0.0.1".parse().unwrap()));
        assert!(is_disallowed("169.254.1.1".parse().unwrap()));
        assert!(!is_disallowed("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn classifies_private_v6_addresses() {
        assert!(is_disallowed("::1".parse().unwrap()));
        assert!(is_disallowed("fe80::1".parse().unwrap()));
        assert!(is_disallowed("fc00::1".parse().unwrap()));
        assert!(!is_disallowed("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn detects_literal_ip_hosts() {
        assert_eq!(
            literal_ip_host("http://127.0.0.1/"),
            Some("127.0.0.1".parse().unwrap())
        );
        assert_eq!(
            literal_ip_host("http://[::1]/"),
            Some("::1".parse().unwrap())
        );
        assert_eq!(literal_ip_host("http://example.com/"), None);
    }

    #[tokio::test]
    async fn error_name_distinguishes_a_builder_failure_from_the_generic_label() {
        let err = reqwest::Client::new()
            .get("not a url at all")
            .send()
            .await
            .unwrap_err();
        assert!(err.is_builder());
        assert_eq!(error_name(&err), "BuilderError");
    }
}
