//! HTTP prober
//!
//! Performs exactly one request against a monitor's target and turns
//! whatever happens into a [`ProbeOutcome`]. Transport failures are
//! classified (`timeout`, `dns_failure`, `connection_refused`, `tls_error`,
//! `other`) and reported as a down outcome; the prober never retries and
//! never returns an error for a failed check.

use std::error::Error as StdError;
use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::model::{HttpMethod, MonitorId, ProbeOutcome, ProbeTarget};

/// Performs a single check of a target from a region
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, monitor_id: MonitorId, target: &ProbeTarget, region: &str) -> ProbeOutcome;
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Coarse cause of a failed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeErrorKind {
    Timeout,
    DnsFailure,
    ConnectionRefused,
    TlsError,
    Other,
}

impl ProbeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeErrorKind::Timeout => "timeout",
            ProbeErrorKind::DnsFailure => "dns_failure",
            ProbeErrorKind::ConnectionRefused => "connection_refused",
            ProbeErrorKind::TlsError => "tls_error",
            ProbeErrorKind::Other => "other",
        }
    }

    /// Classify an error message of the underlying HTTP stack
    pub fn from_message(message: &str) -> Self {
        let message = message.to_ascii_lowercase();

        if message.contains("timed out") || message.contains("timeout") {
            ProbeErrorKind::Timeout
        } else if message.contains("connection refused") {
            ProbeErrorKind::ConnectionRefused
        } else if message.contains("dns error")
            || message.contains("failed to lookup")
            || message.contains("name or service not known")
            || message.contains("no such host")
        {
            ProbeErrorKind::DnsFailure
        } else if message.contains("certificate")
            || message.contains("tls")
            || message.contains("ssl")
            || message.contains("handshake")
        {
            ProbeErrorKind::TlsError
        } else {
            ProbeErrorKind::Other
        }
    }

    fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ProbeErrorKind::Timeout;
        }

        // The top-level message only repeats the URL, the cause is further down
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionRefused => {
                        return ProbeErrorKind::ConnectionRefused;
                    }
                    std::io::ErrorKind::TimedOut => return ProbeErrorKind::Timeout,
                    _ => {}
                }
            }

            let kind = Self::from_message(&cause.to_string());
            if kind != ProbeErrorKind::Other {
                return kind;
            }
            source = cause.source();
        }

        ProbeErrorKind::Other
    }
}

impl fmt::Display for ProbeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Innermost cause of an error, which carries the useful detail
fn root_cause(err: &reqwest::Error) -> String {
    let mut current: &dyn StdError = err;
    while let Some(next) = current.source() {
        current = next;
    }
    current.to_string()
}

fn to_reqwest_method(method: HttpMethod) -> reqwest::Method {
    match method {
        HttpMethod::Get => reqwest::Method::GET,
        HttpMethod::Head => reqwest::Method::HEAD,
        HttpMethod::Post => reqwest::Method::POST,
        HttpMethod::Put => reqwest::Method::PUT,
        HttpMethod::Patch => reqwest::Method::PATCH,
        HttpMethod::Delete => reqwest::Method::DELETE,
        HttpMethod::Options => reqwest::Method::OPTIONS,
    }
}

/// [`Prober`] backed by a shared `reqwest` client
///
/// The region is recorded on the outcome; the request itself is made from
/// wherever this process runs.
#[derive(Debug, Clone)]
pub struct HttpProber {
    /// HTTP client (reused across requests for connection pooling)
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("uptime-engine/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    #[instrument(skip(self, target), fields(url = %target.url))]
    async fn probe(&self, monitor_id: MonitorId, target: &ProbeTarget, region: &str) -> ProbeOutcome {
        let timeout = Duration::from_secs(u64::from(target.timeout_secs.max(1)));
        let checked_at = Utc::now();
        let start = Instant::now();

        let response = self
            .client
            .request(to_reqwest_method(target.method), &target.url)
            .timeout(timeout)
            .send()
            .await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let status_code = response.status().as_u16();
                let up = status_code == target.expected_status;
                trace!("{} answered {status_code} in {response_time_ms}ms", target.url);

                ProbeOutcome {
                    monitor_id,
                    region: region.to_string(),
                    checked_at,
                    up,
                    status_code: Some(status_code),
                    response_time_ms,
                    error_message: (!up)
                        .then(|| format!("unexpected status code: {status_code}")),
                }
            }
            Err(e) => {
                let kind = ProbeErrorKind::from_reqwest(&e);
                trace!("{} failed ({kind}): {e}", target.url);

                ProbeOutcome {
                    monitor_id,
                    region: region.to_string(),
                    checked_at,
                    up: false,
                    status_code: None,
                    response_time_ms,
                    error_message: Some(format!("{kind}: {}", root_cause(&e))),
                }
            }
        }
    }
}
