use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::{MultiError, ProbeError};

pub const STATUS_OK: i64 = 1;
pub const STATUS_FAILED: i64 = 0;
pub const STATUS_NEED_SCAN: i64 = -1;

const PING_COUNT: usize = 3;
const PING_WINDOW: Duration = Duration::from_secs(5);

/// Persisted proxy endpoint, uniquely identified by (host, port).
///
/// The record round-trips through YAML (import file) and the store:
/// durations serialize as humantime strings, timestamps as RFC3339.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Proxy {
    pub host: String,
    /// Decimal port string as extracted from the page.
    pub port: String,
    pub protocol: String,
    pub country: String,
    /// URL of the page this proxy was scraped from.
    pub source: String,
    pub score: i64,
    pub status: i64,
    pub username: String,
    pub password: String,
    pub last_check: DateTime<Utc>,
    pub check_number: i64,
    #[serde(with = "humantime_serde")]
    pub avg_ping_timing: Duration,
    #[serde(with = "humantime_serde")]
    pub avg_request_timing: Duration,
    #[serde(with = "humantime_serde")]
    pub avg_response_timing: Duration,
    pub created_at: DateTime<Utc>,
}

impl Default for Proxy {
    fn default() -> Self {
        Proxy {
            host: String::new(),
            port: String::new(),
            protocol: String::new(),
            country: String::new(),
            source: String::new(),
            score: 0,
            status: STATUS_FAILED,
            username: String::new(),
            password: String::new(),
            last_check: DateTime::<Utc>::UNIX_EPOCH,
            check_number: 0,
            avg_ping_timing: Duration::ZERO,
            avg_request_timing: Duration::ZERO,
            avg_response_timing: Duration::ZERO,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

impl Proxy {
    /// Endpoint URL, `"{protocol}://{host}:{port}"` with the protocol
    /// lowercased.
    pub fn url(&self) -> String {
        format!(
            "{}://{}:{}",
            self.protocol.to_lowercase(),
            self.host,
            self.port
        )
    }

    /// Build the outbound HTTP client that tunnels through this proxy.
    ///
    /// TLS verification is disabled: the traffic is a reachability probe,
    /// not a confidential channel. The client lives for one validation run.
    pub fn init_client(&self, timeout: Duration) -> Result<reqwest::Client, ProbeError> {
        let parsed = url::Url::parse(&self.url())
            .map_err(|e| ProbeError::InvalidProxyUrl(e.to_string()))?;
        if parsed.host_str().is_none() || parsed.port_or_known_default().is_none() {
            return Err(ProbeError::InvalidProxyUrl(
                "insufficient proxy data".to_string(),
            ));
        }

        let proxy = match parsed.scheme() {
            "socks5" => {
                let url = if self.username.is_empty() {
                    format!("socks5://{}:{}", self.host, self.port)
                } else {
                    format!(
                        "socks5://{}:{}@{}:{}",
                        self.username, self.password, self.host, self.port
                    )
                };
                reqwest::Proxy::all(&url)
                    .map_err(|e| ProbeError::CannotCreateProxyDialer(e.to_string()))?
            }
            "socks4" => reqwest::Proxy::all(&format!("socks4://{}:{}", self.host, self.port))
                .map_err(|e| ProbeError::CannotCreateProxyDialer(e.to_string()))?,
            "http" | "https" => {
                let proxy = reqwest::Proxy::all(&self.url())
                    .map_err(|e| ProbeError::CannotCreateProxyDialer(e.to_string()))?;
                if self.username.is_empty() {
                    proxy
                } else {
                    proxy.basic_auth(&self.username, &self.password)
                }
            }
            other => {
                return Err(ProbeError::InvalidProxyUrl(format!(
                    "unsupported proxy scheme {other:?}"
                )))
            }
        };

        reqwest::Client::builder()
            .proxy(proxy)
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| ProbeError::CannotCreateProxyDialer(e.to_string()))
    }

    /// GET `target` through `client` and record request/response timings.
    ///
    /// The probe origin answers with three whitespace-delimited tokens, the
    /// third being the server receipt time as float seconds since epoch.
    pub async fn check_proxy(
        &self,
        client: &reqwest::Client,
        target: &str,
        metrics: &ProxyMetrics,
    ) -> Result<(), ProbeError> {
        let start = Utc::now();
        let resp = client
            .get(target)
            .send()
            .await
            .map_err(|e| ProbeError::RequestFail(e.to_string()))?;
        let body = resp
            .text()
            .await
            .map_err(|e| ProbeError::RequestFail(e.to_string()))?;
        let server_time = parse_probe_body(&body)?;
        let end = Utc::now();

        metrics.add_request_metric(RequestMetrics {
            request_timing: server_time - start,
            response_timing: end - start,
        });
        Ok(())
    }

    /// 3 ICMP echoes inside a 5 s window. Echoes that never come back count
    /// as loss, and any loss fails the probe; otherwise the mean round trip
    /// is recorded.
    pub async fn check_ping(&self, metrics: &ProxyMetrics) -> Result<(), ProbeError> {
        let addr: IpAddr = self
            .host
            .parse()
            .map_err(|e| ProbeError::Untyped(format!("cannot ping {}: {e}", self.host)))?;

        let mut rtts: Vec<Duration> = Vec::with_capacity(PING_COUNT);
        let mut lost = 0usize;
        let echoes = async {
            for _ in 0..PING_COUNT {
                match surge_ping::ping(addr, &[]).await {
                    Ok((_, rtt)) => rtts.push(rtt),
                    Err(surge_ping::SurgeError::Timeout { .. }) => lost += 1,
                    Err(e) => return Err(ProbeError::Untyped(e.to_string())),
                }
            }
            Ok(())
        };
        match tokio::time::timeout(PING_WINDOW, echoes).await {
            // Echoes that never came back inside the window count as lost.
            Ok(result) => result?,
            Err(_) => lost = PING_COUNT - rtts.len(),
        }

        if lost > 0 {
            let loss = lost as f64 / PING_COUNT as f64 * 100.0;
            return Err(ProbeError::PacketLoss(loss));
        }
        let total: Duration = rtts.iter().sum();
        metrics.set_ping_timing(total / rtts.len() as u32);
        Ok(())
    }
}

/// Timings from one probe request.
#[derive(Debug, Clone, Copy)]
pub struct RequestMetrics {
    /// Server receipt time minus request start; negative under clock skew.
    pub request_timing: chrono::Duration,
    /// Full round trip as seen by the client.
    pub response_timing: chrono::Duration,
}

/// Per-run measurements, shared by the probe tasks of one validation run
/// and discarded afterwards.
#[derive(Debug, Default)]
pub struct ProxyMetrics {
    ping_timing: Mutex<Duration>,
    request_metrics: Mutex<Vec<RequestMetrics>>,
    pub errors: MultiError,
}

impl ProxyMetrics {
    pub fn add_request_metric(&self, rm: RequestMetrics) {
        self.request_metrics.lock().unwrap().push(rm);
    }

    pub fn request_metrics(&self) -> Vec<RequestMetrics> {
        self.request_metrics.lock().unwrap().clone()
    }

    pub fn set_ping_timing(&self, rtt: Duration) {
        *self.ping_timing.lock().unwrap() = rtt;
    }

    pub fn ping_timing(&self) -> Duration {
        *self.ping_timing.lock().unwrap()
    }
}

fn parse_probe_body(body: &str) -> Result<DateTime<Utc>, ProbeError> {
    let parts: Vec<&str> = body.split_whitespace().collect();
    if parts.len() != 3 {
        return Err(ProbeError::BadResponse(
            "invalid response format from probe origin".to_string(),
        ));
    }
    let secs: f64 = parts[2]
        .parse()
        .map_err(|e| ProbeError::BadResponse(format!("bad server timestamp: {e}")))?;
    Ok(Utc.timestamp_nanos((secs * 1e9) as i64))
}
