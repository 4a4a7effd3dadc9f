use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::core::config::ValidatorConfig;
use crate::core::error::{ErrorCode, ProbeError};
use crate::proxy::{Proxy, ProxyMetrics, STATUS_FAILED, STATUS_NEED_SCAN, STATUS_OK};
use crate::storage::Storage;

/// Schemes probed against the reference origin on every run.
pub const VALIDATION_SCHEMES: [&str; 2] = ["http", "https"];

/// Score deltas applied once per kind recorded during a run.
const ERROR_SCORES: [(ErrorCode, i64); 6] = [
    (ErrorCode::Untyped, -1),
    (ErrorCode::PacketLoss, -10),
    (ErrorCode::RequestFail, -20),
    (ErrorCode::BadResponse, -20),
    (ErrorCode::CannotCreateProxyDialer, -20),
    (ErrorCode::InvalidProxyUrl, 0),
];

/// Bonus buckets matched against the averaged response timing. Bounds are
/// strict on both ends: a value exactly on a boundary earns nothing.
const METRIC_SCORES: [(Duration, Duration, i64); 4] = [
    (Duration::ZERO, Duration::from_secs(2), 30),
    (Duration::from_secs(2), Duration::from_secs(3), 20),
    (Duration::from_secs(3), Duration::from_secs(5), 5),
    (Duration::from_secs(5), Duration::from_secs(100), 1),
];

const BUNCH_SIZE: usize = 1000;
const IDLE_SLEEP: Duration = Duration::from_secs(5);

/// Continuously drains due proxies from storage, probes them under a global
/// concurrency cap and persists the updated score and status.
pub struct Validator {
    cfg: ValidatorConfig,
    storage: Arc<Storage>,
    cancel: CancellationToken,
}

impl Validator {
    pub fn new(cfg: ValidatorConfig, storage: Arc<Storage>, cancel: CancellationToken) -> Self {
        Validator {
            cfg,
            storage,
            cancel,
        }
    }

    /// Run until cancelled: pull due proxies in bunches and feed them to the
    /// dispatcher, sleeping while the store has nothing due.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let (tx, rx) = mpsc::channel::<Proxy>(self.cfg.threads.max(1));
        let dispatcher = tokio::spawn(Arc::clone(&self).serve_input(rx));

        'feed: while !self.cancel.is_cancelled() {
            let bunch = self.storage.load_validation_bunch(BUNCH_SIZE)?;
            debug!("validation bunch {}", bunch.len());
            if bunch.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(IDLE_SLEEP) => {}
                    _ = self.cancel.cancelled() => break,
                }
                continue;
            }
            for proxy in bunch {
                tokio::select! {
                    sent = tx.send(proxy) => {
                        if sent.is_err() {
                            break 'feed;
                        }
                    }
                    _ = self.cancel.cancelled() => break 'feed,
                }
            }
        }

        drop(tx);
        dispatcher.await?;
        Ok(())
    }

    /// Dispatcher: one semaphore slot is taken per proxy BEFORE the worker
    /// is spawned and released when the worker finishes, so at most
    /// `cfg.threads` validations are ever in flight.
    async fn serve_input(self: Arc<Self>, mut input: mpsc::Receiver<Proxy>) {
        let semaphore = Arc::new(Semaphore::new(self.cfg.threads.max(1)));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                next = input.recv() => {
                    let Some(proxy) = next else { return };
                    let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                        return;
                    };
                    let validator = Arc::clone(&self);
                    tokio::spawn(async move {
                        validator.validate(proxy).await;
                        drop(permit);
                    });
                }
            }
        }
    }

    /// One end-to-end validation run: probe fan-out, scoring, persist.
    ///
    /// Any client construction failure is recorded under the InvalidProxyUrl
    /// key, which is what parks the proxy in NEED_SCAN.
    pub async fn validate(&self, mut proxy: Proxy) {
        debug!("Validating {}", proxy.url());
        let metrics = Arc::new(ProxyMetrics::default());

        match proxy.init_client(self.cfg.timeout) {
            Err(err) => {
                metrics.errors.add_keyed(ErrorCode::InvalidProxyUrl, err);
            }
            Ok(client) => {
                let probe = Arc::new(proxy.clone());
                let mut tasks = Vec::new();

                {
                    let probe = Arc::clone(&probe);
                    let metrics = Arc::clone(&metrics);
                    tasks.push(tokio::spawn(async move {
                        if let Err(err) = probe.check_ping(&metrics).await {
                            metrics.errors.add(err);
                        }
                    }));
                }

                for scheme in VALIDATION_SCHEMES {
                    let target = format!("{}://{}{}", scheme, self.cfg.host, self.cfg.path);
                    for _ in 0..self.cfg.number_of_requests {
                        let probe = Arc::clone(&probe);
                        let metrics = Arc::clone(&metrics);
                        let client = client.clone();
                        let target = target.clone();
                        tasks.push(tokio::spawn(async move {
                            if let Err(err) = probe.check_proxy(&client, &target, &metrics).await {
                                metrics.errors.add(err);
                            }
                        }));
                    }
                }

                for task in tasks {
                    if let Err(e) = task.await {
                        metrics
                            .errors
                            .add(ProbeError::Untyped(format!("probe task failed: {e}")));
                    }
                }
            }
        }

        self.calc_errors(&mut proxy, &metrics);
        self.calc_metrics(&mut proxy, &metrics);
        self.calc_status(&mut proxy, &metrics);
        proxy.last_check = Utc::now();
        proxy.check_number += 1;
        if let Err(e) = self.storage.save(&proxy) {
            error!("failed to persist validation of {}: {e:#}", proxy.url());
        }
    }

    /// Apply the per-kind error deltas for everything this run recorded.
    fn calc_errors(&self, proxy: &mut Proxy, metrics: &ProxyMetrics) {
        for (code, delta) in ERROR_SCORES {
            if let Some(msg) = metrics.errors.message(code) {
                debug!("Code:{} {} {}", code.as_i64(), proxy.url(), msg);
                proxy.score += delta;
            }
        }
    }

    /// Fold the run's samples into persisted averages and apply the single
    /// matching latency bucket bonus.
    fn calc_metrics(&self, proxy: &mut Proxy, metrics: &ProxyMetrics) {
        let samples = metrics.request_metrics();
        let mut request_nanos = 0f64;
        let mut response_nanos = 0f64;
        for sample in &samples {
            request_nanos += sample.request_timing.num_nanoseconds().unwrap_or(0) as f64;
            response_nanos += sample.response_timing.num_nanoseconds().unwrap_or(0) as f64;
        }

        proxy.avg_request_timing = mean_duration(request_nanos, samples.len());
        proxy.avg_response_timing = mean_duration(response_nanos, samples.len());
        proxy.avg_ping_timing = metrics.ping_timing();

        let t = proxy.avg_response_timing;
        for (min, max, bonus) in METRIC_SCORES {
            if t > min && t < max {
                proxy.score += bonus;
                break;
            }
        }
    }

    fn calc_status(&self, proxy: &mut Proxy, metrics: &ProxyMetrics) {
        if metrics.errors.has(ErrorCode::InvalidProxyUrl) {
            proxy.status = STATUS_NEED_SCAN;
            return;
        }
        proxy.status = if proxy.score > 0 {
            STATUS_OK
        } else {
            STATUS_FAILED
        };
    }
}

/// Mean of `total_nanos` over `n` samples, floored at zero. No samples and a
/// skew-negative mean both come out as zero.
fn mean_duration(total_nanos: f64, n: usize) -> Duration {
    if n == 0 {
        return Duration::ZERO;
    }
    let mean = total_nanos / n as f64;
    if mean <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(mean as u64)
}
