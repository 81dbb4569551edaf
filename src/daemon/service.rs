use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use prometheus::Registry;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::Client;
use crate::config::Config;
use crate::protocol::PollRequest;
use crate::retry::{capped_retry_after, post_with_retry, sleep_cancellable};
use crate::sandbox::factory::{DriverFactory, platform_factory};
use crate::version;

use super::circuitbreaker::CircuitBreaker;
use super::debug_tape::{DebugTape, TapeLine};
use super::httpserver::{ReadinessChecker, serve_observability};
use super::metrics::Metrics;
use super::wal::FinishedWal;

pub struct Service {
    pub(super) cfg: Config,
    pub(super) cli: Arc<Client>,
    pub(super) factory: DriverFactory,
    pub(super) tape: Option<DebugTape>,

    pub(super) metrics: Metrics,
    pub(super) registry: Registry,
    pub(super) wal: FinishedWal,
    pub(super) cb: CircuitBreaker,

    /// Currently executing directives.
    pub(super) running_count: AtomicI64,
}

impl Service {
    pub fn new(cfg: Config) -> Result<Self> {
        let cli = Arc::new(Client::new(&cfg)?);
        let factory = platform_factory(&cfg);

        let tape = if cfg.debug_tape.enabled {
            Some(
                DebugTape::new(cfg.debug_tape.path.clone(), cfg.debug_tape.max_bytes)
                    .context("init debug tape")?,
            )
        } else {
            None
        };

        let registry = Registry::new();
        let metrics = Metrics::new(&registry);

        let wal = FinishedWal::new(&cfg.work_dir).context("init finished WAL")?;

        Ok(Self {
            cfg,
            cli,
            factory,
            tape,
            metrics,
            registry,
            wal,
            cb: CircuitBreaker::new(5, Duration::from_secs(30), Duration::from_secs(5 * 60)),
            running_count: AtomicI64::new(0),
        })
    }

    pub(super) fn tape_event(
        &self,
        event: &str,
        directive_id: &str,
        facility_id: &str,
        profile: &str,
        driver: &str,
        detail: Option<serde_json::Value>,
    ) {
        let Some(tape) = &self.tape else { return };
        tape.record(TapeLine {
            directive_id: directive_id.to_string(),
            facility_id: facility_id.to_string(),
            profile: profile.to_string(),
            driver: driver.to_string(),
            event: event.to_string(),
            detail,
            ..Default::default()
        });
    }

    /// The poll/claim/dispatch loop. Returns once `cancel` fires and
    /// in-flight directives have drained (or the shutdown timeout hit).
    pub async fn serve(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            version = version::VERSION,
            territory_id = %self.cfg.territory_id,
            server = %self.cfg.server_url,
            profiles = ?self.factory.supported_profiles(),
            "nexusd starting"
        );

        std::fs::create_dir_all(&self.cfg.work_dir)
            .with_context(|| format!("create work dir {}", self.cfg.work_dir.display()))?;

        self.replay_wal(&cancel).await;

        tokio::spawn(
            Arc::clone(&self).run_territory_heartbeat_loop(cancel.clone()),
        );

        if self.cfg.observability.enabled {
            tokio::spawn(serve_observability(
                self.cfg.observability.listen_addr.clone(),
                self.registry.clone(),
                Arc::clone(&self) as Arc<dyn ReadinessChecker>,
                cancel.clone(),
            ));
        }

        let max_workers = self.cfg.poll.max_directives_to_claim.max(1);
        let sem = Arc::new(Semaphore::new(max_workers));
        let tracker = TaskTracker::new();

        'poll: loop {
            if cancel.is_cancelled() {
                break;
            }

            if !self.cb.allow() {
                tracing::warn!(cooldown = ?self.cb.cooldown(), "circuit breaker open, skipping poll");
                if !sleep_cancellable(&cancel, self.cb.cooldown()).await {
                    break;
                }
                continue;
            }

            let poll_req = PollRequest {
                supported_sandbox_profiles: self.factory.supported_profiles(),
                max_directives_to_claim: self.cfg.poll.max_directives_to_claim,
            };
            let resp = tokio::select! {
                _ = cancel.cancelled() => break,
                res = self.cli.poll(&poll_req) => res,
            };

            let resp = match resp {
                Err(e) => {
                    self.cb.record_failure();
                    self.metrics.poll_total.with_label_values(&["error"]).inc();
                    self.metrics.poll_errors_total.inc();
                    tracing::error!(error = %e, "poll failed");
                    if !sleep_cancellable(&cancel, self.cfg.poll_retry_backoff()).await {
                        break;
                    }
                    continue;
                }
                Ok(resp) => resp,
            };

            self.cb.record_success();

            if resp.directives.is_empty() {
                self.metrics.poll_total.with_label_values(&["empty"]).inc();
                let sleep = if resp.retry_after_seconds > 0 {
                    capped_retry_after(resp.retry_after_seconds)
                } else {
                    self.cfg.poll_retry_backoff()
                };
                if !sleep_cancellable(&cancel, sleep).await {
                    break;
                }
                continue;
            }

            self.metrics.poll_total.with_label_values(&["ok"]).inc();
            for lease in resp.directives {
                // Worker-pool slot; blocks until one frees up.
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break 'poll,
                    permit = Arc::clone(&sem).acquire_owned() => {
                        permit.expect("semaphore never closed")
                    }
                };

                self.running_count.fetch_add(1, Ordering::SeqCst);
                self.metrics.directives_in_flight.inc();

                let this = Arc::clone(&self);
                let worker_cancel = cancel.clone();
                tracker.spawn(async move {
                    let _permit = permit;
                    let directive_id = lease.directive_id.clone();
                    if let Err(e) = Arc::clone(&this)
                        .handle_directive(worker_cancel, lease)
                        .await
                    {
                        tracing::error!(directive_id = %directive_id, error = %e, "directive failed");
                    }
                    this.running_count.fetch_sub(1, Ordering::SeqCst);
                    this.metrics.directives_in_flight.dec();
                });
            }
        }

        self.drain(tracker).await;
        Ok(())
    }

    async fn drain(&self, tracker: TaskTracker) {
        let in_flight = self.running_count.load(Ordering::SeqCst);
        tracing::info!(
            in_flight,
            timeout = ?self.cfg.shutdown_timeout(),
            "shutting down"
        );

        tracker.close();
        match self.cfg.shutdown_timeout() {
            None => tracker.wait().await,
            Some(timeout) => {
                tokio::select! {
                    _ = tracker.wait() => {
                        tracing::info!("all directives finished");
                    }
                    _ = tokio::time::sleep(timeout) => {
                        tracing::warn!(
                            remaining = self.running_count.load(Ordering::SeqCst),
                            timeout = ?timeout,
                            "shutdown timeout exceeded, exiting with directives still running"
                        );
                    }
                }
            }
        }
    }

    /// Re-post FinishedRequest entries persisted by a previous run; the
    /// WAL is only truncated when every entry went through.
    pub(super) async fn replay_wal(&self, cancel: &CancellationToken) {
        let entries = match self.wal.replay() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "WAL replay read failed");
                return;
            }
        };
        if entries.is_empty() {
            return;
        }

        tracing::info!(count = entries.len(), "replaying WAL entries");
        let mut all_ok = true;
        for entry in &entries {
            if cancel.is_cancelled() {
                return;
            }
            let post = post_with_retry(cancel, "wal-replay", || {
                let cli = Arc::clone(&self.cli);
                let entry = entry.clone();
                async move {
                    cli.finished(&entry.directive_id, &entry.token, &entry.request)
                        .await
                }
            })
            .await;
            if let Err(e) = post {
                tracing::error!(
                    directive_id = %entry.directive_id,
                    error = %e,
                    "WAL replay failed for directive"
                );
                all_ok = false;
            }
        }

        if all_ok {
            match self.wal.truncate() {
                Ok(()) => tracing::info!("WAL replay complete, truncated"),
                Err(e) => tracing::error!(error = %e, "WAL truncate failed"),
            }
        }
    }
}

#[async_trait::async_trait]
impl ReadinessChecker for Service {
    /// Ready when at least one sandbox driver is healthy.
    async fn ready(&self) -> bool {
        self.factory
            .health_check_all(Duration::from_secs(5))
            .await
            .values()
            .any(|r| r.healthy)
    }
}
