use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::protocol::{HeartbeatRequest, TerritoryHeartbeatRequest, now_rfc3339};
use crate::version;

use super::service::Service;

/// Thread-safe cell for the mutable directive token.
///
/// The heartbeat loop refreshes it; the log uploader and the finished post
/// read it concurrently. Storing an empty token is a no-op so a server
/// omitting the field can never wipe the credential.
pub struct TokenHolder {
    token: std::sync::RwLock<String>,
}

impl TokenHolder {
    pub fn new(initial: impl Into<String>) -> Self {
        Self {
            token: std::sync::RwLock::new(initial.into()),
        }
    }

    pub fn get(&self) -> String {
        self.token.read().expect("token lock poisoned").clone()
    }

    pub fn set(&self, token: &str) {
        if token.is_empty() {
            return;
        }
        *self.token.write().expect("token lock poisoned") = token.to_string();
    }
}

impl Service {
    /// Periodic territory-level presence heartbeat: labels, capacity
    /// (per-driver health, supported profiles), running count, version.
    /// Consumes upgrade hints; mutates nothing.
    pub(super) async fn run_territory_heartbeat_loop(self: Arc<Self>, cancel: CancellationToken) {
        let has_header_auth = !self.cfg.territory_id.is_empty();
        let has_client_cert =
            !self.cfg.tls.client_cert_file.is_empty() && !self.cfg.tls.client_key_file.is_empty();
        if !has_header_auth && !has_client_cert {
            tracing::info!(
                "skipping territory heartbeat loop: no territory_id and no mTLS client cert"
            );
            return;
        }

        let interval = self.cfg.territory_heartbeat_interval();

        self.send_territory_heartbeat().await;

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.send_territory_heartbeat().await,
            }
        }
    }

    async fn send_territory_heartbeat(&self) {
        let health = self
            .factory
            .health_check_all(Duration::from_secs(15))
            .await;

        for (driver, result) in &health {
            self.metrics
                .driver_healthy
                .with_label_values(&[driver.as_str()])
                .set(if result.healthy { 1 } else { 0 });
        }

        let mut labels = crate::protocol::LooseMap::new();
        for (k, v) in &self.cfg.labels {
            labels.insert(k.clone(), serde_json::Value::String(v.clone()));
        }

        let mut capacity = crate::protocol::LooseMap::new();
        capacity.insert(
            "sandbox_health".into(),
            serde_json::to_value(&health).unwrap_or_default(),
        );
        capacity.insert(
            "supported_profiles".into(),
            serde_json::to_value(self.factory.supported_profiles()).unwrap_or_default(),
        );
        capacity.insert(
            "untrusted_driver".into(),
            serde_json::Value::String(self.factory.untrusted_driver_name()),
        );

        let req = TerritoryHeartbeatRequest {
            nexusd_version: version::VERSION.to_string(),
            running_directives_count: Some(self.running_count.load(Ordering::SeqCst)),
            labels,
            capacity,
        };

        match self.cli.territory_heartbeat(&req).await {
            Err(e) => tracing::warn!(error = %e, "territory heartbeat failed"),
            Ok(resp) => {
                if resp.upgrade_available {
                    tracing::info!(latest_version = %resp.latest_version, "upgrade available");
                }
                if !resp.min_compatible_version.is_empty()
                    && version::compare(version::VERSION, &resp.min_compatible_version)
                        == std::cmp::Ordering::Less
                {
                    tracing::warn!(
                        current = version::VERSION,
                        min_compatible = %resp.min_compatible_version,
                        "nexusd version may be incompatible with server"
                    );
                }
            }
        }
    }

    /// Per-directive heartbeat loop, running from before prepare until the
    /// driver returns. Each tick refreshes the token from the response; a
    /// cancel_requested response cancels the execution context and ends
    /// the loop.
    #[allow(clippy::too_many_arguments)]
    pub(super) async fn run_directive_heartbeat_loop(
        &self,
        loop_cancel: CancellationToken,
        directive_id: String,
        facility_id: String,
        profile: String,
        driver: String,
        token: Arc<TokenHolder>,
        cancel_requested: Arc<AtomicBool>,
        exec_cancel: CancellationToken,
    ) {
        let interval = self.cfg.heartbeat_interval();
        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);

        loop {
            tokio::select! {
                _ = loop_cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let mut progress = crate::protocol::LooseMap::new();
            progress.insert("state".into(), serde_json::Value::String("running".into()));
            let req = HeartbeatRequest {
                progress,
                last_output_seq: 0,
                now: now_rfc3339(),
            };

            match self.cli.heartbeat(&directive_id, &token.get(), &req).await {
                Err(e) => {
                    self.metrics.heartbeat_errors_total.inc();
                    tracing::warn!(directive_id = %directive_id, error = %e, "heartbeat failed");
                    self.tape_event(
                        "heartbeat_error",
                        &directive_id,
                        &facility_id,
                        &profile,
                        &driver,
                        Some(serde_json::json!({"error": e.to_string()})),
                    );
                }
                Ok(resp) => {
                    token.set(&resp.directive_token);
                    if resp.cancel_requested {
                        tracing::info!(directive_id = %directive_id, "cancel requested");
                        self.tape_event(
                            "cancel_requested",
                            &directive_id,
                            &facility_id,
                            &profile,
                            &driver,
                            None,
                        );
                        cancel_requested.store(true, Ordering::SeqCst);
                        exec_cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}
