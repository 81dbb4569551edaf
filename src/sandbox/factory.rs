//! Profile-to-driver registry.
//!
//! Profiles are coarse trust tiers; the factory resolves them to whatever
//! drivers the current platform registered:
//!
//!   host              -> host
//!   untrusted         -> bwrap (default) or firecracker, configurable
//!   trusted           -> container, falling back to host
//!   darwin-automation -> darwin-automation

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::{Driver, HealthResult, SandboxError};

pub struct DriverFactory {
    drivers: BTreeMap<&'static str, Arc<dyn Driver>>,
    /// Override for the "untrusted" profile; empty means "bwrap".
    untrusted_driver: String,
}

impl DriverFactory {
    pub fn new(drivers: Vec<Arc<dyn Driver>>) -> Self {
        let mut m = BTreeMap::new();
        for d in drivers {
            m.insert(d.name(), d);
        }
        Self {
            drivers: m,
            untrusted_driver: String::new(),
        }
    }

    pub fn set_untrusted_driver(&mut self, name: impl Into<String>) {
        self.untrusted_driver = name.into();
    }

    /// Resolve a profile to its driver. "trusted" falls back to "host"
    /// when no container driver is registered.
    pub fn get(&self, profile: &str) -> Result<Arc<dyn Driver>, SandboxError> {
        let driver_name = self.profile_to_driver(profile);
        if let Some(d) = self.drivers.get(driver_name.as_str()) {
            return Ok(Arc::clone(d));
        }
        if profile == "trusted" {
            if let Some(host) = self.drivers.get("host") {
                return Ok(Arc::clone(host));
            }
        }
        Err(SandboxError::NoDriver {
            profile: profile.to_string(),
            driver: driver_name,
        })
    }

    /// Profiles this factory can serve, advertised in poll requests and
    /// territory heartbeats.
    pub fn supported_profiles(&self) -> Vec<String> {
        let mut profiles = Vec::new();
        if self.drivers.contains_key("host") {
            profiles.push("host".to_string());
        }
        if self
            .drivers
            .contains_key(self.profile_to_driver("untrusted").as_str())
        {
            profiles.push("untrusted".to_string());
        }
        if self.drivers.contains_key("container") || self.drivers.contains_key("host") {
            profiles.push("trusted".to_string());
        }
        if self.drivers.contains_key("darwin-automation") {
            profiles.push("darwin-automation".to_string());
        }
        profiles
    }

    /// Run every registered driver's health check concurrently, each
    /// bounded by `timeout`.
    pub async fn health_check_all(&self, timeout: Duration) -> BTreeMap<String, HealthResult> {
        let checks = self.drivers.iter().map(|(name, drv)| async move {
            let result = match tokio::time::timeout(timeout, drv.health_check()).await {
                Ok(r) => r,
                Err(_) => HealthResult::unhealthy(name, "health check timed out"),
            };
            (name.to_string(), result)
        });
        futures::future::join_all(checks).await.into_iter().collect()
    }

    /// Driver name serving the "untrusted" profile, reported in heartbeats
    /// so the mothership can map profiles correctly.
    pub fn untrusted_driver_name(&self) -> String {
        self.profile_to_driver("untrusted")
    }

    fn profile_to_driver(&self, profile: &str) -> String {
        match profile {
            "untrusted" => {
                if self.untrusted_driver.is_empty() {
                    "bwrap".to_string()
                } else {
                    self.untrusted_driver.clone()
                }
            }
            "trusted" => "container".to_string(),
            "host" => "host".to_string(),
            other => other.to_string(),
        }
    }
}

/// Register the drivers whose preconditions hold on this platform.
#[cfg(target_os = "linux")]
pub fn platform_factory(cfg: &crate::config::Config) -> DriverFactory {
    use super::{bwrap, container, firecracker, host};

    let mut drivers: Vec<Arc<dyn Driver>> = vec![
        Arc::new(host::HostDriver::new()),
        Arc::new(bwrap::BwrapDriver::new(cfg.bwrap.clone())),
        Arc::new(container::ContainerDriver::new(cfg.container.clone())),
    ];
    if cfg.untrusted_driver == "firecracker" {
        drivers.push(Arc::new(firecracker::FirecrackerDriver::new(
            cfg.firecracker.clone(),
        )));
    }

    let mut factory = DriverFactory::new(drivers);
    if cfg.untrusted_driver == "firecracker" {
        factory.set_untrusted_driver("firecracker");
    }
    factory
}

#[cfg(target_os = "macos")]
pub fn platform_factory(_cfg: &crate::config::Config) -> DriverFactory {
    use super::{darwin, host};

    DriverFactory::new(vec![
        Arc::new(host::HostDriver::new()),
        Arc::new(darwin::DarwinAutomationDriver::new()),
    ])
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn platform_factory(_cfg: &crate::config::Config) -> DriverFactory {
    use super::host;

    DriverFactory::new(vec![Arc::new(host::HostDriver::new())])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::host::HostDriver;
    use crate::sandbox::{ExecContext, RunRequest, RunResult};
    use async_trait::async_trait;

    #[derive(Debug)]
    struct FakeDriver(&'static str);

    #[async_trait]
    impl Driver for FakeDriver {
        fn name(&self) -> &'static str {
            self.0
        }

        async fn health_check(&self) -> HealthResult {
            HealthResult::healthy(self.0)
        }

        async fn run(
            &self,
            _ctx: &ExecContext,
            _req: RunRequest,
        ) -> Result<RunResult, SandboxError> {
            Ok(RunResult::default())
        }
    }

    #[test]
    fn host_profile_resolves_to_host() {
        let f = DriverFactory::new(vec![Arc::new(HostDriver::new())]);
        assert_eq!(f.get("host").unwrap().name(), "host");
    }

    #[test]
    fn untrusted_defaults_to_bwrap() {
        let f = DriverFactory::new(vec![Arc::new(FakeDriver("bwrap"))]);
        assert_eq!(f.get("untrusted").unwrap().name(), "bwrap");
        assert_eq!(f.untrusted_driver_name(), "bwrap");
    }

    #[test]
    fn untrusted_override_to_firecracker() {
        let mut f = DriverFactory::new(vec![
            Arc::new(FakeDriver("bwrap")),
            Arc::new(FakeDriver("firecracker")),
        ]);
        f.set_untrusted_driver("firecracker");
        assert_eq!(f.get("untrusted").unwrap().name(), "firecracker");
        assert_eq!(f.untrusted_driver_name(), "firecracker");
    }

    #[test]
    fn trusted_falls_back_to_host() {
        let f = DriverFactory::new(vec![Arc::new(HostDriver::new())]);
        assert_eq!(f.get("trusted").unwrap().name(), "host");

        let f = DriverFactory::new(vec![
            Arc::new(HostDriver::new()),
            Arc::new(FakeDriver("container")),
        ]);
        assert_eq!(f.get("trusted").unwrap().name(), "container");
    }

    #[test]
    fn unknown_profile_errors() {
        let f = DriverFactory::new(vec![Arc::new(HostDriver::new())]);
        let err = f.get("quantum").unwrap_err();
        assert!(matches!(err, SandboxError::NoDriver { .. }));
        assert!(err.to_string().contains("quantum"));
    }

    #[test]
    fn supported_profiles_reflect_registrations() {
        let f = DriverFactory::new(vec![Arc::new(HostDriver::new())]);
        let profiles = f.supported_profiles();
        assert!(profiles.contains(&"host".to_string()));
        assert!(profiles.contains(&"trusted".to_string()));
        assert!(!profiles.contains(&"untrusted".to_string()));

        let f = DriverFactory::new(vec![
            Arc::new(HostDriver::new()),
            Arc::new(FakeDriver("bwrap")),
            Arc::new(FakeDriver("darwin-automation")),
        ]);
        let profiles = f.supported_profiles();
        assert!(profiles.contains(&"untrusted".to_string()));
        assert!(profiles.contains(&"darwin-automation".to_string()));
    }

    #[tokio::test]
    async fn health_check_all_covers_every_driver() {
        let f = DriverFactory::new(vec![
            Arc::new(FakeDriver("bwrap")),
            Arc::new(HostDriver::new()),
        ]);
        let results = f.health_check_all(Duration::from_secs(5)).await;
        assert_eq!(results.len(), 2);
        assert!(results["host"].healthy);
        assert!(results["bwrap"].healthy);
    }
}
