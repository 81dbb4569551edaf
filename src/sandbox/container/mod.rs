//! Rootless container (Podman/Docker) driver for trusted workloads.
//!
//! The network constraint is soft: the container shares the host network
//! namespace and is pointed at a loopback TCP egress proxy through
//! HTTP_PROXY/HTTPS_PROXY. A trusted workload that deliberately bypasses
//! those variables is not blocked; that is the stated trust boundary.

mod cmdbuilder;

pub use cmdbuilder::{ContainerCmdConfig, build_args};

#[cfg(target_os = "linux")]
mod driver;
#[cfg(target_os = "linux")]
pub use driver::ContainerDriver;
