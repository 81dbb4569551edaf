//! Bubblewrap sandbox driver for untrusted workloads (Linux).
//!
//! The argument builder and wrapper-script generator carry no platform
//! gate so they are unit-testable anywhere; only the driver itself is
//! Linux-only.

mod cmdbuilder;
mod wrapper;

pub use cmdbuilder::{BwrapCmdConfig, SANDBOX_PROXY_PORT, SANDBOX_PROXY_SOCK, build_args};
pub use wrapper::{WrapperConfig, generate_wrapper, shell_quote};

#[cfg(target_os = "linux")]
mod driver;
#[cfg(target_os = "linux")]
pub use driver::BwrapDriver;
