//! Firecracker microVM driver for the strongest isolation tier.
//!
//! Every run stages ephemeral ext4 images (command wrapper + workspace),
//! boots a network-less VM whose only egress path is a vsock bridged to
//! the per-directive proxy, and recovers the exit code from a nonce-tagged
//! marker on the serial console.

mod blockdev;
mod serial;
mod vmconfig;
mod wrapper;

pub use blockdev::{create_image_from_dir, extract_image_to_dir};
pub use serial::ExitCodeCapture;
pub use vmconfig::{VmConfig, VmConfigInput, build_vm_config};
pub use wrapper::{FcWrapperConfig, generate_wrapper};

#[cfg(target_os = "linux")]
mod driver;
#[cfg(target_os = "linux")]
pub use driver::FirecrackerDriver;

/// Generate a fresh 16-hex-char nonce for the exit marker from the OS
/// CSPRNG. The guest cannot spoof the marker without knowing it.
pub fn generate_nonce() -> std::io::Result<String> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes).map_err(std::io::Error::other)?;
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}
