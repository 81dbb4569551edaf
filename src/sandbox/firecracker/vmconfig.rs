use std::path::{Path, PathBuf};

use serde::Serialize;

/// Firecracker `--config-file` JSON document.
#[derive(Debug, Clone, Serialize)]
pub struct VmConfig {
    #[serde(rename = "boot-source")]
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    #[serde(rename = "machine-config")]
    pub machine_config: MachineConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vsock: Option<VsockDevice>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VsockDevice {
    pub vsock_id: String,
    pub guest_cid: u32,
    pub uds_path: String,
}

pub struct VmConfigInput<'a> {
    pub kernel_path: &'a str,
    pub rootfs_path: &'a str,
    pub cmd_image_path: &'a Path,
    pub workspace_image_path: &'a Path,
    pub vcpus: u32,
    pub mem_size_mib: u32,
    /// Empty disables the vsock device.
    pub vsock_uds_path: Option<&'a PathBuf>,
}

/// Minimal boot: serial console only, no PCI, the in-guest init that
/// mounts the cmd/workspace drives and runs /run.sh. No network devices
/// are ever configured; the vsock is the sole egress path.
const DEFAULT_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/nexus-init";

pub fn build_vm_config(input: &VmConfigInput<'_>) -> VmConfig {
    VmConfig {
        boot_source: BootSource {
            kernel_image_path: input.kernel_path.to_string(),
            boot_args: DEFAULT_BOOT_ARGS.to_string(),
        },
        drives: vec![
            Drive {
                drive_id: "rootfs".into(),
                path_on_host: input.rootfs_path.to_string(),
                is_root_device: true,
                is_read_only: true,
            },
            Drive {
                drive_id: "cmd".into(),
                path_on_host: input.cmd_image_path.to_string_lossy().into_owned(),
                is_root_device: false,
                is_read_only: true,
            },
            Drive {
                drive_id: "workspace".into(),
                path_on_host: input.workspace_image_path.to_string_lossy().into_owned(),
                is_root_device: false,
                is_read_only: false,
            },
        ],
        machine_config: MachineConfig {
            vcpu_count: input.vcpus,
            mem_size_mib: input.mem_size_mib,
            smt: false,
        },
        vsock: input.vsock_uds_path.map(|p| VsockDevice {
            vsock_id: "vsock0".into(),
            guest_cid: 3,
            uds_path: p.to_string_lossy().into_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(vsock: Option<&'a PathBuf>) -> VmConfigInput<'a> {
        VmConfigInput {
            kernel_path: "/srv/fc/vmlinux",
            rootfs_path: "/srv/fc/rootfs.ext4",
            cmd_image_path: Path::new("/tmp/fc/cmd.ext4"),
            workspace_image_path: Path::new("/tmp/fc/workspace.ext4"),
            vcpus: 2,
            mem_size_mib: 512,
            vsock_uds_path: vsock,
        }
    }

    #[test]
    fn three_drives_with_correct_modes() {
        let cfg = build_vm_config(&input(None));
        assert_eq!(cfg.drives.len(), 3);

        let rootfs = &cfg.drives[0];
        assert!(rootfs.is_root_device && rootfs.is_read_only);

        let cmd = &cfg.drives[1];
        assert!(!cmd.is_root_device && cmd.is_read_only);

        let ws = &cfg.drives[2];
        assert!(!ws.is_root_device && !ws.is_read_only);
    }

    #[test]
    fn machine_config_disables_smt() {
        let cfg = build_vm_config(&input(None));
        assert_eq!(cfg.machine_config.vcpu_count, 2);
        assert_eq!(cfg.machine_config.mem_size_mib, 512);
        assert!(!cfg.machine_config.smt);
    }

    #[test]
    fn vsock_guest_cid_is_3() {
        let uds = PathBuf::from("/tmp/fc/vsock.sock");
        let cfg = build_vm_config(&input(Some(&uds)));
        let vsock = cfg.vsock.unwrap();
        assert_eq!(vsock.guest_cid, 3);
        assert_eq!(vsock.uds_path, "/tmp/fc/vsock.sock");
    }

    #[test]
    fn serializes_with_kebab_sections_and_boot_args() {
        let cfg = build_vm_config(&input(None));
        let v: serde_json::Value = serde_json::to_value(&cfg).unwrap();
        assert!(v.get("boot-source").is_some());
        assert!(v.get("machine-config").is_some());
        assert_eq!(
            v["boot-source"]["boot_args"],
            "console=ttyS0 reboot=k panic=1 pci=off init=/sbin/nexus-init"
        );
        assert!(v.get("vsock").is_none());
        // No network interfaces, ever.
        assert!(v.get("network-interfaces").is_none());
    }
}
