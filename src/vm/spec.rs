//! QEMU command-line assembly.
//!
//! QEMU will often refuse to resume a VM that was launched with a different
//! command line, so each iteration of the argument set is versioned and the
//! version is saved in the VM's metadata:
//!
//! * 1 — cloud-init ISO attached with `-cdrom` (previously recorded in the
//!   metadata as `use_cdrom`)
//! * 0 — cloud-init ISO attached as a read-only virtio drive

use super::{backend, metadata::SUSPEND_TAG, VmDescriptor};

/// The program and base argument set (V) for one QEMU launch.
#[derive(Debug, Clone)]
pub struct QemuProcessSpec {
    program: String,
    args: Vec<String>,
}

impl QemuProcessSpec {
    pub fn new(desc: &VmDescriptor, command_version: i64) -> Self {
        let mut args: Vec<String> = vec![
            "--enable-kvm".into(),
            // Disk
            "-hda".into(),
            desc.image_path.display().to_string(),
            // CPU and memory
            "-smp".into(),
            desc.num_cores.to_string(),
            "-m".into(),
            format!("{}M", desc.mem_size_mb),
            // Networking: tap device bridged to the orchestrator's subnet
            "-device".into(),
            format!(
                "virtio-net-pci,netdev=hostnet0,id=net0,mac={}",
                desc.mac_addr
            ),
            "-netdev".into(),
            format!(
                "tap,id=hostnet0,ifname={},script=no,downscript=no",
                desc.tap_device_name
            ),
            // Control channel: QMP over stdio
            "-qmp".into(),
            "stdio".into(),
            "-nographic".into(),
        ];
        args.extend(cloud_init_arguments(
            command_version,
            &desc.cloud_init_path.display().to_string(),
        ));

        Self {
            program: format!("qemu-system-{}", backend::cpu_arch()),
            args,
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

/// The cloud-init attachment form selected by `command_version`.
pub fn cloud_init_arguments(command_version: i64, cloud_init_path: &str) -> Vec<String> {
    if command_version >= 1 {
        vec!["-cdrom".into(), cloud_init_path.into()]
    } else {
        vec![
            "-drive".into(),
            format!(
                "file={},if=virtio,format=raw,snapshot=off,read-only",
                cloud_init_path
            ),
        ]
    }
}

/// Extra arguments appended when resuming from the memory snapshot.
pub fn resume_arguments(machine_type: &str) -> Vec<String> {
    vec![
        "-loadvm".into(),
        SUSPEND_TAG.into(),
        "-machine".into(),
        machine_type.into(),
    ]
}
