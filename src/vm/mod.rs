//! VM lifecycle control: state model, collaborator interfaces, and the
//! QEMU-backed controller.

mod backend;
mod lifecycle;
mod metadata;
mod process;
mod spec;

pub use lifecycle::{QemuVm, VmDependencies};
pub use metadata::{VmMetadata, DEFAULT_MACHINE_TYPE, LATEST_COMMAND_VERSION, SUSPEND_TAG};
pub use process::{
    ExitStatusInfo, HostProcessFactory, ProcessEvent, ProcessFactory, ProcessHandle,
    ProcessRunState, QemuProcess,
};
pub use spec::QemuProcessSpec;

use std::{
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Observed lifecycle state of a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Off,
    Starting,
    Running,
    DelayedShutdown,
    Restarting,
    Suspending,
    Suspended,
    /// Accepted on entry from persistence; treated like `Running` for
    /// shutdown purposes.
    Unknown,
}

impl VmState {
    /// Running for the purposes of suspend/shutdown decisions.
    pub fn is_running(self) -> bool {
        matches!(self, VmState::Running | VmState::DelayedShutdown)
    }
}

/// Immutable description of one VM. Built by the caller from its image and
/// cloud-init artefacts.
#[derive(Debug, Clone)]
pub struct VmDescriptor {
    pub vm_name: String,
    pub image_path: PathBuf,
    pub cloud_init_path: PathBuf,
    pub tap_device_name: String,
    pub mac_addr: String,
    pub ssh_username: String,
    pub num_cores: u32,
    pub mem_size_mb: u32,
}

/// Receives lifecycle callbacks and persists state transitions.
///
/// Implementations must not call back into the controller from within a
/// callback; callbacks are delivered in trigger order and never re-entered.
pub trait StatusMonitor: Send + Sync {
    fn on_resume(&self);
    fn on_restart(&self, vm_name: &str);
    fn on_suspend(&self);
    fn on_shutdown(&self);
    fn persist_state_for(&self, vm_name: &str, state: VmState);
}

/// Address directory keyed by MAC, fed by the DHCP machinery.
pub trait DhcpDirectory: Send + Sync {
    fn get_ip_for(&self, mac_addr: &str) -> Option<Ipv4Addr>;
}

/// Loads and saves per-VM metadata JSON.
pub trait VmMetadataStore: Send + Sync {
    /// Metadata for `vm_name`; an empty object when nothing was persisted.
    fn retrieve_metadata_for(&self, vm_name: &str) -> Value;
    fn update_metadata_for(&self, vm_name: &str, metadata: Value);
}

/// File-backed metadata store writing one `<vm_name>.json` per VM.
#[derive(Debug)]
pub struct JsonFileMetadataStore {
    dir: PathBuf,
}

impl JsonFileMetadataStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, vm_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", vm_name))
    }
}

impl VmMetadataStore for JsonFileMetadataStore {
    fn retrieve_metadata_for(&self, vm_name: &str) -> Value {
        let path = self.path_for(vm_name);
        match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|err| {
                debug!(target: "qvmctl", "metadata for {} is not valid JSON: {}", vm_name, err);
                Value::Object(Default::default())
            }),
            Err(_) => Value::Object(Default::default()),
        }
    }

    fn update_metadata_for(&self, vm_name: &str, metadata: Value) {
        let path = self.path_for(vm_name);
        if let Err(err) = write_json_atomically(&path, &metadata) {
            debug!(target: "qvmctl", "failed to persist metadata for {}: {:#}", vm_name, err);
        }
    }
}

fn write_json_atomically(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
