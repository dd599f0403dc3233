//! Persisted per-VM metadata: the QEMU command-line version and the machine
//! type in effect when the VM last ran.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::backend;

/// Name under which the controller saves and loads VM memory.
pub const SUSPEND_TAG: &str = "suspend";

/// Machine type assumed when a resumed VM carries no metadata.
pub const DEFAULT_MACHINE_TYPE: &str = "pc-i440fx-xenial";

/// Current command-line iteration; always written on fresh starts.
pub const LATEST_COMMAND_VERSION: i64 = 1;

const COMMAND_VERSION_KEY: &str = "vm_command_version";
const MACHINE_TYPE_KEY: &str = "machine_type";
const LEGACY_USE_CDROM_KEY: &str = "use_cdrom";

/// Typed view of the persisted metadata object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmMetadata {
    pub vm_command_version: i64,
    pub machine_type: String,
}

/// Command version recorded in `metadata`.
///
/// Older releases recorded only a `use_cdrom` flag; that flag is
/// retro-interpreted as version 1. Anything else falls back to the original
/// command line, version 0.
pub fn command_version_from(metadata: &Value) -> i64 {
    if let Some(version) = metadata.get(COMMAND_VERSION_KEY).and_then(Value::as_i64) {
        version
    } else if metadata
        .get(LEGACY_USE_CDROM_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        1
    } else {
        0
    }
}

/// Machine type recorded in `metadata`, if any.
pub fn machine_type_from(metadata: &Value) -> Option<String> {
    metadata
        .get(MACHINE_TYPE_KEY)
        .and_then(Value::as_str)
        .filter(|mt| !mt.is_empty())
        .map(str::to_string)
}

/// Machine type to resume `vm_name` with, defaulting when undetermined.
pub fn machine_type_or_default(metadata: &Value, vm_name: &str) -> String {
    machine_type_from(metadata).unwrap_or_else(|| {
        info!(
            target: "qvmctl",
            "{}: cannot determine QEMU machine type, defaulting to '{}'",
            vm_name,
            DEFAULT_MACHINE_TYPE
        );
        DEFAULT_MACHINE_TYPE.to_string()
    })
}

/// Metadata written on every fresh start: the latest command version and
/// the machine type probed from the installed QEMU.
pub fn generate_metadata() -> Value {
    json!({
        "machine_type": backend::probe_machine_type().unwrap_or_default(),
        "vm_command_version": LATEST_COMMAND_VERSION,
    })
}
