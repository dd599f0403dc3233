//! Host-side probes and teardown around the QEMU installation.

use std::{fs, path::Path, process::Command};

use serde_json::Value;
use tracing::{debug, warn};

use crate::util::{match_line_for, run_cmd_for_output, run_cmd_for_status};

use super::metadata::SUSPEND_TAG;

pub(crate) fn cpu_arch() -> &'static str {
    std::env::consts::ARCH
}

/// Whether `qemu-img snapshot -l` lists a suspend snapshot for `image`.
///
/// A VM whose image carries one starts its life `suspended`; detection
/// failures read as "no snapshot".
pub fn instance_image_has_snapshot(image_path: &Path) -> bool {
    let output = match run_cmd_for_output(
        "qemu-img",
        &["snapshot", "-l", &image_path.display().to_string()],
    ) {
        Ok(output) => output,
        Err(err) => {
            debug!(target: "qvmctl", "snapshot listing failed for {}: {:#}", image_path.display(), err);
            return false;
        }
    };
    snapshot_list_contains(&output, SUSPEND_TAG)
}

pub(crate) fn snapshot_list_contains(listing: &str, tag: &str) -> bool {
    match_line_for(listing, tag).is_some()
}

/// Delete the VM's tap device if it exists. Failures are logged only; this
/// runs on teardown paths that must not propagate errors.
pub fn remove_tap_device(tap_device_name: &str) {
    if run_cmd_for_status("ip", &["addr", "show", tap_device_name]) {
        if !run_cmd_for_status("ip", &["link", "delete", tap_device_name]) {
            warn!(target: "qvmctl", "failed to delete tap device {}", tap_device_name);
        }
    }
}

/// Machine type of the installed QEMU, read from a `-dump-vmstate` dump.
pub fn probe_machine_type() -> Option<String> {
    let dump_file = match tempfile::NamedTempFile::new() {
        Ok(file) => file,
        Err(err) => {
            debug!(target: "qvmctl", "cannot create vmstate dump file: {}", err);
            return None;
        }
    };

    let program = format!("qemu-system-{}", cpu_arch());
    let status = Command::new(&program)
        .args(["-nographic", "-dump-vmstate"])
        .arg(dump_file.path())
        .status();
    if let Err(err) = status {
        debug!(target: "qvmctl", "{} -dump-vmstate failed to launch: {}", program, err);
        return None;
    }

    let contents = fs::read_to_string(dump_file.path()).ok()?;
    machine_type_from_vmstate(&contents)
}

pub(crate) fn machine_type_from_vmstate(dump: &str) -> Option<String> {
    let vmstate: Value = serde_json::from_str(dump).ok()?;
    vmstate
        .get("vmschkmachine")
        .and_then(|section| section.get("Name"))
        .and_then(Value::as_str)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_listing_detects_the_suspend_tag() {
        let listing = "Snapshot list:\n\
                       ID        TAG                 VM SIZE                DATE       VM CLOCK\n\
                       1         suspend                140M 2019-06-11 09:22:35   00:02:17.894\n";
        assert!(snapshot_list_contains(listing, "suspend"));
        assert!(!snapshot_list_contains("Snapshot list:\n", "suspend"));
        assert!(!snapshot_list_contains("", "suspend"));
    }

    #[test]
    fn vmstate_dump_yields_the_machine_name() {
        let dump = r#"{ "vmschkmachine": { "Name": "pc-i440fx-bionic" }, "other": {} }"#;
        assert_eq!(
            machine_type_from_vmstate(dump),
            Some("pc-i440fx-bionic".to_string())
        );
        assert_eq!(machine_type_from_vmstate("{}"), None);
        assert_eq!(machine_type_from_vmstate("not json"), None);
        assert_eq!(
            machine_type_from_vmstate(r#"{ "vmschkmachine": { "Name": "" } }"#),
            None
        );
    }

    #[test]
    fn missing_image_reads_as_no_snapshot() {
        assert!(!instance_image_has_snapshot(Path::new(
            "/nonexistent/disk.img"
        )));
    }
}
