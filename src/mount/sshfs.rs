//! The mount itself: probe the guest, launch the remote sshfs bridge, and
//! drive the host-side SFTP server until the peer closes the session.

use std::{sync::Arc, thread};

use tracing::{debug, info, warn};

use crate::{errors::MountError, ssh::SshSession};

use super::{
    probe::{self, PreparedMount},
    sftp::{IdMappings, SftpServerFactory, SftpServerSession},
    MountSpec,
};

/// A live host→guest directory share.
///
/// Construction performs the whole bootstrap; the SFTP loop then runs on a
/// dedicated worker thread. Dropping the mount stops the server and joins
/// the worker.
pub struct SshfsMount {
    server: Arc<dyn SftpServerSession>,
    worker: Option<thread::JoinHandle<()>>,
}

impl std::fmt::Debug for SshfsMount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshfsMount").finish_non_exhaustive()
    }
}

impl SshfsMount {
    pub fn new(
        mut session: Box<dyn SshSession>,
        server_factory: &dyn SftpServerFactory,
        spec: &MountSpec,
    ) -> Result<Self, MountError> {
        let prepared = probe::establish(session.as_mut(), spec)?;
        let ids = IdMappings::new(
            spec.uid_map.clone(),
            spec.gid_map.clone(),
            prepared.identity.uid,
            prepared.identity.gid,
        );

        let command = sshfs_command(&prepared, spec, &ids);
        debug!(target: "qvmctl", "launching remote sshfs bridge: {}", command);
        session.exec_detached(&command)?;

        // From here the session's channel carries SFTP frames only.
        let server = server_factory.create(session, spec, ids)?;

        let worker_server = Arc::clone(&server);
        let source = spec.source_path.clone();
        let worker = thread::spawn(move || {
            info!(target: "qvmctl", "mount of {} connected", source);
            if let Err(err) = run_sftp_loop(worker_server.as_ref()) {
                warn!(target: "qvmctl", "sftp loop for {} failed: {}", source, err);
            }
            info!(target: "qvmctl", "mount of {} stopped", source);
        });

        Ok(Self {
            server,
            worker: Some(worker),
        })
    }

    /// Stop serving and wait for the worker to drain.
    pub fn stop(&mut self) {
        self.server.request_stop();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for SshfsMount {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Serve client messages until the peer closes the session, observed as a
/// null message from the embedded server.
fn run_sftp_loop(server: &dyn SftpServerSession) -> Result<(), MountError> {
    while let Some(message) = server.next_client_message()? {
        server.serve(message)?;
    }
    Ok(())
}

fn sshfs_command(prepared: &PreparedMount, spec: &MountSpec, ids: &IdMappings) -> String {
    let mut options: Vec<String> = ["slave", "nonempty", "transform_symlinks", "allow_other"]
        .iter()
        .map(|o| o.to_string())
        .collect();
    if let Some(uid) = ids.default_uid_override() {
        options.push(format!("uid={}", uid));
    }
    if let Some(gid) = ids.default_gid_override() {
        options.push(format!("gid={}", gid));
    }

    let rendered: Vec<String> = options.iter().map(|o| format!("-o {}", o)).collect();
    format!(
        "{}sudo sshfs {} :\"{}\" \"{}\"",
        prepared.identity.env_prefix(),
        rendered.join(" "),
        spec.source_path,
        prepared.target
    )
}
