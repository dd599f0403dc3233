use thiserror::Error;

/// Failure reported by the SSH transport collaborator.
///
/// The transport itself lives outside this crate; implementations wrap
/// whatever their underlying library reports into a plain message.
#[derive(Debug, Error)]
#[error("ssh session error: {0}")]
pub struct SshError(pub String);

/// Errors raised while establishing or running an SSHFS mount.
#[derive(Debug, Error)]
pub enum MountError {
    /// The guest has no usable sshfs installation.
    #[error("sshfs is not installed on the instance")]
    SshfsMissing,

    /// A bootstrap command exited non-zero on the guest.
    #[error("remote command `{command}` failed: {stderr}")]
    Remote { command: String, stderr: String },

    /// `id -u`/`id -g` produced something that is not a number.
    #[error("invalid id '{0}'")]
    InvalidId(String),

    #[error("invalid fuse version '{0}'")]
    InvalidFuseVersion(String),

    #[error(transparent)]
    Ssh(#[from] SshError),
}

/// Errors surfaced by the VM lifecycle controller.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("cannot start the instance while suspending")]
    StartWhileSuspending,

    #[error("cannot start VM without an image")]
    MissingImage,

    #[error("failed to start qemu instance")]
    SpawnFailed(anyhow::Error),

    /// The child died before the VM reached `running`. Carries the last
    /// line the child wrote to stderr.
    #[error("{vm_name}: {message}")]
    Start { vm_name: String, message: String },

    #[error("failed to determine IP address")]
    IpTimeout,

    #[error("{vm_name}: timed out waiting for response")]
    SshTimeout { vm_name: String },
}

impl VmError {
    pub(crate) fn start(vm_name: &str, message: impl Into<String>) -> Self {
        VmError::Start {
            vm_name: vm_name.to_string(),
            message: message.into(),
        }
    }
}
