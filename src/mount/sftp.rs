//! Interface to the embedded SFTP server and the id translation tables it
//! applies.
//!
//! The SFTP protocol work itself is delegated: an implementation wraps
//! whatever server library the host links and pumps its messages through
//! [`SftpServerSession`]. This crate owns the loop driving it and the
//! [`IdMappings`] it must apply.

use std::{collections::HashMap, sync::Arc};

use crate::{errors::MountError, ssh::SshSession};

use super::MountSpec;

/// One request pulled off the SFTP channel. The payload stays inside the
/// embedded server; the token lets the mount loop meter the traffic it
/// drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientMessage {
    pub request_id: u32,
}

/// A running embedded SFTP server bound to one SSH session.
pub trait SftpServerSession: Send + Sync {
    /// Block until the next client message arrives. `None` once the peer
    /// has closed the session.
    fn next_client_message(&self) -> Result<Option<ClientMessage>, MountError>;

    /// Serve one message against the exported source tree, applying the id
    /// mappings handed over at construction in both directions.
    fn serve(&self, message: ClientMessage) -> Result<(), MountError>;

    /// Unblock a pending [`next_client_message`], making it report `None`.
    /// Callable from any thread.
    ///
    /// [`next_client_message`]: SftpServerSession::next_client_message
    fn request_stop(&self);
}

/// Builds the embedded server once the bootstrap is done. Consumes the SSH
/// session: from here on the channel carries SFTP frames.
pub trait SftpServerFactory: Send + Sync {
    fn create(
        &self,
        session: Box<dyn SshSession>,
        spec: &MountSpec,
        ids: IdMappings,
    ) -> Result<Arc<dyn SftpServerSession>, MountError>;
}

/// Finite uid/gid relations between host and guest, applied host→guest on
/// requests and guest→host on responses. Unmapped ids pass through
/// unchanged.
#[derive(Debug, Clone)]
pub struct IdMappings {
    uid_map: HashMap<u32, u32>,
    gid_map: HashMap<u32, u32>,
    reverse_uid: HashMap<u32, u32>,
    reverse_gid: HashMap<u32, u32>,
    /// Numeric ids probed from the guest, used where nothing maps.
    pub default_uid: u32,
    pub default_gid: u32,
}

impl IdMappings {
    pub fn new(
        uid_map: HashMap<u32, u32>,
        gid_map: HashMap<u32, u32>,
        default_uid: u32,
        default_gid: u32,
    ) -> Self {
        let reverse_uid = uid_map.iter().map(|(host, guest)| (*guest, *host)).collect();
        let reverse_gid = gid_map.iter().map(|(host, guest)| (*guest, *host)).collect();
        Self {
            uid_map,
            gid_map,
            reverse_uid,
            reverse_gid,
            default_uid,
            default_gid,
        }
    }

    pub fn guest_uid_for(&self, host_uid: u32) -> u32 {
        *self.uid_map.get(&host_uid).unwrap_or(&host_uid)
    }

    pub fn host_uid_for(&self, guest_uid: u32) -> u32 {
        *self.reverse_uid.get(&guest_uid).unwrap_or(&guest_uid)
    }

    pub fn guest_gid_for(&self, host_gid: u32) -> u32 {
        *self.gid_map.get(&host_gid).unwrap_or(&host_gid)
    }

    pub fn host_gid_for(&self, guest_gid: u32) -> u32 {
        *self.reverse_gid.get(&guest_gid).unwrap_or(&guest_gid)
    }

    /// The guest uid the map assigns to the probed default, if any. This is
    /// the one piece sshfs itself can honour, via `-o uid=`.
    pub fn default_uid_override(&self) -> Option<u32> {
        self.uid_map.get(&self.default_uid).copied()
    }

    pub fn default_gid_override(&self) -> Option<u32> {
        self.gid_map.get(&self.default_gid).copied()
    }
}
