//! Remote identity and tooling probe run before a mount is established.
//!
//! The probe drives a fixed sequence of commands over the SSH session:
//! source the sshfs environment, prepare and chown the target directory,
//! resolve the remote identity, and validate the installed sshfs. Every
//! command after the first is prefixed with the collected environment.

use tracing::{debug, warn};

use crate::{
    errors::MountError,
    ssh::{run_cmd, SshSession},
};

use super::MountSpec;

/// FUSE library version reported by `sshfs -V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FuseVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: Option<u32>,
}

impl std::fmt::Display for FuseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.patch {
            Some(patch) => write!(f, "{}.{}.{}", self.major, self.minor, patch),
            None => write!(f, "{}.{}", self.major, self.minor),
        }
    }
}

/// What the probe established about the guest.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Environment collected from the helper command, as `KEY=VALUE` pairs.
    pub env: Vec<(String, String)>,
    pub login: String,
    pub group: String,
    pub uid: u32,
    pub gid: u32,
    pub fuse_version: FuseVersion,
}

impl Identity {
    /// `KEY=VALUE ` prefix applied to every remote command.
    pub fn env_prefix(&self) -> String {
        env_prefix(&self.env)
    }
}

/// Probe result plus the target path resolved to an absolute form.
pub(super) struct PreparedMount {
    pub identity: Identity,
    pub target: String,
}

/// Run the full probe sequence. See the module docs for the order.
pub fn establish_identity(
    session: &mut dyn SshSession,
    spec: &MountSpec,
) -> Result<Identity, MountError> {
    establish(session, spec).map(|prepared| prepared.identity)
}

pub(super) fn establish(
    session: &mut dyn SshSession,
    spec: &MountSpec,
) -> Result<PreparedMount, MountError> {
    let env = collect_environment(session, &spec.env_helper_command)?;
    let prefix = env_prefix(&env);

    let target = resolve_target(session, &prefix, &spec.target_path)?;

    run_cmd(session, &format!("{}mkdir -p \"{}\"", prefix, target))?;

    let login = run_cmd(session, &format!("{}id -nu", prefix))?
        .trim_end()
        .to_string();
    let group = run_cmd(session, &format!("{}id -ng", prefix))?
        .trim_end()
        .to_string();

    run_cmd(
        session,
        &format!("{}chown {}:{} \"{}\"", prefix, login, group, target),
    )?;

    let uid = parse_id(&run_cmd(session, &format!("{}id -u", prefix))?)?;
    let gid = parse_id(&run_cmd(session, &format!("{}id -g", prefix))?)?;

    let version_output = run_cmd(session, &format!("{}sshfs -V", prefix))?;
    let fuse_version = parse_fuse_version(&version_output)?;

    debug!(
        target: "qvmctl",
        "probe: {}({}):{}({}) fuse {} at {}",
        login, uid, group, gid, fuse_version, target
    );

    Ok(PreparedMount {
        identity: Identity {
            env,
            login,
            group,
            uid,
            gid,
            fuse_version,
        },
        target,
    })
}

/// Step 1: source the sshfs environment. A failing helper is tolerated as
/// long as a plain `which sshfs` still finds the binary; a guest with
/// neither has no sshfs to speak of.
fn collect_environment(
    session: &mut dyn SshSession,
    helper_command: &str,
) -> Result<Vec<(String, String)>, MountError> {
    let result = session.exec(helper_command)?;
    if result.success() {
        return Ok(parse_env_lines(&result.stdout));
    }

    warn!(
        target: "qvmctl",
        "unable to source the sshfs environment: {}",
        result.stderr.trim_end()
    );

    let which = session.exec("which sshfs")?;
    if !which.success() {
        return Err(MountError::SshfsMissing);
    }
    Ok(Vec::new())
}

/// Resolve a relative target against the remote home directory.
fn resolve_target(
    session: &mut dyn SshSession,
    prefix: &str,
    target: &str,
) -> Result<String, MountError> {
    if target.starts_with('/') {
        return Ok(target.to_string());
    }
    let home = run_cmd(session, &format!("{}pwd", prefix))?;
    Ok(format!("{}/{}", home.trim_end(), target))
}

fn parse_env_lines(stdout: &str) -> Vec<(String, String)> {
    stdout
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once('=')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn env_prefix(env: &[(String, String)]) -> String {
    env.iter()
        .map(|(key, value)| format!("{}={} ", key, value))
        .collect()
}

fn parse_id(stdout: &str) -> Result<u32, MountError> {
    let raw = stdout.trim();
    raw.parse()
        .map_err(|_| MountError::InvalidId(raw.to_string()))
}

fn parse_fuse_version(output: &str) -> Result<FuseVersion, MountError> {
    const MARKER: &str = "FUSE library version:";

    let line = output
        .lines()
        .find(|line| line.contains(MARKER))
        .ok_or_else(|| MountError::InvalidFuseVersion(output.trim().to_string()))?;
    let raw = line
        .split(MARKER)
        .nth(1)
        .unwrap_or_default()
        .trim()
        .to_string();

    let components: Vec<&str> = raw.split('.').collect();
    let invalid = || MountError::InvalidFuseVersion(raw.clone());

    match components.as_slice() {
        [major, minor] => Ok(FuseVersion {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            patch: None,
        }),
        [major, minor, patch] => Ok(FuseVersion {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
            patch: Some(patch.parse().map_err(|_| invalid())?),
        }),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_lines_parse_into_pairs() {
        let parsed = parse_env_lines("LD_LIBRARY_PATH=/snap/lib\nSNAP=/snap/sshfs\n\nnot a pair\n");
        assert_eq!(
            parsed,
            vec![
                ("LD_LIBRARY_PATH".to_string(), "/snap/lib".to_string()),
                ("SNAP".to_string(), "/snap/sshfs".to_string()),
            ]
        );
    }

    #[test]
    fn env_prefix_joins_pairs_with_trailing_space() {
        let env = vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())];
        assert_eq!(env_prefix(&env), "A=1 B=2 ");
        assert_eq!(env_prefix(&[]), "");
    }

    #[test]
    fn ids_must_be_numeric() {
        assert_eq!(parse_id("1000\n").unwrap(), 1000);
        match parse_id("ubuntu\n") {
            Err(MountError::InvalidId(raw)) => assert_eq!(raw, "ubuntu"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn fuse_versions_parse_with_and_without_patch() {
        let output = "SSHFS version 2.8\nFUSE library version: 2.9.7\n";
        assert_eq!(
            parse_fuse_version(output).unwrap(),
            FuseVersion {
                major: 2,
                minor: 9,
                patch: Some(7)
            }
        );

        let output = "FUSE library version: 3.10";
        assert_eq!(
            parse_fuse_version(output).unwrap(),
            FuseVersion {
                major: 3,
                minor: 10,
                patch: None
            }
        );
    }

    #[test]
    fn garbage_fuse_versions_are_rejected() {
        for output in [
            "FUSE library version: fu.man.chu",
            "FUSE library version: 2",
            "FUSE library version: 2.9.7.1",
            "sshfs printed nothing useful",
        ] {
            assert!(matches!(
                parse_fuse_version(output),
                Err(MountError::InvalidFuseVersion(_))
            ));
        }
    }
}
