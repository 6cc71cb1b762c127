//! Deterministic socket addressing.
//!
//! Local connections are named `ipc-<owner-pid>-<stream>.sock` under a
//! runtime directory. The owner is the process that binds (the main
//! process); subprocesses find it through [`PARENT_PID_ENV`] or, failing
//! that, their OS parent.

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

use crate::constants::{PARENT_PID_ENV, SOCKET_DIR_NAME};

/// Default runtime directory: `$TMPDIR/stationlink-sockets`.
pub fn default_socket_dir() -> PathBuf {
    std::env::temp_dir().join(SOCKET_DIR_NAME)
}

/// Address of one stream owned by one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketAddress {
    owner_pid: u32,
    stream: String,
}

impl SocketAddress {
    /// Build an address, rejecting stream names that would escape the
    /// runtime directory or collide with the naming scheme.
    pub fn new(owner_pid: u32, stream: &str) -> Result<Self> {
        if stream.is_empty() {
            bail!("Stream name must not be empty");
        }
        if !stream
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("Invalid stream name {stream:?}: use [A-Za-z0-9_-]");
        }
        Ok(Self {
            owner_pid,
            stream: stream.to_string(),
        })
    }

    /// Address of a stream owned by this process.
    pub fn own(stream: &str) -> Result<Self> {
        Self::new(std::process::id(), stream)
    }

    /// Address of a stream owned by the parent process.
    pub fn parent(stream: &str) -> Result<Self> {
        let env_value = std::env::var(PARENT_PID_ENV).ok();
        Self::new(resolve_owner_pid(env_value.as_deref()), stream)
    }

    /// Owning process id.
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    /// Stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Socket file name, without directory.
    pub fn file_name(&self) -> String {
        format!("ipc-{}-{}.sock", self.owner_pid, self.stream)
    }

    /// Full socket path under `dir`.
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// Owner pid from an environment value, falling back to the OS parent.
pub fn resolve_owner_pid(env_value: Option<&str>) -> u32 {
    if let Some(raw) = env_value {
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => return pid,
            _ => log::warn!("[Socket] Ignoring invalid {PARENT_PID_ENV}={raw:?}"),
        }
    }
    std::os::unix::process::parent_id()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_format() {
        let addr = SocketAddress::new(4242, "heat").unwrap();
        assert_eq!(addr.file_name(), "ipc-4242-heat.sock");
        assert_eq!(
            addr.path_in(Path::new("/tmp/x")),
            PathBuf::from("/tmp/x/ipc-4242-heat.sock")
        );
    }

    #[test]
    fn test_rejects_bad_stream_names() {
        assert!(SocketAddress::new(1, "").is_err());
        assert!(SocketAddress::new(1, "../etc").is_err());
        assert!(SocketAddress::new(1, "a b").is_err());
        assert!(SocketAddress::new(1, "day_cam-2").is_ok());
    }

    #[test]
    fn test_resolve_owner_pid() {
        assert_eq!(resolve_owner_pid(Some("1234")), 1234);
        assert_eq!(resolve_owner_pid(Some(" 77 ")), 77);
        let parent = std::os::unix::process::parent_id();
        assert_eq!(resolve_owner_pid(Some("nope")), parent);
        assert_eq!(resolve_owner_pid(Some("0")), parent);
        assert_eq!(resolve_owner_pid(None), parent);
    }

    #[test]
    fn test_own_uses_current_pid() {
        let addr = SocketAddress::own("state").unwrap();
        assert_eq!(addr.owner_pid(), std::process::id());
        assert_eq!(addr.stream(), "state");
    }
}
