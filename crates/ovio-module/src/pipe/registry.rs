//! Process-local table of listening sockets.
//!
//! Every server instance created under one name shares a single listening
//! socket. The first instance fixes the instance limit; the last one to
//! close removes the socket file.

use super::name::{AccessDescriptor, Instances, PipeName};
use super::sys;

use ovio_core::error::{OvioError, Result};

use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// One named listening socket.
#[derive(Debug)]
pub(crate) struct Endpoint {
    pub(crate) name: PipeName,
    pub(crate) path: PathBuf,
    pub(crate) listener: OwnedFd,
    pub(crate) limit: Instances,
}

struct Entry {
    endpoint: Arc<Endpoint>,
    instances: usize,
}

fn table() -> &'static Mutex<HashMap<PathBuf, Entry>> {
    static TABLE: OnceLock<Mutex<HashMap<PathBuf, Entry>>> = OnceLock::new();
    TABLE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Claim one instance slot under `name`, creating the socket if needed.
pub(crate) fn acquire(
    name: &PipeName,
    dir: &Path,
    limit: Instances,
    access: AccessDescriptor,
) -> Result<Arc<Endpoint>> {
    let limit = limit.validate()?;
    let path = name.socket_path(dir)?;
    let mut table = table().lock();

    if let Some(entry) = table.get_mut(&path) {
        if !entry.endpoint.limit.admits(entry.instances) {
            return Err(OvioError::ChannelBusy(format!(
                "{}: all {} instances in use",
                name, entry.endpoint.limit
            )));
        }
        entry.instances += 1;
        return Ok(Arc::clone(&entry.endpoint));
    }

    let listener = open_listener(name, &path, limit, access)?;
    let endpoint = Arc::new(Endpoint { name: name.clone(), path: path.clone(), listener, limit });
    table.insert(path, Entry { endpoint: Arc::clone(&endpoint), instances: 1 });
    log::debug!("pipe {}: listening (instances: {})", name, limit);
    Ok(endpoint)
}

/// Give back a slot taken by [`acquire`].
pub(crate) fn release(endpoint: &Endpoint) {
    let mut table = table().lock();
    let Some(entry) = table.get_mut(&endpoint.path) else {
        return;
    };
    entry.instances = entry.instances.saturating_sub(1);
    if entry.instances == 0 {
        table.remove(&endpoint.path);
        if let Err(err) = fs::remove_file(&endpoint.path) {
            log::warn!("pipe {}: removing {}: {}", endpoint.name, endpoint.path.display(), err);
        }
        log::debug!("pipe {}: last instance closed", endpoint.name);
    }
}

/// Instances currently open under `name` in `dir`.
#[cfg(test)]
pub(crate) fn instances(name: &PipeName, dir: &Path) -> usize {
    let Ok(path) = name.socket_path(dir) else {
        return 0;
    };
    table().lock().get(&path).map_or(0, |e| e.instances)
}

fn open_listener(
    name: &PipeName,
    path: &Path,
    limit: Instances,
    access: AccessDescriptor,
) -> Result<OwnedFd> {
    let listener = sys::socket(true).map_err(|e| OvioError::from_errno("socket", e as i32))?;

    match sys::bind(listener.as_fd(), path) {
        Ok(()) => {}
        Err(Errno::EADDRINUSE) if is_stale(path) => {
            log::debug!("pipe {}: replacing stale socket {}", name, path.display());
            fs::remove_file(path)?;
            sys::bind(listener.as_fd(), path).map_err(|e| OvioError::from_errno("bind", e as i32))?;
        }
        Err(Errno::EADDRINUSE) => {
            return Err(OvioError::ChannelBusy(format!("{} is owned by another process", name)));
        }
        Err(e) => return Err(OvioError::from_errno("bind", e as i32)),
    }

    let setup = fs::set_permissions(path, fs::Permissions::from_mode(access.mode()))
        .map_err(OvioError::from)
        .and_then(|()| {
            sys::listen(listener.as_fd(), limit.backlog())
                .map_err(|e| OvioError::from_errno("listen", e as i32))
        });
    if let Err(err) = setup {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(listener)
}

/// A socket file nobody is listening on.
fn is_stale(path: &Path) -> bool {
    let Ok(probe) = sys::socket(false) else {
        return false;
    };
    matches!(sys::connect(probe.as_fd(), path), Err(Errno::ECONNREFUSED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_enforced_and_file_removed() {
        let dir = tempfile::tempdir().unwrap();
        let name = PipeName::parse("reg-limit").unwrap();
        let access = AccessDescriptor::default();

        let a = acquire(&name, dir.path(), Instances::Limited(2), access).unwrap();
        let b = acquire(&name, dir.path(), Instances::Limited(2), access).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(matches!(
            acquire(&name, dir.path(), Instances::Limited(2), access),
            Err(OvioError::ChannelBusy(_))
        ));
        assert!(a.path.exists());

        release(&a);
        assert_eq!(instances(&name, dir.path()), 1);
        release(&b);
        assert_eq!(instances(&name, dir.path()), 0);
        assert!(!b.path.exists());
    }

    #[test]
    fn test_stale_socket_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let name = PipeName::parse("reg-stale").unwrap();
        let path = name.socket_path(dir.path()).unwrap();

        // Bound but never listening: connect is refused.
        let orphan = sys::socket(false).unwrap();
        sys::bind(orphan.as_fd(), &path).unwrap();
        drop(orphan);

        let endpoint = acquire(&name, dir.path(), Instances::Unlimited, AccessDescriptor::default()).unwrap();
        release(&endpoint);
    }

    #[test]
    fn test_zero_instances_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let name = PipeName::parse("reg-zero").unwrap();
        assert!(matches!(
            acquire(&name, dir.path(), Instances::Limited(0), AccessDescriptor::default()),
            Err(OvioError::Validation(_))
        ));
    }
}
