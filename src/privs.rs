//! Dropping root privileges after the raw socket and tun device are open.
//!
//! Order matters: the group id and supplementary groups must be set while
//! still root, before the final `setuid` gives up the ability to change
//! them at all.

use std::ffi::CString;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivError {
    #[error("no such user: {0}")]
    UnknownUser(String),
    #[error("setgid failed: {0}")]
    SetGid(#[source] io::Error),
    #[error("setgroups failed: {0}")]
    SetGroups(#[source] io::Error),
    #[error("setuid failed: {0}")]
    SetUid(#[source] io::Error),
}

trait PrivBackend {
    fn lookup_user(&self, name: &str) -> Option<(libc::uid_t, libc::gid_t)>;
    fn setgid(&self, gid: libc::gid_t) -> io::Result<()>;
    fn setgroups(&self, gid: libc::gid_t) -> io::Result<()>;
    fn setuid(&self, uid: libc::uid_t) -> io::Result<()>;
}

struct SystemBackend;

impl PrivBackend for SystemBackend {
    fn lookup_user(&self, name: &str) -> Option<(libc::uid_t, libc::gid_t)> {
        let cname = CString::new(name).ok()?;
        let passwd = unsafe { libc::getpwnam(cname.as_ptr()) };
        if passwd.is_null() {
            return None;
        }
        let passwd = unsafe { &*passwd };
        Some((passwd.pw_uid, passwd.pw_gid))
    }

    fn setgid(&self, gid: libc::gid_t) -> io::Result<()> {
        let ret = unsafe { libc::setgid(gid) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn setgroups(&self, gid: libc::gid_t) -> io::Result<()> {
        let groups = [gid];
        let ret = unsafe { libc::setgroups(groups.len(), groups.as_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn setuid(&self, uid: libc::uid_t) -> io::Result<()> {
        let ret = unsafe { libc::setuid(uid) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Looks up `username` and permanently drops to its uid/gid, in the order
/// supplementary groups, gid, then uid.
pub fn drop_privs(username: &str) -> Result<(), PrivError> {
    drop_privs_with(&SystemBackend, username)
}

fn drop_privs_with(backend: &dyn PrivBackend, username: &str) -> Result<(), PrivError> {
    let (uid, gid) = backend
        .lookup_user(username)
        .ok_or_else(|| PrivError::UnknownUser(username.to_string()))?;

    backend.setgroups(gid).map_err(PrivError::SetGroups)?;
    backend.setgid(gid).map_err(PrivError::SetGid)?;
    backend.setuid(uid).map_err(PrivError::SetUid)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MockBackend {
        calls: RefCell<Vec<&'static str>>,
        fail_at: Option<&'static str>,
    }

    impl MockBackend {
        fn new() -> MockBackend {
            MockBackend {
                calls: RefCell::new(Vec::new()),
                fail_at: None,
            }
        }
    }

    impl PrivBackend for MockBackend {
        fn lookup_user(&self, name: &str) -> Option<(libc::uid_t, libc::gid_t)> {
            self.calls.borrow_mut().push("lookup");
            if name == "nobody" {
                Some((65534, 65534))
            } else {
                None
            }
        }

        fn setgid(&self, _gid: libc::gid_t) -> io::Result<()> {
            self.calls.borrow_mut().push("setgid");
            if self.fail_at == Some("setgid") {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "denied"));
            }
            Ok(())
        }

        fn setgroups(&self, _gid: libc::gid_t) -> io::Result<()> {
            self.calls.borrow_mut().push("setgroups");
            Ok(())
        }

        fn setuid(&self, _uid: libc::uid_t) -> io::Result<()> {
            self.calls.borrow_mut().push("setuid");
            Ok(())
        }
    }

    #[test]
    fn drops_privileges_in_groups_gid_uid_order() {
        let backend = MockBackend::new();
        drop_privs_with(&backend, "nobody").unwrap();
        assert_eq!(
            backend.calls.into_inner(),
            vec!["lookup", "setgroups", "setgid", "setuid"]
        );
    }

    #[test]
    fn unknown_user_is_rejected_before_any_privilege_call() {
        let backend = MockBackend::new();
        let err = drop_privs_with(&backend, "ghost").unwrap_err();
        assert!(matches!(err, PrivError::UnknownUser(name) if name == "ghost"));
        assert_eq!(backend.calls.into_inner(), vec!["lookup"]);
    }
}
