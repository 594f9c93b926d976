//! Privilege drop: resolve `user`/`group` from `[brim]`, then drop group
//! before user (dropping user first would forfeit the permission needed
//! to still change group), then apply `umask` (§4.1 step 4).

use crate::error::PrivilegeError;
use crate::platform::{grnam, pwnam};

pub fn apply(user: Option<&str>, group: Option<&str>, umask: Option<u32>) -> Result<(), PrivilegeError> {
    let resolved_group = match group {
        Some(name) => Some(
            grnam::getgrnam_r(name).map_err(|_| PrivilegeError::UnknownGroup(name.to_string()))?,
        ),
        None => None,
    };
    let resolved_user = match user {
        Some(name) => Some(
            pwnam::getpwnam_r(name).map_err(|_| PrivilegeError::UnknownUser(name.to_string()))?,
        ),
        None => None,
    };

    if let Some(group) = &resolved_group {
        nix::unistd::setgid(group.gid).map_err(|e| PrivilegeError::SetGid(e.to_string()))?;
    }
    if let Some(user) = &resolved_user {
        if resolved_group.is_none() {
            nix::unistd::setgid(user.gid).map_err(|e| PrivilegeError::SetGid(e.to_string()))?;
        }
        nix::unistd::setuid(user.uid).map_err(|e| PrivilegeError::SetUid(e.to_string()))?;
    }

    if let Some(mask) = umask {
        nix::sys::stat::umask(nix::sys::stat::Mode::from_bits_truncate(mask));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_op_when_nothing_configured() {
        assert!(apply(None, None, None).is_ok());
    }

    #[test]
    fn unknown_user_is_reported() {
        let err = apply(Some("brimd-no-such-user-xyz"), None, None).unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownUser(_)));
    }

    #[test]
    fn unknown_group_is_reported() {
        let err = apply(None, Some("brimd-no-such-group-xyz"), None).unwrap_err();
        assert!(matches!(err, PrivilegeError::UnknownGroup(_)));
    }
}
