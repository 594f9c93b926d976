pub struct PasswdEntry {
    pub name: String,
    pub uid: nix::unistd::Uid,
    pub gid: nix::unistd::Gid,
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
fn make_passwd_from_libc(username: &str, pw: &libc::passwd) -> Result<PasswdEntry, String> {
    Ok(PasswdEntry {
        name: username.to_string(),
        uid: nix::unistd::Uid::from_raw(pw.pw_uid),
        gid: nix::unistd::Gid::from_raw(pw.pw_gid),
    })
}

#[cfg(any(target_os = "linux", target_os = "freebsd"))]
pub fn getpwnam_r(username: &str) -> Result<PasswdEntry, String> {
    let cname = std::ffi::CString::new(username).map_err(|e| e.to_string())?;
    let pointer: *const i8 = cname.as_ptr();
    let mut buf_size = 32;
    let mut passwd: libc::passwd = libc::passwd {
        pw_name: std::ptr::null_mut(),
        pw_passwd: std::ptr::null_mut(),
        pw_uid: 0,
        pw_gid: 0,
        pw_gecos: std::ptr::null_mut(),
        pw_dir: std::ptr::null_mut(),
        pw_shell: std::ptr::null_mut(),
    };

    let passwd_ptr = &mut passwd;
    let passwd_ptr_ptr = &mut std::ptr::from_mut::<libc::passwd>(passwd_ptr);
    loop {
        let mut buf = vec![0; buf_size];

        let errno = unsafe {
            libc::getpwnam_r(
                pointer,
                passwd_ptr,
                buf.as_mut_ptr(),
                buf_size,
                passwd_ptr_ptr,
            )
        };

        if passwd_ptr_ptr.is_null() {
            if errno == libc::ERANGE {
                buf_size *= 2;
            } else {
                return Err(format!("No entry found for username: {username}"));
            }
        } else {
            if std::ptr::from_mut::<libc::passwd>(passwd_ptr).eq(&*passwd_ptr_ptr) {
                return make_passwd_from_libc(username, &*passwd_ptr);
            }
            return Err(format!("The **passwd ({passwd_ptr_ptr:?}) should have pointed to the same location as the *passwd ({passwd_ptr:?})"));
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "freebsd")))]
pub fn getpwnam_r(_username: &str) -> Result<PasswdEntry, String> {
    compile_error!("getpwnam_r is not yet implemented for this platform");
}
