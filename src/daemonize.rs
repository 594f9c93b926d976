//! Double-fork daemonization for the `start` CLI verb (§4.1 step 1,
//! before the pidfile/config/listener/fork sequence in
//! `supervisor::parent::run` even begins).

use nix::unistd::{fork, setsid, ForkResult};
use std::os::unix::io::AsRawFd;

/// Forks twice and detaches from the controlling terminal. Returns once
/// in the final grandchild; the original process and the intermediate
/// child both call `std::process::exit(0)` and never return.
pub fn daemonize() -> std::io::Result<()> {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
    }

    setsid().map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
        Err(e) => return Err(std::io::Error::from_raw_os_error(e as i32)),
    }

    std::env::set_current_dir("/")?;
    redirect_stdio_to_devnull()
}

fn redirect_stdio_to_devnull() -> std::io::Result<()> {
    let devnull = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        unsafe {
            libc::dup2(fd, target);
        }
    }
    Ok(())
}
