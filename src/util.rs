// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use tracing::{error, info};

fn nobody_ids() -> Option<(libc::uid_t, libc::gid_t)> {
    // getpwnam hands back a static buffer; we only copy two ints out of it.
    let pw = unsafe { libc::getpwnam(c"nobody".as_ptr()) };
    if pw.is_null() {
        return None;
    }
    unsafe { Some(((*pw).pw_uid, (*pw).pw_gid)) }
}

/// Drops effective privileges to `nobody`, keeping the real uid so they can
/// be re-acquired around interface and route changes.
pub fn dropprivs(reason: &str) {
    let Some((uid, gid)) = nobody_ids() else {
        return;
    };
    unsafe {
        libc::setregid(gid_keep(), gid);
        libc::setreuid(uid_keep(), uid);
    }
    if !reason.is_empty() {
        info!("dropped privs to 'nobody' ({reason})");
    }
}

/// Re-acquires superuser privileges for a privileged operation.
pub fn getprivs(reason: &str) {
    let rc = unsafe { libc::setreuid(0, 0) | libc::setregid(0, 0) };
    if rc == -1 {
        error!(
            "unable to gain superuser privileges: {}",
            std::io::Error::last_os_error()
        );
    } else if !reason.is_empty() {
        info!("got superuser privileges ({reason})");
    }
}

const fn uid_keep() -> libc::uid_t {
    // -1 leaves the real id untouched.
    libc::uid_t::MAX
}

const fn gid_keep() -> libc::gid_t {
    libc::gid_t::MAX
}

/// SIGTSTP handling: park the whole process the way a tty would.
pub fn self_stop() {
    unsafe {
        libc::kill(libc::getpid(), libc::SIGSTOP);
    }
}
