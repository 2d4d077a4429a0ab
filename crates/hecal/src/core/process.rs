// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Local process identity helpers (hostname, pid).

use std::sync::OnceLock;

/// Cached hostname of this machine.
///
/// Shared memory segment names and registration samples embed this, so it is
/// resolved once and reused.
pub fn host_name() -> &'static str {
    static HOST: OnceLock<String> = OnceLock::new();
    HOST.get_or_init(|| {
        let mut buf = [0u8; 256];
        // SAFETY: buf is a valid writable buffer of 256 bytes; gethostname
        // null-terminates on success and never writes past the given length.
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast::<libc::c_char>(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return sanitize(name);
                }
            }
        }
        "localhost".to_string()
    })
}

/// This process's id.
#[must_use]
pub fn process_id() -> u32 {
    std::process::id()
}

/// Check whether a process with the given pid is still alive.
///
/// Used to detect abandoned named mutexes and stale shared memory segments.
#[must_use]
pub fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    // SAFETY: kill with signal 0 performs permission/existence checks only,
    // it never delivers a signal.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if rc == 0 {
        return true;
    }
    // EPERM means the process exists but belongs to someone else.
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Restrict a name to characters that are safe inside segment names.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_name_is_stable_and_nonempty() {
        let a = host_name();
        let b = host_name();
        assert!(!a.is_empty());
        assert_eq!(a, b);
    }

    #[test]
    fn host_name_has_no_path_separators() {
        assert!(!host_name().contains('/'));
        assert!(!host_name().contains(' '));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(process_id()));
    }

    #[test]
    fn pid_zero_is_not_alive() {
        assert!(!process_alive(0));
    }
}
