//! Process hardening applied before any secret is loaded.

/// Keep client secrets and passphrases out of core dumps and away from
/// `/proc/<pid>/mem` readers.  Best effort: failures are logged and ignored.
#[cfg(target_os = "linux")]
pub fn secure_bootstrap() {
    // SAFETY: PR_SET_DUMPABLE takes plain integer arguments.
    let zero: libc::c_ulong = 0;
    let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, zero, zero, zero, zero) };
    if ret == 0 {
        tracing::debug!("PR_SET_DUMPABLE=0: core dumps and /proc/pid/mem access disabled");
    } else {
        let err = std::io::Error::last_os_error();
        tracing::warn!("PR_SET_DUMPABLE=0 failed (non-fatal): {err}");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn secure_bootstrap() {}
