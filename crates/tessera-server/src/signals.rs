//! Signal latching.
//!
//! Handlers only set atomic flags; the supervisor loop polls and acts.
//!
//! | Signal    | Action                                    |
//! |-----------|-------------------------------------------|
//! | TERM, INT | graceful shutdown                         |
//! | HUP       | reload config, request topology change    |
//! | QUIT      | dump thread report to stderr              |
//! | USR1      | emit system status to stderr              |
//! | USR2      | toggle CPU/memory profiling               |
//! | PIPE      | stdout/stderr died: shutdown              |

use std::sync::atomic::{AtomicBool, Ordering};

static SHUTDOWN: AtomicBool = AtomicBool::new(false);
static RELOAD: AtomicBool = AtomicBool::new(false);
static DUMP_STACKS: AtomicBool = AtomicBool::new(false);
static STATUS: AtomicBool = AtomicBool::new(false);
static PROFILE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(signal: libc::c_int) {
    match signal {
        libc::SIGTERM | libc::SIGINT | libc::SIGPIPE => SHUTDOWN.store(true, Ordering::SeqCst),
        libc::SIGHUP => RELOAD.store(true, Ordering::SeqCst),
        libc::SIGQUIT => DUMP_STACKS.store(true, Ordering::SeqCst),
        libc::SIGUSR1 => STATUS.store(true, Ordering::SeqCst),
        libc::SIGUSR2 => PROFILE.store(true, Ordering::SeqCst),
        _ => {}
    }
}

/// Installs the handlers. Call once, early.
pub fn install() {
    unsafe {
        for signal in [
            libc::SIGTERM,
            libc::SIGINT,
            libc::SIGHUP,
            libc::SIGQUIT,
            libc::SIGUSR1,
            libc::SIGUSR2,
            libc::SIGPIPE,
        ] {
            libc::signal(signal, on_signal as libc::sighandler_t);
        }
    }
}

/// Requests shutdown from inside the process (fatal errors, removal
/// from the cluster).
pub fn request_shutdown() {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn take(flag: &AtomicBool) -> bool {
    flag.swap(false, Ordering::SeqCst)
}

pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

pub fn take_reload() -> bool {
    take(&RELOAD)
}

pub fn take_dump_stacks() -> bool {
    take(&DUMP_STACKS)
}

pub fn take_status() -> bool {
    take(&STATUS)
}

pub fn take_profile_toggle() -> bool {
    take(&PROFILE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_latch_and_clear() {
        assert!(!take_reload());
        RELOAD.store(true, Ordering::SeqCst);
        assert!(take_reload());
        assert!(!take_reload());
    }

    #[test]
    fn shutdown_is_sticky() {
        assert!(!shutdown_requested());
        request_shutdown();
        assert!(shutdown_requested());
        // Deliberately not cleared: shutdown is one-way.
        assert!(shutdown_requested());
        SHUTDOWN.store(false, Ordering::SeqCst); // reset for other tests
    }
}
