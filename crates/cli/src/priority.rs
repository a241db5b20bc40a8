//! Process scheduling priority.
//!
//! The daemon runs at the lowest CPU and I/O priority so cache warming
//! never competes with foreground work. Both adjustments are best-effort.

use tracing::{info, warn};

const IOPRIO_WHO_PROCESS: i32 = 1;
const IOPRIO_CLASS_IDLE: i32 = 3;
const IOPRIO_CLASS_SHIFT: i32 = 13;

/// Drop to nice 19 and the IDLE I/O scheduling class.
pub fn lower_process_priority() {
    renice(19);
    ioprio_idle();
}

/// Raise the nice value. `nice()` legitimately returns -1 as a new nice
/// value, so failure is detected through errno per POSIX convention.
fn renice(inc: i32) {
    #[allow(unsafe_code)]
    let (ret, errno) = unsafe {
        *libc::__errno_location() = 0;
        let ret = libc::nice(inc);
        (ret, *libc::__errno_location())
    };

    if errno != 0 {
        let err = std::io::Error::from_raw_os_error(errno);
        warn!(%err, inc, "failed to lower CPU priority");
    } else {
        info!(nice = ret, "CPU priority lowered");
    }
}

/// Move the process into the IDLE I/O class: readahead only runs when no
/// other process wants the disk.
fn ioprio_idle() {
    let ioprio = IOPRIO_CLASS_IDLE << IOPRIO_CLASS_SHIFT;

    #[allow(unsafe_code)]
    let ret = unsafe { libc::syscall(libc::SYS_ioprio_set, IOPRIO_WHO_PROCESS, 0, ioprio) };

    if ret < 0 {
        let err = std::io::Error::last_os_error();
        warn!(%err, "failed to enter IDLE I/O class");
    } else {
        info!("I/O scheduling class set to IDLE");
    }
}
