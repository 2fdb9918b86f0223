//! Per-run CPU pinning and real-time scheduling (Linux).

use std::io;
use std::mem;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Pins the calling thread to one CPU and optionally moves it to
/// `SCHED_FIFO` at maximum priority. Both are restored on drop.
///
/// Keeps the measurement on a single core's counter and keeps ordinary
/// tasks from preempting it between samples.
pub struct RealtimeScope {
    saved_affinity: Option<libc::cpu_set_t>,
    saved_policy: Option<(libc::c_int, libc::sched_param)>,
}

impl RealtimeScope {
    /// Enter the scope. `cpu = None` keeps the current affinity.
    pub fn enter(cpu: Option<usize>, fifo: bool) -> Result<Self> {
        let mut scope = RealtimeScope {
            saved_affinity: None,
            saved_policy: None,
        };

        if let Some(cpu) = cpu {
            scope.saved_affinity = Some(pin_to_cpu(cpu)?);
            debug!(cpu, "pinned measurement thread");
        }

        if fifo {
            // On error the scope drops here and restores the affinity.
            scope.saved_policy = Some(raise_to_fifo()?);
            debug!("switched measurement thread to SCHED_FIFO");
        }

        Ok(scope)
    }
}

impl Drop for RealtimeScope {
    fn drop(&mut self) {
        if let Some((policy, param)) = self.saved_policy.take() {
            if unsafe { libc::sched_setscheduler(0, policy, &param) } != 0 {
                warn!(error = %io::Error::last_os_error(), "failed to restore scheduling policy");
            }
        }
        if let Some(set) = self.saved_affinity.take() {
            if unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) } != 0 {
                warn!(error = %io::Error::last_os_error(), "failed to restore CPU affinity");
            }
        }
    }
}

fn pin_to_cpu(cpu: usize) -> Result<libc::cpu_set_t> {
    let size = mem::size_of::<libc::cpu_set_t>();
    if cpu >= size * 8 {
        return Err(Error::InvalidConfiguration {
            field: "cpu",
            value: cpu.to_string(),
        });
    }

    unsafe {
        let mut previous: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, size, &mut previous) != 0 {
            return Err(Error::io("sched_getaffinity", io::Error::last_os_error()));
        }

        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, size, &set) != 0 {
            return Err(Error::io(
                format!("sched_setaffinity(cpu {})", cpu),
                io::Error::last_os_error(),
            ));
        }
        Ok(previous)
    }
}

fn raise_to_fifo() -> Result<(libc::c_int, libc::sched_param)> {
    unsafe {
        let policy = libc::sched_getscheduler(0);
        if policy < 0 {
            return Err(Error::io("sched_getscheduler", io::Error::last_os_error()));
        }
        let mut previous: libc::sched_param = mem::zeroed();
        if libc::sched_getparam(0, &mut previous) != 0 {
            return Err(Error::io("sched_getparam", io::Error::last_os_error()));
        }

        let mut param: libc::sched_param = mem::zeroed();
        param.sched_priority = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(Error::io("sched_setscheduler(SCHED_FIFO)", io::Error::last_os_error()));
        }
        Ok((policy, previous))
    }
}
