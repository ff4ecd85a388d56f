#![allow(clippy::arithmetic_side_effects)]

use {
    crate::numa::{self, SocketId},
    std::{cell::Cell, fmt, io, mem, thread},
};

/// Upper bound on lcore ids, and the number of per-lcore cache slots in a
/// buffer pool.
pub const MAX_LCORE: usize = 128;

/// An execution unit: one thread pinned to the cpu with the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LcoreId(pub u32);

impl LcoreId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn socket_id(self) -> SocketId {
        numa::cpu_socket(self.index())
    }
}

impl fmt::Display for LcoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

thread_local! {
    static CURRENT: Cell<Option<LcoreId>> = const { Cell::new(None) };
}

/// Lcore identity of the calling thread, if it is an lcore.
#[inline]
pub fn current() -> Option<LcoreId> {
    CURRENT.with(Cell::get)
}

/// Mark the calling thread as `lcore`. Buffer pool caches are keyed by this
/// identity, so two live threads must never claim the same id.
pub fn set_current(lcore: Option<LcoreId>) {
    CURRENT.with(|c| c.set(lcore));
}

/// Cpus the process may run on.
pub fn available() -> io::Result<Vec<LcoreId>> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        if libc::sched_getaffinity(0, mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..MAX_LCORE)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .map(|cpu| LcoreId(cpu as u32))
            .collect())
    }
}

/// Pin the calling thread to `cpus`.
pub fn set_cpu_affinity(cpus: impl IntoIterator<Item = usize>) -> io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for cpu in cpus {
            libc::CPU_SET(cpu, &mut set);
        }
        if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// return min/max valid priorities for SCHED_FIFO on this system.
pub fn fifo_priority_bounds() -> io::Result<(i32, i32)> {
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if min == -1 || max == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok((min, max))
    }
}

/// set the calling thread to SCHED_FIFO with the given priority.
pub fn set_current_thread_sched_fifo(priority: i32) -> io::Result<()> {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let rc = libc::sched_setscheduler(0, libc::SCHED_FIFO, &param);
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Spawn `f` on a new thread that runs as `lcore`.
///
/// Pinning failures are logged and the thread still runs, unpinned. With
/// `sched_fifo` the thread asks for the highest real-time priority, which
/// also only warns when refused.
pub fn launch<F, T>(lcore: LcoreId, sched_fifo: bool, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    if lcore.index() >= MAX_LCORE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("lcore id {lcore} exceeds {MAX_LCORE}"),
        ));
    }

    thread::Builder::new()
        .name(format!("lcore-{lcore}"))
        .spawn(move || {
            if let Err(e) = set_cpu_affinity([lcore.index()]) {
                log::warn!("failed to pin lcore {lcore} to its cpu: {e}");
            }
            if sched_fifo {
                if let Err(e) =
                    fifo_priority_bounds().and_then(|(_, max)| set_current_thread_sched_fifo(max))
                {
                    log::warn!("failed to set SCHED_FIFO on lcore {lcore}: {e}");
                }
            }
            set_current(Some(lcore));
            let ret = f();
            set_current(None);
            ret
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_is_per_thread() {
        set_current(Some(LcoreId(5)));
        assert_eq!(current(), Some(LcoreId(5)));

        let other = thread::spawn(current).join().unwrap();
        assert_eq!(other, None);

        set_current(None);
        assert_eq!(current(), None);
    }

    #[test]
    fn test_launch_sets_identity() {
        let lcore = available().unwrap()[0];
        let seen = launch(lcore, false, current).unwrap().join().unwrap();
        assert_eq!(seen, Some(lcore));
    }

    #[test]
    fn test_launch_rejects_out_of_range_id() {
        assert!(launch(LcoreId(MAX_LCORE as u32), false, || ()).is_err());
    }
}
