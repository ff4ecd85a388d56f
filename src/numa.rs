//! NUMA socket discovery and the lcore/port placement check.
//!
//! Sockets are read from sysfs. A device or cpu that does not report a node
//! maps to [`SocketId::Any`], which never triggers a placement warning.

use {
    crate::{ethdev::PortId, lcore::LcoreId},
    std::{fmt, fs, path::Path},
};

/// A NUMA node, or `Any` when unknown (`SOCKET_ID_ANY`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SocketId {
    #[default]
    Any,
    Node(u32),
}

impl SocketId {
    /// Map a raw node number as reported by the kernel, where negative
    /// values mean "no affinity".
    pub fn from_raw(raw: i64) -> Self {
        u32::try_from(raw).map_or(SocketId::Any, SocketId::Node)
    }

    pub fn is_known(self) -> bool {
        matches!(self, SocketId::Node(_))
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketId::Any => f.write_str("any"),
            SocketId::Node(n) => write!(f, "{n}"),
        }
    }
}

/// Parse the content of a sysfs `numa_node` file.
pub fn parse_numa_node(s: &str) -> SocketId {
    s.trim()
        .parse::<i64>()
        .map_or(SocketId::Any, SocketId::from_raw)
}

/// Node of a cpu, from the `nodeN` link under its sysfs directory.
pub fn cpu_socket(cpu: usize) -> SocketId {
    cpu_socket_in(Path::new("/sys/devices/system/cpu"), cpu)
}

fn cpu_socket_in(root: &Path, cpu: usize) -> SocketId {
    let Ok(entries) = fs::read_dir(root.join(format!("cpu{cpu}"))) else {
        return SocketId::Any;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("node"))
                .and_then(|n| n.parse::<u32>().ok())
        })
        .min()
        .map_or(SocketId::Any, SocketId::Node)
}

/// Node of the PCI device behind a kernel network interface.
pub fn netdev_socket(if_name: &str) -> SocketId {
    fs::read_to_string(format!("/sys/class/net/{if_name}/device/numa_node"))
        .map_or(SocketId::Any, |s| parse_numa_node(&s))
}

/// Node of the cpu the calling thread currently runs on.
pub fn current_socket() -> SocketId {
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).map_or(SocketId::Any, cpu_socket)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Local,
    Remote {
        port_socket: SocketId,
        lcore_socket: SocketId,
    },
    Unknown,
}

pub fn placement(port_socket: SocketId, lcore_socket: SocketId) -> Placement {
    match (port_socket, lcore_socket) {
        (SocketId::Node(p), SocketId::Node(l)) if p == l => Placement::Local,
        (SocketId::Node(_), SocketId::Node(_)) => Placement::Remote {
            port_socket,
            lcore_socket,
        },
        _ => Placement::Unknown,
    }
}

/// Warn when `lcore` polls `port` across NUMA nodes. Advisory only.
pub fn check_port_affinity(
    port: PortId,
    port_socket: SocketId,
    lcore: LcoreId,
    lcore_socket: SocketId,
) -> Placement {
    let placement = placement(port_socket, lcore_socket);
    if let Placement::Remote { .. } = placement {
        log::warn!(
            "port {port} is on remote numa node {port_socket} to lcore {lcore} on node \
             {lcore_socket}, performance will not be optimal"
        );
    }
    placement
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numa_node() {
        assert_eq!(parse_numa_node("1\n"), SocketId::Node(1));
        assert_eq!(parse_numa_node("0"), SocketId::Node(0));
        assert_eq!(parse_numa_node("-1\n"), SocketId::Any);
        assert_eq!(parse_numa_node("garbage"), SocketId::Any);
    }

    #[test]
    fn test_placement() {
        assert_eq!(
            placement(SocketId::Node(0), SocketId::Node(0)),
            Placement::Local
        );
        assert_eq!(
            placement(SocketId::Node(1), SocketId::Node(0)),
            Placement::Remote {
                port_socket: SocketId::Node(1),
                lcore_socket: SocketId::Node(0),
            }
        );
        // an unknown device socket is never flagged
        assert_eq!(
            placement(SocketId::Any, SocketId::Node(0)),
            Placement::Unknown
        );
        assert_eq!(
            check_port_affinity(PortId(0), SocketId::Any, LcoreId(3), SocketId::Node(1)),
            Placement::Unknown
        );
    }

    #[test]
    fn test_cpu_socket_from_sysfs_layout() {
        let root = std::env::temp_dir().join(format!("basicfwd-numa-{}", std::process::id()));
        fs::create_dir_all(root.join("cpu2/node1")).unwrap();
        fs::create_dir_all(root.join("cpu3")).unwrap();

        assert_eq!(cpu_socket_in(&root, 2), SocketId::Node(1));
        assert_eq!(cpu_socket_in(&root, 3), SocketId::Any);
        assert_eq!(cpu_socket_in(&root, 9), SocketId::Any);

        fs::remove_dir_all(&root).unwrap();
    }
}
