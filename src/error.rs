use {
    crate::ethdev::{DevError, PortId},
    std::{fmt, io},
    thiserror::Error,
};

/// Direction of a descriptor ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => f.write_str("rx"),
            Direction::Tx => f.write_str("tx"),
        }
    }
}

/// Startup errors. Steady-state forwarding never produces one.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to create buffer pool {name}: {source}")]
    Allocation {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("port {0} does not exist or is not usable")]
    InvalidPort(PortId),

    #[error("failed to configure port {port}: {source}")]
    DeviceConfig {
        port: PortId,
        #[source]
        source: DevError,
    },

    #[error("failed to set up {direction} queue {queue} on port {port}: {source}")]
    QueueSetup {
        port: PortId,
        queue: u16,
        direction: Direction,
        #[source]
        source: DevError,
    },

    #[error("failed to start port {port}: {source}")]
    PortStart {
        port: PortId,
        #[source]
        source: DevError,
    },

    #[error("need an even number of ports and at least two, found {0}")]
    PortCount(usize),

    #[error("rx queue count {rx} does not match tx queue count {tx}")]
    QueueCount { rx: u16, tx: u16 },

    #[error("no lcores to forward on")]
    NoLcores,

    #[error("lcore {lcore}: {source}")]
    Lcore {
        lcore: u32,
        #[source]
        source: io::Error,
    },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
