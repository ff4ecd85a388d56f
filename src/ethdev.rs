//! Poll-mode ethernet device interface.
//!
//! [`EthDev`] is the boundary between the forwarding core and a driver. All
//! burst calls are non-blocking and bounded. Queue setup happens once, before
//! `start`, and every queue is afterwards polled by a single lcore.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        mempool::{BufferPool, PacketBuffer},
        numa::SocketId,
    },
    std::{fmt, io, ops, str::FromStr, sync::Arc},
    thiserror::Error,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PortId(pub u16);

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueId(pub u16);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid MAC address format, use aa:bb:cc:dd:ee:ff")]
pub struct ParseMacError;

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut mac = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in mac.iter_mut() {
            let part = parts.next().ok_or(ParseMacError)?;
            if part.len() != 2 {
                return Err(ParseMacError);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| ParseMacError)?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError);
        }
        Ok(MacAddress(mac))
    }
}

/// Transmit offload flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct TxOffloads(u64);

impl TxOffloads {
    pub const NONE: Self = Self(0);
    /// Buffers sent on a queue all come from one pool and are not shared, so
    /// the driver may return them to the pool in bulk on completion.
    pub const MBUF_FAST_FREE: Self = Self(1 << 16);

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for TxOffloads {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl ops::BitOrAssign for TxOffloads {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Descriptor count limits of a ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescLimits {
    pub nb_max: u16,
    pub nb_min: u16,
    pub nb_align: u16,
}

impl Default for DescLimits {
    fn default() -> Self {
        Self {
            nb_max: u16::MAX,
            nb_min: 0,
            nb_align: 1,
        }
    }
}

impl DescLimits {
    /// Round up to the alignment, then clamp into `[nb_min, nb_max]`.
    pub fn adjust(&self, nb_desc: u16) -> u16 {
        let mut nb = nb_desc as u32;
        if self.nb_align > 1 {
            nb = nb.next_multiple_of(self.nb_align as u32);
        }
        if self.nb_max != 0 {
            nb = nb.min(self.nb_max as u32);
        }
        nb.max(self.nb_min as u32).min(u16::MAX as u32) as u16
    }

    pub fn contains(&self, nb_desc: u16) -> bool {
        nb_desc >= self.nb_min
            && (self.nb_max == 0 || nb_desc <= self.nb_max)
            && (self.nb_align <= 1 || nb_desc % self.nb_align == 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TxConf {
    pub offloads: TxOffloads,
}

/// Device capability descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevInfo {
    pub driver_name: &'static str,
    pub if_name: Option<String>,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub rx_desc_lim: DescLimits,
    pub tx_desc_lim: DescLimits,
    /// Smallest data room a bound pool must offer.
    pub min_rx_bufsize: u16,
    pub tx_offload_capa: TxOffloads,
    pub default_txconf: TxConf,
}

/// Port-wide configuration passed to [`EthDev::configure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EthConf {
    pub tx_offloads: TxOffloads,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStats {
    pub ipackets: u64,
    pub opackets: u64,
    pub ibytes: u64,
    pub obytes: u64,
    /// Frames dropped because the rx ring was full.
    pub imissed: u64,
    pub ierrors: u64,
    pub oerrors: u64,
    /// Frames dropped because the pool had no buffer.
    pub rx_nombuf: u64,
}

#[derive(Debug, Error)]
pub enum DevError {
    #[error("{direction} queue count {requested} exceeds device maximum {max}")]
    TooManyQueues {
        direction: &'static str,
        requested: u16,
        max: u16,
    },
    #[error("at least one queue is required")]
    NoQueues,
    #[error("offloads {requested:#x} not in capability {capa:#x}")]
    UnsupportedOffloads { requested: u64, capa: u64 },
    #[error("queue {0} was not configured")]
    QueueOutOfRange(u16),
    #[error("queue {0} is already set up")]
    QueueExists(u16),
    #[error("descriptor count {nb_desc} violates limits {lim:?}")]
    InvalidDescCount { nb_desc: u16, lim: DescLimits },
    #[error("pool data room {data_room} is below the device minimum {min}")]
    BufferTooSmall { data_room: u16, min: u16 },
    #[error("device is not configured")]
    NotConfigured,
    #[error("device is already started")]
    AlreadyStarted,
    #[error("queue {0} was never set up")]
    QueueNotSetUp(u16),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A poll-mode driver instance.
pub trait EthDev: Send + Sync {
    fn info(&self) -> DevInfo;

    /// NUMA node of the underlying hardware.
    fn socket_id(&self) -> SocketId;

    fn mac_addr(&self) -> MacAddress;

    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16, conf: &EthConf)
        -> Result<(), DevError>;

    /// Rewrite the requested ring sizes to values the hardware supports.
    fn adjust_nb_rx_tx_desc(&self, nb_rx_desc: &mut u16, nb_tx_desc: &mut u16) -> Result<(), DevError> {
        let info = self.info();
        *nb_rx_desc = info.rx_desc_lim.adjust(*nb_rx_desc);
        *nb_tx_desc = info.tx_desc_lim.adjust(*nb_tx_desc);
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        pool: &Arc<BufferPool>,
    ) -> Result<(), DevError>;

    fn tx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        conf: &TxConf,
    ) -> Result<(), DevError>;

    fn start(&self) -> Result<(), DevError>;

    fn promiscuous_enable(&self) -> Result<(), DevError>;

    fn promiscuous(&self) -> bool;

    /// Append up to `max` received buffers to `pkts`. Returns how many were
    /// appended; zero when nothing arrived. Never blocks.
    fn rx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>, max: usize) -> usize;

    /// Queue buffers for transmission in order. The device takes ownership
    /// of the accepted prefix, removing it from `pkts`, and returns its
    /// length. Rejected buffers stay in `pkts` for the caller. Never blocks.
    fn tx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>) -> usize;

    fn stats(&self) -> PortStats;
}

/// Registry of attached ports, indexed by [`PortId`].
#[derive(Default, Clone)]
pub struct EthDevices {
    devs: Vec<Arc<dyn EthDev>>,
}

impl EthDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&mut self, dev: Arc<dyn EthDev>) -> PortId {
        let id = PortId(self.devs.len() as u16);
        let info = dev.info();
        log::debug!(
            "attached port {id}: driver {} {}",
            info.driver_name,
            info.if_name.as_deref().unwrap_or("")
        );
        self.devs.push(dev);
        id
    }

    pub fn get(&self, port: PortId) -> Option<&Arc<dyn EthDev>> {
        self.devs.get(port.0 as usize)
    }

    pub fn is_valid_port(&self, port: PortId) -> bool {
        self.get(port).is_some()
    }

    pub fn count_avail(&self) -> usize {
        self.devs.len()
    }

    pub fn port_ids(&self) -> impl Iterator<Item = PortId> + '_ {
        (0..self.devs.len()).map(|i| PortId(i as u16))
    }
}
