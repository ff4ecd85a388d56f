//! Startup parameters and the bring-up sequence that consumes them.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        error::{Error, Result},
        ethdev::EthDevices,
        forward::{self, ForwardingEngine},
        lcore::LcoreId,
        mempool::{BufferPool, MBUF_DEFAULT_BUF_SIZE},
        numa::{self, SocketId},
        port::{self, Port, PortConfig},
        topology,
    },
    std::sync::{atomic::AtomicBool, Arc},
};

pub const RX_RING_SIZE: u16 = 1024;
pub const TX_RING_SIZE: u16 = 1024;
pub const NUM_MBUFS: usize = 8191;
pub const MBUF_CACHE_SIZE: usize = 250;

pub const POOL_NAME: &str = "MBUF_POOL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwarderConfig {
    pub port: PortConfig,
    /// Pool buffers per port.
    pub num_mbufs: usize,
    pub cache_size: usize,
    pub data_room: u16,
    /// Node the pool is allocated on; `None` picks the node of the calling
    /// thread.
    pub pool_socket: Option<SocketId>,
    pub bidirectional: bool,
    pub sched_fifo: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            port: PortConfig {
                rx_ring_size: RX_RING_SIZE,
                tx_ring_size: TX_RING_SIZE,
                ..PortConfig::default()
            },
            num_mbufs: NUM_MBUFS,
            cache_size: MBUF_CACHE_SIZE,
            data_room: MBUF_DEFAULT_BUF_SIZE,
            pool_socket: None,
            bidirectional: false,
            sched_fifo: false,
        }
    }
}

impl ForwarderConfig {
    pub fn pool_capacity(&self, nb_ports: usize) -> usize {
        self.num_mbufs * nb_ports
    }
}

/// Everything the forwarder owns while it runs.
pub struct Forwarding {
    pub pool: Arc<BufferPool>,
    pub ports: Vec<Port>,
    pub engine: ForwardingEngine,
}

/// Create the pool, bring up every port, and start forwarding on `lcores`
/// until `exit` is raised.
pub fn start(
    devices: &EthDevices,
    config: &ForwarderConfig,
    lcores: &[LcoreId],
    exit: Arc<AtomicBool>,
) -> Result<Forwarding> {
    let nb_ports = devices.count_avail();
    topology::validate_port_count(nb_ports)?;
    // queue q of the rx port feeds queue q of the tx port
    if config.port.rx_queues != config.port.tx_queues {
        return Err(Error::QueueCount {
            rx: config.port.rx_queues,
            tx: config.port.tx_queues,
        });
    }
    if lcores.is_empty() {
        return Err(Error::NoLcores);
    }

    let socket = config.pool_socket.unwrap_or_else(numa::current_socket);
    let pool = BufferPool::create(
        POOL_NAME,
        config.pool_capacity(nb_ports),
        config.cache_size,
        config.data_room,
        socket,
    )?;

    let ports = port::configure_ports(devices, &pool, &config.port)?;

    let ids: Vec<_> = ports.iter().map(|p| p.id).collect();
    let pairs = topology::pair_ports(&ids, config.bidirectional)?;
    let streams = topology::build_streams(&pairs, config.port.rx_queues);
    let assignments = topology::assign(&streams, lcores);
    if assignments.len() < lcores.len() {
        log::warn!(
            "{} lcores requested but only {} streams, extra lcores stay idle",
            lcores.len(),
            streams.len()
        );
    }

    let engine = forward::launch(&ports, &assignments, exit, config.sched_fifo)?;

    Ok(Forwarding {
        pool,
        ports,
        engine,
    })
}
