//! Poll-mode packet forwarder.
//!
//! Packets received on one port of a pair are transmitted unmodified on the
//! other. Buffers come from a single [`mempool::BufferPool`], ports are
//! brought up through the [`ethdev::EthDev`] interface, and each lcore runs
//! a busy polling loop over the streams it owns.

pub mod config;
pub mod error;
pub mod ethdev;
pub mod forward;
pub mod lcore;
pub mod memory;
pub mod mempool;
pub mod numa;
pub mod port;
pub mod topology;
pub mod vdev;

#[cfg(target_os = "linux")]
pub mod af_packet;

pub use {
    config::{start, ForwarderConfig, Forwarding},
    error::{Error, Result},
    ethdev::{EthDev, EthDevices, PortId, QueueId},
    forward::{forward_burst, Forwarder, ForwardingEngine, BURST_SIZE},
    lcore::LcoreId,
    mempool::{BufferPool, PacketBuffer},
    port::{configure_port, configure_ports, Port, PortConfig},
    topology::{PortPair, Stream},
};
