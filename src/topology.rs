//! Which port feeds which, and which lcore polls what.

use {
    crate::{
        error::{Error, Result},
        ethdev::{PortId, QueueId},
        lcore::LcoreId,
    },
    itertools::Itertools,
    std::fmt,
};

/// Packets received on `rx` are transmitted on `tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortPair {
    pub rx: PortId,
    pub tx: PortId,
}

impl fmt::Display for PortPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.rx, self.tx)
    }
}

pub fn validate_port_count(count: usize) -> Result<()> {
    if count < 2 || count % 2 != 0 {
        return Err(Error::PortCount(count));
    }
    Ok(())
}

/// Pair consecutive ports: (0,1), (2,3), and so on. With `bidirectional`
/// every pair also forwards in the reverse direction.
pub fn pair_ports(ports: &[PortId], bidirectional: bool) -> Result<Vec<PortPair>> {
    validate_port_count(ports.len())?;
    Ok(ports
        .iter()
        .copied()
        .tuples()
        .flat_map(|(a, b)| {
            let forward = PortPair { rx: a, tx: b };
            let reverse = bidirectional.then_some(PortPair { rx: b, tx: a });
            std::iter::once(forward).chain(reverse)
        })
        .collect())
}

/// One forwarding path between a queue of each port of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stream {
    pub pair: PortPair,
    pub rx_queue: QueueId,
    pub tx_queue: QueueId,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.pair.rx, self.rx_queue.0, self.pair.tx, self.tx_queue.0
        )
    }
}

/// Expand pairs into streams, one per queue index. Queue `q` of the rx port
/// always feeds queue `q` of the tx port, so no queue has two owners.
pub fn build_streams(pairs: &[PortPair], nb_queues: u16) -> Vec<Stream> {
    pairs
        .iter()
        .cartesian_product(0..nb_queues)
        .map(|(&pair, q)| Stream {
            pair,
            rx_queue: QueueId(q),
            tx_queue: QueueId(q),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LcoreAssignment {
    pub lcore: LcoreId,
    pub streams: Vec<Stream>,
}

/// Deal streams to lcores round-robin. Lcores beyond the stream count get
/// nothing and are left out.
pub fn assign(streams: &[Stream], lcores: &[LcoreId]) -> Vec<LcoreAssignment> {
    if lcores.is_empty() {
        return Vec::new();
    }
    let mut assignments: Vec<_> = lcores
        .iter()
        .map(|&lcore| LcoreAssignment {
            lcore,
            streams: Vec::new(),
        })
        .collect();
    for (i, stream) in streams.iter().enumerate() {
        assignments[i % lcores.len()].streams.push(*stream);
    }
    assignments.retain(|a| !a.streams.is_empty());
    assignments
}
