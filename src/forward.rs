//! The forwarding loop.
//!
//! Every lcore runs one [`Forwarder`] that polls its streams round-robin:
//! receive a burst, hand all of it to the paired port, free whatever the tx
//! ring did not take. Nothing in here blocks and nothing returns an error
//! once the loop is running.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        error::{Error, Result},
        ethdev::{EthDev, PortId, QueueId},
        lcore::{self, LcoreId},
        mempool::PacketBuffer,
        numa::{self, Placement},
        port::Port,
        topology::{LcoreAssignment, Stream},
    },
    std::{
        mem,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc,
        },
        thread::JoinHandle,
    },
};

/// Largest number of packets moved per poll of one stream.
pub const BURST_SIZE: usize = 32;

#[derive(Debug, Default)]
pub struct StreamStats {
    pub rx_packets: AtomicU64,
    pub tx_packets: AtomicU64,
    pub dropped: AtomicU64,
    /// Polls that returned at least one packet.
    pub bursts: AtomicU64,
}

impl StreamStats {
    #[inline]
    fn record(&self, burst: BurstResult) {
        self.rx_packets
            .fetch_add(burst.rx as u64, Ordering::Relaxed);
        self.tx_packets
            .fetch_add(burst.tx as u64, Ordering::Relaxed);
        self.dropped
            .fetch_add(burst.dropped() as u64, Ordering::Relaxed);
        self.bursts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StreamCounters {
        StreamCounters {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            bursts: self.bursts.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamCounters {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub dropped: u64,
    pub bursts: u64,
}

impl std::ops::Add for StreamCounters {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            rx_packets: self.rx_packets + rhs.rx_packets,
            tx_packets: self.tx_packets + rhs.tx_packets,
            dropped: self.dropped + rhs.dropped,
            bursts: self.bursts + rhs.bursts,
        }
    }
}

/// Outcome of one [`forward_burst`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BurstResult {
    pub rx: usize,
    pub tx: usize,
}

impl BurstResult {
    pub fn dropped(&self) -> usize {
        self.rx - self.tx
    }
}

/// Move one burst from `rx_dev`/`rx_queue` to `tx_dev`/`tx_queue`.
///
/// `pkts` is scratch space and must be empty on entry; it is empty again on
/// return. Buffers the tx ring rejected are freed here, in receive order,
/// before the next poll.
#[inline]
pub fn forward_burst(
    rx_dev: &dyn EthDev,
    rx_queue: QueueId,
    tx_dev: &dyn EthDev,
    tx_queue: QueueId,
    pkts: &mut Vec<PacketBuffer>,
) -> BurstResult {
    debug_assert!(pkts.is_empty());

    let nb_rx = rx_dev.rx_burst(rx_queue, pkts, BURST_SIZE);
    if nb_rx == 0 {
        return BurstResult::default();
    }

    let nb_tx = tx_dev.tx_burst(tx_queue, pkts);

    // free any unsent packets
    pkts.drain(..).for_each(PacketBuffer::free);

    BurstResult {
        rx: nb_rx,
        tx: nb_tx,
    }
}

struct StreamCtx {
    stream: Stream,
    rx_dev: Arc<dyn EthDev>,
    tx_dev: Arc<dyn EthDev>,
    stats: Arc<StreamStats>,
}

/// Polling state of one lcore.
pub struct Forwarder {
    lcore: LcoreId,
    streams: Vec<StreamCtx>,
    pkts: Vec<PacketBuffer>,
}

impl Forwarder {
    pub fn new(lcore: LcoreId, streams: &[Stream], ports: &[Port]) -> Result<Self> {
        let find = |id: PortId| {
            ports
                .iter()
                .find(|p| p.id == id)
                .ok_or(Error::InvalidPort(id))
        };
        let streams = streams
            .iter()
            .map(|&stream| {
                Ok(StreamCtx {
                    stream,
                    rx_dev: Arc::clone(&find(stream.pair.rx)?.dev),
                    tx_dev: Arc::clone(&find(stream.pair.tx)?.dev),
                    stats: Arc::default(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            lcore,
            streams,
            pkts: Vec::with_capacity(BURST_SIZE),
        })
    }

    pub fn lcore(&self) -> LcoreId {
        self.lcore
    }

    /// Counters of every stream, shared with the polling thread.
    pub fn stats(&self) -> Vec<(Stream, Arc<StreamStats>)> {
        self.streams
            .iter()
            .map(|s| (s.stream, Arc::clone(&s.stats)))
            .collect()
    }

    /// Warn about every polled port that sits on a different numa node than
    /// this lcore.
    pub fn check_numa(&self, ports: &[Port]) -> Vec<(PortId, Placement)> {
        let lcore_socket = self.lcore.socket_id();
        let mut ids: Vec<PortId> = self
            .streams
            .iter()
            .flat_map(|s| [s.stream.pair.rx, s.stream.pair.tx])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.into_iter()
            .filter_map(|id| ports.iter().find(|p| p.id == id))
            .map(|port| {
                (
                    port.id,
                    numa::check_port_affinity(port.id, port.socket_id, self.lcore, lcore_socket),
                )
            })
            .collect()
    }

    /// Poll every stream once. Returns the number of packets received.
    #[inline]
    pub fn poll_once(&mut self) -> usize {
        let mut received = 0;
        for ctx in &self.streams {
            let burst = forward_burst(
                ctx.rx_dev.as_ref(),
                ctx.stream.rx_queue,
                ctx.tx_dev.as_ref(),
                ctx.stream.tx_queue,
                &mut self.pkts,
            );
            if burst.rx > 0 {
                ctx.stats.record(burst);
                received += burst.rx;
            }
        }
        received
    }

    /// Poll until `exit` is raised. The flag is checked once per iteration,
    /// never in the middle of one. Returns the iteration count.
    #[inline(never)]
    pub fn run(&mut self, exit: &AtomicBool) -> u64 {
        log::info!(
            "lcore {} forwarding {} streams",
            self.lcore,
            self.streams.len()
        );
        for ctx in &self.streams {
            log::debug!("lcore {}: stream {}", self.lcore, ctx.stream);
        }

        let mut iterations = 0u64;
        while !exit.load(Ordering::Relaxed) {
            self.poll_once();
            iterations += 1;
        }

        log::info!("lcore {} stopped after {iterations} iterations", self.lcore);
        iterations
    }

    /// Run exactly `iterations` polls.
    pub fn run_for(&mut self, iterations: u64) {
        for _ in 0..iterations {
            self.poll_once();
        }
    }
}

/// Running lcores and their counters.
pub struct ForwardingEngine {
    exit: Arc<AtomicBool>,
    handles: Vec<(LcoreId, JoinHandle<u64>)>,
    stats: Vec<(Stream, Arc<StreamStats>)>,
}

/// Start one pinned thread per assignment, each running a [`Forwarder`]
/// until `exit` is raised.
pub fn launch(
    ports: &[Port],
    assignments: &[LcoreAssignment],
    exit: Arc<AtomicBool>,
    sched_fifo: bool,
) -> Result<ForwardingEngine> {
    if assignments.is_empty() {
        return Err(Error::NoLcores);
    }
    let forwarders = assignments
        .iter()
        .map(|a| Forwarder::new(a.lcore, &a.streams, ports))
        .collect::<Result<Vec<_>>>()?;

    let mut engine = ForwardingEngine {
        exit,
        handles: Vec::with_capacity(forwarders.len()),
        stats: forwarders.iter().flat_map(Forwarder::stats).collect(),
    };

    for mut forwarder in forwarders {
        let lcore = forwarder.lcore();
        let exit = Arc::clone(&engine.exit);
        let ports = ports.to_vec();
        let handle = lcore::launch(lcore, sched_fifo, move || {
            forwarder.check_numa(&ports);
            forwarder.run(&exit)
        })
        .map_err(|source| Error::Lcore {
            lcore: lcore.0,
            source,
        })?;
        engine.handles.push((lcore, handle));
    }

    log::info!("forwarding on {} lcores, ctrl+c to quit", engine.handles.len());
    Ok(engine)
}

impl ForwardingEngine {
    /// Ask every lcore to leave its loop after the current iteration.
    pub fn stop(&self) {
        self.exit.store(true, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        !self.exit.load(Ordering::Relaxed)
    }

    /// Wait for every lcore to finish. Returns the iteration count of each.
    /// Counters stay readable afterwards.
    pub fn join(&mut self) -> Vec<(LcoreId, u64)> {
        mem::take(&mut self.handles)
            .into_iter()
            .filter_map(|(lcore, handle)| match handle.join() {
                Ok(iterations) => Some((lcore, iterations)),
                Err(_) => {
                    log::error!("lcore {lcore} panicked");
                    None
                }
            })
            .collect()
    }

    pub fn snapshot(&self) -> Vec<(Stream, StreamCounters)> {
        self.stats
            .iter()
            .map(|(stream, stats)| (*stream, stats.snapshot()))
            .collect()
    }

    pub fn totals(&self) -> StreamCounters {
        self.stats
            .iter()
            .map(|(_, stats)| stats.snapshot())
            .fold(StreamCounters::default(), |acc, c| acc + c)
    }
}

impl Drop for ForwardingEngine {
    fn drop(&mut self) {
        if !self.handles.is_empty() {
            self.stop();
            self.join();
        }
    }
}
