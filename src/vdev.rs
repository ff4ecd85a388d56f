//! In-memory poll-mode device.
//!
//! A `VirtualDevice` behaves like a NIC with real descriptor rings: frames
//! injected on the "wire" side are copied into pool buffers as they arrive
//! (or dropped when the ring or the pool is full), and buffers accepted for
//! transmission sit in the tx ring until [`VirtualDevice::drain_tx`]
//! completes them and returns them to their pool.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        error::Direction,
        ethdev::{
            DescLimits, DevError, DevInfo, EthConf, EthDev, MacAddress, PortStats, QueueId,
            TxConf, TxOffloads,
        },
        mempool::{BufferPool, PacketBuffer, PKTMBUF_HEADROOM},
        numa::SocketId,
    },
    std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, MutexGuard, PoisonError,
        },
    },
};

pub const DRIVER_NAME: &str = "net_virtual";

#[derive(Debug, Clone)]
pub struct VirtualDeviceConfig {
    pub name: String,
    pub socket_id: SocketId,
    pub mac: MacAddress,
    pub max_rx_queues: u16,
    pub max_tx_queues: u16,
    pub rx_desc_lim: DescLimits,
    pub tx_desc_lim: DescLimits,
    pub min_rx_bufsize: u16,
    pub tx_offload_capa: TxOffloads,
}

impl Default for VirtualDeviceConfig {
    fn default() -> Self {
        Self {
            name: "virtual0".to_owned(),
            socket_id: SocketId::Any,
            mac: MacAddress([0x02, 0, 0, 0, 0, 0]),
            max_rx_queues: 16,
            max_tx_queues: 16,
            rx_desc_lim: DescLimits {
                nb_max: 4096,
                nb_min: 32,
                nb_align: 32,
            },
            tx_desc_lim: DescLimits {
                nb_max: 4096,
                nb_min: 32,
                nb_align: 32,
            },
            min_rx_bufsize: 1024,
            tx_offload_capa: TxOffloads::MBUF_FAST_FREE,
        }
    }
}

/// Arguments of one successful queue setup call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSetupRecord {
    pub direction: Direction,
    pub queue: u16,
    pub nb_desc: u16,
    pub socket: SocketId,
    pub offloads: TxOffloads,
}

#[derive(Default)]
struct State {
    configured: bool,
    nb_rx_queues: u16,
    nb_tx_queues: u16,
    conf: EthConf,
    setups: Vec<QueueSetupRecord>,
}

struct RxRing {
    nb_desc: usize,
    pool: Arc<BufferPool>,
    ring: VecDeque<PacketBuffer>,
}

struct TxRing {
    nb_desc: usize,
    ring: VecDeque<PacketBuffer>,
    budget: Option<usize>,
}

#[derive(Default)]
struct Counters {
    ipackets: AtomicU64,
    opackets: AtomicU64,
    ibytes: AtomicU64,
    obytes: AtomicU64,
    imissed: AtomicU64,
    ierrors: AtomicU64,
    rx_nombuf: AtomicU64,
}

pub struct VirtualDevice {
    config: VirtualDeviceConfig,
    state: Mutex<State>,
    rxq: Box<[Mutex<Option<RxRing>>]>,
    txq: Box<[Mutex<Option<TxRing>>]>,
    started: AtomicBool,
    promisc: AtomicBool,
    counters: Counters,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl VirtualDevice {
    pub fn new(config: VirtualDeviceConfig) -> Self {
        let rxq = (0..config.max_rx_queues).map(|_| Mutex::new(None)).collect();
        let txq = (0..config.max_tx_queues).map(|_| Mutex::new(None)).collect();
        Self {
            config,
            state: Mutex::new(State::default()),
            rxq,
            txq,
            started: AtomicBool::new(false),
            promisc: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Port-wide configuration accepted by the last `configure` call.
    pub fn eth_conf(&self) -> EthConf {
        lock(&self.state).conf
    }

    /// Every successful queue setup, in call order.
    pub fn queue_setups(&self) -> Vec<QueueSetupRecord> {
        lock(&self.state).setups.clone()
    }

    fn accepts(&self, frame: &[u8]) -> bool {
        if self.promisc.load(Ordering::Relaxed) || frame.len() < 6 {
            return true;
        }
        // unicast to us, or any group address
        frame[..6] == self.config.mac.0 || frame[0] & 1 == 1
    }

    /// A frame arrives on the wire for rx `queue`.
    ///
    /// Returns false when the frame was filtered or dropped: port stopped,
    /// ring full (`imissed`), pool exhausted (`rx_nombuf`) or frame larger
    /// than the buffer room (`ierrors`).
    pub fn inject(&self, queue: QueueId, frame: &[u8]) -> bool {
        if !self.is_started() || !self.accepts(frame) {
            return false;
        }
        let Some(slot) = self.rxq.get(queue.0 as usize) else {
            return false;
        };
        let mut slot = lock(slot);
        let Some(rxq) = slot.as_mut() else {
            return false;
        };
        if rxq.ring.len() >= rxq.nb_desc {
            self.counters.imissed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let Some(mut buf) = rxq.pool.alloc() else {
            self.counters.rx_nombuf.fetch_add(1, Ordering::Relaxed);
            return false;
        };
        if buf.fill_from(frame) < frame.len() {
            self.counters.ierrors.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        rxq.ring.push_back(buf);
        true
    }

    /// Limit how many descriptors tx `queue` accepts per burst, modelling a
    /// DMA engine that is not ready for more. `None` removes the limit.
    pub fn set_tx_budget(&self, queue: QueueId, budget: Option<usize>) {
        if let Some(slot) = self.txq.get(queue.0 as usize) {
            if let Some(txq) = lock(slot).as_mut() {
                txq.budget = budget;
            }
        }
    }

    /// Complete transmission of up to `max` queued buffers: their bytes go
    /// out on the wire (returned here) and the buffers go back to the pool.
    pub fn drain_tx(&self, queue: QueueId, max: usize) -> Vec<Vec<u8>> {
        let Some(slot) = self.txq.get(queue.0 as usize) else {
            return Vec::new();
        };
        let mut slot = lock(slot);
        let Some(txq) = slot.as_mut() else {
            return Vec::new();
        };
        let n = max.min(txq.ring.len());
        let frames: Vec<Vec<u8>> = txq
            .ring
            .drain(..n)
            .map(|buf| buf.data().to_vec())
            .collect();
        let bytes: usize = frames.iter().map(Vec::len).sum();
        self.counters
            .opackets
            .fetch_add(frames.len() as u64, Ordering::Relaxed);
        self.counters
            .obytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        frames
    }

    /// Pool indices of buffers waiting in tx `queue`, oldest first.
    pub fn tx_pending(&self, queue: QueueId) -> Vec<u32> {
        self.txq
            .get(queue.0 as usize)
            .map(lock)
            .and_then(|slot| {
                slot.as_ref()
                    .map(|txq| txq.ring.iter().map(PacketBuffer::index).collect())
            })
            .unwrap_or_default()
    }

    /// Frames received but not yet polled on rx `queue`.
    pub fn rx_pending(&self, queue: QueueId) -> usize {
        self.rxq
            .get(queue.0 as usize)
            .map(lock)
            .and_then(|slot| slot.as_ref().map(|rxq| rxq.ring.len()))
            .unwrap_or(0)
    }

    fn check_queue_setup(&self, queue: QueueId, direction: Direction) -> Result<(), DevError> {
        let state = lock(&self.state);
        if !state.configured {
            return Err(DevError::NotConfigured);
        }
        if self.is_started() {
            return Err(DevError::AlreadyStarted);
        }
        let nb_queues = match direction {
            Direction::Rx => state.nb_rx_queues,
            Direction::Tx => state.nb_tx_queues,
        };
        if queue.0 >= nb_queues {
            return Err(DevError::QueueOutOfRange(queue.0));
        }
        Ok(())
    }
}

impl EthDev for VirtualDevice {
    fn info(&self) -> DevInfo {
        DevInfo {
            driver_name: DRIVER_NAME,
            if_name: Some(self.config.name.clone()),
            max_rx_queues: self.config.max_rx_queues,
            max_tx_queues: self.config.max_tx_queues,
            rx_desc_lim: self.config.rx_desc_lim,
            tx_desc_lim: self.config.tx_desc_lim,
            min_rx_bufsize: self.config.min_rx_bufsize,
            tx_offload_capa: self.config.tx_offload_capa,
            default_txconf: TxConf::default(),
        }
    }

    fn socket_id(&self) -> SocketId {
        self.config.socket_id
    }

    fn mac_addr(&self) -> MacAddress {
        self.config.mac
    }

    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16, conf: &EthConf) -> Result<(), DevError> {
        if self.is_started() {
            return Err(DevError::AlreadyStarted);
        }
        if nb_rx_queues == 0 && nb_tx_queues == 0 {
            return Err(DevError::NoQueues);
        }
        if nb_rx_queues > self.config.max_rx_queues {
            return Err(DevError::TooManyQueues {
                direction: "rx",
                requested: nb_rx_queues,
                max: self.config.max_rx_queues,
            });
        }
        if nb_tx_queues > self.config.max_tx_queues {
            return Err(DevError::TooManyQueues {
                direction: "tx",
                requested: nb_tx_queues,
                max: self.config.max_tx_queues,
            });
        }
        if !self.config.tx_offload_capa.contains(conf.tx_offloads) {
            return Err(DevError::UnsupportedOffloads {
                requested: conf.tx_offloads.bits(),
                capa: self.config.tx_offload_capa.bits(),
            });
        }

        let mut state = lock(&self.state);
        state.configured = true;
        state.nb_rx_queues = nb_rx_queues;
        state.nb_tx_queues = nb_tx_queues;
        state.conf = *conf;
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        pool: &Arc<BufferPool>,
    ) -> Result<(), DevError> {
        self.check_queue_setup(queue, Direction::Rx)?;
        if !self.config.rx_desc_lim.contains(nb_desc) {
            return Err(DevError::InvalidDescCount {
                nb_desc,
                lim: self.config.rx_desc_lim,
            });
        }
        let usable = pool.data_room() - PKTMBUF_HEADROOM;
        if usable < self.config.min_rx_bufsize {
            return Err(DevError::BufferTooSmall {
                data_room: usable,
                min: self.config.min_rx_bufsize,
            });
        }

        *lock(&self.rxq[queue.0 as usize]) = Some(RxRing {
            nb_desc: nb_desc as usize,
            pool: Arc::clone(pool),
            ring: VecDeque::with_capacity(nb_desc as usize),
        });
        lock(&self.state).setups.push(QueueSetupRecord {
            direction: Direction::Rx,
            queue: queue.0,
            nb_desc,
            socket,
            offloads: TxOffloads::NONE,
        });
        Ok(())
    }

    fn tx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        conf: &TxConf,
    ) -> Result<(), DevError> {
        self.check_queue_setup(queue, Direction::Tx)?;
        if !self.config.tx_desc_lim.contains(nb_desc) {
            return Err(DevError::InvalidDescCount {
                nb_desc,
                lim: self.config.tx_desc_lim,
            });
        }
        if !self.config.tx_offload_capa.contains(conf.offloads) {
            return Err(DevError::UnsupportedOffloads {
                requested: conf.offloads.bits(),
                capa: self.config.tx_offload_capa.bits(),
            });
        }

        *lock(&self.txq[queue.0 as usize]) = Some(TxRing {
            nb_desc: nb_desc as usize,
            ring: VecDeque::with_capacity(nb_desc as usize),
            budget: None,
        });
        lock(&self.state).setups.push(QueueSetupRecord {
            direction: Direction::Tx,
            queue: queue.0,
            nb_desc,
            socket,
            offloads: conf.offloads,
        });
        Ok(())
    }

    fn start(&self) -> Result<(), DevError> {
        let state = lock(&self.state);
        if !state.configured {
            return Err(DevError::NotConfigured);
        }
        if let Some(q) = (0..state.nb_rx_queues).find(|&q| lock(&self.rxq[q as usize]).is_none()) {
            return Err(DevError::QueueNotSetUp(q));
        }
        if let Some(q) = (0..state.nb_tx_queues).find(|&q| lock(&self.txq[q as usize]).is_none()) {
            return Err(DevError::QueueNotSetUp(q));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn promiscuous_enable(&self) -> Result<(), DevError> {
        self.promisc.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn promiscuous(&self) -> bool {
        self.promisc.load(Ordering::Relaxed)
    }

    fn rx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>, max: usize) -> usize {
        if !self.is_started() {
            return 0;
        }
        let Some(slot) = self.rxq.get(queue.0 as usize) else {
            return 0;
        };
        let mut slot = lock(slot);
        let Some(rxq) = slot.as_mut() else {
            return 0;
        };
        let n = max.min(rxq.ring.len());
        if n == 0 {
            return 0;
        }
        let start = pkts.len();
        pkts.extend(rxq.ring.drain(..n));
        let bytes: usize = pkts[start..].iter().map(PacketBuffer::len).sum();
        self.counters
            .ipackets
            .fetch_add(n as u64, Ordering::Relaxed);
        self.counters
            .ibytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        n
    }

    fn tx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>) -> usize {
        if !self.is_started() {
            return 0;
        }
        let Some(slot) = self.txq.get(queue.0 as usize) else {
            return 0;
        };
        let mut slot = lock(slot);
        let Some(txq) = slot.as_mut() else {
            return 0;
        };
        let free = txq.nb_desc - txq.ring.len();
        let n = pkts
            .len()
            .min(free)
            .min(txq.budget.unwrap_or(usize::MAX));
        txq.ring.extend(pkts.drain(..n));
        n
    }

    fn stats(&self) -> PortStats {
        let c = &self.counters;
        PortStats {
            ipackets: c.ipackets.load(Ordering::Relaxed),
            opackets: c.opackets.load(Ordering::Relaxed),
            ibytes: c.ibytes.load(Ordering::Relaxed),
            obytes: c.obytes.load(Ordering::Relaxed),
            imissed: c.imissed.load(Ordering::Relaxed),
            ierrors: c.ierrors.load(Ordering::Relaxed),
            oerrors: 0,
            rx_nombuf: c.rx_nombuf.load(Ordering::Relaxed),
        }
    }
}
