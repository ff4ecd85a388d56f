//! Poll-mode driver over Linux `AF_PACKET` raw sockets.
//!
//! Each queue is its own non-blocking socket bound to the interface. With
//! more than one rx queue the rx sockets join a hash fanout group so the
//! kernel spreads flows across them. Frames are copied between the socket
//! and pool buffers, so the pool is still the only source of packet memory.

#![allow(clippy::arithmetic_side_effects)]

use {
    crate::{
        error::Direction,
        ethdev::{
            DescLimits, DevError, DevInfo, EthConf, EthDev, MacAddress, PortStats, QueueId,
            TxConf, TxOffloads,
        },
        mempool::{BufferPool, PacketBuffer, PKTMBUF_HEADROOM},
        numa::{self, SocketId},
    },
    caps::{
        CapSet,
        Capability::{CAP_NET_ADMIN, CAP_NET_RAW},
    },
    libc::{
        c_int, c_void, sa_family_t, sockaddr, sockaddr_ll, AF_PACKET, ETH_P_ALL, SOCK_RAW,
        SOL_PACKET, SOL_SOCKET, SO_RCVBUF, SO_SNDBUF,
    },
    std::{
        ffi::CString,
        fs, io, mem,
        os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        sync::{
            atomic::{AtomicBool, AtomicU64, Ordering},
            Arc, Mutex, OnceLock, PoisonError,
        },
    },
};

pub const DRIVER_NAME: &str = "net_af_packet";

const MAX_QUEUES: u16 = 16;

// not exported by every libc version
const SO_BUSY_POLL: c_int = 46;
const SO_PREFER_BUSY_POLL: c_int = 69;
const PACKET_ADD_MEMBERSHIP: c_int = 1;
const PACKET_MR_PROMISC: u16 = 1;
const PACKET_FANOUT: c_int = 18;
const PACKET_FANOUT_HASH: u32 = 0;
const PACKET_IGNORE_OUTGOING: c_int = 23;

/// Socket buffer bytes reserved per descriptor.
const BYTES_PER_DESC: usize = 2048;

struct RawSocket {
    fd: OwnedFd,
}

impl RawSocket {
    /// Bind a raw socket to `if_index`. A socket opened with `receive` set
    /// takes every ethertype; otherwise it is send-only.
    fn bind(if_index: u32, receive: bool) -> io::Result<Self> {
        let protocol = if receive {
            (ETH_P_ALL as u16).to_be()
        } else {
            0
        };
        unsafe {
            let fd = libc::socket(AF_PACKET, SOCK_RAW, protocol as c_int);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            let fd = OwnedFd::from_raw_fd(fd);

            let sll = sockaddr_ll {
                sll_family: AF_PACKET as sa_family_t,
                sll_protocol: protocol,
                sll_ifindex: if_index as c_int,
                sll_hatype: 0,
                sll_pkttype: 0,
                sll_halen: 0,
                sll_addr: [0; 8],
            };
            if libc::bind(
                fd.as_raw_fd(),
                &sll as *const _ as *const sockaddr,
                mem::size_of::<sockaddr_ll>() as u32,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }

            Ok(RawSocket { fd })
        }
    }

    fn setsockopt<T>(&self, level: c_int, name: c_int, val: &T) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                level,
                name,
                val as *const T as *const c_void,
                mem::size_of::<T>() as u32,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_rcvbuf(&self, bytes: usize) -> io::Result<()> {
        self.setsockopt(SOL_SOCKET, SO_RCVBUF, &(bytes as c_int))
    }

    fn set_sndbuf(&self, bytes: usize) -> io::Result<()> {
        self.setsockopt(SOL_SOCKET, SO_SNDBUF, &(bytes as c_int))
    }

    fn join_fanout(&self, group: u16) -> io::Result<()> {
        let arg = group as u32 | (PACKET_FANOUT_HASH << 16);
        self.setsockopt(SOL_PACKET, PACKET_FANOUT, &arg)
    }

    /// Stop seeing frames this host transmits, including our own tx.
    fn ignore_outgoing(&self) -> io::Result<()> {
        self.setsockopt(SOL_PACKET, PACKET_IGNORE_OUTGOING, &(1 as c_int))
    }

    fn add_promisc_membership(&self, if_index: u32) -> io::Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: if_index as c_int,
            mr_type: PACKET_MR_PROMISC,
            mr_alen: 0,
            mr_address: [0; 8],
        };
        self.setsockopt(SOL_PACKET, PACKET_ADD_MEMBERSHIP, &mreq)
    }

    /// kernel will busy-poll the NIC for `micros` before sleeping
    fn set_busy_poll(&self, micros: u32) -> io::Result<()> {
        self.setsockopt(SOL_SOCKET, SO_BUSY_POLL, &(micros as c_int))?;
        match self.setsockopt(SOL_SOCKET, SO_PREFER_BUSY_POLL, &(1 as c_int)) {
            // added in linux 5.11
            Err(e) if e.raw_os_error() == Some(libc::ENOPROTOOPT) => {
                log::debug!("SO_PREFER_BUSY_POLL not supported by kernel");
                Ok(())
            }
            other => other,
        }
    }

    /// Returns the full frame length, which exceeds `buf.len()` when the
    /// frame was truncated.
    fn recv_nonblock(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                libc::MSG_DONTWAIT | libc::MSG_TRUNC,
            )
        };
        if len < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(len as usize)
        }
    }

    fn send_nonblock(&self, buf: &[u8]) -> io::Result<usize> {
        let len = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
            )
        };
        if len < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(len as usize)
        }
    }
}

impl AsRawFd for RawSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

struct RxQueue {
    sock: RawSocket,
    pool: Arc<BufferPool>,
}

struct TxQueue {
    sock: RawSocket,
}

#[derive(Default)]
struct State {
    configured: bool,
    nb_rx_queues: u16,
    nb_tx_queues: u16,
}

#[derive(Default)]
struct Counters {
    ipackets: AtomicU64,
    opackets: AtomicU64,
    ibytes: AtomicU64,
    obytes: AtomicU64,
    ierrors: AtomicU64,
    oerrors: AtomicU64,
    rx_nombuf: AtomicU64,
}

pub struct AfPacketDevice {
    if_name: String,
    if_index: u32,
    mac: MacAddress,
    socket_id: SocketId,
    busy_poll: Option<u32>,
    state: Mutex<State>,
    rxq: Box<[OnceLock<RxQueue>]>,
    txq: Box<[OnceLock<TxQueue>]>,
    started: AtomicBool,
    promisc: AtomicBool,
    counters: Counters,
}

fn if_index(if_name: &str) -> io::Result<u32> {
    let name = CString::new(if_name)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

fn read_mac(if_name: &str) -> io::Result<MacAddress> {
    fs::read_to_string(format!("/sys/class/net/{if_name}/address"))?
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

impl AfPacketDevice {
    /// Attach to the kernel interface `if_name`. With `busy_poll` every
    /// rx socket busy-polls the NIC for that many microseconds.
    pub fn open(if_name: &str, busy_poll: Option<u32>) -> io::Result<Self> {
        let if_index = if_index(if_name)?;
        let mac = read_mac(if_name).unwrap_or_else(|e| {
            log::warn!("cannot read mac address of {if_name}: {e}");
            MacAddress::default()
        });
        let socket_id = numa::netdev_socket(if_name);

        log::info!("opened {if_name} (if_index {if_index}, mac {mac}, numa node {socket_id})");

        Ok(Self {
            if_name: if_name.to_owned(),
            if_index,
            mac,
            socket_id,
            busy_poll,
            state: Mutex::new(State::default()),
            rxq: (0..MAX_QUEUES).map(|_| OnceLock::new()).collect(),
            txq: (0..MAX_QUEUES).map(|_| OnceLock::new()).collect(),
            started: AtomicBool::new(false),
            promisc: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    pub fn if_name(&self) -> &str {
        &self.if_name
    }

    pub fn if_index(&self) -> u32 {
        self.if_index
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_socket(&self, receive: bool) -> Result<RawSocket, DevError> {
        for cap in [CAP_NET_ADMIN, CAP_NET_RAW] {
            if let Err(e) = caps::raise(None, CapSet::Effective, cap) {
                log::debug!("failed to raise {cap:?}: {e}");
            }
        }
        Ok(RawSocket::bind(self.if_index, receive)?)
    }

    fn check_queue_setup(&self, queue: QueueId, direction: Direction) -> Result<(), DevError> {
        let state = self.state();
        if !state.configured {
            return Err(DevError::NotConfigured);
        }
        if self.started.load(Ordering::Acquire) {
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

    fn desc_limits() -> DescLimits {
        DescLimits {
            nb_max: 4096,
            nb_min: 64,
            nb_align: 1,
        }
    }
}

impl EthDev for AfPacketDevice {
    fn info(&self) -> DevInfo {
        DevInfo {
            driver_name: DRIVER_NAME,
            if_name: Some(self.if_name.clone()),
            max_rx_queues: MAX_QUEUES,
            max_tx_queues: MAX_QUEUES,
            rx_desc_lim: Self::desc_limits(),
            tx_desc_lim: Self::desc_limits(),
            min_rx_bufsize: 256,
            // the kernel copies out of the buffer on send, so completion is
            // immediate and buffers can go back to the pool in bulk
            tx_offload_capa: TxOffloads::MBUF_FAST_FREE,
            default_txconf: TxConf::default(),
        }
    }

    fn socket_id(&self) -> SocketId {
        self.socket_id
    }

    fn mac_addr(&self) -> MacAddress {
        self.mac
    }

    fn configure(&self, nb_rx_queues: u16, nb_tx_queues: u16, conf: &EthConf) -> Result<(), DevError> {
        if self.started.load(Ordering::Acquire) {
            return Err(DevError::AlreadyStarted);
        }
        if nb_rx_queues == 0 && nb_tx_queues == 0 {
            return Err(DevError::NoQueues);
        }
        for (direction, requested) in [("rx", nb_rx_queues), ("tx", nb_tx_queues)] {
            if requested > MAX_QUEUES {
                return Err(DevError::TooManyQueues {
                    direction,
                    requested,
                    max: MAX_QUEUES,
                });
            }
        }
        let capa = self.info().tx_offload_capa;
        if !capa.contains(conf.tx_offloads) {
            return Err(DevError::UnsupportedOffloads {
                requested: conf.tx_offloads.bits(),
                capa: capa.bits(),
            });
        }

        let mut state = self.state();
        state.configured = true;
        state.nb_rx_queues = nb_rx_queues;
        state.nb_tx_queues = nb_tx_queues;
        Ok(())
    }

    fn rx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        _socket: SocketId,
        pool: &Arc<BufferPool>,
    ) -> Result<(), DevError> {
        self.check_queue_setup(queue, Direction::Rx)?;
        let lim = Self::desc_limits();
        if !lim.contains(nb_desc) {
            return Err(DevError::InvalidDescCount { nb_desc, lim });
        }
        let usable = pool.data_room() - PKTMBUF_HEADROOM;
        let min = self.info().min_rx_bufsize;
        if usable < min {
            return Err(DevError::BufferTooSmall {
                data_room: usable,
                min,
            });
        }

        let slot = &self.rxq[queue.0 as usize];
        if slot.get().is_some() {
            return Err(DevError::QueueExists(queue.0));
        }

        let sock = self.open_socket(true)?;
        sock.set_rcvbuf(nb_desc as usize * BYTES_PER_DESC)?;
        sock.ignore_outgoing()?;
        if self.state().nb_rx_queues > 1 {
            sock.join_fanout(self.if_index as u16)?;
        }
        if let Some(micros) = self.busy_poll {
            sock.set_busy_poll(micros)?;
        }

        log::debug!(
            "{}: rx queue {} ready, {nb_desc} descriptors, fd {}",
            self.if_name,
            queue.0,
            sock.as_raw_fd()
        );
        slot.set(RxQueue {
            sock,
            pool: Arc::clone(pool),
        })
        .map_err(|_| DevError::QueueExists(queue.0))
    }

    fn tx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        _socket: SocketId,
        conf: &TxConf,
    ) -> Result<(), DevError> {
        self.check_queue_setup(queue, Direction::Tx)?;
        let lim = Self::desc_limits();
        if !lim.contains(nb_desc) {
            return Err(DevError::InvalidDescCount { nb_desc, lim });
        }
        let capa = self.info().tx_offload_capa;
        if !capa.contains(conf.offloads) {
            return Err(DevError::UnsupportedOffloads {
                requested: conf.offloads.bits(),
                capa: capa.bits(),
            });
        }

        let slot = &self.txq[queue.0 as usize];
        if slot.get().is_some() {
            return Err(DevError::QueueExists(queue.0));
        }

        let sock = self.open_socket(false)?;
        sock.set_sndbuf(nb_desc as usize * BYTES_PER_DESC)?;

        log::debug!(
            "{}: tx queue {} ready, {nb_desc} descriptors, fd {}",
            self.if_name,
            queue.0,
            sock.as_raw_fd()
        );
        slot.set(TxQueue { sock })
            .map_err(|_| DevError::QueueExists(queue.0))
    }

    fn start(&self) -> Result<(), DevError> {
        let state = self.state();
        if !state.configured {
            return Err(DevError::NotConfigured);
        }
        if let Some(q) = (0..state.nb_rx_queues).find(|&q| self.rxq[q as usize].get().is_none()) {
            return Err(DevError::QueueNotSetUp(q));
        }
        if let Some(q) = (0..state.nb_tx_queues).find(|&q| self.txq[q as usize].get().is_none()) {
            return Err(DevError::QueueNotSetUp(q));
        }
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn promiscuous_enable(&self) -> Result<(), DevError> {
        // membership is per interface, any bound socket will do
        let rxq = self.rxq[0].get().ok_or(DevError::QueueNotSetUp(0))?;
        rxq.sock.add_promisc_membership(self.if_index)?;
        self.promisc.store(true, Ordering::Relaxed);
        Ok(())
    }

    fn promiscuous(&self) -> bool {
        self.promisc.load(Ordering::Relaxed)
    }

    fn rx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>, max: usize) -> usize {
        if !self.started.load(Ordering::Relaxed) {
            return 0;
        }
        let Some(rxq) = self.rxq.get(queue.0 as usize).and_then(OnceLock::get) else {
            return 0;
        };

        let mut n = 0;
        let mut bytes = 0;
        // dropped frames use up the burst too
        for _ in 0..max {
            let Some(mut buf) = rxq.pool.alloc() else {
                // consume one frame so the socket does not back up
                let mut discard = [0u8; 1];
                if rxq.sock.recv_nonblock(&mut discard).is_ok() {
                    self.counters.rx_nombuf.fetch_add(1, Ordering::Relaxed);
                }
                break;
            };
            let room = buf.room_mut();
            let room_len = room.len();
            match rxq.sock.recv_nonblock(room) {
                Ok(len) if len > room_len => {
                    // does not fit in one buffer, never forward a partial frame
                    log::trace!("{}: rx queue {}: dropped {len} byte frame", self.if_name, queue.0);
                    self.counters.ierrors.fetch_add(1, Ordering::Relaxed);
                    drop(buf);
                }
                Ok(len) => {
                    buf.set_len(len);
                    bytes += len;
                    pkts.push(buf);
                    n += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::trace!("{}: rx queue {}: {e}", self.if_name, queue.0);
                    self.counters.ierrors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }

        if n > 0 {
            self.counters.ipackets.fetch_add(n as u64, Ordering::Relaxed);
            self.counters
                .ibytes
                .fetch_add(bytes as u64, Ordering::Relaxed);
        }
        n
    }

    fn tx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>) -> usize {
        if !self.started.load(Ordering::Relaxed) {
            return 0;
        }
        let Some(txq) = self.txq.get(queue.0 as usize).and_then(OnceLock::get) else {
            return 0;
        };

        let mut sent = 0;
        let mut bytes = 0;
        for buf in pkts.iter() {
            match txq.sock.send_nonblock(buf.data()) {
                Ok(len) => {
                    sent += 1;
                    bytes += len;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::trace!("{}: tx queue {}: {e}", self.if_name, queue.0);
                    self.counters.oerrors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }

        // the kernel holds its own copy, transmitted buffers are done
        pkts.drain(..sent);
        self.counters
            .opackets
            .fetch_add(sent as u64, Ordering::Relaxed);
        self.counters
            .obytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
        sent
    }

    fn stats(&self) -> PortStats {
        let c = &self.counters;
        PortStats {
            ipackets: c.ipackets.load(Ordering::Relaxed),
            opackets: c.opackets.load(Ordering::Relaxed),
            ibytes: c.ibytes.load(Ordering::Relaxed),
            obytes: c.obytes.load(Ordering::Relaxed),
            imissed: 0,
            ierrors: c.ierrors.load(Ordering::Relaxed),
            oerrors: c.oerrors.load(Ordering::Relaxed),
            rx_nombuf: c.rx_nombuf.load(Ordering::Relaxed),
        }
    }
}
