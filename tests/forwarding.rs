use {
    basicfwd::{
        config::{self, ForwarderConfig},
        error::{Direction, Error},
        ethdev::{
            DescLimits, DevError, DevInfo, EthConf, EthDev, EthDevices, MacAddress, PortId,
            PortStats, QueueId, TxConf,
        },
        forward::{forward_burst, BurstResult, Forwarder},
        lcore::{self, LcoreId},
        mempool::{BufferPool, PacketBuffer, MBUF_DEFAULT_BUF_SIZE},
        numa::SocketId,
        port::{configure_ports, PortConfig},
        topology::{build_streams, pair_ports},
        vdev::{VirtualDevice, VirtualDeviceConfig},
    },
    std::{
        io,
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
};

/// Passes everything through to a virtual device, counts tx calls and fails
/// the setup calls it is told to.
struct ScriptedDevice {
    inner: Arc<VirtualDevice>,
    tx_calls: AtomicUsize,
    fail_tx_queue: Option<u16>,
    fail_start: bool,
}

impl ScriptedDevice {
    fn new(config: VirtualDeviceConfig) -> Self {
        Self {
            inner: Arc::new(VirtualDevice::new(config)),
            tx_calls: AtomicUsize::new(0),
            fail_tx_queue: None,
            fail_start: false,
        }
    }
}

impl EthDev for ScriptedDevice {
    fn info(&self) -> DevInfo {
        self.inner.info()
    }

    fn socket_id(&self) -> SocketId {
        self.inner.socket_id()
    }

    fn mac_addr(&self) -> MacAddress {
        self.inner.mac_addr()
    }

    fn configure(&self, nb_rx: u16, nb_tx: u16, conf: &EthConf) -> Result<(), DevError> {
        self.inner.configure(nb_rx, nb_tx, conf)
    }

    fn rx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        pool: &Arc<BufferPool>,
    ) -> Result<(), DevError> {
        self.inner.rx_queue_setup(queue, nb_desc, socket, pool)
    }

    fn tx_queue_setup(
        &self,
        queue: QueueId,
        nb_desc: u16,
        socket: SocketId,
        conf: &TxConf,
    ) -> Result<(), DevError> {
        if self.fail_tx_queue == Some(queue.0) {
            return Err(DevError::Io(io::Error::other("no tx descriptors")));
        }
        self.inner.tx_queue_setup(queue, nb_desc, socket, conf)
    }

    fn start(&self) -> Result<(), DevError> {
        if self.fail_start {
            return Err(DevError::Io(io::Error::other("link down")));
        }
        self.inner.start()
    }

    fn promiscuous_enable(&self) -> Result<(), DevError> {
        self.inner.promiscuous_enable()
    }

    fn promiscuous(&self) -> bool {
        self.inner.promiscuous()
    }

    fn rx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>, max: usize) -> usize {
        self.inner.rx_burst(queue, pkts, max)
    }

    fn tx_burst(&self, queue: QueueId, pkts: &mut Vec<PacketBuffer>) -> usize {
        self.tx_calls.fetch_add(1, Ordering::Relaxed);
        self.inner.tx_burst(queue, pkts)
    }

    fn stats(&self) -> PortStats {
        self.inner.stats()
    }
}

fn virtual_ports(n: u8, config: VirtualDeviceConfig) -> (EthDevices, Vec<Arc<VirtualDevice>>) {
    let mut devices = EthDevices::new();
    let devs = (0..n)
        .map(|i| {
            let dev = Arc::new(VirtualDevice::new(VirtualDeviceConfig {
                name: format!("virtual{i}"),
                mac: MacAddress([0x02, 0, 0, 0, 0, i]),
                ..config.clone()
            }));
            devices.attach(dev.clone());
            dev
        })
        .collect();
    (devices, devs)
}

fn frame(seq: u16) -> [u8; 64] {
    let mut frame = [0u8; 64];
    frame[..6].fill(0xff);
    frame[14..16].copy_from_slice(&seq.to_be_bytes());
    frame
}

fn seq(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[14], frame[15]])
}

#[test]
fn test_partial_transmit_releases_rest() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let pool = BufferPool::create("scenario", 512, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    configure_ports(&devices, &pool, &PortConfig::default()).unwrap();

    for i in 0..100 {
        assert!(devs[0].inject(QueueId(0), &frame(i)));
    }
    assert_eq!(pool.available(), 412);
    devs[1].set_tx_budget(QueueId(0), Some(10));

    let mut pkts = Vec::new();
    let burst = forward_burst(
        devs[0].as_ref(),
        QueueId(0),
        devs[1].as_ref(),
        QueueId(0),
        &mut pkts,
    );
    assert_eq!(burst, BurstResult { rx: 32, tx: 10 });

    // 68 left in the rx ring, 10 queued for transmit, 22 back in the pool
    assert_eq!(devs[0].rx_pending(QueueId(0)), 68);
    assert_eq!(devs[1].tx_pending(QueueId(0)).len(), 10);
    assert_eq!(pool.in_use(), 78);
    assert_eq!(pool.available(), 434);

    let sent: Vec<u16> = devs[1]
        .drain_tx(QueueId(0), usize::MAX)
        .iter()
        .map(|f| seq(f))
        .collect();
    assert_eq!(sent, (0..10).collect::<Vec<_>>());
}

#[test]
fn test_burst_against_small_pool() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let pool = BufferPool::create("small", 100, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    configure_ports(&devices, &pool, &PortConfig::default()).unwrap();

    for i in 0..32 {
        devs[0].inject(QueueId(0), &frame(i));
    }
    assert_eq!(pool.available(), 68);
    devs[1].set_tx_budget(QueueId(0), Some(10));

    let mut pkts = Vec::new();
    let burst = forward_burst(
        devs[0].as_ref(),
        QueueId(0),
        devs[1].as_ref(),
        QueueId(0),
        &mut pkts,
    );
    assert_eq!((burst.rx, burst.tx, burst.dropped()), (32, 10, 22));
    assert_eq!(pool.available(), 90);

    // transmit completion hands the last 10 back
    assert_eq!(devs[1].drain_tx(QueueId(0), usize::MAX).len(), 10);
    assert_eq!(pool.available(), 100);
}

#[test]
fn test_empty_poll_makes_no_tx_call() {
    let rx = Arc::new(ScriptedDevice::new(VirtualDeviceConfig::default()));
    let tx = Arc::new(ScriptedDevice::new(VirtualDeviceConfig {
        mac: MacAddress([0x02, 0, 0, 0, 0, 1]),
        ..Default::default()
    }));
    let mut devices = EthDevices::new();
    devices.attach(rx.clone());
    devices.attach(tx.clone());
    let pool = BufferPool::create("calls", 64, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    let ports = configure_ports(&devices, &pool, &PortConfig::default()).unwrap();

    let streams = build_streams(&pair_ports(&[PortId(0), PortId(1)], false).unwrap(), 1);
    let mut fwd = Forwarder::new(LcoreId(0), &streams, &ports).unwrap();
    fwd.run_for(100);
    assert_eq!(tx.tx_calls.load(Ordering::Relaxed), 0);

    rx.inner.inject(QueueId(0), &frame(1));
    fwd.run_for(100);
    assert_eq!(tx.tx_calls.load(Ordering::Relaxed), 1);
    assert_eq!(tx.inner.tx_pending(QueueId(0)).len(), 1);
}

#[test]
fn test_empty_poll_touches_nothing() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let pool = BufferPool::create("empty", 64, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    let ports = configure_ports(&devices, &pool, &PortConfig::default()).unwrap();

    let streams = build_streams(&pair_ports(&[PortId(0), PortId(1)], false).unwrap(), 1);
    let mut fwd = Forwarder::new(LcoreId(0), &streams, &ports).unwrap();
    assert_eq!(fwd.poll_once(), 0);

    assert!(devs[1].tx_pending(QueueId(0)).is_empty());
    assert_eq!(pool.available(), 64);
    assert_eq!(fwd.stats()[0].1.snapshot().bursts, 0);
}

#[test]
fn test_adjusted_ring_sizes_reach_queue_setup() {
    let lim = DescLimits {
        nb_max: 512,
        nb_min: 64,
        nb_align: 32,
    };
    let (devices, devs) = virtual_ports(
        2,
        VirtualDeviceConfig {
            rx_desc_lim: lim,
            tx_desc_lim: lim,
            ..Default::default()
        },
    );
    let pool = BufferPool::create("adjust", 256, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    let ports = configure_ports(&devices, &pool, &PortConfig::default()).unwrap();

    for (port, dev) in ports.iter().zip(&devs) {
        assert_eq!(port.rx_ring_size, 512);
        assert_eq!(port.tx_ring_size, 512);
        let setups = dev.queue_setups();
        assert_eq!(setups.len(), 2);
        assert_eq!(setups[0].direction, Direction::Rx);
        assert_eq!(setups[1].direction, Direction::Tx);
        assert!(setups.iter().all(|s| s.nb_desc == 512));
    }
}

#[test]
fn test_order_preserved_across_bursts() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let pool = BufferPool::create("order", 1024, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    let ports = configure_ports(&devices, &pool, &PortConfig::default()).unwrap();
    let streams = build_streams(&pair_ports(&[PortId(0), PortId(1)], false).unwrap(), 1);
    let mut fwd = Forwarder::new(LcoreId(0), &streams, &ports).unwrap();

    for i in 0..200 {
        devs[0].inject(QueueId(0), &frame(i));
    }
    fwd.run_for(10);

    let sent: Vec<u16> = devs[1]
        .drain_tx(QueueId(0), usize::MAX)
        .iter()
        .map(|f| seq(f))
        .collect();
    assert_eq!(sent, (0..200).collect::<Vec<_>>());
    assert_eq!(pool.in_use(), 0);

    let stats = fwd.stats()[0].1.snapshot();
    assert_eq!(stats.rx_packets, 200);
    assert_eq!(stats.tx_packets, 200);
    assert_eq!(stats.dropped, 0);
    assert_eq!(stats.bursts, 7);
}

#[test]
fn test_fast_free_only_when_advertised() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let pool = BufferPool::create("offload", 64, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap();
    let ports = configure_ports(&devices, &pool, &PortConfig::default()).unwrap();
    assert!(ports.iter().all(|p| !p.tx_offloads.is_empty()));
    assert!(devs[0].queue_setups()[1].offloads.bits() != 0);
}

#[test]
fn test_startup_errors() {
    let (devices, _) = virtual_ports(2, VirtualDeviceConfig::default());
    let lcores = [LcoreId(0)];

    let small_buffers = ForwarderConfig {
        data_room: 1024,
        num_mbufs: 64,
        cache_size: 0,
        ..Default::default()
    };
    let err = config::start(&devices, &small_buffers, &lcores, Arc::default())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::QueueSetup {
            port: PortId(0),
            queue: 0,
            direction: Direction::Rx,
            ..
        }
    ));

    let (devices, _) = virtual_ports(2, VirtualDeviceConfig::default());
    let mut too_many_queues = ForwarderConfig {
        num_mbufs: 64,
        cache_size: 0,
        ..Default::default()
    };
    too_many_queues.port.rx_queues = 17;
    too_many_queues.port.tx_queues = 17;
    let err = config::start(&devices, &too_many_queues, &lcores, Arc::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::DeviceConfig { port: PortId(0), .. }));

    let (devices, _) = virtual_ports(1, VirtualDeviceConfig::default());
    let err = config::start(&devices, &ForwarderConfig::default(), &lcores, Arc::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::PortCount(1)));
}

#[test]
fn test_tx_queue_setup_failure_names_queue_and_direction() {
    let failing = Arc::new(ScriptedDevice {
        fail_tx_queue: Some(1),
        ..ScriptedDevice::new(VirtualDeviceConfig::default())
    });
    let mut devices = EthDevices::new();
    devices.attach(failing.clone());
    devices.attach(Arc::new(VirtualDevice::new(VirtualDeviceConfig {
        mac: MacAddress([0x02, 0, 0, 0, 0, 1]),
        ..Default::default()
    })));

    let mut config = ForwarderConfig {
        num_mbufs: 64,
        cache_size: 0,
        ..Default::default()
    };
    config.port.rx_queues = 2;
    config.port.tx_queues = 2;
    let err = config::start(&devices, &config, &[LcoreId(0)], Arc::default())
        .err()
        .unwrap();
    assert!(matches!(
        err,
        Error::QueueSetup {
            port: PortId(0),
            queue: 1,
            direction: Direction::Tx,
            ..
        }
    ));
    // tx queue 0 went through before queue 1 failed
    let setups = failing.inner.queue_setups();
    assert_eq!(setups.len(), 3);
    assert_eq!(setups[2].direction, Direction::Tx);
    assert_eq!(setups[2].queue, 0);
    assert!(!failing.inner.is_started());
}

#[test]
fn test_port_start_failure() {
    let mut devices = EthDevices::new();
    devices.attach(Arc::new(VirtualDevice::new(VirtualDeviceConfig::default())));
    devices.attach(Arc::new(ScriptedDevice {
        fail_start: true,
        ..ScriptedDevice::new(VirtualDeviceConfig {
            mac: MacAddress([0x02, 0, 0, 0, 0, 1]),
            ..Default::default()
        })
    }));

    let config = ForwarderConfig {
        num_mbufs: 64,
        cache_size: 0,
        ..Default::default()
    };
    let err = config::start(&devices, &config, &[LcoreId(0)], Arc::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::PortStart { port: PortId(1), .. }));
}

#[test]
fn test_unequal_queue_counts_rejected() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let mut config = ForwarderConfig {
        num_mbufs: 64,
        cache_size: 0,
        ..Default::default()
    };
    config.port.rx_queues = 2;
    config.port.tx_queues = 1;
    let err = config::start(&devices, &config, &[LcoreId(0), LcoreId(1)], Arc::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::QueueCount { rx: 2, tx: 1 }));
    assert!(devs.iter().all(|dev| dev.queue_setups().is_empty()));
}

#[test]
fn test_every_rx_queue_is_polled() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let lcores: Vec<LcoreId> = lcore::available().unwrap().into_iter().take(2).collect();
    let mut config = ForwarderConfig {
        num_mbufs: 256,
        cache_size: 0,
        pool_socket: Some(SocketId::Any),
        ..Default::default()
    };
    config.port.rx_queues = 2;
    config.port.tx_queues = 2;
    let mut forwarding = config::start(&devices, &config, &lcores, Arc::default()).unwrap();
    assert_eq!(forwarding.engine.snapshot().len(), 2);

    for i in 0..10 {
        assert!(devs[0].inject(QueueId(1), &frame(i)));
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while devs[1].tx_pending(QueueId(1)).len() < 10 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(1));
    }

    forwarding.engine.stop();
    forwarding.engine.join();
    assert_eq!(devs[0].rx_pending(QueueId(1)), 0);
    assert_eq!(devs[1].tx_pending(QueueId(1)).len(), 10);
}

#[test]
fn test_no_lcores_rejected() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let config = ForwarderConfig {
        num_mbufs: 64,
        cache_size: 0,
        ..Default::default()
    };
    let err = config::start(&devices, &config, &[], Arc::default())
        .err()
        .unwrap();
    assert!(matches!(err, Error::NoLcores));
    assert!(devs.iter().all(|dev| !dev.is_started()));
}

#[test]
fn test_engine_forwards_until_stopped() {
    let (devices, devs) = virtual_ports(2, VirtualDeviceConfig::default());
    let lcores: Vec<LcoreId> = lcore::available().unwrap().into_iter().take(2).collect();
    let config = ForwarderConfig {
        num_mbufs: 1024,
        cache_size: 32,
        bidirectional: true,
        pool_socket: Some(SocketId::Any),
        ..Default::default()
    };
    let exit = Arc::new(AtomicBool::new(false));
    let mut forwarding = config::start(&devices, &config, &lcores, Arc::clone(&exit)).unwrap();
    assert!(forwarding.engine.is_running());

    const FRAMES: u16 = 500;
    for i in 0..FRAMES {
        assert!(devs[0].inject(QueueId(0), &frame(i)));
        assert!(devs[1].inject(QueueId(0), &frame(i)));
    }

    let mut delivered = [Vec::new(), Vec::new()];
    let deadline = Instant::now() + Duration::from_secs(10);
    while delivered.iter().any(|d| d.len() < FRAMES as usize) && Instant::now() < deadline {
        for (i, dev) in devs.iter().enumerate() {
            delivered[i].extend(dev.drain_tx(QueueId(0), usize::MAX).iter().map(|f| seq(f)));
        }
        thread::sleep(Duration::from_millis(1));
    }

    forwarding.engine.stop();
    let iterations = forwarding.engine.join();
    assert_eq!(iterations.len(), lcores.len());

    for d in &delivered {
        assert_eq!(*d, (0..FRAMES).collect::<Vec<_>>());
    }
    let totals = forwarding.engine.totals();
    assert_eq!(totals.rx_packets, 2 * FRAMES as u64);
    assert_eq!(totals.tx_packets, 2 * FRAMES as u64);
    assert_eq!(forwarding.pool.in_use(), 0);
    assert_eq!(devs[0].stats().opackets, FRAMES as u64);
}
