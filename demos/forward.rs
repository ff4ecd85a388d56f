extern crate basicfwd;
extern crate clap;

use {
    basicfwd::{
        config::{self, ForwarderConfig},
        ethdev::{EthDev, EthDevices, MacAddress, QueueId},
        lcore::LcoreId,
        port::PortConfig,
        vdev::{VirtualDevice, VirtualDeviceConfig},
    },
    clap::Parser,
    std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    },
};

#[derive(Parser, Debug)]
#[command(author, version, about = "forward packets between port pairs", long_about = None)]
struct Opt {
    /// Kernel interface to attach as a port, repeat for more ports
    #[arg(short, long)]
    iface: Vec<String>,

    /// Use this many in-memory ports fed by a traffic generator instead
    #[arg(long, conflicts_with = "iface")]
    r#virtual: Option<u16>,

    #[arg(long, default_value_t = config::RX_RING_SIZE)]
    rx_ring_size: u16,

    #[arg(long, default_value_t = config::TX_RING_SIZE)]
    tx_ring_size: u16,

    #[arg(long, default_value_t = 1)]
    queues: u16,

    /// Pool buffers per port
    #[arg(long, default_value_t = config::NUM_MBUFS)]
    num_mbufs: usize,

    #[arg(long, default_value_t = config::MBUF_CACHE_SIZE)]
    cache_size: usize,

    /// Cpus to forward on, defaults to every cpu but the first
    #[arg(long, value_delimiter = ',')]
    lcores: Vec<u32>,

    /// Forward in both directions of each pair
    #[arg(long)]
    bidirectional: bool,

    #[arg(long)]
    no_promiscuous: bool,

    #[arg(long)]
    sched_fifo: bool,

    /// Busy-poll microseconds for AF_PACKET sockets
    #[arg(long)]
    busy_poll: Option<u32>,

    /// Seconds between counter reports, 0 to disable
    #[arg(long, default_value_t = 1)]
    stats_interval: u64,
}

fn default_lcores() -> Vec<LcoreId> {
    let mut cores: Vec<_> = core_affinity::get_core_ids()
        .unwrap_or_default()
        .into_iter()
        .map(|core| LcoreId(core.id as u32))
        .collect();
    if cores.len() > 1 {
        cores.remove(0);
    }
    cores
}

#[cfg(target_os = "linux")]
fn attach_interfaces(devices: &mut EthDevices, opt: &Opt) -> Result<(), Box<dyn std::error::Error>> {
    use basicfwd::af_packet::AfPacketDevice;

    for name in &opt.iface {
        devices.attach(Arc::new(AfPacketDevice::open(name, opt.busy_poll)?));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn attach_interfaces(_devices: &mut EthDevices, _opt: &Opt) -> Result<(), Box<dyn std::error::Error>> {
    Err("kernel interfaces are only supported on linux".into())
}

/// Feed every virtual port and drain what the forwarder sends.
fn spawn_traffic(
    devs: Vec<Arc<VirtualDevice>>,
    queues: u16,
    exit: Arc<AtomicBool>,
) -> thread::JoinHandle<(u64, u64)> {
    thread::spawn(move || {
        let (mut generated, mut delivered) = (0u64, 0u64);
        let mut frame = [0u8; 64];
        // broadcast destination so promiscuous mode does not matter
        frame[..6].fill(0xff);
        while !exit.load(Ordering::Relaxed) {
            for (i, dev) in devs.iter().enumerate() {
                frame[6..12].copy_from_slice(&dev.mac_addr().0);
                for q in 0..queues {
                    frame[12] = i as u8;
                    frame[13] = q as u8;
                    for _ in 0..32 {
                        generated += dev.inject(QueueId(q), &frame) as u64;
                    }
                    delivered += dev.drain_tx(QueueId(q), usize::MAX).len() as u64;
                }
            }
            thread::yield_now();
        }
        (generated, delivered)
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let opt = Opt::parse();

    let exit = Arc::new(AtomicBool::new(false));
    {
        let exit = Arc::clone(&exit);
        ctrlc::set_handler(move || exit.store(true, Ordering::Relaxed))?;
    }

    let mut devices = EthDevices::new();
    let mut virtual_devs = Vec::new();
    if let Some(count) = opt.r#virtual {
        for i in 0..count {
            let dev = Arc::new(VirtualDevice::new(VirtualDeviceConfig {
                name: format!("virtual{i}"),
                mac: MacAddress([0x02, 0, 0, 0, (i >> 8) as u8, i as u8]),
                ..Default::default()
            }));
            devices.attach(dev.clone());
            virtual_devs.push(dev);
        }
    } else {
        attach_interfaces(&mut devices, &opt)?;
    }

    let lcores = if opt.lcores.is_empty() {
        default_lcores()
    } else {
        opt.lcores.iter().copied().map(LcoreId).collect()
    };

    let config = ForwarderConfig {
        port: PortConfig {
            rx_ring_size: opt.rx_ring_size,
            tx_ring_size: opt.tx_ring_size,
            rx_queues: opt.queues,
            tx_queues: opt.queues,
            promiscuous: !opt.no_promiscuous,
        },
        num_mbufs: opt.num_mbufs,
        cache_size: opt.cache_size,
        bidirectional: opt.bidirectional,
        sched_fifo: opt.sched_fifo,
        ..ForwarderConfig::default()
    };

    let mut forwarding = config::start(&devices, &config, &lcores, Arc::clone(&exit))?;

    let traffic = (!virtual_devs.is_empty())
        .then(|| spawn_traffic(virtual_devs, opt.queues, Arc::clone(&exit)));

    let interval = Duration::from_secs(opt.stats_interval);
    let mut last_report = Instant::now();
    while !exit.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(100));
        if !interval.is_zero() && last_report.elapsed() >= interval {
            last_report = Instant::now();
            let totals = forwarding.engine.totals();
            log::info!(
                "rx {} tx {} dropped {} pool available {}",
                totals.rx_packets,
                totals.tx_packets,
                totals.dropped,
                forwarding.pool.available()
            );
        }
    }

    for (lcore, iterations) in forwarding.engine.join() {
        println!("lcore {lcore}: {iterations} iterations");
    }
    for (stream, c) in forwarding.engine.snapshot() {
        println!(
            "stream {stream}: rx {} tx {} dropped {} bursts {}",
            c.rx_packets, c.tx_packets, c.dropped, c.bursts
        );
    }
    for port in &forwarding.ports {
        let stats = port.dev.stats();
        println!(
            "port {}: ipackets {} opackets {} imissed {} rx_nombuf {}",
            port.id,
            stats.ipackets,
            stats.opackets,
            stats.imissed,
            stats.rx_nombuf
        );
    }
    if let Some(traffic) = traffic {
        if let Ok((generated, delivered)) = traffic.join() {
            println!("generated {generated}, delivered {delivered}");
        }
    }

    Ok(())
}
