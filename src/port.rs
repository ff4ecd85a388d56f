//! Port bring-up.
//!
//! A port goes through a fixed sequence exactly once: capability query,
//! device configure, ring size adjustment, queue setup, start, promiscuous
//! mode. Any step that fails aborts the whole bring-up.

use {
    crate::{
        error::{Direction, Error, Result},
        ethdev::{EthConf, EthDev, EthDevices, MacAddress, PortId, QueueId, TxOffloads},
        mempool::BufferPool,
        numa::SocketId,
    },
    std::sync::Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortConfig {
    pub rx_ring_size: u16,
    pub tx_ring_size: u16,
    pub rx_queues: u16,
    pub tx_queues: u16,
    pub promiscuous: bool,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            rx_ring_size: 1024,
            tx_ring_size: 1024,
            rx_queues: 1,
            tx_queues: 1,
            promiscuous: true,
        }
    }
}

/// A configured and started port.
#[derive(Clone)]
pub struct Port {
    pub id: PortId,
    pub dev: Arc<dyn EthDev>,
    pub socket_id: SocketId,
    pub rx_queues: u16,
    pub tx_queues: u16,
    /// Ring sizes after adjustment to the device limits.
    pub rx_ring_size: u16,
    pub tx_ring_size: u16,
    pub tx_offloads: TxOffloads,
    pub promiscuous: bool,
    pub mac: MacAddress,
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.id)
            .field("socket_id", &self.socket_id)
            .field("rx_queues", &self.rx_queues)
            .field("tx_queues", &self.tx_queues)
            .field("rx_ring_size", &self.rx_ring_size)
            .field("tx_ring_size", &self.tx_ring_size)
            .field("tx_offloads", &self.tx_offloads)
            .field("promiscuous", &self.promiscuous)
            .field("mac", &self.mac)
            .finish()
    }
}

pub fn configure_port(
    devices: &EthDevices,
    port: PortId,
    pool: &Arc<BufferPool>,
    config: &PortConfig,
) -> Result<Port> {
    let dev = devices.get(port).ok_or(Error::InvalidPort(port))?;
    let dev = Arc::clone(dev);

    let info = dev.info();
    let socket_id = dev.socket_id();

    let mut conf = EthConf::default();
    if info.tx_offload_capa.contains(TxOffloads::MBUF_FAST_FREE) {
        conf.tx_offloads |= TxOffloads::MBUF_FAST_FREE;
    }

    dev.configure(config.rx_queues, config.tx_queues, &conf)
        .map_err(|source| Error::DeviceConfig { port, source })?;

    let mut nb_rxd = config.rx_ring_size;
    let mut nb_txd = config.tx_ring_size;
    dev.adjust_nb_rx_tx_desc(&mut nb_rxd, &mut nb_txd)
        .map_err(|source| Error::DeviceConfig { port, source })?;
    if (nb_rxd, nb_txd) != (config.rx_ring_size, config.tx_ring_size) {
        log::info!(
            "port {port}: ring sizes adjusted from {}/{} to {nb_rxd}/{nb_txd}",
            config.rx_ring_size,
            config.tx_ring_size
        );
    }

    for q in 0..config.rx_queues {
        dev.rx_queue_setup(QueueId(q), nb_rxd, socket_id, pool)
            .map_err(|source| Error::QueueSetup {
                port,
                queue: q,
                direction: Direction::Rx,
                source,
            })?;
    }

    let mut txconf = info.default_txconf;
    txconf.offloads = conf.tx_offloads;
    for q in 0..config.tx_queues {
        dev.tx_queue_setup(QueueId(q), nb_txd, socket_id, &txconf)
            .map_err(|source| Error::QueueSetup {
                port,
                queue: q,
                direction: Direction::Tx,
                source,
            })?;
    }

    dev.start()
        .map_err(|source| Error::PortStart { port, source })?;

    let mac = dev.mac_addr();
    log::info!("port {port} mac: {mac}");

    let promiscuous = config.promiscuous
        && match dev.promiscuous_enable() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("port {port}: failed to enable promiscuous mode: {e}");
                false
            }
        };

    log::debug!(
        "port {port} started: driver {}, socket {socket_id}, {} rx / {} tx queues, offloads {:#x}",
        info.driver_name,
        config.rx_queues,
        config.tx_queues,
        conf.tx_offloads.bits()
    );

    Ok(Port {
        id: port,
        dev,
        socket_id,
        rx_queues: config.rx_queues,
        tx_queues: config.tx_queues,
        rx_ring_size: nb_rxd,
        tx_ring_size: nb_txd,
        tx_offloads: conf.tx_offloads,
        promiscuous,
        mac,
    })
}

/// Bring up every attached port in id order.
pub fn configure_ports(
    devices: &EthDevices,
    pool: &Arc<BufferPool>,
    config: &PortConfig,
) -> Result<Vec<Port>> {
    devices
        .port_ids()
        .map(|port| configure_port(devices, port, pool, config))
        .collect()
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ethdev::DescLimits,
            mempool::MBUF_DEFAULT_BUF_SIZE,
            vdev::{VirtualDevice, VirtualDeviceConfig},
        },
    };

    fn pool() -> Arc<BufferPool> {
        BufferPool::create("port_test", 256, 0, MBUF_DEFAULT_BUF_SIZE, SocketId::Any).unwrap()
    }

    fn devices(config: VirtualDeviceConfig) -> (EthDevices, Arc<VirtualDevice>) {
        let dev = Arc::new(VirtualDevice::new(config));
        let mut devices = EthDevices::new();
        devices.attach(dev.clone());
        (devices, dev)
    }

    #[test]
    fn test_configure_port_defaults() {
        let (devices, dev) = devices(VirtualDeviceConfig::default());
        let port = configure_port(&devices, PortId(0), &pool(), &PortConfig::default()).unwrap();
        assert_eq!(port.rx_ring_size, 1024);
        assert_eq!(port.tx_ring_size, 1024);
        assert!(port.promiscuous);
        assert!(dev.promiscuous());
        assert!(dev.is_started());
        assert_eq!(port.tx_offloads, TxOffloads::MBUF_FAST_FREE);
        assert_eq!(dev.eth_conf().tx_offloads, TxOffloads::MBUF_FAST_FREE);
    }

    #[test]
    fn test_unknown_port() {
        let (devices, _) = devices(VirtualDeviceConfig::default());
        let err = configure_port(&devices, PortId(3), &pool(), &PortConfig::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidPort(PortId(3))));
    }

    #[test]
    fn test_no_fast_free_when_not_advertised() {
        let (devices, dev) = devices(VirtualDeviceConfig {
            tx_offload_capa: TxOffloads::NONE,
            ..Default::default()
        });
        let port = configure_port(&devices, PortId(0), &pool(), &PortConfig::default()).unwrap();
        assert!(port.tx_offloads.is_empty());
        assert!(dev
            .queue_setups()
            .iter()
            .all(|setup| setup.offloads.is_empty()));
    }

    #[test]
    fn test_rings_adjusted_to_limits() {
        let lim = DescLimits {
            nb_max: 512,
            nb_min: 64,
            nb_align: 32,
        };
        let (devices, dev) = devices(VirtualDeviceConfig {
            rx_desc_lim: lim,
            tx_desc_lim: lim,
            ..Default::default()
        });
        let port = configure_port(&devices, PortId(0), &pool(), &PortConfig::default()).unwrap();
        assert_eq!((port.rx_ring_size, port.tx_ring_size), (512, 512));
        assert!(dev.queue_setups().iter().all(|setup| setup.nb_desc == 512));
    }

    #[test]
    fn test_promiscuous_disabled_by_config() {
        let (devices, dev) = devices(VirtualDeviceConfig::default());
        let config = PortConfig {
            promiscuous: false,
            ..Default::default()
        };
        let port = configure_port(&devices, PortId(0), &pool(), &config).unwrap();
        assert!(!port.promiscuous);
        assert!(!dev.promiscuous());
    }

    #[test]
    fn test_configure_ports_in_order() {
        let mut devices = EthDevices::new();
        for i in 0..4u8 {
            devices.attach(Arc::new(VirtualDevice::new(VirtualDeviceConfig {
                name: format!("virtual{i}"),
                mac: MacAddress([0x02, 0, 0, 0, 0, i]),
                ..Default::default()
            })));
        }
        let ports = configure_ports(&devices, &pool(), &PortConfig::default()).unwrap();
        let ids: Vec<_> = ports.iter().map(|p| p.id).collect();
        assert_eq!(ids, [PortId(0), PortId(1), PortId(2), PortId(3)]);
        assert_eq!(ports[2].mac, MacAddress([0x02, 0, 0, 0, 0, 2]));
    }
}
