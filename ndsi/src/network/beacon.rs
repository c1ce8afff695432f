// UDP信标发现：设备周期性广播JSON信标，超过静默时长未出现的传感器视为离开

use super::discovery::{Discovery, DiscoveryEvent, SensorRegistry};
use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use common::{Beacon, SensorIdentity};
use futures::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 64 * 1024;

pub struct BeaconDiscovery {
    registry: SensorRegistry,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    listener: Option<JoinHandle<()>>,
}

impl BeaconDiscovery {
    pub async fn bind(config: &DiscoveryConfig) -> Result<Self> {
        let address = format!("{}:{}", config.bind_address, config.beacon_port);
        let socket = UdpSocket::bind(&address)
            .await
            .map_err(|e| Error::Config(format!("cannot bind beacon listener on {}: {}", address, e)))?;
        let local_addr = socket.local_addr()?;

        let registry = SensorRegistry::new(config.event_capacity);
        let cancel = CancellationToken::new();
        let listener = tokio::spawn(listen(socket, registry.clone(), config.expiry, cancel.clone()));

        info!("📡 Listening for sensor beacons on {}", local_addr);
        Ok(Self {
            registry,
            local_addr,
            cancel,
            listener: Some(listener),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 停止监听；已发出的订阅流保持打开但不再有新事件
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
    }
}

impl Drop for BeaconDiscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Discovery for BeaconDiscovery {
    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent> {
        self.registry.subscribe()
    }

    fn known(&self) -> Vec<SensorIdentity> {
        self.registry.known()
    }
}

/// 监听任务独占的时效表
struct Liveness {
    last_seen: HashMap<String, Instant>,
    /// host_id -> 该主机最近一次信标中的传感器
    hosts: HashMap<String, HashSet<String>>,
}

impl Liveness {
    fn new() -> Self {
        Self {
            last_seen: HashMap::new(),
            hosts: HashMap::new(),
        }
    }

    fn observe(&mut self, registry: &SensorRegistry, beacon: &Beacon, source: SocketAddr, now: Instant) {
        let previous = self.hosts.remove(&beacon.host_id).unwrap_or_default();

        if beacon.leaving {
            debug!("Host {} is leaving", beacon.host_id);
            for sensor_id in previous.iter().chain(beacon.sensors.iter().map(|s| &s.id)) {
                self.last_seen.remove(sensor_id);
                registry.withdraw(sensor_id);
            }
            return;
        }

        let mut current = HashSet::new();
        for identity in beacon.identities(source.ip()) {
            self.last_seen.insert(identity.sensor_id.clone(), now);
            current.insert(identity.sensor_id.clone());
            registry.announce(identity);
        }

        // 主机不再列出的传感器
        for sensor_id in previous.difference(&current) {
            self.last_seen.remove(sensor_id);
            registry.withdraw(sensor_id);
        }
        self.hosts.insert(beacon.host_id.clone(), current);
    }

    fn expire(&mut self, registry: &SensorRegistry, now: Instant, expiry: Duration) {
        let silent: Vec<String> = self
            .last_seen
            .iter()
            .filter(|(_, seen)| now.saturating_duration_since(**seen) > expiry)
            .map(|(id, _)| id.clone())
            .collect();

        for sensor_id in silent {
            debug!("Sensor {} silent for more than {:?}", sensor_id, expiry);
            self.last_seen.remove(&sensor_id);
            for sensors in self.hosts.values_mut() {
                sensors.remove(&sensor_id);
            }
            registry.withdraw(&sensor_id);
        }
    }
}

async fn listen(socket: UdpSocket, registry: SensorRegistry, expiry: Duration, cancel: CancellationToken) {
    let mut buffer = vec![0u8; MAX_DATAGRAM];
    let mut liveness = Liveness::new();
    let mut sweep = tokio::time::interval((expiry / 2).max(Duration::from_millis(10)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, source)) => match Beacon::decode(&buffer[..len]) {
                    Ok(beacon) => liveness.observe(&registry, &beacon, source, Instant::now()),
                    Err(e) => debug!("Ignoring invalid beacon from {}: {}", source, e),
                },
                Err(e) => warn!("Beacon socket error: {}", e),
            },
            _ = sweep.tick() => liveness.expire(&registry, Instant::now(), expiry),
        }
    }

    debug!("Beacon listener stopped");
}
