// 周期性发送发现信标；停止时发送一次离开信标
use crate::config::SimulatorConfig;
use anyhow::{Context, Result};
use common::{Beacon, BeaconSensor, Capability};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BeaconAnnouncer {
    socket: UdpSocket,
    target: SocketAddr,
    interval: Duration,
    beacon: Beacon,
}

impl BeaconAnnouncer {
    /// `port` 为QUIC端点端口，控制器以信标源IP + 该端口连接
    pub async fn bind(config: &SimulatorConfig, port: u16) -> Result<Self> {
        let target: SocketAddr = config
            .beacon_target
            .parse()
            .with_context(|| format!("invalid beacon target {}", config.beacon_target))?;

        let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind).await?;
        socket.set_broadcast(true)?;

        let sensors = config
            .sensors
            .iter()
            .map(|sensor| BeaconSensor {
                id: sensor.id.clone(),
                name: sensor.name.clone(),
                capabilities: vec![Capability::Video],
            })
            .collect();

        Ok(Self {
            socket,
            target,
            interval: config.beacon_interval(),
            beacon: Beacon::new(config.host_id.clone(), port, sensors),
        })
    }

    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        info!("📡 Announcing {} sensor(s) to {}", self.beacon.sensors.len(), self.target);
        let datagram = self.beacon.encode()?;
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.socket.send_to(&datagram, self.target).await {
                        warn!("Beacon send failed: {}", e);
                    } else {
                        debug!("Beacon sent to {}", self.target);
                    }
                }
            }
        }

        let mut leaving = self.beacon.clone();
        leaving.leaving = true;
        self.socket.send_to(&leaving.encode()?, self.target).await?;
        info!("Beacon announcer stopped");
        Ok(())
    }
}
