use crate::error::{ProtocolError, Result};
use crate::types::{Capability, SensorIdentity};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

pub const BEACON_VERSION: u32 = 1;

/// 默认信标端口
pub const DEFAULT_BEACON_PORT: u16 = 5670;

/// 主机广播的发现信标（UDP，JSON）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub version: u32,
    /// 主机实例ID
    pub host_id: String,
    /// QUIC端点端口（地址取UDP源地址）
    pub port: u16,
    pub sensors: Vec<BeaconSensor>,
    /// 主机下线通知
    #[serde(default)]
    pub leaving: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeaconSensor {
    pub id: String,
    pub name: String,
    pub capabilities: Vec<Capability>,
}

impl Beacon {
    pub fn new(host_id: impl Into<String>, port: u16, sensors: Vec<BeaconSensor>) -> Self {
        Self {
            version: BEACON_VERSION,
            host_id: host_id.into(),
            port,
            sensors,
            leaving: false,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self> {
        let beacon: Beacon = serde_json::from_slice(datagram)?;
        if beacon.version != BEACON_VERSION {
            return Err(ProtocolError::UnsupportedVersion(beacon.version));
        }
        Ok(beacon)
    }

    /// 将信标展开为传感器身份（主机地址 = 信标源IP + 端口）
    pub fn identities(&self, source: IpAddr) -> Vec<SensorIdentity> {
        let address = SocketAddr::new(source, self.port);
        self.sensors
            .iter()
            .map(|s| SensorIdentity::new(address, s.id.clone(), s.name.clone(), s.capabilities.clone()))
            .collect()
    }
}
