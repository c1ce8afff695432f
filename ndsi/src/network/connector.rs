use crate::error::Result;
use crate::sensor::SessionChannels;
use async_trait::async_trait;
use common::SensorIdentity;

/// 建立到传感器主机的控制/数据通道
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, identity: &SensorIdentity) -> Result<SessionChannels>;
}
