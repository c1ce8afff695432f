//! 网络门面：发现传感器并建立会话，每个传感器最多一个活动会话

mod beacon;
mod connector;
mod discovery;
mod quic;

pub use beacon::BeaconDiscovery;
pub use connector::Connector;
pub use discovery::{Discovery, DiscoveryEvent, SensorRegistry, StaticDiscovery};
pub use quic::QuicConnector;

use crate::config::NdsiConfig;
use crate::error::{ConnectionError, Error, Result};
use crate::sensor::SensorSession;
use common::SensorIdentity;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;
use std::sync::Arc;
use tracing::{info, warn};

/// 会话表中的占位：连接建立期间即占用，防止并发重复连接
enum SessionSlot {
    Connecting,
    Live(SensorSession),
}

/// 连接期间的占位；未提交就被丢弃时移除
struct ConnectingSlot<'a> {
    sessions: &'a DashMap<String, SessionSlot>,
    sensor_id: &'a str,
    committed: bool,
}

impl Drop for ConnectingSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.sessions
                .remove_if(self.sensor_id, |_, slot| matches!(slot, SessionSlot::Connecting));
        }
    }
}

#[derive(Clone)]
pub struct Network {
    discovery: Arc<dyn Discovery>,
    connector: Arc<dyn Connector>,
    config: NdsiConfig,
    sessions: Arc<DashMap<String, SessionSlot>>,
}

impl Network {
    pub fn new(discovery: Arc<dyn Discovery>, connector: Arc<dyn Connector>, config: NdsiConfig) -> Self {
        Self {
            discovery,
            connector,
            config,
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// 信标发现 + QUIC连接
    pub async fn with_defaults(config: NdsiConfig) -> Result<Self> {
        config.validate()?;
        let discovery = BeaconDiscovery::bind(&config.discovery).await?;
        let connector = QuicConnector::new(&config.transport)?;
        Ok(Self::new(Arc::new(discovery), Arc::new(connector), config))
    }

    pub fn config(&self) -> &NdsiConfig {
        &self.config
    }

    /// 发现事件流：先重放已知传感器，再输出实时事件
    pub fn discover(&self) -> BoxStream<'static, DiscoveryEvent> {
        self.discovery.subscribe()
    }

    pub fn known_sensors(&self) -> Vec<SensorIdentity> {
        self.discovery.known()
    }

    /// 连接传感器并完成握手
    pub async fn attach(&self, identity: &SensorIdentity) -> Result<SensorSession> {
        let sensor_id = identity.sensor_id.clone();

        match self.sessions.entry(sensor_id.clone()) {
            Entry::Occupied(mut occupied) => {
                // 已关闭的旧会话可以被替换
                let stale = matches!(occupied.get(), SessionSlot::Live(session) if session.state().is_closed());
                if !stale {
                    return Err(Error::AlreadyAttached(sensor_id));
                }
                occupied.insert(SessionSlot::Connecting);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(SessionSlot::Connecting);
            }
        }

        // 调用方放弃等待（超时、select!、任务中止）时同样释放占位
        let mut slot = ConnectingSlot {
            sessions: &self.sessions,
            sensor_id: &sensor_id,
            committed: false,
        };

        info!("Attaching to {}", identity);
        match self.open_session(identity).await {
            Ok(session) => {
                self.sessions.insert(sensor_id.clone(), SessionSlot::Live(session.clone()));
                slot.committed = true;
                Ok(session)
            }
            Err(e) => {
                warn!("Attach to {} failed: {}", identity, e);
                Err(e)
            }
        }
    }

    async fn open_session(&self, identity: &SensorIdentity) -> Result<SensorSession> {
        let limit = self.config.transport.connect_timeout;
        let channels = tokio::time::timeout(limit, self.connector.connect(identity))
            .await
            .map_err(|_| ConnectionError::Timeout(limit))??;
        SensorSession::connect(identity.clone(), channels, self.config.clone()).await
    }

    pub fn session(&self, sensor_id: &str) -> Option<SensorSession> {
        match self.sessions.get(sensor_id)?.value() {
            SessionSlot::Live(session) if !session.state().is_closed() => Some(session.clone()),
            _ => None,
        }
    }

    /// 未关闭的会话
    pub fn sessions(&self) -> Vec<SensorSession> {
        self.sessions
            .iter()
            .filter_map(|entry| match entry.value() {
                SessionSlot::Live(session) if !session.state().is_closed() => Some(session.clone()),
                _ => None,
            })
            .collect()
    }

    /// 关闭并移除一个会话
    pub async fn detach(&self, sensor_id: &str) -> Result<()> {
        let removed = self
            .sessions
            .remove_if(sensor_id, |_, slot| matches!(slot, SessionSlot::Live(_)));
        match removed {
            Some((_, SessionSlot::Live(session))) => session.close().await,
            _ => Err(Error::SessionClosed),
        }
    }

    /// 关闭全部会话
    pub async fn shutdown(&self) {
        let sessions: Vec<SensorSession> = self
            .sessions
            .iter()
            .filter_map(|entry| match entry.value() {
                SessionSlot::Live(session) => Some(session.clone()),
                SessionSlot::Connecting => None,
            })
            .collect();
        self.sessions.retain(|_, slot| matches!(slot, SessionSlot::Connecting));

        info!("Shutting down {} session(s)", sessions.len());
        for session in sessions {
            let _ = session.close().await;
        }
    }
}
