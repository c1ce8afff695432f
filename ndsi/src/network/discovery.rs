use common::SensorIdentity;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

/// 发现事件
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryEvent {
    Appeared(SensorIdentity),
    Disappeared { sensor_id: String },
}

impl DiscoveryEvent {
    pub fn sensor_id(&self) -> &str {
        match self {
            DiscoveryEvent::Appeared(identity) => &identity.sensor_id,
            DiscoveryEvent::Disappeared { sensor_id } => sensor_id,
        }
    }
}

/// 发现后端：给出可连接的传感器地址
pub trait Discovery: Send + Sync {
    /// 先重放当前已知的传感器，再持续输出新事件；可多次订阅
    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent>;

    fn known(&self) -> Vec<SensorIdentity>;
}

/// 已知传感器表（发现后端共用）
#[derive(Clone)]
pub struct SensorRegistry {
    sensors: Arc<DashMap<String, SensorIdentity>>,
    events: broadcast::Sender<DiscoveryEvent>,
}

impl SensorRegistry {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            sensors: Arc::new(DashMap::new()),
            events,
        }
    }

    /// 新传感器或信息有变化时返回 true 并发出 `Appeared`
    pub fn announce(&self, identity: SensorIdentity) -> bool {
        let previous = self.sensors.insert(identity.sensor_id.clone(), identity.clone());
        if previous.as_ref() == Some(&identity) {
            return false;
        }

        info!("📡 Sensor appeared: {}", identity);
        let _ = self.events.send(DiscoveryEvent::Appeared(identity));
        true
    }

    pub fn withdraw(&self, sensor_id: &str) -> Option<SensorIdentity> {
        let (_, identity) = self.sensors.remove(sensor_id)?;
        info!("Sensor disappeared: {}", identity);
        let _ = self.events.send(DiscoveryEvent::Disappeared {
            sensor_id: sensor_id.to_string(),
        });
        Some(identity)
    }

    pub fn get(&self, sensor_id: &str) -> Option<SensorIdentity> {
        self.sensors.get(sensor_id).map(|entry| entry.value().clone())
    }

    pub fn known(&self) -> Vec<SensorIdentity> {
        let mut known: Vec<SensorIdentity> = self.sensors.iter().map(|entry| entry.value().clone()).collect();
        known.sort_by(|a, b| a.sensor_id.cmp(&b.sensor_id));
        known
    }

    pub fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent> {
        // 先订阅再取快照，重放与实时事件之间不会遗漏
        let live = BroadcastStream::new(self.events.subscribe());
        let replay = self.known().into_iter().map(DiscoveryEvent::Appeared);
        debug!("New discovery subscription, replaying {} sensors", replay.len());

        stream::iter(replay)
            .chain(live.filter_map(|event| async move {
                match event {
                    Ok(event) => Some(event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!("Discovery subscriber lagged, {} events missed", missed);
                        None
                    }
                }
            }))
            .boxed()
    }
}

/// 进程内的静态发现：由调用方宣告与撤回
#[derive(Clone)]
pub struct StaticDiscovery {
    registry: SensorRegistry,
}

impl StaticDiscovery {
    pub fn new() -> Self {
        Self {
            registry: SensorRegistry::new(64),
        }
    }

    pub fn with_sensors(sensors: impl IntoIterator<Item = SensorIdentity>) -> Self {
        let discovery = Self::new();
        for identity in sensors {
            discovery.announce(identity);
        }
        discovery
    }

    pub fn announce(&self, identity: SensorIdentity) -> bool {
        self.registry.announce(identity)
    }

    pub fn withdraw(&self, sensor_id: &str) -> Option<SensorIdentity> {
        self.registry.withdraw(sensor_id)
    }
}

impl Default for StaticDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

impl Discovery for StaticDiscovery {
    fn subscribe(&self) -> BoxStream<'static, DiscoveryEvent> {
        self.registry.subscribe()
    }

    fn known(&self) -> Vec<SensorIdentity> {
        self.registry.known()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Capability;

    fn identity(id: &str) -> SensorIdentity {
        SensorIdentity::new("127.0.0.1:9000".parse().unwrap(), id, "Camera", vec![Capability::Video])
    }

    #[tokio::test]
    async fn test_subscribe_replays_known_then_live() {
        let discovery = StaticDiscovery::with_sensors([identity("cam-a")]);
        let mut events = discovery.subscribe();

        assert_eq!(events.next().await, Some(DiscoveryEvent::Appeared(identity("cam-a"))));

        discovery.announce(identity("cam-b"));
        discovery.withdraw("cam-a");
        assert_eq!(events.next().await, Some(DiscoveryEvent::Appeared(identity("cam-b"))));
        assert_eq!(
            events.next().await,
            Some(DiscoveryEvent::Disappeared {
                sensor_id: "cam-a".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_restartable_subscription() {
        let discovery = StaticDiscovery::new();
        discovery.announce(identity("cam-a"));
        drop(discovery.subscribe());

        let mut again = discovery.subscribe();
        assert_eq!(again.next().await.map(|e| e.sensor_id().to_string()), Some("cam-a".to_string()));
    }

    #[test]
    fn test_duplicate_announce_is_silent() {
        let discovery = StaticDiscovery::new();
        assert!(discovery.announce(identity("cam-a")));
        assert!(!discovery.announce(identity("cam-a")));
        assert_eq!(discovery.known().len(), 1);
        assert!(discovery.withdraw("cam-x").is_none());
    }
}
