use serde::{Deserialize, Serialize};
use std::fmt;

/// 会话状态
///
/// Connecting → Active → {Suspended, Closed}；Suspended → {Active, Closed}；Closed 为终态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    /// 握手进行中
    Connecting,
    /// 数据分片送入解码器（以及录像器）
    Active,
    /// 丢弃数据分片，控制通道仍可用
    Suspended,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Active)
                | (Connecting, Closed)
                | (Active, Suspended)
                | (Active, Closed)
                | (Suspended, Active)
                | (Suspended, Closed)
        )
    }

    pub fn is_closed(self) -> bool {
        self == SessionState::Closed
    }

    /// 握手已完成且未关闭
    pub fn is_open(self) -> bool {
        matches!(self, SessionState::Active | SessionState::Suspended)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Suspended => "suspended",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}
