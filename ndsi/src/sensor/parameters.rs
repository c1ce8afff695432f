use crate::error::ParameterError;
use common::{ControlReply, ParameterDescriptor, ParameterUpdate, ParameterValue, ReplyStatus};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// 已发出、尚未确认的设置
#[derive(Debug, Clone, PartialEq)]
pub struct PendingValue {
    pub value: ParameterValue,
    pub request_id: u64,
    pub issued_at: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterEntry {
    /// 设备最近一次确认的值
    pub confirmed: Option<ParameterValue>,
    pub pending: Option<PendingValue>,
    pub descriptor: Option<ParameterDescriptor>,
}

impl ParameterEntry {
    /// 对外显示的值：待确认值优先，否则为已确认值
    pub fn current(&self) -> Option<&ParameterValue> {
        self.pending
            .as_ref()
            .map(|p| &p.value)
            .or(self.confirmed.as_ref())
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn is_readonly(&self) -> bool {
        self.descriptor.as_ref().map_or(false, |d| d.readonly)
    }
}

/// 回复处理结果
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyOutcome {
    Confirmed { name: String, value: ParameterValue },
    Failed(ParameterError),
    /// 与参数无关的回复（开始/停止推流等）
    Ignored,
}

/// 参数快照（由控制任务独占修改，经 watch 通道发布）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: BTreeMap<String, ParameterEntry>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&ParameterEntry> {
        self.entries.get(name)
    }

    pub fn value(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name).and_then(|e| e.current())
    }

    pub fn confirmed(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name).and_then(|e| e.confirmed.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParameterEntry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_pending()).count()
    }

    /// 本地校验：只读参数、与已知值类型不符、超出描述范围
    pub fn validate(&self, name: &str, value: &ParameterValue) -> Result<(), ParameterError> {
        let Some(entry) = self.entries.get(name) else {
            // 未知参数交给设备裁决
            return Ok(());
        };

        if entry.is_readonly() {
            return Err(ParameterError::ReadOnly(name.to_string()));
        }

        let expected = entry
            .descriptor
            .as_ref()
            .map(|d| d.kind)
            .or_else(|| entry.confirmed.as_ref().map(|v| v.kind()));
        if let Some(expected) = expected {
            if expected != value.kind() {
                return Err(ParameterError::KindMismatch {
                    name: name.to_string(),
                    expected,
                    actual: value.kind(),
                });
            }
        }

        if let Some(descriptor) = &entry.descriptor {
            if !descriptor.accepts(value) {
                return Err(ParameterError::OutOfRange {
                    name: name.to_string(),
                    value: value.to_string(),
                });
            }
        }
        Ok(())
    }

    /// 记录待确认值；覆盖之前的待确认值
    pub fn mark_pending(&mut self, name: &str, value: ParameterValue, request_id: u64, now: Instant) {
        let entry = self.entries.entry(name.to_string()).or_default();
        entry.pending = Some(PendingValue {
            value,
            request_id,
            issued_at: now,
        });
    }

    /// 设备推送的当前值（握手或主动通知）
    pub fn apply_update(&mut self, update: ParameterUpdate) {
        let entry = self.entries.entry(update.name).or_default();
        if entry
            .pending
            .as_ref()
            .map_or(false, |p| p.value == update.value)
        {
            entry.pending = None;
        }
        entry.confirmed = Some(update.value);
        if update.descriptor.is_some() {
            entry.descriptor = update.descriptor;
        }
    }

    pub fn apply_reply(&mut self, reply: &ControlReply) -> ReplyOutcome {
        let Some(name) = reply.name.clone() else {
            return ReplyOutcome::Ignored;
        };

        // 仅当回复对应最近一次请求时才清除待确认值
        let answers_pending = self
            .entries
            .get(&name)
            .and_then(|e| e.pending.as_ref())
            .map_or(false, |p| p.request_id == reply.request_id);

        match reply.status {
            ReplyStatus::Ok => {
                if answers_pending {
                    if let Some(entry) = self.entries.get_mut(&name) {
                        entry.pending = None;
                    }
                }
                match &reply.value {
                    Some(value) => {
                        self.entries.entry(name.clone()).or_default().confirmed = Some(value.clone());
                        ReplyOutcome::Confirmed {
                            name,
                            value: value.clone(),
                        }
                    }
                    None => ReplyOutcome::Ignored,
                }
            }
            ReplyStatus::Rejected => {
                if answers_pending {
                    self.drop_pending(&name);
                }
                ReplyOutcome::Failed(ParameterError::Rejected {
                    name,
                    reason: reply.reason.clone().unwrap_or_else(|| "rejected by device".to_string()),
                })
            }
            ReplyStatus::UnknownParameter => {
                if answers_pending {
                    self.drop_pending(&name);
                }
                ReplyOutcome::Failed(ParameterError::Unknown(name))
            }
        }
    }

    /// 回退超时的待确认值
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> Vec<ParameterError> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.pending
                    .as_ref()
                    .map_or(false, |p| now.saturating_duration_since(p.issued_at) >= timeout)
            })
            .map(|(name, _)| name.clone())
            .collect();

        for name in &expired {
            self.drop_pending(name);
        }
        expired.into_iter().map(ParameterError::PendingExpired).collect()
    }

    /// 清除待确认值；从未确认过的条目整体移除
    fn drop_pending(&mut self, name: &str) {
        let remove = match self.entries.get_mut(name) {
            Some(entry) => {
                entry.pending = None;
                entry.confirmed.is_none() && entry.descriptor.is_none()
            }
            None => false,
        };
        if remove {
            self.entries.remove(name);
        }
    }
}
