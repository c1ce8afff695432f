use common::{ParameterDescriptor, ParameterKind, ParameterUpdate, ParameterValue};
use std::collections::BTreeMap;

/// 设置失败的原因
#[derive(Debug, Clone, PartialEq)]
pub enum SetError {
    Unknown,
    Rejected(String),
}

/// 模拟传感器的参数表
#[derive(Debug, Clone)]
pub struct ParameterStore {
    entries: BTreeMap<String, (ParameterValue, ParameterDescriptor)>,
}

impl ParameterStore {
    /// 一台普通摄像头的参数
    pub fn camera() -> Self {
        let mut store = Self {
            entries: BTreeMap::new(),
        };

        let mut exposure = ParameterDescriptor::new("Absolute Exposure Time", ParameterKind::Number);
        exposure.min = Some(1.0);
        exposure.max = Some(500.0);
        exposure.step = Some(1.0);
        store.define("exposure_time", ParameterValue::Number(63.0), exposure);

        let mut gain = ParameterDescriptor::new("Gain", ParameterKind::Number);
        gain.min = Some(0.0);
        gain.max = Some(100.0);
        store.define("gain", ParameterValue::Number(0.0), gain);

        let mut mode = ParameterDescriptor::new("Auto Exposure Mode", ParameterKind::Enum);
        mode.options = vec!["manual".to_string(), "aperture_priority".to_string()];
        store.define("auto_exposure_mode", ParameterValue::Enum("aperture_priority".to_string()), mode);

        store.define(
            "backlight_compensation",
            ParameterValue::Bool(false),
            ParameterDescriptor::new("Backlight Compensation", ParameterKind::Bool),
        );

        let mut temperature = ParameterDescriptor::new("Sensor Temperature", ParameterKind::Number);
        temperature.readonly = true;
        store.define("sensor_temperature", ParameterValue::Number(36.0), temperature);

        store
    }

    fn define(&mut self, name: &str, value: ParameterValue, mut descriptor: ParameterDescriptor) {
        descriptor.default = Some(value.clone());
        self.entries.insert(name.to_string(), (value, descriptor));
    }

    pub fn get(&self, name: &str) -> Option<&ParameterValue> {
        self.entries.get(name).map(|(value, _)| value)
    }

    /// 全部参数（含描述），握手与GetAll使用
    pub fn updates(&self) -> Vec<ParameterUpdate> {
        self.entries
            .iter()
            .map(|(name, (value, descriptor))| ParameterUpdate {
                name: name.clone(),
                value: value.clone(),
                descriptor: Some(descriptor.clone()),
            })
            .collect()
    }

    pub fn update(&self, name: &str) -> Option<ParameterUpdate> {
        self.entries.get(name).map(|(value, _)| ParameterUpdate {
            name: name.to_string(),
            value: value.clone(),
            descriptor: None,
        })
    }

    /// 设置成功返回生效值（数值按步长取整）
    pub fn set(&mut self, name: &str, value: ParameterValue) -> Result<ParameterValue, SetError> {
        let (current, descriptor) = self.entries.get_mut(name).ok_or(SetError::Unknown)?;
        if descriptor.readonly {
            return Err(SetError::Rejected(format!("{} is read-only", name)));
        }
        if !descriptor.accepts(&value) {
            return Err(SetError::Rejected(format!("{} does not accept {}", name, value)));
        }

        let applied = match (value, descriptor.step) {
            (ParameterValue::Number(v), Some(step)) if step > 0.0 => ParameterValue::Number((v / step).round() * step),
            (value, _) => value,
        };
        *current = applied.clone();
        Ok(applied)
    }

    /// 内部更新（不受只读限制）
    pub fn report(&mut self, name: &str, value: ParameterValue) {
        if let Some((current, _)) = self.entries.get_mut(name) {
            *current = value;
        }
    }

    pub fn reset(&mut self) {
        for (value, descriptor) in self.entries.values_mut() {
            if let Some(default) = &descriptor.default {
                *value = default.clone();
            }
        }
    }
}
