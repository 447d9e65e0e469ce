//! 文档配置

use crate::attachment::DEFAULT_MAX_DEPTH;
use crate::error::ConfigError;
use crate::history::DEFAULT_CAPACITY;
use serde::{Deserialize, Serialize};

/// 卷尺长度下限
pub const DEFAULT_TAPE_MIN_LENGTH: f64 = 1e-30;

/// 文档配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    /// 撤销历史容量
    pub history_capacity: usize,

    /// 附着链深度上限
    pub max_attachment_depth: usize,

    /// 卷尺长度下限（世界单位）
    pub tape_min_length: f64,
}

impl Default for DocumentConfig {
    fn default() -> Self {
        Self {
            history_capacity: DEFAULT_CAPACITY,
            max_attachment_depth: DEFAULT_MAX_DEPTH,
            tape_min_length: DEFAULT_TAPE_MIN_LENGTH,
        }
    }
}

impl DocumentConfig {
    /// 从JSON读取，缺失字段取默认值
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: DocumentConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.history_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "history_capacity",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_attachment_depth == 0 {
            return Err(ConfigError::Invalid {
                field: "max_attachment_depth",
                reason: "must be at least 1".to_string(),
            });
        }
        if !(self.tape_min_length.is_finite() && self.tape_min_length > 0.0) {
            return Err(ConfigError::Invalid {
                field: "tape_min_length",
                reason: format!("{} is not a positive number", self.tape_min_length),
            });
        }
        Ok(())
    }
}
