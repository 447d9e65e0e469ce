//! 核心错误定义
//!
//! 守卫类错误（锁定、关键帧操作）由调用方就地处理；
//! 附着环路与快照恢复失败需要上报给宿主界面。

use crate::step::StepKind;
use crate::track::TrackId;
use framemark_record::RecordError;
use thiserror::Error;

/// 步骤存储错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrackError {
    #[error("Track {0} is locked")]
    Locked(TrackId),

    #[error("Frame {frame} of track {track} cannot be deleted: {reason}")]
    InvalidKeyframe {
        track: TrackId,
        frame: usize,
        reason: &'static str,
    },

    #[error("Point index {index} out of range for track {track} ({count} points)")]
    PointIndex {
        track: TrackId,
        index: usize,
        count: usize,
    },

    #[error("Point {index} of track {track} is attached and cannot be set directly")]
    PointAttached { track: TrackId, index: usize },

    #[error("{0} steps have a fixed number of points")]
    FixedPointCount(StepKind),

    #[error("Track {track} needs at least {minimum} points")]
    TooFewPoints { track: TrackId, minimum: usize },

    #[error("Invalid length {length} for track {track}: must be finite and positive")]
    InvalidLength { track: TrackId, length: f64 },

    #[error("Track {track} is a {found} track, expected {expected}")]
    WrongKind {
        track: TrackId,
        found: StepKind,
        expected: StepKind,
    },
}

impl TrackError {
    /// 是否为普通的守卫拒绝（不是故障）
    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            TrackError::Locked(_) | TrackError::InvalidKeyframe { .. } | TrackError::PointAttached { .. }
        )
    }
}

/// 点附着错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttachError {
    /// 附着链回到自身轨道，或超过深度上限
    #[error("Attachment chain from track {track} through track {target} forms a cycle")]
    CycleDetected { track: TrackId, target: TrackId },

    #[error("Attachment target track {0} not found")]
    TargetNotFound(TrackId),

    #[error("Track {track} has no point {index} at frame {frame}")]
    InvalidTarget {
        track: TrackId,
        frame: usize,
        index: usize,
    },

    #[error(transparent)]
    Track(#[from] TrackError),
}

impl AttachError {
    pub fn is_cycle(&self) -> bool {
        matches!(self, AttachError::CycleDetected { .. })
    }
}

/// 坐标系错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordsError {
    #[error("Invalid scale ({scale_x}, {scale_y}): must be finite and positive")]
    InvalidScale { scale_x: f64, scale_y: f64 },

    #[error("Calibration points are coincident")]
    CoincidentPoints,
}

/// 撤销/重做错误
#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Failed to restore `{label}`: {source}")]
    RestoreFailed {
        label: String,
        #[source]
        source: RecordError,
    },
}

/// 文档配置错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config value `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// 文档级错误
#[derive(Error, Debug)]
pub enum Error {
    #[error("Track {0} not found")]
    TrackNotFound(crate::track::TrackId),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Attach(#[from] AttachError),

    #[error(transparent)]
    Coords(#[from] CoordsError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Record(#[from] RecordError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// 锁定等守卫拒绝
    pub fn is_guard(&self) -> bool {
        match self {
            Error::Track(e) => e.is_guard(),
            Error::Attach(AttachError::Track(e)) => e.is_guard(),
            _ => false,
        }
    }

    /// 附着环路
    pub fn is_cycle(&self) -> bool {
        matches!(self, Error::Attach(e) if e.is_cycle())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
