//! Framemark 核心测量引擎
//!
//! 逐帧视频测量：在图像上标记几何步骤（卷尺、量角器、圆拟合等），
//! 通过关键帧在帧间传播，并把结果换算到世界坐标。
//!
//! # 架构设计
//!
//! - `Track`: 一条测量轨迹，保存关键帧步骤并向后续帧传播
//! - `AttachmentResolver`: 点附着到其他轨迹的点，拒绝形成环
//! - `EditHistory`: 基于快照的撤销/重做
//! - `Document`: 把以上组件组合为可编辑的测量文档
//!
//! # 示例
//!
//! ```rust
//! use framemark_core::prelude::*;
//!
//! let mut doc = Document::new();
//! let id = doc.add_track("tape", StepKind::Tape);
//! doc.move_point(id, 0, 1, Point2::new(150.0, 0.0)).unwrap();
//!
//! let m = doc.measure(id, 0).unwrap();
//! println!("Length: {:?}", m.world_length);
//! ```

pub mod attachment;
pub mod config;
pub mod coords;
pub mod deferred;
pub mod document;
pub mod error;
pub mod geometry;
pub mod history;
pub mod logging;
pub mod math;
pub mod registry;
pub mod snapshot;
pub mod step;
pub mod track;

pub use error::{Error, Result};

pub mod prelude {
    //! 常用类型的便捷导入
    pub use crate::attachment::{AttachTarget, AttachmentRef, AttachmentResolver, PointRef};
    pub use crate::config::DocumentConfig;
    pub use crate::coords::CoordSystem;
    pub use crate::document::{Document, Measurement, Scene};
    pub use crate::error::{AttachError, CoordsError, Error, HistoryError, TrackError};
    pub use crate::geometry::{fit_circle, Circle, CircleFit, Derived, DerivedField};
    pub use crate::history::{Edit, EditContext, EditHistory, EditTarget, UndoOutcome};
    pub use crate::math::{Point2, Vector2};
    pub use crate::registry::TrackRegistry;
    pub use crate::step::{CalibrationAxes, MeasurablePoint, Step, StepChange, StepKind, ToolSettings};
    pub use crate::track::{Track, TrackId};
}
