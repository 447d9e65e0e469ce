//! 步骤：轨道在某一帧上的几何数据
//!
//! 所有测量工具共用同一个 `Step` 结构，按 `StepKind` 区分点的布局和派生几何。

use crate::attachment::AttachmentRef;
use crate::geometry::{self, Derived, DerivedField, RefreshFn};
use crate::math::Point2;
use crate::track::TrackId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 测量工具类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepKind {
    /// 标定点对
    Calibration,
    /// 圆规（圆周上三点）
    Compass,
    /// 拟合圆（任意数量的数据点）
    CircleFit,
    /// 量角器（顶点 + 两臂端点）
    Protractor,
    /// 卷尺
    Tape,
    /// 矢量（尾 + 头）
    Vector,
}

impl StepKind {
    pub const ALL: [StepKind; 6] = [
        StepKind::Calibration,
        StepKind::Compass,
        StepKind::CircleFit,
        StepKind::Protractor,
        StepKind::Tape,
        StepKind::Vector,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Calibration => "calibration",
            StepKind::Compass => "compass",
            StepKind::CircleFit => "circle_fit",
            StepKind::Protractor => "protractor",
            StepKind::Tape => "tape",
            StepKind::Vector => "vector",
        }
    }

    /// 固定点数；拟合圆的数据点数可变（至少2个），返回 `None`
    pub fn point_count(&self) -> Option<usize> {
        match self {
            StepKind::Calibration | StepKind::Tape | StepKind::Vector => Some(2),
            StepKind::Compass | StepKind::Protractor => Some(3),
            StepKind::CircleFit => None,
        }
    }

    /// 新建轨道时第0帧的默认点位（图像坐标）
    pub fn initial_points(&self) -> Vec<Point2> {
        match self {
            StepKind::Calibration | StepKind::Tape | StepKind::Vector => {
                vec![Point2::new(0.0, 0.0), Point2::new(100.0, 0.0)]
            }
            StepKind::Compass | StepKind::CircleFit => vec![
                Point2::new(-50.0, 0.0),
                Point2::new(0.0, -50.0),
                Point2::new(50.0, 0.0),
            ],
            StepKind::Protractor => vec![
                Point2::new(0.0, 0.0),
                Point2::new(100.0, 0.0),
                Point2::new(0.0, -100.0),
            ],
        }
    }

    /// 最少点数
    pub fn min_points(&self) -> usize {
        self.point_count().unwrap_or(2)
    }

    /// 派生几何刷新函数
    pub fn refresh_fn(&self) -> RefreshFn {
        match self {
            StepKind::Calibration | StepKind::Tape | StepKind::Vector => geometry::refresh_segment,
            StepKind::Compass | StepKind::CircleFit => geometry::refresh_circle,
            StepKind::Protractor => geometry::refresh_angle,
        }
    }

    /// 该类型步骤的默认附加数据
    pub fn default_payload(&self) -> StepPayload {
        match self {
            StepKind::Calibration => StepPayload::Calibration { world: None },
            _ => StepPayload::None,
        }
    }

    /// 该类型轨道的默认工具设置
    pub fn default_settings(&self) -> ToolSettings {
        match self {
            StepKind::Tape => ToolSettings::Tape { stick_length: None },
            StepKind::Calibration => ToolSettings::Calibration {
                axes: CalibrationAxes::Both,
            },
            _ => ToolSettings::None,
        }
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| format!("unknown step kind `{s}`"))
    }
}

/// 可测量点
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeasurablePoint {
    /// 存储坐标；附着时为最近一次解析出的位置
    pub position: Point2,
    pub attachment: Option<AttachmentRef>,
}

impl MeasurablePoint {
    pub fn new(position: Point2) -> Self {
        Self {
            position,
            attachment: None,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.is_some()
    }
}

/// 各类步骤的附加数据
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StepPayload {
    None,
    /// 标定点对应的世界坐标
    Calibration { world: Option<[Point2; 2]> },
}

/// 标定使用的坐标轴
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CalibrationAxes {
    /// 比例尺、角度与原点全部由两点决定
    #[default]
    Both,
    /// 只标定x方向，保持当前角度
    X,
    /// 只标定y方向，保持当前角度
    Y,
}

impl CalibrationAxes {
    pub const ALL: [CalibrationAxes; 3] = [CalibrationAxes::Both, CalibrationAxes::X, CalibrationAxes::Y];

    pub fn name(&self) -> &'static str {
        match self {
            CalibrationAxes::Both => "xy",
            CalibrationAxes::X => "x",
            CalibrationAxes::Y => "y",
        }
    }
}

impl fmt::Display for CalibrationAxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CalibrationAxes {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CalibrationAxes::ALL
            .into_iter()
            .find(|a| a.name() == s)
            .ok_or_else(|| format!("unknown calibration axes `{s}`"))
    }
}

/// 轨道级的工具设置，对所有帧生效
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ToolSettings {
    None,
    /// 卷尺；`stick_length` 非空时为定长模式：世界长度不变，拖动端点改变比例尺
    Tape { stick_length: Option<f64> },
    Calibration { axes: CalibrationAxes },
}

/// 步骤
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub(crate) frame: usize,
    pub(crate) points: Vec<MeasurablePoint>,
    pub(crate) payload: StepPayload,
    pub(crate) derived: Derived,
    pub(crate) dirty: bool,
}

impl Step {
    /// 按类型创建步骤并计算派生几何
    pub fn new(kind: StepKind, frame: usize, points: Vec<MeasurablePoint>) -> Self {
        let mut step = Self {
            frame,
            points,
            payload: kind.default_payload(),
            derived: Derived::None,
            dirty: true,
        };
        step.refresh(kind);
        step
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    pub fn points(&self) -> &[MeasurablePoint] {
        &self.points
    }

    pub fn point(&self, index: usize) -> Option<&MeasurablePoint> {
        self.points.get(index)
    }

    /// 所有存储坐标
    pub fn positions(&self) -> Vec<Point2> {
        self.points.iter().map(|p| p.position).collect()
    }

    pub fn payload(&self) -> &StepPayload {
        &self.payload
    }

    pub fn derived(&self) -> &Derived {
        &self.derived
    }

    /// 渲染缓存是否需要重绘
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// 是否有附着点
    pub fn has_attachments(&self) -> bool {
        self.points.iter().any(MeasurablePoint::is_attached)
    }

    /// 按值比较点和附加数据（不比较帧号、缓存与脏标记）
    pub fn same_values(&self, other: &Step) -> bool {
        self.points == other.points && self.payload == other.payload
    }

    /// 从另一步骤复制数据，保持本步骤的帧号
    pub(crate) fn copy_from(&mut self, other: &Step) {
        self.points.clone_from(&other.points);
        self.payload = other.payload;
        self.derived = other.derived;
        self.dirty = true;
    }

    /// 复制为另一帧的步骤
    pub(crate) fn clone_at(&self, frame: usize) -> Step {
        Step {
            frame,
            points: self.points.clone(),
            payload: self.payload,
            derived: self.derived,
            dirty: true,
        }
    }

    /// 重新计算派生几何，返回失效的字段
    pub(crate) fn refresh(&mut self, kind: StepKind) -> Vec<DerivedField> {
        let derived = (kind.refresh_fn())(&self.positions());
        if derived == self.derived {
            return Vec::new();
        }
        let mut invalidated: Vec<DerivedField> = self.derived.fields().to_vec();
        for field in derived.fields() {
            if !invalidated.contains(field) {
                invalidated.push(*field);
            }
        }
        self.derived = derived;
        invalidated
    }
}

/// 步骤变更通知，由宿主轮询消费
#[derive(Debug, Clone, PartialEq)]
pub struct StepChange {
    pub track: TrackId,
    /// 实际被修改的帧（固定模式下为0）
    pub frame: usize,
    /// 本次修改是否新建了关键帧
    pub new_keyframe: bool,
    /// 失效的派生字段
    pub invalidated: Vec<DerivedField>,
}
