//! 轨道与步骤存储
//!
//! 每条轨道维护 帧号 -> 步骤 的映射，两种时间模式：
//! - 固定模式：所有帧共享第0帧的步骤
//! - 关键帧模式：任意帧的数据取自不大于该帧的最大关键帧（默认0）
//!
//! 非关键帧上缓存的步骤在读取时与其关键帧按值比较，不一致则被覆盖。
//! 关键帧编辑不会主动刷新这些缓存。

use crate::attachment::AttachmentRef;
use crate::error::TrackError;
use crate::geometry::DerivedField;
use crate::math::Point2;
use crate::step::{CalibrationAxes, MeasurablePoint, Step, StepChange, StepKind, StepPayload, ToolSettings};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt;

/// 轨道ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackId(pub u64);

impl TrackId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 测量轨道
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub(crate) id: TrackId,
    pub(crate) name: String,
    pub(crate) kind: StepKind,
    pub(crate) locked: bool,
    pub(crate) fixed: bool,
    pub(crate) settings: ToolSettings,
    /// 第0帧步骤，始终存在，也是固定模式下唯一的步骤
    pub(crate) origin: Step,
    /// 第0帧以外的关键帧步骤
    pub(crate) keyed: BTreeMap<usize, Step>,
    /// 非关键帧的物化副本
    pub(crate) cached: BTreeMap<usize, Step>,
}

impl Track {
    /// 以类型默认点位创建轨道（关键帧模式）
    pub fn new(id: TrackId, name: impl Into<String>, kind: StepKind) -> Self {
        let points = kind
            .initial_points()
            .into_iter()
            .map(MeasurablePoint::new)
            .collect();
        Self::from_origin(id, name, kind, Step::new(kind, 0, points))
    }

    /// 以指定的第0帧点位创建轨道
    pub fn with_points(
        id: TrackId,
        name: impl Into<String>,
        kind: StepKind,
        points: &[Point2],
    ) -> Result<Self, TrackError> {
        match kind.point_count() {
            Some(count) if points.len() != count => {
                return Err(TrackError::PointIndex {
                    track: id,
                    index: points.len(),
                    count,
                });
            }
            None if points.len() < kind.min_points() => {
                return Err(TrackError::TooFewPoints {
                    track: id,
                    minimum: kind.min_points(),
                });
            }
            _ => {}
        }
        let points = points.iter().copied().map(MeasurablePoint::new).collect();
        Ok(Self::from_origin(id, name, kind, Step::new(kind, 0, points)))
    }

    pub(crate) fn from_origin(id: TrackId, name: impl Into<String>, kind: StepKind, origin: Step) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            locked: false,
            fixed: false,
            settings: kind.default_settings(),
            origin,
            keyed: BTreeMap::new(),
            cached: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> TrackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn kind(&self) -> StepKind {
        self.kind
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    pub fn is_fixed(&self) -> bool {
        self.fixed
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.settings
    }

    /// 定长模式下卷尺的世界长度
    pub fn stick_length(&self) -> Option<f64> {
        match self.settings {
            ToolSettings::Tape { stick_length } => stick_length,
            _ => None,
        }
    }

    pub fn calibration_axes(&self) -> Option<CalibrationAxes> {
        match self.settings {
            ToolSettings::Calibration { axes } => Some(axes),
            _ => None,
        }
    }

    /// 设置卷尺定长模式，`None` 回到普通卷尺；返回设置是否变化
    pub fn set_stick_length(&mut self, length: Option<f64>) -> Result<bool, TrackError> {
        self.require_kind(StepKind::Tape)?;
        if let Some(length) = length {
            if !length.is_finite() || length <= 0.0 {
                return Err(TrackError::InvalidLength { track: self.id, length });
            }
        }
        let settings = ToolSettings::Tape { stick_length: length };
        Ok(self.replace_settings(settings))
    }

    /// 设置标定轴；返回设置是否变化
    pub fn set_calibration_axes(&mut self, axes: CalibrationAxes) -> Result<bool, TrackError> {
        self.require_kind(StepKind::Calibration)?;
        Ok(self.replace_settings(ToolSettings::Calibration { axes }))
    }

    fn require_kind(&self, expected: StepKind) -> Result<(), TrackError> {
        if self.locked {
            tracing::debug!("Rejected settings change on locked track {}", self.id);
            return Err(TrackError::Locked(self.id));
        }
        if self.kind != expected {
            return Err(TrackError::WrongKind {
                track: self.id,
                found: self.kind,
                expected,
            });
        }
        Ok(())
    }

    fn replace_settings(&mut self, settings: ToolSettings) -> bool {
        if self.settings == settings {
            return false;
        }
        tracing::debug!("Track {} settings: {:?}", self.id, settings);
        self.settings = settings;
        true
    }

    /// 有序关键帧集合，始终包含0
    pub fn keyframes(&self) -> Vec<usize> {
        std::iter::once(0).chain(self.keyed.keys().copied()).collect()
    }

    pub fn is_keyframe(&self, n: usize) -> bool {
        n == 0 || (!self.fixed && self.keyed.contains_key(&n))
    }

    /// 不大于 `n` 的最大关键帧
    pub fn governing_keyframe(&self, n: usize) -> usize {
        if self.fixed {
            return 0;
        }
        self.keyed
            .range(..=n)
            .next_back()
            .map_or(0, |(&key, _)| key)
    }

    /// 第 `n` 帧的有效数据（关键帧步骤本身，只读）
    pub fn effective_step(&self, n: usize) -> &Step {
        if self.fixed {
            return &self.origin;
        }
        self.keyed
            .range(..=n)
            .next_back()
            .map_or(&self.origin, |(_, step)| step)
    }

    /// 获取第 `n` 帧的步骤
    ///
    /// 非关键帧的步骤若与其关键帧不一致，先用关键帧的值覆盖再返回；
    /// 尚未创建的帧从关键帧复制。
    pub fn get_step(&mut self, n: usize) -> &Step {
        if self.fixed || n == 0 {
            return &self.origin;
        }
        let Track {
            origin,
            keyed,
            cached,
            ..
        } = self;
        if keyed.contains_key(&n) {
            return &keyed[&n];
        }
        let source = keyed
            .range(..n)
            .next_back()
            .map_or(&*origin, |(_, step)| step);
        match cached.entry(n) {
            Entry::Vacant(slot) => slot.insert(source.clone_at(n)),
            Entry::Occupied(slot) => {
                let step = slot.into_mut();
                if !step.same_values(source) {
                    step.copy_from(source);
                }
                step
            }
        }
    }

    /// 设置第 `n` 帧的点坐标
    ///
    /// 固定模式修改第0帧；否则把 `n` 登记为关键帧再修改。
    pub fn set_point(&mut self, n: usize, index: usize, position: Point2) -> Result<StepChange, TrackError> {
        let track = self.id;
        self.edit_step(n, |step| {
            let count = step.points.len();
            let point = step
                .points
                .get_mut(index)
                .ok_or(TrackError::PointIndex { track, index, count })?;
            if point.is_attached() {
                return Err(TrackError::PointAttached { track, index });
            }
            point.position = position;
            Ok(())
        })
    }

    /// 追加拟合圆数据点
    pub fn add_data_point(&mut self, n: usize, position: Point2) -> Result<StepChange, TrackError> {
        self.require_variable_points()?;
        self.edit_step(n, |step| {
            step.points.push(MeasurablePoint::new(position));
            Ok(())
        })
    }

    /// 移除拟合圆数据点
    pub fn remove_data_point(&mut self, n: usize, index: usize) -> Result<StepChange, TrackError> {
        self.require_variable_points()?;
        let track = self.id;
        let minimum = self.kind.min_points();
        self.edit_step(n, |step| {
            let count = step.points.len();
            if index >= count {
                return Err(TrackError::PointIndex { track, index, count });
            }
            if count <= minimum {
                return Err(TrackError::TooFewPoints { track, minimum });
            }
            step.points.remove(index);
            Ok(())
        })
    }

    /// 设置标定点的世界坐标
    pub fn set_calibration_world(&mut self, n: usize, world: [Point2; 2]) -> Result<StepChange, TrackError> {
        if self.kind != StepKind::Calibration {
            return Err(TrackError::WrongKind {
                track: self.id,
                found: self.kind,
                expected: StepKind::Calibration,
            });
        }
        self.edit_step(n, |step| {
            step.payload = StepPayload::Calibration { world: Some(world) };
            Ok(())
        })
    }

    /// 写入附着引用与解析后的坐标（附着解析器专用）
    pub(crate) fn set_attachment(
        &mut self,
        n: usize,
        index: usize,
        attachment: Option<AttachmentRef>,
        position: Point2,
    ) -> Result<StepChange, TrackError> {
        let track = self.id;
        self.edit_step(n, |step| {
            let count = step.points.len();
            let point = step
                .points
                .get_mut(index)
                .ok_or(TrackError::PointIndex { track, index, count })?;
            point.attachment = attachment;
            point.position = position;
            Ok(())
        })
    }

    /// 切换固定/关键帧模式
    ///
    /// 切换到固定模式时，所有步骤折叠为 `current_frame` 的数据，关键帧重置为 {0}。
    /// 切换到关键帧模式不改动数据。返回模式是否发生变化。
    pub fn set_fixed(&mut self, fixed: bool, current_frame: usize) -> Result<bool, TrackError> {
        if self.locked {
            tracing::debug!("Rejected mode change on locked track {}", self.id);
            return Err(TrackError::Locked(self.id));
        }
        if self.fixed == fixed {
            return Ok(false);
        }
        if fixed {
            let mut collapsed = self.effective_step(current_frame).clone_at(0);
            collapsed.refresh(self.kind);
            self.origin = collapsed;
            self.keyed.clear();
            self.cached.clear();
        }
        self.fixed = fixed;
        tracing::info!(
            "Track {} switched to {} mode",
            self.id,
            if fixed { "fixed" } else { "keyframed" }
        );
        Ok(true)
    }

    /// 删除关键帧 `n`
    ///
    /// 第0帧、非关键帧以及固定模式下都不允许。
    pub fn delete_step(&mut self, n: usize) -> Result<Step, TrackError> {
        if self.locked {
            return Err(TrackError::Locked(self.id));
        }
        let reason = if self.fixed {
            "track is in fixed mode"
        } else if n == 0 {
            "frame 0 is always a keyframe"
        } else if !self.keyed.contains_key(&n) {
            "frame is not a keyframe"
        } else {
            ""
        };
        if !reason.is_empty() {
            return Err(TrackError::InvalidKeyframe {
                track: self.id,
                frame: n,
                reason,
            });
        }
        let removed = self.keyed.remove(&n).ok_or(TrackError::InvalidKeyframe {
            track: self.id,
            frame: n,
            reason: "frame is not a keyframe",
        })?;
        tracing::debug!("Deleted keyframe {} of track {}", n, self.id);
        Ok(removed)
    }

    /// 用快照恢复单个关键帧步骤
    pub(crate) fn restore_step(&mut self, mut step: Step) {
        step.refresh(self.kind);
        step.mark_dirty();
        if self.fixed || step.frame == 0 {
            step.frame = 0;
            self.origin = step;
        } else {
            self.cached.remove(&step.frame);
            self.keyed.insert(step.frame, step);
        }
    }

    /// 移除关键帧（撤销专用，不检查锁定）
    pub(crate) fn remove_keyframe(&mut self, n: usize) -> Option<Step> {
        self.cached.remove(&n);
        self.keyed.remove(&n)
    }

    /// 把附着点的存储坐标同步为解析结果，`frame` 须为关键帧
    pub(crate) fn sync_point(&mut self, frame: usize, index: usize, position: Point2) -> bool {
        let kind = self.kind;
        let step = if self.fixed || frame == 0 {
            &mut self.origin
        } else {
            match self.keyed.get_mut(&frame) {
                Some(step) => step,
                None => return false,
            }
        };
        let Some(point) = step.points.get_mut(index) else {
            return false;
        };
        point.position = position;
        step.refresh(kind);
        step.mark_dirty();
        true
    }

    /// 取出并清除所有脏步骤的帧号
    pub fn take_dirty(&mut self) -> Vec<usize> {
        let mut frames = Vec::new();
        for step in self.steps_mut() {
            if step.dirty {
                step.dirty = false;
                frames.push(step.frame);
            }
        }
        frames.sort_unstable();
        frames
    }

    /// 重新计算所有步骤的派生几何
    pub fn refresh_all(&mut self) -> usize {
        let kind = self.kind;
        let mut refreshed = 0;
        for step in self.steps_mut() {
            if !step.refresh(kind).is_empty() {
                step.mark_dirty();
                refreshed += 1;
            }
        }
        refreshed
    }

    /// 关键帧步骤（含第0帧），按帧号排序
    pub fn keyframe_steps(&self) -> impl Iterator<Item = &Step> {
        std::iter::once(&self.origin).chain(self.keyed.values())
    }

    fn steps_mut(&mut self) -> impl Iterator<Item = &mut Step> {
        std::iter::once(&mut self.origin)
            .chain(self.keyed.values_mut())
            .chain(self.cached.values_mut())
    }

    fn require_variable_points(&self) -> Result<(), TrackError> {
        if self.kind.point_count().is_some() {
            return Err(TrackError::FixedPointCount(self.kind));
        }
        Ok(())
    }

    /// 在第 `n` 帧的有效数据副本上执行编辑，成功后写回
    ///
    /// 编辑失败时轨道不变，也不会新增关键帧。
    fn edit_step<F>(&mut self, n: usize, edit: F) -> Result<StepChange, TrackError>
    where
        F: FnOnce(&mut Step) -> Result<(), TrackError>,
    {
        if self.locked {
            tracing::debug!("Rejected edit on locked track {}", self.id);
            return Err(TrackError::Locked(self.id));
        }
        let frame = if self.fixed { 0 } else { n };
        let mut step = self.effective_step(frame).clone_at(frame);
        edit(&mut step)?;
        let invalidated: Vec<DerivedField> = step.refresh(self.kind);
        step.mark_dirty();

        let new_keyframe = frame != 0 && !self.keyed.contains_key(&frame);
        if frame == 0 {
            self.origin = step;
        } else {
            self.cached.remove(&frame);
            self.keyed.insert(frame, step);
        }
        if new_keyframe {
            tracing::debug!("Frame {} became a keyframe of track {}", frame, self.id);
        }

        Ok(StepChange {
            track: self.id,
            frame,
            new_keyframe,
            invalidated,
        })
    }
}
