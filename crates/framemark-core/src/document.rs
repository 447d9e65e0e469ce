//! 测量文档
//!
//! 一个视频对应一个 `Document`，持有轨道注册表、坐标系、编辑历史与附着解析器。
//! 带有撤销支持的操作在这里包装：先快照，再修改，成功后登记编辑。

use crate::attachment::{AttachmentRef, AttachmentResolver, PointRef};
use crate::config::DocumentConfig;
use crate::coords::CoordSystem;
use crate::deferred::RefreshLater;
use crate::error::{CoordsError, Error, Result, TrackError};
use crate::geometry::{self, Circle, Derived};
use crate::history::{Edit, EditContext, EditHistory, EditTarget, UndoOutcome};
use crate::math::{normalize_angle, Point2, Vector2};
use crate::registry::TrackRegistry;
use crate::snapshot::{step_slot_from_record, step_slot_record};
use crate::step::{CalibrationAxes, Step, StepChange, StepKind};
use crate::track::{Track, TrackId};
use framemark_record::{Record, RecordError, Snapshot};

/// 编辑历史作用的数据：轨道与坐标系
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub(crate) tracks: TrackRegistry,
    pub(crate) coords: CoordSystem,
}

impl Scene {
    pub fn tracks(&self) -> &TrackRegistry {
        &self.tracks
    }

    pub fn coords(&self) -> &CoordSystem {
        &self.coords
    }
}

impl EditContext for Scene {
    fn capture(&self, target: &EditTarget) -> Option<Record> {
        match *target {
            EditTarget::Track(id) => self.tracks.get(id).map(Snapshot::to_record),
            EditTarget::Step { track, frame } => {
                self.tracks.get(track).map(|t| step_slot_record(t, frame))
            }
            EditTarget::Coords => Some(self.coords.to_record()),
        }
    }

    fn restore(&mut self, target: &EditTarget, record: &Record) -> std::result::Result<bool, RecordError> {
        match *target {
            EditTarget::Track(id) => {
                let Some(track) = self.tracks.get_mut(id) else {
                    return Ok(false);
                };
                if record.u64("id")? != id.0 {
                    return Err(record.invalid("id", format!("record does not belong to track {id}")));
                }
                track.apply_record(record)?;
            }
            EditTarget::Step { track, frame } => {
                let Some(track) = self.tracks.get_mut(track) else {
                    return Ok(false);
                };
                let (slot_frame, step) = step_slot_from_record(record, track)?;
                if slot_frame != frame {
                    return Err(record.invalid("frame", format!("expected frame {frame}")));
                }
                match step {
                    Some(step) => track.restore_step(step),
                    None => {
                        track.remove_keyframe(frame);
                    }
                }
            }
            EditTarget::Coords => self.coords.apply_record(record)?,
        }
        Ok(true)
    }

    fn insert_tracks(&mut self, records: &[Record]) -> std::result::Result<(), RecordError> {
        let tracks = records
            .iter()
            .map(Track::from_record)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for track in tracks {
            tracing::info!("Restored track {} `{}`", track.id(), track.name());
            self.tracks.insert(track);
        }
        Ok(())
    }

    fn remove_tracks(&mut self, ids: &[TrackId]) -> usize {
        ids.iter()
            .filter(|&&id| self.tracks.remove(id).is_some())
            .count()
    }
}

/// 某帧的测量结果（基于附着解析后的坐标）
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub track: TrackId,
    pub frame: usize,
    pub kind: StepKind,
    /// 解析后的图像坐标
    pub points: Vec<Point2>,
    /// 图像坐标下的派生几何
    pub derived: Derived,
    /// 线段的世界长度
    pub world_length: Option<f64>,
    /// 线段方向角或量角器夹角（世界坐标）
    pub world_angle: Option<f64>,
    /// 世界坐标下的圆
    pub world_circle: Option<Circle>,
    /// 矢量的世界分量
    pub components: Option<Vector2>,
}

/// 测量文档
#[derive(Debug, Clone)]
pub struct Document {
    scene: Scene,
    history: EditHistory,
    resolver: AttachmentResolver,
    refresh: RefreshLater,
    config: DocumentConfig,
}

impl Default for Document {
    fn default() -> Self {
        Self::build(DocumentConfig::default())
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用自定义配置创建文档
    pub fn with_config(config: DocumentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: DocumentConfig) -> Self {
        Self {
            scene: Scene::default(),
            history: EditHistory::new(config.history_capacity),
            resolver: AttachmentResolver::new(config.max_attachment_depth),
            refresh: RefreshLater::new(),
            config,
        }
    }

    pub fn config(&self) -> &DocumentConfig {
        &self.config
    }

    pub fn scene(&self) -> &Scene {
        &self.scene
    }

    pub fn tracks(&self) -> &TrackRegistry {
        &self.scene.tracks
    }

    pub fn coords(&self) -> &CoordSystem {
        &self.scene.coords
    }

    pub fn history(&self) -> &EditHistory {
        &self.history
    }

    pub fn resolver(&self) -> &AttachmentResolver {
        &self.resolver
    }

    // === 轨道管理 ===

    pub fn add_track(&mut self, name: impl Into<String>, kind: StepKind) -> TrackId {
        let id = self.scene.tracks.add(name, kind);
        tracing::info!("Added {} track {}", kind, id);
        id
    }

    pub fn add_track_with_points(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        points: &[Point2],
    ) -> Result<TrackId> {
        let id = self.scene.tracks.add_with_points(name, kind, points)?;
        tracing::info!("Added {} track {}", kind, id);
        Ok(id)
    }

    /// 按轨道自身的ID登记
    pub fn insert_track(&mut self, track: Track) -> Option<Track> {
        self.scene.tracks.insert(track)
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.scene.tracks.get(id)
    }

    /// 直接修改轨道，不登记编辑
    pub fn track_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.scene.tracks.get_mut(id)
    }

    pub fn find_track(&self, name: &str) -> Option<TrackId> {
        self.scene.tracks.find_by_name(name)
    }

    fn get(&self, id: TrackId) -> Result<&Track> {
        self.scene.tracks.get(id).ok_or(Error::TrackNotFound(id))
    }

    fn get_mut(&mut self, id: TrackId) -> Result<&mut Track> {
        self.scene.tracks.get_mut(id).ok_or(Error::TrackNotFound(id))
    }

    fn require_kind(&self, id: TrackId, expected: StepKind) -> Result<&Track> {
        let track = self.get(id)?;
        if track.kind() != expected {
            return Err(TrackError::WrongKind {
                track: id,
                found: track.kind(),
                expected,
            }
            .into());
        }
        Ok(track)
    }

    /// 第 `frame` 帧的步骤（按需与关键帧同步）
    pub fn step(&mut self, id: TrackId, frame: usize) -> Result<&Step> {
        Ok(self.get_mut(id)?.get_step(frame))
    }

    pub fn set_locked(&mut self, id: TrackId, locked: bool) -> Result<()> {
        self.get_mut(id)?.set_locked(locked);
        Ok(())
    }

    // === 编辑历史 ===

    /// 捕获目标当前状态，作为编辑前快照
    pub fn snapshot(&self, target: &EditTarget) -> Result<Record> {
        match *target {
            EditTarget::Coords => Ok(self.scene.coords.to_record()),
            EditTarget::Track(id) | EditTarget::Step { track: id, .. } => {
                self.scene.capture(target).ok_or(Error::TrackNotFound(id))
            }
        }
    }

    /// 登记已完成的修改
    pub fn post_edit(&mut self, label: impl Into<String>, target: EditTarget, before: Record) {
        self.history.post_edit(label, target, before);
    }

    /// 登记复合修改，撤销和重做都先应用 `first`
    pub fn post_compound_edit(&mut self, label: impl Into<String>, first: Edit, second: Edit) {
        self.history.post_compound_edit(label, first, second);
    }

    pub fn undo(&mut self) -> Result<UndoOutcome> {
        let outcome = self.history.undo(&mut self.scene)?;
        if matches!(outcome, UndoOutcome::Applied(_)) {
            self.refresh.schedule();
        }
        Ok(outcome)
    }

    pub fn redo(&mut self) -> Result<UndoOutcome> {
        let outcome = self.history.redo(&mut self.scene)?;
        if matches!(outcome, UndoOutcome::Applied(_)) {
            self.refresh.schedule();
        }
        Ok(outcome)
    }

    /// 固定模式下所有编辑都落在第0帧
    fn edit_frame(&self, id: TrackId, frame: usize) -> Result<usize> {
        Ok(if self.get(id)?.is_fixed() { 0 } else { frame })
    }

    /// 以步骤槽位为目标包装一次修改
    fn step_edit<T, F>(&mut self, label: &str, id: TrackId, frame: usize, op: F) -> Result<T>
    where
        F: FnOnce(&mut Scene, &AttachmentResolver) -> Result<T>,
    {
        let target = EditTarget::Step {
            track: id,
            frame: self.edit_frame(id, frame)?,
        };
        let before = self.snapshot(&target)?;
        let out = op(&mut self.scene, &self.resolver)?;
        self.history.post_edit(label, target, before);
        self.refresh.schedule();
        Ok(out)
    }

    // === 点编辑 ===

    /// 设置点坐标，不登记编辑（调用方自行快照和登记）
    pub fn set_point(&mut self, id: TrackId, frame: usize, index: usize, position: Point2) -> Result<StepChange> {
        Ok(self.get_mut(id)?.set_point(frame, index, position)?)
    }

    /// 移动点并登记编辑
    ///
    /// 定长卷尺的端点移动后缩放坐标系，保持世界长度不变。
    pub fn move_point(&mut self, id: TrackId, frame: usize, index: usize, position: Point2) -> Result<StepChange> {
        if let Some(stick) = self.get(id)?.stick_length() {
            return self.move_stick_end(id, frame, index, position, stick);
        }
        let change = self.step_edit("Move point", id, frame, |scene, _| {
            track_in(scene, id)?
                .set_point(frame, index, position)
                .map_err(Error::from)
        })?;
        let dependents = self.resolver.dependents(&self.scene.tracks, id);
        if !dependents.is_empty() {
            tracing::debug!("Track {} moved, {} dependent tracks stale", id, dependents.len());
        }
        Ok(change)
    }

    fn move_stick_end(
        &mut self,
        id: TrackId,
        frame: usize,
        index: usize,
        position: Point2,
        stick: f64,
    ) -> Result<StepChange> {
        let step_target = EditTarget::Step {
            track: id,
            frame: self.edit_frame(id, frame)?,
        };
        let step_before = self.snapshot(&step_target)?;
        let coords_before = self.scene.coords.to_record();
        let change = self.get_mut(id)?.set_point(frame, index, position)?;

        match self.resolver.resolved_points(&self.scene.tracks, id, frame) {
            Ok(points) => {
                if let [p0, p1, ..] = points.as_slice() {
                    let factor = stick / self.scene.coords.world_length(p0, p1);
                    if factor != 0.0 && factor != 1.0 && factor.is_finite() {
                        let (sx, sy) = self.scene.coords.scale();
                        if let Err(e) = self.scene.coords.set_scale(sx * factor, sy * factor) {
                            tracing::warn!("Cannot rescale for stick {}: {}", id, e);
                        }
                    }
                }
            }
            Err(e) => tracing::warn!("Cannot resolve stick {}: {}", id, e),
        }

        self.history.post_compound_edit(
            "Move point",
            Edit::new(step_target, step_before),
            Edit::new(EditTarget::Coords, coords_before),
        );
        self.refresh.schedule();
        Ok(change)
    }

    /// 为拟合圆追加数据点
    pub fn add_data_point(&mut self, id: TrackId, frame: usize, position: Point2) -> Result<StepChange> {
        self.step_edit("Add data point", id, frame, |scene, _| {
            track_in(scene, id)?
                .add_data_point(frame, position)
                .map_err(Error::from)
        })
    }

    /// 移除拟合圆数据点
    pub fn remove_data_point(&mut self, id: TrackId, frame: usize, index: usize) -> Result<StepChange> {
        self.step_edit("Remove data point", id, frame, |scene, _| {
            track_in(scene, id)?
                .remove_data_point(frame, index)
                .map_err(Error::from)
        })
    }

    /// 删除关键帧
    pub fn delete_step(&mut self, id: TrackId, frame: usize) -> Result<Step> {
        self.step_edit("Delete step", id, frame, |scene, _| {
            track_in(scene, id)?.delete_step(frame).map_err(Error::from)
        })
    }

    /// 切换固定/关键帧模式，返回模式是否变化
    pub fn set_fixed(&mut self, id: TrackId, fixed: bool, current_frame: usize) -> Result<bool> {
        let target = EditTarget::Track(id);
        let before = self.snapshot(&target)?;
        let changed = self.get_mut(id)?.set_fixed(fixed, current_frame)?;
        if changed {
            let label = if fixed { "Fix track" } else { "Keyframe track" };
            self.history.post_edit(label, target, before);
            self.refresh.schedule();
        }
        Ok(changed)
    }

    /// 切换卷尺的定长模式，返回模式是否变化
    ///
    /// 进入定长模式时以第 `frame` 帧的当前世界长度为定长。
    pub fn set_stick_mode(&mut self, id: TrackId, frame: usize, stick: bool) -> Result<bool> {
        let track = self.require_kind(id, StepKind::Tape)?;
        if track.stick_length().is_some() == stick {
            return Ok(false);
        }
        let length = if stick {
            let current = self.measure(id, frame)?.world_length.unwrap_or(0.0);
            Some(current.max(self.config.tape_min_length))
        } else {
            None
        };

        let target = EditTarget::Track(id);
        let before = self.snapshot(&target)?;
        let changed = self.get_mut(id)?.set_stick_length(length)?;
        if changed {
            let label = if stick { "Stick mode" } else { "Tape mode" };
            self.history.post_edit(label, target, before);
            tracing::info!("Track {} {}", id, label.to_lowercase());
        }
        Ok(changed)
    }

    /// 设置标定轴，返回是否变化
    pub fn set_calibration_axes(&mut self, id: TrackId, axes: CalibrationAxes) -> Result<bool> {
        self.require_kind(id, StepKind::Calibration)?;
        let target = EditTarget::Track(id);
        let before = self.snapshot(&target)?;
        let changed = self.get_mut(id)?.set_calibration_axes(axes)?;
        if changed {
            self.history.post_edit("Calibration axes", target, before);
        }
        Ok(changed)
    }

    // === 附着 ===

    pub fn attach(&mut self, point: PointRef, target: AttachmentRef) -> Result<StepChange> {
        self.step_edit("Attach point", point.track, point.frame, |scene, resolver| {
            Ok(resolver.attach(&mut scene.tracks, point, target)?)
        })
    }

    /// 解除附着；点未附着时返回 `Ok(None)` 且不登记编辑
    pub fn detach(&mut self, point: PointRef) -> Result<Option<StepChange>> {
        let target = EditTarget::Step {
            track: point.track,
            frame: self.edit_frame(point.track, point.frame)?,
        };
        let before = self.snapshot(&target)?;
        let change = self.resolver.detach(&mut self.scene.tracks, point)?;
        if change.is_some() {
            self.history.post_edit("Detach point", target, before);
        }
        Ok(change)
    }

    pub fn resolve(&self, point: PointRef) -> Result<Point2> {
        Ok(self.resolver.resolve(&self.scene.tracks, point)?)
    }

    /// 直接或间接附着在 `id` 上的轨道
    pub fn dependents(&self, id: TrackId) -> Vec<TrackId> {
        self.resolver.dependents(&self.scene.tracks, id)
    }

    // === 删除 ===

    /// 删除轨道并登记编辑
    pub fn delete_track(&mut self, id: TrackId) -> Result<Track> {
        let track = self.get(id)?;
        if track.is_locked() {
            tracing::debug!("Rejected delete of locked track {}", id);
            return Err(TrackError::Locked(id).into());
        }
        let record = track.to_record();
        let removed = self.scene.tracks.remove(id).ok_or(Error::TrackNotFound(id))?;
        self.history
            .post_track_delete(format!("Delete {}", removed.name()), vec![id], vec![record]);
        tracing::info!("Deleted track {} `{}`", id, removed.name());
        self.refresh.schedule();
        Ok(removed)
    }

    /// 删除所有轨道，作为一次编辑登记；返回删除数量
    pub fn clear_tracks(&mut self) -> usize {
        let ids = self.scene.tracks.ids();
        if ids.is_empty() {
            return 0;
        }
        let records = self.scene.tracks.iter().map(Snapshot::to_record).collect();
        let removed = self.scene.tracks.clear().len();
        self.history.post_track_delete("Clear tracks", ids, records);
        tracing::info!("Cleared {} tracks", removed);
        removed
    }

    // === 测量 ===

    /// 计算某帧的测量结果
    pub fn measure(&self, id: TrackId, frame: usize) -> Result<Measurement> {
        let kind = self.get(id)?.kind();
        let points = self.resolver.resolved_points(&self.scene.tracks, id, frame)?;
        let derived = (kind.refresh_fn())(&points);
        let coords = &self.scene.coords;

        let mut measurement = Measurement {
            track: id,
            frame,
            kind,
            points,
            derived,
            world_length: None,
            world_angle: None,
            world_circle: None,
            components: None,
        };

        match kind {
            StepKind::Calibration | StepKind::Tape | StepKind::Vector => {
                if let [p0, p1, ..] = measurement.points.as_slice() {
                    measurement.world_length = Some(coords.world_length(p0, p1));
                    measurement.world_angle = coords.world_angle(p0, p1);
                    if kind == StepKind::Vector {
                        measurement.components = Some(coords.world_vector(p0, p1));
                    }
                }
            }
            StepKind::Protractor => {
                if let [vertex, end1, end2, ..] = measurement.points.as_slice() {
                    measurement.world_angle = geometry::arm_angle(
                        &coords.image_to_world(vertex),
                        &coords.image_to_world(end1),
                        &coords.image_to_world(end2),
                    );
                }
            }
            StepKind::Compass | StepKind::CircleFit => {
                if let Some(circle) = derived.circle_fit().and_then(|fit| fit.circle()) {
                    let (sx, sy) = coords.scale();
                    measurement.world_circle = Some(Circle::new(
                        coords.image_to_world(&circle.center),
                        circle.radius * (sx * sy).sqrt(),
                    ));
                }
            }
        }
        Ok(measurement)
    }

    /// 设置卷尺的世界长度，通过缩放坐标系实现
    ///
    /// 取长度的绝对值，且不低于配置的下限。缩放因子为0、1、无穷大或NaN时不做任何修改，
    /// 返回 `Ok(false)`。定长卷尺同时更新定长，登记为复合编辑：先轨道，后坐标系。
    pub fn set_tape_length(&mut self, id: TrackId, frame: usize, length: f64) -> Result<bool> {
        let track = self.require_kind(id, StepKind::Tape)?;
        if track.is_locked() {
            tracing::debug!("Rejected tape length on locked track {}", id);
            return Err(TrackError::Locked(id).into());
        }
        let stick = track.stick_length().is_some();
        if length.is_nan() {
            return Ok(false);
        }
        let length = length.abs().max(self.config.tape_min_length);

        let points = self.resolver.resolved_points(&self.scene.tracks, id, frame)?;
        let [p0, p1, ..] = points.as_slice() else {
            return Ok(false);
        };
        let current = self.scene.coords.world_length(p0, p1);
        let factor = length / current;
        if factor == 0.0 || factor == 1.0 || !factor.is_finite() {
            tracing::debug!("Ignored tape length {} (factor {})", length, factor);
            return Ok(false);
        }

        let mut coords = self.scene.coords;
        let (sx, sy) = coords.scale();
        coords.set_scale(sx * factor, sy * factor)?;

        let coords_before = self.scene.coords.to_record();
        if stick {
            let target = EditTarget::Track(id);
            let track_before = self.snapshot(&target)?;
            self.get_mut(id)?.set_stick_length(Some(length))?;
            self.scene.coords = coords;
            self.history.post_compound_edit(
                "Set tape length",
                Edit::new(target, track_before),
                Edit::new(EditTarget::Coords, coords_before),
            );
        } else {
            self.scene.coords = coords;
            self.history.post_edit("Set tape length", EditTarget::Coords, coords_before);
        }
        self.refresh.schedule();
        Ok(true)
    }

    /// 设置量角器夹角（世界坐标，弧度），绕顶点旋转臂2并保持臂长
    ///
    /// 臂长为零时夹角无定义，返回 `Ok(None)`。
    pub fn set_protractor_angle(&mut self, id: TrackId, frame: usize, theta: f64) -> Result<Option<StepChange>> {
        self.require_kind(id, StepKind::Protractor)?;
        let points = self.resolver.resolved_points(&self.scene.tracks, id, frame)?;
        let [vertex, end1, end2, ..] = points.as_slice() else {
            return Ok(None);
        };

        let coords = self.scene.coords;
        let vertex = coords.image_to_world(vertex);
        let end2 = coords.image_to_world(end2);
        let Some(arm1) = geometry::line_angle(&vertex, &coords.image_to_world(end1)) else {
            return Ok(None);
        };
        if geometry::line_angle(&vertex, &end2).is_none() {
            return Ok(None);
        }
        let rotated = geometry::rotate_arm(&vertex, &end2, normalize_angle(arm1 + theta));
        let position = coords.world_to_image(&rotated);

        let change = self.step_edit("Set angle", id, frame, |scene, _| {
            track_in(scene, id)?
                .set_point(frame, 2, position)
                .map_err(Error::from)
        })?;
        Ok(Some(change))
    }

    /// 用标定点对设定坐标系
    ///
    /// 两轴标定由两个标定点的图像位移和世界位移决定比例尺与角度；单轴标定保持当前角度，
    /// 只用该轴的位移，另一轴的世界坐标改写为标定后的实际值。原点使第一个点落在其世界坐标上。
    /// 登记为复合编辑：先坐标系，后轨道。
    pub fn calibrate(&mut self, id: TrackId, frame: usize, world: [Point2; 2]) -> Result<()> {
        let axes = self
            .require_kind(id, StepKind::Calibration)?
            .calibration_axes()
            .unwrap_or_default();
        let points = self.resolver.resolved_points(&self.scene.tracks, id, frame)?;
        let [p0, p1, ..] = points.as_slice() else {
            return Err(CoordsError::CoincidentPoints.into());
        };
        let (coords, world) = match axes {
            CalibrationAxes::Both => (calibrate_both(p0, p1, &world)?, world),
            CalibrationAxes::X | CalibrationAxes::Y => calibrate_axis(&self.scene.coords, axes, p0, p1, &world)?,
        };

        let step_target = EditTarget::Step {
            track: id,
            frame: self.edit_frame(id, frame)?,
        };
        let coords_before = self.scene.coords.to_record();
        let step_before = self.snapshot(&step_target)?;

        self.get_mut(id)?.set_calibration_world(frame, world)?;
        self.scene.coords = coords;
        self.history.post_compound_edit(
            "Calibrate",
            Edit::new(EditTarget::Coords, coords_before),
            Edit::new(step_target, step_before),
        );
        tracing::info!("Calibrated coordinates from track {} ({}): scale {:?}", id, axes, coords.scale());
        self.refresh.schedule();
        Ok(())
    }

    // === 刷新 ===

    /// 请求在本周期结束时刷新
    pub fn request_refresh(&mut self) {
        self.refresh.schedule();
    }

    /// 事件周期结束：同步附着点的存储坐标并重算派生几何
    ///
    /// 返回更新的点数；本周期没有刷新请求时什么也不做。
    pub fn end_of_cycle(&mut self) -> usize {
        if !self.refresh.take() {
            return 0;
        }

        let mut updates = Vec::new();
        for track in self.scene.tracks.iter() {
            for step in track.keyframe_steps() {
                for (index, point) in step.points().iter().enumerate() {
                    if !point.is_attached() {
                        continue;
                    }
                    let at = PointRef::new(track.id(), step.frame(), index);
                    match self.resolver.resolve(&self.scene.tracks, at) {
                        Ok(position) if position != point.position => updates.push((at, position)),
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Cannot resolve point {} of track {}: {}", index, track.id(), e),
                    }
                }
            }
        }

        let mut synced = 0;
        for (at, position) in updates {
            if let Some(track) = self.scene.tracks.get_mut(at.track) {
                if track.sync_point(at.frame, at.index, position) {
                    synced += 1;
                }
            }
        }
        for track in self.scene.tracks.iter_mut() {
            track.refresh_all();
        }
        synced
    }
}

/// 两轴标定
fn calibrate_both(p0: &Point2, p1: &Point2, world: &[Point2; 2]) -> Result<CoordSystem> {
    // 图像位移换成y轴向上
    let image = Vector2::new(p1.x - p0.x, p0.y - p1.y);
    let delta = world[1] - world[0];
    if image.norm_squared() == 0.0 || delta.norm_squared() == 0.0 {
        return Err(CoordsError::CoincidentPoints.into());
    }

    let scale = delta.norm() / image.norm();
    let mut coords = CoordSystem::new();
    coords.set_scale(scale, scale)?;
    coords.set_angle(image.y.atan2(image.x) - delta.y.atan2(delta.x));
    place_origin(&mut coords, p0, &world[0]);
    Ok(coords)
}

/// 单轴标定，返回新坐标系和改写后的世界坐标
fn calibrate_axis(
    current: &CoordSystem,
    axes: CalibrationAxes,
    p0: &Point2,
    p1: &Point2,
    world: &[Point2; 2],
) -> Result<(CoordSystem, [Point2; 2])> {
    // 比例尺为1时的世界位移即沿当前坐标轴的像素位移
    let mut unit = *current;
    unit.set_scale(1.0, 1.0)?;
    let pixels = unit.world_vector(p0, p1);
    let along_x = axes == CalibrationAxes::X;
    let (image_delta, world_delta) = if along_x {
        (pixels.x, world[1].x - world[0].x)
    } else {
        (pixels.y, world[1].y - world[0].y)
    };
    let factor = world_delta / image_delta;
    if factor == 0.0 || !factor.is_finite() {
        return Err(CoordsError::CoincidentPoints.into());
    }

    let mut coords = *current;
    coords.set_scale(factor.abs(), factor.abs())?;
    if factor < 0.0 {
        coords.set_angle(current.angle() + std::f64::consts::PI);
    }
    // 原点只沿标定轴移动
    let at = coords.image_to_world(p0);
    let anchor = if along_x {
        Point2::new(world[0].x, at.y)
    } else {
        Point2::new(at.x, world[0].y)
    };
    place_origin(&mut coords, p0, &anchor);

    let w0 = coords.image_to_world(p0);
    let w1 = coords.image_to_world(p1);
    let world = if along_x {
        [Point2::new(world[0].x, w0.y), Point2::new(world[1].x, w1.y)]
    } else {
        [Point2::new(w0.x, world[0].y), Point2::new(w1.x, world[1].y)]
    };
    Ok((coords, world))
}

/// 移动原点，使图像点 `image` 对应世界点 `world`
fn place_origin(coords: &mut CoordSystem, image: &Point2, world: &Point2) {
    coords.set_origin(Point2::origin());
    let offset = coords.world_to_image(world) - Point2::origin();
    coords.set_origin(*image - offset);
}

fn track_in(scene: &mut Scene, id: TrackId) -> Result<&mut Track> {
    scene.tracks.get_mut(id).ok_or(Error::TrackNotFound(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    fn tape_doc() -> (Document, TrackId) {
        let mut doc = Document::new();
        let id = doc
            .add_track_with_points(
                "tape",
                StepKind::Tape,
                &[Point2::new(0.0, 0.0), Point2::new(10.0, 0.0)],
            )
            .unwrap();
        (doc, id)
    }

    #[test]
    fn test_move_point_undo_redo() {
        let (mut doc, id) = tape_doc();
        doc.move_point(id, 5, 1, Point2::new(20.0, 0.0)).unwrap();
        assert_eq!(doc.track(id).unwrap().keyframes(), vec![0, 5]);

        assert_eq!(doc.undo().unwrap(), UndoOutcome::Applied("Move point".into()));
        assert_eq!(doc.track(id).unwrap().keyframes(), vec![0]);
        assert_eq!(doc.step(id, 7).unwrap().points()[1].position.x, 10.0);

        doc.redo().unwrap();
        assert_eq!(doc.track(id).unwrap().keyframes(), vec![0, 5]);
        assert_eq!(doc.step(id, 7).unwrap().points()[1].position.x, 20.0);
    }

    #[test]
    fn test_guard_failure_posts_nothing() {
        let (mut doc, id) = tape_doc();
        doc.set_locked(id, true).unwrap();
        let err = doc.move_point(id, 0, 0, Point2::new(1.0, 1.0)).unwrap_err();
        assert!(err.is_guard());
        assert!(!doc.history().can_undo());
        assert!(doc.delete_track(id).unwrap_err().is_guard());
    }

    #[test]
    fn test_set_fixed_undo_restores_keyframes() {
        let (mut doc, id) = tape_doc();
        doc.move_point(id, 3, 0, Point2::new(1.0, 0.0)).unwrap();
        doc.move_point(id, 8, 0, Point2::new(2.0, 0.0)).unwrap();
        assert!(doc.set_fixed(id, true, 5).unwrap());
        assert_eq!(doc.track(id).unwrap().keyframes(), vec![0]);
        assert_eq!(doc.step(id, 20).unwrap().points()[0].position.x, 1.0);

        doc.undo().unwrap();
        let track = doc.track(id).unwrap();
        assert!(!track.is_fixed());
        assert_eq!(track.keyframes(), vec![0, 3, 8]);
    }

    #[test]
    fn test_delete_step_undo() {
        let (mut doc, id) = tape_doc();
        doc.move_point(id, 4, 1, Point2::new(40.0, 0.0)).unwrap();
        doc.delete_step(id, 4).unwrap();
        assert_eq!(doc.track(id).unwrap().keyframes(), vec![0]);
        doc.undo().unwrap();
        assert_eq!(doc.track(id).unwrap().keyframes(), vec![0, 4]);
        assert_eq!(doc.step(id, 4).unwrap().points()[1].position.x, 40.0);

        let err = doc.delete_step(id, 0).unwrap_err();
        assert!(err.is_guard());
    }

    #[test]
    fn test_delete_and_clear_tracks_undo() {
        let (mut doc, a) = tape_doc();
        let b = doc.add_track("angle", StepKind::Protractor);
        doc.delete_track(a).unwrap();
        assert!(doc.track(a).is_none());
        doc.undo().unwrap();
        assert_eq!(doc.track(a).unwrap().name(), "tape");

        assert_eq!(doc.clear_tracks(), 2);
        assert!(doc.tracks().is_empty());
        assert_eq!(doc.undo().unwrap(), UndoOutcome::Applied("Clear tracks".into()));
        assert_eq!(doc.tracks().ids(), vec![a, b]);
        doc.redo().unwrap();
        assert!(doc.tracks().is_empty());
    }

    #[test]
    fn test_undo_of_deleted_track_edit_is_noop() {
        let (mut doc, id) = tape_doc();
        doc.move_point(id, 0, 0, Point2::new(3.0, 0.0)).unwrap();
        // 不经过历史直接移除
        doc.scene.tracks.remove(id);
        assert!(matches!(doc.undo().unwrap(), UndoOutcome::TargetMissing(_)));
    }

    #[test]
    fn test_attach_cycle_through_document() {
        let (mut doc, a) = tape_doc();
        let b = doc.add_track("b", StepKind::Tape);
        doc.attach(PointRef::new(a, 0, 0), AttachmentRef::point(b, 0)).unwrap();
        let err = doc
            .attach(PointRef::new(b, 0, 0), AttachmentRef::point(a, 0))
            .unwrap_err();
        assert!(err.is_cycle());
        assert_eq!(doc.history().len(), 1);

        assert_eq!(doc.dependents(b), vec![a]);
        doc.undo().unwrap();
        assert!(!doc.step(a, 0).unwrap().has_attachments());
    }

    #[test]
    fn test_end_of_cycle_syncs_attached_points() {
        let (mut doc, a) = tape_doc();
        let b = doc.add_track("b", StepKind::Tape);
        doc.attach(PointRef::new(a, 0, 1), AttachmentRef::point(b, 1)).unwrap();
        doc.end_of_cycle();

        doc.move_point(b, 0, 1, Point2::new(100.0, 50.0)).unwrap();
        assert_eq!(doc.end_of_cycle(), 1);
        assert_eq!(doc.step(a, 0).unwrap().points()[1].position, Point2::new(100.0, 50.0));
        assert_eq!(doc.end_of_cycle(), 0);
    }

    #[test]
    fn test_tape_length_factor_guards() {
        let (mut doc, id) = tape_doc();
        assert!(!doc.set_tape_length(id, 0, 10.0).unwrap());
        assert!(!doc.set_tape_length(id, 0, f64::NAN).unwrap());
        assert!(!doc.set_tape_length(id, 0, f64::INFINITY).unwrap());
        assert!(!doc.history().can_undo());

        // 长度0被钳到下限，比例尺仍为正
        assert!(doc.set_tape_length(id, 0, 0.0).unwrap());
        assert!(doc.coords().scale().0 > 0.0);
    }

    #[test]
    fn test_tape_length_locked_rejected() {
        let (mut doc, id) = tape_doc();
        doc.set_locked(id, true).unwrap();
        let err = doc.set_tape_length(id, 0, 20.0).unwrap_err();
        assert!(matches!(err, Error::Track(TrackError::Locked(t)) if t == id));
        assert!(err.is_guard());
        assert_eq!(doc.coords().scale(), (1.0, 1.0));
        assert!(!doc.history().can_undo());
    }

    #[test]
    fn test_tape_length_negative_uses_magnitude() {
        let (mut doc, id) = tape_doc();
        assert!(doc.set_tape_length(id, 0, -20.0).unwrap());
        assert_eq!(doc.coords().scale(), (2.0, 2.0));
        assert_relative_eq!(doc.measure(id, 0).unwrap().world_length.unwrap(), 20.0, epsilon = 1e-12);
    }

    #[test]
    fn test_stick_mode() {
        let (mut doc, id) = tape_doc();
        assert!(doc.set_stick_mode(id, 0, true).unwrap());
        assert!(!doc.set_stick_mode(id, 0, true).unwrap());
        assert_eq!(doc.track(id).unwrap().stick_length(), Some(10.0));

        // 端点拉长一倍，世界长度不变，比例尺减半
        doc.move_point(id, 0, 1, Point2::new(20.0, 0.0)).unwrap();
        assert_eq!(doc.coords().scale(), (0.5, 0.5));
        assert_relative_eq!(doc.measure(id, 0).unwrap().world_length.unwrap(), 10.0, epsilon = 1e-12);
        assert_eq!(doc.undo().unwrap(), UndoOutcome::Applied("Move point".into()));
        assert_eq!(doc.coords().scale(), (1.0, 1.0));
        assert_eq!(doc.step(id, 0).unwrap().points()[1].position.x, 10.0);

        assert!(doc.set_tape_length(id, 0, 30.0).unwrap());
        assert_eq!(doc.track(id).unwrap().stick_length(), Some(30.0));
        assert_eq!(doc.coords().scale(), (3.0, 3.0));
        doc.undo().unwrap();
        assert_eq!(doc.track(id).unwrap().stick_length(), Some(10.0));
        assert_eq!(doc.coords().scale(), (1.0, 1.0));

        assert!(doc.set_stick_mode(id, 0, false).unwrap());
        doc.move_point(id, 0, 1, Point2::new(40.0, 0.0)).unwrap();
        assert_eq!(doc.coords().scale(), (1.0, 1.0));
        doc.undo().unwrap();
        doc.undo().unwrap();
        assert_eq!(doc.track(id).unwrap().stick_length(), Some(10.0));

        let angle = doc.add_track("angle", StepKind::Protractor);
        assert!(matches!(
            doc.set_stick_mode(angle, 0, true),
            Err(Error::Track(TrackError::WrongKind { .. }))
        ));
    }

    #[test]
    fn test_protractor_angle() {
        let mut doc = Document::new();
        let id = doc
            .add_track_with_points(
                "angle",
                StepKind::Protractor,
                &[Point2::new(0.0, 0.0), Point2::new(10.0, 0.0), Point2::new(0.0, -5.0)],
            )
            .unwrap();
        // 图像y向下：臂2在世界坐标中指向 +y
        let before = doc.measure(id, 0).unwrap().world_angle.unwrap();
        assert_relative_eq!(before, PI / 2.0, epsilon = 1e-12);

        doc.set_protractor_angle(id, 0, PI / 4.0).unwrap().unwrap();
        let m = doc.measure(id, 0).unwrap();
        assert_relative_eq!(m.world_angle.unwrap(), PI / 4.0, epsilon = 1e-12);
        let arm2 = (m.points[2] - m.points[0]).norm();
        assert_relative_eq!(arm2, 5.0, epsilon = 1e-12);

        doc.undo().unwrap();
        assert_eq!(doc.step(id, 0).unwrap().points()[2].position, Point2::new(0.0, -5.0));
    }

    #[test]
    fn test_calibrate_compound_edit() {
        let mut doc = Document::new();
        let id = doc
            .add_track_with_points(
                "calibration",
                StepKind::Calibration,
                &[Point2::new(100.0, 200.0), Point2::new(300.0, 200.0)],
            )
            .unwrap();
        doc.calibrate(id, 0, [Point2::new(0.0, 0.0), Point2::new(1.0, 0.0)])
            .unwrap();

        let coords = *doc.coords();
        assert_relative_eq!(coords.scale().0, 0.005, epsilon = 1e-15);
        let w = coords.image_to_world(&Point2::new(300.0, 200.0));
        assert_relative_eq!(w.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(w.y, 0.0, epsilon = 1e-12);

        doc.undo().unwrap();
        assert_eq!(*doc.coords(), CoordSystem::default());
        assert_eq!(
            doc.step(id, 0).unwrap().payload(),
            &crate::step::StepPayload::Calibration { world: None }
        );
        doc.redo().unwrap();
        assert_eq!(*doc.coords(), coords);

        assert!(matches!(
            doc.calibrate(id, 0, [Point2::new(1.0, 1.0), Point2::new(1.0, 1.0)]),
            Err(Error::Coords(CoordsError::CoincidentPoints))
        ));
    }

    #[test]
    fn test_calibrate_x_axis_keeps_other_coordinate() {
        let mut doc = Document::new();
        let (p0, p1) = (Point2::new(100.0, 200.0), Point2::new(300.0, 250.0));
        let id = doc
            .add_track_with_points("calibration", StepKind::Calibration, &[p0, p1])
            .unwrap();
        assert!(doc.set_calibration_axes(id, CalibrationAxes::X).unwrap());
        doc.calibrate(id, 0, [Point2::new(0.0, 0.0), Point2::new(1.0, 7.0)])
            .unwrap();

        let coords = *doc.coords();
        assert_relative_eq!(coords.scale().0, 0.005, epsilon = 1e-15);
        assert_eq!(coords.angle(), 0.0);
        let w0 = coords.image_to_world(&p0);
        let w1 = coords.image_to_world(&p1);
        assert_relative_eq!(w0.x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(w0.y, -1.0, epsilon = 1e-12);
        assert_relative_eq!(w1.x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(w1.y, -1.25, epsilon = 1e-12);
        match doc.step(id, 0).unwrap().payload() {
            crate::step::StepPayload::Calibration { world: Some(world) } => {
                assert_relative_eq!(world[0].y, -1.0, epsilon = 1e-12);
                assert_relative_eq!(world[1].y, -1.25, epsilon = 1e-12);
                assert_eq!(world[1].x, 1.0);
            }
            other => panic!("unexpected payload {other:?}"),
        }

        // 世界x反向时角度翻转半周
        doc.calibrate(id, 0, [Point2::new(1.0, 0.0), Point2::new(0.0, 0.0)])
            .unwrap();
        let coords = *doc.coords();
        assert_relative_eq!(coords.angle().abs(), PI, epsilon = 1e-12);
        assert_relative_eq!(coords.scale().0, 0.005, epsilon = 1e-15);
        assert_relative_eq!(coords.image_to_world(&p0).x, 1.0, epsilon = 1e-12);
        assert_relative_eq!(coords.image_to_world(&p1).x, 0.0, epsilon = 1e-12);

        assert!(matches!(
            doc.calibrate(id, 0, [Point2::new(2.0, 0.0), Point2::new(2.0, 5.0)]),
            Err(Error::Coords(CoordsError::CoincidentPoints))
        ));
    }

    #[test]
    fn test_calibrate_y_axis() {
        let mut doc = Document::new();
        let (p0, p1) = (Point2::new(100.0, 200.0), Point2::new(120.0, 100.0));
        let id = doc
            .add_track_with_points("calibration", StepKind::Calibration, &[p0, p1])
            .unwrap();
        doc.set_calibration_axes(id, CalibrationAxes::Y).unwrap();
        doc.calibrate(id, 0, [Point2::new(5.0, 0.0), Point2::new(9.0, 2.0)])
            .unwrap();

        let coords = *doc.coords();
        assert_relative_eq!(coords.scale().1, 0.02, epsilon = 1e-15);
        let w0 = coords.image_to_world(&p0);
        let w1 = coords.image_to_world(&p1);
        assert_relative_eq!(w0.x, 2.0, epsilon = 1e-12);
        assert_relative_eq!(w0.y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(w1.x, 2.4, epsilon = 1e-12);
        assert_relative_eq!(w1.y, 2.0, epsilon = 1e-12);

        doc.undo().unwrap();
        assert_eq!(*doc.coords(), CoordSystem::default());
        assert_eq!(doc.undo().unwrap(), UndoOutcome::Applied("Calibration axes".into()));
        assert_eq!(doc.track(id).unwrap().calibration_axes(), Some(CalibrationAxes::Both));
    }

    #[test]
    fn test_measure_vector_components() {
        let mut doc = Document::new();
        let id = doc
            .add_track_with_points(
                "v",
                StepKind::Vector,
                &[Point2::new(0.0, 0.0), Point2::new(3.0, -4.0)],
            )
            .unwrap();
        let m = doc.measure(id, 0).unwrap();
        assert_eq!(m.components, Some(Vector2::new(3.0, 4.0)));
        assert_eq!(m.world_length, Some(5.0));
    }

    #[test]
    fn test_with_config_validates() {
        let config = DocumentConfig {
            history_capacity: 0,
            ..DocumentConfig::default()
        };
        assert!(matches!(Document::with_config(config), Err(Error::Config(_))));
    }
}
