//! 轨道、步骤与坐标系的快照
//!
//! 记录只保存用户数据（点、附着、模式、关键帧），派生几何在读回时重新计算。

use crate::attachment::{AttachTarget, AttachmentRef};
use crate::coords::CoordSystem;
use crate::math::Point2;
use crate::step::{CalibrationAxes, MeasurablePoint, Step, StepKind, StepPayload, ToolSettings};
use crate::track::{Track, TrackId};
use framemark_record::{Record, RecordError, Snapshot, Value};
use std::collections::BTreeMap;

const STEP_CLASS: &str = "Step";
const POINT_CLASS: &str = "Point";
const ATTACHMENT_CLASS: &str = "Attachment";
const SLOT_CLASS: &str = "StepSlot";

fn point_xy(record: &Record, x: &str, y: &str) -> Result<Point2, RecordError> {
    Ok(Point2::new(record.f64(x)?, record.f64(y)?))
}

/// 附着引用 -> 记录
pub fn attachment_to_record(attachment: &AttachmentRef) -> Record {
    let record = Record::new(ATTACHMENT_CLASS, 1).with("track", attachment.track.0);
    match attachment.target {
        AttachTarget::Point(index) => record.with("point", index),
        AttachTarget::Step(frame) => record.with("step", frame),
    }
}

/// 记录 -> 附着引用
pub fn attachment_from_record(record: &Record) -> Result<AttachmentRef, RecordError> {
    record.expect_class(ATTACHMENT_CLASS, 1)?;
    let track = TrackId(record.u64("track")?);
    let target = match (record.get("point"), record.get("step")) {
        (Some(_), None) => AttachTarget::Point(record.usize("point")?),
        (None, Some(_)) => AttachTarget::Step(record.usize("step")?),
        _ => return Err(record.invalid("point", "exactly one of `point` or `step` is required")),
    };
    Ok(AttachmentRef { track, target })
}

/// 可测量点 -> 记录
pub fn point_to_record(point: &MeasurablePoint) -> Record {
    Record::new(POINT_CLASS, 1)
        .with("x", point.position.x)
        .with("y", point.position.y)
        .with("attachment", point.attachment.as_ref().map(attachment_to_record))
}

/// 记录 -> 可测量点
pub fn point_from_record(record: &Record) -> Result<MeasurablePoint, RecordError> {
    record.expect_class(POINT_CLASS, 1)?;
    let position = point_xy(record, "x", "y")?;
    let attachment = record
        .opt_record("attachment")?
        .map(attachment_from_record)
        .transpose()?;
    Ok(MeasurablePoint {
        position,
        attachment,
    })
}

/// 步骤 -> 记录（类型用于读回时校验点数与计算派生几何）
pub fn step_to_record(step: &Step, kind: StepKind) -> Record {
    let points: Vec<Record> = step.points.iter().map(point_to_record).collect();
    let mut record = Record::new(STEP_CLASS, 1)
        .with("kind", kind.name())
        .with("frame", step.frame)
        .with("points", points);
    if let StepPayload::Calibration { world: Some([w0, w1]) } = step.payload {
        record.set(
            "world",
            Record::new("World", 1)
                .with("x0", w0.x)
                .with("y0", w0.y)
                .with("x1", w1.x)
                .with("y1", w1.y),
        );
    }
    record
}

/// 记录 -> 步骤，派生几何重新计算
pub fn step_from_record(record: &Record) -> Result<(StepKind, Step), RecordError> {
    record.expect_class(STEP_CLASS, 1)?;
    let kind = kind_of(record)?;
    let frame = record.usize("frame")?;
    let points = record
        .records("points")?
        .into_iter()
        .map(point_from_record)
        .collect::<Result<Vec<_>, _>>()?;

    match kind.point_count() {
        Some(count) if points.len() != count => {
            return Err(record.invalid(
                "points",
                format!("{kind} steps have {count} points, found {}", points.len()),
            ));
        }
        None if points.len() < kind.min_points() => {
            return Err(record.invalid(
                "points",
                format!("{kind} steps need at least {} points", kind.min_points()),
            ));
        }
        _ => {}
    }

    let mut step = Step::new(kind, frame, points);
    if let Some(world) = record.opt_record("world")? {
        if kind != StepKind::Calibration {
            return Err(record.invalid("world", format!("{kind} steps have no world coordinates")));
        }
        step.payload = StepPayload::Calibration {
            world: Some([point_xy(world, "x0", "y0")?, point_xy(world, "x1", "y1")?]),
        };
    }
    Ok((kind, step))
}

/// 轨道级设置：卷尺的 `stick_length`，标定的 `axes`；缺失时取默认值
fn settings_from_record(record: &Record, kind: StepKind) -> Result<ToolSettings, RecordError> {
    match kind {
        StepKind::Tape => {
            let stick_length = match record.get("stick_length") {
                None | Some(Value::Null) => None,
                Some(value) => match value.as_f64() {
                    Some(length) if length.is_finite() && length > 0.0 => Some(length),
                    _ => return Err(record.invalid("stick_length", "expected a positive length")),
                },
            };
            Ok(ToolSettings::Tape { stick_length })
        }
        StepKind::Calibration => {
            let axes = match record.get("axes") {
                None => CalibrationAxes::default(),
                Some(_) => record
                    .text("axes")?
                    .parse()
                    .map_err(|e: String| record.invalid("axes", e))?,
            };
            Ok(ToolSettings::Calibration { axes })
        }
        _ => Ok(kind.default_settings()),
    }
}

fn kind_of(record: &Record) -> Result<StepKind, RecordError> {
    record
        .text("kind")?
        .parse()
        .map_err(|e: String| record.invalid("kind", e))
}

impl Snapshot for Track {
    const CLASS: &'static str = "Track";
    const VERSION: u32 = 1;

    fn to_record(&self) -> Record {
        let steps: Vec<Record> = self
            .keyframe_steps()
            .map(|step| step_to_record(step, self.kind))
            .collect();
        let mut record = Self::empty_record()
            .with("id", self.id.0)
            .with("name", self.name.as_str())
            .with("kind", self.kind.name())
            .with("locked", self.locked)
            .with("fixed", self.fixed)
            .with("keyframes", self.keyframes())
            .with("steps", steps);
        match self.settings {
            ToolSettings::Tape { stick_length } => {
                record.set("stick_length", stick_length);
            }
            ToolSettings::Calibration { axes } => {
                record.set("axes", axes.name());
            }
            ToolSettings::None => {}
        }
        record
    }

    fn from_record(record: &Record) -> Result<Self, RecordError> {
        record.expect_class(Self::CLASS, Self::VERSION)?;
        let id = TrackId(record.u64("id")?);
        let kind = kind_of(record)?;
        let keyframes = record.indices("keyframes")?;
        let fixed = record.bool("fixed")?;

        let mut origin = None;
        let mut keyed = BTreeMap::new();
        for step_record in record.records("steps")? {
            let (step_kind, step) = step_from_record(step_record)?;
            if step_kind != kind {
                return Err(record.invalid("steps", format!("step kind differs from track kind {kind}")));
            }
            let frame = step.frame;
            let duplicate = if frame == 0 {
                origin.replace(step).is_some()
            } else {
                keyed.insert(frame, step).is_some()
            };
            if duplicate {
                return Err(record.invalid("steps", format!("duplicate step for frame {frame}")));
            }
        }

        let origin = origin.ok_or_else(|| record.invalid("steps", "missing step for frame 0"))?;
        let stored: Vec<usize> = std::iter::once(0).chain(keyed.keys().copied()).collect();
        if keyframes != stored {
            return Err(record.invalid("keyframes", "keyframes do not match stored steps"));
        }
        if fixed && !keyed.is_empty() {
            return Err(record.invalid("keyframes", "fixed tracks keep only frame 0"));
        }

        let mut track = Track::from_origin(id, record.text("name")?, kind, origin);
        track.locked = record.bool("locked")?;
        track.fixed = fixed;
        track.settings = settings_from_record(record, kind)?;
        track.keyed = keyed;
        Ok(track)
    }
}

impl Snapshot for CoordSystem {
    const CLASS: &'static str = "Coords";
    const VERSION: u32 = 1;

    fn to_record(&self) -> Record {
        Self::empty_record()
            .with("origin_x", self.origin.x)
            .with("origin_y", self.origin.y)
            .with("angle", self.angle)
            .with("scale_x", self.scale_x)
            .with("scale_y", self.scale_y)
    }

    fn from_record(record: &Record) -> Result<Self, RecordError> {
        record.expect_class(Self::CLASS, Self::VERSION)?;
        let mut coords = CoordSystem::new();
        coords.set_origin(point_xy(record, "origin_x", "origin_y")?);
        coords.set_angle(record.f64("angle")?);
        coords
            .set_scale(record.f64("scale_x")?, record.f64("scale_y")?)
            .map_err(|e| record.invalid("scale_x", e.to_string()))?;
        Ok(coords)
    }
}

/// 单帧步骤槽位：该帧是关键帧时保存其步骤，否则只记录帧号
pub fn step_slot_record(track: &Track, frame: usize) -> Record {
    let step = track
        .is_keyframe(frame)
        .then(|| step_to_record(track.effective_step(frame), track.kind));
    Record::new(SLOT_CLASS, 1)
        .with("track", track.id.0)
        .with("frame", frame)
        .with("step", step)
}

/// 解析步骤槽位，返回 (帧号, 步骤)
pub fn step_slot_from_record(record: &Record, track: &Track) -> Result<(usize, Option<Step>), RecordError> {
    record.expect_class(SLOT_CLASS, 1)?;
    if record.u64("track")? != track.id.0 {
        return Err(record.invalid("track", format!("slot belongs to another track than {}", track.id)));
    }
    let frame = record.usize("frame")?;
    let step = match record.opt_record("step")? {
        Some(step_record) => {
            let (kind, step) = step_from_record(step_record)?;
            if kind != track.kind {
                return Err(record.invalid("step", format!("step kind differs from track kind {}", track.kind)));
            }
            if step.frame != frame {
                return Err(record.invalid("step", "step frame differs from slot frame"));
            }
            Some(step)
        }
        None if frame == 0 => return Err(record.invalid("step", "frame 0 always has a step")),
        None => None,
    };
    Ok((frame, step))
}
