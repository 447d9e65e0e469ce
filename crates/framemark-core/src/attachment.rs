//! 点附着
//!
//! 可测量点可以附着到另一条轨道的点上，坐标随目标变化。
//! 采用拉取模式：读取时沿附着链解析，不维护反向索引。
//! 附着关系始终保持无环，附着时检查，解析时用深度上限兜底。

use crate::error::AttachError;
use crate::math::Point2;
use crate::registry::TrackRegistry;
use crate::step::StepChange;
use crate::track::TrackId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// 附着链默认深度上限
pub const DEFAULT_MAX_DEPTH: usize = 8;

/// 附着目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttachTarget {
    /// 同一帧上目标轨道的第 `i` 个点
    Point(usize),
    /// 目标轨道在固定帧上的第0个点
    Step(usize),
}

/// 附着引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub track: TrackId,
    pub target: AttachTarget,
}

impl AttachmentRef {
    pub fn point(track: TrackId, index: usize) -> Self {
        Self {
            track,
            target: AttachTarget::Point(index),
        }
    }

    pub fn step(track: TrackId, frame: usize) -> Self {
        Self {
            track,
            target: AttachTarget::Step(frame),
        }
    }

    /// 从第 `frame` 帧出发时引用的具体点
    pub fn point_ref(&self, frame: usize) -> PointRef {
        match self.target {
            AttachTarget::Point(index) => PointRef::new(self.track, frame, index),
            AttachTarget::Step(pinned) => PointRef::new(self.track, pinned, 0),
        }
    }
}

/// 某帧上某轨道的某个点
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PointRef {
    pub track: TrackId,
    pub frame: usize,
    pub index: usize,
}

impl PointRef {
    pub fn new(track: TrackId, frame: usize, index: usize) -> Self {
        Self { track, frame, index }
    }
}

/// 附着解析器
#[derive(Debug, Clone, Copy)]
pub struct AttachmentResolver {
    max_depth: usize,
}

impl Default for AttachmentResolver {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DEPTH)
    }
}

impl AttachmentResolver {
    pub fn new(max_depth: usize) -> Self {
        Self { max_depth }
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// 把点附着到目标上
    ///
    /// 成功后点存储附着引用，并复制目标当前的坐标。
    /// 失败时不改变任何状态。
    pub fn attach(
        &self,
        registry: &mut TrackRegistry,
        point: PointRef,
        target: AttachmentRef,
    ) -> Result<StepChange, AttachError> {
        let source = registry
            .get(point.track)
            .ok_or(AttachError::TargetNotFound(point.track))?;
        let count = source.effective_step(point.frame).points().len();
        if point.index >= count {
            return Err(AttachError::InvalidTarget {
                track: point.track,
                frame: point.frame,
                index: point.index,
            });
        }

        if target.track == point.track {
            tracing::debug!("Rejected self-attachment on track {}", point.track);
            return Err(AttachError::CycleDetected {
                track: point.track,
                target: target.track,
            });
        }

        let first = target.point_ref(point.frame);
        let target_track = registry
            .get(first.track)
            .ok_or(AttachError::TargetNotFound(first.track))?;
        if target_track.effective_step(first.frame).point(first.index).is_none() {
            return Err(AttachError::InvalidTarget {
                track: first.track,
                frame: first.frame,
                index: first.index,
            });
        }

        let position = self.follow(registry, first, Some(point.track))?;
        // 附着随关键帧向后传播，其他轨道的后续关键帧上也可能成环
        for frame in governed_frames(registry, point) {
            if frame == point.frame {
                continue;
            }
            if let Err(e) = self.follow(registry, target.point_ref(frame), Some(point.track)) {
                if e.is_cycle() {
                    tracing::debug!(
                        "Attachment of track {} would form a cycle at frame {}",
                        point.track,
                        frame
                    );
                    return Err(e);
                }
            }
        }

        let track = registry
            .get_mut(point.track)
            .ok_or(AttachError::TargetNotFound(point.track))?;
        let change = track.set_attachment(point.frame, point.index, Some(target), position)?;
        tracing::debug!(
            "Attached point {} of track {} to track {}",
            point.index,
            point.track,
            target.track
        );
        Ok(change)
    }

    /// 解除附着，点保留最近解析出的坐标
    ///
    /// 点本来没有附着时返回 `Ok(None)`。
    pub fn detach(
        &self,
        registry: &mut TrackRegistry,
        point: PointRef,
    ) -> Result<Option<StepChange>, AttachError> {
        let track = registry
            .get(point.track)
            .ok_or(AttachError::TargetNotFound(point.track))?;
        let stored = track
            .effective_step(point.frame)
            .point(point.index)
            .copied()
            .ok_or(AttachError::InvalidTarget {
                track: point.track,
                frame: point.frame,
                index: point.index,
            })?;
        if !stored.is_attached() {
            return Ok(None);
        }

        let position = self
            .follow(registry, point, None)
            .unwrap_or(stored.position);
        let track = registry
            .get_mut(point.track)
            .ok_or(AttachError::TargetNotFound(point.track))?;
        let change = track.set_attachment(point.frame, point.index, None, position)?;
        Ok(Some(change))
    }

    /// 解析点在某帧的有效坐标
    ///
    /// 未附着时返回存储坐标；附着目标缺失时退回存储坐标并记录警告。
    pub fn resolve(&self, registry: &TrackRegistry, point: PointRef) -> Result<Point2, AttachError> {
        self.follow(registry, point, None)
    }

    /// 轨道在某帧所有点的有效坐标
    pub fn resolved_points(
        &self,
        registry: &TrackRegistry,
        track: TrackId,
        frame: usize,
    ) -> Result<Vec<Point2>, AttachError> {
        let count = registry
            .get(track)
            .ok_or(AttachError::TargetNotFound(track))?
            .effective_step(frame)
            .points()
            .len();
        (0..count)
            .map(|index| self.resolve(registry, PointRef::new(track, frame, index)))
            .collect()
    }

    /// 直接或间接附着在 `track` 上的轨道（不含自身）
    pub fn dependents(&self, registry: &TrackRegistry, track: TrackId) -> Vec<TrackId> {
        let mut found = BTreeSet::new();
        let mut pending = vec![track];
        while let Some(current) = pending.pop() {
            for candidate in registry.iter() {
                if candidate.id() == track || found.contains(&candidate.id()) {
                    continue;
                }
                let depends = candidate.keyframe_steps().any(|step| {
                    step.points()
                        .iter()
                        .filter_map(|p| p.attachment)
                        .any(|a| a.track == current)
                });
                if depends {
                    found.insert(candidate.id());
                    pending.push(candidate.id());
                }
            }
        }
        found.into_iter().collect()
    }

    /// 沿附着链走到未附着的点
    ///
    /// `forbidden` 为发起附着的轨道：链条经过它即构成环。
    fn follow(
        &self,
        registry: &TrackRegistry,
        start: PointRef,
        forbidden: Option<TrackId>,
    ) -> Result<Point2, AttachError> {
        let mut current = start;
        let mut last_stored: Option<Point2> = None;

        for _ in 0..=self.max_depth {
            let point = registry
                .get(current.track)
                .and_then(|t| t.effective_step(current.frame).point(current.index).copied());
            let Some(point) = point else {
                return match last_stored {
                    Some(position) => {
                        tracing::warn!(
                            "Attachment target {} point {} at frame {} is missing, using stored position",
                            current.track,
                            current.index,
                            current.frame
                        );
                        Ok(position)
                    }
                    None if registry.contains(current.track) => Err(AttachError::InvalidTarget {
                        track: current.track,
                        frame: current.frame,
                        index: current.index,
                    }),
                    None => Err(AttachError::TargetNotFound(current.track)),
                };
            };

            let Some(next) = point.attachment else {
                return Ok(point.position);
            };
            if let Some(origin) = forbidden {
                if next.track == origin {
                    tracing::debug!(
                        "Attachment chain from track {} returns through track {}",
                        origin,
                        current.track
                    );
                    return Err(AttachError::CycleDetected {
                        track: origin,
                        target: current.track,
                    });
                }
            }
            last_stored = Some(point.position);
            current = next.point_ref(current.frame);
        }

        tracing::warn!(
            "Attachment chain from track {} exceeds depth {}",
            start.track,
            self.max_depth
        );
        Err(AttachError::CycleDetected {
            track: forbidden.unwrap_or(start.track),
            target: current.track,
        })
    }
}

/// 新附着生效的帧：起始帧，以及源轨道下一个关键帧之前所有轨道的关键帧
fn governed_frames(registry: &TrackRegistry, point: PointRef) -> BTreeSet<usize> {
    let mut frames = BTreeSet::from([point.frame]);
    let Some(source) = registry.get(point.track) else {
        return frames;
    };
    let (start, end) = if source.is_fixed() {
        (0, None)
    } else {
        let next = source.keyframes().into_iter().find(|&k| k > point.frame);
        (point.frame, next)
    };
    for track in registry.iter() {
        frames.extend(
            track
                .keyframes()
                .into_iter()
                .filter(|&k| k >= start && end.map_or(true, |e| k < e)),
        );
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrackError;
    use crate::step::StepKind;

    fn registry_with_tapes(n: usize) -> (TrackRegistry, Vec<TrackId>) {
        let mut registry = TrackRegistry::new();
        let ids = (0..n)
            .map(|i| {
                registry
                    .add_with_points(
                        format!("tape {i}"),
                        StepKind::Tape,
                        &[Point2::new(i as f64, 0.0), Point2::new(i as f64, 10.0)],
                    )
                    .unwrap()
            })
            .collect();
        (registry, ids)
    }

    #[test]
    fn test_attach_copies_target_position() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        let point = PointRef::new(ids[0], 0, 1);

        resolver
            .attach(&mut registry, point, AttachmentRef::point(ids[1], 1))
            .unwrap();
        let stored = registry.get(ids[0]).unwrap().effective_step(0).points()[1];
        assert_eq!(stored.position, Point2::new(1.0, 10.0));
        assert!(stored.is_attached());

        // 目标移动后解析结果跟随
        registry
            .get_mut(ids[1])
            .unwrap()
            .set_point(0, 1, Point2::new(7.0, 7.0))
            .unwrap();
        assert_eq!(resolver.resolve(&registry, point).unwrap(), Point2::new(7.0, 7.0));
    }

    #[test]
    fn test_self_attachment_is_cycle() {
        let (mut registry, ids) = registry_with_tapes(1);
        let resolver = AttachmentResolver::default();
        let err = resolver
            .attach(&mut registry, PointRef::new(ids[0], 0, 0), AttachmentRef::point(ids[0], 1))
            .unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn test_chain_cycle_rejected_without_change() {
        let (mut registry, ids) = registry_with_tapes(3);
        let resolver = AttachmentResolver::default();
        // A -> B -> C
        resolver
            .attach(&mut registry, PointRef::new(ids[0], 0, 0), AttachmentRef::point(ids[1], 0))
            .unwrap();
        resolver
            .attach(&mut registry, PointRef::new(ids[1], 0, 0), AttachmentRef::point(ids[2], 0))
            .unwrap();

        let before = registry.get(ids[2]).unwrap().clone();
        let err = resolver
            .attach(&mut registry, PointRef::new(ids[2], 0, 0), AttachmentRef::point(ids[0], 0))
            .unwrap_err();
        assert!(matches!(err, AttachError::CycleDetected { .. }));
        assert_eq!(registry.get(ids[2]).unwrap(), &before);

        // 链条末端解析到C的坐标
        let a = resolver.resolve(&registry, PointRef::new(ids[0], 0, 0)).unwrap();
        assert_eq!(a, Point2::new(2.0, 0.0));
    }

    #[test]
    fn test_cycle_through_later_keyframe_rejected() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        // 第5帧成为A的关键帧，A.p0 -> B.p0
        resolver
            .attach(&mut registry, PointRef::new(ids[0], 5, 0), AttachmentRef::point(ids[1], 0))
            .unwrap();

        // B的第0帧步骤支配第5帧，B.p0 -> A.p0 会在第5帧成环
        let before = registry.get(ids[1]).unwrap().clone();
        let err = resolver
            .attach(&mut registry, PointRef::new(ids[1], 0, 0), AttachmentRef::point(ids[0], 0))
            .unwrap_err();
        assert!(err.is_cycle());
        assert_eq!(registry.get(ids[1]).unwrap(), &before);
        assert_eq!(
            resolver.resolve(&registry, PointRef::new(ids[0], 5, 0)).unwrap(),
            Point2::new(1.0, 0.0)
        );
    }

    #[test]
    fn test_attach_allowed_when_later_keyframe_shields_cycle() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        resolver
            .attach(&mut registry, PointRef::new(ids[0], 5, 0), AttachmentRef::point(ids[1], 0))
            .unwrap();
        // B在第3帧有自己的关键帧，第0帧的附着只作用于0..3
        registry
            .get_mut(ids[1])
            .unwrap()
            .set_point(3, 1, Point2::new(1.0, 20.0))
            .unwrap();

        resolver
            .attach(&mut registry, PointRef::new(ids[1], 0, 0), AttachmentRef::point(ids[0], 0))
            .unwrap();
        assert_eq!(
            resolver.resolve(&registry, PointRef::new(ids[1], 0, 0)).unwrap(),
            Point2::new(0.0, 0.0)
        );
        assert_eq!(
            resolver.resolve(&registry, PointRef::new(ids[0], 5, 0)).unwrap(),
            Point2::new(1.0, 0.0)
        );
    }

    #[test]
    fn test_missing_and_invalid_targets() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        let point = PointRef::new(ids[0], 0, 0);

        assert_eq!(
            resolver
                .attach(&mut registry, point, AttachmentRef::point(TrackId(99), 0))
                .unwrap_err(),
            AttachError::TargetNotFound(TrackId(99))
        );
        assert!(matches!(
            resolver
                .attach(&mut registry, point, AttachmentRef::point(ids[1], 5))
                .unwrap_err(),
            AttachError::InvalidTarget { index: 5, .. }
        ));
    }

    #[test]
    fn test_dangling_target_falls_back_to_stored() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        let point = PointRef::new(ids[0], 0, 1);
        resolver
            .attach(&mut registry, point, AttachmentRef::point(ids[1], 0))
            .unwrap();
        registry.remove(ids[1]);
        assert_eq!(resolver.resolve(&registry, point).unwrap(), Point2::new(1.0, 0.0));
    }

    #[test]
    fn test_detach_keeps_resolved_position() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        let point = PointRef::new(ids[0], 0, 0);
        resolver
            .attach(&mut registry, point, AttachmentRef::point(ids[1], 1))
            .unwrap();
        registry
            .get_mut(ids[1])
            .unwrap()
            .set_point(0, 1, Point2::new(3.0, 4.0))
            .unwrap();

        assert!(resolver.detach(&mut registry, point).unwrap().is_some());
        let stored = registry.get(ids[0]).unwrap().effective_step(0).points()[0];
        assert_eq!(stored.position, Point2::new(3.0, 4.0));
        assert!(!stored.is_attached());
        assert!(resolver.detach(&mut registry, point).unwrap().is_none());
    }

    #[test]
    fn test_attached_point_rejects_direct_set() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        resolver
            .attach(&mut registry, PointRef::new(ids[0], 0, 0), AttachmentRef::point(ids[1], 0))
            .unwrap();
        let err = registry
            .get_mut(ids[0])
            .unwrap()
            .set_point(0, 0, Point2::new(5.0, 5.0))
            .unwrap_err();
        assert!(matches!(err, TrackError::PointAttached { index: 0, .. }));
    }

    #[test]
    fn test_locked_track_rejects_attach() {
        let (mut registry, ids) = registry_with_tapes(2);
        registry.get_mut(ids[0]).unwrap().set_locked(true);
        let err = AttachmentResolver::default()
            .attach(&mut registry, PointRef::new(ids[0], 0, 0), AttachmentRef::point(ids[1], 0))
            .unwrap_err();
        assert_eq!(err, AttachError::Track(TrackError::Locked(ids[0])));
    }

    #[test]
    fn test_step_target_uses_pinned_frame() {
        let (mut registry, ids) = registry_with_tapes(2);
        let resolver = AttachmentResolver::default();
        registry
            .get_mut(ids[1])
            .unwrap()
            .set_point(4, 0, Point2::new(40.0, 40.0))
            .unwrap();
        let point = PointRef::new(ids[0], 9, 0);
        resolver
            .attach(&mut registry, point, AttachmentRef::step(ids[1], 0))
            .unwrap();
        // 第9帧的目标按第0帧解析
        assert_eq!(resolver.resolve(&registry, point).unwrap(), Point2::new(1.0, 0.0));
    }

    #[test]
    fn test_depth_guard() {
        let (mut registry, ids) = registry_with_tapes(4);
        let resolver = AttachmentResolver::new(1);
        for pair in ids.windows(2).take(2) {
            resolver
                .attach(&mut registry, PointRef::new(pair[0], 0, 0), AttachmentRef::point(pair[1], 0))
                .unwrap();
        }
        let err = resolver
            .attach(&mut registry, PointRef::new(ids[3], 0, 0), AttachmentRef::point(ids[0], 0))
            .unwrap_err();
        assert!(err.is_cycle());
    }

    #[test]
    fn test_dependents_are_transitive() {
        let (mut registry, ids) = registry_with_tapes(4);
        let resolver = AttachmentResolver::default();
        resolver
            .attach(&mut registry, PointRef::new(ids[1], 0, 0), AttachmentRef::point(ids[0], 0))
            .unwrap();
        resolver
            .attach(&mut registry, PointRef::new(ids[2], 0, 0), AttachmentRef::point(ids[1], 1))
            .unwrap();
        assert_eq!(resolver.dependents(&registry, ids[0]), vec![ids[1], ids[2]]);
        assert!(resolver.dependents(&registry, ids[3]).is_empty());
    }
}
