//! 轨道注册表
//!
//! 按 `TrackId` 管理文档中的所有轨道，ID 在整个文档生命周期内稳定，
//! 删除后恢复的轨道沿用原 ID。

use crate::error::TrackError;
use crate::math::Point2;
use crate::step::StepKind;
use crate::track::{Track, TrackId};
use std::collections::BTreeMap;

/// 轨道注册表
#[derive(Debug, Clone, Default)]
pub struct TrackRegistry {
    tracks: BTreeMap<TrackId, Track>,
    next_id: u64,
}

impl TrackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配新的轨道ID
    fn allocate(&mut self) -> TrackId {
        self.next_id += 1;
        TrackId(self.next_id)
    }

    /// 以类型默认点位新建轨道
    pub fn add(&mut self, name: impl Into<String>, kind: StepKind) -> TrackId {
        let id = self.allocate();
        self.tracks.insert(id, Track::new(id, name, kind));
        id
    }

    /// 以指定点位新建轨道
    pub fn add_with_points(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        points: &[Point2],
    ) -> Result<TrackId, TrackError> {
        let id = TrackId(self.next_id + 1);
        let track = Track::with_points(id, name, kind, points)?;
        self.next_id = id.0;
        self.tracks.insert(id, track);
        Ok(id)
    }

    /// 以轨道自身的ID登记（用于撤销删除），返回被替换的轨道
    pub fn insert(&mut self, track: Track) -> Option<Track> {
        self.next_id = self.next_id.max(track.id.0);
        self.tracks.insert(track.id, track)
    }

    pub fn remove(&mut self, id: TrackId) -> Option<Track> {
        self.tracks.remove(&id)
    }

    pub fn get(&self, id: TrackId) -> Option<&Track> {
        self.tracks.get(&id)
    }

    pub fn get_mut(&mut self, id: TrackId) -> Option<&mut Track> {
        self.tracks.get_mut(&id)
    }

    pub fn contains(&self, id: TrackId) -> bool {
        self.tracks.contains_key(&id)
    }

    /// 按名称查找（同名时返回ID最小者）
    pub fn find_by_name(&self, name: &str) -> Option<TrackId> {
        self.tracks
            .values()
            .find(|t| t.name() == name)
            .map(Track::id)
    }

    /// 所有轨道，按ID排序
    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Track> {
        self.tracks.values_mut()
    }

    pub fn ids(&self) -> Vec<TrackId> {
        self.tracks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// 移除所有轨道；ID 计数不回退
    pub fn clear(&mut self) -> Vec<Track> {
        std::mem::take(&mut self.tracks).into_values().collect()
    }
}
