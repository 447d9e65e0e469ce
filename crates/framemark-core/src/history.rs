//! 撤销/重做
//!
//! 基于快照的编辑历史：
//! - 每条编辑保存目标的稳定键与修改前的记录，修改后的记录在第一次撤销时捕获
//! - 复合编辑由两条编辑组成，撤销和重做都先应用A再应用B
//! - 删除/清空轨道的编辑保存完整轨道记录，撤销时按原ID重新登记
//! - 容量有限，超出时丢弃最早的编辑
//!
//! 恢复失败时状态不变，该条编辑被标记为不可用，之后的撤销/重做跳过它。

use crate::error::HistoryError;
use crate::track::TrackId;
use framemark_record::{Record, RecordError};
use std::collections::VecDeque;

/// 默认历史容量
pub const DEFAULT_CAPACITY: usize = 100;

/// 编辑目标的稳定键，应用时重新解析
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EditTarget {
    /// 整条轨道
    Track(TrackId),
    /// 轨道某一帧的步骤槽位
    Step { track: TrackId, frame: usize },
    /// 坐标系
    Coords,
}

/// 宿主需要提供的快照读写能力
pub trait EditContext {
    /// 捕获目标当前状态；目标不存在时返回 `None`
    fn capture(&self, target: &EditTarget) -> Option<Record>;

    /// 把记录应用到目标；目标不存在时返回 `Ok(false)`
    ///
    /// 解析失败时目标保持不变。
    fn restore(&mut self, target: &EditTarget, record: &Record) -> Result<bool, RecordError>;

    /// 按记录重建并登记轨道，全部成功或全部不变
    fn insert_tracks(&mut self, records: &[Record]) -> Result<(), RecordError>;

    /// 移除轨道，返回实际移除的数量
    fn remove_tracks(&mut self, ids: &[TrackId]) -> usize;
}

/// 单条快照编辑
#[derive(Debug, Clone)]
pub struct Edit {
    target: EditTarget,
    before: Record,
    after: Option<Record>,
}

impl Edit {
    pub fn new(target: EditTarget, before: Record) -> Self {
        Self {
            target,
            before,
            after: None,
        }
    }

    pub fn target(&self) -> EditTarget {
        self.target
    }
}

#[derive(Debug, Clone)]
enum EntryKind {
    Single(Edit),
    Compound(Edit, Edit),
    TrackDelete { ids: Vec<TrackId>, records: Vec<Record> },
}

#[derive(Debug, Clone)]
struct Entry {
    label: String,
    kind: EntryKind,
    usable: bool,
}

/// 撤销/重做结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UndoOutcome {
    /// 没有可撤销/重做的编辑
    Nothing,
    /// 已应用，附带编辑名称
    Applied(String),
    /// 目标已不存在，编辑被跳过
    TargetMissing(String),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Undo,
    Redo,
}

/// 编辑历史
#[derive(Debug, Clone)]
pub struct EditHistory {
    entries: VecDeque<Entry>,
    /// 下一条重做的位置；之前的都是可撤销的
    cursor: usize,
    capacity: usize,
}

impl Default for EditHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EditHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            cursor: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cursor = 0;
    }

    /// 记录一次编辑（修改已完成，`before` 为修改前的快照）
    pub fn post_edit(&mut self, label: impl Into<String>, target: EditTarget, before: Record) {
        self.push(label.into(), EntryKind::Single(Edit::new(target, before)));
    }

    /// 记录复合编辑
    pub fn post_compound_edit(&mut self, label: impl Into<String>, first: Edit, second: Edit) {
        self.push(label.into(), EntryKind::Compound(first, second));
    }

    /// 记录轨道删除（可以一次删除多条）
    pub fn post_track_delete(&mut self, label: impl Into<String>, ids: Vec<TrackId>, records: Vec<Record>) {
        self.push(label.into(), EntryKind::TrackDelete { ids, records });
    }

    fn push(&mut self, label: String, kind: EntryKind) {
        self.entries.truncate(self.cursor);
        self.entries.push_back(Entry {
            label,
            kind,
            usable: true,
        });
        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                tracing::debug!("Evicted oldest edit `{}`", evicted.label);
            }
        }
        self.cursor = self.entries.len();
    }

    fn undo_index(&self) -> Option<usize> {
        (0..self.cursor).rev().find(|&i| self.entries[i].usable)
    }

    fn redo_index(&self) -> Option<usize> {
        (self.cursor..self.entries.len()).find(|&i| self.entries[i].usable)
    }

    pub fn can_undo(&self) -> bool {
        self.undo_index().is_some()
    }

    pub fn can_redo(&self) -> bool {
        self.redo_index().is_some()
    }

    /// 下一次撤销的编辑名称
    pub fn undo_label(&self) -> Option<&str> {
        self.undo_index().map(|i| self.entries[i].label.as_str())
    }

    /// 下一次重做的编辑名称
    pub fn redo_label(&self) -> Option<&str> {
        self.redo_index().map(|i| self.entries[i].label.as_str())
    }

    /// 撤销
    pub fn undo<C: EditContext>(&mut self, ctx: &mut C) -> Result<UndoOutcome, HistoryError> {
        let Some(index) = self.undo_index() else {
            return Ok(UndoOutcome::Nothing);
        };
        let outcome = self.apply(index, Direction::Undo, ctx)?;
        self.cursor = index;
        Ok(outcome)
    }

    /// 重做
    pub fn redo<C: EditContext>(&mut self, ctx: &mut C) -> Result<UndoOutcome, HistoryError> {
        let Some(index) = self.redo_index() else {
            return Ok(UndoOutcome::Nothing);
        };
        let outcome = self.apply(index, Direction::Redo, ctx)?;
        self.cursor = index + 1;
        Ok(outcome)
    }

    fn apply<C: EditContext>(
        &mut self,
        index: usize,
        direction: Direction,
        ctx: &mut C,
    ) -> Result<UndoOutcome, HistoryError> {
        let entry = &mut self.entries[index];
        let result = match &mut entry.kind {
            EntryKind::Single(edit) => apply_edit(edit, direction, ctx),
            EntryKind::Compound(first, second) => apply_compound(first, second, direction, ctx),
            EntryKind::TrackDelete { ids, records } => match direction {
                Direction::Undo => ctx.insert_tracks(records).map(|()| true),
                Direction::Redo => Ok(ctx.remove_tracks(ids) > 0),
            },
        };

        match result {
            Ok(true) => Ok(UndoOutcome::Applied(entry.label.clone())),
            Ok(false) => {
                tracing::warn!("Target of `{}` no longer exists, skipping", entry.label);
                Ok(UndoOutcome::TargetMissing(entry.label.clone()))
            }
            Err(source) => {
                tracing::warn!("Failed to restore `{}`: {}", entry.label, source);
                entry.usable = false;
                Err(HistoryError::RestoreFailed {
                    label: entry.label.clone(),
                    source,
                })
            }
        }
    }
}

/// 应用单条编辑；目标缺失时返回 `Ok(false)`
fn apply_edit<C: EditContext>(edit: &mut Edit, direction: Direction, ctx: &mut C) -> Result<bool, RecordError> {
    match direction {
        Direction::Undo => {
            if edit.after.is_none() {
                edit.after = ctx.capture(&edit.target);
            }
            if edit.after.is_none() {
                return Ok(false);
            }
            ctx.restore(&edit.target, &edit.before)
        }
        Direction::Redo => match &edit.after {
            Some(after) => ctx.restore(&edit.target, after),
            None => Ok(false),
        },
    }
}

/// 先应用A再应用B；B失败时回滚A
fn apply_compound<C: EditContext>(
    first: &mut Edit,
    second: &mut Edit,
    direction: Direction,
    ctx: &mut C,
) -> Result<bool, RecordError> {
    if direction == Direction::Undo {
        if first.after.is_none() {
            first.after = ctx.capture(&first.target);
        }
        if second.after.is_none() {
            second.after = ctx.capture(&second.target);
        }
    }

    let first_applied = apply_edit(first, direction, ctx)?;
    match apply_edit(second, direction, ctx) {
        Ok(second_applied) => Ok(first_applied || second_applied),
        Err(e) => {
            if first_applied {
                let rollback = match direction {
                    Direction::Undo => first.after.as_ref(),
                    Direction::Redo => Some(&first.before),
                };
                if let Some(record) = rollback {
                    if let Err(rollback_err) = ctx.restore(&first.target, record) {
                        tracing::error!("Rollback of first edit failed: {}", rollback_err);
                    }
                }
            }
            Err(e)
        }
    }
}
