//! 快照能力
//!
//! 每种可撤销对象手写 `to_record` / `from_record`，不使用反射。

use crate::error::RecordError;
use crate::record::Record;

/// 可快照对象
pub trait Snapshot: Sized {
    /// 记录类名
    const CLASS: &'static str;

    /// 当前记录版本
    const VERSION: u32;

    /// 捕获当前状态
    fn to_record(&self) -> Record;

    /// 从记录重建对象
    fn from_record(record: &Record) -> Result<Self, RecordError>;

    /// 将记录应用到已有对象
    ///
    /// 先完整解析再整体替换，解析失败时对象保持不变。
    fn apply_record(&mut self, record: &Record) -> Result<(), RecordError> {
        let restored = Self::from_record(record)?;
        *self = restored;
        Ok(())
    }

    /// 创建带类名和版本的空记录
    fn empty_record() -> Record {
        Record::new(Self::CLASS, Self::VERSION)
    }
}
