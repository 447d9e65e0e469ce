//! Framemark 快照记录
//!
//! 撤销/重做所依赖的结构化读写能力：
//! - `Record`: 带类名、版本的命名字段表
//! - `Value`: 基本值、嵌套记录与数组
//! - `Snapshot`: 对象与记录之间的双向转换

pub mod error;
pub mod record;
pub mod snapshot;

pub use error::RecordError;
pub use record::{Record, Value};
pub use snapshot::Snapshot;
