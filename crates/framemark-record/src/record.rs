//! 结构化记录
//!
//! `Record` 是带类名和版本号的有序字段表，字段值可以是基本类型、
//! 嵌套记录或数组。文本形式使用 JSON，对核心读回的每个字段都是无损的：
//! - 浮点数启用 `float_roundtrip`，保证往返后逐位相同
//! - 非有限浮点数（无穷大、NaN）以文本保存

use crate::error::RecordError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 字段值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Value>),
    Record(Record),
}

impl Value {
    /// 浮点值（非有限值转为文本）
    pub fn float(value: f64) -> Self {
        if value.is_finite() {
            Value::Float(value)
        } else {
            Value::Text(value.to_string())
        }
    }

    /// 无符号整数；超出 `i64` 范围时以十进制文本保存
    pub fn unsigned(value: u64) -> Self {
        match i64::try_from(value) {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Text(value.to_string()),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Int(_) => "an integer",
            Value::Float(_) => "a number",
            Value::Text(_) => "text",
            Value::Array(_) => "an array",
            Value::Record(_) => "a record",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Text(s) => match s.as_str() {
                "inf" => Some(f64::INFINITY),
                "-inf" => Some(f64::NEG_INFINITY),
                "NaN" => Some(f64::NAN),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::unsigned(v)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::unsigned(v as u64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// 结构化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    class: String,
    version: u32,
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(class: impl Into<String>, version: u32) -> Self {
        Self {
            class: class.into(),
            version,
            fields: BTreeMap::new(),
        }
    }

    /// 以构建器方式追加字段
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> &mut Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// 校验类名和版本（版本不得高于 `supported`）
    pub fn expect_class(&self, class: &str, supported: u32) -> Result<(), RecordError> {
        if self.class != class {
            return Err(RecordError::ClassMismatch {
                expected: class.to_string(),
                found: self.class.clone(),
            });
        }
        if self.version > supported {
            return Err(RecordError::UnsupportedVersion {
                class: self.class.clone(),
                found: self.version,
                supported,
            });
        }
        Ok(())
    }

    pub fn require(&self, name: &str) -> Result<&Value, RecordError> {
        self.fields.get(name).ok_or_else(|| RecordError::MissingField {
            class: self.class.clone(),
            field: name.to_string(),
        })
    }

    fn wrong_type(&self, name: &str, expected: &'static str) -> RecordError {
        RecordError::WrongType {
            class: self.class.clone(),
            field: name.to_string(),
            expected,
        }
    }

    /// 构造字段取值错误
    pub fn invalid(&self, name: &str, reason: impl Into<String>) -> RecordError {
        RecordError::InvalidValue {
            class: self.class.clone(),
            field: name.to_string(),
            reason: reason.into(),
        }
    }

    pub fn f64(&self, name: &str) -> Result<f64, RecordError> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| self.wrong_type(name, "a number"))
    }

    pub fn i64(&self, name: &str) -> Result<i64, RecordError> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| self.wrong_type(name, "an integer"))
    }

    pub fn u64(&self, name: &str) -> Result<u64, RecordError> {
        let value = self.require(name)?;
        if let Some(v) = value.as_u64() {
            return Ok(v);
        }
        match value.as_i64() {
            Some(v) => Err(self.invalid(name, format!("{v} is negative"))),
            None => Err(self.wrong_type(name, "an unsigned integer")),
        }
    }

    pub fn usize(&self, name: &str) -> Result<usize, RecordError> {
        let v = self.u64(name)?;
        usize::try_from(v).map_err(|_| self.invalid(name, format!("{v} is not an index")))
    }

    pub fn bool(&self, name: &str) -> Result<bool, RecordError> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| self.wrong_type(name, "a boolean"))
    }

    pub fn text(&self, name: &str) -> Result<&str, RecordError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| self.wrong_type(name, "text"))
    }

    pub fn record(&self, name: &str) -> Result<&Record, RecordError> {
        self.require(name)?
            .as_record()
            .ok_or_else(|| self.wrong_type(name, "a record"))
    }

    /// 可选子记录：缺失或为 null 时返回 `None`
    pub fn opt_record(&self, name: &str) -> Result<Option<&Record>, RecordError> {
        match self.fields.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Record(r)) => Ok(Some(r)),
            Some(_) => Err(self.wrong_type(name, "a record")),
        }
    }

    pub fn array(&self, name: &str) -> Result<&[Value], RecordError> {
        self.require(name)?
            .as_array()
            .ok_or_else(|| self.wrong_type(name, "an array"))
    }

    /// 数组字段中的所有子记录
    pub fn records(&self, name: &str) -> Result<Vec<&Record>, RecordError> {
        self.array(name)?
            .iter()
            .map(|v| v.as_record().ok_or_else(|| self.wrong_type(name, "an array of records")))
            .collect()
    }

    /// 数组字段中的所有非负整数
    pub fn indices(&self, name: &str) -> Result<Vec<usize>, RecordError> {
        self.array(name)?
            .iter()
            .map(|v| {
                v.as_u64()
                    .and_then(|i| usize::try_from(i).ok())
                    .ok_or_else(|| self.wrong_type(name, "an array of indices"))
            })
            .collect()
    }

    /// 转为文本形式
    pub fn to_text(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }

    /// 转为带缩进的文本形式
    pub fn to_text_pretty(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 从文本形式解析
    pub fn from_text(text: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(text)?)
    }
}
