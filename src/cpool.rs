/// CPoolRecord: バイトコード言語の定数プールエントリ
///
/// タグはクローズドな集合で、種類ごとに異なるペイロードを持つ。参照キーは
/// 1つまたは2つの整数からなり、同じキーでの再作成は失敗する。

use crate::error::{CoreError, CoreResult};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CPoolTag {
    Primitive,
    Method,
    Field,
    InstanceOf,
    ArrayLength,
    CheckCast,
    String,
    ClassRef,
}

impl CPoolTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CPoolTag::Primitive => "primitive",
            CPoolTag::Method => "method",
            CPoolTag::Field => "field",
            CPoolTag::InstanceOf => "instanceof",
            CPoolTag::ArrayLength => "arraylength",
            CPoolTag::CheckCast => "checkcast",
            CPoolTag::String => "string",
            CPoolTag::ClassRef => "classref",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CPoolPayload {
    /// primitiveレコード: <value content=N>
    Value(i64),
    /// stringレコード: <data length=N content="hh hh ...">
    Data(Vec<u8>),
    /// method/field/instanceof/arraylength/checkcast/classref: <token content="...">
    Token(String),
}

/// 参照キー: 1つまたは2つの整数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CPoolRef {
    One(u64),
    Two(u64, u64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CPoolRecord {
    pub tag: CPoolTag,
    pub is_constructor: bool,
    pub is_destructor: bool,
    pub payload: CPoolPayload,
    /// 末尾のデータ型参照（型の名前で表す簡略化）
    pub data_type: String,
}

/// 定数プール。参照キーは一意でなければならない。
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    records: HashMap<CPoolRef, CPoolRecord>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指定したキーに新しいレコードを作る。同じキーが既にあれば失敗する。
    pub fn create(&mut self, reference: CPoolRef, record: CPoolRecord) -> CoreResult<()> {
        if self.records.contains_key(&reference) {
            return Err(CoreError::execution(format!(
                "constant pool reference {:?} already exists",
                reference
            )));
        }
        self.records.insert(reference, record);
        Ok(())
    }

    pub fn get(&self, reference: &CPoolRef) -> Option<&CPoolRecord> {
        self.records.get(reference)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
