// Copyright (c) 2015-2016 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Serialize/Deserialize bridges between heap values and serde data formats.

use std::fmt;
use std::result::Result as StdResult;
use num_bigint::BigInt;
use num_traits::ToPrimitive;
use serde::{de, ser};
use serde::de::{DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};

use crate::consts::DEFAULT_RECURSION_LIMIT;
use crate::error::ErrorCode;
use crate::value::{Heap, Object, ObjRef, Value};

// The chain of objects currently being serialized.
struct Path<'a> {
    obj: ObjRef,
    depth: usize,
    parent: Option<&'a Path<'a>>,
}

impl Path<'_> {
    fn contains(&self, obj: ObjRef) -> bool {
        let mut node = Some(self);
        while let Some(path) = node {
            if path.obj == obj {
                return true;
            }
            node = path.parent;
        }
        false
    }
}

/// A heap value viewed as a serde `Serialize` tree.
///
/// Recursive references cannot be expressed in serde's data model and fail
/// with a `Recursive` error.
pub struct Serializable<'a> {
    heap: &'a Heap,
    value: &'a Value,
    path: Option<&'a Path<'a>>,
}

impl Heap {
    /// Returns an adapter that serializes `value` with serde.
    ///
    /// None becomes unit, tuples, lists and sets become sequences, dicts
    /// become maps, globals become `"module.name"` strings and reduced
    /// objects become maps of their parts.
    pub fn serializable<'a>(&'a self, value: &'a Value) -> Serializable<'a> {
        Serializable { heap: self, value, path: None }
    }
}

impl<'a> Serializable<'a> {
    fn child<'b>(&'b self, value: &'b Value, path: &'b Path<'b>) -> Serializable<'b> {
        Serializable { heap: self.heap, value, path: Some(path) }
    }
}

impl ser::Serialize for Serializable<'_> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        let r = match *self.value {
            Value::None => return serializer.serialize_unit(),
            Value::Bool(b) => return serializer.serialize_bool(b),
            Value::I64(i) => return serializer.serialize_i64(i),
            Value::Int(ref i) => return serialize_bigint(i, serializer),
            Value::F64(f) => return serializer.serialize_f64(f),
            Value::Ref(r) => r,
        };
        let depth = self.path.map_or(0, |p| p.depth + 1);
        if self.path.map_or(false, |p| p.contains(r)) {
            return Err(ser::Error::custom(ErrorCode::Recursive));
        }
        if depth > DEFAULT_RECURSION_LIMIT {
            return Err(ser::Error::custom(ErrorCode::RecursionLimit));
        }
        let path = Path { obj: r, depth, parent: self.path };
        let object = self.heap.object(r).map_err(ser::Error::custom)?;
        match *object {
            Object::Bytes(ref b) | Object::ByteArray(ref b) => serializer.serialize_bytes(b),
            Object::Buffer(ref buf) => serializer.serialize_bytes(&buf.data),
            Object::String(ref s) => serializer.serialize_str(s),
            Object::Tuple(ref items) | Object::List(ref items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(&self.child(item, &path))?;
                }
                seq.end()
            }
            Object::Set(ref set) | Object::FrozenSet(ref set) => {
                let mut seq = serializer.serialize_seq(Some(set.len()))?;
                for item in set.items() {
                    seq.serialize_element(&self.child(item, &path))?;
                }
                seq.end()
            }
            Object::Dict(ref dict) => {
                let mut map = serializer.serialize_map(Some(dict.len()))?;
                for (key, value) in dict.entries() {
                    map.serialize_entry(&self.child(key, &path), &self.child(value, &path))?;
                }
                map.end()
            }
            Object::Global(ref g) => serializer.collect_str(&format_args!("{}.{}", g.module, g.name)),
            Object::Reduced(ref red) => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("callable", &self.child(&red.callable, &path))?;
                map.serialize_entry("args", &self.child(&red.args, &path))?;
                if let Some(ref state) = red.state {
                    map.serialize_entry("state", &self.child(state, &path))?;
                }
                if !red.list_items.is_empty() {
                    let items = Items { owner: self, path: &path, items: &red.list_items };
                    map.serialize_entry("listitems", &items)?;
                }
                if !red.dict_items.is_empty() {
                    let items = Pairs { owner: self, path: &path, items: &red.dict_items };
                    map.serialize_entry("dictitems", &items)?;
                }
                map.end()
            }
            Object::PersistentId(ref pid) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("persistent_id", &self.child(pid, &path))?;
                map.end()
            }
            Object::Opaque(ref name) => Err(ser::Error::custom(ErrorCode::UnpicklableType(name.clone()))),
        }
    }
}

struct Items<'a> {
    owner: &'a Serializable<'a>,
    path: &'a Path<'a>,
    items: &'a [Value],
}

impl ser::Serialize for Items<'_> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter().map(|item| self.owner.child(item, self.path)))
    }
}

struct Pairs<'a> {
    owner: &'a Serializable<'a>,
    path: &'a Path<'a>,
    items: &'a [(Value, Value)],
}

impl ser::Serialize for Pairs<'_> {
    fn serialize<S: ser::Serializer>(&self, serializer: S) -> StdResult<S::Ok, S::Error> {
        serializer.collect_map(self.items.iter().map(|(key, value)| {
            (self.owner.child(key, self.path), self.owner.child(value, self.path))
        }))
    }
}

fn serialize_bigint<S: ser::Serializer>(i: &BigInt, serializer: S) -> StdResult<S::Ok, S::Error> {
    if let Some(v) = i.to_i64() {
        serializer.serialize_i64(v)
    } else if let Some(v) = i.to_u64() {
        serializer.serialize_u64(v)
    } else if let Some(v) = i.to_i128() {
        serializer.serialize_i128(v)
    } else if let Some(v) = i.to_u128() {
        serializer.serialize_u128(v)
    } else {
        Err(ser::Error::custom(ErrorCode::Overflow("integer too large for the data format")))
    }
}

/// Builds heap values from any serde data format.
///
/// Sequences become lists and maps become dicts; unsigned integers beyond
/// `i64` become big integers.
pub struct HeapSeed<'h> {
    heap: &'h mut Heap,
}

impl<'h> HeapSeed<'h> {
    pub fn new(heap: &'h mut Heap) -> HeapSeed<'h> {
        HeapSeed { heap }
    }
}

impl<'de> DeserializeSeed<'de> for HeapSeed<'_> {
    type Value = Value;

    fn deserialize<D: de::Deserializer<'de>>(self, deserializer: D) -> StdResult<Value, D::Error> {
        deserializer.deserialize_any(HeapVisitor { heap: self.heap })
    }
}

struct HeapVisitor<'h> {
    heap: &'h mut Heap,
}

impl<'de> Visitor<'de> for HeapVisitor<'_> {
    type Value = Value;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("any value")
    }

    #[inline]
    fn visit_bool<E>(self, value: bool) -> StdResult<Value, E> {
        Ok(Value::Bool(value))
    }

    #[inline]
    fn visit_i64<E>(self, value: i64) -> StdResult<Value, E> {
        Ok(Value::I64(value))
    }

    #[inline]
    fn visit_u64<E>(self, value: u64) -> StdResult<Value, E> {
        Ok(Value::from_bigint(BigInt::from(value)))
    }

    fn visit_i128<E>(self, value: i128) -> StdResult<Value, E> {
        Ok(Value::from_bigint(BigInt::from(value)))
    }

    fn visit_u128<E>(self, value: u128) -> StdResult<Value, E> {
        Ok(Value::from_bigint(BigInt::from(value)))
    }

    #[inline]
    fn visit_f64<E>(self, value: f64) -> StdResult<Value, E> {
        Ok(Value::F64(value))
    }

    #[inline]
    fn visit_str<E: de::Error>(self, value: &str) -> StdResult<Value, E> {
        Ok(self.heap.string(value))
    }

    #[inline]
    fn visit_string<E>(self, value: String) -> StdResult<Value, E> {
        Ok(self.heap.string(value))
    }

    #[inline]
    fn visit_bytes<E: de::Error>(self, value: &[u8]) -> StdResult<Value, E> {
        Ok(self.heap.bytes(value))
    }

    #[inline]
    fn visit_byte_buf<E: de::Error>(self, value: Vec<u8>) -> StdResult<Value, E> {
        Ok(self.heap.bytes(value))
    }

    #[inline]
    fn visit_none<E>(self) -> StdResult<Value, E> {
        Ok(Value::None)
    }

    #[inline]
    fn visit_some<D: de::Deserializer<'de>>(self, deserializer: D) -> StdResult<Value, D::Error> {
        HeapSeed { heap: self.heap }.deserialize(deserializer)
    }

    #[inline]
    fn visit_unit<E>(self) -> StdResult<Value, E> {
        Ok(Value::None)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> StdResult<Value, A::Error> {
        let heap = self.heap;
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element_seed(HeapSeed { heap: &mut *heap })? {
            items.push(item);
        }
        Ok(heap.list(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> StdResult<Value, A::Error> {
        let heap = self.heap;
        let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0).min(4096));
        while let Some(key) = map.next_key_seed(HeapSeed { heap: &mut *heap })? {
            let value = map.next_value_seed(HeapSeed { heap: &mut *heap })?;
            entries.push((key, value));
        }
        heap.dict(entries).map_err(de::Error::custom)
    }
}
