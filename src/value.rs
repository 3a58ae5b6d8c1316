// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Python values as an arena-allocated object graph.
//!
//! Pickles describe graphs, not trees: objects may be shared and may refer to
//! themselves.  All identity-bearing objects therefore live in a `Heap` and
//! are referred to by `ObjRef` handles; the handle *is* the object's identity
//! for memoization.

use std::fmt;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive};

use crate::error::ErrorCode;

// Hashing deeper nested tuples than this is refused.
const MAX_HASH_DEPTH: usize = 200;

/// Handle of an object inside a `Heap`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> u32 { self.0 }
}

/// A value as seen by the pickler and unpickler.
///
/// Atoms are stored inline and never memoized.  Everything else is a handle
/// into the heap the value belongs to.
///
/// Note on integers: while decoding, all integers that fit into an i64 are
/// stored as `I64`, and `BigInt` is used for the rest.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum Value {
    /// None
    #[default]
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer (unbounded length)
    Int(BigInt),
    /// Float
    F64(f64),
    /// Any object living in the heap
    Ref(ObjRef),
}

impl Value {
    pub fn obj_ref(&self) -> Option<ObjRef> {
        match *self {
            Value::Ref(r) => Some(r),
            _ => None,
        }
    }

    pub fn is_atom(&self) -> bool {
        self.obj_ref().is_none()
    }

    /// Builds an integer value, using `I64` whenever it fits.
    pub fn from_bigint(i: BigInt) -> Value {
        match i.to_i64() {
            Some(v) => Value::I64(v),
            None => Value::Int(i),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value { Value::Bool(b) }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value { Value::I64(i) }
}

impl From<f64> for Value {
    fn from(f: f64) -> Value { Value::F64(f) }
}

impl From<BigInt> for Value {
    fn from(i: BigInt) -> Value { Value::from_bigint(i) }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Value { Value::Ref(r) }
}

/// A reference to a module-level class or function, by name.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Global {
    pub module: String,
    pub name: String,
}

/// How to rebuild an object: `callable(*args)`, followed by optional state
/// and item updates.
#[derive(Clone, Debug, Default)]
pub struct Reduction {
    pub callable: Value,
    /// Must refer to a tuple.
    pub args: Value,
    pub state: Option<Value>,
    pub list_items: Vec<Value>,
    pub dict_items: Vec<(Value, Value)>,
    /// Called as `setter(obj, state)` instead of a BUILD.
    pub state_setter: Option<Value>,
}

impl Reduction {
    pub fn new(callable: Value, args: Value) -> Reduction {
        Reduction { callable, args, ..Reduction::default() }
    }
}

/// A contiguous binary buffer that may travel outside the pickle stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PickleBuffer {
    pub data: Vec<u8>,
    pub readonly: bool,
}

/// Insertion-ordered dictionary with structural key deduplication.
#[derive(Clone, Debug, Default)]
pub struct DictObject {
    entries: Vec<(Value, Value)>,
    index: BTreeMap<HashableValue, usize>,
}

impl DictObject {
    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub fn entries(&self) -> &[(Value, Value)] { &self.entries }

    pub fn get(&self, key: &HashableValue) -> Option<&Value> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    fn insert(&mut self, hkey: HashableValue, key: Value, value: Value) {
        match self.index.get(&hkey) {
            Some(&i) => self.entries[i].1 = value,
            None => {
                self.index.insert(hkey, self.entries.len());
                self.entries.push((key, value));
            }
        }
    }
}

/// Insertion-ordered set with structural deduplication.
#[derive(Clone, Debug, Default)]
pub struct SetObject {
    items: Vec<Value>,
    index: BTreeMap<HashableValue, usize>,
}

impl SetObject {
    pub fn len(&self) -> usize { self.items.len() }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    pub fn items(&self) -> &[Value] { &self.items }

    pub fn contains(&self, key: &HashableValue) -> bool {
        self.index.contains_key(key)
    }

    fn insert(&mut self, hkey: HashableValue, item: Value) {
        if !self.index.contains_key(&hkey) {
            self.index.insert(hkey, self.items.len());
            self.items.push(item);
        }
    }
}

/// An identity-bearing object stored in a `Heap`.
#[derive(Clone, Debug)]
pub enum Object {
    /// Bytestring
    Bytes(Vec<u8>),
    /// Mutable bytestring
    ByteArray(Vec<u8>),
    /// Unicode string
    String(String),
    /// Tuple
    Tuple(Vec<Value>),
    /// List
    List(Vec<Value>),
    /// Dictionary (map)
    Dict(DictObject),
    /// Set
    Set(SetObject),
    /// Frozen (immutable) set
    FrozenSet(SetObject),
    /// Class or function reference
    Global(Global),
    /// Object rebuilt by calling a callable
    Reduced(Box<Reduction>),
    /// Object stored outside the pickle, referred to by id
    PersistentId(Value),
    /// Binary buffer, possibly out-of-band
    Buffer(PickleBuffer),
    /// Host object known only by its type name
    Opaque(String),
}

impl Object {
    pub fn type_name(&self) -> &'static str {
        match *self {
            Object::Bytes(_) => "bytes",
            Object::ByteArray(_) => "bytearray",
            Object::String(_) => "str",
            Object::Tuple(_) => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Set(_) => "set",
            Object::FrozenSet(_) => "frozenset",
            Object::Global(_) => "global",
            Object::Reduced(_) => "object",
            Object::PersistentId(_) => "persistent",
            Object::Buffer(_) => "PickleBuffer",
            Object::Opaque(_) => "opaque",
        }
    }
}

/// Represents all values that can be contained in a "hashable" context
/// (i.e., as dictionary keys and set elements).
///
/// A hashable value is a structural snapshot of a heap value, so that equal
/// keys built in different places deduplicate.  Objects without a value
/// semantics (reduced objects, persistent ids) are keyed by identity.
#[derive(Clone, Debug)]
pub enum HashableValue {
    /// None
    None,
    /// Boolean
    Bool(bool),
    /// Short integer
    I64(i64),
    /// Long integer
    Int(BigInt),
    /// Float
    F64(f64),
    /// Bytestring (or read-only buffer)
    Bytes(Vec<u8>),
    /// Unicode string
    String(String),
    /// Tuple
    Tuple(Vec<HashableValue>),
    /// Frozen (immutable) set
    FrozenSet(BTreeSet<HashableValue>),
    /// Class or function reference
    Global(String, String),
    /// Object hashed by identity
    Object(ObjRef),
}

impl HashableValue {
    /// True if equality of this key does not depend on object identity, so
    /// that it can be compared across heaps.
    pub fn is_structural(&self) -> bool {
        match *self {
            HashableValue::Object(_) => false,
            HashableValue::Tuple(ref v) => v.iter().all(HashableValue::is_structural),
            HashableValue::FrozenSet(ref v) => v.iter().all(HashableValue::is_structural),
            _ => true,
        }
    }
}

/// The arena owning all objects of one object graph.
#[derive(Clone, Debug, Default)]
pub struct Heap {
    objects: Vec<Object>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap { objects: Vec::new() }
    }

    pub fn len(&self) -> usize { self.objects.len() }

    pub fn is_empty(&self) -> bool { self.objects.is_empty() }

    /// Moves an object into the heap.
    pub fn alloc(&mut self, object: Object) -> Value {
        // Handles are 32 bits; memory runs out long before they do.
        let r = ObjRef(self.objects.len() as u32);
        self.objects.push(object);
        Value::Ref(r)
    }

    pub fn get(&self, r: ObjRef) -> Option<&Object> {
        self.objects.get(r.0 as usize)
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut Object> {
        self.objects.get_mut(r.0 as usize)
    }

    pub fn object(&self, r: ObjRef) -> Result<&Object, ErrorCode> {
        self.get(r).ok_or(ErrorCode::DanglingReference(r.0))
    }

    pub fn object_mut(&mut self, r: ObjRef) -> Result<&mut Object, ErrorCode> {
        self.get_mut(r).ok_or(ErrorCode::DanglingReference(r.0))
    }

    /// The object a value refers to, if it is not an atom.
    pub fn deref(&self, value: &Value) -> Option<&Object> {
        value.obj_ref().and_then(|r| self.get(r))
    }

    pub fn as_str(&self, value: &Value) -> Option<&str> {
        match self.deref(value) {
            Some(Object::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_tuple(&self, value: &Value) -> Option<&[Value]> {
        match self.deref(value) {
            Some(Object::Tuple(t)) => Some(t),
            _ => None,
        }
    }

    pub fn as_global(&self, value: &Value) -> Option<&Global> {
        match self.deref(value) {
            Some(Object::Global(g)) => Some(g),
            _ => None,
        }
    }

    /// Python-style type name of a value, for error messages.
    pub fn type_name(&self, value: &Value) -> &'static str {
        match *value {
            Value::None => "NoneType",
            Value::Bool(_) => "bool",
            Value::I64(_) | Value::Int(_) => "int",
            Value::F64(_) => "float",
            Value::Ref(r) => self.get(r).map_or("<dangling>", Object::type_name),
        }
    }

    pub fn bytes(&mut self, b: impl Into<Vec<u8>>) -> Value {
        self.alloc(Object::Bytes(b.into()))
    }

    pub fn bytearray(&mut self, b: impl Into<Vec<u8>>) -> Value {
        self.alloc(Object::ByteArray(b.into()))
    }

    pub fn string(&mut self, s: impl Into<String>) -> Value {
        self.alloc(Object::String(s.into()))
    }

    pub fn tuple(&mut self, items: Vec<Value>) -> Value {
        self.alloc(Object::Tuple(items))
    }

    pub fn list(&mut self, items: Vec<Value>) -> Value {
        self.alloc(Object::List(items))
    }

    pub fn empty_dict(&mut self) -> Value {
        self.alloc(Object::Dict(DictObject::default()))
    }

    pub fn dict(&mut self, entries: Vec<(Value, Value)>) -> Result<Value, ErrorCode> {
        let mut dict = DictObject::default();
        for (key, value) in entries {
            let hkey = self.hashable(&key)?;
            dict.insert(hkey, key, value);
        }
        Ok(self.alloc(Object::Dict(dict)))
    }

    pub fn empty_set(&mut self) -> Value {
        self.alloc(Object::Set(SetObject::default()))
    }

    pub fn set(&mut self, items: Vec<Value>) -> Result<Value, ErrorCode> {
        let set = self.build_set(items)?;
        Ok(self.alloc(Object::Set(set)))
    }

    pub fn frozenset(&mut self, items: Vec<Value>) -> Result<Value, ErrorCode> {
        let set = self.build_set(items)?;
        Ok(self.alloc(Object::FrozenSet(set)))
    }

    fn build_set(&self, items: Vec<Value>) -> Result<SetObject, ErrorCode> {
        let mut set = SetObject::default();
        for item in items {
            let hkey = self.hashable(&item)?;
            set.insert(hkey, item);
        }
        Ok(set)
    }

    pub fn global(&mut self, module: impl Into<String>, name: impl Into<String>) -> Value {
        self.alloc(Object::Global(Global { module: module.into(), name: name.into() }))
    }

    pub fn reduced(&mut self, reduction: Reduction) -> Value {
        self.alloc(Object::Reduced(Box::new(reduction)))
    }

    pub fn persistent_id(&mut self, pid: Value) -> Value {
        self.alloc(Object::PersistentId(pid))
    }

    pub fn buffer(&mut self, data: impl Into<Vec<u8>>, readonly: bool) -> Value {
        self.alloc(Object::Buffer(PickleBuffer { data: data.into(), readonly }))
    }

    pub fn opaque(&mut self, type_name: impl Into<String>) -> Value {
        self.alloc(Object::Opaque(type_name.into()))
    }

    /// Computes the structural key of a value, or fails for unhashable ones.
    pub fn hashable(&self, value: &Value) -> Result<HashableValue, ErrorCode> {
        self.hashable_at(value, 0)
    }

    fn hashable_at(&self, value: &Value, depth: usize) -> Result<HashableValue, ErrorCode> {
        if depth > MAX_HASH_DEPTH {
            return Err(ErrorCode::Recursive);
        }
        let r = match *value {
            Value::None => return Ok(HashableValue::None),
            Value::Bool(b) => return Ok(HashableValue::Bool(b)),
            Value::I64(i) => return Ok(HashableValue::I64(i)),
            Value::Int(ref i) => return Ok(HashableValue::Int(i.clone())),
            Value::F64(f) => return Ok(HashableValue::F64(f)),
            Value::Ref(r) => r,
        };
        match *self.object(r)? {
            Object::Bytes(ref b) => Ok(HashableValue::Bytes(b.clone())),
            Object::String(ref s) => Ok(HashableValue::String(s.clone())),
            Object::Buffer(ref buf) if buf.readonly => Ok(HashableValue::Bytes(buf.data.clone())),
            Object::Tuple(ref items) => items.iter()
                .map(|item| self.hashable_at(item, depth + 1))
                .collect::<Result<_, _>>()
                .map(HashableValue::Tuple),
            Object::FrozenSet(ref set) => set.items.iter()
                .map(|item| self.hashable_at(item, depth + 1))
                .collect::<Result<_, _>>()
                .map(HashableValue::FrozenSet),
            Object::Global(ref g) => Ok(HashableValue::Global(g.module.clone(), g.name.clone())),
            Object::Reduced(_) | Object::PersistentId(_) | Object::Opaque(_) =>
                Ok(HashableValue::Object(r)),
            ref other => Err(ErrorCode::ValueNotHashable(other.type_name())),
        }
    }

    /// `dict[key] = value` on a dict object.
    pub fn dict_set_item(&mut self, dict: ObjRef, key: Value, value: Value) -> Result<(), ErrorCode> {
        let hkey = self.hashable(&key)?;
        match *self.object_mut(dict)? {
            Object::Dict(ref mut d) => {
                d.insert(hkey, key, value);
                Ok(())
            }
            ref other => Err(ErrorCode::InvalidStackTop("dict", other.type_name().into())),
        }
    }

    /// `set.add(item)` on a set or frozenset object.
    pub fn set_add(&mut self, set: ObjRef, item: Value) -> Result<(), ErrorCode> {
        let hkey = self.hashable(&item)?;
        match *self.object_mut(set)? {
            Object::Set(ref mut s) | Object::FrozenSet(ref mut s) => {
                s.insert(hkey, item);
                Ok(())
            }
            ref other => Err(ErrorCode::InvalidStackTop("set", other.type_name().into())),
        }
    }

    /// Structural equality of two object graphs, which may be cyclic.
    ///
    /// Integers compare by value regardless of representation; NaN floats
    /// compare equal to each other.
    pub fn equal(&self, a: &Value, other: &Heap, b: &Value) -> bool {
        self.eq_values(a, other, b, &mut HashSet::new())
    }

    fn eq_values(&self, a: &Value, other: &Heap, b: &Value,
                 seen: &mut HashSet<(ObjRef, ObjRef)>) -> bool {
        match (a, b) {
            (&Value::Ref(ra), &Value::Ref(rb)) => {
                // A pair already under comparison is assumed equal.
                if !seen.insert((ra, rb)) {
                    return true;
                }
                match (self.get(ra), other.get(rb)) {
                    (Some(oa), Some(ob)) => self.eq_objects(oa, other, ob, seen),
                    _ => false,
                }
            }
            (&Value::Ref(_), _) | (_, &Value::Ref(_)) => false,
            _ => atom_eq(a, b),
        }
    }

    fn eq_slices(&self, a: &[Value], other: &Heap, b: &[Value],
                 seen: &mut HashSet<(ObjRef, ObjRef)>) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| self.eq_values(x, other, y, seen))
    }

    fn eq_options(&self, a: &Option<Value>, other: &Heap, b: &Option<Value>,
                  seen: &mut HashSet<(ObjRef, ObjRef)>) -> bool {
        match (a, b) {
            (Some(x), Some(y)) => self.eq_values(x, other, y, seen),
            (None, None) => true,
            _ => false,
        }
    }

    // Finds the index of the entry in `candidates` equal to `key`.
    fn find_key(&self, key: &Value, other: &Heap, candidates: &[&Value],
                index: &BTreeMap<HashableValue, usize>,
                seen: &mut HashSet<(ObjRef, ObjRef)>) -> Option<usize> {
        if let Ok(hkey) = self.hashable(key) {
            if hkey.is_structural() {
                return index.get(&hkey).copied()
                    .filter(|&i| self.eq_values(key, other, candidates[i], seen));
            }
        }
        candidates.iter().position(|candidate| {
            let mut trial = seen.clone();
            self.eq_values(key, other, candidate, &mut trial)
        })
    }

    fn eq_objects(&self, a: &Object, other: &Heap, b: &Object,
                  seen: &mut HashSet<(ObjRef, ObjRef)>) -> bool {
        match (a, b) {
            (Object::Bytes(x), Object::Bytes(y)) => x == y,
            (Object::ByteArray(x), Object::ByteArray(y)) => x == y,
            (Object::String(x), Object::String(y)) => x == y,
            (Object::Global(x), Object::Global(y)) => x == y,
            (Object::Opaque(x), Object::Opaque(y)) => x == y,
            (Object::Buffer(x), Object::Buffer(y)) => x == y,
            (Object::Tuple(x), Object::Tuple(y)) |
            (Object::List(x), Object::List(y)) => self.eq_slices(x, other, y, seen),
            (Object::Set(x), Object::Set(y)) |
            (Object::FrozenSet(x), Object::FrozenSet(y)) => {
                let candidates: Vec<&Value> = y.items.iter().collect();
                x.len() == y.len() && x.items.iter().all(|item| {
                    self.find_key(item, other, &candidates, &y.index, seen).is_some()
                })
            }
            (Object::Dict(x), Object::Dict(y)) => {
                let candidates: Vec<&Value> = y.entries.iter().map(|(k, _)| k).collect();
                x.len() == y.len() && x.entries.iter().all(|(key, value)| {
                    match self.find_key(key, other, &candidates, &y.index, seen) {
                        Some(i) => self.eq_values(value, other, &y.entries[i].1, seen),
                        None => false,
                    }
                })
            }
            (Object::Reduced(x), Object::Reduced(y)) => {
                self.eq_values(&x.callable, other, &y.callable, seen) &&
                    self.eq_values(&x.args, other, &y.args, seen) &&
                    self.eq_options(&x.state, other, &y.state, seen) &&
                    self.eq_slices(&x.list_items, other, &y.list_items, seen) &&
                    x.dict_items.len() == y.dict_items.len() &&
                    x.dict_items.iter().zip(&y.dict_items).all(|((k1, v1), (k2, v2))| {
                        self.eq_values(k1, other, k2, seen) && self.eq_values(v1, other, v2, seen)
                    }) &&
                    self.eq_options(&x.state_setter, other, &y.state_setter, seen)
            }
            (Object::PersistentId(x), Object::PersistentId(y)) => self.eq_values(x, other, y, seen),
            _ => false,
        }
    }

    /// Returns an adapter that displays the value like Python's `repr()`.
    pub fn display<'a>(&'a self, value: &'a Value) -> Repr<'a> {
        Repr { heap: self, value }
    }

    fn write_value(&self, f: &mut fmt::Formatter, value: &Value,
                   parents: &mut Vec<ObjRef>) -> fmt::Result {
        let r = match *value {
            Value::None       => return f.write_str("None"),
            Value::Bool(b)    => return f.write_str(if b { "True" } else { "False" }),
            Value::I64(i)     => return write!(f, "{}", i),
            Value::Int(ref i) => return write!(f, "{}", i),
            Value::F64(v)     => return write_float(f, v),
            Value::Ref(r)     => r,
        };
        let object = match self.get(r) {
            Some(object) => object,
            None => return write!(f, "<dangling #{}>", r.0),
        };
        if parents.contains(&r) {
            return match *object {
                Object::List(_) => f.write_str("[...]"),
                Object::Dict(_) => f.write_str("{...}"),
                _ => f.write_str("..."),
            };
        }
        parents.push(r);
        let result = match *object {
            Object::Bytes(ref b) => write_bytes(f, b),
            Object::ByteArray(ref b) => {
                f.write_str("bytearray(")?;
                write_bytes(f, b)?;
                f.write_str(")")
            }
            Object::String(ref s) => write!(f, "{:?}", s),
            Object::Tuple(ref v) => self.write_elements(f, v.iter(), "(", ")", v.len() == 1, parents),
            Object::List(ref v) => self.write_elements(f, v.iter(), "[", "]", false, parents),
            Object::Set(ref v) => if v.is_empty() {
                f.write_str("set()")
            } else {
                self.write_elements(f, v.items.iter(), "{", "}", false, parents)
            },
            Object::FrozenSet(ref v) => if v.is_empty() {
                f.write_str("frozenset()")
            } else {
                self.write_elements(f, v.items.iter(), "frozenset({", "})", false, parents)
            },
            Object::Dict(ref v) => {
                f.write_str("{")?;
                for (i, (key, value)) in v.entries.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    self.write_value(f, key, parents)?;
                    f.write_str(": ")?;
                    self.write_value(f, value, parents)?;
                }
                f.write_str("}")
            }
            Object::Global(ref g) => write!(f, "{}.{}", g.module, g.name),
            Object::Reduced(ref red) => {
                f.write_str("<reduce ")?;
                self.write_value(f, &red.callable, parents)?;
                f.write_str(" ")?;
                self.write_value(f, &red.args, parents)?;
                if let Some(ref state) = red.state {
                    f.write_str(" state=")?;
                    self.write_value(f, state, parents)?;
                }
                f.write_str(">")
            }
            Object::PersistentId(ref pid) => {
                f.write_str("<persistent ")?;
                self.write_value(f, pid, parents)?;
                f.write_str(">")
            }
            Object::Buffer(ref buf) => {
                f.write_str("PickleBuffer(")?;
                write_bytes(f, &buf.data)?;
                f.write_str(if buf.readonly { ", readonly)" } else { ")" })
            }
            Object::Opaque(ref name) => write!(f, "<{} object>", name),
        };
        parents.pop();
        result
    }

    fn write_elements<'a, I>(&self, f: &mut fmt::Formatter, it: I,
                             prefix: &'static str, suffix: &'static str,
                             always_comma: bool, parents: &mut Vec<ObjRef>) -> fmt::Result
        where I: Iterator<Item=&'a Value>
    {
        f.write_str(prefix)?;
        for (i, item) in it.enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            self.write_value(f, item, parents)?;
        }
        if always_comma {
            f.write_str(",")?;
        }
        f.write_str(suffix)
    }
}

/// Displays a heap value like Python's `repr()`.
pub struct Repr<'a> {
    heap: &'a Heap,
    value: &'a Value,
}

impl fmt::Display for Repr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.heap.write_value(f, self.value, &mut Vec::new())
    }
}

fn write_float(f: &mut fmt::Formatter, v: f64) -> fmt::Result {
    if v.is_nan() {
        f.write_str("nan")
    } else if v.is_infinite() {
        f.write_str(if v > 0.0 { "inf" } else { "-inf" })
    } else {
        write!(f, "{:?}", v)
    }
}

fn write_bytes(f: &mut fmt::Formatter, b: &[u8]) -> fmt::Result {
    f.write_str("b'")?;
    for &byte in b {
        match byte {
            b'\\' => f.write_str("\\\\")?,
            b'\'' => f.write_str("\\'")?,
            b'\t' => f.write_str("\\t")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            0x20..=0x7e => write!(f, "{}", byte as char)?,
            _ => write!(f, "\\x{:02x}", byte)?,
        }
    }
    f.write_str("'")
}

fn atom_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::F64(x), Value::F64(y)) => x == y || (x.is_nan() && y.is_nan()),
        (Value::I64(x), Value::I64(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::I64(x), Value::Int(y)) | (Value::Int(y), Value::I64(x)) => BigInt::from(*x) == *y,
        _ => false,
    }
}

impl PartialEq for HashableValue {
    fn eq(&self, other: &HashableValue) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HashableValue {}

impl PartialOrd for HashableValue {
    fn partial_cmp(&self, other: &HashableValue) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Implement a (more or less) consistent ordering for `HashableValue`s
/// so that they can be used as keys of the B-tree indices.
///
/// Also, like in Python, numeric values with the same value (integral or not)
/// must compare equal.
///
/// For other types, we define an ordering between all types A and B so that all
/// objects of type A are always lesser than objects of type B.  This is done
/// similar to Python 2's ordering of different types.
impl Ord for HashableValue {
    fn cmp(&self, other: &HashableValue) -> Ordering {
        use self::HashableValue::*;
        match *self {
            None => match *other {
                None => Ordering::Equal,
                _    => Ordering::Less
            },
            Bool(b) => match *other {
                None         => Ordering::Greater,
                Bool(b2)     => b.cmp(&b2),
                I64(i2)      => (b as i64).cmp(&i2),
                Int(ref bi)  => BigInt::from(b as i64).cmp(bi),
                F64(f)       => float_ord(b as i64 as f64, f),
                _            => Ordering::Less
            },
            I64(i) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => i.cmp(&(b as i64)),
                I64(i2)      => i.cmp(&i2),
                Int(ref bi)  => BigInt::from(i).cmp(bi),
                F64(f)       => float_ord(i as f64, f),
                _            => Ordering::Less
            },
            Int(ref bi) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => bi.cmp(&BigInt::from(b as i64)),
                I64(i)       => bi.cmp(&BigInt::from(i)),
                Int(ref bi2) => bi.cmp(bi2),
                F64(f)       => float_bigint_ord(bi, f),
                _            => Ordering::Less
            },
            F64(f) => match *other {
                None         => Ordering::Greater,
                Bool(b)      => float_ord(f, b as i64 as f64),
                I64(i)       => float_ord(f, i as f64),
                Int(ref bi)  => float_bigint_ord(bi, f).reverse(),
                F64(f2)      => float_ord(f, f2),
                _            => Ordering::Less
            },
            Bytes(ref bs) => match *other {
                None | Bool(_) | I64(_) | Int(_) | F64(_) => Ordering::Greater,
                Bytes(ref bs2) => bs.cmp(bs2),
                _              => Ordering::Less
            },
            String(ref s) => match *other {
                None | Bool(_) | I64(_) | Int(_) | F64(_) | Bytes(_) => Ordering::Greater,
                String(ref s2) => s.cmp(s2),
                _              => Ordering::Less
            },
            FrozenSet(ref s) => match *other {
                Tuple(_) | Global(..) | Object(_) => Ordering::Less,
                FrozenSet(ref s2) => s.cmp(s2),
                _                 => Ordering::Greater
            },
            Tuple(ref t) => match *other {
                Global(..) | Object(_) => Ordering::Less,
                Tuple(ref t2) => t.cmp(t2),
                _             => Ordering::Greater
            },
            Global(ref m, ref n) => match *other {
                Object(_) => Ordering::Less,
                Global(ref m2, ref n2) => (m, n).cmp(&(m2, n2)),
                _ => Ordering::Greater
            },
            Object(r) => match *other {
                Object(r2) => r.cmp(&r2),
                _ => Ordering::Greater
            },
        }
    }
}

/// A "reasonable" total ordering for floats.
fn float_ord(f: f64, g: f64) -> Ordering {
    match f.partial_cmp(&g) {
        Some(o) => o,
        None    => Ordering::Less
    }
}

/// Ordering between floats and big integers.
fn float_bigint_ord(bi: &BigInt, g: f64) -> Ordering {
    match bi.to_f64() {
        Some(f) => float_ord(f, g),
        None => if bi.is_positive() { Ordering::Greater } else { Ordering::Less }
    }
}
