// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! A pickle engine for Python's pickle protocols 0 to 5
//!
//! # Pickle format
//!
//! Please see the [Python docs](http://docs.python.org/library/pickle) for
//! details on the Pickle format.
//!
//! Both directions support every protocol from 0 to 5, including framing
//! (protocol 4), out-of-band buffers (protocol 5), persistent ids and the
//! extension registry.
//!
//! # Object graphs
//!
//! Pickle serializes graphs, not trees: objects may be shared and may refer
//! to themselves.  This crate therefore keeps objects in a `Heap` arena and
//! refers to them with `ObjRef` handles.  A `Value` is either an inline atom
//! (None, bool, integer, float) or a handle.  The `Pickler` memoizes objects
//! by handle, and the `Unpickler` rebuilds the same sharing on a fresh heap.
//!
//! Everything that needs knowledge of a host object model (resolving
//! classes, calling constructors, reducing custom objects) goes through the
//! `PickleHooks` and `UnpickleHooks` traits.  `DefaultHooks` implements them
//! as a pure-data host: classes load as `Global` objects and constructed
//! instances as `Reduced` records, which pickle back into the same opcodes.
//!
//! # Exported API
//!
//! `value_to_vec`/`value_to_writer` and `value_from_slice`/`value_from_reader`/
//! `value_from_iter` cover the one-shot cases.  For streams of several pickles,
//! shared memos, hooks or buffers, use `Pickler` and `Unpickler` directly.
//! `Heap::serializable` and `HeapSeed` connect heap values to other serde
//! data formats.
//!
//! ```
//! use pickle_engine::{DeOptions, Heap, SerOptions, Value, value_from_slice, value_to_vec};
//!
//! let mut heap = Heap::new();
//! let list = heap.list(vec![Value::I64(1), Value::I64(2)]);
//! let bytes = value_to_vec(&heap, &list, SerOptions::new()).unwrap();
//! let (heap2, decoded) = value_from_slice(&bytes, DeOptions::new()).unwrap();
//! assert!(heap.equal(&list, &heap2, &decoded));
//! ```

pub use self::ser::{
    Pickler,
    SerOptions,
    value_to_writer,
    value_to_vec,
};

pub use self::de::{
    Unpickler,
    DeOptions,
    DecodeErrors,
    StringEncoding,
    value_from_reader,
    value_from_slice,
    value_from_iter,
};

pub use self::value::{
    Heap,
    Value,
    Object,
    ObjRef,
    HashableValue,
    DictObject,
    SetObject,
    Global,
    Reduction,
    PickleBuffer,
    Repr,
};

pub use self::value_impls::{HeapSeed, Serializable};
pub use self::hooks::{BufferCallback, DefaultHooks, PickleHooks, ReducerOverride, UnpickleHooks};
pub use self::extension::ExtensionRegistry;
pub use self::memo::{MemoArray, MemoTable};
pub use self::error::{Error, ErrorCode, ErrorKind, Result};
pub use self::consts::{DEFAULT_PROTOCOL, HIGHEST_PROTOCOL};

pub mod ser;
pub mod de;
pub mod error;
pub mod value;
pub mod hooks;
pub mod extension;
pub mod memo;
pub mod stack;
pub mod cursor;
mod consts;
mod compat;
mod value_impls;

#[cfg(test)]
#[path = "../test/mod.rs"]
mod test;
