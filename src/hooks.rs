// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Host collaborators of the pickler and unpickler.
//!
//! The engines know nothing about how a host represents its objects.  Every
//! question that needs host knowledge (which class a name refers to, how to
//! construct an object, how an object reduces itself) goes through these
//! traits.  `DefaultHooks` answers them with plain data: classes become
//! `Global` objects and constructed instances become `Reduced` records, so
//! that any stream can be loaded, inspected and written back.
//!
//! Hook methods return bare `ErrorCode`s; the engines attach the stream
//! position (unpickling) or wrap them as pickling errors.

use crate::error::ErrorCode;
use crate::value::{Heap, Object, ObjRef, PickleBuffer, Reduction, Value};

/// Decides, for objects without a built-in encoding, how to write them.
pub type ReducerOverride = Box<dyn FnMut(&Heap, ObjRef) -> Result<Option<Reduction>, ErrorCode>>;

/// Decides whether a buffer is written in-band (`true`) or out-of-band.
pub type BufferCallback = Box<dyn FnMut(&PickleBuffer) -> bool>;

/// Questions the pickler asks the host.
///
/// Values inside returned reductions must refer to objects of the heap being
/// pickled; hosts that need fresh objects allocate them before the dump.
pub trait PickleHooks {
    /// Returns the persistent id to write instead of `value`, if any.
    ///
    /// Protocol 0 writes the id as a text line, so only ASCII strings and
    /// integers are accepted there, and both load back as strings.  Binary
    /// protocols pickle the id as an ordinary value.
    fn persistent_id(&mut self, heap: &Heap, value: &Value) -> Result<Option<Value>, ErrorCode> {
        match heap.deref(value) {
            Some(Object::PersistentId(pid)) => Ok(Some(pid.clone())),
            _ => Ok(None),
        }
    }

    /// Reduces an object that has no built-in encoding.
    fn reduce(&mut self, _heap: &Heap, _obj: ObjRef) -> Result<Option<Reduction>, ErrorCode> {
        Ok(None)
    }
}

/// Questions the unpickler asks the host.
///
/// The provided methods implement the pure-data behavior of `DefaultHooks`;
/// implementors override what they need and may delegate the rest to
/// `DefaultHooks`.
pub trait UnpickleHooks {
    /// Resolves GLOBAL, STACK_GLOBAL, INST and EXT references.
    fn find_class(&mut self, heap: &mut Heap, module: &str, name: &str) -> Result<Value, ErrorCode> {
        let valid = !module.is_empty()
            && !module.contains('\n')
            && name.split('.').all(|part| !part.is_empty() && part != "<locals>");
        if !valid {
            return Err(ErrorCode::MalformedGlobal(format!("{}.{}", module, name)));
        }
        Ok(heap.global(module, name))
    }

    /// Calls `callable(*args)` for REDUCE, INST and OBJ.
    fn call(&mut self, heap: &mut Heap, callable: Value, args: Value) -> Result<Value, ErrorCode> {
        let items = match heap.as_tuple(&args) {
            Some(items) => items.to_vec(),
            None => return Err(ErrorCode::InvalidStackTop("tuple", heap.type_name(&args).into())),
        };
        let (module, name) = match heap.as_global(&callable) {
            Some(g) => (g.module.clone(), g.name.clone()),
            None => return Ok(heap.reduced(Reduction::new(callable, args))),
        };
        let result = match (module.as_str(), name.as_str()) {
            ("builtins", "set") => match collect_items(heap, &items)? {
                Some(elements) => Some(heap.set(elements)?),
                None => None,
            },
            ("builtins", "frozenset") => match collect_items(heap, &items)? {
                Some(elements) => Some(heap.frozenset(elements)?),
                None => None,
            },
            ("builtins", "bytes") => bytes_argument(heap, &items)?.map(|b| heap.bytes(b)),
            ("builtins", "bytearray") => bytes_argument(heap, &items)?.map(|b| heap.bytearray(b)),
            ("_codecs", "encode") => match items.as_slice() {
                [text, encoding] => match (heap.as_str(text), heap.as_str(encoding)) {
                    (Some(text), Some(encoding)) => encode_str(text, encoding)?.map(|b| heap.bytes(b)),
                    _ => None,
                },
                _ => None,
            },
            ("builtins", "getattr") => match items.as_slice() {
                [parent, attr] => match (heap.as_global(parent), heap.as_str(attr)) {
                    (Some(g), Some(attr)) => {
                        let (module, name) = (g.module.clone(), format!("{}.{}", g.name, attr));
                        Some(self.find_class(heap, &module, &name)?)
                    }
                    _ => None,
                },
                _ => None,
            },
            (_, "__newobj__") if !items.is_empty() => {
                let rest = heap.tuple(items[1..].to_vec());
                Some(self.new_object(heap, items[0].clone(), rest, None)?)
            }
            (_, "__newobj_ex__") if items.len() == 3 => {
                Some(self.new_object(heap, items[0].clone(), items[1].clone(), Some(items[2].clone()))?)
            }
            _ => None,
        };
        match result {
            Some(value) => Ok(value),
            None => Ok(heap.reduced(Reduction::new(callable, args))),
        }
    }

    /// Builds `cls.__new__(cls, *args, **kwargs)` for NEWOBJ and NEWOBJ_EX.
    fn new_object(&mut self, heap: &mut Heap, cls: Value, args: Value,
                  kwargs: Option<Value>) -> Result<Value, ErrorCode> {
        if heap.as_global(&cls).is_none() {
            return Err(ErrorCode::InvalidStackTop("class", heap.type_name(&cls).into()));
        }
        let reduction = match kwargs {
            None => {
                let mut items = vec![cls];
                items.extend(heap.as_tuple(&args).unwrap_or_default().iter().cloned());
                let callable = heap.global("copyreg", "__newobj__");
                Reduction::new(callable, heap.tuple(items))
            }
            Some(kwargs) => {
                let callable = heap.global("copyreg", "__newobj_ex__");
                Reduction::new(callable, heap.tuple(vec![cls, args, kwargs]))
            }
        };
        Ok(heap.reduced(reduction))
    }

    /// Applies BUILD state to an object.
    fn set_state(&mut self, heap: &mut Heap, obj: &Value, state: Value) -> Result<(), ErrorCode> {
        reduced_target(heap, obj, "object")?.state = Some(state);
        Ok(())
    }

    /// APPEND/APPENDS on something that is not a list.
    fn extend(&mut self, heap: &mut Heap, target: &Value, items: Vec<Value>) -> Result<(), ErrorCode> {
        reduced_target(heap, target, "list")?.list_items.extend(items);
        Ok(())
    }

    /// SETITEM/SETITEMS on something that is not a dict.
    fn set_items(&mut self, heap: &mut Heap, target: &Value,
                 items: Vec<(Value, Value)>) -> Result<(), ErrorCode> {
        reduced_target(heap, target, "dict")?.dict_items.extend(items);
        Ok(())
    }

    /// ADDITEMS on something that is not a set.
    fn add_items(&mut self, heap: &mut Heap, target: &Value, _items: Vec<Value>) -> Result<(), ErrorCode> {
        Err(ErrorCode::InvalidStackTop("set", heap.type_name(target).into()))
    }

    /// Resolves PERSID and BINPERSID references.
    fn persistent_load(&mut self, heap: &mut Heap, pid: Value) -> Result<Value, ErrorCode> {
        Ok(heap.persistent_id(pid))
    }
}

/// The pure-data host: see the module documentation.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultHooks;

impl PickleHooks for DefaultHooks {}

impl UnpickleHooks for DefaultHooks {}

fn reduced_target<'h>(heap: &'h mut Heap, target: &Value,
                      expected: &'static str) -> Result<&'h mut Reduction, ErrorCode> {
    let name = heap.type_name(target);
    match target.obj_ref().and_then(|r| heap.get_mut(r)) {
        Some(Object::Reduced(red)) => Ok(red),
        _ => Err(ErrorCode::InvalidStackTop(expected, name.into())),
    }
}

// The elements of the single iterable argument of set() or frozenset().
fn collect_items(heap: &Heap, args: &[Value]) -> Result<Option<Vec<Value>>, ErrorCode> {
    match args {
        [] => Ok(Some(Vec::new())),
        [iterable] => Ok(match heap.deref(iterable) {
            Some(Object::List(items)) | Some(Object::Tuple(items)) => Some(items.clone()),
            Some(Object::Set(set)) | Some(Object::FrozenSet(set)) => Some(set.items().to_vec()),
            _ => None,
        }),
        _ => Ok(None),
    }
}

// The payload of bytes() or bytearray() calls.
fn bytes_argument(heap: &Heap, args: &[Value]) -> Result<Option<Vec<u8>>, ErrorCode> {
    match args {
        [] => Ok(Some(Vec::new())),
        [source] => Ok(match heap.deref(source) {
            Some(Object::Bytes(b)) | Some(Object::ByteArray(b)) => Some(b.clone()),
            Some(Object::Buffer(buf)) => Some(buf.data.clone()),
            _ => None,
        }),
        [text, encoding] => match (heap.as_str(text), heap.as_str(encoding)) {
            (Some(text), Some(encoding)) => encode_str(text, encoding),
            _ => Ok(None),
        },
        _ => Ok(None),
    }
}

/// Encodes a string with one of the codecs pickles use for bytes.
pub(crate) fn encode_str(text: &str, encoding: &str) -> Result<Option<Vec<u8>>, ErrorCode> {
    match encoding.to_ascii_lowercase().replace('_', "-").as_str() {
        "latin1" | "latin-1" | "iso-8859-1" | "l1" => text.chars()
            .map(|ch| u8::try_from(u32::from(ch)).map_err(|_| ErrorCode::StringDecode("latin-1")))
            .collect::<Result<_, _>>()
            .map(Some),
        "utf8" | "utf-8" => Ok(Some(text.as_bytes().to_vec())),
        "ascii" | "us-ascii" => if text.is_ascii() {
            Ok(Some(text.as_bytes().to_vec()))
        } else {
            Err(ErrorCode::StringDecode("ascii"))
        },
        _ => Ok(None),
    }
}
