// Copyright (c) 2015-2016 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Pickle serialization
//!
//! The `Pickler` walks an object graph living in a `Heap` and writes the
//! opcodes that rebuild it.  Objects are memoized by their heap handle, so
//! shared and self-referencing objects are written once and referred back
//! to afterwards.
//!
//! Output is collected in a buffer and handed to the sink whenever a frame
//! (protocol 4 and up) is complete, and at the end of every `dump`.  Large
//! binary payloads skip the buffer and go straight to the sink.

use std::borrow::Cow;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use num_bigint::BigInt;

use super::compat;
use super::consts::*;
use super::cursor::BufferCursor;
use super::error::{Error, ErrorCode, Result};
use super::extension::ExtensionRegistry;
use super::hooks::{BufferCallback, DefaultHooks, PickleHooks, ReducerOverride};
use super::memo::MemoTable;
use super::value::{DictObject, Heap, Object, ObjRef, PickleBuffer, Reduction, SetObject, Value};

/// Options for pickling.
#[derive(Clone, Debug)]
pub struct SerOptions {
    protocol: i32,
    fix_imports: bool,
    fast: bool,
    recursion_limit: usize,
}

impl Default for SerOptions {
    fn default() -> Self {
        SerOptions {
            protocol: DEFAULT_PROTOCOL as i32,
            fix_imports: true,
            fast: false,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
        }
    }
}

impl SerOptions {
    /// Construct with default options:
    ///
    /// - protocol 4
    /// - map Python 3 names to Python 2 names for protocols below 3
    /// - memoize objects
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the protocol to write; negative means the highest one.
    pub fn proto(mut self, protocol: i32) -> Self {
        self.protocol = protocol;
        self
    }

    /// Write global names exactly as they are, even for old protocols.
    pub fn no_fix_imports(mut self) -> Self {
        self.fix_imports = false;
        self
    }

    /// Disable memoization.  Shared objects are then written repeatedly,
    /// and cyclic structures fail instead of being written.
    pub fn fast(mut self) -> Self {
        self.fast = true;
        self
    }

    /// Limit how deeply nested the pickled structure may be.
    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.recursion_limit = limit;
        self
    }
}

fn pickle_error<T>(code: ErrorCode) -> Result<T> {
    Err(Error::Pickle(code))
}

fn check_protocol(protocol: i32) -> Result<u8> {
    if protocol < 0 {
        Ok(HIGHEST_PROTOCOL)
    } else if protocol > HIGHEST_PROTOCOL as i32 {
        pickle_error(ErrorCode::UnsupportedProtocol(protocol as i64))
    } else {
        Ok(protocol as u8)
    }
}

/// Something to be written: either a heap value, or a helper object that
/// only exists in the stream (never memoized).
#[derive(Clone, Debug)]
enum Operand<'a> {
    Value(&'a Value),
    Global(&'a str, &'a str),
    Str(Cow<'a, str>),
    Bytes(&'a [u8]),
    Tuple(Vec<Operand<'a>>),
    List(&'a [Value]),
}

/// A reduction, flattened for writing.
struct ReduceParts<'a> {
    callable: Operand<'a>,
    args: Vec<Operand<'a>>,
    /// The argument tuple as a heap object, if there is one.
    args_tuple: Option<&'a Value>,
    state: Option<&'a Value>,
    list_items: &'a [Value],
    dict_items: &'a [(Value, Value)],
    state_setter: Option<&'a Value>,
}

impl<'a> ReduceParts<'a> {
    fn call(callable: Operand<'a>, args: Vec<Operand<'a>>) -> Self {
        ReduceParts {
            callable,
            args,
            args_tuple: None,
            state: None,
            list_items: &[],
            dict_items: &[],
            state_setter: None,
        }
    }

    fn from_reduction(heap: &'a Heap, red: &'a Reduction) -> Result<Self> {
        let args = match heap.as_tuple(&red.args) {
            Some(args) => args,
            None => return pickle_error(ErrorCode::InvalidValue(format!(
                "reduction arguments must be a tuple, not {}", heap.type_name(&red.args)))),
        };
        Ok(ReduceParts {
            callable: Operand::Value(&red.callable),
            args: args.iter().map(Operand::Value).collect(),
            args_tuple: Some(&red.args),
            state: red.state.as_ref(),
            list_items: &red.list_items,
            dict_items: &red.dict_items,
            state_setter: red.state_setter.as_ref(),
        })
    }
}

/// A structure for writing object graphs into a pickle stream.
pub struct Pickler<W: io::Write> {
    sink: W,
    output: Vec<u8>,
    written: usize,
    proto: u8,
    bin: bool,
    framing: bool,
    frame_start: Option<usize>,
    fix_imports: bool,
    fast: bool,
    fast_nesting: usize,
    fast_memo: HashSet<ObjRef>,
    depth: usize,
    recursion_limit: usize,
    memo: MemoTable,
    hooks: Box<dyn PickleHooks>,
    registry: Arc<ExtensionRegistry>,
    reducer_override: Option<ReducerOverride>,
    buffer_callback: Option<BufferCallback>,
}

impl<W: io::Write> Pickler<W> {
    /// Creates a pickler with default options.
    pub fn new(sink: W) -> Pickler<W> {
        Pickler {
            sink,
            output: Vec::with_capacity(WRITE_BUF_SIZE),
            written: 0,
            proto: DEFAULT_PROTOCOL,
            bin: true,
            framing: false,
            frame_start: None,
            fix_imports: true,
            fast: false,
            fast_nesting: 0,
            fast_memo: HashSet::new(),
            depth: 0,
            recursion_limit: DEFAULT_RECURSION_LIMIT,
            memo: MemoTable::new(),
            hooks: Box::new(DefaultHooks),
            registry: ExtensionRegistry::shared(),
            reducer_override: None,
            buffer_callback: None,
        }
    }

    pub fn with_options(sink: W, options: SerOptions) -> Result<Pickler<W>> {
        let mut pickler = Pickler::new(sink);
        pickler.set_protocol(options.protocol)?;
        pickler.fix_imports = options.fix_imports;
        pickler.fast = options.fast;
        pickler.recursion_limit = options.recursion_limit;
        Ok(pickler)
    }

    /// Selects the protocol for following dumps; negative means the highest.
    pub fn set_protocol(&mut self, protocol: i32) -> Result<()> {
        self.proto = check_protocol(protocol)?;
        self.bin = self.proto >= 1;
        Ok(())
    }

    pub fn protocol(&self) -> u8 {
        self.proto
    }

    pub fn set_fast(&mut self, fast: bool) {
        self.fast = fast;
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn PickleHooks>) {
        self.hooks = hooks;
    }

    pub fn set_registry(&mut self, registry: Arc<ExtensionRegistry>) {
        self.registry = registry;
    }

    /// Installs a reducer consulted before all other means for objects
    /// without a built-in encoding.  It is dropped at the end of the next
    /// `dump`, successful or not.
    pub fn set_reducer_override<F>(&mut self, reducer: F)
        where F: FnMut(&Heap, ObjRef) -> std::result::Result<Option<Reduction>, ErrorCode> + 'static
    {
        self.reducer_override = Some(Box::new(reducer));
    }

    /// Installs the callback deciding which buffers go out-of-band.
    pub fn set_buffer_callback<F>(&mut self, callback: F) -> Result<()>
        where F: FnMut(&PickleBuffer) -> bool + 'static
    {
        if self.proto < 5 {
            return pickle_error(ErrorCode::InvalidValue("buffer_callback needs protocol >= 5".into()));
        }
        self.buffer_callback = Some(Box::new(callback));
        Ok(())
    }

    pub fn clear_memo(&mut self) {
        self.memo.clear();
    }

    /// A snapshot of the memo; cheap until either side changes.
    pub fn memo(&self) -> MemoTable {
        self.memo.copy()
    }

    pub fn set_memo(&mut self, memo: MemoTable) {
        self.memo = memo;
    }

    /// Unwrap the sink from the `Pickler`.
    pub fn into_inner(self) -> W {
        self.sink
    }

    /// Writes the pickle of `value` to the sink.
    ///
    /// The memo persists across dumps on the same instance, so it must be
    /// cleared before dumping values of a different heap.
    pub fn dump(&mut self, heap: &Heap, value: &Value) -> Result<()> {
        log::debug!("pickling with protocol {}", self.proto);
        self.output.clear();
        self.frame_start = None;
        self.depth = 0;
        self.fast_nesting = 0;
        self.fast_memo.clear();
        let start = self.written;
        let result = self.dump_inner(heap, value);
        self.framing = false;
        self.reducer_override = None;
        result?;
        self.flush_output()?;
        self.sink.flush()?;
        log::debug!("pickled {} bytes, memo holds {} entries", self.written - start, self.memo.len());
        Ok(())
    }

    fn dump_inner(&mut self, heap: &Heap, value: &Value) -> Result<()> {
        if self.proto >= 2 {
            self.write(&[PROTO, self.proto])?;
            if self.proto >= 4 {
                self.framing = true;
            }
        }
        self.save(heap, &Operand::Value(value), false)?;
        self.write(&[STOP])?;
        self.commit_frame()
    }

    // Output buffer and framing

    fn write(&mut self, data: &[u8]) -> Result<()> {
        let open_frame = self.framing && self.frame_start.is_none();
        let n = data.len() + if open_frame { FRAME_HEADER_SIZE } else { 0 };
        let len = self.output.len();
        if len + n > self.output.capacity() {
            match (isize::MAX as usize / 2).checked_sub(n) {
                Some(limit) if len < limit => {}
                _ => return pickle_error(ErrorCode::Overflow("output buffer too large")),
            }
            let target = (len + n) / 2 * 3;
            self.output.try_reserve_exact(target.saturating_sub(len).max(n))
                .map_err(|_| Error::Pickle(ErrorCode::Overflow("cannot grow output buffer")))?;
        }
        if open_frame {
            self.frame_start = Some(len);
            self.output.extend_from_slice(&[0; FRAME_HEADER_SIZE]);
        }
        self.output.extend_from_slice(data);
        Ok(())
    }

    fn commit_frame(&mut self) -> Result<()> {
        if !self.framing {
            return Ok(());
        }
        let start = match self.frame_start.take() {
            Some(start) => start,
            None => return Ok(()),
        };
        let frame_len = self.output.len() - start - FRAME_HEADER_SIZE;
        let mut cursor = BufferCursor::new(&mut self.output[start..]);
        let elide = frame_len < FRAME_SIZE_MIN;
        let patched = if elide {
            cursor.shift(FRAME_HEADER_SIZE, frame_len)
        } else {
            cursor.write_u8(FRAME).and_then(|_| cursor.write_u64_le(frame_len as u64))
        };
        patched.map_err(|_| Error::Pickle(ErrorCode::Overflow("frame header outside of buffer")))?;
        if elide {
            self.output.truncate(self.output.len() - FRAME_HEADER_SIZE);
            log::trace!("elided header of {} byte frame", frame_len);
        } else {
            log::trace!("committed frame of {} bytes", frame_len);
        }
        Ok(())
    }

    // Called before every object: completes a frame once it is big enough.
    fn opcode_boundary(&mut self) -> Result<()> {
        let start = match self.frame_start {
            Some(start) if self.framing => start,
            _ => return Ok(()),
        };
        if self.output.len() - start - FRAME_HEADER_SIZE >= FRAME_SIZE_TARGET {
            self.commit_frame()?;
            self.flush_output()?;
        }
        Ok(())
    }

    fn flush_output(&mut self) -> Result<()> {
        self.sink.write_all(&self.output)?;
        self.written += self.output.len();
        self.output.clear();
        Ok(())
    }

    /// Writes an opcode header followed by a payload; big payloads go
    /// directly to the sink, outside of any frame.
    fn write_payload(&mut self, header: &[u8], data: &[u8]) -> Result<()> {
        if data.len() < FRAME_SIZE_TARGET {
            self.write(header)?;
            return self.write(data);
        }
        let framing = self.framing;
        self.commit_frame()?;
        self.framing = false;
        self.write(header)?;
        self.flush_output()?;
        log::trace!("writing {} byte payload directly to the sink", data.len());
        self.sink.write_all(data)?;
        self.written += data.len();
        self.framing = framing;
        Ok(())
    }

    fn write_line(&mut self, opcode: u8, text: &[u8]) -> Result<()> {
        self.write(&[opcode])?;
        self.write(text)?;
        self.write(b"\n")
    }

    // Memo

    fn memo_put(&mut self, obj: ObjRef) -> Result<()> {
        if self.fast {
            return Ok(());
        }
        let idx = self.memo.len();
        let id = u32::try_from(idx)
            .map_err(|_| Error::Pickle(ErrorCode::Overflow("memo id too large for LONG_BINPUT")))?;
        self.memo.set(obj, id).map_err(Error::Pickle)?;
        if self.proto >= 4 {
            self.write(&[MEMOIZE])
        } else if !self.bin {
            self.write_line(PUT, id.to_string().as_bytes())
        } else if id < 256 {
            self.write(&[BINPUT, id as u8])
        } else {
            let mut buf = [LONG_BINPUT, 0, 0, 0, 0];
            LittleEndian::write_u32(&mut buf[1..], id);
            self.write(&buf)
        }
    }

    fn memo_get(&mut self, id: u32) -> Result<()> {
        if !self.bin {
            self.write_line(GET, id.to_string().as_bytes())
        } else if id < 256 {
            self.write(&[BINGET, id as u8])
        } else {
            let mut buf = [LONG_BINGET, 0, 0, 0, 0];
            LittleEndian::write_u32(&mut buf[1..], id);
            self.write(&buf)
        }
    }

    fn memo_get_obj(&mut self, obj: ObjRef) -> Option<u32> {
        self.memo.get(obj)
    }

    // Fast mode has no memo; past a nesting depth it tracks the open
    // containers to detect cycles.
    fn fast_save_enter(&mut self, heap: &Heap, obj: ObjRef) -> Result<()> {
        self.fast_nesting += 1;
        if self.fast_nesting >= FAST_NESTING_LIMIT && !self.fast_memo.insert(obj) {
            let type_name = heap.get(obj).map_or("object", Object::type_name);
            return pickle_error(ErrorCode::CyclicStructure(type_name));
        }
        Ok(())
    }

    fn fast_save_leave(&mut self, obj: ObjRef) {
        if self.fast_nesting >= FAST_NESTING_LIMIT {
            self.fast_memo.remove(&obj);
        }
        self.fast_nesting -= 1;
    }

    // The recursive walk

    fn save(&mut self, heap: &Heap, op: &Operand, pers_save: bool) -> Result<()> {
        if self.depth >= self.recursion_limit {
            return pickle_error(ErrorCode::RecursionLimit);
        }
        self.depth += 1;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_SEGMENT_SIZE,
                                         || self.save_operand(heap, op, pers_save));
        self.depth -= 1;
        result
    }

    fn save_operand(&mut self, heap: &Heap, op: &Operand, pers_save: bool) -> Result<()> {
        self.opcode_boundary()?;
        match *op {
            Operand::Value(value) => self.save_value(heap, value, pers_save),
            Operand::Global(module, name) => self.save_global(heap, module, name, None),
            Operand::Str(ref s) => self.save_str_data(s),
            Operand::Bytes(b) => self.save_bytes_data(heap, b, None),
            Operand::Tuple(ref items) =>
                self.save_tuple_with(heap, items, None, |slf, heap, item| slf.save(heap, item, false)),
            Operand::List(items) => {
                self.write_empty_list()?;
                self.batch_appends(heap, items)
            }
        }
    }

    fn save_value(&mut self, heap: &Heap, value: &Value, pers_save: bool) -> Result<()> {
        if !pers_save {
            if let Some(pid) = self.hooks.persistent_id(heap, value).map_err(Error::Pickle)? {
                return self.save_pers(heap, &pid);
            }
        }
        let r = match *value {
            Value::None => return self.write(&[NONE]),
            Value::Bool(b) => return self.save_bool(b),
            Value::I64(i) => return self.save_int(i),
            Value::Int(ref i) => return self.save_bigint(i),
            Value::F64(f) => return self.save_float(f),
            Value::Ref(r) => r,
        };
        if let Some(id) = self.memo_get_obj(r) {
            return self.memo_get(id);
        }
        match *heap.object(r).map_err(Error::Pickle)? {
            Object::Bytes(ref b) => self.save_bytes_data(heap, b, Some(r)),
            Object::ByteArray(ref b) => self.save_bytearray_data(heap, b, Some(r)),
            Object::String(ref s) => {
                self.save_str_data(s)?;
                self.memo_put(r)
            }
            Object::Tuple(ref items) =>
                self.save_tuple_with(heap, items, Some(r),
                                     |slf, heap, item| slf.save(heap, &Operand::Value(item), false)),
            Object::List(ref items) => self.save_list(heap, items, r),
            Object::Dict(ref dict) => self.save_dict(heap, dict, r),
            Object::Set(ref set) => self.save_set(heap, set, r),
            Object::FrozenSet(ref set) => self.save_frozenset(heap, set, r),
            Object::Buffer(ref buf) => self.save_picklebuffer(heap, buf, r),
            Object::Global(ref g) => {
                if let Some(red) = self.override_reduce(heap, r)? {
                    return self.save_reduce(heap, ReduceParts::from_reduction(heap, &red)?, Some(r));
                }
                self.save_global(heap, &g.module, &g.name, Some(r))
            }
            Object::Reduced(_) | Object::PersistentId(_) | Object::Opaque(_) =>
                self.save_reduced_object(heap, r),
        }
    }

    fn save_pers(&mut self, heap: &Heap, pid: &Value) -> Result<()> {
        if self.bin {
            self.save(heap, &Operand::Value(pid), true)?;
            return self.write(&[BINPERSID]);
        }
        let text = match *pid {
            Value::I64(i) => i.to_string(),
            Value::Int(ref i) => i.to_string(),
            _ => match heap.as_str(pid) {
                Some(s) if s.is_ascii() && !s.contains('\n') => s.to_owned(),
                _ => return pickle_error(ErrorCode::UnpicklableType(
                    "persistent IDs in protocol 0 must be ASCII strings".into())),
            },
        };
        self.write_line(PERSID, text.as_bytes())
    }

    fn save_bool(&mut self, b: bool) -> Result<()> {
        if self.proto >= 2 {
            self.write(&[if b { NEWTRUE } else { NEWFALSE }])
        } else {
            self.write(if b { b"I01\n" } else { b"I00\n" })
        }
    }

    fn save_int(&mut self, i: i64) -> Result<()> {
        if i < i32::MIN as i64 || i > i32::MAX as i64 {
            return self.save_bigint(&BigInt::from(i));
        }
        if !self.bin {
            self.write_line(INT, i.to_string().as_bytes())
        } else if (0..=0xff).contains(&i) {
            self.write(&[BININT1, i as u8])
        } else if (0..=0xffff).contains(&i) {
            let mut buf = [BININT2, 0, 0];
            LittleEndian::write_u16(&mut buf[1..], i as u16);
            self.write(&buf)
        } else {
            let mut buf = [BININT, 0, 0, 0, 0];
            LittleEndian::write_i32(&mut buf[1..], i as i32);
            self.write(&buf)
        }
    }

    fn save_bigint(&mut self, i: &BigInt) -> Result<()> {
        if let Ok(small) = i32::try_from(i) {
            return self.save_int(small as i64);
        }
        if self.proto < 2 {
            self.write(&[LONG])?;
            self.write(i.to_string().as_bytes())?;
            return self.write(b"L\n");
        }
        let bytes = i.to_signed_bytes_le();
        if bytes.len() < 256 {
            self.write(&[LONG1, bytes.len() as u8])?;
        } else {
            let len = u32::try_from(bytes.len()).ok().filter(|&n| n <= i32::MAX as u32)
                .ok_or(Error::Pickle(ErrorCode::Overflow("int too large to pickle")))?;
            let mut buf = [LONG4, 0, 0, 0, 0];
            LittleEndian::write_u32(&mut buf[1..], len);
            self.write(&buf)?;
        }
        self.write(&bytes)
    }

    fn save_float(&mut self, f: f64) -> Result<()> {
        if self.bin {
            let mut buf = [BINFLOAT, 0, 0, 0, 0, 0, 0, 0, 0];
            BigEndian::write_f64(&mut buf[1..], f);
            self.write(&buf)
        } else {
            let repr = if f.is_nan() {
                "nan".to_owned()
            } else if f.is_infinite() {
                if f > 0.0 { "inf".to_owned() } else { "-inf".to_owned() }
            } else {
                format!("{:?}", f)
            };
            self.write_line(FLOAT, repr.as_bytes())
        }
    }

    fn save_bytes_data(&mut self, heap: &Heap, data: &[u8], obj: Option<ObjRef>) -> Result<()> {
        if self.proto < 3 {
            // Python 2 has no bytes type; rebuild through a latin-1 string.
            let parts = if data.is_empty() {
                ReduceParts::call(Operand::Global("builtins", "bytes"), vec![])
            } else {
                let text: String = data.iter().map(|&b| b as char).collect();
                ReduceParts::call(Operand::Global("_codecs", "encode"),
                                  vec![Operand::Str(text.into()), Operand::Str("latin1".into())])
            };
            return self.save_reduce(heap, parts, obj);
        }
        let len = data.len();
        if len <= 0xff {
            self.write_payload(&[SHORT_BINBYTES, len as u8], data)?;
        } else if len <= 0xffff_ffff {
            let mut header = [BINBYTES, 0, 0, 0, 0];
            LittleEndian::write_u32(&mut header[1..], len as u32);
            self.write_payload(&header, data)?;
        } else if self.proto >= 4 {
            let mut header = [BINBYTES8, 0, 0, 0, 0, 0, 0, 0, 0];
            LittleEndian::write_u64(&mut header[1..], len as u64);
            self.write_payload(&header, data)?;
        } else {
            return pickle_error(ErrorCode::Overflow(
                "serializing a bytes object larger than 4 GiB requires pickle protocol 4 or higher"));
        }
        match obj {
            Some(obj) => self.memo_put(obj),
            None => Ok(()),
        }
    }

    fn save_bytearray_data(&mut self, heap: &Heap, data: &[u8], obj: Option<ObjRef>) -> Result<()> {
        if self.proto < 5 {
            let args = if data.is_empty() { vec![] } else { vec![Operand::Bytes(data)] };
            let parts = ReduceParts::call(Operand::Global("builtins", "bytearray"), args);
            return self.save_reduce(heap, parts, obj);
        }
        let mut header = [BYTEARRAY8, 0, 0, 0, 0, 0, 0, 0, 0];
        LittleEndian::write_u64(&mut header[1..], data.len() as u64);
        self.write_payload(&header, data)?;
        match obj {
            Some(obj) => self.memo_put(obj),
            None => Ok(()),
        }
    }

    fn save_picklebuffer(&mut self, heap: &Heap, buf: &PickleBuffer, obj: ObjRef) -> Result<()> {
        if self.proto < 5 {
            return pickle_error(ErrorCode::UnpicklableType(
                "PickleBuffer can only be pickled with protocol >= 5".into()));
        }
        let in_band = match self.buffer_callback {
            Some(ref mut callback) => callback(buf),
            None => true,
        };
        if in_band {
            if buf.readonly {
                self.save_bytes_data(heap, &buf.data, Some(obj))
            } else {
                self.save_bytearray_data(heap, &buf.data, Some(obj))
            }
        } else if buf.readonly {
            self.write(&[NEXT_BUFFER, READONLY_BUFFER])
        } else {
            self.write(&[NEXT_BUFFER])
        }
    }

    fn save_str_data(&mut self, s: &str) -> Result<()> {
        if !self.bin {
            let escaped = raw_unicode_escape(s);
            self.write(&[UNICODE])?;
            self.write(&escaped)?;
            return self.write(b"\n");
        }
        let data = s.as_bytes();
        let len = data.len();
        if len <= 0xff && self.proto >= 4 {
            self.write_payload(&[SHORT_BINUNICODE, len as u8], data)
        } else if len <= 0xffff_ffff {
            let mut header = [BINUNICODE, 0, 0, 0, 0];
            LittleEndian::write_u32(&mut header[1..], len as u32);
            self.write_payload(&header, data)
        } else if self.proto >= 4 {
            let mut header = [BINUNICODE8, 0, 0, 0, 0, 0, 0, 0, 0];
            LittleEndian::write_u64(&mut header[1..], len as u64);
            self.write_payload(&header, data)
        } else {
            pickle_error(ErrorCode::Overflow(
                "serializing a string larger than 4 GiB requires pickle protocol 4 or higher"))
        }
    }

    fn save_tuple_with<T, F>(&mut self, heap: &Heap, items: &[T], obj: Option<ObjRef>, f: F) -> Result<()>
        where F: Fn(&mut Self, &Heap, &T) -> Result<()>
    {
        if items.is_empty() {
            return if self.proto >= 1 {
                self.write(&[EMPTY_TUPLE])
            } else {
                self.write(&[MARK, TUPLE])
            };
        }
        let len = items.len();
        if len <= 3 && self.proto >= 2 {
            for item in items {
                f(self, heap, item)?;
            }
            // Memoized while writing the elements: it is recursive.
            if let Some(id) = obj.and_then(|obj| self.memo_get_obj(obj)) {
                for _ in 0..len {
                    self.write(&[POP])?;
                }
                return self.memo_get(id);
            }
            self.write(&[[TUPLE1, TUPLE2, TUPLE3][len - 1]])?;
        } else {
            self.write(&[MARK])?;
            for item in items {
                f(self, heap, item)?;
            }
            if let Some(id) = obj.and_then(|obj| self.memo_get_obj(obj)) {
                if self.bin {
                    self.write(&[POP_MARK])?;
                } else {
                    for _ in 0..=len {
                        self.write(&[POP])?;
                    }
                }
                return self.memo_get(id);
            }
            self.write(&[TUPLE])?;
        }
        match obj {
            Some(obj) => self.memo_put(obj),
            None => Ok(()),
        }
    }

    fn write_empty_list(&mut self) -> Result<()> {
        if self.bin {
            self.write(&[EMPTY_LIST])
        } else {
            self.write(&[MARK, LIST])
        }
    }

    fn save_list(&mut self, heap: &Heap, items: &[Value], obj: ObjRef) -> Result<()> {
        if self.fast {
            self.fast_save_enter(heap, obj)?;
        }
        self.write_empty_list()?;
        self.memo_put(obj)?;
        self.batch_appends(heap, items)?;
        if self.fast {
            self.fast_save_leave(obj);
        }
        Ok(())
    }

    fn batch_appends(&mut self, heap: &Heap, items: &[Value]) -> Result<()> {
        if self.proto == 0 {
            for item in items {
                self.save(heap, &Operand::Value(item), false)?;
                self.write(&[APPEND])?;
            }
            return Ok(());
        }
        for chunk in items.chunks(BATCHSIZE) {
            if let [item] = chunk {
                self.save(heap, &Operand::Value(item), false)?;
                self.write(&[APPEND])?;
                continue;
            }
            self.write(&[MARK])?;
            for item in chunk {
                self.save(heap, &Operand::Value(item), false)?;
            }
            self.write(&[APPENDS])?;
        }
        Ok(())
    }

    fn save_dict(&mut self, heap: &Heap, dict: &DictObject, obj: ObjRef) -> Result<()> {
        if self.fast {
            self.fast_save_enter(heap, obj)?;
        }
        if self.bin {
            self.write(&[EMPTY_DICT])?;
        } else {
            self.write(&[MARK, DICT])?;
        }
        self.memo_put(obj)?;
        self.batch_setitems(heap, dict.entries())?;
        if self.fast {
            self.fast_save_leave(obj);
        }
        Ok(())
    }

    fn batch_setitems(&mut self, heap: &Heap, entries: &[(Value, Value)]) -> Result<()> {
        if self.proto == 0 {
            for (key, value) in entries {
                self.save(heap, &Operand::Value(key), false)?;
                self.save(heap, &Operand::Value(value), false)?;
                self.write(&[SETITEM])?;
            }
            return Ok(());
        }
        for chunk in entries.chunks(BATCHSIZE) {
            if let [(key, value)] = chunk {
                self.save(heap, &Operand::Value(key), false)?;
                self.save(heap, &Operand::Value(value), false)?;
                self.write(&[SETITEM])?;
                continue;
            }
            self.write(&[MARK])?;
            for (key, value) in chunk {
                self.save(heap, &Operand::Value(key), false)?;
                self.save(heap, &Operand::Value(value), false)?;
            }
            self.write(&[SETITEMS])?;
        }
        Ok(())
    }

    fn save_set(&mut self, heap: &Heap, set: &SetObject, obj: ObjRef) -> Result<()> {
        if self.proto < 4 {
            let parts = ReduceParts::call(Operand::Global("builtins", "set"),
                                          vec![Operand::List(set.items())]);
            return self.save_reduce(heap, parts, Some(obj));
        }
        self.write(&[EMPTY_SET])?;
        self.memo_put(obj)?;
        for chunk in set.items().chunks(BATCHSIZE) {
            self.write(&[MARK])?;
            for item in chunk {
                self.save(heap, &Operand::Value(item), false)?;
            }
            self.write(&[ADDITEMS])?;
        }
        Ok(())
    }

    fn save_frozenset(&mut self, heap: &Heap, set: &SetObject, obj: ObjRef) -> Result<()> {
        if self.proto < 4 {
            let parts = ReduceParts::call(Operand::Global("builtins", "frozenset"),
                                          vec![Operand::List(set.items())]);
            return self.save_reduce(heap, parts, Some(obj));
        }
        if self.fast {
            self.fast_save_enter(heap, obj)?;
        }
        self.write(&[MARK])?;
        for item in set.items() {
            self.save(heap, &Operand::Value(item), false)?;
        }
        if self.fast {
            self.fast_save_leave(obj);
        }
        if let Some(id) = self.memo_get_obj(obj) {
            self.write(&[POP_MARK])?;
            return self.memo_get(id);
        }
        self.write(&[FROZENSET])?;
        self.memo_put(obj)
    }

    fn save_global(&mut self, heap: &Heap, module: &str, name: &str, obj: Option<ObjRef>) -> Result<()> {
        let malformed = || Error::Pickle(ErrorCode::MalformedGlobal(format!("{}.{}", module, name)));
        if module.is_empty() || module.contains('\n') || name.contains('\n')
            || name.split('.').any(|part| part.is_empty() || part == "<locals>") {
            return Err(malformed());
        }
        if self.proto >= 2 {
            if let Some(code) = self.registry.code_for(module, name) {
                return self.write_ext(code);
            }
        }
        if self.proto >= 4 {
            self.save(heap, &Operand::Str(module.into()), false)?;
            self.save(heap, &Operand::Str(name.into()), false)?;
            self.write(&[STACK_GLOBAL])?;
        } else if let Some((parent, last)) = name.rsplit_once('.') {
            let parts = ReduceParts::call(Operand::Global("builtins", "getattr"),
                                          vec![Operand::Global(module, parent), Operand::Str(last.into())]);
            self.save_reduce(heap, parts, None)?;
        } else {
            let (module, name) = if self.proto < 3 && self.fix_imports {
                compat::to_python2(module, name)
            } else {
                (module.to_owned(), name.to_owned())
            };
            if self.proto < 3 && !(module.is_ascii() && name.is_ascii()) {
                return pickle_error(ErrorCode::MalformedGlobal(format!(
                    "can't pickle global identifier '{}.{}' using pickle protocol {}",
                    module, name, self.proto)));
            }
            self.write(&[GLOBAL])?;
            self.write(module.as_bytes())?;
            self.write(b"\n")?;
            self.write(name.as_bytes())?;
            self.write(b"\n")?;
        }
        match obj {
            Some(obj) => self.memo_put(obj),
            None => Ok(()),
        }
    }

    fn write_ext(&mut self, code: i32) -> Result<()> {
        if code <= 0 {
            return pickle_error(ErrorCode::InvalidValue(format!("extension code {} is out of range", code)));
        }
        if code <= 0xff {
            self.write(&[EXT1, code as u8])
        } else if code <= 0xffff {
            let mut buf = [EXT2, 0, 0];
            LittleEndian::write_u16(&mut buf[1..], code as u16);
            self.write(&buf)
        } else {
            let mut buf = [EXT4, 0, 0, 0, 0];
            LittleEndian::write_i32(&mut buf[1..], code);
            self.write(&buf)
        }
    }

    fn override_reduce(&mut self, heap: &Heap, obj: ObjRef) -> Result<Option<Reduction>> {
        match self.reducer_override {
            Some(ref mut reducer) => reducer(heap, obj).map_err(Error::Pickle),
            None => Ok(None),
        }
    }

    fn save_reduced_object(&mut self, heap: &Heap, obj: ObjRef) -> Result<()> {
        if let Some(red) = self.override_reduce(heap, obj)? {
            return self.save_reduce(heap, ReduceParts::from_reduction(heap, &red)?, Some(obj));
        }
        let object = heap.object(obj).map_err(Error::Pickle)?;
        if let Object::Reduced(ref red) = *object {
            return self.save_reduce(heap, ReduceParts::from_reduction(heap, red)?, Some(obj));
        }
        match self.hooks.reduce(heap, obj).map_err(Error::Pickle)? {
            Some(red) => self.save_reduce(heap, ReduceParts::from_reduction(heap, &red)?, Some(obj)),
            None => pickle_error(ErrorCode::UnpicklableType(match *object {
                Object::Opaque(ref name) => format!("'{}' object", name),
                ref other => format!("'{}' object", other.type_name()),
            })),
        }
    }

    // Checks that a NEWOBJ class argument names a class.
    fn check_class(&self, heap: &Heap, cls: &Operand, opcode: &str) -> Result<()> {
        let is_class = match *cls {
            Operand::Value(v) => heap.as_global(v).is_some(),
            Operand::Global(..) => true,
            _ => false,
        };
        if is_class {
            Ok(())
        } else {
            pickle_error(ErrorCode::UnpicklableType(format!(
                "object: first item of the {} argument tuple must be a class", opcode)))
        }
    }

    fn save_reduce(&mut self, heap: &Heap, parts: ReduceParts, obj: Option<ObjRef>) -> Result<()> {
        let callable_name = match parts.callable {
            Operand::Value(v) => heap.as_global(v).map(|g| g.name.as_str()),
            Operand::Global(_, name) => Some(name),
            _ => None,
        };
        let short_name = callable_name.map(|name| name.rsplit('.').next().unwrap_or(name));
        let use_newobj_ex = self.proto >= 2 && short_name == Some("__newobj_ex__");
        let use_newobj = self.proto >= 2 && short_name == Some("__newobj__");

        if use_newobj_ex {
            let [cls, args, kwargs] = match <&[Operand; 3]>::try_from(parts.args.as_slice()) {
                Ok(items) => items,
                Err(_) => return pickle_error(ErrorCode::UnpicklableType(format!(
                    "object: length of the NEWOBJ_EX argument tuple must be exactly 3, not {}",
                    parts.args.len()))),
            };
            self.check_class(heap, cls, "NEWOBJ_EX")?;
            let args_ok = matches!(*args, Operand::Value(v) if heap.as_tuple(v).is_some())
                || matches!(*args, Operand::Tuple(_));
            let kwargs_ok = matches!(*kwargs, Operand::Value(v) if matches!(heap.deref(v), Some(Object::Dict(_))));
            if !args_ok || !kwargs_ok {
                return pickle_error(ErrorCode::UnpicklableType(
                    "object: NEWOBJ_EX arguments must be a class, a tuple and a dict".into()));
            }
            if self.proto >= 4 {
                self.save(heap, cls, false)?;
                self.save(heap, args, false)?;
                self.save(heap, kwargs, false)?;
                self.write(&[NEWOBJ_EX])?;
            } else {
                self.save_call(heap, &parts)?;
            }
        } else if use_newobj {
            let (cls, rest) = match parts.args.split_first() {
                Some(split) => split,
                None => return pickle_error(ErrorCode::UnpicklableType(
                    "object: __newobj__ arglist is empty".into())),
            };
            self.check_class(heap, cls, "NEWOBJ")?;
            self.save(heap, cls, false)?;
            self.save(heap, &Operand::Tuple(rest.to_vec()), false)?;
            self.write(&[NEWOBJ])?;
        } else {
            self.save_call(heap, &parts)?;
        }

        if let Some(obj) = obj {
            // Memoized while writing the arguments: it is recursive.
            if let Some(id) = self.memo_get_obj(obj) {
                self.write(&[POP])?;
                self.memo_get(id)?;
            } else {
                self.memo_put(obj)?;
            }
        }

        if !parts.list_items.is_empty() {
            self.batch_appends(heap, parts.list_items)?;
        }
        if !parts.dict_items.is_empty() {
            self.batch_setitems(heap, parts.dict_items)?;
        }
        if let Some(state) = parts.state {
            match parts.state_setter {
                None => {
                    self.save(heap, &Operand::Value(state), false)?;
                    self.write(&[BUILD])?;
                }
                Some(setter) => {
                    // setter(obj, state), result discarded
                    let target = match obj {
                        Some(obj) => Value::Ref(obj),
                        None => Value::None,
                    };
                    self.save(heap, &Operand::Value(setter), false)?;
                    self.save(heap, &Operand::Tuple(vec![Operand::Value(&target),
                                                         Operand::Value(state)]), false)?;
                    self.write(&[REDUCE, POP])?;
                }
            }
        }
        Ok(())
    }

    fn save_call(&mut self, heap: &Heap, parts: &ReduceParts) -> Result<()> {
        self.save(heap, &parts.callable, false)?;
        match parts.args_tuple {
            Some(args) => self.save(heap, &Operand::Value(args), false)?,
            None => self.save(heap, &Operand::Tuple(parts.args.clone()), false)?,
        }
        self.write(&[REDUCE])
    }
}

impl Pickler<Vec<u8>> {
    /// The bytes written so far by an in-memory pickler.
    pub fn get_bytes(&self) -> &[u8] {
        &self.sink
    }
}

/// Encodes a string like Python's "raw-unicode-escape" codec, additionally
/// escaping the characters that would break a line-based opcode.
fn raw_unicode_escape(s: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(s.len());
    for ch in s.chars() {
        let code = ch as u32;
        if code >= 0x10000 {
            result.extend_from_slice(format!("\\U{:08x}", code).as_bytes());
        } else if code >= 256 || ch == '\\' || ch == '\0' || ch == '\n' || ch == '\r' || code == 0x1a {
            result.extend_from_slice(format!("\\u{:04x}", code).as_bytes());
        } else {
            result.push(code as u8);
        }
    }
    result
}

/// Encodes a value into a pickle stream written to `writer`.
pub fn value_to_writer<W: io::Write>(writer: &mut W, heap: &Heap, value: &Value,
                                     options: SerOptions) -> Result<()> {
    let mut pickler = Pickler::with_options(writer, options)?;
    pickler.dump(heap, value)
}

/// Encodes a value into a `Vec<u8>` buffer.
pub fn value_to_vec(heap: &Heap, value: &Value, options: SerOptions) -> Result<Vec<u8>> {
    let mut pickler = Pickler::with_options(Vec::with_capacity(128), options)?;
    pickler.dump(heap, value)?;
    Ok(pickler.into_inner())
}
