// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! # Pickle deserialization
//!
//! Note: Pickles are not a declarative format, but a program for a stack-based
//! VM.  Each value that is decoded is simply put on the stack, and some
//! operations pop items from the stack and construct new data with them.
//!
//! The `Unpickler` runs that program.  It owns the `Heap` the decoded objects
//! are allocated in; memo entries refer into that heap, so the heap outlives
//! single `load` calls and is handed out at the end with `take_heap`.
//!
//! Decoding never recurses: nesting lives entirely on the operand stack, so
//! arbitrarily deep input cannot exhaust the native stack.

use std::collections::{HashMap, VecDeque};
use std::io::{self, BufRead, Read};
use std::str;
use std::sync::Arc;
use byteorder::{ByteOrder, BigEndian, LittleEndian};
use iter_read::IterRead;
use num_bigint::BigInt;

use super::compat;
use super::consts::*;
use super::cursor::BufferCursor;
use super::error::{Error, ErrorCode, Result};
use super::extension::ExtensionRegistry;
use super::hooks::{DefaultHooks, UnpickleHooks};
use super::memo::MemoArray;
use super::stack::OperandStack;
use super::value::{Heap, Object, PickleBuffer, Value};

// Payloads are read in steps of this size, so that a bogus length prefix on a
// short stream runs out of input before it runs out of memory.
const MAX_PREALLOC: usize = 1 << 16;

/// How Python 2 byte strings (`STRING`, `BINSTRING`, `SHORT_BINSTRING`) are
/// decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StringEncoding {
    #[default]
    Ascii,
    Latin1,
    Utf8,
    /// Keep the raw bytes.
    Bytes,
}

/// What to do with bytes of a Python 2 string that are invalid in the
/// chosen ASCII or UTF-8 encoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DecodeErrors {
    /// Fail the load.
    #[default]
    Strict,
    /// Substitute U+FFFD for each invalid sequence.
    Replace,
    /// Drop invalid sequences.
    Ignore,
    /// Write each invalid byte as a `\xNN` escape.
    BackslashReplace,
}

/// Options for unpickling.
#[derive(Clone, Debug, Default)]
pub struct DeOptions {
    encoding: StringEncoding,
    errors: DecodeErrors,
    no_fix_imports: bool,
    protocol_hint: u8,
}

impl DeOptions {
    /// Construct with default options:
    ///
    /// - Python 2 strings must be ASCII
    /// - map Python 2 names to Python 3 names for streams below protocol 3
    /// - assume protocol 0 until a PROTO opcode says otherwise
    pub fn new() -> Self {
        Self::default()
    }

    pub fn encoding(mut self, encoding: StringEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// How to handle Python 2 strings that do not decode; the default fails.
    pub fn errors(mut self, errors: DecodeErrors) -> Self {
        self.errors = errors;
        self
    }

    /// Decode Python 2 strings as UTF-8 instead of ASCII.
    pub fn decode_strings(self) -> Self {
        self.encoding(StringEncoding::Utf8)
    }

    /// Resolve global names exactly as they appear in the stream.
    pub fn no_fix_imports(mut self) -> Self {
        self.no_fix_imports = true;
        self
    }

    /// The protocol assumed before a PROTO opcode is seen.
    pub fn protocol_hint(mut self, proto: u8) -> Self {
        self.protocol_hint = proto;
        self
    }
}

fn at(pos: usize) -> impl FnOnce(ErrorCode) -> Error {
    move |code| Error::Eval(code, pos)
}

/// Decodes pickle streams into values on a `Heap`.
pub struct Unpickler<R: BufRead> {
    rdr: R,
    pos: usize,
    frame: Option<BufferCursor<Vec<u8>>>,
    heap: Heap,
    stack: OperandStack,
    memo: MemoArray,
    proto: u8,
    options: DeOptions,
    hooks: Box<dyn UnpickleHooks>,
    registry: Arc<ExtensionRegistry>,
    ext_cache: HashMap<i32, Value>,
    buffers: Option<VecDeque<PickleBuffer>>,
}

impl<R: BufRead> Unpickler<R> {
    pub fn new(rdr: R) -> Unpickler<R> {
        Unpickler {
            rdr,
            pos: 0,
            frame: None,
            heap: Heap::new(),
            stack: OperandStack::new(),
            memo: MemoArray::new(),
            proto: 0,
            options: DeOptions::default(),
            hooks: Box::new(DefaultHooks),
            registry: ExtensionRegistry::shared(),
            ext_cache: HashMap::new(),
            buffers: None,
        }
    }

    pub fn with_options(rdr: R, options: DeOptions) -> Result<Unpickler<R>> {
        let mut unpickler = Unpickler::new(rdr);
        unpickler.set_protocol_hint(options.protocol_hint)?;
        unpickler.options = options;
        Ok(unpickler)
    }

    /// Sets the protocol assumed before the stream names its own.
    pub fn set_protocol_hint(&mut self, proto: u8) -> Result<()> {
        if proto > HIGHEST_PROTOCOL {
            return self.error(ErrorCode::UnsupportedProtocol(proto.into()));
        }
        self.options.protocol_hint = proto;
        Ok(())
    }

    pub fn set_hooks(&mut self, hooks: Box<dyn UnpickleHooks>) {
        self.hooks = hooks;
    }

    pub fn set_registry(&mut self, registry: Arc<ExtensionRegistry>) {
        self.registry = registry;
        self.ext_cache.clear();
    }

    /// Supplies the out-of-band buffers consumed by NEXT_BUFFER, in order.
    pub fn set_buffers<I: IntoIterator<Item=PickleBuffer>>(&mut self, buffers: I) {
        self.buffers = Some(buffers.into_iter().collect());
    }

    pub fn clear_memo(&mut self) {
        self.memo.clear();
    }

    /// The protocol of the last stream read (or the hint).
    pub fn protocol(&self) -> u8 {
        self.proto
    }

    /// Number of bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Takes the heap out, leaving an empty one.  The memo and extension
    /// cache refer into the old heap and are cleared with it.
    pub fn take_heap(&mut self) -> Heap {
        self.memo.clear();
        self.ext_cache.clear();
        std::mem::take(&mut self.heap)
    }

    /// Unwrap the reader from the `Unpickler`.
    pub fn into_inner(self) -> R {
        self.rdr
    }

    /// Resolves a global the way GLOBAL does, including the Python 2 name
    /// mapping for old protocols.
    pub fn find_class(&mut self, module: &str, name: &str) -> Result<Value> {
        let (module, name) = if self.proto < 3 && !self.options.no_fix_imports {
            compat::to_python3(module, name)
        } else {
            (module.to_owned(), name.to_owned())
        };
        self.hooks.find_class(&mut self.heap, &module, &name).map_err(at(self.pos))
    }

    /// Checks that the input is exhausted.
    pub fn end(&mut self) -> Result<()> {
        if self.frame.as_ref().map_or(false, |frame| !frame.is_exhausted()) {
            return self.error(ErrorCode::TrailingBytes);
        }
        if !self.rdr.fill_buf()?.is_empty() {
            return self.error(ErrorCode::TrailingBytes);
        }
        Ok(())
    }

    /// Reads one pickle and returns the value it describes.
    ///
    /// Reading stops right after the STOP opcode; whatever follows is left
    /// for the next call.
    pub fn load(&mut self) -> Result<Value> {
        self.stack.clear();
        self.proto = self.options.protocol_hint;
        let start = self.pos;
        log::debug!("unpickling at offset {}", start);
        let result = self.run();
        self.stack.clear();
        let value = result?;
        log::debug!("unpickled {} bytes of protocol {}, heap holds {} objects",
                    self.pos - start, self.proto, self.heap.len());
        Ok(value)
    }

    fn run(&mut self) -> Result<Value> {
        loop {
            match self.read_u8()? {
                // Specials
                STOP => {
                    let value = self.pop()?;
                    if !self.stack.is_empty() {
                        log::debug!("{} values left on the stack at STOP", self.stack.len());
                    }
                    return Ok(value);
                }
                POP => {
                    if !self.stack.pop_mark_at_top() {
                        self.pop()?;
                    }
                }
                POP_MARK => {
                    let mark = self.pop_mark()?;
                    self.stack.clear_to(mark);
                }
                DUP => {
                    let top = self.stack.top().map_err(at(self.pos))?.clone();
                    self.stack.push(top);
                }
                MARK => self.stack.mark(),
                PROTO => {
                    let proto = self.read_u8()?;
                    if proto > HIGHEST_PROTOCOL {
                        return self.error(ErrorCode::UnsupportedProtocol(proto.into()));
                    }
                    self.proto = proto;
                }
                FRAME => {
                    let len = self.read_size64()?;
                    let data = self.read_vec(len)?;
                    // The frame bytes are counted again as they are consumed.
                    self.pos -= len;
                    log::trace!("prefetched frame of {} bytes", len);
                    self.frame = Some(BufferCursor::new(data));
                }

                // Memo ops
                PUT => {
                    let line = self.read_line()?;
                    let idx = self.parse_memo_index(line)?;
                    self.memo_put(idx)?;
                }
                BINPUT => {
                    let idx = self.read_u8()?;
                    self.memo_put(idx.into())?;
                }
                LONG_BINPUT => {
                    let idx = LittleEndian::read_u32(&self.read_array::<4>()?);
                    self.memo_put(idx)?;
                }
                MEMOIZE => {
                    let idx = u32::try_from(self.memo.len())
                        .map_err(|_| Error::Eval(ErrorCode::Overflow("memo size"), self.pos))?;
                    self.memo_put(idx)?;
                }
                GET => {
                    let line = self.read_line()?;
                    let idx = self.parse_memo_index(line)?;
                    self.memo_get(idx)?;
                }
                BINGET => {
                    let idx = self.read_u8()?;
                    self.memo_get(idx.into())?;
                }
                LONG_BINGET => {
                    let idx = LittleEndian::read_u32(&self.read_array::<4>()?);
                    self.memo_get(idx)?;
                }

                // Singletons
                NONE => self.stack.push(Value::None),
                NEWFALSE => self.stack.push(Value::Bool(false)),
                NEWTRUE => self.stack.push(Value::Bool(true)),

                // ASCII-formatted numbers
                INT => {
                    let line = self.read_line()?;
                    // Handle protocol 1 way of spelling true/false
                    let value = match &*line {
                        b"00" => Value::Bool(false),
                        b"01" => Value::Bool(true),
                        _ => self.parse_int(line)?,
                    };
                    self.stack.push(value);
                }
                LONG => {
                    let mut line = self.read_line()?;
                    // Remove "L" suffix.
                    if line.last() == Some(&b'L') { line.pop(); }
                    let value = self.parse_int(line)?;
                    self.stack.push(value);
                }
                FLOAT => {
                    let line = self.read_line()?;
                    match str::from_utf8(&line).ok().and_then(|s| s.trim().parse::<f64>().ok()) {
                        Some(f) => self.stack.push(Value::F64(f)),
                        None => return self.error(ErrorCode::InvalidLiteral(line)),
                    }
                }

                // Binary-coded numbers
                BINFLOAT => {
                    let bytes = self.read_array::<8>()?;
                    self.stack.push(Value::F64(BigEndian::read_f64(&bytes)));
                }
                BININT => {
                    let bytes = self.read_array::<4>()?;
                    self.stack.push(Value::I64(LittleEndian::read_i32(&bytes).into()));
                }
                BININT1 => {
                    let byte = self.read_u8()?;
                    self.stack.push(Value::I64(byte.into()));
                }
                BININT2 => {
                    let bytes = self.read_array::<2>()?;
                    self.stack.push(Value::I64(LittleEndian::read_u16(&bytes).into()));
                }

                // Length-prefixed longs
                LONG1 => {
                    let len = self.read_u8()?;
                    let bytes = self.read_vec(len.into())?;
                    self.stack.push(Value::from_bigint(BigInt::from_signed_bytes_le(&bytes)));
                }
                LONG4 => {
                    let len = self.read_size32_signed("LONG pickle")?;
                    let bytes = self.read_vec(len)?;
                    self.stack.push(Value::from_bigint(BigInt::from_signed_bytes_le(&bytes)));
                }

                // Until-EOL strings
                STRING => {
                    let line = self.read_line()?;
                    let quoted = line.len() >= 2 && line[0] == line[line.len() - 1] &&
                        (line[0] == b'"' || line[0] == b'\'');
                    if !quoted {
                        return self.error(ErrorCode::InvalidLiteral(line));
                    }
                    let bytes = decode_escaped_string(&line[1..line.len() - 1]).map_err(at(self.pos))?;
                    let value = self.decode_string(bytes)?;
                    self.stack.push(value);
                }
                UNICODE => {
                    let line = self.read_line()?;
                    let string = decode_raw_unicode_escape(&line).map_err(at(self.pos))?;
                    let value = self.heap.string(string);
                    self.stack.push(value);
                }

                // Length-prefixed (byte)strings
                SHORT_BINSTRING => {
                    let len = self.read_u8()?;
                    let bytes = self.read_vec(len.into())?;
                    let value = self.decode_string(bytes)?;
                    self.stack.push(value);
                }
                BINSTRING => {
                    let len = self.read_size32_signed("BINSTRING pickle")?;
                    let bytes = self.read_vec(len)?;
                    let value = self.decode_string(bytes)?;
                    self.stack.push(value);
                }
                SHORT_BINUNICODE => {
                    let len = self.read_u8()?;
                    self.load_unicode(len.into())?;
                }
                BINUNICODE => {
                    let len = self.read_size32()?;
                    self.load_unicode(len)?;
                }
                BINUNICODE8 => {
                    let len = self.read_size64()?;
                    self.load_unicode(len)?;
                }
                SHORT_BINBYTES => {
                    let len = self.read_u8()?;
                    let bytes = self.read_vec(len.into())?;
                    let value = self.heap.bytes(bytes);
                    self.stack.push(value);
                }
                BINBYTES => {
                    let len = self.read_size32()?;
                    let bytes = self.read_vec(len)?;
                    let value = self.heap.bytes(bytes);
                    self.stack.push(value);
                }
                BINBYTES8 => {
                    let len = self.read_size64()?;
                    let bytes = self.read_vec(len)?;
                    let value = self.heap.bytes(bytes);
                    self.stack.push(value);
                }
                BYTEARRAY8 => {
                    let len = self.read_size64()?;
                    let bytes = self.read_vec(len)?;
                    let value = self.heap.bytearray(bytes);
                    self.stack.push(value);
                }

                // Out-of-band buffers
                NEXT_BUFFER => {
                    let buffer = match self.buffers.as_mut() {
                        None => return self.error(ErrorCode::MissingBuffer(
                            "pickle stream refers to out-of-band data but no buffers were given")),
                        Some(buffers) => buffers.pop_front(),
                    };
                    match buffer {
                        Some(buffer) => {
                            let value = self.heap.alloc(Object::Buffer(buffer));
                            self.stack.push(value);
                        }
                        None => return self.error(ErrorCode::MissingBuffer("not enough out-of-band buffers")),
                    }
                }
                READONLY_BUFFER => self.load_readonly_buffer()?,

                // Containers
                EMPTY_TUPLE => {
                    let tuple = self.heap.tuple(Vec::new());
                    self.stack.push(tuple);
                }
                TUPLE1 => self.load_counted_tuple(1)?,
                TUPLE2 => self.load_counted_tuple(2)?,
                TUPLE3 => self.load_counted_tuple(3)?,
                TUPLE => {
                    let mark = self.pop_mark()?;
                    self.stack.pop_tuple(&mut self.heap, mark).map_err(at(self.pos))?;
                }
                EMPTY_LIST => {
                    let list = self.heap.list(Vec::new());
                    self.stack.push(list);
                }
                LIST => {
                    let mark = self.pop_mark()?;
                    self.stack.pop_list(&mut self.heap, mark).map_err(at(self.pos))?;
                }
                APPEND => {
                    let start = self.top_start(1)?;
                    self.do_append(start)?;
                }
                APPENDS => {
                    let mark = self.pop_mark()?;
                    self.do_append(mark)?;
                }
                EMPTY_DICT => {
                    let dict = self.heap.empty_dict();
                    self.stack.push(dict);
                }
                DICT => {
                    let mark = self.pop_mark()?;
                    let items = self.stack.drain_from(mark).map_err(at(self.pos))?;
                    if items.len() % 2 != 0 {
                        return self.error(ErrorCode::OddItemCount("DICT"));
                    }
                    let dict = self.heap.dict(pairs(items)).map_err(at(self.pos))?;
                    self.stack.push(dict);
                }
                SETITEM => {
                    let start = self.top_start(2)?;
                    self.do_setitems(start)?;
                }
                SETITEMS => {
                    let mark = self.pop_mark()?;
                    self.do_setitems(mark)?;
                }
                EMPTY_SET => {
                    let set = self.heap.empty_set();
                    self.stack.push(set);
                }
                FROZENSET => {
                    let mark = self.pop_mark()?;
                    let items = self.stack.drain_from(mark).map_err(at(self.pos))?;
                    let set = self.heap.frozenset(items).map_err(at(self.pos))?;
                    self.stack.push(set);
                }
                ADDITEMS => {
                    let mark = self.pop_mark()?;
                    self.do_additems(mark)?;
                }

                // Globals and extensions
                GLOBAL => {
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let (module, name) = self.global_names(module, name)?;
                    let global = self.find_class(&module, &name)?;
                    self.stack.push(global);
                }
                STACK_GLOBAL => {
                    let name = self.pop()?;
                    let module = self.pop()?;
                    let (module, name) = match (self.heap.as_str(&module), self.heap.as_str(&name)) {
                        (Some(module), Some(name)) => (module.to_owned(), name.to_owned()),
                        _ => return self.error(ErrorCode::MalformedGlobal(
                            "STACK_GLOBAL requires str".into())),
                    };
                    let global = self.find_class(&module, &name)?;
                    self.stack.push(global);
                }
                EXT1 => {
                    let code = self.read_u8()?;
                    self.load_extension(code.into())?;
                }
                EXT2 => {
                    let code = LittleEndian::read_u16(&self.read_array::<2>()?);
                    self.load_extension(code.into())?;
                }
                EXT4 => {
                    let code = LittleEndian::read_i32(&self.read_array::<4>()?);
                    self.load_extension(code)?;
                }

                // Object construction
                REDUCE => {
                    let args = self.pop()?;
                    let callable = self.pop()?;
                    self.check_tuple(&args)?;
                    let obj = self.hooks.call(&mut self.heap, callable, args).map_err(at(self.pos))?;
                    self.stack.push(obj);
                }
                BUILD => {
                    if self.stack.len() < self.stack.fence() + 2 {
                        return self.error(self.stack.underflow());
                    }
                    let state = self.pop()?;
                    let inst = self.stack.top().map_err(at(self.pos))?.clone();
                    self.hooks.set_state(&mut self.heap, &inst, state).map_err(at(self.pos))?;
                }
                NEWOBJ => {
                    let args = self.pop()?;
                    let cls = self.pop()?;
                    self.check_tuple(&args)?;
                    let obj = self.hooks.new_object(&mut self.heap, cls, args, None).map_err(at(self.pos))?;
                    self.stack.push(obj);
                }
                NEWOBJ_EX => {
                    let kwargs = self.pop()?;
                    let args = self.pop()?;
                    let cls = self.pop()?;
                    self.check_tuple(&args)?;
                    if !matches!(self.heap.deref(&kwargs), Some(Object::Dict(_))) {
                        let found = self.heap.type_name(&kwargs).to_owned();
                        return self.error(ErrorCode::InvalidStackTop("dict", found));
                    }
                    let obj = self.hooks.new_object(&mut self.heap, cls, args, Some(kwargs))
                        .map_err(at(self.pos))?;
                    self.stack.push(obj);
                }
                INST => {
                    let mark = self.pop_mark()?;
                    let module = self.read_line()?;
                    let name = self.read_line()?;
                    let (module, name) = self.global_names(module, name)?;
                    let cls = self.find_class(&module, &name)?;
                    let items = self.stack.drain_from(mark).map_err(at(self.pos))?;
                    let args = self.heap.tuple(items);
                    let obj = self.hooks.call(&mut self.heap, cls, args).map_err(at(self.pos))?;
                    self.stack.push(obj);
                }
                OBJ => {
                    let mark = self.pop_mark()?;
                    if self.stack.len() <= mark {
                        return self.error(self.stack.underflow());
                    }
                    let items = self.stack.drain_from(mark + 1).map_err(at(self.pos))?;
                    let cls = self.pop()?;
                    let args = self.heap.tuple(items);
                    let obj = self.hooks.call(&mut self.heap, cls, args).map_err(at(self.pos))?;
                    self.stack.push(obj);
                }

                // Persistent ids
                PERSID => {
                    let line = self.read_line()?;
                    if !line.is_ascii() {
                        return self.error(ErrorCode::StringDecode("ascii"));
                    }
                    let pid = self.heap.string(String::from_utf8_lossy(&line));
                    let obj = self.hooks.persistent_load(&mut self.heap, pid).map_err(at(self.pos))?;
                    self.stack.push(obj);
                }
                BINPERSID => {
                    let pid = self.pop()?;
                    let obj = self.hooks.persistent_load(&mut self.heap, pid).map_err(at(self.pos))?;
                    self.stack.push(obj);
                }

                code => return self.error(ErrorCode::InvalidLoadKey(code)),
            }
        }
    }

    fn error<T>(&self, reason: ErrorCode) -> Result<T> {
        Err(Error::Eval(reason, self.pos))
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().map_err(at(self.pos))
    }

    fn pop_mark(&mut self) -> Result<usize> {
        self.stack.pop_mark().map_err(at(self.pos))
    }

    // Start index of the topmost `n` values.
    fn top_start(&self, n: usize) -> Result<usize> {
        match self.stack.len().checked_sub(n) {
            Some(start) => Ok(start),
            None => self.error(self.stack.underflow()),
        }
    }

    fn check_tuple(&self, args: &Value) -> Result<()> {
        if self.heap.as_tuple(args).is_none() {
            let found = self.heap.type_name(args).to_owned();
            return self.error(ErrorCode::InvalidStackTop("tuple", found));
        }
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<()> {
        let pos = self.pos;
        if let Some(frame) = self.frame.as_mut().filter(|frame| !frame.is_exhausted()) {
            let data = frame.read_bytes(buf.len()).map_err(|_| Error::Eval(ErrorCode::FrameExhausted, pos))?;
            buf.copy_from_slice(data);
            self.pos += buf.len();
            return Ok(());
        }
        self.frame = None;
        match self.rdr.read_exact(buf) {
            Ok(()) => {
                self.pos += buf.len();
                Ok(())
            }
            Err(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => Err(Error::Eval(ErrorCode::Truncated, pos)),
            Err(err) => Err(Error::Io(err)),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0; 1];
        self.read_into(&mut buf)?;
        Ok(buf[0])
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0; N];
        self.read_into(&mut buf)?;
        Ok(buf)
    }

    fn read_vec(&mut self, n: usize) -> Result<Vec<u8>> {
        let pos = self.pos;
        if let Some(frame) = self.frame.as_mut().filter(|frame| !frame.is_exhausted()) {
            let data = frame.read_bytes(n).map_err(|_| Error::Eval(ErrorCode::FrameExhausted, pos))?.to_vec();
            self.pos += n;
            return Ok(data);
        }
        self.frame = None;
        let mut data = Vec::with_capacity(n.min(MAX_PREALLOC));
        while data.len() < n {
            let step = (n - data.len()).min(MAX_PREALLOC.max(data.len()));
            let got = io::Read::take(&mut self.rdr, step as u64).read_to_end(&mut data)?;
            if got < step {
                return Err(Error::Eval(ErrorCode::Truncated, pos + data.len()));
            }
        }
        self.pos += n;
        Ok(data)
    }

    fn read_line(&mut self) -> Result<Vec<u8>> {
        let pos = self.pos;
        let mut line = if let Some(frame) = self.frame.as_mut().filter(|frame| !frame.is_exhausted()) {
            let line = frame.read_line().ok_or(Error::Eval(ErrorCode::FrameExhausted, pos))?.to_vec();
            self.pos += line.len() + 1;
            line
        } else {
            self.frame = None;
            let mut line = Vec::with_capacity(16);
            self.rdr.read_until(b'\n', &mut line)?;
            self.pos += line.len();
            if line.pop() != Some(b'\n') {
                return Err(Error::Eval(ErrorCode::Truncated, self.pos));
            }
            line
        };
        if line.last() == Some(&b'\r') { line.pop(); }
        Ok(line)
    }

    fn read_size32(&mut self) -> Result<usize> {
        let len = LittleEndian::read_u32(&self.read_array::<4>()?);
        self.check_size(len.into())
    }

    fn read_size32_signed(&mut self, what: &'static str) -> Result<usize> {
        let len = LittleEndian::read_i32(&self.read_array::<4>()?);
        match u64::try_from(len) {
            Ok(len) => self.check_size(len),
            Err(_) => self.error(ErrorCode::NegativeLength(what)),
        }
    }

    fn read_size64(&mut self) -> Result<usize> {
        let len = LittleEndian::read_u64(&self.read_array::<8>()?);
        self.check_size(len)
    }

    fn check_size(&self, len: u64) -> Result<usize> {
        match usize::try_from(len) {
            Ok(len) if isize::try_from(len).is_ok() => Ok(len),
            _ => self.error(ErrorCode::Overflow("length exceeds the system's maximum size")),
        }
    }

    fn parse_int(&self, line: Vec<u8>) -> Result<Value> {
        let parsed = str::from_utf8(&line).ok().map(str::trim).and_then(|s| {
            s.parse::<i64>().ok().map(Value::I64)
                .or_else(|| s.parse::<BigInt>().ok().map(Value::from_bigint))
        });
        match parsed {
            Some(value) => Ok(value),
            None => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    fn parse_memo_index(&self, line: Vec<u8>) -> Result<u32> {
        match str::from_utf8(&line).ok().and_then(|s| s.trim().parse::<u32>().ok()) {
            Some(idx) => Ok(idx),
            None => self.error(ErrorCode::InvalidLiteral(line)),
        }
    }

    fn memo_put(&mut self, idx: u32) -> Result<()> {
        let value = self.stack.top().map_err(at(self.pos))?.clone();
        self.memo.set(idx, value).map_err(at(self.pos))
    }

    fn memo_get(&mut self, idx: u32) -> Result<()> {
        let value = self.memo.get(idx).map_err(at(self.pos))?.clone();
        self.stack.push(value);
        Ok(())
    }

    fn decode_string(&mut self, bytes: Vec<u8>) -> Result<Value> {
        let string = match self.options.encoding {
            StringEncoding::Bytes => return Ok(self.heap.bytes(bytes)),
            StringEncoding::Latin1 => bytes.iter().map(|&b| char::from(b)).collect(),
            StringEncoding::Ascii => match decode_text(&bytes, true, self.options.errors) {
                Some(string) => string,
                None => return self.error(ErrorCode::StringDecode("ascii")),
            },
            StringEncoding::Utf8 => match decode_text(&bytes, false, self.options.errors) {
                Some(string) => string,
                None => return self.error(ErrorCode::StringDecode("utf-8")),
            },
        };
        Ok(self.heap.string(string))
    }

    fn load_unicode(&mut self, len: usize) -> Result<()> {
        let bytes = self.read_vec(len)?;
        match String::from_utf8(bytes) {
            Ok(string) => {
                let value = self.heap.string(string);
                self.stack.push(value);
                Ok(())
            }
            Err(_) => self.error(ErrorCode::StringDecode("utf-8")),
        }
    }

    fn global_names(&self, module: Vec<u8>, name: Vec<u8>) -> Result<(String, String)> {
        match (String::from_utf8(module), String::from_utf8(name)) {
            (Ok(module), Ok(name)) => Ok((module, name)),
            (Err(err), _) | (_, Err(err)) =>
                self.error(ErrorCode::MalformedGlobal(String::from_utf8_lossy(err.as_bytes()).into_owned())),
        }
    }

    fn load_counted_tuple(&mut self, n: usize) -> Result<()> {
        let start = self.top_start(n)?;
        self.stack.pop_tuple(&mut self.heap, start).map_err(at(self.pos))
    }

    fn load_extension(&mut self, code: i32) -> Result<()> {
        if code <= 0 {
            return self.error(ErrorCode::InvalidExtensionCode);
        }
        if let Some(obj) = self.ext_cache.get(&code) {
            let obj = obj.clone();
            self.stack.push(obj);
            return Ok(());
        }
        let (module, name) = match self.registry.key_for(code) {
            Some(key) => key,
            None => return self.error(ErrorCode::ExtensionUnregistered(code.into())),
        };
        let obj = self.find_class(&module, &name)?;
        self.ext_cache.insert(code, obj.clone());
        self.stack.push(obj);
        Ok(())
    }

    fn load_readonly_buffer(&mut self) -> Result<()> {
        let top = self.stack.top().map_err(at(self.pos))?.clone();
        let replacement = match top.obj_ref().and_then(|r| self.heap.get_mut(r)) {
            Some(Object::Buffer(buffer)) => {
                buffer.readonly = true;
                None
            }
            Some(Object::Bytes(_)) => None,
            Some(Object::ByteArray(data)) => Some(data.clone()),
            _ => {
                let found = self.heap.type_name(&top).to_owned();
                return self.error(ErrorCode::InvalidStackTop("buffer", found));
            }
        };
        if let Some(data) = replacement {
            let view = self.heap.buffer(data, true);
            self.stack.set_top(view).map_err(at(self.pos))?;
        }
        Ok(())
    }

    // Checks shared by APPENDS, SETITEMS and ADDITEMS: the target sits just
    // below `start`.  Returns `None` if there is nothing to add.
    fn items_target(&self, start: usize) -> Result<Option<Value>> {
        let len = self.stack.len();
        if start > len || start <= self.stack.fence() {
            return self.error(self.stack.underflow());
        }
        if start == len {
            return Ok(None);
        }
        match self.stack.get(start - 1) {
            Some(target) => Ok(Some(target.clone())),
            None => self.error(self.stack.underflow()),
        }
    }

    fn do_append(&mut self, start: usize) -> Result<()> {
        let target = match self.items_target(start)? {
            Some(target) => target,
            None => return Ok(()),
        };
        let items = self.stack.drain_from(start).map_err(at(self.pos))?;
        if let Some(Object::List(list)) = target.obj_ref().and_then(|r| self.heap.get_mut(r)) {
            list.extend(items);
            return Ok(());
        }
        self.hooks.extend(&mut self.heap, &target, items).map_err(at(self.pos))
    }

    fn do_setitems(&mut self, start: usize) -> Result<()> {
        let target = match self.items_target(start)? {
            Some(target) => target,
            None => return Ok(()),
        };
        if (self.stack.len() - start) % 2 != 0 {
            return self.error(ErrorCode::OddItemCount("SETITEMS"));
        }
        let items = pairs(self.stack.drain_from(start).map_err(at(self.pos))?);
        match target.obj_ref() {
            Some(r) if matches!(self.heap.get(r), Some(Object::Dict(_))) => {
                for (key, value) in items {
                    self.heap.dict_set_item(r, key, value).map_err(at(self.pos))?;
                }
                Ok(())
            }
            _ => self.hooks.set_items(&mut self.heap, &target, items).map_err(at(self.pos)),
        }
    }

    fn do_additems(&mut self, start: usize) -> Result<()> {
        let target = match self.items_target(start)? {
            Some(target) => target,
            None => return Ok(()),
        };
        let items = self.stack.drain_from(start).map_err(at(self.pos))?;
        match target.obj_ref() {
            Some(r) if matches!(self.heap.get(r), Some(Object::Set(_))) => {
                for item in items {
                    self.heap.set_add(r, item).map_err(at(self.pos))?;
                }
                Ok(())
            }
            _ => self.hooks.add_items(&mut self.heap, &target, items).map_err(at(self.pos)),
        }
    }
}

fn pairs(items: Vec<Value>) -> Vec<(Value, Value)> {
    let mut result = Vec::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        result.push((key, value));
    }
    result
}

// Python 2 `str` literals use the usual string escapes.
fn decode_escaped_string(s: &[u8]) -> std::result::Result<Vec<u8>, ErrorCode> {
    let invalid = || ErrorCode::InvalidLiteral(s.into());
    let mut result = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        let b = s[i];
        i += 1;
        if b != b'\\' {
            result.push(b);
            continue;
        }
        let esc = *s.get(i).ok_or_else(invalid)?;
        i += 1;
        match esc {
            b'\n' => {}
            b'\\' | b'\'' | b'"' => result.push(esc),
            b'a' => result.push(b'\x07'),
            b'b' => result.push(b'\x08'),
            b't' => result.push(b'\t'),
            b'n' => result.push(b'\n'),
            b'v' => result.push(b'\x0b'),
            b'f' => result.push(b'\x0c'),
            b'r' => result.push(b'\r'),
            b'x' => {
                let digits = s.get(i..i + 2).ok_or_else(invalid)?;
                let hex = str::from_utf8(digits).map_err(|_| invalid())?;
                if !digits.iter().all(u8::is_ascii_hexdigit) {
                    return Err(invalid());
                }
                result.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                for _ in 0..2 {
                    match s.get(i) {
                        Some(&d @ b'0'..=b'7') => {
                            value = value * 8 + u32::from(d - b'0');
                            i += 1;
                        }
                        _ => break,
                    }
                }
                // Out-of-range octal escapes wrap around.
                result.push(value as u8);
            }
            _ => {
                result.push(b'\\');
                result.push(esc);
            }
        }
    }
    Ok(result)
}

// These are encoded with "raw-unicode-escape", which only knows the \uXXXX
// and \UXXXXXXXX escapes; an escape needs an odd run of backslashes.  All
// other bytes are Latin-1.
fn decode_raw_unicode_escape(s: &[u8]) -> std::result::Result<String, ErrorCode> {
    let invalid = || ErrorCode::InvalidLiteral(s.into());
    let mut result = String::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        if s[i] != b'\\' {
            result.push(char::from(s[i]));
            i += 1;
            continue;
        }
        let run_start = i;
        while i < s.len() && s[i] == b'\\' {
            i += 1;
        }
        let run = i - run_start;
        let width = match s.get(i) {
            Some(b'u') if run % 2 == 1 => 4,
            Some(b'U') if run % 2 == 1 => 8,
            _ => 0,
        };
        let literal = if width > 0 { run - 1 } else { run };
        result.extend(std::iter::repeat('\\').take(literal));
        if width > 0 {
            let digits = s.get(i + 1..i + 1 + width).ok_or_else(invalid)?;
            if !digits.iter().all(u8::is_ascii_hexdigit) {
                return Err(invalid());
            }
            let hex = str::from_utf8(digits).map_err(|_| invalid())?;
            let code = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
            result.push(char::from_u32(code).ok_or_else(invalid)?);
            i += 1 + width;
        }
    }
    Ok(result)
}

/// Decodes a value from a `BufRead`, checking that nothing follows it.
fn value_from_bufread<R: BufRead>(rdr: R, options: DeOptions) -> Result<(Heap, Value)> {
    let mut unpickler = Unpickler::with_options(rdr, options)?;
    let value = unpickler.load()?;
    // Make sure the whole stream has been consumed.
    unpickler.end()?;
    Ok((unpickler.take_heap(), value))
}

/// Decodes ASCII (`ascii_only`) or UTF-8 text.  Returns `None` if invalid
/// input is met under `DecodeErrors::Strict`.
fn decode_text(mut bytes: &[u8], ascii_only: bool, errors: DecodeErrors) -> Option<String> {
    let mut result = String::with_capacity(bytes.len());
    while !bytes.is_empty() {
        let (valid, invalid) = if ascii_only {
            match bytes.iter().position(|b| !b.is_ascii()) {
                Some(n) => (n, 1),
                None => (bytes.len(), 0),
            }
        } else {
            match str::from_utf8(bytes) {
                Ok(_) => (bytes.len(), 0),
                Err(err) => {
                    let n = err.valid_up_to();
                    (n, err.error_len().unwrap_or(bytes.len() - n))
                }
            }
        };
        result.push_str(str::from_utf8(&bytes[..valid]).ok()?);
        if invalid > 0 {
            match errors {
                DecodeErrors::Strict => return None,
                DecodeErrors::Ignore => {}
                DecodeErrors::Replace => result.push(char::REPLACEMENT_CHARACTER),
                DecodeErrors::BackslashReplace => {
                    for b in &bytes[valid..valid + invalid] {
                        result.push_str(&format!("\\x{:02x}", b));
                    }
                }
            }
        }
        bytes = &bytes[valid + invalid..];
    }
    Some(result)
}

/// Decodes a value directly from an iterator.
pub fn value_from_iter<I>(iter: I, options: DeOptions) -> Result<(Heap, Value)>
    where I: Iterator<Item=io::Result<u8>>
{
    value_from_reader(IterRead::new(iter), options)
}

/// Decodes a value from a `std::io::Read`.
pub fn value_from_reader<R: io::Read>(rdr: R, options: DeOptions) -> Result<(Heap, Value)> {
    value_from_bufread(io::BufReader::new(rdr), options)
}

/// Decodes a value from a byte slice `&[u8]`.
pub fn value_from_slice(v: &[u8], options: DeOptions) -> Result<(Heap, Value)> {
    value_from_bufread(v, options)
}
