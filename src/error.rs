// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Error objects and codes

use std::fmt;
use std::io;
use std::result;
use serde::{ser, de};

/// The detailed reason for a failed dump or load.
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ErrorCode {
    /// Input ended in the middle of a value
    #[error("pickle data was truncated")]
    Truncated,
    /// Opcode byte not known to any protocol
    #[error("invalid load key, {0:#04x}")]
    InvalidLoadKey(u8),
    /// Pop below the current fence with no mark present
    #[error("unpickling stack underflow")]
    StackUnderflow,
    /// Pop below the current fence that would consume a mark
    #[error("unexpected MARK found")]
    UnexpectedMark,
    /// Mark-terminated opcode without an open mark
    #[error("could not find MARK")]
    MarkNotFound,
    /// Length prefix found negative
    #[error("negative byte count for {0}")]
    NegativeLength(&'static str),
    /// Dict-building opcode with an odd number of stack items
    #[error("odd number of items for {0}")]
    OddItemCount(&'static str),
    /// A read started inside a frame but ran past its end
    #[error("pickle exhausted before end of frame")]
    FrameExhausted,
    /// String decoding failed
    #[error("string is not {0} encoded")]
    StringDecode(&'static str),
    /// Wrong stack top type for opcode
    #[error("invalid stack top, expected {0}, got {1}")]
    InvalidStackTop(&'static str, String),
    /// Value not hashable, but used as dict key or set item
    #[error("unhashable type: {0}")]
    ValueNotHashable(&'static str),
    /// Recursive structure found where a tree is required
    #[error("recursive structure found")]
    Recursive,
    /// A value was missing from the memo
    #[error("memo value not found at index {0}")]
    MissingMemo(u32),
    /// Invalid literal found
    #[error("literal is invalid: {}", String::from_utf8_lossy(.0))]
    InvalidLiteral(Vec<u8>),
    /// Protocol number outside the supported range
    #[error("unsupported pickle protocol: {0}")]
    UnsupportedProtocol(i64),
    /// A size, index or length exceeds what can be represented
    #[error("overflow: {0}")]
    Overflow(&'static str),
    /// Fast mode nesting limit reached on a cyclic structure
    #[error("fast mode: can't pickle cyclic objects including object type {0}")]
    CyclicStructure(&'static str),
    /// The pickler recursed deeper than its configured limit
    #[error("maximum recursion depth exceeded while pickling an object")]
    RecursionLimit,
    /// No encoding and no reduction exists for the value
    #[error("cannot pickle {0}")]
    UnpicklableType(String),
    /// An EXT opcode named a code without registry entry
    #[error("unregistered extension code {0}")]
    ExtensionUnregistered(i64),
    /// An EXT opcode named a code outside the valid range
    #[error("EXT specifies code <= 0")]
    InvalidExtensionCode,
    /// A global reference could not be resolved or encoded
    #[error("malformed global: {0}")]
    MalformedGlobal(String),
    /// A NEXT_BUFFER opcode without enough out-of-band buffers
    #[error("{0}")]
    MissingBuffer(&'static str),
    /// Found trailing bytes after STOP opcode
    #[error("trailing bytes found")]
    TrailingBytes,
    /// A handle that does not belong to the heap in use
    #[error("dangling object reference #{0}")]
    DanglingReference(u32),
    /// Invalid argument to an API call
    #[error("invalid value: {0}")]
    InvalidValue(String),
    /// Structure conversion error (e.g., from a serde data format)
    #[error("{0}")]
    Structure(String),
}

/// The abstract class of an error, independent of the detailed reason.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    Io,
    Truncated,
    ProtocolViolation,
    StackUnderflow,
    MemoMiss,
    UnsupportedProtocol,
    Overflow,
    CyclicStructure,
    UnpicklableType,
    ExtensionUnregistered,
    MalformedGlobal,
    InvalidArgument,
}

impl ErrorCode {
    pub fn kind(&self) -> ErrorKind {
        match *self {
            ErrorCode::Truncated => ErrorKind::Truncated,
            ErrorCode::StackUnderflow |
            ErrorCode::UnexpectedMark => ErrorKind::StackUnderflow,
            ErrorCode::InvalidLoadKey(_) |
            ErrorCode::MarkNotFound |
            ErrorCode::NegativeLength(_) |
            ErrorCode::OddItemCount(_) |
            ErrorCode::FrameExhausted |
            ErrorCode::StringDecode(_) |
            ErrorCode::InvalidStackTop(..) |
            ErrorCode::ValueNotHashable(_) |
            ErrorCode::InvalidLiteral(_) |
            ErrorCode::InvalidExtensionCode |
            ErrorCode::MissingBuffer(_) |
            ErrorCode::TrailingBytes => ErrorKind::ProtocolViolation,
            ErrorCode::MissingMemo(_) => ErrorKind::MemoMiss,
            ErrorCode::UnsupportedProtocol(_) => ErrorKind::UnsupportedProtocol,
            ErrorCode::Overflow(_) |
            ErrorCode::RecursionLimit => ErrorKind::Overflow,
            ErrorCode::CyclicStructure(_) |
            ErrorCode::Recursive => ErrorKind::CyclicStructure,
            ErrorCode::UnpicklableType(_) => ErrorKind::UnpicklableType,
            ErrorCode::ExtensionUnregistered(_) => ErrorKind::ExtensionUnregistered,
            ErrorCode::MalformedGlobal(_) => ErrorKind::MalformedGlobal,
            ErrorCode::DanglingReference(_) |
            ErrorCode::InvalidValue(_) |
            ErrorCode::Structure(_) => ErrorKind::InvalidArgument,
        }
    }
}

/// This type represents all possible errors that can occur when pickling or
/// unpickling a value.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Some IO error occurred when writing or reading a stream.
    #[error("{0}")]
    Io(#[from] io::Error),
    /// The unpickler failed while interpreting the stream at the given offset.
    #[error("eval error at offset {1}: {0}")]
    Eval(ErrorCode, usize),
    /// The pickler could not encode the object graph.
    #[error("pickling error: {0}")]
    Pickle(ErrorCode),
    /// Error while converting between heap values and other representations.
    #[error("decoding error: {0}")]
    Syntax(ErrorCode),
}

impl Error {
    /// The detailed reason, if this is not an I/O error.
    pub fn code(&self) -> Option<&ErrorCode> {
        match *self {
            Error::Io(_) => None,
            Error::Eval(ref code, _) | Error::Pickle(ref code) | Error::Syntax(ref code) => Some(code),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match *self {
            Error::Io(ref err) if err.kind() == io::ErrorKind::UnexpectedEof => ErrorKind::Truncated,
            Error::Io(_) => ErrorKind::Io,
            Error::Eval(ref code, _) | Error::Pickle(ref code) | Error::Syntax(ref code) => code.kind(),
        }
    }
}

pub type Result<T> = result::Result<T, Error>;

impl de::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}

impl ser::Error for Error {
    fn custom<T: fmt::Display>(msg: T) -> Error {
        Error::Syntax(ErrorCode::Structure(msg.to_string()))
    }
}
