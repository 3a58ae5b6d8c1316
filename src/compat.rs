// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Translation of global names between Python 2 and Python 3 spellings.
//!
//! Protocols 0 to 2 were written by Python 2, whose standard library had
//! different module names.  With `fix_imports`, globals are written with the
//! old names and read back with the new ones.

// Python 2 module -> Python 3 module.
static IMPORT_MAPPING: &[(&str, &str)] = &[
    ("__builtin__", "builtins"),
    ("copy_reg", "copyreg"),
    ("Queue", "queue"),
    ("SocketServer", "socketserver"),
    ("ConfigParser", "configparser"),
    ("repr", "reprlib"),
    ("_winreg", "winreg"),
    ("thread", "_thread"),
    ("dummy_thread", "_dummy_thread"),
    ("dbhash", "dbm.bsd"),
    ("dumbdbm", "dbm.dumb"),
    ("dbm", "dbm.ndbm"),
    ("gdbm", "dbm.gnu"),
    ("xmlrpclib", "xmlrpc.client"),
    ("SimpleXMLRPCServer", "xmlrpc.server"),
    ("httplib", "http.client"),
    ("htmlentitydefs", "html.entities"),
    ("HTMLParser", "html.parser"),
    ("Cookie", "http.cookies"),
    ("cookielib", "http.cookiejar"),
    ("BaseHTTPServer", "http.server"),
    ("test.test_support", "test.support"),
    ("commands", "subprocess"),
    ("urlparse", "urllib.parse"),
    ("robotparser", "urllib.robotparser"),
    ("urllib2", "urllib.request"),
    ("anydbm", "dbm"),
    ("_abcoll", "collections.abc"),
];

// Modules that merged into one Python 3 module; these only map forward.
static IMPORT_MAPPING_ONE_WAY: &[(&str, &str)] = &[
    ("cPickle", "pickle"),
    ("StringIO", "io"),
    ("cStringIO", "io"),
    ("UserDict", "collections"),
    ("UserList", "collections"),
    ("UserString", "collections"),
    ("whichdb", "dbm"),
    ("SimpleHTTPServer", "http.server"),
    ("CGIHTTPServer", "http.server"),
];

// (Python 2 module, name) -> (Python 3 module, name).
static NAME_MAPPING: &[((&str, &str), (&str, &str))] = &[
    (("__builtin__", "xrange"), ("builtins", "range")),
    (("__builtin__", "reduce"), ("functools", "reduce")),
    (("__builtin__", "intern"), ("sys", "intern")),
    (("__builtin__", "unichr"), ("builtins", "chr")),
    (("__builtin__", "unicode"), ("builtins", "str")),
    (("__builtin__", "long"), ("builtins", "int")),
    (("itertools", "izip"), ("builtins", "zip")),
    (("itertools", "imap"), ("builtins", "map")),
    (("itertools", "ifilter"), ("builtins", "filter")),
    (("itertools", "ifilterfalse"), ("itertools", "filterfalse")),
    (("itertools", "izip_longest"), ("itertools", "zip_longest")),
    (("UserDict", "IterableUserDict"), ("collections", "UserDict")),
    (("UserList", "UserList"), ("collections", "UserList")),
    (("UserString", "UserString"), ("collections", "UserString")),
    (("whichdb", "whichdb"), ("dbm", "whichdb")),
];

// Names whose Python 3 spelling is shared by several Python 2 ones.
static NAME_MAPPING_ONE_WAY: &[((&str, &str), (&str, &str))] = &[
    (("__builtin__", "basestring"), ("builtins", "str")),
    (("UserDict", "UserDict"), ("collections", "UserDict")),
    (("socket", "_socketobject"), ("socket", "SocketType")),
    (("exceptions", "StandardError"), ("builtins", "Exception")),
];

// Python 2 kept these in the `exceptions` module.
static PYTHON2_EXCEPTIONS: &[&str] = &[
    "ArithmeticError", "AssertionError", "AttributeError", "BaseException",
    "BufferError", "BytesWarning", "DeprecationWarning", "EOFError",
    "EnvironmentError", "Exception", "FloatingPointError", "FutureWarning",
    "GeneratorExit", "IOError", "ImportError", "ImportWarning",
    "IndentationError", "IndexError", "KeyError", "KeyboardInterrupt",
    "LookupError", "MemoryError", "NameError", "NotImplementedError",
    "OSError", "OverflowError", "PendingDeprecationWarning", "ReferenceError",
    "RuntimeError", "RuntimeWarning", "StopIteration", "SyntaxError",
    "SyntaxWarning", "SystemError", "SystemExit", "TabError", "TypeError",
    "UnboundLocalError", "UnicodeDecodeError", "UnicodeEncodeError",
    "UnicodeError", "UnicodeTranslateError", "UnicodeWarning", "UserWarning",
    "ValueError", "Warning", "ZeroDivisionError",
];

/// Maps a Python 2 global to its Python 3 spelling (used when loading).
pub fn to_python3(module: &str, name: &str) -> (String, String) {
    let key = (module, name);
    if let Some((_, (m, n))) = NAME_MAPPING.iter().chain(NAME_MAPPING_ONE_WAY).find(|(k, _)| *k == key) {
        return ((*m).into(), (*n).into());
    }
    if module == "exceptions" && PYTHON2_EXCEPTIONS.contains(&name) {
        return ("builtins".into(), name.into());
    }
    if let Some((_, m)) = IMPORT_MAPPING.iter().chain(IMPORT_MAPPING_ONE_WAY).find(|(k, _)| *k == module) {
        return ((*m).into(), name.into());
    }
    (module.into(), name.into())
}

/// Maps a Python 3 global to its Python 2 spelling (used when dumping).
pub fn to_python2(module: &str, name: &str) -> (String, String) {
    let key = (module, name);
    if let Some(((m, n), _)) = NAME_MAPPING.iter().find(|(_, v)| *v == key) {
        return ((*m).into(), (*n).into());
    }
    if module == "builtins" && PYTHON2_EXCEPTIONS.contains(&name) {
        return ("exceptions".into(), name.into());
    }
    if let Some((m, _)) = IMPORT_MAPPING.iter().find(|(_, v)| *v == module) {
        return ((*m).into(), name.into());
    }
    (module.into(), name.into())
}
