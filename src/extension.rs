// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! The extension registry: short integer codes for well-known globals.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::ErrorCode;

/// Highest code an extension may be registered under.
pub const MAX_EXTENSION_CODE: i32 = 0x7fff_ffff;

#[derive(Debug, Default)]
struct Tables {
    by_key: HashMap<(String, String), i32>,
    by_code: HashMap<i32, (String, String)>,
}

/// A mapping `(module, name) <-> code` shared between picklers and
/// unpicklers.
///
/// The registry is internally synchronized; share it with `Arc`.
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    tables: RwLock<Tables>,
}

impl ExtensionRegistry {
    pub fn new() -> ExtensionRegistry {
        ExtensionRegistry::default()
    }

    pub fn shared() -> Arc<ExtensionRegistry> {
        Arc::new(ExtensionRegistry::new())
    }

    /// Registers `module.name` under `code`.
    ///
    /// Registering the same pair twice is fine; reusing a code or a key for
    /// something else is not.
    pub fn add(&self, module: &str, name: &str, code: i32) -> Result<(), ErrorCode> {
        if !(1..=MAX_EXTENSION_CODE).contains(&code) {
            return Err(ErrorCode::InvalidValue(format!("extension code {} out of range", code)));
        }
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let key = (module.to_owned(), name.to_owned());
        if tables.by_key.get(&key) == Some(&code) && tables.by_code.get(&code) == Some(&key) {
            return Ok(());
        }
        if let Some(other) = tables.by_key.get(&key) {
            return Err(ErrorCode::InvalidValue(
                format!("key {}.{} is already registered with code {}", module, name, other)));
        }
        if let Some((m, n)) = tables.by_code.get(&code) {
            return Err(ErrorCode::InvalidValue(
                format!("code {} is already in use for key {}.{}", code, m, n)));
        }
        tables.by_key.insert(key.clone(), code);
        tables.by_code.insert(code, key);
        Ok(())
    }

    /// Unregisters an extension; the pair must match exactly.
    pub fn remove(&self, module: &str, name: &str, code: i32) -> Result<(), ErrorCode> {
        let mut tables = self.tables.write().unwrap_or_else(|e| e.into_inner());
        let key = (module.to_owned(), name.to_owned());
        if tables.by_key.get(&key) != Some(&code) || tables.by_code.get(&code) != Some(&key) {
            return Err(ErrorCode::InvalidValue(
                format!("key {}.{} is not registered with code {}", module, name, code)));
        }
        tables.by_key.remove(&key);
        tables.by_code.remove(&code);
        Ok(())
    }

    pub fn code_for(&self, module: &str, name: &str) -> Option<i32> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_key.get(&(module.to_owned(), name.to_owned())).copied()
    }

    pub fn key_for(&self, code: i32) -> Option<(String, String)> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.by_code.get(&code).cloned()
    }

    pub fn len(&self) -> usize {
        self.tables.read().unwrap_or_else(|e| e.into_inner()).by_code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
