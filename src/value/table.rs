//! Hybrid array/map table
//!
//! Integer keys forming a contiguous run from the index origin live in a
//! dense `Vec`; every other key lives in an insertion-ordered `IndexMap`.
//! Iteration visits the array part first, then the map part in insertion
//! order.
//!
//! Setting a map entry to nil leaves a tombstone so that an iteration in
//! progress can continue from that key. Tombstones are swept only when a
//! non-nil value is stored into an absent or nil map slot while tombstones
//! exist; that sweep invalidates iteration positions held by callers.

use std::cell::Cell;
use std::rc::Rc;

use indexmap::IndexMap;

use super::{TableRef, Value};
use crate::error::{RuntimeError, RuntimeErrorKind, ScriptError, ScriptResult};

/// Integer keys up to this far past the array end still grow the array
pub const ARRAY_GROWTH_THRESHOLD: usize = 32;

/// A key/value entry as stored in the map part
#[derive(Debug, Clone)]
pub struct TablePair {
    pub key: Value,
    pub value: Value,
}

/// Hashable form of a table key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Boolean(bool),
    Number(u64),
    String(Rc<str>),
    Range(u64, u64, u64),
    Object(usize),
}

/// Why a value cannot be used as a key
enum KeyError {
    Nil,
    NaN,
    Invalid(&'static str),
}

impl KeyError {
    fn into_error(self) -> ScriptError {
        let message = match self {
            KeyError::Nil => "table index is nil".to_string(),
            KeyError::NaN => "table index is NaN".to_string(),
            KeyError::Invalid(t) => format!("invalid table key of type {}", t),
        };
        RuntimeError::new(RuntimeErrorKind::Index, message).into()
    }
}

fn normalize_number(n: f64) -> u64 {
    // 0.0 and -0.0 are the same key
    if n == 0.0 {
        0f64.to_bits()
    } else {
        n.to_bits()
    }
}

impl TableKey {
    fn from_value(key: &Value) -> Result<TableKey, KeyError> {
        match key {
            Value::Nil | Value::Void => Err(KeyError::Nil),
            Value::Boolean(b) => Ok(TableKey::Boolean(*b)),
            Value::Number(n) if n.is_nan() => Err(KeyError::NaN),
            Value::Number(n) => Ok(TableKey::Number(normalize_number(*n))),
            Value::String(s) => Ok(TableKey::String(s.clone())),
            Value::Range(r) => Ok(TableKey::Range(
                normalize_number(r.from),
                normalize_number(r.to),
                normalize_number(r.step),
            )),
            // The pair keeps the key alive, so the address stays unique
            Value::Table(t) => Ok(TableKey::Object(Rc::as_ptr(t) as *const u8 as usize)),
            Value::Function(c) => Ok(TableKey::Object(Rc::as_ptr(c) as *const u8 as usize)),
            Value::NativeFunction(c) => Ok(TableKey::Object(Rc::as_ptr(c) as *const u8 as usize)),
            Value::UserData(u) => Ok(TableKey::Object(Rc::as_ptr(u) as *const u8 as usize)),
            Value::Thread(c) => Ok(TableKey::Object(c.address())),
            Value::Tuple(_) => TableKey::from_value(&key.to_scalar()),
            other => Err(KeyError::Invalid(other.type_name())),
        }
    }

    fn from_int(k: i64) -> TableKey {
        TableKey::Number(normalize_number(k as f64))
    }
}

/// Lua table
#[derive(Debug)]
pub struct Table {
    array: Vec<Value>,
    map: IndexMap<TableKey, TablePair>,
    origin: usize,
    contains_nil_entries: bool,
    cached_length: Cell<Option<usize>>,
    metatable: Option<TableRef>,
    /// Positional entries written by a table constructor so far
    init_cursor: usize,
}

impl Default for Table {
    fn default() -> Self {
        Table::new()
    }
}

impl Table {
    /// Create an empty table with index origin 1
    pub fn new() -> Self {
        Table::with_origin(1)
    }

    /// Create an empty table whose array part starts at `origin` (0 or 1)
    pub fn with_origin(origin: usize) -> Self {
        Table {
            array: Vec::new(),
            map: IndexMap::new(),
            origin: origin.min(1),
            contains_nil_entries: false,
            cached_length: Cell::new(Some(0)),
            metatable: None,
            init_cursor: 0,
        }
    }

    /// Create a table from a sequence of values starting at the origin
    pub fn from_values(values: impl IntoIterator<Item = Value>) -> Self {
        let mut table = Table::new();
        for v in values {
            table.append(v);
        }
        table
    }

    pub fn origin(&self) -> usize {
        self.origin
    }

    pub fn metatable(&self) -> Option<TableRef> {
        self.metatable.clone()
    }

    pub fn set_metatable(&mut self, metatable: Option<TableRef>) {
        self.metatable = metatable;
    }

    /// Array slot for an integral key, if it is at or past the origin
    fn array_slot(&self, key: &Value) -> Option<usize> {
        match key {
            Value::Number(n) => self.int_slot(*n),
            _ => None,
        }
    }

    fn int_slot(&self, n: f64) -> Option<usize> {
        if n.fract() != 0.0 || n < self.origin as f64 || n >= (usize::MAX / 2) as f64 {
            return None;
        }
        Some(n as usize - self.origin)
    }

    /// Raw get; nil keys and unusable keys read as nil
    pub fn get(&self, key: &Value) -> Value {
        if let Some(slot) = self.array_slot(key) {
            if slot < self.array.len() {
                return self.array[slot].clone();
            }
        }
        match TableKey::from_value(key) {
            Ok(k) => self.map.get(&k).map(|p| p.value.clone()).unwrap_or(Value::Nil),
            Err(_) => Value::Nil,
        }
    }

    pub fn get_int(&self, key: i64) -> Value {
        self.get(&Value::Number(key as f64))
    }

    pub fn get_str(&self, key: &str) -> Value {
        self.map
            .get(&TableKey::String(key.into()))
            .map(|p| p.value.clone())
            .unwrap_or(Value::Nil)
    }

    /// Raw set
    pub fn set(&mut self, key: Value, value: Value) -> ScriptResult<()> {
        let key = match key {
            Value::Tuple(_) => key.to_scalar(),
            other => other,
        };
        let value = value.to_scalar();
        let map_key = TableKey::from_value(&key).map_err(KeyError::into_error)?;

        if let Some(slot) = self.array_slot(&key) {
            if slot < self.array.len() {
                self.set_array_slot(slot, value);
                return Ok(());
            }
            if !value.is_nil() && slot < self.array.len().max(ARRAY_GROWTH_THRESHOLD) * 2 {
                self.grow_array(slot + 1);
                // growth may have pulled the key in from the map
                self.map.shift_remove(&map_key);
                self.set_array_slot(slot, value);
                return Ok(());
            }
        }

        self.set_map(map_key, key, value);
        Ok(())
    }

    pub fn set_str(&mut self, key: &str, value: Value) {
        let key: Rc<str> = key.into();
        self.set_map(TableKey::String(key.clone()), Value::String(key), value.to_scalar());
    }

    pub fn set_int(&mut self, key: i64, value: Value) -> ScriptResult<()> {
        self.set(Value::Number(key as f64), value)
    }

    /// Cleared slots stay in the array so `next` can resume from them
    fn set_array_slot(&mut self, slot: usize, value: Value) {
        self.array[slot] = value;
        self.cached_length.set(None);
    }

    /// Extend the array to `new_len` slots, then keep extending while the
    /// map holds the next contiguous integer key. Matching map entries move
    /// into the array.
    fn grow_array(&mut self, new_len: usize) {
        let mut len = self.array.len();
        self.array.reserve(new_len - len);
        while len < new_len || self.map.contains_key(&TableKey::from_int((len + self.origin) as i64)) {
            let key = TableKey::from_int((len + self.origin) as i64);
            let value = self
                .map
                .shift_remove(&key)
                .map(|pair| pair.value)
                .unwrap_or(Value::Nil);
            self.array.push(value);
            len += 1;
        }
        self.cached_length.set(None);
    }

    fn set_map(&mut self, map_key: TableKey, key: Value, value: Value) {
        let is_int_key = matches!(key, Value::Number(_));
        let value_is_nil = value.is_nil();
        let previous_was_nil = match self.map.get_mut(&map_key) {
            Some(pair) => {
                let was_nil = pair.value.is_nil();
                pair.value = value;
                was_nil
            }
            None => {
                if value_is_nil {
                    return;
                }
                self.map.insert(map_key, TablePair { key, value });
                true
            }
        };

        if self.contains_nil_entries && !value_is_nil && previous_was_nil {
            self.collect_dead_keys();
        } else if value_is_nil {
            self.contains_nil_entries = true;
        }
        if is_int_key {
            self.cached_length.set(None);
        }
    }

    /// Remove tombstone entries from the map part
    pub fn collect_dead_keys(&mut self) {
        self.map.retain(|_, pair| !pair.value.is_nil());
        self.contains_nil_entries = false;
    }

    /// Physically remove a key, returning the previous value
    pub fn remove(&mut self, key: &Value) -> Value {
        if let Some(slot) = self.array_slot(key) {
            if slot < self.array.len() {
                let previous = std::mem::replace(&mut self.array[slot], Value::Nil);
                self.set_array_slot(slot, Value::Nil);
                return previous;
            }
        }
        let previous = match TableKey::from_value(key) {
            Ok(k) => self.map.shift_remove(&k).map(|p| p.value).unwrap_or(Value::Nil),
            Err(_) => Value::Nil,
        };
        self.cached_length.set(None);
        previous
    }

    /// Length of the contiguous non-nil integer run starting at the origin
    pub fn length(&self) -> usize {
        if let Some(n) = self.cached_length.get() {
            return n;
        }
        let mut n = self
            .array
            .iter()
            .position(Value::is_nil)
            .unwrap_or(self.array.len());
        if n == self.array.len() {
            while let Some(pair) = self.map.get(&TableKey::from_int((n + self.origin) as i64)) {
                if pair.value.is_nil() {
                    break;
                }
                n += 1;
            }
        }
        self.cached_length.set(Some(n));
        n
    }

    /// Set `length + origin` to `value`
    pub fn append(&mut self, value: Value) {
        let slot = self.length();
        let index = slot + self.origin;
        let value = value.to_scalar();
        if slot < self.array.len() {
            // fills the first hole of the array part
            self.set_array_slot(slot, value);
        } else if slot == self.array.len() && !value.is_nil() {
            self.grow_array(slot + 1);
            self.set_array_slot(slot, value);
        } else {
            self.set_map(TableKey::from_int(index as i64), Value::Number(index as f64), value);
        }
    }

    /// Store the next positional constructor entry; nil entries still
    /// consume their position
    pub fn init_next_array_key(&mut self, value: Value) -> ScriptResult<()> {
        let key = (self.init_cursor + self.origin) as f64;
        self.init_cursor += 1;
        self.set(Value::Number(key), value)
    }

    /// Number of live (non-nil) entries
    pub fn count(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count()
            + self.map.values().filter(|p| !p.value.is_nil()).count()
    }

    /// The entry following `key`, or the first entry when `key` is nil
    pub fn next(&self, key: &Value) -> ScriptResult<Option<TablePair>> {
        let map_start = if key.is_nil() {
            match self.next_in_array(0) {
                Some(pair) => return Ok(Some(pair)),
                None => 0,
            }
        } else if let Some(slot) = self.array_slot(key).filter(|s| *s < self.array.len()) {
            match self.next_in_array(slot + 1) {
                Some(pair) => return Ok(Some(pair)),
                None => 0,
            }
        } else {
            let index = TableKey::from_value(key)
                .ok()
                .and_then(|k| self.map.get_index_of(&k))
                .ok_or_else(|| ScriptError::runtime("invalid key to 'next'"))?;
            index + 1
        };

        Ok(self
            .map
            .values()
            .skip(map_start)
            .find(|p| !p.value.is_nil())
            .cloned())
    }

    fn next_in_array(&self, from: usize) -> Option<TablePair> {
        self.array
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, v)| !v.is_nil())
            .map(|(i, v)| TablePair {
                key: Value::Number((i + self.origin) as f64),
                value: v.clone(),
            })
    }

    /// Live entries, array part first then map part in insertion order
    pub fn pairs(&self) -> impl Iterator<Item = (Value, Value)> + '_ {
        let origin = self.origin;
        let array = self
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(move |(i, v)| (Value::Number((i + origin) as f64), v.clone()));
        let map = self
            .map
            .values()
            .filter(|p| !p.value.is_nil())
            .map(|p| (p.key.clone(), p.value.clone()));
        array.chain(map)
    }

    pub fn keys(&self) -> impl Iterator<Item = Value> + '_ {
        self.pairs().map(|(k, _)| k)
    }

    pub fn values(&self) -> impl Iterator<Item = Value> + '_ {
        self.pairs().map(|(_, v)| v)
    }

    /// Number of slots in the dense array part
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Number of entries (tombstones included) in the map part
    pub fn map_len(&self) -> usize {
        self.map.len()
    }

    pub fn clear(&mut self) {
        self.array.clear();
        self.map.clear();
        self.contains_nil_entries = false;
        self.cached_length.set(Some(0));
    }
}

/// Walk `keys` through nested subtables and return the final value.
///
/// Every intermediate value must be a table.
pub fn get_path(table: &TableRef, keys: &[Value]) -> ScriptResult<Value> {
    let (first, rest) = match keys.split_first() {
        Some(split) => split,
        None => return Ok(Value::Table(table.clone())),
    };
    let mut current = table.borrow().get(first);
    for (i, key) in rest.iter().enumerate() {
        let next = match &current {
            Value::Table(t) => t.borrow().get(key),
            other => return Err(path_error(other, i + 1)),
        };
        current = next;
    }
    Ok(current)
}

/// Walk all but the last key through nested subtables, then set the last
pub fn set_path(table: &TableRef, keys: &[Value], value: Value) -> ScriptResult<()> {
    let (last, prefix) = match keys.split_last() {
        Some(split) => split,
        None => return Err(ScriptError::runtime("empty index path")),
    };
    let mut current = table.clone();
    for (i, key) in prefix.iter().enumerate() {
        let next = current.borrow().get(key);
        current = match next {
            Value::Table(t) => t,
            other => return Err(path_error(&other, i + 1)),
        };
    }
    let result = current.borrow_mut().set(last.clone(), value);
    result
}

fn path_error(value: &Value, position: usize) -> ScriptError {
    RuntimeError::new(
        RuntimeErrorKind::Index,
        format!(
            "attempt to index a {} value (index path element #{})",
            value.type_name(),
            position
        ),
    )
    .into()
}
