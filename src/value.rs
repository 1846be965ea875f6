use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::vm::io::FileHandle;
use crate::vm::thread::ThreadHandle;

/// Runtime value living on the operand stack and in scopes.
///
/// Compound values (`Array`, `Map`) are owned by whichever scope slot holds
/// them; loading one copies it onto the stack. The only in-place mutation is
/// through `STORE_INTO_ARRAY` / `STORE_INTO_MAP`, which target a named slot.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Integer(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Array(Vec<Value>),
    Map(HashMap<String, Value>),
    FileHandle(FileHandle),
    ThreadHandle(ThreadHandle),
    Unit,
}

impl Value {
    /// Short name of the variant, used in type-mismatch faults.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bool(_) => "bool",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::FileHandle(_) => "file handle",
            Value::ThreadHandle(_) => "thread handle",
            Value::Unit => "unit",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Float(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Integer(n) => write!(f, "{}", n),
            Value::Float(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Map(entries) => {
                // Sorted so the same map always prints the same way.
                let mut keys: Vec<&String> = entries.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 { write!(f, ", ")?; }
                    write!(f, "{}: {}", key, entries[key])?;
                }
                write!(f, "}}")
            }
            Value::FileHandle(h) => write!(f, "<file {} ({})>", h.path(), h.mode()),
            Value::ThreadHandle(h) => write!(f, "<thread {}>", h.name()),
            Value::Unit => write!(f, "()"),
        }
    }
}

/// How a file handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileMode {
    Read,
    /// Truncates an existing file.
    Write,
    Append,
    ReadWrite,
}

impl FileMode {
    pub fn can_read(self) -> bool {
        matches!(self, FileMode::Read | FileMode::ReadWrite)
    }

    pub fn can_write(self) -> bool {
        !matches!(self, FileMode::Read)
    }
}

impl std::fmt::Display for FileMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileMode::Read => "read",
            FileMode::Write => "write",
            FileMode::Append => "append",
            FileMode::ReadWrite => "read-write",
        };
        write!(f, "{}", s)
    }
}
