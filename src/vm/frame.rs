use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

/// The program's top-level scope, shared by every execution context.
///
/// All access goes through one lock; contexts never hold it across an
/// instruction boundary.
#[derive(Debug, Clone, Default)]
pub struct Globals(Arc<Mutex<HashMap<String, Value>>>);

impl Globals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.lock().get(name).cloned()
    }

    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.0.lock().insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.lock().contains_key(name)
    }

    pub fn with<R>(&self, name: &str, f: impl FnOnce(&Value) -> R) -> Option<R> {
        self.0.lock().get(name).map(f)
    }

    /// Run `f` on the slot in place, if it exists.
    pub fn with_mut<R>(&self, name: &str, f: impl FnOnce(&mut Value) -> R) -> Option<R> {
        self.0.lock().get_mut(name).map(f)
    }
}

/// Where a frame's assignments land.
#[derive(Debug)]
pub(crate) enum Scope {
    /// The bottom frame of the main context writes straight to the globals.
    Global,
    Local(HashMap<String, Value>),
}

/// One active function invocation.
#[derive(Debug)]
pub(crate) struct Frame {
    /// `None` for the bottom frame of a context: returning from it ends the context.
    pub return_address: Option<usize>,
    pub scope: Scope,
    /// Operand-stack depth when the frame was entered.
    pub stack_base: usize,
    pub varargs: Vec<Value>,
    pub function: String,
}

impl Frame {
    pub fn top_level() -> Self {
        Frame {
            return_address: None,
            scope: Scope::Global,
            stack_base: 0,
            varargs: Vec::new(),
            function: "<main>".to_string(),
        }
    }

    pub fn local(&self, name: &str) -> Option<&Value> {
        match &self.scope {
            Scope::Local(vars) => vars.get(name),
            Scope::Global => None,
        }
    }

    pub fn local_mut(&mut self, name: &str) -> Option<&mut Value> {
        match &mut self.scope {
            Scope::Local(vars) => vars.get_mut(name),
            Scope::Global => None,
        }
    }
}
