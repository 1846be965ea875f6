use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, trace};

use crate::value::{FileMode, Value};

pub mod compile;
pub mod frame;
pub mod io;
pub mod op;
mod operators;
pub mod thread;

pub use compile::{CompileError, compile};
pub use frame::Globals;
pub use op::{CompiledProgram, FunctionEntry, Op, ThreadSpawn, VariantEntry};

use frame::{Frame, Scope};
use io::{FileHandle, RegexCache};
use thread::{ThreadHandle, Threads};

#[derive(Debug, thiserror::Error)]
pub enum VmFault {
    #[error("stack underflow in {op}")]
    StackUnderflow { op: &'static str },
    #[error("{op} expects {expected}, found {found}")]
    TypeMismatch { op: &'static str, expected: &'static str, found: String },
    #[error("unknown identifier '{name}'")]
    UnknownIdentifier { name: String },
    #[error("unknown function '{name}'")]
    UnknownFunction { name: String },
    #[error("'{name}' expects {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: usize, got: usize },
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow in {op}")]
    IntegerOverflow { op: &'static str },
    #[error("index {index} out of bounds for '{name}' (length {len})")]
    IndexOutOfBounds { name: String, index: i64, len: usize },
    #[error("no key '{key}' in '{name}'")]
    KeyNotFound { name: String, key: String },
    #[error("vararg index {index} out of range ({count} supplied)")]
    VarargOutOfRange { index: i64, count: usize },
    #[error("file '{path}': {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{op} on '{path}' opened for {mode}")]
    FileModeMismatch { op: &'static str, path: String, mode: FileMode },
    #[error("file '{path}' closed twice")]
    DoubleClose { path: String },
    #[error("file '{path}' used after close")]
    UseAfterClose { path: String },
    #[error("could not execute '{command}': {source}")]
    ProcessExec {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bad regex '{pattern}': {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("thread '{name}': {reason}")]
    ThreadJoin { name: String, reason: String },
    #[error("call depth exceeded ({limit} frames)")]
    CallDepthExceeded { limit: usize },
    #[error("no instruction at address {ip}")]
    InvalidAddress { ip: usize },
}

pub type VmResult<T> = Result<T, VmFault>;

#[derive(Debug, Clone, Copy)]
pub struct VmOptions {
    /// Frame-stack limit per execution context.
    pub max_frames: usize,
}

impl Default for VmOptions {
    fn default() -> Self {
        VmOptions { max_frames: 10_000 }
    }
}

/// A compiled program ready to run, together with its global scope.
pub struct Vm {
    program: Arc<CompiledProgram>,
    globals: Globals,
    threads: Threads,
    options: VmOptions,
}

impl Vm {
    pub fn new(program: CompiledProgram) -> Self {
        Self::with_options(program, VmOptions::default())
    }

    pub fn with_options(program: CompiledProgram, options: VmOptions) -> Self {
        Vm { program: Arc::new(program), globals: Globals::new(), threads: Threads::default(), options }
    }

    pub fn program(&self) -> &CompiledProgram {
        &self.program
    }

    /// The shared top-level scope. Still holds the program's variables after `run`.
    pub fn globals(&self) -> &Globals {
        &self.globals
    }

    /// Execute from address 0 until the bottom frame returns, then wait for
    /// every thread that was started. Deferred threads never run stay unstarted.
    pub fn run(&self) -> VmResult<Value> {
        let mut main =
            Context::main(Arc::clone(&self.program), self.globals.clone(), self.threads.clone(), self.options);
        let result = main.run();
        self.threads.wait_idle();
        result
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        self.threads.discard_pending();
    }
}

// ── Execution context ───────────────────────────────────────────────
//
// One context per thread of execution: its own operand stack, frames and
// instruction pointer. Contexts share only the program and the globals.

pub(crate) struct Context {
    program: Arc<CompiledProgram>,
    globals: Globals,
    threads: Threads,
    options: VmOptions,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    ip: usize,
    regexes: RegexCache,
    label: String,
}

impl Context {
    fn main(program: Arc<CompiledProgram>, globals: Globals, threads: Threads, options: VmOptions) -> Self {
        Context {
            program,
            globals,
            threads,
            options,
            stack: Vec::with_capacity(256),
            frames: vec![Frame::top_level()],
            ip: 0,
            regexes: RegexCache::default(),
            label: "main".to_string(),
        }
    }

    /// A context whose bottom frame is a call to `func`; it ends when `func` returns.
    fn spawned(&self, label: &str, func: &FunctionEntry, locals: HashMap<String, Value>, varargs: Vec<Value>) -> Self {
        Context {
            program: Arc::clone(&self.program),
            globals: self.globals.clone(),
            threads: self.threads.clone(),
            options: self.options,
            stack: Vec::new(),
            frames: vec![Frame {
                return_address: None,
                scope: Scope::Local(locals),
                stack_base: 0,
                varargs,
                function: func.name.clone(),
            }],
            ip: func.entry,
            regexes: RegexCache::default(),
            label: label.to_string(),
        }
    }

    /// A fault discards every frame of this context.
    #[instrument(level = "debug", name = "context", skip_all, fields(label = %self.label))]
    pub(crate) fn run(&mut self) -> VmResult<Value> {
        debug!(ip = self.ip, "execution started");
        let result = self.execute();
        match &result {
            Ok(value) => debug!(result = %value, "execution finished"),
            Err(fault) => {
                debug!(%fault, ip = self.ip, "execution faulted");
                self.frames.clear();
                self.stack.clear();
            }
        }
        result
    }

    fn execute(&mut self) -> VmResult<Value> {
        let program = Arc::clone(&self.program);
        loop {
            let op = program.code.get(self.ip).ok_or(VmFault::InvalidAddress { ip: self.ip })?;
            self.ip += 1;
            if let Some(result) = self.step(&program, op)? {
                return Ok(result);
            }
        }
    }

    // ── Stack helpers ───────────────────────────────────────────────

    fn frame(&self) -> &Frame {
        self.frames.last().expect("a running context always has a frame")
    }

    fn frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("a running context always has a frame")
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    /// Pop within the current frame; the caller's operands are out of reach.
    fn pop(&mut self, op: &'static str) -> VmResult<Value> {
        if self.stack.len() <= self.frame().stack_base {
            return Err(VmFault::StackUnderflow { op });
        }
        self.stack.pop().ok_or(VmFault::StackUnderflow { op })
    }

    /// Pop `n` values, returned in push order.
    fn pop_n(&mut self, n: usize, op: &'static str) -> VmResult<Vec<Value>> {
        if self.stack.len() < self.frame().stack_base + n {
            return Err(VmFault::StackUnderflow { op });
        }
        let at = self.stack.len() - n;
        Ok(self.stack.split_off(at))
    }

    fn pop_int(&mut self, op: &'static str) -> VmResult<i64> {
        match self.pop(op)? {
            Value::Integer(n) => Ok(n),
            other => Err(mismatch(op, "integer", &other)),
        }
    }

    fn pop_bool(&mut self, op: &'static str) -> VmResult<bool> {
        match self.pop(op)? {
            Value::Bool(b) => Ok(b),
            other => Err(mismatch(op, "bool", &other)),
        }
    }

    fn pop_string(&mut self, op: &'static str) -> VmResult<String> {
        match self.pop(op)? {
            Value::String(s) => Ok(s),
            other => Err(mismatch(op, "string", &other)),
        }
    }

    fn pop_file(&mut self, op: &'static str) -> VmResult<FileHandle> {
        match self.pop(op)? {
            Value::FileHandle(h) => Ok(h),
            other => Err(mismatch(op, "file handle", &other)),
        }
    }

    // ── Variables ───────────────────────────────────────────────────

    fn lookup(&self, name: &str) -> Option<Value> {
        match self.frame().local(name) {
            Some(v) => Some(v.clone()),
            None => self.globals.get(name),
        }
    }

    fn read_variable<R>(&self, name: &str, f: impl FnOnce(&Value) -> VmResult<R>) -> VmResult<R> {
        if let Some(v) = self.frame().local(name) {
            return f(v);
        }
        self.globals
            .with(name, f)
            .unwrap_or_else(|| Err(VmFault::UnknownIdentifier { name: name.to_string() }))
    }

    fn write_variable<R>(&mut self, name: &str, f: impl FnOnce(&mut Value) -> VmResult<R>) -> VmResult<R> {
        if let Some(v) = self.frame_mut().local_mut(name) {
            return f(v);
        }
        self.globals
            .with_mut(name, f)
            .unwrap_or_else(|| Err(VmFault::UnknownIdentifier { name: name.to_string() }))
    }

    fn store(&mut self, name: &str, value: Value) {
        match &mut self.frame_mut().scope {
            Scope::Local(vars) => {
                vars.insert(name.to_string(), value);
            }
            Scope::Global => self.globals.set(name, value),
        }
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Execute one instruction. `Some` once the bottom frame has returned.
    fn step(&mut self, program: &CompiledProgram, op: &Op) -> VmResult<Option<Value>> {
        match op {
            Op::PushInt(n) => self.push(Value::Integer(*n)),
            Op::PushFloat(n) => self.push(Value::Float(*n)),
            Op::PushString(s) => self.push(Value::String(s.clone())),
            Op::PushBool(b) => self.push(Value::Bool(*b)),
            Op::PushArray(items) => self.push(Value::Array(items.clone())),
            Op::PushMap(entries) => self.push(Value::Map(entries.clone())),
            Op::PushUnit => self.push(Value::Unit),

            Op::MakeArray(n) => {
                let items = self.pop_n(*n, "MAKE_ARRAY")?;
                self.push(Value::Array(items));
            }
            Op::MakeMap(n) => {
                let flat = self.pop_n(n * 2, "MAKE_MAP")?;
                let mut map = HashMap::with_capacity(*n);
                let mut pairs = flat.into_iter();
                while let (Some(key), Some(value)) = (pairs.next(), pairs.next()) {
                    match key {
                        Value::String(k) => {
                            map.insert(k, value);
                        }
                        other => return Err(mismatch("MAKE_MAP", "string key", &other)),
                    }
                }
                self.push(Value::Map(map));
            }
            Op::Concat(n) => {
                let parts = self.pop_n(*n, "CONCAT")?;
                let joined: String = parts.iter().map(|v| v.to_string()).collect();
                self.push(Value::String(joined));
            }

            Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Modulo => {
                let rhs = self.pop(op.name())?;
                let lhs = self.pop(op.name())?;
                self.push(operators::arithmetic(op, lhs, rhs)?);
            }
            Op::Negate => {
                let value = self.pop("NEGATE")?;
                self.push(operators::negate(value)?);
            }
            Op::BitwiseAnd | Op::BitwiseOr | Op::BitwiseXor | Op::ShiftLeft | Op::ShiftRight => {
                let rhs = self.pop(op.name())?;
                let lhs = self.pop(op.name())?;
                self.push(operators::bitwise(op, lhs, rhs)?);
            }
            Op::LogicalAnd | Op::LogicalOr => {
                let rhs = self.pop(op.name())?;
                let lhs = self.pop(op.name())?;
                self.push(operators::logical(op, lhs, rhs)?);
            }
            Op::LogicalNot => {
                let b = self.pop_bool("LOGICAL_NOT")?;
                self.push(Value::Bool(!b));
            }
            Op::Equal
            | Op::NotEqual
            | Op::LessThan
            | Op::LessThanOrEqual
            | Op::GreaterThan
            | Op::GreaterThanOrEqual => {
                let rhs = self.pop(op.name())?;
                let lhs = self.pop(op.name())?;
                self.push(operators::compare(op, lhs, rhs)?);
            }

            Op::Jump(target) => self.ip = *target,
            Op::JumpIfTrue(target) => {
                if self.pop_bool("JUMP_IF_TRUE")? {
                    self.ip = *target;
                }
            }
            Op::JumpIfFalse(target) => {
                if !self.pop_bool("JUMP_IF_FALSE")? {
                    self.ip = *target;
                }
            }

            Op::LoadVariable(name) => {
                let value = self.lookup(name).ok_or_else(|| VmFault::UnknownIdentifier { name: name.clone() })?;
                self.push(value);
            }
            Op::StoreVariable(name) => {
                let value = self.pop("STORE_VARIABLE")?;
                self.store(name, value);
            }
            Op::LoadFromArray(name) => {
                let index = self.pop_int("LOAD_FROM_ARRAY")?;
                let element = self.read_variable(name, |v| match v {
                    Value::Array(items) => Ok(items[element_index(name, index, items.len())?].clone()),
                    other => Err(mismatch("LOAD_FROM_ARRAY", "array", other)),
                })?;
                self.push(element);
            }
            Op::StoreIntoArray(name) => {
                let value = self.pop("STORE_INTO_ARRAY")?;
                let index = self.pop_int("STORE_INTO_ARRAY")?;
                self.write_variable(name, |v| match v {
                    Value::Array(items) => {
                        let i = element_index(name, index, items.len())?;
                        items[i] = value;
                        Ok(())
                    }
                    other => Err(mismatch("STORE_INTO_ARRAY", "array", other)),
                })?;
            }
            Op::LoadFromMap(name) => {
                let key = self.pop_string("LOAD_FROM_MAP")?;
                let value = self.read_variable(name, |v| match v {
                    Value::Map(entries) => entries
                        .get(&key)
                        .cloned()
                        .ok_or_else(|| VmFault::KeyNotFound { name: name.clone(), key: key.clone() }),
                    other => Err(mismatch("LOAD_FROM_MAP", "map", other)),
                })?;
                self.push(value);
            }
            Op::StoreIntoMap(name) => {
                let value = self.pop("STORE_INTO_MAP")?;
                let key = self.pop_string("STORE_INTO_MAP")?;
                self.write_variable(name, |v| match v {
                    Value::Map(entries) => {
                        entries.insert(key, value);
                        Ok(())
                    }
                    other => Err(mismatch("STORE_INTO_MAP", "map", other)),
                })?;
            }

            Op::Length => {
                let len = match self.pop("LENGTH")? {
                    Value::Array(items) => items.len(),
                    Value::Map(entries) => entries.len(),
                    Value::String(s) => s.chars().count(),
                    other => return Err(mismatch("LENGTH", "array, map or string", &other)),
                };
                self.push(Value::Integer(len as i64));
            }
            Op::MakeIterable => {
                let items = match self.pop("MAKE_ITERABLE")? {
                    Value::Array(items) => items,
                    Value::Map(entries) => {
                        let mut keys: Vec<String> = entries.into_keys().collect();
                        keys.sort();
                        keys.into_iter().map(Value::String).collect()
                    }
                    Value::String(s) => s.chars().map(|c| Value::String(c.to_string())).collect(),
                    other => return Err(mismatch("MAKE_ITERABLE", "array, map or string", &other)),
                };
                self.push(Value::Array(items));
            }

            Op::CallFunction { name, argc, spawn } => {
                let args = self.pop_n(*argc, "CALL_FUNCTION")?;
                let func = self.resolve_function(program, name)?;
                let (locals, varargs) = bind_arguments(func, args)?;
                match spawn {
                    None => self.enter(func, locals, varargs)?,
                    Some(spawn) => {
                        let handle = self.spawn(spawn, func, locals, varargs)?;
                        self.push(handle);
                    }
                }
            }
            Op::Return => {
                let result = self.pop("RETURN")?;
                let frame = self.frames.pop().ok_or(VmFault::StackUnderflow { op: "RETURN" })?;
                self.stack.truncate(frame.stack_base);
                trace!(function = %frame.function, result = %result, "return");
                match frame.return_address {
                    Some(address) => {
                        self.ip = address;
                        self.push(result);
                    }
                    None => return Ok(Some(result)),
                }
            }
            Op::LoadVararg => {
                let index = self.pop_int("LOAD_VARARG")?;
                let varargs = &self.frame().varargs;
                let value = usize::try_from(index)
                    .ok()
                    .and_then(|i| varargs.get(i))
                    .cloned()
                    .ok_or(VmFault::VarargOutOfRange { index, count: varargs.len() })?;
                self.push(value);
            }
            Op::VarargCount => {
                let count = self.frame().varargs.len();
                self.push(Value::Integer(count as i64));
            }

            Op::RegexMatch => {
                let pattern = self.pop_string("REGEX_MATCH")?;
                let subject = self.pop_string("REGEX_MATCH")?;
                let matched = self.regexes.is_match(&subject, &pattern)?;
                self.push(Value::Bool(matched));
            }
            Op::ExecCommand => {
                let command = self.pop_string("EXEC_COMMAND")?;
                let code = io::exec_command(&command)?;
                self.push(Value::Integer(code));
            }

            Op::OpenFileRead | Op::OpenFileWrite | Op::OpenFileAppend | Op::OpenFileReadWrite => {
                let mode = match op {
                    Op::OpenFileRead => FileMode::Read,
                    Op::OpenFileWrite => FileMode::Write,
                    Op::OpenFileAppend => FileMode::Append,
                    _ => FileMode::ReadWrite,
                };
                let path = self.pop_string(op.name())?;
                self.push(Value::FileHandle(FileHandle::open(&path, mode)?));
            }
            Op::CloseFile => self.pop_file("CLOSE_FILE")?.close()?,
            Op::ReadFile => {
                let content = self.pop_file("READ_FILE")?.read_all()?;
                self.push(Value::String(content));
            }
            Op::ReadLine => {
                let line = self.pop_file("READ_LINE")?.read_line()?;
                self.push(Value::String(line));
            }
            Op::WriteFile => {
                let content = self.pop_string("WRITE_FILE")?;
                self.pop_file("WRITE_FILE")?.write(&content)?;
            }
            Op::AppendFile => {
                let content = self.pop_string("APPEND_FILE")?;
                self.pop_file("APPEND_FILE")?.append(&content)?;
            }

            Op::RunThread(name) => {
                let handle = match self.globals.get(name) {
                    Some(Value::ThreadHandle(h)) => h,
                    Some(other) => return Err(mismatch("RUN_THREAD", "thread handle", &other)),
                    None => return Err(VmFault::UnknownIdentifier { name: name.clone() }),
                };
                handle.join(&self.threads)?;
            }

            Op::Swap => {
                let top = self.pop("SWAP")?;
                let below = self.pop("SWAP")?;
                self.push(top);
                self.push(below);
            }
            Op::Duplicate => {
                let top = self.pop("DUPLICATE")?;
                self.push(top.clone());
                self.push(top);
            }
            Op::Pop => {
                self.pop("POP")?;
            }
        }
        Ok(None)
    }

    // ── Calls ───────────────────────────────────────────────────────

    /// By name in the function table, else through a variable holding a function name.
    fn resolve_function<'p>(&self, program: &'p CompiledProgram, name: &str) -> VmResult<&'p FunctionEntry> {
        if let Some(func) = program.function(name) {
            return Ok(func);
        }
        match self.lookup(name) {
            Some(Value::String(target)) => program
                .function(&target)
                .ok_or(VmFault::UnknownFunction { name: target }),
            _ => Err(VmFault::UnknownFunction { name: name.to_string() }),
        }
    }

    fn enter(&mut self, func: &FunctionEntry, locals: HashMap<String, Value>, varargs: Vec<Value>) -> VmResult<()> {
        if self.frames.len() >= self.options.max_frames {
            return Err(VmFault::CallDepthExceeded { limit: self.options.max_frames });
        }
        trace!(function = %func.name, depth = self.frames.len(), "call");
        self.frames.push(Frame {
            return_address: Some(self.ip),
            scope: Scope::Local(locals),
            stack_base: self.stack.len(),
            varargs,
            function: func.name.clone(),
        });
        self.ip = func.entry;
        Ok(())
    }

    /// The call runs in a new context. The handle is published in the globals
    /// before an immediate thread starts, so the thread can see it.
    fn spawn(
        &self,
        spawn: &ThreadSpawn,
        func: &FunctionEntry,
        locals: HashMap<String, Value>,
        varargs: Vec<Value>,
    ) -> VmResult<Value> {
        let context = self.spawned(&spawn.handle, func, locals, varargs);
        let handle = ThreadHandle::deferred(&spawn.handle, context, &self.threads);
        debug!(thread = %spawn.handle, function = %func.name, deferred = spawn.deferred, "thread created");
        self.globals.set(spawn.handle.clone(), Value::ThreadHandle(handle.clone()));
        if !spawn.deferred {
            handle.start(&self.threads)?;
        }
        Ok(Value::ThreadHandle(handle))
    }
}

/// Parameters by position; a variadic function's extra arguments go to its
/// vararg buffer and are also bound, as an array, to its last parameter.
fn bind_arguments(func: &FunctionEntry, mut args: Vec<Value>) -> VmResult<(HashMap<String, Value>, Vec<Value>)> {
    let fixed = func.fixed_arity();
    if args.len() < fixed || (!func.variadic && args.len() > fixed) {
        return Err(VmFault::ArityMismatch { name: func.name.clone(), expected: fixed, got: args.len() });
    }
    let varargs = if func.variadic { args.split_off(fixed) } else { Vec::new() };
    let mut locals: HashMap<String, Value> = func.params.iter().cloned().zip(args).collect();
    if let (true, Some(rest)) = (func.variadic, func.params.last()) {
        locals.insert(rest.clone(), Value::Array(varargs.clone()));
    }
    Ok((locals, varargs))
}

fn element_index(name: &str, index: i64, len: usize) -> VmResult<usize> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < len)
        .ok_or_else(|| VmFault::IndexOutOfBounds { name: name.to_string(), index, len })
}

fn mismatch(op: &'static str, expected: &'static str, found: &Value) -> VmFault {
    VmFault::TypeMismatch { op, expected, found: found.type_name().to_string() }
}
