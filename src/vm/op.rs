use std::collections::HashMap;

use crate::value::{FileMode, Value};

// ── Instruction set ─────────────────────────────────────────────────
//
// Instructions live in one flat, append-only `Vec<Op>`. Addresses are plain
// indices into it; jump targets are absolute and carried by the jump itself,
// never read back off the operand stack.

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    // push immediate (0 → 1)
    PushInt(i64),
    PushFloat(f64),
    PushString(String),
    PushBool(bool),
    PushArray(Vec<Value>),
    PushMap(HashMap<String, Value>),
    PushUnit,

    // builders (n → 1)
    MakeArray(usize),
    /// Pops `n` key/value pairs, key below value.
    MakeMap(usize),
    /// Joins the display form of the top `n` values.
    Concat(usize),

    // arithmetic (2 → 1)
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Negate,

    // bitwise/shift (2 → 1, integers only)
    BitwiseAnd,
    BitwiseOr,
    BitwiseXor,
    ShiftLeft,
    ShiftRight,

    // logical (bools only)
    LogicalAnd,
    LogicalOr,
    LogicalNot,

    // comparison (2 → 1 bool)
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // control flow
    Jump(usize),
    JumpIfTrue(usize),
    JumpIfFalse(usize),

    // variables; the operand names the slot
    LoadVariable(String),
    StoreVariable(String),
    /// ( index -- element )
    LoadFromArray(String),
    /// ( index value -- )
    StoreIntoArray(String),
    /// ( key -- value )
    LoadFromMap(String),
    /// ( key value -- )
    StoreIntoMap(String),

    // iteration support
    Length,
    MakeIterable,

    // calls
    CallFunction { name: String, argc: usize, spawn: Option<ThreadSpawn> },
    Return,
    /// ( index -- value )
    LoadVararg,
    VarargCount,

    // text/process
    /// ( subject pattern -- bool )
    RegexMatch,
    /// ( command -- exit_code )
    ExecCommand,

    // file I/O
    OpenFileRead,
    OpenFileWrite,
    OpenFileAppend,
    OpenFileReadWrite,
    CloseFile,
    ReadFile,
    ReadLine,
    /// ( handle content -- )
    WriteFile,
    /// ( handle content -- )
    AppendFile,

    // threading
    RunThread(String),

    // stack shuffle
    Swap,
    Duplicate,
    Pop,
}

/// Thread qualifier carried by a `CALL_FUNCTION`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSpawn {
    pub handle: String,
    pub deferred: bool,
}

impl Op {
    /// Catalogue name, as printed in listings and faults.
    pub fn name(&self) -> &'static str {
        match self {
            Op::PushInt(_) => "PUSH_INT",
            Op::PushFloat(_) => "PUSH_FLOAT",
            Op::PushString(_) => "PUSH_STRING",
            Op::PushBool(_) => "PUSH_BOOL",
            Op::PushArray(_) => "PUSH_ARRAY",
            Op::PushMap(_) => "PUSH_MAP",
            Op::PushUnit => "PUSH_UNIT",
            Op::MakeArray(_) => "MAKE_ARRAY",
            Op::MakeMap(_) => "MAKE_MAP",
            Op::Concat(_) => "CONCAT",
            Op::Add => "ADD",
            Op::Subtract => "SUBTRACT",
            Op::Multiply => "MULTIPLY",
            Op::Divide => "DIVIDE",
            Op::Modulo => "MODULO",
            Op::Negate => "NEGATE",
            Op::BitwiseAnd => "BITWISE_AND",
            Op::BitwiseOr => "BITWISE_OR",
            Op::BitwiseXor => "BITWISE_XOR",
            Op::ShiftLeft => "SHIFT_LEFT",
            Op::ShiftRight => "SHIFT_RIGHT",
            Op::LogicalAnd => "LOGICAL_AND",
            Op::LogicalOr => "LOGICAL_OR",
            Op::LogicalNot => "LOGICAL_NOT",
            Op::Equal => "EQUAL",
            Op::NotEqual => "NOT_EQUAL",
            Op::LessThan => "LESS_THAN",
            Op::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            Op::GreaterThan => "GREATER_THAN",
            Op::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            Op::Jump(_) => "JUMP",
            Op::JumpIfTrue(_) => "JUMP_IF_TRUE",
            Op::JumpIfFalse(_) => "JUMP_IF_FALSE",
            Op::LoadVariable(_) => "LOAD_VARIABLE",
            Op::StoreVariable(_) => "STORE_VARIABLE",
            Op::LoadFromArray(_) => "LOAD_FROM_ARRAY",
            Op::StoreIntoArray(_) => "STORE_INTO_ARRAY",
            Op::LoadFromMap(_) => "LOAD_FROM_MAP",
            Op::StoreIntoMap(_) => "STORE_INTO_MAP",
            Op::Length => "LENGTH",
            Op::MakeIterable => "MAKE_ITERABLE",
            Op::CallFunction { .. } => "CALL_FUNCTION",
            Op::Return => "RETURN",
            Op::LoadVararg => "LOAD_VARARG",
            Op::VarargCount => "VARARG_COUNT",
            Op::RegexMatch => "REGEX_MATCH",
            Op::ExecCommand => "EXEC_COMMAND",
            Op::OpenFileRead => "OPEN_FILE_READ",
            Op::OpenFileWrite => "OPEN_FILE_WRITE",
            Op::OpenFileAppend => "OPEN_FILE_APPEND",
            Op::OpenFileReadWrite => "OPEN_FILE_READWRITE",
            Op::CloseFile => "CLOSE_FILE",
            Op::ReadFile => "READ_FILE",
            Op::ReadLine => "READ_LINE",
            Op::WriteFile => "WRITE_FILE",
            Op::AppendFile => "APPEND_FILE",
            Op::RunThread(_) => "RUN_THREAD",
            Op::Swap => "SWAP",
            Op::Duplicate => "DUPLICATE",
            Op::Pop => "POP",
        }
    }

    pub fn open_file(mode: FileMode) -> Op {
        match mode {
            FileMode::Read => Op::OpenFileRead,
            FileMode::Write => Op::OpenFileWrite,
            FileMode::Append => Op::OpenFileAppend,
            FileMode::ReadWrite => Op::OpenFileReadWrite,
        }
    }

    /// Jump target, if this is a jump.
    pub fn target(&self) -> Option<usize> {
        match self {
            Op::Jump(t) | Op::JumpIfTrue(t) | Op::JumpIfFalse(t) => Some(*t),
            _ => None,
        }
    }
}

// ── Function and variant tables ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionEntry {
    pub name: String,
    pub entry: usize,
    pub params: Vec<String>,
    /// The last parameter collects the extra arguments.
    pub variadic: bool,
}

impl FunctionEntry {
    /// Number of arguments that must be supplied.
    pub fn fixed_arity(&self) -> usize {
        if self.variadic { self.params.len() - 1 } else { self.params.len() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantEntry {
    pub type_name: String,
    pub variants: Vec<(String, Option<String>)>,
}

// ── Compiled program ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CompiledProgram {
    pub code: Vec<Op>,
    pub functions: Vec<FunctionEntry>,
    pub variants: Vec<VariantEntry>,
    function_index: HashMap<String, usize>,
}

impl CompiledProgram {
    pub fn new(code: Vec<Op>, functions: Vec<FunctionEntry>, variants: Vec<VariantEntry>) -> Self {
        let function_index = functions.iter().enumerate().map(|(i, f)| (f.name.clone(), i)).collect();
        CompiledProgram { code, functions, variants, function_index }
    }

    pub fn function(&self, name: &str) -> Option<&FunctionEntry> {
        self.function_index.get(name).map(|&i| &self.functions[i])
    }

    pub fn variant(&self, type_name: &str) -> Option<&VariantEntry> {
        self.variants.iter().find(|v| v.type_name == type_name)
    }
}
