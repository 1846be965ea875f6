use serde::{Deserialize, Serialize};

pub use crate::value::FileMode;

// ---- Syntax tree handed over by the parser ----
//
// Every node owns its children; the tree is never mutated after parsing.
// The whole tree derives serde so an external parser can hand it over as JSON.

/// A whole program: the top-level statement list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Program { statements }
    }
}

/// Statements
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    /// `name = expr`, `name[i] = expr`, `name{k} = expr`
    Assign { target: Identifier, value: Expr },

    If {
        condition: Expr,
        then_block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
    },

    /// `unless cond { ... } else { ... }`
    Unless {
        condition: Expr,
        block: Vec<Stmt>,
        else_block: Option<Vec<Stmt>>,
    },

    While { condition: Expr, body: Vec<Stmt> },

    /// `for binding in iterable { body }`
    For {
        binding: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },

    /// `do { body } in iterable as binding`
    DoIn {
        binding: String,
        iterable: Expr,
        body: Vec<Stmt>,
    },

    Match { subject: Expr, cases: Vec<MatchCase> },

    FunctionDef(FunctionDef),

    /// `return` or `return expr`
    Return(Option<Expr>),

    /// `break` / `continue`
    Jump(JumpKind),

    Block(Vec<Stmt>),

    /// `open path for <mode> as handle`
    FileOpen {
        path: Expr,
        mode: FileMode,
        handle: String,
    },

    FileClose { handle: Expr },

    FileWrite { handle: Expr, content: Expr },

    FileAppend { handle: Expr, content: Expr },

    /// Start (if deferred) and join the thread stored under `name`.
    RunThread { name: String },

    VariantDecl(VariantDecl),

    /// Expression evaluated for its side effects; the value is discarded.
    Expr(Expr),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JumpKind {
    Break,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCase {
    pub pattern: Pattern,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    /// Compared with `EQUAL`.
    Value(Expr),
    /// Subject matched against the pattern with `REGEX_MATCH`.
    Regex(String),
    /// `_`, matches anything
    Wildcard,
}

/// `fn name(a, b, rest...) { body }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<String>,
    /// The last parameter collects every argument beyond the fixed ones.
    pub variadic: bool,
    pub body: Vec<Stmt>,
}

/// `variant Shape { Circle of float, Square of float, Empty }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantDecl {
    pub name: String,
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub of_type: Option<String>,
}

/// A variable reference, optionally subscripted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub name: String,
    pub index: Option<Index>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Index {
    /// `name[expr]`: integer position into an array
    Array(Box<Expr>),
    /// `name{expr}`: string key into a map
    Key(Box<Expr>),
}

/// Expressions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(ConstValue),

    Identifier(Identifier),

    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },

    Unary { op: UnaryOp, operand: Box<Expr> },

    /// `target op= value`; evaluates to the stored value.
    CompoundAssign {
        target: Identifier,
        op: BinaryOp,
        value: Box<Expr>,
    },

    Call(FunctionCall),

    /// `subject =~ pattern` / `subject !~ pattern`
    RegexMatch {
        subject: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },

    Ternary {
        condition: Box<Expr>,
        then_value: Box<Expr>,
        else_value: Box<Expr>,
    },

    Lambda {
        params: Vec<String>,
        variadic: bool,
        body: Vec<Stmt>,
    },

    /// The n-th extra argument of the enclosing variadic function.
    VarArg(Box<Expr>),

    /// How many extra arguments the enclosing variadic function received.
    VarArgCount,

    /// Run a shell command line, evaluating to its exit code.
    Exec(Box<Expr>),

    FileRead { handle: Box<Expr>, mode: ReadMode },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadMode {
    /// Everything from the current position to end of file.
    All,
    /// One line without its terminator; `""` at end of file.
    Line,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Integer(i64),
    Float(f64),
    String(String),
    Bool(bool),
    Regex(String),
    Array(Vec<Expr>),
    Map(Vec<(Expr, Expr)>),
    FString(Vec<FStringPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FStringPart {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
    /// Present when the call is qualified to run as a thread.
    pub spawn: Option<Spawn>,
}

/// Thread qualifier on a call: the handle is stored globally under `handle`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spawn {
    pub handle: String,
    /// Deferred threads only start at `RunThread`.
    pub deferred: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    BitAnd,
    BitOr,
    BitXor,
    ShiftLeft,
    ShiftRight,
    And,
    Or,
    Equal,
    NotEqual,
    LessThan,
    LessOrEqual,
    GreaterThan,
    GreaterOrEqual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Negate,
    Not,
    Plus,
}

// ---- Builders ----
//
// The parser is an external collaborator; these keep hand-built trees short.

impl Expr {
    pub fn int(n: i64) -> Expr {
        Expr::Const(ConstValue::Integer(n))
    }

    pub fn float(n: f64) -> Expr {
        Expr::Const(ConstValue::Float(n))
    }

    pub fn string(s: impl Into<String>) -> Expr {
        Expr::Const(ConstValue::String(s.into()))
    }

    pub fn bool(b: bool) -> Expr {
        Expr::Const(ConstValue::Bool(b))
    }

    pub fn var(name: impl Into<String>) -> Expr {
        Expr::Identifier(Identifier::plain(name))
    }

    pub fn at(name: impl Into<String>, index: Expr) -> Expr {
        Expr::Identifier(Identifier::array(name, index))
    }

    pub fn key(name: impl Into<String>, key: Expr) -> Expr {
        Expr::Identifier(Identifier::key(name, key))
    }

    pub fn array(items: Vec<Expr>) -> Expr {
        Expr::Const(ConstValue::Array(items))
    }

    pub fn map(entries: Vec<(Expr, Expr)>) -> Expr {
        Expr::Const(ConstValue::Map(entries))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::Binary { op, lhs: Box::new(lhs), rhs: Box::new(rhs) }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Expr {
        Expr::Unary { op, operand: Box::new(operand) }
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call(FunctionCall { name: name.into(), args, spawn: None })
    }

    pub fn spawn(name: impl Into<String>, args: Vec<Expr>, handle: impl Into<String>, deferred: bool) -> Expr {
        Expr::Call(FunctionCall {
            name: name.into(),
            args,
            spawn: Some(Spawn { handle: handle.into(), deferred }),
        })
    }

    pub fn regex_match(subject: Expr, pattern: Expr) -> Expr {
        Expr::RegexMatch { subject: Box::new(subject), pattern: Box::new(pattern), negated: false }
    }
}

impl Identifier {
    pub fn plain(name: impl Into<String>) -> Self {
        Identifier { name: name.into(), index: None }
    }

    pub fn array(name: impl Into<String>, index: Expr) -> Self {
        Identifier { name: name.into(), index: Some(Index::Array(Box::new(index))) }
    }

    pub fn key(name: impl Into<String>, key: Expr) -> Self {
        Identifier { name: name.into(), index: Some(Index::Key(Box::new(key))) }
    }
}

impl Stmt {
    pub fn assign(name: impl Into<String>, value: Expr) -> Stmt {
        Stmt::Assign { target: Identifier::plain(name), value }
    }

    pub fn ret(value: Expr) -> Stmt {
        Stmt::Return(Some(value))
    }

    pub fn function(name: impl Into<String>, params: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::FunctionDef(FunctionDef {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            variadic: false,
            body,
        })
    }

    pub fn variadic(name: impl Into<String>, params: &[&str], body: Vec<Stmt>) -> Stmt {
        Stmt::FunctionDef(FunctionDef {
            name: name.into(),
            params: params.iter().map(|p| p.to_string()).collect(),
            variadic: true,
            body,
        })
    }
}
