use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::ast::*;
use crate::value::Value;

use super::op::{CompiledProgram, FunctionEntry, Op, ThreadSpawn, VariantEntry};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("'break' outside of a loop")]
    BreakOutsideLoop,
    #[error("'continue' outside of a loop")]
    ContinueOutsideLoop,
    #[error("function '{name}' is already defined")]
    DuplicateFunction { name: String },
    #[error("function '{function}' declares parameter '{param}' twice")]
    DuplicateParameter { function: String, param: String },
    #[error("malformed function '{name}': {reason}")]
    MalformedFunction { name: String, reason: &'static str },
    #[error("malformed variant declaration '{name}': {reason}")]
    MalformedVariant { name: String, reason: String },
    #[error("vararg access outside of a variadic function")]
    VarargOutsideVariadic,
}

type CompileResult<T = ()> = Result<T, CompileError>;

/// Compile a syntax tree into a flat instruction sequence plus its tables.
///
/// On error nothing is returned: a program either compiles whole or not at all.
pub fn compile(program: &Program) -> Result<CompiledProgram, CompileError> {
    let mut compiler = Compiler::new();
    compiler.compile_block(&program.statements)?;
    compiler.emit(Op::PushUnit);
    compiler.emit(Op::Return);

    debug_assert!(
        compiler.code.iter().filter_map(Op::target).all(|t| t < compiler.code.len()),
        "jump target out of range"
    );
    debug!(
        instructions = compiler.code.len(),
        functions = compiler.functions.len(),
        variants = compiler.variants.len(),
        "program compiled"
    );
    Ok(CompiledProgram::new(compiler.code, compiler.functions, compiler.variants))
}

/// Pending jumps of one enclosing loop.
struct LoopLabels {
    breaks: Vec<usize>,
    /// Backward target when known up front (`while`), else patched later.
    continue_target: Option<usize>,
    continues: Vec<usize>,
}

struct Compiler {
    code: Vec<Op>,
    functions: Vec<FunctionEntry>,
    function_names: HashSet<String>,
    variants: Vec<VariantEntry>,
    loops: Vec<LoopLabels>,
    /// One entry per enclosing function body: is it variadic?
    functions_open: Vec<bool>,
    next_hidden: usize,
    next_lambda: usize,
}

impl Compiler {
    fn new() -> Self {
        Compiler {
            code: Vec::new(),
            functions: Vec::new(),
            function_names: HashSet::new(),
            variants: Vec::new(),
            loops: Vec::new(),
            functions_open: Vec::new(),
            next_hidden: 0,
            next_lambda: 0,
        }
    }

    fn emit(&mut self, op: Op) -> usize {
        let idx = self.code.len();
        self.code.push(op);
        idx
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    /// Point the jump at `pos` to the next instruction to be emitted.
    fn patch_jump(&mut self, pos: usize) {
        let target = self.here();
        self.patch_jump_to(pos, target);
    }

    fn patch_jump_to(&mut self, pos: usize, target: usize) {
        match &mut self.code[pos] {
            Op::Jump(t) | Op::JumpIfTrue(t) | Op::JumpIfFalse(t) => *t = target,
            other => unreachable!("patching non-jump {}", other.name()),
        }
    }

    /// Hidden slot name; `#` cannot appear in source identifiers.
    fn hidden(&mut self, purpose: &str) -> String {
        let n = self.next_hidden;
        self.next_hidden += 1;
        format!("#{}{}", purpose, n)
    }

    // ── Statements ──────────────────────────────────────────────────

    fn compile_block(&mut self, stmts: &[Stmt]) -> CompileResult {
        for stmt in stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult {
        match stmt {
            Stmt::Assign { target, value } => self.compile_assign(target, value),

            Stmt::If { condition, then_block, else_block } => {
                self.compile_expr(condition)?;
                self.compile_branches(then_block, else_block.as_deref())
            }

            Stmt::Unless { condition, block, else_block } => {
                self.compile_expr(condition)?;
                self.emit(Op::LogicalNot);
                self.compile_branches(block, else_block.as_deref())
            }

            Stmt::While { condition, body } => {
                let head = self.here();
                self.compile_expr(condition)?;
                let exit = self.emit(Op::JumpIfFalse(0));
                self.loops.push(LoopLabels { breaks: Vec::new(), continue_target: Some(head), continues: Vec::new() });
                let body_result = self.compile_block(body);
                let labels = self.loops.pop().expect("loop labels pushed above");
                body_result?;
                self.emit(Op::Jump(head));
                self.patch_jump(exit);
                for b in labels.breaks {
                    self.patch_jump(b);
                }
                Ok(())
            }

            Stmt::For { binding, iterable, body } | Stmt::DoIn { binding, iterable, body } => {
                self.compile_iteration(binding, iterable, body)
            }

            Stmt::Match { subject, cases } => self.compile_match(subject, cases),

            Stmt::FunctionDef(def) => self.compile_function(&def.name, &def.params, def.variadic, &def.body),

            Stmt::Return(value) => {
                match value {
                    Some(e) => self.compile_expr(e)?,
                    None => {
                        self.emit(Op::PushUnit);
                    }
                }
                self.emit(Op::Return);
                Ok(())
            }

            Stmt::Jump(kind) => {
                let pos = self.here();
                let labels = match (self.loops.last_mut(), kind) {
                    (Some(l), _) => l,
                    (None, JumpKind::Break) => return Err(CompileError::BreakOutsideLoop),
                    (None, JumpKind::Continue) => return Err(CompileError::ContinueOutsideLoop),
                };
                match kind {
                    JumpKind::Break => labels.breaks.push(pos),
                    JumpKind::Continue => match labels.continue_target {
                        Some(head) => {
                            self.emit(Op::Jump(head));
                            return Ok(());
                        }
                        None => labels.continues.push(pos),
                    },
                }
                self.emit(Op::Jump(0));
                Ok(())
            }

            Stmt::Block(stmts) => self.compile_block(stmts),

            Stmt::FileOpen { path, mode, handle } => {
                self.compile_expr(path)?;
                self.emit(Op::open_file(*mode));
                self.emit(Op::StoreVariable(handle.clone()));
                Ok(())
            }

            Stmt::FileClose { handle } => {
                self.compile_expr(handle)?;
                self.emit(Op::CloseFile);
                Ok(())
            }

            Stmt::FileWrite { handle, content } => {
                self.compile_expr(handle)?;
                self.compile_expr(content)?;
                self.emit(Op::WriteFile);
                Ok(())
            }

            Stmt::FileAppend { handle, content } => {
                self.compile_expr(handle)?;
                self.compile_expr(content)?;
                self.emit(Op::AppendFile);
                Ok(())
            }

            Stmt::RunThread { name } => {
                self.emit(Op::RunThread(name.clone()));
                Ok(())
            }

            Stmt::VariantDecl(decl) => self.compile_variant(decl),

            Stmt::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop);
                Ok(())
            }
        }
    }

    fn compile_assign(&mut self, target: &Identifier, value: &Expr) -> CompileResult {
        match &target.index {
            None => {
                self.compile_expr(value)?;
                self.emit(Op::StoreVariable(target.name.clone()));
            }
            Some(Index::Array(index)) => {
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Op::StoreIntoArray(target.name.clone()));
            }
            Some(Index::Key(key)) => {
                self.compile_expr(key)?;
                self.compile_expr(value)?;
                self.emit(Op::StoreIntoMap(target.name.clone()));
            }
        }
        Ok(())
    }

    /// Condition already on the stack.
    fn compile_branches(&mut self, then_block: &[Stmt], else_block: Option<&[Stmt]>) -> CompileResult {
        let to_else = self.emit(Op::JumpIfFalse(0));
        self.compile_block(then_block)?;
        match else_block {
            Some(else_block) => {
                let to_end = self.emit(Op::Jump(0));
                self.patch_jump(to_else);
                self.compile_block(else_block)?;
                self.patch_jump(to_end);
            }
            None => self.patch_jump(to_else),
        }
        Ok(())
    }

    /// `for`/`do-in`: iterable evaluated once, cursor kept in a hidden local.
    fn compile_iteration(&mut self, binding: &str, iterable: &Expr, body: &[Stmt]) -> CompileResult {
        let items = self.hidden("items");
        let cursor = self.hidden("cursor");

        self.compile_expr(iterable)?;
        self.emit(Op::MakeIterable);
        self.emit(Op::StoreVariable(items.clone()));
        self.emit(Op::PushInt(0));
        self.emit(Op::StoreVariable(cursor.clone()));

        let head = self.here();
        self.emit(Op::LoadVariable(cursor.clone()));
        self.emit(Op::LoadVariable(items.clone()));
        self.emit(Op::Length);
        self.emit(Op::LessThan);
        let exit = self.emit(Op::JumpIfFalse(0));

        self.emit(Op::LoadVariable(cursor.clone()));
        self.emit(Op::LoadFromArray(items));
        self.emit(Op::StoreVariable(binding.to_string()));

        self.loops.push(LoopLabels { breaks: Vec::new(), continue_target: None, continues: Vec::new() });
        let body_result = self.compile_block(body);
        let labels = self.loops.pop().expect("loop labels pushed above");
        body_result?;

        let step = self.here();
        for c in labels.continues {
            self.patch_jump_to(c, step);
        }
        self.emit(Op::LoadVariable(cursor.clone()));
        self.emit(Op::PushInt(1));
        self.emit(Op::Add);
        self.emit(Op::StoreVariable(cursor));
        self.emit(Op::Jump(head));

        self.patch_jump(exit);
        for b in labels.breaks {
            self.patch_jump(b);
        }
        Ok(())
    }

    fn compile_match(&mut self, subject: &Expr, cases: &[MatchCase]) -> CompileResult {
        let slot = self.hidden("subject");
        self.compile_expr(subject)?;
        self.emit(Op::StoreVariable(slot.clone()));

        let mut end_jumps = Vec::new();
        for case in cases {
            let skip = match &case.pattern {
                Pattern::Wildcard => None,
                Pattern::Value(expr) => {
                    self.emit(Op::LoadVariable(slot.clone()));
                    self.compile_expr(expr)?;
                    self.emit(Op::Equal);
                    Some(self.emit(Op::JumpIfFalse(0)))
                }
                Pattern::Regex(pattern) => {
                    self.emit(Op::LoadVariable(slot.clone()));
                    self.emit(Op::PushString(pattern.clone()));
                    self.emit(Op::RegexMatch);
                    Some(self.emit(Op::JumpIfFalse(0)))
                }
            };

            self.compile_block(&case.body)?;

            match skip {
                Some(skip) => {
                    end_jumps.push(self.emit(Op::Jump(0)));
                    self.patch_jump(skip);
                }
                // Later cases are unreachable after a wildcard.
                None => break,
            }
        }

        for j in end_jumps {
            self.patch_jump(j);
        }
        Ok(())
    }

    /// Body is placed out-of-line behind a jump that skips it.
    fn compile_function(&mut self, name: &str, params: &[String], variadic: bool, body: &[Stmt]) -> CompileResult {
        if !self.function_names.insert(name.to_string()) {
            return Err(CompileError::DuplicateFunction { name: name.to_string() });
        }
        if variadic && params.is_empty() {
            return Err(CompileError::MalformedFunction {
                name: name.to_string(),
                reason: "a variadic function needs a parameter to collect extra arguments",
            });
        }
        let mut seen = HashSet::new();
        for p in params {
            if !seen.insert(p.as_str()) {
                return Err(CompileError::DuplicateParameter { function: name.to_string(), param: p.clone() });
            }
        }

        let skip = self.emit(Op::Jump(0));
        let entry = self.here();
        self.functions.push(FunctionEntry {
            name: name.to_string(),
            entry,
            params: params.to_vec(),
            variadic,
        });

        // A loop outside the function is not a break target inside it.
        let outer_loops = std::mem::take(&mut self.loops);
        self.functions_open.push(variadic);
        let body_result = self.compile_block(body);
        self.functions_open.pop();
        self.loops = outer_loops;
        body_result?;

        self.emit(Op::PushUnit);
        self.emit(Op::Return);
        self.patch_jump(skip);
        Ok(())
    }

    fn compile_variant(&mut self, decl: &VariantDecl) -> CompileResult {
        let malformed = |reason: String| CompileError::MalformedVariant { name: decl.name.clone(), reason };
        if decl.name.is_empty() {
            return Err(malformed("type name is empty".into()));
        }
        if decl.variants.is_empty() {
            return Err(malformed("no variants declared".into()));
        }
        if self.variants.iter().any(|v| v.type_name == decl.name) {
            return Err(malformed("type is already declared".into()));
        }
        let mut seen = HashSet::new();
        for v in &decl.variants {
            if v.name.is_empty() {
                return Err(malformed("variant name is empty".into()));
            }
            if !seen.insert(v.name.as_str()) {
                return Err(malformed(format!("variant '{}' declared twice", v.name)));
            }
        }

        // Each variant name evaluates to its tag string.
        for v in &decl.variants {
            self.emit(Op::PushString(format!("{}::{}", decl.name, v.name)));
            self.emit(Op::StoreVariable(v.name.clone()));
        }
        self.variants.push(VariantEntry {
            type_name: decl.name.clone(),
            variants: decl.variants.iter().map(|v| (v.name.clone(), v.of_type.clone())).collect(),
        });
        Ok(())
    }

    // ── Expressions ─────────────────────────────────────────────────
    //
    // Post-order: operands are emitted before the operator consuming them.

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult {
        match expr {
            Expr::Const(c) => self.compile_const(c),

            Expr::Identifier(id) => self.compile_load(id),

            Expr::Binary { op: BinaryOp::And, lhs, rhs } => self.compile_short_circuit(lhs, rhs, true),
            Expr::Binary { op: BinaryOp::Or, lhs, rhs } => self.compile_short_circuit(lhs, rhs, false),
            Expr::Binary { op, lhs, rhs } => {
                self.compile_expr(lhs)?;
                self.compile_expr(rhs)?;
                self.emit(binary_op(*op));
                Ok(())
            }

            Expr::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Negate => {
                        self.emit(Op::Negate);
                    }
                    UnaryOp::Not => {
                        self.emit(Op::LogicalNot);
                    }
                    UnaryOp::Plus => {}
                }
                Ok(())
            }

            Expr::CompoundAssign { target, op, value } => self.compile_compound_assign(target, *op, value),

            Expr::Call(call) => {
                for arg in &call.args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::CallFunction {
                    name: call.name.clone(),
                    argc: call.args.len(),
                    spawn: call.spawn.as_ref().map(|s| ThreadSpawn { handle: s.handle.clone(), deferred: s.deferred }),
                });
                Ok(())
            }

            Expr::RegexMatch { subject, pattern, negated } => {
                self.compile_expr(subject)?;
                self.compile_expr(pattern)?;
                self.emit(Op::RegexMatch);
                if *negated {
                    self.emit(Op::LogicalNot);
                }
                Ok(())
            }

            Expr::Ternary { condition, then_value, else_value } => {
                self.compile_expr(condition)?;
                let to_else = self.emit(Op::JumpIfFalse(0));
                self.compile_expr(then_value)?;
                let to_end = self.emit(Op::Jump(0));
                self.patch_jump(to_else);
                self.compile_expr(else_value)?;
                self.patch_jump(to_end);
                Ok(())
            }

            Expr::Lambda { params, variadic, body } => {
                let name = format!("lambda#{}", self.next_lambda);
                self.next_lambda += 1;
                self.compile_function(&name, params, *variadic, body)?;
                self.emit(Op::PushString(name));
                Ok(())
            }

            Expr::VarArg(index) => {
                self.require_variadic()?;
                self.compile_expr(index)?;
                self.emit(Op::LoadVararg);
                Ok(())
            }

            Expr::VarArgCount => {
                self.require_variadic()?;
                self.emit(Op::VarargCount);
                Ok(())
            }

            Expr::Exec(command) => {
                self.compile_expr(command)?;
                self.emit(Op::ExecCommand);
                Ok(())
            }

            Expr::FileRead { handle, mode } => {
                self.compile_expr(handle)?;
                self.emit(match mode {
                    ReadMode::All => Op::ReadFile,
                    ReadMode::Line => Op::ReadLine,
                });
                Ok(())
            }
        }
    }

    fn require_variadic(&self) -> CompileResult {
        match self.functions_open.last() {
            Some(true) => Ok(()),
            _ => Err(CompileError::VarargOutsideVariadic),
        }
    }

    fn compile_const(&mut self, c: &ConstValue) -> CompileResult {
        if let Some(value) = const_value(c) {
            self.emit(match value {
                Value::Integer(n) => Op::PushInt(n),
                Value::Float(n) => Op::PushFloat(n),
                Value::String(s) => Op::PushString(s),
                Value::Bool(b) => Op::PushBool(b),
                Value::Array(items) => Op::PushArray(items),
                Value::Map(entries) => Op::PushMap(entries),
                other => unreachable!("literal folded to {}", other.type_name()),
            });
            return Ok(());
        }

        match c {
            ConstValue::Array(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Op::MakeArray(items.len()));
            }
            ConstValue::Map(entries) => {
                for (k, v) in entries {
                    self.compile_expr(k)?;
                    self.compile_expr(v)?;
                }
                self.emit(Op::MakeMap(entries.len()));
            }
            ConstValue::FString(parts) => {
                for part in parts {
                    match part {
                        FStringPart::Text(s) => {
                            self.emit(Op::PushString(s.clone()));
                        }
                        FStringPart::Expr(e) => self.compile_expr(e)?,
                    }
                }
                self.emit(Op::Concat(parts.len()));
            }
            _ => unreachable!("scalar literals always fold"),
        }
        Ok(())
    }

    fn compile_load(&mut self, id: &Identifier) -> CompileResult {
        match &id.index {
            None => {
                self.emit(Op::LoadVariable(id.name.clone()));
            }
            Some(Index::Array(index)) => {
                self.compile_expr(index)?;
                self.emit(Op::LoadFromArray(id.name.clone()));
            }
            Some(Index::Key(key)) => {
                self.compile_expr(key)?;
                self.emit(Op::LoadFromMap(id.name.clone()));
            }
        }
        Ok(())
    }

    /// `a && b` / `a || b`: `b` is skipped once `a` decides the result.
    fn compile_short_circuit(&mut self, lhs: &Expr, rhs: &Expr, is_and: bool) -> CompileResult {
        self.compile_expr(lhs)?;
        self.emit(Op::Duplicate);
        let decided = if is_and { self.emit(Op::JumpIfFalse(0)) } else { self.emit(Op::JumpIfTrue(0)) };
        self.compile_expr(rhs)?;
        self.emit(if is_and { Op::LogicalAnd } else { Op::LogicalOr });
        self.patch_jump(decided);
        Ok(())
    }

    fn compile_compound_assign(&mut self, target: &Identifier, op: BinaryOp, value: &Expr) -> CompileResult {
        match &target.index {
            None => {
                self.emit(Op::LoadVariable(target.name.clone()));
                self.compile_expr(value)?;
                self.emit(binary_op(op));
                self.emit(Op::Duplicate);
                self.emit(Op::StoreVariable(target.name.clone()));
            }
            Some(index) => {
                // The subscript is evaluated once and parked in a hidden slot.
                let (index_expr, load, store) = match index {
                    Index::Array(e) => (e, Op::LoadFromArray(target.name.clone()), Op::StoreIntoArray(target.name.clone())),
                    Index::Key(e) => (e, Op::LoadFromMap(target.name.clone()), Op::StoreIntoMap(target.name.clone())),
                };
                let slot = self.hidden("index");
                self.compile_expr(index_expr)?;
                self.emit(Op::StoreVariable(slot.clone()));
                self.emit(Op::LoadVariable(slot.clone()));
                self.emit(Op::LoadVariable(slot.clone()));
                self.emit(load.clone());
                self.compile_expr(value)?;
                self.emit(binary_op(op));
                self.emit(store);
                self.emit(Op::LoadVariable(slot));
                self.emit(load);
            }
        }
        Ok(())
    }
}

fn binary_op(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Subtract => Op::Subtract,
        BinaryOp::Multiply => Op::Multiply,
        BinaryOp::Divide => Op::Divide,
        BinaryOp::Modulo => Op::Modulo,
        BinaryOp::BitAnd => Op::BitwiseAnd,
        BinaryOp::BitOr => Op::BitwiseOr,
        BinaryOp::BitXor => Op::BitwiseXor,
        BinaryOp::ShiftLeft => Op::ShiftLeft,
        BinaryOp::ShiftRight => Op::ShiftRight,
        BinaryOp::And => Op::LogicalAnd,
        BinaryOp::Or => Op::LogicalOr,
        BinaryOp::Equal => Op::Equal,
        BinaryOp::NotEqual => Op::NotEqual,
        BinaryOp::LessThan => Op::LessThan,
        BinaryOp::LessOrEqual => Op::LessThanOrEqual,
        BinaryOp::GreaterThan => Op::GreaterThan,
        BinaryOp::GreaterOrEqual => Op::GreaterThanOrEqual,
    }
}

/// Fold a literal into an immediate when every part of it is literal.
fn const_value(c: &ConstValue) -> Option<Value> {
    match c {
        ConstValue::Integer(n) => Some(Value::Integer(*n)),
        ConstValue::Float(n) => Some(Value::Float(*n)),
        ConstValue::String(s) | ConstValue::Regex(s) => Some(Value::String(s.clone())),
        ConstValue::Bool(b) => Some(Value::Bool(*b)),
        ConstValue::Array(items) => items
            .iter()
            .map(|e| match e {
                Expr::Const(c) => const_value(c),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .map(Value::Array),
        ConstValue::Map(entries) => {
            let mut map = HashMap::with_capacity(entries.len());
            for (k, v) in entries {
                let (Expr::Const(ConstValue::String(key)), Expr::Const(v)) = (k, v) else {
                    return None;
                };
                map.insert(key.clone(), const_value(v)?);
            }
            Some(Value::Map(map))
        }
        ConstValue::FString(_) => None,
    }
}
