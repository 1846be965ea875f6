use std::collections::HashMap;

use crate::value::Value;
use crate::vm::{CompiledProgram, FunctionEntry, Op};

// ---- Bytecode listing ----
//
// One instruction per line, address first. Function entries get a label
// line so out-of-line bodies are easy to spot.

const OPERAND_COLUMN: usize = 22;

pub fn listing(program: &CompiledProgram) -> String {
    let mut out = String::new();

    if !program.variants.is_empty() {
        for entry in &program.variants {
            let variants: Vec<String> = entry
                .variants
                .iter()
                .map(|(name, of_type)| match of_type {
                    Some(t) => format!("{}({})", name, t),
                    None => name.clone(),
                })
                .collect();
            out.push_str(&format!("; variant {} = {}\n", entry.type_name, variants.join(" | ")));
        }
        out.push('\n');
    }

    let entries: HashMap<usize, &FunctionEntry> = program.functions.iter().map(|f| (f.entry, f)).collect();
    for (addr, op) in program.code.iter().enumerate() {
        if let Some(func) = entries.get(&addr) {
            out.push('\n');
            out.push_str(&fmt_signature(func));
            out.push_str(":\n");
        }
        out.push_str(&fmt_instruction(addr, op));
        out.push('\n');
    }
    out
}

fn fmt_signature(func: &FunctionEntry) -> String {
    let mut params: Vec<String> = func.params.clone();
    if func.variadic {
        if let Some(last) = params.last_mut() {
            last.push_str("...");
        }
    }
    format!("{}({})", func.name, params.join(", "))
}

fn fmt_instruction(addr: usize, op: &Op) -> String {
    match fmt_operand(op) {
        Some(operand) => format!("{:04}  {:<width$}{}", addr, op.name(), operand, width = OPERAND_COLUMN),
        None => format!("{:04}  {}", addr, op.name()),
    }
}

fn fmt_operand(op: &Op) -> Option<String> {
    Some(match op {
        Op::PushInt(n) => n.to_string(),
        Op::PushFloat(n) => format!("{:?}", n),
        Op::PushString(s) => format!("{:?}", s),
        Op::PushBool(b) => b.to_string(),
        Op::PushArray(items) => fmt_literal(&Value::Array(items.clone())),
        Op::PushMap(entries) => fmt_literal(&Value::Map(entries.clone())),
        Op::MakeArray(n) | Op::MakeMap(n) | Op::Concat(n) => n.to_string(),
        Op::Jump(t) | Op::JumpIfTrue(t) | Op::JumpIfFalse(t) => format!("-> {:04}", t),
        Op::LoadVariable(name)
        | Op::StoreVariable(name)
        | Op::LoadFromArray(name)
        | Op::StoreIntoArray(name)
        | Op::LoadFromMap(name)
        | Op::StoreIntoMap(name)
        | Op::RunThread(name) => name.clone(),
        Op::CallFunction { name, argc, spawn } => match spawn {
            None => format!("{} {}", name, argc),
            Some(s) if s.deferred => format!("{} {} (deferred thread {})", name, argc, s.handle),
            Some(s) => format!("{} {} (thread {})", name, argc, s.handle),
        },
        _ => return None,
    })
}

/// Strings quoted inside compound immediates; map keys already print sorted.
fn fmt_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("{:?}", s),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(fmt_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Map(entries) => {
            let mut keys: Vec<&String> = entries.keys().collect();
            keys.sort();
            let pairs: Vec<String> = keys.into_iter().map(|k| format!("{:?}: {}", k, fmt_literal(&entries[k]))).collect();
            format!("{{{}}}", pairs.join(", "))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::*;
    use crate::vm::compile;

    #[test]
    fn lists_one_instruction_per_line() {
        let prog = compile(&Program::new(vec![Stmt::assign("x", Expr::int(1))])).unwrap();
        let text = listing(&prog);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("0000  PUSH_INT"));
        assert!(lines[0].ends_with(" 1"));
        assert!(lines[1].ends_with("x"));
        assert_eq!(lines[3], "0003  RETURN");
    }

    #[test]
    fn labels_function_entries() {
        let prog = compile(&Program::new(vec![Stmt::variadic("sum", &["first", "rest"], vec![])])).unwrap();
        let text = listing(&prog);
        assert!(text.contains("sum(first, rest...):\n0001  PUSH_UNIT"), "{}", text);
        assert!(text.contains("JUMP                  -> 0003"), "{}", text);
    }

    #[test]
    fn map_immediates_print_sorted() {
        let prog = compile(&Program::new(vec![Stmt::assign(
            "m",
            Expr::map(vec![(Expr::string("b"), Expr::int(2)), (Expr::string("a"), Expr::string("x"))]),
        )]))
        .unwrap();
        assert!(listing(&prog).contains(r#"{"a": "x", "b": 2}"#));
    }

    #[test]
    fn variant_table_header() {
        let prog = compile(&Program::new(vec![Stmt::VariantDecl(VariantDecl {
            name: "Shape".into(),
            variants: vec![
                Variant { name: "Circle".into(), of_type: Some("float".into()) },
                Variant { name: "Empty".into(), of_type: None },
            ],
        })]))
        .unwrap();
        assert!(listing(&prog).starts_with("; variant Shape = Circle(float) | Empty\n"));
    }
}
