use std::collections::HashMap;

use xtella::ast::*;
use xtella::{CompileError, Error, Value, Vm, VmFault, compile};

fn eval(stmts: Vec<Stmt>) -> Value {
    match xtella::run(&Program::new(stmts)) {
        Ok(v) => v,
        Err(e) => panic!("program failed: {}", e),
    }
}

fn fault(stmts: Vec<Stmt>) -> VmFault {
    match xtella::run(&Program::new(stmts)) {
        Err(Error::Fault(f)) => f,
        Err(Error::Compile(e)) => panic!("unexpected compile error: {}", e),
        Ok(v) => panic!("expected a fault, got {}", v),
    }
}

fn bin(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr::binary(op, lhs, rhs)
}

fn add_assign(name: &str, value: Expr) -> Stmt {
    Stmt::Expr(Expr::CompoundAssign { target: Identifier::plain(name), op: BinaryOp::Add, value: Box::new(value) })
}

// --- Arithmetic ---

#[test]
fn precedence_is_carried_by_the_tree() {
    let e = bin(BinaryOp::Add, Expr::int(3), bin(BinaryOp::Multiply, Expr::int(4), Expr::int(2)));
    assert_eq!(eval(vec![Stmt::ret(e)]), Value::Integer(11));
}

#[test]
fn integer_and_float_division() {
    assert_eq!(eval(vec![Stmt::ret(bin(BinaryOp::Divide, Expr::int(7), Expr::int(2)))]), Value::Integer(3));
    assert_eq!(
        eval(vec![Stmt::ret(bin(BinaryOp::Divide, Expr::float(7.0), Expr::float(2.0)))]),
        Value::Float(3.5)
    );
}

#[test]
fn integer_zero_divisor_always_faults() {
    let div = fault(vec![Stmt::ret(bin(BinaryOp::Divide, Expr::int(1), Expr::int(0)))]);
    assert!(matches!(div, VmFault::DivisionByZero));
    let rem = fault(vec![Stmt::ret(bin(BinaryOp::Modulo, Expr::int(1), Expr::int(0)))]);
    assert!(matches!(rem, VmFault::DivisionByZero));
}

#[test]
fn mixed_integer_float_is_type_mismatch() {
    let f = fault(vec![Stmt::ret(bin(BinaryOp::Add, Expr::int(1), Expr::float(1.0)))]);
    assert!(matches!(f, VmFault::TypeMismatch { op: "ADD", .. }));
}

#[test]
fn short_circuit_skips_right_operand() {
    let boom = bin(BinaryOp::Equal, bin(BinaryOp::Divide, Expr::int(1), Expr::int(0)), Expr::int(0));
    assert_eq!(eval(vec![Stmt::ret(bin(BinaryOp::And, Expr::bool(false), boom.clone()))]), Value::Bool(false));
    assert_eq!(eval(vec![Stmt::ret(bin(BinaryOp::Or, Expr::bool(true), boom))]), Value::Bool(true));
    assert_eq!(
        eval(vec![Stmt::ret(bin(BinaryOp::And, Expr::bool(true), Expr::bool(false)))]),
        Value::Bool(false)
    );
}

// --- Functions and scopes ---

fn add_fn() -> Stmt {
    Stmt::function("add", &["a", "b"], vec![Stmt::ret(bin(BinaryOp::Add, Expr::var("a"), Expr::var("b")))])
}

#[test]
fn too_few_arguments_is_arity_mismatch() {
    let f = fault(vec![add_fn(), Stmt::ret(Expr::call("add", vec![Expr::int(1)]))]);
    assert!(matches!(f, VmFault::ArityMismatch { expected: 2, got: 1, .. }));
}

#[test]
fn exact_arguments_return_value() {
    assert_eq!(
        eval(vec![add_fn(), Stmt::ret(Expr::call("add", vec![Expr::int(1), Expr::int(2)]))]),
        Value::Integer(3)
    );
}

#[test]
fn function_without_return_yields_unit() {
    let v = eval(vec![
        Stmt::function("noop", &["a"], vec![Stmt::assign("b", Expr::var("a"))]),
        Stmt::ret(Expr::call("noop", vec![Expr::int(1)])),
    ]);
    assert_eq!(v, Value::Unit);
}

#[test]
fn unknown_function_faults() {
    let f = fault(vec![Stmt::ret(Expr::call("missing", vec![]))]);
    assert!(matches!(f, VmFault::UnknownFunction { name } if name == "missing"));
}

#[test]
fn locals_are_gone_after_return() {
    let f = fault(vec![
        Stmt::function("set", &[], vec![Stmt::assign("x", Expr::int(1))]),
        Stmt::Expr(Expr::call("set", vec![])),
        Stmt::ret(Expr::var("x")),
    ]);
    assert!(matches!(f, VmFault::UnknownIdentifier { name } if name == "x"));
}

#[test]
fn caller_binding_survives_callee_assignment() {
    let v = eval(vec![
        Stmt::assign("x", Expr::int(5)),
        Stmt::function("set", &[], vec![Stmt::assign("x", Expr::int(1))]),
        Stmt::Expr(Expr::call("set", vec![])),
        Stmt::ret(Expr::var("x")),
    ]);
    assert_eq!(v, Value::Integer(5));
}

#[test]
fn functions_read_globals() {
    let v = eval(vec![
        Stmt::assign("base", Expr::int(100)),
        Stmt::function("offset", &["n"], vec![Stmt::ret(bin(BinaryOp::Add, Expr::var("base"), Expr::var("n")))]),
        Stmt::ret(Expr::call("offset", vec![Expr::int(5)])),
    ]);
    assert_eq!(v, Value::Integer(105));
}

#[test]
fn recursion() {
    // fact(n) = n <= 1 ? 1 : n * fact(n - 1)
    let fact = Stmt::function(
        "fact",
        &["n"],
        vec![
            Stmt::If {
                condition: bin(BinaryOp::LessOrEqual, Expr::var("n"), Expr::int(1)),
                then_block: vec![Stmt::ret(Expr::int(1))],
                else_block: None,
            },
            Stmt::ret(bin(
                BinaryOp::Multiply,
                Expr::var("n"),
                Expr::call("fact", vec![bin(BinaryOp::Subtract, Expr::var("n"), Expr::int(1))]),
            )),
        ],
    );
    assert_eq!(eval(vec![fact, Stmt::ret(Expr::call("fact", vec![Expr::int(10)]))]), Value::Integer(3_628_800));
}

#[test]
fn variadic_sum() {
    let sum = Stmt::variadic(
        "sum",
        &["first", "rest"],
        vec![
            Stmt::assign("total", Expr::var("first")),
            Stmt::For { binding: "x".into(), iterable: Expr::var("rest"), body: vec![add_assign("total", Expr::var("x"))] },
            Stmt::ret(Expr::var("total")),
        ],
    );
    let v = eval(vec![sum, Stmt::ret(Expr::call("sum", vec![Expr::int(1), Expr::int(2), Expr::int(3)]))]);
    assert_eq!(v, Value::Integer(6));
}

#[test]
fn vararg_access_by_position() {
    let pick = |body: Expr| Stmt::variadic("pick", &["rest"], vec![Stmt::ret(body)]);
    let call = Stmt::ret(Expr::call("pick", vec![Expr::int(10), Expr::int(20), Expr::int(30)]));

    assert_eq!(eval(vec![pick(Expr::VarArg(Box::new(Expr::int(1)))), call.clone()]), Value::Integer(20));
    assert_eq!(eval(vec![pick(Expr::VarArgCount), call.clone()]), Value::Integer(3));
    let f = fault(vec![pick(Expr::VarArg(Box::new(Expr::int(5)))), call]);
    assert!(matches!(f, VmFault::VarargOutOfRange { index: 5, count: 3 }));
}

#[test]
fn lambda_called_through_variable() {
    let v = eval(vec![
        Stmt::assign(
            "double",
            Expr::Lambda {
                params: vec!["n".into()],
                variadic: false,
                body: vec![Stmt::ret(bin(BinaryOp::Multiply, Expr::var("n"), Expr::int(2)))],
            },
        ),
        Stmt::ret(Expr::call("double", vec![Expr::int(21)])),
    ]);
    assert_eq!(v, Value::Integer(42));
}

// --- Control flow ---

#[test]
fn while_false_never_runs_body() {
    let v = eval(vec![
        Stmt::assign("n", Expr::int(0)),
        Stmt::While { condition: Expr::bool(false), body: vec![add_assign("n", Expr::int(1))] },
        Stmt::ret(Expr::var("n")),
    ]);
    assert_eq!(v, Value::Integer(0));
}

#[test]
fn while_true_with_break_runs_once() {
    let v = eval(vec![
        Stmt::assign("n", Expr::int(0)),
        Stmt::While {
            condition: Expr::bool(true),
            body: vec![add_assign("n", Expr::int(1)), Stmt::Jump(JumpKind::Break)],
        },
        Stmt::ret(Expr::var("n")),
    ]);
    assert_eq!(v, Value::Integer(1));
}

#[test]
fn counting_loop() {
    let v = eval(vec![
        Stmt::assign("i", Expr::int(0)),
        Stmt::assign("sum", Expr::int(0)),
        Stmt::While {
            condition: bin(BinaryOp::LessThan, Expr::var("i"), Expr::int(5)),
            body: vec![add_assign("sum", Expr::var("i")), add_assign("i", Expr::int(1))],
        },
        Stmt::ret(Expr::var("sum")),
    ]);
    assert_eq!(v, Value::Integer(10));
}

#[test]
fn for_continue_skips_rest_of_body() {
    // sum of odd elements
    let even = bin(BinaryOp::Equal, bin(BinaryOp::Modulo, Expr::var("x"), Expr::int(2)), Expr::int(0));
    let v = eval(vec![
        Stmt::assign("sum", Expr::int(0)),
        Stmt::For {
            binding: "x".into(),
            iterable: Expr::array((1..=6).map(Expr::int).collect()),
            body: vec![
                Stmt::If { condition: even, then_block: vec![Stmt::Jump(JumpKind::Continue)], else_block: None },
                add_assign("sum", Expr::var("x")),
            ],
        },
        Stmt::ret(Expr::var("sum")),
    ]);
    assert_eq!(v, Value::Integer(9));
}

#[test]
fn do_in_over_map_visits_sorted_keys() {
    let join = Expr::Const(ConstValue::FString(vec![FStringPart::Expr(Expr::var("keys")), FStringPart::Expr(Expr::var("k"))]));
    let v = eval(vec![
        Stmt::assign("keys", Expr::string("")),
        Stmt::DoIn {
            binding: "k".into(),
            iterable: Expr::map(vec![
                (Expr::string("c"), Expr::int(3)),
                (Expr::string("a"), Expr::int(1)),
                (Expr::string("b"), Expr::int(2)),
            ]),
            body: vec![Stmt::assign("keys", join)],
        },
        Stmt::ret(Expr::var("keys")),
    ]);
    assert_eq!(v, Value::from("abc"));
}

#[test]
fn unless_inverts_condition() {
    let v = eval(vec![
        Stmt::Unless {
            condition: Expr::bool(false),
            block: vec![Stmt::assign("r", Expr::string("ran"))],
            else_block: Some(vec![Stmt::assign("r", Expr::string("skipped"))]),
        },
        Stmt::ret(Expr::var("r")),
    ]);
    assert_eq!(v, Value::from("ran"));
}

#[test]
fn ternary_picks_one_arm() {
    let t = Expr::Ternary {
        condition: Box::new(bin(BinaryOp::GreaterThan, Expr::int(2), Expr::int(1))),
        then_value: Box::new(Expr::string("yes")),
        else_value: Box::new(bin(BinaryOp::Divide, Expr::int(1), Expr::int(0))),
    };
    assert_eq!(eval(vec![Stmt::ret(t)]), Value::from("yes"));
}

#[test]
fn match_on_variant_tags() {
    let shape = Stmt::VariantDecl(VariantDecl {
        name: "Shape".into(),
        variants: vec![
            Variant { name: "Circle".into(), of_type: Some("float".into()) },
            Variant { name: "Square".into(), of_type: None },
        ],
    });
    let case = |pattern: Pattern, r: &str| MatchCase { pattern, body: vec![Stmt::assign("r", Expr::string(r))] };
    let v = eval(vec![
        shape,
        Stmt::assign("s", Expr::var("Square")),
        Stmt::Match {
            subject: Expr::var("s"),
            cases: vec![
                case(Pattern::Value(Expr::var("Circle")), "circle"),
                case(Pattern::Value(Expr::var("Square")), "square"),
                case(Pattern::Wildcard, "other"),
            ],
        },
        Stmt::ret(Expr::array(vec![Expr::var("r"), Expr::var("s")])),
    ]);
    assert_eq!(v, Value::Array(vec![Value::from("square"), Value::from("Shape::Square")]));
}

#[test]
fn match_regex_cases_first_wins() {
    let case = |pattern: Pattern, r: i64| MatchCase { pattern, body: vec![Stmt::assign("r", Expr::int(r))] };
    let v = eval(vec![
        Stmt::Match {
            subject: Expr::string("order-42"),
            cases: vec![
                case(Pattern::Regex("^[0-9]+$".into()), 1),
                case(Pattern::Regex("[a-z]+-[0-9]+".into()), 2),
                case(Pattern::Regex("order.*".into()), 3),
                case(Pattern::Wildcard, 4),
            ],
        },
        Stmt::ret(Expr::var("r")),
    ]);
    assert_eq!(v, Value::Integer(2));
}

#[test]
fn break_outside_loop_is_compile_error() {
    let err = xtella::run(&Program::new(vec![Stmt::Jump(JumpKind::Break)])).unwrap_err();
    assert!(matches!(err, Error::Compile(CompileError::BreakOutsideLoop)));
}

// --- Containers ---

#[test]
fn indexed_store_and_compound_assign() {
    let v = eval(vec![
        Stmt::assign("xs", Expr::array(vec![Expr::int(1), Expr::int(2), Expr::int(3)])),
        Stmt::Assign { target: Identifier::array("xs", Expr::int(0)), value: Expr::int(7) },
        Stmt::Expr(Expr::CompoundAssign {
            target: Identifier::array("xs", Expr::int(1)),
            op: BinaryOp::Add,
            value: Box::new(Expr::int(10)),
        }),
        Stmt::ret(Expr::var("xs")),
    ]);
    assert_eq!(v, Value::Array(vec![Value::Integer(7), Value::Integer(12), Value::Integer(3)]));
}

#[test]
fn compound_assign_evaluates_to_stored_value() {
    let v = eval(vec![
        Stmt::assign("n", Expr::int(4)),
        Stmt::ret(Expr::CompoundAssign {
            target: Identifier::plain("n"),
            op: BinaryOp::Multiply,
            value: Box::new(Expr::int(3)),
        }),
    ]);
    assert_eq!(v, Value::Integer(12));
}

#[test]
fn map_keys_and_missing_key() {
    let v = eval(vec![
        Stmt::assign("m", Expr::map(vec![(Expr::string("a"), Expr::int(1))])),
        Stmt::Assign { target: Identifier::key("m", Expr::string("b")), value: Expr::int(2) },
        Stmt::ret(bin(BinaryOp::Add, Expr::key("m", Expr::string("a")), Expr::key("m", Expr::string("b")))),
    ]);
    assert_eq!(v, Value::Integer(3));

    let f = fault(vec![Stmt::assign("m", Expr::map(vec![])), Stmt::ret(Expr::key("m", Expr::string("zz")))]);
    assert!(matches!(f, VmFault::KeyNotFound { key, .. } if key == "zz"));
}

#[test]
fn runtime_built_containers() {
    let v = eval(vec![
        Stmt::assign("k", Expr::string("x")),
        Stmt::ret(Expr::map(vec![(Expr::var("k"), Expr::array(vec![Expr::var("k"), Expr::int(1)]))])),
    ]);
    let mut expected = HashMap::new();
    expected.insert("x".to_string(), Value::Array(vec![Value::from("x"), Value::Integer(1)]));
    assert_eq!(v, Value::Map(expected));
}

#[test]
fn fstring_joins_display_forms() {
    let s = Expr::Const(ConstValue::FString(vec![
        FStringPart::Text("n=".into()),
        FStringPart::Expr(Expr::int(3)),
        FStringPart::Text(", ok=".into()),
        FStringPart::Expr(Expr::bool(true)),
    ]));
    assert_eq!(eval(vec![Stmt::ret(s)]), Value::from("n=3, ok=true"));
}

// --- Regex ---

#[test]
fn regex_match_examples() {
    let m = |s: &str, p: &str| eval(vec![Stmt::ret(Expr::regex_match(Expr::string(s), Expr::string(p)))]);
    assert_eq!(m("abc123", "^[a-z]+[0-9]+$"), Value::Bool(true));
    assert_eq!(m("abc", "^[0-9]+$"), Value::Bool(false));
}

#[test]
fn regex_must_cover_whole_subject() {
    let m = |s: &str, p: &str| eval(vec![Stmt::ret(Expr::regex_match(Expr::string(s), Expr::string(p)))]);
    assert_eq!(m("abc123", "[0-9]+"), Value::Bool(false));
    assert_eq!(m("abc123", "[a-z]+[0-9]+"), Value::Bool(true));
    assert_eq!(m("order-42", "order"), Value::Bool(false));
}

#[test]
fn negated_regex_match() {
    let e = Expr::RegexMatch {
        subject: Box::new(Expr::string("abc")),
        pattern: Box::new(Expr::Const(ConstValue::Regex("^[0-9]+$".into()))),
        negated: true,
    };
    assert_eq!(eval(vec![Stmt::ret(e)]), Value::Bool(true));
}

#[test]
fn malformed_pattern_is_regex_fault() {
    let f = fault(vec![Stmt::ret(Expr::regex_match(Expr::string("a"), Expr::string("(")))]);
    assert!(matches!(f, VmFault::Regex { .. }));
}

// --- Determinism ---

#[test]
fn compiling_twice_is_identical() {
    let program = Program::new(vec![
        add_fn(),
        Stmt::assign("m", Expr::map(vec![(Expr::string("x"), Expr::int(1)), (Expr::string("y"), Expr::int(2))])),
        Stmt::ret(Expr::call("add", vec![Expr::int(1), Expr::int(2)])),
    ]);
    assert_eq!(compile(&program).unwrap(), compile(&program).unwrap());
}

// --- Threads ---

/// `log = {}`; `work` marks `log{"ran"}`, which lands in the shared globals.
fn thread_program(deferred: bool, joins: usize) -> Vec<Stmt> {
    let mut stmts = vec![
        Stmt::assign("log", Expr::map(vec![])),
        Stmt::function(
            "work",
            &["tag"],
            vec![Stmt::Assign { target: Identifier::key("log", Expr::var("tag")), value: Expr::bool(true) }],
        ),
        Stmt::Expr(Expr::spawn("work", vec![Expr::string("ran")], "t", deferred)),
    ];
    for _ in 0..joins {
        stmts.push(Stmt::RunThread { name: "t".into() });
    }
    stmts.push(Stmt::ret(Expr::var("log")));
    stmts
}

fn ran(log: &Value) -> bool {
    matches!(log, Value::Map(m) if m.contains_key("ran"))
}

#[test]
fn deferred_thread_never_run_has_no_effect() {
    assert!(!ran(&eval(thread_program(true, 0))));
}

#[test]
fn deferred_thread_runs_once_when_joined() {
    assert!(ran(&eval(thread_program(true, 1))));
}

#[test]
fn immediate_thread_join() {
    assert!(ran(&eval(thread_program(false, 1))));
}

#[test]
fn joining_twice_faults() {
    assert!(matches!(fault(thread_program(true, 2)), VmFault::ThreadJoin { .. }));
}

#[test]
fn run_thread_on_unknown_name() {
    let f = fault(vec![Stmt::RunThread { name: "nope".into() }]);
    assert!(matches!(f, VmFault::UnknownIdentifier { .. }));
}

#[cfg(unix)]
#[test]
fn run_waits_for_immediate_thread_never_joined() {
    let mut stmts = thread_program(false, 0);
    let Stmt::FunctionDef(work) = &mut stmts[1] else { panic!("work is the second statement") };
    work.body.insert(0, Stmt::Expr(Expr::Exec(Box::new(Expr::string("sleep 0.2")))));
    let vm = Vm::new(compile(&Program::new(stmts)).unwrap());
    vm.run().unwrap();
    assert!(vm.globals().with("log", ran).unwrap());
}

#[test]
fn spawn_publishes_handle_in_globals() {
    let vm = Vm::new(compile(&Program::new(thread_program(true, 0))).unwrap());
    vm.run().unwrap();
    assert!(matches!(vm.globals().get("t"), Some(Value::ThreadHandle(h)) if h.name() == "t"));
}

// --- Files and processes ---

fn temp_path(dir: &tempfile::TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

#[test]
fn write_append_then_read_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "out.txt");
    let line = |h: &str| Expr::FileRead { handle: Box::new(Expr::var(h)), mode: ReadMode::Line };
    let v = eval(vec![
        Stmt::FileOpen { path: Expr::string(&path), mode: FileMode::Write, handle: "w".into() },
        Stmt::FileWrite { handle: Expr::var("w"), content: Expr::string("hello\n") },
        Stmt::FileAppend { handle: Expr::var("w"), content: Expr::string("world\n") },
        Stmt::FileClose { handle: Expr::var("w") },
        Stmt::FileOpen { path: Expr::string(&path), mode: FileMode::Read, handle: "r".into() },
        Stmt::assign("a", line("r")),
        Stmt::assign("b", line("r")),
        Stmt::assign("c", line("r")),
        Stmt::FileClose { handle: Expr::var("r") },
        Stmt::ret(Expr::array(vec![Expr::var("a"), Expr::var("b"), Expr::var("c")])),
    ]);
    assert_eq!(v, Value::Array(vec![Value::from("hello"), Value::from("world"), Value::from("")]));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "hello\nworld\n");
}

#[test]
fn read_whole_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "in.txt");
    std::fs::write(&path, "one\ntwo\n").unwrap();
    let v = eval(vec![
        Stmt::FileOpen { path: Expr::string(&path), mode: FileMode::Read, handle: "r".into() },
        Stmt::ret(Expr::FileRead { handle: Box::new(Expr::var("r")), mode: ReadMode::All }),
    ]);
    assert_eq!(v, Value::from("one\ntwo\n"));
}

#[test]
fn double_close_faults() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "x.txt");
    let f = fault(vec![
        Stmt::FileOpen { path: Expr::string(&path), mode: FileMode::Write, handle: "w".into() },
        Stmt::FileClose { handle: Expr::var("w") },
        Stmt::FileClose { handle: Expr::var("w") },
    ]);
    assert!(matches!(f, VmFault::DoubleClose { .. }));
}

#[test]
fn write_after_close_faults() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "x.txt");
    let f = fault(vec![
        Stmt::FileOpen { path: Expr::string(&path), mode: FileMode::Append, handle: "w".into() },
        Stmt::FileClose { handle: Expr::var("w") },
        Stmt::FileWrite { handle: Expr::var("w"), content: Expr::string("late") },
    ]);
    assert!(matches!(f, VmFault::UseAfterClose { .. }));
}

#[test]
fn opening_missing_file_is_io_fault() {
    let dir = tempfile::tempdir().unwrap();
    let path = temp_path(&dir, "missing.txt");
    let f = fault(vec![Stmt::FileOpen { path: Expr::string(&path), mode: FileMode::Read, handle: "r".into() }]);
    assert!(matches!(f, VmFault::FileIo { .. }));
}

#[cfg(unix)]
#[test]
fn exec_yields_exit_code() {
    let v = eval(vec![Stmt::ret(Expr::Exec(Box::new(Expr::string("exit 3"))))]);
    assert_eq!(v, Value::Integer(3));
}
