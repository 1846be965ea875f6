pub mod ast;
pub mod codegen;
pub mod value;
pub mod vm;

pub use value::{FileMode, Value};
pub use vm::{CompileError, CompiledProgram, Vm, VmFault, VmOptions, compile};

/// Anything that can stop a program: rejected at compile time or faulted at run time.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("compile error: {0}")]
    Compile(#[from] CompileError),
    #[error("runtime fault: {0}")]
    Fault(#[from] VmFault),
}

/// Compile and run a syntax tree with default options.
pub fn run(program: &ast::Program) -> Result<Value, Error> {
    run_with(program, VmOptions::default())
}

pub fn run_with(program: &ast::Program, options: VmOptions) -> Result<Value, Error> {
    let compiled = compile(program)?;
    Ok(Vm::with_options(compiled, options).run()?)
}
