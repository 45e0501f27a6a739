//! Ferrous script runtime core
//!
//! Bytecode virtual machine for an embeddable Lua-superset language: values
//! and tables, closures and upvalues, the processor that runs compiled
//! functions (metamethods, tail calls, coroutines, host await) and the
//! binary dump format for precompiled chunks.

#[macro_use]
mod log;

pub mod bytecode;
pub mod closure;
pub mod config;
pub mod error;
pub mod proto;
pub mod symbol;
pub mod value;
pub mod vm;

// Re-export commonly used types
pub use closure::{Closure, Upvalue, UpvalueRef};
pub use config::{LogLevel, ScriptOptions};
pub use error::{RuntimeError, RuntimeErrorKind, ScriptError, ScriptResult, StackFrameInfo};
pub use proto::{FunctionProto, Instruction, OpCode, ProtoBuilder, ProtoFlags, SourceRef};
pub use symbol::SymbolRef;
pub use value::{
    CallbackArguments, CallbackFunction, DataType, HostTask, Table, TableRef, TailCallData,
    TypeValidationFlags, UserData, UserDataDescriptor, Value,
};
pub use vm::{Coroutine, CoroutineState, DebugObserver, DynamicExpr, ExecutionContext, Processor};
