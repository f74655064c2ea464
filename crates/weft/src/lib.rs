//! weft: a just-in-time symbolic translator for a tensor-framework
//! bytecode VM.
//!
//! When the reference VM is about to run a user function, the engine's
//! frame-evaluation hook simulates the function's bytecode symbolically,
//! records every tensor operation into a computation graph, and hands
//! back a rewritten body that defers tensor work to a compiled segment,
//! guarded by a predicate that decides whether the translation is
//! reusable on future calls. Opcodes the simulator cannot model split the
//! function into a compiled prefix and resume functions.
//!
//! The crate is self-contained: [`runtime::Vm`] stands in for the host
//! interpreter and an eager tensor runtime stands in for the numeric
//! framework, so every translation can be checked end-to-end against
//! plain evaluation.

mod bytecode;
mod cache;
mod codegen;
mod config;
mod engine;
mod error;
mod executor;
mod graph;
mod guard;
mod host;
mod meta;
mod ops;
mod runtime;
mod tensor;
mod tracker;
mod variables;

pub use crate::{
    bytecode::{analysis_inputs, instrs_info, CodeObject, Instruction, Opcode},
    cache::{start_translate, CustomCode, InstructionTranslatorCache},
    codegen::CodeGen,
    config::{Config, LOG_LEVEL_ENV, STRICT_MODE_ENV},
    engine::{JitEngine, SimFrame, TranslateDeps},
    error::{BreakReason, ExecError, ExecResult, TranslateError},
    executor::OpcodeExecutor,
    graph::{FunctionGraph, Segment, SegmentId, SegmentTable, SirOp, SirValue, Statement, SymbolId},
    guard::{CheckKind, FramePath, Guard, GuardCheck, StringifyExpression},
    host::{
        binary_op, builtins_env, call_builtin, compare_op, getattr, getitem, repr, unary_op, values_equal,
        values_identical, Builtin, DictKey, Frame, FunctionObject, HostIter, HostValue, SliceValue,
    },
    meta::{MetaCache, MetaInfo, MetaOperand, VariableCreator},
    ops::{BinOp, CmpOp, TensorOp, UnaryOp},
    runtime::Vm,
    tensor::{broadcast_shapes, DType, Tensor},
    tracker::Tracker,
    variables::{
        call_builtin_variable, call_variable, topo_sort_vars, CallableKind, IterKind, TensorInfo, Variable,
        VariableFactory, VariableKind,
    },
};
