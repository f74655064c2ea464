//! The stack-machine simulator.
//!
//! One executor walks one frame's bytecode, reading and writing wrapped
//! variables instead of host values. Tensor work lands in the graph;
//! everything constant folds. When an opcode cannot be simulated the
//! executor either splits the function at one of the three break sites
//! (top level) or raises a break up to its caller (inline).
//!
//! The executor runs to completion: a normal return compiles the graph
//! into a single rewritten body, a break site emits the compiled prefix
//! plus resume calls, and anything else escapes as an error for the
//! translation boundary to classify.

mod inline;

pub use inline::inline_call;

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::{
    bytecode::{analysis_inputs, make_function_flags as mf, format_value_flags as fv, call_function_ex_flags,
        CodeObject, Instruction, Opcode},
    codegen::JumpTarget,
    engine::{SimFrame, TranslateDeps},
    error::{BreakReason, ExecError, ExecResult},
    graph::FunctionGraph,
    guard::Guard,
    host::{Builtin, DictKey, FunctionObject, HostValue, SliceValue},
    ops::{BinOp, CmpOp, UnaryOp},
    tracker::Tracker,
    variables::{call_variable, call_builtin_variable, iterator_over, CallableKind, Variable, VariableKind},
};

/// What the dispatch loop should do after one instruction.
enum Control {
    Advance,
    Stop,
}

/// The per-frame simulator.
///
/// Borrows the translation's graph: the top-level executor creates it,
/// inline executors extend the caller's.
pub struct OpcodeExecutor<'g> {
    graph: &'g mut FunctionGraph,
    code: Rc<CodeObject>,
    stack: Vec<Variable>,
    locals: IndexMap<String, Variable>,
    globals: IndexMap<String, Variable>,
    builtins: IndexMap<String, Variable>,
    consts: Vec<Variable>,
    lasti: usize,
    current_line: u32,
    inline: bool,
    name: &'static str,
    /// The host globals mapping functions made here will close over.
    globals_rc: Rc<RefCell<IndexMap<String, HostValue>>>,
    /// Closure cells of the inlined callee (reconstruction provenance).
    #[expect(dead_code, reason = "cell-dereferencing opcodes are outside the modeled set")]
    closure: Vec<Variable>,
    return_value: Option<Variable>,
    new_code: Option<Rc<CodeObject>>,
    guard: Option<Guard>,
}

impl<'g> OpcodeExecutor<'g> {
    /// Translates a frame from scratch: builds the virtual environment,
    /// runs to completion, and returns the rewritten code and its guard.
    pub fn run_top_level(
        graph: &'g mut FunctionGraph,
        frame: &crate::host::Frame,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<(Rc<CodeObject>, Guard)> {
        let mut executor = Self {
            graph,
            code: Rc::clone(&frame.code),
            stack: Vec::new(),
            locals: IndexMap::new(),
            globals: IndexMap::new(),
            builtins: IndexMap::new(),
            consts: Vec::new(),
            lasti: 0,
            current_line: frame.code.first_line,
            inline: false,
            name: "Executor",
            globals_rc: Rc::clone(&frame.globals),
            closure: Vec::new(),
            return_value: None,
            new_code: None,
            guard: None,
        };
        executor.prepare_virtual_env(frame, deps);
        executor.run(deps)?;
        let new_code = executor
            .new_code
            .take()
            .ok_or_else(|| ExecError::inner("simulation finished without producing rewritten code"))?;
        let guard = executor
            .guard
            .take()
            .ok_or_else(|| ExecError::inner("simulation finished without producing a guard"))?;
        Ok((new_code, guard))
    }

    /// Builds an inline executor over the caller's graph with pre-bound
    /// locals. Globals/builtins/consts/closure come from the callee.
    pub(crate) fn new_inline(
        graph: &'g mut FunctionGraph,
        code: Rc<CodeObject>,
        locals: IndexMap<String, Variable>,
        globals: IndexMap<String, Variable>,
        builtins: IndexMap<String, Variable>,
        consts: Vec<Variable>,
        closure: Vec<Variable>,
        globals_rc: Rc<RefCell<IndexMap<String, HostValue>>>,
    ) -> Self {
        let first_line = code.first_line;
        Self {
            graph,
            code,
            stack: Vec::new(),
            locals,
            globals,
            builtins,
            consts,
            lasti: 0,
            current_line: first_line,
            inline: true,
            name: "Inline",
            globals_rc,
            closure,
            return_value: None,
            new_code: None,
            guard: None,
        }
    }

    /// The inlined callee's return value.
    pub(crate) fn take_return_value(&mut self) -> Option<Variable> {
        self.return_value.take()
    }

    /// Wraps the frame's scopes and constants into the variable model.
    fn prepare_virtual_env(&mut self, frame: &crate::host::Frame, deps: &mut TranslateDeps<'_>) {
        for (name, value) in &frame.locals {
            let var = deps
                .factory
                .from_value(value, self.graph, Tracker::Local { name: name.clone() });
            var.set_debug_name(name);
            self.locals.insert(name.clone(), var);
        }
        for (name, value) in frame.globals.borrow().iter() {
            let var = deps
                .factory
                .from_value(value, self.graph, Tracker::Global { name: name.clone() });
            var.set_debug_name(name);
            self.globals.insert(name.clone(), var);
        }
        for (name, value) in frame.builtins.iter() {
            let var = deps
                .factory
                .from_value(value, self.graph, Tracker::Builtin { name: name.clone() });
            var.set_debug_name(name);
            self.builtins.insert(name.clone(), var);
        }
        for value in &frame.code.consts {
            let var = deps
                .factory
                .from_value(value, self.graph, Tracker::Const { value: value.clone() });
            self.consts.push(var);
        }
    }

    /// Runs the dispatch loop to a stop signal.
    pub(crate) fn run(&mut self, deps: &mut TranslateDeps<'_>) -> ExecResult<()> {
        deps.sim_stack.push(SimFrame {
            name: self.code.name.clone(),
            line: self.current_line,
        });
        self.lasti = 0;
        loop {
            let Some(instr) = self.code.instructions.get(self.lasti).copied() else {
                return Err(ExecError::inner("lasti out of range"));
            };
            self.lasti += 1;
            match self.step(instr, deps)? {
                Control::Advance => {}
                Control::Stop => break,
            }
        }
        deps.sim_stack.pop();
        Ok(())
    }

    /// Dispatches one instruction.
    fn step(&mut self, instr: Instruction, deps: &mut TranslateDeps<'_>) -> ExecResult<Control> {
        if instr.line != 0 {
            self.current_line = instr.line;
        }
        if let Some(frame) = deps.sim_stack.last_mut() {
            frame.line = self.current_line;
        }
        trace!(
            executor = self.name,
            line = self.current_line,
            opcode = %instr.opcode,
            arg = instr.arg,
            stack = self.stack.len(),
            "step"
        );

        match instr.opcode {
            Opcode::Nop => Ok(Control::Advance),
            Opcode::PopTop => {
                self.pop()?;
                Ok(Control::Advance)
            }
            Opcode::DupTop => {
                let top = self.peek()?.clone();
                self.push(top)?;
                Ok(Control::Advance)
            }
            Opcode::DupTopTwo => {
                let pair = self.peek_n(2)?;
                for var in pair {
                    self.push(var)?;
                }
                Ok(Control::Advance)
            }
            Opcode::RotTwo => self.rot_top_n(2),
            Opcode::RotThree => self.rot_top_n(3),
            Opcode::RotFour => self.rot_top_n(4),

            Opcode::LoadConst => {
                let var = self
                    .consts
                    .get(instr.arg as usize)
                    .cloned()
                    .ok_or_else(|| ExecError::inner("LOAD_CONST operand out of range"))?;
                self.push(var)?;
                Ok(Control::Advance)
            }
            Opcode::LoadFast => {
                let name = self.varname(instr.arg)?;
                let var = self
                    .locals
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ExecError::inner(format!("local '{name}' referenced before assignment")))?;
                self.push(var)?;
                Ok(Control::Advance)
            }
            Opcode::LoadGlobal => {
                let name = self.name_at(instr.arg)?;
                let var = self
                    .globals
                    .get(&name)
                    .or_else(|| self.builtins.get(&name))
                    .cloned()
                    .ok_or_else(|| ExecError::inner(format!("name '{name}' is not defined")))?;
                self.push(var)?;
                Ok(Control::Advance)
            }
            Opcode::LoadName => {
                let name = self.name_at(instr.arg)?;
                let var = self.get_var(&name)?;
                self.push(var)?;
                Ok(Control::Advance)
            }
            Opcode::LoadBuiltin => {
                let name = self.name_at(instr.arg)?;
                let var = self
                    .builtins
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| ExecError::inner(format!("builtin '{name}' is not defined")))?;
                self.push(var)?;
                Ok(Control::Advance)
            }
            Opcode::StoreFast => {
                let name = self.varname(instr.arg)?;
                let var = self.pop()?;
                var.set_debug_name(&name);
                self.locals.insert(name, var);
                Ok(Control::Advance)
            }
            Opcode::StoreName => {
                let name = self.name_at(instr.arg)?;
                let var = self.pop()?;
                var.set_debug_name(&name);
                self.locals.insert(name, var);
                Ok(Control::Advance)
            }

            Opcode::LoadAttr => {
                let name = self.name_at(instr.arg)?;
                self.with_call_break(instr, 1, deps, |ex, deps| {
                    let obj = ex.pop()?;
                    let name_var = Variable::wrap_literal(HostValue::str(name.clone()));
                    let attr = call_builtin_variable(Builtin::GetAttr, &[obj, name_var], ex.graph, deps)?;
                    ex.push(attr)
                })
            }
            Opcode::LoadMethod => {
                let name = self.name_at(instr.arg)?;
                let obj = self.pop()?;
                let attr = obj.getattr(&name)?;
                if let VariableKind::Callable(CallableKind::Method { function, .. }) = attr.kind() {
                    // Bound method: push the unbound function and the
                    // receiver so CALL_METHOD can treat both shapes alike.
                    let function = (**function).clone();
                    self.push(function)?;
                    self.push(obj)?;
                } else {
                    self.push(Variable::dummy())?;
                    self.push(attr)?;
                }
                Ok(Control::Advance)
            }

            Opcode::UnaryPositive => self.unary_op(instr, UnaryOp::Pos, deps),
            Opcode::UnaryNegative => self.unary_op(instr, UnaryOp::Neg, deps),
            Opcode::UnaryInvert => self.unary_op(instr, UnaryOp::Invert, deps),

            Opcode::BinaryPower => self.binary_op(instr, BinOp::Pow, false, deps),
            Opcode::BinaryMultiply => self.binary_op(instr, BinOp::Mul, false, deps),
            Opcode::BinaryMatrixMultiply => self.binary_op(instr, BinOp::MatMul, false, deps),
            Opcode::BinaryFloorDivide => self.binary_op(instr, BinOp::FloorDiv, false, deps),
            Opcode::BinaryTrueDivide => self.binary_op(instr, BinOp::TrueDiv, false, deps),
            Opcode::BinaryModulo => self.binary_op(instr, BinOp::Mod, false, deps),
            Opcode::BinaryAdd => self.binary_op(instr, BinOp::Add, false, deps),
            Opcode::BinarySubtract => self.binary_op(instr, BinOp::Sub, false, deps),
            Opcode::BinaryLshift => self.binary_op(instr, BinOp::LShift, false, deps),
            Opcode::BinaryRshift => self.binary_op(instr, BinOp::RShift, false, deps),
            Opcode::BinaryAnd => self.binary_op(instr, BinOp::BitAnd, false, deps),
            Opcode::BinaryOr => self.binary_op(instr, BinOp::BitOr, false, deps),
            Opcode::BinaryXor => self.binary_op(instr, BinOp::BitXor, false, deps),

            Opcode::InplacePower => self.binary_op(instr, BinOp::Pow, true, deps),
            Opcode::InplaceMultiply => self.binary_op(instr, BinOp::Mul, true, deps),
            Opcode::InplaceMatrixMultiply => self.binary_op(instr, BinOp::MatMul, true, deps),
            Opcode::InplaceFloorDivide => self.binary_op(instr, BinOp::FloorDiv, true, deps),
            Opcode::InplaceTrueDivide => self.binary_op(instr, BinOp::TrueDiv, true, deps),
            Opcode::InplaceModulo => self.binary_op(instr, BinOp::Mod, true, deps),
            Opcode::InplaceAdd => self.binary_op(instr, BinOp::Add, true, deps),
            Opcode::InplaceSubtract => self.binary_op(instr, BinOp::Sub, true, deps),
            Opcode::InplaceLshift => self.binary_op(instr, BinOp::LShift, true, deps),
            Opcode::InplaceRshift => self.binary_op(instr, BinOp::RShift, true, deps),
            Opcode::InplaceAnd => self.binary_op(instr, BinOp::BitAnd, true, deps),
            Opcode::InplaceOr => self.binary_op(instr, BinOp::BitOr, true, deps),
            Opcode::InplaceXor => self.binary_op(instr, BinOp::BitXor, true, deps),

            Opcode::CompareOp => {
                let op = CmpOp::from_arg(instr.arg)
                    .ok_or_else(|| ExecError::not_implemented("unsupported rich-compare operand"))?;
                self.with_call_break(instr, 1, deps, |ex, deps| {
                    let rhs = ex.pop()?;
                    let lhs = ex.pop()?;
                    let result = call_builtin_variable(Builtin::Compare(op), &[lhs, rhs], ex.graph, deps)?;
                    ex.push(result)
                })
            }
            Opcode::IsOp => {
                let op = if instr.arg == 0 { CmpOp::Is } else { CmpOp::IsNot };
                let rhs = self.pop()?;
                let lhs = self.pop()?;
                let result = call_builtin_variable(Builtin::Compare(op), &[lhs, rhs], self.graph, deps)?;
                self.push(result)?;
                Ok(Control::Advance)
            }

            Opcode::BinarySubscr => self.with_call_break(instr, 1, deps, |ex, deps| {
                let key = ex.pop()?;
                let container = ex.pop()?;
                ex.graph.add_global_guarded_variable(&key);
                let result = call_builtin_variable(Builtin::GetItem, &[container, key], ex.graph, deps)?;
                ex.push(result)
            }),
            Opcode::StoreSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                let value = self.pop()?;
                self.graph.add_global_guarded_variable(&key);
                container.setitem(&key.get_value()?, value.clone())?;
                value.set_debug_name(format!("{}[{}]", container.debug_name(), key.debug_name()));
                Ok(Control::Advance)
            }
            Opcode::DeleteSubscr => {
                let key = self.pop()?;
                let container = self.pop()?;
                self.graph.add_global_guarded_variable(&key);
                container.delitem(&key.get_value()?)?;
                Ok(Control::Advance)
            }

            Opcode::BuildList | Opcode::BuildTuple => {
                let items = self.pop_n(instr.arg as usize)?;
                let kind = if instr.opcode == Opcode::BuildList {
                    VariableKind::List(RefCell::new(items.clone()))
                } else {
                    VariableKind::Tuple(RefCell::new(items.clone()))
                };
                self.push(Variable::new(kind, Tracker::Dummy { inputs: items }))?;
                Ok(Control::Advance)
            }
            Opcode::BuildSet => Err(ExecError::not_implemented("set construction is not modeled")),
            Opcode::BuildMap => {
                let flat = self.pop_n(instr.arg as usize * 2)?;
                let keys: Vec<Variable> = flat.iter().step_by(2).cloned().collect();
                let values: Vec<Variable> = flat.iter().skip(1).step_by(2).cloned().collect();
                let map = self.build_map(&keys, &values)?;
                self.push(map)?;
                Ok(Control::Advance)
            }
            Opcode::BuildConstKeyMap => {
                let keys_var = self.pop()?;
                let keys = keys_var
                    .get_items()
                    .ok_or_else(|| ExecError::inner("BUILD_CONST_KEY_MAP keys must be a tuple"))?;
                if keys.len() != instr.arg as usize {
                    return Err(ExecError::inner("BUILD_CONST_KEY_MAP key count mismatch"));
                }
                let values = self.pop_n(instr.arg as usize)?;
                let map = self.build_map(&keys, &values)?;
                self.push(map)?;
                Ok(Control::Advance)
            }
            Opcode::BuildString => {
                let parts = self.pop_n(instr.arg as usize)?;
                let mut out = String::new();
                for part in &parts {
                    let HostValue::Str(s) = part.get_value()? else {
                        return Err(ExecError::inner("BUILD_STRING operand is not a string constant"));
                    };
                    out.push_str(&s);
                }
                self.push(Variable::new(
                    VariableKind::Constant(HostValue::str(out)),
                    Tracker::Dummy { inputs: parts },
                ))?;
                Ok(Control::Advance)
            }
            Opcode::BuildSlice => {
                let count = instr.arg as usize;
                let parts = self.pop_n(count)?;
                let bound = |var: &Variable| -> ExecResult<Option<i64>> {
                    match var.get_value()? {
                        HostValue::None => Ok(None),
                        HostValue::Int(i) => Ok(Some(i)),
                        other => Err(ExecError::not_implemented(format!(
                            "slice bounds must be integer constants, not {}",
                            other.type_name()
                        ))),
                    }
                };
                let slice = SliceValue {
                    start: bound(&parts[0])?,
                    stop: bound(&parts[1])?,
                    step: if count == 3 { bound(&parts[2])? } else { None },
                };
                self.push(Variable::new(
                    VariableKind::Slice(slice),
                    Tracker::Dummy { inputs: parts },
                ))?;
                Ok(Control::Advance)
            }
            Opcode::BuildListUnpack | Opcode::BuildTupleUnpack | Opcode::BuildTupleUnpackWithCall => {
                let parts = self.pop_n(instr.arg as usize)?;
                let mut items = Vec::new();
                for part in &parts {
                    let children = part
                        .get_items()
                        .ok_or_else(|| ExecError::not_implemented("unpack of a non-sequence"))?;
                    items.extend(children);
                }
                let kind = if instr.opcode == Opcode::BuildListUnpack {
                    VariableKind::List(RefCell::new(items))
                } else {
                    VariableKind::Tuple(RefCell::new(items))
                };
                self.push(Variable::new(kind, Tracker::Dummy { inputs: parts }))?;
                Ok(Control::Advance)
            }
            Opcode::BuildMapUnpack | Opcode::BuildMapUnpackWithCall => {
                let parts = self.pop_n(instr.arg as usize)?;
                let check_repeats = instr.opcode == Opcode::BuildMapUnpackWithCall;
                let mut merged: IndexMap<DictKey, Variable> = IndexMap::new();
                for part in &parts {
                    let VariableKind::Dict(map) = part.kind() else {
                        return Err(ExecError::not_implemented("map unpack of a non-dict"));
                    };
                    for (key, value) in map.borrow().iter() {
                        if check_repeats && merged.contains_key(key) {
                            return Err(ExecError::inner(format!("map unpack found repeated key {key}")));
                        }
                        merged.insert(key.clone(), value.clone());
                    }
                }
                self.push(Variable::new(
                    VariableKind::Dict(RefCell::new(merged)),
                    Tracker::Dummy { inputs: parts },
                ))?;
                Ok(Control::Advance)
            }

            Opcode::CallFunction => self.with_call_break(instr, 1, deps, |ex, deps| {
                let args = ex.pop_n(instr.arg as usize)?;
                let callee = ex.pop()?;
                let ret = call_variable(&callee, args, IndexMap::new(), ex.graph, deps)?;
                ex.push(ret)
            }),
            Opcode::CallFunctionKw => self.with_call_break(instr, 1, deps, |ex, deps| {
                let names_var = ex.pop()?;
                let names = names_var
                    .get_items()
                    .ok_or_else(|| ExecError::inner("CALL_FUNCTION_KW names must be a tuple"))?;
                let kw_names: Vec<String> = names
                    .iter()
                    .map(|name| match name.get_value()? {
                        HostValue::Str(s) => Ok(s.to_string()),
                        _ => Err(ExecError::inner("keyword names must be string constants")),
                    })
                    .collect::<ExecResult<_>>()?;
                let mut all_args = ex.pop_n(instr.arg as usize)?;
                let callee = ex.pop()?;
                let split = all_args.len() - kw_names.len();
                let kw_values = all_args.split_off(split);
                let kwargs: IndexMap<String, Variable> = kw_names.into_iter().zip(kw_values).collect();
                let ret = call_variable(&callee, all_args, kwargs, ex.graph, deps)?;
                ex.push(ret)
            }),
            Opcode::CallFunctionEx => self.with_call_break(instr, 1, deps, |ex, deps| {
                let kwargs = if instr.arg & call_function_ex_flags::HAS_KWARGS != 0 {
                    let kwargs_var = ex.pop()?;
                    let VariableKind::Dict(map) = kwargs_var.kind() else {
                        return Err(ExecError::not_implemented("CALL_FUNCTION_EX kwargs must be a dict"));
                    };
                    let collected = map
                        .borrow()
                        .iter()
                        .map(|(key, value)| match key {
                            DictKey::Str(name) => Ok((name.clone(), value.clone())),
                            _ => Err(ExecError::inner("keywords must be strings")),
                        })
                        .collect::<ExecResult<IndexMap<String, Variable>>>()?;
                    collected
                } else {
                    IndexMap::new()
                };
                let args_var = ex.pop()?;
                let args = args_var
                    .get_items()
                    .ok_or_else(|| ExecError::not_implemented("CALL_FUNCTION_EX args must be a sequence"))?;
                let callee = ex.pop()?;
                let ret = call_variable(&callee, args, kwargs, ex.graph, deps)?;
                ex.push(ret)
            }),
            Opcode::CallMethod => self.with_call_break(instr, 1, deps, |ex, deps| {
                let mut args = ex.pop_n(instr.arg as usize)?;
                let self_var = ex.pop()?;
                let method = ex.pop()?;
                let callee = if matches!(method.kind(), VariableKind::Dummy) {
                    self_var
                } else {
                    let mut bound = Vec::with_capacity(args.len() + 1);
                    bound.push(self_var);
                    bound.append(&mut args);
                    args = bound;
                    method
                };
                let ret = call_variable(&callee, args, IndexMap::new(), ex.graph, deps)?;
                ex.push(ret)
            }),

            Opcode::MakeFunction => self.make_function(instr.arg),

            Opcode::GetIter => {
                let source = self.pop()?;
                if matches!(source.kind(), VariableKind::Iter(_)) {
                    self.push(source)?;
                } else {
                    self.push(iterator_over(&source))?;
                }
                Ok(Control::Advance)
            }
            Opcode::ForIter => {
                if self.inline {
                    self.for_iter_inline(instr)
                } else {
                    self.for_iter_top(instr, deps)
                }
            }
            Opcode::UnpackSequence => {
                let sequence = self.pop()?;
                if sequence.is_tensor() {
                    return Err(ExecError::not_implemented("unpacking a tensor is not modeled"));
                }
                let items = sequence
                    .get_items()
                    .ok_or_else(|| ExecError::not_implemented(format!("cannot unpack '{}'", sequence.get_type())))?;
                if items.len() != instr.arg as usize {
                    return Err(ExecError::inner(format!(
                        "cannot unpack {} values into {}",
                        items.len(),
                        instr.arg
                    )));
                }
                for item in items.into_iter().rev() {
                    self.push(item)?;
                }
                Ok(Control::Advance)
            }

            Opcode::FormatValue => self.format_value(instr.arg),

            Opcode::JumpForward | Opcode::JumpAbsolute => {
                self.lasti = instr.arg as usize;
                Ok(Control::Advance)
            }
            Opcode::PopJumpIfFalse => self.jump_cond(instr, false, false, deps),
            Opcode::PopJumpIfTrue => self.jump_cond(instr, true, false, deps),
            Opcode::JumpIfFalseOrPop => self.jump_cond(instr, false, true, deps),
            Opcode::JumpIfTrueOrPop => self.jump_cond(instr, true, true, deps),

            Opcode::ReturnValue => {
                if self.inline {
                    self.return_value = Some(self.pop()?);
                    return Ok(Control::Stop);
                }
                if self.stack.len() != 1 {
                    return Err(ExecError::inner(format!(
                        "stack must hold exactly the return value, found {} entries",
                        self.stack.len()
                    )));
                }
                let ret = self.pop()?;
                self.graph
                    .start_compile(std::slice::from_ref(&ret), deps.segments, deps.meta)?;
                self.graph.codegen.gen_return();
                self.new_code = Some(Rc::new(self.graph.codegen.gen_code()));
                self.guard = Some(self.graph.guard_fn()?);
                Ok(Control::Stop)
            }

            Opcode::DictUpdate => {
                let other = self.pop()?;
                let target = self.stack_from_top(instr.arg as usize)?;
                call_builtin_variable(Builtin::DictUpdate, &[target, other], self.graph, deps)?;
                Ok(Control::Advance)
            }
            Opcode::DictMerge => {
                let other = self.pop()?;
                let target = self.stack_from_top(instr.arg as usize)?;
                let (VariableKind::Dict(target_map), VariableKind::Dict(other_map)) = (target.kind(), other.kind())
                else {
                    return Err(ExecError::not_implemented("DICT_MERGE operands must be dicts"));
                };
                for key in other_map.borrow().keys() {
                    if target_map.borrow().contains_key(key) {
                        return Err(ExecError::inner(format!(
                            "got multiple values for keyword argument {key}"
                        )));
                    }
                }
                call_builtin_variable(Builtin::DictUpdate, &[target, other], self.graph, deps)?;
                Ok(Control::Advance)
            }
            Opcode::ListExtend => {
                let other = self.pop()?;
                let target = self.stack_from_top(instr.arg as usize)?;
                call_builtin_variable(Builtin::ListExtend, &[target, other], self.graph, deps)?;
                Ok(Control::Advance)
            }
            Opcode::ListToTuple => {
                let list = self.pop()?;
                let items = list
                    .get_items()
                    .ok_or_else(|| ExecError::not_implemented("LIST_TO_TUPLE operand must be a list"))?;
                self.push(Variable::new(
                    VariableKind::Tuple(RefCell::new(items)),
                    Tracker::Dummy { inputs: vec![list] },
                ))?;
                Ok(Control::Advance)
            }

            other => Err(ExecError::not_implemented(format!("opcode {other} is not supported"))),
        }
    }

    // --- stack primitives -------------------------------------------------

    fn push(&mut self, var: Variable) -> ExecResult<Control> {
        if !var.may_enter_stack() {
            return Err(ExecError::inner(format!(
                "dangling variable {var:?} must not be pushed onto the stack"
            )));
        }
        self.stack.push(var);
        Ok(Control::Advance)
    }

    fn pop(&mut self) -> ExecResult<Variable> {
        self.stack
            .pop()
            .ok_or_else(|| ExecError::inner("stack underflow on pop"))
    }

    fn peek(&self) -> ExecResult<&Variable> {
        self.stack
            .last()
            .ok_or_else(|| ExecError::inner("stack underflow on peek"))
    }

    fn peek_n(&self, n: usize) -> ExecResult<Vec<Variable>> {
        if self.stack.len() < n {
            return Err(ExecError::inner("stack underflow on peek_n"));
        }
        Ok(self.stack[self.stack.len() - n..].to_vec())
    }

    fn pop_n(&mut self, n: usize) -> ExecResult<Vec<Variable>> {
        if self.stack.len() < n {
            return Err(ExecError::inner("stack underflow on pop_n"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn stack_from_top(&self, depth: usize) -> ExecResult<Variable> {
        if depth == 0 || self.stack.len() < depth {
            return Err(ExecError::inner("bad stack depth operand"));
        }
        Ok(self.stack[self.stack.len() - depth].clone())
    }

    fn rot_top_n(&mut self, n: usize) -> ExecResult<Control> {
        if self.stack.len() < n {
            return Err(ExecError::inner(format!("not enough stack entries to rotate {n}")));
        }
        let top = self.pop()?;
        let at = self.stack.len() + 1 - n;
        self.stack.insert(at, top);
        Ok(Control::Advance)
    }

    fn varname(&self, arg: u32) -> ExecResult<String> {
        self.code
            .varname(arg)
            .map(str::to_string)
            .ok_or_else(|| ExecError::inner("varname operand out of range"))
    }

    fn name_at(&self, arg: u32) -> ExecResult<String> {
        self.code
            .name_at(arg)
            .map(str::to_string)
            .ok_or_else(|| ExecError::inner("name operand out of range"))
    }

    /// Resolves a name through locals, globals, then builtins.
    fn get_var(&self, name: &str) -> ExecResult<Variable> {
        self.locals
            .get(name)
            .or_else(|| self.globals.get(name))
            .or_else(|| self.builtins.get(name))
            .cloned()
            .ok_or_else(|| ExecError::inner(format!("can not get var: {name}")))
    }

    // --- operator families ------------------------------------------------

    fn binary_op(
        &mut self,
        instr: Instruction,
        op: BinOp,
        inplace: bool,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<Control> {
        self.with_call_break(instr, 1, deps, |ex, deps| {
            let rhs = ex.pop()?;
            let lhs = ex.pop()?;
            let lhs_name = lhs.debug_name();
            let result = call_builtin_variable(Builtin::Binary(op), &[lhs, rhs], ex.graph, deps)?;
            if inplace {
                // No in-place host semantics; the result takes over the
                // left operand's name.
                result.set_debug_name(lhs_name);
            }
            ex.push(result)
        })
    }

    fn unary_op(&mut self, instr: Instruction, op: UnaryOp, deps: &mut TranslateDeps<'_>) -> ExecResult<Control> {
        self.with_call_break(instr, 1, deps, |ex, deps| {
            let operand = ex.pop()?;
            let result = call_builtin_variable(Builtin::Unary(op), &[operand], ex.graph, deps)?;
            ex.push(result)
        })
    }

    fn build_map(&mut self, keys: &[Variable], values: &[Variable]) -> ExecResult<Variable> {
        let mut map: IndexMap<DictKey, Variable> = IndexMap::new();
        for (key, value) in keys.iter().zip(values) {
            // Cache reuse requires the same key: pin it in the guard.
            self.graph.add_global_guarded_variable(key);
            let literal = key.get_value()?;
            let dict_key = DictKey::from_value(&literal).ok_or_else(|| {
                ExecError::not_implemented(format!("unhashable key type: {}", literal.type_name()))
            })?;
            map.insert(dict_key, value.clone());
        }
        let mut inputs: Vec<Variable> = keys.to_vec();
        inputs.extend(values.iter().cloned());
        Ok(Variable::new(
            VariableKind::Dict(RefCell::new(map)),
            Tracker::Dummy { inputs },
        ))
    }

    fn make_function(&mut self, flags: u32) -> ExecResult<Control> {
        let name_var = self.pop()?;
        let code_var = self.pop()?;
        let HostValue::Str(fn_name) = name_var.get_value()? else {
            return Err(ExecError::inner("MAKE_FUNCTION name must be a string"));
        };
        let HostValue::Code(code) = code_var.get_value()? else {
            return Err(ExecError::inner("MAKE_FUNCTION expects a code object"));
        };

        let mut related = vec![name_var, code_var];

        let closure_vars = if flags & mf::HAS_CLOSURE != 0 {
            let closure_var = self.pop()?;
            let cells = closure_var
                .get_items()
                .ok_or_else(|| ExecError::inner("MAKE_FUNCTION closure must be a tuple"))?;
            related.push(closure_var);
            cells
        } else {
            Vec::new()
        };

        if flags & mf::HAS_ANNOTATIONS != 0 {
            // Annotations carry no runtime semantics here.
            related.push(self.pop()?);
        }

        if flags & mf::HAS_KWDEFAULTS != 0 {
            return Err(ExecError::not_implemented("keyword-only defaults in MAKE_FUNCTION"));
        }

        let default_vars = if flags & mf::HAS_DEFAULTS != 0 {
            let defaults_var = self.pop()?;
            let defaults = defaults_var
                .get_items()
                .ok_or_else(|| ExecError::inner("MAKE_FUNCTION defaults must be a tuple"))?;
            related.push(defaults_var);
            defaults
        } else {
            Vec::new()
        };

        let defaults: Vec<HostValue> = default_vars.iter().map(Variable::get_value).collect::<ExecResult<_>>()?;
        let closure: Vec<HostValue> = closure_vars.iter().map(Variable::get_value).collect::<ExecResult<_>>()?;
        let function = Rc::new(FunctionObject {
            name: fn_name.to_string(),
            code,
            globals: Rc::clone(&self.globals_rc),
            defaults,
            closure,
        });

        let kind = if closure_vars.is_empty() {
            CallableKind::UserFunction(function)
        } else {
            CallableKind::ClosureFunction {
                function,
                defaults: default_vars,
                closure: closure_vars,
            }
        };
        self.push(Variable::new(
            VariableKind::Callable(kind),
            Tracker::Dummy { inputs: related },
        ))?;
        Ok(Control::Advance)
    }

    fn format_value(&mut self, flags: u32) -> ExecResult<Control> {
        let fmt_spec = if flags & fv::FVS_HAVE_SPEC != 0 {
            let spec_var = self.pop()?;
            let HostValue::Str(spec) = spec_var.get_value()? else {
                return Err(ExecError::not_implemented("format spec must be a string constant"));
            };
            spec.to_string()
        } else {
            String::new()
        };
        let value = self.pop()?;
        if !matches!(value.kind(), VariableKind::Constant(_)) {
            return Err(ExecError::not_implemented(format!(
                "formatting '{}' values is not modeled",
                value.get_type()
            )));
        }
        if !fmt_spec.is_empty() {
            return Err(ExecError::not_implemented("non-empty format specs are not modeled"));
        }
        let literal = value.get_value()?;
        let rendered = match flags & fv::FVC_MASK {
            fv::FVC_NONE | fv::FVC_STR => match &literal {
                HostValue::Str(s) => s.to_string(),
                other => crate::host::repr(other),
            },
            fv::FVC_REPR | fv::FVC_ASCII => crate::host::repr(&literal),
            _ => return Err(ExecError::inner("unexpected FORMAT_VALUE conversion flag")),
        };
        self.push(Variable::new(
            VariableKind::Constant(HostValue::str(rendered)),
            Tracker::Dummy { inputs: vec![value] },
        ))?;
        Ok(Control::Advance)
    }

    // --- call-break protocol ----------------------------------------------

    /// Runs `f`; on a break or unsupported operation, restores the
    /// pre-call stack and splits the graph at this instruction (top
    /// level), or re-raises as a break (inline).
    fn with_call_break(
        &mut self,
        instr: Instruction,
        push_n: usize,
        deps: &mut TranslateDeps<'_>,
        f: impl FnOnce(&mut Self, &mut TranslateDeps<'_>) -> ExecResult<Control>,
    ) -> ExecResult<Control> {
        let origin_stack = self.stack.clone();
        match f(self, deps) {
            Ok(_) => Ok(Control::Advance),
            Err(err @ (ExecError::BreakGraph(_) | ExecError::NotImplemented(_))) => {
                if self.inline {
                    return Err(ExecError::BreakGraph(BreakReason::InlineUnsupported(err.to_string())));
                }
                debug!(opcode = %instr.opcode, error = %err, "break graph in call");
                self.stack = origin_stack;
                self.break_graph_in_call(instr, push_n, deps)
                    .map_err(break_emission_failure)?;
                Ok(Control::Stop)
            }
            Err(other) => Err(other),
        }
    }

    /// Break protocol (b): compile up to the call, emit the original call
    /// against a reconstructed stack, and resume after it.
    fn break_graph_in_call(
        &mut self,
        instr: Instruction,
        push_n: usize,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<()> {
        let index = self.lasti - 1;

        // Outputs: every tensor on the stack plus the locals the resume
        // point still reads.
        let mut ret_vars: Vec<Variable> = self.stack.iter().filter(|v| v.is_tensor()).cloned().collect();
        let resume_input_names = analysis_inputs(&self.code, index + 1);
        for name in &resume_input_names {
            let var = self.get_var(name)?;
            if !ret_vars.contains(&var) {
                ret_vars.push(var);
            }
        }
        self.graph
            .start_compile_no_push(&ret_vars, deps.segments, deps.meta)?;

        // Rebuild the pre-call stack and replay the original call. The
        // instruction is re-interned so table operands stay valid in the
        // rewritten code.
        let stack_snapshot = self.stack.clone();
        for var in &stack_snapshot {
            var.reconstruct(&mut self.graph.codegen)?;
        }
        self.graph.codegen.copy_instr(instr, &self.code, None)?;

        // The call consumes its operands and pushes `push_n` results.
        let consumed = i32::try_from(push_n).expect("push count fits i32") - instr.opcode.stack_effect(instr.arg, false);
        self.pop_n(usize::try_from(consumed).map_err(|_| ExecError::inner("negative call pop count"))?)?;
        let stack_size = self.stack.len() + push_n;

        let resume = self.graph.codegen.gen_resume_fn_at(index + 1, stack_size)?;
        if let Some((function, input_names)) = resume {
            let resume_vars: Vec<Variable> = input_names
                .iter()
                .map(|name| self.get_var(name))
                .collect::<ExecResult<_>>()?;
            let argc = stack_size + input_names.len();
            self.graph
                .codegen
                .gen_load_object(HostValue::Function(Rc::clone(&function)), &function.name);
            self.graph
                .codegen
                .gen_rot_n(u32::try_from(stack_size + 1).expect("stack size fits u32"));
            for var in &resume_vars {
                var.reconstruct(&mut self.graph.codegen)?;
            }
            self.graph
                .codegen
                .gen_call_function(u32::try_from(argc).expect("argc fits u32"));
        }
        self.graph.codegen.gen_return();

        self.new_code = Some(Rc::new(self.graph.codegen.gen_code()));
        self.guard = Some(self.graph.guard_fn()?);
        Ok(())
    }

    // --- jump protocol ----------------------------------------------------

    fn jump_cond(
        &mut self,
        instr: Instruction,
        jump_on_true: bool,
        or_pop: bool,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<Control> {
        let target = instr.arg as usize;
        let pred = self.peek()?.clone();
        match pred.kind() {
            VariableKind::Constant(_)
            | VariableKind::List(_)
            | VariableKind::Tuple(_)
            | VariableKind::Dict(_) => {
                self.graph.add_global_guarded_variable(&pred);
                let is_jump = pred.truthy()? == jump_on_true;
                if or_pop {
                    if !is_jump {
                        self.pop()?;
                    }
                } else {
                    self.pop()?;
                }
                if is_jump {
                    self.lasti = target;
                }
                Ok(Control::Advance)
            }
            VariableKind::Tensor(_) => {
                self.pop()?;
                if self.inline {
                    return Err(ExecError::BreakGraph(BreakReason::JumpOnTensor));
                }
                debug!(opcode = %instr.opcode, "break graph in jump");
                self.break_graph_in_jump(&pred, instr, deps)
                    .map_err(break_emission_failure)?;
                Ok(Control::Stop)
            }
            _ => Err(ExecError::not_implemented(
                "predicates must be constants, containers, or tensors",
            )),
        }
    }

    /// Break protocol (a): compile up to the jump, leave the predicate on
    /// the stack, and branch between two resume functions.
    fn break_graph_in_jump(
        &mut self,
        pred: &Variable,
        instr: Instruction,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<()> {
        self.graph.add_global_guarded_variable(pred);
        let stack_size = self.stack.len();
        let target = instr.arg as usize;

        let if_resume = self.graph.codegen.gen_resume_fn_at(self.lasti, stack_size)?;
        let else_resume = self.graph.codegen.gen_resume_fn_at(target, stack_size)?;

        // Inputs for the compiled prefix: the union of both branches'
        // live locals, predicate excluded (it is already an output).
        let mut input_names: Vec<String> = Vec::new();
        if let Some((_, names)) = &if_resume {
            input_names.extend(names.iter().cloned());
        }
        if let Some((_, names)) = &else_resume {
            for name in names {
                if !input_names.contains(name) {
                    input_names.push(name.clone());
                }
            }
        }
        let input_vars: Vec<Variable> = input_names
            .iter()
            .map(|name| self.get_var(name))
            .collect::<ExecResult<Vec<_>>>()?
            .into_iter()
            .filter(|var| var != pred)
            .collect();
        let resolved_inputs: Vec<Variable> = input_names
            .iter()
            .map(|name| self.get_var(name))
            .collect::<ExecResult<_>>()?;

        let mut ret_vars = vec![pred.clone()];
        ret_vars.extend(input_vars.iter().cloned());
        // Leave the outputs on the stack, then pop everything above the
        // predicate: the emitted jump consumes the predicate itself.
        self.graph.start_compile(&ret_vars, deps.segments, deps.meta)?;
        for _ in &input_vars {
            self.graph.codegen.gen_pop_top();
        }

        // The original conditional jump, retargeted at the else branch.
        let else_label = self.graph.codegen.new_label();
        self.graph.codegen.add_jump(instr.opcode, else_label);

        // Fallthrough branch.
        self.emit_branch(&if_resume, &input_names, &resolved_inputs, stack_size)?;
        // Taken branch.
        self.graph.codegen.bind_label(else_label);
        self.emit_branch(&else_resume, &input_names, &resolved_inputs, stack_size)?;

        self.new_code = Some(Rc::new(self.graph.codegen.gen_code()));
        self.guard = Some(self.graph.guard_fn()?);
        Ok(())
    }

    /// Emits one arm of a jump break: call the branch's resume function
    /// with the reconstructed stack and its live locals, or return the
    /// stack top directly when the branch is a bare return.
    fn emit_branch(
        &mut self,
        resume: &Option<(Rc<FunctionObject>, Vec<String>)>,
        all_input_names: &[String],
        resolved_inputs: &[Variable],
        stack_size: usize,
    ) -> ExecResult<()> {
        match resume {
            Some((function, branch_inputs)) => {
                self.graph
                    .codegen
                    .gen_load_object(HostValue::Function(Rc::clone(function)), &function.name);
                let stack_snapshot = self.stack.clone();
                for var in &stack_snapshot {
                    var.reconstruct(&mut self.graph.codegen)?;
                }
                for name in branch_inputs {
                    let position = all_input_names
                        .iter()
                        .position(|candidate| candidate == name)
                        .ok_or_else(|| ExecError::inner("branch input missing from the union"))?;
                    resolved_inputs[position].reconstruct(&mut self.graph.codegen)?;
                }
                let argc = stack_size + branch_inputs.len();
                self.graph
                    .codegen
                    .gen_call_function(u32::try_from(argc).expect("argc fits u32"));
                self.graph.codegen.gen_return();
            }
            None => {
                let stack_snapshot = self.stack.clone();
                for var in &stack_snapshot {
                    var.reconstruct(&mut self.graph.codegen)?;
                }
                self.graph.codegen.gen_return();
            }
        }
        Ok(())
    }

    // --- iteration --------------------------------------------------------

    /// Inline-mode `FOR_ITER`: advance supported iterators in place,
    /// break out of the inline call for everything else.
    fn for_iter_inline(&mut self, instr: Instruction) -> ExecResult<Control> {
        let target = instr.arg as usize;
        let iterator = self.peek()?.clone();
        let VariableKind::Iter(iter) = iterator.kind() else {
            return Err(ExecError::BreakGraph(BreakReason::InlineUnsupported(
                "FOR_ITER over a non-iterator".to_string(),
            )));
        };
        if !iter.is_inline_supported() {
            return Err(ExecError::BreakGraph(BreakReason::ForLoopFallback));
        }
        match iter.next()? {
            Some(item) => {
                self.push(item)?;
            }
            None => {
                self.pop()?;
                self.lasti = target;
            }
        }
        Ok(Control::Advance)
    }

    /// Top-level `FOR_ITER`: try to unroll the whole loop through an
    /// inline call; fall back to the loop break protocol.
    fn for_iter_top(&mut self, instr: Instruction, deps: &mut TranslateDeps<'_>) -> ExecResult<Control> {
        let start = self.lasti - 1;
        let end = instr.arg as usize;
        let iterator = self.pop()?;
        let VariableKind::Iter(iter) = iterator.kind() else {
            return Err(ExecError::inner("FOR_ITER over a non-iterator"));
        };

        for i in start..end.min(self.code.instructions.len()) {
            if self.code.instructions[i].opcode == Opcode::ReturnValue {
                return Err(ExecError::not_implemented("found RETURN_VALUE in for loop body"));
            }
        }

        if iter.is_inline_supported() {
            let backup = iter.cursor();
            match self.inline_call_for_loop(&iterator, start, end, deps) {
                Ok(()) => {
                    self.lasti = end;
                    return Ok(Control::Advance);
                }
                Err(err @ (ExecError::BreakGraph(_) | ExecError::NotImplemented(_))) => {
                    debug!(error = %err, "inline loop failed, breaking graph");
                    iter.set_cursor(backup);
                }
                Err(other) => return Err(other),
            }
        }
        self.break_graph_in_for_loop(&iterator, start, deps)
            .map_err(break_emission_failure)?;
        Ok(Control::Stop)
    }

    /// Wraps the loop `[start, end)` into a synthesized function and
    /// descends into it, unrolling every iteration symbolically.
    fn inline_call_for_loop(
        &mut self,
        iterator: &Variable,
        start: usize,
        end: usize,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<()> {
        let (function, inputs) = self.graph.codegen.gen_for_loop_fn_between(start, end)?;
        let fn_var = Variable::new(
            VariableKind::Callable(CallableKind::UserFunction(function)),
            Tracker::Dangling,
        );
        let local_names = &inputs[..inputs.len() - 1];
        let mut args: Vec<Variable> = local_names
            .iter()
            .map(|name| {
                self.locals
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| Variable::wrap_literal(HostValue::None))
            })
            .collect();
        args.push(iterator.clone());
        let ret = call_variable(&fn_var, args, IndexMap::new(), self.graph, deps)?;
        let values = ret
            .get_items()
            .ok_or_else(|| ExecError::inner("loop function must return its locals as a tuple"))?;
        if values.len() != local_names.len() {
            return Err(ExecError::inner("loop function returned the wrong arity"));
        }
        for (name, value) in local_names.iter().zip(values) {
            value.set_debug_name(name);
            self.locals.insert(name.clone(), value);
        }
        Ok(())
    }

    /// Break protocol (c): compile the pre-loop graph, keep the
    /// `FOR_ITER` head inline, call a synthesized loop body per
    /// iteration, and tail-call the after-loop resume function.
    fn break_graph_in_for_loop(
        &mut self,
        iterator: &Variable,
        for_iter_idx: usize,
        deps: &mut TranslateDeps<'_>,
    ) -> ExecResult<()> {
        let instrs = &self.code.instructions;
        let for_iter = instrs[for_iter_idx];
        let loop_end = for_iter
            .jump_target()
            .ok_or_else(|| ExecError::inner("FOR_ITER without a jump target"))?;

        // Find where the loop body proper starts: walk forward from the
        // pushed item until the stack balances out.
        let mut body_start = for_iter_idx + 1;
        let mut depth: i32 = 1;
        loop {
            if body_start >= instrs.len() {
                return Err(ExecError::inner("can not balance stack in loop body"));
            }
            let cur = instrs[body_start];
            depth += cur.opcode.stack_effect(cur.arg, false);
            body_start += 1;
            if depth == 0 {
                break;
            }
        }

        let (loop_body, loop_inputs) = self.graph.codegen.gen_loop_body_between(for_iter_idx, body_start, loop_end)?;
        let after_loop = self.graph.codegen.gen_resume_fn_at(loop_end, self.stack.len())?;

        // 1. Compile the part before the loop, storing the loop's live
        // locals back under their own names.
        let local_inputs = &loop_inputs[..loop_inputs.len() - 1];
        let ret_pairs: Vec<(String, Variable)> = local_inputs
            .iter()
            .filter_map(|name| self.locals.get(name).map(|var| (name.clone(), var.clone())))
            .collect();
        let ret_vars: Vec<Variable> = ret_pairs.iter().map(|(_, var)| var.clone()).collect();
        self.graph
            .start_compile_no_push(&ret_vars, deps.segments, deps.meta)?;
        for (name, var) in &ret_pairs {
            var.reconstruct(&mut self.graph.codegen)?;
            self.graph.codegen.gen_store_fast(name);
        }
        // Loop locals with no binding yet (e.g. the loop variable itself)
        // get a placeholder so the loop-body call can load them.
        for name in local_inputs {
            if !self.locals.contains_key(name) {
                self.graph.codegen.gen_load_const(HostValue::None);
                self.graph.codegen.gen_store_fast(name);
            }
        }

        // 2. Load the iterator and replay the FOR_ITER head (item unpack
        // and stores) inline.
        iterator.reconstruct(&mut self.graph.codegen)?;
        let exit_label = self.graph.codegen.new_label();
        let loop_head = self.graph.codegen.instr_count();
        for instr in &instrs[for_iter_idx..body_start] {
            let jump = instr.jump_target().map(|_| JumpTarget::Label(exit_label));
            self.graph.codegen.copy_instr(*instr, &self.code, jump)?;
        }

        // 3. Call the loop body with its inputs plus the break flag, then
        // scatter the returned locals.
        self.graph
            .codegen
            .gen_load_object(HostValue::Function(Rc::clone(&loop_body)), &loop_body.name);
        for name in local_inputs {
            self.graph.codegen.gen_load_fast(name);
        }
        self.graph.codegen.gen_load_const(HostValue::Bool(true));
        self.graph
            .codegen
            .gen_call_function(u32::try_from(loop_inputs.len()).expect("argc fits u32"));
        self.graph
            .codegen
            .gen_unpack_sequence(u32::try_from(loop_inputs.len()).expect("arity fits u32"));
        for name in local_inputs {
            self.graph.codegen.gen_store_fast(name);
        }

        // 4. Loop control: break flag false leaves the loop, otherwise
        // jump back to the FOR_ITER head.
        self.graph.codegen.add_jump(Opcode::PopJumpIfFalse, exit_label);
        self.graph
            .codegen
            .add_instr(Opcode::JumpAbsolute, u32::try_from(loop_head).expect("loop head fits u32"));
        self.graph.codegen.bind_label(exit_label);
        self.graph.codegen.add_instr(Opcode::Nop, 0);

        // 5. Tail-call the after-loop resume function.
        match &after_loop {
            Some((function, input_names)) => {
                self.graph
                    .codegen
                    .gen_load_object(HostValue::Function(Rc::clone(function)), &function.name);
                let stack_snapshot = self.stack.clone();
                for var in &stack_snapshot {
                    var.reconstruct(&mut self.graph.codegen)?;
                }
                for name in input_names {
                    self.graph.codegen.gen_load_fast(name);
                }
                let argc = self.stack.len() + input_names.len();
                self.graph
                    .codegen
                    .gen_call_function(u32::try_from(argc).expect("argc fits u32"));
            }
            None => {
                let stack_snapshot = self.stack.clone();
                for var in &stack_snapshot {
                    var.reconstruct(&mut self.graph.codegen)?;
                }
            }
        }
        self.graph.codegen.gen_return();

        self.new_code = Some(Rc::new(self.graph.codegen.gen_code()));
        self.guard = Some(self.graph.guard_fn()?);
        Ok(())
    }
}

/// A failure while emitting break-recovery code falls back to default
/// evaluation rather than surfacing as a hard error.
fn break_emission_failure(err: ExecError) -> ExecError {
    match err {
        inner @ ExecError::Inner(_) => ExecError::NotImplemented(format!(
            "an exception occurred while processing the graph break, falling back ({inner})"
        )),
        other => other,
    }
}
