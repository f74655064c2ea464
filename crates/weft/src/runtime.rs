//! The reference virtual machine.
//!
//! A straightforward stack machine over [`HostValue`]s. It plays the part
//! of the host interpreter: before evaluating an eligible function call
//! it consults the engine's frame-evaluation hook and runs the returned
//! rewritten code instead of the original body. `CallSegment` resolves
//! through the engine's segment table.
//!
//! This VM is the crate's ground truth for semantic-equivalence testing;
//! it favors clarity over dispatch tricks.

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;
use tracing::trace;

use crate::{
    bytecode::{call_function_ex_flags, format_value_flags as fv, make_function_flags as mf, CodeObject, Opcode},
    engine::JitEngine,
    error::{ExecError, ExecResult},
    graph::SegmentId,
    host::{
        self, binary_op, compare_op, unary_op, Builtin, DictKey, Frame, FunctionObject, HostIter, HostValue,
        SliceValue,
    },
    ops::{BinOp, CmpOp, UnaryOp},
};

/// Evaluation fuel: a generous per-`run` instruction budget that turns a
/// miscompiled loop into a test failure instead of a hang.
const FUEL: usize = 1_000_000;

/// The reference interpreter, optionally JIT-enabled.
pub struct Vm {
    engine: Option<JitEngine>,
    fuel: usize,
}

impl Vm {
    /// A plain interpreter with no translation.
    #[must_use]
    pub fn new() -> Self {
        Self { engine: None, fuel: FUEL }
    }

    /// An interpreter whose function calls go through the eval hook.
    #[must_use]
    pub fn with_engine(engine: JitEngine) -> Self {
        Self {
            engine: Some(engine),
            fuel: FUEL,
        }
    }

    /// The engine, for cache inspection in tests.
    #[must_use]
    pub fn engine(&self) -> Option<&JitEngine> {
        self.engine.as_ref()
    }

    /// Calls a host function with positional arguments.
    pub fn call(&mut self, function: &Rc<FunctionObject>, args: Vec<HostValue>) -> ExecResult<HostValue> {
        self.fuel = FUEL;
        self.call_function(function, args, IndexMap::new())
    }

    fn call_function(
        &mut self,
        function: &Rc<FunctionObject>,
        args: Vec<HostValue>,
        kwargs: IndexMap<String, HostValue>,
    ) -> ExecResult<HostValue> {
        let locals = bind_host_arguments(function, args, kwargs)?;
        let mut frame = Frame::new(
            Rc::clone(&function.code),
            locals,
            Rc::clone(&function.globals),
            Rc::new(host::builtins_env()),
        );
        if let Some(engine) = self.engine.as_mut() {
            if let Some(custom) = engine.hook(&frame)? {
                trace!(code = %frame.code.name, rewritten = %custom.code.name, "running rewritten code");
                let code = custom.code;
                return self.eval(&code, &mut frame);
            }
        }
        let code = Rc::clone(&frame.code);
        self.eval(&code, &mut frame)
    }

    /// Evaluates `code` against a frame's scopes.
    fn eval(&mut self, code: &Rc<CodeObject>, frame: &mut Frame) -> ExecResult<HostValue> {
        let mut stack: Vec<HostValue> = Vec::new();
        let mut ip = 0usize;

        macro_rules! pop {
            () => {
                stack.pop().ok_or_else(|| ExecError::inner("vm stack underflow"))?
            };
        }

        loop {
            self.fuel = self
                .fuel
                .checked_sub(1)
                .ok_or_else(|| ExecError::inner("instruction budget exhausted"))?;
            let Some(instr) = code.instructions.get(ip).copied() else {
                return Err(ExecError::inner("vm instruction pointer out of range"));
            };
            ip += 1;

            match instr.opcode {
                Opcode::Nop => {}
                Opcode::PopTop => {
                    pop!();
                }
                Opcode::DupTop => {
                    let top = stack
                        .last()
                        .cloned()
                        .ok_or_else(|| ExecError::inner("vm stack underflow"))?;
                    stack.push(top);
                }
                Opcode::DupTopTwo => {
                    if stack.len() < 2 {
                        return Err(ExecError::inner("vm stack underflow"));
                    }
                    let pair = stack[stack.len() - 2..].to_vec();
                    stack.extend(pair);
                }
                Opcode::RotTwo => rot_n(&mut stack, 2)?,
                Opcode::RotThree => rot_n(&mut stack, 3)?,
                Opcode::RotFour => rot_n(&mut stack, 4)?,
                Opcode::RotN => rot_n(&mut stack, instr.arg as usize)?,

                Opcode::LoadConst => {
                    let value = code
                        .consts
                        .get(instr.arg as usize)
                        .cloned()
                        .ok_or_else(|| ExecError::inner("vm const operand out of range"))?;
                    stack.push(value);
                }
                Opcode::LoadFast => {
                    let name = varname(code, instr.arg)?;
                    let value = frame
                        .locals
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ExecError::inner(format!("local '{name}' referenced before assignment")))?;
                    stack.push(value);
                }
                Opcode::LoadGlobal => {
                    let name = name_at(code, instr.arg)?;
                    let value = frame
                        .globals
                        .borrow()
                        .get(name)
                        .cloned()
                        .or_else(|| frame.builtins.get(name).cloned())
                        .ok_or_else(|| ExecError::inner(format!("name '{name}' is not defined")))?;
                    stack.push(value);
                }
                Opcode::LoadName => {
                    let name = name_at(code, instr.arg)?;
                    let value = frame
                        .resolve(name)
                        .ok_or_else(|| ExecError::inner(format!("name '{name}' is not defined")))?;
                    stack.push(value);
                }
                Opcode::LoadBuiltin => {
                    let name = name_at(code, instr.arg)?;
                    let value = frame
                        .builtins
                        .get(name)
                        .cloned()
                        .ok_or_else(|| ExecError::inner(format!("builtin '{name}' is not defined")))?;
                    stack.push(value);
                }
                Opcode::StoreFast => {
                    let name = varname(code, instr.arg)?.to_string();
                    let value = pop!();
                    frame.locals.insert(name, value);
                }
                Opcode::StoreName => {
                    let name = name_at(code, instr.arg)?.to_string();
                    let value = pop!();
                    frame.locals.insert(name, value);
                }

                Opcode::LoadAttr => {
                    let name = name_at(code, instr.arg)?;
                    let obj = pop!();
                    stack.push(host::getattr(&obj, name)?);
                }
                Opcode::LoadMethod => {
                    let name = name_at(code, instr.arg)?;
                    let obj = pop!();
                    let attr = host::getattr(&obj, name)?;
                    if let HostValue::BoundMethod(bound) = &attr {
                        stack.push(HostValue::Builtin(bound.func));
                        stack.push(obj);
                    } else {
                        stack.push(HostValue::None);
                        stack.push(attr);
                    }
                }

                Opcode::UnaryPositive => un_op(&mut stack, UnaryOp::Pos)?,
                Opcode::UnaryNegative => un_op(&mut stack, UnaryOp::Neg)?,
                Opcode::UnaryInvert => un_op(&mut stack, UnaryOp::Invert)?,

                Opcode::BinaryPower | Opcode::InplacePower => bin_op(&mut stack, BinOp::Pow)?,
                Opcode::BinaryMultiply | Opcode::InplaceMultiply => bin_op(&mut stack, BinOp::Mul)?,
                Opcode::BinaryMatrixMultiply | Opcode::InplaceMatrixMultiply => bin_op(&mut stack, BinOp::MatMul)?,
                Opcode::BinaryFloorDivide | Opcode::InplaceFloorDivide => bin_op(&mut stack, BinOp::FloorDiv)?,
                Opcode::BinaryTrueDivide | Opcode::InplaceTrueDivide => bin_op(&mut stack, BinOp::TrueDiv)?,
                Opcode::BinaryModulo | Opcode::InplaceModulo => bin_op(&mut stack, BinOp::Mod)?,
                Opcode::BinaryAdd | Opcode::InplaceAdd => bin_op(&mut stack, BinOp::Add)?,
                Opcode::BinarySubtract | Opcode::InplaceSubtract => bin_op(&mut stack, BinOp::Sub)?,
                Opcode::BinaryLshift | Opcode::InplaceLshift => bin_op(&mut stack, BinOp::LShift)?,
                Opcode::BinaryRshift | Opcode::InplaceRshift => bin_op(&mut stack, BinOp::RShift)?,
                Opcode::BinaryAnd | Opcode::InplaceAnd => bin_op(&mut stack, BinOp::BitAnd)?,
                Opcode::BinaryOr | Opcode::InplaceOr => bin_op(&mut stack, BinOp::BitOr)?,
                Opcode::BinaryXor | Opcode::InplaceXor => bin_op(&mut stack, BinOp::BitXor)?,

                Opcode::CompareOp => {
                    let op = CmpOp::from_arg(instr.arg)
                        .ok_or_else(|| ExecError::inner("vm compare operand out of range"))?;
                    let rhs = pop!();
                    let lhs = pop!();
                    stack.push(compare_op(op, &lhs, &rhs)?);
                }
                Opcode::IsOp => {
                    let op = if instr.arg == 0 { CmpOp::Is } else { CmpOp::IsNot };
                    let rhs = pop!();
                    let lhs = pop!();
                    stack.push(compare_op(op, &lhs, &rhs)?);
                }

                Opcode::BinarySubscr => {
                    let key = pop!();
                    let container = pop!();
                    stack.push(host::getitem(&container, &key)?);
                }
                Opcode::StoreSubscr => {
                    let key = pop!();
                    let container = pop!();
                    let value = pop!();
                    host::setitem(&container, &key, value)?;
                }
                Opcode::DeleteSubscr => {
                    let key = pop!();
                    let container = pop!();
                    host::delitem(&container, &key)?;
                }

                Opcode::BuildList | Opcode::BuildTuple => {
                    let items = pop_n(&mut stack, instr.arg as usize)?;
                    if instr.opcode == Opcode::BuildList {
                        stack.push(HostValue::list(items));
                    } else {
                        stack.push(HostValue::tuple(items));
                    }
                }
                Opcode::BuildSet => {
                    return Err(ExecError::not_implemented("set construction is not modeled"));
                }
                Opcode::BuildMap => {
                    let flat = pop_n(&mut stack, instr.arg as usize * 2)?;
                    let mut pairs = Vec::with_capacity(instr.arg as usize);
                    for chunk in flat.chunks(2) {
                        let key = DictKey::from_value(&chunk[0])
                            .ok_or_else(|| ExecError::inner("unhashable dict key"))?;
                        pairs.push((key, chunk[1].clone()));
                    }
                    stack.push(HostValue::dict(pairs));
                }
                Opcode::BuildConstKeyMap => {
                    let keys = pop!();
                    let keys = host::iterable_items(&keys)?;
                    let values = pop_n(&mut stack, instr.arg as usize)?;
                    let pairs = keys
                        .iter()
                        .zip(values)
                        .map(|(key, value)| {
                            DictKey::from_value(key)
                                .map(|k| (k, value))
                                .ok_or_else(|| ExecError::inner("unhashable dict key"))
                        })
                        .collect::<ExecResult<Vec<_>>>()?;
                    stack.push(HostValue::dict(pairs));
                }
                Opcode::BuildString => {
                    let parts = pop_n(&mut stack, instr.arg as usize)?;
                    let mut out = String::new();
                    for part in parts {
                        let HostValue::Str(s) = part else {
                            return Err(ExecError::inner("BUILD_STRING operand is not a string"));
                        };
                        out.push_str(&s);
                    }
                    stack.push(HostValue::str(out));
                }
                Opcode::BuildSlice => {
                    let parts = pop_n(&mut stack, instr.arg as usize)?;
                    let bound = |value: &HostValue| -> ExecResult<Option<i64>> {
                        match value {
                            HostValue::None => Ok(None),
                            HostValue::Int(i) => Ok(Some(*i)),
                            other => Err(ExecError::inner(format!(
                                "slice bounds must be integers, not {}",
                                other.type_name()
                            ))),
                        }
                    };
                    stack.push(HostValue::Slice(Rc::new(SliceValue {
                        start: bound(&parts[0])?,
                        stop: bound(&parts[1])?,
                        step: if parts.len() == 3 { bound(&parts[2])? } else { None },
                    })));
                }
                Opcode::BuildListUnpack | Opcode::BuildTupleUnpack | Opcode::BuildTupleUnpackWithCall => {
                    let parts = pop_n(&mut stack, instr.arg as usize)?;
                    let mut items = Vec::new();
                    for part in &parts {
                        items.extend(host::iterable_items(part)?);
                    }
                    if instr.opcode == Opcode::BuildListUnpack {
                        stack.push(HostValue::list(items));
                    } else {
                        stack.push(HostValue::tuple(items));
                    }
                }
                Opcode::BuildMapUnpack | Opcode::BuildMapUnpackWithCall => {
                    let parts = pop_n(&mut stack, instr.arg as usize)?;
                    let check_repeats = instr.opcode == Opcode::BuildMapUnpackWithCall;
                    let mut merged: IndexMap<DictKey, HostValue> = IndexMap::new();
                    for part in &parts {
                        let HostValue::Dict(map) = part else {
                            return Err(ExecError::inner("map unpack of a non-dict"));
                        };
                        for (key, value) in map.borrow().iter() {
                            if check_repeats && merged.contains_key(key) {
                                return Err(ExecError::inner(format!("map unpack found repeated key {key}")));
                            }
                            merged.insert(key.clone(), value.clone());
                        }
                    }
                    stack.push(HostValue::Dict(Rc::new(RefCell::new(merged))));
                }

                Opcode::CallFunction => {
                    let args = pop_n(&mut stack, instr.arg as usize)?;
                    let callee = pop!();
                    let result = self.call_value(&callee, args, IndexMap::new())?;
                    stack.push(result);
                }
                Opcode::CallFunctionKw => {
                    let names = pop!();
                    let names = host::iterable_items(&names)?;
                    let kw_names: Vec<String> = names
                        .iter()
                        .map(|name| match name {
                            HostValue::Str(s) => Ok(s.to_string()),
                            _ => Err(ExecError::inner("keyword names must be strings")),
                        })
                        .collect::<ExecResult<_>>()?;
                    let mut all_args = pop_n(&mut stack, instr.arg as usize)?;
                    let callee = pop!();
                    let split = all_args.len() - kw_names.len();
                    let kw_values = all_args.split_off(split);
                    let kwargs: IndexMap<String, HostValue> = kw_names.into_iter().zip(kw_values).collect();
                    let result = self.call_value(&callee, all_args, kwargs)?;
                    stack.push(result);
                }
                Opcode::CallFunctionEx => {
                    let kwargs = if instr.arg & call_function_ex_flags::HAS_KWARGS != 0 {
                        let kwargs = pop!();
                        let HostValue::Dict(map) = kwargs else {
                            return Err(ExecError::inner("CALL_FUNCTION_EX kwargs must be a dict"));
                        };
                        let collected = map
                            .borrow()
                            .iter()
                            .map(|(key, value)| match key {
                                DictKey::Str(name) => Ok((name.clone(), value.clone())),
                                _ => Err(ExecError::inner("keywords must be strings")),
                            })
                            .collect::<ExecResult<IndexMap<String, HostValue>>>()?;
                        collected
                    } else {
                        IndexMap::new()
                    };
                    let args = pop!();
                    let args = host::iterable_items(&args)?;
                    let callee = pop!();
                    let result = self.call_value(&callee, args, kwargs)?;
                    stack.push(result);
                }
                Opcode::CallMethod => {
                    let mut args = pop_n(&mut stack, instr.arg as usize)?;
                    let self_slot = pop!();
                    let method_slot = pop!();
                    let result = match &method_slot {
                        HostValue::None => self.call_value(&self_slot, args, IndexMap::new())?,
                        HostValue::BoundMethod(bound) => {
                            let mut bound_args = vec![bound.receiver.clone()];
                            bound_args.append(&mut args);
                            host::call_builtin(bound.func, &bound_args)?
                        }
                        _ => {
                            let mut bound_args = vec![self_slot];
                            bound_args.append(&mut args);
                            self.call_value(&method_slot, bound_args, IndexMap::new())?
                        }
                    };
                    stack.push(result);
                }
                Opcode::MakeFunction => {
                    let flags = instr.arg;
                    let name = pop!();
                    let code_value = pop!();
                    let HostValue::Str(fn_name) = name else {
                        return Err(ExecError::inner("MAKE_FUNCTION name must be a string"));
                    };
                    let HostValue::Code(fn_code) = code_value else {
                        return Err(ExecError::inner("MAKE_FUNCTION expects a code object"));
                    };
                    let closure = if flags & mf::HAS_CLOSURE != 0 {
                        host::iterable_items(&pop!())?
                    } else {
                        Vec::new()
                    };
                    if flags & mf::HAS_ANNOTATIONS != 0 {
                        pop!();
                    }
                    if flags & mf::HAS_KWDEFAULTS != 0 {
                        return Err(ExecError::not_implemented("keyword-only defaults"));
                    }
                    let defaults = if flags & mf::HAS_DEFAULTS != 0 {
                        host::iterable_items(&pop!())?
                    } else {
                        Vec::new()
                    };
                    stack.push(HostValue::Function(Rc::new(FunctionObject {
                        name: fn_name.to_string(),
                        code: fn_code,
                        globals: Rc::clone(&frame.globals),
                        defaults,
                        closure,
                    })));
                }

                Opcode::GetIter => {
                    let source = pop!();
                    stack.push(make_iterator(&source)?);
                }
                Opcode::ForIter => {
                    let target = instr.arg as usize;
                    let HostValue::Iterator(iter) = stack
                        .last()
                        .cloned()
                        .ok_or_else(|| ExecError::inner("vm stack underflow"))?
                    else {
                        return Err(ExecError::inner("FOR_ITER over a non-iterator"));
                    };
                    let mut iter = iter.borrow_mut();
                    if iter.cursor < iter.items.len() {
                        let item = iter.items[iter.cursor].clone();
                        iter.cursor += 1;
                        drop(iter);
                        stack.push(item);
                    } else {
                        drop(iter);
                        pop!();
                        ip = target;
                    }
                }
                Opcode::UnpackSequence => {
                    let sequence = pop!();
                    let items = host::iterable_items(&sequence)?;
                    if items.len() != instr.arg as usize {
                        return Err(ExecError::inner("unpack arity mismatch"));
                    }
                    for item in items.into_iter().rev() {
                        stack.push(item);
                    }
                }

                Opcode::FormatValue => {
                    let spec = if instr.arg & fv::FVS_HAVE_SPEC != 0 {
                        let HostValue::Str(s) = pop!() else {
                            return Err(ExecError::inner("format spec must be a string"));
                        };
                        s.to_string()
                    } else {
                        String::new()
                    };
                    if !spec.is_empty() {
                        return Err(ExecError::not_implemented("non-empty format specs"));
                    }
                    let value = pop!();
                    let rendered = match instr.arg & fv::FVC_MASK {
                        fv::FVC_NONE | fv::FVC_STR => match &value {
                            HostValue::Str(s) => s.to_string(),
                            other => host::repr(other),
                        },
                        _ => host::repr(&value),
                    };
                    stack.push(HostValue::str(rendered));
                }

                Opcode::JumpForward | Opcode::JumpAbsolute => {
                    ip = instr.arg as usize;
                }
                Opcode::PopJumpIfFalse => {
                    let value = pop!();
                    if !value.truthy()? {
                        ip = instr.arg as usize;
                    }
                }
                Opcode::PopJumpIfTrue => {
                    let value = pop!();
                    if value.truthy()? {
                        ip = instr.arg as usize;
                    }
                }
                Opcode::JumpIfFalseOrPop => {
                    let value = stack
                        .last()
                        .cloned()
                        .ok_or_else(|| ExecError::inner("vm stack underflow"))?;
                    if value.truthy()? {
                        pop!();
                    } else {
                        ip = instr.arg as usize;
                    }
                }
                Opcode::JumpIfTrueOrPop => {
                    let value = stack
                        .last()
                        .cloned()
                        .ok_or_else(|| ExecError::inner("vm stack underflow"))?;
                    if value.truthy()? {
                        ip = instr.arg as usize;
                    } else {
                        pop!();
                    }
                }

                Opcode::ReturnValue => {
                    return Ok(pop!());
                }

                Opcode::DictUpdate => {
                    let other = pop!();
                    let target = stack_from_top(&stack, instr.arg as usize)?;
                    host::call_builtin(Builtin::DictUpdate, &[target, other])?;
                }
                Opcode::DictMerge => {
                    let other = pop!();
                    let target = stack_from_top(&stack, instr.arg as usize)?;
                    let (HostValue::Dict(target_map), HostValue::Dict(other_map)) = (&target, &other) else {
                        return Err(ExecError::inner("DICT_MERGE operands must be dicts"));
                    };
                    for key in other_map.borrow().keys() {
                        if target_map.borrow().contains_key(key) {
                            return Err(ExecError::inner(format!(
                                "got multiple values for keyword argument {key}"
                            )));
                        }
                    }
                    host::call_builtin(Builtin::DictUpdate, &[target, other])?;
                }
                Opcode::ListExtend => {
                    let other = pop!();
                    let target = stack_from_top(&stack, instr.arg as usize)?;
                    host::call_builtin(Builtin::ListExtend, &[target, other])?;
                }
                Opcode::ListToTuple => {
                    let list = pop!();
                    stack.push(HostValue::tuple(host::iterable_items(&list)?));
                }

                Opcode::CallSegment => {
                    let engine = self
                        .engine
                        .as_ref()
                        .ok_or_else(|| ExecError::inner("segment call without an engine"))?;
                    let segment = engine
                        .segments
                        .get(SegmentId(instr.arg))
                        .ok_or_else(|| ExecError::inner("segment id out of range"))?;
                    let inputs = pop_n(&mut stack, segment.inputs.len())?;
                    let outputs = segment.interpret(&inputs)?;
                    stack.extend(outputs);
                }
            }
        }
    }

    /// Invokes a callable host value.
    fn call_value(
        &mut self,
        callee: &HostValue,
        args: Vec<HostValue>,
        kwargs: IndexMap<String, HostValue>,
    ) -> ExecResult<HostValue> {
        match callee {
            HostValue::Builtin(builtin) => {
                if !kwargs.is_empty() {
                    return Err(ExecError::not_implemented("builtins take no keyword arguments"));
                }
                host::call_builtin(*builtin, &args)
            }
            HostValue::BoundMethod(bound) => {
                if !kwargs.is_empty() {
                    return Err(ExecError::not_implemented("methods take no keyword arguments"));
                }
                let mut bound_args = vec![bound.receiver.clone()];
                bound_args.extend(args);
                host::call_builtin(bound.func, &bound_args)
            }
            HostValue::Function(function) => self.call_function(function, args, kwargs),
            other => Err(ExecError::inner(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds concrete call arguments against a function's signature.
fn bind_host_arguments(
    function: &FunctionObject,
    args: Vec<HostValue>,
    mut kwargs: IndexMap<String, HostValue>,
) -> ExecResult<IndexMap<String, HostValue>> {
    let code = &function.code;
    let argcount = code.argcount;
    let mut locals: IndexMap<String, HostValue> = IndexMap::new();
    let first_default = argcount.saturating_sub(function.defaults.len());

    for (position, name) in code.varnames[..argcount].iter().enumerate() {
        let value = if position < args.len() {
            args[position].clone()
        } else if let Some(value) = kwargs.shift_remove(name) {
            value
        } else if position >= first_default {
            function.defaults[position - first_default].clone()
        } else {
            return Err(ExecError::inner(format!(
                "{}() missing required argument: '{name}'",
                function.name
            )));
        };
        locals.insert(name.clone(), value);
    }

    let extra: Vec<HostValue> = args.get(argcount..).unwrap_or_default().to_vec();
    if code.has_varargs {
        locals.insert(code.varnames[argcount].clone(), HostValue::tuple(extra));
    } else if !extra.is_empty() {
        return Err(ExecError::inner(format!(
            "{}() takes {argcount} positional arguments but {} were given",
            function.name,
            args.len()
        )));
    }
    if code.has_varkw {
        let slot = argcount + usize::from(code.has_varargs);
        let pairs: Vec<(DictKey, HostValue)> = kwargs.drain(..).map(|(k, v)| (DictKey::Str(k), v)).collect();
        locals.insert(code.varnames[slot].clone(), HostValue::dict(pairs));
    } else if let Some((name, _)) = kwargs.first() {
        return Err(ExecError::inner(format!(
            "{}() got an unexpected keyword argument '{name}'",
            function.name
        )));
    }
    Ok(locals)
}

/// `GET_ITER`: snapshots the source's items into a live iterator.
fn make_iterator(source: &HostValue) -> ExecResult<HostValue> {
    if let HostValue::Iterator(_) = source {
        return Ok(source.clone());
    }
    let items = match source {
        HostValue::Tensor(tensor) => {
            let Some(&leading) = tensor.shape().first() else {
                return Err(ExecError::inner("iteration over a rank-0 tensor"));
            };
            (0..leading)
                .map(|i| {
                    tensor
                        .index(i)
                        .map(|t| HostValue::tensor(t))
                        .map_err(|e| ExecError::inner(e.to_string()))
                })
                .collect::<ExecResult<Vec<_>>>()?
        }
        other => host::iterable_items(other)?,
    };
    Ok(HostValue::Iterator(Rc::new(RefCell::new(HostIter { items, cursor: 0 }))))
}

fn rot_n(stack: &mut Vec<HostValue>, n: usize) -> ExecResult<()> {
    if n < 2 {
        return Ok(());
    }
    if stack.len() < n {
        return Err(ExecError::inner("vm stack underflow on rotate"));
    }
    let top = stack.pop().expect("length checked");
    let at = stack.len() + 1 - n;
    stack.insert(at, top);
    Ok(())
}

fn pop_n(stack: &mut Vec<HostValue>, n: usize) -> ExecResult<Vec<HostValue>> {
    if stack.len() < n {
        return Err(ExecError::inner("vm stack underflow on pop_n"));
    }
    Ok(stack.split_off(stack.len() - n))
}

fn stack_from_top(stack: &[HostValue], depth: usize) -> ExecResult<HostValue> {
    if depth == 0 || stack.len() < depth {
        return Err(ExecError::inner("bad stack depth operand"));
    }
    Ok(stack[stack.len() - depth].clone())
}

fn bin_op(stack: &mut Vec<HostValue>, op: BinOp) -> ExecResult<()> {
    let rhs = stack.pop().ok_or_else(|| ExecError::inner("vm stack underflow"))?;
    let lhs = stack.pop().ok_or_else(|| ExecError::inner("vm stack underflow"))?;
    stack.push(binary_op(op, &lhs, &rhs)?);
    Ok(())
}

fn un_op(stack: &mut Vec<HostValue>, op: UnaryOp) -> ExecResult<()> {
    let operand = stack.pop().ok_or_else(|| ExecError::inner("vm stack underflow"))?;
    stack.push(unary_op(op, &operand)?);
    Ok(())
}

fn varname(code: &CodeObject, arg: u32) -> ExecResult<&str> {
    code.varname(arg)
        .ok_or_else(|| ExecError::inner("vm varname operand out of range"))
}

fn name_at(code: &CodeObject, arg: u32) -> ExecResult<&str> {
    code.name_at(arg)
        .ok_or_else(|| ExecError::inner("vm name operand out of range"))
}
