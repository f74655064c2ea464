//! Symbolic call dispatch.
//!
//! Every call the simulator models funnels through [`call_variable`]:
//! builtin operators record into the graph or fold, user-defined callees
//! descend into an inline executor, and methods re-dispatch with the
//! receiver prepended. Anything else is not callable and surfaces
//! NotImplemented, which the executor's break sites convert.

use indexmap::IndexMap;

use crate::{
    engine::TranslateDeps,
    error::{ExecError, ExecResult},
    executor::inline_call,
    graph::{FunctionGraph, SirValue},
    host::{self, Builtin, HostValue},
    meta::MetaOperand,
    ops::{CmpOp, TensorOp},
    tensor::DType,
    tracker::Tracker,
    variables::{CallableKind, IterKind, Variable, VariableKind},
};

/// Invokes a callee variable with simulated arguments.
pub fn call_variable(
    callee: &Variable,
    args: Vec<Variable>,
    kwargs: IndexMap<String, Variable>,
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> ExecResult<Variable> {
    match callee.kind() {
        VariableKind::Callable(CallableKind::Builtin(builtin)) => {
            if !kwargs.is_empty() {
                return Err(ExecError::not_implemented(format!(
                    "{builtin:?} does not take keyword arguments"
                )));
            }
            call_builtin_variable(*builtin, &args, graph, deps)
        }
        VariableKind::Callable(CallableKind::UserFunction(_))
        | VariableKind::Callable(CallableKind::ClosureFunction { .. }) => {
            inline_call(callee, args, kwargs, graph, deps)
        }
        VariableKind::Callable(CallableKind::Method { function, receiver }) => {
            let mut bound_args = Vec::with_capacity(args.len() + 1);
            bound_args.push((**receiver).clone());
            bound_args.extend(args);
            call_variable(function, bound_args, kwargs, graph, deps)
        }
        _ => Err(ExecError::not_implemented(format!(
            "'{}' object is not callable",
            callee.get_type()
        ))),
    }
}

/// Applies a builtin operator to simulated arguments.
///
/// Tensor operands record the op into the graph; all-concrete operands
/// fold through the host implementation and wrap the result with a
/// derivation tracker.
pub fn call_builtin_variable(
    builtin: Builtin,
    args: &[Variable],
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> ExecResult<Variable> {
    // Identity never dispatches to the tensor runtime.
    if let Builtin::Compare(op @ (CmpOp::Is | CmpOp::IsNot)) = builtin {
        return identity_compare(op, args);
    }

    let tensor_op = match builtin {
        Builtin::Binary(op) => Some(TensorOp::Binary(op)),
        Builtin::Unary(op) => Some(TensorOp::Unary(op)),
        Builtin::Compare(op) => Some(TensorOp::Compare(op)),
        Builtin::Grad => Some(TensorOp::Grad),
        _ => None,
    };
    if let Some(op) = tensor_op {
        if args.iter().any(Variable::is_tensor) {
            return record_tensor_op(op, args, graph, deps);
        }
    }

    match builtin {
        Builtin::GetItem => {
            let [container, key] = args else {
                return Err(ExecError::inner("getitem expects container and key"));
            };
            container.getitem(&key.get_value()?)
        }
        Builtin::SetItem => {
            let [container, key, value] = args else {
                return Err(ExecError::inner("setitem expects container, key, and value"));
            };
            container.setitem(&key.get_value()?, value.clone())?;
            Ok(Variable::wrap_literal(HostValue::None))
        }
        Builtin::DelItem => {
            let [container, key] = args else {
                return Err(ExecError::inner("delitem expects container and key"));
            };
            container.delitem(&key.get_value()?)?;
            Ok(Variable::wrap_literal(HostValue::None))
        }
        Builtin::GetAttr => {
            let [object, name] = args else {
                return Err(ExecError::inner("getattr expects object and name"));
            };
            let HostValue::Str(name) = name.get_value()? else {
                return Err(ExecError::inner("getattr name must be a string"));
            };
            object.getattr(&name)
        }
        Builtin::Len => {
            let [value] = args else {
                return Err(ExecError::inner("len expects one argument"));
            };
            let length = match value.kind() {
                VariableKind::List(items) | VariableKind::Tuple(items) => Some(items.borrow().len()),
                VariableKind::Dict(map) => Some(map.borrow().len()),
                VariableKind::Tensor(info) => info.meta.shape.first().map(|&d| d as usize),
                _ => None,
            };
            match length {
                Some(n) => Ok(Variable::new(
                    VariableKind::Constant(HostValue::Int(i64::try_from(n).expect("length fits i64"))),
                    Tracker::Dummy { inputs: vec![value.clone()] },
                )),
                None => fold(builtin, args, graph, deps),
            }
        }
        Builtin::Enumerate => {
            let [source] = args else {
                return Err(ExecError::inner("enumerate expects one argument"));
            };
            match source.kind() {
                VariableKind::List(_) | VariableKind::Tuple(_) => Ok(Variable::new(
                    VariableKind::Iter(IterKind::Enumerate {
                        source: source.clone(),
                        idx: std::cell::Cell::new(0),
                    }),
                    Tracker::Dummy { inputs: vec![source.clone()] },
                )),
                _ => Err(ExecError::not_implemented(format!(
                    "enumerate over '{}' is not traced",
                    source.get_type()
                ))),
            }
        }
        Builtin::DictKeys | Builtin::DictValues | Builtin::DictItems => {
            let [dict] = args else {
                return Err(ExecError::inner("dict view expects the receiver only"));
            };
            dict_view(builtin, dict)
        }
        Builtin::DictUpdate => {
            let [target, other] = args else {
                return Err(ExecError::inner("dict.update expects receiver and mapping"));
            };
            dict_update(target, other)?;
            Ok(Variable::wrap_literal(HostValue::None))
        }
        Builtin::ListExtend => {
            let [target, other] = args else {
                return Err(ExecError::inner("list.extend expects receiver and iterable"));
            };
            let VariableKind::List(items) = target.kind() else {
                return Err(ExecError::inner("list.extend receiver must be a list"));
            };
            let additions = other
                .get_items()
                .ok_or_else(|| ExecError::not_implemented(format!("'{}' is not iterable", other.get_type())))?;
            items.borrow_mut().extend(additions);
            Ok(Variable::wrap_literal(HostValue::None))
        }
        Builtin::ListAppend => {
            let [target, value] = args else {
                return Err(ExecError::inner("list.append expects receiver and value"));
            };
            let VariableKind::List(items) = target.kind() else {
                return Err(ExecError::inner("list.append receiver must be a list"));
            };
            items.borrow_mut().push(value.clone());
            Ok(Variable::wrap_literal(HostValue::None))
        }
        Builtin::ToTensor | Builtin::Full => literal_tensor(builtin, args, graph),
        _ => fold(builtin, args, graph, deps),
    }
}

/// Records a tensor op into the graph and wraps its outputs.
fn record_tensor_op(
    op: TensorOp,
    args: &[Variable],
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> ExecResult<Variable> {
    let mut operands = Vec::with_capacity(args.len());
    let mut meta_args = Vec::with_capacity(args.len());
    for arg in args {
        match arg.kind() {
            VariableKind::Tensor(info) => {
                operands.push(SirValue::Sym(info.sym));
                meta_args.push(MetaOperand::Meta(info.meta.clone()));
            }
            VariableKind::Constant(value) => {
                let (scalar, dtype) = match value {
                    HostValue::Bool(b) => (f64::from(u8::from(*b)), DType::Bool),
                    HostValue::Int(i) => (*i as f64, DType::Int64),
                    HostValue::Float(f) => (*f, DType::Float64),
                    _ => {
                        return Err(ExecError::not_implemented(format!(
                            "cannot mix '{}' into a tensor op",
                            value.type_name()
                        )))
                    }
                };
                operands.push(SirValue::Const(value.clone()));
                meta_args.push(MetaOperand::Scalar(scalar, dtype));
            }
            _ => {
                return Err(ExecError::not_implemented(format!(
                    "cannot mix '{}' into a tensor op",
                    arg.get_type()
                )))
            }
        }
    }

    let out_metas = deps.meta.infer(op, &meta_args)?;
    let syms = graph.record(op, operands, out_metas.clone());
    let outputs: Vec<Variable> = syms
        .into_iter()
        .zip(out_metas)
        .map(|(sym, meta)| {
            Variable::new(
                VariableKind::Tensor(crate::variables::TensorInfo {
                    meta,
                    sym,
                    materialized_as: std::cell::RefCell::new(None),
                }),
                Tracker::Dummy { inputs: args.to_vec() },
            )
        })
        .collect();
    if outputs.len() == 1 {
        Ok(outputs.into_iter().next().expect("length checked"))
    } else {
        Ok(Variable::new(
            VariableKind::Tuple(std::cell::RefCell::new(outputs)),
            Tracker::Dummy { inputs: args.to_vec() },
        ))
    }
}

/// Evaluates a tensor-creation builtin on constant arguments and records
/// the resulting literal so the segment can replay it.
fn literal_tensor(builtin: Builtin, args: &[Variable], graph: &mut FunctionGraph) -> ExecResult<Variable> {
    let values: Vec<HostValue> = args.iter().map(Variable::get_value).collect::<ExecResult<_>>()?;
    let HostValue::Tensor(tensor) = host::call_builtin(builtin, &values)? else {
        return Err(ExecError::inner(format!("{builtin:?} must produce a tensor")));
    };
    let meta = crate::meta::MetaInfo::from_tensor(&tensor);
    let sym = graph.record_literal(tensor, meta.clone());
    Ok(Variable::new(
        VariableKind::Tensor(crate::variables::TensorInfo {
            meta,
            sym,
            materialized_as: std::cell::RefCell::new(None),
        }),
        Tracker::Dummy { inputs: args.to_vec() },
    ))
}

/// Folds a builtin over concrete values and wraps the result.
fn fold(
    builtin: Builtin,
    args: &[Variable],
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> ExecResult<Variable> {
    let values: Vec<HostValue> = args.iter().map(Variable::get_value).collect::<ExecResult<_>>()?;
    let result = host::call_builtin(builtin, &values)?;
    Ok(deps.factory.from_value(
        &result,
        graph,
        Tracker::Dummy { inputs: args.to_vec() },
    ))
}

/// `is` / `is not` over simulated values.
///
/// Same handle is identical; distinct literals compare by value; a tensor
/// is never identical to a literal. Anything else is conservatively not
/// translatable.
fn identity_compare(op: CmpOp, args: &[Variable]) -> ExecResult<Variable> {
    let [lhs, rhs] = args else {
        return Err(ExecError::inner("identity comparison expects two operands"));
    };
    let identical = if lhs == rhs {
        true
    } else {
        match (lhs.kind(), rhs.kind()) {
            (VariableKind::Constant(a), VariableKind::Constant(b)) => host::values_identical(a, b),
            (VariableKind::Tensor(_), VariableKind::Constant(_))
            | (VariableKind::Constant(_), VariableKind::Tensor(_)) => false,
            _ => {
                return Err(ExecError::not_implemented(
                    "identity of non-literal objects is not traced",
                ))
            }
        }
    };
    let result = if op == CmpOp::Is { identical } else { !identical };
    Ok(Variable::new(
        VariableKind::Constant(HostValue::Bool(result)),
        Tracker::Dummy { inputs: args.to_vec() },
    ))
}

/// Builds the dict-view result for `keys`/`values`/`items`.
fn dict_view(builtin: Builtin, dict: &Variable) -> ExecResult<Variable> {
    let VariableKind::Dict(map) = dict.kind() else {
        return Err(ExecError::inner("dict view receiver must be a dict"));
    };
    let map = map.borrow();
    let children: Vec<Variable> = match builtin {
        Builtin::DictKeys => map.keys().map(|k| Variable::wrap_literal(k.to_value())).collect(),
        Builtin::DictValues => map.values().cloned().collect(),
        Builtin::DictItems => map
            .iter()
            .map(|(k, v)| {
                Variable::new(
                    VariableKind::Tuple(std::cell::RefCell::new(vec![
                        Variable::wrap_literal(k.to_value()),
                        v.clone(),
                    ])),
                    Tracker::Dummy { inputs: vec![v.clone()] },
                )
            })
            .collect(),
        _ => unreachable!("dict_view is only called for dict views"),
    };
    drop(map);
    Ok(Variable::new(
        VariableKind::List(std::cell::RefCell::new(children)),
        Tracker::Dummy { inputs: vec![dict.clone()] },
    ))
}

/// Merges one dict variable into another.
///
/// The mutation lands on the variable model only; it is never written
/// back to the host frame.
fn dict_update(target: &Variable, other: &Variable) -> ExecResult<()> {
    let VariableKind::Dict(target_map) = target.kind() else {
        return Err(ExecError::inner("dict.update receiver must be a dict"));
    };
    let VariableKind::Dict(other_map) = other.kind() else {
        return Err(ExecError::not_implemented("dict.update argument must be a dict"));
    };
    let additions: Vec<(crate::host::DictKey, Variable)> = other_map
        .borrow()
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    target_map.borrow_mut().extend(additions);
    Ok(())
}
