//! Symbolic descent into user-defined callees.
//!
//! An inline call runs the callee's bytecode in the caller's graph:
//! arguments bind against the declared signature with their trackers
//! preserved, the callee's globals/builtins/consts/closure are wrapped
//! with callee-rooted provenance, and any event the inline simulator
//! cannot translate in place surfaces as a graph break to the caller's
//! break site.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::{
    bytecode::CodeObject,
    engine::TranslateDeps,
    error::{ExecError, ExecResult},
    executor::OpcodeExecutor,
    graph::FunctionGraph,
    host::{FunctionObject, HostValue},
    tracker::Tracker,
    variables::{CallableKind, Variable, VariableKind},
};

/// Inline-executes a user-defined callee, returning its result variable.
pub fn inline_call(
    callee: &Variable,
    args: Vec<Variable>,
    kwargs: IndexMap<String, Variable>,
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> ExecResult<Variable> {
    let (function, default_vars, closure_vars) = match callee.kind() {
        VariableKind::Callable(CallableKind::UserFunction(function)) => {
            (Rc::clone(function), None, None)
        }
        VariableKind::Callable(CallableKind::ClosureFunction {
            function,
            defaults,
            closure,
        }) => (Rc::clone(function), Some(defaults.clone()), Some(closure.clone())),
        _ => {
            return Err(ExecError::inner("inline_call expects a user-defined callee"));
        }
    };
    let code = Rc::clone(&function.code);

    let locals = bind_arguments(&function, default_vars.as_deref(), args, kwargs, graph, deps)?;

    // Globals resolve through the callee, so the guard pins the function
    // the values were read from.
    let mut globals: IndexMap<String, Variable> = IndexMap::new();
    for (name, value) in function.globals.borrow().iter() {
        let tracker = Tracker::FunctionGlobal {
            function: callee.clone(),
            name: name.clone(),
        };
        globals.insert(name.clone(), deps.factory.from_value(value, graph, tracker));
    }

    let mut builtins: IndexMap<String, Variable> = IndexMap::new();
    for (name, value) in crate::host::builtins_env() {
        let tracker = Tracker::Builtin { name: name.clone() };
        builtins.insert(name.clone(), deps.factory.from_value(&value, graph, tracker));
    }

    let consts: Vec<Variable> = code
        .consts
        .iter()
        .map(|value| {
            deps.factory
                .from_value(value, graph, Tracker::Const { value: value.clone() })
        })
        .collect();

    let closure = prepare_closure(callee, &function, closure_vars, graph, deps);

    let globals_rc = Rc::clone(&function.globals);
    let mut executor = OpcodeExecutor::new_inline(graph, code, locals, globals, builtins, consts, closure, globals_rc);
    executor.run(deps)?;
    executor
        .take_return_value()
        .ok_or_else(|| ExecError::inner("inline call finished without a return value"))
}

/// Wraps the callee's closure cells with closure-slot provenance.
fn prepare_closure(
    callee: &Variable,
    function: &FunctionObject,
    closure_vars: Option<Vec<Variable>>,
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> Vec<Variable> {
    if let Some(vars) = closure_vars {
        // Cells captured during simulation keep their own provenance.
        return vars;
    }
    function
        .closure
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            let tracker = Tracker::FunctionClosure {
                function: callee.clone(),
                idx,
            };
            deps.factory.from_value(value, graph, tracker)
        })
        .collect()
}

/// Binds call arguments against the callee's declared signature.
///
/// Parameters fill from positionals, then keywords, then defaults;
/// excess positionals collect into `*args` and excess keywords into
/// `**kwargs` when declared. Argument trackers propagate unchanged;
/// defaults enter as constants.
fn bind_arguments(
    function: &FunctionObject,
    default_vars: Option<&[Variable]>,
    args: Vec<Variable>,
    mut kwargs: IndexMap<String, Variable>,
    graph: &mut FunctionGraph,
    deps: &mut TranslateDeps<'_>,
) -> ExecResult<IndexMap<String, Variable>> {
    let code: &CodeObject = &function.code;
    let argcount = code.argcount;
    let mut locals: IndexMap<String, Variable> = IndexMap::new();

    let defaults_len = default_vars.map_or(function.defaults.len(), <[Variable]>::len);
    let first_default = argcount.saturating_sub(defaults_len);

    for (position, name) in code.varnames[..argcount].iter().enumerate() {
        let value = if position < args.len() {
            args[position].clone()
        } else if let Some(value) = kwargs.shift_remove(name) {
            value
        } else if position >= first_default {
            let default_idx = position - first_default;
            match default_vars {
                Some(vars) => vars[default_idx].clone(),
                None => {
                    let value = function.defaults[default_idx].clone();
                    let tracker = Tracker::Const { value: value.clone() };
                    deps.factory.from_value(&value, graph, tracker)
                }
            }
        } else {
            return Err(ExecError::not_implemented(format!(
                "{}() missing required argument: '{name}'",
                function.name
            )));
        };
        value.set_debug_name(name);
        locals.insert(name.clone(), value);
    }

    let mut extra_positional: Vec<Variable> = args.get(argcount..).unwrap_or_default().to_vec();
    if code.has_varargs {
        let name = code.varnames[argcount].clone();
        let var = Variable::new(
            VariableKind::Tuple(std::cell::RefCell::new(extra_positional.clone())),
            Tracker::Dummy {
                inputs: extra_positional.clone(),
            },
        );
        var.set_debug_name(&name);
        locals.insert(name, var);
        extra_positional.clear();
    }
    if !extra_positional.is_empty() {
        return Err(ExecError::not_implemented(format!(
            "{}() takes {argcount} positional arguments but {} were given",
            function.name,
            args.len()
        )));
    }

    if code.has_varkw {
        let slot = argcount + usize::from(code.has_varargs);
        let name = code.varnames[slot].clone();
        let values: Vec<Variable> = kwargs.values().cloned().collect();
        let map: IndexMap<crate::host::DictKey, Variable> = kwargs
            .drain(..)
            .map(|(key, value)| (crate::host::DictKey::Str(key), value))
            .collect();
        let var = Variable::new(
            VariableKind::Dict(std::cell::RefCell::new(map)),
            Tracker::Dummy { inputs: values },
        );
        var.set_debug_name(&name);
        locals.insert(name, var);
    } else if let Some((name, _)) = kwargs.first() {
        return Err(ExecError::not_implemented(format!(
            "{}() got an unexpected keyword argument '{name}'",
            function.name
        )));
    }

    Ok(locals)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::variables::VariableFactory;

    fn function_with(argcount: usize, varnames: Vec<&str>, defaults: Vec<HostValue>, has_varargs: bool) -> FunctionObject {
        FunctionObject {
            name: "g".to_string(),
            code: Rc::new(CodeObject {
                name: "g".to_string(),
                instructions: Vec::new(),
                consts: Vec::new(),
                names: Vec::new(),
                varnames: varnames.into_iter().map(str::to_string).collect(),
                argcount,
                has_varargs,
                has_varkw: false,
                first_line: 1,
            }),
            globals: Rc::new(RefCell::new(IndexMap::new())),
            defaults,
            closure: Vec::new(),
        }
    }

    fn with_deps<R>(f: impl FnOnce(&mut FunctionGraph, &mut TranslateDeps<'_>) -> R) -> R {
        let mut graph = FunctionGraph::new("test");
        let mut meta = crate::meta::MetaCache::new();
        let mut segments = crate::graph::SegmentTable::new();
        let config = crate::config::Config::default();
        let factory = VariableFactory::new();
        let mut sim_stack = Vec::new();
        let mut deps = TranslateDeps {
            meta: &mut meta,
            segments: &mut segments,
            config: &config,
            factory: &factory,
            sim_stack: &mut sim_stack,
        };
        f(&mut graph, &mut deps)
    }

    #[test]
    fn test_bind_positional_preserves_tracker_identity() {
        with_deps(|graph, deps| {
            let function = function_with(2, vec!["a", "b"], Vec::new(), false);
            let x = Variable::wrap_literal(HostValue::Int(1));
            let y = Variable::wrap_literal(HostValue::Int(2));
            let locals =
                bind_arguments(&function, None, vec![x.clone(), y.clone()], IndexMap::new(), graph, deps)
                    .unwrap();
            assert_eq!(locals["a"], x);
            assert_eq!(locals["b"], y);
        });
    }

    #[test]
    fn test_bind_applies_defaults_from_tail() {
        with_deps(|graph, deps| {
            let function = function_with(2, vec!["a", "b"], vec![HostValue::Int(9)], false);
            let x = Variable::wrap_literal(HostValue::Int(1));
            let locals = bind_arguments(&function, None, vec![x], IndexMap::new(), graph, deps).unwrap();
            assert!(crate::host::values_equal(
                &locals["b"].get_value().unwrap(),
                &HostValue::Int(9)
            ));
        });
    }

    #[test]
    fn test_bind_collects_varargs() {
        with_deps(|graph, deps| {
            let function = function_with(1, vec!["a", "rest"], Vec::new(), true);
            let args = vec![
                Variable::wrap_literal(HostValue::Int(1)),
                Variable::wrap_literal(HostValue::Int(2)),
                Variable::wrap_literal(HostValue::Int(3)),
            ];
            let locals = bind_arguments(&function, None, args, IndexMap::new(), graph, deps).unwrap();
            let rest = locals["rest"].get_items().unwrap();
            assert_eq!(rest.len(), 2);
        });
    }

    #[test]
    fn test_bind_rejects_unknown_keyword() {
        with_deps(|graph, deps| {
            let function = function_with(1, vec!["a"], Vec::new(), false);
            let mut kwargs = IndexMap::new();
            kwargs.insert("zzz".to_string(), Variable::wrap_literal(HostValue::Int(1)));
            let result = bind_arguments(
                &function,
                None,
                vec![Variable::wrap_literal(HostValue::Int(1))],
                kwargs,
                graph,
                deps,
            );
            assert!(matches!(result, Err(ExecError::NotImplemented(_))));
        });
    }
}
