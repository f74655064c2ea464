//! Value provenance.
//!
//! Every variable on the simulated stack carries a tracker: a term
//! describing how to recover the value from the live frame. Trackers form
//! a DAG rooted in frame inputs (locals, globals, builtins, constants);
//! inputs are fixed at construction, so the DAG is acyclic by
//! construction.
//!
//! A tracker supports two duties: emitting bytecode that reloads the value
//! on the interpreter stack ([`Tracker::emit`]) and producing the guard
//! expression that certifies it ([`Tracker::stringify`] +
//! [`Tracker::frame_path`]).

use smallvec::smallvec;

use crate::{
    bytecode::Opcode,
    codegen::CodeGen,
    error::{ExecError, ExecResult},
    guard::{union_free_vars, FramePath, StringifyExpression},
    host::{repr, HostValue},
    variables::Variable,
};

/// How a simulated value was derived from the frame.
#[derive(Debug, Clone)]
pub enum Tracker {
    /// A frame local.
    Local { name: String },
    /// A frame global.
    Global { name: String },
    /// A builtin.
    Builtin { name: String },
    /// A literal from the code object's constant pool.
    Const { value: HostValue },
    /// `container[key]` with a literal key.
    GetItem { container: Variable, key: HostValue },
    /// `object.attr`.
    GetAttr { object: Variable, attr: String },
    /// `iter(source)`.
    GetIter { source: Variable },
    /// `function.__globals__[name]` for an inlined callee.
    FunctionGlobal { function: Variable, name: String },
    /// `function.__closure__[idx]` for an inlined callee.
    FunctionClosure { function: Variable, idx: usize },
    /// Synthesized during simulation; not recoverable from the frame.
    /// Holds the variables it was derived from.
    Dummy { inputs: Vec<Variable> },
    /// Temporary placeholder; must never be stored on the stack.
    Dangling,
}

impl Tracker {
    /// The variables this tracker was derived from.
    #[must_use]
    pub fn inputs(&self) -> Vec<Variable> {
        match self {
            Self::Local { .. } | Self::Global { .. } | Self::Builtin { .. } | Self::Const { .. } | Self::Dangling => {
                Vec::new()
            }
            Self::GetItem { container, .. } => vec![container.clone()],
            Self::GetAttr { object, .. } => vec![object.clone()],
            Self::GetIter { source } => vec![source.clone()],
            Self::FunctionGlobal { function, .. } | Self::FunctionClosure { function, .. } => {
                vec![function.clone()]
            }
            Self::Dummy { inputs } => inputs.clone(),
        }
    }

    /// Whether the traced value can be recovered from the frame.
    ///
    /// Derived trackers are only traceable when every ancestor is; a
    /// `GetItem` over a synthesized container cannot be recovered even
    /// though the subscript itself could be replayed.
    #[must_use]
    pub fn is_traceable(&self) -> bool {
        match self {
            Self::Dummy { .. } | Self::Dangling => false,
            _ => self.inputs().iter().all(|input| input.tracker().is_traceable()),
        }
    }

    /// Emits bytecode that reloads the traced value onto the stack.
    pub fn emit(&self, codegen: &mut CodeGen) -> ExecResult<()> {
        match self {
            Self::Local { name } => {
                codegen.gen_load_fast(name);
                Ok(())
            }
            Self::Global { name } => {
                codegen.gen_load_global(name);
                Ok(())
            }
            Self::Builtin { name } => {
                codegen.gen_load_builtin(name);
                Ok(())
            }
            Self::Const { value } => {
                codegen.gen_load_const(value.clone());
                Ok(())
            }
            Self::GetItem { container, key } => {
                container.reconstruct(codegen)?;
                codegen.gen_load_const(key.clone());
                codegen.gen_subscribe();
                Ok(())
            }
            Self::GetAttr { object, attr } => {
                object.reconstruct(codegen)?;
                codegen.gen_load_attr(attr);
                Ok(())
            }
            Self::GetIter { source } => {
                source.reconstruct(codegen)?;
                codegen.add_instr(Opcode::GetIter, 0);
                Ok(())
            }
            Self::FunctionGlobal { function, name } => {
                function.reconstruct(codegen)?;
                codegen.gen_load_attr("__globals__");
                codegen.gen_load_const(HostValue::str(name.clone()));
                codegen.gen_subscribe();
                Ok(())
            }
            Self::FunctionClosure { function, idx } => {
                function.reconstruct(codegen)?;
                codegen.gen_load_attr("__closure__");
                codegen.gen_load_const(HostValue::Int(
                    i64::try_from(*idx).map_err(|_| ExecError::inner("closure index overflows i64"))?,
                ));
                codegen.gen_subscribe();
                Ok(())
            }
            Self::Dummy { .. } | Self::Dangling => Err(ExecError::inner(
                "cannot emit a load for a non-traceable tracker",
            )),
        }
    }

    /// The guard expression recovering this value from the live frame.
    pub fn stringify(&self) -> ExecResult<StringifyExpression> {
        match self {
            Self::Local { name } => Ok(StringifyExpression::new(
                format!("frame.f_locals['{name}']"),
                smallvec!["frame".to_string()],
            )),
            Self::Global { name } => Ok(StringifyExpression::new(
                format!("frame.f_globals['{name}']"),
                smallvec!["frame".to_string()],
            )),
            Self::Builtin { name } => Ok(StringifyExpression::new(
                format!("frame.f_builtins['{name}']"),
                smallvec!["frame".to_string()],
            )),
            Self::Const { value } => Ok(StringifyExpression::closed(repr(value))),
            Self::GetItem { container, key } => {
                let inner = container.tracker().stringify()?;
                Ok(StringifyExpression::new(
                    format!("{}[{}]", inner.expr, repr(key)),
                    union_free_vars(&[&inner.free_vars]),
                ))
            }
            Self::GetAttr { object, attr } => {
                let inner = object.tracker().stringify()?;
                Ok(StringifyExpression::new(
                    format!("{}.{attr}", inner.expr),
                    union_free_vars(&[&inner.free_vars]),
                ))
            }
            Self::GetIter { source } => {
                let inner = source.tracker().stringify()?;
                Ok(StringifyExpression::new(
                    format!("iter({})", inner.expr),
                    union_free_vars(&[&inner.free_vars]),
                ))
            }
            Self::FunctionGlobal { function, name } => {
                let inner = function.tracker().stringify()?;
                Ok(StringifyExpression::new(
                    format!("{}.__globals__['{name}']", inner.expr),
                    union_free_vars(&[&inner.free_vars]),
                ))
            }
            Self::FunctionClosure { function, idx } => {
                let inner = function.tracker().stringify()?;
                Ok(StringifyExpression::new(
                    format!("{}.__closure__[{idx}]", inner.expr),
                    union_free_vars(&[&inner.free_vars]),
                ))
            }
            Self::Dummy { .. } | Self::Dangling => {
                Err(ExecError::inner("cannot stringify a non-traceable tracker"))
            }
        }
    }

    /// The structured accessor guard evaluation walks.
    pub fn frame_path(&self) -> ExecResult<FramePath> {
        match self {
            Self::Local { name } => Ok(FramePath::Local(name.clone())),
            Self::Global { name } => Ok(FramePath::Global(name.clone())),
            Self::Builtin { name } => Ok(FramePath::Builtin(name.clone())),
            Self::Const { value } => Ok(FramePath::Const(value.clone())),
            Self::GetItem { container, key } => Ok(FramePath::Item(
                Box::new(container.tracker().frame_path()?),
                key.clone(),
            )),
            Self::GetAttr { object, attr } => Ok(FramePath::Attr(
                Box::new(object.tracker().frame_path()?),
                attr.clone(),
            )),
            Self::GetIter { source } => Ok(FramePath::Iter(Box::new(source.tracker().frame_path()?))),
            Self::FunctionGlobal { function, name } => Ok(FramePath::FunctionGlobal(
                Box::new(function.tracker().frame_path()?),
                name.clone(),
            )),
            Self::FunctionClosure { function, idx } => Ok(FramePath::FunctionClosure(
                Box::new(function.tracker().frame_path()?),
                *idx,
            )),
            Self::Dummy { .. } | Self::Dangling => {
                Err(ExecError::inner("cannot derive a frame path for a non-traceable tracker"))
            }
        }
    }

    /// A debug name for values that never got one from a store.
    #[must_use]
    pub fn derived_debug_name(&self) -> Option<String> {
        match self {
            Self::Local { name } | Self::Global { name } | Self::Builtin { name } => Some(name.clone()),
            Self::GetItem { container, key } => Some(format!("{}[{}]", container.debug_name(), repr(key))),
            Self::GetAttr { object, attr } => Some(format!("{}.{attr}", object.debug_name())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::Variable;

    #[test]
    fn test_traceability_is_recursive() {
        let local = Variable::constant(HostValue::Int(1), Tracker::Local { name: "x".to_string() });
        let derived = Tracker::GetItem {
            container: local.clone(),
            key: HostValue::Int(0),
        };
        assert!(derived.is_traceable());

        let synthesized = Variable::constant(HostValue::Int(1), Tracker::Dummy { inputs: vec![] });
        let tainted = Tracker::GetItem {
            container: synthesized,
            key: HostValue::Int(0),
        };
        assert!(!tainted.is_traceable());
    }

    #[test]
    fn test_stringify_composes() {
        let local = Variable::constant(
            HostValue::list(vec![HostValue::Int(1)]),
            Tracker::Local { name: "xs".to_string() },
        );
        let tracker = Tracker::GetItem {
            container: local,
            key: HostValue::Int(0),
        };
        let expr = tracker.stringify().unwrap();
        assert_eq!(expr.expr, "frame.f_locals['xs'][0]");
        assert_eq!(expr.free_vars.as_slice(), ["frame"]);
    }

    #[test]
    fn test_dummy_refuses_guard_duties() {
        let tracker = Tracker::Dummy { inputs: Vec::new() };
        assert!(tracker.stringify().is_err());
        assert!(tracker.frame_path().is_err());
    }
}
