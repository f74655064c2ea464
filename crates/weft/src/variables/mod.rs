//! The variable model.
//!
//! Every value that flows through the simulated stack is wrapped in a
//! [`Variable`]: a shared handle around a tagged kind plus the tracker
//! recording how the value was derived from the frame. Identity is by
//! handle (`DUP_TOP` pushes the same variable twice), which is what the
//! topological input ordering and the globally-guarded set key on.

mod callable;
mod factory;
mod iter;

pub use callable::{call_builtin_variable, call_variable};
pub use factory::VariableFactory;
pub(crate) use factory::iterator_over;
pub use iter::IterKind;

use std::{
    cell::RefCell,
    fmt,
    rc::Rc,
    sync::atomic::{AtomicU32, Ordering},
};

use indexmap::IndexMap;

use crate::{
    bytecode::Opcode,
    codegen::CodeGen,
    error::{ExecError, ExecResult},
    graph::SymbolId,
    guard::{meta_check_expr, value_check_expr, CheckKind, GuardCheck},
    host::{Builtin, DictKey, FunctionObject, HostValue, SliceValue},
    meta::MetaInfo,
    tracker::Tracker,
};

static NEXT_VARIABLE_ID: AtomicU32 = AtomicU32::new(0);

/// A symbolic tensor: descriptor plus its IR symbol.
///
/// `materialized_as` is set once a compiled-segment call has stored this
/// tensor into a synthetic local, after which reconstruction loads that
/// local instead of failing.
#[derive(Debug)]
pub struct TensorInfo {
    pub meta: MetaInfo,
    pub sym: SymbolId,
    pub materialized_as: RefCell<Option<String>>,
}

/// Callable kinds.
#[derive(Debug)]
pub enum CallableKind {
    /// A host operator or builtin function.
    Builtin(Builtin),
    /// A user-defined function from the frame or a constant.
    UserFunction(Rc<FunctionObject>),
    /// A function built by `MAKE_FUNCTION` with a captured closure: the
    /// defaults and cells stay wrapped so their trackers propagate.
    ClosureFunction {
        function: Rc<FunctionObject>,
        defaults: Vec<Variable>,
        closure: Vec<Variable>,
    },
    /// An unbound function paired with the receiver it was loaded from.
    Method { function: Box<Variable>, receiver: Box<Variable> },
}

/// The tagged union behind every variable.
#[derive(Debug)]
pub enum VariableKind {
    /// A primitive literal: int, float, str, bool, or none.
    Constant(HostValue),
    /// A symbolic tensor; identity during simulation is the descriptor,
    /// never the concrete tensor.
    Tensor(TensorInfo),
    List(RefCell<Vec<Variable>>),
    Tuple(RefCell<Vec<Variable>>),
    Dict(RefCell<IndexMap<DictKey, Variable>>),
    /// A slice literal with constant bounds.
    Slice(SliceValue),
    /// An iterator over a source container.
    Iter(IterKind),
    Callable(CallableKind),
    /// Fallback wrapper for anything unrecognized.
    Object(HostValue),
    /// NULL placeholder (two-slot `LOAD_METHOD` protocol).
    Dummy,
}

struct VarInner {
    id: u32,
    kind: VariableKind,
    tracker: Tracker,
    debug_name: RefCell<Option<String>>,
}

/// A shared handle to a simulated value.
#[derive(Clone)]
pub struct Variable(Rc<VarInner>);

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for Variable {}

impl std::hash::Hash for Variable {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(id={}, name={})", self.kind_name(), self.0.id, self.debug_name())
    }
}

impl Variable {
    /// Wraps a kind with its tracker.
    #[must_use]
    pub fn new(kind: VariableKind, tracker: Tracker) -> Self {
        Self(Rc::new(VarInner {
            id: NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            tracker,
            debug_name: RefCell::new(None),
        }))
    }

    /// Wraps a literal as a constant variable.
    #[must_use]
    pub fn constant(value: HostValue, tracker: Tracker) -> Self {
        Self::new(VariableKind::Constant(value), tracker)
    }

    /// Wraps a literal with a `Const` tracker (it reconstructs as itself).
    #[must_use]
    pub fn wrap_literal(value: HostValue) -> Self {
        let tracker = Tracker::Const { value: value.clone() };
        Self::new(VariableKind::Constant(value), tracker)
    }

    /// The NULL placeholder pushed by the two-slot method protocol.
    #[must_use]
    pub fn dummy() -> Self {
        Self::new(VariableKind::Dummy, Tracker::Dangling)
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.0.id
    }

    #[must_use]
    pub fn kind(&self) -> &VariableKind {
        &self.0.kind
    }

    #[must_use]
    pub fn tracker(&self) -> &Tracker {
        &self.0.tracker
    }

    /// The short kind name used in diagnostics.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match &self.0.kind {
            VariableKind::Constant(_) => "ConstantVariable",
            VariableKind::Tensor(_) => "TensorVariable",
            VariableKind::List(_) => "ListVariable",
            VariableKind::Tuple(_) => "TupleVariable",
            VariableKind::Dict(_) => "DictVariable",
            VariableKind::Slice(_) => "SliceVariable",
            VariableKind::Iter(_) => "IterVariable",
            VariableKind::Callable(CallableKind::Builtin(_)) => "BuiltinVariable",
            VariableKind::Callable(CallableKind::UserFunction(_)) => "UserDefinedFunctionVariable",
            VariableKind::Callable(CallableKind::ClosureFunction { .. }) => "ClosureFunctionVariable",
            VariableKind::Callable(CallableKind::Method { .. }) => "MethodVariable",
            VariableKind::Object(_) => "ObjectVariable",
            VariableKind::Dummy => "DummyVariable",
        }
    }

    /// The debug name: explicitly set by stores, otherwise derived from
    /// the tracker.
    #[must_use]
    pub fn debug_name(&self) -> String {
        if let Some(name) = self.0.debug_name.borrow().as_ref() {
            return name.clone();
        }
        self.0.tracker.derived_debug_name().unwrap_or_else(|| "tmp_var".to_string())
    }

    pub fn set_debug_name(&self, name: impl Into<String>) {
        *self.0.debug_name.borrow_mut() = Some(name.into());
    }

    /// Whether this variable may be pushed onto the simulated stack.
    ///
    /// Dangling trackers are construction-time temporaries; only the NULL
    /// placeholder is exempt because the method-call protocol stores it.
    #[must_use]
    pub fn may_enter_stack(&self) -> bool {
        !matches!(self.0.tracker, Tracker::Dangling) || matches!(self.0.kind, VariableKind::Dummy)
    }

    /// Whether this is a tensor variable.
    #[must_use]
    pub fn is_tensor(&self) -> bool {
        matches!(self.0.kind, VariableKind::Tensor(_))
    }

    /// The tensor descriptor, for tensor variables.
    #[must_use]
    pub fn tensor_meta(&self) -> Option<MetaInfo> {
        match &self.0.kind {
            VariableKind::Tensor(info) => Some(info.meta.clone()),
            _ => None,
        }
    }

    /// The IR symbol, for tensor variables.
    #[must_use]
    pub fn tensor_sym(&self) -> Option<SymbolId> {
        match &self.0.kind {
            VariableKind::Tensor(info) => Some(info.sym),
            _ => None,
        }
    }

    /// Marks this tensor as stored in a synthetic local by a segment call.
    pub fn set_materialized(&self, name: &str) {
        if let VariableKind::Tensor(info) = &self.0.kind {
            *info.materialized_as.borrow_mut() = Some(name.to_string());
        }
    }

    /// The underlying host value.
    ///
    /// Fails with NotImplemented when the value is not materializable;
    /// notably synthetic tensors, iterators, and the NULL placeholder.
    pub fn get_value(&self) -> ExecResult<HostValue> {
        match &self.0.kind {
            VariableKind::Constant(value) | VariableKind::Object(value) => Ok(value.clone()),
            VariableKind::Tensor(_) => Err(ExecError::not_implemented(
                "cannot materialize a symbolic tensor during translation",
            )),
            VariableKind::List(items) => Ok(HostValue::list(
                items.borrow().iter().map(Self::get_value).collect::<ExecResult<_>>()?,
            )),
            VariableKind::Tuple(items) => Ok(HostValue::tuple(
                items.borrow().iter().map(Self::get_value).collect::<ExecResult<_>>()?,
            )),
            VariableKind::Dict(map) => Ok(HostValue::dict(
                map.borrow()
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), v.get_value()?)))
                    .collect::<ExecResult<_>>()?,
            )),
            VariableKind::Slice(slice) => Ok(HostValue::Slice(Rc::new(*slice))),
            VariableKind::Iter(_) => Err(ExecError::not_implemented("cannot materialize an iterator")),
            VariableKind::Callable(CallableKind::Builtin(b)) => Ok(HostValue::Builtin(*b)),
            VariableKind::Callable(CallableKind::UserFunction(f))
            | VariableKind::Callable(CallableKind::ClosureFunction { function: f, .. }) => {
                Ok(HostValue::Function(Rc::clone(f)))
            }
            VariableKind::Callable(CallableKind::Method { .. }) => {
                Err(ExecError::not_implemented("cannot materialize a bound method"))
            }
            VariableKind::Dummy => Err(ExecError::not_implemented("cannot materialize the NULL placeholder")),
        }
    }

    /// Host type name of the underlying value.
    #[must_use]
    pub fn get_type(&self) -> &'static str {
        match &self.0.kind {
            VariableKind::Constant(value) | VariableKind::Object(value) => value.type_name(),
            VariableKind::Tensor(_) => "Tensor",
            VariableKind::List(_) => "list",
            VariableKind::Tuple(_) => "tuple",
            VariableKind::Dict(_) => "dict",
            VariableKind::Slice(_) => "slice",
            VariableKind::Iter(_) => "iterator",
            VariableKind::Callable(CallableKind::Builtin(_)) => "builtin_function_or_method",
            VariableKind::Callable(CallableKind::Method { .. }) => "method",
            VariableKind::Callable(_) => "function",
            VariableKind::Dummy => "NULL",
        }
    }

    /// Host truthiness of the simulated value.
    pub fn truthy(&self) -> ExecResult<bool> {
        match &self.0.kind {
            VariableKind::List(items) => Ok(!items.borrow().is_empty()),
            VariableKind::Tuple(items) => Ok(!items.borrow().is_empty()),
            VariableKind::Dict(map) => Ok(!map.borrow().is_empty()),
            _ => self.get_value()?.truthy(),
        }
    }

    /// Emits bytecode rebuilding this value on the interpreter stack.
    ///
    /// Traceable variables replay their tracker; everything else rebuilds
    /// structurally (containers element-wise, tensors from their
    /// materialized local).
    pub fn reconstruct(&self, codegen: &mut CodeGen) -> ExecResult<()> {
        if !matches!(self.0.tracker, Tracker::Dummy { .. }) && self.0.tracker.is_traceable() {
            return self.0.tracker.emit(codegen);
        }
        self.reconstruct_structurally(codegen)
    }

    fn reconstruct_structurally(&self, codegen: &mut CodeGen) -> ExecResult<()> {
        match &self.0.kind {
            VariableKind::Constant(value) | VariableKind::Object(value) => {
                codegen.gen_load_const(value.clone());
                Ok(())
            }
            VariableKind::Tensor(info) => {
                let materialized = info.materialized_as.borrow();
                let Some(name) = materialized.as_ref() else {
                    return Err(ExecError::not_implemented(
                        "cannot reconstruct a tensor that no compiled segment materialized",
                    ));
                };
                codegen.gen_load_fast(name);
                Ok(())
            }
            VariableKind::List(items) => {
                let items = items.borrow();
                for item in items.iter() {
                    item.reconstruct(codegen)?;
                }
                codegen.add_instr(Opcode::BuildList, u32::try_from(items.len()).expect("list fits u32"));
                Ok(())
            }
            VariableKind::Tuple(items) => {
                let items = items.borrow();
                for item in items.iter() {
                    item.reconstruct(codegen)?;
                }
                codegen.add_instr(Opcode::BuildTuple, u32::try_from(items.len()).expect("tuple fits u32"));
                Ok(())
            }
            VariableKind::Dict(map) => {
                let map = map.borrow();
                for (key, value) in map.iter() {
                    codegen.gen_load_const(key.to_value());
                    value.reconstruct(codegen)?;
                }
                codegen.add_instr(Opcode::BuildMap, u32::try_from(map.len()).expect("dict fits u32"));
                Ok(())
            }
            VariableKind::Slice(slice) => {
                codegen.gen_load_const(HostValue::Slice(Rc::new(*slice)));
                Ok(())
            }
            VariableKind::Dummy => {
                // The NULL placeholder reconstructs as None; the rewritten
                // CALL_METHOD treats a None method slot as "call TOS".
                codegen.gen_load_const(HostValue::None);
                Ok(())
            }
            VariableKind::Callable(_) => {
                codegen.gen_load_const(self.get_value()?);
                Ok(())
            }
            VariableKind::Iter(iter) => match iter {
                // A fresh iterator over the rebuilt source; break sites
                // only reconstruct iterators whose cursor is still zero.
                IterKind::Enumerate { source, .. } => {
                    codegen.gen_load_builtin("enumerate");
                    source.reconstruct(codegen)?;
                    codegen.gen_call_function(1);
                    codegen.add_instr(Opcode::GetIter, 0);
                    Ok(())
                }
                other => {
                    other.source().reconstruct(codegen)?;
                    codegen.add_instr(Opcode::GetIter, 0);
                    Ok(())
                }
            },
        }
    }

    /// The child variables of a container, in order.
    #[must_use]
    pub fn get_items(&self) -> Option<Vec<Variable>> {
        match &self.0.kind {
            VariableKind::List(items) | VariableKind::Tuple(items) => Some(items.borrow().clone()),
            VariableKind::Dict(map) => Some(map.borrow().values().cloned().collect()),
            _ => None,
        }
    }

    /// Leaf sub-variables; containers recurse, leaves yield themselves.
    #[must_use]
    pub fn flatten_items(&self) -> Vec<Variable> {
        match self.get_items() {
            Some(items) => items.iter().flat_map(Self::flatten_items).collect(),
            None => vec![self.clone()],
        }
    }

    /// Traceable inputs one derivation step away.
    #[must_use]
    pub fn get_traceable_inputs(&self) -> Vec<Variable> {
        if self.0.tracker.is_traceable() {
            return Vec::new();
        }
        self.0
            .tracker
            .inputs()
            .into_iter()
            .filter(|v| v.tracker().is_traceable())
            .collect()
    }

    /// Topologically enumerates the traceable ancestors across the
    /// tracker DAG; a traceable variable is its own frontier.
    #[must_use]
    pub fn flatten_traceable_inputs(&self) -> Vec<Variable> {
        if self.0.tracker.is_traceable() {
            return vec![self.clone()];
        }
        let mut out = Vec::new();
        for input in self.0.tracker.inputs() {
            for v in input.flatten_traceable_inputs() {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }

    /// Builds the guard check certifying this variable's identity.
    ///
    /// Tensors guard their descriptor; everything else guards the literal
    /// value.
    pub fn make_stringify_guard(&self) -> ExecResult<GuardCheck> {
        if let VariableKind::Iter(iter) = &self.0.kind {
            // Iterator state is never guarded; the source container is.
            return iter.source().make_stringify_guard();
        }
        if !self.0.tracker.is_traceable() {
            return Err(ExecError::inner("cannot make a guard from a non-traceable variable"));
        }
        let traced = self.0.tracker.stringify()?;
        let path = self.0.tracker.frame_path()?;
        if let VariableKind::Tensor(info) = &self.0.kind {
            return Ok(GuardCheck {
                expr: crate::guard::StringifyExpression::new(
                    meta_check_expr(&traced, &info.meta),
                    traced.free_vars.clone(),
                ),
                kind: CheckKind::MetaMatch {
                    path,
                    expected: info.meta.clone(),
                },
            });
        }
        let expected = self.get_value()?;
        Ok(GuardCheck {
            expr: crate::guard::StringifyExpression::new(value_check_expr(&traced, &expected), traced.free_vars.clone()),
            kind: CheckKind::ValueEq { path, expected },
        })
    }

    /// Simulated subscript read.
    pub fn getitem(&self, key: &HostValue) -> ExecResult<Variable> {
        match &self.0.kind {
            VariableKind::List(items) | VariableKind::Tuple(items) => {
                let items = items.borrow();
                let idx = index_for(key, items.len())?;
                Ok(items[idx].clone())
            }
            VariableKind::Dict(map) => {
                let dict_key = DictKey::from_value(key)
                    .ok_or_else(|| ExecError::not_implemented(format!("unhashable key type: {}", key.type_name())))?;
                map.borrow()
                    .get(&dict_key)
                    .cloned()
                    .ok_or_else(|| ExecError::inner(format!("KeyError: {dict_key}")))
            }
            VariableKind::Tensor(_) => Err(ExecError::not_implemented("tensor subscripts are not traced")),
            _ => Err(ExecError::not_implemented(format!(
                "'{}' object is not subscriptable",
                self.get_type()
            ))),
        }
    }

    /// Simulated subscript write.
    pub fn setitem(&self, key: &HostValue, value: Variable) -> ExecResult<()> {
        match &self.0.kind {
            VariableKind::List(items) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let idx = index_for(key, len)?;
                items[idx] = value;
                Ok(())
            }
            VariableKind::Dict(map) => {
                let dict_key = DictKey::from_value(key)
                    .ok_or_else(|| ExecError::not_implemented(format!("unhashable key type: {}", key.type_name())))?;
                map.borrow_mut().insert(dict_key, value);
                Ok(())
            }
            _ => Err(ExecError::not_implemented(format!(
                "'{}' object does not support item assignment",
                self.get_type()
            ))),
        }
    }

    /// Simulated subscript delete.
    pub fn delitem(&self, key: &HostValue) -> ExecResult<()> {
        match &self.0.kind {
            VariableKind::List(items) => {
                let mut items = items.borrow_mut();
                let len = items.len();
                let idx = index_for(key, len)?;
                items.remove(idx);
                Ok(())
            }
            VariableKind::Dict(map) => {
                let dict_key = DictKey::from_value(key)
                    .ok_or_else(|| ExecError::not_implemented(format!("unhashable key type: {}", key.type_name())))?;
                map.borrow_mut()
                    .shift_remove(&dict_key)
                    .map(|_| ())
                    .ok_or_else(|| ExecError::inner(format!("KeyError: {dict_key}")))
            }
            _ => Err(ExecError::not_implemented(format!(
                "'{}' object does not support item deletion",
                self.get_type()
            ))),
        }
    }

    /// Simulated attribute access.
    ///
    /// Container method attributes become method variables binding the
    /// matching host builtin; tensor descriptor attributes become
    /// constants. The daughter variable always carries a `GetAttr`
    /// tracker.
    pub fn getattr(&self, name: &str) -> ExecResult<Variable> {
        let tracker = Tracker::GetAttr {
            object: self.clone(),
            attr: name.to_string(),
        };
        let method = |builtin: Builtin| -> Variable {
            // The unbound function shares the attribute's provenance so it
            // can sit on the stack through the two-slot method protocol.
            let function = Variable::new(
                VariableKind::Callable(CallableKind::Builtin(builtin)),
                tracker.clone(),
            );
            Variable::new(
                VariableKind::Callable(CallableKind::Method {
                    function: Box::new(function),
                    receiver: Box::new(self.clone()),
                }),
                tracker.clone(),
            )
        };
        match (&self.0.kind, name) {
            (VariableKind::Dict(_), "keys") => Ok(method(Builtin::DictKeys)),
            (VariableKind::Dict(_), "values") => Ok(method(Builtin::DictValues)),
            (VariableKind::Dict(_), "items") => Ok(method(Builtin::DictItems)),
            (VariableKind::Dict(_), "update") => Ok(method(Builtin::DictUpdate)),
            (VariableKind::List(_), "extend") => Ok(method(Builtin::ListExtend)),
            (VariableKind::List(_), "append") => Ok(method(Builtin::ListAppend)),
            (VariableKind::Tensor(info), "shape") => {
                let dims: Vec<Variable> = info
                    .meta
                    .shape
                    .iter()
                    .map(|&d| Variable::wrap_literal(HostValue::Int(d)))
                    .collect();
                Ok(Variable::new(VariableKind::List(RefCell::new(dims)), tracker))
            }
            (VariableKind::Tensor(info), "dtype") => Ok(Variable::constant(
                HostValue::str(info.meta.dtype.to_string()),
                tracker,
            )),
            (VariableKind::Tensor(info), "stop_gradient") => {
                Ok(Variable::constant(HostValue::Bool(info.meta.stop_gradient), tracker))
            }
            _ => {
                // Fall back to the host attribute of the concrete value.
                let value = self.get_value()?;
                let attr = crate::host::getattr(&value, name)?;
                if let HostValue::BoundMethod(bound) = &attr {
                    return Ok(method(bound.func));
                }
                Ok(Variable::constant(attr, tracker))
            }
        }
    }
}

fn index_for(key: &HostValue, len: usize) -> ExecResult<usize> {
    let idx = match key {
        HostValue::Bool(b) => i64::from(*b),
        HostValue::Int(i) => *i,
        _ => {
            return Err(ExecError::not_implemented(format!(
                "sequence indices must be integers, not {}",
                key.type_name()
            )))
        }
    };
    let len_i = i64::try_from(len).map_err(|_| ExecError::inner("sequence too long"))?;
    let idx = if idx < 0 { idx + len_i } else { idx };
    if idx < 0 || idx >= len_i {
        return Err(ExecError::inner(format!("index {idx} out of range for length {len}")));
    }
    Ok(usize::try_from(idx).expect("normalized index fits usize"))
}

/// Topologically sorts the traceable ancestors of `roots`.
///
/// Kahn-style zero-degree sweep over the union of the roots' flattened
/// traceable inputs, preserving first-seen order among ready variables so
/// segment input order is deterministic.
#[must_use]
pub fn topo_sort_vars(roots: &[Variable]) -> Vec<Variable> {
    let mut unique: Vec<Variable> = Vec::new();
    for root in roots {
        for var in root.flatten_traceable_inputs() {
            if !unique.contains(&var) {
                unique.push(var);
            }
        }
    }

    let mut ordered: Vec<Variable> = Vec::new();
    while ordered.len() < unique.len() {
        let mut progressed = false;
        for var in &unique {
            if ordered.contains(var) {
                continue;
            }
            let ready = var
                .get_traceable_inputs()
                .iter()
                .all(|input| !unique.contains(input) || ordered.contains(input));
            if ready {
                ordered.push(var.clone());
                progressed = true;
            }
        }
        // The tracker DAG is acyclic by construction; stalling means a bug.
        assert!(progressed, "cycle detected in tracker DAG");
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_by_handle() {
        let a = Variable::wrap_literal(HostValue::Int(1));
        let alias = a.clone();
        let b = Variable::wrap_literal(HostValue::Int(1));
        assert_eq!(a, alias);
        assert_ne!(a, b);
    }

    #[test]
    fn test_debug_name_prefers_store_name() {
        let var = Variable::constant(HostValue::Int(1), Tracker::Local { name: "x".to_string() });
        assert_eq!(var.debug_name(), "x");
        var.set_debug_name("y");
        assert_eq!(var.debug_name(), "y");
    }

    #[test]
    fn test_flatten_traceable_inputs_stops_at_traceable() {
        let leaf = Variable::constant(HostValue::Int(1), Tracker::Local { name: "x".to_string() });
        let derived = Variable::constant(
            HostValue::Int(2),
            Tracker::Dummy { inputs: vec![leaf.clone()] },
        );
        let doubly = Variable::constant(
            HostValue::Int(3),
            Tracker::Dummy { inputs: vec![derived.clone(), leaf.clone()] },
        );
        assert_eq!(doubly.flatten_traceable_inputs(), vec![leaf.clone()]);
        assert_eq!(leaf.flatten_traceable_inputs(), vec![leaf]);
    }

    #[test]
    fn test_topo_sort_orders_ancestors_first() {
        let a = Variable::constant(HostValue::Int(1), Tracker::Local { name: "a".to_string() });
        let b = Variable::constant(
            HostValue::list(vec![HostValue::Int(1)]),
            Tracker::GetItem {
                container: a.clone(),
                key: HostValue::Int(0),
            },
        );
        let root = Variable::constant(HostValue::Int(2), Tracker::Dummy { inputs: vec![b.clone()] });
        let sorted = topo_sort_vars(&[root]);
        let pos_a = sorted.iter().position(|v| *v == a);
        let pos_b = sorted.iter().position(|v| *v == b).unwrap();
        // b is traceable, so flattening stops there; a only appears if
        // reached, and when it does it must come first.
        if let Some(pos_a) = pos_a {
            assert!(pos_a < pos_b);
        }
    }

    #[test]
    fn test_getitem_dict_by_literal_key() {
        let value = Variable::wrap_literal(HostValue::Int(10));
        let dict = Variable::new(
            VariableKind::Dict(RefCell::new(
                [(DictKey::Str("k".to_string()), value.clone())].into_iter().collect(),
            )),
            Tracker::Dummy { inputs: vec![value.clone()] },
        );
        assert_eq!(dict.getitem(&HostValue::str("k")).unwrap(), value);
        assert!(dict.getitem(&HostValue::str("missing")).is_err());
    }

    #[test]
    fn test_dummy_may_enter_stack_despite_dangling_tracker() {
        let dummy = Variable::dummy();
        assert!(dummy.may_enter_stack());
        let plain = Variable::constant(HostValue::Int(1), Tracker::Dangling);
        assert!(!plain.may_enter_stack());
    }
}
