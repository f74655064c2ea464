//! The from-value factory.
//!
//! Wrapping a host value picks the first registration whose predicate
//! accepts it. Registrations form an ordered list; a registration may name
//! a *successor*, in which case it is tried before that successor, letting
//! specific matchers shadow generic ones. A terminal fallback wraps
//! anything unrecognized as an object variable.

use std::cell::{Cell, RefCell};

use ahash::AHashMap;

use crate::{
    graph::FunctionGraph,
    host::{DictKey, HostValue},
    meta::MetaInfo,
    tracker::Tracker,
    variables::{CallableKind, IterKind, TensorInfo, Variable, VariableKind},
};

/// A predicate-constructor pair: returns `None` to pass to the next
/// registration.
type FromValueFn = fn(&VariableFactory, &HostValue, &mut FunctionGraph, &Tracker) -> Option<Variable>;

struct Registration {
    from_value: FromValueFn,
}

/// Ordered registry of variable constructors.
pub struct VariableFactory {
    /// Try-order chains: `default` is the entry chain; other keys name a
    /// successor whose predecessors run first.
    chains: AHashMap<&'static str, Vec<&'static str>>,
    registrations: AHashMap<&'static str, Registration>,
}

impl Default for VariableFactory {
    fn default() -> Self {
        let mut factory = Self {
            chains: AHashMap::new(),
            registrations: AHashMap::new(),
        };
        factory.register("ConstantVariable", None, constant_from_value);
        factory.register("TensorVariable", None, tensor_from_value);
        factory.register("ListVariable", None, list_from_value);
        factory.register("TupleVariable", None, tuple_from_value);
        factory.register("DictVariable", None, dict_from_value);
        factory.register("SliceVariable", None, slice_from_value);
        // Bound methods are callables, but must be matched before the
        // generic callable constructor claims them.
        factory.register("MethodVariable", Some("CallableVariable"), method_from_value);
        factory.register("CallableVariable", None, callable_from_value);
        factory
    }
}

impl std::fmt::Debug for VariableFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VariableFactory")
    }
}

impl VariableFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&mut self, name: &'static str, successor: Option<&'static str>, from_value: FromValueFn) {
        self.registrations.insert(name, Registration { from_value });
        match successor {
            None => self.chains.entry("default").or_default().push(name),
            Some(successor) => self.chains.entry(successor).or_default().push(name),
        }
    }

    /// Wraps a host value, walking the registration chains.
    ///
    /// The first accepting constructor wins; if a registration is itself
    /// a successor of others, its predecessors are tried first. Anything
    /// unmatched becomes an object variable.
    pub fn from_value(&self, value: &HostValue, graph: &mut FunctionGraph, tracker: Tracker) -> Variable {
        if let Some(var) = self.find_var("default", value, graph, &tracker) {
            return var;
        }
        Variable::new(VariableKind::Object(value.clone()), tracker)
    }

    fn find_var(&self, chain: &str, value: &HostValue, graph: &mut FunctionGraph, tracker: &Tracker) -> Option<Variable> {
        let names = self.chains.get(chain)?.clone();
        for name in names {
            // Predecessors of this registration run first.
            if self.chains.contains_key(name) {
                if let Some(var) = self.find_var(name, value, graph, tracker) {
                    return Some(var);
                }
            }
            let registration = &self.registrations[name];
            if let Some(var) = (registration.from_value)(self, value, graph, tracker) {
                return Some(var);
            }
        }
        None
    }
}

fn constant_from_value(
    _factory: &VariableFactory,
    value: &HostValue,
    _graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    value
        .is_literal()
        .then(|| Variable::constant(value.clone(), tracker.clone()))
}

fn tensor_from_value(
    _factory: &VariableFactory,
    value: &HostValue,
    graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    let HostValue::Tensor(tensor) = value else {
        return None;
    };
    let meta = MetaInfo::from_tensor(tensor);
    let sym = graph.fresh_symbol(meta.clone());
    Some(Variable::new(
        VariableKind::Tensor(TensorInfo {
            meta,
            sym,
            materialized_as: RefCell::new(None),
        }),
        tracker.clone(),
    ))
}

fn list_from_value(
    factory: &VariableFactory,
    value: &HostValue,
    graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    let HostValue::List(items) = value else {
        return None;
    };
    let parent = Variable::new(VariableKind::List(RefCell::new(Vec::new())), tracker.clone());
    fill_sequence(factory, &parent, &items.borrow(), graph);
    Some(parent)
}

fn tuple_from_value(
    factory: &VariableFactory,
    value: &HostValue,
    graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    let HostValue::Tuple(items) = value else {
        return None;
    };
    let parent = Variable::new(VariableKind::Tuple(RefCell::new(Vec::new())), tracker.clone());
    fill_sequence(factory, &parent, items, graph);
    Some(parent)
}

/// Wraps sequence children with subscript provenance rooted at `parent`.
fn fill_sequence(factory: &VariableFactory, parent: &Variable, items: &[HostValue], graph: &mut FunctionGraph) {
    let children: Vec<Variable> = items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let tracker = Tracker::GetItem {
                container: parent.clone(),
                key: HostValue::Int(i64::try_from(i).expect("sequence index fits i64")),
            };
            factory.from_value(item, graph, tracker)
        })
        .collect();
    match parent.kind() {
        VariableKind::List(slot) | VariableKind::Tuple(slot) => *slot.borrow_mut() = children,
        _ => unreachable!("fill_sequence is only called on sequence parents"),
    }
}

fn dict_from_value(
    factory: &VariableFactory,
    value: &HostValue,
    graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    let HostValue::Dict(map) = value else {
        return None;
    };
    let parent = Variable::new(
        VariableKind::Dict(RefCell::new(indexmap::IndexMap::new())),
        tracker.clone(),
    );
    let children: Vec<(DictKey, Variable)> = map
        .borrow()
        .iter()
        .map(|(key, item)| {
            let child_tracker = Tracker::GetItem {
                container: parent.clone(),
                key: key.to_value(),
            };
            (key.clone(), factory.from_value(item, graph, child_tracker))
        })
        .collect();
    let VariableKind::Dict(slot) = parent.kind() else {
        unreachable!("parent was constructed as a dict");
    };
    *slot.borrow_mut() = children.into_iter().collect();
    Some(parent)
}

fn slice_from_value(
    _factory: &VariableFactory,
    value: &HostValue,
    _graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    let HostValue::Slice(slice) = value else {
        return None;
    };
    Some(Variable::new(VariableKind::Slice(**slice), tracker.clone()))
}

fn method_from_value(
    factory: &VariableFactory,
    value: &HostValue,
    graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    let HostValue::BoundMethod(bound) = value else {
        return None;
    };
    let function = Variable::new(
        VariableKind::Callable(CallableKind::Builtin(bound.func)),
        Tracker::Dangling,
    );
    let receiver = factory.from_value(&bound.receiver, graph, Tracker::Dummy { inputs: Vec::new() });
    Some(Variable::new(
        VariableKind::Callable(CallableKind::Method {
            function: Box::new(function),
            receiver: Box::new(receiver),
        }),
        tracker.clone(),
    ))
}

fn callable_from_value(
    _factory: &VariableFactory,
    value: &HostValue,
    _graph: &mut FunctionGraph,
    tracker: &Tracker,
) -> Option<Variable> {
    match value {
        HostValue::Function(function) => Some(Variable::new(
            VariableKind::Callable(CallableKind::UserFunction(std::rc::Rc::clone(function))),
            tracker.clone(),
        )),
        HostValue::Builtin(builtin) => Some(Variable::new(
            VariableKind::Callable(CallableKind::Builtin(*builtin)),
            tracker.clone(),
        )),
        _ => None,
    }
}

/// Wraps a freshly produced iterator over `source`.
#[must_use]
pub(crate) fn iterator_over(source: &Variable) -> Variable {
    let tracker = Tracker::GetIter { source: source.clone() };
    let kind = match source.kind() {
        VariableKind::List(_) | VariableKind::Tuple(_) => IterKind::Sequence {
            source: source.clone(),
            idx: Cell::new(0),
        },
        VariableKind::Dict(_) => IterKind::Dict {
            source: source.clone(),
            idx: Cell::new(0),
        },
        VariableKind::Tensor(_) => IterKind::Tensor { source: source.clone() },
        _ => IterKind::Opaque { source: source.clone() },
    };
    Variable::new(VariableKind::Iter(kind), tracker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::FunctionGraph;

    fn wrap(value: HostValue) -> Variable {
        let factory = VariableFactory::new();
        let mut graph = FunctionGraph::new("test");
        factory.from_value(&value, &mut graph, Tracker::Local { name: "x".to_string() })
    }

    #[test]
    fn test_literals_become_constants() {
        assert_eq!(wrap(HostValue::Int(3)).kind_name(), "ConstantVariable");
        assert_eq!(wrap(HostValue::None).kind_name(), "ConstantVariable");
        assert_eq!(wrap(HostValue::str("s")).kind_name(), "ConstantVariable");
    }

    #[test]
    fn test_containers_wrap_children_with_subscript_provenance() {
        let var = wrap(HostValue::list(vec![HostValue::Int(1), HostValue::Int(2)]));
        assert_eq!(var.kind_name(), "ListVariable");
        let items = var.get_items().unwrap();
        assert_eq!(items.len(), 2);
        let expr = items[1].tracker().stringify().unwrap();
        assert_eq!(expr.expr, "frame.f_locals['x'][1]");
    }

    #[test]
    fn test_tensor_gets_meta_and_symbol() {
        let var = wrap(HostValue::tensor(crate::tensor::Tensor::scalar(
            1.0,
            crate::tensor::DType::Int64,
        )));
        assert_eq!(var.kind_name(), "TensorVariable");
        assert!(var.tensor_meta().is_some());
        assert!(var.tensor_sym().is_some());
    }

    #[test]
    fn test_unrecognized_falls_back_to_object() {
        let code = std::rc::Rc::new(crate::bytecode::CodeObject {
            name: "f".to_string(),
            instructions: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            argcount: 0,
            has_varargs: false,
            has_varkw: false,
            first_line: 1,
        });
        let var = wrap(HostValue::Code(code));
        assert_eq!(var.kind_name(), "ObjectVariable");
    }
}
