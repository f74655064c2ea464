//! Guard predicates over live frames.
//!
//! A cached translation is only reusable when the frame it is asked to
//! replace still looks like the frame it was traced from. Each traced
//! value contributes one [`GuardCheck`]: a stringified expression (the
//! guard's identity, used for equality and logging) paired with a
//! structured [`FramePath`] accessor that the evaluator walks against the
//! live frame. Checks compose by conjunction.

use std::fmt;

use smallvec::SmallVec;

use crate::{
    host::{repr, values_equal, Frame, HostValue},
    meta::MetaInfo,
};

/// A structured accessor recovering a value from a live frame.
///
/// Mirrors the tracker DAG: roots read a scope, interior steps follow
/// subscripts, attributes, and function globals/closures.
#[derive(Debug, Clone)]
pub enum FramePath {
    Local(String),
    Global(String),
    Builtin(String),
    /// A literal embedded at trace time; resolution ignores the frame.
    Const(HostValue),
    /// `container[key]` with a literal key.
    Item(Box<FramePath>, HostValue),
    /// `object.attr`.
    Attr(Box<FramePath>, String),
    /// `iter(source)`; resolves to the source value; iterator state is
    /// never guarded, only the container it came from.
    Iter(Box<FramePath>),
    /// `fn.__globals__[name]`.
    FunctionGlobal(Box<FramePath>, String),
    /// `fn.__closure__[idx]`.
    FunctionClosure(Box<FramePath>, usize),
}

/// Failure while resolving a [`FramePath`] against a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardError(pub String);

impl fmt::Display for GuardError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "guard resolution failed: {}", self.0)
    }
}

impl FramePath {
    /// Recovers the traced value from `frame`.
    pub fn resolve(&self, frame: &Frame) -> Result<HostValue, GuardError> {
        match self {
            Self::Local(name) => frame
                .locals
                .get(name)
                .cloned()
                .ok_or_else(|| GuardError(format!("no local '{name}'"))),
            Self::Global(name) => frame
                .globals
                .borrow()
                .get(name)
                .cloned()
                .ok_or_else(|| GuardError(format!("no global '{name}'"))),
            Self::Builtin(name) => frame
                .builtins
                .get(name)
                .cloned()
                .ok_or_else(|| GuardError(format!("no builtin '{name}'"))),
            Self::Const(value) => Ok(value.clone()),
            Self::Item(container, key) => {
                let container = container.resolve(frame)?;
                crate::host::getitem(&container, key).map_err(|e| GuardError(e.to_string()))
            }
            Self::Attr(object, name) => {
                let object = object.resolve(frame)?;
                crate::host::getattr(&object, name).map_err(|e| GuardError(e.to_string()))
            }
            Self::Iter(source) => source.resolve(frame),
            Self::FunctionGlobal(function, name) => {
                let HostValue::Function(function) = function.resolve(frame)? else {
                    return Err(GuardError("function-global path through a non-function".to_string()));
                };
                let result = function
                    .globals
                    .borrow()
                    .get(name)
                    .cloned()
                    .ok_or_else(|| GuardError(format!("no global '{name}' on function '{}'", function.name)));
                result
            }
            Self::FunctionClosure(function, idx) => {
                let HostValue::Function(function) = function.resolve(frame)? else {
                    return Err(GuardError("function-closure path through a non-function".to_string()));
                };
                function
                    .closure
                    .get(*idx)
                    .cloned()
                    .ok_or_else(|| GuardError(format!("no closure cell {idx} on function '{}'", function.name)))
            }
        }
    }
}

/// Expression text plus the free variables it reads from the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringifyExpression {
    pub expr: String,
    pub free_vars: SmallVec<[String; 2]>,
}

impl StringifyExpression {
    #[must_use]
    pub fn new(expr: String, free_vars: SmallVec<[String; 2]>) -> Self {
        Self { expr, free_vars }
    }

    /// An expression with no frame dependencies.
    #[must_use]
    pub fn closed(expr: String) -> Self {
        Self {
            expr,
            free_vars: SmallVec::new(),
        }
    }
}

/// Merges free-variable sets, preserving first-seen order.
#[must_use]
pub fn union_free_vars(sets: &[&SmallVec<[String; 2]>]) -> SmallVec<[String; 2]> {
    let mut out: SmallVec<[String; 2]> = SmallVec::new();
    for set in sets {
        for name in set.iter() {
            if !out.iter().any(|existing| existing == name) {
                out.push(name.clone());
            }
        }
    }
    out
}

/// What a single guard check compares.
#[derive(Debug, Clone)]
pub enum CheckKind {
    /// The frame-resolved value must equal a literal snapshot.
    ValueEq { path: FramePath, expected: HostValue },
    /// The frame-resolved tensor's descriptor must match.
    MetaMatch { path: FramePath, expected: MetaInfo },
}

/// One conjunct of a guard.
#[derive(Debug, Clone)]
pub struct GuardCheck {
    pub expr: StringifyExpression,
    pub kind: CheckKind,
}

impl GuardCheck {
    fn holds(&self, frame: &Frame) -> Result<bool, GuardError> {
        match &self.kind {
            CheckKind::ValueEq { path, expected } => Ok(values_equal(&path.resolve(frame)?, expected)),
            CheckKind::MetaMatch { path, expected } => {
                let HostValue::Tensor(tensor) = path.resolve(frame)? else {
                    return Ok(false);
                };
                Ok(MetaInfo::from_tensor(&tensor) == *expected)
            }
        }
    }
}

/// A reusability predicate for one cached translation.
///
/// Two guards are considered equal iff their rendered expressions are
/// equal; the structured checks exist to make evaluation executable, the
/// text is the identity.
#[derive(Debug, Clone, Default)]
pub struct Guard {
    checks: Vec<GuardCheck>,
}

impl Guard {
    /// The guard that always holds.
    #[must_use]
    pub fn always_true() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(checks: Vec<GuardCheck>) -> Self {
        Self { checks }
    }

    /// Adds a conjunct, skipping checks whose expression is already
    /// present (idempotent composition).
    pub fn and(&mut self, check: GuardCheck) {
        if !self.checks.iter().any(|c| c.expr.expr == check.expr.expr) {
            self.checks.push(check);
        }
    }

    pub fn checks(&self) -> &[GuardCheck] {
        &self.checks
    }

    /// The rendered conjunction, e.g. for cache logging.
    #[must_use]
    pub fn expr(&self) -> String {
        if self.checks.is_empty() {
            return "True".to_string();
        }
        self.checks
            .iter()
            .map(|c| c.expr.expr.clone())
            .collect::<Vec<_>>()
            .join(" && ")
    }

    /// Evaluates the guard against a live frame.
    ///
    /// Resolution failures are reported as `Err` so the cache can log
    /// them; the cache treats any error as a failed guard and moves on.
    pub fn evaluate(&self, frame: &Frame) -> Result<bool, GuardError> {
        for check in &self.checks {
            if !check.holds(frame)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr())
    }
}

/// Renders the canonical check text `expr == literal`.
#[must_use]
pub fn value_check_expr(traced: &StringifyExpression, expected: &HostValue) -> String {
    format!("{} == {}", traced.expr, repr(expected))
}

/// Renders the canonical meta check text.
#[must_use]
pub fn meta_check_expr(traced: &StringifyExpression, expected: &MetaInfo) -> String {
    format!("MetaInfo({}) == {}", traced.expr, expected.guard_str())
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use indexmap::IndexMap;

    use super::*;
    use crate::{
        bytecode::CodeObject,
        tensor::{DType, Tensor},
    };

    fn empty_code() -> Rc<CodeObject> {
        Rc::new(CodeObject {
            name: "f".to_string(),
            instructions: Vec::new(),
            consts: Vec::new(),
            names: Vec::new(),
            varnames: Vec::new(),
            argcount: 0,
            has_varargs: false,
            has_varkw: false,
            first_line: 1,
        })
    }

    fn frame_with_local(name: &str, value: HostValue) -> Frame {
        let mut locals = IndexMap::new();
        locals.insert(name.to_string(), value);
        Frame::new(
            empty_code(),
            locals,
            Rc::new(std::cell::RefCell::new(IndexMap::new())),
            Rc::new(crate::host::builtins_env()),
        )
    }

    #[test]
    fn test_value_check() {
        let frame = frame_with_local("x", HostValue::Int(3));
        let check = GuardCheck {
            expr: StringifyExpression::closed("frame.f_locals['x'] == 3".to_string()),
            kind: CheckKind::ValueEq {
                path: FramePath::Local("x".to_string()),
                expected: HostValue::Int(3),
            },
        };
        let mut guard = Guard::always_true();
        guard.and(check);
        assert!(guard.evaluate(&frame).unwrap());

        let other = frame_with_local("x", HostValue::Int(4));
        assert!(!guard.evaluate(&other).unwrap());
    }

    #[test]
    fn test_meta_check_matches_descriptor_not_data() {
        let frame = frame_with_local("t", HostValue::tensor(Tensor::scalar(1.0, DType::Int64)));
        let check = GuardCheck {
            expr: StringifyExpression::closed("MetaInfo(frame.f_locals['t'])".to_string()),
            kind: CheckKind::MetaMatch {
                path: FramePath::Local("t".to_string()),
                expected: MetaInfo::new(Vec::new(), DType::Int64, true),
            },
        };
        let guard = Guard::new(vec![check]);
        assert!(guard.evaluate(&frame).unwrap());

        // Same descriptor, different data: still a hit.
        let other = frame_with_local("t", HostValue::tensor(Tensor::scalar(9.0, DType::Int64)));
        assert!(guard.evaluate(&other).unwrap());

        // Different dtype: a miss.
        let miss = frame_with_local("t", HostValue::tensor(Tensor::scalar(1.0, DType::Float32)));
        assert!(!guard.evaluate(&miss).unwrap());
    }

    #[test]
    fn test_missing_local_is_an_error_not_a_panic() {
        let frame = frame_with_local("x", HostValue::Int(1));
        let guard = Guard::new(vec![GuardCheck {
            expr: StringifyExpression::closed("frame.f_locals['gone']".to_string()),
            kind: CheckKind::ValueEq {
                path: FramePath::Local("gone".to_string()),
                expected: HostValue::Int(1),
            },
        }]);
        assert!(guard.evaluate(&frame).is_err());
    }

    #[test]
    fn test_and_deduplicates_by_expression() {
        let check = GuardCheck {
            expr: StringifyExpression::closed("frame.f_locals['x'] == 3".to_string()),
            kind: CheckKind::ValueEq {
                path: FramePath::Local("x".to_string()),
                expected: HostValue::Int(3),
            },
        };
        let mut guard = Guard::always_true();
        guard.and(check.clone());
        guard.and(check);
        assert_eq!(guard.checks().len(), 1);
    }

    #[test]
    fn test_union_free_vars_order_and_dedup() {
        let a: SmallVec<[String; 2]> = SmallVec::from_vec(vec!["x".to_string(), "y".to_string()]);
        let b: SmallVec<[String; 2]> = SmallVec::from_vec(vec!["y".to_string(), "z".to_string()]);
        let merged = union_free_vars(&[&a, &b]);
        assert_eq!(merged.as_slice(), ["x", "y", "z"]);
    }
}
