//! Host object model.
//!
//! The translator intercepts frames of a host interpreter; this module is
//! the crate's stand-in for that interpreter's object space. Immediate
//! values (`None`, `Bool`, `Int`, `Float`) are stored inline; containers
//! and tensors are shared handles so that a frame, the simulator's
//! snapshot of it, and emitted constants can all alias one value.
//!
//! NOTE: `Dict` preserves insertion order; iteration order is observable
//! through `keys`/`values`/`items` and must survive translation.

use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;
use strum::{Display, IntoStaticStr};

use crate::{
    bytecode::CodeObject,
    error::{ExecError, ExecResult},
    ops::{BinOp, CmpOp, UnaryOp},
    tensor::{DType, Tensor},
};

/// A hashable literal usable as a dict key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DictKey {
    None,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl DictKey {
    /// Converts a host value into a key, if it is a hashable literal.
    #[must_use]
    pub fn from_value(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::None => Some(Self::None),
            HostValue::Bool(b) => Some(Self::Bool(*b)),
            HostValue::Int(i) => Some(Self::Int(*i)),
            HostValue::Str(s) => Some(Self::Str(s.to_string())),
            _ => None,
        }
    }

    /// The key as a plain host value.
    #[must_use]
    pub fn to_value(&self) -> HostValue {
        match self {
            Self::None => HostValue::None,
            Self::Bool(b) => HostValue::Bool(*b),
            Self::Int(i) => HostValue::Int(*i),
            Self::Str(s) => HostValue::str(s.clone()),
        }
    }
}

impl fmt::Display for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", repr(&self.to_value()))
    }
}

/// Host operator functions the simulator wraps as builtin callables.
///
/// Arithmetic and comparison operators are members so that a recorded call
/// names exactly the operator it performs; the remainder are the host
/// builtins the simulator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
pub enum Builtin {
    #[strum(serialize = "operator")]
    Binary(BinOp),
    #[strum(serialize = "operator")]
    Unary(UnaryOp),
    #[strum(serialize = "operator")]
    Compare(CmpOp),
    #[strum(serialize = "getitem")]
    GetItem,
    #[strum(serialize = "setitem")]
    SetItem,
    #[strum(serialize = "delitem")]
    DelItem,
    #[strum(serialize = "getattr")]
    GetAttr,
    #[strum(serialize = "len")]
    Len,
    #[strum(serialize = "range")]
    Range,
    #[strum(serialize = "enumerate")]
    Enumerate,
    #[strum(serialize = "bool")]
    BoolCast,
    #[strum(serialize = "to_tensor")]
    ToTensor,
    #[strum(serialize = "full")]
    Full,
    #[strum(serialize = "grad")]
    Grad,
    #[strum(serialize = "dict.update")]
    DictUpdate,
    #[strum(serialize = "dict.keys")]
    DictKeys,
    #[strum(serialize = "dict.values")]
    DictValues,
    #[strum(serialize = "dict.items")]
    DictItems,
    #[strum(serialize = "list.extend")]
    ListExtend,
    #[strum(serialize = "list.append")]
    ListAppend,
}

/// A slice literal. Bounds are optional host integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SliceValue {
    pub start: Option<i64>,
    pub stop: Option<i64>,
    pub step: Option<i64>,
}

/// A user-defined host function.
#[derive(Debug)]
pub struct FunctionObject {
    pub name: String,
    pub code: Rc<CodeObject>,
    pub globals: Rc<RefCell<IndexMap<String, HostValue>>>,
    /// Default values for trailing positional parameters.
    pub defaults: Vec<HostValue>,
    /// Captured cell contents, indexed by closure slot.
    pub closure: Vec<HostValue>,
}

/// A host builtin bound to a receiver (e.g. `d.keys`).
#[derive(Debug)]
pub struct BoundMethod {
    pub func: Builtin,
    pub receiver: HostValue,
}

/// A materialized iterator, produced by `GET_ITER`.
///
/// The host protocol is snapshot-based: the source's items are captured
/// when the iterator is created, and `FOR_ITER` walks the cursor.
#[derive(Debug)]
pub struct HostIter {
    pub items: Vec<HostValue>,
    pub cursor: usize,
}

/// A value in the host interpreter's object space.
#[derive(Debug, Clone)]
pub enum HostValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<HostValue>>>),
    Tuple(Rc<Vec<HostValue>>),
    Dict(Rc<RefCell<IndexMap<DictKey, HostValue>>>),
    Slice(Rc<SliceValue>),
    Tensor(Rc<Tensor>),
    Function(Rc<FunctionObject>),
    Builtin(Builtin),
    BoundMethod(Rc<BoundMethod>),
    Code(Rc<CodeObject>),
    /// A live iterator; exists only on the operand stack.
    Iterator(Rc<RefCell<HostIter>>),
}

impl HostValue {
    /// Builds a string value.
    pub fn str(s: impl Into<String>) -> Self {
        Self::Str(Rc::from(s.into().into_boxed_str()))
    }

    /// Builds a list value.
    #[must_use]
    pub fn list(items: Vec<Self>) -> Self {
        Self::List(Rc::new(RefCell::new(items)))
    }

    /// Builds a tuple value.
    #[must_use]
    pub fn tuple(items: Vec<Self>) -> Self {
        Self::Tuple(Rc::new(items))
    }

    /// Builds a dict value from key/value pairs.
    #[must_use]
    pub fn dict(pairs: Vec<(DictKey, Self)>) -> Self {
        Self::Dict(Rc::new(RefCell::new(pairs.into_iter().collect())))
    }

    /// Builds a tensor value.
    #[must_use]
    pub fn tensor(t: Tensor) -> Self {
        Self::Tensor(Rc::new(t))
    }

    /// The host type name, used in diagnostics and guard expressions.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Dict(_) => "dict",
            Self::Slice(_) => "slice",
            Self::Tensor(_) => "Tensor",
            Self::Function(_) => "function",
            Self::Builtin(_) => "builtin_function_or_method",
            Self::BoundMethod(_) => "method",
            Self::Code(_) => "code",
            Self::Iterator(_) => "iterator",
        }
    }

    /// Whether this value is one of the primitive literal kinds.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        matches!(self, Self::None | Self::Bool(_) | Self::Int(_) | Self::Float(_) | Self::Str(_))
    }

    /// Host truthiness.
    pub fn truthy(&self) -> ExecResult<bool> {
        match self {
            Self::None => Ok(false),
            Self::Bool(b) => Ok(*b),
            Self::Int(i) => Ok(*i != 0),
            Self::Float(f) => Ok(*f != 0.0),
            Self::Str(s) => Ok(!s.is_empty()),
            Self::List(items) => Ok(!items.borrow().is_empty()),
            Self::Tuple(items) => Ok(!items.is_empty()),
            Self::Dict(map) => Ok(!map.borrow().is_empty()),
            Self::Tensor(t) => t.as_bool().map_err(|e| ExecError::inner(e.to_string())),
            _ => Ok(true),
        }
    }

    /// Host length, where defined.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        match self {
            Self::Str(s) => Some(s.chars().count()),
            Self::List(items) => Some(items.borrow().len()),
            Self::Tuple(items) => Some(items.len()),
            Self::Dict(map) => Some(map.borrow().len()),
            Self::Tensor(t) => t.shape().first().map(|&d| d as usize),
            _ => None,
        }
    }
}

/// Structural equality in host semantics.
///
/// Numbers compare across `Int`/`Float`/`Bool`; containers compare
/// elementwise; tensors compare by descriptor and data. Used by guards
/// and by the dict key paths, never for `is`.
#[must_use]
pub fn values_equal(a: &HostValue, b: &HostValue) -> bool {
    match (a, b) {
        (HostValue::None, HostValue::None) => true,
        (HostValue::Str(x), HostValue::Str(y)) => x == y,
        (HostValue::List(x), HostValue::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (HostValue::Tuple(x), HostValue::Tuple(y)) => {
            x.len() == y.len() && x.iter().zip(y.iter()).all(|(a, b)| values_equal(a, b))
        }
        (HostValue::Dict(x), HostValue::Dict(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        (HostValue::Slice(x), HostValue::Slice(y)) => x == y,
        (HostValue::Tensor(x), HostValue::Tensor(y)) => {
            x.shape() == y.shape() && x.dtype() == y.dtype() && x.data() == y.data()
        }
        (HostValue::Function(x), HostValue::Function(y)) => Rc::ptr_eq(x, y),
        (HostValue::Builtin(x), HostValue::Builtin(y)) => x == y,
        (HostValue::Code(x), HostValue::Code(y)) => Rc::ptr_eq(x, y),
        _ => match (numeric(a), numeric(b)) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
    }
}

/// Identity in host semantics (`is`): pointer identity for shared values,
/// value identity for immediates.
#[must_use]
pub fn values_identical(a: &HostValue, b: &HostValue) -> bool {
    match (a, b) {
        (HostValue::None, HostValue::None) => true,
        (HostValue::Bool(x), HostValue::Bool(y)) => x == y,
        (HostValue::Int(x), HostValue::Int(y)) => x == y,
        (HostValue::Str(x), HostValue::Str(y)) => Rc::ptr_eq(x, y) || x == y,
        (HostValue::List(x), HostValue::List(y)) => Rc::ptr_eq(x, y),
        (HostValue::Tuple(x), HostValue::Tuple(y)) => Rc::ptr_eq(x, y),
        (HostValue::Dict(x), HostValue::Dict(y)) => Rc::ptr_eq(x, y),
        (HostValue::Tensor(x), HostValue::Tensor(y)) => Rc::ptr_eq(x, y),
        (HostValue::Function(x), HostValue::Function(y)) => Rc::ptr_eq(x, y),
        (HostValue::Builtin(x), HostValue::Builtin(y)) => x == y,
        _ => false,
    }
}

fn numeric(v: &HostValue) -> Option<f64> {
    match v {
        HostValue::Bool(b) => Some(f64::from(u8::from(*b))),
        HostValue::Int(i) => Some(*i as f64),
        HostValue::Float(f) => Some(*f),
        _ => None,
    }
}

fn int_of(v: &HostValue) -> Option<i64> {
    match v {
        HostValue::Bool(b) => Some(i64::from(*b)),
        HostValue::Int(i) => Some(*i),
        _ => None,
    }
}

/// Coerces a number or one-element tensor to a tensor operand.
fn tensor_operand(v: &HostValue) -> Option<Tensor> {
    match v {
        HostValue::Tensor(t) => Some((**t).clone()),
        HostValue::Bool(b) => Some(Tensor::scalar(f64::from(u8::from(*b)), DType::Bool)),
        HostValue::Int(i) => Some(Tensor::scalar(*i as f64, DType::Int64)),
        HostValue::Float(f) => Some(Tensor::scalar(*f, DType::Float64)),
        _ => None,
    }
}

/// Applies a binary operator with host semantics.
pub fn binary_op(op: BinOp, lhs: &HostValue, rhs: &HostValue) -> ExecResult<HostValue> {
    // Tensor operands dominate: the other side is promoted to a scalar.
    if matches!(lhs, HostValue::Tensor(_)) || matches!(rhs, HostValue::Tensor(_)) {
        let (Some(a), Some(b)) = (tensor_operand(lhs), tensor_operand(rhs)) else {
            return Err(unsupported_binary(op, lhs, rhs));
        };
        let out = a.binary(op, &b).map_err(|e| ExecError::inner(e.to_string()))?;
        return Ok(HostValue::Tensor(Rc::new(out)));
    }

    match (op, lhs, rhs) {
        (BinOp::Add, HostValue::Str(a), HostValue::Str(b)) => Ok(HostValue::str(format!("{a}{b}"))),
        (BinOp::Mul, HostValue::Str(s), other) | (BinOp::Mul, other, HostValue::Str(s)) => {
            let n = int_of(other).ok_or_else(|| unsupported_binary(op, lhs, rhs))?;
            Ok(HostValue::str(s.repeat(usize::try_from(n.max(0)).unwrap_or(0))))
        }
        (BinOp::Add, HostValue::List(a), HostValue::List(b)) => {
            let mut items = a.borrow().clone();
            items.extend(b.borrow().iter().cloned());
            Ok(HostValue::list(items))
        }
        (BinOp::Add, HostValue::Tuple(a), HostValue::Tuple(b)) => {
            let mut items = (**a).clone();
            items.extend(b.iter().cloned());
            Ok(HostValue::tuple(items))
        }
        _ => numeric_binary(op, lhs, rhs),
    }
}

fn numeric_binary(op: BinOp, lhs: &HostValue, rhs: &HostValue) -> ExecResult<HostValue> {
    // Integer-only ops first.
    if let (Some(a), Some(b)) = (int_of(lhs), int_of(rhs)) {
        let int_result = match op {
            BinOp::Add => Some(a.wrapping_add(b)),
            BinOp::Sub => Some(a.wrapping_sub(b)),
            BinOp::Mul => Some(a.wrapping_mul(b)),
            BinOp::FloorDiv => {
                if b == 0 {
                    return Err(ExecError::inner("integer division by zero"));
                }
                Some(a.div_euclid(b))
            }
            BinOp::Mod => {
                if b == 0 {
                    return Err(ExecError::inner("integer modulo by zero"));
                }
                Some(a.rem_euclid(b))
            }
            BinOp::Pow if b >= 0 => Some(a.pow(u32::try_from(b).map_err(|_| ExecError::inner("exponent too large"))?)),
            BinOp::LShift => Some(a << b),
            BinOp::RShift => Some(a >> b),
            BinOp::BitAnd => Some(a & b),
            BinOp::BitOr => Some(a | b),
            BinOp::BitXor => Some(a ^ b),
            _ => None,
        };
        if let Some(v) = int_result {
            return Ok(HostValue::Int(v));
        }
    }

    let (Some(a), Some(b)) = (numeric(lhs), numeric(rhs)) else {
        return Err(unsupported_binary(op, lhs, rhs));
    };
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv => {
            if b == 0.0 {
                return Err(ExecError::inner("division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(ExecError::inner("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(ExecError::inner("float modulo by zero"));
            }
            a - (a / b).floor() * b
        }
        BinOp::Pow => a.powf(b),
        _ => return Err(unsupported_binary(op, lhs, rhs)),
    };
    Ok(HostValue::Float(result))
}

/// Applies a unary operator with host semantics.
pub fn unary_op(op: UnaryOp, value: &HostValue) -> ExecResult<HostValue> {
    if let HostValue::Tensor(t) = value {
        let out = t.unary(op).map_err(|e| ExecError::inner(e.to_string()))?;
        return Ok(HostValue::Tensor(Rc::new(out)));
    }
    match (op, value) {
        (UnaryOp::Pos, HostValue::Int(i)) => Ok(HostValue::Int(*i)),
        (UnaryOp::Pos, HostValue::Float(f)) => Ok(HostValue::Float(*f)),
        (UnaryOp::Neg, HostValue::Int(i)) => Ok(HostValue::Int(-i)),
        (UnaryOp::Neg, HostValue::Float(f)) => Ok(HostValue::Float(-f)),
        (UnaryOp::Neg, HostValue::Bool(b)) => Ok(HostValue::Int(-i64::from(*b))),
        (UnaryOp::Invert, v) => int_of(v)
            .map(|i| HostValue::Int(!i))
            .ok_or_else(|| ExecError::not_implemented(format!("bad operand type for unary ~: {}", value.type_name()))),
        _ => Err(ExecError::not_implemented(format!(
            "bad operand type for unary {op}: {}",
            value.type_name()
        ))),
    }
}

/// Applies a rich comparison with host semantics.
///
/// Tensor operands produce a bool tensor; everything else produces a host
/// bool. `is`/`is not` never dispatch to the tensor runtime.
pub fn compare_op(op: CmpOp, lhs: &HostValue, rhs: &HostValue) -> ExecResult<HostValue> {
    match op {
        CmpOp::Is => return Ok(HostValue::Bool(values_identical(lhs, rhs))),
        CmpOp::IsNot => return Ok(HostValue::Bool(!values_identical(lhs, rhs))),
        _ => {}
    }

    if matches!(lhs, HostValue::Tensor(_)) || matches!(rhs, HostValue::Tensor(_)) {
        let (Some(a), Some(b)) = (tensor_operand(lhs), tensor_operand(rhs)) else {
            return Err(ExecError::not_implemented(format!(
                "'{op}' not supported between {} and {}",
                lhs.type_name(),
                rhs.type_name()
            )));
        };
        let out = a.compare(op, &b).map_err(|e| ExecError::inner(e.to_string()))?;
        return Ok(HostValue::Tensor(Rc::new(out)));
    }

    match op {
        CmpOp::Eq => Ok(HostValue::Bool(values_equal(lhs, rhs))),
        CmpOp::Ne => Ok(HostValue::Bool(!values_equal(lhs, rhs))),
        _ => {
            let ord = ordering(lhs, rhs).ok_or_else(|| {
                ExecError::not_implemented(format!(
                    "'{op}' not supported between {} and {}",
                    lhs.type_name(),
                    rhs.type_name()
                ))
            })?;
            Ok(HostValue::Bool(op.holds(ord)))
        }
    }
}

fn ordering(lhs: &HostValue, rhs: &HostValue) -> Option<std::cmp::Ordering> {
    if let (Some(a), Some(b)) = (numeric(lhs), numeric(rhs)) {
        return a.partial_cmp(&b);
    }
    if let (HostValue::Str(a), HostValue::Str(b)) = (lhs, rhs) {
        return Some(a.cmp(b));
    }
    None
}

/// Host subscript read.
pub fn getitem(container: &HostValue, key: &HostValue) -> ExecResult<HostValue> {
    match (container, key) {
        (HostValue::List(items), _) if int_of(key).is_some() => {
            let items = items.borrow();
            index_sequence(&items, int_of(key).expect("checked above"))
        }
        (HostValue::Tuple(items), _) if int_of(key).is_some() => {
            index_sequence(items, int_of(key).expect("checked above"))
        }
        (HostValue::List(items), HostValue::Slice(s)) => {
            Ok(HostValue::list(slice_sequence(&items.borrow(), s)))
        }
        (HostValue::Tuple(items), HostValue::Slice(s)) => Ok(HostValue::tuple(slice_sequence(items, s))),
        (HostValue::Dict(map), _) => {
            let dict_key = DictKey::from_value(key)
                .ok_or_else(|| ExecError::not_implemented(format!("unhashable key type: {}", key.type_name())))?;
            map.borrow()
                .get(&dict_key)
                .cloned()
                .ok_or_else(|| ExecError::inner(format!("KeyError: {dict_key}")))
        }
        (HostValue::Str(s), _) if int_of(key).is_some() => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(int_of(key).expect("checked above"), chars.len())?;
            Ok(HostValue::str(chars[idx].to_string()))
        }
        (HostValue::Tensor(t), _) if int_of(key).is_some() => {
            let out = t
                .index(int_of(key).expect("checked above"))
                .map_err(|e| ExecError::inner(e.to_string()))?;
            Ok(HostValue::Tensor(Rc::new(out)))
        }
        _ => Err(ExecError::not_implemented(format!(
            "{} indices must be supported, not {}",
            container.type_name(),
            key.type_name()
        ))),
    }
}

/// Host subscript write.
pub fn setitem(container: &HostValue, key: &HostValue, value: HostValue) -> ExecResult<()> {
    match container {
        HostValue::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let idx = int_of(key).ok_or_else(|| {
                ExecError::not_implemented(format!("list indices must be integers, not {}", key.type_name()))
            })?;
            items[normalize_index(idx, len)?] = value;
            Ok(())
        }
        HostValue::Dict(map) => {
            let dict_key = DictKey::from_value(key)
                .ok_or_else(|| ExecError::not_implemented(format!("unhashable key type: {}", key.type_name())))?;
            map.borrow_mut().insert(dict_key, value);
            Ok(())
        }
        _ => Err(ExecError::not_implemented(format!(
            "{} does not support item assignment",
            container.type_name()
        ))),
    }
}

/// Host subscript delete.
pub fn delitem(container: &HostValue, key: &HostValue) -> ExecResult<()> {
    match container {
        HostValue::List(items) => {
            let mut items = items.borrow_mut();
            let len = items.len();
            let idx = int_of(key).ok_or_else(|| {
                ExecError::not_implemented(format!("list indices must be integers, not {}", key.type_name()))
            })?;
            items.remove(normalize_index(idx, len)?);
            Ok(())
        }
        HostValue::Dict(map) => {
            let dict_key = DictKey::from_value(key)
                .ok_or_else(|| ExecError::not_implemented(format!("unhashable key type: {}", key.type_name())))?;
            map.borrow_mut()
                .shift_remove(&dict_key)
                .map(|_| ())
                .ok_or_else(|| ExecError::inner(format!("KeyError: {dict_key}")))
        }
        _ => Err(ExecError::not_implemented(format!(
            "{} does not support item deletion",
            container.type_name()
        ))),
    }
}

fn index_sequence(items: &[HostValue], index: i64) -> ExecResult<HostValue> {
    Ok(items[normalize_index(index, items.len())?].clone())
}

fn normalize_index(index: i64, len: usize) -> ExecResult<usize> {
    let len_i = i64::try_from(len).map_err(|_| ExecError::inner("sequence too long"))?;
    let index = if index < 0 { index + len_i } else { index };
    if index < 0 || index >= len_i {
        return Err(ExecError::inner(format!("index {index} out of range for length {len}")));
    }
    Ok(usize::try_from(index).expect("normalized index fits usize"))
}

fn slice_sequence(items: &[HostValue], slice: &SliceValue) -> Vec<HostValue> {
    let len = i64::try_from(items.len()).unwrap_or(i64::MAX);
    let step = slice.step.unwrap_or(1);
    if step <= 0 {
        // Negative steps are rare in traced code; empty result keeps the
        // simulator honest without modeling the full protocol.
        return Vec::new();
    }
    let clamp = |v: i64| -> i64 {
        let v = if v < 0 { v + len } else { v };
        v.clamp(0, len)
    };
    let start = clamp(slice.start.unwrap_or(0));
    let stop = clamp(slice.stop.unwrap_or(len));
    let mut out = Vec::new();
    let mut idx = start;
    while idx < stop {
        out.push(items[usize::try_from(idx).expect("slice index fits usize")].clone());
        idx += step;
    }
    out
}

/// Host attribute access.
///
/// Bound methods come back as [`BoundMethod`] values; plain attributes as
/// their values. Unknown attributes are `Inner` errors, matching the
/// simulator's invariant that attribute names are resolved before use.
pub fn getattr(value: &HostValue, name: &str) -> ExecResult<HostValue> {
    match (value, name) {
        (HostValue::Dict(_), "keys") => Ok(bound(Builtin::DictKeys, value)),
        (HostValue::Dict(_), "values") => Ok(bound(Builtin::DictValues, value)),
        (HostValue::Dict(_), "items") => Ok(bound(Builtin::DictItems, value)),
        (HostValue::Dict(_), "update") => Ok(bound(Builtin::DictUpdate, value)),
        (HostValue::List(_), "extend") => Ok(bound(Builtin::ListExtend, value)),
        (HostValue::List(_), "append") => Ok(bound(Builtin::ListAppend, value)),
        (HostValue::Tensor(t), "shape") => Ok(HostValue::list(
            t.shape().iter().map(|&d| HostValue::Int(d)).collect(),
        )),
        (HostValue::Tensor(t), "dtype") => Ok(HostValue::str(t.dtype().to_string())),
        (HostValue::Tensor(t), "stop_gradient") => Ok(HostValue::Bool(t.stop_gradient())),
        (HostValue::Function(f), "__name__") => Ok(HostValue::str(f.name.clone())),
        (HostValue::Function(f), "__globals__") => Ok(HostValue::Dict(Rc::new(RefCell::new(
            f.globals
                .borrow()
                .iter()
                .map(|(k, v)| (DictKey::Str(k.clone()), v.clone()))
                .collect(),
        )))),
        (HostValue::Function(f), "__closure__") => Ok(HostValue::tuple(f.closure.clone())),
        _ => Err(ExecError::inner(format!(
            "'{}' object has no attribute '{name}'",
            value.type_name()
        ))),
    }
}

fn bound(func: Builtin, receiver: &HostValue) -> HostValue {
    HostValue::BoundMethod(Rc::new(BoundMethod {
        func,
        receiver: receiver.clone(),
    }))
}

/// The global builtin scope handed to every frame.
#[must_use]
pub fn builtins_env() -> IndexMap<String, HostValue> {
    [
        ("len", Builtin::Len),
        ("range", Builtin::Range),
        ("enumerate", Builtin::Enumerate),
        ("bool", Builtin::BoolCast),
        ("getattr", Builtin::GetAttr),
        ("to_tensor", Builtin::ToTensor),
        ("full", Builtin::Full),
        ("grad", Builtin::Grad),
    ]
    .into_iter()
    .map(|(name, b)| (name.to_string(), HostValue::Builtin(b)))
    .collect()
}

/// Renders a value as a host literal, for guard expressions and logs.
#[must_use]
pub fn repr(value: &HostValue) -> String {
    match value {
        HostValue::None => "None".to_string(),
        HostValue::Bool(true) => "True".to_string(),
        HostValue::Bool(false) => "False".to_string(),
        HostValue::Int(i) => i.to_string(),
        HostValue::Float(f) => format!("{f:?}"),
        HostValue::Str(s) => format!("'{}'", s.escape_default()),
        HostValue::List(items) => {
            let inner: Vec<String> = items.borrow().iter().map(repr).collect();
            format!("[{}]", inner.join(", "))
        }
        HostValue::Tuple(items) => {
            let inner: Vec<String> = items.iter().map(repr).collect();
            if inner.len() == 1 {
                format!("({},)", inner[0])
            } else {
                format!("({})", inner.join(", "))
            }
        }
        HostValue::Dict(map) => {
            let inner: Vec<String> = map.borrow().iter().map(|(k, v)| format!("{k}: {}", repr(v))).collect();
            format!("{{{}}}", inner.join(", "))
        }
        HostValue::Slice(s) => format!(
            "slice({}, {}, {})",
            opt_int(s.start),
            opt_int(s.stop),
            opt_int(s.step)
        ),
        HostValue::Tensor(t) => format!("Tensor(shape={:?}, dtype={})", t.shape(), t.dtype()),
        HostValue::Function(f) => format!("<function {}>", f.name),
        HostValue::Builtin(b) => format!("<builtin {b:?}>"),
        HostValue::BoundMethod(m) => format!("<bound method {:?}>", m.func),
        HostValue::Code(c) => format!("<code {}>", c.name),
        HostValue::Iterator(_) => "<iterator>".to_string(),
    }
}

fn opt_int(v: Option<i64>) -> String {
    v.map_or_else(|| "None".to_string(), |i| i.to_string())
}

/// Coerces a value usable as a sequence length or range bound.
pub fn to_index(value: &HostValue) -> ExecResult<i64> {
    match value {
        HostValue::Bool(b) => Ok(i64::from(*b)),
        HostValue::Int(i) => Ok(*i),
        HostValue::Tensor(t) if t.dtype().is_integral() => {
            let item = t.item().map_err(|e| ExecError::inner(e.to_string()))?;
            Ok(item as i64)
        }
        _ => Err(ExecError::not_implemented(format!(
            "'{}' object cannot be interpreted as an integer",
            value.type_name()
        ))),
    }
}

/// Materializes the items of an iterable value.
pub fn iterable_items(value: &HostValue) -> ExecResult<Vec<HostValue>> {
    match value {
        HostValue::List(items) => Ok(items.borrow().clone()),
        HostValue::Tuple(items) => Ok((**items).clone()),
        HostValue::Dict(map) => Ok(map.borrow().keys().map(DictKey::to_value).collect()),
        _ => Err(ExecError::not_implemented(format!(
            "'{}' object is not iterable",
            value.type_name()
        ))),
    }
}

fn parse_dtype(value: &HostValue) -> ExecResult<DType> {
    let HostValue::Str(name) = value else {
        return Err(ExecError::not_implemented(format!(
            "dtype must be a string, not {}",
            value.type_name()
        )));
    };
    Ok(match &**name {
        "bool" => DType::Bool,
        "int32" => DType::Int32,
        "int64" => DType::Int64,
        "float32" => DType::Float32,
        "float64" => DType::Float64,
        other => return Err(ExecError::not_implemented(format!("unknown dtype '{other}'"))),
    })
}

/// Applies a host builtin to concrete values.
///
/// Shared by the reference VM and the simulator's constant folding: when
/// every operand of a recorded call is a concrete (non-tensor-symbol)
/// value, the simulator evaluates through the same path the VM would.
pub fn call_builtin(builtin: Builtin, args: &[HostValue]) -> ExecResult<HostValue> {
    let arity = |n: usize| -> ExecResult<()> {
        if args.len() == n {
            Ok(())
        } else {
            Err(ExecError::inner(format!(
                "{builtin:?} expects {n} argument(s), got {}",
                args.len()
            )))
        }
    };
    match builtin {
        Builtin::Binary(op) => {
            arity(2)?;
            binary_op(op, &args[0], &args[1])
        }
        Builtin::Unary(op) => {
            arity(1)?;
            unary_op(op, &args[0])
        }
        Builtin::Compare(op) => {
            arity(2)?;
            compare_op(op, &args[0], &args[1])
        }
        Builtin::GetItem => {
            arity(2)?;
            getitem(&args[0], &args[1])
        }
        Builtin::SetItem => {
            arity(3)?;
            setitem(&args[0], &args[1], args[2].clone())?;
            Ok(HostValue::None)
        }
        Builtin::DelItem => {
            arity(2)?;
            delitem(&args[0], &args[1])?;
            Ok(HostValue::None)
        }
        Builtin::GetAttr => {
            arity(2)?;
            let HostValue::Str(name) = &args[1] else {
                return Err(ExecError::inner("getattr name must be a string"));
            };
            getattr(&args[0], name)
        }
        Builtin::Len => {
            arity(1)?;
            args[0]
                .length()
                .map(|n| HostValue::Int(i64::try_from(n).expect("length fits i64")))
                .ok_or_else(|| ExecError::not_implemented(format!("object of type '{}' has no len()", args[0].type_name())))
        }
        Builtin::Range => {
            if args.is_empty() || args.len() > 3 {
                return Err(ExecError::inner("range expects 1 to 3 arguments"));
            }
            let bounds: Vec<i64> = args.iter().map(to_index).collect::<ExecResult<_>>()?;
            let (start, stop, step) = match bounds.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => unreachable!("length checked above"),
            };
            if step == 0 {
                return Err(ExecError::inner("range() arg 3 must not be zero"));
            }
            let mut items = Vec::new();
            let mut current = start;
            while (step > 0 && current < stop) || (step < 0 && current > stop) {
                items.push(HostValue::Int(current));
                current += step;
            }
            Ok(HostValue::list(items))
        }
        Builtin::Enumerate => {
            arity(1)?;
            let items = iterable_items(&args[0])?;
            Ok(HostValue::list(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| HostValue::tuple(vec![HostValue::Int(i64::try_from(i).expect("index fits i64")), v]))
                    .collect(),
            ))
        }
        Builtin::BoolCast => {
            arity(1)?;
            Ok(HostValue::Bool(args[0].truthy()?))
        }
        Builtin::ToTensor => {
            if args.is_empty() || args.len() > 2 {
                return Err(ExecError::inner("to_tensor expects 1 or 2 arguments"));
            }
            let dtype = match (args.get(1), &args[0]) {
                (Some(d), _) => parse_dtype(d)?,
                (None, HostValue::Float(_)) => DType::Float64,
                (None, HostValue::Bool(_)) => DType::Bool,
                _ => DType::Int64,
            };
            match &args[0] {
                HostValue::Tensor(t) => Ok(HostValue::Tensor(Rc::clone(t))),
                v if numeric(v).is_some() => Ok(HostValue::tensor(Tensor::scalar(
                    numeric(v).expect("checked above"),
                    dtype,
                ))),
                HostValue::List(items) => {
                    let data: Vec<f64> = items
                        .borrow()
                        .iter()
                        .map(|v| numeric(v).ok_or_else(|| ExecError::not_implemented("to_tensor of non-numeric list")))
                        .collect::<ExecResult<_>>()?;
                    let len = i64::try_from(data.len()).expect("length fits i64");
                    Ok(HostValue::tensor(Tensor::new(vec![len], dtype, data)))
                }
                other => Err(ExecError::not_implemented(format!(
                    "to_tensor of '{}'",
                    other.type_name()
                ))),
            }
        }
        Builtin::Full => {
            if args.len() < 2 || args.len() > 3 {
                return Err(ExecError::inner("full expects 2 or 3 arguments"));
            }
            let shape: Vec<i64> = iterable_items(&args[0])?.iter().map(to_index).collect::<ExecResult<_>>()?;
            let value = numeric(&args[1]).ok_or_else(|| ExecError::not_implemented("full value must be numeric"))?;
            let dtype = args.get(2).map_or(Ok(DType::Float32), parse_dtype)?;
            Ok(HostValue::tensor(Tensor::full(shape, value, dtype)))
        }
        Builtin::Grad => Err(ExecError::not_implemented("grad is only defined under tracing")),
        Builtin::DictUpdate => {
            arity(2)?;
            let HostValue::Dict(target) = &args[0] else {
                return Err(ExecError::inner("dict.update receiver must be a dict"));
            };
            let HostValue::Dict(other) = &args[1] else {
                return Err(ExecError::not_implemented("dict.update argument must be a dict"));
            };
            let additions: Vec<(DictKey, HostValue)> =
                other.borrow().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            target.borrow_mut().extend(additions);
            Ok(HostValue::None)
        }
        Builtin::DictKeys => {
            arity(1)?;
            let HostValue::Dict(map) = &args[0] else {
                return Err(ExecError::inner("dict.keys receiver must be a dict"));
            };
            Ok(HostValue::list(map.borrow().keys().map(DictKey::to_value).collect()))
        }
        Builtin::DictValues => {
            arity(1)?;
            let HostValue::Dict(map) = &args[0] else {
                return Err(ExecError::inner("dict.values receiver must be a dict"));
            };
            Ok(HostValue::list(map.borrow().values().cloned().collect()))
        }
        Builtin::DictItems => {
            arity(1)?;
            let HostValue::Dict(map) = &args[0] else {
                return Err(ExecError::inner("dict.items receiver must be a dict"));
            };
            Ok(HostValue::list(
                map.borrow()
                    .iter()
                    .map(|(k, v)| HostValue::tuple(vec![k.to_value(), v.clone()]))
                    .collect(),
            ))
        }
        Builtin::ListExtend => {
            arity(2)?;
            let HostValue::List(target) = &args[0] else {
                return Err(ExecError::inner("list.extend receiver must be a list"));
            };
            let additions = iterable_items(&args[1])?;
            target.borrow_mut().extend(additions);
            Ok(HostValue::None)
        }
        Builtin::ListAppend => {
            arity(2)?;
            let HostValue::List(target) = &args[0] else {
                return Err(ExecError::inner("list.append receiver must be a list"));
            };
            target.borrow_mut().push(args[1].clone());
            Ok(HostValue::None)
        }
    }
}

fn unsupported_binary(op: BinOp, lhs: &HostValue, rhs: &HostValue) -> ExecError {
    ExecError::not_implemented(format!(
        "unsupported operand type(s) for {op}: '{}' and '{}'",
        lhs.type_name(),
        rhs.type_name()
    ))
}

/// A host-interpreter activation record, as seen by the eval hook.
///
/// The simulator snapshots `locals`/`globals`/`builtins` once at entry;
/// guards later resolve against a live frame through the same accessors.
#[derive(Debug)]
pub struct Frame {
    pub code: Rc<CodeObject>,
    pub locals: IndexMap<String, HostValue>,
    pub globals: Rc<RefCell<IndexMap<String, HostValue>>>,
    pub builtins: Rc<IndexMap<String, HostValue>>,
}

impl Frame {
    /// Creates a frame for calling `code` with pre-bound locals.
    #[must_use]
    pub fn new(
        code: Rc<CodeObject>,
        locals: IndexMap<String, HostValue>,
        globals: Rc<RefCell<IndexMap<String, HostValue>>>,
        builtins: Rc<IndexMap<String, HostValue>>,
    ) -> Self {
        Self {
            code,
            locals,
            globals,
            builtins,
        }
    }

    /// Resolves a name through locals, then globals, then builtins.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<HostValue> {
        if let Some(v) = self.locals.get(name) {
            return Some(v.clone());
        }
        if let Some(v) = self.globals.borrow().get(name) {
            return Some(v.clone());
        }
        self.builtins.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_arithmetic_stays_integral() {
        let out = binary_op(BinOp::Add, &HostValue::Int(2), &HostValue::Int(3)).unwrap();
        assert!(matches!(out, HostValue::Int(5)));
        let out = binary_op(BinOp::TrueDiv, &HostValue::Int(3), &HostValue::Int(2)).unwrap();
        assert!(matches!(out, HostValue::Float(f) if f == 1.5));
    }

    #[test]
    fn test_tensor_promotes_scalar_operand() {
        let t = HostValue::tensor(Tensor::scalar(1.0, DType::Int64));
        let out = binary_op(BinOp::Add, &t, &HostValue::Int(2)).unwrap();
        let HostValue::Tensor(out) = out else {
            panic!("expected tensor result");
        };
        assert_eq!(out.item().unwrap(), 3.0);
    }

    #[test]
    fn test_compare_tensor_yields_bool_tensor() {
        let t = HostValue::tensor(Tensor::scalar(3.0, DType::Int64));
        let out = compare_op(CmpOp::Gt, &t, &HostValue::Int(2)).unwrap();
        let HostValue::Tensor(out) = out else {
            panic!("expected tensor result");
        };
        assert_eq!(out.dtype(), DType::Bool);
        assert!(out.as_bool().unwrap());
    }

    #[test]
    fn test_is_uses_identity_for_containers() {
        let list = HostValue::list(vec![HostValue::Int(1)]);
        let alias = list.clone();
        let fresh = HostValue::list(vec![HostValue::Int(1)]);
        assert!(values_identical(&list, &alias));
        assert!(!values_identical(&list, &fresh));
        assert!(values_equal(&list, &fresh));
    }

    #[test]
    fn test_dict_getitem_and_keyerror() {
        let d = HostValue::dict(vec![(DictKey::Int(1), HostValue::Int(2))]);
        let hit = getitem(&d, &HostValue::Int(1)).unwrap();
        assert!(matches!(hit, HostValue::Int(2)));
        assert!(getitem(&d, &HostValue::Int(9)).is_err());
    }

    #[test]
    fn test_negative_index() {
        let list = HostValue::list(vec![HostValue::Int(1), HostValue::Int(2), HostValue::Int(3)]);
        let last = getitem(&list, &HostValue::Int(-1)).unwrap();
        assert!(matches!(last, HostValue::Int(3)));
    }

    #[test]
    fn test_repr_literals() {
        assert_eq!(repr(&HostValue::Bool(true)), "True");
        assert_eq!(repr(&HostValue::Float(1.0)), "1.0");
        assert_eq!(repr(&HostValue::str("hi")), "'hi'");
        assert_eq!(
            repr(&HostValue::tuple(vec![HostValue::Int(1)])),
            "(1,)"
        );
    }
}
