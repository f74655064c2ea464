//! Tensor descriptors and meta inference.
//!
//! During symbolic execution a tensor is represented by a [`MetaInfo`]
//! descriptor, never by data. [`MetaCache::infer`] answers "what do the
//! outputs of this op look like" from operand descriptors alone, and is
//! memoized because the same op/descriptor combinations recur on every
//! trace of a hot function.

use ahash::AHashMap;

use crate::{
    error::{ExecError, ExecResult},
    ops::{BinOp, TensorOp},
    tensor::{broadcast_shapes, binary_result_dtype, DType},
};

/// A tensor descriptor: what the simulator knows about a tensor without
/// holding its data.
///
/// Identity (`Eq`/`Hash`) is exactly `(shape, dtype, stop_gradient)`,
/// the triple a guard compares when deciding whether a cached translation
/// still fits a frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct MetaInfo {
    pub shape: Vec<i64>,
    pub dtype: DType,
    pub stop_gradient: bool,
}

impl MetaInfo {
    #[must_use]
    pub fn new(shape: Vec<i64>, dtype: DType, stop_gradient: bool) -> Self {
        Self {
            shape,
            dtype,
            stop_gradient,
        }
    }

    /// Describes a concrete tensor.
    #[must_use]
    pub fn from_tensor(tensor: &crate::tensor::Tensor) -> Self {
        Self {
            shape: tensor.shape().to_vec(),
            dtype: tensor.dtype(),
            stop_gradient: tensor.stop_gradient(),
        }
    }

    /// Whether any axis is dynamic (unknown at trace time).
    #[must_use]
    pub fn is_dynamic_shape(&self) -> bool {
        self.shape.contains(&-1)
    }

    /// The textual form guards embed.
    #[must_use]
    pub fn guard_str(&self) -> String {
        format!("({:?}, {}, {})", self.shape, self.dtype, self.stop_gradient)
    }
}

impl std::fmt::Display for MetaInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MetaInfo(shape={:?}, dtype={}, stop_gradient={})", self.shape, self.dtype, self.stop_gradient)
    }
}

/// One operand of a recorded tensor op, as seen by meta inference.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaOperand {
    /// A symbolic tensor.
    Meta(MetaInfo),
    /// A concrete scalar folded into the op, with the dtype it promotes to.
    Scalar(f64, DType),
}

impl MetaOperand {
    fn key(&self) -> OperandKey {
        match self {
            Self::Meta(meta) => OperandKey::Meta(meta.clone()),
            Self::Scalar(v, dtype) => OperandKey::Scalar(v.to_bits(), *dtype),
        }
    }
}

/// Hashable form of an operand; scalar floats hash by bit pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum OperandKey {
    Meta(MetaInfo),
    Scalar(u64, DType),
}

/// A static-graph variable standing in for all tensors with one
/// descriptor.
///
/// Meta inference runs over these interned handles rather than raw
/// descriptors, so that every distinct `MetaInfo` is materialized exactly
/// once per engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticVar {
    pub id: usize,
    pub meta: MetaInfo,
}

/// Interns one [`StaticVar`] per distinct [`MetaInfo`].
#[derive(Debug, Default)]
pub struct VariableCreator {
    vars: AHashMap<MetaInfo, StaticVar>,
}

impl VariableCreator {
    /// Returns the static variable for `meta`, creating it on first use.
    pub fn get_variable(&mut self, meta: &MetaInfo) -> StaticVar {
        let next_id = self.vars.len();
        self.vars
            .entry(meta.clone())
            .or_insert_with(|| StaticVar {
                id: next_id,
                meta: meta.clone(),
            })
            .clone()
    }

    /// Drops all interned variables. For tests.
    pub fn clear(&mut self) {
        self.vars.clear();
    }
}

/// Memoized meta inference.
#[derive(Debug, Default)]
pub struct MetaCache {
    cache: AHashMap<(TensorOp, Vec<OperandKey>), Vec<MetaInfo>>,
    creator: VariableCreator,
}

impl MetaCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Infers the output descriptors of `op` applied to `args`.
    ///
    /// Consults the special-inference table first (ops the static shape
    /// rules cannot model), then derives through interned static
    /// variables. Results are memoized by `(op, operand keys)`.
    pub fn infer(&mut self, op: TensorOp, args: &[MetaOperand]) -> ExecResult<Vec<MetaInfo>> {
        let key = (op, args.iter().map(MetaOperand::key).collect::<Vec<_>>());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let outputs = if let Some(special) = special_infer(op, args) {
            special?
        } else {
            self.derive(op, args)?
        };
        self.cache.insert(key, outputs.clone());
        Ok(outputs)
    }

    /// Shape/dtype derivation through the static-variable pool.
    fn derive(&mut self, op: TensorOp, args: &[MetaOperand]) -> ExecResult<Vec<MetaInfo>> {
        let vars: Vec<Option<StaticVar>> = args
            .iter()
            .map(|arg| match arg {
                MetaOperand::Meta(meta) => Some(self.creator.get_variable(meta)),
                MetaOperand::Scalar(..) => None,
            })
            .collect();

        match op {
            TensorOp::Binary(bin) => {
                let (lhs, rhs) = two_operands(&vars, args)?;
                let shape = broadcast_shapes(&lhs.shape, &rhs.shape)
                    .map_err(|e| ExecError::inner(e.to_string()))?;
                let shape = matmul_adjust(bin, &lhs, &rhs).unwrap_or(shape);
                let dtype = binary_result_dtype(bin, lhs.dtype, rhs.dtype);
                let stop_gradient = lhs.stop_gradient && rhs.stop_gradient;
                Ok(vec![MetaInfo::new(shape, dtype, stop_gradient)])
            }
            TensorOp::Compare(_) => {
                let (lhs, rhs) = two_operands(&vars, args)?;
                let shape = broadcast_shapes(&lhs.shape, &rhs.shape)
                    .map_err(|e| ExecError::inner(e.to_string()))?;
                Ok(vec![MetaInfo::new(shape, DType::Bool, true)])
            }
            TensorOp::Unary(_) => {
                let meta = vars
                    .first()
                    .and_then(Clone::clone)
                    .map(|v| v.meta)
                    .ok_or_else(|| ExecError::inner("unary op requires a tensor operand"))?;
                Ok(vec![meta])
            }
            TensorOp::Grad => unreachable!("grad is handled by the special-inference table"),
        }
    }

    /// Drops memoized entries and interned variables. For tests.
    pub fn clear(&mut self) {
        self.cache.clear();
        self.creator.clear();
    }
}

/// Hand-written inference for ops the shape rules cannot model.
///
/// `grad(outputs, inputs, …)` returns its `inputs` unchanged, wrapped to a
/// one-element sequence when a single tensor was passed.
fn special_infer(op: TensorOp, args: &[MetaOperand]) -> Option<ExecResult<Vec<MetaInfo>>> {
    match op {
        TensorOp::Grad => {
            let inputs: Vec<MetaInfo> = args
                .iter()
                .skip(1)
                .filter_map(|arg| match arg {
                    MetaOperand::Meta(meta) => Some(meta.clone()),
                    MetaOperand::Scalar(..) => None,
                })
                .collect();
            if inputs.is_empty() {
                return Some(Err(ExecError::inner("grad requires tensor inputs")));
            }
            Some(Ok(inputs))
        }
        _ => None,
    }
}

/// Resolves the two operands of a binary/compare op, promoting scalar
/// operands to rank-0 descriptors of their own dtype.
fn two_operands(vars: &[Option<StaticVar>], args: &[MetaOperand]) -> ExecResult<(MetaInfo, MetaInfo)> {
    if args.len() != 2 {
        return Err(ExecError::inner(format!("binary op expects 2 operands, got {}", args.len())));
    }
    if vars.iter().flatten().next().is_none() {
        return Err(ExecError::inner("binary op requires at least one tensor operand"));
    }
    let resolve = |idx: usize| -> MetaInfo {
        match &vars[idx] {
            Some(var) => var.meta.clone(),
            None => {
                let MetaOperand::Scalar(_, dtype) = &args[idx] else {
                    unreachable!("non-var operand is a scalar");
                };
                MetaInfo::new(Vec::new(), *dtype, true)
            }
        }
    };
    Ok((resolve(0), resolve(1)))
}

/// Matmul output shape, when applicable.
fn matmul_adjust(op: BinOp, lhs: &MetaInfo, rhs: &MetaInfo) -> Option<Vec<i64>> {
    if op != BinOp::MatMul {
        return None;
    }
    match (lhs.shape.as_slice(), rhs.shape.as_slice()) {
        (&[m, _], &[_, n]) => Some(vec![m, n]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::CmpOp;

    fn meta(shape: &[i64]) -> MetaOperand {
        MetaOperand::Meta(MetaInfo::new(shape.to_vec(), DType::Int64, true))
    }

    #[test]
    fn test_binary_broadcast_meta() {
        let mut cache = MetaCache::new();
        let out = cache
            .infer(TensorOp::Binary(BinOp::Add), &[meta(&[3, 1]), meta(&[4])])
            .unwrap();
        assert_eq!(out, vec![MetaInfo::new(vec![3, 4], DType::Int64, true)]);
    }

    #[test]
    fn test_compare_yields_bool_meta() {
        let mut cache = MetaCache::new();
        let out = cache
            .infer(TensorOp::Compare(CmpOp::Gt), &[meta(&[2]), MetaOperand::Scalar(1.0, DType::Int64)])
            .unwrap();
        assert_eq!(out[0].dtype, DType::Bool);
        assert_eq!(out[0].shape, vec![2]);
    }

    #[test]
    fn test_scalar_operand_keeps_integral_dtype() {
        let mut cache = MetaCache::new();
        let out = cache
            .infer(TensorOp::Binary(BinOp::Add), &[meta(&[]), MetaOperand::Scalar(1.0, DType::Int64)])
            .unwrap();
        assert_eq!(out[0].dtype, DType::Int64);
    }

    #[test]
    fn test_grad_returns_inputs() {
        let mut cache = MetaCache::new();
        let out = cache
            .infer(TensorOp::Grad, &[meta(&[2, 2]), meta(&[4])])
            .unwrap();
        assert_eq!(out, vec![MetaInfo::new(vec![4], DType::Int64, true)]);
    }

    #[test]
    fn test_inference_is_memoized() {
        let mut cache = MetaCache::new();
        let args = [meta(&[3]), meta(&[3])];
        cache.infer(TensorOp::Binary(BinOp::Mul), &args).unwrap();
        let before = cache.cache.len();
        cache.infer(TensorOp::Binary(BinOp::Mul), &args).unwrap();
        assert_eq!(cache.cache.len(), before);
    }

    #[test]
    fn test_variable_creator_interns() {
        let mut creator = VariableCreator::default();
        let m = MetaInfo::new(vec![2], DType::Float32, true);
        let a = creator.get_variable(&m);
        let b = creator.get_variable(&m);
        assert_eq!(a.id, b.id);
        let c = creator.get_variable(&MetaInfo::new(vec![3], DType::Float32, true));
        assert_ne!(a.id, c.id);
    }
}
