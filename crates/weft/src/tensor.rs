//! Eager dense tensor runtime.
//!
//! Stands in for the numeric runtime of the host framework: row-major
//! dense tensors with trailing-axis broadcasting. The reference VM and the
//! compiled-segment interpreter both evaluate through this module; the
//! simulator itself never touches tensor data, only [`MetaInfo`]
//! descriptors derived from it.
//!
//! [`MetaInfo`]: crate::meta::MetaInfo

use std::fmt;

use strum::Display;

use crate::ops::{BinOp, CmpOp, UnaryOp};

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, serde::Serialize, serde::Deserialize)]
pub enum DType {
    #[strum(serialize = "bool")]
    Bool,
    #[strum(serialize = "int32")]
    Int32,
    #[strum(serialize = "int64")]
    Int64,
    #[strum(serialize = "float32")]
    Float32,
    #[strum(serialize = "float64")]
    Float64,
}

impl DType {
    /// Whether values of this dtype are whole numbers.
    #[must_use]
    pub fn is_integral(self) -> bool {
        matches!(self, Self::Bool | Self::Int32 | Self::Int64)
    }

    /// The wider of two dtypes under the usual promotion lattice.
    #[must_use]
    pub fn promote(self, other: Self) -> Self {
        fn rank(d: DType) -> u8 {
            match d {
                DType::Bool => 0,
                DType::Int32 => 1,
                DType::Int64 => 2,
                DType::Float32 => 3,
                DType::Float64 => 4,
            }
        }
        if rank(self) >= rank(other) { self } else { other }
    }
}

/// A dense row-major tensor.
///
/// Data is held uniformly as `f64`; integral dtypes keep whole values.
/// Tensors are immutable after construction; every operation allocates
/// its result.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    dtype: DType,
    stop_gradient: bool,
    data: Vec<f64>,
}

/// Error from a tensor operation (shape mismatch, unsupported op).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorError(pub String);

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor error: {}", self.0)
    }
}

impl std::error::Error for TensorError {}

type TensorResult<T> = Result<T, TensorError>;

impl Tensor {
    /// Creates a tensor from a shape and flat row-major data.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` does not equal the product of `shape`.
    #[must_use]
    pub fn new(shape: Vec<i64>, dtype: DType, data: Vec<f64>) -> Self {
        let numel: i64 = shape.iter().product();
        assert_eq!(
            data.len(),
            usize::try_from(numel.max(0)).expect("tensor shape overflows usize"),
            "tensor data length must match shape product"
        );
        Self {
            shape,
            dtype,
            stop_gradient: true,
            data,
        }
    }

    /// Creates a rank-0 (scalar) tensor.
    #[must_use]
    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::new(Vec::new(), dtype, vec![value])
    }

    /// Creates a tensor filled with a constant.
    #[must_use]
    pub fn full(shape: Vec<i64>, value: f64, dtype: DType) -> Self {
        let numel: i64 = shape.iter().product();
        let numel = usize::try_from(numel.max(0)).expect("tensor shape overflows usize");
        Self::new(shape, dtype, vec![value; numel])
    }

    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn stop_gradient(&self) -> bool {
        self.stop_gradient
    }

    /// Marks whether gradients are cut at this tensor.
    pub fn set_stop_gradient(&mut self, stop: bool) {
        self.stop_gradient = stop;
    }

    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Number of elements.
    #[must_use]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The single element of a one-element tensor.
    pub fn item(&self) -> TensorResult<f64> {
        if self.data.len() == 1 {
            Ok(self.data[0])
        } else {
            Err(TensorError(format!(
                "item() requires exactly one element, tensor has {}",
                self.data.len()
            )))
        }
    }

    /// Truthiness: defined only for one-element tensors.
    pub fn as_bool(&self) -> TensorResult<bool> {
        Ok(self.item()? != 0.0)
    }

    /// Selects the subtensor at `index` along the leading axis.
    pub fn index(&self, index: i64) -> TensorResult<Self> {
        let Some((&dim, rest)) = self.shape.split_first() else {
            return Err(TensorError("cannot index a rank-0 tensor".to_string()));
        };
        let index = if index < 0 { index + dim } else { index };
        if index < 0 || index >= dim {
            return Err(TensorError(format!("index {index} out of range for axis of length {dim}")));
        }
        let stride: i64 = rest.iter().product();
        let stride = usize::try_from(stride.max(0)).expect("tensor stride overflows usize");
        let start = usize::try_from(index).expect("index fits usize") * stride;
        Ok(Self::new(rest.to_vec(), self.dtype, self.data[start..start + stride].to_vec()))
    }

    /// Elementwise binary operation with trailing-axis broadcasting.
    pub fn binary(&self, op: BinOp, rhs: &Self) -> TensorResult<Self> {
        if op == BinOp::MatMul {
            return self.matmul(rhs);
        }
        let shape = broadcast_shapes(&self.shape, &rhs.shape)?;
        let dtype = binary_result_dtype(op, self.dtype, rhs.dtype);
        let mut data = Vec::with_capacity(shape_numel(&shape));
        for idx in 0..shape_numel(&shape) {
            let a = self.broadcast_get(&shape, idx);
            let b = rhs.broadcast_get(&shape, idx);
            data.push(apply_binary(op, a, b, dtype)?);
        }
        let mut out = Self::new(shape, dtype, data);
        out.stop_gradient = self.stop_gradient && rhs.stop_gradient;
        Ok(out)
    }

    /// Elementwise comparison with broadcasting, producing a bool tensor.
    pub fn compare(&self, op: CmpOp, rhs: &Self) -> TensorResult<Self> {
        let shape = broadcast_shapes(&self.shape, &rhs.shape)?;
        let mut data = Vec::with_capacity(shape_numel(&shape));
        for idx in 0..shape_numel(&shape) {
            let a = self.broadcast_get(&shape, idx);
            let b = rhs.broadcast_get(&shape, idx);
            let ord = a.partial_cmp(&b).ok_or_else(|| TensorError("comparison with NaN".to_string()))?;
            data.push(f64::from(u8::from(op.holds(ord))));
        }
        Ok(Self::new(shape, DType::Bool, data))
    }

    /// Elementwise unary operation.
    pub fn unary(&self, op: UnaryOp) -> TensorResult<Self> {
        let data = self
            .data
            .iter()
            .map(|&v| match op {
                UnaryOp::Pos => Ok(v),
                UnaryOp::Neg => Ok(-v),
                UnaryOp::Invert if self.dtype.is_integral() => Ok(!(v as i64) as f64),
                UnaryOp::Invert => Err(TensorError(format!("cannot invert {} tensor", self.dtype))),
            })
            .collect::<TensorResult<Vec<_>>>()?;
        let mut out = Self::new(self.shape.clone(), self.dtype, data);
        out.stop_gradient = self.stop_gradient;
        Ok(out)
    }

    /// 2-D matrix multiplication.
    fn matmul(&self, rhs: &Self) -> TensorResult<Self> {
        let (&[m, k], &[k2, n]) = (&self.shape[..], &rhs.shape[..]) else {
            return Err(TensorError("matmul requires two rank-2 tensors".to_string()));
        };
        if k != k2 {
            return Err(TensorError(format!("matmul inner dimensions differ: {k} vs {k2}")));
        }
        let dtype = self.dtype.promote(rhs.dtype);
        let (m_us, k_us, n_us) = (m as usize, k as usize, n as usize);
        let mut data = vec![0.0; m_us * n_us];
        for i in 0..m_us {
            for j in 0..n_us {
                let mut acc = 0.0;
                for kk in 0..k_us {
                    acc += self.data[i * k_us + kk] * rhs.data[kk * n_us + j];
                }
                data[i * n_us + j] = acc;
            }
        }
        let mut out = Self::new(vec![m, n], dtype, data);
        out.stop_gradient = self.stop_gradient && rhs.stop_gradient;
        Ok(out)
    }

    /// Reads the element this tensor contributes at flat position `idx`
    /// of the broadcast output shape.
    fn broadcast_get(&self, out_shape: &[i64], idx: usize) -> f64 {
        if self.data.len() == 1 {
            return self.data[0];
        }
        // Walk output axes right to left, folding broadcast axes to 0.
        let mut remaining = idx;
        let mut src_index = 0usize;
        let mut src_stride = 1usize;
        let offset = out_shape.len() - self.shape.len();
        for axis in (0..out_shape.len()).rev() {
            let out_dim = out_shape[axis] as usize;
            let coord = remaining % out_dim;
            remaining /= out_dim;
            if axis >= offset {
                let src_dim = self.shape[axis - offset] as usize;
                let src_coord = if src_dim == 1 { 0 } else { coord };
                src_index += src_coord * src_stride;
                src_stride *= src_dim;
            }
        }
        self.data[src_index]
    }
}

/// Result shape of broadcasting two shapes together, trailing-axis rules.
pub fn broadcast_shapes(a: &[i64], b: &[i64]) -> TensorResult<Vec<i64>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0i64; rank];
    for axis in 0..rank {
        let da = a.len().checked_sub(rank - axis).map_or(1, |i| a[i]);
        let db = b.len().checked_sub(rank - axis).map_or(1, |i| b[i]);
        out[axis] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(TensorError(format!("cannot broadcast shapes {a:?} and {b:?}")));
        };
    }
    Ok(out)
}

/// Result dtype of a binary operation.
pub fn binary_result_dtype(op: BinOp, a: DType, b: DType) -> DType {
    match op {
        BinOp::TrueDiv => a.promote(b).promote(DType::Float32),
        _ => a.promote(b),
    }
}

fn shape_numel(shape: &[i64]) -> usize {
    let numel: i64 = shape.iter().product();
    usize::try_from(numel.max(0)).expect("tensor shape overflows usize")
}

fn apply_binary(op: BinOp, a: f64, b: f64, dtype: DType) -> TensorResult<f64> {
    let result = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::TrueDiv => {
            if b == 0.0 {
                return Err(TensorError("division by zero".to_string()));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(TensorError("division by zero".to_string()));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(TensorError("modulo by zero".to_string()));
            }
            a - (a / b).floor() * b
        }
        BinOp::Pow => a.powf(b),
        BinOp::LShift => (((a as i64) << (b as i64)) as f64),
        BinOp::RShift => (((a as i64) >> (b as i64)) as f64),
        BinOp::BitAnd => (((a as i64) & (b as i64)) as f64),
        BinOp::BitOr => (((a as i64) | (b as i64)) as f64),
        BinOp::BitXor => (((a as i64) ^ (b as i64)) as f64),
        BinOp::MatMul => unreachable!("matmul handled before elementwise dispatch"),
    };
    // Keep integral dtypes whole.
    if dtype.is_integral() && matches!(op, BinOp::Pow | BinOp::TrueDiv) {
        Ok(result)
    } else if dtype.is_integral() {
        Ok(result.trunc())
    } else {
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[3, 1], &[1, 4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shapes(&[], &[2, 2]).unwrap(), vec![2, 2]);
        assert!(broadcast_shapes(&[3], &[4]).is_err());
    }

    #[test]
    fn test_scalar_add_broadcast() {
        let a = Tensor::new(vec![2, 2], DType::Int64, vec![1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::scalar(10.0, DType::Int64);
        let out = a.binary(BinOp::Add, &b).unwrap();
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.data(), &[11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn test_compare_produces_bool() {
        let a = Tensor::new(vec![3], DType::Int64, vec![1.0, 2.0, 3.0]);
        let b = Tensor::scalar(2.0, DType::Int64);
        let out = a.compare(CmpOp::Gt, &b).unwrap();
        assert_eq!(out.dtype(), DType::Bool);
        assert_eq!(out.data(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_index_leading_axis() {
        let a = Tensor::new(vec![3], DType::Int64, vec![1.0, 2.0, 3.0]);
        let row = a.index(1).unwrap();
        assert_eq!(row.shape(), &[] as &[i64]);
        assert_eq!(row.item().unwrap(), 2.0);
        assert!(a.index(3).is_err());
    }

    #[test]
    fn test_matmul() {
        let a = Tensor::new(vec![2, 2], DType::Float32, vec![1.0, 2.0, 3.0, 4.0]);
        let b = Tensor::new(vec![2, 1], DType::Float32, vec![1.0, 1.0]);
        let out = a.binary(BinOp::MatMul, &b).unwrap();
        assert_eq!(out.shape(), &[2, 1]);
        assert_eq!(out.data(), &[3.0, 7.0]);
    }

    #[test]
    fn test_truthiness_requires_one_element() {
        let a = Tensor::new(vec![2], DType::Bool, vec![1.0, 0.0]);
        assert!(a.as_bool().is_err());
        assert!(Tensor::scalar(1.0, DType::Bool).as_bool().unwrap());
    }
}
