//! Operator vocabulary shared by the host model, the tensor runtime, and
//! the symbolic IR.

use strum::{Display, IntoStaticStr};

/// Binary operators.
///
/// Inplace opcodes map onto the same operators: tensors have no inplace
/// host semantics, so `x += y` records a plain `Add` whose result inherits
/// the left-hand side's debug name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    TrueDiv,
    #[strum(serialize = "//")]
    FloorDiv,
    #[strum(serialize = "%")]
    Mod,
    #[strum(serialize = "**")]
    Pow,
    #[strum(serialize = "@")]
    MatMul,
    #[strum(serialize = "<<")]
    LShift,
    #[strum(serialize = ">>")]
    RShift,
    #[strum(serialize = "&")]
    BitAnd,
    #[strum(serialize = "|")]
    BitOr,
    #[strum(serialize = "^")]
    BitXor,
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum UnaryOp {
    #[strum(serialize = "+")]
    Pos,
    #[strum(serialize = "-")]
    Neg,
    #[strum(serialize = "~")]
    Invert,
}

/// Rich-comparison operators, including identity.
///
/// These are the only comparison kinds the simulator models; any other
/// rich-compare opcode graph-breaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr, serde::Serialize, serde::Deserialize)]
pub enum CmpOp {
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = "is")]
    Is,
    #[strum(serialize = "is not")]
    IsNot,
}

impl CmpOp {
    /// Decodes the operand of a `CompareOp` instruction.
    #[must_use]
    pub fn from_arg(arg: u32) -> Option<Self> {
        Some(match arg {
            0 => Self::Lt,
            1 => Self::Le,
            2 => Self::Eq,
            3 => Self::Ne,
            4 => Self::Ge,
            5 => Self::Gt,
            6 => Self::Is,
            7 => Self::IsNot,
            _ => return None,
        })
    }

    /// Encodes this operator as a `CompareOp` operand.
    #[must_use]
    pub fn to_arg(self) -> u32 {
        match self {
            Self::Lt => 0,
            Self::Le => 1,
            Self::Eq => 2,
            Self::Ne => 3,
            Self::Ge => 4,
            Self::Gt => 5,
            Self::Is => 6,
            Self::IsNot => 7,
        }
    }

    /// Applies this comparison to a total ordering result.
    #[must_use]
    pub fn holds(self, ord: std::cmp::Ordering) -> bool {
        match self {
            Self::Lt => ord.is_lt(),
            Self::Le => ord.is_le(),
            Self::Eq | Self::Is => ord.is_eq(),
            Self::Ne | Self::IsNot => ord.is_ne(),
            Self::Ge => ord.is_ge(),
            Self::Gt => ord.is_gt(),
        }
    }
}

/// A tensor operation recordable in the symbolic IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TensorOp {
    Binary(BinOp),
    Unary(UnaryOp),
    Compare(CmpOp),
    /// Gradient pseudo-op; meta inference is special-cased because the
    /// static shape rules cannot model it.
    Grad,
}

impl std::fmt::Display for TensorOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Binary(op) => write!(f, "binary[{op}]"),
            Self::Unary(op) => write!(f, "unary[{op}]"),
            Self::Compare(op) => write!(f, "compare[{op}]"),
            Self::Grad => write!(f, "grad"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_arg_round_trip() {
        for arg in 0..8 {
            let op = CmpOp::from_arg(arg).unwrap();
            assert_eq!(op.to_arg(), arg);
        }
        assert_eq!(CmpOp::from_arg(8), None);
    }

    #[test]
    fn test_display_symbols() {
        assert_eq!(BinOp::FloorDiv.to_string(), "//");
        assert_eq!(CmpOp::IsNot.to_string(), "is not");
        assert_eq!(UnaryOp::Invert.to_string(), "~");
    }
}
