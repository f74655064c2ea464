//! Iterator variables.
//!
//! An iterator variant tracks its source container and a 0-based cursor.
//! The cursor lives in a `Cell` so the `FOR_ITER` handlers can back it up
//! and restore it around an attempted inline loop.

use std::cell::Cell;

use crate::{
    error::{ExecError, ExecResult},
    host::HostValue,
    tracker::Tracker,
    variables::{Variable, VariableKind},
};

/// The iterator variants.
#[derive(Debug)]
pub enum IterKind {
    /// Over a list or tuple variable's items.
    Sequence { source: Variable, idx: Cell<usize> },
    /// Over a dict variable's keys.
    Dict { source: Variable, idx: Cell<usize> },
    /// Over `(index, item)` pairs of a sequence variable.
    Enumerate { source: Variable, idx: Cell<usize> },
    /// Over a tensor's leading axis; never advanced symbolically.
    Tensor { source: Variable },
    /// Over anything else; forces the for-loop fallback.
    Opaque { source: Variable },
}

impl IterKind {
    /// The container being iterated.
    #[must_use]
    pub fn source(&self) -> &Variable {
        match self {
            Self::Sequence { source, .. }
            | Self::Dict { source, .. }
            | Self::Enumerate { source, .. }
            | Self::Tensor { source }
            | Self::Opaque { source } => source,
        }
    }

    /// The cursor position.
    #[must_use]
    pub fn cursor(&self) -> usize {
        match self {
            Self::Sequence { idx, .. } | Self::Dict { idx, .. } | Self::Enumerate { idx, .. } => idx.get(),
            Self::Tensor { .. } | Self::Opaque { .. } => 0,
        }
    }

    /// Restores the cursor (after a failed inline loop).
    pub fn set_cursor(&self, value: usize) {
        match self {
            Self::Sequence { idx, .. } | Self::Dict { idx, .. } | Self::Enumerate { idx, .. } => idx.set(value),
            Self::Tensor { .. } | Self::Opaque { .. } => {}
        }
    }

    /// Whether the inline-loop protocol can drive this iterator.
    #[must_use]
    pub fn is_inline_supported(&self) -> bool {
        matches!(self, Self::Sequence { .. } | Self::Dict { .. } | Self::Enumerate { .. })
    }

    /// Yields the next item and advances, or `None` when exhausted.
    ///
    /// Sequence items keep their own trackers (they were wrapped with
    /// subscript provenance); dict keys are literal constants; enumerate
    /// yields a synthesized `(index, item)` tuple.
    pub fn next(&self) -> ExecResult<Option<Variable>> {
        match self {
            Self::Sequence { source, idx } => {
                let items = source
                    .get_items()
                    .ok_or_else(|| ExecError::inner("sequence iterator over a non-container"))?;
                let current = idx.get();
                if current >= items.len() {
                    return Ok(None);
                }
                idx.set(current + 1);
                Ok(Some(items[current].clone()))
            }
            Self::Dict { source, idx } => {
                let VariableKind::Dict(map) = source.kind() else {
                    return Err(ExecError::inner("dict iterator over a non-dict"));
                };
                let keys: Vec<HostValue> = map.borrow().keys().map(|k| k.to_value()).collect();
                let current = idx.get();
                if current >= keys.len() {
                    return Ok(None);
                }
                idx.set(current + 1);
                Ok(Some(Variable::wrap_literal(keys[current].clone())))
            }
            Self::Enumerate { source, idx } => {
                let items = source
                    .get_items()
                    .ok_or_else(|| ExecError::inner("enumerate iterator over a non-container"))?;
                let current = idx.get();
                if current >= items.len() {
                    return Ok(None);
                }
                idx.set(current + 1);
                let index_var = Variable::wrap_literal(HostValue::Int(
                    i64::try_from(current).map_err(|_| ExecError::inner("enumerate index overflows i64"))?,
                ));
                let item = items[current].clone();
                let pair = Variable::new(
                    VariableKind::Tuple(std::cell::RefCell::new(vec![index_var, item.clone()])),
                    Tracker::Dummy {
                        inputs: vec![source.clone(), item],
                    },
                );
                Ok(Some(pair))
            }
            Self::Tensor { .. } | Self::Opaque { .. } => Err(ExecError::BreakGraph(
                crate::error::BreakReason::ForLoopFallback,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::host::DictKey;

    fn seq_iter(items: Vec<Variable>) -> IterKind {
        let source = Variable::new(
            VariableKind::List(RefCell::new(items)),
            Tracker::Local { name: "xs".to_string() },
        );
        IterKind::Sequence {
            source,
            idx: Cell::new(0),
        }
    }

    #[test]
    fn test_sequence_iteration_preserves_item_identity() {
        let a = Variable::wrap_literal(HostValue::Int(1));
        let b = Variable::wrap_literal(HostValue::Int(2));
        let iter = seq_iter(vec![a.clone(), b.clone()]);
        assert_eq!(iter.next().unwrap(), Some(a));
        assert_eq!(iter.next().unwrap(), Some(b));
        assert_eq!(iter.next().unwrap(), None);
    }

    #[test]
    fn test_cursor_backup_and_restore() {
        let a = Variable::wrap_literal(HostValue::Int(1));
        let iter = seq_iter(vec![a.clone()]);
        let backup = iter.cursor();
        iter.next().unwrap();
        assert_eq!(iter.cursor(), 1);
        iter.set_cursor(backup);
        assert_eq!(iter.next().unwrap(), Some(a));
    }

    #[test]
    fn test_dict_iteration_yields_key_constants() {
        let value = Variable::wrap_literal(HostValue::Int(2));
        let source = Variable::new(
            VariableKind::Dict(RefCell::new(
                [(DictKey::Int(1), value)].into_iter().collect(),
            )),
            Tracker::Local { name: "d".to_string() },
        );
        let iter = IterKind::Dict {
            source,
            idx: Cell::new(0),
        };
        let key = iter.next().unwrap().unwrap();
        assert!(crate::host::values_equal(&key.get_value().unwrap(), &HostValue::Int(1)));
    }

    #[test]
    fn test_opaque_iterator_requests_fallback() {
        let source = Variable::wrap_literal(HostValue::Int(1));
        let iter = IterKind::Opaque { source };
        assert!(matches!(iter.next(), Err(ExecError::BreakGraph(_))));
    }
}
