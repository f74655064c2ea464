//! The symbolic IR and per-translation function graph.
//!
//! Simulated tensor work never executes; it is recorded as a linear list
//! of [`Statement`]s over symbols. `start_compile` closes the current
//! segment: it slices the recorded statements back from the requested
//! outputs, freezes the traced inputs into guards, registers the segment,
//! and emits the call-the-compiled-segment bytecode that leaves the
//! outputs on the interpreter stack.

use std::rc::Rc;

use ahash::AHashMap;
use tracing::debug;

use crate::{
    codegen::CodeGen,
    error::{ExecError, ExecResult},
    guard::Guard,
    host::HostValue,
    meta::{MetaCache, MetaInfo, MetaOperand},
    ops::TensorOp,
    tensor::{DType, Tensor},
    variables::{topo_sort_vars, Variable, VariableKind},
};

/// Identifies one tensor value inside a graph's IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SymbolId(pub u32);

impl std::fmt::Display for SymbolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Identifies a compiled segment in the engine's segment table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SegmentId(pub u32);

/// An operand of a recorded statement.
#[derive(Debug, Clone)]
pub enum SirValue {
    Sym(SymbolId),
    /// A literal folded into the op at trace time.
    Const(HostValue),
}

/// The operation of a statement.
#[derive(Debug, Clone)]
pub enum SirOp {
    Tensor(TensorOp),
    /// Materializes a tensor computed from constants at trace time
    /// (`to_tensor`, `full`).
    Literal(Rc<Tensor>),
}

/// One recorded tensor operation.
#[derive(Debug, Clone)]
pub struct Statement {
    pub op: SirOp,
    pub inputs: Vec<SirValue>,
    pub outputs: Vec<SymbolId>,
    pub out_metas: Vec<MetaInfo>,
}

/// A closed, executable slice of the IR.
#[derive(Debug, Clone)]
pub struct Segment {
    pub statements: Vec<Statement>,
    pub inputs: Vec<SymbolId>,
    pub input_metas: Vec<MetaInfo>,
    pub outputs: Vec<SymbolId>,
}

impl Segment {
    /// Executes the segment against concrete input tensors.
    ///
    /// `Grad` statements return their inputs unchanged; the descriptor
    /// contract is all the simulator promises for them.
    pub fn interpret(&self, inputs: &[HostValue]) -> ExecResult<Vec<HostValue>> {
        if inputs.len() != self.inputs.len() {
            return Err(ExecError::inner(format!(
                "segment expects {} inputs, got {}",
                self.inputs.len(),
                inputs.len()
            )));
        }
        let mut env: AHashMap<SymbolId, HostValue> = AHashMap::new();
        for (sym, value) in self.inputs.iter().zip(inputs) {
            env.insert(*sym, value.clone());
        }
        for stmt in &self.statements {
            let operands: Vec<HostValue> = stmt
                .inputs
                .iter()
                .map(|operand| match operand {
                    SirValue::Sym(sym) => env
                        .get(sym)
                        .cloned()
                        .ok_or_else(|| ExecError::inner(format!("segment references unbound symbol {sym}"))),
                    SirValue::Const(value) => Ok(value.clone()),
                })
                .collect::<ExecResult<_>>()?;
            let results: Vec<HostValue> = match &stmt.op {
                SirOp::Literal(tensor) => vec![HostValue::Tensor(Rc::clone(tensor))],
                SirOp::Tensor(TensorOp::Binary(op)) => {
                    vec![crate::host::binary_op(*op, &operands[0], &operands[1])?]
                }
                SirOp::Tensor(TensorOp::Unary(op)) => vec![crate::host::unary_op(*op, &operands[0])?],
                SirOp::Tensor(TensorOp::Compare(op)) => {
                    vec![crate::host::compare_op(*op, &operands[0], &operands[1])?]
                }
                SirOp::Tensor(TensorOp::Grad) => operands.iter().skip(1).cloned().collect(),
            };
            if results.len() != stmt.outputs.len() {
                return Err(ExecError::inner("statement arity mismatch during interpretation"));
            }
            for (sym, value) in stmt.outputs.iter().zip(results) {
                env.insert(*sym, value);
            }
        }
        self.outputs
            .iter()
            .map(|sym| {
                env.get(sym)
                    .cloned()
                    .ok_or_else(|| ExecError::inner(format!("segment output {sym} was never computed")))
            })
            .collect()
    }
}

/// The engine-wide registry of compiled segments.
///
/// Rewritten code refers to segments by id; the reference VM resolves
/// them here when executing `CallSegment`.
#[derive(Debug, Default)]
pub struct SegmentTable {
    segments: Vec<Segment>,
}

impl SegmentTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, segment: Segment) -> SegmentId {
        let id = SegmentId(u32::try_from(self.segments.len()).expect("segment count fits u32"));
        self.segments.push(segment);
        id
    }

    #[must_use]
    pub fn get(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(id.0 as usize)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Drops all registered segments. For tests.
    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

/// Append-only symbolic IR for one translation attempt.
///
/// One graph per top-level translation; nested inline executors append to
/// the caller's graph. Closed by `start_compile`, possibly more than once
/// when graph breaks chain several segments through one rewritten body.
#[derive(Debug)]
pub struct FunctionGraph {
    statements: Vec<Statement>,
    symbol_metas: AHashMap<SymbolId, MetaInfo>,
    next_symbol: u32,
    globally_guarded: Vec<Variable>,
    frozen_guards: Guard,
    pub codegen: CodeGen,
}

impl FunctionGraph {
    /// Creates an empty graph whose code generator emits under `name`.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            statements: Vec::new(),
            symbol_metas: AHashMap::new(),
            next_symbol: 0,
            globally_guarded: Vec::new(),
            frozen_guards: Guard::always_true(),
            codegen: CodeGen::new(name),
        }
    }

    /// Allocates a symbol for a tensor entering the graph.
    pub fn fresh_symbol(&mut self, meta: MetaInfo) -> SymbolId {
        let sym = SymbolId(self.next_symbol);
        self.next_symbol += 1;
        self.symbol_metas.insert(sym, meta);
        sym
    }

    /// Appends a tensor-op statement, returning its output symbols.
    pub fn record(&mut self, op: TensorOp, inputs: Vec<SirValue>, out_metas: Vec<MetaInfo>) -> Vec<SymbolId> {
        let outputs: Vec<SymbolId> = out_metas.iter().map(|meta| self.fresh_symbol(meta.clone())).collect();
        debug!(op = %op, outputs = ?outputs, "record statement");
        self.statements.push(Statement {
            op: SirOp::Tensor(op),
            inputs,
            outputs: outputs.clone(),
            out_metas,
        });
        outputs
    }

    /// Appends a literal-tensor statement (trace-time constant data).
    pub fn record_literal(&mut self, tensor: Rc<Tensor>, meta: MetaInfo) -> SymbolId {
        let sym = self.fresh_symbol(meta.clone());
        self.statements.push(Statement {
            op: SirOp::Literal(tensor),
            inputs: Vec::new(),
            outputs: vec![sym],
            out_metas: vec![meta],
        });
        sym
    }

    /// Number of statements recorded and not yet compiled.
    #[must_use]
    pub fn pending_statements(&self) -> usize {
        self.statements.len()
    }

    /// Marks a variable whose exact identity must appear in the emitted
    /// guard. Idempotent.
    pub fn add_global_guarded_variable(&mut self, var: &Variable) {
        if !self.globally_guarded.contains(var) {
            self.globally_guarded.push(var.clone());
        }
    }

    /// Folds every accumulated guard into a single predicate.
    pub fn guard_fn(&self) -> ExecResult<Guard> {
        let mut guard = self.frozen_guards.clone();
        for var in &self.globally_guarded {
            collect_guard_into(var, &mut guard)?;
        }
        Ok(guard)
    }

    /// Closes the current segment.
    ///
    /// Deduplicates inputs via a topological sort over the outputs'
    /// traceable ancestors, verifies the recorded statements against meta
    /// inference, registers the executable segment, and emits bytecode
    /// that loads the inputs, calls the segment, materializes the tensor
    /// outputs into synthetic locals, and leaves every requested output on
    /// the stack in order.
    pub fn start_compile(
        &mut self,
        outputs: &[Variable],
        segments: &mut SegmentTable,
        meta_cache: &mut MetaCache,
    ) -> ExecResult<()> {
        self.compile_segment(outputs, segments, meta_cache, true)
    }

    /// As `start_compile`, but stops after materializing the tensor
    /// outputs; nothing is left on the stack. Break sites that store the
    /// outputs back into locals use this instead of popping loads.
    pub fn start_compile_no_push(
        &mut self,
        outputs: &[Variable],
        segments: &mut SegmentTable,
        meta_cache: &mut MetaCache,
    ) -> ExecResult<()> {
        self.compile_segment(outputs, segments, meta_cache, false)
    }

    fn compile_segment(
        &mut self,
        outputs: &[Variable],
        segments: &mut SegmentTable,
        meta_cache: &mut MetaCache,
        leave_outputs: bool,
    ) -> ExecResult<()> {
        // Tensor leaves that must exist concretely after the segment call.
        let mut tensor_outputs: Vec<Variable> = Vec::new();
        for output in outputs {
            for leaf in output.flatten_items() {
                if leaf.is_tensor() && !tensor_outputs.contains(&leaf) {
                    tensor_outputs.push(leaf);
                }
            }
        }

        // Freeze the traced inputs reached from the outputs into guards.
        let topo = topo_sort_vars(outputs);
        for var in &topo {
            collect_guard_into(var, &mut self.frozen_guards)?;
        }

        let statements = std::mem::take(&mut self.statements);
        let (kept, needed_inputs) = slice_statements(statements, &tensor_outputs);

        // Candidate inputs: traceable tensor leaves reachable from the
        // outputs, in topological discovery order.
        let mut candidates: Vec<Variable> = Vec::new();
        for output in outputs {
            traceable_tensor_sources(output, &mut candidates);
        }
        let input_vars: Vec<Variable> = candidates
            .into_iter()
            .filter(|var| {
                var.tensor_sym()
                    .is_some_and(|sym| needed_inputs.contains(&sym))
            })
            .collect();
        {
            let provided: Vec<SymbolId> = input_vars.iter().filter_map(Variable::tensor_sym).collect();
            for sym in &needed_inputs {
                if !provided.contains(sym) {
                    return Err(ExecError::inner(format!(
                        "segment input {sym} is not recoverable from the frame"
                    )));
                }
            }
        }

        verify_statements(&kept, &self.symbol_metas, meta_cache)?;

        if kept.is_empty() && tensor_outputs.is_empty() {
            // Nothing tensor-shaped to compile; just rebuild the outputs.
            if leave_outputs {
                for output in outputs {
                    output.reconstruct(&mut self.codegen)?;
                }
            }
            return Ok(());
        }

        let out_syms: Vec<SymbolId> = tensor_outputs
            .iter()
            .filter_map(Variable::tensor_sym)
            .collect();
        let segment = Segment {
            statements: kept,
            inputs: input_vars.iter().filter_map(Variable::tensor_sym).collect(),
            input_metas: input_vars
                .iter()
                .filter_map(Variable::tensor_meta)
                .collect(),
            outputs: out_syms.clone(),
        };
        let segment_id = segments.register(segment);
        debug!(segment = segment_id.0, inputs = input_vars.len(), outputs = out_syms.len(), "start_compile");

        // Load inputs in the declared order and call the segment.
        for input in &input_vars {
            input.reconstruct(&mut self.codegen)?;
        }
        self.codegen
            .add_instr(crate::bytecode::Opcode::CallSegment, segment_id.0);

        // Materialize tensor outputs into synthetic locals (top of stack
        // is the last declared output, so store in reverse).
        for (leaf, sym) in tensor_outputs.iter().zip(&out_syms).rev() {
            let name = format!("#graph_out_{}", sym.0);
            self.codegen.gen_store_fast(&name);
            leaf.set_materialized(&name);
        }

        // Leave every requested output on the stack, in order.
        if leave_outputs {
            for output in outputs {
                output.reconstruct(&mut self.codegen)?;
            }
        }
        Ok(())
    }
}

/// Dead-code slice: keeps only statements contributing to `tensor_outputs`
/// and returns the input symbols the kept slice still needs.
fn slice_statements(statements: Vec<Statement>, tensor_outputs: &[Variable]) -> (Vec<Statement>, Vec<SymbolId>) {
    let mut needed: Vec<SymbolId> = tensor_outputs.iter().filter_map(Variable::tensor_sym).collect();
    let mut kept_rev: Vec<Statement> = Vec::new();
    for stmt in statements.into_iter().rev() {
        if stmt.outputs.iter().any(|sym| needed.contains(sym)) {
            for operand in &stmt.inputs {
                if let SirValue::Sym(sym) = operand {
                    if !needed.contains(sym) {
                        needed.push(*sym);
                    }
                }
            }
            kept_rev.push(stmt);
        }
    }
    let kept: Vec<Statement> = kept_rev.into_iter().rev().collect();
    let produced: Vec<SymbolId> = kept.iter().flat_map(|s| s.outputs.iter().copied()).collect();
    let inputs: Vec<SymbolId> = needed
        .into_iter()
        .filter(|sym| !produced.contains(sym))
        .collect();
    (kept, inputs)
}

/// Re-derives every kept statement through meta inference and checks the
/// recorded output descriptors.
fn verify_statements(
    statements: &[Statement],
    symbol_metas: &AHashMap<SymbolId, MetaInfo>,
    meta_cache: &mut MetaCache,
) -> ExecResult<()> {
    for stmt in statements {
        let SirOp::Tensor(op) = &stmt.op else {
            continue;
        };
        let args: Vec<MetaOperand> = stmt
            .inputs
            .iter()
            .map(|operand| match operand {
                SirValue::Sym(sym) => symbol_metas
                    .get(sym)
                    .cloned()
                    .map(MetaOperand::Meta)
                    .ok_or_else(|| ExecError::inner(format!("no descriptor recorded for {sym}"))),
                SirValue::Const(value) => {
                    let (scalar, dtype) = match value {
                        HostValue::Bool(b) => (f64::from(u8::from(*b)), DType::Bool),
                        HostValue::Int(i) => (*i as f64, DType::Int64),
                        HostValue::Float(f) => (*f, DType::Float64),
                        _ => return Err(ExecError::inner("non-scalar constant in tensor statement")),
                    };
                    Ok(MetaOperand::Scalar(scalar, dtype))
                }
            })
            .collect::<ExecResult<_>>()?;
        let derived = meta_cache.infer(*op, &args)?;
        if derived != stmt.out_metas {
            return Err(ExecError::inner(format!(
                "meta verification failed for {op}: recorded {:?}, derived {:?}",
                stmt.out_metas, derived
            )));
        }
    }
    Ok(())
}

/// Collects the traceable tensor leaves reachable from `var`, walking
/// through traceable containers and derivation inputs.
fn traceable_tensor_sources(var: &Variable, out: &mut Vec<Variable>) {
    if var.tracker().is_traceable() {
        match var.kind() {
            VariableKind::Tensor(_) => {
                if !out.contains(var) {
                    out.push(var.clone());
                }
            }
            VariableKind::List(_) | VariableKind::Tuple(_) | VariableKind::Dict(_) => {
                for child in var.get_items().unwrap_or_default() {
                    traceable_tensor_sources(&child, out);
                }
            }
            VariableKind::Iter(iter) => traceable_tensor_sources(iter.source(), out),
            _ => {}
        }
        return;
    }
    for input in var.tracker().inputs() {
        traceable_tensor_sources(&input, out);
    }
}

/// Adds the guard checks certifying `var` to `guard`.
///
/// Containers holding unmaterializable values guard their children
/// instead; values with nothing comparable (methods, placeholders) are
/// skipped; non-traceable variables delegate to their traceable
/// ancestors.
fn collect_guard_into(var: &Variable, guard: &mut Guard) -> ExecResult<()> {
    if !var.tracker().is_traceable() {
        for ancestor in var.flatten_traceable_inputs() {
            collect_guard_into(&ancestor, guard)?;
        }
        return Ok(());
    }
    match var.make_stringify_guard() {
        Ok(check) => {
            guard.and(check);
            Ok(())
        }
        Err(ExecError::NotImplemented(_)) => {
            if let Some(items) = var.get_items() {
                for item in items {
                    collect_guard_into(&item, guard)?;
                }
            }
            Ok(())
        }
        Err(other) => Err(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        host::Builtin,
        ops::BinOp,
        tracker::Tracker,
        variables::{TensorInfo, VariableFactory},
    };

    fn tensor_var(graph: &mut FunctionGraph, shape: &[i64]) -> Variable {
        let meta = MetaInfo::new(shape.to_vec(), DType::Int64, true);
        let sym = graph.fresh_symbol(meta.clone());
        Variable::new(
            VariableKind::Tensor(TensorInfo {
                meta,
                sym,
                materialized_as: std::cell::RefCell::new(None),
            }),
            Tracker::Local { name: "x".to_string() },
        )
    }

    #[test]
    fn test_slice_drops_dead_statements() {
        let mut graph = FunctionGraph::new("f");
        let x = tensor_var(&mut graph, &[2]);
        let x_sym = x.tensor_sym().unwrap();
        let live = graph.record(
            TensorOp::Binary(BinOp::Add),
            vec![SirValue::Sym(x_sym), SirValue::Const(HostValue::Int(1))],
            vec![MetaInfo::new(vec![2], DType::Int64, true)],
        )[0];
        // Dead: result never contributes to the output.
        graph.record(
            TensorOp::Binary(BinOp::Mul),
            vec![SirValue::Sym(x_sym), SirValue::Const(HostValue::Int(3))],
            vec![MetaInfo::new(vec![2], DType::Int64, true)],
        );
        let out = Variable::new(
            VariableKind::Tensor(TensorInfo {
                meta: MetaInfo::new(vec![2], DType::Int64, true),
                sym: live,
                materialized_as: std::cell::RefCell::new(None),
            }),
            Tracker::Dummy { inputs: vec![x.clone()] },
        );
        let statements = std::mem::take(&mut graph.statements);
        let (kept, inputs) = slice_statements(statements, &[out]);
        assert_eq!(kept.len(), 1);
        assert_eq!(inputs, vec![x_sym]);
    }

    #[test]
    fn test_segment_interpret_add() {
        let segment = Segment {
            statements: vec![Statement {
                op: SirOp::Tensor(TensorOp::Binary(BinOp::Add)),
                inputs: vec![SirValue::Sym(SymbolId(0)), SirValue::Const(HostValue::Int(1))],
                outputs: vec![SymbolId(1)],
                out_metas: vec![MetaInfo::new(Vec::new(), DType::Int64, true)],
            }],
            inputs: vec![SymbolId(0)],
            input_metas: vec![MetaInfo::new(Vec::new(), DType::Int64, true)],
            outputs: vec![SymbolId(1)],
        };
        let input = HostValue::tensor(Tensor::scalar(2.0, DType::Int64));
        let out = segment.interpret(&[input]).unwrap();
        let HostValue::Tensor(out) = &out[0] else {
            panic!("expected tensor");
        };
        assert_eq!(out.item().unwrap(), 3.0);
    }

    #[test]
    fn test_global_guarded_is_idempotent() {
        let mut graph = FunctionGraph::new("f");
        let var = Variable::constant(HostValue::Int(1), Tracker::Local { name: "k".to_string() });
        graph.add_global_guarded_variable(&var);
        graph.add_global_guarded_variable(&var);
        assert_eq!(graph.globally_guarded.len(), 1);
        let guard = graph.guard_fn().unwrap();
        assert_eq!(guard.checks().len(), 1);
    }

    #[test]
    fn test_guard_fn_delegates_non_traceable_to_ancestors() {
        let mut graph = FunctionGraph::new("f");
        let leaf = Variable::constant(HostValue::Int(2), Tracker::Local { name: "i".to_string() });
        let derived = Variable::new(
            VariableKind::Constant(HostValue::Bool(true)),
            Tracker::Dummy { inputs: vec![leaf.clone()] },
        );
        graph.add_global_guarded_variable(&derived);
        let guard = graph.guard_fn().unwrap();
        assert_eq!(guard.checks().len(), 1);
        assert!(guard.expr().contains("frame.f_locals['i']"));
    }

    #[test]
    fn test_start_compile_emits_inputs_call_and_outputs() {
        let mut graph = FunctionGraph::new("f");
        let mut segments = SegmentTable::new();
        let mut meta_cache = MetaCache::new();
        let config = crate::config::Config::default();
        let factory = VariableFactory::new();
        let mut sim_stack = Vec::new();
        let x = tensor_var(&mut graph, &[]);
        let mut deps = crate::engine::TranslateDeps {
            meta: &mut meta_cache,
            segments: &mut segments,
            config: &config,
            factory: &factory,
            sim_stack: &mut sim_stack,
        };
        let sum = crate::variables::call_builtin_variable(
            Builtin::Binary(BinOp::Add),
            &[x.clone(), Variable::wrap_literal(HostValue::Int(1))],
            &mut graph,
            &mut deps,
        )
        .unwrap();
        drop(deps);
        graph
            .start_compile(&[sum.clone()], &mut segments, &mut meta_cache)
            .unwrap();
        assert_eq!(segments.len(), 1);
        let segment = segments.get(SegmentId(0)).unwrap();
        assert_eq!(segment.inputs, vec![x.tensor_sym().unwrap()]);
        assert_eq!(segment.outputs, vec![sum.tensor_sym().unwrap()]);
        // The next compile starts a fresh slice.
        assert_eq!(graph.pending_statements(), 0);
        // Inputs were frozen into guards.
        assert!(graph.guard_fn().unwrap().expr().contains("MetaInfo"));
    }
}
