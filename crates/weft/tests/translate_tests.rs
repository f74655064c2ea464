//! End-to-end translation tests: fully-simulated functions, cache and
//! guard behavior, and the non-strict fallback path.

mod common;

use common::{assert_parity, assert_parity_cached, empty_globals, function_of, scalar};
use weft::{CmpOp, CodeGen, Config, DType, HostValue, JitEngine, Opcode, SegmentId, Tensor, Vm};

/// `f(x) = x + 1 + 2`
fn tensor_chain() -> CodeGen {
    let mut g = CodeGen::new_function("chain", &["x"]);
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    g
}

#[test]
fn test_tensor_chain_produces_single_segment() {
    let f = function_of(&tensor_chain(), empty_globals());
    let (result, jit) = assert_parity(&f, || vec![scalar(1)]);

    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    assert_eq!(out.item().unwrap(), 4.0);

    let engine = jit.engine().unwrap();
    assert_eq!(engine.cache.translate_count, 1);
    assert_eq!(engine.segments.len(), 1);
    let segment = engine.segments.get(SegmentId(0)).unwrap();
    assert_eq!(segment.inputs.len(), 1, "one tensor input feeds the chain");
    assert_eq!(segment.statements.len(), 2, "both adds are recorded");
}

#[test]
fn test_cache_hit_on_identical_frame() {
    let f = function_of(&tensor_chain(), empty_globals());
    let jit = assert_parity_cached(&f, || vec![scalar(5)]);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);
}

#[test]
fn test_guard_chain_extends_on_meta_change() {
    let f = function_of(&tensor_chain(), empty_globals());
    let mut jit = Vm::with_engine(JitEngine::new(Config::default()));

    let first = jit.call(&f, vec![scalar(1)]).unwrap();
    let HostValue::Tensor(first) = first else { panic!("tensor expected") };
    assert_eq!(first.item().unwrap(), 4.0);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);

    // Different dtype: the meta guard misses and the chain is extended.
    let float_in = HostValue::tensor(Tensor::scalar(1.5, DType::Float64));
    let second = jit.call(&f, vec![float_in]).unwrap();
    let HostValue::Tensor(second) = second else { panic!("tensor expected") };
    assert_eq!(second.item().unwrap(), 4.5);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 2);

    // The original entry is still there: the int frame hits again.
    let third = jit.call(&f, vec![scalar(2)]).unwrap();
    let HostValue::Tensor(third) = third else { panic!("tensor expected") };
    assert_eq!(third.item().unwrap(), 5.0);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 2);
}

/// `f(x) = (for i in [1, 2, 3]: x += i); return x`
fn const_loop() -> CodeGen {
    let mut g = CodeGen::new_function("const_loop", &["x"]);
    g.gen_load_const(HostValue::Int(1));
    g.gen_load_const(HostValue::Int(2));
    g.gen_load_const(HostValue::Int(3));
    g.add_instr(Opcode::BuildList, 3);
    g.add_instr(Opcode::GetIter, 0);
    let loop_head = g.instr_count();
    let end = g.new_label();
    g.add_jump(Opcode::ForIter, end);
    g.gen_store_fast("i");
    g.gen_load_fast("x");
    g.gen_load_fast("i");
    g.add_instr(Opcode::InplaceAdd, 0);
    g.gen_store_fast("x");
    g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
    g.bind_label(end);
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_constant_loop_fully_inlined() {
    let f = function_of(&const_loop(), empty_globals());
    let (result, jit) = assert_parity(&f, || vec![scalar(10)]);

    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    assert_eq!(out.item().unwrap(), 16.0);

    // No graph break: one translation, one compiled segment holding the
    // three unrolled adds.
    let engine = jit.engine().unwrap();
    assert_eq!(engine.cache.translate_count, 1);
    assert_eq!(engine.segments.len(), 1);
    assert_eq!(engine.segments.get(SegmentId(0)).unwrap().statements.len(), 3);
}

/// Dict views iterate in insertion order through the inline loop.
///
/// `f(x) = (m = {1: 2, 3: 4}; for k in m.keys(): x += k;
///          for v in m.values(): x += v); return x`
fn dict_views() -> CodeGen {
    let mut g = CodeGen::new_function("dict_views", &["x"]);
    g.gen_load_const(HostValue::Int(1));
    g.gen_load_const(HostValue::Int(2));
    g.gen_load_const(HostValue::Int(3));
    g.gen_load_const(HostValue::Int(4));
    g.add_instr(Opcode::BuildMap, 2);
    g.gen_store_fast("m");

    for method in ["keys", "values"] {
        g.gen_load_fast("m");
        g.gen_load_method(method);
        g.add_instr(Opcode::CallMethod, 0);
        g.add_instr(Opcode::GetIter, 0);
        let loop_head = g.instr_count();
        let end = g.new_label();
        g.add_jump(Opcode::ForIter, end);
        g.gen_store_fast("k");
        g.gen_load_fast("x");
        g.gen_load_fast("k");
        g.add_instr(Opcode::InplaceAdd, 0);
        g.gen_store_fast("x");
        g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
        g.bind_label(end);
    }
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_dict_view_iteration_inlines() {
    let f = function_of(&dict_views(), empty_globals());
    let (result, jit) = assert_parity(&f, || vec![scalar(0)]);

    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    // keys 1 + 3, values 2 + 4.
    assert_eq!(out.item().unwrap(), 10.0);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);
}

/// `f(a, b) = (a + 1) + (b + 2)`: segment inputs arrive in topological
/// (first-use) order.
#[test]
fn test_segment_inputs_are_topologically_ordered() {
    let mut g = CodeGen::new_function("two_inputs", &["a", "b"]);
    g.gen_load_fast("a");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_load_fast("b");
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    let f = function_of(&g, empty_globals());

    let (_, jit) = assert_parity(&f, || vec![scalar(10), scalar(20)]);
    let engine = jit.engine().unwrap();
    let segment = engine.segments.get(SegmentId(0)).unwrap();
    assert_eq!(segment.inputs.len(), 2);
    // Input symbols are distinct and every statement operand is either an
    // input or an earlier statement's output (topological validity).
    let mut defined: Vec<_> = segment.inputs.clone();
    for stmt in &segment.statements {
        for operand in &stmt.inputs {
            if let weft::SirValue::Sym(sym) = operand {
                assert!(defined.contains(sym), "operand {sym} used before definition");
            }
        }
        defined.extend(stmt.outputs.iter().copied());
    }
    assert!(defined.contains(&segment.outputs[0]));
}

/// `f(x) = f"{x}"` cannot be modeled (tensor format) and falls back.
fn format_tensor() -> CodeGen {
    let mut g = CodeGen::new_function("format_tensor", &["x"]);
    g.gen_load_fast("x");
    g.add_instr(Opcode::FormatValue, 0);
    g.gen_return();
    g
}

#[test]
fn test_unsupported_frame_falls_back_silently() {
    let f = function_of(&format_tensor(), empty_globals());
    let (result, jit) = assert_parity(&f, || vec![scalar(3)]);
    assert!(matches!(result, HostValue::Str(_)));
    // Fallback registers a cache entry but compiles nothing.
    let engine = jit.engine().unwrap();
    assert_eq!(engine.cache.translate_count, 1);
    assert!(engine.segments.is_empty());
}

#[test]
fn test_strict_mode_surfaces_unsupported_frames() {
    let f = function_of(&format_tensor(), empty_globals());
    let mut jit = Vm::with_engine(JitEngine::new(Config::default().strict()));
    let result = jit.call(&f, vec![scalar(3)]);
    assert!(result.is_err(), "strict mode must re-raise instead of falling back");
}

/// A user-defined callee is inlined: the caller's graph absorbs its ops
/// and the emitted body needs no runtime call.
#[test]
fn test_user_function_call_inlines() {
    // g(y) = y * 2
    let mut g = CodeGen::new_function("g", &["y"]);
    g.gen_load_fast("y");
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::BinaryMultiply, 0);
    g.gen_return();
    let globals = empty_globals();
    let g_fn = function_of(&g, globals.clone());
    globals
        .borrow_mut()
        .insert("g".to_string(), HostValue::Function(g_fn));

    // f(x) = g(x) + 1
    let mut f = CodeGen::new_function("f", &["x"]);
    f.gen_load_global("g");
    f.gen_load_fast("x");
    f.gen_call_function(1);
    f.gen_load_const(HostValue::Int(1));
    f.add_instr(Opcode::BinaryAdd, 0);
    f.gen_return();
    let f = function_of(&f, globals);

    let (result, jit) = assert_parity(&f, || vec![scalar(10)]);
    let HostValue::Tensor(out) = &result else { panic!("tensor expected") };
    assert_eq!(out.item().unwrap(), 21.0);

    // One translation, one segment holding both the multiply and the add.
    let engine = jit.engine().unwrap();
    assert_eq!(engine.cache.translate_count, 1);
    assert_eq!(engine.segments.len(), 1);
    assert_eq!(engine.segments.get(SegmentId(0)).unwrap().statements.len(), 2);
}

/// Keyword arguments bind through the inline call.
#[test]
fn test_inline_call_with_keyword_arguments() {
    // g(y, z) = y + z
    let mut g = CodeGen::new_function("g", &["y", "z"]);
    g.gen_load_fast("y");
    g.gen_load_fast("z");
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    let globals = empty_globals();
    let g_fn = function_of(&g, globals.clone());
    globals
        .borrow_mut()
        .insert("g".to_string(), HostValue::Function(g_fn));

    // f(x) = g(x, z=5)
    let mut f = CodeGen::new_function("f", &["x"]);
    f.gen_load_global("g");
    f.gen_load_fast("x");
    f.gen_load_const(HostValue::Int(5));
    f.gen_load_const(HostValue::tuple(vec![HostValue::str("z")]));
    f.add_instr(Opcode::CallFunctionKw, 2);
    f.gen_return();
    let f = function_of(&f, globals);

    let (result, _) = assert_parity(&f, || vec![scalar(1)]);
    let HostValue::Tensor(out) = &result else { panic!("tensor expected") };
    assert_eq!(out.item().unwrap(), 6.0);
}

/// A function built by MAKE_FUNCTION is a first-class inline callee.
#[test]
fn test_make_function_then_call_inlines() {
    // inner(y) = y - 3, materialized inside f.
    let mut inner = CodeGen::new_function("inner", &["y"]);
    inner.gen_load_fast("y");
    inner.gen_load_const(HostValue::Int(3));
    inner.add_instr(Opcode::BinarySubtract, 0);
    inner.gen_return();
    let inner_code = HostValue::Code(std::rc::Rc::new(inner.gen_code()));

    // f(x) = (h = <inner>; h(x))
    let mut f = CodeGen::new_function("f", &["x"]);
    f.gen_load_const(inner_code);
    f.gen_load_const(HostValue::str("inner"));
    f.add_instr(Opcode::MakeFunction, 0);
    f.gen_store_fast("h");
    f.gen_load_fast("h");
    f.gen_load_fast("x");
    f.gen_call_function(1);
    f.gen_return();
    let f = function_of(&f, empty_globals());

    let (result, _) = assert_parity(&f, || vec![scalar(10)]);
    let HostValue::Tensor(out) = &result else { panic!("tensor expected") };
    assert_eq!(out.item().unwrap(), 7.0);
}

/// Guards stringify deterministically: two identical translations of the
/// same function produce the same guard expression.
#[test]
fn test_guard_expression_is_deterministic() {
    let f = function_of(&tensor_chain(), empty_globals());

    let mut first = Vm::with_engine(JitEngine::new(Config::default()));
    first.call(&f, vec![scalar(1)]).unwrap();
    let mut second = Vm::with_engine(JitEngine::new(Config::default()));
    second.call(&f, vec![scalar(1)]).unwrap();

    // Both engines saw identical frames, so both translated once and
    // compiled identical segments.
    assert_eq!(first.engine().unwrap().segments.len(), second.engine().unwrap().segments.len());
    assert_eq!(first.engine().unwrap().cache.translate_count, 1);
    assert_eq!(second.engine().unwrap().cache.translate_count, 1);
}

/// Comparisons on constants fold and steer conditional jumps without a
/// break: `f(x, flag) = x + (1 if flag == 1 else 2)` with const flag.
#[test]
fn test_constant_predicate_folds_jump() {
    let mut g = CodeGen::new_function("const_branch", &["x", "flag"]);
    g.gen_load_fast("flag");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::CompareOp, CmpOp::Eq.to_arg());
    let else_label = g.new_label();
    g.add_jump(Opcode::PopJumpIfFalse, else_label);
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    g.bind_label(else_label);
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    let f = function_of(&g, empty_globals());

    let (result, jit) = assert_parity(&f, || vec![scalar(10), HostValue::Int(1)]);
    let HostValue::Tensor(out) = &result else { panic!("tensor expected") };
    assert_eq!(out.item().unwrap(), 11.0);
    // The predicate folded: one translation, no extra segments from a
    // jump break.
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);
    assert_eq!(jit.engine().unwrap().segments.len(), 1);

    // The guard pins the folded predicate: a different flag re-translates.
    let mut jit = jit;
    let plain = Vm::new().call(&f, vec![scalar(10), HostValue::Int(2)]).unwrap();
    let other = jit.call(&f, vec![scalar(10), HostValue::Int(2)]).unwrap();
    assert!(weft::values_equal(&plain, &other));
    assert_eq!(jit.engine().unwrap().cache.translate_count, 2);
}
