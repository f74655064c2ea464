//! Graph-break protocol tests: tensor-dependent branches, opaque
//! iterators, break flags, and tensor-dependent inner loops.

mod common;

use common::{assert_parity, assert_parity_cached, empty_globals, function_of, int_iterator, scalar};
use weft::{CmpOp, CodeGen, HostValue, Opcode};

/// `f(x) = (for i in [1,2,3]: x += i; if x > 2: x += 1 else: x -= 1);
///  return x`
///
/// The branch predicate depends on the tensor, so the inline loop breaks
/// and the loop is rebuilt around a loop-body function.
fn loop_with_tensor_branch() -> CodeGen {
    let mut g = CodeGen::new_function("tensor_branch_loop", &["x"]);
    g.gen_load_const(HostValue::Int(1));
    g.gen_load_const(HostValue::Int(2));
    g.gen_load_const(HostValue::Int(3));
    g.add_instr(Opcode::BuildList, 3);
    g.add_instr(Opcode::GetIter, 0);
    let loop_head = g.instr_count();
    let end = g.new_label();
    g.add_jump(Opcode::ForIter, end);
    g.gen_store_fast("i");
    // x += i
    g.gen_load_fast("x");
    g.gen_load_fast("i");
    g.add_instr(Opcode::InplaceAdd, 0);
    g.gen_store_fast("x");
    // if x > 2:
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::CompareOp, CmpOp::Gt.to_arg());
    let else_label = g.new_label();
    g.add_jump(Opcode::PopJumpIfFalse, else_label);
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::InplaceAdd, 0);
    g.gen_store_fast("x");
    g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
    // else:
    g.bind_label(else_label);
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::InplaceSubtract, 0);
    g.gen_store_fast("x");
    g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
    g.bind_label(end);
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_tensor_branch_in_loop_breaks_and_agrees() {
    let f = function_of(&loop_with_tensor_branch(), empty_globals());
    let (result, jit) = assert_parity(&f, || vec![scalar(1)]);

    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    // x=1: +1 -> 2, not > 2 -> 1; +2 -> 3, > 2 -> 4; +3 -> 7, > 2 -> 8.
    assert_eq!(out.item().unwrap(), 8.0);

    // The loop break plus the per-iteration branch breaks translate more
    // than once (the loop body and its resumes go through the hook).
    let engine = jit.engine().unwrap();
    assert!(engine.cache.translate_count > 1, "graph breaks must chain translations");
    assert!(!engine.segments.is_empty());
}

/// `f(x, it) = (for item in it: x += item); return x` with an opaque
/// iterator argument: the inline loop cannot drive it, so the top level
/// falls back to the loop-break protocol.
fn opaque_iterator_loop() -> CodeGen {
    let mut g = CodeGen::new_function("opaque_loop", &["x", "it"]);
    g.gen_load_fast("it");
    g.add_instr(Opcode::GetIter, 0);
    let loop_head = g.instr_count();
    let end = g.new_label();
    g.add_jump(Opcode::ForIter, end);
    g.gen_store_fast("item");
    g.gen_load_fast("x");
    g.gen_load_fast("item");
    g.add_instr(Opcode::InplaceAdd, 0);
    g.gen_store_fast("x");
    g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
    g.bind_label(end);
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_opaque_iterator_falls_back_to_loop_break() {
    let f = function_of(&opaque_iterator_loop(), empty_globals());
    let (result, _) = assert_parity(&f, || vec![scalar(10), int_iterator(&[1, 2, 3])]);
    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    assert_eq!(out.item().unwrap(), 16.0);
}

/// `f(x) = (for i in [1,2,3]: x += i; if i == 2: break); return x`:
/// the constant predicate folds, so the break is resolved at translation
/// time and the loop still inlines.
fn const_break_loop() -> CodeGen {
    let mut g = CodeGen::new_function("const_break", &["x"]);
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
    g.gen_load_fast("i");
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::CompareOp, CmpOp::Eq.to_arg());
    let continue_label = g.new_label();
    g.add_jump(Opcode::PopJumpIfFalse, continue_label);
    g.add_jump(Opcode::JumpAbsolute, end);
    g.bind_label(continue_label);
    g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
    g.bind_label(end);
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_constant_break_resolves_at_translation_time() {
    let f = function_of(&const_break_loop(), empty_globals());
    let (result, jit) = assert_parity(&f, || vec![scalar(0)]);
    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    assert_eq!(out.item().unwrap(), 3.0);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);
}

/// The same break shape over an opaque iterator exercises the break-flag
/// path through the loop-body function at runtime.
fn opaque_break_loop() -> CodeGen {
    let mut g = CodeGen::new_function("opaque_break", &["x", "it"]);
    g.gen_load_fast("it");
    g.add_instr(Opcode::GetIter, 0);
    let loop_head = g.instr_count();
    let end = g.new_label();
    g.add_jump(Opcode::ForIter, end);
    g.gen_store_fast("i");
    g.gen_load_fast("x");
    g.gen_load_fast("i");
    g.add_instr(Opcode::InplaceAdd, 0);
    g.gen_store_fast("x");
    g.gen_load_fast("i");
    g.gen_load_const(HostValue::Int(2));
    g.add_instr(Opcode::CompareOp, CmpOp::Eq.to_arg());
    let continue_label = g.new_label();
    g.add_jump(Opcode::PopJumpIfFalse, continue_label);
    g.add_jump(Opcode::JumpAbsolute, end);
    g.bind_label(continue_label);
    g.add_instr(Opcode::JumpAbsolute, loop_head as u32);
    g.bind_label(end);
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_break_flag_leaves_runtime_loop() {
    let f = function_of(&opaque_break_loop(), empty_globals());
    // Breaks after consuming 1 and 2.
    let (result, _) = assert_parity(&f, || vec![scalar(0), int_iterator(&[1, 2, 3])]);
    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    assert_eq!(out.item().unwrap(), 3.0);
}

/// `f(x, arr) = (for i, num in enumerate(arr): for idx in range(num):
///  x = x + num); return x` with `arr` a list of scalar tensors.
///
/// The outer enumerate is inline-supported; the inner `range(num)`
/// depends on a tensor, which breaks the inline attempt and rebuilds the
/// outer loop around a loop-body function. At runtime each loop-body call
/// re-enters the hook with a different `num`, chaining translations.
fn enumerate_nested_range() -> CodeGen {
    let mut g = CodeGen::new_function("enumerate_nested", &["x", "arr"]);
    g.gen_load_global("enumerate");
    g.gen_load_fast("arr");
    g.gen_call_function(1);
    g.add_instr(Opcode::GetIter, 0);
    let outer_head = g.instr_count();
    let outer_end = g.new_label();
    g.add_jump(Opcode::ForIter, outer_end);
    g.gen_unpack_sequence(2);
    g.gen_store_fast("i");
    g.gen_store_fast("num");
    // inner: for idx in range(num)
    g.gen_load_global("range");
    g.gen_load_fast("num");
    g.gen_call_function(1);
    g.add_instr(Opcode::GetIter, 0);
    let inner_head = g.instr_count();
    let inner_end = g.new_label();
    g.add_jump(Opcode::ForIter, inner_end);
    g.gen_store_fast("idx");
    g.gen_load_fast("x");
    g.gen_load_fast("num");
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_store_fast("x");
    g.add_instr(Opcode::JumpAbsolute, inner_head as u32);
    g.bind_label(inner_end);
    g.add_instr(Opcode::JumpAbsolute, outer_head as u32);
    g.bind_label(outer_end);
    g.gen_load_fast("x");
    g.gen_return();
    g
}

#[test]
fn test_enumerate_with_tensor_dependent_inner_loop() {
    let f = function_of(&enumerate_nested_range(), empty_globals());
    let arr = || HostValue::list(vec![scalar(1), scalar(2), scalar(3)]);
    let (result, jit) = assert_parity(&f, || vec![scalar(0), arr()]);

    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    // num=1 adds 1 once, num=2 adds 2 twice, num=3 adds 3 three times.
    assert_eq!(out.item().unwrap(), 1.0 + 4.0 + 9.0);
    assert!(jit.engine().unwrap().cache.translate_count > 1);
}

/// A break inside a plain call: string formatting of a non-constant value
/// inside an arithmetic expression forces the call break while keeping
/// the rest of the function compiled.
#[test]
fn test_break_in_call_keeps_prefix_compiled() {
    // f(x, xs) = (t = x + 1; n = len(iter_of(xs)); return t + n) where the
    // unsupported piece is a subscript of a tensor, which is not traced.
    let mut g = CodeGen::new_function("call_break", &["x"]);
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_store_fast("t");
    // x[0]: tensor subscripts are not traced -> break in call.
    g.gen_load_fast("x");
    g.gen_load_const(HostValue::Int(0));
    g.add_instr(Opcode::BinarySubscr, 0);
    g.gen_store_fast("n");
    g.gen_load_fast("t");
    g.gen_load_fast("n");
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    let f = function_of(&g, empty_globals());

    // A rank-1 tensor so the subscript is meaningful at runtime.
    let input = || HostValue::tensor(weft::Tensor::new(vec![2], weft::DType::Int64, vec![5.0, 7.0]));
    let (result, jit) = assert_parity(&f, || vec![input()]);
    let HostValue::Tensor(out) = &result else {
        panic!("expected a tensor result");
    };
    // t = x + 1 (elementwise), n = x[0] = 5; t + n = [11, 13].
    assert_eq!(out.data(), &[11.0, 13.0]);
    assert!(!jit.engine().unwrap().segments.is_empty());

    // The break still caches: an identical frame reuses both entries.
    let jit = assert_parity_cached(&f, || vec![input()]);
    assert!(jit.engine().unwrap().cache.translate_count >= 1);
}
