//! Shared fixtures for the translation test suites.
#![allow(dead_code, reason = "each test crate uses a different subset")]

use std::{cell::RefCell, rc::Rc};

use indexmap::IndexMap;
use weft::{CodeGen, Config, DType, FunctionObject, HostIter, HostValue, JitEngine, Tensor, Vm};

/// An empty module-globals mapping.
#[must_use]
pub fn empty_globals() -> Rc<RefCell<IndexMap<String, HostValue>>> {
    Rc::new(RefCell::new(IndexMap::new()))
}

/// Assembles a finished generator into a callable function object.
#[must_use]
pub fn function_of(gen: &CodeGen, globals: Rc<RefCell<IndexMap<String, HostValue>>>) -> Rc<FunctionObject> {
    let code = Rc::new(gen.gen_code());
    Rc::new(FunctionObject {
        name: code.name.clone(),
        code,
        globals,
        defaults: Vec::new(),
        closure: Vec::new(),
    })
}

/// A scalar int64 tensor.
#[must_use]
pub fn scalar(value: i64) -> HostValue {
    HostValue::tensor(Tensor::scalar(value as f64, DType::Int64))
}

/// A live host iterator over int values, for opaque-iterator scenarios.
#[must_use]
pub fn int_iterator(values: &[i64]) -> HostValue {
    HostValue::Iterator(Rc::new(RefCell::new(HostIter {
        items: values.iter().map(|&v| HostValue::Int(v)).collect(),
        cursor: 0,
    })))
}

/// Runs `function` both without and with the translator and asserts the
/// results agree. Returns the JIT-enabled VM for cache inspection.
///
/// Arguments are produced per run so stateful values (iterators, shared
/// lists) start fresh each time.
pub fn assert_parity(function: &Rc<FunctionObject>, make_args: impl Fn() -> Vec<HostValue>) -> (HostValue, Vm) {
    let mut plain = Vm::new();
    let expected = plain
        .call(function, make_args())
        .expect("plain evaluation must succeed");

    let mut jit = Vm::with_engine(JitEngine::new(Config::default()));
    let actual = jit.call(function, make_args()).expect("translated evaluation must succeed");

    assert!(
        weft::values_equal(&expected, &actual),
        "translated result diverged: plain={} translated={}",
        weft::repr(&expected),
        weft::repr(&actual),
    );
    (actual, jit)
}

/// As [`assert_parity`], then calls again and asserts the second call
/// does not re-translate (cache determinism).
pub fn assert_parity_cached(function: &Rc<FunctionObject>, make_args: impl Fn() -> Vec<HostValue>) -> Vm {
    let (_, mut jit) = assert_parity(function, &make_args);
    let translate_count = jit.engine().expect("jit vm has an engine").cache.translate_count;

    let mut plain = Vm::new();
    let expected = plain.call(function, make_args()).expect("plain evaluation must succeed");
    let again = jit.call(function, make_args()).expect("cached evaluation must succeed");
    assert!(weft::values_equal(&expected, &again), "cached result diverged");
    assert_eq!(
        jit.engine().expect("jit vm has an engine").cache.translate_count,
        translate_count,
        "a guard-matching frame must hit the cache, not re-translate"
    );
    jit
}
