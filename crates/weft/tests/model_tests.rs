//! Variable-model tests driven end-to-end: reconstruction fidelity,
//! subscript guards, and the serialized diagnostic form of the bytecode
//! model.

mod common;

use common::{empty_globals, function_of, scalar};
use pretty_assertions::assert_eq;
use weft::{
    values_equal, CodeGen, Config, DictKey, FunctionGraph, HostValue, Instruction, JitEngine, MetaInfo, Opcode,
    Tracker, VariableFactory, VariableKind, Vm,
};

/// Invariant: for a traceable variable, running the reconstruction
/// bytecode against the source frame reproduces `get_value()`.
#[test]
fn test_traceable_reconstruction_replays_frame_value() {
    let factory = VariableFactory::new();
    let mut graph = FunctionGraph::new("recon");
    let value = HostValue::list(vec![
        HostValue::Int(1),
        HostValue::str("two"),
        HostValue::list(vec![HostValue::Bool(true)]),
    ]);
    let var = factory.from_value(&value, &mut graph, Tracker::Local { name: "xs".to_string() });

    let mut gen = CodeGen::new_function("rebuild", &["xs"]);
    var.reconstruct(&mut gen).unwrap();
    gen.gen_return();

    let f = function_of(&gen, empty_globals());
    let result = Vm::new().call(&f, vec![value.clone()]).unwrap();
    assert!(values_equal(&result, &value));
}

/// A synthesized container rebuilds element-wise from its children's
/// provenance.
#[test]
fn test_synthesized_container_rebuilds_elementwise() {
    let factory = VariableFactory::new();
    let mut graph = FunctionGraph::new("recon");
    let value = HostValue::list(vec![HostValue::Int(7), HostValue::Int(8)]);
    let source = factory.from_value(&value, &mut graph, Tracker::Local { name: "xs".to_string() });

    // A list built during simulation: children come from the frame, the
    // container itself does not.
    let children = source.get_items().unwrap();
    let synthesized = weft::Variable::new(
        VariableKind::List(std::cell::RefCell::new(children.clone())),
        Tracker::Dummy { inputs: children },
    );

    let mut gen = CodeGen::new_function("rebuild", &["xs"]);
    synthesized.reconstruct(&mut gen).unwrap();
    gen.gen_return();

    let f = function_of(&gen, empty_globals());
    let result = Vm::new().call(&f, vec![value.clone()]).unwrap();
    assert!(values_equal(&result, &value));
}

/// Subscript keys join the globally-guarded set: changing the value
/// behind a guarded subscript extends the guard chain instead of reusing
/// a stale translation.
#[test]
fn test_subscript_result_is_guarded() {
    // f(d) = d['k'] + 1
    let mut g = CodeGen::new_function("subscript", &["d"]);
    g.gen_load_fast("d");
    g.gen_load_const(HostValue::str("k"));
    g.add_instr(Opcode::BinarySubscr, 0);
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    let f = function_of(&g, empty_globals());

    let dict_with = |v: i64| HostValue::dict(vec![(DictKey::Str("k".to_string()), HostValue::Int(v))]);

    let mut jit = Vm::with_engine(JitEngine::new(Config::default()));
    let first = jit.call(&f, vec![dict_with(5)]).unwrap();
    assert!(values_equal(&first, &HostValue::Int(6)));
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);

    // Same dict contents: cache hit.
    jit.call(&f, vec![dict_with(5)]).unwrap();
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);

    // Different value behind the key: guard miss, fresh entry, and the
    // folded constant follows the frame.
    let second = jit.call(&f, vec![dict_with(9)]).unwrap();
    assert!(values_equal(&second, &HostValue::Int(10)));
    assert_eq!(jit.engine().unwrap().cache.translate_count, 2);
}

/// Tensor values inside containers guard by descriptor, not by data.
#[test]
fn test_tensor_in_container_guards_by_meta() {
    // f(xs) = xs[0] + 1
    let mut g = CodeGen::new_function("tensor_item", &["xs"]);
    g.gen_load_fast("xs");
    g.gen_load_const(HostValue::Int(0));
    g.add_instr(Opcode::BinarySubscr, 0);
    g.gen_load_const(HostValue::Int(1));
    g.add_instr(Opcode::BinaryAdd, 0);
    g.gen_return();
    let f = function_of(&g, empty_globals());

    let mut jit = Vm::with_engine(JitEngine::new(Config::default()));
    let first = jit.call(&f, vec![HostValue::list(vec![scalar(1)])]).unwrap();
    let HostValue::Tensor(first) = first else { panic!("tensor expected") };
    assert_eq!(first.item().unwrap(), 2.0);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);

    // Same descriptor, different data: still a hit.
    let second = jit.call(&f, vec![HostValue::list(vec![scalar(41)])]).unwrap();
    let HostValue::Tensor(second) = second else { panic!("tensor expected") };
    assert_eq!(second.item().unwrap(), 42.0);
    assert_eq!(jit.engine().unwrap().cache.translate_count, 1);
}

/// The bytecode model serializes stably for diagnostics.
#[test]
fn test_instruction_serialization_round_trip() {
    let instr = Instruction {
        opcode: Opcode::LoadFast,
        arg: 3,
        line: 7,
    };
    let json = serde_json::to_string(&instr).unwrap();
    assert_eq!(json, r#"{"opcode":"LoadFast","arg":3,"line":7}"#);
    let back: Instruction = serde_json::from_str(&json).unwrap();
    assert_eq!(back, instr);
}

#[test]
fn test_meta_info_serialization() {
    let meta = MetaInfo::new(vec![2, 3], weft::DType::Float32, true);
    let json = serde_json::to_string(&meta).unwrap();
    let back: MetaInfo = serde_json::from_str(&json).unwrap();
    assert_eq!(back, meta);
}
