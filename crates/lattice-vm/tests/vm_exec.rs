//! tests/vm_exec.rs — Exécution de base : arithmétique, variables,
//! constructeurs de données, indexation, fautes.
//!
//! Les chunks sont assemblés à la main (le compilateur est un
//! collaborateur externe) ; chaque scénario note sa discipline de pile.

use lattice_core::helpers::{k_i64, k_str};
use lattice_core::{Chunk, ChunkFlags, ConstValue, Op, Phase};
use lattice_vm::{ErrorKind, Value, ValueKind, Vm, VmOptions};

fn run(chunk: &Chunk) -> Value {
    let mut vm = Vm::new();
    vm.run(chunk).expect("exécution ok")
}

fn run_err(chunk: &Chunk) -> lattice_vm::RuntimeError {
    let mut vm = Vm::new();
    vm.run(chunk).expect_err("faute attendue")
}

fn proto(name: &str) -> Chunk {
    Chunk::new(name, ChunkFlags::default())
}

#[test]
fn s1_add_two_small_ints() {
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::Add, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::int(5));
}

#[test]
fn int_float_promotion() {
    let mut c = Chunk::script();
    let kf = c.add_const(ConstValue::F64(0.5));
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::LoadConst(kf), 1);
    c.push_op(Op::Add, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::float(2.5));
}

#[test]
fn string_concat_with_plus() {
    let mut c = Chunk::script();
    let a = k_str(&mut c, "lat");
    let b = k_str(&mut c, "tice");
    c.push_op(Op::LoadConst(a), 1);
    c.push_op(Op::LoadConst(b), 1);
    c.push_op(Op::Add, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::str("lattice"));
}

#[test]
fn division_by_zero_is_arithmetic_error() {
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(1), 3);
    c.push_op(Op::LoadInt8(0), 3);
    c.push_op(Op::Div, 3);
    c.push_op(Op::Return, 3);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::Arithmetic));
    assert!(e.message.contains("division by zero"));
    assert_eq!(e.line, Some(3));
    assert!(e.trace.iter().any(|f| f.contains("<script>")));
}

#[test]
fn plus_on_mixed_types_is_type_error() {
    let mut c = Chunk::script();
    let s = k_str(&mut c, "x");
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::LoadConst(s), 1);
    c.push_op(Op::Add, 1);
    c.push_op(Op::Return, 1);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::Type));
    assert!(e.message.contains("operands must be numbers for '+'"));
}

#[test]
fn comparisons_and_jumps() {
    // if 2 < 3 { 10 } else { 20 }
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::Lt, 1);
    c.push_op(Op::JumpIfFalse(2), 1); // → idx6
    c.push_op(Op::LoadInt8(10), 2);
    c.push_op(Op::Jump(1), 2); // → idx7
    c.push_op(Op::LoadInt8(20), 3);
    c.push_op(Op::Return, 4);
    assert_eq!(run(&c), Value::int(10));
}

#[test]
fn loop_with_int_fast_path() {
    // i = 0 ; tant que i < 5 { i += 1 } ; renvoie i
    let mut c = Chunk::script();
    c.set_local_name(1, "i");
    c.push_op(Op::LoadInt8(0), 1); // slot1 = i
    // idx1:
    c.push_op(Op::GetLocal(1), 2);
    c.push_op(Op::LoadInt8(5), 2);
    c.push_op(Op::LtInt, 2);
    c.push_op(Op::JumpIfFalse(2), 2); // → idx7
    c.push_op(Op::IncLocal(1), 3);
    c.push_op(Op::Loop(6), 3); // → idx1
    c.push_op(Op::GetLocal(1), 4);
    c.push_op(Op::Return, 4);
    assert_eq!(run(&c), Value::int(5));
}

#[test]
fn globals_define_get_set() {
    let mut c = Chunk::script();
    let g = k_str(&mut c, "acc");
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::DefineGlobal(g), 1);
    c.push_op(Op::GetGlobal(g), 2);
    c.push_op(Op::LoadInt8(2), 2);
    c.push_op(Op::Add, 2);
    c.push_op(Op::SetGlobal(g), 2);
    c.push_op(Op::GetGlobal(g), 3);
    c.push_op(Op::Return, 3);
    assert_eq!(run(&c), Value::int(3));
}

#[test]
fn undefined_global_is_name_error() {
    let mut c = Chunk::script();
    let g = k_str(&mut c, "ghost");
    c.push_op(Op::GetGlobal(g), 1);
    c.push_op(Op::Return, 1);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::Name));
    assert!(e.message.contains("ghost"));
}

#[test]
fn build_and_index_array_map_tuple() {
    // [4, 5][1] + {"k": 7}["k"] + (8, 9).0
    let mut c = Chunk::script();
    let kk = k_str(&mut c, "k");
    c.push_op(Op::LoadInt8(4), 1);
    c.push_op(Op::LoadInt8(5), 1);
    c.push_op(Op::BuildArray(2), 1);
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::Index, 1); // 5
    c.push_op(Op::LoadConst(kk), 2);
    c.push_op(Op::LoadInt8(7), 2);
    c.push_op(Op::BuildMap(1), 2);
    c.push_op(Op::LoadConst(kk), 2);
    c.push_op(Op::Index, 2); // 7
    c.push_op(Op::Add, 2);
    c.push_op(Op::LoadInt8(8), 3);
    c.push_op(Op::LoadInt8(9), 3);
    c.push_op(Op::BuildTuple(2), 3);
    c.push_op(Op::LoadInt8(0), 3);
    c.push_op(Op::Index, 3); // 8
    c.push_op(Op::Add, 3);
    c.push_op(Op::Return, 3);
    assert_eq!(run(&c), Value::int(20));
}

#[test]
fn array_index_out_of_range_is_bounds_error() {
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::BuildArray(1), 1);
    c.push_op(Op::LoadInt8(4), 1);
    c.push_op(Op::Index, 1);
    c.push_op(Op::Return, 1);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::Bounds));
}

#[test]
fn struct_fields_get_set() {
    let mut c = Chunk::script();
    let ty = k_str(&mut c, "Point");
    let fx = k_str(&mut c, "x");
    let fy = k_str(&mut c, "y");
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(
        Op::BuildStruct { name: ty, fields: vec![fx, fy].into_boxed_slice() },
        1,
    );
    c.push_op(Op::LoadInt8(9), 2);
    c.push_op(Op::SetField(fx), 2); // x = 9, struct reposé
    c.push_op(Op::GetField(fx), 3);
    c.push_op(Op::Return, 3);
    assert_eq!(run(&c), Value::int(9));
}

#[test]
fn missing_struct_field_is_field_error() {
    let mut c = Chunk::script();
    let ty = k_str(&mut c, "Point");
    let fx = k_str(&mut c, "x");
    let fz = k_str(&mut c, "z");
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::BuildStruct { name: ty, fields: vec![fx].into_boxed_slice() }, 1);
    c.push_op(Op::GetField(fz), 2);
    c.push_op(Op::Return, 2);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::Field));
}

#[test]
fn range_and_enum_builders() {
    let mut c = Chunk::script();
    let en = k_str(&mut c, "Shape");
    let var = k_str(&mut c, "Circle");
    c.push_op(Op::LoadInt8(0), 1);
    c.push_op(Op::LoadInt8(4), 1);
    c.push_op(Op::BuildRange, 1);
    c.push_op(Op::LoadInt8(3), 2);
    c.push_op(Op::BuildEnum { enum_name: en, variant: var, payload: 1 }, 2);
    c.push_op(Op::BuildTuple(2), 2);
    c.push_op(Op::Return, 2);
    let out = run(&c);
    let ValueKind::Tuple(items) = &out.kind else { panic!("attendu tuple") };
    assert_eq!(items[0], Value::range(0, 4));
    let ValueKind::Enum(ev) = &items[1].kind else { panic!("attendu enum") };
    assert_eq!(ev.enum_name, "Shape");
    assert_eq!(ev.variant, "Circle");
    assert_eq!(ev.payload, vec![Value::int(3)]);
}

#[test]
fn array_flatten_spreads_one_level() {
    // [1, [2, 3], 4] aplati → [1, 2, 3, 4]
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::BuildArray(2), 1);
    c.push_op(Op::LoadInt8(4), 1);
    c.push_op(Op::BuildArray(3), 1);
    c.push_op(Op::ArrayFlatten, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(
        run(&c),
        Value::array(vec![Value::int(1), Value::int(2), Value::int(3), Value::int(4)])
    );
}

#[test]
fn try_unwrap_ok_and_err() {
    // {"tag": "ok", "value": 5} déballé → 5
    let mut c = Chunk::script();
    let tag = k_str(&mut c, "tag");
    let ok = k_str(&mut c, "ok");
    let val = k_str(&mut c, "value");
    c.push_op(Op::LoadConst(tag), 1);
    c.push_op(Op::LoadConst(ok), 1);
    c.push_op(Op::LoadConst(val), 1);
    c.push_op(Op::LoadInt8(5), 1);
    c.push_op(Op::BuildMap(2), 1);
    c.push_op(Op::TryUnwrap, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::int(5));

    // {"tag": "err"} relancé
    let mut c = Chunk::script();
    let tag = k_str(&mut c, "tag");
    let errs = k_str(&mut c, "err");
    c.push_op(Op::LoadConst(tag), 1);
    c.push_op(Op::LoadConst(errs), 1);
    c.push_op(Op::BuildMap(1), 1);
    c.push_op(Op::TryUnwrap, 1);
    c.push_op(Op::Return, 1);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::UserThrown(_)));
}

#[test]
fn halt_stops_with_tos() {
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(9), 1);
    c.push_op(Op::Halt, 1);
    c.push_op(Op::LoadInt8(1), 2); // jamais atteint
    c.push_op(Op::Return, 2);
    assert_eq!(run(&c), Value::int(9));
}

#[test]
fn call_with_wrong_arity_is_arity_error() {
    let mut f = proto("pair");
    f.params.push(lattice_core::ParamSpec::required("a"));
    f.params.push(lattice_core::ParamSpec::required("b"));
    f.push_op(Op::GetLocal(1), 1);
    f.push_op(Op::GetLocal(2), 1);
    f.push_op(Op::Add, 1);
    f.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let fi = c.add_func(f);
    c.push_op(Op::Closure(fi), 1);
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::Call(1), 1); // il manque `b`
    c.push_op(Op::Return, 1);
    let e = run_err(&c);
    assert!(matches!(e.kind, ErrorKind::Arity));
    assert!(e.message.contains("pair"));
}

#[test]
fn parameter_defaults_fill_missing_args() {
    let mut f = proto("scaled");
    let d = k_i64(&mut f, 10);
    f.params.push(lattice_core::ParamSpec::required("x"));
    f.params.push(lattice_core::ParamSpec {
        name: "factor".into(),
        default: Some(d),
        phase: None,
    });
    f.push_op(Op::GetLocal(1), 1);
    f.push_op(Op::GetLocal(2), 1);
    f.push_op(Op::Mul, 1);
    f.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let fi = c.add_func(f);
    c.push_op(Op::Closure(fi), 1);
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::Call(1), 1); // factor prend son défaut
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::int(30));
}

#[test]
fn variadic_rest_is_collected() {
    let mut f = proto("count_rest");
    f.params.push(lattice_core::ParamSpec::required("first"));
    f.params.push(lattice_core::ParamSpec::required("rest"));
    f.variadic = true;
    // renvoie rest.len()
    let m_len = k_str(&mut f, "len");
    f.push_op(Op::GetLocal(2), 1);
    f.push_op(Op::Invoke { name: m_len, argc: 0 }, 1);
    f.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let fi = c.add_func(f);
    c.push_op(Op::Closure(fi), 1);
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::Call(3), 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::int(2));
}

#[test]
fn deep_recursion_is_stack_overflow() {
    // f() { f() } — profondeur bornée par les options
    let mut f = proto("f");
    let g = k_str(&mut f, "f");
    f.push_op(Op::GetGlobal(g), 1);
    f.push_op(Op::Call(0), 1);
    f.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let fi = c.add_func(f);
    let g = k_str(&mut c, "f");
    c.push_op(Op::Closure(fi), 1);
    c.push_op(Op::DefineGlobal(g), 1);
    c.push_op(Op::GetGlobal(g), 2);
    c.push_op(Op::Call(0), 2);
    c.push_op(Op::Return, 2);

    let mut vm = Vm::with_options(VmOptions::default().with_call_depth_limit(64));
    let e = vm.run(&c).expect_err("débordement attendu");
    assert!(matches!(e.kind, ErrorKind::StackOverflow));
    assert!(e.trace.iter().any(|l| l.contains("in f()")));
}

#[test]
fn print_goes_to_captured_stdout() {
    let mut c = Chunk::script();
    let s = k_str(&mut c, "hello");
    c.push_op(Op::LoadConst(s), 1);
    c.push_op(Op::LoadInt8(7), 1);
    c.push_op(Op::Print(2), 1);
    c.push_op(Op::Return, 1);
    let mut vm = Vm::with_options(VmOptions::default().with_capture_stdout(true));
    vm.run(&c).unwrap();
    assert_eq!(vm.take_stdout(), "hello 7\n");
}

#[test]
fn builtin_method_then_global_fallback() {
    // [7, 8].second() via la globale "Array::second" (self au slot 0)
    let mut m = proto("second");
    m.push_op(Op::GetLocal(0), 1);
    m.push_op(Op::LoadInt8(1), 1);
    m.push_op(Op::Index, 1);
    m.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let mi = c.add_func(m);
    let qual = k_str(&mut c, "Array::second");
    let name = k_str(&mut c, "second");
    c.push_op(Op::Closure(mi), 1);
    c.push_op(Op::DefineGlobal(qual), 1);
    c.push_op(Op::LoadInt8(7), 2);
    c.push_op(Op::LoadInt8(8), 2);
    c.push_op(Op::BuildArray(2), 2);
    c.push_op(Op::Invoke { name, argc: 0 }, 2);
    c.push_op(Op::Return, 2);
    assert_eq!(run(&c), Value::int(8));
}

#[test]
fn builtin_array_methods_through_invoke() {
    // [3, 1, 2].sort().join("-")
    let mut c = Chunk::script();
    let m_sort = k_str(&mut c, "sort");
    let m_join = k_str(&mut c, "join");
    let sep = k_str(&mut c, "-");
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::BuildArray(3), 1);
    c.push_op(Op::Invoke { name: m_sort, argc: 0 }, 1);
    c.push_op(Op::LoadConst(sep), 1);
    c.push_op(Op::Invoke { name: m_join, argc: 1 }, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c), Value::str("1-2-3"));
}

#[test]
fn invoke_local_writes_receiver_back() {
    // xs = [1] ; xs.push(2) ; xs.len()
    let mut c = Chunk::script();
    c.set_local_name(1, "xs");
    let m_push = k_str(&mut c, "push");
    let m_len = k_str(&mut c, "len");
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::BuildArray(1), 1); // slot1
    c.push_op(Op::GetLocal(1), 2);
    c.push_op(Op::LoadInt8(2), 2);
    c.push_op(Op::InvokeLocal { slot: 1, name: m_push, argc: 1 }, 2);
    c.push_op(Op::Pop, 2);
    c.push_op(Op::GetLocal(1), 3);
    c.push_op(Op::InvokeLocal { slot: 1, name: m_len, argc: 0 }, 3);
    c.push_op(Op::Return, 3);
    assert_eq!(run(&c), Value::int(2));
}

#[test]
fn map_with_closure_callback() {
    // [1, 2, 3].map(|x| x * 2)
    let mut f = proto("twice");
    f.params.push(lattice_core::ParamSpec::required("x"));
    f.push_op(Op::GetLocal(1), 1);
    f.push_op(Op::LoadInt8(2), 1);
    f.push_op(Op::Mul, 1);
    f.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let fi = c.add_func(f);
    let m_map = k_str(&mut c, "map");
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::LoadInt8(2), 1);
    c.push_op(Op::LoadInt8(3), 1);
    c.push_op(Op::BuildArray(3), 1);
    c.push_op(Op::Closure(fi), 1);
    c.push_op(Op::Invoke { name: m_map, argc: 1 }, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(
        run(&c),
        Value::array(vec![Value::int(2), Value::int(4), Value::int(6)])
    );
}

#[test]
fn clone_of_frozen_value_keeps_phase() {
    let mut c = Chunk::script();
    c.push_op(Op::LoadInt8(1), 1);
    c.push_op(Op::BuildArray(1), 1);
    c.push_op(Op::Freeze, 1);
    c.push_op(Op::CloneVal, 1);
    c.push_op(Op::Return, 1);
    assert_eq!(run(&c).phase, Phase::Crystal);
}
