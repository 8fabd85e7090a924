//! tests/closures_defer_except.rs — Fermetures & upvalues, defers LIFO,
//! unwinding d'exceptions.

use lattice_core::bytecode::UpvalDesc;
use lattice_core::helpers::k_str;
use lattice_core::{Chunk, ChunkFlags, Op};
use lattice_vm::{ErrorKind, Value, Vm};

fn run(chunk: &Chunk) -> Value {
    let mut vm = Vm::new();
    vm.run(chunk).expect("exécution ok")
}

fn proto(name: &str) -> Chunk {
    Chunk::new(name, ChunkFlags::default())
}

// ---------- S2 : compteur par fermeture ----------

#[test]
fn s2_counter_closure_counts_one_two_three() {
    // inner : n += 1 ; renvoie n  (capture le slot 1 de mk_counter)
    let mut inner = proto("inc");
    inner.upvals.push(UpvalDesc { is_local: true, index: 1 });
    inner.push_op(Op::GetUpvalue(0), 2);
    inner.push_op(Op::LoadInt8(1), 2);
    inner.push_op(Op::Add, 2);
    inner.push_op(Op::Dup, 2);
    inner.push_op(Op::SetUpvalue(0), 2);
    inner.push_op(Op::Return, 2);

    // mk_counter : n = 0 ; renvoie inner
    let mut mk = proto("mk_counter");
    let inner_ix = mk.add_func(inner);
    mk.push_op(Op::LoadInt8(0), 1); // slot1 = n
    mk.push_op(Op::Closure(inner_ix), 1);
    mk.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let mk_ix = c.add_func(mk);
    c.push_op(Op::Closure(mk_ix), 1);
    c.push_op(Op::Call(0), 1); // slot1 = counter
    c.push_op(Op::GetLocal(1), 2);
    c.push_op(Op::Call(0), 2); // 1
    c.push_op(Op::GetLocal(1), 3);
    c.push_op(Op::Call(0), 3); // 2
    c.push_op(Op::GetLocal(1), 4);
    c.push_op(Op::Call(0), 4); // 3
    c.push_op(Op::BuildArray(3), 5);
    c.push_op(Op::Return, 5);

    assert_eq!(
        run(&c),
        Value::array(vec![Value::int(1), Value::int(2), Value::int(3)])
    );
}

// ---------- Loi 5 : deux fermetures partagent la même cellule ----------

#[test]
fn two_closures_share_one_upvalue_cell() {
    // getter : lit x ; bump : x += 5
    let mut getter = proto("get_x");
    getter.upvals.push(UpvalDesc { is_local: true, index: 1 });
    getter.push_op(Op::GetUpvalue(0), 1);
    getter.push_op(Op::Return, 1);

    let mut bump = proto("bump_x");
    bump.upvals.push(UpvalDesc { is_local: true, index: 1 });
    bump.push_op(Op::GetUpvalue(0), 1);
    bump.push_op(Op::LoadInt8(5), 1);
    bump.push_op(Op::Add, 1);
    bump.push_op(Op::SetUpvalue(0), 1);
    bump.push_op(Op::LoadNil, 1);
    bump.push_op(Op::Return, 1);

    // outer : x = 10 ; renvoie (getter, bump)
    let mut outer = proto("outer");
    let g_ix = outer.add_func(getter);
    let b_ix = outer.add_func(bump);
    outer.push_op(Op::LoadInt8(10), 1); // slot1 = x
    outer.push_op(Op::Closure(g_ix), 1);
    outer.push_op(Op::Closure(b_ix), 1);
    outer.push_op(Op::BuildTuple(2), 1);
    outer.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let o_ix = c.add_func(outer);
    c.push_op(Op::Closure(o_ix), 1);
    c.push_op(Op::Call(0), 1); // slot1 = (getter, bump)
    // bump()
    c.push_op(Op::GetLocal(1), 2);
    c.push_op(Op::LoadInt8(1), 2);
    c.push_op(Op::Index, 2);
    c.push_op(Op::Call(0), 2);
    c.push_op(Op::Pop, 2);
    // getter() → 15, la mutation est visible après la sortie du scope
    c.push_op(Op::GetLocal(1), 3);
    c.push_op(Op::LoadInt8(0), 3);
    c.push_op(Op::Index, 3);
    c.push_op(Op::Call(0), 3);
    c.push_op(Op::Return, 3);

    assert_eq!(run(&c), Value::int(15));
}

// ---------- Loi 6 : defers en LIFO, valeur de retour préservée ----------

#[test]
fn defers_run_lifo_and_preserve_return_value() {
    // corps A : log.push("A") ; corps B : log.push("B")
    let mk_body = |tag: &str| {
        let mut b = proto(tag);
        let log_k = k_str(&mut b, "log");
        let tag_k = k_str(&mut b, tag);
        let push_k = k_str(&mut b, "push");
        b.push_op(Op::GetGlobal(log_k), 1);
        b.push_op(Op::LoadConst(tag_k), 1);
        b.push_op(Op::InvokeGlobal { recv: log_k, name: push_k, argc: 1 }, 1);
        b.push_op(Op::Return, 1);
        b
    };

    let mut c = Chunk::script();
    let a_ix = c.add_func(mk_body("A"));
    let b_ix = c.add_func(mk_body("B"));
    let log_k = k_str(&mut c, "log");
    c.push_op(Op::BuildArray(0), 1);
    c.push_op(Op::DefineGlobal(log_k), 1);
    c.push_op(Op::Closure(a_ix), 2);
    c.push_op(Op::DeferPush, 2);
    c.push_op(Op::Closure(b_ix), 3);
    c.push_op(Op::DeferPush, 3);
    c.push_op(Op::LoadInt8(7), 4); // R
    c.push_op(Op::DeferRun, 4);
    c.push_op(Op::Return, 4);

    let mut vm = Vm::new();
    let out = vm.run(&c).expect("exécution ok");
    assert_eq!(out, Value::int(7));
    let log = vm.get_global("log").expect("log");
    assert_eq!(log, &Value::array(vec![Value::str("B"), Value::str("A")]));
}

// ---------- S3 : try/catch sur division par zéro ----------

#[test]
fn s3_try_catch_division_by_zero() {
    let mut c = Chunk::script();
    c.push_op(Op::PushHandler(6), 1); // resume → idx7
    c.push_op(Op::LoadInt8(1), 2);
    c.push_op(Op::LoadInt8(0), 2);
    c.push_op(Op::Div, 2);
    c.push_op(Op::PopHandler, 2);
    c.push_op(Op::LoadNil, 3);
    c.push_op(Op::Jump(1), 3); // → idx8
    c.push_op(Op::Return, 4); // catch : TOS = valeur d'erreur
    c.push_op(Op::Return, 5);

    let out = run(&c);
    let msg = out.as_str().expect("chaîne d'erreur");
    assert!(msg.contains("division by zero"), "obtenu: {msg}");
}

// ---------- Loi 7 : l'unwinding restaure la hauteur de pile ----------

#[test]
fn unwind_restores_stack_height_across_frames() {
    // thrower() { throw "deep" }
    let mut thrower = proto("thrower");
    let deep = k_str(&mut thrower, "deep");
    thrower.push_op(Op::LoadConst(deep), 1);
    thrower.push_op(Op::Throw, 1);
    thrower.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let t_ix = c.add_func(thrower);
    c.push_op(Op::PushHandler(7), 1); // resume → idx8
    c.push_op(Op::LoadInt8(9), 2); // bruit, doit disparaître
    c.push_op(Op::LoadInt8(9), 2);
    c.push_op(Op::Closure(t_ix), 3);
    c.push_op(Op::Call(0), 3);
    c.push_op(Op::PopHandler, 3);
    c.push_op(Op::LoadNil, 4);
    c.push_op(Op::Jump(4), 4); // → idx12
    c.push_op(Op::Pop, 5); // idx8 : jette la valeur d'erreur
    c.push_op(Op::LoadInt8(40), 5);
    c.push_op(Op::LoadInt8(2), 5);
    c.push_op(Op::Add, 5);
    c.push_op(Op::Return, 6); // idx12

    assert_eq!(run(&c), Value::int(42));
}

#[test]
fn user_thrown_value_reaches_catch_unwrapped() {
    // throw 42 rattrapé : la valeur elle-même refait surface
    let mut c = Chunk::script();
    c.push_op(Op::PushHandler(3), 1); // resume → idx4
    c.push_op(Op::LoadInt8(42), 2);
    c.push_op(Op::Throw, 2);
    c.push_op(Op::Return, 2);
    c.push_op(Op::Return, 3); // catch
    assert_eq!(run(&c), Value::int(42));
}

#[test]
fn uncaught_throw_surfaces_as_user_thrown() {
    let mut c = Chunk::script();
    let s = k_str(&mut c, "boom");
    c.push_op(Op::LoadConst(s), 1);
    c.push_op(Op::Throw, 1);
    c.push_op(Op::Return, 1);
    let mut vm = Vm::new();
    let e = vm.run(&c).expect_err("faute attendue");
    match e.kind {
        ErrorKind::UserThrown(v) => assert_eq!(v, Value::str("boom")),
        other => panic!("attendu UserThrown, trouvé {}", other.label()),
    }
}

#[test]
fn exception_inside_defer_propagates() {
    // le corps du defer lance ; le defer court avant le retour → faute
    let mut body = proto("defer_throws");
    let s = k_str(&mut body, "defer boom");
    body.push_op(Op::LoadConst(s), 1);
    body.push_op(Op::Throw, 1);
    body.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let b_ix = c.add_func(body);
    c.push_op(Op::Closure(b_ix), 1);
    c.push_op(Op::DeferPush, 1);
    c.push_op(Op::LoadInt8(1), 2);
    c.push_op(Op::DeferRun, 2);
    c.push_op(Op::Return, 2);

    let mut vm = Vm::new();
    let e = vm.run(&c).expect_err("faute attendue");
    assert!(matches!(e.kind, ErrorKind::UserThrown(_)));
}

#[test]
fn close_upvalue_op_closes_top_slot() {
    // simule une sortie de bloc : la cellule survit au slot
    let mut reader = proto("reader");
    reader.upvals.push(UpvalDesc { is_local: true, index: 2 });
    reader.push_op(Op::GetUpvalue(0), 1);
    reader.push_op(Op::Return, 1);

    let mut outer = proto("outer");
    let r_ix = outer.add_func(reader);
    outer.push_op(Op::LoadNil, 1); // slot1 : futur reader
    outer.push_op(Op::LoadInt8(21), 1); // slot2 = x, capturé
    outer.push_op(Op::Closure(r_ix), 1); // [nil, 21, reader]
    outer.push_op(Op::SetLocal(1), 2); // slot1 = reader, x au sommet
    outer.push_op(Op::CloseUpvalue, 2); // ferme la cellule de x, pop
    outer.push_op(Op::GetLocal(1), 2);
    outer.push_op(Op::Return, 2); // renvoie reader

    let mut c = Chunk::script();
    let o_ix = c.add_func(outer);
    c.push_op(Op::Closure(o_ix), 1);
    c.push_op(Op::Call(0), 1);
    c.push_op(Op::Call(0), 1);
    c.push_op(Op::Return, 1);

    assert_eq!(run(&c), Value::int(21));
}

#[test]
fn nested_upvalue_propagation() {
    // outer capture x ; middle propage l'upvalue d'outer vers inner
    let mut inner = proto("inner");
    inner.upvals.push(UpvalDesc { is_local: false, index: 0 });
    inner.push_op(Op::GetUpvalue(0), 1);
    inner.push_op(Op::Return, 1);

    let mut middle = proto("middle");
    middle.upvals.push(UpvalDesc { is_local: true, index: 1 });
    let i_ix = middle.add_func(inner);
    middle.push_op(Op::Closure(i_ix), 1);
    middle.push_op(Op::Return, 1);

    let mut outer = proto("outer");
    let m_ix = outer.add_func(middle);
    outer.push_op(Op::LoadInt8(11), 1); // slot1 = x
    outer.push_op(Op::Closure(m_ix), 1);
    outer.push_op(Op::Call(0), 1); // → inner
    outer.push_op(Op::Return, 1);

    let mut c = Chunk::script();
    let o_ix = c.add_func(outer);
    c.push_op(Op::Closure(o_ix), 1);
    c.push_op(Op::Call(0), 1);
    c.push_op(Op::Call(0), 1);
    c.push_op(Op::Return, 1);

    assert_eq!(run(&c), Value::int(11));
}
