//! tests/modules.rs — `import` (scope isolé, cache, map d'exports) et
//! `require` (même scope, dédupliqué par chemin absolu).

use std::fs;
use std::path::PathBuf;

use lattice_core::helpers::{k_str, write_chunk_to_file};
use lattice_core::{Chunk, ChunkFlags, Op};
use lattice_vm::{ErrorKind, Value, ValueKind, Vm};

fn temp_latc(name: &str, chunk: Chunk) -> PathBuf {
    let mut p = std::env::temp_dir();
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    p.push(format!("lattice_mod_{}_{nanos}_{name}.latc", std::process::id()));
    write_chunk_to_file(chunk, &p).expect("écriture module");
    p
}

/// Module : note son exécution dans `runs`, exporte `answer`, garde
/// `__secret` et `Helper::id` hors de la map d'exports.
fn demo_module() -> Chunk {
    let mut m = Chunk::new("demo_mod", ChunkFlags::default());
    let runs = k_str(&mut m, "runs");
    let ran = k_str(&mut m, "ran");
    let push = k_str(&mut m, "push");
    let answer = k_str(&mut m, "answer");
    let secret = k_str(&mut m, "__secret");
    let helper = k_str(&mut m, "Helper::id");
    m.push_op(Op::GetGlobal(runs), 1);
    m.push_op(Op::LoadConst(ran), 1);
    m.push_op(Op::InvokeGlobal { recv: runs, name: push, argc: 1 }, 1);
    m.push_op(Op::Pop, 1);
    m.push_op(Op::LoadInt8(42), 2);
    m.push_op(Op::DefineGlobal(answer), 2);
    m.push_op(Op::LoadInt8(1), 3);
    m.push_op(Op::DefineGlobal(secret), 3);
    m.push_op(Op::LoadInt8(2), 4);
    m.push_op(Op::DefineGlobal(helper), 4);
    m.push_op(Op::LoadNil, 5);
    m.push_op(Op::Return, 5);
    m
}

#[test]
fn import_returns_exports_and_caches_side_effects() {
    let path = temp_latc("import_twice", demo_module());
    let path_s = path.to_string_lossy().into_owned();

    // runs = [] ; m1 = import(p) ; m2 = import(p) ; renvoie m2
    let mut c = Chunk::script();
    let runs = k_str(&mut c, "runs");
    let p = k_str(&mut c, &path_s);
    c.push_op(Op::BuildArray(0), 1);
    c.push_op(Op::DefineGlobal(runs), 1);
    c.push_op(Op::Import(p), 2);
    c.push_op(Op::Pop, 2);
    c.push_op(Op::Import(p), 3);
    c.push_op(Op::Return, 3);

    let mut vm = Vm::new();
    let out = vm.run(&c).expect("import ok");

    // Loi 8 : le corps du module n'a tourné qu'une fois.
    assert_eq!(
        vm.get_global("runs"),
        Some(&Value::array(vec![Value::str("ran")]))
    );

    let ValueKind::Map(exports) = &out.kind else { panic!("attendu map d'exports") };
    assert_eq!(exports.get("answer"), Some(&Value::int(42)));
    assert!(!exports.contains_key("__secret"), "noms __* exclus des exports");
    assert!(!exports.contains_key("Helper::id"), "noms qualifiés exclus des exports");

    // Les liaisons repliées dans le scope de base restent résolubles.
    assert_eq!(vm.get_global("answer"), Some(&Value::int(42)));
    assert_eq!(vm.get_global("Helper::id"), Some(&Value::int(2)));

    let _ = fs::remove_file(&path);
}

#[test]
fn import_cache_returns_clones() {
    let path = temp_latc("import_clone", demo_module());
    let path_s = path.to_string_lossy().into_owned();

    let mut setup = Chunk::script();
    let runs = k_str(&mut setup, "runs");
    let p = k_str(&mut setup, &path_s);
    setup.push_op(Op::BuildArray(0), 1);
    setup.push_op(Op::DefineGlobal(runs), 1);
    setup.push_op(Op::Import(p), 2);
    setup.push_op(Op::Return, 2);

    let mut vm = Vm::new();
    let first = vm.run(&setup).expect("import ok");

    // Une seconde exécution repart du cache : vues clonées, pas d'effets.
    let mut again = Chunk::script();
    let p2 = k_str(&mut again, &path_s);
    again.push_op(Op::Import(p2), 1);
    again.push_op(Op::Return, 1);
    let second = vm.run(&again).expect("import ok");

    assert_eq!(first, second);
    assert_eq!(
        vm.get_global("runs"),
        Some(&Value::array(vec![Value::str("ran")]))
    );

    let _ = fs::remove_file(&path);
}

#[test]
fn require_executes_in_caller_scope_once() {
    let path = temp_latc("require_twice", demo_module());
    let path_s = path.to_string_lossy().into_owned();

    let mut c = Chunk::script();
    let runs = k_str(&mut c, "runs");
    let req = k_str(&mut c, "require");
    let p = k_str(&mut c, &path_s);
    let answer = k_str(&mut c, "answer");
    c.push_op(Op::BuildArray(0), 1);
    c.push_op(Op::DefineGlobal(runs), 1);
    c.push_op(Op::GetGlobal(req), 2);
    c.push_op(Op::LoadConst(p), 2);
    c.push_op(Op::Call(1), 2);
    c.push_op(Op::Pop, 2);
    c.push_op(Op::GetGlobal(req), 3);
    c.push_op(Op::LoadConst(p), 3);
    c.push_op(Op::Call(1), 3);
    c.push_op(Op::Pop, 3);
    c.push_op(Op::GetGlobal(answer), 4);
    c.push_op(Op::Return, 4);

    let mut vm = Vm::new();
    let out = vm.run(&c).expect("require ok");
    // Les définitions du module atterrissent dans le scope de l'appelant.
    assert_eq!(out, Value::int(42));
    // Dédupliqué : une seule exécution.
    assert_eq!(
        vm.get_global("runs"),
        Some(&Value::array(vec![Value::str("ran")]))
    );

    let _ = fs::remove_file(&path);
}

#[test]
fn import_of_missing_file_is_import_error() {
    let mut c = Chunk::script();
    let p = k_str(&mut c, "/nonexistent/lattice/module.latc");
    c.push_op(Op::Import(p), 1);
    c.push_op(Op::Return, 1);
    let mut vm = Vm::new();
    let e = vm.run(&c).expect_err("fichier absent");
    assert!(matches!(e.kind, ErrorKind::Import));
}

#[test]
fn source_import_without_compiler_is_import_error() {
    // un fichier source (pas .latc) sans ModuleCompiler branché
    let mut p = std::env::temp_dir();
    p.push(format!("lattice_mod_{}_src.lat", std::process::id()));
    fs::write(&p, "let x = 1").expect("écriture source");

    let mut c = Chunk::script();
    let ps = k_str(&mut c, &p.to_string_lossy());
    c.push_op(Op::Import(ps), 1);
    c.push_op(Op::Return, 1);
    let mut vm = Vm::new();
    let e = vm.run(&c).expect_err("pas de compilateur branché");
    assert!(matches!(e.kind, ErrorKind::Import));
    assert!(e.message.contains("no module compiler"));

    let _ = fs::remove_file(&p);
}

#[test]
fn source_import_goes_through_registered_compiler() {
    use std::sync::Arc;

    let mut p = std::env::temp_dir();
    p.push(format!("lattice_mod_{}_compiled.lat", std::process::id()));
    fs::write(&p, "export val = 7").expect("écriture source");

    let mut c = Chunk::script();
    let ps = k_str(&mut c, &p.to_string_lossy());
    c.push_op(Op::Import(ps), 1);
    c.push_op(Op::Return, 1);

    let mut vm = Vm::new();
    // Compilateur jouet : ignore la source, définit `val = 7`.
    vm.set_module_compiler(Arc::new(|_src, _path| {
        let mut m = Chunk::new("toy", ChunkFlags::default());
        let val = k_str(&mut m, "val");
        m.push_op(Op::LoadInt8(7), 1);
        m.push_op(Op::DefineGlobal(val), 1);
        m.push_op(Op::LoadNil, 1);
        m.push_op(Op::Return, 1);
        Ok(m)
    }));
    let out = vm.run(&c).expect("import source ok");
    let ValueKind::Map(exports) = &out.kind else { panic!("attendu map") };
    assert_eq!(exports.get("val"), Some(&Value::int(7)));

    let _ = fs::remove_file(&p);
}
