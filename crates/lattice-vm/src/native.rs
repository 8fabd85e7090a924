//! native.rs — Fonctions natives de base de la VM.
//!
//! Convention d'appel : `fn(&mut Vm, &[Value]) -> VmResult<Value>`. Les
//! arguments appartiennent à la VM le temps de l'appel ; une native
//! signale ses fautes par `Err`, jamais par un canal latéral.
//!
//! Les opérations du sous-système de phases (`track`, `phases`,
//! `history`, `rewind`, `pressurize`, `depressurize`, `grow`) sont des
//! natives : elles consultent l'état de la VM via le receveur.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::chan::Channel;
use crate::closure::ClosureKind;
use crate::error::{RuntimeError, VmResult};
use crate::phase::Pressure;
use crate::value::{Buffer, Value, ValueKind};
use crate::vm::Vm;

/// Installe le jeu de natives de base.
pub fn install_stdlib(vm: &mut Vm) {
    vm.define_native("print", native_print);
    vm.define_native("clock_ms", native_clock_ms);
    vm.define_native("sleep", native_sleep);
    vm.define_native("assert", native_assert);
    vm.define_native("exit", native_exit);
    vm.define_native("error", native_error);
    vm.define_native("len", native_len);
    vm.define_native("type_of", native_type_of);
    vm.define_native("str", native_str);
    vm.define_native("chan", native_chan);
    vm.define_native("buffer", native_buffer);
    vm.define_native("ref", native_ref);
    vm.define_native("set_of", native_set_of);

    // Sous-système de phases.
    vm.define_native("track", native_track);
    vm.define_native("phases", native_phases);
    vm.define_native("history", native_history);
    vm.define_native("rewind", native_rewind);
    vm.define_native("pressurize", native_pressurize);
    vm.define_native("depressurize", native_depressurize);
    vm.define_native("grow", native_grow);

    // Modules & extensions.
    vm.define_native("require", native_require);
    vm.define_native("require_ext", native_require_ext);
}

fn want_str(args: &[Value], i: usize, who: &str) -> VmResult<String> {
    args.get(i)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| RuntimeError::type_err(format!("{who}() expects a string argument")))
}

fn want_int(args: &[Value], i: usize, who: &str) -> VmResult<i64> {
    args.get(i)
        .and_then(Value::as_int)
        .ok_or_else(|| RuntimeError::type_err(format!("{who}() expects an int argument")))
}

fn native_print(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let line = args.iter().map(|v| format!("{v}")).collect::<Vec<_>>().join(" ");
    vm.print_line(&line);
    Ok(Value::unit())
}

fn native_clock_ms(_vm: &mut Vm, _args: &[Value]) -> VmResult<Value> {
    let ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    Ok(Value::int(ms))
}

fn native_sleep(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let ms = want_int(args, 0, "sleep")?;
    std::thread::sleep(std::time::Duration::from_millis(ms.max(0) as u64));
    Ok(Value::unit())
}

/// `assert(cond, msg)` : échec = sortie immédiate du process, code 1
/// (irrécupérable, volontairement hors du chemin d'unwinding).
fn native_assert(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let ok = args.first().map(Value::is_truthy).unwrap_or(false);
    if !ok {
        let msg = args
            .get(1)
            .map(|v| format!("{v}"))
            .unwrap_or_else(|| "assertion failed".to_string());
        eprintln!("assert: {msg}");
        std::process::exit(1);
    }
    Ok(Value::unit())
}

fn native_exit(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let code = args.first().and_then(Value::as_int).unwrap_or(0);
    std::process::exit(code as i32);
}

/// `error(v)` : lance une map `{tag: "err", value: v}`.
fn native_error(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let payload = args.first().cloned().unwrap_or_else(Value::nil);
    let mut m = ahash::AHashMap::new();
    m.insert("tag".to_string(), Value::str("err"));
    m.insert("value".to_string(), payload);
    Err(RuntimeError::thrown(Value::map(m)))
}

fn native_len(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let v = args.first().ok_or_else(|| RuntimeError::arity("len() expects 1 argument"))?;
    let n = match &v.kind {
        ValueKind::Str(s) => s.chars().count(),
        ValueKind::Array(a) => a.len(),
        ValueKind::Map(m) => m.len(),
        ValueKind::Set(s) => s.len(),
        ValueKind::Tuple(t) => t.len(),
        ValueKind::Buffer(b) => b.len(),
        ValueKind::Range { start, end } => (end - start).max(0) as usize,
        _ => {
            return Err(RuntimeError::type_err(format!(
                "len() is not defined for {}",
                v.type_name()
            )));
        }
    };
    Ok(Value::int(n as i64))
}

fn native_type_of(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let v = args.first().ok_or_else(|| RuntimeError::arity("type_of() expects 1 argument"))?;
    Ok(Value::str(v.type_name()))
}

fn native_str(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let v = args.first().ok_or_else(|| RuntimeError::arity("str() expects 1 argument"))?;
    Ok(Value::str(format!("{v}")))
}

fn native_chan(_vm: &mut Vm, _args: &[Value]) -> VmResult<Value> {
    Ok(Value::channel(Channel::new()))
}

fn native_buffer(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let n = want_int(args, 0, "buffer")?;
    if n < 0 {
        return Err(RuntimeError::bounds("buffer() expects a length >= 0"));
    }
    Ok(Value::buffer(Buffer::with_len(n as usize)))
}

fn native_ref(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let inner = args.first().cloned().unwrap_or_else(Value::nil);
    Ok(Value::new_ref(inner))
}

fn native_set_of(_vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let mut s = ahash::AHashMap::new();
    for v in args {
        s.insert(v.canon_key(), v.clone());
    }
    Ok(Value::new(ValueKind::Set(s)))
}

// ---------- Sous-système de phases ----------

fn native_track(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "track")?;
    vm.track_named(&name)?;
    Ok(Value::unit())
}

fn native_phases(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "phases")?;
    Ok(vm.phases_of(&name))
}

fn native_history(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "history")?;
    Ok(vm.history_of(&name))
}

fn native_rewind(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "rewind")?;
    let k = want_int(args, 1, "rewind")?;
    Ok(vm.rewind_of(&name, k))
}

fn native_pressurize(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "pressurize")?;
    let mode = want_str(args, 1, "pressurize")?;
    let mode = Pressure::parse(&mode).ok_or_else(|| {
        RuntimeError::pressure(format!(
            "unknown pressure mode '{mode}' (expected no_grow/no_shrink/no_resize/read_heavy)"
        ))
    })?;
    vm.set_pressure(&name, mode);
    Ok(Value::unit())
}

fn native_depressurize(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "depressurize")?;
    vm.remove_pressure(&name);
    Ok(Value::unit())
}

fn native_grow(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "grow")?;
    vm.grow_named(&name)
}

// ---------- Modules & extensions ----------

fn native_require(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let path = want_str(args, 0, "require")?;
    vm.require_module(&path)
}

fn native_require_ext(vm: &mut Vm, args: &[Value]) -> VmResult<Value> {
    let name = want_str(args, 0, "require_ext")?;
    let ops = vm.ext.load(&name)?.clone();
    let mut m = ahash::AHashMap::new();
    for (op_name, f) in ops {
        let clo = crate::closure::Closure {
            name: format!("{name}.{op_name}"),
            kind: ClosureKind::ExtNative(f),
            params: Vec::new(),
            defaults: Vec::new(),
            param_phases: Vec::new(),
            variadic: false,
            upvals: Vec::new(),
        };
        m.insert(op_name, Value::closure(clo));
    }
    Ok(Value::map(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn len_over_kinds() {
        let mut vm = Vm::new();
        assert_eq!(
            native_len(&mut vm, &[Value::str("héllo")]).unwrap(),
            Value::int(5)
        );
        assert_eq!(
            native_len(&mut vm, &[Value::range(2, 6)]).unwrap(),
            Value::int(4)
        );
        assert!(native_len(&mut vm, &[Value::int(1)]).is_err());
    }

    #[test]
    fn error_throws_tagged_map() {
        let mut vm = Vm::new();
        let err = native_error(&mut vm, &[Value::int(7)]).unwrap_err();
        let v = err.into_catch_value();
        match &v.kind {
            ValueKind::Map(m) => {
                assert_eq!(m.get("tag").and_then(|t| t.as_str()), Some("err"));
                assert_eq!(m.get("value"), Some(&Value::int(7)));
            }
            other => panic!("attendu map, trouvé {other:?}"),
        }
    }

    #[test]
    fn stdlib_is_installed() {
        let vm = Vm::new();
        for name in ["print", "track", "grow", "require", "chan"] {
            assert!(vm.get_global(name).is_some(), "native '{name}' absente");
        }
    }
}
