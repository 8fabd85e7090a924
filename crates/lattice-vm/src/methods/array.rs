//! methods/array.rs — Méthodes intégrées des tableaux.
//!
//! Les méthodes à effet (`push`, `pop`, `insert`, `remove_at`) mutent le
//! receveur en place ; l'appelant réécrit le receveur dans son stockage
//! (formes `invoke_local`/`invoke_global`) et les pressions sont
//! contrôlées ici, au point de mutation.

use std::cmp::Ordering;

use lattice_core::Phase;

use crate::error::{RuntimeError, VmResult};
use crate::methods::{arg_at, arg_fn, arg_int, method_hash, MethodOutcome};
use crate::phase::Mutation;
use crate::value::{Value, ValueKind};
use crate::vm::Vm;

fn guard_phase(phase: Phase, method: &str) -> VmResult<()> {
    if phase.is_frozen() {
        return Err(RuntimeError::phase(format!(
            "cannot call mutating method '{method}' on a {phase} array"
        )));
    }
    Ok(())
}

const LEN: u32 = method_hash("len");
const PUSH: u32 = method_hash("push");
const POP: u32 = method_hash("pop");
const MAP: u32 = method_hash("map");
const FILTER: u32 = method_hash("filter");
const REDUCE: u32 = method_hash("reduce");
const EACH: u32 = method_hash("each");
const FOR_EACH: u32 = method_hash("for_each");
const FIND: u32 = method_hash("find");
const ANY: u32 = method_hash("any");
const ALL: u32 = method_hash("all");
const SORT: u32 = method_hash("sort");
const SORT_BY: u32 = method_hash("sort_by");
const FLAT: u32 = method_hash("flat");
const SLICE: u32 = method_hash("slice");
const TAKE: u32 = method_hash("take");
const DROP: u32 = method_hash("drop");
const INDEX_OF: u32 = method_hash("index_of");
const ZIP: u32 = method_hash("zip");
const UNIQUE: u32 = method_hash("unique");
const REMOVE_AT: u32 = method_hash("remove_at");
const CHUNK: u32 = method_hash("chunk");
const SUM: u32 = method_hash("sum");
const MIN: u32 = method_hash("min");
const MAX: u32 = method_hash("max");
const FIRST: u32 = method_hash("first");
const LAST: u32 = method_hash("last");
const FLAT_MAP: u32 = method_hash("flat_map");
const GROUP_BY: u32 = method_hash("group_by");
const INSERT: u32 = method_hash("insert");
const ENUMERATE: u32 = method_hash("enumerate");
const REVERSE: u32 = method_hash("reverse");
const JOIN: u32 = method_hash("join");
const CONTAINS: u32 = method_hash("contains");

pub(crate) fn dispatch(
    vm: &mut Vm,
    mut recv: Value,
    hash: u32,
    name: &str,
    args: Vec<Value>,
    pressure: Option<&str>,
) -> VmResult<MethodOutcome> {
    let phase = recv.phase;
    let result = {
        let ValueKind::Array(items) = &mut recv.kind else {
            return Ok(MethodOutcome::NoMatch { recv, args });
        };
        match hash {
            LEN => Value::int(items.len() as i64),
            FIRST => items.first().cloned().unwrap_or_else(Value::nil),
            LAST => items.last().cloned().unwrap_or_else(Value::nil),
            CONTAINS => {
                let needle = arg_at(&args, 0, name)?;
                Value::bool(items.iter().any(|v| v.eq_value(&needle)))
            }
            INDEX_OF => {
                let needle = arg_at(&args, 0, name)?;
                match items.iter().position(|v| v.eq_value(&needle)) {
                    Some(i) => Value::int(i as i64),
                    None => Value::int(-1),
                }
            }

            PUSH => {
                guard_phase(phase, name)?;
                vm.check_pressure(pressure, Mutation::Grow)?;
                items.push(arg_at(&args, 0, name)?);
                Value::int(items.len() as i64)
            }
            POP => {
                guard_phase(phase, name)?;
                vm.check_pressure(pressure, Mutation::Shrink)?;
                items.pop().unwrap_or_else(Value::nil)
            }
            INSERT => {
                guard_phase(phase, name)?;
                vm.check_pressure(pressure, Mutation::Grow)?;
                let at = arg_int(&args, 0, name)?;
                let v = arg_at(&args, 1, name)?;
                if at < 0 || at as usize > items.len() {
                    return Err(RuntimeError::bounds(format!(
                        "insert index {at} out of range (len {})",
                        items.len()
                    )));
                }
                items.insert(at as usize, v);
                Value::int(items.len() as i64)
            }
            REMOVE_AT => {
                guard_phase(phase, name)?;
                vm.check_pressure(pressure, Mutation::Shrink)?;
                let at = arg_int(&args, 0, name)?;
                if at < 0 || at as usize >= items.len() {
                    return Err(RuntimeError::bounds(format!(
                        "remove_at index {at} out of range (len {})",
                        items.len()
                    )));
                }
                items.remove(at as usize)
            }

            MAP => {
                let f = arg_fn(&args, 0, name)?;
                let mut out = Vec::with_capacity(items.len());
                for it in items.iter() {
                    out.push(vm.call_value_sync(f.clone(), vec![it.clone()])?);
                }
                Value::array(out)
            }
            FILTER => {
                let f = arg_fn(&args, 0, name)?;
                let mut out = Vec::new();
                for it in items.iter() {
                    if vm.call_value_sync(f.clone(), vec![it.clone()])?.is_truthy() {
                        out.push(it.clone());
                    }
                }
                Value::array(out)
            }
            REDUCE => {
                let f = arg_fn(&args, 0, name)?;
                let mut iter = items.iter();
                let mut acc = match args.get(1) {
                    Some(init) => init.clone(),
                    None => iter.next().cloned().unwrap_or_else(Value::nil),
                };
                for it in iter {
                    acc = vm.call_value_sync(f.clone(), vec![acc, it.clone()])?;
                }
                acc
            }
            EACH | FOR_EACH => {
                let f = arg_fn(&args, 0, name)?;
                for it in items.iter() {
                    let _ = vm.call_value_sync(f.clone(), vec![it.clone()])?;
                }
                Value::unit()
            }
            FIND => {
                let f = arg_fn(&args, 0, name)?;
                let mut found = Value::nil();
                for it in items.iter() {
                    if vm.call_value_sync(f.clone(), vec![it.clone()])?.is_truthy() {
                        found = it.clone();
                        break;
                    }
                }
                found
            }
            ANY => {
                let f = arg_fn(&args, 0, name)?;
                let mut any = false;
                for it in items.iter() {
                    if vm.call_value_sync(f.clone(), vec![it.clone()])?.is_truthy() {
                        any = true;
                        break;
                    }
                }
                Value::bool(any)
            }
            ALL => {
                let f = arg_fn(&args, 0, name)?;
                let mut all = true;
                for it in items.iter() {
                    if !vm.call_value_sync(f.clone(), vec![it.clone()])?.is_truthy() {
                        all = false;
                        break;
                    }
                }
                Value::bool(all)
            }
            FLAT_MAP => {
                let f = arg_fn(&args, 0, name)?;
                let mut out = Vec::new();
                for it in items.iter() {
                    let v = vm.call_value_sync(f.clone(), vec![it.clone()])?;
                    match v.kind {
                        ValueKind::Array(inner) => out.extend(inner),
                        _ => out.push(v),
                    }
                }
                Value::array(out)
            }
            GROUP_BY => {
                let f = arg_fn(&args, 0, name)?;
                let mut groups: ahash::AHashMap<String, Value> = ahash::AHashMap::new();
                for it in items.iter() {
                    let key_v = vm.call_value_sync(f.clone(), vec![it.clone()])?;
                    let key = match &key_v.kind {
                        ValueKind::Str(s) => s.clone(),
                        _ => key_v.canon_key(),
                    };
                    match groups.entry(key).or_insert_with(|| Value::array(Vec::new())) {
                        Value { kind: ValueKind::Array(g), .. } => g.push(it.clone()),
                        _ => {}
                    }
                }
                Value::map(groups)
            }
            SORT_BY => {
                let f = arg_fn(&args, 0, name)?;
                let mut out = items.clone();
                let mut err = None;
                out.sort_by(|a, b| {
                    if err.is_some() {
                        return Ordering::Equal;
                    }
                    match vm.call_value_sync(f.clone(), vec![a.clone(), b.clone()]) {
                        Ok(v) => match v.as_int() {
                            Some(i) => i.cmp(&0),
                            None => {
                                err = Some(RuntimeError::type_err(
                                    "sort_by comparator must return an int",
                                ));
                                Ordering::Equal
                            }
                        },
                        Err(e) => {
                            err = Some(e);
                            Ordering::Equal
                        }
                    }
                });
                if let Some(e) = err {
                    return Err(e);
                }
                Value::array(out)
            }

            SORT => {
                let mut out = items.clone();
                out.sort_by(|a, b| a.compare(b).unwrap_or(Ordering::Equal));
                Value::array(out)
            }
            FLAT => {
                let mut out = Vec::with_capacity(items.len());
                for it in items.iter() {
                    match &it.kind {
                        ValueKind::Array(inner) => out.extend(inner.iter().cloned()),
                        _ => out.push(it.clone()),
                    }
                }
                Value::array(out)
            }
            SLICE => {
                let a = arg_int(&args, 0, name)?;
                let b = arg_int(&args, 1, name)?;
                if a < 0 || b < a || b as usize > items.len() {
                    return Err(RuntimeError::bounds(format!(
                        "slice {a}..{b} out of range (len {})",
                        items.len()
                    )));
                }
                Value::array(items[a as usize..b as usize].to_vec())
            }
            TAKE => {
                let n = arg_int(&args, 0, name)?.max(0) as usize;
                Value::array(items.iter().take(n).cloned().collect())
            }
            DROP => {
                let n = arg_int(&args, 0, name)?.max(0) as usize;
                Value::array(items.iter().skip(n).cloned().collect())
            }
            ZIP => {
                let other = arg_at(&args, 0, name)?;
                let ValueKind::Array(rhs) = &other.kind else {
                    return Err(RuntimeError::type_err("zip() expects an array"));
                };
                Value::array(
                    items
                        .iter()
                        .zip(rhs.iter())
                        .map(|(a, b)| Value::tuple(vec![a.clone(), b.clone()]))
                        .collect(),
                )
            }
            UNIQUE => {
                let mut seen = ahash::AHashSet::new();
                let mut out = Vec::new();
                for it in items.iter() {
                    if seen.insert(it.canon_key()) {
                        out.push(it.clone());
                    }
                }
                Value::array(out)
            }
            CHUNK => {
                let n = arg_int(&args, 0, name)?;
                if n <= 0 {
                    return Err(RuntimeError::bounds("chunk() size must be positive"));
                }
                Value::array(
                    items
                        .chunks(n as usize)
                        .map(|c| Value::array(c.to_vec()))
                        .collect(),
                )
            }
            SUM => numeric_fold(items, name)?,
            MIN => extremum(items, Ordering::Less),
            MAX => extremum(items, Ordering::Greater),
            ENUMERATE => Value::array(
                items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| Value::tuple(vec![Value::int(i as i64), v.clone()]))
                    .collect(),
            ),
            REVERSE => Value::array(items.iter().rev().cloned().collect()),
            JOIN => {
                let sep = match args.first() {
                    Some(v) => v
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| RuntimeError::type_err("join() expects a string"))?,
                    None => String::new(),
                };
                Value::str(
                    items
                        .iter()
                        .map(|v| format!("{v}"))
                        .collect::<Vec<_>>()
                        .join(&sep),
                )
            }

            _ => return Ok(MethodOutcome::NoMatch { recv, args }),
        }
    };
    Ok(MethodOutcome::Done { result, recv })
}

/// Somme numérique : reste int tant que tout est int.
fn numeric_fold(items: &[Value], method: &str) -> VmResult<Value> {
    let mut int_acc: i64 = 0;
    let mut float_acc: f64 = 0.0;
    let mut all_int = true;
    for it in items {
        match &it.kind {
            ValueKind::Int(i) => {
                int_acc = int_acc.wrapping_add(*i);
                float_acc += *i as f64;
            }
            ValueKind::Float(x) => {
                all_int = false;
                float_acc += x;
            }
            _ => {
                return Err(RuntimeError::type_err(format!(
                    "{method}() expects numbers, got {}",
                    it.type_name()
                )));
            }
        }
    }
    Ok(if all_int { Value::int(int_acc) } else { Value::float(float_acc) })
}

fn extremum(items: &[Value], want: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for it in items {
        match best {
            None => best = Some(it),
            Some(b) => {
                if it.compare(b) == Some(want) {
                    best = Some(it);
                }
            }
        }
    }
    best.cloned().unwrap_or_else(Value::nil)
}
