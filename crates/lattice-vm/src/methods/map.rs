//! methods/map.rs — Méthodes intégrées des maps.
//!
//! `set` et `merge` mutent le receveur ; l'ajout d'une clé nouvelle est
//! une croissance au sens des pressions.

use lattice_core::Phase;

use crate::error::{RuntimeError, VmResult};
use crate::methods::{arg_at, arg_fn, arg_str, method_hash, MethodOutcome};
use crate::phase::Mutation;
use crate::value::{Value, ValueKind};
use crate::vm::Vm;

const LEN: u32 = method_hash("len");
const GET: u32 = method_hash("get");
const KEYS: u32 = method_hash("keys");
const VALUES: u32 = method_hash("values");
const SET: u32 = method_hash("set");
const CONTAINS: u32 = method_hash("contains");
const HAS: u32 = method_hash("has");
const ENTRIES: u32 = method_hash("entries");
const MERGE: u32 = method_hash("merge");
const FOR_EACH: u32 = method_hash("for_each");
const FILTER: u32 = method_hash("filter");
const MAP: u32 = method_hash("map");

fn guard_phase(phase: Phase, method: &str) -> VmResult<()> {
    if phase.is_frozen() {
        return Err(RuntimeError::phase(format!(
            "cannot call mutating method '{method}' on a {phase} map"
        )));
    }
    Ok(())
}

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
        let ValueKind::Map(m) = &mut recv.kind else {
            return Ok(MethodOutcome::NoMatch { recv, args });
        };
        match hash {
            LEN => Value::int(m.len() as i64),
            GET => {
                let k = arg_str(&args, 0, name)?;
                m.get(&k).cloned().unwrap_or_else(Value::nil)
            }
            CONTAINS | HAS => {
                let k = arg_str(&args, 0, name)?;
                Value::bool(m.contains_key(&k))
            }
            KEYS => Value::array(m.keys().map(|k| Value::str(k.clone())).collect()),
            VALUES => Value::array(m.values().cloned().collect()),
            ENTRIES => Value::array(
                m.iter()
                    .map(|(k, v)| Value::tuple(vec![Value::str(k.clone()), v.clone()]))
                    .collect(),
            ),
            SET => {
                guard_phase(phase, name)?;
                let k = arg_str(&args, 0, name)?;
                let v = arg_at(&args, 1, name)?;
                if !m.contains_key(&k) {
                    vm.check_pressure(pressure, Mutation::Grow)?;
                }
                m.insert(k, v);
                Value::unit()
            }
            MERGE => {
                guard_phase(phase, name)?;
                let other = arg_at(&args, 0, name)?;
                let ValueKind::Map(rhs) = &other.kind else {
                    return Err(RuntimeError::type_err("merge() expects a map"));
                };
                let adds_keys = rhs.keys().any(|k| !m.contains_key(k));
                if adds_keys {
                    vm.check_pressure(pressure, Mutation::Grow)?;
                }
                for (k, v) in rhs {
                    m.insert(k.clone(), v.clone());
                }
                Value::unit()
            }
            FOR_EACH => {
                let f = arg_fn(&args, 0, name)?;
                let snapshot: Vec<(String, Value)> =
                    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                for (k, v) in snapshot {
                    let _ = vm.call_value_sync(f.clone(), vec![Value::str(k), v])?;
                }
                Value::unit()
            }
            FILTER => {
                let f = arg_fn(&args, 0, name)?;
                let snapshot: Vec<(String, Value)> =
                    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let mut out = ahash::AHashMap::new();
                for (k, v) in snapshot {
                    let keep = vm
                        .call_value_sync(f.clone(), vec![Value::str(k.clone()), v.clone()])?
                        .is_truthy();
                    if keep {
                        out.insert(k, v);
                    }
                }
                Value::map(out)
            }
            MAP => {
                let f = arg_fn(&args, 0, name)?;
                let snapshot: Vec<(String, Value)> =
                    m.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let mut out = ahash::AHashMap::new();
                for (k, v) in snapshot {
                    let w = vm.call_value_sync(f.clone(), vec![Value::str(k.clone()), v])?;
                    out.insert(k, w);
                }
                Value::map(out)
            }
            _ => return Ok(MethodOutcome::NoMatch { recv, args }),
        }
    };
    Ok(MethodOutcome::Done { result, recv })
}
