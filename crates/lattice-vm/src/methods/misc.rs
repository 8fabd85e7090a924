//! methods/misc.rs — Méthodes intégrées : sets, tuples, ranges, enums,
//! structs, buffers, refs, canaux.
//!
//! Le `Ref` traite `get`/`deref`/`set`/`inner_type` lui-même et délègue
//! tout le reste à sa valeur intérieure (l'effet est réécrit dans la
//! cellule, donc visible de tous les porteurs).

use lattice_core::Phase;

use crate::error::{RuntimeError, VmResult};
use crate::methods::{arg_at, arg_int, method_hash, MethodOutcome};
use crate::phase::Mutation;
use crate::value::{Value, ValueKind};
use crate::vm::Vm;

const LEN: u32 = method_hash("len");
const GET: u32 = method_hash("get");
const FIRST: u32 = method_hash("first");
const LAST: u32 = method_hash("last");
const START: u32 = method_hash("start");
const END: u32 = method_hash("end");
const CONTAINS: u32 = method_hash("contains");
const TO_ARRAY: u32 = method_hash("to_array");
const ADD: u32 = method_hash("add");
const REMOVE: u32 = method_hash("remove");
const UNION: u32 = method_hash("union");
const INTERSECT: u32 = method_hash("intersect");
const DIFFERENCE: u32 = method_hash("difference");
const IS_SUBSET: u32 = method_hash("is_subset");
const SEND: u32 = method_hash("send");
const RECV: u32 = method_hash("recv");
const CLOSE: u32 = method_hash("close");
const READ_U8: u32 = method_hash("read_u8");
const READ_U16: u32 = method_hash("read_u16");
const READ_U32: u32 = method_hash("read_u32");
const WRITE_U8: u32 = method_hash("write_u8");
const WRITE_U16: u32 = method_hash("write_u16");
const WRITE_U32: u32 = method_hash("write_u32");
const RESIZE: u32 = method_hash("resize");
const DEREF: u32 = method_hash("deref");
const SET: u32 = method_hash("set");
const INNER_TYPE: u32 = method_hash("inner_type");
const VARIANT: u32 = method_hash("variant");
const ENUM_NAME: u32 = method_hash("enum_name");
const PAYLOAD: u32 = method_hash("payload");

fn guard_phase(phase: Phase, ty: &str, method: &str) -> VmResult<()> {
    if phase.is_frozen() {
        return Err(RuntimeError::phase(format!(
            "cannot call mutating method '{method}' on a {phase} {ty}"
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
    match &mut recv.kind {
        // ---------- Sets ----------
        ValueKind::Set(s) => {
            let result = match hash {
                LEN => Value::int(s.len() as i64),
                CONTAINS => Value::bool(s.contains_key(&arg_at(&args, 0, name)?.canon_key())),
                TO_ARRAY => Value::array(s.values().cloned().collect()),
                ADD => {
                    guard_phase(phase, "set", name)?;
                    let v = arg_at(&args, 0, name)?;
                    let key = v.canon_key();
                    if !s.contains_key(&key) {
                        vm.check_pressure(pressure, Mutation::Grow)?;
                    }
                    s.insert(key, v);
                    Value::int(s.len() as i64)
                }
                REMOVE => {
                    guard_phase(phase, "set", name)?;
                    vm.check_pressure(pressure, Mutation::Shrink)?;
                    let key = arg_at(&args, 0, name)?.canon_key();
                    Value::bool(s.remove(&key).is_some())
                }
                UNION => {
                    let other = expect_set(&arg_at(&args, 0, name)?, name)?;
                    let mut out = s.clone();
                    for (k, v) in other {
                        out.insert(k, v);
                    }
                    Value::new(ValueKind::Set(out))
                }
                INTERSECT => {
                    let other = expect_set(&arg_at(&args, 0, name)?, name)?;
                    let out = s
                        .iter()
                        .filter(|(k, _)| other.contains_key(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Value::new(ValueKind::Set(out))
                }
                DIFFERENCE => {
                    let other = expect_set(&arg_at(&args, 0, name)?, name)?;
                    let out = s
                        .iter()
                        .filter(|(k, _)| !other.contains_key(*k))
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect();
                    Value::new(ValueKind::Set(out))
                }
                IS_SUBSET => {
                    let other = expect_set(&arg_at(&args, 0, name)?, name)?;
                    Value::bool(s.keys().all(|k| other.contains_key(k)))
                }
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Tuples ----------
        ValueKind::Tuple(items) => {
            let result = match hash {
                LEN => Value::int(items.len() as i64),
                FIRST => items.first().cloned().unwrap_or_else(Value::nil),
                LAST => items.last().cloned().unwrap_or_else(Value::nil),
                GET => {
                    let i = arg_int(&args, 0, name)?;
                    if i < 0 || i as usize >= items.len() {
                        return Err(RuntimeError::bounds(format!(
                            "tuple index {i} out of range (len {})",
                            items.len()
                        )));
                    }
                    items[i as usize].clone()
                }
                TO_ARRAY => Value::array(items.to_vec()),
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Ranges ----------
        ValueKind::Range { start, end } => {
            let (start, end) = (*start, *end);
            let result = match hash {
                START => Value::int(start),
                END => Value::int(end),
                LEN => Value::int((end - start).max(0)),
                CONTAINS => {
                    let i = arg_int(&args, 0, name)?;
                    Value::bool(i >= start && i < end)
                }
                TO_ARRAY => Value::array((start..end).map(Value::int).collect()),
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Enums ----------
        ValueKind::Enum(ev) => {
            let result = match hash {
                ENUM_NAME => Value::str(ev.enum_name.clone()),
                VARIANT => Value::str(ev.variant.clone()),
                PAYLOAD => Value::array(ev.payload.clone()),
                LEN => Value::int(ev.payload.len() as i64),
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Structs (accès générique) ----------
        ValueKind::Struct(sv) => {
            let result = match hash {
                GET => {
                    let field = arg_at(&args, 0, name)?;
                    let field = field.as_str().ok_or_else(|| {
                        RuntimeError::type_err("get() expects a field name string")
                    })?;
                    sv.field(field).cloned().ok_or_else(|| {
                        RuntimeError::field(format!("no field '{field}' on struct {}", sv.name))
                    })?
                }
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Buffers ----------
        ValueKind::Buffer(buf) => {
            let result = match hash {
                LEN => Value::int(buf.len() as i64),
                READ_U8 => Value::int(i64::from(buf.read_u8(offset(&args, name)?)?)),
                READ_U16 => Value::int(i64::from(buf.read_u16(offset(&args, name)?)?)),
                READ_U32 => Value::int(i64::from(buf.read_u32(offset(&args, name)?)?)),
                WRITE_U8 => {
                    guard_phase(phase, "buffer", name)?;
                    let v = arg_int(&args, 1, name)?;
                    buf.write_u8(offset(&args, name)?, v as u8)?;
                    Value::unit()
                }
                WRITE_U16 => {
                    guard_phase(phase, "buffer", name)?;
                    let v = arg_int(&args, 1, name)?;
                    buf.write_u16(offset(&args, name)?, v as u16)?;
                    Value::unit()
                }
                WRITE_U32 => {
                    guard_phase(phase, "buffer", name)?;
                    let v = arg_int(&args, 1, name)?;
                    buf.write_u32(offset(&args, name)?, v as u32)?;
                    Value::unit()
                }
                RESIZE => {
                    guard_phase(phase, "buffer", name)?;
                    let n = arg_int(&args, 0, name)?;
                    if n < 0 {
                        return Err(RuntimeError::bounds("resize() expects a length >= 0"));
                    }
                    let growing = n as usize > buf.len();
                    vm.check_pressure(
                        pressure,
                        if growing { Mutation::Grow } else { Mutation::Shrink },
                    )?;
                    buf.resize(n as usize);
                    Value::unit()
                }
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Canaux ----------
        ValueKind::Channel(ch) => {
            let result = match hash {
                SEND => {
                    let v = arg_at(&args, 0, name)?;
                    ch.send(v)?;
                    Value::unit()
                }
                RECV => {
                    let (v, ok) = ch.recv();
                    Value::tuple(vec![v, Value::bool(ok)])
                }
                CLOSE => {
                    ch.close();
                    Value::unit()
                }
                LEN => Value::int(ch.len() as i64),
                _ => return Ok(MethodOutcome::NoMatch { recv, args }),
            };
            Ok(MethodOutcome::Done { result, recv })
        }

        // ---------- Refs ----------
        ValueKind::Ref(cell) => {
            match hash {
                GET | DEREF => {
                    let inner = cell.lock().clone();
                    Ok(MethodOutcome::Done { result: inner, recv })
                }
                SET => {
                    if phase.is_frozen() {
                        return Err(RuntimeError::phase(format!(
                            "cannot call mutating method 'set' on a {phase} ref"
                        )));
                    }
                    let v = arg_at(&args, 0, name)?;
                    *cell.lock() = v;
                    Ok(MethodOutcome::Done { result: Value::unit(), recv })
                }
                INNER_TYPE => {
                    let ty = cell.lock().type_name();
                    Ok(MethodOutcome::Done { result: Value::str(ty), recv })
                }
                // Délégation : l'effet s'applique à la valeur intérieure.
                _ => {
                    let cell = std::sync::Arc::clone(cell);
                    let inner = cell.lock().clone();
                    match vm.dispatch_builtin(inner, hash, name, args, pressure)? {
                        MethodOutcome::Done { result, recv: inner_after } => {
                            *cell.lock() = inner_after;
                            Ok(MethodOutcome::Done { result, recv })
                        }
                        MethodOutcome::NoMatch { args, .. } => {
                            Ok(MethodOutcome::NoMatch { recv, args })
                        }
                    }
                }
            }
        }

        _ => Ok(MethodOutcome::NoMatch { recv, args }),
    }
}

fn offset(args: &[Value], name: &str) -> VmResult<usize> {
    let off = arg_int(args, 0, name)?;
    if off < 0 {
        return Err(RuntimeError::bounds(format!("{name}() offset must be >= 0")));
    }
    Ok(off as usize)
}

fn expect_set(
    v: &Value,
    method: &str,
) -> VmResult<ahash::AHashMap<String, Value>> {
    match &v.kind {
        ValueKind::Set(s) => Ok(s.clone()),
        _ => Err(RuntimeError::type_err(format!(
            "{method}() expects a set, got {}",
            v.type_name()
        ))),
    }
}
