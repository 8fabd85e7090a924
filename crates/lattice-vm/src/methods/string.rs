//! methods/string.rs — Méthodes intégrées des chaînes.
//!
//! Tout est non-mutant : une chaîne se transforme, elle ne se modifie pas.
//! Les index (`index_of`, `substring`…) comptent en *caractères*.

use crate::error::{RuntimeError, VmResult};
use crate::methods::{arg_int, arg_str, method_hash, MethodOutcome};
use crate::value::{Value, ValueKind};
use crate::vm::Vm;

const LEN: u32 = method_hash("len");
const CONTAINS: u32 = method_hash("contains");
const SPLIT: u32 = method_hash("split");
const TRIM: u32 = method_hash("trim");
const TO_UPPER: u32 = method_hash("to_upper");
const TO_LOWER: u32 = method_hash("to_lower");
const STARTS_WITH: u32 = method_hash("starts_with");
const ENDS_WITH: u32 = method_hash("ends_with");
const REPLACE: u32 = method_hash("replace");
const INDEX_OF: u32 = method_hash("index_of");
const SUBSTRING: u32 = method_hash("substring");
const CHARS: u32 = method_hash("chars");
const BYTES: u32 = method_hash("bytes");
const REVERSE: u32 = method_hash("reverse");
const REPEAT: u32 = method_hash("repeat");
const TRIM_START: u32 = method_hash("trim_start");
const TRIM_END: u32 = method_hash("trim_end");
const PAD_LEFT: u32 = method_hash("pad_left");
const PAD_RIGHT: u32 = method_hash("pad_right");
const COUNT: u32 = method_hash("count");
const IS_EMPTY: u32 = method_hash("is_empty");

pub(crate) fn dispatch(
    _vm: &mut Vm,
    recv: Value,
    hash: u32,
    name: &str,
    args: Vec<Value>,
) -> VmResult<MethodOutcome> {
    let result = {
        let ValueKind::Str(s) = &recv.kind else {
            return Ok(MethodOutcome::NoMatch { recv, args });
        };
        match hash {
            LEN => Value::int(s.chars().count() as i64),
            IS_EMPTY => Value::bool(s.is_empty()),
            CONTAINS => Value::bool(s.contains(&arg_str(&args, 0, name)?)),
            STARTS_WITH => Value::bool(s.starts_with(&arg_str(&args, 0, name)?)),
            ENDS_WITH => Value::bool(s.ends_with(&arg_str(&args, 0, name)?)),
            SPLIT => {
                let sep = arg_str(&args, 0, name)?;
                let parts: Vec<Value> = if sep.is_empty() {
                    s.chars().map(|c| Value::str(c.to_string())).collect()
                } else {
                    s.split(&sep).map(Value::str).collect()
                };
                Value::array(parts)
            }
            TRIM => Value::str(s.trim()),
            TRIM_START => Value::str(s.trim_start()),
            TRIM_END => Value::str(s.trim_end()),
            TO_UPPER => Value::str(s.to_uppercase()),
            TO_LOWER => Value::str(s.to_lowercase()),
            REPLACE => {
                let from = arg_str(&args, 0, name)?;
                let to = arg_str(&args, 1, name)?;
                Value::str(s.replace(&from, &to))
            }
            INDEX_OF => {
                let needle = arg_str(&args, 0, name)?;
                match s.find(&needle) {
                    Some(byte_pos) => Value::int(s[..byte_pos].chars().count() as i64),
                    None => Value::int(-1),
                }
            }
            SUBSTRING => {
                let a = arg_int(&args, 0, name)?;
                let b = arg_int(&args, 1, name)?;
                let chars: Vec<char> = s.chars().collect();
                if a < 0 || b < a || b as usize > chars.len() {
                    return Err(RuntimeError::bounds(format!(
                        "substring {a}..{b} out of range (len {})",
                        chars.len()
                    )));
                }
                Value::str(chars[a as usize..b as usize].iter().collect::<String>())
            }
            CHARS => Value::array(s.chars().map(|c| Value::str(c.to_string())).collect()),
            BYTES => Value::array(s.bytes().map(|b| Value::int(i64::from(b))).collect()),
            REVERSE => Value::str(s.chars().rev().collect::<String>()),
            REPEAT => {
                let n = arg_int(&args, 0, name)?;
                if n < 0 {
                    return Err(RuntimeError::bounds("repeat() count must be >= 0"));
                }
                Value::str(s.repeat(n as usize))
            }
            PAD_LEFT => pad(s, &args, name, true)?,
            PAD_RIGHT => pad(s, &args, name, false)?,
            COUNT => {
                let needle = arg_str(&args, 0, name)?;
                if needle.is_empty() {
                    Value::int(0)
                } else {
                    Value::int(s.matches(&needle).count() as i64)
                }
            }
            _ => return Ok(MethodOutcome::NoMatch { recv, args }),
        }
    };
    Ok(MethodOutcome::Done { result, recv })
}

/// `pad_left(width)` / `pad_right(width, fill = " ")`.
fn pad(s: &str, args: &[Value], name: &str, left: bool) -> VmResult<Value> {
    let width = arg_int(args, 0, name)?;
    let fill = match args.get(1) {
        Some(v) => v
            .as_str()
            .and_then(|f| f.chars().next())
            .ok_or_else(|| RuntimeError::type_err("pad fill must be a non-empty string"))?,
        None => ' ',
    };
    let len = s.chars().count() as i64;
    if width <= len {
        return Ok(Value::str(s));
    }
    let padding: String = std::iter::repeat(fill).take((width - len) as usize).collect();
    Ok(Value::str(if left {
        format!("{padding}{s}")
    } else {
        format!("{s}{padding}")
    }))
}
