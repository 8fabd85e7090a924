//! methods — Dispatch des méthodes intégrées (`obj.m(args)`).
//!
//! Stratégie :
//! 1. hash FNV-1a-32 du nom, comparé aux tables précalculées par genre de
//!    valeur (un `match` sur constantes par sous-module) ;
//! 2. méthode intégrée trouvée → effet en place sur le receveur (les
//!    formes `invoke_local`/`invoke_global` écrivent le receveur muté
//!    dans son stockage) ;
//! 3. sinon, `TypeName::methodName` dans l'environnement global, appelé
//!    avec `self` injecté au slot 0 ;
//! 4. pour les structs et maps, un champ fermeture est appelable comme
//!    méthode (`self` injecté pour les structs seulement).
//!
//! Les pressions sont consultées quand le receveur est nommé (slot
//! d'`invoke_local`, nom d'`invoke_global`).

pub(crate) mod array;
pub(crate) mod map;
pub(crate) mod misc;
pub(crate) mod string;

use lattice_core::bytecode::ConstIx;

use crate::closure::ClosureKind;
use crate::error::{RuntimeError, VmResult};
use crate::value::{Value, ValueKind};
use crate::vm::Vm;

/// Hash FNV-1a 32 bits des noms de méthodes (précalculable en const).
pub(crate) const fn method_hash(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut h: u32 = 0x811c_9dc5;
    let mut i = 0;
    while i < bytes.len() {
        h ^= bytes[i] as u32;
        h = h.wrapping_mul(0x0100_0193);
        i += 1;
    }
    h
}

/// Résultat d'une tentative de dispatch intégré.
pub(crate) enum MethodOutcome {
    /// Méthode intégrée exécutée : résultat + receveur (possiblement muté).
    Done { result: Value, recv: Value },
    /// Aucune intégrée de ce nom pour ce genre : receveur et arguments
    /// rendus pour les chemins de repli.
    NoMatch { recv: Value, args: Vec<Value> },
}

/// Où réécrire le receveur muté après une intégrée à effet.
#[derive(Debug, Clone)]
enum WriteBack {
    None,
    Local(u16),
    Global(String),
}

impl Vm {
    pub(crate) fn op_invoke_stack(&mut self, name: ConstIx, argc: usize) -> VmResult<()> {
        let name = self.str_const(name)?;
        self.invoke_common(&name, argc, WriteBack::None, None)
    }

    pub(crate) fn op_invoke_local(&mut self, slot: u16, name: ConstIx, argc: usize) -> VmResult<()> {
        let name = self.str_const(name)?;
        let pressure = self.frame()?.chunk.name_of_slot(slot).map(str::to_string);
        self.invoke_common(&name, argc, WriteBack::Local(slot), pressure)
    }

    pub(crate) fn op_invoke_global(
        &mut self,
        recv: ConstIx,
        name: ConstIx,
        argc: usize,
    ) -> VmResult<()> {
        let name = self.str_const(name)?;
        let global = self.str_const(recv)?;
        self.invoke_common(&name, argc, WriteBack::Global(global.clone()), Some(global))
    }

    /// Pile à l'entrée : `[.., recv, a0..aN-1]`.
    fn invoke_common(
        &mut self,
        name: &str,
        argc: usize,
        target: WriteBack,
        pressure: Option<String>,
    ) -> VmResult<()> {
        let args = self.pop_n(argc)?;
        let recv = self.pop()?;
        let hash = method_hash(name);
        match self.dispatch_builtin(recv, hash, name, args, pressure.as_deref())? {
            MethodOutcome::Done { result, recv } => {
                match target {
                    WriteBack::None => {}
                    WriteBack::Local(slot) => self.set_local_value(slot, recv)?,
                    WriteBack::Global(g) => {
                        self.env.set(&g, recv);
                    }
                }
                self.push(result)
            }
            MethodOutcome::NoMatch { recv, args } => self.invoke_fallback(name, recv, args),
        }
    }

    /// Aiguillage par genre de receveur.
    pub(crate) fn dispatch_builtin(
        &mut self,
        recv: Value,
        hash: u32,
        name: &str,
        args: Vec<Value>,
        pressure: Option<&str>,
    ) -> VmResult<MethodOutcome> {
        match &recv.kind {
            ValueKind::Array(_) => array::dispatch(self, recv, hash, name, args, pressure),
            ValueKind::Str(_) => string::dispatch(self, recv, hash, name, args),
            ValueKind::Map(_) => map::dispatch(self, recv, hash, name, args, pressure),
            _ => misc::dispatch(self, recv, hash, name, args, pressure),
        }
    }

    /// Repli : `TypeName::method`, champs-fermetures de struct/map.
    fn invoke_fallback(&mut self, name: &str, recv: Value, args: Vec<Value>) -> VmResult<()> {
        let argc = args.len();
        let qual = format!("{}::{name}", type_label(&recv));
        if let Some(method) = self.env.get(&qual).cloned() {
            let is_compiled = method
                .as_closure()
                .is_some_and(|c| matches!(c.kind, ClosureKind::Compiled(_)));
            if is_compiled {
                // `self` injecté au slot 0.
                let base = self.stack.len();
                self.push(recv)?;
                for a in args {
                    self.push(a)?;
                }
                return self.call_at(method, base, argc);
            }
        }
        match &recv.kind {
            ValueKind::Struct(sv) => {
                if let Some(f) = sv.field(name) {
                    if f.as_closure().is_some() {
                        let method = f.clone();
                        let base = self.stack.len();
                        self.push(recv)?;
                        for a in args {
                            self.push(a)?;
                        }
                        return self.call_at(method, base, argc);
                    }
                }
            }
            ValueKind::Map(m) => {
                if let Some(f) = m.get(name) {
                    if f.as_closure().is_some() {
                        // Pas d'injection de `self` pour une map.
                        let method = f.clone();
                        let base = self.stack.len();
                        self.push(method.clone())?;
                        for a in args {
                            self.push(a)?;
                        }
                        return self.call_at(method, base, argc);
                    }
                }
            }
            _ => {}
        }
        Err(RuntimeError::type_err(format!(
            "no method '{name}' on {}",
            recv.type_name()
        )))
    }
}

/// Nom de type pour la résolution `TypeName::method`.
pub(crate) fn type_label(v: &Value) -> String {
    match &v.kind {
        ValueKind::Struct(sv) => sv.name.clone(),
        ValueKind::Enum(ev) => ev.enum_name.clone(),
        ValueKind::Nil => "Nil".into(),
        ValueKind::Unit => "Unit".into(),
        ValueKind::Bool(_) => "Bool".into(),
        ValueKind::Int(_) => "Int".into(),
        ValueKind::Float(_) => "Float".into(),
        ValueKind::Str(_) => "String".into(),
        ValueKind::Range { .. } => "Range".into(),
        ValueKind::Array(_) => "Array".into(),
        ValueKind::Map(_) => "Map".into(),
        ValueKind::Set(_) => "Set".into(),
        ValueKind::Tuple(_) => "Tuple".into(),
        ValueKind::Buffer(_) => "Buffer".into(),
        ValueKind::Ref(_) => "Ref".into(),
        ValueKind::Closure(_) => "Function".into(),
        ValueKind::Channel(_) => "Channel".into(),
    }
}

// ---------- Petits extracteurs d'arguments partagés ----------

pub(crate) fn arg_at(args: &[Value], i: usize, method: &str) -> VmResult<Value> {
    args.get(i).cloned().ok_or_else(|| {
        RuntimeError::arity(format!("{method}() expects at least {} argument(s)", i + 1))
    })
}

pub(crate) fn arg_int(args: &[Value], i: usize, method: &str) -> VmResult<i64> {
    let v = arg_at(args, i, method)?;
    v.as_int().ok_or_else(|| {
        RuntimeError::type_err(format!("{method}() expects an int, got {}", v.type_name()))
    })
}

pub(crate) fn arg_str(args: &[Value], i: usize, method: &str) -> VmResult<String> {
    let v = arg_at(args, i, method)?;
    match v.kind {
        ValueKind::Str(s) => Ok(s),
        _ => Err(RuntimeError::type_err(format!(
            "{method}() expects a string, got {}",
            v.type_name()
        ))),
    }
}

pub(crate) fn arg_fn(args: &[Value], i: usize, method: &str) -> VmResult<Value> {
    let v = arg_at(args, i, method)?;
    if v.as_closure().is_none() {
        return Err(RuntimeError::type_err(format!(
            "{method}() expects a function, got {}",
            v.type_name()
        )));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_hash_is_stable() {
        // Valeurs de référence FNV-1a-32.
        assert_eq!(method_hash(""), 0x811c_9dc5);
        assert_ne!(method_hash("len"), method_hash("push"));
    }

    #[test]
    fn builtin_names_do_not_collide() {
        let names = [
            // arrays
            "len", "push", "pop", "map", "filter", "reduce", "each", "for_each", "find", "any",
            "all", "sort", "sort_by", "flat", "slice", "take", "drop", "index_of", "zip",
            "unique", "remove_at", "chunk", "sum", "min", "max", "first", "last", "flat_map",
            "group_by", "insert", "enumerate", "reverse", "join", "contains",
            // strings
            "split", "trim", "to_upper", "to_lower", "starts_with", "ends_with", "replace",
            "substring", "chars", "bytes", "repeat", "trim_start", "trim_end", "pad_left",
            "pad_right", "count", "is_empty",
            // maps
            "get", "keys", "values", "set", "has", "entries", "merge",
            // divers
            "start", "end", "to_array", "add", "remove", "union", "intersect", "difference",
            "is_subset", "send", "recv", "close", "read_u8", "read_u16", "read_u32", "write_u8",
            "write_u16", "write_u32", "resize", "deref", "inner_type", "variant", "payload",
            "enum_name",
        ];
        let mut seen = std::collections::HashMap::new();
        for n in names {
            if let Some(prev) = seen.insert(method_hash(n), n) {
                assert_eq!(prev, n, "collision FNV entre '{prev}' et '{n}'");
            }
        }
    }
}
