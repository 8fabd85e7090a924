//! ext.rs — Interface d'extensions dynamiques.
//!
//! Une extension expose un point d'entrée d'init ; au chargement, elle
//! enregistre ses opérations nommées dans un module qui devient la valeur
//! de retour de `require_ext(name)`. Le chargeur de bibliothèques
//! dynamiques lui-même est un collaborateur externe : ici vivent le
//! registre, le cache par VM et l'**adaptateur** de conversion entre les
//! représentations hôte (`ExtValue`) et invitée (`Value`).

use ahash::AHashMap;

use crate::error::{RuntimeError, VmResult};
use crate::value::{Value, ValueKind};

/// Représentation côté extension : volontairement plate, sans partage.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtValue {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<ExtValue>),
}

/// Opération d'extension : erreurs en chaîne, converties par l'adaptateur.
pub type ExtFn = fn(&[ExtValue]) -> Result<ExtValue, String>;

/// Point d'entrée d'init d'une extension.
pub type ExtInitFn = fn(&mut ExtModule);

/// Module en cours d'enregistrement (passé à l'init).
#[derive(Debug, Default)]
pub struct ExtModule {
    ops: AHashMap<String, ExtFn>,
}

impl ExtModule {
    /// Enregistre une opération nommée.
    pub fn register(&mut self, name: impl Into<String>, f: ExtFn) {
        self.ops.insert(name.into(), f);
    }
}

/// Registre d'extensions d'une VM. Les inits sont partagés à la
/// déclaration ; le cache de modules chargés est propre à chaque VM
/// (les VM enfants repartent à vide).
#[derive(Debug, Default)]
pub struct ExtRegistry {
    inits: AHashMap<String, ExtInitFn>,
    loaded: AHashMap<String, AHashMap<String, ExtFn>>,
}

impl ExtRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Déclare une extension disponible (appelé par l'hôte au démarrage).
    pub fn declare(&mut self, name: impl Into<String>, init: ExtInitFn) {
        self.inits.insert(name.into(), init);
    }

    /// Copie des déclarations seules (VM enfant : cache vierge).
    pub fn fresh_from(&self) -> Self {
        Self { inits: self.inits.clone(), loaded: AHashMap::new() }
    }

    /// Charge (au besoin) et rend la table d'opérations de `name`.
    pub fn load(&mut self, name: &str) -> VmResult<&AHashMap<String, ExtFn>> {
        if !self.loaded.contains_key(name) {
            let init = self.inits.get(name).copied().ok_or_else(|| {
                RuntimeError::import(format!("unknown extension '{name}'"))
            })?;
            let mut module = ExtModule::default();
            init(&mut module);
            self.loaded.insert(name.to_string(), module.ops);
        }
        Ok(&self.loaded[name])
    }
}

// ---------- Adaptateur hôte ↔ invité ----------

/// Valeur VM → valeur extension. Les types à identité (ref, canal,
/// fermeture…) ne traversent pas la frontière.
pub fn to_ext(v: &Value) -> VmResult<ExtValue> {
    Ok(match &v.kind {
        ValueKind::Nil | ValueKind::Unit => ExtValue::Nil,
        ValueKind::Bool(b) => ExtValue::Bool(*b),
        ValueKind::Int(i) => ExtValue::Int(*i),
        ValueKind::Float(x) => ExtValue::Float(*x),
        ValueKind::Str(s) => ExtValue::Str(s.clone()),
        ValueKind::Array(items) => {
            ExtValue::List(items.iter().map(to_ext).collect::<VmResult<_>>()?)
        }
        ValueKind::Tuple(items) => {
            ExtValue::List(items.iter().map(to_ext).collect::<VmResult<_>>()?)
        }
        other => {
            return Err(RuntimeError::type_err(format!(
                "value of type {} cannot cross the extension boundary",
                Value::new(other.clone()).type_name()
            )));
        }
    })
}

/// Valeur extension → valeur VM.
pub fn from_ext(v: ExtValue) -> Value {
    match v {
        ExtValue::Nil => Value::nil(),
        ExtValue::Bool(b) => Value::bool(b),
        ExtValue::Int(i) => Value::int(i),
        ExtValue::Float(x) => Value::float(x),
        ExtValue::Str(s) => Value::str(s),
        ExtValue::List(items) => Value::array(items.into_iter().map(from_ext).collect()),
    }
}

/// Appelle une opération d'extension à travers l'adaptateur.
pub fn call_through_adapter(f: ExtFn, args: &[Value]) -> VmResult<Value> {
    let ext_args: Vec<ExtValue> = args.iter().map(to_ext).collect::<VmResult<_>>()?;
    match f(&ext_args) {
        Ok(out) => Ok(from_ext(out)),
        Err(msg) => Err(RuntimeError::type_err(format!("extension error: {msg}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_sum(args: &[ExtValue]) -> Result<ExtValue, String> {
        let mut acc = 0i64;
        for a in args {
            match a {
                ExtValue::Int(i) => acc += i,
                other => return Err(format!("expected int, got {other:?}")),
            }
        }
        Ok(ExtValue::Int(acc))
    }

    fn init_demo(m: &mut ExtModule) {
        m.register("sum", ext_sum);
    }

    #[test]
    fn declare_load_call() {
        let mut reg = ExtRegistry::new();
        reg.declare("demo", init_demo);
        let ops = reg.load("demo").unwrap();
        let f = ops["sum"];
        let out = call_through_adapter(f, &[Value::int(2), Value::int(3)]).unwrap();
        assert_eq!(out, Value::int(5));
    }

    #[test]
    fn unknown_extension_is_import_error() {
        let mut reg = ExtRegistry::new();
        assert!(reg.load("nope").is_err());
    }

    #[test]
    fn identity_types_do_not_cross() {
        let ch = Value::channel(crate::chan::Channel::new());
        assert!(to_ext(&ch).is_err());
    }

    #[test]
    fn child_registry_has_empty_cache() {
        let mut reg = ExtRegistry::new();
        reg.declare("demo", init_demo);
        let _ = reg.load("demo").unwrap();
        let child = reg.fresh_from();
        assert!(child.loaded.is_empty());
        assert!(child.inits.contains_key("demo"));
    }
}
