//! value — Modèle de valeurs dynamique de la VM Lattice.
//!
//! Chaque valeur voyage avec sa [`Phase`]. L'égalité est structurelle,
//! récursive, stricte sur les types — sauf la coercition numérique
//! (`Int == Float` passe par f64, comme les comparaisons).
//!
//! Propriété (clonage) : tout se passe par transfert/clonage **sauf**
//! `Ref` (cellule partagée, la seule identité observable), `Channel`
//! (poignée comptée) et `Closure` (l'identité des captures est le sens
//! même d'une fermeture).

pub mod buffer;

use std::cmp::Ordering;
use std::fmt::{self, Write as _};
use std::sync::Arc;

use parking_lot::Mutex;

use lattice_core::Phase;

use crate::chan::Channel;
use crate::closure::Closure;

pub use buffer::Buffer;

/// Cellule partagée mutable : le seul primitif de partage du langage.
pub type RefCell = Arc<Mutex<Value>>;

/// Valeur struct : nom + champs ordonnés + phases par champ optionnelles.
#[derive(Debug, Clone)]
pub struct StructVal {
    pub name: String,
    pub fields: Vec<(String, Value)>,
    /// Alignées sur `fields` quand le type en déclare.
    pub field_phases: Option<Vec<Phase>>,
}

impl StructVal {
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Phase déclarée du champ, si le type en porte.
    pub fn phase_of(&self, name: &str) -> Option<Phase> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        self.field_phases.as_ref().and_then(|ps| ps.get(idx).copied())
    }
}

/// Valeur enum : nom d'enum + variant + payload.
#[derive(Debug, Clone)]
pub struct EnumVal {
    pub enum_name: String,
    pub variant: String,
    pub payload: Vec<Value>,
}

/// Union taguée des types runtime.
#[derive(Debug, Clone)]
pub enum ValueKind {
    Nil,
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Intervalle entier demi-ouvert `[start, end)`.
    Range { start: i64, end: i64 },
    Array(Vec<Value>),
    Map(ahash::AHashMap<String, Value>),
    /// Clé canonique → élément.
    Set(ahash::AHashMap<String, Value>),
    Tuple(Box<[Value]>),
    Struct(StructVal),
    Enum(EnumVal),
    Buffer(Buffer),
    Ref(RefCell),
    Closure(Arc<Closure>),
    Channel(Channel),
}

/// Une valeur : sa phase + son contenu.
#[derive(Debug, Clone)]
pub struct Value {
    pub phase: Phase,
    pub kind: ValueKind,
}

// ---------- Constructeurs ----------

impl Value {
    pub fn new(kind: ValueKind) -> Self {
        Self { phase: Phase::Unphased, kind }
    }

    pub fn nil() -> Self { Self::new(ValueKind::Nil) }
    pub fn unit() -> Self { Self::new(ValueKind::Unit) }
    pub fn bool(b: bool) -> Self { Self::new(ValueKind::Bool(b)) }
    pub fn int(i: i64) -> Self { Self::new(ValueKind::Int(i)) }
    pub fn float(x: f64) -> Self { Self::new(ValueKind::Float(x)) }
    pub fn str(s: impl Into<String>) -> Self { Self::new(ValueKind::Str(s.into())) }
    pub fn range(start: i64, end: i64) -> Self { Self::new(ValueKind::Range { start, end }) }
    pub fn array(items: Vec<Value>) -> Self { Self::new(ValueKind::Array(items)) }
    pub fn map(m: ahash::AHashMap<String, Value>) -> Self { Self::new(ValueKind::Map(m)) }
    pub fn tuple(items: Vec<Value>) -> Self {
        Self::new(ValueKind::Tuple(items.into_boxed_slice()))
    }
    pub fn buffer(b: Buffer) -> Self { Self::new(ValueKind::Buffer(b)) }
    pub fn closure(c: Closure) -> Self { Self::new(ValueKind::Closure(Arc::new(c))) }
    pub fn channel(ch: Channel) -> Self { Self::new(ValueKind::Channel(ch)) }

    /// Nouvelle cellule `Ref` autour de `v`.
    pub fn new_ref(v: Value) -> Self {
        Self::new(ValueKind::Ref(Arc::new(Mutex::new(v))))
    }

    pub fn with_phase(mut self, phase: Phase) -> Self {
        self.phase = phase;
        self
    }
}

// ---------- Interrogation ----------

impl Value {
    /// Nom de type, celui des messages d'erreur et de `type_of`.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            ValueKind::Nil => "nil",
            ValueKind::Unit => "unit",
            ValueKind::Bool(_) => "bool",
            ValueKind::Int(_) => "int",
            ValueKind::Float(_) => "float",
            ValueKind::Str(_) => "string",
            ValueKind::Range { .. } => "range",
            ValueKind::Array(_) => "array",
            ValueKind::Map(_) => "map",
            ValueKind::Set(_) => "set",
            ValueKind::Tuple(_) => "tuple",
            ValueKind::Struct(_) => "struct",
            ValueKind::Enum(_) => "enum",
            ValueKind::Buffer(_) => "buffer",
            ValueKind::Ref(_) => "ref",
            ValueKind::Closure(_) => "function",
            ValueKind::Channel(_) => "channel",
        }
    }

    /// `nil`, `false` et `unit` sont falsy ; tout le reste est truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(&self.kind, ValueKind::Nil | ValueKind::Unit | ValueKind::Bool(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(&self.kind, ValueKind::Nil)
    }

    /// Valeur numérique vue en f64, si c'en est une.
    pub fn as_f64(&self) -> Option<f64> {
        match &self.kind {
            ValueKind::Int(i) => Some(*i as f64),
            ValueKind::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match &self.kind {
            ValueKind::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.kind {
            ValueKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_closure(&self) -> Option<&Arc<Closure>> {
        match &self.kind {
            ValueKind::Closure(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_channel(&self) -> Option<&Channel> {
        match &self.kind {
            ValueKind::Channel(c) => Some(c),
            _ => None,
        }
    }
}

// ---------- Égalité structurelle & comparaison ----------

impl Value {
    /// Égalité structurelle, récursive, stricte sur les types — avec
    /// coercition numérique (Int/Float comparés en f64). La phase ne
    /// participe pas à l'égalité.
    pub fn eq_value(&self, other: &Value) -> bool {
        use ValueKind::*;
        match (&self.kind, &other.kind) {
            (Nil, Nil) | (Unit, Unit) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Int(a), Float(b)) | (Float(b), Int(a)) => (*a as f64) == *b,
            (Str(a), Str(b)) => a == b,
            (Range { start: a, end: b }, Range { start: c, end: d }) => a == c && b == d,
            (Array(a), Array(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Tuple(a), Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Map(a), Map(b)) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| b.get(k).is_some_and(|w| v.eq_value(w)))
            }
            (Set(a), Set(b)) => a.len() == b.len() && a.keys().all(|k| b.contains_key(k)),
            (Struct(a), Struct(b)) => {
                a.name == b.name
                    && a.fields.len() == b.fields.len()
                    && a.fields.iter().all(|(n, v)| b.field(n).is_some_and(|w| v.eq_value(w)))
            }
            (Enum(a), Enum(b)) => {
                a.enum_name == b.enum_name
                    && a.variant == b.variant
                    && a.payload.len() == b.payload.len()
                    && a.payload.iter().zip(b.payload.iter()).all(|(x, y)| x.eq_value(y))
            }
            (Buffer(a), Buffer(b)) => a == b,
            (Ref(a), Ref(b)) => {
                Arc::ptr_eq(a, b) || a.lock().eq_value(&b.lock())
            }
            (Closure(a), Closure(b)) => Arc::ptr_eq(a, b),
            (Channel(a), Channel(b)) => a.same_channel(b),
            _ => false,
        }
    }

    /// Ordre partiel : numérique entre nombres, lexicographique entre
    /// chaînes. `None` pour tout le reste.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use ValueKind::*;
        match (&self.kind, &other.kind) {
            (Int(a), Int(b)) => Some(a.cmp(b)),
            (Str(a), Str(b)) => Some(a.cmp(b)),
            _ => {
                let (a, b) = (self.as_f64()?, other.as_f64()?);
                a.partial_cmp(&b)
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.eq_value(other)
    }
}

// ---------- Clonage / phases ----------

/// Politique de phase d'un clone profond.
#[derive(Clone, Copy)]
enum PhasePolicy {
    Keep,
    Set(Phase),
}

impl Value {
    /// Clone profond préservant la phase. `Ref`, `Channel` et `Closure`
    /// partagent (leurs identités sont le sens même de ces types).
    pub fn deep_clone(&self) -> Value {
        self.clone_with(PhasePolicy::Keep)
    }

    /// Gèle : phase `crystal`, structure partagée seulement pour `Ref`,
    /// clone profond sinon.
    pub fn freeze(&self) -> Value {
        self.clone_with(PhasePolicy::Set(Phase::Crystal))
    }

    /// Dégèle : clone profond, phase `fluid`, inconditionnellement.
    pub fn thaw(&self) -> Value {
        self.clone_with(PhasePolicy::Set(Phase::Fluid))
    }

    /// Sublime : phase `sublimated` (vue seule).
    pub fn sublimate(&self) -> Value {
        self.clone_with(PhasePolicy::Set(Phase::Sublimated))
    }

    fn clone_with(&self, policy: PhasePolicy) -> Value {
        use ValueKind::*;
        let phase = match policy {
            PhasePolicy::Keep => self.phase,
            PhasePolicy::Set(p) => p,
        };
        let kind = match &self.kind {
            Nil => Nil,
            Unit => Unit,
            Bool(b) => Bool(*b),
            Int(i) => Int(*i),
            Float(x) => Float(*x),
            Str(s) => Str(s.clone()),
            Range { start, end } => Range { start: *start, end: *end },
            Array(items) => Array(items.iter().map(|v| v.clone_with(policy)).collect()),
            Map(m) => Map(m.iter().map(|(k, v)| (k.clone(), v.clone_with(policy))).collect()),
            Set(s) => Set(s.iter().map(|(k, v)| (k.clone(), v.clone_with(policy))).collect()),
            Tuple(items) => Tuple(items.iter().map(|v| v.clone_with(policy)).collect()),
            Struct(sv) => Struct(StructVal {
                name: sv.name.clone(),
                fields: sv
                    .fields
                    .iter()
                    .map(|(n, v)| (n.clone(), v.clone_with(policy)))
                    .collect(),
                field_phases: sv.field_phases.clone(),
            }),
            Enum(ev) => Enum(EnumVal {
                enum_name: ev.enum_name.clone(),
                variant: ev.variant.clone(),
                payload: ev.payload.iter().map(|v| v.clone_with(policy)).collect(),
            }),
            Buffer(b) => Buffer(b.clone()),
            // Partage : la cellule est l'identité.
            Ref(cell) => Ref(Arc::clone(cell)),
            Closure(c) => Closure(Arc::clone(c)),
            Channel(c) => Channel(c.clone()),
        };
        Value { phase, kind }
    }
}

// ---------- Clé canonique (sets, group_by) ----------

impl Value {
    /// Forme canonique en chaîne : les chaînes sont citées pour ne pas
    /// entrer en collision avec les scalaires affichés pareil.
    pub fn canon_key(&self) -> String {
        let mut out = String::new();
        self.write_canon(&mut out);
        out
    }

    fn write_canon(&self, out: &mut String) {
        use ValueKind::*;
        match &self.kind {
            Str(s) => {
                let _ = write!(out, "{s:?}");
            }
            Array(items) => {
                out.push('[');
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    v.write_canon(out);
                }
                out.push(']');
            }
            Tuple(items) => {
                out.push('(');
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    v.write_canon(out);
                }
                out.push(')');
            }
            Map(m) => {
                let mut keys: Vec<&String> = m.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{k:?}:");
                    if let Some(v) = m.get(k) {
                        v.write_canon(out);
                    }
                }
                out.push('}');
            }
            Set(s) => {
                let mut keys: Vec<&String> = s.keys().collect();
                keys.sort();
                let _ = write!(out, "#{{{}}}", keys.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(","));
            }
            _ => {
                let _ = write!(out, "{self}");
            }
        }
    }
}

// ---------- Affichage ----------

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ValueKind::*;
        match &self.kind {
            Nil => f.write_str("nil"),
            Unit => f.write_str("()"),
            Bool(b) => write!(f, "{b}"),
            Int(i) => write!(f, "{i}"),
            Float(x) => {
                // Un float s'affiche toujours avec sa partie décimale.
                if x.fract() == 0.0 && x.is_finite() {
                    write!(f, "{x:.1}")
                } else {
                    write!(f, "{x}")
                }
            }
            Str(s) => f.write_str(s),
            Range { start, end } => write!(f, "{start}..{end}"),
            Array(items) => {
                f.write_str("[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("]")
            }
            Tuple(items) => {
                f.write_str("(")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str(")")
            }
            Map(m) => {
                f.write_str("{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                f.write_str("}")
            }
            Set(s) => {
                f.write_str("#{")?;
                for (i, (_, v)) in s.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{v}")?;
                }
                f.write_str("}")
            }
            Struct(sv) => {
                write!(f, "{} {{", sv.name)?;
                for (i, (n, v)) in sv.fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {n}: {v}")?;
                }
                f.write_str(" }")
            }
            Enum(ev) => {
                write!(f, "{}::{}", ev.enum_name, ev.variant)?;
                if !ev.payload.is_empty() {
                    f.write_str("(")?;
                    for (i, v) in ev.payload.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        write!(f, "{v}")?;
                    }
                    f.write_str(")")?;
                }
                Ok(())
            }
            Buffer(b) => write!(f, "{b}"),
            Ref(cell) => write!(f, "ref({})", cell.lock()),
            Closure(c) => write!(f, "{c}"),
            Channel(_) => f.write_str("<channel>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(!Value::nil().is_truthy());
        assert!(!Value::bool(false).is_truthy());
        assert!(!Value::unit().is_truthy());
        assert!(Value::int(0).is_truthy());
        assert!(Value::str("").is_truthy());
    }

    #[test]
    fn numeric_coercion_in_eq() {
        assert_eq!(Value::int(2), Value::float(2.0));
        assert_ne!(Value::int(2), Value::float(2.5));
        assert_ne!(Value::int(1), Value::str("1"));
    }

    #[test]
    fn deep_clone_is_independent() {
        let v = Value::array(vec![Value::int(1), Value::array(vec![Value::int(2)])]);
        let mut c = v.deep_clone();
        assert_eq!(v, c);
        if let ValueKind::Array(items) = &mut c.kind {
            items.push(Value::int(3));
        }
        assert_ne!(v, c);
    }

    #[test]
    fn ref_clone_shares() {
        let v = Value::new_ref(Value::int(1));
        let c = v.deep_clone();
        if let (ValueKind::Ref(a), ValueKind::Ref(b)) = (&v.kind, &c.kind) {
            assert!(Arc::ptr_eq(a, b));
        } else {
            panic!("attendu Ref");
        }
    }

    #[test]
    fn freeze_thaw_roundtrip() {
        let v = Value::array(vec![Value::int(1), Value::str("a")]);
        let frozen = v.freeze();
        assert_eq!(frozen.phase, Phase::Crystal);
        if let ValueKind::Array(items) = &frozen.kind {
            assert_eq!(items[0].phase, Phase::Crystal);
        }
        let thawed = frozen.thaw();
        assert_eq!(thawed.phase, Phase::Fluid);
        assert_eq!(thawed, v);
    }

    #[test]
    fn canon_keys_distinguish_types() {
        assert_ne!(Value::int(1).canon_key(), Value::str("1").canon_key());
        assert_eq!(Value::int(1).canon_key(), Value::int(1).canon_key());
    }

    #[test]
    fn display_shapes() {
        assert_eq!(format!("{}", Value::range(0, 3)), "0..3");
        assert_eq!(format!("{}", Value::tuple(vec![Value::int(1), Value::int(2)])), "(1, 2)");
        assert_eq!(format!("{}", Value::float(2.0)), "2.0");
    }
}
