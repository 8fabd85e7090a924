//! closure.rs — Fermetures de la VM : compilées, natives, extensions.
//!
//! Le variant est explicite (pas de marqueur sentinelle dans un champ
//! recyclé) : `kind` dit ce qu'on appelle, `upvals` porte les captures,
//! `defaults` les valeurs par défaut déjà résolues depuis le pool du proto.

use std::fmt;
use std::sync::Arc;

use lattice_core::{Chunk, Phase};

use crate::error::VmResult;
use crate::ext::ExtFn;
use crate::upvalue::Upvalue;
use crate::value::Value;
use crate::vm::Vm;

/// Fonction native (host) : reçoit la VM et une vue sur les arguments.
/// Les arguments appartiennent à la VM pendant l'appel ; rien à retenir
/// au-delà du retour.
pub type NativeFn = fn(&mut Vm, &[Value]) -> VmResult<Value>;

/// Corps d'une fermeture.
#[derive(Clone)]
pub enum ClosureKind {
    /// Fonction compilée : un proto `Chunk`.
    Compiled(Arc<Chunk>),
    /// Fonction native interne à la VM.
    VmNative(NativeFn),
    /// Fonction d'extension : passe par l'adaptateur de conversion.
    ExtNative(ExtFn),
}

impl fmt::Debug for ClosureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClosureKind::Compiled(c) => write!(f, "Compiled({})", c.name),
            ClosureKind::VmNative(_) => f.write_str("VmNative(<fn>)"),
            ClosureKind::ExtNative(_) => f.write_str("ExtNative(<fn>)"),
        }
    }
}

/// Fermeture instanciée (valeur appelable).
#[derive(Debug, Clone)]
pub struct Closure {
    /// Nom de debug ("len", "main", "<anon>"…).
    pub name: String,
    pub kind: ClosureKind,
    /// Noms des paramètres (vide pour les natives).
    pub params: Vec<String>,
    /// Défauts résolus, alignés sur `params` (None = requis).
    pub defaults: Vec<Option<Value>>,
    /// Annotations de phase exigées à l'appel, alignées sur `params`.
    pub param_phases: Vec<Option<Phase>>,
    /// Le dernier paramètre ramasse-t-il les arguments restants ?
    pub variadic: bool,
    /// Cellules capturées, dans l'ordre des descripteurs du proto.
    pub upvals: Vec<Upvalue>,
}

impl Closure {
    /// Fermeture native nommée.
    pub fn native(name: impl Into<String>, f: NativeFn) -> Self {
        Self {
            name: name.into(),
            kind: ClosureKind::VmNative(f),
            params: Vec::new(),
            defaults: Vec::new(),
            param_phases: Vec::new(),
            variadic: false,
            upvals: Vec::new(),
        }
    }

    /// Fermeture d'extension nommée.
    pub fn extension(name: impl Into<String>, f: ExtFn) -> Self {
        Self {
            name: name.into(),
            kind: ClosureKind::ExtNative(f),
            params: Vec::new(),
            defaults: Vec::new(),
            param_phases: Vec::new(),
            variadic: false,
            upvals: Vec::new(),
        }
    }

    /// Le proto compilé, si c'en est un.
    pub fn chunk(&self) -> Option<&Arc<Chunk>> {
        match &self.kind {
            ClosureKind::Compiled(c) => Some(c),
            _ => None,
        }
    }

    /// Arité déclarée (paramètres nommés ; les natives n'en déclarent pas).
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    /// Nombre minimal d'arguments exigé (paramètres sans défaut).
    pub fn required_arity(&self) -> usize {
        self.defaults.iter().take_while(|d| d.is_none()).count().min(self.params.len())
    }
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ClosureKind::Compiled(_) => write!(f, "<fn {}>", self.name),
            ClosureKind::VmNative(_) => write!(f, "<native {}>", self.name),
            ClosureKind::ExtNative(_) => write!(f, "<ext {}>", self.name),
        }
    }
}
