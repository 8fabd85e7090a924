//! upvalue.rs — Médiateur entre une fermeture et un slot de pile.
//!
//! Un upvalue est *ouvert* (index de slot dans la pile de la VM
//! propriétaire) ou *fermé* (possède sa valeur). La VM garde la liste des
//! upvalues ouverts triée par slot croissant ; fermer tout ce qui dépasse
//! une borne se fait en détachant la queue de la liste.
//!
//! Les cellules sont partagées (`Arc<Mutex>`) : plusieurs fermetures
//! peuvent capturer le même slot et observent les mêmes écritures, y
//! compris après la fermeture du scope englobant.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::value::Value;

/// État interne d'une cellule d'upvalue.
#[derive(Debug, Clone)]
pub enum UpvalueState {
    /// Pointe un slot encore vivant de la pile de la VM propriétaire.
    Open(usize),
    /// Possède sa valeur (le scope d'origine est sorti).
    Closed(Value),
}

/// Cellule d'upvalue partagée.
#[derive(Debug, Clone)]
pub struct Upvalue(Arc<Mutex<UpvalueState>>);

impl Upvalue {
    /// Nouvelle cellule ouverte sur `slot`.
    pub fn open(slot: usize) -> Self {
        Self(Arc::new(Mutex::new(UpvalueState::Open(slot))))
    }

    /// Nouvelle cellule déjà fermée (transfert inter-threads, snapshots).
    pub fn closed(v: Value) -> Self {
        Self(Arc::new(Mutex::new(UpvalueState::Closed(v))))
    }

    /// Slot pointé si la cellule est encore ouverte.
    pub fn open_slot(&self) -> Option<usize> {
        match &*self.0.lock() {
            UpvalueState::Open(s) => Some(*s),
            UpvalueState::Closed(_) => None,
        }
    }

    /// Lit à travers la cellule ; `stack` est la pile de la VM propriétaire.
    pub fn get(&self, stack: &[Value]) -> Value {
        match &*self.0.lock() {
            UpvalueState::Open(slot) => stack.get(*slot).cloned().unwrap_or_else(Value::nil),
            UpvalueState::Closed(v) => v.clone(),
        }
    }

    /// Écrit à travers la cellule.
    pub fn set(&self, stack: &mut [Value], v: Value) {
        let mut st = self.0.lock();
        match &mut *st {
            UpvalueState::Open(slot) => {
                if let Some(cell) = stack.get_mut(*slot) {
                    *cell = v;
                }
            }
            UpvalueState::Closed(held) => *held = v,
        }
    }

    /// Ferme la cellule en capturant `v`.
    pub fn close(&self, v: Value) {
        *self.0.lock() = UpvalueState::Closed(v);
    }

    /// Deux poignées pour la même cellule ?
    pub fn same_cell(&self, other: &Upvalue) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Snapshot transférable entre threads : une cellule ouverte devient
    /// une cellule fermée sur la valeur courante du slot.
    pub fn snapshot(&self, stack: &[Value]) -> Upvalue {
        match &*self.0.lock() {
            UpvalueState::Open(slot) => {
                Upvalue::closed(stack.get(*slot).cloned().unwrap_or_else(Value::nil))
            }
            UpvalueState::Closed(_) => self.clone(),
        }
    }
}
