//! env.rs — Scopes nommés imbriqués lexicalement (globales + modules).
//!
//! La pile de scopes porte le scope de base (globales du script) et les
//! scopes de module empilés par `import`. La résolution descend du sommet
//! vers la base ; `define` écrit toujours au sommet.

use ahash::AHashMap;

use crate::value::Value;

/// Un scope : nom → valeur. L'ordre d'insertion n'est pas garanti.
pub type Scope = AHashMap<String, Value>;

/// Environnement : pile de scopes, jamais vide.
#[derive(Debug, Clone)]
pub struct Env {
    scopes: Vec<Scope>,
}

impl Default for Env {
    fn default() -> Self {
        Self { scopes: vec![Scope::new()] }
    }
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    /// Profondeur courante (1 = scope de base seul).
    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    /// Définit (ou redéfinit) dans le scope du sommet.
    pub fn define(&mut self, name: impl Into<String>, v: Value) {
        if let Some(top) = self.scopes.last_mut() {
            top.insert(name.into(), v);
        }
    }

    /// Résout du sommet vers la base.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.scopes.iter().rev().find_map(|s| s.get(name))
    }

    /// Réassigne la liaison existante la plus proche du sommet.
    /// `false` si le nom n'existe nulle part.
    pub fn set(&mut self, name: &str, v: Value) -> bool {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(slot) = scope.get_mut(name) {
                *slot = v;
                return true;
            }
        }
        false
    }

    /// Le nom existe-t-il quelque part ?
    pub fn contains(&self, name: &str) -> bool {
        self.scopes.iter().any(|s| s.contains_key(name))
    }

    /// Empile un scope de module vierge.
    pub fn push_scope(&mut self) {
        self.scopes.push(Scope::new());
    }

    /// Dépile le scope du sommet et le rend (le scope de base reste).
    pub fn pop_scope(&mut self) -> Scope {
        if self.scopes.len() > 1 {
            self.scopes.pop().unwrap_or_default()
        } else {
            Scope::new()
        }
    }

    /// Replie des liaisons dans le scope de base (post-import : les
    /// fermetures du module doivent continuer à résoudre leurs globales).
    pub fn fold_into_base(&mut self, bindings: &Scope) {
        if let Some(base) = self.scopes.first_mut() {
            for (k, v) in bindings {
                base.insert(k.clone(), v.clone());
            }
        }
    }

    /// Itère le scope de base (exports, diagnostics).
    pub fn base(&self) -> &Scope {
        &self.scopes[0]
    }

    /// Copie des liaisons pour une VM enfant, aplatie dans le scope de
    /// base, chaque valeur passée par `f` (clonage profond, fermeture des
    /// upvalues ouverts…).
    pub fn cloned_with(&self, f: impl Fn(&Value) -> Value) -> Env {
        let mut child = Env::new();
        for scope in &self.scopes {
            for (k, v) in scope {
                child.define(k.clone(), f(v));
            }
        }
        child
    }
}
