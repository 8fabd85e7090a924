//! phase.rs — Sous-système de phases : histoire, pressions, réactions,
//! bonds, seeds.
//!
//! État par VM (les VM enfants repartent à vide) :
//! - **Tracked**   : nom → suite append-only de snapshots {phase, valeur,
//!   ligne, fonction}.
//! - **Pressures** : nom → mode (`no_grow`/`no_shrink`/`no_resize`/
//!   `read_heavy`), consulté à chaque dispatch de méthode mutante.
//! - **Reactions** : nom → callbacks tirés après toute transition de
//!   phase, arguments `(nom_de_phase, nouvelle_valeur)`.
//! - **Bonds**     : cible → (dépendance, stratégie), cascade one-shot au
//!   gel de la cible (`mirror`/`inverse`/`gate`).
//! - **Seeds**     : nom → contrats à valider avant `grow()`.
//!
//! L'écriture write-back passe par l'emplacement tagué (local / upvalue /
//! global) des formes `*_var`, ou par le nom (locals nommés puis globales)
//! pour les opérations natives (`track`, `grow`…).

use lattice_core::bytecode::VarLoc;
use lattice_core::Phase;

use crate::error::{RuntimeError, VmResult};
use crate::value::Value;
use crate::vm::Vm;

/// Mode de pression sur un conteneur nommé.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pressure {
    NoGrow,
    NoShrink,
    NoResize,
    /// Purement indicatif.
    ReadHeavy,
}

impl Pressure {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "no_grow" => Pressure::NoGrow,
            "no_shrink" => Pressure::NoShrink,
            "no_resize" => Pressure::NoResize,
            "read_heavy" => Pressure::ReadHeavy,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pressure::NoGrow => "no_grow",
            Pressure::NoShrink => "no_shrink",
            Pressure::NoResize => "no_resize",
            Pressure::ReadHeavy => "read_heavy",
        }
    }
}

/// Classe de mutation d'une méthode intégrée.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    /// `push`, `insert`, ajout de clé…
    Grow,
    /// `pop`, `remove_at`, retrait…
    Shrink,
}

/// Stratégie d'un bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BondStrategy {
    /// La dépendance gèle avec la cible (et cascade à son tour).
    Mirror,
    /// La dépendance dégèle quand la cible gèle.
    Inverse,
    /// La dépendance doit déjà être crystal, sinon le gel échoue.
    Gate,
}

impl BondStrategy {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "mirror" => BondStrategy::Mirror,
            "inverse" => BondStrategy::Inverse,
            "gate" => BondStrategy::Gate,
            _ => return None,
        })
    }
}

/// Entrée de bond : dépendance + stratégie. Consommée au déclenchement.
#[derive(Debug, Clone)]
pub struct BondEntry {
    pub dep: String,
    pub strategy: BondStrategy,
}

/// Snapshot d'une variable suivie.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub phase: Phase,
    pub value: Value,
    pub line: u32,
    pub func: String,
}

impl Vm {
    // ---------- Résolution par nom (natives du sous-système) ----------

    /// Valeur d'un nom : local nommé de la frame courante, puis globales.
    pub(crate) fn resolve_named(&self, name: &str) -> VmResult<Value> {
        self.resolve_named_opt(name)
            .ok_or_else(|| RuntimeError::name(format!("undefined variable '{name}'")))
    }

    pub(crate) fn resolve_named_opt(&self, name: &str) -> Option<Value> {
        if let Ok(fr) = self.frame() {
            for (slot, n) in &fr.chunk.local_names {
                if n == name {
                    let idx = fr.base + *slot as usize;
                    if let Some(v) = self.stack.get(idx) {
                        return Some(v.clone());
                    }
                }
            }
        }
        self.env.get(name).cloned()
    }

    /// Write-back par nom. `false` si le nom n'existe nulle part.
    pub(crate) fn write_named(&mut self, name: &str, v: Value) -> bool {
        let mut local_idx = None;
        if let Ok(fr) = self.frame() {
            for (slot, n) in &fr.chunk.local_names {
                if n == name {
                    let idx = fr.base + *slot as usize;
                    if idx < self.stack.len() {
                        local_idx = Some(idx);
                    }
                }
            }
        }
        if let Some(idx) = local_idx {
            self.stack[idx] = v;
            return true;
        }
        self.env.set(name, v)
    }

    // ---------- Tracked / history / rewind ----------

    /// Démarre le suivi d'un nom et enregistre le snapshot initial.
    pub(crate) fn track_named(&mut self, name: &str) -> VmResult<()> {
        let v = self.resolve_named(name)?;
        let snap = self.snapshot_of(&v);
        self.tracked.entry(name.to_string()).or_default().push(snap);
        Ok(())
    }

    fn snapshot_of(&self, v: &Value) -> Snapshot {
        let func = self
            .frame()
            .map(|fr| fr.closure.name.clone())
            .unwrap_or_else(|_| "<script>".to_string());
        Snapshot {
            phase: v.phase,
            value: v.deep_clone(),
            line: self.current_line().unwrap_or(0),
            func,
        }
    }

    /// Append un snapshot si le nom est suivi.
    pub(crate) fn record_history(&mut self, name: &str, v: &Value) {
        if self.tracked.contains_key(name) {
            let snap = self.snapshot_of(v);
            if let Some(h) = self.tracked.get_mut(name) {
                h.push(snap);
            }
        }
    }

    /// Timeline de phases seules.
    pub(crate) fn phases_of(&self, name: &str) -> Value {
        let items = self
            .tracked
            .get(name)
            .map(|h| h.iter().map(|s| Value::str(s.phase.as_str())).collect())
            .unwrap_or_default();
        Value::array(items)
    }

    /// Timeline enrichie : maps {phase, value, line, fn}.
    pub(crate) fn history_of(&self, name: &str) -> Value {
        let items = self
            .tracked
            .get(name)
            .map(|h| {
                h.iter()
                    .map(|s| {
                        let mut m = ahash::AHashMap::new();
                        m.insert("phase".to_string(), Value::str(s.phase.as_str()));
                        m.insert("value".to_string(), s.value.deep_clone());
                        m.insert("line".to_string(), Value::int(i64::from(s.line)));
                        m.insert("fn".to_string(), Value::str(s.func.clone()));
                        Value::map(m)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Value::array(items)
    }

    /// Valeur `k` pas avant le dernier snapshot (nil hors bornes).
    pub(crate) fn rewind_of(&self, name: &str, k: i64) -> Value {
        let Some(h) = self.tracked.get(name) else { return Value::nil() };
        if k < 0 {
            return Value::nil();
        }
        let k = k as usize;
        if k >= h.len() {
            return Value::nil();
        }
        h[h.len() - 1 - k].value.deep_clone()
    }

    // ---------- Pressions ----------

    pub(crate) fn set_pressure(&mut self, name: &str, mode: Pressure) {
        self.pressures.insert(name.to_string(), mode);
    }

    pub(crate) fn remove_pressure(&mut self, name: &str) {
        self.pressures.remove(name);
    }

    /// Vérifie une mutation contre la table des pressions. `read_heavy`
    /// n'interdit rien.
    pub(crate) fn check_pressure(&self, name: Option<&str>, m: Mutation) -> VmResult<()> {
        let Some(name) = name else { return Ok(()) };
        let Some(p) = self.pressures.get(name) else { return Ok(()) };
        let blocked = matches!(
            (p, m),
            (Pressure::NoGrow, Mutation::Grow)
                | (Pressure::NoShrink, Mutation::Shrink)
                | (Pressure::NoResize, _)
        );
        if blocked {
            return Err(RuntimeError::pressure(format!(
                "container '{name}' is pressurized ({}): mutation denied",
                p.as_str()
            )));
        }
        Ok(())
    }

    // ---------- Réactions ----------

    /// `React name` : dépile une fermeture callback.
    pub(crate) fn op_react(&mut self, name: &str) -> VmResult<()> {
        let cb = self.pop()?;
        if cb.as_closure().is_none() {
            return Err(RuntimeError::type_err("reaction callback must be a function"));
        }
        self.reactions.entry(name.to_string()).or_default().push(cb);
        Ok(())
    }

    /// Tire les callbacks du nom : `(nom_de_phase, nouvelle_valeur)`.
    pub(crate) fn fire_reactions(&mut self, name: &str, v: &Value) -> VmResult<()> {
        let cbs = match self.reactions.get(name) {
            Some(cbs) => cbs.clone(),
            None => return Ok(()),
        };
        for cb in cbs {
            let args = vec![Value::str(v.phase.as_str()), v.deep_clone()];
            let _ = self.call_value_sync(cb, args)?;
        }
        Ok(())
    }

    // ---------- Bonds ----------

    /// `Bond target` : dépile (stratégie, nom-dépendance).
    pub(crate) fn op_bond(&mut self, target: &str) -> VmResult<()> {
        let strategy = self.pop()?;
        let dep = self.pop()?;
        let strategy = strategy
            .as_str()
            .and_then(BondStrategy::parse)
            .ok_or_else(|| {
                RuntimeError::phase(format!(
                    "unknown bond strategy '{strategy}' (expected mirror/inverse/gate)"
                ))
            })?;
        let dep = dep
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RuntimeError::type_err("bond dependency must be a name string"))?;
        self.bonds
            .entry(target.to_string())
            .or_default()
            .push(BondEntry { dep, strategy });
        Ok(())
    }

    /// Les bonds `gate` exigent une dépendance déjà crystal **avant** le
    /// gel de la cible.
    pub(crate) fn check_gate_bonds(&self, target: &str) -> VmResult<()> {
        let Some(entries) = self.bonds.get(target) else { return Ok(()) };
        for e in entries {
            if e.strategy == BondStrategy::Gate {
                let ok = self
                    .resolve_named_opt(&e.dep)
                    .map(|v| v.phase == Phase::Crystal)
                    .unwrap_or(false);
                if !ok {
                    return Err(RuntimeError::phase(format!(
                        "gate bond violated: '{}' must be crystal before '{target}' freezes",
                        e.dep
                    )));
                }
            }
        }
        Ok(())
    }

    /// Cascade one-shot : toutes les entrées de la cible sont consommées.
    pub(crate) fn cascade_bonds(&mut self, target: &str) -> VmResult<()> {
        let entries = self.bonds.remove(target).unwrap_or_default();
        for e in entries {
            match e.strategy {
                BondStrategy::Mirror => {
                    let Some(depv) = self.resolve_named_opt(&e.dep) else { continue };
                    if depv.phase != Phase::Crystal {
                        let frozen = depv.freeze();
                        self.write_named(&e.dep, frozen.clone());
                        self.record_history(&e.dep, &frozen);
                        self.fire_reactions(&e.dep, &frozen)?;
                        self.cascade_bonds(&e.dep)?;
                    }
                }
                BondStrategy::Inverse => {
                    let Some(depv) = self.resolve_named_opt(&e.dep) else { continue };
                    if depv.phase.is_frozen() {
                        let thawed = depv.thaw();
                        self.write_named(&e.dep, thawed.clone());
                        self.record_history(&e.dep, &thawed);
                        self.fire_reactions(&e.dep, &thawed)?;
                    }
                }
                // Déjà validé avant le gel ; consommé comme les autres.
                BondStrategy::Gate => {}
            }
        }
        Ok(())
    }

    // ---------- Seeds ----------

    /// `Seed name` : dépile une fermeture contrat.
    pub(crate) fn op_seed(&mut self, name: &str) -> VmResult<()> {
        let contract = self.pop()?;
        if contract.as_closure().is_none() {
            return Err(RuntimeError::type_err("seed contract must be a function"));
        }
        self.seeds.entry(name.to_string()).or_default().push(contract);
        Ok(())
    }

    /// Valide tous les contrats sans les consommer (échec rapide).
    pub(crate) fn validate_seeds(&mut self, name: &str, v: &Value) -> VmResult<()> {
        let contracts = match self.seeds.get(name) {
            Some(c) => c.clone(),
            None => return Ok(()),
        };
        for c in contracts {
            let out = self.call_value_sync(c, vec![v.deep_clone()])?;
            if !out.is_truthy() {
                return Err(RuntimeError::phase(format!("seed contract failed for '{name}'")));
            }
        }
        Ok(())
    }

    /// `grow(name)` : valide tous les seeds, gèle, historise, cascade,
    /// tire les réactions, puis **consomme** les seeds du nom.
    pub(crate) fn grow_named(&mut self, name: &str) -> VmResult<Value> {
        let current = self.resolve_named(name)?;
        self.validate_seeds(name, &current)?;
        self.check_gate_bonds(name)?;
        let frozen = current.freeze();
        self.write_named(name, frozen.clone());
        self.record_history(name, &frozen);
        self.seeds.remove(name);
        self.fire_reactions(name, &frozen)?;
        self.cascade_bonds(name)?;
        Ok(frozen)
    }

    // ---------- Formes *_var (validation + write-back + cascade) ----------

    /// `freeze_var` : seeds validés (non consommés), gates vérifiés,
    /// gel + write-back, histoire, réactions, cascade.
    pub(crate) fn op_freeze_var(&mut self, name: &str, loc: VarLoc, slot: u16) -> VmResult<()> {
        let current = self.read_var(loc, slot, name)?;
        self.validate_seeds(name, &current)?;
        self.check_gate_bonds(name)?;
        let frozen = current.freeze();
        self.write_var(loc, slot, name, frozen.clone())?;
        self.record_history(name, &frozen);
        self.fire_reactions(name, &frozen)?;
        self.cascade_bonds(name)?;
        Ok(())
    }

    /// `thaw_var` : dégel + write-back + histoire + réactions.
    pub(crate) fn op_thaw_var(&mut self, name: &str, loc: VarLoc, slot: u16) -> VmResult<()> {
        let current = self.read_var(loc, slot, name)?;
        let thawed = current.thaw();
        self.write_var(loc, slot, name, thawed.clone())?;
        self.record_history(name, &thawed);
        self.fire_reactions(name, &thawed)
    }

    /// `sublimate_var` : passage en vue seule + write-back + histoire +
    /// réactions.
    pub(crate) fn op_sublimate_var(&mut self, name: &str, loc: VarLoc, slot: u16) -> VmResult<()> {
        let current = self.read_var(loc, slot, name)?;
        let subl = current.sublimate();
        self.write_var(loc, slot, name, subl.clone())?;
        self.record_history(name, &subl);
        self.fire_reactions(name, &subl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pressure_parse_roundtrip() {
        for p in [Pressure::NoGrow, Pressure::NoShrink, Pressure::NoResize, Pressure::ReadHeavy] {
            assert_eq!(Pressure::parse(p.as_str()), Some(p));
        }
        assert_eq!(Pressure::parse("harder"), None);
    }

    #[test]
    fn bond_strategy_parse() {
        assert_eq!(BondStrategy::parse("mirror"), Some(BondStrategy::Mirror));
        assert_eq!(BondStrategy::parse("inverse"), Some(BondStrategy::Inverse));
        assert_eq!(BondStrategy::parse("gate"), Some(BondStrategy::Gate));
        assert_eq!(BondStrategy::parse("weld"), None);
    }

    #[test]
    fn rewind_out_of_range_is_nil() {
        let mut vm = Vm::new();
        vm.define_global("x", Value::int(1));
        vm.track_named("x").unwrap();
        assert_eq!(vm.rewind_of("x", 0), Value::int(1));
        assert!(vm.rewind_of("x", 5).is_nil());
        assert!(vm.rewind_of("missing", 0).is_nil());
    }

    #[test]
    fn no_resize_blocks_both_ways() {
        let mut vm = Vm::new();
        vm.set_pressure("xs", Pressure::NoResize);
        assert!(vm.check_pressure(Some("xs"), Mutation::Grow).is_err());
        assert!(vm.check_pressure(Some("xs"), Mutation::Shrink).is_err());
        assert!(vm.check_pressure(Some("ys"), Mutation::Grow).is_ok());
        vm.set_pressure("zs", Pressure::ReadHeavy);
        assert!(vm.check_pressure(Some("zs"), Mutation::Grow).is_ok());
    }
}
