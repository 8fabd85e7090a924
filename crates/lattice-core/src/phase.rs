//! phase.rs — Les quatre phases d'une valeur Lattice.
//!
//! - `Fluid`      : mutable (état par défaut d'une valeur vivante)
//! - `Crystal`    : gelée, toute mutation échoue
//! - `Sublimated` : vue seule, déréférençable mais jamais mutable
//! - `Unphased`   : jamais observée par le système de phases
//!
//! La phase voyage *avec* la valeur (champ de `Value`), et apparaît aussi
//! dans les annotations de paramètres d'un `Chunk` compilé.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase d'une valeur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Phase {
    /// Mutable.
    #[default]
    Fluid,
    /// Gelée : toute opération mutante échoue.
    Crystal,
    /// Vue seule : lisible, jamais mutable.
    Sublimated,
    /// Hors du système de phases.
    Unphased,
}

impl Phase {
    /// Nom court, celui que voit le code Lattice (`phases(x)`, réactions…).
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Fluid => "fluid",
            Phase::Crystal => "crystal",
            Phase::Sublimated => "sublimated",
            Phase::Unphased => "unphased",
        }
    }

    /// Parse inverse de [`Phase::as_str`].
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "fluid" => Phase::Fluid,
            "crystal" => Phase::Crystal,
            "sublimated" => Phase::Sublimated,
            "unphased" => Phase::Unphased,
            _ => return None,
        })
    }

    /// Une valeur dans cette phase accepte-t-elle une mutation ?
    pub fn is_mutable(self) -> bool {
        matches!(self, Phase::Fluid | Phase::Unphased)
    }

    /// Gelée au sens large (crystal ou sublimated).
    pub fn is_frozen(self) -> bool {
        matches!(self, Phase::Crystal | Phase::Sublimated)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_names() {
        for p in [Phase::Fluid, Phase::Crystal, Phase::Sublimated, Phase::Unphased] {
            assert_eq!(Phase::parse(p.as_str()), Some(p));
        }
        assert_eq!(Phase::parse("solid"), None);
    }

    #[test]
    fn mutability() {
        assert!(Phase::Fluid.is_mutable());
        assert!(Phase::Unphased.is_mutable());
        assert!(!Phase::Crystal.is_mutable());
        assert!(!Phase::Sublimated.is_mutable());
    }
}
