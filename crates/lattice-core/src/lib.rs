//! lattice-core — Cœur du langage Lattice
//!
//! Contient tout ce qu'il faut pour manipuler le bytecode Lattice, sans
//! dépendre de la VM complète.
//!
//! ## Modules
//! - `bytecode` : format `Chunk`, pool de constantes, opcodes `Op`.
//! - `disasm`   : désassembleur lisible (humain), via `bytecode::disasm`.
//! - `phase`    : les quatre phases d'une valeur (fluid/crystal/sublimated/unphased).
//! - `helpers`  : briques "batteries incluses" (constantes, I/O fichiers).

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

pub mod bytecode;
pub mod phase;

// ---------- Reexports de confort ----------
pub use bytecode::{
    Chunk, ChunkFlags, ConstPool, ConstValue, LineTable, Op, OperandKind, ParamSpec, SelectArm,
    UpvalDesc, VarLoc,
};
pub use phase::Phase;

// ---------- Version ----------
/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renvoie une jolie bannière de version (utile pour logs/outils).
pub fn version() -> String {
    format!("lattice-core {VERSION}")
}

// ---------- Erreurs & Résultat ----------
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// I/O fichier bytecode.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Erreurs de (dé)sérialisation bincode (bytecode).
    #[error("bincode: {0}")]
    Bincode(#[from] bincode::Error),

    /// Format de chunk invalide ou attendu ≠ trouvé.
    #[error("chunk: {0}")]
    Chunk(String),

    /// Erreur générique.
    #[error("{0}")]
    Msg(String),
}

pub type Result<T, E = Error> = core::result::Result<T, E>;

// ---------- Prelude ----------
pub mod prelude {
    pub use crate::{
        bytecode::{chunk, ops},
        helpers::*,
        Chunk, ChunkFlags, ConstPool, ConstValue, Error, LineTable, Op, Phase, Result,
    };
}

// ---------- Helpers "batteries-incluses" ----------
pub mod helpers {
    use super::*;
    use bytecode::chunk::{CHUNK_MAGIC, CHUNK_VERSION};
    use bytecode::ConstIx;

    /// Crée un `Chunk` racine "prêt à remplir".
    pub fn new_chunk(stripped: bool) -> Chunk {
        Chunk::new("<script>", ChunkFlags { stripped })
    }

    /// Ajoute des constantes (raccourcis).
    pub fn k_str(c: &mut Chunk, s: &str) -> ConstIx { c.add_const(ConstValue::Str(s.into())) }
    pub fn k_i64(c: &mut Chunk, i: i64) -> ConstIx { c.add_const(ConstValue::I64(i)) }
    pub fn k_f64(c: &mut Chunk, x: f64) -> ConstIx { c.add_const(ConstValue::F64(x)) }
    pub fn k_bool(c: &mut Chunk, b: bool) -> ConstIx { c.add_const(ConstValue::Bool(b)) }
    pub fn k_nil(c: &mut Chunk) -> ConstIx { c.add_const(ConstValue::Nil) }

    /// Vérifie quelques invariants d'un `Chunk`. Étends selon ton format.
    pub fn validate_chunk(c: &Chunk) -> Result<()> {
        if c.consts.len() > (u32::MAX as usize) {
            return Err(Error::Chunk("trop de constantes".into()));
        }
        for (pc, op) in c.ops.iter().enumerate() {
            if let Some(dest) = op.jump_target(pc as u32) {
                if dest as usize > c.ops.len() {
                    return Err(Error::Chunk(format!("saut hors code: pc={pc} -> {dest}")));
                }
            }
        }
        Ok(())
    }

    /// Signature binaire attendue (vérif toolchain).
    pub fn compiled_format_signature() -> (&'static [u8; 4], u16) {
        (&CHUNK_MAGIC, CHUNK_VERSION)
    }

    /// Lire un `Chunk` depuis un fichier `.latc`.
    pub fn read_chunk_from_file(path: impl AsRef<std::path::Path>) -> Result<Chunk> {
        let bytes = std::fs::read(path)?;
        let c = Chunk::from_bytes(&bytes).map_err(|e| Error::Chunk(format!("{e}")))?;
        validate_chunk(&c)?;
        Ok(c)
    }

    /// Écrire un `Chunk` dans un fichier `.latc`.
    pub fn write_chunk_to_file(mut chunk: Chunk, path: impl AsRef<std::path::Path>) -> Result<()> {
        let bytes = chunk.to_bytes();
        std::fs::write(path, bytes)?;
        Ok(())
    }
}
