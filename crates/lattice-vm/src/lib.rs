//! lattice-vm — Machine virtuelle d'exécution pour le langage Lattice
//!
//! Ce crate fournit la **VM à pile** qui exécute le bytecode Lattice
//! produit par le compilateur (collaborateur externe). Il expose :
//!
//! - un type [`Vm`] avec configuration par [`VmOptions`],
//! - un modèle de valeurs dynamique [`Value`] à phases
//!   (fluid/crystal/sublimated/unphased),
//! - un système d'erreurs runtime [`RuntimeError`] (taxonomie complète,
//!   trace `[line N] in f()`),
//! - des **fonctions natives** (host functions) avec un stdlib de base,
//! - le sous-système de **phases** (track/history/rewind, pressions,
//!   réactions, bonds, seeds),
//! - la **concurrence** : scopes spawn (threads OS, VM enfants), canaux
//!   MPMC, `select` équitable avec default/timeout,
//! - les **modules** : `import` isolé-caché et `require` même-scope.
//!
//! ### Exemple d'utilisation
//!
//! ```
//! use lattice_core::{Chunk, Op, ConstValue};
//! use lattice_vm::Vm;
//!
//! let mut chunk = Chunk::script();
//! let k = chunk.add_const(ConstValue::I64(40));
//! chunk.push_op(Op::LoadConst(k), 1);
//! chunk.push_op(Op::LoadInt8(2), 1);
//! chunk.push_op(Op::Add, 1);
//! chunk.push_op(Op::Return, 1);
//!
//! let mut vm = Vm::new();
//! let out = vm.run(&chunk).expect("exécution ok");
//! assert_eq!(out, lattice_vm::Value::int(42));
//! ```

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub mod chan;
pub mod closure;
pub mod env;
pub mod error;
pub mod ext;
pub mod module;
pub mod native;
pub mod phase;
pub mod upvalue;
pub mod value;
pub mod vm;

mod concurrency;
mod methods;

// ---------- Reexports de confort ----------
pub use chan::Channel;
pub use closure::{Closure, ClosureKind, NativeFn};
pub use env::Env;
pub use error::{ErrorKind, RuntimeError, VmResult};
pub use ext::{ExtFn, ExtInitFn, ExtModule, ExtValue};
pub use module::ModuleCompiler;
pub use phase::{BondStrategy, Pressure};
pub use upvalue::Upvalue;
pub use value::{Buffer, Value, ValueKind};
pub use vm::{StructRegistry, Vm, VmOptions};

/// Version du crate (lisible, via Cargo).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Renvoie une jolie bannière de version (utile pour logs/outils).
pub fn version() -> String {
    format!("lattice-vm {VERSION}")
}
