//! module.rs — Chargement de modules : `import` et `require`.
//!
//! - `import(path)` : scope de module isolé, cache par chemin absolu,
//!   map d'exports rendue (noms `__*` et `*:*` exclus) ; les liaisons du
//!   module sont aussi repliées dans le scope de base pour que ses
//!   fermetures continuent de résoudre leurs globales après le pop.
//! - `require(path)` : même pipeline, mais exécution directement dans le
//!   scope global de l'appelant, dédupliquée par chemin absolu (marquage
//!   avant exécution → les cycles ne bouclent pas).
//!
//! Le lexer/parser/compilateur est un collaborateur externe : un `.latc`
//! compilé se charge tel quel, une source texte passe par le
//! `ModuleCompiler` que l'hôte enregistre.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use lattice_core::Chunk;

use crate::error::{RuntimeError, VmResult};
use crate::value::Value;
use crate::vm::Vm;

/// Compilateur de modules branché par l'hôte : source + chemin → chunk.
pub type ModuleCompiler =
    Arc<dyn Fn(&str, &Path) -> Result<Chunk, String> + Send + Sync>;

impl Vm {
    /// Branche le compilateur de modules (collaborateur externe).
    pub fn set_module_compiler(&mut self, compiler: ModuleCompiler) {
        self.compiler = Some(compiler);
    }

    fn resolve_path(&self, path: &str) -> VmResult<PathBuf> {
        let p = PathBuf::from(path);
        std::fs::canonicalize(&p)
            .map_err(|e| RuntimeError::import(format!("cannot resolve '{path}': {e}")))
    }

    /// Charge une unité compilée (ou compile une source via le hook).
    fn load_unit(&self, abs: &Path) -> VmResult<Arc<Chunk>> {
        if abs.extension().and_then(|e| e.to_str()) == Some("latc") {
            let bytes = std::fs::read(abs)
                .map_err(|e| RuntimeError::import(format!("cannot read '{}': {e}", abs.display())))?;
            let chunk = Chunk::from_bytes(&bytes).map_err(|e| {
                RuntimeError::import(format!("invalid chunk '{}': {e}", abs.display()))
            })?;
            return Ok(Arc::new(chunk));
        }
        let source = std::fs::read_to_string(abs)
            .map_err(|e| RuntimeError::import(format!("cannot read '{}': {e}", abs.display())))?;
        match &self.compiler {
            Some(compile) => compile(&source, abs).map(Arc::new).map_err(|e| {
                RuntimeError::import(format!("compile error in '{}': {e}", abs.display()))
            }),
            None => Err(RuntimeError::import(format!(
                "no module compiler registered to load '{}'",
                abs.display()
            ))),
        }
    }

    /// Exécute un chunk-module comme appel synchrone (pas de main implicite).
    fn exec_unit(&mut self, chunk: Arc<Chunk>) -> VmResult<()> {
        let clo = self.plain_closure(chunk)?;
        let _ = self.call_value_sync(Value::closure(clo), Vec::new())?;
        Ok(())
    }

    /// `import` : renvoie la map d'exports (clonée depuis le cache au
    /// deuxième appel — le corps du module ne se ré-exécute pas).
    pub fn import_module(&mut self, path: &str) -> VmResult<Value> {
        let abs = self.resolve_path(path)?;
        if let Some(cached) = self.import_cache.get(&abs) {
            return Ok(cached.deep_clone());
        }
        let chunk = self.load_unit(&abs)?;

        log::debug!("import: executing module '{}'", abs.display());
        self.env.push_scope();
        let run = self.exec_unit(chunk);
        let scope = self.env.pop_scope();
        run?;

        // Les fermetures du module résolvent leurs globales après le pop.
        self.env.fold_into_base(&scope);

        let mut exports = ahash::AHashMap::new();
        for (k, v) in &scope {
            if k.starts_with("__") || k.contains(':') {
                continue;
            }
            exports.insert(k.clone(), v.clone());
        }
        let map = Value::map(exports);
        self.import_cache.insert(abs, map.deep_clone());
        Ok(map)
    }

    /// `require` : exécution dans le scope de l'appelant, une seule fois
    /// par chemin absolu.
    pub fn require_module(&mut self, path: &str) -> VmResult<Value> {
        let abs = self.resolve_path(path)?;
        if self.required.contains(&abs) {
            return Ok(Value::nil());
        }
        // Marqué avant exécution : un require cyclique ne re-rentre pas.
        self.required.insert(abs.clone());
        let chunk = self.load_unit(&abs)?;
        log::debug!("require: executing '{}'", abs.display());
        self.exec_unit(chunk)?;
        Ok(Value::nil())
    }
}
