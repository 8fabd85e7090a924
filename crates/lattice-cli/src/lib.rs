//! lattice-cli/src/lib.rs — CLI lib pour Lattice
//!
//! Sous-commandes :
//!   - run     : exécute un bytecode `.latc`
//!   - disasm  : désassemble un `.latc`
//!   - init    : crée un manifest `lattice.toml` minimal
//!   - install : (re)génère `lattice.lock` depuis le manifest
//!   - add     : ajoute une dépendance au manifest + lock
//!   - remove  : retire une dépendance du manifest + lock
//!
//! Le lock est du TOML : une table `[[package]]` par dépendance avec
//! `name`, `version`, `source`, `checksum`. La résolution réseau est le
//! travail du gestionnaire de paquets (collaborateur externe) ; ici on
//! tient les fichiers du projet.

use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use lattice_core::bytecode::fnv1a64;
use lattice_core::Chunk;
use lattice_vm::{Vm, VmOptions};

/// Point d'entrée du binaire (à appeler depuis src/main.rs).
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Run { file, trace } => cmd_run(file, trace),
        Cmd::Disasm { file } => cmd_disasm(file),
        Cmd::Init { name } => cmd_init(name),
        Cmd::Install { manifest } => cmd_install(manifest),
        Cmd::Add { pkg, version, manifest } => cmd_add(pkg, version, manifest),
        Cmd::Remove { pkg, manifest } => cmd_remove(pkg, manifest),
    }
}

#[derive(Parser, Debug)]
#[command(name = "lattice", version, about = "Lattice language tool")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Exécute un fichier bytecode .latc
    Run {
        /// Fichier .latc
        file: PathBuf,
        /// Trace chaque opcode (RUST_LOG=trace)
        #[arg(long)]
        trace: bool,
    },
    /// Désassemble un bytecode .latc
    Disasm {
        /// Fichier .latc à désassembler
        file: PathBuf,
    },
    /// Crée un manifest lattice.toml minimal
    Init {
        /// Nom du paquet (défaut : nom du dossier courant)
        #[arg(long)]
        name: Option<String>,
    },
    /// (Re)génère lattice.lock depuis le manifest
    Install {
        /// Chemin vers lattice.toml
        #[arg(default_value = "lattice.toml")]
        manifest: PathBuf,
    },
    /// Ajoute une dépendance
    Add {
        /// Nom du paquet
        pkg: String,
        /// Contrainte de version (défaut "*")
        version: Option<String>,
        /// Chemin vers lattice.toml
        #[arg(long, default_value = "lattice.toml")]
        manifest: PathBuf,
    },
    /// Retire une dépendance
    Remove {
        /// Nom du paquet
        pkg: String,
        /// Chemin vers lattice.toml
        #[arg(long, default_value = "lattice.toml")]
        manifest: PathBuf,
    },
}

// ---------- Manifest & lock ----------

/// Manifest minimal pour un projet Lattice.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    package: Package,
    #[serde(default)]
    dependencies: toml::value::Table,
}

#[derive(Debug, Serialize, Deserialize)]
struct Package {
    name: String,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    description: Option<String>,
}

impl Default for Package {
    fn default() -> Self {
        Self { name: "app".into(), version: default_version(), description: None }
    }
}

fn default_version() -> String {
    "0.1.0".into()
}

/// Lock-file : une table `[[package]]` par dépendance.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Lock {
    #[serde(default, rename = "package")]
    packages: Vec<LockedPackage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockedPackage {
    name: String,
    version: String,
    source: String,
    checksum: String,
}

fn read_manifest(path: &Utf8Path) -> Result<Manifest> {
    let s = fs::read_to_string(path).with_context(|| format!("lecture {path}"))?;
    let m: Manifest = toml::from_str(&s).with_context(|| "TOML invalide")?;
    Ok(m)
}

fn write_manifest(path: &Utf8Path, m: &Manifest) -> Result<()> {
    let s = toml::to_string_pretty(m).context("sérialisation manifest")?;
    fs::write(path, s).with_context(|| format!("écriture {path}"))?;
    Ok(())
}

fn lock_path_for(manifest: &Utf8Path) -> Utf8PathBuf {
    manifest
        .parent()
        .map(|p| p.join("lattice.lock"))
        .unwrap_or_else(|| Utf8PathBuf::from("lattice.lock"))
}

fn write_lock(manifest_path: &Utf8Path, m: &Manifest) -> Result<Utf8PathBuf> {
    let mut lock = Lock::default();
    let mut names: Vec<&String> = m.dependencies.keys().collect();
    names.sort();
    for name in names {
        let version = match &m.dependencies[name] {
            toml::Value::String(v) => v.clone(),
            other => bail!("dépendance '{name}': version invalide ({other})"),
        };
        let checksum = format!("{:016x}", fnv1a64(format!("{name}@{version}").as_bytes()));
        lock.packages.push(LockedPackage {
            name: name.clone(),
            version,
            source: "registry".into(),
            checksum,
        });
    }
    let out = lock_path_for(manifest_path);
    let s = toml::to_string_pretty(&lock).context("sérialisation lock")?;
    fs::write(&out, s).with_context(|| format!("écriture {out}"))?;
    Ok(out)
}

// ---------- Commandes ----------

fn utf8(path: PathBuf) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(path).map_err(|_| anyhow!("chemin invalide (UTF-8 attendu)"))
}

fn cmd_run(file: PathBuf, trace: bool) -> Result<()> {
    let file = utf8(file)?;
    ensure_exists(&file, "bytecode")?;

    let bytes = fs::read(&file)?;
    let chunk = Chunk::from_bytes(&bytes).map_err(|e| anyhow!("chargement chunk: {e}"))?;
    let mut vm = Vm::with_options(VmOptions::default().with_trace(trace));
    match vm.run(&chunk) {
        Ok(out) => {
            if !out.is_nil() {
                println!("{out}");
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e.render_trace());
            bail!("exécution échouée")
        }
    }
}

fn cmd_disasm(file: PathBuf) -> Result<()> {
    let file = utf8(file)?;
    ensure_exists(&file, "bytecode")?;

    let bytes = fs::read(&file)?;
    let chunk = Chunk::from_bytes(&bytes).map_err(|e| anyhow!("chargement chunk: {e}"))?;
    let title = file.file_name().unwrap_or("chunk");
    println!("{}", chunk.disassemble(title));
    Ok(())
}

fn cmd_init(name: Option<String>) -> Result<()> {
    let manifest = Utf8PathBuf::from("lattice.toml");
    if manifest.exists() {
        bail!("lattice.toml existe déjà");
    }
    let name = name.unwrap_or_else(|| {
        std::env::current_dir()
            .ok()
            .and_then(|d| d.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "app".into())
    });
    let m = Manifest {
        package: Package { name: name.clone(), version: default_version(), description: None },
        dependencies: toml::value::Table::new(),
    };
    write_manifest(&manifest, &m)?;
    eprintln!("✅  Projet `{name}` initialisé → {manifest}");
    Ok(())
}

fn cmd_install(manifest: PathBuf) -> Result<()> {
    let manifest = utf8(manifest)?;
    ensure_exists(&manifest, "manifest")?;
    let m = read_manifest(&manifest)?;
    let lock = write_lock(&manifest, &m)?;
    eprintln!("✅  {} dépendance(s) verrouillée(s) → {lock}", m.dependencies.len());
    Ok(())
}

fn cmd_add(pkg: String, version: Option<String>, manifest: PathBuf) -> Result<()> {
    let manifest = utf8(manifest)?;
    ensure_exists(&manifest, "manifest")?;
    let mut m = read_manifest(&manifest)?;
    let version = version.unwrap_or_else(|| "*".into());
    m.dependencies.insert(pkg.clone(), toml::Value::String(version.clone()));
    write_manifest(&manifest, &m)?;
    write_lock(&manifest, &m)?;
    eprintln!("✅  Ajouté {pkg} {version}");
    Ok(())
}

fn cmd_remove(pkg: String, manifest: PathBuf) -> Result<()> {
    let manifest = utf8(manifest)?;
    ensure_exists(&manifest, "manifest")?;
    let mut m = read_manifest(&manifest)?;
    if m.dependencies.remove(&pkg).is_none() {
        bail!("dépendance '{pkg}' absente du manifest");
    }
    write_manifest(&manifest, &m)?;
    write_lock(&manifest, &m)?;
    eprintln!("✅  Retiré {pkg}");
    Ok(())
}

fn ensure_exists(path: &Utf8Path, what: &str) -> Result<()> {
    if !path.exists() {
        Err(anyhow!("{what} introuvable: {path}"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> Utf8PathBuf {
        let mut p = Utf8PathBuf::from_path_buf(std::env::temp_dir()).expect("temp utf8");
        p.push(format!("lattice_cli_test_{}_{tag}", std::process::id()));
        let _ = fs::create_dir_all(&p);
        p
    }

    #[test]
    fn manifest_roundtrip() {
        let dir = temp_dir("manifest");
        let path = dir.join("lattice.toml");
        let mut m = Manifest::default();
        m.package.name = "demo".into();
        m.dependencies.insert("json".into(), toml::Value::String("1.2".into()));
        write_manifest(&path, &m).unwrap();
        let back = read_manifest(&path).unwrap();
        assert_eq!(back.package.name, "demo");
        assert_eq!(back.dependencies.len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lock_has_one_package_table_per_dep() {
        let dir = temp_dir("lock");
        let path = dir.join("lattice.toml");
        let mut m = Manifest::default();
        m.dependencies.insert("http".into(), toml::Value::String("0.3".into()));
        m.dependencies.insert("json".into(), toml::Value::String("1.2".into()));
        write_manifest(&path, &m).unwrap();
        let lock_path = write_lock(&path, &m).unwrap();

        let s = fs::read_to_string(&lock_path).unwrap();
        let lock: Lock = toml::from_str(&s).unwrap();
        assert_eq!(lock.packages.len(), 2);
        // Tri stable par nom.
        assert_eq!(lock.packages[0].name, "http");
        assert_eq!(lock.packages[1].name, "json");
        for p in &lock.packages {
            assert_eq!(p.source, "registry");
            assert_eq!(p.checksum.len(), 16);
        }
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = format!("{:016x}", fnv1a64(b"json@1.2"));
        let b = format!("{:016x}", fnv1a64(b"json@1.2"));
        assert_eq!(a, b);
    }
}
