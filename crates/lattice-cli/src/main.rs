//! main.rs — binaire `lattice`.
//!
//! Rien d'autre ici que l'amorçage : rapports d'erreurs stylés, logs
//! (`RUST_LOG=debug` suit les chargements de modules, `trace` suit la VM
//! opcode par opcode), puis les sous-commandes (`run`, `disasm`, gestion
//! de manifest/lock) vivent dans `lattice_cli::run()` où elles se testent
//! sans passer par un process.

fn main() {
    if let Err(e) = color_eyre::install() {
        eprintln!("⚠️ color-eyre indisponible: {e}");
    }
    env_logger::init();

    if let Err(err) = lattice_cli::run() {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}
