//! disasm.rs — Désassembleur "lisible humain" pour Lattice.
//!
//! Deux niveaux :
//!  - `disassemble_compact(chunk)` : 1 ligne par op, constantes résolues
//!  - `disassemble(chunk, title)`  : header + pool + lignes + code (labels),
//!    puis récursion sur les protos `Func` embarqués
//!
//! Le désassembleur essaie d'être robuste :
//!  - Labels pour les cibles de saut (L0001, L0002, …)
//!  - Annotation des opcodes à opérande constante avec un aperçu
//!  - Détection d'index constants invalides (<invalid>)
//!
//! Aucune dépendance externe : pure std.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::bytecode::{Chunk, ConstValue, Op, SelectArm};

/// Vue compacte : `PC (line)  OP [annotations…]`
pub fn disassemble_compact(chunk: &Chunk) -> String {
    let mut out = String::new();
    let labels = compute_labels(chunk);

    for (pc_usize, op) in chunk.ops.iter().enumerate() {
        let pc = pc_usize as u32;
        let line = chunk.line_at(pc).map(|x| x.to_string()).unwrap_or_else(|| "-".into());
        let _ = writeln!(out, "{pc:05} (line {line:>4})  {}", fmt_op(chunk, pc, op, &labels));
    }
    out
}

/// Vue complète : header + pool + table de lignes + code, protos inclus.
pub fn disassemble(chunk: &Chunk, title: &str) -> String {
    let mut s = String::new();
    disassemble_into(&mut s, chunk, title);
    s
}

fn disassemble_into(s: &mut String, chunk: &Chunk, title: &str) {
    // ── Header ──────────────────────────────────────────────────────────────
    let _ = writeln!(s, "== {title} ==");
    let _ = writeln!(
        s,
        "• version: {}   stripped: {}   arity: {}{}   ops: {}   consts: {}",
        chunk.version(),
        chunk.flags().stripped,
        chunk.arity(),
        if chunk.variadic { "+" } else { "" },
        chunk.ops.len(),
        chunk.consts.len(),
    );
    if !chunk.upvals.is_empty() {
        let descs: Vec<String> = chunk
            .upvals
            .iter()
            .map(|u| format!("{}{}", if u.is_local { "local:" } else { "upval:" }, u.index))
            .collect();
        let _ = writeln!(s, "• upvals: [{}]", descs.join(", "));
    }
    if !chunk.exports.is_empty() {
        let _ = writeln!(s, "• exports: [{}]", chunk.exports.join(", "));
    }

    // ── Pool de constantes ─────────────────────────────────────────────────
    if chunk.consts.is_empty() {
        let _ = writeln!(s, "\n# Const Pool (vide)");
    } else {
        let _ = writeln!(s, "\n# Const Pool");
        for (ix, c) in chunk.consts.iter() {
            let (ty, preview) = fmt_const(c);
            let _ = writeln!(s, "  [{ix:03}] {ty:<5}  {preview}");
        }
    }

    // ── Table des lignes ───────────────────────────────────────────────────
    let _ = writeln!(s, "\n# Line Table (PC ranges)");
    let mut any = false;
    for (range, line) in chunk.lines.iter_ranges() {
        any = true;
        let _ = writeln!(s, "  [{:05}..{:05})  line {line}", range.start, range.end);
    }
    if !any {
        let _ = writeln!(s, "  <aucune info de ligne>");
    }

    // ── Code (avec labels) ─────────────────────────────────────────────────
    let _ = writeln!(s, "\n# Code");
    let labels = compute_labels(chunk);
    for (pc_usize, op) in chunk.ops.iter().enumerate() {
        let pc = pc_usize as u32;
        if let Some(lbl) = labels.get(&pc) {
            let _ = writeln!(s, "{lbl}:");
        }
        let line = chunk.line_at(pc).map(|x| x.to_string()).unwrap_or_else(|| "-".into());
        let _ = writeln!(s, "  {pc:05} (line {line:>4})  {}", fmt_op(chunk, pc, op, &labels));
    }

    // ── Protos embarqués ───────────────────────────────────────────────────
    for (ix, c) in chunk.consts.iter() {
        if let ConstValue::Func(proto) = c {
            s.push('\n');
            disassemble_into(s, proto, &format!("{title}::[{ix:03}] {}", proto.name));
        }
    }
}

/* ────────────────────────────── Helpers ────────────────────────────── */

/// Map `pc cible → label` pour toutes les destinations de saut.
fn compute_labels(chunk: &Chunk) -> HashMap<u32, String> {
    let mut targets = Vec::<u32>::new();
    for (pc_usize, op) in chunk.ops.iter().enumerate() {
        if let Some(dest) = op.jump_target(pc_usize as u32) {
            if (dest as usize) < chunk.ops.len() {
                targets.push(dest);
            }
        }
    }
    targets.sort_unstable();
    targets.dedup();
    targets
        .into_iter()
        .enumerate()
        .map(|(i, pc)| (pc, format!("L{:04}", i + 1)))
        .collect()
}

/// Formate une instruction : mnémonique + opérandes + annotations.
fn fmt_op(chunk: &Chunk, pc: u32, op: &Op, labels: &HashMap<u32, String>) -> String {
    use Op::*;
    let m = op.mnemonic();
    match op {
        LoadConst(ix) | GetGlobal(ix) | SetGlobal(ix) | DefineGlobal(ix)
        | GetField(ix) | SetField(ix) | Closure(ix) | Import(ix)
        | React(ix) | Unreact(ix) | Bond(ix) | Unbond(ix) | Seed(ix) | Unseed(ix) => {
            format!("{m} {ix}  {}", const_annex(chunk, *ix))
        }
        LoadInt8(i) => format!("{m} {i}"),
        GetLocal(ix) | SetLocal(ix) | IncLocal(ix) | DecLocal(ix) | SetIndexLocal(ix) => {
            match chunk.name_of_slot(*ix) {
                Some(n) => format!("{m} {ix}  ; {n}"),
                None => format!("{m} {ix}"),
            }
        }
        GetUpvalue(ix) | SetUpvalue(ix) => format!("{m} {ix}"),
        Jump(_) | JumpIfFalse(_) | JumpIfTrue(_) | JumpIfNotNil(_) | Loop(_)
        | PushHandler(_) => {
            let off = op.jump_offset().unwrap_or(0);
            let dest = op.jump_target(pc).unwrap_or(0);
            let lbl = labels.get(&dest).cloned().unwrap_or_else(|| dest.to_string());
            format!("{m} {off:+}  -> {lbl}")
        }
        Call(argc) | Print(argc) => format!("{m} argc={argc}"),
        Invoke { name, argc } => {
            format!("{m} name={name} argc={argc}  {}", const_annex(chunk, *name))
        }
        InvokeLocal { slot, name, argc } => {
            format!("{m} slot={slot} name={name} argc={argc}  {}", const_annex(chunk, *name))
        }
        InvokeGlobal { recv, name, argc } => {
            format!("{m} recv={recv} name={name} argc={argc}  {}", const_annex(chunk, *name))
        }
        BuildArray(n) | BuildMap(n) => format!("{m} n={n}"),
        BuildTuple(n) | BuildEnum { payload: n, .. } => format!("{m} n={n}"),
        BuildStruct { name, fields } => {
            format!("{m} name={name} fields={}  {}", fields.len(), const_annex(chunk, *name))
        }
        FreezeVar { name, loc, slot } | ThawVar { name, loc, slot }
        | SublimateVar { name, loc, slot } => {
            format!("{m} name={name} loc={loc:?} slot={slot}  {}", const_annex(chunk, *name))
        }
        Scope { spawns, sync } => {
            format!("{m} spawns={} sync={}", spawns.len(), sync.is_some())
        }
        Select { arms } => {
            let descs: Vec<&str> = arms
                .iter()
                .map(|a| match a {
                    SelectArm::Chan { binds: true } => "chan(bind)",
                    SelectArm::Chan { binds: false } => "chan",
                    SelectArm::Default => "default",
                    SelectArm::Timeout => "timeout",
                })
                .collect();
            format!("{m} [{}]", descs.join(", "))
        }
        _ => m.to_string(),
    }
}

fn const_annex(chunk: &Chunk, ix: u32) -> String {
    match chunk.const_at(ix) {
        Some(v) => format!("; {}", pretty_const(v, 60)),
        None => "; <invalid>".into(),
    }
}

/// Renvoie (type court, aperçu court) pour une constante.
fn fmt_const(c: &ConstValue) -> (&'static str, String) {
    match c {
        ConstValue::Nil => ("nil", "nil".into()),
        ConstValue::Bool(b) => ("bool", format!("{b}")),
        ConstValue::I64(i) => ("i64", format!("{i}")),
        ConstValue::F64(x) => ("f64", format!("{x}")),
        ConstValue::Str(s) => ("str", preview_str(s, 80)),
        ConstValue::Func(f) => ("func", format!("<fn {}/{}>", f.name, f.arity())),
    }
}

fn pretty_const(c: &ConstValue, str_max: usize) -> String {
    match c {
        ConstValue::Str(s) => format!("\"{}\"", shorten(s, str_max)),
        other => format!("{other}"),
    }
}

fn preview_str(s: &str, max: usize) -> String {
    let esc = escape_for_preview(s);
    if esc.len() <= max { format!("\"{esc}\"") } else { format!("\"{}…\"", &esc[..max]) }
}

fn escape_for_preview(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => {
                let _ = write!(out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

fn shorten(s: &str, max: usize) -> String {
    if s.len() <= max { s.to_string() } else { format!("{}…", &s[..max]) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::ChunkFlags;

    #[test]
    fn compact_lists_every_op() {
        let mut c = Chunk::script();
        let k = c.add_const(ConstValue::I64(3));
        c.push_op(Op::LoadConst(k), 1);
        c.push_op(Op::LoadInt8(2), 1);
        c.push_op(Op::Add, 1);
        c.push_op(Op::Return, 2);

        let out = disassemble_compact(&c);
        assert_eq!(out.lines().count(), 4);
        assert!(out.contains("ldc 0"));
        assert!(out.contains("add"));
    }

    #[test]
    fn full_view_recurses_into_protos() {
        let mut inner = Chunk::new("inner", ChunkFlags::default());
        inner.push_op(Op::LoadNil, 1);
        inner.push_op(Op::Return, 1);

        let mut c = Chunk::script();
        let f = c.add_func(inner);
        c.push_op(Op::Closure(f), 1);
        c.push_op(Op::Return, 1);

        let out = disassemble(&c, "demo");
        assert!(out.contains("== demo =="));
        assert!(out.contains("inner"));
        assert!(out.contains("mkclo"));
    }

    #[test]
    fn jump_targets_get_labels() {
        let mut c = Chunk::script();
        c.push_op(Op::LoadTrue, 1);
        c.push_op(Op::JumpIfFalse(1), 1);
        c.push_op(Op::LoadNil, 2);
        c.push_op(Op::Return, 3);

        let out = disassemble(&c, "jumps");
        assert!(out.contains("L0001"));
        assert!(out.contains("-> L0001"));
    }
}
