//! chunk.rs — Représentation binaire d'un "chunk" de bytecode pour Lattice.
//!
//! - Pool de constantes avec dé-dupe (chaînes par empreinte FNV-1a,
//!   entiers/flottants par valeur littérale) + entrée non-dédupée pour les
//!   constantes à identité (protos de fonctions imbriqués)
//! - Table de lignes compacte (RLE)
//! - Registre de noms locaux (slot → nom de debug), liste d'exports,
//!   métadonnées de paramètres (défauts + annotations de phase)
//! - Descripteurs d'upvalues du proto (`is_local`, `index`)
//! - (Dé)sérialisation via bincode + magic/version/hash
//!
//! Un chunk imbriqué comme constante (`ConstValue::Func`) appartient à son
//! parent ; les flottants voyagent en motif IEEE-754 (round-trip bit-exact,
//! c'est le comportement fixint de bincode).

use serde::{Deserialize, Serialize};
use std::fmt::{self, Write as _};
use std::ops::Range;
use std::sync::Arc;

use crate::bytecode::{ConstIx, LocalIx, Op};
use crate::phase::Phase;

/// Numéro de version de format de chunk.
/// Incrémente si la structure sérialisée change.
pub const CHUNK_VERSION: u16 = 1;

/// Magic file header: b"LATC"
pub const CHUNK_MAGIC: [u8; 4] = *b"LATC";

/// Flags de chunk (réservé pour options futures).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkFlags {
    /// Si vrai, le chunk est "stripped" (pas d'infos debug).
    pub stripped: bool,
}

/// Valeurs constantes embarquées dans un chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Nil,
    Bool(bool),
    I64(i64),
    F64(f64),
    /// Chaînes UTF-8 (internées côté pool).
    Str(String),
    /// Proto de fonction compilée (fermetures, corps spawn, bras select…).
    Func(Arc<Chunk>),
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Nil => f.write_str("nil"),
            ConstValue::Bool(b) => write!(f, "{b}"),
            ConstValue::I64(i) => write!(f, "{i}"),
            ConstValue::F64(x) => {
                if x.is_nan() {
                    f.write_str("NaN")
                } else if x.is_infinite() {
                    if x.is_sign_positive() { f.write_str("+Inf") } else { f.write_str("-Inf") }
                } else {
                    write!(f, "{x}")
                }
            }
            ConstValue::Str(s) => {
                f.write_char('"')?;
                for ch in s.chars() {
                    match ch {
                        '\\' => f.write_str("\\\\")?,
                        '"' => f.write_str("\\\"")?,
                        '\n' => f.write_str("\\n")?,
                        '\r' => f.write_str("\\r")?,
                        '\t' => f.write_str("\\t")?,
                        c if c.is_control() => write!(f, "\\u{{{:x}}}", c as u32)?,
                        c => f.write_char(c)?,
                    }
                }
                f.write_char('"')
            }
            ConstValue::Func(c) => write!(f, "<fn {}/{}>", c.name, c.arity()),
        }
    }
}

/// Pool de constantes avec dé-dupe par empreinte.
///
/// Les index inverses sont reconstruits au chargement (`#[serde(skip)]`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstPool {
    pub(crate) values: Vec<ConstValue>,
    /// Empreinte FNV-1a-64 → index, pour les chaînes.
    #[serde(skip)]
    str_index: ahash::AHashMap<u64, ConstIx>,
    #[serde(skip)]
    int_index: ahash::AHashMap<i64, ConstIx>,
    /// Clé = motif de bits IEEE-754 (égalité littérale, NaN ≠ NaN inclus).
    #[serde(skip)]
    float_index: ahash::AHashMap<u64, ConstIx>,
}

impl ConstPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ajoute avec dé-dupe (chaînes, entiers, flottants).
    /// Les autres genres passent par [`ConstPool::add_raw`].
    pub fn add(&mut self, v: ConstValue) -> ConstIx {
        match &v {
            ConstValue::Str(s) => {
                let fp = fnv1a64(s.as_bytes());
                if let Some(&idx) = self.str_index.get(&fp) {
                    // garde anti-collision : l'empreinte n'est qu'un raccourci
                    if matches!(&self.values[idx as usize], ConstValue::Str(prev) if prev == s) {
                        return idx;
                    }
                }
                let idx = self.push_raw(v);
                self.str_index.insert(fp, idx);
                idx
            }
            ConstValue::I64(i) => {
                if let Some(&idx) = self.int_index.get(i) {
                    return idx;
                }
                let i = *i;
                let idx = self.push_raw(v);
                self.int_index.insert(i, idx);
                idx
            }
            ConstValue::F64(x) => {
                let bits = x.to_bits();
                if let Some(&idx) = self.float_index.get(&bits) {
                    return idx;
                }
                let idx = self.push_raw(v);
                self.float_index.insert(bits, idx);
                idx
            }
            _ => self.push_raw(v),
        }
    }

    /// Ajout sans dé-dupe, pour les constantes où l'identité compte
    /// (protos de fonctions imbriqués).
    pub fn add_raw(&mut self, v: ConstValue) -> ConstIx {
        self.push_raw(v)
    }

    fn push_raw(&mut self, v: ConstValue) -> ConstIx {
        let idx = self.values.len() as ConstIx;
        self.values.push(v);
        idx
    }

    pub fn get(&self, idx: ConstIx) -> Option<&ConstValue> {
        self.values.get(idx as usize)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConstIx, &ConstValue)> {
        self.values.iter().enumerate().map(|(i, v)| (i as ConstIx, v))
    }

    fn rebuild_indexes(&mut self) {
        self.str_index.clear();
        self.int_index.clear();
        self.float_index.clear();
        for (i, v) in self.values.iter().enumerate() {
            let i = i as ConstIx;
            match v {
                ConstValue::Str(s) => {
                    self.str_index.entry(fnv1a64(s.as_bytes())).or_insert(i);
                }
                ConstValue::I64(n) => {
                    self.int_index.entry(*n).or_insert(i);
                }
                ConstValue::F64(x) => {
                    self.float_index.entry(x.to_bits()).or_insert(i);
                }
                _ => {}
            }
        }
    }
}

/// Entrée compressée de la table de lignes (RLE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineRun {
    pub start_pc: u32,
    pub line: u32,
    pub len: u32,
}

/// Table des lignes : map PC → ligne via segments RLE.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    pub fn new() -> Self {
        Self { runs: Vec::new() }
    }

    pub fn push_line(&mut self, pc: u32, line: u32) {
        match self.runs.last_mut() {
            Some(last) if last.line == line && last.start_pc + last.len == pc => {
                last.len += 1;
            }
            _ => self.runs.push(LineRun { start_pc: pc, line, len: 1 }),
        }
    }

    pub fn line_for_pc(&self, pc: u32) -> Option<u32> {
        for run in &self.runs {
            if pc >= run.start_pc && pc < run.start_pc + run.len {
                return Some(run.line);
            }
        }
        None
    }

    pub fn iter_ranges(&self) -> impl Iterator<Item = (Range<u32>, u32)> + '_ {
        self.runs.iter().map(|r| (r.start_pc..(r.start_pc + r.len), r.line))
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }
}

/// Paramètre d'un proto de fonction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    /// Constante du défaut, si le paramètre en a un.
    pub default: Option<ConstIx>,
    /// Annotation de phase exigée à l'appel, si déclarée.
    pub phase: Option<Phase>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self { name: name.into(), default: None, phase: None }
    }
}

/// Descripteur de capture d'upvalue, résolu à la compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpvalDesc {
    /// `true` : capture un slot de la frame englobante ;
    /// `false` : propage un upvalue de la fermeture englobante.
    pub is_local: bool,
    pub index: u16,
}

/// En-tête de chunk, séparé pour contrôle d'intégrité.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ChunkHeader {
    magic: [u8; 4],
    version: u16,
    flags: ChunkFlags,
    hash_fnv1a_64: u64,
}

/// Le chunk complet : ops + constantes + métadonnées.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    header: ChunkHeader,
    /// Nom de la fonction ("<script>" pour l'unité racine).
    pub name: String,
    /// Paramètres déclarés (l'arité est leur nombre).
    pub params: Vec<ParamSpec>,
    /// Le dernier paramètre ramasse-t-il le reste des arguments ?
    pub variadic: bool,
    /// Captures du proto.
    pub upvals: Vec<UpvalDesc>,
    pub ops: Vec<Op>,
    pub consts: ConstPool,
    pub lines: LineTable,
    /// Registre slot → nom (debug, pressions, invoke_local).
    pub local_names: Vec<(LocalIx, String)>,
    /// Noms exportés par un chunk-module.
    pub exports: Vec<String>,
}

impl Chunk {
    pub fn new(name: impl Into<String>, flags: ChunkFlags) -> Self {
        Self {
            header: ChunkHeader {
                magic: CHUNK_MAGIC,
                version: CHUNK_VERSION,
                flags,
                hash_fnv1a_64: 0,
            },
            name: name.into(),
            params: Vec::new(),
            variadic: false,
            upvals: Vec::new(),
            ops: Vec::new(),
            consts: ConstPool::new(),
            lines: LineTable::new(),
            local_names: Vec::new(),
            exports: Vec::new(),
        }
    }

    /// Chunk racine d'un script.
    pub fn script() -> Self {
        Self::new("<script>", ChunkFlags::default())
    }

    pub fn version(&self) -> u16 {
        self.header.version
    }

    pub fn flags(&self) -> ChunkFlags {
        self.header.flags
    }

    /// Nombre de paramètres déclarés.
    pub fn arity(&self) -> usize {
        self.params.len()
    }

    // ---------- API d'écriture (compilateur) ----------

    pub fn push_op(&mut self, op: Op, line: u32) -> u32 {
        let pc = self.ops.len() as u32;
        self.ops.push(op);
        self.lines.push_line(pc, line);
        pc
    }

    pub fn add_const(&mut self, v: ConstValue) -> ConstIx {
        self.consts.add(v)
    }

    /// Embarque un proto (jamais dédupé : l'identité compte).
    pub fn add_func(&mut self, proto: Chunk) -> ConstIx {
        self.consts.add_raw(ConstValue::Func(Arc::new(proto)))
    }

    pub fn set_local_name(&mut self, slot: LocalIx, name: impl Into<String>) {
        self.local_names.push((slot, name.into()));
    }

    // ---------- API de lecture (VM) ----------

    pub fn const_at(&self, idx: ConstIx) -> Option<&ConstValue> {
        self.consts.get(idx)
    }

    pub fn line_at(&self, pc: u32) -> Option<u32> {
        self.lines.line_for_pc(pc)
    }

    /// Nom de debug d'un slot, s'il a été enregistré.
    pub fn name_of_slot(&self, slot: LocalIx) -> Option<&str> {
        self.local_names
            .iter()
            .rev()
            .find(|(s, _)| *s == slot)
            .map(|(_, n)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    // ---------- (Dé)sérialisation ----------

    pub fn compute_hash(&self) -> u64 {
        let mut h = Fnv1a64::new();
        let mut feed = |bytes: Vec<u8>| h.write(&bytes);
        feed(ser(&self.ops));
        feed(ser(&self.consts.values));
        feed(ser(&self.lines));
        feed(ser(&(&self.name, &self.params, self.variadic, &self.upvals)));
        feed(ser(&(&self.local_names, &self.exports)));
        h.finish()
    }

    fn finalize_header(&mut self) {
        self.header.hash_fnv1a_64 = self.compute_hash();
    }

    pub fn to_bytes(&mut self) -> Vec<u8> {
        self.finalize_header();
        use bincode::Options as _;
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_little_endian()
            .serialize(self)
            .expect("serialize chunk")
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ChunkLoadError> {
        use bincode::Options as _;
        let mut chunk: Self = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_little_endian()
            .deserialize(bytes)
            .map_err(ChunkLoadError::Bincode)?;

        if chunk.header.magic != CHUNK_MAGIC {
            return Err(ChunkLoadError::BadMagic(chunk.header.magic));
        }
        if chunk.header.version != CHUNK_VERSION {
            return Err(ChunkLoadError::BadVersion {
                expected: CHUNK_VERSION,
                found: chunk.header.version,
            });
        }

        chunk.consts.rebuild_indexes();

        let expect_hash = chunk.header.hash_fnv1a_64;
        let got_hash = chunk.compute_hash();
        if expect_hash != got_hash {
            return Err(ChunkLoadError::BadHash { expected: expect_hash, found: got_hash });
        }

        Ok(chunk)
    }

    /// Désassemblage lisible (voir `disasm.rs` pour la version complète).
    pub fn disassemble(&self, title: &str) -> String {
        crate::bytecode::disasm::disassemble(self, title)
    }
}

fn ser<T: Serialize>(v: &T) -> Vec<u8> {
    bincode::serialize(v).expect("serialize ok")
}

#[derive(Debug)]
pub enum ChunkLoadError {
    Bincode(bincode::Error),
    BadMagic([u8; 4]),
    BadVersion { expected: u16, found: u16 },
    BadHash { expected: u64, found: u64 },
}

impl fmt::Display for ChunkLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkLoadError::Bincode(e) => write!(f, "bincode: {e}"),
            ChunkLoadError::BadMagic(m) => write!(f, "mauvais magic: {m:?}"),
            ChunkLoadError::BadVersion { expected, found } => {
                write!(f, "mauvaise version: attendu {expected}, trouvé {found}")
            }
            ChunkLoadError::BadHash { expected, found } => {
                write!(f, "hash invalide: attendu 0x{expected:016x}, trouvé 0x{found:016x}")
            }
        }
    }
}
impl std::error::Error for ChunkLoadError {}

/// FNV-1a 64 bits (empreintes de constantes + hash de contenu).
#[derive(Default)]
pub(crate) struct Fnv1a64(u64);
impl Fnv1a64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    pub(crate) fn new() -> Self {
        Self(Self::OFFSET_BASIS)
    }
    pub(crate) fn write(&mut self, bytes: &[u8]) {
        let mut h = self.0;
        for &b in bytes {
            h ^= u64::from(b);
            h = h.wrapping_mul(Self::PRIME);
        }
        self.0 = h;
    }
    pub(crate) fn finish(&self) -> u64 {
        self.0
    }
}

/// Empreinte FNV-1a-64 d'un buffer.
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h = Fnv1a64::new();
    h.write(bytes);
    h.finish()
}
