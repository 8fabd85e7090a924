//! vm.rs — Boucle d'exécution de la VM Lattice.
//!
//! Une pile de valeurs, une pile de frames, un switch dense sur les
//! opcodes. Contrat : à tout instant observable, la pile ne contient que
//! des valeurs possédées ; aucun handler d'opcode ne laisse la pile
//! déséquilibrée en cas de succès.
//!
//! Les sous-systèmes vivent dans leurs modules (`phase`, `methods`,
//! `concurrency`, `module`) comme blocs `impl Vm` ; ici : registres,
//! fetch/dispatch, appels/retours, exceptions, defers, upvalues.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use log::trace;
use parking_lot::RwLock;

use lattice_core::bytecode::{ConstIx, Op, VarLoc};
use lattice_core::{Chunk, ConstValue, Phase};

use crate::closure::{Closure, ClosureKind, NativeFn};
use crate::env::Env;
use crate::error::{RuntimeError, VmResult};
use crate::ext::{self, ExtRegistry};
use crate::module::ModuleCompiler;
use crate::phase::{BondEntry, Pressure, Snapshot};
use crate::upvalue::Upvalue;
use crate::value::{EnumVal, StructVal, Value, ValueKind};

/// Options de construction / exécution de la VM.
#[derive(Debug, Clone)]
pub struct VmOptions {
    /// Taille maximale de pile (valeurs).
    pub stack_limit: usize,
    /// Profondeur maximale d'appels.
    pub call_depth_limit: usize,
    /// Active le *tracing* basique (un log par opcode).
    pub trace: bool,
    /// Installe les fonctions natives de base.
    pub stdlib: bool,
    /// Capture `print` dans un buffer au lieu de stdout.
    pub capture_stdout: bool,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            stack_limit: 1 << 20,      // ~1M valeurs
            call_depth_limit: 1 << 12, // 4096 frames
            trace: false,
            stdlib: true,
            capture_stdout: false,
        }
    }
}

impl VmOptions {
    pub fn with_trace(mut self, on: bool) -> Self { self.trace = on; self }
    pub fn with_stdlib(mut self, on: bool) -> Self { self.stdlib = on; self }
    pub fn with_capture_stdout(mut self, on: bool) -> Self { self.capture_stdout = on; self }
    pub fn with_stack_limit(mut self, lim: usize) -> Self { self.stack_limit = lim; self }
    pub fn with_call_depth_limit(mut self, lim: usize) -> Self { self.call_depth_limit = lim; self }
}

/// Nature d'une frame (le retour n'a pas le même effet pour un defer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    /// Unité racine d'un `run`.
    Script,
    /// Appel ordinaire.
    Call,
    /// Corps de defer : la valeur de retour est jetée.
    Defer,
}

/// Frame d'appel : fermeture + chunk + ip + base de pile.
#[derive(Debug, Clone)]
pub(crate) struct CallFrame {
    pub(crate) closure: Arc<Closure>,
    pub(crate) chunk: Arc<Chunk>,
    pub(crate) ip: usize,
    /// Index de pile du slot 0 (`self`).
    pub(crate) base: usize,
    pub(crate) kind: FrameKind,
    /// Valeur de retour mise de côté pendant l'exécution des defers.
    pub(crate) defer_hold: Option<Value>,
}

/// Handler d'exception enregistré par `PushHandler`.
#[derive(Debug, Clone, Copy)]
struct Handler {
    resume_ip: usize,
    frame_depth: usize,
    stack_top: usize,
}

/// Defer en attente : la fermeture-corps et la profondeur de sa frame.
#[derive(Debug, Clone)]
struct DeferEntry {
    depth: usize,
    body: Value,
}

/// Formes de struct connues (partagé lecture seule avec les VM enfants).
#[derive(Debug, Default)]
pub struct StructRegistry {
    shapes: RwLock<AHashMap<String, StructShape>>,
}

#[derive(Debug, Clone)]
pub struct StructShape {
    pub fields: Vec<String>,
    pub field_phases: Option<Vec<Phase>>,
}

impl StructRegistry {
    pub fn shape_of(&self, name: &str) -> Option<StructShape> {
        self.shapes.read().get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) stack: usize,
    pub(crate) frames: usize,
}

/// Machine virtuelle.
pub struct Vm {
    // ---- registres d'exécution ----
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<CallFrame>,
    /// Upvalues ouverts, triés par slot croissant.
    open_upvals: Vec<Upvalue>,
    handlers: Vec<Handler>,
    deferred: Vec<DeferEntry>,
    halted: bool,

    // ---- environnement ----
    pub(crate) env: Env,
    pub(crate) struct_registry: Arc<StructRegistry>,

    // ---- sous-système de phases ----
    pub(crate) tracked: AHashMap<String, Vec<Snapshot>>,
    pub(crate) pressures: AHashMap<String, Pressure>,
    pub(crate) reactions: AHashMap<String, Vec<Value>>,
    pub(crate) bonds: AHashMap<String, Vec<BondEntry>>,
    pub(crate) seeds: AHashMap<String, Vec<Value>>,

    // ---- modules & extensions ----
    pub(crate) import_cache: AHashMap<std::path::PathBuf, Value>,
    pub(crate) required: AHashSet<std::path::PathBuf>,
    pub(crate) compiler: Option<ModuleCompiler>,
    pub(crate) ext: ExtRegistry,

    // ---- options ----
    pub(crate) limits: Limits,
    pub(crate) trace: bool,
    pub(crate) capture_stdout: bool,
    stdout: String,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Crée une VM avec les options par défaut (stdlib comprise).
    pub fn new() -> Self {
        Self::with_options(VmOptions::default())
    }

    /// Crée une VM avec les options fournies.
    pub fn with_options(options: VmOptions) -> Self {
        let mut vm = Self {
            stack: Vec::with_capacity(1024),
            frames: Vec::with_capacity(64),
            open_upvals: Vec::new(),
            handlers: Vec::new(),
            deferred: Vec::new(),
            halted: false,
            env: Env::new(),
            struct_registry: Arc::new(StructRegistry::default()),
            tracked: AHashMap::new(),
            pressures: AHashMap::new(),
            reactions: AHashMap::new(),
            bonds: AHashMap::new(),
            seeds: AHashMap::new(),
            import_cache: AHashMap::new(),
            required: AHashSet::new(),
            compiler: None,
            ext: ExtRegistry::new(),
            limits: Limits { stack: options.stack_limit, frames: options.call_depth_limit },
            trace: options.trace,
            capture_stdout: options.capture_stdout,
            stdout: String::new(),
        };
        if options.stdlib {
            crate::native::install_stdlib(&mut vm);
        }
        vm
    }

    // ---------- API hôte ----------

    /// Déclare une globale.
    pub fn define_global(&mut self, name: impl Into<String>, v: Value) {
        self.env.define(name, v);
    }

    /// Récupère une globale.
    pub fn get_global(&self, name: &str) -> Option<&Value> {
        self.env.get(name)
    }

    /// Déclare une fonction native.
    pub fn define_native(&mut self, name: &str, f: NativeFn) {
        self.env.define(name, Value::closure(Closure::native(name, f)));
    }

    /// Déclare une extension disponible pour `require_ext`.
    pub fn declare_extension(&mut self, name: &str, init: crate::ext::ExtInitFn) {
        self.ext.declare(name, init);
    }

    /// Enregistre la forme d'un type struct (phases par champ comprises).
    pub fn register_struct(
        &self,
        name: impl Into<String>,
        fields: Vec<String>,
        field_phases: Option<Vec<Phase>>,
    ) {
        self.struct_registry
            .shapes
            .write()
            .insert(name.into(), StructShape { fields, field_phases });
    }

    /// Sortie capturée (si `capture_stdout`), vidée au passage.
    pub fn take_stdout(&mut self) -> String {
        std::mem::take(&mut self.stdout)
    }

    // ---------- Exécution ----------

    /// Exécute un chunk racine jusqu'au retour (ou à la faute top-level).
    pub fn run(&mut self, chunk: &Chunk) -> VmResult<Value> {
        self.run_arc(Arc::new(chunk.clone()))
    }

    /// Comme [`Vm::run`] sans re-clonage du chunk.
    pub fn run_arc(&mut self, chunk: Arc<Chunk>) -> VmResult<Value> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvals.clear();
        self.handlers.clear();
        self.deferred.clear();
        self.halted = false;

        let main = self.plain_closure(Arc::clone(&chunk))?;
        let base = self.stack.len();
        self.push(Value::closure(main.clone()))?;
        self.push_frame(Arc::new(main), chunk, base, FrameKind::Script)?;
        self.run_until(0)
    }

    /// Boucle de dispatch : tourne tant que des frames vivent au-dessus de
    /// `min_depth`. Les appels réentrants (méthodes à fermeture, defers,
    /// modules) réutilisent la même boucle avec leur profondeur d'entrée.
    pub(crate) fn run_until(&mut self, min_depth: usize) -> VmResult<Value> {
        while self.frames.len() > min_depth && !self.halted {
            match self.step() {
                Ok(()) => {}
                Err(e) => self.handle_fault(e, min_depth)?,
            }
        }
        if self.halted {
            return Ok(self.stack.last().cloned().unwrap_or_else(Value::nil));
        }
        Ok(self.stack.pop().unwrap_or_else(Value::nil))
    }

    /// Fetch + exécution d'un opcode.
    fn step(&mut self) -> VmResult<()> {
        let end_of_code = {
            let Some(fr) = self.frames.last() else { return Ok(()) };
            fr.ip >= fr.chunk.ops.len()
        };
        if end_of_code {
            // Tomber du bout du chunk = retour implicite de nil.
            self.push(Value::nil())?;
            return self.op_return();
        }

        let (op, ip0) = {
            let Some(fr) = self.frames.last_mut() else { return Ok(()) };
            let op = fr.chunk.ops[fr.ip].clone();
            let ip0 = fr.ip;
            fr.ip += 1;
            (op, ip0)
        };

        if self.trace {
            trace!("[ip={ip0:04}] {}", op.mnemonic());
        }
        self.exec_op(op)
    }

    fn exec_op(&mut self, op: Op) -> VmResult<()> {
        use Op::*;
        match op {
            // ---- Structure
            Nop => Ok(()),
            Return => self.op_return(),
            Halt => {
                self.halted = true;
                Ok(())
            }

            // ---- Littéraux & pile
            LoadNil => self.push(Value::nil()),
            LoadTrue => self.push(Value::bool(true)),
            LoadFalse => self.push(Value::bool(false)),
            LoadUnit => self.push(Value::unit()),
            LoadConst(ix) => {
                let v = self.const_value(ix)?;
                self.push(v)
            }
            LoadInt8(i) => self.push(Value::int(i64::from(i))),
            Pop => self.pop().map(|_| ()),
            Dup => {
                let v = self.peek(0)?.clone();
                self.push(v)
            }
            Swap => {
                let len = self.stack.len();
                if len < 2 {
                    return Err(RuntimeError::type_err("stack underflow on swap"));
                }
                self.stack.swap(len - 1, len - 2);
                Ok(())
            }

            // ---- Arith / logique
            Add => self.bin_arith("+"),
            Sub => self.bin_arith("-"),
            Mul => self.bin_arith("*"),
            Div => self.bin_arith("/"),
            Mod => self.bin_arith("%"),
            Neg => {
                let v = self.pop()?;
                match &v.kind {
                    ValueKind::Int(i) => self.push(Value::int(i.wrapping_neg())),
                    ValueKind::Float(x) => self.push(Value::float(-x)),
                    _ => Err(RuntimeError::type_err("operand must be a number for unary '-'")),
                }
            }
            BitAnd => self.bin_bits("&", |a, b| a & b),
            BitOr => self.bin_bits("|", |a, b| a | b),
            BitXor => self.bin_bits("^", |a, b| a ^ b),
            Shl => self.bin_bits("<<", |a, b| a.wrapping_shl(b as u32)),
            Shr => self.bin_bits(">>", |a, b| a.wrapping_shr(b as u32)),
            Not => {
                let v = self.pop()?;
                self.push(Value::bool(!v.is_truthy()))
            }

            // ---- Comparaisons
            Eq => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::bool(a.eq_value(&b)))
            }
            Ne => {
                let b = self.pop()?;
                let a = self.pop()?;
                self.push(Value::bool(!a.eq_value(&b)))
            }
            Lt => self.bin_cmp(|o| o == std::cmp::Ordering::Less),
            Le => self.bin_cmp(|o| o != std::cmp::Ordering::Greater),
            Gt => self.bin_cmp(|o| o == std::cmp::Ordering::Greater),
            Ge => self.bin_cmp(|o| o != std::cmp::Ordering::Less),

            // ---- Chemin chaud int-only
            AddInt => self.bin_int("+", i64::wrapping_add),
            SubInt => self.bin_int("-", i64::wrapping_sub),
            LtInt => {
                let b = self.pop_int("<")?;
                let a = self.pop_int("<")?;
                self.push(Value::bool(a < b))
            }
            IncLocal(slot) => self.bump_local(slot, 1),
            DecLocal(slot) => self.bump_local(slot, -1),

            // ---- Variables
            GetLocal(slot) => {
                let v = self.local(slot)?.clone();
                self.push(v)
            }
            SetLocal(slot) => {
                let v = self.pop()?;
                let idx = self.local_index(slot)?;
                self.guard_rebind(&self.stack[idx], slot)?;
                self.stack[idx] = v;
                Ok(())
            }
            GetGlobal(ix) => {
                let name = self.str_const(ix)?;
                let v = self.env.get(&name).cloned();
                match v {
                    Some(v) => self.push(v),
                    None => Err(RuntimeError::name(format!("undefined variable '{name}'"))),
                }
            }
            SetGlobal(ix) => {
                let name = self.str_const(ix)?;
                let v = self.pop()?;
                if let Some(old) = self.env.get(&name) {
                    if old.phase.is_frozen() {
                        return Err(RuntimeError::phase(format!(
                            "cannot assign to {} variable '{name}'",
                            old.phase
                        )));
                    }
                } else {
                    return Err(RuntimeError::name(format!("undefined variable '{name}'")));
                }
                self.env.set(&name, v);
                Ok(())
            }
            DefineGlobal(ix) => {
                let name = self.str_const(ix)?;
                let v = self.pop()?;
                self.env.define(name, v);
                Ok(())
            }
            GetUpvalue(ix) => {
                let cell = self.upvalue(ix)?;
                let v = cell.get(&self.stack);
                self.push(v)
            }
            SetUpvalue(ix) => {
                let v = self.pop()?;
                let cell = self.upvalue(ix)?;
                cell.set(&mut self.stack, v);
                Ok(())
            }
            CloseUpvalue => {
                let top = self.stack.len().saturating_sub(1);
                self.close_upvalues(top);
                self.pop().map(|_| ())
            }

            // ---- Contrôle
            Jump(off) => self.jump(off),
            JumpIfFalse(off) => {
                let v = self.pop()?;
                if !v.is_truthy() { self.jump(off) } else { Ok(()) }
            }
            JumpIfTrue(off) => {
                let v = self.pop()?;
                if v.is_truthy() { self.jump(off) } else { Ok(()) }
            }
            JumpIfNotNil(off) => {
                if !self.peek(0)?.is_nil() { self.jump(off) } else { Ok(()) }
            }
            Loop(back) => self.jump(-(back as i32)),

            // ---- Appels
            Call(argc) => self.op_call(argc as usize),
            Closure(ix) => self.op_closure(ix),
            Invoke { name, argc } => self.op_invoke_stack(name, argc as usize),
            InvokeLocal { slot, name, argc } => self.op_invoke_local(slot, name, argc as usize),
            InvokeGlobal { recv, name, argc } => self.op_invoke_global(recv, name, argc as usize),

            // ---- Constructeurs
            BuildArray(n) => {
                let items = self.pop_n(n as usize)?;
                self.push(Value::array(items))
            }
            ArrayFlatten => {
                let v = self.pop()?;
                match v.kind {
                    ValueKind::Array(items) => {
                        let mut flat = Vec::with_capacity(items.len());
                        for it in items {
                            match it.kind {
                                ValueKind::Array(inner) => flat.extend(inner),
                                _ => flat.push(it),
                            }
                        }
                        self.push(Value::array(flat))
                    }
                    _ => Err(RuntimeError::type_err("spread target must be an array")),
                }
            }
            BuildMap(n) => {
                let mut m = AHashMap::with_capacity(n as usize);
                let flat = self.pop_n(2 * n as usize)?;
                let mut it = flat.into_iter();
                while let (Some(k), Some(v)) = (it.next(), it.next()) {
                    match k.kind {
                        ValueKind::Str(s) => {
                            m.insert(s, v);
                        }
                        _ => {
                            return Err(RuntimeError::type_err(format!(
                                "map key must be a string, got {}",
                                k.type_name()
                            )));
                        }
                    }
                }
                self.push(Value::map(m))
            }
            BuildTuple(n) => {
                let items = self.pop_n(n as usize)?;
                self.push(Value::tuple(items))
            }
            BuildStruct { name, fields } => {
                let ty_name = self.str_const(name)?;
                let mut field_names = Vec::with_capacity(fields.len());
                for ix in fields.iter() {
                    field_names.push(self.str_const(*ix)?);
                }
                let values = self.pop_n(field_names.len())?;
                let field_phases =
                    self.struct_registry.shape_of(&ty_name).and_then(|s| s.field_phases);
                let sv = StructVal {
                    name: ty_name,
                    fields: field_names.into_iter().zip(values).collect(),
                    field_phases,
                };
                self.push(Value::new(ValueKind::Struct(sv)))
            }
            BuildRange => {
                let end = self.pop_int("range end")?;
                let start = self.pop_int("range start")?;
                self.push(Value::range(start, end))
            }
            BuildEnum { enum_name, variant, payload } => {
                let ev = EnumVal {
                    enum_name: self.str_const(enum_name)?,
                    variant: self.str_const(variant)?,
                    payload: self.pop_n(payload as usize)?,
                };
                self.push(Value::new(ValueKind::Enum(ev)))
            }

            // ---- Indexation / champs
            Index => {
                let idx = self.pop()?;
                let obj = self.pop()?;
                let out = index_get(&obj, &idx)?;
                self.push(out)
            }
            SetIndex => {
                let val = self.pop()?;
                let idx = self.pop()?;
                let mut obj = self.pop()?;
                index_set(&mut obj, idx, val)?;
                self.push(obj)
            }
            SetIndexLocal(slot) => {
                let val = self.pop()?;
                let idx = self.pop()?;
                let at = self.local_index(slot)?;
                let mut obj = std::mem::replace(&mut self.stack[at], Value::nil());
                let res = index_set(&mut obj, idx, val);
                self.stack[at] = obj;
                res
            }
            GetField(ix) => {
                let name = self.str_const(ix)?;
                let obj = self.pop()?;
                let out = field_get(&obj, &name)?;
                self.push(out)
            }
            SetField(ix) => {
                let name = self.str_const(ix)?;
                let val = self.pop()?;
                let mut obj = self.pop()?;
                field_set(&mut obj, &name, val)?;
                self.push(obj)
            }

            // ---- Exceptions
            PushHandler(off) => {
                let fr = self.frame()?;
                let resume_ip = offset_ip(fr.ip, off)?;
                let h = Handler {
                    resume_ip,
                    frame_depth: self.frames.len(),
                    stack_top: self.stack.len(),
                };
                self.handlers.push(h);
                Ok(())
            }
            PopHandler => {
                self.handlers.pop();
                Ok(())
            }
            Throw => {
                let v = self.pop()?;
                Err(RuntimeError::thrown(v))
            }
            TryUnwrap => {
                let v = self.pop()?;
                if let ValueKind::Map(m) = &v.kind {
                    match m.get("tag").and_then(|t| t.as_str()) {
                        Some("err") => return Err(RuntimeError::thrown(v)),
                        Some("ok") => {
                            let inner = m.get("value").cloned().unwrap_or_else(Value::nil);
                            return self.push(inner);
                        }
                        _ => {}
                    }
                }
                self.push(v)
            }

            // ---- Defer
            DeferPush => {
                let body = self.pop()?;
                if body.as_closure().is_none() {
                    return Err(RuntimeError::type_err("defer body must be a function"));
                }
                let depth = self.frames.len();
                self.deferred.push(DeferEntry { depth, body });
                Ok(())
            }
            DeferRun => self.op_defer_run(),

            // ---- Phases (valeur au sommet)
            Freeze => {
                let v = self.pop()?;
                self.push(v.freeze())
            }
            Thaw => {
                let v = self.pop()?;
                self.push(v.thaw())
            }
            CloneVal => {
                let v = self.pop()?;
                self.push(v.deep_clone())
            }
            MarkFluid => {
                let mut v = self.pop()?;
                v.phase = Phase::Fluid;
                self.push(v)
            }
            Sublimate => {
                let v = self.pop()?;
                self.push(v.sublimate())
            }

            // ---- Phases (variable nommée)
            FreezeVar { name, loc, slot } => {
                let name = self.str_const(name)?;
                self.op_freeze_var(&name, loc, slot)
            }
            ThawVar { name, loc, slot } => {
                let name = self.str_const(name)?;
                self.op_thaw_var(&name, loc, slot)
            }
            SublimateVar { name, loc, slot } => {
                let name = self.str_const(name)?;
                self.op_sublimate_var(&name, loc, slot)
            }

            // ---- Réactivité
            React(ix) => {
                let name = self.str_const(ix)?;
                self.op_react(&name)
            }
            Unreact(ix) => {
                let name = self.str_const(ix)?;
                self.reactions.remove(&name);
                Ok(())
            }
            Bond(ix) => {
                let name = self.str_const(ix)?;
                self.op_bond(&name)
            }
            Unbond(ix) => {
                let name = self.str_const(ix)?;
                self.bonds.remove(&name);
                Ok(())
            }
            Seed(ix) => {
                let name = self.str_const(ix)?;
                self.op_seed(&name)
            }
            Unseed(ix) => {
                let name = self.str_const(ix)?;
                self.seeds.remove(&name);
                Ok(())
            }

            // ---- Concurrence
            Scope { spawns, sync } => self.op_scope(&spawns, sync),
            Select { arms } => self.op_select(&arms),

            // ---- Import / I/O
            Print(argc) => {
                let args = self.pop_n(argc as usize)?;
                let line = args
                    .iter()
                    .map(|v| format!("{v}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                self.print_line(&line);
                Ok(())
            }
            Import(ix) => {
                let path = self.str_const(ix)?;
                let m = self.import_module(&path)?;
                self.push(m)
            }
        }
    }

    // ---------- Pile ----------

    pub(crate) fn push(&mut self, v: Value) -> VmResult<()> {
        if self.stack.len() >= self.limits.stack {
            return Err(RuntimeError::stack_overflow("value stack capacity exceeded"));
        }
        self.stack.push(v);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> VmResult<Value> {
        self.stack.pop().ok_or_else(|| RuntimeError::type_err("stack underflow"))
    }

    pub(crate) fn peek(&self, depth_from_top: usize) -> VmResult<&Value> {
        let len = self.stack.len();
        self.stack
            .get(len.wrapping_sub(1 + depth_from_top))
            .ok_or_else(|| RuntimeError::type_err("stack underflow"))
    }

    /// Dépile `n` valeurs, rendues dans l'ordre où elles ont été poussées.
    pub(crate) fn pop_n(&mut self, n: usize) -> VmResult<Vec<Value>> {
        let len = self.stack.len();
        if len < n {
            return Err(RuntimeError::type_err("stack underflow"));
        }
        Ok(self.stack.split_off(len - n))
    }

    fn pop_int(&mut self, what: &str) -> VmResult<i64> {
        let v = self.pop()?;
        v.as_int().ok_or_else(|| {
            RuntimeError::type_err(format!("expected int for {what}, got {}", v.type_name()))
        })
    }

    // ---------- Frames & variables ----------

    pub(crate) fn frame(&self) -> VmResult<&CallFrame> {
        self.frames.last().ok_or_else(|| RuntimeError::type_err("no active frame"))
    }

    pub(crate) fn frame_mut(&mut self) -> VmResult<&mut CallFrame> {
        self.frames.last_mut().ok_or_else(|| RuntimeError::type_err("no active frame"))
    }

    /// Ligne source de l'opcode en cours (celui qui vient d'être fetché).
    pub(crate) fn current_line(&self) -> Option<u32> {
        let fr = self.frames.last()?;
        fr.chunk.line_at(fr.ip.saturating_sub(1) as u32)
    }

    fn local_index(&self, slot: u16) -> VmResult<usize> {
        let fr = self.frame()?;
        let idx = fr.base + slot as usize;
        if idx >= self.stack.len() {
            return Err(RuntimeError::bounds(format!("local slot {slot} out of frame")));
        }
        Ok(idx)
    }

    pub(crate) fn local(&self, slot: u16) -> VmResult<&Value> {
        let idx = self.local_index(slot)?;
        Ok(&self.stack[idx])
    }

    pub(crate) fn set_local_value(&mut self, slot: u16, v: Value) -> VmResult<()> {
        let idx = self.local_index(slot)?;
        self.stack[idx] = v;
        Ok(())
    }

    fn upvalue(&self, ix: u16) -> VmResult<Upvalue> {
        let fr = self.frame()?;
        fr.closure
            .upvals
            .get(ix as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::bounds(format!("upvalue index {ix} out of range")))
    }

    fn guard_rebind(&self, old: &Value, slot: u16) -> VmResult<()> {
        if old.phase.is_frozen() {
            let name = self
                .frame()
                .ok()
                .and_then(|fr| fr.chunk.name_of_slot(slot).map(str::to_string))
                .unwrap_or_else(|| format!("slot {slot}"));
            return Err(RuntimeError::phase(format!(
                "cannot assign to {} variable '{name}'",
                old.phase
            )));
        }
        Ok(())
    }

    fn bump_local(&mut self, slot: u16, delta: i64) -> VmResult<()> {
        let idx = self.local_index(slot)?;
        let i = {
            let old = &self.stack[idx];
            if old.phase.is_frozen() {
                return self.guard_rebind(&old.clone(), slot);
            }
            match &old.kind {
                ValueKind::Int(i) => *i,
                _ => return Err(RuntimeError::type_err("operand must be an int")),
            }
        };
        self.stack[idx] = Value::int(i.wrapping_add(delta));
        Ok(())
    }

    /// Lecture par emplacement tagué (formes `*_var` et write-back phases).
    pub(crate) fn read_var(&self, loc: VarLoc, slot: u16, name: &str) -> VmResult<Value> {
        match loc {
            VarLoc::Local => self.local(slot).cloned(),
            VarLoc::Upvalue => {
                let cell = self.upvalue(slot)?;
                Ok(cell.get(&self.stack))
            }
            VarLoc::Global => self
                .env
                .get(name)
                .cloned()
                .ok_or_else(|| RuntimeError::name(format!("undefined variable '{name}'"))),
        }
    }

    /// Écriture par emplacement tagué.
    pub(crate) fn write_var(&mut self, loc: VarLoc, slot: u16, name: &str, v: Value) -> VmResult<()> {
        match loc {
            VarLoc::Local => self.set_local_value(slot, v),
            VarLoc::Upvalue => {
                let cell = self.upvalue(slot)?;
                cell.set(&mut self.stack, v);
                Ok(())
            }
            VarLoc::Global => {
                if !self.env.set(name, v) {
                    return Err(RuntimeError::name(format!("undefined variable '{name}'")));
                }
                Ok(())
            }
        }
    }

    // ---------- Constantes ----------

    pub(crate) fn const_at(&self, ix: ConstIx) -> VmResult<ConstValue> {
        let fr = self.frame()?;
        fr.chunk
            .const_at(ix)
            .cloned()
            .ok_or_else(|| RuntimeError::bounds(format!("constant index {ix} out of range")))
    }

    pub(crate) fn str_const(&self, ix: ConstIx) -> VmResult<String> {
        match self.const_at(ix)? {
            ConstValue::Str(s) => Ok(s),
            other => Err(RuntimeError::type_err(format!(
                "constant {ix} is not a string (got {other})"
            ))),
        }
    }

    /// Constante → valeur. Un proto `Func` devient une fermeture sans
    /// captures (les captures passent par l'opcode `Closure`).
    pub(crate) fn const_value(&mut self, ix: ConstIx) -> VmResult<Value> {
        Ok(match self.const_at(ix)? {
            ConstValue::Nil => Value::nil(),
            ConstValue::Bool(b) => Value::bool(b),
            ConstValue::I64(i) => Value::int(i),
            ConstValue::F64(x) => Value::float(x),
            ConstValue::Str(s) => Value::str(s),
            ConstValue::Func(chunk) => Value::closure(self.plain_closure(chunk)?),
        })
    }

    /// Instancie une fermeture sans captures depuis un proto.
    pub(crate) fn plain_closure(&self, chunk: Arc<Chunk>) -> VmResult<Closure> {
        let mut defaults = Vec::with_capacity(chunk.params.len());
        let mut param_phases = Vec::with_capacity(chunk.params.len());
        let mut params = Vec::with_capacity(chunk.params.len());
        for p in &chunk.params {
            params.push(p.name.clone());
            param_phases.push(p.phase);
            defaults.push(match p.default {
                Some(ix) => Some(resolve_default(&chunk, ix)?),
                None => None,
            });
        }
        Ok(Closure {
            name: chunk.name.clone(),
            params,
            defaults,
            param_phases,
            variadic: chunk.variadic,
            upvals: Vec::new(),
            kind: ClosureKind::Compiled(chunk),
        })
    }

    // ---------- Upvalues ----------

    /// Capture (ou réutilise) la cellule ouverte sur `slot`.
    fn capture_upvalue(&mut self, slot: usize) -> Upvalue {
        for uv in &self.open_upvals {
            if uv.open_slot() == Some(slot) {
                return uv.clone();
            }
        }
        let uv = Upvalue::open(slot);
        let pos = self
            .open_upvals
            .partition_point(|u| u.open_slot().unwrap_or(usize::MAX) <= slot);
        self.open_upvals.insert(pos, uv.clone());
        uv
    }

    /// Ferme tous les upvalues ouverts sur un slot >= `boundary`.
    pub(crate) fn close_upvalues(&mut self, boundary: usize) {
        let idx = self
            .open_upvals
            .partition_point(|u| u.open_slot().unwrap_or(usize::MAX) < boundary);
        for uv in self.open_upvals.split_off(idx) {
            if let Some(slot) = uv.open_slot() {
                let v = self.stack.get(slot).cloned().unwrap_or_else(Value::nil);
                uv.close(v);
            }
        }
    }

    // ---------- Appels ----------

    fn op_call(&mut self, argc: usize) -> VmResult<()> {
        let base = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::type_err("stack underflow on call"))?;
        let callee = self.stack[base].clone();
        self.call_at(callee, base, argc)
    }

    /// Appelle `callee` avec `base` comme slot 0 de la future frame
    /// (le callee lui-même pour un appel simple, le receveur pour une
    /// méthode). `argc` valeurs suivent `base` sur la pile.
    pub(crate) fn call_at(&mut self, callee: Value, base: usize, argc: usize) -> VmResult<()> {
        let c = match callee.as_closure() {
            Some(c) => Arc::clone(c),
            None => {
                return Err(RuntimeError::type_err(format!(
                    "value of type {} is not callable",
                    callee.type_name()
                )));
            }
        };
        match &c.kind {
            ClosureKind::VmNative(f) => {
                let args: Vec<Value> = self.stack.split_off(base + 1);
                self.stack.truncate(base);
                let ret = f(self, &args)?;
                self.push(ret)
            }
            ClosureKind::ExtNative(f) => {
                let args: Vec<Value> = self.stack.split_off(base + 1);
                self.stack.truncate(base);
                let ret = ext::call_through_adapter(*f, &args)?;
                self.push(ret)
            }
            ClosureKind::Compiled(chunk) => {
                let chunk = Arc::clone(chunk);
                self.bind_args(&c, base, argc)?;
                self.push_frame(c, chunk, base, FrameKind::Call)
            }
        }
    }

    /// Complète les arguments manquants (défauts), ramasse le reste
    /// (variadique), vérifie l'arité et les annotations de phase.
    fn bind_args(&mut self, c: &Closure, base: usize, argc: usize) -> VmResult<()> {
        let arity = c.params.len();
        if c.variadic && arity > 0 {
            let fixed = arity - 1;
            if argc >= fixed {
                let rest: Vec<Value> = self.stack.split_off(base + 1 + fixed);
                self.push(Value::array(rest))?;
            } else {
                for i in argc..fixed {
                    let d = c.defaults.get(i).cloned().flatten().ok_or_else(|| {
                        arity_error(c, argc)
                    })?;
                    self.push(d)?;
                }
                self.push(Value::array(Vec::new()))?;
            }
        } else {
            if argc > arity {
                return Err(arity_error(c, argc));
            }
            for i in argc..arity {
                let d = c.defaults.get(i).cloned().flatten().ok_or_else(|| arity_error(c, argc))?;
                self.push(d)?;
            }
        }
        for (i, ph) in c.param_phases.iter().enumerate() {
            if matches!(ph, Some(Phase::Crystal)) {
                let v = &self.stack[base + 1 + i];
                if v.phase != Phase::Crystal {
                    return Err(RuntimeError::phase(format!(
                        "parameter '{}' of {}() requires a crystal value",
                        c.params[i], c.name
                    )));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn push_frame(
        &mut self,
        closure: Arc<Closure>,
        chunk: Arc<Chunk>,
        base: usize,
        kind: FrameKind,
    ) -> VmResult<()> {
        if self.frames.len() >= self.limits.frames {
            return Err(RuntimeError::stack_overflow("recursion depth exceeded"));
        }
        self.frames.push(CallFrame { closure, chunk, ip: 0, base, kind, defer_hold: None });
        Ok(())
    }

    fn op_closure(&mut self, ix: ConstIx) -> VmResult<()> {
        let proto = match self.const_at(ix)? {
            ConstValue::Func(c) => c,
            other => {
                return Err(RuntimeError::type_err(format!(
                    "closure constant {ix} is not a function proto (got {other})"
                )));
            }
        };
        let mut closure = self.plain_closure(Arc::clone(&proto))?;
        let frame_base = self.frame()?.base;
        let parent_upvals: Vec<Upvalue> = self.frame()?.closure.upvals.clone();
        for desc in &proto.upvals {
            let cell = if desc.is_local {
                self.capture_upvalue(frame_base + desc.index as usize)
            } else {
                parent_upvals
                    .get(desc.index as usize)
                    .cloned()
                    .ok_or_else(|| {
                        RuntimeError::bounds(format!("upvalue index {} out of range", desc.index))
                    })?
            };
            closure.upvals.push(cell);
        }
        self.push(Value::closure(closure))
    }

    fn op_return(&mut self) -> VmResult<()> {
        let ret = self.pop()?;
        let fr = match self.frames.pop() {
            Some(fr) => fr,
            None => return Err(RuntimeError::type_err("return outside of a frame")),
        };
        self.close_upvalues(fr.base);
        self.stack.truncate(fr.base);
        let depth = self.frames.len();
        self.deferred.retain(|d| d.depth <= depth);
        match fr.kind {
            // La valeur d'un corps de defer est jetée ; le retour en cours
            // est déjà mis de côté dans la frame appelante.
            FrameKind::Defer => Ok(()),
            _ => self.push(ret),
        }
    }

    /// Appel synchrone réentrant : utilisé par les méthodes à fermeture,
    /// les réactions, les contrats de seed et les modules.
    pub(crate) fn call_value_sync(&mut self, callee: Value, args: Vec<Value>) -> VmResult<Value> {
        let argc = args.len();
        let base = self.stack.len();
        self.push(callee.clone())?;
        for a in args {
            self.push(a)?;
        }
        let depth = self.frames.len();
        self.call_at(callee, base, argc)?;
        if self.frames.len() > depth {
            self.run_until(depth)
        } else {
            self.pop()
        }
    }

    // ---------- Defer ----------

    fn op_defer_run(&mut self) -> VmResult<()> {
        let depth = self.frames.len();
        let next = self
            .deferred
            .iter()
            .rposition(|d| d.depth == depth);
        match next {
            Some(pos) => {
                let entry = self.deferred.remove(pos);
                // Mettre la valeur de retour de côté (une seule fois par
                // séquence), puis ré-exécuter DeferRun après le corps.
                if self.frame()?.defer_hold.is_none() {
                    let held = self.pop()?;
                    self.frame_mut()?.defer_hold = Some(held);
                }
                let redo_ip = self.frame()?.ip.saturating_sub(1);
                self.frame_mut()?.ip = redo_ip;
                let base = self.stack.len();
                self.push(entry.body.clone())?;
                let c = match entry.body.as_closure() {
                    Some(c) => Arc::clone(c),
                    None => return Err(RuntimeError::type_err("defer body must be a function")),
                };
                match &c.kind {
                    ClosureKind::Compiled(chunk) => {
                        let chunk = Arc::clone(chunk);
                        self.bind_args(&c, base, 0)?;
                        self.push_frame(c, chunk, base, FrameKind::Defer)
                    }
                    // Une native en defer s'exécute sur place.
                    _ => {
                        let body = self.pop()?;
                        let _ = self.call_value_sync(body, Vec::new())?;
                        Ok(())
                    }
                }
            }
            None => {
                if let Some(held) = self.frame_mut()?.defer_hold.take() {
                    self.push(held)?;
                }
                Ok(())
            }
        }
    }

    // ---------- Fautes ----------

    /// Route uniforme de toute faute runtime : vers le handler le plus
    /// proche s'il vit au-dessus de `min_depth`, sinon remontée à l'hôte.
    fn handle_fault(&mut self, err: RuntimeError, min_depth: usize) -> VmResult<()> {
        let mut err = err.with_line(self.current_line());
        let takeable = self
            .handlers
            .last()
            .map(|h| h.frame_depth > min_depth)
            .unwrap_or(false);
        if takeable {
            let Some(h) = self.handlers.pop() else {
                return Err(err);
            };
            while self.frames.len() > h.frame_depth {
                if let Some(fr) = self.frames.pop() {
                    self.close_upvalues(fr.base);
                }
            }
            let depth = self.frames.len();
            self.deferred.retain(|d| d.depth <= depth);
            self.stack.truncate(h.stack_top);
            self.push(err.into_catch_value())?;
            if let Some(fr) = self.frames.last_mut() {
                fr.ip = h.resume_ip;
            }
            return Ok(());
        }
        err.trace = self.stack_trace();
        Err(err)
    }

    /// Une entrée par frame active, de la plus profonde à la racine :
    /// `[line N] in f()` ou `in <script>`.
    pub fn stack_trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|fr| {
                let line = fr.chunk.line_at(fr.ip.saturating_sub(1) as u32);
                if fr.kind == FrameKind::Script {
                    "in <script>".to_string()
                } else {
                    match line {
                        Some(l) => format!("[line {l}] in {}()", fr.closure.name),
                        None => format!("in {}()", fr.closure.name),
                    }
                }
            })
            .collect()
    }

    // ---------- Arith ----------

    fn jump(&mut self, off: i32) -> VmResult<()> {
        let fr = self.frame_mut()?;
        let dest = fr.ip as i64 + i64::from(off);
        if dest < 0 || dest as usize > fr.chunk.ops.len() {
            return Err(RuntimeError::bounds(format!("jump out of code: {dest}")));
        }
        fr.ip = dest as usize;
        Ok(())
    }

    fn bin_arith(&mut self, sym: &'static str) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        let out = arith(&a, &b, sym)?;
        self.push(out)
    }

    fn bin_int(&mut self, sym: &'static str, f: fn(i64, i64) -> i64) -> VmResult<()> {
        let b = self.pop_int(sym)?;
        let a = self.pop_int(sym)?;
        self.push(Value::int(f(a, b)))
    }

    fn bin_bits(&mut self, sym: &'static str, f: fn(i64, i64) -> i64) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match (&a.kind, &b.kind) {
            (ValueKind::Int(x), ValueKind::Int(y)) => self.push(Value::int(f(*x, *y))),
            _ => Err(RuntimeError::type_err(format!("operands must be ints for '{sym}'"))),
        }
    }

    fn bin_cmp(&mut self, pred: fn(std::cmp::Ordering) -> bool) -> VmResult<()> {
        let b = self.pop()?;
        let a = self.pop()?;
        match a.compare(&b) {
            Some(o) => self.push(Value::bool(pred(o))),
            None => Err(RuntimeError::type_err(format!(
                "values of type {} and {} are not comparable",
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    // ---------- I/O ----------

    pub(crate) fn print_line(&mut self, s: &str) {
        if self.capture_stdout {
            self.stdout.push_str(s);
            self.stdout.push('\n');
        } else {
            println!("{s}");
        }
    }
}

// ---------- Helpers libres ----------

fn offset_ip(ip: usize, off: i32) -> VmResult<usize> {
    let dest = ip as i64 + i64::from(off);
    if dest < 0 {
        return Err(RuntimeError::bounds(format!("handler target out of code: {dest}")));
    }
    Ok(dest as usize)
}

fn arity_error(c: &Closure, argc: usize) -> RuntimeError {
    RuntimeError::arity(format!(
        "{}() expects {} argument(s), got {argc}",
        c.name,
        c.params.len()
    ))
}

fn resolve_default(chunk: &Chunk, ix: ConstIx) -> VmResult<Value> {
    Ok(match chunk.const_at(ix) {
        Some(ConstValue::Nil) | None => Value::nil(),
        Some(ConstValue::Bool(b)) => Value::bool(*b),
        Some(ConstValue::I64(i)) => Value::int(*i),
        Some(ConstValue::F64(x)) => Value::float(*x),
        Some(ConstValue::Str(s)) => Value::str(s.clone()),
        Some(ConstValue::Func(_)) => {
            return Err(RuntimeError::type_err("function proto cannot be a parameter default"));
        }
    })
}

/// Règles arithmétiques : int/int reste int ; int/float promeut float ;
/// `+` concatène les chaînes ; division/modulo entier par zéro échoue.
fn arith(a: &Value, b: &Value, sym: &'static str) -> VmResult<Value> {
    use ValueKind::*;
    match (&a.kind, &b.kind, sym) {
        (Int(x), Int(y), "+") => Ok(Value::int(x.wrapping_add(*y))),
        (Int(x), Int(y), "-") => Ok(Value::int(x.wrapping_sub(*y))),
        (Int(x), Int(y), "*") => Ok(Value::int(x.wrapping_mul(*y))),
        (Int(x), Int(y), "/") => {
            if *y == 0 {
                Err(RuntimeError::arith("division by zero"))
            } else {
                Ok(Value::int(x.wrapping_div(*y)))
            }
        }
        (Int(x), Int(y), "%") => {
            if *y == 0 {
                Err(RuntimeError::arith("division by zero"))
            } else {
                Ok(Value::int(x.wrapping_rem(*y)))
            }
        }
        (Str(x), Str(y), "+") => Ok(Value::str(format!("{x}{y}"))),
        _ => {
            let (x, y) = match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => (x, y),
                _ => {
                    let msg = if sym == "+" {
                        "operands must be numbers for '+'".to_string()
                    } else {
                        format!("operands must be numbers for '{sym}'")
                    };
                    return Err(RuntimeError::type_err(msg));
                }
            };
            Ok(Value::float(match sym {
                "+" => x + y,
                "-" => x - y,
                "*" => x * y,
                "/" => x / y,
                "%" => x % y,
                _ => return Err(RuntimeError::type_err(format!("unknown operator '{sym}'"))),
            }))
        }
    }
}

/// Indexation en lecture.
pub(crate) fn index_get(obj: &Value, idx: &Value) -> VmResult<Value> {
    use ValueKind::*;
    match (&obj.kind, &idx.kind) {
        (Array(items), Int(i)) => {
            let i = *i;
            if i < 0 || i as usize >= items.len() {
                return Err(RuntimeError::bounds(format!(
                    "array index {i} out of range (len {})",
                    items.len()
                )));
            }
            Ok(items[i as usize].clone())
        }
        (Array(items), Range { start, end }) => {
            let (s, e) = clamp_range(*start, *end, items.len())?;
            Ok(Value::array(items[s..e].to_vec()))
        }
        (Tuple(items), Int(i)) => {
            let i = *i;
            if i < 0 || i as usize >= items.len() {
                return Err(RuntimeError::bounds(format!(
                    "tuple index {i} out of range (len {})",
                    items.len()
                )));
            }
            Ok(items[i as usize].clone())
        }
        (Map(m), Str(k)) => Ok(m.get(k).cloned().unwrap_or_else(Value::nil)),
        (Str(s), Int(i)) => {
            let i = *i;
            let ch = if i >= 0 { s.chars().nth(i as usize) } else { None };
            match ch {
                Some(c) => Ok(Value::str(c.to_string())),
                None => Err(RuntimeError::bounds(format!(
                    "string index {i} out of range (len {})",
                    s.chars().count()
                ))),
            }
        }
        (Str(s), Range { start, end }) => {
            let chars: Vec<char> = s.chars().collect();
            let (a, b) = clamp_range(*start, *end, chars.len())?;
            Ok(Value::str(chars[a..b].iter().collect::<String>()))
        }
        (Buffer(buf), Int(i)) => {
            let i = *i;
            if i < 0 {
                return Err(RuntimeError::bounds(format!("buffer index {i} out of range")));
            }
            Ok(Value::int(i64::from(buf.read_u8(i as usize)?)))
        }
        (Enum(ev), Int(i)) => {
            let i = *i;
            ev.payload
                .get(i as usize)
                .cloned()
                .ok_or_else(|| RuntimeError::bounds(format!("enum payload index {i} out of range")))
        }
        (Ref(cell), _) => {
            let inner = cell.lock().clone();
            index_get(&inner, idx)
        }
        _ => Err(RuntimeError::type_err(format!(
            "cannot index {} with {}",
            obj.type_name(),
            idx.type_name()
        ))),
    }
}

/// Indexation en écriture (phase vérifiée sur le conteneur).
pub(crate) fn index_set(obj: &mut Value, idx: Value, val: Value) -> VmResult<()> {
    if obj.phase.is_frozen() {
        return Err(RuntimeError::phase(format!(
            "cannot mutate a {} {}",
            obj.phase,
            obj.type_name()
        )));
    }
    use ValueKind::*;
    match (&mut obj.kind, &idx.kind) {
        (Array(items), Int(i)) => {
            let i = *i;
            if i < 0 || i as usize >= items.len() {
                return Err(RuntimeError::bounds(format!(
                    "array index {i} out of range (len {})",
                    items.len()
                )));
            }
            items[i as usize] = val;
            Ok(())
        }
        (Map(m), Str(k)) => {
            m.insert(k.clone(), val);
            Ok(())
        }
        (Buffer(buf), Int(i)) => {
            let i = *i;
            let byte = val
                .as_int()
                .filter(|b| (0..=255).contains(b))
                .ok_or_else(|| RuntimeError::type_err("buffer write expects a byte (0..=255)"))?;
            if i < 0 {
                return Err(RuntimeError::bounds(format!("buffer index {i} out of range")));
            }
            buf.write_u8(i as usize, byte as u8)
        }
        (Ref(cell), _) => {
            let cell = std::sync::Arc::clone(cell);
            let mut inner = cell.lock();
            index_set(&mut inner, idx, val)
        }
        _ => Err(RuntimeError::type_err(format!(
            "cannot index-assign {} with {}",
            obj.type_name(),
            idx.type_name()
        ))),
    }
}

/// Lecture de champ (`obj.f`).
pub(crate) fn field_get(obj: &Value, name: &str) -> VmResult<Value> {
    match &obj.kind {
        ValueKind::Struct(sv) => sv.field(name).cloned().ok_or_else(|| {
            RuntimeError::field(format!("no field '{name}' on struct {}", sv.name))
        }),
        ValueKind::Map(m) => Ok(m.get(name).cloned().unwrap_or_else(Value::nil)),
        ValueKind::Ref(cell) => {
            let inner = cell.lock().clone();
            field_get(&inner, name)
        }
        _ => Err(RuntimeError::type_err(format!(
            "value of type {} has no fields",
            obj.type_name()
        ))),
    }
}

/// Écriture de champ (phases du conteneur + phase par champ vérifiées).
pub(crate) fn field_set(obj: &mut Value, name: &str, val: Value) -> VmResult<()> {
    if obj.phase.is_frozen() {
        return Err(RuntimeError::phase(format!(
            "cannot mutate a {} {}",
            obj.phase,
            obj.type_name()
        )));
    }
    match &mut obj.kind {
        ValueKind::Struct(sv) => {
            if let Some(ph) = sv.phase_of(name) {
                if ph.is_frozen() {
                    return Err(RuntimeError::field(format!(
                        "field '{name}' of struct {} is not assignable ({ph})",
                        sv.name
                    )));
                }
            }
            match sv.field_mut(name) {
                Some(slot) => {
                    *slot = val;
                    Ok(())
                }
                None => Err(RuntimeError::field(format!(
                    "no field '{name}' on struct {}",
                    sv.name
                ))),
            }
        }
        ValueKind::Map(m) => {
            m.insert(name.to_string(), val);
            Ok(())
        }
        ValueKind::Ref(cell) => {
            let cell = std::sync::Arc::clone(cell);
            let mut inner = cell.lock();
            field_set(&mut inner, name, val)
        }
        _ => Err(RuntimeError::type_err(format!(
            "value of type {} has no fields",
            obj.type_name()
        ))),
    }
}

/// Borne un intervalle demi-ouvert sur `len`.
fn clamp_range(start: i64, end: i64, len: usize) -> VmResult<(usize, usize)> {
    if start < 0 || end < start || end as usize > len {
        return Err(RuntimeError::bounds(format!("range {start}..{end} out of range (len {len})")));
    }
    Ok((start as usize, end as usize))
}
