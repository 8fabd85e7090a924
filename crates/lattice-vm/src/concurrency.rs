//! concurrency.rs — `scope` (workers parallèles) et `select` multi-canaux.
//!
//! Modèle : threads OS, pas de boucle d'événements. La VM n'est pas
//! réentrante entre threads : chaque worker reçoit sa **VM enfant**
//! (liaisons clonées en profondeur, registre de structs partagé en
//! lecture seule, caches/handlers/tables de phases vierges). Avant le
//! lancement, les locals vivants de la frame parente sont exportés comme
//! globales enfant, pour que les chunks spawn résolvent leurs noms.
//!
//! Le `select` mélange ses bras (Fisher-Yates) à chaque itération pour
//! l'équité, s'enregistre comme waiter sur chaque canal avant de dormir,
//! et honore un bras `default` (jamais bloquant) ou `timeout`.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;

use lattice_core::bytecode::{ConstIx, SelectArm};
use lattice_core::ConstValue;

use crate::chan::{Channel, SelectSignal, TryRecv};
use crate::closure::Closure;
use crate::error::{RuntimeError, VmResult};
use crate::upvalue::Upvalue;
use crate::value::{EnumVal, StructVal, Value, ValueKind};
use crate::vm::{Vm, VmOptions};

/// Rend une valeur transférable vers un autre thread : les fermetures
/// voient leurs upvalues encore ouverts remplacés par des cellules
/// fermées sur un snapshot de la pile parente. `Ref` et `Channel`
/// restent partagés (ce sont les seuls types pensés pour).
pub(crate) fn export_value(v: &Value, stack: &[Value]) -> Value {
    let kind = match &v.kind {
        ValueKind::Closure(c) => {
            let upvals: Vec<Upvalue> = c.upvals.iter().map(|u| u.snapshot(stack)).collect();
            ValueKind::Closure(Arc::new(Closure { upvals, ..(**c).clone() }))
        }
        ValueKind::Array(items) => {
            ValueKind::Array(items.iter().map(|x| export_value(x, stack)).collect())
        }
        ValueKind::Map(m) => {
            ValueKind::Map(m.iter().map(|(k, x)| (k.clone(), export_value(x, stack))).collect())
        }
        ValueKind::Set(s) => {
            ValueKind::Set(s.iter().map(|(k, x)| (k.clone(), export_value(x, stack))).collect())
        }
        ValueKind::Tuple(items) => {
            ValueKind::Tuple(items.iter().map(|x| export_value(x, stack)).collect())
        }
        ValueKind::Struct(sv) => ValueKind::Struct(StructVal {
            name: sv.name.clone(),
            fields: sv
                .fields
                .iter()
                .map(|(n, x)| (n.clone(), export_value(x, stack)))
                .collect(),
            field_phases: sv.field_phases.clone(),
        }),
        ValueKind::Enum(ev) => ValueKind::Enum(EnumVal {
            enum_name: ev.enum_name.clone(),
            variant: ev.variant.clone(),
            payload: ev.payload.iter().map(|x| export_value(x, stack)).collect(),
        }),
        other => other.clone(),
    };
    Value { phase: v.phase, kind }
}

impl Vm {
    /// Construit la VM d'un worker : liaisons exportées, registre de
    /// structs partagé, caches/tables de phases/handlers vierges.
    pub(crate) fn child_vm(&self) -> Vm {
        let mut child = Vm::with_options(VmOptions {
            stack_limit: self.limits.stack,
            call_depth_limit: self.limits.frames,
            trace: self.trace,
            stdlib: false,
            capture_stdout: self.capture_stdout,
        });
        child.env = self.env.cloned_with(|v| export_value(v, &self.stack));
        child.struct_registry = Arc::clone(&self.struct_registry);
        child.compiler = self.compiler.clone();
        child.ext = self.ext.fresh_from();
        child
    }

    /// Exporte les locals nommés de la frame courante comme globales de
    /// `child` (les chunks spawn résolvent leurs captures par nom).
    fn export_frame_locals_into(&self, child: &mut Vm) {
        let Ok(fr) = self.frame() else { return };
        for (slot, name) in &fr.chunk.local_names {
            let idx = fr.base + *slot as usize;
            if let Some(v) = self.stack.get(idx) {
                child.define_global(name.clone(), export_value(v, &self.stack));
            }
        }
    }

    fn func_const(&self, ix: ConstIx) -> VmResult<Arc<lattice_core::Chunk>> {
        match self.const_at(ix)? {
            ConstValue::Func(c) => Ok(c),
            other => Err(RuntimeError::concurrency(format!(
                "constant {ix} is not a function proto (got {other})"
            ))),
        }
    }

    /// `scope` : lance les workers, exécute le corps sync, joint tout.
    /// La première faute d'un worker devient l'erreur du scope, une fois
    /// tous les workers joints.
    pub(crate) fn op_scope(&mut self, spawns: &[ConstIx], sync: Option<ConstIx>) -> VmResult<()> {
        let mut handles = Vec::with_capacity(spawns.len());
        for ix in spawns {
            let chunk = self.func_const(*ix)?;
            let mut child = self.child_vm();
            self.export_frame_locals_into(&mut child);
            handles.push(thread::spawn(move || child.run_arc(chunk)));
        }

        // Corps sync sur le thread parent, pendant que les workers tournent.
        let sync_res: VmResult<()> = match sync {
            Some(ix) => {
                let chunk = self.func_const(ix)?;
                let clo = self.plain_closure(chunk)?;
                self.call_value_sync(Value::closure(clo), Vec::new()).map(|_| ())
            }
            None => Ok(()),
        };

        // Join d'abord ; les fautes ne remontent qu'après.
        let mut worker_err: Option<RuntimeError> = None;
        for h in handles {
            match h.join() {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    worker_err.get_or_insert(e);
                }
                Err(_) => {
                    worker_err.get_or_insert(RuntimeError::concurrency("worker thread panicked"));
                }
            }
        }
        sync_res?;
        if let Some(e) = worker_err {
            return Err(e);
        }
        self.push(Value::unit())
    }

    /// `select` : convention de pile — opérandes des bras (canal ou
    /// millisecondes) poussés dans l'ordre des bras, puis les fermetures
    /// corps dans le même ordre.
    pub(crate) fn op_select(&mut self, arms: &[SelectArm]) -> VmResult<()> {
        if arms.is_empty() {
            return Err(RuntimeError::concurrency("malformed select: no arms"));
        }
        let bodies = self.pop_n(arms.len())?;
        let n_operands = arms.iter().filter(|a| !matches!(a, SelectArm::Default)).count();
        let operands = self.pop_n(n_operands)?;

        let mut chan_arms: Vec<(usize, Channel, bool)> = Vec::new();
        let mut default_arm: Option<usize> = None;
        let mut timeout: Option<(usize, Duration)> = None;
        let mut oi = 0usize;
        for (i, arm) in arms.iter().enumerate() {
            match arm {
                SelectArm::Chan { binds } => {
                    let ch = operands[oi]
                        .as_channel()
                        .cloned()
                        .ok_or_else(|| {
                            RuntimeError::concurrency(format!(
                                "select arm expects a channel, got {}",
                                operands[oi].type_name()
                            ))
                        })?;
                    oi += 1;
                    chan_arms.push((i, ch, *binds));
                }
                SelectArm::Timeout => {
                    let ms = operands[oi].as_int().ok_or_else(|| {
                        RuntimeError::concurrency("select timeout expects milliseconds (int)")
                    })?;
                    oi += 1;
                    timeout = Some((i, Duration::from_millis(ms.max(0) as u64)));
                }
                SelectArm::Default => default_arm = Some(i),
            }
        }

        if chan_arms.is_empty() && default_arm.is_none() && timeout.is_none() {
            return Err(RuntimeError::concurrency("malformed select: nothing to wait on"));
        }

        let deadline = timeout.map(|(_, d)| Instant::now() + d);
        let signal = SelectSignal::new();
        let mut order: Vec<usize> = (0..chan_arms.len()).collect();

        loop {
            // Enregistré *avant* le poll et gardé pendant le sommeil :
            // aucun send ne peut se perdre entre l'essai et l'attente.
            for (_, ch, _) in &chan_arms {
                ch.register_waiter(&signal);
            }

            order.shuffle(&mut rand::thread_rng());
            let mut ready: Option<(usize, Value, bool)> = None;
            let mut all_closed = !chan_arms.is_empty();
            for &k in &order {
                let (i, ch, binds) = &chan_arms[k];
                match ch.try_recv() {
                    TryRecv::Ready(v) => {
                        ready = Some((*i, v, *binds));
                        all_closed = false;
                        break;
                    }
                    TryRecv::Empty => all_closed = false,
                    TryRecv::Closed => {}
                }
            }

            // Issue immédiate : bras prêt, tout fermé, ou default.
            if let Some((i, v, binds)) = ready {
                self.unregister_all(&chan_arms, &signal);
                let args = if binds { vec![v] } else { Vec::new() };
                let out = self.call_value_sync(bodies[i].clone(), args)?;
                return self.push(out);
            }
            if all_closed {
                self.unregister_all(&chan_arms, &signal);
                if let Some(i) = default_arm {
                    let out = self.call_value_sync(bodies[i].clone(), Vec::new())?;
                    return self.push(out);
                }
                return self.push(Value::nil());
            }
            if let Some(i) = default_arm {
                self.unregister_all(&chan_arms, &signal);
                let out = self.call_value_sync(bodies[i].clone(), Vec::new())?;
                return self.push(out);
            }

            // Sommeil borné par l'échéance du bras timeout.
            let wait_for = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        self.unregister_all(&chan_arms, &signal);
                        if let Some((i, _)) = timeout {
                            let out = self.call_value_sync(bodies[i].clone(), Vec::new())?;
                            return self.push(out);
                        }
                        return self.push(Value::nil());
                    }
                    Some(d - now)
                }
                None => None,
            };
            let woke = signal.wait(wait_for);
            self.unregister_all(&chan_arms, &signal);
            if !woke {
                if let Some(d) = deadline {
                    if Instant::now() >= d {
                        if let Some((i, _)) = timeout {
                            let out = self.call_value_sync(bodies[i].clone(), Vec::new())?;
                            return self.push(out);
                        }
                        return self.push(Value::nil());
                    }
                }
            }
        }
    }

    fn unregister_all(&self, chan_arms: &[(usize, Channel, bool)], signal: &Arc<SelectSignal>) {
        for (_, ch, _) in chan_arms {
            ch.unregister_waiter(signal);
        }
    }
}
