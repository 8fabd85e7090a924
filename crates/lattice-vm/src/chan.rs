//! chan.rs — Canaux MPMC de la VM Lattice.
//!
//! File FIFO non bornée + drapeau *closed*, partagée par compteur de
//! références. Synchronisation : mutex + condvar (`parking_lot`).
//!
//! Sémantique :
//! - `send` sur canal fermé : erreur runtime.
//! - `recv` sur canal fermé et vide : `(nil, false)` sans bloquer.
//! - Les envois sont FIFO ; les réceptions sont servies FIFO.
//! - Un `select` en attente s'enregistre comme *waiter* sur chacun de ses
//!   canaux ; tout send/close le réveille par signal de condition.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{RuntimeError, VmResult};
use crate::value::Value;

/// Résultat d'une tentative de réception non bloquante.
#[derive(Debug)]
pub enum TryRecv {
    /// Une valeur était prête.
    Ready(Value),
    /// File vide, canal encore ouvert.
    Empty,
    /// Canal fermé et vide.
    Closed,
}

/// Signal partagé entre un `select` endormi et les canaux qu'il surveille.
#[derive(Debug, Default)]
pub struct SelectSignal {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl SelectSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Réveille le select (appelé par send/close).
    pub fn fire(&self) {
        *self.fired.lock() = true;
        self.cond.notify_all();
    }

    /// Attend un réveil, borné par `timeout`. Renvoie `false` si le délai
    /// est tombé sans signal.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut fired = self.fired.lock();
        if *fired {
            *fired = false;
            return true;
        }
        match timeout {
            Some(d) => {
                let res = self.cond.wait_for(&mut fired, d);
                let got = *fired;
                *fired = false;
                got || !res.timed_out()
            }
            None => {
                self.cond.wait(&mut fired);
                *fired = false;
                true
            }
        }
    }
}

#[derive(Debug, Default)]
struct ChanState {
    queue: VecDeque<Value>,
    closed: bool,
    waiters: Vec<Arc<SelectSignal>>,
}

#[derive(Debug, Default)]
struct ChanInner {
    state: Mutex<ChanState>,
    cond: Condvar,
}

/// Poignée de canal, clonable (compteur de références partagé).
///
/// Le canal meurt quand la dernière poignée tombe.
#[derive(Debug, Clone, Default)]
pub struct Channel {
    inner: Arc<ChanInner>,
}

impl Channel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Même canal sous deux poignées ?
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Nombre de valeurs en attente (diagnostic).
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().queue.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    /// Envoie `v`. Erreur si le canal est fermé.
    pub fn send(&self, v: Value) -> VmResult<()> {
        let mut st = self.inner.state.lock();
        if st.closed {
            return Err(RuntimeError::concurrency("send on closed channel"));
        }
        st.queue.push_back(v);
        self.inner.cond.notify_one();
        for w in &st.waiters {
            w.fire();
        }
        Ok(())
    }

    /// Réception bloquante. `(valeur, true)` ou `(nil, false)` si le canal
    /// est fermé et vide.
    pub fn recv(&self) -> (Value, bool) {
        let mut st = self.inner.state.lock();
        loop {
            if let Some(v) = st.queue.pop_front() {
                return (v, true);
            }
            if st.closed {
                return (Value::nil(), false);
            }
            self.inner.cond.wait(&mut st);
        }
    }

    /// Réception non bloquante.
    pub fn try_recv(&self) -> TryRecv {
        let mut st = self.inner.state.lock();
        if let Some(v) = st.queue.pop_front() {
            TryRecv::Ready(v)
        } else if st.closed {
            TryRecv::Closed
        } else {
            TryRecv::Empty
        }
    }

    /// Ferme le canal ; les valeurs déjà en file restent recevables.
    pub fn close(&self) {
        let mut st = self.inner.state.lock();
        st.closed = true;
        self.inner.cond.notify_all();
        for w in &st.waiters {
            w.fire();
        }
    }

    /// Enregistre un waiter de select.
    pub fn register_waiter(&self, signal: &Arc<SelectSignal>) {
        self.inner.state.lock().waiters.push(Arc::clone(signal));
    }

    /// Désenregistre un waiter de select.
    pub fn unregister_waiter(&self, signal: &Arc<SelectSignal>) {
        self.inner.state.lock().waiters.retain(|w| !Arc::ptr_eq(w, signal));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_order() {
        let ch = Channel::new();
        ch.send(Value::int(1)).unwrap();
        ch.send(Value::int(2)).unwrap();
        ch.send(Value::int(3)).unwrap();
        for want in 1..=3 {
            let (v, ok) = ch.recv();
            assert!(ok);
            assert_eq!(format!("{v}"), want.to_string());
        }
    }

    #[test]
    fn closed_semantics() {
        let ch = Channel::new();
        ch.send(Value::int(9)).unwrap();
        ch.close();
        // Les valeurs en file restent recevables après close.
        let (v, ok) = ch.recv();
        assert!(ok);
        assert_eq!(format!("{v}"), "9");
        let (_, ok) = ch.recv();
        assert!(!ok);
        assert!(ch.send(Value::int(1)).is_err());
    }

    #[test]
    fn recv_blocks_until_send() {
        let ch = Channel::new();
        let tx = ch.clone();
        let t = thread::spawn(move || {
            thread::sleep(std::time::Duration::from_millis(20));
            tx.send(Value::int(5)).unwrap();
        });
        let (v, ok) = ch.recv();
        assert!(ok);
        assert_eq!(format!("{v}"), "5");
        t.join().unwrap();
    }

    #[test]
    fn waiter_is_fired_on_send() {
        let ch = Channel::new();
        let sig = SelectSignal::new();
        ch.register_waiter(&sig);
        ch.send(Value::int(1)).unwrap();
        assert!(sig.wait(Some(std::time::Duration::from_millis(100))));
        ch.unregister_waiter(&sig);
    }
}
