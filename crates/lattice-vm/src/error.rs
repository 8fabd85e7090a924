//! error.rs — Taxonomie d'erreurs runtime de la VM Lattice.
//!
//! Toutes les fautes passent par le même chemin : construction d'un
//! [`RuntimeError`], puis livraison par le mécanisme d'unwinding (`vm.rs`).
//! Si un handler est enregistré, l'erreur refait surface comme *valeur*
//! (la valeur lancée pour `UserThrown`, sinon le message en chaîne) ;
//! sinon `run()` la renvoie à l'hôte, trace comprise.

use thiserror::Error;

use crate::value::Value;

/// Résultat standard de la VM.
pub type VmResult<T> = Result<T, RuntimeError>;

/// Nature d'une faute runtime.
#[derive(Debug, Clone)]
pub enum ErrorKind {
    /// Opérande du mauvais type pour un opcode.
    Type,
    /// Division / modulo par zéro.
    Arithmetic,
    /// Index hors bornes (tableau, chaîne, buffer, tuple).
    Bounds,
    /// Variable / globale non définie.
    Name,
    /// Mauvais nombre d'arguments.
    Arity,
    /// Champ de struct absent ou non assignable.
    Field,
    /// Mutation d'une valeur crystal, bond `gate` violé, contrat de seed échoué.
    Phase,
    /// Mutation refusée sur un conteneur sous pression.
    Pressure,
    /// Fichier introuvable ou échec lex/parse/compile d'une unité importée.
    Import,
    /// Profondeur de récursion ou capacité de pile dépassée.
    StackOverflow,
    /// Send sur canal fermé, select malformé.
    Concurrency,
    /// Valeur lancée par `throw` / `error()`.
    UserThrown(Value),
}

impl ErrorKind {
    /// Étiquette courte (logs, traces).
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::Bounds => "BoundsError",
            ErrorKind::Name => "NameError",
            ErrorKind::Arity => "ArityError",
            ErrorKind::Field => "FieldError",
            ErrorKind::Phase => "PhaseError",
            ErrorKind::Pressure => "PressureError",
            ErrorKind::Import => "ImportError",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::Concurrency => "ConcurrencyError",
            ErrorKind::UserThrown(_) => "UserThrown",
        }
    }
}

/// Erreur runtime : nature + message + ligne source éventuelle + trace.
#[derive(Debug, Clone, Error)]
#[error("{}", line_prefixed(.line, .message))]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Ligne source de la faute, si la table de lignes la connaît.
    pub line: Option<u32>,
    /// Une entrée par frame active, remplie à la remontée top-level :
    /// `[line N] in f()` ou `in <script>`.
    pub trace: Vec<String>,
}

/// `[line N] message` quand la ligne est connue.
fn line_prefixed(line: &Option<u32>, message: &str) -> String {
    match line {
        Some(l) => format!("[line {l}] {message}"),
        None => message.to_string(),
    }
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), line: None, trace: Vec::new() }
    }

    pub fn with_line(mut self, line: Option<u32>) -> Self {
        if self.line.is_none() {
            self.line = line;
        }
        self
    }

    // Constructeurs courts, un par nature.
    pub fn type_err(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Type, msg) }
    pub fn arith(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Arithmetic, msg) }
    pub fn bounds(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Bounds, msg) }
    pub fn name(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Name, msg) }
    pub fn arity(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Arity, msg) }
    pub fn field(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Field, msg) }
    pub fn phase(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Phase, msg) }
    pub fn pressure(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Pressure, msg) }
    pub fn import(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Import, msg) }
    pub fn stack_overflow(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::StackOverflow, msg)
    }
    pub fn concurrency(msg: impl Into<String>) -> Self { Self::new(ErrorKind::Concurrency, msg) }

    /// Valeur lancée par le code utilisateur.
    pub fn thrown(v: Value) -> Self {
        let message = format!("{v}");
        Self { kind: ErrorKind::UserThrown(v), message, line: None, trace: Vec::new() }
    }

    /// La valeur qui refait surface dans un bras `catch`.
    ///
    /// `throw x` rattrape `x` lui-même ; une faute VM rattrape son message,
    /// préfixé `[line N]` quand la ligne est connue.
    pub fn into_catch_value(self) -> Value {
        match self.kind {
            ErrorKind::UserThrown(v) => v,
            _ => match self.line {
                Some(l) => Value::str(format!("[line {l}] {}", self.message)),
                None => Value::str(self.message),
            },
        }
    }

    /// Rendu complet : message + trace (une ligne par frame).
    pub fn render_trace(&self) -> String {
        let mut out = String::new();
        match self.line {
            Some(l) => out.push_str(&format!("[line {l}] {}: {}", self.kind.label(), self.message)),
            None => out.push_str(&format!("{}: {}", self.kind.label(), self.message)),
        }
        for frame in &self.trace {
            out.push('\n');
            out.push_str(frame);
        }
        out
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catch_value_of_fault_is_message_string() {
        let e = RuntimeError::arith("division by zero").with_line(Some(3));
        let v = e.into_catch_value();
        assert_eq!(format!("{v}"), "[line 3] division by zero");
    }

    #[test]
    fn catch_value_of_throw_is_the_value() {
        let e = RuntimeError::thrown(Value::int(42));
        assert_eq!(format!("{}", e.into_catch_value()), "42");
    }

    #[test]
    fn labels() {
        assert_eq!(RuntimeError::phase("x").kind.label(), "PhaseError");
        assert_eq!(RuntimeError::pressure("x").kind.label(), "PressureError");
    }
}
