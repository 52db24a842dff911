use thiserror::Error;

/// Errors raised while reading, compiling or running Lisp code.
///
/// Compile-time errors abort the current top-level form only; everything
/// compiled before it stays defined. Run-time errors propagate out of
/// `Machine::execute`. `Fatal` means a machine invariant was broken.
#[derive(Debug, Clone, Error)]
pub enum LispError {
    /// Call to a name with no function, macro or primitive attached.
    #[error("undefined function: {0}")]
    UndefinedFunction(String),

    /// Wrong number of arguments, found at compile time or at apply time.
    #[error("wrong number of arguments to {name}: expected {}, got {actual}", arity_range(.min, .max))]
    ArgCount {
        name: String,
        min: usize,
        max: Option<usize>,
        actual: usize,
    },

    /// A special form or control operator with the wrong shape.
    #[error("invalid {form} form: {reason}")]
    InvalidForm { form: String, reason: String },

    /// `return-from` or `go` with no lexically enclosing target.
    #[error("no enclosing {kind} named {name}")]
    UnmatchedTarget { kind: &'static str, name: String },

    /// Attempt to rebind, assign or redefine a constant symbol.
    #[error("cannot redefine constant {0}")]
    ConstantRedefinition(String),

    /// An operand had the wrong type.
    #[error("type error: {0}")]
    TypeError(String),

    /// Fixnum overflow or division by zero.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("unbound variable: {0}")]
    UnboundVariable(String),

    #[error("unbound function: {0}")]
    UnboundFunction(String),

    /// Signalled by the `error` primitive.
    #[error("{0}")]
    User(String),

    #[error("read error: {0}")]
    ReadError(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// Step counter exhausted, likely an infinite loop.
    #[error("step limit exceeded (possible infinite loop)")]
    FuelExhausted,

    /// Heap capacity exceeded.
    #[error("heap capacity exceeded")]
    HeapOverflow,

    /// A machine invariant was violated. Not recoverable.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl LispError {
    pub fn invalid_form(form: &str, reason: impl Into<String>) -> Self {
        LispError::InvalidForm {
            form: form.into(),
            reason: reason.into(),
        }
    }

    pub fn type_error(msg: impl Into<String>) -> Self {
        LispError::TypeError(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        LispError::Fatal(msg.into())
    }

    /// Errors that can only arise while compiling a form. `ArgCount` and
    /// `ConstantRedefinition` are left out: calls through `funcall`,
    /// `apply` and `set` raise them at run time too.
    pub fn is_compile_error(&self) -> bool {
        matches!(
            self,
            LispError::UndefinedFunction(_)
                | LispError::InvalidForm { .. }
                | LispError::UnmatchedTarget { .. }
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LispError::Fatal(_))
    }
}

impl From<std::io::Error> for LispError {
    fn from(e: std::io::Error) -> Self {
        LispError::Io(e.to_string())
    }
}

fn arity_range(min: &usize, max: &Option<usize>) -> String {
    match max {
        Some(max) if max == min => format!("{}", min),
        Some(max) => format!("{}..{}", min, max),
        None => format!("at least {}", min),
    }
}

pub type LispResult<T> = Result<T, LispError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_count_message_reports_bounds() {
        let err = LispError::ArgCount {
            name: "car".into(),
            min: 1,
            max: Some(1),
            actual: 2,
        };
        assert_eq!(err.to_string(), "wrong number of arguments to car: expected 1, got 2");

        let err = LispError::ArgCount {
            name: "list*".into(),
            min: 1,
            max: None,
            actual: 0,
        };
        assert_eq!(
            err.to_string(),
            "wrong number of arguments to list*: expected at least 1, got 0"
        );
    }

    #[test]
    fn classification() {
        assert!(LispError::UndefinedFunction("f".into()).is_compile_error());
        assert!(!LispError::UnboundVariable("x".into()).is_compile_error());
        let arg_count = LispError::ArgCount {
            name: "f".into(),
            min: 1,
            max: Some(1),
            actual: 0,
        };
        assert!(!arg_count.is_compile_error());
        assert!(!LispError::ConstantRedefinition("t".into()).is_compile_error());
        assert!(LispError::fatal("boom").is_fatal());
    }
}
