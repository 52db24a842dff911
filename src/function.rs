use crate::error::{LispError, LispResult};
use crate::value::{FunctionId, PrimId, SymbolId, Value};

/// Argument count bounds. `max == None` means any number of extra
/// arguments (a `&rest` parameter).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Arity {
    pub min: usize,
    pub max: Option<usize>,
}

impl Arity {
    pub const fn exactly(n: usize) -> Self {
        Arity { min: n, max: Some(n) }
    }

    pub const fn at_least(n: usize) -> Self {
        Arity { min: n, max: None }
    }

    pub const fn range(min: usize, max: usize) -> Self {
        Arity { min, max: Some(max) }
    }

    pub fn accepts(&self, n: usize) -> bool {
        n >= self.min && self.max.map_or(true, |max| n <= max)
    }

    /// Check `n` against these bounds, naming `name` in the error.
    pub fn check(&self, name: &str, n: usize) -> LispResult<()> {
        if self.accepts(n) {
            Ok(())
        } else {
            Err(LispError::ArgCount {
                name: name.into(),
                min: self.min,
                max: self.max,
                actual: n,
            })
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionKind {
    Function,
    Macro,
}

/// A compiled function, macro, or closure template.
///
/// Created once when a `lambda`, `defun` or `defmacro` form is compiled;
/// the instruction list never changes afterward.
#[derive(Clone, Debug)]
pub struct Function {
    /// The defining symbol, None for anonymous lambdas.
    pub name: Option<SymbolId>,
    pub kind: FunctionKind,
    pub arity: Arity,
    /// The instruction stream, ending in RTN.
    pub code: Value,
    /// Defined by the prelude rather than by user code.
    pub builtin: bool,
    /// For macros: a plain function sharing `code`, used to run the
    /// expansion.
    pub expander: Option<FunctionId>,
}

impl Function {
    pub fn is_macro(&self) -> bool {
        self.kind == FunctionKind::Macro
    }
}

/// What a symbol's function cell holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FunctionCell {
    Unbound,
    /// Installed while a `defun`/`defmacro` body compiles so that the body
    /// can refer to its own name. Replaced before the definition finishes.
    Pending { arity: Arity, is_macro: bool },
    Function(FunctionId),
    Primitive(PrimId),
}

impl FunctionCell {
    pub fn is_bound(&self) -> bool {
        !matches!(self, FunctionCell::Unbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arity_bounds() {
        assert!(Arity::exactly(2).accepts(2));
        assert!(!Arity::exactly(2).accepts(3));
        assert!(Arity::at_least(1).accepts(10));
        assert!(!Arity::at_least(1).accepts(0));
        assert!(Arity::range(1, 2).accepts(1));
        assert!(matches!(
            Arity::range(1, 2).check("f", 3),
            Err(LispError::ArgCount { min: 1, max: Some(2), actual: 3, .. })
        ));
    }
}
