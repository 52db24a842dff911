use std::fmt;

use crate::opcode::Opcode;
use crate::symbol::sym;

/// Unique identifier for an interned (or gensym'd) symbol.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SymbolId(pub u32);

/// Index into the cons-cell heap.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairId(pub u32);

/// Index into the environment frame arena.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub u32);

/// Index into the world's table of compiled functions and macros.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub u32);

/// Index into the primitive registry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrimId(pub u32);

/// The fundamental Lisp value. Copy semantics: pairs, frames and function
/// bodies live in arenas owned by the `World`, a `Value` is only a handle.
///
/// `Nil` is both the empty list and false, and also counts as a symbol.
/// `True` is the distinguished self-evaluating symbol `t`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    Nil,
    True,
    Int(i64),
    Symbol(SymbolId),
    Pair(PairId),
    /// A compiled global function or macro object.
    Function(FunctionId),
    /// A closure: a pair of (function template . captured environment).
    Closure(PairId),
    Primitive(PrimId),
    /// An environment frame. Only ever found inside the E register and in
    /// captured environments.
    Frame(FrameId),
    /// An instruction atom inside a compiled instruction stream.
    Op(Opcode),
}

impl Value {
    pub fn is_nil(self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Generalised boolean: everything except nil is true.
    pub fn is_true(self) -> bool {
        !self.is_nil()
    }

    pub fn is_pair(self) -> bool {
        matches!(self, Value::Pair(_))
    }

    /// nil and t are symbols too.
    pub fn is_symbol(self) -> bool {
        matches!(self, Value::Nil | Value::True | Value::Symbol(_))
    }

    /// The empty list or a pair.
    pub fn is_list(self) -> bool {
        matches!(self, Value::Nil | Value::Pair(_))
    }

    pub fn is_int(self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// Returns true if this value is an atom (not a pair).
    pub fn is_atom(self) -> bool {
        !self.is_pair()
    }

    /// Something `funcall` can invoke. Macros are not callable.
    pub fn is_callable(self) -> bool {
        matches!(self, Value::Function(_) | Value::Closure(_) | Value::Primitive(_))
    }

    pub fn as_pair(self) -> Option<PairId> {
        match self {
            Value::Pair(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_int(self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(n),
            _ => None,
        }
    }

    /// The symbol id behind a symbol-like value, mapping `nil` and `t` to
    /// their pre-interned ids.
    pub fn as_symbol(self) -> Option<SymbolId> {
        match self {
            Value::Nil => Some(sym::NIL),
            Value::True => Some(sym::T),
            Value::Symbol(id) => Some(id),
            _ => None,
        }
    }

    pub fn as_op(self) -> Option<Opcode> {
        match self {
            Value::Op(op) => Some(op),
            _ => None,
        }
    }

    /// Inverse of `as_symbol`: the canonical value for a symbol id.
    pub fn from_symbol(id: SymbolId) -> Value {
        if id == sym::NIL {
            Value::Nil
        } else if id == sym::T {
            Value::True
        } else {
            Value::Symbol(id)
        }
    }

    pub fn from_bool(b: bool) -> Value {
        if b {
            Value::True
        } else {
            Value::Nil
        }
    }

    /// Identity comparison: the same pair, the same symbol, the same fixnum.
    pub fn eq(self, other: Value) -> bool {
        self == other
    }

    /// Short type name for error messages.
    pub fn type_name(self) -> &'static str {
        match self {
            Value::Nil => "null",
            Value::True => "symbol",
            Value::Int(_) => "integer",
            Value::Symbol(_) => "symbol",
            Value::Pair(_) => "cons",
            Value::Function(_) => "function",
            Value::Closure(_) => "function",
            Value::Primitive(_) => "primitive",
            Value::Frame(_) => "frame",
            Value::Op(_) => "opcode",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "Nil"),
            Value::True => write!(f, "True"),
            Value::Int(n) => write!(f, "Int({})", n),
            Value::Symbol(id) => write!(f, "Sym({})", id.0),
            Value::Pair(id) => write!(f, "Pair({})", id.0),
            Value::Function(id) => write!(f, "Function({})", id.0),
            Value::Closure(id) => write!(f, "Closure({})", id.0),
            Value::Primitive(id) => write!(f, "Primitive({})", id.0),
            Value::Frame(id) => write!(f, "Frame({})", id.0),
            Value::Op(op) => write!(f, "Op({})", op.mnemonic()),
        }
    }
}

impl fmt::Debug for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SymbolId({})", self.0)
    }
}

impl fmt::Debug for PairId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairId({})", self.0)
    }
}

impl fmt::Debug for FrameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameId({})", self.0)
    }
}

impl fmt::Debug for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionId({})", self.0)
    }
}

impl fmt::Debug for PrimId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrimId({})", self.0)
    }
}
