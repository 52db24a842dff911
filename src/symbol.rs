use std::collections::HashMap;

use crate::error::{LispError, LispResult};
use crate::function::FunctionCell;
use crate::value::{SymbolId, Value};

/// A symbol and its binding cells.
#[derive(Clone, Debug)]
pub struct Symbol {
    pub name: String,
    /// Global (or current dynamic) value.
    pub value: Option<Value>,
    pub function: FunctionCell,
    /// Proclaimed special: every binding of it is dynamic.
    pub special: bool,
    /// How many dynamic bindings of this symbol are currently active.
    pub special_depth: i32,
    /// nil, t and keywords: never rebound, never given a function.
    pub constant: bool,
    /// False for gensyms, which are not reachable by name.
    pub interned: bool,
}

impl Symbol {
    fn new(name: &str, interned: bool) -> Self {
        Symbol {
            name: name.to_string(),
            value: None,
            function: FunctionCell::Unbound,
            special: false,
            special_depth: 0,
            constant: false,
            interned,
        }
    }
}

/// Interned symbol table. Each unique symbol name maps to a unique SymbolId.
pub struct SymbolTable {
    name_to_id: HashMap<String, SymbolId>,
    symbols: Vec<Symbol>,
    gensym_counter: u32,
}

/// Well-known symbol IDs, pre-interned at startup.
/// These must match the order of interning in SymbolTable::new().
pub mod sym {
    use crate::value::SymbolId;

    pub const NIL: SymbolId = SymbolId(0);
    pub const T: SymbolId = SymbolId(1);
    pub const QUOTE: SymbolId = SymbolId(2);
    pub const FUNCTION: SymbolId = SymbolId(3);
    pub const LAMBDA: SymbolId = SymbolId(4);
    pub const DEFUN: SymbolId = SymbolId(5);
    pub const DEFMACRO: SymbolId = SymbolId(6);
    pub const LET: SymbolId = SymbolId(7);
    pub const LET_STAR: SymbolId = SymbolId(8);
    pub const LETREC: SymbolId = SymbolId(9);
    pub const IF: SymbolId = SymbolId(10);
    pub const AND: SymbolId = SymbolId(11);
    pub const OR: SymbolId = SymbolId(12);
    pub const PROGN: SymbolId = SymbolId(13);
    pub const SETQ: SymbolId = SymbolId(14);
    pub const AMP_REST: SymbolId = SymbolId(15);
    pub const AMP_BODY: SymbolId = SymbolId(16);
    pub const BLOCK: SymbolId = SymbolId(17);
    pub const LIST: SymbolId = SymbolId(18);
    pub const APPEND: SymbolId = SymbolId(19);
    pub const CONS: SymbolId = SymbolId(20);
    pub const BOUNDP: SymbolId = SymbolId(21);
}

/// The fixed special-form keywords the compiler dispatches on directly.
pub const SPECIAL_FORMS: [SymbolId; 12] = [
    sym::LAMBDA,
    sym::DEFUN,
    sym::DEFMACRO,
    sym::LET,
    sym::LET_STAR,
    sym::LETREC,
    sym::IF,
    sym::AND,
    sym::OR,
    sym::PROGN,
    sym::QUOTE,
    sym::SETQ,
];

impl SymbolTable {
    /// Create a new symbol table with all well-known symbols pre-interned.
    /// The order MUST match the constants in the `sym` module above.
    pub fn new() -> Self {
        let names = [
            "nil", "t", "quote", "function", "lambda", "defun", "defmacro", "let", "let*",
            "letrec", "if", "and", "or", "progn", "setq", "&rest", "&body", "block", "list",
            "append", "cons", "boundp",
        ];

        let mut table = SymbolTable {
            name_to_id: HashMap::new(),
            symbols: Vec::new(),
            gensym_counter: 0,
        };
        for name in names {
            table.intern(name);
        }

        let nil = &mut table.symbols[sym::NIL.0 as usize];
        nil.constant = true;
        nil.value = Some(Value::Nil);
        let t = &mut table.symbols[sym::T.0 as usize];
        t.constant = true;
        t.value = Some(Value::True);

        table
    }

    /// Intern a symbol name. Returns the existing ID if already interned,
    /// or creates a new one. Keywords (`:foo`) become self-evaluating
    /// constants.
    pub fn intern(&mut self, name: &str) -> SymbolId {
        if let Some(&id) = self.name_to_id.get(name) {
            return id;
        }
        let id = SymbolId(self.symbols.len() as u32);
        let mut symbol = Symbol::new(name, true);
        if name.starts_with(':') && name.len() > 1 {
            symbol.constant = true;
            symbol.value = Some(Value::Symbol(id));
        }
        self.name_to_id.insert(name.to_string(), id);
        self.symbols.push(symbol);
        id
    }

    /// Create a fresh uninterned symbol. Used for hygiene in derived forms
    /// and by the `gensym` primitive.
    pub fn gensym(&mut self, prefix: &str) -> SymbolId {
        self.gensym_counter += 1;
        let id = SymbolId(self.symbols.len() as u32);
        let name = format!("{}{}", prefix, self.gensym_counter);
        self.symbols.push(Symbol::new(&name, false));
        id
    }

    /// Look up a symbol name by its ID.
    pub fn name(&self, id: SymbolId) -> &str {
        &self.symbols[id.0 as usize].name
    }

    /// Look up a symbol ID by name, without interning.
    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.name_to_id.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    /// Total number of symbols, gensyms included.
    pub fn count(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_constant(&self, id: SymbolId) -> bool {
        self.get(id).constant
    }

    pub fn is_keyword(&self, id: SymbolId) -> bool {
        let symbol = self.get(id);
        symbol.interned && symbol.constant && symbol.name.starts_with(':')
    }

    pub fn is_special_form(&self, id: SymbolId) -> bool {
        SPECIAL_FORMS.contains(&id)
    }

    // ========================================================================
    // Value cell
    // ========================================================================

    /// Read the symbol's current value.
    pub fn value(&self, id: SymbolId) -> LispResult<Value> {
        self.get(id)
            .value
            .ok_or_else(|| LispError::UnboundVariable(self.name(id).to_string()))
    }

    pub fn is_bound(&self, id: SymbolId) -> bool {
        self.get(id).value.is_some()
    }

    /// Write the symbol's value. Constants refuse.
    pub fn set_value(&mut self, id: SymbolId, val: Value) -> LispResult<()> {
        if self.is_constant(id) {
            return Err(LispError::ConstantRedefinition(self.name(id).to_string()));
        }
        self.get_mut(id).value = Some(val);
        Ok(())
    }

    /// Restore a saved value cell, including the unbound state. Used when a
    /// dynamic binding ends.
    pub fn restore_value(&mut self, id: SymbolId, saved: Option<Value>) {
        self.get_mut(id).value = saved;
    }

    // ========================================================================
    // Function cell
    // ========================================================================

    pub fn function(&self, id: SymbolId) -> FunctionCell {
        self.get(id).function
    }

    /// Write the function cell. Constants refuse.
    pub fn set_function(&mut self, id: SymbolId, cell: FunctionCell) -> LispResult<()> {
        if self.is_constant(id) {
            return Err(LispError::ConstantRedefinition(self.name(id).to_string()));
        }
        self.get_mut(id).function = cell;
        Ok(())
    }

    /// The function cell as a callable value.
    pub fn function_value(&self, id: SymbolId) -> LispResult<Value> {
        match self.function(id) {
            FunctionCell::Function(fid) => Ok(Value::Function(fid)),
            FunctionCell::Primitive(pid) => Ok(Value::Primitive(pid)),
            FunctionCell::Pending { .. } => Err(LispError::UnboundFunction(format!(
                "{} (still being defined)",
                self.name(id)
            ))),
            FunctionCell::Unbound => Err(LispError::UnboundFunction(self.name(id).to_string())),
        }
    }

    // ========================================================================
    // Special (dynamic) variables
    // ========================================================================

    /// Proclaim the symbol special.
    pub fn declare_special(&mut self, id: SymbolId) -> LispResult<()> {
        if self.is_constant(id) {
            return Err(LispError::ConstantRedefinition(self.name(id).to_string()));
        }
        self.get_mut(id).special = true;
        Ok(())
    }

    pub fn is_special(&self, id: SymbolId) -> bool {
        self.get(id).special
    }

    /// Note a new dynamic binding of the symbol.
    pub fn enter_binding(&mut self, id: SymbolId) {
        self.get_mut(id).special_depth += 1;
    }

    /// Note the end of a dynamic binding of the symbol.
    pub fn exit_binding(&mut self, id: SymbolId) {
        self.get_mut(id).special_depth -= 1;
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::FunctionId;

    #[test]
    fn interning_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
        assert_eq!(table.name(a), "foo");
        assert_eq!(table.lookup("if"), Some(sym::IF));
        assert_eq!(table.lookup("boundp"), Some(sym::BOUNDP));
    }

    #[test]
    fn gensyms_are_fresh_and_unreachable() {
        let mut table = SymbolTable::new();
        let g1 = table.gensym("g");
        let g2 = table.gensym("g");
        assert_ne!(g1, g2);
        assert_eq!(table.lookup(table.name(g1)), None);
    }

    #[test]
    fn constants_refuse_redefinition() {
        let mut table = SymbolTable::new();
        assert!(matches!(
            table.set_function(sym::T, FunctionCell::Function(FunctionId(0))),
            Err(LispError::ConstantRedefinition(_))
        ));
        assert!(table.set_value(sym::NIL, Value::True).is_err());
        let kw = table.intern(":key");
        assert!(table.is_keyword(kw));
        assert_eq!(table.value(kw).unwrap(), Value::Symbol(kw));
    }

    #[test]
    fn unbound_cells_are_distinguishable() {
        let mut table = SymbolTable::new();
        let x = table.intern("x");
        assert!(matches!(table.value(x), Err(LispError::UnboundVariable(_))));
        assert!(matches!(table.function_value(x), Err(LispError::UnboundFunction(_))));
    }

    #[test]
    fn special_depth_tracks_bindings() {
        let mut table = SymbolTable::new();
        let x = table.intern("*x*");
        table.declare_special(x).unwrap();
        table.enter_binding(x);
        table.enter_binding(x);
        table.exit_binding(x);
        assert_eq!(table.get(x).special_depth, 1);
        assert!(table.is_special(x));
    }
}
