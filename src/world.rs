use crate::config::Config;
use crate::control;
use crate::error::LispResult;
use crate::function::Function;
use crate::heap::Heap;
use crate::primitives::{self, PrimitiveRegistry};
use crate::symbol::SymbolTable;
use crate::value::{FunctionId, Value};

/// Everything a compiler and a machine share: the heap, the symbol table
/// with its binding cells, the primitive registry and the compiled
/// functions. Owned by the caller and passed explicitly; two worlds never
/// see each other's definitions.
pub struct World {
    pub heap: Heap,
    pub symbols: SymbolTable,
    pub primitives: PrimitiveRegistry,
    functions: Vec<Function>,
    /// Text written by `print`, drained by the host.
    pub output: String,
    /// Definitions made while set are marked builtin.
    pub defining_builtins: bool,
    pub warn_free_variables: bool,
}

impl World {
    /// A world with the primitive and control libraries installed.
    pub fn new(config: &Config) -> LispResult<Self> {
        let mut world = World {
            heap: Heap::new(config.heap_capacity),
            symbols: SymbolTable::new(),
            primitives: PrimitiveRegistry::new(),
            functions: Vec::new(),
            output: String::new(),
            defining_builtins: false,
            warn_free_variables: config.warn_free_variables,
        };
        primitives::install(&mut world)?;
        control::install(&mut world)?;
        Ok(world)
    }

    pub fn add_function(&mut self, function: Function) -> FunctionId {
        let id = FunctionId(self.functions.len() as u32);
        self.functions.push(function);
        id
    }

    pub fn function(&self, id: FunctionId) -> &Function {
        &self.functions[id.0 as usize]
    }

    pub fn function_mut(&mut self, id: FunctionId) -> &mut Function {
        &mut self.functions[id.0 as usize]
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// The defining name of a function, or "lambda" for anonymous ones.
    pub fn function_name(&self, id: FunctionId) -> String {
        match self.function(id).name {
            Some(name) => self.symbols.name(name).to_string(),
            None => "lambda".to_string(),
        }
    }

    /// Intern `name` as a symbol value.
    pub fn intern(&mut self, name: &str) -> Value {
        Value::from_symbol(self.symbols.intern(name))
    }

    /// Drain the output buffer.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }
}
