use std::fs;
use std::path::Path;

use crate::compiler::Compiler;
use crate::config::Config;
use crate::error::LispResult;
use crate::machine::Machine;
use crate::printer;
use crate::reader;
use crate::value::Value;
use crate::world::World;

/// Derived macros and list helpers, compiled at start-up.
const PRELUDE: &str = include_str!("prelude.lisp");

/// A world, a compiler and a machine wired together: read, compile and run
/// top-level forms.
pub struct Interpreter {
    pub world: World,
    pub machine: Machine,
    pub compiler: Compiler,
}

impl Interpreter {
    pub fn new(config: Config) -> LispResult<Self> {
        let mut interp = Interpreter {
            world: World::new(&config)?,
            machine: Machine::new(config.max_steps, config.trace),
            compiler: Compiler::new(),
        };
        if config.prelude {
            interp.world.defining_builtins = true;
            let loaded = interp.eval_str(PRELUDE);
            interp.world.defining_builtins = false;
            loaded?;
            interp.compiler.warnings.clear();
            log::debug!(
                "prelude loaded: {} functions, {} cells",
                interp.world.function_count(),
                interp.world.heap.total_cells()
            );
        }
        Ok(interp)
    }

    /// Compile a top-level form without running it.
    pub fn compile(&mut self, form: Value) -> LispResult<Value> {
        self.compiler.compile_toplevel(&mut self.machine, &mut self.world, form)
    }

    /// Compile and run one top-level form. Statistics restart with every
    /// form.
    pub fn eval(&mut self, form: Value) -> LispResult<Value> {
        let code = self.compile(form)?;
        self.machine.reset_stats();
        self.machine.execute(&mut self.world, code, &[])
    }

    /// Evaluate every form in `src` in order and return the last value.
    /// Forms are read one at a time, so a later form may use a macro an
    /// earlier one defined.
    pub fn eval_str(&mut self, src: &str) -> LispResult<Value> {
        let mut pos = 0;
        let mut last = Value::Nil;
        while let Some((form, next)) =
            reader::read_one_at(src, pos, &mut self.world.heap, &mut self.world.symbols)?
        {
            pos = next;
            last = self.eval(form)?;
        }
        Ok(last)
    }

    pub fn read_all(&mut self, src: &str) -> LispResult<Vec<Value>> {
        reader::read_all(src, &mut self.world.heap, &mut self.world.symbols)
    }

    pub fn load_file(&mut self, path: &Path) -> LispResult<Value> {
        let src = fs::read_to_string(path)?;
        log::debug!("loading {}", path.display());
        self.eval_str(&src)
    }

    pub fn print(&self, val: Value) -> String {
        printer::print_val(val, &self.world)
    }

    pub fn disassemble(&self, code: Value) -> String {
        printer::disassemble(code, &self.world)
    }

    /// Drain text written by `print`.
    pub fn take_output(&mut self) -> String {
        self.world.take_output()
    }

    /// Drain free-variable warnings.
    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.compiler.warnings)
    }
}
