use std::mem;

use crate::error::{LispError, LispResult};
use crate::opcode::Opcode;
use crate::printer::print_val;
use crate::value::{FrameId, FunctionId, PairId, PrimId, SymbolId, Value};
use crate::world::World;

/// A saved continuation on the D register.
#[derive(Clone, Copy, Debug)]
pub enum Dump {
    /// Pushed by AP and RAP, consumed by RTN.
    Call {
        env: Value,
        code: Value,
        /// Height of B at the call, restored by tail calls made from the
        /// callee.
        catch_depth: usize,
    },
    /// Pushed by SEL, consumed by JOIN.
    Join { code: Value },
}

/// An active exit point on the B register.
#[derive(Clone, Copy, Debug)]
pub enum Catch {
    Block {
        name: Value,
        /// Height of S when the block was entered.
        stack: usize,
        /// E at entry. A DUM frame pushed inside the block may still be
        /// on E when a return-from reaches the block's end.
        env: Value,
    },
    Tags {
        id: Value,
        /// Alist of (tag . code).
        table: Value,
        env: Value,
        dump: usize,
        stack: usize,
        specials: usize,
    },
}

/// What the fetch loop should do after an instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Whether a call saves the caller's continuation or reuses the current one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallMode {
    Push,
    Tail,
}

/// A value pending delivery to the end of a block.
struct Transfer {
    target: Value,
    value: Value,
}

/// Saved value cell of a dynamically bound symbol.
struct SpecialBinding {
    symbol: SymbolId,
    saved: Option<Value>,
}

struct Registers {
    s: Vec<Value>,
    e: Value,
    c: Value,
    d: Vec<Dump>,
    b: Vec<Catch>,
}

/// The abstract machine: operand stack S, environment E, control C, dump D
/// and the block/tag table B.
pub struct Machine {
    pub s: Vec<Value>,
    pub e: Value,
    pub c: Value,
    pub d: Vec<Dump>,
    pub b: Vec<Catch>,
    /// Old value cells of active dynamic bindings, innermost last.
    specials: Vec<SpecialBinding>,

    /// Instructions executed since the outermost `execute` began.
    pub steps: u64,
    pub max_steps: Option<u64>,
    /// High-water mark of D since the last `reset_stats`.
    pub max_dump_depth: usize,
    /// Log every instruction at trace level.
    pub trace: bool,
    /// How many `execute` calls are currently active.
    nesting: usize,
}

impl Machine {
    pub fn new(max_steps: Option<u64>, trace: bool) -> Self {
        Machine {
            s: Vec::new(),
            e: Value::Nil,
            c: Value::Nil,
            d: Vec::new(),
            b: Vec::new(),
            specials: Vec::new(),
            steps: 0,
            max_steps,
            max_dump_depth: 0,
            trace,
            nesting: 0,
        }
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Run `code` to STOP and return the value it leaves on S.
    ///
    /// When `args` is non-empty they form the first frame of E. Re-entrant:
    /// the registers of any run in progress (a macro being expanded while
    /// the compiler is itself called from a running `eval`) are saved and
    /// restored around the nested run.
    pub fn execute(&mut self, w: &mut World, code: Value, args: &[Value]) -> LispResult<Value> {
        let env = if args.is_empty() {
            Value::Nil
        } else {
            let frame = w.heap.alloc_frame(args.to_vec())?;
            w.heap.cons(Value::Frame(frame), Value::Nil)?
        };

        let saved = self.save_registers();
        let specials_base = self.specials.len();
        if self.nesting == 0 {
            self.steps = 0;
        }
        self.nesting += 1;
        self.e = env;
        self.c = code;

        let result = self.run(w).and_then(|()| self.pop());

        self.nesting -= 1;
        if result.is_err() {
            self.unwind_specials(w, specials_base);
        }
        self.restore_registers(saved);
        result
    }

    /// Call `f` on `args` in a nested run.
    pub fn apply(&mut self, w: &mut World, f: Value, args: &[Value]) -> LispResult<Value> {
        let mut ops = Vec::with_capacity(2 * args.len() + 5);
        ops.push(Value::Op(Opcode::Ldc));
        ops.push(f);
        for &arg in args {
            ops.push(Value::Op(Opcode::Ldc));
            ops.push(arg);
        }
        ops.push(Value::Op(Opcode::Ap));
        ops.push(Value::Int(args.len() as i64));
        ops.push(Value::Op(Opcode::Stop));
        let code = w.heap.list(&ops)?;
        self.execute(w, code, &[])
    }

    /// Clear the statistics counters.
    pub fn reset_stats(&mut self) {
        self.steps = 0;
        self.max_dump_depth = 0;
    }

    /// Number of active dynamic bindings.
    pub fn special_depth(&self) -> usize {
        self.specials.len()
    }

    fn save_registers(&mut self) -> Registers {
        Registers {
            s: mem::take(&mut self.s),
            e: mem::replace(&mut self.e, Value::Nil),
            c: mem::replace(&mut self.c, Value::Nil),
            d: mem::take(&mut self.d),
            b: mem::take(&mut self.b),
        }
    }

    fn restore_registers(&mut self, saved: Registers) {
        self.s = saved.s;
        self.e = saved.e;
        self.c = saved.c;
        self.d = saved.d;
        self.b = saved.b;
    }

    /// The fetch/decode/execute loop.
    fn run(&mut self, w: &mut World) -> LispResult<()> {
        loop {
            self.steps += 1;
            if let Some(max) = self.max_steps {
                if self.steps > max {
                    return Err(LispError::FuelExhausted);
                }
            }
            let op = self.fetch_op(w)?;
            if self.trace {
                log::trace!(
                    "{:<8} s={} d={} b={} top={}",
                    op.mnemonic(),
                    self.s.len(),
                    self.d.len(),
                    self.b.len(),
                    self.s.last().map_or_else(|| "-".to_string(), |&v| print_val(v, w)),
                );
            }
            if op.execute(self, w)? == Flow::Stop {
                return Ok(());
            }
        }
    }

    // ========================================================================
    // Register access
    // ========================================================================

    #[inline]
    pub fn push(&mut self, val: Value) {
        self.s.push(val);
    }

    pub fn pop(&mut self) -> LispResult<Value> {
        self.s
            .pop()
            .ok_or_else(|| LispError::fatal("operand stack underflow"))
    }

    pub fn peek(&self) -> LispResult<Value> {
        self.s
            .last()
            .copied()
            .ok_or_else(|| LispError::fatal("operand stack underflow"))
    }

    /// Pop the top `n` values of S, in push order.
    pub fn pop_n(&mut self, n: usize) -> LispResult<Vec<Value>> {
        if self.s.len() < n {
            return Err(LispError::fatal("operand stack underflow"));
        }
        Ok(self.s.split_off(self.s.len() - n))
    }

    pub fn push_dump(&mut self, entry: Dump) {
        self.d.push(entry);
        self.max_dump_depth = self.max_dump_depth.max(self.d.len());
    }

    /// Pop the next cell of C.
    pub fn operand(&mut self, w: &World) -> LispResult<Value> {
        match self.c {
            Value::Pair(id) => {
                self.c = w.heap.cdr(id);
                Ok(w.heap.car(id))
            }
            _ => Err(LispError::fatal("instruction stream ended inside an instruction")),
        }
    }

    pub fn operand_index(&mut self, w: &World) -> LispResult<usize> {
        match self.operand(w)? {
            Value::Int(n) if n >= 0 => Ok(n as usize),
            other => Err(LispError::fatal(format!(
                "expected an index operand, found {}",
                other.type_name()
            ))),
        }
    }

    pub fn operand_symbol(&mut self, w: &World) -> LispResult<SymbolId> {
        let val = self.operand(w)?;
        val.as_symbol().ok_or_else(|| {
            LispError::fatal(format!("expected a symbol operand, found {}", val.type_name()))
        })
    }

    fn fetch_op(&mut self, w: &World) -> LispResult<Opcode> {
        if self.c.is_nil() {
            return Err(LispError::fatal("instruction stream ended without STOP"));
        }
        let cell = self.operand(w)?;
        cell.as_op()
            .ok_or_else(|| LispError::fatal(format!("expected an opcode, found {}", print_val(cell, w))))
    }

    /// Skip the operands of an instruction without executing it.
    fn skip_operands(&mut self, w: &World, op: Opcode) -> LispResult<()> {
        for _ in 0..op.operand_count() {
            self.operand(w)?;
        }
        Ok(())
    }

    /// Frame `i` of E, counting outward from the innermost.
    pub fn frame_at(&self, w: &World, i: usize) -> LispResult<FrameId> {
        let mut env = self.e;
        for _ in 0..i {
            env = w.heap.cdr_val(env)?;
        }
        match w.heap.car_val(env)? {
            Value::Frame(id) => Ok(id),
            _ => Err(LispError::fatal(format!("no environment frame at depth {}", i))),
        }
    }

    // ========================================================================
    // Calls and returns
    // ========================================================================

    /// Apply the callee sitting below the top `argc` values of S.
    pub fn call(&mut self, w: &mut World, argc: usize, mode: CallMode) -> LispResult<()> {
        let args = self.pop_n(argc)?;
        let callee = self.pop()?;
        match callee {
            Value::Function(fid) => {
                let f = w.function(fid);
                let name = w.function_name(fid);
                if f.is_macro() {
                    return Err(LispError::type_error(format!(
                        "{} is a macro and cannot be called",
                        name
                    )));
                }
                let (arity, code) = (f.arity, f.code);
                arity.check(&name, argc)?;
                self.enter(w, code, Value::Nil, args, mode)
            }
            Value::Closure(pair) => {
                let (fid, env) = closure_parts(w, pair)?;
                let f = w.function(fid);
                let (arity, code) = (f.arity, f.code);
                arity.check(&w.function_name(fid), argc)?;
                self.enter(w, code, env, args, mode)
            }
            Value::Primitive(pid) => {
                self.s.extend(args);
                self.call_primitive(w, pid, argc)
            }
            other => Err(LispError::type_error(format!(
                "{} is not a function",
                print_val(other, w)
            ))),
        }
    }

    /// Start running `code` with a new frame of `args` in front of `env`.
    fn enter(
        &mut self,
        w: &mut World,
        code: Value,
        env: Value,
        args: Vec<Value>,
        mode: CallMode,
    ) -> LispResult<()> {
        let frame = w.heap.alloc_frame(args)?;
        let env = w.heap.cons(Value::Frame(frame), env)?;
        match mode {
            CallMode::Push => self.push_dump(Dump::Call {
                env: self.e,
                code: self.c,
                catch_depth: self.b.len(),
            }),
            CallMode::Tail => match self.d.last() {
                Some(Dump::Call { catch_depth, .. }) => self.b.truncate(*catch_depth),
                _ => return Err(LispError::fatal("tail call outside a function body")),
            },
        }
        self.e = env;
        self.c = code;
        Ok(())
    }

    /// RAP: the closure's environment starts with the frame made by DUM,
    /// which is filled with the arguments in place.
    pub fn recursive_apply(&mut self, w: &mut World, argc: usize) -> LispResult<()> {
        let args = self.pop_n(argc)?;
        let (fid, env) = match self.pop()? {
            Value::Closure(pair) => closure_parts(w, pair)?,
            _ => return Err(LispError::fatal("RAP on a non-closure")),
        };
        let frame = match w.heap.car_val(env)? {
            Value::Frame(id) => id,
            _ => return Err(LispError::fatal("RAP closure has no dummy frame")),
        };
        w.heap.fill_frame(frame, args)?;
        let code = w.function(fid).code;
        let outer = w.heap.cdr_val(self.e)?;
        self.push_dump(Dump::Call {
            env: outer,
            code: self.c,
            catch_depth: self.b.len(),
        });
        self.e = env;
        self.c = code;
        Ok(())
    }

    /// RTN: the return value stays on S.
    pub fn return_to_caller(&mut self) -> LispResult<()> {
        match self.d.pop() {
            Some(Dump::Call {
                env,
                code,
                catch_depth,
            }) => {
                self.b.truncate(catch_depth);
                self.e = env;
                self.c = code;
                Ok(())
            }
            Some(Dump::Join { .. }) => Err(LispError::fatal("RTN found a join entry on the dump")),
            None => Err(LispError::fatal("RTN with an empty dump")),
        }
    }

    pub fn join(&mut self) -> LispResult<()> {
        match self.d.pop() {
            Some(Dump::Join { code }) => {
                self.c = code;
                Ok(())
            }
            _ => Err(LispError::fatal("JOIN without a matching SEL")),
        }
    }

    /// Run a primitive's exec hook on the top `argc` values of S.
    pub fn call_primitive(&mut self, w: &mut World, pid: PrimId, argc: usize) -> LispResult<()> {
        let prim = w.primitives.get(pid);
        let name = w.symbols.name(prim.name).to_string();
        let (arity, exec) = (prim.arity, prim.exec);
        arity.check(&name, argc)?;
        match exec {
            Some(exec) => exec(self, w, argc),
            None => Err(LispError::type_error(format!(
                "{} is a special operator and cannot be called at run time",
                name
            ))),
        }
    }

    /// The call mode a primitive should use when it calls back into Lisp:
    /// a tail call when the instruction after it is RTN.
    pub fn continuation_mode(&self, w: &World) -> CallMode {
        let next = match self.c {
            Value::Pair(id) => w.heap.car(id),
            _ => Value::Nil,
        };
        let in_function = matches!(self.d.last(), Some(Dump::Call { .. }));
        if next == Value::Op(Opcode::Rtn) && in_function {
            CallMode::Tail
        } else {
            CallMode::Push
        }
    }

    // ========================================================================
    // Dynamic binding
    // ========================================================================

    /// Shallow binding: the symbol's value cell holds the innermost binding,
    /// the outer value is kept on the specials stack.
    pub fn bind_special(&mut self, w: &mut World, symbol: SymbolId, val: Value) {
        let saved = w.symbols.get(symbol).value;
        self.specials.push(SpecialBinding { symbol, saved });
        w.symbols.restore_value(symbol, Some(val));
        w.symbols.enter_binding(symbol);
    }

    /// End the innermost dynamic binding, which must belong to `symbol`.
    pub fn unbind_special(&mut self, w: &mut World, symbol: SymbolId) -> LispResult<()> {
        match self.specials.pop() {
            Some(binding) if binding.symbol == symbol => {
                w.symbols.restore_value(symbol, binding.saved);
                w.symbols.exit_binding(symbol);
                Ok(())
            }
            Some(binding) => Err(LispError::fatal(format!(
                "UNBIND {} but the innermost binding is {}",
                w.symbols.name(symbol),
                w.symbols.name(binding.symbol)
            ))),
            None => Err(LispError::fatal(format!(
                "UNBIND {} with no active binding",
                w.symbols.name(symbol)
            ))),
        }
    }

    /// Undo dynamic bindings until only `depth` remain.
    fn unwind_specials(&mut self, w: &mut World, depth: usize) {
        while self.specials.len() > depth {
            if let Some(binding) = self.specials.pop() {
                w.symbols.restore_value(binding.symbol, binding.saved);
                w.symbols.exit_binding(binding.symbol);
            }
        }
    }

    // ========================================================================
    // Blocks and tagbodies
    // ========================================================================

    pub fn end_block(&mut self, name: Value) -> LispResult<()> {
        match self.b.pop() {
            Some(Catch::Block { name: entered, .. }) if entered == name => Ok(()),
            _ => Err(LispError::fatal("BLOCKEND does not match the innermost block")),
        }
    }

    pub fn enter_tagbody(&mut self, id: Value, table: Value) {
        self.b.push(Catch::Tags {
            id,
            table,
            env: self.e,
            dump: self.d.len(),
            stack: self.s.len(),
            specials: self.specials.len(),
        });
    }

    pub fn end_tagbody(&mut self) -> LispResult<()> {
        match self.b.pop() {
            Some(Catch::Tags { .. }) => Ok(()),
            _ => Err(LispError::fatal("TAGEND does not match the innermost tagbody")),
        }
    }

    /// RETFROM: deliver `value` to the end of the block named `target`.
    ///
    /// Walks C forward the way normal execution would leave the block:
    /// returns and joins are taken, exits of constructs entered inside the
    /// block are executed, and constructs entered during the walk are
    /// skipped together with their matching exits.
    pub fn return_from(&mut self, w: &mut World, target: Value, value: Value) -> LispResult<()> {
        let transfer = Transfer { target, value };
        let mut skipped = 0usize;
        loop {
            let op = self.fetch_op(w).map_err(|_| {
                LispError::fatal(format!(
                    "return-from {} ran off the end of the code",
                    print_val(transfer.target, w)
                ))
            })?;
            match op {
                Opcode::Stop => {
                    return Err(LispError::fatal(format!(
                        "return-from {}: block not active",
                        print_val(transfer.target, w)
                    )))
                }
                Opcode::Rtn => self.return_to_caller()?,
                Opcode::Join => self.join()?,
                Opcode::TSel => {
                    let then_code = self.operand(w)?;
                    self.operand(w)?;
                    self.c = then_code;
                }
                Opcode::Block | Opcode::TagBody | Opcode::Bind => {
                    self.skip_operands(w, op)?;
                    skipped += 1;
                }
                Opcode::BlockEnd => {
                    let name = self.operand(w)?;
                    if skipped > 0 {
                        skipped -= 1;
                        continue;
                    }
                    match self.b.pop() {
                        Some(Catch::Block { name: entered, stack, env }) if entered == name => {
                            if name == transfer.target {
                                self.e = env;
                                self.s.truncate(stack);
                                self.s.push(transfer.value);
                                return Ok(());
                            }
                        }
                        _ => {
                            return Err(LispError::fatal(
                                "return-from crossed a block that is not active",
                            ))
                        }
                    }
                }
                Opcode::TagEnd => {
                    if skipped > 0 {
                        skipped -= 1;
                        continue;
                    }
                    self.end_tagbody()?;
                }
                Opcode::Unbind => {
                    let symbol = self.operand_symbol(w)?;
                    if skipped > 0 {
                        skipped -= 1;
                        continue;
                    }
                    self.unbind_special(w, symbol)?;
                }
                other => self.skip_operands(w, other)?,
            }
        }
    }

    /// GO: resume at `tag` of the tagbody record `id`, restoring the machine
    /// state saved when that tagbody was entered.
    pub fn go(&mut self, w: &mut World, id: Value, tag: Value) -> LispResult<()> {
        let found = self.b.iter().enumerate().rev().find_map(|(index, entry)| match *entry {
            Catch::Tags {
                id: entered,
                table,
                env,
                dump,
                stack,
                specials,
            } if entered == id => Some((index, table, env, dump, stack, specials)),
            _ => None,
        });
        let (index, table, env, dump, stack, specials) = found.ok_or_else(|| {
            LispError::fatal(format!("go {}: tagbody not active", print_val(tag, w)))
        })?;
        let code = assoc(w, tag, table).ok_or_else(|| {
            LispError::fatal(format!("go: tag {} not in its tagbody", print_val(tag, w)))
        })?;
        self.b.truncate(index + 1);
        self.e = env;
        self.d.truncate(dump);
        self.s.truncate(stack);
        self.unwind_specials(w, specials);
        self.c = code;
        Ok(())
    }
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(None, false)
    }
}

/// Split a closure into its function template and captured environment.
fn closure_parts(w: &World, pair: PairId) -> LispResult<(FunctionId, Value)> {
    match w.heap.car(pair) {
        Value::Function(fid) => Ok((fid, w.heap.cdr(pair))),
        _ => Err(LispError::fatal("closure without a function template")),
    }
}

/// Look `key` up in an alist by identity.
fn assoc(w: &World, key: Value, alist: Value) -> Option<Value> {
    let mut rest = alist;
    while let Value::Pair(id) = rest {
        if let Value::Pair(entry) = w.heap.car(id) {
            if w.heap.car(entry) == key {
                return Some(w.heap.cdr(entry));
            }
        }
        rest = w.heap.cdr(id);
    }
    None
}
