use std::mem;

use crate::error::{LispError, LispResult};
use crate::function::{Arity, Function, FunctionCell, FunctionKind};
use crate::lexenv::{LexEnv, LexFrame};
use crate::machine::Machine;
use crate::opcode::Opcode;
use crate::printer::print_val;
use crate::symbol::sym;
use crate::value::{FunctionId, PairId, PrimId, SymbolId, Value};
use crate::world::World;

/// A `block` whose body is being compiled.
struct BlockScope {
    name: Value,
    lambda_depth: usize,
    /// A `return-from` inside a nested function targets this block.
    captured: bool,
    /// Indices into `pending_tails` of calls whose tail position runs
    /// through this block's exit.
    tail_calls: Vec<usize>,
}

/// A `tagbody` whose forms are being compiled.
struct TagScope {
    id: Value,
    tags: Vec<Value>,
}

/// An AP that becomes TAP once every block between it and the function's
/// RTN is known to be uncaptured.
struct PendingTail {
    cell: PairId,
    open_scopes: usize,
    blocked: bool,
}

/// Where a continuation leads, for tail-position decisions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tail {
    No,
    /// RTN after `crossed` block exits.
    Return { crossed: usize },
    /// STOP after `crossed` block exits.
    Stop { crossed: usize },
}

/// Translates forms into instruction streams.
///
/// Compilation is continuation-passing: every rule receives the code that
/// must run after the form and returns the form's code prepended to it.
/// The only state kept between rules is the lexical scope of `block` and
/// `tagbody` names.
#[derive(Default)]
pub struct Compiler {
    blocks: Vec<BlockScope>,
    tags: Vec<TagScope>,
    pending_tails: Vec<PendingTail>,
    lambda_depth: usize,
    /// Free-variable warnings, oldest first.
    pub warnings: Vec<String>,
}

/// Build `op operands... . cont`.
pub(crate) fn emit(w: &mut World, op: Opcode, operands: &[Value], cont: Value) -> LispResult<Value> {
    let tail = w.heap.list_with_tail(operands, cont)?;
    w.heap.cons(Value::Op(op), tail)
}

fn int(n: usize) -> Value {
    Value::Int(n as i64)
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile a form for execution at top level: the code ends in STOP.
    pub fn compile_toplevel(&mut self, m: &mut Machine, w: &mut World, form: Value) -> LispResult<Value> {
        self.blocks.clear();
        self.tags.clear();
        self.pending_tails.clear();
        self.lambda_depth = 0;
        log::debug!("compiling {}", print_val(form, w));
        let stop = emit(w, Opcode::Stop, &[], Value::Nil)?;
        let result = self.compile(m, w, form, &LexEnv::new(), stop);
        if result.is_err() {
            self.blocks.clear();
            self.tags.clear();
            self.lambda_depth = 0;
        }
        result
    }

    /// Compile `form` in `env`, prepending its code to `cont`.
    pub fn compile(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        form: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        match form {
            Value::Symbol(id) => self.compile_symbol(w, id, env, cont),
            Value::Pair(id) => self.compile_form(m, w, id, env, cont),
            _ => emit(w, Opcode::Ldc, &[form], cont),
        }
    }

    fn compile_symbol(&mut self, w: &mut World, id: SymbolId, env: &LexEnv, cont: Value) -> LispResult<Value> {
        let name = Value::Symbol(id);
        if w.symbols.is_keyword(id) {
            return emit(w, Opcode::Ldc, &[name], cont);
        }
        if w.symbols.is_special(id) {
            return emit(w, Opcode::Ldg, &[name], cont);
        }
        if let Some(addr) = env.resolve(id) {
            let op = if addr.rest { Opcode::Ldr } else { Opcode::Ld };
            return emit(w, op, &[int(addr.frame), int(addr.slot)], cont);
        }
        if w.warn_free_variables && !w.symbols.is_bound(id) {
            let warning = format!("free variable {} is not declared special", w.symbols.name(id));
            log::warn!("{}", warning);
            self.warnings.push(warning);
        }
        emit(w, Opcode::Ldg, &[name], cont)
    }

    fn compile_form(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        form: PairId,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let head = w.heap.car(form);
        let args = w.heap.cdr(form);
        if !w.heap.is_proper_list(args) {
            return Err(LispError::invalid_form(
                "call",
                format!("{} has a dotted argument list", print_val(Value::Pair(form), w)),
            ));
        }

        let name = match head {
            Value::Symbol(id) => id,
            Value::Pair(_) if self.is_lambda_form(w, head) => {
                return self.compile_lambda_call(m, w, head, args, env, cont);
            }
            _ => {
                return Err(LispError::invalid_form(
                    "call",
                    format!("{} is not a function name", print_val(head, w)),
                ))
            }
        };

        if w.symbols.is_special_form(name) {
            return self.compile_special_form(m, w, name, args, env, cont);
        }

        match w.symbols.function(name) {
            FunctionCell::Primitive(pid) => self.compile_primitive_call(m, w, pid, args, env, cont),
            FunctionCell::Function(fid) if w.function(fid).is_macro() => {
                let expansion = expand_macro(m, w, fid, args)?;
                self.compile(m, w, expansion, env, cont)
            }
            FunctionCell::Function(fid) => {
                let arity = w.function(fid).arity;
                self.compile_named_call(m, w, name, arity, args, env, cont)
            }
            FunctionCell::Pending { is_macro: true, .. } => Err(LispError::invalid_form(
                "defmacro",
                format!("macro {} is used in its own definition", w.symbols.name(name)),
            )),
            FunctionCell::Pending { arity, .. } => {
                self.compile_named_call(m, w, name, arity, args, env, cont)
            }
            FunctionCell::Unbound => Err(LispError::UndefinedFunction(w.symbols.name(name).to_string())),
        }
    }

    fn compile_special_form(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        name: SymbolId,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        match name {
            sym::QUOTE => self.compile_quote(w, args, cont),
            sym::IF => self.compile_if(m, w, args, env, cont),
            sym::PROGN => self.compile_body(m, w, args, env, cont),
            sym::SETQ => self.compile_setq(m, w, args, env, cont),
            sym::LAMBDA => self.compile_lambda(m, w, args, env, cont),
            sym::LET => self.compile_let(m, w, args, env, cont),
            sym::LET_STAR => self.compile_let_star(m, w, args, env, cont),
            sym::LETREC => self.compile_letrec(m, w, args, env, cont),
            sym::AND => self.compile_and(m, w, args, env, cont),
            sym::OR => self.compile_or(m, w, args, env, cont),
            sym::DEFUN => self.compile_definition(m, w, FunctionKind::Function, args, cont),
            sym::DEFMACRO => self.compile_definition(m, w, FunctionKind::Macro, args, cont),
            _ => Err(LispError::fatal(format!(
                "no rule for special form {}",
                w.symbols.name(name)
            ))),
        }
    }

    // ========================================================================
    // Calls
    // ========================================================================

    /// Where `cont` leads once any block exits at its front are passed.
    fn tail_status(&self, w: &World, cont: Value) -> Tail {
        let mut crossed = 0;
        let mut rest = cont;
        while let Value::Pair(id) = rest {
            match w.heap.car(id) {
                Value::Op(Opcode::BlockEnd) => {
                    crossed += 1;
                    rest = match w.heap.cdr(id) {
                        Value::Pair(operand) => w.heap.cdr(operand),
                        _ => return Tail::No,
                    };
                }
                Value::Op(Opcode::Rtn) => return Tail::Return { crossed },
                Value::Op(Opcode::Stop) => return Tail::Stop { crossed },
                _ => return Tail::No,
            }
        }
        Tail::No
    }

    /// `AP argc` in front of `cont`, or `TAP argc` when the call is in tail
    /// position.
    ///
    /// A tail call that runs through block exits stays AP until those blocks
    /// are closed: if a nested function returns into one of them, the
    /// block's record has to outlive the call.
    fn emit_apply(&mut self, w: &mut World, argc: usize, cont: Value) -> LispResult<Value> {
        match self.tail_status(w, cont) {
            Tail::Return { crossed: 0 } => emit(w, Opcode::TAp, &[int(argc)], cont),
            Tail::Return { crossed } if crossed <= self.blocks.len() => {
                let code = emit(w, Opcode::Ap, &[int(argc)], cont)?;
                if let Value::Pair(cell) = code {
                    let index = self.pending_tails.len();
                    self.pending_tails.push(PendingTail {
                        cell,
                        open_scopes: crossed,
                        blocked: false,
                    });
                    let first = self.blocks.len() - crossed;
                    for scope in &mut self.blocks[first..] {
                        scope.tail_calls.push(index);
                    }
                }
                Ok(code)
            }
            _ => emit(w, Opcode::Ap, &[int(argc)], cont),
        }
    }

    /// Compile argument forms left to right in front of `cont`.
    fn compile_args(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: &[Value],
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let mut code = cont;
        for &arg in args.iter().rev() {
            code = self.compile(m, w, arg, env, code)?;
        }
        Ok(code)
    }

    /// `GFN name, args..., AP n`
    #[allow(clippy::too_many_arguments)]
    fn compile_named_call(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        name: SymbolId,
        arity: Arity,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let argv = self.arg_vec(w, args)?;
        arity.check(w.symbols.name(name), argv.len())?;
        let code = self.emit_apply(w, argv.len(), cont)?;
        let code = self.compile_args(m, w, &argv, env, code)?;
        emit(w, Opcode::Gfn, &[Value::Symbol(name)], code)
    }

    /// `((lambda params . body) args...)`: `LDF, args..., AP n`
    fn compile_lambda_call(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        lambda: Value,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let argv = self.arg_vec(w, args)?;
        let params = w.heap.cadr(lambda)?;
        let (names, rest) = parse_lambda_list(w, params, "lambda")?;
        lambda_arity(&names, rest).check("lambda", argv.len())?;
        let code = self.emit_apply(w, argv.len(), cont)?;
        let code = self.compile_args(m, w, &argv, env, code)?;
        let lambda_args = w.heap.cdr_val(lambda)?;
        self.compile_lambda(m, w, lambda_args, env, code)
    }

    fn compile_primitive_call(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        pid: PrimId,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let prim = *w.primitives.get(pid);
        let argv = self.arg_vec(w, args)?;
        prim.arity.check(w.symbols.name(prim.name), argv.len())?;
        if let Some(codegen) = prim.codegen {
            return codegen(self, m, w, args, env, cont);
        }
        if prim.inline {
            let code = emit(w, Opcode::CallP, &[Value::Primitive(pid), int(argv.len())], cont)?;
            self.compile_args(m, w, &argv, env, code)
        } else {
            let code = self.emit_apply(w, argv.len(), cont)?;
            let code = self.compile_args(m, w, &argv, env, code)?;
            emit(w, Opcode::Ldc, &[Value::Primitive(pid)], code)
        }
    }

    fn arg_vec(&self, w: &World, args: Value) -> LispResult<Vec<Value>> {
        w.heap
            .list_to_vec(args)
            .ok_or_else(|| LispError::invalid_form("call", "dotted argument list"))
    }

    fn is_lambda_form(&self, w: &World, form: Value) -> bool {
        match form {
            Value::Pair(id) => w.heap.car(id) == Value::Symbol(sym::LAMBDA),
            _ => false,
        }
    }

    // ========================================================================
    // quote, if, progn, setq
    // ========================================================================

    fn compile_quote(&mut self, w: &mut World, args: Value, cont: Value) -> LispResult<Value> {
        match w.heap.list_to_vec(args).as_deref() {
            Some([quoted]) => emit(w, Opcode::Ldc, &[*quoted], cont),
            _ => Err(LispError::invalid_form("quote", "expected exactly one argument")),
        }
    }

    /// `test, SEL then else` with arms ending in JOIN; in tail position
    /// `test, TSEL then else` with both arms ending in the terminal
    /// continuation.
    fn compile_if(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let (test, then_form, else_form) = match self.arg_vec(w, args)?.as_slice() {
            [test, then_form] => (*test, *then_form, Value::Nil),
            [test, then_form, else_form] => (*test, *then_form, *else_form),
            _ => return Err(LispError::invalid_form("if", "expected (if test then [else])")),
        };
        let branch = match self.tail_status(w, cont) {
            Tail::No => {
                let join = emit(w, Opcode::Join, &[], Value::Nil)?;
                let then_code = self.compile(m, w, then_form, env, join)?;
                let else_code = self.compile(m, w, else_form, env, join)?;
                emit(w, Opcode::Sel, &[then_code, else_code], cont)?
            }
            Tail::Return { .. } | Tail::Stop { .. } => {
                let then_code = self.compile(m, w, then_form, env, cont)?;
                let else_code = self.compile(m, w, else_form, env, cont)?;
                emit(w, Opcode::TSel, &[then_code, else_code], Value::Nil)?
            }
        };
        self.compile(m, w, test, env, branch)
    }

    /// Compile forms in sequence, discarding every value but the last.
    pub(crate) fn compile_body(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        forms: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let forms = self.arg_vec(w, forms)?;
        let Some((&last, init)) = forms.split_last() else {
            return emit(w, Opcode::Ldc, &[Value::Nil], cont);
        };
        let mut code = self.compile(m, w, last, env, cont)?;
        for &form in init.iter().rev() {
            let pop = emit(w, Opcode::Pop, &[], code)?;
            code = self.compile(m, w, form, env, pop)?;
        }
        Ok(code)
    }

    fn compile_setq(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let items = self.arg_vec(w, args)?;
        if items.is_empty() {
            return emit(w, Opcode::Ldc, &[Value::Nil], cont);
        }
        if items.len() % 2 != 0 {
            return Err(LispError::invalid_form("setq", "odd number of arguments"));
        }
        let mut code = cont;
        for (i, pair) in items.chunks(2).enumerate().rev() {
            if i + 1 < items.len() / 2 {
                code = emit(w, Opcode::Pop, &[], code)?;
            }
            let var = self.assignable(w, pair[0], "setq")?;
            code = self.emit_store(w, var, env, code)?;
            code = self.compile(m, w, pair[1], env, code)?;
        }
        Ok(code)
    }

    /// A symbol that may be assigned or bound.
    fn assignable(&self, w: &World, var: Value, form: &str) -> LispResult<SymbolId> {
        let id = var.as_symbol().ok_or_else(|| {
            LispError::invalid_form(form, format!("{} is not a symbol", print_val(var, w)))
        })?;
        if w.symbols.is_constant(id) {
            return Err(LispError::ConstantRedefinition(w.symbols.name(id).to_string()));
        }
        Ok(id)
    }

    /// SETL, SETLR or SETG for `var`, leaving the value on S.
    fn emit_store(&mut self, w: &mut World, var: SymbolId, env: &LexEnv, cont: Value) -> LispResult<Value> {
        if !w.symbols.is_special(var) {
            if let Some(addr) = env.resolve(var) {
                let op = if addr.rest { Opcode::SetLR } else { Opcode::SetL };
                return emit(w, op, &[int(addr.frame), int(addr.slot)], cont);
            }
        }
        emit(w, Opcode::SetG, &[Value::Symbol(var)], cont)
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// `(lambda params . body)` given `(params . body)`: `LDF fn`.
    pub(crate) fn compile_lambda(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        lambda_args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let params = w.heap.car_val(lambda_args)?;
        let body = w.heap.cdr_val(lambda_args)?;
        let fid = self.compile_function(m, w, None, FunctionKind::Function, params, body, env)?;
        emit(w, Opcode::Ldf, &[Value::Function(fid)], cont)
    }

    #[allow(clippy::too_many_arguments)]
    fn compile_function(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        name: Option<SymbolId>,
        kind: FunctionKind,
        params: Value,
        body: Value,
        env: &LexEnv,
    ) -> LispResult<FunctionId> {
        let form = if kind == FunctionKind::Macro { "defmacro" } else { "lambda" };
        let (names, rest) = parse_lambda_list(w, params, form)?;
        let arity = lambda_arity(&names, rest);
        let frame = LexFrame::with_rest(names, rest);
        let code = self.compile_frame_body(m, w, frame, body, env)?;
        Ok(w.add_function(Function {
            name,
            kind,
            arity,
            code,
            builtin: w.defining_builtins,
            expander: None,
        }))
    }

    /// The code of a function whose parameters form `frame`: special
    /// parameters are bound dynamically on entry and unbound before RTN.
    fn compile_frame_body(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        frame: LexFrame,
        body: Value,
        env: &LexEnv,
    ) -> LispResult<Value> {
        let specials: Vec<(usize, SymbolId, bool)> = frame
            .names
            .iter()
            .enumerate()
            .filter(|&(_, &name)| w.symbols.is_special(name))
            .map(|(slot, &name)| (slot, name, frame.rest == Some(slot)))
            .collect();

        let inner = env.extend(frame);
        let mut tail = emit(w, Opcode::Rtn, &[], Value::Nil)?;
        for &(_, name, _) in &specials {
            tail = emit(w, Opcode::Unbind, &[Value::Symbol(name)], tail)?;
        }

        self.lambda_depth += 1;
        let body_code = self.compile_body(m, w, body, &inner, tail);
        self.lambda_depth -= 1;

        let mut code = body_code?;
        for &(slot, name, rest) in specials.iter().rev() {
            code = emit(w, Opcode::Bind, &[Value::Symbol(name)], code)?;
            let load = if rest { Opcode::Ldr } else { Opcode::Ld };
            code = emit(w, load, &[int(0), int(slot)], code)?;
        }
        Ok(code)
    }

    /// `defun`/`defmacro`: the name is callable (as a pending sentinel)
    /// while its own body compiles; the body is an implicit block of the
    /// same name compiled over the empty lexical environment.
    fn compile_definition(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        kind: FunctionKind,
        args: Value,
        cont: Value,
    ) -> LispResult<Value> {
        let form = if kind == FunctionKind::Macro { "defmacro" } else { "defun" };
        let items = self.arg_vec(w, args)?;
        if items.len() < 2 {
            return Err(LispError::invalid_form(form, "expected a name and a parameter list"));
        }
        let name = items[0].as_symbol().ok_or_else(|| {
            LispError::invalid_form(form, format!("{} is not a symbol", print_val(items[0], w)))
        })?;
        if w.symbols.is_special_form(name) {
            return Err(LispError::invalid_form(
                form,
                format!("cannot redefine special form {}", w.symbols.name(name)),
            ));
        }
        if let FunctionCell::Primitive(pid) = w.symbols.function(name) {
            if w.primitives.get(pid).exec.is_none() {
                return Err(LispError::invalid_form(
                    form,
                    format!("cannot redefine special operator {}", w.symbols.name(name)),
                ));
            }
        }

        let params = items[1];
        let (names, rest) = parse_lambda_list(w, params, form)?;
        let arity = lambda_arity(&names, rest);
        let previous = w.symbols.function(name);
        w.symbols.set_function(
            name,
            FunctionCell::Pending {
                arity,
                is_macro: kind == FunctionKind::Macro,
            },
        )?;

        let body = w.heap.cdr_val(w.heap.cdr_val(args)?)?;
        let named_body = w.heap.cons(Value::from_symbol(name), body)?;
        let block_form = w.heap.cons(Value::Symbol(sym::BLOCK), named_body)?;
        let wrapped = w.heap.list(&[block_form])?;

        let saved_blocks = mem::take(&mut self.blocks);
        let saved_tags = mem::take(&mut self.tags);
        let result = self.compile_function(m, w, Some(name), kind, params, wrapped, &LexEnv::new());
        self.blocks = saved_blocks;
        self.tags = saved_tags;

        let fid = match result {
            Ok(fid) => fid,
            Err(e) => {
                w.symbols.set_function(name, previous)?;
                return Err(e);
            }
        };
        if kind == FunctionKind::Macro {
            let mut expander = w.function(fid).clone();
            expander.kind = FunctionKind::Function;
            let expander_id = w.add_function(expander);
            w.function_mut(fid).expander = Some(expander_id);
        }
        w.symbols.set_function(name, FunctionCell::Function(fid))?;
        log::debug!(
            "defined {} {}",
            if kind == FunctionKind::Macro { "macro" } else { "function" },
            w.symbols.name(name)
        );
        emit(w, Opcode::Ldc, &[Value::from_symbol(name)], cont)
    }

    // ========================================================================
    // let, let*, letrec
    // ========================================================================

    /// `(let bindings . body)`: `LDF body, inits..., AP n`. The body is a
    /// function of the bound variables.
    fn compile_let(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let bindings = w.heap.car_val(args)?;
        let body = w.heap.cdr_val(args)?;
        let (names, inits) = self.parse_bindings(w, bindings, "let")?;
        if names.is_empty() {
            return self.compile_body(m, w, body, env, cont);
        }
        let arity = Arity::exactly(names.len());
        let code = self.compile_frame_body(m, w, LexFrame::new(names), body, env)?;
        let fid = w.add_function(Function {
            name: None,
            kind: FunctionKind::Function,
            arity,
            code,
            builtin: w.defining_builtins,
            expander: None,
        });

        let code = self.emit_apply(w, inits.len(), cont)?;
        let code = self.compile_args(m, w, &inits, env, code)?;
        emit(w, Opcode::Ldf, &[Value::Function(fid)], code)
    }

    /// `(let* (b1 b2 ...) . body)` is `(let (b1) (let* (b2 ...) . body))`.
    fn compile_let_star(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let bindings = w.heap.car_val(args)?;
        let body = w.heap.cdr_val(args)?;
        let items = w
            .heap
            .list_to_vec(bindings)
            .ok_or_else(|| LispError::invalid_form("let*", "bindings must be a list"))?;
        if items.len() <= 1 {
            return self.compile_let(m, w, args, env, cont);
        }
        let rest_bindings = w.heap.cdr_val(bindings)?;
        let inner = w.heap.cons(rest_bindings, body)?;
        let inner = w.heap.cons(Value::Symbol(sym::LET_STAR), inner)?;
        let first = w.heap.list(&[items[0]])?;
        let outer_body = w.heap.list(&[inner])?;
        let outer_args = w.heap.cons(first, outer_body)?;
        self.compile_let(m, w, outer_args, env, cont)
    }

    /// `(letrec bindings . body)`: `DUM n, LDF body, inits..., RAP n`. The
    /// initialisers and the body all see the new frame.
    fn compile_letrec(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let bindings = w.heap.car_val(args)?;
        let body = w.heap.cdr_val(args)?;
        let (names, inits) = self.parse_bindings(w, bindings, "letrec")?;
        if names.is_empty() {
            return self.compile_body(m, w, body, env, cont);
        }
        if let Some(&special) = names.iter().find(|&&n| w.symbols.is_special(n)) {
            return Err(LispError::invalid_form(
                "letrec",
                format!("cannot bind special variable {}", w.symbols.name(special)),
            ));
        }
        let n = names.len();
        let inner = env.extend(LexFrame::new(names));

        let rtn = emit(w, Opcode::Rtn, &[], Value::Nil)?;
        self.lambda_depth += 1;
        let body_code = self.compile_body(m, w, body, &inner, rtn);
        self.lambda_depth -= 1;
        let fid = w.add_function(Function {
            name: None,
            kind: FunctionKind::Function,
            arity: Arity::exactly(n),
            code: body_code?,
            builtin: w.defining_builtins,
            expander: None,
        });

        let code = emit(w, Opcode::RAp, &[int(n)], cont)?;
        let code = self.compile_args(m, w, &inits, &inner, code)?;
        let code = emit(w, Opcode::Ldf, &[Value::Function(fid)], code)?;
        emit(w, Opcode::Dum, &[int(n)], code)
    }

    /// Bindings are `var`, `(var)` or `(var init)`.
    fn parse_bindings(&self, w: &World, bindings: Value, form: &str) -> LispResult<(Vec<SymbolId>, Vec<Value>)> {
        let items = w
            .heap
            .list_to_vec(bindings)
            .ok_or_else(|| LispError::invalid_form(form, "bindings must be a list"))?;
        let mut names = Vec::with_capacity(items.len());
        let mut inits = Vec::with_capacity(items.len());
        for item in items {
            let (var, init) = match item {
                Value::Pair(_) => match w.heap.list_to_vec(item).as_deref() {
                    Some([var]) => (*var, Value::Nil),
                    Some([var, init]) => (*var, *init),
                    _ => {
                        return Err(LispError::invalid_form(
                            form,
                            format!("malformed binding {}", print_val(item, w)),
                        ))
                    }
                },
                var => (var, Value::Nil),
            };
            names.push(self.assignable(w, var, form)?);
            inits.push(init);
        }
        Ok((names, inits))
    }

    // ========================================================================
    // and, or
    // ========================================================================

    /// `(and a b c)` is `(if a (if b c nil) nil)`.
    fn compile_and(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let items = self.arg_vec(w, args)?;
        let Some((&last, init)) = items.split_last() else {
            return emit(w, Opcode::Ldc, &[Value::True], cont);
        };
        let mut form = last;
        for &test in init.iter().rev() {
            form = w.heap.list(&[Value::Symbol(sym::IF), test, form, Value::Nil])?;
        }
        self.compile(m, w, form, env, cont)
    }

    /// `(or a . rest)` binds a fresh special variable g to a, then runs
    /// `(if g g (or . rest))` and unbinds g, so a is evaluated once.
    fn compile_or(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        args: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        let items = self.arg_vec(w, args)?;
        match items.as_slice() {
            [] => return emit(w, Opcode::Ldc, &[Value::Nil], cont),
            [only] => return self.compile(m, w, *only, env, cont),
            _ => {}
        }
        let g = w.symbols.gensym("or");
        w.symbols.declare_special(g)?;
        let var = Value::Symbol(g);

        let rest = w.heap.cdr_val(args)?;
        let rest_or = w.heap.cons(Value::Symbol(sym::OR), rest)?;
        let test = w.heap.list(&[Value::Symbol(sym::IF), var, var, rest_or])?;

        let unbind = emit(w, Opcode::Unbind, &[var], cont)?;
        let code = self.compile(m, w, test, env, unbind)?;
        let code = emit(w, Opcode::Bind, &[var], code)?;
        self.compile(m, w, items[0], env, code)
    }

    // ========================================================================
    // Block and tag scopes
    // ========================================================================

    /// Compile `body` as the body of block `name`; `cont` already starts
    /// with the block's BLOCKEND.
    pub(crate) fn compile_in_block(
        &mut self,
        m: &mut Machine,
        w: &mut World,
        name: Value,
        body: Value,
        env: &LexEnv,
        cont: Value,
    ) -> LispResult<Value> {
        self.blocks.push(BlockScope {
            name,
            lambda_depth: self.lambda_depth,
            captured: false,
            tail_calls: Vec::new(),
        });
        let result = self.compile_body(m, w, body, env, cont);
        if let Some(scope) = self.blocks.pop() {
            for index in scope.tail_calls {
                let pending = &mut self.pending_tails[index];
                pending.blocked |= scope.captured;
                pending.open_scopes -= 1;
                if pending.open_scopes == 0 && !pending.blocked {
                    w.heap.set_car(pending.cell, Value::Op(Opcode::TAp));
                }
            }
        }
        result
    }

    /// Note a `return-from name`; false when no such block is in scope.
    pub(crate) fn target_block(&mut self, name: Value) -> bool {
        let depth = self.lambda_depth;
        match self.blocks.iter_mut().rev().find(|scope| scope.name == name) {
            Some(scope) => {
                if scope.lambda_depth < depth {
                    scope.captured = true;
                }
                true
            }
            None => false,
        }
    }

    /// Compile forms with the tags of tagbody `id` in scope.
    pub(crate) fn with_tags<T>(
        &mut self,
        id: Value,
        tags: Vec<Value>,
        f: impl FnOnce(&mut Self) -> LispResult<T>,
    ) -> LispResult<T> {
        self.tags.push(TagScope { id, tags });
        let result = f(self);
        self.tags.pop();
        result
    }

    /// The id of the innermost tagbody defining `tag`.
    pub(crate) fn target_tag(&self, tag: Value) -> Option<Value> {
        self.tags
            .iter()
            .rev()
            .find(|scope| scope.tags.contains(&tag))
            .map(|scope| scope.id)
    }
}

// ============================================================================
// Lambda lists
// ============================================================================

/// Parse `(a b &rest c)`, `(a b &body c)` or `(a b . c)` into parameter
/// names and the index of the rest parameter.
pub(crate) fn parse_lambda_list(
    w: &World,
    params: Value,
    form: &str,
) -> LispResult<(Vec<SymbolId>, Option<usize>)> {
    let mut names = Vec::new();
    let mut rest = None;
    let mut current = params;
    let malformed = || {
        LispError::invalid_form(form, format!("malformed parameter list {}", print_val(params, w)))
    };
    loop {
        match current {
            Value::Nil => break,
            Value::Pair(id) => {
                let item = w.heap.car(id);
                current = w.heap.cdr(id);
                let name = item.as_symbol().ok_or_else(malformed)?;
                if name == sym::AMP_REST || name == sym::AMP_BODY {
                    let tail = w.heap.list_to_vec(current).ok_or_else(malformed)?;
                    let [var] = tail.as_slice() else {
                        return Err(malformed());
                    };
                    names.push(parameter(w, *var, form)?);
                    rest = Some(names.len() - 1);
                    break;
                }
                names.push(parameter(w, item, form)?);
            }
            dotted => {
                names.push(parameter(w, dotted, form)?);
                rest = Some(names.len() - 1);
                break;
            }
        }
    }
    Ok((names, rest))
}

fn parameter(w: &World, var: Value, form: &str) -> LispResult<SymbolId> {
    let id = var.as_symbol().ok_or_else(|| {
        LispError::invalid_form(form, format!("{} is not a parameter name", print_val(var, w)))
    })?;
    if w.symbols.is_constant(id) {
        return Err(LispError::ConstantRedefinition(w.symbols.name(id).to_string()));
    }
    if id == sym::AMP_REST || id == sym::AMP_BODY {
        return Err(LispError::invalid_form(form, "misplaced lambda-list keyword"));
    }
    Ok(id)
}

pub(crate) fn lambda_arity(names: &[SymbolId], rest: Option<usize>) -> Arity {
    match rest {
        Some(_) => Arity::at_least(names.len() - 1),
        None => Arity::exactly(names.len()),
    }
}

// ============================================================================
// Macro expansion
// ============================================================================

/// Run a macro's expander on the unevaluated argument forms.
pub fn expand_macro(m: &mut Machine, w: &mut World, fid: FunctionId, args: Value) -> LispResult<Value> {
    let name = w.function_name(fid);
    let macro_fn = w.function(fid);
    let (arity, expander) = (macro_fn.arity, macro_fn.expander);
    let expander = expander.ok_or_else(|| LispError::fatal(format!("macro {} has no expander", name)))?;
    let argv = w
        .heap
        .list_to_vec(args)
        .ok_or_else(|| LispError::invalid_form(&name, "dotted argument list"))?;
    arity.check(&name, argv.len())?;
    let closure = w.heap.alloc(Value::Function(expander), Value::Nil)?;
    m.apply(w, Value::Closure(closure), &argv)
}

/// Expand `form` once if it is a macro call. The flag reports whether an
/// expansion happened.
pub fn macroexpand_1(m: &mut Machine, w: &mut World, form: Value) -> LispResult<(Value, bool)> {
    let Value::Pair(id) = form else {
        return Ok((form, false));
    };
    let Value::Symbol(head) = w.heap.car(id) else {
        return Ok((form, false));
    };
    match w.symbols.function(head) {
        FunctionCell::Function(fid) if w.function(fid).is_macro() => {
            let args = w.heap.cdr(id);
            Ok((expand_macro(m, w, fid, args)?, true))
        }
        _ => Ok((form, false)),
    }
}

/// Expand `form` until its head is no longer a macro.
pub fn macroexpand(m: &mut Machine, w: &mut World, form: Value) -> LispResult<Value> {
    let mut form = form;
    loop {
        let (expansion, expanded) = macroexpand_1(m, w, form)?;
        if !expanded {
            return Ok(expansion);
        }
        form = expansion;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reader::Reader;

    fn setup() -> (Compiler, Machine, World) {
        let config = Config {
            prelude: false,
            ..Config::default()
        };
        (Compiler::new(), Machine::default(), World::new(&config).unwrap())
    }

    fn read(w: &mut World, src: &str) -> Value {
        let mut reader = Reader::new(src, &mut w.heap, &mut w.symbols);
        reader.read().unwrap().unwrap()
    }

    fn compile_str(c: &mut Compiler, m: &mut Machine, w: &mut World, src: &str) -> LispResult<String> {
        let form = read(w, src);
        let code = c.compile_toplevel(m, w, form)?;
        Ok(print_val(code, w))
    }

    fn run_str(c: &mut Compiler, m: &mut Machine, w: &mut World, src: &str) -> LispResult<Value> {
        let form = read(w, src);
        let code = c.compile_toplevel(m, w, form)?;
        m.execute(w, code, &[])
    }

    #[test]
    fn constants_and_globals() {
        let (mut c, mut m, mut w) = setup();
        assert_eq!(compile_str(&mut c, &mut m, &mut w, "5").unwrap(), "(LDC 5 STOP)");
        assert_eq!(compile_str(&mut c, &mut m, &mut w, ":key").unwrap(), "(LDC :key STOP)");
        assert_eq!(compile_str(&mut c, &mut m, &mut w, "'(a b)").unwrap(), "(LDC (a b) STOP)");
        assert_eq!(compile_str(&mut c, &mut m, &mut w, "zz").unwrap(), "(LDG zz STOP)");
        assert_eq!(c.warnings.len(), 1);
    }

    #[test]
    fn inline_primitive_call_shape() {
        let (mut c, mut m, mut w) = setup();
        assert_eq!(
            compile_str(&mut c, &mut m, &mut w, "(+ 1 2)").unwrap(),
            "(LDC 1 LDC 2 CALLP #<primitive +> 2 STOP)"
        );
    }

    #[test]
    fn if_uses_sel_outside_tail_position() {
        let (mut c, mut m, mut w) = setup();
        assert_eq!(
            compile_str(&mut c, &mut m, &mut w, "(car (if t 1 2))").unwrap(),
            "(LDC t SEL (LDC 1 JOIN) (LDC 2 JOIN) CALLP #<primitive car> 1 STOP)"
        );
        assert_eq!(
            compile_str(&mut c, &mut m, &mut w, "(if t 1 2)").unwrap(),
            "(LDC t TSEL (LDC 1 STOP) (LDC 2 STOP))"
        );
    }

    #[test]
    fn lambda_body_locals_and_tail_calls() {
        let (mut c, mut m, mut w) = setup();
        run_str(&mut c, &mut m, &mut w, "(defun f (x) x)").unwrap();
        run_str(&mut c, &mut m, &mut w, "(defun g (a &rest more) (f more))").unwrap();
        let g = w.symbols.lookup("g").unwrap();
        let FunctionCell::Function(fid) = w.symbols.function(g) else {
            panic!("g is not defined");
        };
        assert_eq!(
            print_val(w.function(fid).code, &w),
            "(BLOCK g GFN f LDR 0 1 TAP 1 BLOCKEND g RTN)"
        );
    }

    #[test]
    fn let_binds_a_frame() {
        let (mut c, mut m, mut w) = setup();
        assert_eq!(run_str(&mut c, &mut m, &mut w, "(let ((x 1) (y 2)) (+ x y))").unwrap(), Value::Int(3));
        assert_eq!(run_str(&mut c, &mut m, &mut w, "(let* ((x 1) (y (+ x 1))) y)").unwrap(), Value::Int(2));
        assert_eq!(run_str(&mut c, &mut m, &mut w, "(let () 7)").unwrap(), Value::Int(7));
    }

    #[test]
    fn undefined_function_is_a_compile_error() {
        let (mut c, mut m, mut w) = setup();
        assert!(matches!(
            compile_str(&mut c, &mut m, &mut w, "(nope 1)"),
            Err(LispError::UndefinedFunction(name)) if name == "nope"
        ));
    }

    #[test]
    fn primitive_arity_is_checked_at_compile_time() {
        let (mut c, mut m, mut w) = setup();
        assert!(matches!(
            compile_str(&mut c, &mut m, &mut w, "(car 1 2)"),
            Err(LispError::ArgCount { min: 1, max: Some(1), actual: 2, .. })
        ));
    }

    #[test]
    fn failed_definition_restores_the_previous_function() {
        let (mut c, mut m, mut w) = setup();
        run_str(&mut c, &mut m, &mut w, "(defun h () 1)").unwrap();
        assert!(run_str(&mut c, &mut m, &mut w, "(defun h () (undefined-thing))").is_err());
        assert_eq!(run_str(&mut c, &mut m, &mut w, "(h)").unwrap(), Value::Int(1));

        assert!(run_str(&mut c, &mut m, &mut w, "(defun k () (missing))").is_err());
        let k = w.symbols.lookup("k").unwrap();
        assert_eq!(w.symbols.function(k), FunctionCell::Unbound);
    }

    #[test]
    fn special_forms_cannot_be_redefined() {
        let (mut c, mut m, mut w) = setup();
        assert!(matches!(
            compile_str(&mut c, &mut m, &mut w, "(defun if (x) x)"),
            Err(LispError::InvalidForm { .. })
        ));
        assert!(matches!(
            compile_str(&mut c, &mut m, &mut w, "(defun t (x) x)"),
            Err(LispError::ConstantRedefinition(_))
        ));
    }

    #[test]
    fn malformed_lambda_lists_are_rejected() {
        let (mut c, mut m, mut w) = setup();
        assert!(compile_str(&mut c, &mut m, &mut w, "(lambda (&rest) 1)").is_err());
        assert!(compile_str(&mut c, &mut m, &mut w, "(lambda (a &rest b c) 1)").is_err());
        assert!(compile_str(&mut c, &mut m, &mut w, "(lambda (1) 1)").is_err());
    }

    #[test]
    fn captured_block_keeps_its_tail_call_non_tail() {
        let (mut c, mut m, mut w) = setup();
        run_str(&mut c, &mut m, &mut w, "(defun call (f) (funcall f))").unwrap();
        run_str(
            &mut c,
            &mut m,
            &mut w,
            "(defun escape () (block out (call (lambda () (return-from out 42)))))",
        )
        .unwrap();
        let escape = w.symbols.lookup("escape").unwrap();
        let FunctionCell::Function(fid) = w.symbols.function(escape) else {
            panic!("escape is not defined");
        };
        let code = print_val(w.function(fid).code, &w);
        assert!(code.contains("AP 1 BLOCKEND out"), "{}", code);
        assert_eq!(run_str(&mut c, &mut m, &mut w, "(escape)").unwrap(), Value::Int(42));
    }
}
