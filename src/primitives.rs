use std::collections::HashMap;

use rand::Rng;

use crate::compiler::{self, Compiler};
use crate::error::{LispError, LispResult};
use crate::function::{Arity, FunctionCell};
use crate::lexenv::LexEnv;
use crate::machine::Machine;
use crate::printer::print_val;
use crate::symbol::SymbolTable;
use crate::value::{PrimId, SymbolId, Value};
use crate::world::World;

/// Execution hook: pops `argc` arguments off S and pushes one result (or
/// transfers control to a function that will).
pub type ExecFn = fn(&mut Machine, &mut World, usize) -> LispResult<()>;

/// Code generation hook: receives the argument forms, the lexical
/// environment and the continuation, returns the call's code prepended to
/// the continuation.
pub type CodegenFn =
    fn(&mut Compiler, &mut Machine, &mut World, Value, &LexEnv, Value) -> LispResult<Value>;

/// A builtin operator.
#[derive(Clone, Copy)]
pub struct Primitive {
    pub name: SymbolId,
    pub arity: Arity,
    /// Called with CALLP rather than through a closure-style AP.
    pub inline: bool,
    /// Replaces the default argument-evaluating code generation.
    pub codegen: Option<CodegenFn>,
    /// None for operators that only exist at compile time.
    pub exec: Option<ExecFn>,
}

/// A primitive to be registered.
#[derive(Clone, Copy)]
pub struct PrimitiveDef {
    pub name: &'static str,
    pub arity: Arity,
    pub inline: bool,
    pub codegen: Option<CodegenFn>,
    pub exec: Option<ExecFn>,
}

impl PrimitiveDef {
    /// An inline operator with the default code generation.
    pub const fn inline(name: &'static str, arity: Arity, exec: ExecFn) -> Self {
        PrimitiveDef {
            name,
            arity,
            inline: true,
            codegen: None,
            exec: Some(exec),
        }
    }

    /// An operator called like a function value: `LDC prim, args, AP n`.
    pub const fn called(name: &'static str, arity: Arity, exec: ExecFn) -> Self {
        PrimitiveDef {
            name,
            arity,
            inline: false,
            codegen: None,
            exec: Some(exec),
        }
    }

    /// A compile-time operator with its own code generation.
    pub const fn special(name: &'static str, arity: Arity, codegen: CodegenFn) -> Self {
        PrimitiveDef {
            name,
            arity,
            inline: true,
            codegen: Some(codegen),
            exec: None,
        }
    }
}

/// Maps operator names to their descriptors.
#[derive(Default)]
pub struct PrimitiveRegistry {
    prims: Vec<Primitive>,
    by_name: HashMap<SymbolId, PrimId>,
}

impl PrimitiveRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern the operator's name in `symbols` and make the primitive its
    /// function. Re-registering a name replaces the earlier descriptor.
    pub fn register(&mut self, symbols: &mut SymbolTable, def: PrimitiveDef) -> LispResult<PrimId> {
        let name = symbols.intern(def.name);
        if symbols.is_constant(name) || symbols.is_special_form(name) {
            return Err(LispError::ConstantRedefinition(def.name.to_string()));
        }
        let prim = Primitive {
            name,
            arity: def.arity,
            inline: def.inline,
            codegen: def.codegen,
            exec: def.exec,
        };
        let id = match self.by_name.get(&name) {
            Some(&id) => {
                self.prims[id.0 as usize] = prim;
                id
            }
            None => {
                let id = PrimId(self.prims.len() as u32);
                self.prims.push(prim);
                self.by_name.insert(name, id);
                id
            }
        };
        symbols.set_function(name, FunctionCell::Primitive(id))?;
        Ok(id)
    }

    pub fn lookup(&self, name: SymbolId) -> Option<&Primitive> {
        self.by_name.get(&name).map(|id| self.get(*id))
    }

    pub fn get(&self, id: PrimId) -> &Primitive {
        &self.prims[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.prims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prims.is_empty()
    }
}

/// Register the list, arithmetic and reflection library.
pub fn install(w: &mut World) -> LispResult<()> {
    use PrimitiveDef as P;
    let defs = [
        // Pairs and lists
        P::inline("cons", Arity::exactly(2), prim_cons),
        P::inline("car", Arity::exactly(1), prim_car),
        P::inline("cdr", Arity::exactly(1), prim_cdr),
        P::inline("rplaca", Arity::exactly(2), prim_rplaca),
        P::inline("rplacd", Arity::exactly(2), prim_rplacd),
        P::inline("list", Arity::at_least(0), prim_list),
        P::inline("list*", Arity::at_least(1), prim_list_star),
        P::inline("append", Arity::at_least(0), prim_append),
        P::inline("length", Arity::exactly(1), prim_length),
        P::inline("reverse", Arity::exactly(1), prim_reverse),
        // Equality and type predicates
        P::inline("eq", Arity::exactly(2), prim_eq),
        P::inline("eql", Arity::exactly(2), prim_eq),
        P::inline("equal", Arity::exactly(2), prim_equal),
        P::inline("atom", Arity::exactly(1), prim_atom),
        P::inline("consp", Arity::exactly(1), prim_consp),
        P::inline("listp", Arity::exactly(1), prim_listp),
        P::inline("symbolp", Arity::exactly(1), prim_symbolp),
        P::inline("numberp", Arity::exactly(1), prim_numberp),
        P::inline("functionp", Arity::exactly(1), prim_functionp),
        P::inline("null", Arity::exactly(1), prim_null),
        P::inline("not", Arity::exactly(1), prim_null),
        // Fixnum arithmetic
        P::inline("+", Arity::at_least(0), prim_add),
        P::inline("-", Arity::at_least(1), prim_sub),
        P::inline("*", Arity::at_least(0), prim_mul),
        P::inline("mod", Arity::exactly(2), prim_mod),
        P::inline("1+", Arity::exactly(1), prim_inc),
        P::inline("1-", Arity::exactly(1), prim_dec),
        P::inline("=", Arity::at_least(1), prim_num_eq),
        P::inline("/=", Arity::at_least(1), prim_num_ne),
        P::inline("<", Arity::at_least(1), prim_lt),
        P::inline(">", Arity::at_least(1), prim_gt),
        P::inline("<=", Arity::at_least(1), prim_le),
        P::inline(">=", Arity::at_least(1), prim_ge),
        P::inline("zerop", Arity::exactly(1), prim_zerop),
        P::inline("min", Arity::at_least(1), prim_min),
        P::inline("max", Arity::at_least(1), prim_max),
        P::inline("abs", Arity::exactly(1), prim_abs),
        P::inline("random", Arity::exactly(1), prim_random),
        // Output and errors
        P::inline("print", Arity::exactly(1), prim_print),
        P::inline("error", Arity::at_least(1), prim_error),
        // Calling
        P::inline("funcall", Arity::at_least(1), prim_funcall),
        P::inline("apply", Arity::at_least(2), prim_apply),
        // Symbols
        P::inline("symbol-value", Arity::exactly(1), prim_symbol_value),
        P::inline("set", Arity::exactly(2), prim_set),
        P::inline("symbol-function", Arity::exactly(1), prim_symbol_function),
        P::inline("fboundp", Arity::exactly(1), prim_fboundp),
        P::inline("boundp", Arity::exactly(1), prim_boundp),
        P::inline("gensym", Arity::range(0, 1), prim_gensym),
        // The compiler at run time
        P::called("macroexpand-1", Arity::exactly(1), prim_macroexpand_1),
        P::called("macroexpand", Arity::exactly(1), prim_macroexpand),
        P::called("eval", Arity::exactly(1), prim_eval),
    ];
    for def in defs {
        w.primitives.register(&mut w.symbols, def)?;
    }
    Ok(())
}

// ============================================================================
// Argument helpers
// ============================================================================

/// Pop exactly `N` arguments, first argument first.
fn take<const N: usize>(m: &mut Machine) -> LispResult<[Value; N]> {
    let args = m.pop_n(N)?;
    args.try_into()
        .map_err(|_| LispError::fatal("primitive argument count mismatch"))
}

fn int_arg(val: Value, op: &str, w: &World) -> LispResult<i64> {
    val.as_int().ok_or_else(|| {
        LispError::type_error(format!("{}: {} is not an integer", op, print_val(val, w)))
    })
}

fn int_args(args: &[Value], op: &str, w: &World) -> LispResult<Vec<i64>> {
    args.iter().map(|&v| int_arg(v, op, w)).collect()
}

fn symbol_arg(val: Value, op: &str, w: &World) -> LispResult<SymbolId> {
    val.as_symbol().ok_or_else(|| {
        LispError::type_error(format!("{}: {} is not a symbol", op, print_val(val, w)))
    })
}

fn pair_arg(val: Value, op: &str, w: &World) -> LispResult<crate::value::PairId> {
    val.as_pair().ok_or_else(|| {
        LispError::type_error(format!("{}: {} is not a cons", op, print_val(val, w)))
    })
}

fn list_arg(val: Value, op: &str, w: &World) -> LispResult<Vec<Value>> {
    w.heap.list_to_vec(val).ok_or_else(|| {
        LispError::type_error(format!("{}: {} is not a proper list", op, print_val(val, w)))
    })
}

fn overflow(op: &str) -> LispError {
    LispError::Arithmetic(format!("{}: fixnum overflow", op))
}

// ============================================================================
// Pairs and lists
// ============================================================================

fn prim_cons(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [a, b] = take::<2>(m)?;
    let pair = w.heap.cons(a, b)?;
    m.push(pair);
    Ok(())
}

fn prim_car(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(w.heap.car_val(x)?);
    Ok(())
}

fn prim_cdr(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(w.heap.cdr_val(x)?);
    Ok(())
}

fn prim_rplaca(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x, val] = take::<2>(m)?;
    let id = pair_arg(x, "rplaca", w)?;
    w.heap.set_car(id, val);
    m.push(x);
    Ok(())
}

fn prim_rplacd(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x, val] = take::<2>(m)?;
    let id = pair_arg(x, "rplacd", w)?;
    w.heap.set_cdr(id, val);
    m.push(x);
    Ok(())
}

fn prim_list(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    m.push(w.heap.list(&args)?);
    Ok(())
}

/// (list* a b ... tail)
fn prim_list_star(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let mut args = m.pop_n(argc)?;
    let tail = args.pop().unwrap_or(Value::Nil);
    m.push(w.heap.list_with_tail(&args, tail)?);
    Ok(())
}

/// Copies every argument but the last, which is shared.
fn prim_append(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let mut args = m.pop_n(argc)?;
    let mut result = args.pop().unwrap_or(Value::Nil);
    for &list in args.iter().rev() {
        let items = list_arg(list, "append", w)?;
        result = w.heap.list_with_tail(&items, result)?;
    }
    m.push(result);
    Ok(())
}

fn prim_length(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let len = w.heap.list_len(x).ok_or_else(|| {
        LispError::type_error(format!("length: {} is not a proper list", print_val(x, w)))
    })?;
    m.push(Value::Int(len as i64));
    Ok(())
}

fn prim_reverse(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let mut items = list_arg(x, "reverse", w)?;
    items.reverse();
    m.push(w.heap.list(&items)?);
    Ok(())
}

// ============================================================================
// Predicates
// ============================================================================

fn prim_eq(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [a, b] = take::<2>(m)?;
    m.push(Value::from_bool(a.eq(b)));
    Ok(())
}

fn prim_equal(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [a, b] = take::<2>(m)?;
    m.push(Value::from_bool(w.heap.equal(a, b)));
    Ok(())
}

fn prim_atom(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(Value::from_bool(x.is_atom()));
    Ok(())
}

fn prim_consp(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(Value::from_bool(x.is_pair()));
    Ok(())
}

fn prim_listp(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(Value::from_bool(x.is_list()));
    Ok(())
}

fn prim_symbolp(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(Value::from_bool(x.is_symbol()));
    Ok(())
}

fn prim_numberp(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(Value::from_bool(x.is_int()));
    Ok(())
}

fn prim_functionp(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let callable = match x {
        Value::Function(fid) => !w.function(fid).is_macro(),
        other => other.is_callable(),
    };
    m.push(Value::from_bool(callable));
    Ok(())
}

fn prim_null(m: &mut Machine, _w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    m.push(Value::from_bool(x.is_nil()));
    Ok(())
}

// ============================================================================
// Arithmetic
// ============================================================================

fn prim_add(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let mut sum: i64 = 0;
    for n in int_args(&args, "+", w)? {
        sum = sum.checked_add(n).ok_or_else(|| overflow("+"))?;
    }
    m.push(Value::Int(sum));
    Ok(())
}

/// (- x) negates; (- x y ...) subtracts from x.
fn prim_sub(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let nums = int_args(&args, "-", w)?;
    let result = match nums.split_first() {
        Some((&first, [])) => first.checked_neg().ok_or_else(|| overflow("-"))?,
        Some((&first, rest)) => {
            let mut acc = first;
            for &n in rest {
                acc = acc.checked_sub(n).ok_or_else(|| overflow("-"))?;
            }
            acc
        }
        None => 0,
    };
    m.push(Value::Int(result));
    Ok(())
}

fn prim_mul(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let mut product: i64 = 1;
    for n in int_args(&args, "*", w)? {
        product = product.checked_mul(n).ok_or_else(|| overflow("*"))?;
    }
    m.push(Value::Int(product));
    Ok(())
}

/// Result takes the sign of the divisor.
fn prim_mod(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [a, b] = take::<2>(m)?;
    let (a, b) = (int_arg(a, "mod", w)?, int_arg(b, "mod", w)?);
    if b == 0 {
        return Err(LispError::Arithmetic("mod: division by zero".into()));
    }
    let r = a.checked_rem(b).ok_or_else(|| overflow("mod"))?;
    let r = if r != 0 && (r < 0) != (b < 0) { r + b } else { r };
    m.push(Value::Int(r));
    Ok(())
}

fn prim_inc(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let n = int_arg(x, "1+", w)?;
    m.push(Value::Int(n.checked_add(1).ok_or_else(|| overflow("1+"))?));
    Ok(())
}

fn prim_dec(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let n = int_arg(x, "1-", w)?;
    m.push(Value::Int(n.checked_sub(1).ok_or_else(|| overflow("1-"))?));
    Ok(())
}

/// Shared body of the chained comparisons: true when `holds` is true for
/// every adjacent pair.
fn compare_chain(
    m: &mut Machine,
    w: &World,
    argc: usize,
    op: &str,
    holds: fn(i64, i64) -> bool,
) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let nums = int_args(&args, op, w)?;
    let result = nums.windows(2).all(|pair| holds(pair[0], pair[1]));
    m.push(Value::from_bool(result));
    Ok(())
}

fn prim_num_eq(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    compare_chain(m, w, argc, "=", |a, b| a == b)
}

/// True when no two arguments are equal.
fn prim_num_ne(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let nums = int_args(&args, "/=", w)?;
    let distinct = nums
        .iter()
        .enumerate()
        .all(|(i, a)| nums[i + 1..].iter().all(|b| a != b));
    m.push(Value::from_bool(distinct));
    Ok(())
}

fn prim_lt(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    compare_chain(m, w, argc, "<", |a, b| a < b)
}

fn prim_gt(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    compare_chain(m, w, argc, ">", |a, b| a > b)
}

fn prim_le(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    compare_chain(m, w, argc, "<=", |a, b| a <= b)
}

fn prim_ge(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    compare_chain(m, w, argc, ">=", |a, b| a >= b)
}

fn prim_zerop(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let n = int_arg(x, "zerop", w)?;
    m.push(Value::from_bool(n == 0));
    Ok(())
}

fn prim_min(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let nums = int_args(&args, "min", w)?;
    let least = nums.into_iter().min().unwrap_or(0);
    m.push(Value::Int(least));
    Ok(())
}

fn prim_max(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let nums = int_args(&args, "max", w)?;
    let greatest = nums.into_iter().max().unwrap_or(0);
    m.push(Value::Int(greatest));
    Ok(())
}

fn prim_abs(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let n = int_arg(x, "abs", w)?;
    m.push(Value::Int(n.checked_abs().ok_or_else(|| overflow("abs"))?));
    Ok(())
}

/// (random n): an integer in [0, n).
fn prim_random(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let limit = int_arg(x, "random", w)?;
    if limit <= 0 {
        return Err(LispError::type_error(format!(
            "random: limit must be positive, got {}",
            limit
        )));
    }
    let mut rng = rand::thread_rng();
    m.push(Value::Int(rng.gen_range(0..limit)));
    Ok(())
}

// ============================================================================
// Output and errors
// ============================================================================

/// Write the value and a newline to the output buffer; returns the value.
fn prim_print(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let text = print_val(x, w);
    w.output.push_str(&text);
    w.output.push('\n');
    m.push(x);
    Ok(())
}

/// (error 'reason args...): the arguments are printed into the message.
fn prim_error(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let message = args
        .iter()
        .map(|&v| print_val(v, w))
        .collect::<Vec<_>>()
        .join(" ");
    Err(LispError::User(message))
}

// ============================================================================
// Calling
// ============================================================================

/// (funcall f args...): S already holds f below its arguments, exactly as
/// AP expects.
fn prim_funcall(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let mode = m.continuation_mode(w);
    m.call(w, argc - 1, mode)
}

/// (apply f a b list): spread the final list onto S, then call.
fn prim_apply(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let spread = m.pop()?;
    let items = list_arg(spread, "apply", w)?;
    let count = argc - 2 + items.len();
    for item in items {
        m.push(item);
    }
    let mode = m.continuation_mode(w);
    m.call(w, count, mode)
}

// ============================================================================
// Symbols
// ============================================================================

fn prim_symbol_value(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let name = symbol_arg(x, "symbol-value", w)?;
    m.push(w.symbols.value(name)?);
    Ok(())
}

fn prim_set(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x, val] = take::<2>(m)?;
    let name = symbol_arg(x, "set", w)?;
    w.symbols.set_value(name, val)?;
    m.push(val);
    Ok(())
}

fn prim_symbol_function(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let name = symbol_arg(x, "symbol-function", w)?;
    m.push(w.symbols.function_value(name)?);
    Ok(())
}

fn prim_fboundp(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let name = symbol_arg(x, "fboundp", w)?;
    let bound = matches!(
        w.symbols.function(name),
        FunctionCell::Function(_) | FunctionCell::Primitive(_)
    );
    m.push(Value::from_bool(bound));
    Ok(())
}

fn prim_boundp(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [x] = take::<1>(m)?;
    let name = symbol_arg(x, "boundp", w)?;
    m.push(Value::from_bool(w.symbols.is_bound(name)));
    Ok(())
}

/// (gensym) or (gensym 'prefix)
fn prim_gensym(m: &mut Machine, w: &mut World, argc: usize) -> LispResult<()> {
    let args = m.pop_n(argc)?;
    let prefix = match args.first() {
        Some(&v) => w.symbols.name(symbol_arg(v, "gensym", w)?).to_string(),
        None => "g".to_string(),
    };
    let id = w.symbols.gensym(&prefix);
    m.push(Value::Symbol(id));
    Ok(())
}

// ============================================================================
// The compiler at run time
// ============================================================================

fn prim_macroexpand_1(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [form] = take::<1>(m)?;
    let (expansion, _) = compiler::macroexpand_1(m, w, form)?;
    m.push(expansion);
    Ok(())
}

fn prim_macroexpand(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [form] = take::<1>(m)?;
    let expansion = compiler::macroexpand(m, w, form)?;
    m.push(expansion);
    Ok(())
}

/// Compile the form as a top-level form and run it in a nested execution.
fn prim_eval(m: &mut Machine, w: &mut World, _argc: usize) -> LispResult<()> {
    let [form] = take::<1>(m)?;
    let mut compiler = Compiler::new();
    let code = compiler.compile_toplevel(m, w, form)?;
    let result = m.execute(w, code, &[])?;
    m.push(result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn run(w: &mut World, name: &str, args: &[Value]) -> LispResult<Value> {
        let mut m = Machine::default();
        let f = w.symbols.function_value(w.symbols.lookup(name).unwrap())?;
        m.apply(w, f, args)
    }

    #[test]
    fn arithmetic_checks_overflow() {
        let mut w = World::new(&Config::default()).unwrap();
        assert_eq!(
            run(&mut w, "+", &[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Int(6)
        );
        assert_eq!(run(&mut w, "-", &[Value::Int(5)]).unwrap(), Value::Int(-5));
        assert!(matches!(
            run(&mut w, "+", &[Value::Int(i64::MAX), Value::Int(1)]),
            Err(LispError::Arithmetic(_))
        ));
        assert!(matches!(
            run(&mut w, "mod", &[Value::Int(1), Value::Int(0)]),
            Err(LispError::Arithmetic(_))
        ));
        assert_eq!(run(&mut w, "mod", &[Value::Int(-7), Value::Int(3)]).unwrap(), Value::Int(2));
    }

    #[test]
    fn comparisons_chain() {
        let mut w = World::new(&Config::default()).unwrap();
        let ints = [Value::Int(1), Value::Int(2), Value::Int(3)];
        assert_eq!(run(&mut w, "<", &ints).unwrap(), Value::True);
        assert_eq!(run(&mut w, ">", &ints).unwrap(), Value::Nil);
        assert_eq!(
            run(&mut w, "/=", &[Value::Int(1), Value::Int(2), Value::Int(1)]).unwrap(),
            Value::Nil
        );
    }

    #[test]
    fn type_errors_name_the_operator() {
        let mut w = World::new(&Config::default()).unwrap();
        match run(&mut w, "car", &[Value::Int(1)]) {
            Err(LispError::TypeError(msg)) => assert!(msg.contains("car")),
            other => panic!("expected a type error, got {:?}", other),
        }
    }

    #[test]
    fn register_refuses_constants_and_special_forms() {
        let mut w = World::new(&Config::default()).unwrap();
        let def = PrimitiveDef::inline("t", Arity::exactly(1), prim_car);
        assert!(matches!(
            w.primitives.register(&mut w.symbols, def),
            Err(LispError::ConstantRedefinition(_))
        ));
        let def = PrimitiveDef::inline("if", Arity::exactly(1), prim_car);
        assert!(w.primitives.register(&mut w.symbols, def).is_err());
    }

    #[test]
    fn registered_primitive_is_callable() {
        let mut w = World::new(&Config::default()).unwrap();
        let def = PrimitiveDef::inline("second", Arity::exactly(1), |m, w, _| {
            let [x] = take::<1>(m)?;
            let rest = w.heap.cdr_val(x)?;
            m.push(w.heap.car_val(rest)?);
            Ok(())
        });
        w.primitives.register(&mut w.symbols, def).unwrap();
        let list = w.heap.list(&[Value::Int(1), Value::Int(2)]).unwrap();
        assert_eq!(run(&mut w, "second", &[list]).unwrap(), Value::Int(2));
        assert!(w.primitives.lookup(w.symbols.lookup("second").unwrap()).is_some());
    }
}
