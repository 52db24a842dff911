//! Operators that exist only at compile time: their code generation hooks
//! emit block, tagbody and definition code directly.

use crate::compiler::{emit, Compiler};
use crate::error::{LispError, LispResult};
use crate::function::{Arity, FunctionCell};
use crate::lexenv::LexEnv;
use crate::machine::Machine;
use crate::opcode::Opcode;
use crate::primitives::PrimitiveDef;
use crate::printer::print_val;
use crate::symbol::sym;
use crate::value::{SymbolId, Value};
use crate::world::World;

pub fn install(w: &mut World) -> LispResult<()> {
    use PrimitiveDef as P;
    let defs = [
        P::special("function", Arity::exactly(1), gen_function),
        P::special("block", Arity::at_least(1), gen_block),
        P::special("return-from", Arity::range(1, 2), gen_return_from),
        P::special("return", Arity::range(0, 1), gen_return),
        P::special("tagbody", Arity::at_least(0), gen_tagbody),
        P::special("go", Arity::exactly(1), gen_go),
        P::special("defvar", Arity::range(1, 2), gen_defvar),
        P::special("defparameter", Arity::exactly(2), gen_defparameter),
    ];
    for def in defs {
        w.primitives.register(&mut w.symbols, def)?;
    }
    Ok(())
}

fn arg_list(w: &World, args: Value) -> Vec<Value> {
    w.heap.list_to_vec(args).unwrap_or_default()
}

/// `#'name` loads the function cell; `#'(lambda ...)` builds a closure.
fn gen_function(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let target = w.heap.car_val(args)?;
    if let Value::Pair(id) = target {
        if w.heap.car(id) == Value::Symbol(sym::LAMBDA) {
            let lambda_args = w.heap.cdr(id);
            return c.compile_lambda(m, w, lambda_args, env, cont);
        }
    }
    let name = target.as_symbol().ok_or_else(|| {
        LispError::invalid_form("function", format!("{} is not a function name", print_val(target, w)))
    })?;
    if w.symbols.is_special_form(name) {
        return Err(LispError::invalid_form(
            "function",
            format!("{} is a special form", w.symbols.name(name)),
        ));
    }
    match w.symbols.function(name) {
        FunctionCell::Function(fid) if w.function(fid).is_macro() => Err(LispError::invalid_form(
            "function",
            format!("{} is a macro", w.symbols.name(name)),
        )),
        FunctionCell::Pending { is_macro: true, .. } => Err(LispError::invalid_form(
            "function",
            format!("{} is a macro", w.symbols.name(name)),
        )),
        FunctionCell::Primitive(pid) if w.primitives.get(pid).exec.is_none() => {
            Err(LispError::invalid_form(
                "function",
                format!("{} is a special operator", w.symbols.name(name)),
            ))
        }
        _ => emit(w, Opcode::Gfn, &[Value::Symbol(name)], cont),
    }
}

fn block_name(w: &World, name: Value, form: &str) -> LispResult<Value> {
    if name.is_symbol() {
        Ok(name)
    } else {
        Err(LispError::invalid_form(
            form,
            format!("{} is not a block name", print_val(name, w)),
        ))
    }
}

/// `BLOCK name, body..., BLOCKEND name`
fn gen_block(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let name = block_name(w, w.heap.car_val(args)?, "block")?;
    let body = w.heap.cdr_val(args)?;
    let end = emit(w, Opcode::BlockEnd, &[name], cont)?;
    let code = c.compile_in_block(m, w, name, body, env, end)?;
    emit(w, Opcode::Block, &[name], code)
}

/// `value, RETFROM name`. The code after RETFROM is what the unwind scan
/// walks to reach the block's end.
fn compile_return(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    name: Value,
    value: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    if !c.target_block(name) {
        return Err(LispError::UnmatchedTarget {
            kind: "block",
            name: print_val(name, w),
        });
    }
    let code = emit(w, Opcode::RetFrom, &[name], cont)?;
    c.compile(m, w, value, env, code)
}

fn gen_return_from(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let items = arg_list(w, args);
    let name = block_name(w, items[0], "return-from")?;
    let value = items.get(1).copied().unwrap_or(Value::Nil);
    compile_return(c, m, w, name, value, env, cont)
}

/// `(return v)` is `(return-from nil v)`.
fn gen_return(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let value = arg_list(w, args).first().copied().unwrap_or(Value::Nil);
    compile_return(c, m, w, Value::Nil, value, env, cont)
}

/// `TAGBODY id table, forms..., TAGEND`. Every form is followed by POP;
/// each tag maps to the code of the forms after it, which falls through to
/// the end.
fn gen_tagbody(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let items = arg_list(w, args);
    let mut tags: Vec<Value> = Vec::new();
    for &item in &items {
        if item.is_pair() {
            continue;
        }
        if !(item.is_symbol() || item.is_int()) {
            return Err(LispError::invalid_form(
                "tagbody",
                format!("{} is not a valid tag", print_val(item, w)),
            ));
        }
        if tags.contains(&item) {
            return Err(LispError::invalid_form(
                "tagbody",
                format!("duplicate tag {}", print_val(item, w)),
            ));
        }
        tags.push(item);
    }

    let id = Value::Symbol(w.symbols.gensym("tagbody"));
    let (table, code) = c.with_tags(id, tags, |c| {
        let mut code = emit(w, Opcode::TagEnd, &[], cont)?;
        let mut entries = Vec::new();
        for &item in items.iter().rev() {
            if item.is_pair() {
                let pop = emit(w, Opcode::Pop, &[], code)?;
                code = c.compile(m, w, item, env, pop)?;
            } else {
                entries.push(w.heap.cons(item, code)?);
            }
        }
        entries.reverse();
        Ok((w.heap.list(&entries)?, code))
    })?;
    emit(w, Opcode::TagBody, &[id, table], code)
}

/// `GO id tag`
fn gen_go(
    c: &mut Compiler,
    _m: &mut Machine,
    w: &mut World,
    args: Value,
    _env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let tag = w.heap.car_val(args)?;
    match c.target_tag(tag) {
        Some(id) => emit(w, Opcode::Go, &[id, tag], cont),
        None => Err(LispError::UnmatchedTarget {
            kind: "tag",
            name: print_val(tag, w),
        }),
    }
}

/// Proclaim a variable special at compile time.
fn declare(w: &mut World, var: Value, form: &str) -> LispResult<SymbolId> {
    let id = match var {
        Value::Symbol(id) => id,
        _ => {
            return Err(LispError::invalid_form(
                form,
                format!("{} is not a variable name", print_val(var, w)),
            ))
        }
    };
    w.symbols.declare_special(id)?;
    Ok(id)
}

/// `(defvar x init)`: `(if (boundp 'x) nil (setq x init))`, then the name.
fn gen_defvar(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let items = arg_list(w, args);
    let id = declare(w, items[0], "defvar")?;
    let name = Value::Symbol(id);
    let code = emit(w, Opcode::Ldc, &[name], cont)?;
    let Some(&init) = items.get(1) else {
        return Ok(code);
    };
    let quoted = w.heap.list(&[Value::Symbol(sym::QUOTE), name])?;
    let test = w.heap.list(&[Value::Symbol(sym::BOUNDP), quoted])?;
    let assign = w.heap.list(&[Value::Symbol(sym::SETQ), name, init])?;
    let form = w.heap.list(&[Value::Symbol(sym::IF), test, Value::Nil, assign])?;
    let pop = emit(w, Opcode::Pop, &[], code)?;
    c.compile(m, w, form, env, pop)
}

/// `(defparameter x init)`: always assigns.
fn gen_defparameter(
    c: &mut Compiler,
    m: &mut Machine,
    w: &mut World,
    args: Value,
    env: &LexEnv,
    cont: Value,
) -> LispResult<Value> {
    let items = arg_list(w, args);
    let id = declare(w, items[0], "defparameter")?;
    let name = Value::Symbol(id);
    let code = emit(w, Opcode::Ldc, &[name], cont)?;
    let assign = w.heap.list(&[Value::Symbol(sym::SETQ), name, items[1]])?;
    let pop = emit(w, Opcode::Pop, &[], code)?;
    c.compile(m, w, assign, env, pop)
}
