use crate::symbol::sym;
use crate::value::Value;
use crate::world::World;

/// Nesting past this prints as `...`.
const MAX_DEPTH: usize = 1000;
/// Elements printed from one list before the rest is elided. Lists made
/// circular with `rplacd` stop here.
const MAX_LENGTH: usize = 100_000;

/// Print a value to a string.
pub fn print_val(val: Value, w: &World) -> String {
    let mut out = String::new();
    print_inner(val, w, &mut out, 0);
    out
}

fn print_inner(val: Value, w: &World, out: &mut String, depth: usize) {
    if depth > MAX_DEPTH {
        out.push_str("...");
        return;
    }

    match val {
        Value::Nil => out.push_str("nil"),
        Value::True => out.push('t'),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Symbol(id) => {
            let symbol = w.symbols.get(id);
            if !symbol.interned {
                out.push_str("#:");
            }
            print_symbol_name(&symbol.name, out);
        }
        Value::Function(fid) => {
            let kind = if w.function(fid).is_macro() { "macro" } else { "function" };
            out.push_str(&format!("#<{} {}>", kind, w.function_name(fid)));
        }
        Value::Closure(_) => out.push_str("#<closure>"),
        Value::Primitive(pid) => {
            let name = w.symbols.name(w.primitives.get(pid).name);
            out.push_str(&format!("#<primitive {}>", name));
        }
        Value::Frame(id) => out.push_str(&format!("#<frame {}>", id.0)),
        Value::Op(op) => out.push_str(op.mnemonic()),
        Value::Pair(id) => {
            let car = w.heap.car(id);
            let cdr = w.heap.cdr(id);

            // (quote x) -> 'x, (function x) -> #'x
            let prefix = match car {
                Value::Symbol(s) if s == sym::QUOTE => Some("'"),
                Value::Symbol(s) if s == sym::FUNCTION => Some("#'"),
                _ => None,
            };
            if let (Some(prefix), Value::Pair(cdr_id)) = (prefix, cdr) {
                if w.heap.cdr(cdr_id).is_nil() {
                    out.push_str(prefix);
                    print_inner(w.heap.car(cdr_id), w, out, depth + 1);
                    return;
                }
            }

            out.push('(');
            print_inner(car, w, out, depth + 1);
            let mut current = cdr;
            let mut length = 1;
            loop {
                match current {
                    Value::Nil => break,
                    Value::Pair(_) if length >= MAX_LENGTH => {
                        out.push_str(" ...");
                        break;
                    }
                    Value::Pair(pid) => {
                        length += 1;
                        out.push(' ');
                        print_inner(w.heap.car(pid), w, out, depth + 1);
                        current = w.heap.cdr(pid);
                    }
                    _ => {
                        out.push_str(" . ");
                        print_inner(current, w, out, depth + 1);
                        break;
                    }
                }
            }
            out.push(')');
        }
    }
}

fn print_symbol_name(name: &str, out: &mut String) {
    let needs_bars = name.is_empty()
        || name.parse::<i64>().is_ok()
        || name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '`' | ',' | ';' | '"' | '|'));
    if needs_bars {
        out.push('|');
        out.push_str(name);
        out.push('|');
    } else {
        out.push_str(name);
    }
}

/// Render an instruction stream one instruction per line, nested streams
/// (branch arms, function bodies) indented beneath the instruction that
/// carries them.
pub fn disassemble(code: Value, w: &World) -> String {
    let mut out = String::new();
    disassemble_into(code, w, &mut out, 0);
    out
}

fn disassemble_into(code: Value, w: &World, out: &mut String, indent: usize) {
    let pad = "  ".repeat(indent);
    let mut current = code;
    while let Value::Pair(id) = current {
        let cell = w.heap.car(id);
        current = w.heap.cdr(id);
        let op = match cell.as_op() {
            Some(op) => op,
            None => {
                out.push_str(&format!("{}{}\n", pad, print_val(cell, w)));
                continue;
            }
        };

        let mut line = format!("{}{}", pad, op.mnemonic());
        let mut nested = Vec::new();
        for _ in 0..op.operand_count() {
            let Value::Pair(oid) = current else { break };
            let operand = w.heap.car(oid);
            current = w.heap.cdr(oid);
            match operand {
                Value::Pair(_) if starts_with_op(operand, w) => nested.push(operand),
                Value::Function(fid) => {
                    line.push(' ');
                    line.push_str(&print_val(operand, w));
                    nested.push(w.function(fid).code);
                }
                _ => {
                    line.push(' ');
                    line.push_str(&print_val(operand, w));
                }
            }
        }
        out.push_str(&line);
        out.push('\n');
        for body in nested {
            disassemble_into(body, w, out, indent + 1);
        }
    }
}

fn starts_with_op(code: Value, w: &World) -> bool {
    match code {
        Value::Pair(id) => w.heap.car(id).as_op().is_some(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn prints_atoms_lists_and_quote_sugar() {
        let mut w = World::new(&Config::default()).unwrap();
        let foo = w.intern("foo");
        let quote = Value::Symbol(sym::QUOTE);
        let quoted = w.heap.list(&[quote, foo]).unwrap();
        let list = w.heap.list(&[Value::Int(1), Value::True, Value::Nil, quoted]).unwrap();
        assert_eq!(print_val(list, &w), "(1 t nil 'foo)");

        let dotted = w.heap.cons(Value::Int(1), Value::Int(2)).unwrap();
        assert_eq!(print_val(dotted, &w), "(1 . 2)");
    }

    #[test]
    fn prints_gensyms_and_primitives() {
        let mut w = World::new(&Config::default()).unwrap();
        let g = w.symbols.gensym("g");
        assert!(print_val(Value::Symbol(g), &w).starts_with("#:g"));
        let car = w.symbols.lookup("car").unwrap();
        let prim = w.symbols.function_value(car).unwrap();
        assert_eq!(print_val(prim, &w), "#<primitive car>");
    }

    #[test]
    fn circular_lists_are_cut_off() {
        let mut w = World::new(&Config::default()).unwrap();
        let list = w.heap.list(&[Value::Int(1), Value::Int(2)]).unwrap();
        let (first, second) = match list {
            Value::Pair(id) => (id, w.heap.cdr(id)),
            _ => unreachable!(),
        };
        if let Value::Pair(last) = second {
            w.heap.set_cdr(last, Value::Pair(first));
        }
        let printed = print_val(list, &w);
        assert!(printed.starts_with("(1 2 1 2 "));
        assert!(printed.ends_with(" ...)"));
        assert_eq!(printed.matches(' ').count(), MAX_LENGTH);
    }

    #[test]
    fn odd_symbol_names_are_escaped() {
        let mut w = World::new(&Config::default()).unwrap();
        let odd = w.intern("hello world");
        assert_eq!(print_val(odd, &w), "|hello world|");
    }
}
