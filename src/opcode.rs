use crate::error::{LispError, LispResult};
use crate::machine::{Catch, CallMode, Dump, Flow, Machine};
use crate::value::Value;
use crate::world::World;

/// One instruction of the abstract machine.
///
/// An instruction stream is a proper list in which every `Value::Op` atom is
/// followed by its operands (`operand_count` of them). Branch arms and
/// function bodies are themselves instruction streams carried as operands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// LDC x: push a constant.
    Ldc,
    /// LD i j: push slot j of frame i.
    Ld,
    /// LDR i j: push the list of slots j.. of frame i (a `&rest` parameter).
    Ldr,
    /// LDG sym: push the symbol's global or dynamic value.
    Ldg,
    /// GFN sym: push the symbol's function.
    Gfn,
    /// SETL i j: store the top of S into slot j of frame i.
    SetL,
    /// SETLR i j: store the top of S into the `&rest` slots j.. of frame i.
    SetLR,
    /// SETG sym: store the top of S into the symbol's value cell.
    SetG,
    /// LDF fn: push a closure of fn over the current environment.
    Ldf,
    /// AP n: call the function below the top n values.
    Ap,
    /// TAP n: like AP, reusing the caller's dump entry.
    TAp,
    /// RAP n: fill the dummy frame of a letrec closure and enter it.
    RAp,
    /// DUM n: push an unfilled n-slot frame onto E.
    Dum,
    /// RTN: return to the caller saved on D.
    Rtn,
    /// SEL then else: branch, saving the continuation for JOIN.
    Sel,
    /// TSEL then else: branch in tail position; both arms end in the
    /// terminal continuation, nothing is saved.
    TSel,
    /// JOIN: resume the continuation saved by SEL.
    Join,
    /// POP: drop the top of S.
    Pop,
    /// CALLP prim n: run a primitive on the top n values.
    CallP,
    /// BIND sym: dynamically bind sym to the popped value.
    Bind,
    /// UNBIND sym: end the innermost dynamic binding of sym.
    Unbind,
    /// BLOCK name: enter a block.
    Block,
    /// BLOCKEND name: leave a block, keeping its value.
    BlockEnd,
    /// RETFROM name: unwind to the end of the named block with the popped
    /// value.
    RetFrom,
    /// TAGBODY id table: enter a tagbody.
    TagBody,
    /// TAGEND: leave a tagbody, pushing nil.
    TagEnd,
    /// GO id tag: jump to a tag of an active tagbody.
    Go,
    /// STOP: halt the machine.
    Stop,
}

impl Opcode {
    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Ldc => "LDC",
            Opcode::Ld => "LD",
            Opcode::Ldr => "LDR",
            Opcode::Ldg => "LDG",
            Opcode::Gfn => "GFN",
            Opcode::SetL => "SETL",
            Opcode::SetLR => "SETLR",
            Opcode::SetG => "SETG",
            Opcode::Ldf => "LDF",
            Opcode::Ap => "AP",
            Opcode::TAp => "TAP",
            Opcode::RAp => "RAP",
            Opcode::Dum => "DUM",
            Opcode::Rtn => "RTN",
            Opcode::Sel => "SEL",
            Opcode::TSel => "TSEL",
            Opcode::Join => "JOIN",
            Opcode::Pop => "POP",
            Opcode::CallP => "CALLP",
            Opcode::Bind => "BIND",
            Opcode::Unbind => "UNBIND",
            Opcode::Block => "BLOCK",
            Opcode::BlockEnd => "BLOCKEND",
            Opcode::RetFrom => "RETFROM",
            Opcode::TagBody => "TAGBODY",
            Opcode::TagEnd => "TAGEND",
            Opcode::Go => "GO",
            Opcode::Stop => "STOP",
        }
    }

    /// How many operand cells follow the opcode in the stream.
    pub fn operand_count(self) -> usize {
        match self {
            Opcode::Rtn | Opcode::Join | Opcode::Pop | Opcode::TagEnd | Opcode::Stop => 0,
            Opcode::Ldc
            | Opcode::Ldg
            | Opcode::Gfn
            | Opcode::SetG
            | Opcode::Ldf
            | Opcode::Ap
            | Opcode::TAp
            | Opcode::RAp
            | Opcode::Dum
            | Opcode::Bind
            | Opcode::Unbind
            | Opcode::Block
            | Opcode::BlockEnd
            | Opcode::RetFrom => 1,
            Opcode::Ld
            | Opcode::Ldr
            | Opcode::SetL
            | Opcode::SetLR
            | Opcode::Sel
            | Opcode::TSel
            | Opcode::CallP
            | Opcode::TagBody
            | Opcode::Go => 2,
        }
    }

    /// Execute this instruction. The opcode cell has already been popped
    /// from C; operands are read from C here.
    pub fn execute(self, m: &mut Machine, w: &mut World) -> LispResult<Flow> {
        match self {
            Opcode::Ldc => {
                let val = m.operand(w)?;
                m.push(val);
            }
            Opcode::Ld => {
                let (i, j) = (m.operand_index(w)?, m.operand_index(w)?);
                let frame = m.frame_at(w, i)?;
                let val = w.heap.frame_slot(frame, j)?;
                m.push(val);
            }
            Opcode::Ldr => {
                let (i, j) = (m.operand_index(w)?, m.operand_index(w)?);
                let frame = m.frame_at(w, i)?;
                let val = w.heap.frame_rest(frame, j)?;
                m.push(val);
            }
            Opcode::Ldg => {
                let name = m.operand_symbol(w)?;
                let val = w.symbols.value(name)?;
                m.push(val);
            }
            Opcode::Gfn => {
                let name = m.operand_symbol(w)?;
                let val = w.symbols.function_value(name)?;
                if let Value::Function(fid) = val {
                    if w.function(fid).is_macro() {
                        return Err(LispError::type_error(format!(
                            "{} names a macro, not a function",
                            w.symbols.name(name)
                        )));
                    }
                }
                m.push(val);
            }
            Opcode::SetL => {
                let (i, j) = (m.operand_index(w)?, m.operand_index(w)?);
                let val = m.peek()?;
                let frame = m.frame_at(w, i)?;
                w.heap.set_frame_slot(frame, j, val)?;
            }
            Opcode::SetLR => {
                let (i, j) = (m.operand_index(w)?, m.operand_index(w)?);
                let val = m.peek()?;
                let frame = m.frame_at(w, i)?;
                w.heap.set_frame_rest(frame, j, val)?;
            }
            Opcode::SetG => {
                let name = m.operand_symbol(w)?;
                let val = m.peek()?;
                w.symbols.set_value(name, val)?;
            }
            Opcode::Ldf => {
                let template = m.operand(w)?;
                if !matches!(template, Value::Function(_)) {
                    return Err(LispError::fatal("LDF operand is not a function template"));
                }
                let closure = w.heap.alloc(template, m.e)?;
                m.push(Value::Closure(closure));
            }
            Opcode::Ap => {
                let n = m.operand_index(w)?;
                m.call(w, n, CallMode::Push)?;
            }
            Opcode::TAp => {
                let n = m.operand_index(w)?;
                m.call(w, n, CallMode::Tail)?;
            }
            Opcode::RAp => {
                let n = m.operand_index(w)?;
                m.recursive_apply(w, n)?;
            }
            Opcode::Dum => {
                let n = m.operand_index(w)?;
                let frame = w.heap.alloc_dummy_frame(n)?;
                m.e = w.heap.cons(Value::Frame(frame), m.e)?;
            }
            Opcode::Rtn => m.return_to_caller()?,
            Opcode::Sel => {
                let test = m.pop()?;
                let then_code = m.operand(w)?;
                let else_code = m.operand(w)?;
                m.push_dump(Dump::Join { code: m.c });
                m.c = if test.is_true() { then_code } else { else_code };
            }
            Opcode::TSel => {
                let test = m.pop()?;
                let then_code = m.operand(w)?;
                let else_code = m.operand(w)?;
                m.c = if test.is_true() { then_code } else { else_code };
            }
            Opcode::Join => m.join()?,
            Opcode::Pop => {
                m.pop()?;
            }
            Opcode::CallP => {
                let prim = match m.operand(w)? {
                    Value::Primitive(pid) => pid,
                    _ => return Err(LispError::fatal("CALLP operand is not a primitive")),
                };
                let n = m.operand_index(w)?;
                m.call_primitive(w, prim, n)?;
            }
            Opcode::Bind => {
                let name = m.operand_symbol(w)?;
                let val = m.pop()?;
                m.bind_special(w, name, val);
            }
            Opcode::Unbind => {
                let name = m.operand_symbol(w)?;
                m.unbind_special(w, name)?;
            }
            Opcode::Block => {
                let name = m.operand(w)?;
                let stack = m.s.len();
                m.b.push(Catch::Block { name, stack, env: m.e });
            }
            Opcode::BlockEnd => {
                let name = m.operand(w)?;
                m.end_block(name)?;
            }
            Opcode::RetFrom => {
                let name = m.operand(w)?;
                let val = m.pop()?;
                m.return_from(w, name, val)?;
            }
            Opcode::TagBody => {
                let id = m.operand(w)?;
                let table = m.operand(w)?;
                m.enter_tagbody(id, table);
            }
            Opcode::TagEnd => {
                m.end_tagbody()?;
                m.push(Value::Nil);
            }
            Opcode::Go => {
                let id = m.operand(w)?;
                let tag = m.operand(w)?;
                m.go(w, id, tag)?;
            }
            Opcode::Stop => return Ok(Flow::Stop),
        }
        Ok(Flow::Continue)
    }
}
