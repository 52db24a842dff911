//! A Lisp compiler targeting a SECD-style abstract machine.
//!
//! Forms are compiled in continuation-passing style into instruction lists
//! for a machine with five registers: the operand stack S, the environment
//! E, the control list C, the dump D and the block/tag table B. Macros
//! expand at compile time by running their expanders on the same machine.
//!
//! ```no_run
//! use secd::config::Config;
//! use secd::interp::Interpreter;
//!
//! let mut interp = Interpreter::new(Config::default()).unwrap();
//! let val = interp.eval_str("(defun sq (x) (* x x)) (sq 7)").unwrap();
//! assert_eq!(interp.print(val), "49");
//! ```

pub mod compiler;
pub mod config;
pub mod control;
pub mod error;
pub mod function;
pub mod heap;
pub mod interp;
pub mod lexenv;
pub mod machine;
pub mod opcode;
pub mod primitives;
pub mod printer;
pub mod reader;
pub mod symbol;
pub mod value;
pub mod world;
