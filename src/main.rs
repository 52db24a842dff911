use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use secd::config::Config;
use secd::interp::Interpreter;
use secd::reader;

/// Compile and run Lisp on a SECD machine.
#[derive(Parser, Debug)]
#[command(name = "secd", version, about)]
struct Cli {
    /// Load a source file before reading standard input
    #[arg(long, value_name = "FILE")]
    load: Vec<PathBuf>,

    /// Log every executed instruction (same as SECD_TRACE=1)
    #[arg(long)]
    trace: bool,

    /// Abort any top-level form after this many instructions
    #[arg(long, value_name = "N")]
    max_steps: Option<u64>,

    /// Start without the bundled macros and list functions
    #[arg(long)]
    no_prelude: bool,

    /// Print the compiled code of each form before running it
    #[arg(long)]
    disassemble: bool,

    /// Log level: off, error, warn, info, debug or trace
    #[arg(long, value_name = "LEVEL", default_value = "warn", value_parser = parse_level)]
    log_level: LevelFilter,
}

fn parse_level(s: &str) -> Result<LevelFilter, String> {
    s.parse().map_err(|_| format!("unknown log level {:?}", s))
}

fn main() {
    let cli = Cli::parse();

    let mut config = Config::from_env();
    config.trace |= cli.trace;
    if cli.max_steps.is_some() {
        config.max_steps = cli.max_steps;
    }
    if cli.no_prelude {
        config.prelude = false;
    }

    let level = if config.trace { LevelFilter::Trace } else { cli.log_level };
    let log_config = ConfigBuilder::new().set_time_level(LevelFilter::Off).build();
    if let Err(e) = TermLogger::init(level, log_config, TerminalMode::Stderr, ColorChoice::Auto) {
        eprintln!("could not install logger: {}", e);
    }

    let mut interp = match Interpreter::new(config) {
        Ok(interp) => interp,
        Err(e) => {
            eprintln!("Failed to initialize: {}", e);
            process::exit(1);
        }
    };

    for path in &cli.load {
        load_file(&mut interp, path);
    }

    if io::stdin().is_terminal() {
        println!("SECD Lisp");
        println!(
            "  Heap: {} cells and {} frames used, Symbols: {} interned, Functions: {}",
            interp.world.heap.total_cells(),
            interp.world.heap.total_frames(),
            interp.world.symbols.count(),
            interp.world.function_count()
        );
        println!("Ready.\n");
        run_interactive(&mut interp, cli.disassemble);
    } else {
        run_piped(&mut interp, cli.disassemble);
    }
}

/// Load a source file, stopping at the first error.
fn load_file(interp: &mut Interpreter, path: &Path) {
    let start = Instant::now();
    let input = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error loading {}: {}", path.display(), e);
            process::exit(1);
        }
    };

    let mut pos = 0;
    let mut count = 0;
    loop {
        match reader::read_one_at(&input, pos, &mut interp.world.heap, &mut interp.world.symbols) {
            Ok(Some((expr, new_pos))) => {
                pos = new_pos;
                count += 1;
                if let Err(e) = interp.eval(expr) {
                    eprintln!("Error at expression {} of {}: {}", count, path.display(), e);
                    process::exit(1);
                }
                print!("{}", interp.take_output());
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("Read error in {}: {}", path.display(), e);
                process::exit(1);
            }
        }
    }
    log::info!(
        "loaded {} expressions from {} in {:.2}s",
        count,
        path.display(),
        start.elapsed().as_secs_f64()
    );
}

/// Interactive REPL: accumulate lines until parens are balanced.
fn run_interactive(interp: &mut Interpreter, disassemble: bool) {
    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Could not start the line editor: {}", e);
            return run_piped(interp, disassemble);
        }
    };
    let mut buf = String::new();
    let mut depth: i32 = 0;

    loop {
        let prompt = if depth == 0 { "> " } else { "  " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                buf.clear();
                depth = 0;
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("Read error: {}", e);
                break;
            }
        };

        // Track paren depth (naive but sufficient for well-formed input)
        for ch in line.chars() {
            match ch {
                '(' => depth += 1,
                ')' => depth -= 1,
                _ => {}
            }
        }

        buf.push_str(&line);
        buf.push('\n');

        if depth <= 0 {
            depth = 0;
            let input = buf.trim().to_string();
            buf.clear();

            if input.is_empty() {
                continue;
            }
            let _ = rl.add_history_entry(input.as_str());
            eval_and_print(&input, interp, disassemble);
        }
    }
}

/// Piped mode: read all input, then evaluate one expression at a time.
fn run_piped(interp: &mut Interpreter, disassemble: bool) {
    let mut input = String::new();
    if let Err(e) = io::stdin().read_to_string(&mut input) {
        eprintln!("Failed to read input: {}", e);
        process::exit(1);
    }
    eval_and_print(&input, interp, disassemble);
}

/// Evaluate each expression in a string and print its output and result.
/// An error abandons only the expression that raised it.
fn eval_and_print(input: &str, interp: &mut Interpreter, disassemble: bool) {
    let mut pos = 0;
    loop {
        match reader::read_one_at(input, pos, &mut interp.world.heap, &mut interp.world.symbols) {
            Ok(Some((expr, new_pos))) => {
                pos = new_pos;
                let result = if disassemble {
                    interp.compile(expr).and_then(|code| {
                        print!("{}", interp.disassemble(code));
                        interp.machine.reset_stats();
                        interp.machine.execute(&mut interp.world, code, &[])
                    })
                } else {
                    interp.eval(expr)
                };
                print!("{}", interp.take_output());
                match result {
                    Ok(val) => println!("{}", interp.print(val)),
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                eprintln!("{}", e);
                break;
            }
        }
    }
}
