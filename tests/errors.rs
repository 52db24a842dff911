use secd::config::Config;
use secd::error::LispError;
use secd::interp::Interpreter;

fn interp() -> Interpreter {
    Interpreter::new(Config::default()).expect("interpreter starts")
}

fn eval(interp: &mut Interpreter, src: &str) -> String {
    match interp.eval_str(src) {
        Ok(val) => interp.print(val),
        Err(e) => panic!("{}: {}", src, e),
    }
}

#[test]
fn undefined_function() {
    let mut i = interp();
    assert!(matches!(i.eval_str("(no-such-function 1)"), Err(LispError::UndefinedFunction(_))));
    assert!(matches!(
        i.eval_str("(funcall #'no-such-function 1)"),
        Err(LispError::UnboundFunction(_))
    ));
}

#[test]
fn wrong_argument_counts() {
    let mut i = interp();
    assert!(matches!(i.eval_str("(car 1 2)"), Err(LispError::ArgCount { .. })));
    eval(&mut i, "(defun two (a b) (list a b))");
    assert!(matches!(
        i.eval_str("(two 1)"),
        Err(LispError::ArgCount { min: 2, actual: 1, .. })
    ));
    // only known when the call happens
    assert!(matches!(
        i.eval_str("(funcall (lambda (x) x) 1 2)"),
        Err(LispError::ArgCount { actual: 2, .. })
    ));
    assert!(matches!(i.eval_str("(apply #'two '(1 2 3))"), Err(LispError::ArgCount { .. })));
}

#[test]
fn type_and_arithmetic_errors() {
    let mut i = interp();
    assert!(matches!(i.eval_str("(car 5)"), Err(LispError::TypeError(_))));
    assert!(matches!(i.eval_str("(+ 1 'a)"), Err(LispError::TypeError(_))));
    assert!(matches!(i.eval_str("(funcall 5)"), Err(LispError::TypeError(_))));
    assert!(matches!(i.eval_str("(mod 1 0)"), Err(LispError::Arithmetic(_))));
}

#[test]
fn unbound_variable() {
    let mut i = interp();
    assert!(matches!(i.eval_str("never-assigned"), Err(LispError::UnboundVariable(_))));
}

#[test]
fn step_limit_stops_an_infinite_loop() {
    let mut i = Interpreter::new(Config {
        max_steps: Some(1000),
        ..Config::default()
    })
    .unwrap();
    assert!(matches!(i.eval_str("(loop)"), Err(LispError::FuelExhausted)));
    // the limit applies per top-level form
    assert_eq!(eval(&mut i, "(+ 1 2)"), "3");
}

#[test]
fn constants_cannot_be_bound_or_assigned() {
    let mut i = interp();
    assert!(matches!(i.eval_str("(setq t 1)"), Err(LispError::ConstantRedefinition(_))));
    assert!(matches!(i.eval_str("(let ((nil 1)) nil)"), Err(LispError::ConstantRedefinition(_))));
    assert!(matches!(i.eval_str("(defun f (t) t)"), Err(LispError::ConstantRedefinition(_))));
}

#[test]
fn read_errors() {
    let mut i = interp();
    assert!(matches!(i.eval_str("(a b"), Err(LispError::ReadError(_))));
    assert!(matches!(i.eval_str(")"), Err(LispError::ReadError(_))));
}

#[test]
fn macros_are_not_functions() {
    let mut i = interp();
    assert!(matches!(i.eval_str("#'when"), Err(LispError::InvalidForm { .. })));
    assert!(matches!(
        i.eval_str("(funcall (symbol-function 'when) t 1)"),
        Err(LispError::TypeError(_))
    ));
}

#[test]
fn user_errors_carry_their_message() {
    let mut i = interp();
    match i.eval_str("(error 'bad 'thing)") {
        Err(LispError::User(msg)) => assert!(msg.contains("thing"), "{}", msg),
        other => panic!("expected a user error, got {:?}", other.map(|v| i.print(v))),
    }
}

#[test]
fn errors_leave_earlier_definitions_in_place() {
    let mut i = interp();
    assert!(i.eval_str("(defun ok () 1) (defun broken () (undefined-thing))").is_err());
    assert_eq!(eval(&mut i, "(ok)"), "1");
    assert!(matches!(i.eval_str("(broken)"), Err(LispError::UndefinedFunction(_))));
    assert_eq!(i.machine.special_depth(), 0);
}
