use secd::config::Config;
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
fn self_evaluating_atoms() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "5"), "5");
    assert_eq!(eval(&mut i, "-12"), "-12");
    assert_eq!(eval(&mut i, "nil"), "nil");
    assert_eq!(eval(&mut i, "t"), "t");
    assert_eq!(eval(&mut i, ":key"), ":key");
    assert_eq!(eval(&mut i, "'(a . b)"), "(a . b)");
}

#[test]
fn if_selects_a_branch() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(if t 'a 'b)"), "a");
    assert_eq!(eval(&mut i, "(if nil 'a 'b)"), "b");
    assert_eq!(eval(&mut i, "(if nil 'a)"), "nil");
    assert_eq!(eval(&mut i, "(list (if 0 'yes 'no) (if '() 'yes 'no))"), "(yes no)");
}

#[test]
fn let_forms() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(let ((x 1)) x)"), "1");
    assert_eq!(eval(&mut i, "(let ((x 1)) (let ((x 2) (y x)) y))"), "1");
    assert_eq!(eval(&mut i, "(let* ((x 1) (y (+ x 1))) (list x y))"), "(1 2)");
    assert_eq!(eval(&mut i, "(let (a (b)) (list a b))"), "(nil nil)");
}

#[test]
fn letrec_mutual_recursion() {
    let mut i = interp();
    let src = "(letrec ((even? (lambda (n) (if (= n 0) t (funcall odd? (- n 1)))))
                        (odd? (lambda (n) (if (= n 0) nil (funcall even? (- n 1))))))
                 (list (funcall even? 10) (funcall odd? 10) (funcall odd? 7)))";
    assert_eq!(eval(&mut i, src), "(t nil t)");
}

#[test]
fn closures_capture_their_frames() {
    let mut i = interp();
    eval(
        &mut i,
        "(defun make-counter ()
           (let ((n 0))
             (lambda () (setq n (1+ n)))))",
    );
    assert_eq!(
        eval(&mut i, "(let ((c (make-counter)) (d (make-counter))) (funcall c) (funcall c) (list (funcall c) (funcall d)))"),
        "(3 1)"
    );
}

#[test]
fn rest_parameters() {
    let mut i = interp();
    eval(&mut i, "(defun f (a &rest r) (list a r))");
    assert_eq!(eval(&mut i, "(f 1 2 3)"), "(1 (2 3))");
    assert_eq!(eval(&mut i, "(f 1)"), "(1 nil)");
    eval(&mut i, "(defun g (a . r) r)");
    assert_eq!(eval(&mut i, "(g 1 2)"), "(2)");
    eval(&mut i, "(defun h (&rest r) (setq r (cons 0 r)) r)");
    assert_eq!(eval(&mut i, "(h 1 2)"), "(0 1 2)");
}

#[test]
fn self_tail_calls_run_in_bounded_dump_depth() {
    let mut i = interp();
    eval(&mut i, "(defun countdown (n) (if (= n 0) 'done (countdown (- n 1))))");
    assert_eq!(eval(&mut i, "(countdown 100000)"), "done");
    assert!(i.machine.max_dump_depth < 10, "dump depth {}", i.machine.max_dump_depth);

    eval(&mut i, "(defun sum (n) (if (= n 0) 0 (+ n (sum (- n 1)))))");
    assert_eq!(eval(&mut i, "(sum 100)"), "5050");
    assert!(i.machine.max_dump_depth >= 100);
}

#[test]
fn mutual_tail_calls_between_functions() {
    let mut i = interp();
    // calls resolve by name when they run, so a placeholder lets ping compile
    eval(&mut i, "(defun pong (n) n)");
    eval(&mut i, "(defun ping (n) (if (zerop n) 'ping (pong (1- n))))");
    eval(&mut i, "(defun pong (n) (if (zerop n) 'pong (ping (1- n))))");
    assert_eq!(eval(&mut i, "(ping 50001)"), "pong");
    assert!(i.machine.max_dump_depth < 10);
}

#[test]
fn macros_expand_at_compile_time() {
    let mut i = interp();
    eval(&mut i, "(defmacro twice (x) `(+ ,x ,x))");
    let forms = i.read_all("(twice 3) (+ 3 3)").unwrap();
    let expanded = i.compile(forms[0]).unwrap();
    let direct = i.compile(forms[1]).unwrap();
    assert_eq!(i.print(expanded), i.print(direct));
    assert_eq!(eval(&mut i, "(twice 3)"), "6");
}

#[test]
fn macroexpand_and_eval_at_run_time() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(macroexpand-1 '(when a b))"), "(if a (progn b))");
    assert_eq!(eval(&mut i, "(macroexpand '(unless a b))"), "(if a nil (progn b))");
    assert_eq!(eval(&mut i, "(macroexpand-1 '(car x))"), "(car x)");
    assert_eq!(eval(&mut i, "(eval '(+ 1 2))"), "3");
    assert_eq!(eval(&mut i, "(eval (list 'let '((x 4)) '(* x x)))"), "16");
}

#[test]
fn and_or() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(and 1 2 3)"), "3");
    assert_eq!(eval(&mut i, "(and 1 nil 3)"), "nil");
    assert_eq!(eval(&mut i, "(and)"), "t");
    assert_eq!(eval(&mut i, "(or nil 2 3)"), "2");
    assert_eq!(eval(&mut i, "(or nil nil)"), "nil");
    assert_eq!(eval(&mut i, "(or)"), "nil");
    assert_eq!(eval(&mut i, "(let ((n 0)) (list (or (setq n (1+ n)) 99) n))"), "(1 1)");
}

#[test]
fn higher_order_calls() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(apply #'+ 1 2 '(3 4))"), "10");
    assert_eq!(eval(&mut i, "(funcall #'car '(1 2))"), "1");
    assert_eq!(eval(&mut i, "(mapcar #'1+ '(1 2 3))"), "(2 3 4)");
    assert_eq!(eval(&mut i, "(mapcar (lambda (x) (* x x)) '(1 2 3))"), "(1 4 9)");
    assert_eq!(eval(&mut i, "((lambda (a b) (- a b)) 10 3)"), "7");
}

#[test]
fn prelude_forms() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(cond ((= 1 2) 'a) ((= 1 1) 'b) (t 'c))"), "b");
    assert_eq!(eval(&mut i, "(cond ((member 2 '(1 2 3))))"), "(2 3)");
    assert_eq!(eval(&mut i, "(let ((acc nil)) (dolist (x '(1 2 3)) (push x acc)) acc)"), "(3 2 1)");
    assert_eq!(eval(&mut i, "(let ((n 0)) (dotimes (k 5) (setq n (+ n k))) n)"), "10");
    assert_eq!(eval(&mut i, "(let ((x 1)) (incf x 5) (decf x) x)"), "5");
    assert_eq!(eval(&mut i, "(let ((s '(1 2))) (list (pop s) s))"), "(1 (2))");
    assert_eq!(eval(&mut i, "(let ((k 0)) (loop (when (= k 3) (return k)) (incf k)))"), "3");
    assert_eq!(eval(&mut i, "(dotimes (k 10) (when (= k 4) (return (* k 10))))"), "40");
    assert_eq!(eval(&mut i, "(nth 2 '(a b c d))"), "c");
    assert_eq!(eval(&mut i, "(assoc 'b '((a . 1) (b . 2)))"), "(b . 2)");
    assert_eq!(eval(&mut i, "(last '(1 2 3))"), "(3)");
    assert_eq!(eval(&mut i, "(prog1 1 2 3)"), "1");
}

#[test]
fn globals_and_free_variable_warnings() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(progn (setq counter 1) (setq counter (+ counter 1)) counter)"), "2");
    let warnings = i.take_warnings();
    assert!(warnings.iter().any(|w| w.contains("counter")), "{:?}", warnings);
    // bound now, so no further warning
    assert_eq!(eval(&mut i, "counter"), "2");
    assert!(i.take_warnings().is_empty());
}

#[test]
fn dynamic_scope_of_defvar() {
    let mut i = interp();
    eval(&mut i, "(defvar *x* 1)");
    eval(&mut i, "(defun f () *x*)");
    assert_eq!(eval(&mut i, "(let ((*x* 2)) (f))"), "2");
    assert_eq!(eval(&mut i, "(f)"), "1");
    assert_eq!(eval(&mut i, "(defvar *x* 5)"), "*x*");
    assert_eq!(eval(&mut i, "*x*"), "1");
    eval(&mut i, "(defparameter *x* 7)");
    assert_eq!(eval(&mut i, "*x*"), "7");
}

#[test]
fn special_parameters_bind_dynamically() {
    let mut i = interp();
    eval(&mut i, "(defvar *depth* 0)");
    eval(&mut i, "(defun show () *depth*)");
    eval(&mut i, "(defun with-depth (*depth*) (show))");
    assert_eq!(eval(&mut i, "(list (with-depth 5) *depth*)"), "(5 0)");
    assert_eq!(i.machine.special_depth(), 0);
}

#[test]
fn print_writes_to_the_output_buffer() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(progn (print 'a) (print '(1 2)) 3)"), "3");
    assert_eq!(i.take_output(), "a\n(1 2)\n");
    assert_eq!(i.take_output(), "");
}

#[test]
fn interpreter_without_prelude() {
    let mut i = Interpreter::new(Config {
        prelude: false,
        ..Config::default()
    })
    .unwrap();
    assert_eq!(eval(&mut i, "(+ 1 2)"), "3");
    assert!(i.eval_str("(when t 1)").is_err());
}
