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
fn block_and_return_from() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(block foo (return-from foo 42) 99)"), "42");
    assert_eq!(eval(&mut i, "(block foo 1 2)"), "2");
    assert_eq!(eval(&mut i, "(block foo (return-from foo) 3)"), "nil");
    assert_eq!(eval(&mut i, "(block nil (return 7) 8)"), "7");
}

#[test]
fn nested_blocks() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(block a (block b (return-from a 1)) 2)"), "1");
    assert_eq!(eval(&mut i, "(block a (+ 10 (block b (return-from b 1) 5)))"), "11");
    assert_eq!(eval(&mut i, "(block a (list 1 (block a (return-from a 2)) 3))"), "(1 2 3)");
}

#[test]
fn return_from_a_function_body() {
    let mut i = interp();
    eval(
        &mut i,
        "(defun find-first (pred list)
           (dolist (x list)
             (when (funcall pred x) (return-from find-first x))))",
    );
    assert_eq!(eval(&mut i, "(find-first (lambda (x) (> x 2)) '(1 2 3 4))"), "3");
    assert_eq!(eval(&mut i, "(find-first (lambda (x) (> x 9)) '(1 2 3 4))"), "nil");
}

#[test]
fn return_from_inside_a_closure() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(block b (funcall (lambda () (return-from b 5))) 6)"), "5");
    eval(&mut i, "(defun first-even (list) (mapcar (lambda (x) (when (zerop (mod x 2)) (return-from first-even x))) list) nil)");
    assert_eq!(eval(&mut i, "(first-even '(1 3 4 5 6))"), "4");
}

#[test]
fn unmatched_targets_are_compile_errors() {
    let mut i = interp();
    assert!(matches!(
        i.eval_str("(return-from nowhere 1)"),
        Err(LispError::UnmatchedTarget { kind: "block", .. })
    ));
    assert!(matches!(
        i.eval_str("(go nowhere)"),
        Err(LispError::UnmatchedTarget { kind: "tag", .. })
    ));
    // a defun body does not see the blocks around the defun
    assert!(matches!(
        i.eval_str("(block b (defun leak () (return-from b 1)))"),
        Err(LispError::UnmatchedTarget { .. })
    ));
    assert!(matches!(i.eval_str("(leak)"), Err(LispError::UndefinedFunction(_))));
}

#[test]
fn tagbody_skips_forward() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(tagbody (go end) (print 'skipped) end)"), "nil");
    assert_eq!(i.take_output(), "");
    assert_eq!(eval(&mut i, "(tagbody)"), "nil");
}

#[test]
fn tagbody_loops_backward() {
    let mut i = interp();
    let src = "(let ((i 0) (acc nil))
                 (tagbody
                  top
                    (when (< i 3)
                      (push i acc)
                      (setq i (1+ i))
                      (go top)))
                 acc)";
    assert_eq!(eval(&mut i, src), "(2 1 0)");
}

#[test]
fn go_to_an_outer_tagbody() {
    let mut i = interp();
    let src = "(let ((log nil))
                 (tagbody
                    (tagbody (push 'inner log) (go done) (push 'never log))
                    (push 'skipped log)
                  done
                    (push 'done log))
                 log)";
    assert_eq!(eval(&mut i, src), "(done inner)");
}

#[test]
fn go_out_of_a_closure() {
    let mut i = interp();
    let src = "(let ((n 3))
                 (tagbody
                  top
                    (funcall (lambda ()
                               (when (> n 0)
                                 (setq n (1- n))
                                 (go top)))))
                 n)";
    assert_eq!(eval(&mut i, src), "0");
}

#[test]
fn inner_tags_shadow_outer_ones() {
    let mut i = interp();
    let src = "(let ((log nil))
                 (tagbody
                    (tagbody (go a) (push 'never log) a (push 'inner log))
                    (go a)
                    (push 'never log)
                  a
                    (push 'outer log))
                 (reverse log))";
    assert_eq!(eval(&mut i, src), "(inner outer)");
}

#[test]
fn integer_tags() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(let ((x 0)) (tagbody (go 10) (setq x 1) 10 (setq x (+ x 2))) x)"), "2");
}

#[test]
fn duplicate_tags_are_rejected() {
    let mut i = interp();
    assert!(matches!(i.eval_str("(tagbody a (print 1) a)"), Err(LispError::InvalidForm { .. })));
}

#[test]
fn return_from_a_letrec_initializer_restores_the_environment() {
    let mut i = interp();
    assert_eq!(
        eval(&mut i, "(let ((y 5)) (list (block b (letrec ((x (return-from b 1))) x)) y))"),
        "(1 5)"
    );
    assert_eq!(
        eval(
            &mut i,
            "(let ((y 6))
               (list (block b (letrec ((x (funcall (lambda () (return-from b 2))))) x)) y))"
        ),
        "(2 6)"
    );
    assert_eq!(
        eval(&mut i, "(let ((y 7)) (list (tagbody (letrec ((x (go end))) x) end) y))"),
        "(nil 7)"
    );
}

#[test]
fn specials_are_restored_on_non_local_exit() {
    let mut i = interp();
    eval(&mut i, "(defvar *s* 'outer)");
    assert_eq!(
        eval(&mut i, "(list (block b (let ((*s* 'inner)) (return-from b *s*))) *s*)"),
        "(inner outer)"
    );
    assert_eq!(i.machine.special_depth(), 0);

    eval(&mut i, "(defvar *g* 0)");
    let src = "(let ((r nil))
                 (tagbody
                    (let ((*g* 1))
                      (setq r *g*)
                      (go out))
                  out)
                 (list r *g*))";
    assert_eq!(eval(&mut i, src), "(1 0)");
    assert_eq!(i.machine.special_depth(), 0);
}

#[test]
fn specials_are_restored_after_an_error() {
    let mut i = interp();
    eval(&mut i, "(defvar *v* 0)");
    assert!(matches!(
        i.eval_str("(let ((*v* 1)) (car 5))"),
        Err(LispError::TypeError(_))
    ));
    assert_eq!(i.machine.special_depth(), 0);
    assert_eq!(eval(&mut i, "*v*"), "0");
}

#[test]
fn function_designators() {
    let mut i = interp();
    assert_eq!(eval(&mut i, "(funcall #'(lambda (x) (* 2 x)) 21)"), "42");
    assert_eq!(eval(&mut i, "(functionp #'car)"), "t");
    assert!(matches!(i.eval_str("#'when"), Err(LispError::InvalidForm { .. })));
    assert!(matches!(i.eval_str("#'block"), Err(LispError::InvalidForm { .. })));
}
