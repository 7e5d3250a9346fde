//! The iterative analysis engine.
//!
//! Cyclic and merely deep structures alike forbid recursing over AST
//! pointers, so evaluation runs over an explicit pair of stacks: `tasks`
//! holds pending control steps, `values` the shapes of already analyzed
//! subexpressions. Compound forms are planned in execution order and
//! pushed reversed.

#[cfg(not(feature = "std"))]
use alloc::{vec, vec::Vec};

use crate::ast::Sexp;

use super::{Shape, ShapeCtx};

enum Task<'a> {
    /// Analyze an expression and push its shape.
    Eval(&'a Sexp),
    /// Push a constant shape.
    Push(Shape),
    /// Pop and drop one shape.
    Discard,
    /// Pop two shapes, push their join.
    Join2,
    /// Pop the shapes of both `cons` operands, push the cell's shape.
    FinishCons { alias: bool },
    /// Pop the initializer shape and record it as the fact for a binding.
    Bind(&'a str),
    /// Pop the assigned value's shape, force the target cyclic, push
    /// cyclic.
    FinishSet(&'a str),
}

/// Analyzes `expr` against `ctx` and returns its shape.
///
/// With `record` unset the engine reads existing facts but writes none
/// (the non-binding `lookup` mode).
pub(super) fn run(ctx: &mut ShapeCtx, expr: &Sexp, record: bool) -> Shape {
    let mut tasks = vec![Task::Eval(expr)];
    let mut values = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Eval(expr) => eval(ctx, expr, record, &mut tasks),
            Task::Push(shape) => values.push(shape),
            Task::Discard => {
                pop(&mut values);
            }
            Task::Join2 => {
                let b = pop(&mut values);
                let a = pop(&mut values);
                values.push(a.join(b));
            }
            Task::FinishCons { alias } => {
                let b = pop(&mut values);
                let a = pop(&mut values);
                values.push(cons_shape(a, b, alias));
            }
            Task::Bind(name) => {
                let shape = pop(&mut values);
                if record {
                    ctx.add(name, shape);
                }
            }
            Task::FinishSet(name) => {
                pop(&mut values);
                if record {
                    ctx.add(name, Shape::Cyclic);
                }
                values.push(Shape::Cyclic);
            }
        }
    }

    debug_assert_eq!(values.len(), 1, "analysis left an unbalanced value stack");
    pop(&mut values)
}

#[inline]
fn pop(values: &mut Vec<Shape>) -> Shape {
    debug_assert!(!values.is_empty(), "analysis popped an empty value stack");
    values.pop().unwrap_or(Shape::Unknown)
}

/// The shape of `(cons a b)`.
///
/// A cyclic operand makes the cell cyclic; aliasing operands introduce
/// sharing and force at least a dag; otherwise the cell is as shaped as
/// its worse operand.
#[inline]
fn cons_shape(a: Shape, b: Shape, alias: bool) -> Shape {
    let joined = a.join(b);
    if joined == Shape::Cyclic {
        Shape::Cyclic
    } else if alias {
        joined.join(Shape::Dag)
    } else {
        joined
    }
}

/// Evaluates one expression: atoms resolve immediately, compound forms are
/// planned onto the task stack.
fn eval<'a>(ctx: &mut ShapeCtx, expr: &'a Sexp, record: bool, tasks: &mut Vec<Task<'a>>) {
    match expr {
        Sexp::Int(_) | Sexp::Nil => tasks.push(Task::Push(Shape::Tree)),
        Sexp::Sym(name) => {
            let fact = ctx.find(name).unwrap_or(Shape::Tree);
            tasks.push(Task::Push(fact));
        }
        Sexp::Pair(..) => {
            let plan = plan_form(ctx, expr, record);
            tasks.extend(plan.into_iter().rev());
        }
    }
}

/// Plans a compound form in execution order.
fn plan_form<'a>(ctx: &mut ShapeCtx, form: &'a Sexp, record: bool) -> Vec<Task<'a>> {
    match form.head_symbol() {
        Some("cons") => plan_cons(ctx, form),
        Some("let") => plan_let(ctx, form, false, record),
        Some("letrec") => plan_let(ctx, form, true, record),
        Some("set!") => plan_set(form),
        Some("if") => plan_if(form),
        Some("lambda") => plan_lambda(form),
        Some("lift") => match nth(form, 1) {
            Some(arg) => vec![Task::Eval(arg)],
            None => vec![Task::Push(Shape::Unknown)],
        },
        _ => plan_application(form),
    }
}

fn plan_cons<'a>(ctx: &ShapeCtx, form: &'a Sexp) -> Vec<Task<'a>> {
    match (nth(form, 1), nth(form, 2)) {
        (Some(a), Some(b)) => {
            let alias = ctx.may_alias(a, b);
            vec![Task::Eval(a), Task::Eval(b), Task::FinishCons { alias }]
        }
        _ => vec![Task::Push(Shape::Unknown)],
    }
}

fn plan_let<'a>(
    ctx: &mut ShapeCtx,
    form: &'a Sexp,
    recursive: bool,
    record: bool,
) -> Vec<Task<'a>> {
    let mut items = form.list_items();
    let _head = items.next();
    let bindings = match items.next() {
        Some(bindings) => bindings,
        None => return vec![Task::Push(Shape::Unknown)],
    };

    // letrec: every bound name is pessimized to cyclic before any
    // initializer is looked at
    if recursive && record {
        for binding in bindings.list_items() {
            if let Some(name) = binding.car().and_then(Sexp::as_sym) {
                ctx.add(name, Shape::Cyclic);
            }
        }
    }

    let mut plan = Vec::new();
    for binding in bindings.list_items() {
        let name = binding.car().and_then(Sexp::as_sym);
        let init = nth(binding, 1);
        if let (Some(name), Some(init)) = (name, init) {
            plan.push(Task::Eval(init));
            plan.push(Task::Bind(name));
        }
    }

    plan_body(items, &mut plan);
    plan
}

fn plan_set<'a>(form: &'a Sexp) -> Vec<Task<'a>> {
    let target = nth(form, 1).and_then(Sexp::as_sym);
    match (target, nth(form, 2)) {
        (Some(name), Some(value)) => vec![Task::Eval(value), Task::FinishSet(name)],
        _ => vec![Task::Push(Shape::Unknown)],
    }
}

fn plan_if<'a>(form: &'a Sexp) -> Vec<Task<'a>> {
    let cond = nth(form, 1);
    let then = nth(form, 2);
    match (cond, then) {
        (Some(cond), Some(then)) => {
            let mut plan = vec![Task::Eval(cond), Task::Discard, Task::Eval(then)];
            match nth(form, 3) {
                Some(alt) => plan.push(Task::Eval(alt)),
                // a missing alternative evaluates to nil
                None => plan.push(Task::Push(Shape::Tree)),
            }
            plan.push(Task::Join2);
            plan
        }
        _ => vec![Task::Push(Shape::Unknown)],
    }
}

fn plan_lambda<'a>(form: &'a Sexp) -> Vec<Task<'a>> {
    let mut items = form.list_items();
    let _head = items.next();
    let _params = items.next();

    // the closure header itself is a tree; the body is analyzed only for
    // the facts it contributes
    let mut plan = Vec::new();
    for body in items {
        plan.push(Task::Eval(body));
        plan.push(Task::Discard);
    }
    plan.push(Task::Push(Shape::Tree));
    plan
}

fn plan_application<'a>(form: &'a Sexp) -> Vec<Task<'a>> {
    let mut plan = Vec::new();
    for item in form.list_items() {
        plan.push(Task::Eval(item));
        plan.push(Task::Discard);
    }
    plan.push(Task::Push(Shape::Unknown));
    plan
}

#[inline]
fn nth(form: &Sexp, n: usize) -> Option<&Sexp> {
    form.list_items().nth(n)
}

fn plan_body<'a>(body: impl Iterator<Item = &'a Sexp>, plan: &mut Vec<Task<'a>>) {
    let mut any = false;
    let mut first = true;
    for form in body {
        if !first {
            plan.push(Task::Discard);
        }
        plan.push(Task::Eval(form));
        first = false;
        any = true;
    }
    if !any {
        // an empty body evaluates to nil
        plan.push(Task::Push(Shape::Tree));
    }
}
