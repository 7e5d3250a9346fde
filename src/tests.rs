//! End-to-end scenarios exercising several components together.

use std::cell::Cell;
use std::rc::Rc;

use matches::assert_matches;

use crate::ast::Sexp;
use crate::deferred::DeferredQueue;
use crate::region::{RegionCtx, RegionError};
use crate::scc::SccRegistry;
use crate::shape::{Shape, ShapeCtx};
use crate::strategy::ReclaimStrategy;
use crate::sym::SymHeap;
use crate::Arena;

struct DropCounter(Rc<Cell<usize>>);

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}

fn list(items: Vec<Sexp>) -> Sexp {
    Sexp::list(items)
}

/// `(letrec ((x (cons 1 x))) x)` — the recursive binding must come out
/// cyclic after the fixpoint.
#[test]
fn letrec_cycle_is_classified_cyclic() {
    let program = [list(vec![
        Sexp::sym("letrec"),
        list(vec![list(vec![
            Sexp::sym("x"),
            list(vec![Sexp::sym("cons"), Sexp::int(1), Sexp::sym("x")]),
        ])]),
        Sexp::sym("x"),
    ])];

    let mut ctx = ShapeCtx::new();
    let result = ctx.analyze_fixpoint(&program);

    assert_eq!(result, Shape::Cyclic);
    assert_eq!(ctx.find("x"), Some(Shape::Cyclic));
    assert!(!ctx.changed());
}

/// Two singletons before the mutation, one two-element SCC after it.
#[test]
fn scc_recomputation_after_mutation() {
    let mut reg = SccRegistry::new();
    let n1 = reg.insert("n1");
    let n2 = reg.insert("n2");
    reg.set_children(n1, Some(n2), None);

    assert_eq!(reg.compute(n1).len(), 2);

    reg.set_children(n2, Some(n1), None);
    let recomputed = reg.compute(n1);
    assert_eq!(recomputed.len(), 1);
    assert_eq!(reg.find(recomputed[0]).unwrap().members().len(), 2);
}

/// Inner regions may reference outer ones; the reverse is rejected.
#[test]
fn region_reference_direction() {
    unsafe fn nop(_: *mut u8) {}

    let mut ctx = RegionCtx::new();
    let outer = unsafe { ctx.alloc(0x10 as *mut u8, nop) };
    ctx.enter();
    let inner = unsafe { ctx.alloc(0x20 as *mut u8, nop) };

    assert!(ctx.create_ref(inner, outer).is_ok());
    assert_matches!(ctx.create_ref(outer, inner), Err(RegionError::ScopeViolation));
}

/// A registered external is released exactly once by arena destruction.
#[test]
fn arena_destruction_releases_externals() {
    unsafe fn decrement(ptr: *mut u8) {
        *(ptr as *mut i64) -= 1;
    }

    let mut counter: i64 = 3;
    {
        let arena = Arena::new();
        let tree = arena.alloc(64).unwrap();
        unsafe {
            std::ptr::write(tree.as_ptr() as *mut u64, 17);
            arena.register_external(&mut counter as *mut i64 as *mut u8, decrement);
        }
    }

    assert_eq!(counter, 2);
}

/// 100 defers of one object coalesce into a single entry that a single
/// flush drains with 100 real decrements.
#[test]
fn deferred_decrements_coalesce_and_drain() {
    let mut heap = SymHeap::new();
    let drops = Rc::new(Cell::new(0));
    let obj = heap.insert(DropCounter(drops.clone()));
    for _ in 0..100 {
        heap.inc_external(obj);
    }

    let marker = 0u8;
    let mut queue = DeferredQueue::with_batch_size(8);
    for _ in 0..100 {
        queue.defer(&marker as *const u8);
    }
    assert_eq!(queue.pending_count(), 1);
    assert_eq!(queue.total_deferred(), 100);

    let mut applied = 0;
    queue.flush(|_| {
        heap.dec_external(obj);
        applied += 1;
    });

    assert_eq!(applied, 100);
    assert_eq!(queue.pending_count(), 0);
    // the hundredth decrement destroyed the object
    assert_eq!(drops.get(), 1);
    assert!(!heap.contains(obj));
}

/// A transferred object keeps its count across the channel and is freed
/// exactly once by the final decrement.
#[cfg(feature = "std")]
#[test]
fn channel_transfer_frees_exactly_once() {
    use crate::concurrent::{Channel, ConcRef};

    let drops = Rc::new(Cell::new(0));
    let channel = Channel::with_capacity(10);

    let obj = ConcRef::new(DropCounter(drops.clone()));
    assert_eq!(obj.ref_count(), 1);
    channel.send(obj).unwrap();

    let obj = channel.recv().unwrap();
    assert_eq!(obj.ref_count(), 1);
    assert_eq!(drops.get(), 0);

    drop(obj);
    assert_eq!(drops.get(), 1);
}

/// `D → A → B → C → A` yields one SCC of size 3 and one singleton.
#[test]
fn scc_cycle_with_tail() {
    let mut reg = SccRegistry::new();
    let a = reg.insert("a");
    let b = reg.insert("b");
    let c = reg.insert("c");
    let d = reg.insert("d");
    reg.set_children(d, Some(a), None);
    reg.set_children(a, Some(b), None);
    reg.set_children(b, Some(c), None);
    reg.set_children(c, Some(a), None);

    let sccs = reg.compute(d);
    assert_eq!(sccs.len(), 2);

    let mut sizes: Vec<_> = sccs.iter().map(|id| reg.find(*id).unwrap().members().len()).collect();
    sizes.sort_unstable();
    assert_eq!(sizes, vec![1, 3]);
}

/// Analyzer output drives the per-binding reclamation primitives: trees
/// die with their arena, cyclic values go through deferral and group
/// release.
#[test]
fn strategies_follow_analyzed_shapes() {
    let program = [
        // (let ((t (cons 1 2))) t)
        list(vec![
            Sexp::sym("let"),
            list(vec![list(vec![
                Sexp::sym("t"),
                list(vec![Sexp::sym("cons"), Sexp::int(1), Sexp::int(2)]),
            ])]),
            Sexp::sym("t"),
        ]),
        // (let ((d (cons s s))) d)
        list(vec![
            Sexp::sym("let"),
            list(vec![list(vec![
                Sexp::sym("d"),
                list(vec![Sexp::sym("cons"), Sexp::sym("s"), Sexp::sym("s")]),
            ])]),
            Sexp::sym("d"),
        ]),
        // (letrec ((c (cons 1 c))) c)
        list(vec![
            Sexp::sym("letrec"),
            list(vec![list(vec![
                Sexp::sym("c"),
                list(vec![Sexp::sym("cons"), Sexp::int(1), Sexp::sym("c")]),
            ])]),
            Sexp::sym("c"),
        ]),
    ];

    let mut ctx = ShapeCtx::new();
    ctx.analyze_fixpoint(&program);

    assert_eq!(ctx.find("t").map(Shape::free_strategy), Some(ReclaimStrategy::FreeTree));
    assert_eq!(ctx.find("d").map(Shape::free_strategy), Some(ReclaimStrategy::DecRef));
    assert_eq!(
        ctx.find("c").map(Shape::free_strategy),
        Some(ReclaimStrategy::DeferredRelease)
    );

    // the tree binding lives in an arena and dies with it
    let arena = Arena::new();
    assert!(arena.alloc(16).is_some());
    drop(arena);

    // the cyclic binding is grouped and collected via deferral
    let drops = Rc::new(Cell::new(0));
    let mut reg = SccRegistry::new();
    let cell = reg.insert(DropCounter(drops.clone()));
    reg.set_children(cell, Some(cell), None);
    let group = reg.compute(cell)[0];

    let mut queue = DeferredQueue::new();
    queue.defer(&group as *const _);
    queue.flush(|_| reg.release(group));

    assert_eq!(drops.get(), 1);
    assert!(!reg.contains(cell));
}
