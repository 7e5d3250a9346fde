//! Static shape analysis over the s-expression AST.
//!
//! Every binding is classified over the four-point lattice
//! `unknown ⊑ tree ⊑ dag ⊑ cyclic`. The analysis is a monotone dataflow:
//! per-binding facts only ever move up the lattice, a `changed` flag
//! records strict increases and the driver re-analyzes the program until
//! the flag stays clear. The resulting shapes drive the reclamation
//! strategy choice at every allocation site.

mod analysis;

#[cfg(not(feature = "std"))]
use alloc::string::{String, ToString};

use core::fmt;

use hashbrown::HashMap;

use crate::ast::Sexp;
use crate::strategy::ReclaimStrategy;

////////////////////////////////////////////////////////////////////////////////////////////////////
// Shape
////////////////////////////////////////////////////////////////////////////////////////////////////

/// Static over-approximation of a value's reachability structure.
///
/// The variant order is the lattice order; [`join`][Shape::join] is the
/// least upper bound.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Shape {
    /// Not yet analyzed (lattice bottom).
    Unknown,
    /// No sharing: every node has exactly one owner.
    Tree,
    /// Sharing without cycles.
    Dag,
    /// Cycles possible (lattice top).
    Cyclic,
}

/********** impl inherent *************************************************************************/

impl Shape {
    /// Returns the least upper bound of `self` and `other`.
    #[inline]
    pub fn join(self, other: Self) -> Self {
        if self >= other {
            self
        } else {
            other
        }
    }

    /// Returns the lower-case name of the shape.
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Shape::Unknown => "unknown",
            Shape::Tree => "tree",
            Shape::Dag => "dag",
            Shape::Cyclic => "cyclic",
        }
    }

    /// Returns the reclamation strategy selected for values of this shape.
    #[inline]
    pub fn free_strategy(self) -> ReclaimStrategy {
        ReclaimStrategy::for_shape(self)
    }
}

/********** impl Default **************************************************************************/

impl Default for Shape {
    #[inline]
    fn default() -> Self {
        Shape::Unknown
    }
}

/********** impl Display **************************************************************************/

impl fmt::Display for Shape {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////
// ShapeCtx
////////////////////////////////////////////////////////////////////////////////////////////////////

/// The per-analysis context: binding facts, the monotone `changed` flag and
/// the shape of the most recently analyzed expression.
///
/// The context is single-threaded; analyses of different programs use
/// separate contexts.
#[derive(Debug, Default)]
pub struct ShapeCtx {
    bindings: HashMap<String, Shape>,
    changed: bool,
    result_shape: Shape,
}

/********** impl inherent *************************************************************************/

impl ShapeCtx {
    /// Creates an empty context.
    #[inline]
    pub fn new() -> Self {
        Self { bindings: HashMap::new(), changed: false, result_shape: Shape::Unknown }
    }

    /// Analyzes `expr`, recording binding facts, and returns its shape.
    ///
    /// The result is also stored and readable via
    /// [`result_shape`][Self::result_shape].
    pub fn analyze(&mut self, expr: &Sexp) -> Shape {
        let shape = analysis::run(self, expr, true);
        self.result_shape = shape;
        shape
    }

    /// Re-analyzes `program` until the binding facts reach a fixpoint and
    /// returns the shape of the final form.
    ///
    /// Termination is guaranteed: facts move monotonically up a finite
    /// lattice, so only finitely many iterations can set `changed`.
    pub fn analyze_fixpoint(&mut self, program: &[Sexp]) -> Shape {
        loop {
            self.changed = false;
            for expr in program {
                self.analyze(expr);
            }
            if !self.changed {
                return self.result_shape;
            }
        }
    }

    /// Computes the shape of `expr` without recording any binding facts.
    #[inline]
    pub fn lookup(&mut self, expr: &Sexp) -> Shape {
        analysis::run(self, expr, false)
    }

    /// Joins `shape` into the fact for `name`; a strict increase sets the
    /// `changed` flag.
    pub fn add(&mut self, name: &str, shape: Shape) {
        match self.bindings.get_mut(name) {
            Some(fact) => {
                let joined = fact.join(shape);
                if joined > *fact {
                    *fact = joined;
                    self.changed = true;
                }
            }
            None => {
                self.bindings.insert(name.to_string(), shape);
                if shape > Shape::Unknown {
                    self.changed = true;
                }
            }
        }
    }

    /// Returns the current fact for `name`.
    #[inline]
    pub fn find(&self, name: &str) -> Option<Shape> {
        self.bindings.get(name).copied()
    }

    /// Returns the shape computed by the most recent
    /// [`analyze`][Self::analyze] call.
    #[inline]
    pub fn result_shape(&self) -> Shape {
        self.result_shape
    }

    /// Returns `true` if any fact strictly increased since the flag was
    /// last cleared by [`analyze_fixpoint`][Self::analyze_fixpoint].
    #[inline]
    pub fn changed(&self) -> bool {
        self.changed
    }

    /// Conservatively decides whether the values of `a` and `b` may be the
    /// same object.
    ///
    /// The same symbol trivially aliases itself; two distinct literals or
    /// two constructions with different heads cannot alias; everything
    /// else is conservatively assumed to alias.
    pub fn may_alias(&self, a: &Sexp, b: &Sexp) -> bool {
        match (a, b) {
            (Sexp::Sym(_), _) | (_, Sexp::Sym(_)) => true,
            (Sexp::Int(x), Sexp::Int(y)) => x == y,
            (Sexp::Nil, Sexp::Nil) => true,
            (Sexp::Pair(..), Sexp::Pair(..)) => match (a.head_symbol(), b.head_symbol()) {
                (Some(head_a), Some(head_b)) => head_a == head_b,
                _ => true,
            },
            _ => false,
        }
    }
}
