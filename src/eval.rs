// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::mem;

use log::trace;

use crate::node::{unify, Category, Kind, NodeRef, Pair, State, Thunk};
use crate::value::{Item, Tuple};

///
/// The outcome of one evaluation step.
///
/// `next` is a node to enqueue for further work (often the stepped node
/// itself, after it has been retyped). `blocked` is a node that must not be
/// re-enqueued until `next` completes. `blocked` implies `next`: a blocked
/// node is always paired with the dependency to run first.
///
pub(crate) struct Step<T: Item> {
    pub(crate) next: Option<NodeRef<T>>,
    pub(crate) blocked: Option<NodeRef<T>>,
}

impl<T: Item> Step<T> {
    /// The step made terminal progress: the node is Complete and its waiters
    /// can be released.
    fn done() -> Step<T> {
        Step {
            next: None,
            blocked: None,
        }
    }

    /// The node became a new unit of work and should be driven again.
    fn run(next: NodeRef<T>) -> Step<T> {
        Step {
            next: Some(next),
            blocked: None,
        }
    }

    /// `waiter` now waits on `dependency`; drive `dependency` first.
    fn wait_on(dependency: NodeRef<T>, waiter: NodeRef<T>) -> Step<T> {
        Step {
            next: Some(dependency),
            blocked: Some(waiter),
        }
    }
}

///
/// Takes one evaluation step on `node`, transforming it in place.
///
/// Terminal nodes are idempotent under evaluation; an indirection delegates
/// to its flattened target.
///
pub(crate) fn evaluate<T: Item>(node: &NodeRef<T>) -> Step<T> {
    trace!("evaluating {node:?}");

    match node.raw_kind() {
        Kind::Indirection => evaluate(&node.flatten()),
        Kind::Thunk => evaluate_thunk(node),
        Kind::Concat => evaluate_concat(node),
        Kind::CompleteThen => evaluate_flow(node, Decision::Complete, Polarity::Then),
        Kind::ResolvedOr => evaluate_flow(node, Decision::Resolved, Polarity::Or),
        Kind::ResolvedThen => evaluate_flow(node, Decision::Resolved, Polarity::Then),
        Kind::ValueOr => evaluate_flow(node, Decision::Value, Polarity::Or),
        Kind::ValueThen => evaluate_flow(node, Decision::Value, Polarity::Then),
        Kind::Cancel | Kind::Error | Kind::Value => Step::done(),
        Kind::Uninitialized => unreachable!("evaluated an uninitialized node"),
    }
}

fn evaluate_thunk<T: Item>(node: &NodeRef<T>) -> Step<T> {
    // Fold and inspect the dependency before consuming the thunk payload.
    let dependency = {
        let mut state = node.state_mut();
        match &mut *state {
            State::Thunk(thunk) => thunk.dependency.as_mut().map(|dep| {
                dep.fold();
                dep.clone()
            }),
            state => unreachable!("expected a thunk, found {}", state.kind().name()),
        }
    };

    if let Some(dep) = &dependency {
        if !dep.has_category(Category::Complete) {
            return Step::wait_on(dep.clone(), node.clone());
        }
        if !dep.has_kind(Kind::Value) {
            // Cancel or Error: adopt the dependency's outcome. The callback
            // and its captures are dropped unrun.
            let Thunk {
                callback,
                dependency: stored,
            } = node.take_thunk();
            mem::drop(callback);
            unify(node, stored.expect("dependency was present above"));
            return Step::done();
        }
    }

    let Thunk {
        callback,
        dependency: stored,
    } = node.take_thunk();
    let result = match &stored {
        Some(dep) => {
            let state = dep.state();
            match &*state {
                State::Value(values) => callback(values),
                state => unreachable!("expected a value dependency, found {}", state.kind().name()),
            }
        }
        None => callback(&Tuple::empty()),
    };

    unify(node, result);
    Step::run(node.clone())
}

fn evaluate_concat<T: Item>(node: &NodeRef<T>) -> Step<T> {
    let (left, right) = {
        let mut state = node.state_mut();
        let pair = state.as_pair_mut().expect("concat payload");
        pair.left.fold();
        pair.right.fold();
        (pair.left.clone(), pair.right.clone())
    };

    // Cancel dominates Error; within each, the left side wins ties.
    let take_left = if left.has_kind(Kind::Cancel) {
        Some(true)
    } else if right.has_kind(Kind::Cancel) {
        Some(false)
    } else if left.has_kind(Kind::Error) {
        Some(true)
    } else if right.has_kind(Kind::Error) {
        Some(false)
    } else {
        None
    };
    if let Some(take_left) = take_left {
        mem::drop((left, right));
        let Pair { left, right } = node.take_pair();
        let chosen = if take_left {
            mem::drop(right);
            left
        } else {
            mem::drop(left);
            right
        };
        unify(node, chosen);
        return Step::done();
    }

    if !left.has_category(Category::Complete) {
        return Step::wait_on(left, node.clone());
    }
    if !right.has_category(Category::Complete) {
        return Step::wait_on(right, node.clone());
    }

    // Both sides are Values. Drop the inspection handles first, so that a
    // source whose only remaining reference is the pair itself has its
    // payloads moved rather than cloned.
    mem::drop((left, right));
    let Pair { left, right } = node.take_pair();
    let left_values = left.take_or_clone_values();
    let right_values = right.take_or_clone_values();

    let mut values = Vec::with_capacity(left_values.len() + right_values.len());
    values.extend(left_values.into_values());
    values.extend(right_values.into_values());
    node.set(State::Value(Tuple::new(values)));
    Step::done()
}

#[derive(Clone, Copy)]
enum Decision {
    Complete,
    Resolved,
    Value,
}

impl Decision {
    fn reached<T: Item>(self, node: &NodeRef<T>) -> bool {
        match self {
            Decision::Complete => node.has_category(Category::Complete),
            Decision::Resolved => node.has_category(Category::Resolved),
            Decision::Value => node.has_kind(Kind::Value),
        }
    }
}

#[derive(Clone, Copy)]
enum Polarity {
    Then,
    Or,
}

///
/// The shared step of the flow combinators: wait for the left child to
/// complete, then either stay with it or continue with the right child,
/// depending on whether the left child reached the decision category and on
/// the combinator's polarity.
///
fn evaluate_flow<T: Item>(node: &NodeRef<T>, decision: Decision, polarity: Polarity) -> Step<T> {
    let left = {
        let mut state = node.state_mut();
        let pair = state.as_pair_mut().expect("flow combinator payload");
        pair.left.fold();
        pair.left.clone()
    };

    if !left.has_category(Category::Complete) {
        return Step::wait_on(left, node.clone());
    }

    let reached = decision.reached(&left);
    let stay_left = match polarity {
        Polarity::Then => !reached,
        Polarity::Or => reached,
    };
    mem::drop(left);

    let Pair { left, right } = node.take_pair();
    if stay_left {
        mem::drop(right);
        unify(node, left);
        Step::done()
    } else {
        mem::drop(left);
        unify(node, right);
        // The combinator just became its continuation: keep driving it.
        Step::run(node.clone())
    }
}
