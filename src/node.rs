// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::mem;
use std::rc::Rc;

use log::trace;

use crate::value::{Item, Tuple};

///
/// The callback of a thunk node.
///
/// Invoked at most once, with the values of the thunk's dependency (or the
/// empty tuple when there is none), and consumed by the invocation. If the
/// thunk adopts a Cancel or Error outcome from its dependency instead, the
/// callback is dropped unrun together with anything it captured.
///
pub(crate) type ThunkCallback<T> = Box<dyn FnOnce(&Tuple<T>) -> NodeRef<T>>;

///
/// A variant tag for a node.
///
/// The dashed `name` of each variant is part of the stable contract; the
/// discriminant values are not.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    Uninitialized,
    Indirection,
    Thunk,
    Concat,
    CompleteThen,
    ResolvedOr,
    ResolvedThen,
    ValueOr,
    ValueThen,
    Cancel,
    Error,
    Value,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Uninitialized => "uninitialized",
            Kind::Indirection => "indirection",
            Kind::Thunk => "thunk",
            Kind::Concat => "concat",
            Kind::CompleteThen => "complete-then",
            Kind::ResolvedOr => "resolved-or",
            Kind::ResolvedThen => "resolved-then",
            Kind::ValueOr => "value-or",
            Kind::ValueThen => "value-then",
            Kind::Cancel => "cancel",
            Kind::Error => "error",
            Kind::Value => "value",
        }
    }

    pub fn category(self) -> Category {
        match self {
            Kind::Uninitialized => Category::Uninitialized,
            Kind::Indirection
            | Kind::Thunk
            | Kind::Concat
            | Kind::CompleteThen
            | Kind::ResolvedOr
            | Kind::ResolvedThen
            | Kind::ValueOr
            | Kind::ValueThen => Category::Initialized,
            Kind::Cancel => Category::Complete,
            Kind::Error | Kind::Value => Category::Resolved,
        }
    }
}

///
/// The monotone classification of node variants: once a node enters a
/// category it never leaves it. A node "has" a category C iff the category
/// of its variant is at least C.
///
/// `Value` and `Error` are both Resolved; `Cancel` is Complete but not
/// Resolved.
///
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum Category {
    Uninitialized,
    Initialized,
    Complete,
    Resolved,
}

pub(crate) struct Thunk<T: Item> {
    pub(crate) callback: ThunkCallback<T>,
    pub(crate) dependency: Option<NodeRef<T>>,
}

pub(crate) struct Pair<T: Item> {
    pub(crate) left: NodeRef<T>,
    pub(crate) right: NodeRef<T>,
}

///
/// The tagged sum behind every node. `Uninitialized` is the cleared or
/// moved-from state: it is never observable through the public constructors,
/// but exists between `take_state` and `set` while a node is being retyped.
///
pub(crate) enum State<T: Item> {
    Uninitialized,
    Indirection(NodeRef<T>),
    Thunk(Thunk<T>),
    Concat(Pair<T>),
    CompleteThen(Pair<T>),
    ResolvedOr(Pair<T>),
    ResolvedThen(Pair<T>),
    ValueOr(Pair<T>),
    ValueThen(Pair<T>),
    Cancel,
    Error(T),
    Value(Tuple<T>),
}

impl<T: Item> State<T> {
    pub(crate) fn kind(&self) -> Kind {
        match self {
            State::Uninitialized => Kind::Uninitialized,
            State::Indirection(_) => Kind::Indirection,
            State::Thunk(_) => Kind::Thunk,
            State::Concat(_) => Kind::Concat,
            State::CompleteThen(_) => Kind::CompleteThen,
            State::ResolvedOr(_) => Kind::ResolvedOr,
            State::ResolvedThen(_) => Kind::ResolvedThen,
            State::ValueOr(_) => Kind::ValueOr,
            State::ValueThen(_) => Kind::ValueThen,
            State::Cancel => Kind::Cancel,
            State::Error(_) => Kind::Error,
            State::Value(_) => Kind::Value,
        }
    }

    pub(crate) fn as_pair_mut(&mut self) -> Option<&mut Pair<T>> {
        match self {
            State::Concat(pair)
            | State::CompleteThen(pair)
            | State::ResolvedOr(pair)
            | State::ResolvedThen(pair)
            | State::ValueOr(pair)
            | State::ValueThen(pair) => Some(pair),
            _ => None,
        }
    }
}

///
/// One vertex of an async computation graph: a tagged variant behind a
/// reference count.
///
/// Nodes are shared through `NodeRef` handles and mutated in place, by
/// evaluation steps and by `unify`. There is no synchronization: the graph
/// belongs to the single thread that drives it.
///
pub struct Node<T: Item> {
    state: RefCell<State<T>>,
}

///
/// An owning handle on a `Node`. Cloning takes a reference; dropping releases
/// one, destroying the payload when the last handle goes away.
///
pub struct NodeRef<T: Item>(Rc<Node<T>>);

impl<T: Item> Clone for NodeRef<T> {
    fn clone(&self) -> NodeRef<T> {
        NodeRef(self.0.clone())
    }
}

///
/// The identity of a node allocation, used to key scheduler state. Stable for
/// as long as any handle on the node is live.
///
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub(crate) struct NodeId(usize);

impl<T: Item> NodeRef<T> {
    fn from_state(state: State<T>) -> NodeRef<T> {
        NodeRef(Rc::new(Node {
            state: RefCell::new(state),
        }))
    }

    ///
    /// A terminal node signalling cooperative abandonment. Carries no payload.
    ///
    pub fn cancel() -> NodeRef<T> {
        Self::from_state(State::Cancel)
    }

    ///
    /// A terminal node carrying an error payload.
    ///
    pub fn error(error: T) -> NodeRef<T> {
        Self::from_state(State::Error(error))
    }

    ///
    /// A terminal node carrying a tuple of values.
    ///
    pub fn value(values: Tuple<T>) -> NodeRef<T> {
        Self::from_state(State::Value(values))
    }

    ///
    /// A lazy node: waits for `dependency` (if any) to produce values, then
    /// invokes `callback` with them and becomes the node the callback returns.
    ///
    /// A Cancel or Error outcome of the dependency propagates instead, and the
    /// callback never runs.
    ///
    pub fn thunk(
        dependency: Option<NodeRef<T>>,
        callback: impl FnOnce(&Tuple<T>) -> NodeRef<T> + 'static,
    ) -> NodeRef<T> {
        let mut dependency = dependency;
        if let Some(dep) = dependency.as_mut() {
            dep.fold();
        }
        Self::from_state(State::Thunk(Thunk {
            callback: Box::new(callback),
            dependency,
        }))
    }

    ///
    /// Waits for both children to produce values, then becomes a Value whose
    /// tuple is the concatenation of the two. Cancel dominates Error; on a
    /// tie within either, the left side wins.
    ///
    pub fn concat(left: NodeRef<T>, right: NodeRef<T>) -> NodeRef<T> {
        Self::binary(State::Concat, left, right)
    }

    ///
    /// Runs `left`, then always continues with `right`.
    ///
    pub fn complete_then(left: NodeRef<T>, right: NodeRef<T>) -> NodeRef<T> {
        Self::binary(State::CompleteThen, left, right)
    }

    ///
    /// Runs `left`; keeps it if it resolved (Value or Error), falls back to
    /// `right` if it was cancelled.
    ///
    pub fn resolved_or(left: NodeRef<T>, right: NodeRef<T>) -> NodeRef<T> {
        Self::binary(State::ResolvedOr, left, right)
    }

    ///
    /// Runs `left`; continues with `right` if it resolved (Value or Error),
    /// stays cancelled if it was cancelled.
    ///
    pub fn resolved_then(left: NodeRef<T>, right: NodeRef<T>) -> NodeRef<T> {
        Self::binary(State::ResolvedThen, left, right)
    }

    ///
    /// Runs `left`; keeps it if it produced values, falls back to `right` on
    /// Error or Cancel.
    ///
    pub fn value_or(left: NodeRef<T>, right: NodeRef<T>) -> NodeRef<T> {
        Self::binary(State::ValueOr, left, right)
    }

    ///
    /// Runs `left`; continues with `right` if it produced values, keeps the
    /// Error or Cancel outcome otherwise.
    ///
    pub fn value_then(left: NodeRef<T>, right: NodeRef<T>) -> NodeRef<T> {
        Self::binary(State::ValueThen, left, right)
    }

    fn binary(
        variant: fn(Pair<T>) -> State<T>,
        mut left: NodeRef<T>,
        mut right: NodeRef<T>,
    ) -> NodeRef<T> {
        left.fold();
        right.fold();
        Self::from_state(variant(Pair { left, right }))
    }

    ///
    /// True if `a` and `b` are handles on the same node allocation.
    ///
    pub fn ptr_eq(a: &NodeRef<T>, b: &NodeRef<T>) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    ///
    /// The number of live handles on this node.
    ///
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub(crate) fn id(&self) -> NodeId {
        NodeId(Rc::as_ptr(&self.0) as usize)
    }

    pub(crate) fn state(&self) -> Ref<'_, State<T>> {
        self.0.state.borrow()
    }

    pub(crate) fn state_mut(&self) -> RefMut<'_, State<T>> {
        self.0.state.borrow_mut()
    }

    /// The variant of this node itself, without following indirections.
    pub(crate) fn raw_kind(&self) -> Kind {
        self.state().kind()
    }

    pub(crate) fn is_indirection(&self) -> bool {
        self.raw_kind() == Kind::Indirection
    }

    ///
    /// The variant this node represents, after following indirections.
    ///
    /// Never `Kind::Indirection`: an indirection reports its target's variant.
    ///
    pub fn kind(&self) -> Kind {
        self.flatten().raw_kind()
    }

    pub fn category(&self) -> Category {
        self.kind().category()
    }

    pub fn has_kind(&self, kind: Kind) -> bool {
        self.kind() == kind
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.category() >= category
    }

    ///
    /// If this node (after indirections) is a Value, a clone of its tuple.
    ///
    pub fn peek_value(&self) -> Option<Tuple<T>> {
        let target = self.flatten();
        let state = target.state();
        match &*state {
            State::Value(values) => Some(values.clone()),
            _ => None,
        }
    }

    ///
    /// If this node (after indirections) is an Error, a clone of its payload.
    ///
    pub fn peek_error(&self) -> Option<T> {
        let target = self.flatten();
        let state = target.state();
        match &*state {
            State::Error(error) => Some(error.clone()),
            _ => None,
        }
    }

    ///
    /// The unique non-Indirection node reachable from this one.
    ///
    /// Performs path compression: every indirection along the walked chain is
    /// re-pointed directly at the terminal target, so that a later walk from
    /// the same node takes at most one hop. Intermediate nodes lose their
    /// incoming references and are freed if nothing else holds them.
    ///
    /// Cycles of indirections are a caller error and do not terminate.
    ///
    pub(crate) fn flatten(&self) -> NodeRef<T> {
        let mut target = match &*self.state() {
            State::Indirection(target) => target.clone(),
            _ => return self.clone(),
        };
        loop {
            let next = match &*target.state() {
                State::Indirection(next) => next.clone(),
                _ => break,
            };
            target = next;
        }

        let mut cursor = self.clone();
        while !NodeRef::ptr_eq(&cursor, &target) {
            let next = match &mut *cursor.state_mut() {
                State::Indirection(slot) => mem::replace(slot, target.clone()),
                _ => break,
            };
            cursor = next;
        }

        target
    }

    ///
    /// Re-points this handle at its flattened target, dropping the reference
    /// on the indirection it skipped.
    ///
    pub(crate) fn fold(&mut self) {
        let target = self.flatten();
        if !NodeRef::ptr_eq(self, &target) {
            *self = target;
        }
    }

    pub(crate) fn clear(&self) {
        *self.state_mut() = State::Uninitialized;
    }

    pub(crate) fn set(&self, state: State<T>) {
        debug_assert!(
            self.raw_kind() == Kind::Uninitialized,
            "retyped {self:?} without clearing it first"
        );
        *self.state_mut() = state;
    }

    pub(crate) fn take_state(&self) -> State<T> {
        mem::replace(&mut *self.state_mut(), State::Uninitialized)
    }

    pub(crate) fn take_pair(&self) -> Pair<T> {
        match self.take_state() {
            State::Concat(pair)
            | State::CompleteThen(pair)
            | State::ResolvedOr(pair)
            | State::ResolvedThen(pair)
            | State::ValueOr(pair)
            | State::ValueThen(pair) => pair,
            state => unreachable!("expected a binary node, found {}", state.kind().name()),
        }
    }

    pub(crate) fn take_thunk(&self) -> Thunk<T> {
        match self.take_state() {
            State::Thunk(thunk) => thunk,
            state => unreachable!("expected a thunk, found {}", state.kind().name()),
        }
    }

    ///
    /// Consumes one handle on a Value node, returning its tuple: moved out of
    /// the node when this was the last handle, cloned otherwise.
    ///
    pub(crate) fn take_or_clone_values(self) -> Tuple<T> {
        match Rc::try_unwrap(self.0) {
            Ok(node) => match node.state.into_inner() {
                State::Value(values) => values,
                state => unreachable!("expected a value node, found {}", state.kind().name()),
            },
            Err(shared) => {
                let shared = NodeRef(shared);
                let state = shared.state();
                match &*state {
                    State::Value(values) => values.clone(),
                    state => unreachable!("expected a value node, found {}", state.kind().name()),
                }
            }
        }
    }
}

///
/// Retypes `node` in place so that it represents the same result as `other`,
/// without allocating.
///
/// The by-value `other` handle keeps the target alive while `node`'s previous
/// payload (which may hold the only other references to it) is dropped. Then:
///
///   - if `other` is (an indirection to) Cancel, `node` becomes Cancel, which
///     is payload-free, so the common cancellation case stays allocation-free;
///   - if the consumed handle was the last one, `other`'s variant is moved
///     into `node` in place;
///   - otherwise `node` becomes an indirection to the flattened `other`, so a
///     shared result is never copied.
///
pub(crate) fn unify<T: Item>(node: &NodeRef<T>, other: NodeRef<T>) {
    if NodeRef::ptr_eq(node, &other) {
        return;
    }
    trace!("unify {node:?} with {other:?}");

    node.clear();

    if other.has_kind(Kind::Cancel) {
        node.set(State::Cancel);
        return;
    }

    match Rc::try_unwrap(other.0) {
        Ok(sole) => node.set(sole.state.into_inner()),
        Err(shared) => {
            let target = NodeRef(shared).flatten();
            node.set(State::Indirection(target));
        }
    }
}

impl<T: Item> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Node {:#x} {}>", self.id().0, self.raw_kind().name())
    }
}
