// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use fnv::{FnvHashMap as HashMap, FnvHashSet as HashSet};
use log::trace;
use smallvec::SmallVec;

use crate::node::{NodeId, NodeRef};
use crate::ring::RingBuffer;
use crate::value::Item;

// Most nodes ever have a single waiter.
type Waiters<T> = SmallVec<[NodeRef<T>; 2]>;

///
/// The bookkeeping of the trampoline: a FIFO queue of runnable nodes with
/// deduplication, and a multimap from a blocking node to the nodes waiting
/// on it.
///
/// The queue owns a reference to every enqueued node, and the multimap owns a
/// reference to every waiter; both are released as entries are drained. Nodes
/// are keyed by identity: the retyping a node undergoes while it runs never
/// changes its key.
///
pub(crate) struct Scheduler<T: Item> {
    runnable: RingBuffer<NodeRef<T>>,
    enqueued: HashSet<NodeId>,
    blocked: HashMap<NodeId, Waiters<T>>,
}

impl<T: Item> Scheduler<T> {
    pub(crate) fn new(initial_capacity: usize) -> Scheduler<T> {
        let mut runnable = RingBuffer::new();
        runnable.grow(initial_capacity);
        Scheduler {
            runnable,
            enqueued: HashSet::default(),
            blocked: HashMap::default(),
        }
    }

    ///
    /// Appends `node` to the runnable queue, unless it is already queued.
    ///
    pub(crate) fn enqueue(&mut self, node: NodeRef<T>) {
        if !self.enqueued.insert(node.id()) {
            trace!("enqueue of {node:?} skipped: already queued");
            return;
        }
        trace!("enqueue {:?} (queued: {})", node, self.runnable.len() + 1);
        self.runnable.enqueue(node);
    }

    ///
    /// Removes and returns the oldest runnable node, or None when the queue
    /// is empty.
    ///
    pub(crate) fn dequeue(&mut self) -> Option<NodeRef<T>> {
        let node = self.runnable.dequeue()?;
        let was_enqueued = self.enqueued.remove(&node.id());
        debug_assert!(
            was_enqueued,
            "dequeued {node:?}, which was missing from the enqueued set"
        );
        trace!("dequeue {node:?}");
        Some(node)
    }

    ///
    /// Records that `waiter` must not run again until `dependency` completes.
    ///
    pub(crate) fn block_on(&mut self, dependency: &NodeRef<T>, waiter: NodeRef<T>) {
        trace!("{waiter:?} blocks on {dependency:?}");
        self.blocked.entry(dependency.id()).or_default().push(waiter);
    }

    ///
    /// Releases every waiter registered against `node` into the runnable
    /// queue, in the order they blocked.
    ///
    pub(crate) fn complete(&mut self, node: &NodeRef<T>) {
        if let Some(waiters) = self.blocked.remove(&node.id()) {
            trace!("complete {:?}: releasing {} waiter(s)", node, waiters.len());
            for waiter in waiters {
                self.enqueue(waiter);
            }
        }
    }
}
