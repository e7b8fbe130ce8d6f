// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

mod eval;
mod node;
mod ring;
mod scheduler;
mod value;

pub use crate::node::{Category, Kind, Node, NodeRef};
pub use crate::value::{Item, Tuple};

use log::trace;

use crate::eval::evaluate;
use crate::scheduler::Scheduler;

/// Initial runnable-queue capacity for a fresh drive loop.
const DEFAULT_CAPACITY: usize = 32;

///
/// Drives `root` until it reaches a Complete variant (Value, Error or Cancel,
/// possibly behind an indirection), then returns.
///
/// This is a trampoline: combinator nesting is unwound into iteration over a
/// runnable queue, so arbitrarily deep graphs are driven in constant native
/// stack. Each pass dequeues one node, takes one evaluation step on it,
/// re-enqueues the node it wants driven next, records which node it blocked
/// (if any), and releases the waiters of nodes that completed. Distinct nodes
/// run in FIFO order.
///
/// Driving an already-complete node returns immediately. Dependency cycles
/// are a caller error and may not terminate.
///
pub fn run_until_completion<T: Item>(root: &NodeRef<T>) {
    trace!("driving {root:?}");

    let mut scheduler = Scheduler::new(DEFAULT_CAPACITY);
    scheduler.enqueue(root.clone());

    while let Some(top) = scheduler.dequeue() {
        let step = evaluate(&top);

        let top_is_next = step
            .next
            .as_ref()
            .is_some_and(|next| NodeRef::ptr_eq(&top, next));
        let top_is_blocked = step
            .blocked
            .as_ref()
            .is_some_and(|blocked| NodeRef::ptr_eq(&top, blocked));

        if let Some(next) = step.next {
            scheduler.enqueue(next.clone());
            if let Some(blocked) = step.blocked {
                scheduler.block_on(&next, blocked);
            }
        }

        if !top_is_next && !top_is_blocked {
            // The step returned neither reference, so it made terminal
            // progress. The exception is an indirection that delegated to a
            // still-running shared target: its waiters are released early and
            // re-block on the flattened target at their next step.
            debug_assert!(
                top.is_indirection() || top.has_category(Category::Complete),
                "released the waiters of {top:?} while it was still incomplete"
            );
            scheduler.complete(&top);
        }
    }

    trace!("drive loop complete: {root:?}");
}
