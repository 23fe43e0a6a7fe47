#![forbid(unsafe_code)]

//! The promise bridge: gather a list of items into one future.
//!
//! [`Cell::promise`] turns an ordered list of [`Term`]s (plain values,
//! promises, or cells) into a single [`Promise`] that resolves with the
//! ordered list of resolved values. Cells are observed through a one-shot
//! [`then`](Cell::then) (with its balanced acquire/release), so a cell is
//! held only until it first produces a value. If any contained promise
//! rejects, the bridge rejects permanently; later completions are ignored.

use std::cell::RefCell;
use std::rc::Rc;

use crate::cell::Cell;
use crate::promise::{Promise, Rejection, Resolver};
use crate::term::Term;
use crate::value::Value;

struct BridgeState {
    slots: Vec<Option<Value>>,
    remaining: usize,
    resolver: Option<Resolver>,
}

fn complete(state: &Rc<RefCell<BridgeState>>, index: usize, value: Value) {
    {
        let mut bridge = state.borrow_mut();
        if bridge.slots[index].is_none() {
            bridge.slots[index] = Some(value);
            bridge.remaining -= 1;
        }
    }
    finish_if_done(state);
}

fn finish_if_done(state: &Rc<RefCell<BridgeState>>) {
    let finished = {
        let mut bridge = state.borrow_mut();
        if bridge.remaining == 0 {
            bridge.resolver.take().map(|resolver| {
                let values: Vec<Value> = bridge
                    .slots
                    .iter()
                    .map(|slot| slot.clone().unwrap_or(Value::Null))
                    .collect();
                (resolver, values)
            })
        } else {
            None
        }
    };
    if let Some((resolver, values)) = finished {
        resolver.resolve(Value::Array(values));
    }
}

fn fail(state: &Rc<RefCell<BridgeState>>, rejection: Rejection) {
    if let Some(resolver) = state.borrow_mut().resolver.take() {
        resolver.reject(rejection);
    }
}

impl Cell {
    /// Resolve `items` into a single future of the ordered value list.
    #[must_use]
    pub fn promise(items: Vec<Term>) -> Promise {
        let (promise, resolver) = Promise::pending();
        let state = Rc::new(RefCell::new(BridgeState {
            slots: vec![None; items.len()],
            remaining: items.len(),
            resolver: Some(resolver),
        }));

        for (index, item) in items.into_iter().enumerate() {
            match item {
                Term::Value(value) => complete(&state, index, value),
                Term::Cell(cell) => {
                    let state = Rc::clone(&state);
                    cell.then(move |value| complete(&state, index, value.clone()));
                }
                Term::Promise(inner) => {
                    let state = Rc::clone(&state);
                    inner.on_settle(move |outcome| match outcome {
                        Ok(value) => complete(&state, index, value.clone()),
                        Err(rejection) => fail(&state, rejection.clone()),
                    });
                }
                structured @ (Term::List(_) | Term::Map(_)) => {
                    // Bridge items are flat; a structure is taken as a plain
                    // value here, not awaited member-by-member.
                    if structured.has_live(usize::MAX) {
                        tracing::warn!(
                            "promise bridge item contains cells/promises inside a structure; \
                             they resolve as null"
                        );
                    }
                    complete(&state, index, structured.resolve(0));
                }
            }
        }

        // An empty list (or all-plain items) resolves straight away.
        finish_if_done(&state);
        promise
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome_of(promise: &Promise) -> Rc<RefCell<Option<crate::promise::Settled>>> {
        let slot = Rc::new(RefCell::new(None));
        let s = Rc::clone(&slot);
        promise.on_settle(move |outcome| *s.borrow_mut() = Some(outcome.clone()));
        slot
    }

    #[test]
    fn empty_list_resolves_immediately() {
        let bridged = Cell::promise(vec![]);
        assert_eq!(bridged.value(), Some(json!([])));
    }

    #[test]
    fn plain_values_resolve_immediately_in_order() {
        let bridged = Cell::promise(vec![Term::from(json!(1)), Term::from(json!("two"))]);
        assert_eq!(bridged.value(), Some(json!([1, "two"])));
    }

    #[test]
    fn waits_for_every_cell_and_promise() {
        let cell = Cell::new();
        let (pending, resolver) = Promise::pending();
        let bridged = Cell::promise(vec![
            Term::from(&cell),
            Term::Promise(pending),
            Term::from(json!("k")),
        ]);
        let outcome = outcome_of(&bridged);

        assert!(outcome.borrow().is_none());
        cell.trigger(json!("c"));
        assert!(outcome.borrow().is_none());
        resolver.resolve(json!("p"));
        assert_eq!(
            *outcome.borrow(),
            Some(Ok(json!(["c", "p", "k"]))),
            "resolution preserves item order"
        );
    }

    #[test]
    fn cell_interest_is_released_after_first_value() {
        let cell = Cell::new();
        let _bridged = Cell::promise(vec![Term::from(&cell)]);
        assert_eq!(cell.users(), 1, "bridge holds the cell while waiting");
        cell.trigger(json!(1));
        assert_eq!(cell.users(), 0, "one-shot observation releases the cell");
    }

    #[test]
    fn already_ready_cell_resolves_synchronously() {
        let cell = Cell::new();
        cell.trigger(json!(9));
        let bridged = Cell::promise(vec![Term::from(&cell)]);
        assert_eq!(bridged.value(), Some(json!([9])));
    }

    #[test]
    fn a_rejected_promise_rejects_the_bridge_permanently() {
        let cell = Cell::new();
        let (pending, resolver) = Promise::pending();
        let bridged = Cell::promise(vec![Term::from(&cell), Term::Promise(pending)]);
        let outcome = outcome_of(&bridged);

        resolver.reject(Rejection::new("feed dropped"));
        assert_eq!(
            *outcome.borrow(),
            Some(Err(Rejection::new("feed dropped")))
        );

        // A later cell value cannot revive the bridge.
        cell.trigger(json!(1));
        assert!(matches!(*outcome.borrow(), Some(Err(_))));
    }
}
