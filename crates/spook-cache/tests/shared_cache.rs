//! Cross-instance behaviour of the shared cache: owner exclusion, value
//! propagation through storage events, and ownership migration.

use std::rc::Rc;

use proptest::prelude::*;
use serde_json::json;
use spook::{Cell, CellOptions, JsonCodec};
use spook_cache::{CacheConfig, MemoryHub, SharedCache};

fn cache_on(hub: &MemoryHub) -> Rc<SharedCache> {
    SharedCache::new(Rc::new(hub.join()), CacheConfig::default())
}

fn cached_cell(cache: &Rc<SharedCache>, uuid: &str) -> Cell {
    Cell::with_options(CellOptions {
        may_be_null: false,
        cache: Some(cache.identify(uuid, Rc::new(JsonCodec))),
    })
}

#[test]
fn at_most_one_instance_owns_a_uuid() {
    let hub = MemoryHub::new();
    let caches: Vec<_> = (0..4).map(|_| cache_on(&hub)).collect();
    let cells: Vec<_> = caches.iter().map(|c| cached_cell(c, "shared")).collect();
    let _tokens: Vec<_> = cells.iter().map(|cell| cell.tie(|_| {})).collect();

    let owners = caches.iter().filter(|c| c.is_owned("shared")).count();
    assert_eq!(owners, 1, "exactly one owner at steady state");
}

#[test]
fn values_propagate_to_peer_instances() {
    let hub = MemoryHub::new();
    let cache_a = cache_on(&hub);
    let cache_b = cache_on(&hub);

    let producer = cached_cell(&cache_a, "height");
    let consumer = cached_cell(&cache_b, "height");

    let _pt = producer.tie(|_| {});
    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    let _ct = consumer.tie(move |v| s.borrow_mut().push(v.clone()));

    producer.trigger(json!(1234));
    assert_eq!(*seen.borrow(), vec![json!(1234)]);

    producer.trigger(json!(1235));
    assert_eq!(*seen.borrow(), vec![json!(1234), json!(1235)]);
}

#[test]
fn a_second_instance_restores_the_persisted_value() {
    let hub = MemoryHub::new();
    let cache_a = cache_on(&hub);
    let producer = cached_cell(&cache_a, "height");
    let _pt = producer.tie(|_| {});
    producer.trigger(json!(7));

    // A new instance joins later and sees the last-known value immediately.
    let cache_b = cache_on(&hub);
    let late = cached_cell(&cache_b, "height");
    let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
    let s = Rc::clone(&seen);
    let _lt = late.tie(move |v| s.borrow_mut().push(v.clone()));
    assert_eq!(*seen.borrow(), vec![json!(7)]);
}

#[test]
fn ownership_migrates_after_unload() {
    let hub = MemoryHub::new();
    let cache_a = cache_on(&hub);
    let cache_b = cache_on(&hub);

    let a = cached_cell(&cache_a, "u");
    let b = cached_cell(&cache_b, "u");
    let _at = a.tie(|_| {});
    let _bt = b.tie(|_| {});
    assert!(cache_a.is_owned("u"));
    assert!(!cache_b.is_owned("u"));

    // Instance A goes away: deleting its owner key lets B adopt.
    cache_a.unload();
    assert!(cache_b.is_owned("u"), "the survivor adopts ownership");
    assert_eq!(hub.peek("owner.u").as_deref(), Some(cache_b.session()));
}

#[test]
fn peer_value_deletion_resets_mirrors() {
    let hub = MemoryHub::new();
    let cache_a = cache_on(&hub);
    let cache_b = cache_on(&hub);

    let a = cached_cell(&cache_a, "u");
    let b = cached_cell(&cache_b, "u");
    let _at = a.tie(|_| {});
    let _bt = b.tie(|_| {});

    a.trigger(json!("x"));
    assert!(b.is_ready());
    a.reset();
    assert!(!b.is_ready(), "peer deletion must reset mirrors");
}

#[test]
fn losing_the_claim_race_demotes_to_mirror() {
    let hub = MemoryHub::new();
    let cache_a = cache_on(&hub);

    let a = cached_cell(&cache_a, "u");
    let _at = a.tie(|_| {});
    assert!(cache_a.is_owned("u"));

    // A peer overwrites the owner key (the acknowledged race window).
    let interloper = hub.join();
    use spook_cache::SharedStore;
    interloper.set("owner.u", "deadbeef").unwrap();

    assert!(
        !cache_a.is_owned("u"),
        "a foreign claim must demote the local owner"
    );
}

#[test]
fn mirrors_are_idempotent_under_replayed_events() {
    let hub = MemoryHub::new();
    let cache_a = cache_on(&hub);
    let cache_b = cache_on(&hub);

    let a = cached_cell(&cache_a, "u");
    let b = cached_cell(&cache_b, "u");
    let _at = a.tie(|_| {});
    let count = std::rc::Rc::new(std::cell::Cell::new(0u32));
    let c = Rc::clone(&count);
    let _bt = b.tie(move |_| c.set(c.get() + 1));

    a.trigger(json!(5));
    assert_eq!(count.get(), 1);

    // Replay the stored value with different text but equal canonical form:
    // the event fires, the mirror coalesces it.
    use spook_cache::SharedStore;
    let replayer = hub.join();
    replayer.set("value.u", " 5").unwrap();
    assert_eq!(count.get(), 1, "equal peer values must coalesce");
}

proptest! {
    // Any interleaving of joins and drops leaves at most one owner, and if
    // anyone still holds interest, exactly one.
    #[test]
    fn owner_exclusion_holds_for_any_join_and_drop_order(
        instances in 2usize..5,
        drops in proptest::collection::vec(0usize..5, 0..4),
    ) {
        let hub = MemoryHub::new();
        let caches: Vec<_> = (0..instances).map(|_| cache_on(&hub)).collect();
        let cells: Vec<_> = caches.iter().map(|c| cached_cell(c, "u")).collect();
        let mut tokens: Vec<_> = cells.iter().map(|cell| Some(cell.tie(|_| {}))).collect();

        for drop_index in drops {
            let index = drop_index % instances;
            if let Some(token) = tokens[index].take() {
                cells[index].untie(token);
                // A dropped instance releases what it held.
                caches[index].purge_cold();
                caches[index].unload();
            }
        }

        let owners = caches.iter().filter(|c| c.is_owned("u")).count();
        prop_assert!(owners <= 1, "never more than one owner");
        let live = tokens.iter().filter(|t| t.is_some()).count();
        if live > 0 {
            prop_assert_eq!(owners, 1, "surviving interest keeps one owner");
        }
    }
}
