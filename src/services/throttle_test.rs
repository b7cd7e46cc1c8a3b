use super::*;

const WINDOW: Duration = Duration::from_millis(100);

#[test]
fn first_offer_opens_window() {
    let mut t = Throttle::new(WINDOW);
    let now = Instant::now();

    assert!(t.offer_at("cursor", 1, now));
    assert_eq!(t.next_due(), Some(now + WINDOW));
    assert!(t.take_due_at(now).is_empty(), "nothing flushes before the boundary");
}

#[test]
fn offers_inside_window_collapse_to_latest() {
    let mut t = Throttle::new(WINDOW);
    let start = Instant::now();

    for i in 0..10 {
        t.offer_at("cursor", i, start + Duration::from_millis(i * 5));
    }

    let flushed = t.take_due_at(start + WINDOW);
    assert_eq!(flushed, vec![("cursor".to_owned(), 9, 9)]);
    assert_eq!(t.pending_len(), 0);
}

#[test]
fn hundred_offers_over_two_hundred_ms_flush_at_most_twice() {
    let mut t = Throttle::new(WINDOW);
    let start = Instant::now();
    let mut sends = 0;

    for i in 0..100_u64 {
        let now = start + Duration::from_millis(i * 2);
        sends += t.take_due_at(now).len();
        t.offer_at("cursor", i, now);
    }
    sends += t.take_due_at(start + Duration::from_millis(400)).len();

    assert!(sends <= 2, "expected at most 2 sends, got {sends}");
    assert!(sends >= 1);
}

#[test]
fn keys_are_independent() {
    let mut t = Throttle::new(WINDOW);
    let start = Instant::now();

    t.offer_at("cursor", 1, start);
    t.offer_at("viewport", 2, start + Duration::from_millis(50));

    let first = t.take_due_at(start + WINDOW);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].0, "cursor");

    let second = t.take_due_at(start + Duration::from_millis(150));
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].0, "viewport");
}

#[test]
fn clear_abandons_pending_values() {
    let mut t = Throttle::new(WINDOW);
    t.offer_at("cursor", 1, Instant::now());
    assert_eq!(t.clear(), 1);
    assert!(t.next_due().is_none());
}
