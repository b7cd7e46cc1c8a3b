use super::*;

fn square(x0: f64, y0: f64, x1: f64, y1: f64) -> Vec<Point> {
    vec![Point::new(x0, y0), Point::new(x1, y0), Point::new(x1, y1), Point::new(x0, y1)]
}

fn region(room: &str, polygon: Vec<Point>, allowed: &[&str], denied: &[&str], priority: i32) -> ToolRegion {
    ToolRegion {
        room_id: room.into(),
        layer_id: "roof".into(),
        polygon,
        allowed_tools: allowed.iter().map(|t| (*t).to_owned()).collect(),
        denied_tools: denied.iter().map(|t| (*t).to_owned()).collect(),
        priority,
    }
}

fn set(tools: &[&str]) -> BTreeSet<String> {
    tools.iter().map(|t| (*t).to_owned()).collect()
}

// =============================================================
// contains
// =============================================================

#[test]
fn contains_interior_and_edges() {
    let sq = square(0.2, 0.2, 0.8, 0.8);
    assert!(contains(&sq, Point::new(0.5, 0.5)));
    assert!(contains(&sq, Point::new(0.2, 0.5)), "edge counts as inside");
    assert!(contains(&sq, Point::new(0.8, 0.8)), "vertex counts as inside");
    assert!(!contains(&sq, Point::new(0.1, 0.5)));
    assert!(!contains(&sq, Point::new(0.5, 0.9)));
}

#[test]
fn contains_concave_polygon() {
    // U shape opening upward.
    let u = vec![
        Point::new(0.0, 0.0),
        Point::new(1.0, 0.0),
        Point::new(1.0, 1.0),
        Point::new(0.7, 1.0),
        Point::new(0.7, 0.3),
        Point::new(0.3, 0.3),
        Point::new(0.3, 1.0),
        Point::new(0.0, 1.0),
    ];
    assert!(contains(&u, Point::new(0.1, 0.8)));
    assert!(!contains(&u, Point::new(0.5, 0.8)), "inside the notch");
    assert!(contains(&u, Point::new(0.5, 0.1)));
}

#[test]
fn degenerate_polygons_contain_nothing() {
    assert!(!contains(&[], Point::new(0.5, 0.5)));
    assert!(!contains(&[Point::new(0.0, 0.0), Point::new(1.0, 1.0)], Point::new(0.5, 0.5)));
    assert!(!contains(&square(0.0, 0.0, 1.0, 1.0), Point::new(f64::NAN, 0.5)));
}

// =============================================================
// tools_at
// =============================================================

#[test]
fn point_outside_every_region_allows_nothing() {
    let regions = vec![region("roof-1", square(0.0, 0.0, 0.3, 0.3), &["pin"], &[], 0)];
    assert!(tools_at("roof-1", 0.9, 0.9, &regions).is_empty());
}

#[test]
fn non_conflicting_overlaps_union() {
    let regions = vec![
        region("roof-1", square(0.0, 0.0, 1.0, 1.0), &["pin", "measure"], &[], 1),
        region("roof-1", square(0.4, 0.4, 0.6, 0.6), &["annotate"], &[], 5),
    ];
    assert_eq!(tools_at("roof-1", 0.5, 0.5, &regions), set(&["annotate", "measure", "pin"]));
}

#[test]
fn higher_priority_wins_conflicts() {
    let regions = vec![
        region("roof-1", square(0.0, 0.0, 1.0, 1.0), &["pin", "measure"], &[], 1),
        region("roof-1", square(0.4, 0.4, 0.6, 0.6), &["annotate"], &["pin"], 5),
    ];
    assert_eq!(tools_at("roof-1", 0.5, 0.5, &regions), set(&["annotate", "measure"]));

    // Reversed priorities: the big region's allow now beats the deny.
    let regions = vec![
        region("roof-1", square(0.0, 0.0, 1.0, 1.0), &["pin", "measure"], &[], 9),
        region("roof-1", square(0.4, 0.4, 0.6, 0.6), &["annotate"], &["pin"], 5),
    ];
    assert_eq!(tools_at("roof-1", 0.5, 0.5, &regions), set(&["annotate", "measure", "pin"]));
}

#[test]
fn equal_priority_keeps_earlier_region() {
    let regions = vec![
        region("roof-1", square(0.0, 0.0, 1.0, 1.0), &[], &["pin"], 3),
        region("roof-1", square(0.0, 0.0, 1.0, 1.0), &["pin"], &[], 3),
    ];
    assert!(tools_at("roof-1", 0.5, 0.5, &regions).is_empty());
}

#[test]
fn deny_beats_allow_within_one_region() {
    let regions = vec![region("roof-1", square(0.0, 0.0, 1.0, 1.0), &["pin"], &["pin"], 0)];
    assert!(tools_at("roof-1", 0.5, 0.5, &regions).is_empty());
}

#[test]
fn other_rooms_are_ignored() {
    let regions = vec![region("roof-2", square(0.0, 0.0, 1.0, 1.0), &["pin"], &[], 0)];
    assert!(tools_at("roof-1", 0.5, 0.5, &regions).is_empty());
}

#[test]
fn repeated_calls_are_identical() {
    let regions = vec![
        region("roof-1", square(0.0, 0.0, 1.0, 1.0), &["pin", "measure"], &[], 1),
        region("roof-1", square(0.25, 0.25, 0.75, 0.75), &["annotate"], &["measure"], 2),
    ];
    let first = tools_at("roof-1", 0.5, 0.5, &regions);
    for _ in 0..100 {
        assert_eq!(tools_at("roof-1", 0.5, 0.5, &regions), first);
    }
    assert_eq!(first, set(&["annotate", "pin"]));
}
