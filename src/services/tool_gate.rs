//! Spatial tool gate: which tools are permitted at a canvas point.
//!
//! DESIGN
//! ======
//! Pure and deterministic: no I/O, no clock, no randomness, so callers can
//! memoize or debounce it freely from pointer-move input.
//!
//! RESOLUTION
//! ==========
//! Every region containing the point votes on the tools it mentions
//! (`allowed_tools` votes allow, `denied_tools` votes deny and beats an
//! allow in the same region). For each tool the vote of the highest
//! priority region stands; equal priorities keep the earlier region. The
//! result is every tool whose standing vote is allow, so overlapping
//! regions without conflicts simply union.
//!
//! Points on a polygon edge count as inside. Polygons with fewer than three
//! vertices contain nothing.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Point, ToolRegion};

/// Tools permitted at `(x, y)` in `room_id`. Regions of other rooms are ignored.
#[must_use]
pub fn tools_at(room_id: &str, x: f64, y: f64, regions: &[ToolRegion]) -> BTreeSet<String> {
    let point = Point::new(x, y);
    // tool -> (priority, allowed)
    let mut votes: BTreeMap<&str, (i32, bool)> = BTreeMap::new();

    for region in regions {
        if region.room_id != room_id || !contains(&region.polygon, point) {
            continue;
        }
        let mentioned = region
            .allowed_tools
            .iter()
            .chain(region.denied_tools.iter());
        for tool in mentioned {
            let allowed = !region.denied_tools.contains(tool);
            match votes.get(tool.as_str()) {
                Some(&(priority, _)) if priority >= region.priority => {}
                _ => {
                    votes.insert(tool.as_str(), (region.priority, allowed));
                }
            }
        }
    }

    votes
        .into_iter()
        .filter(|(_, (_, allowed))| *allowed)
        .map(|(tool, _)| tool.to_owned())
        .collect()
}

/// Point-in-polygon by crossing number, with an inclusive edge check.
#[must_use]
pub fn contains(polygon: &[Point], p: Point) -> bool {
    if polygon.len() < 3 || p.x.is_nan() || p.y.is_nan() {
        return false;
    }

    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let a = polygon[i];
        let b = polygon[j];
        if on_segment(a, b, p) {
            return true;
        }
        if (a.y > p.y) != (b.y > p.y) {
            let x_cross = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn on_segment(a: Point, b: Point, p: Point) -> bool {
    const EPS: f64 = 1e-12;
    let cross = (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    if cross.abs() > EPS {
        return false;
    }
    p.x >= a.x.min(b.x) - EPS && p.x <= a.x.max(b.x) + EPS && p.y >= a.y.min(b.y) - EPS && p.y <= a.y.max(b.y) + EPS
}

#[cfg(test)]
#[path = "tool_gate_test.rs"]
mod tests;
