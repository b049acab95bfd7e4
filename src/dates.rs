use chrono::NaiveDate;

use crate::model::DateSet;

/// Every night in `[start, end)`. A stay from day N to day N+1 occupies exactly night N.
/// Empty when `end <= start`.
pub fn expand_range(start: NaiveDate, end: NaiveDate) -> DateSet {
    start.iter_days().take_while(|d| *d < end).collect()
}

pub fn intersects(a: &DateSet, b: &DateSet) -> bool {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small.iter().any(|d| large.contains(d))
}

/// Nights of `a` that are also in `b`.
pub fn overlap(a: &DateSet, b: &DateSet) -> DateSet {
    a.intersection(b).copied().collect()
}
