use std::collections::BTreeMap;

use crate::{BoatEntry, FiguresError, Split};

/// Splits regrouped by distance marker, ascending, each tagged with its boat id.
pub type DistanceLookup<'a> = BTreeMap<i64, Vec<(&'a str, &'a Split)>>;

/// Regroup per-boat splits by distance. Within a distance, splits keep boat order.
pub fn transpose(boats: &[BoatEntry]) -> DistanceLookup<'_> {
    let mut lookup: DistanceLookup<'_> = BTreeMap::new();
    for boat in boats {
        for split in &boat.splits {
            lookup
                .entry(split.distance_meter)
                .or_default()
                .push((boat.id.as_str(), split));
        }
    }
    lookup
}

/// Smallest positive step between consecutive integer distances.
///
/// `None` entries stand for distances that are absent or not integral; they are
/// skipped and the next integer distance is diffed against the last one seen.
/// `compute_figures` always passes `Some`, since a `Split` distance is an `i64`;
/// the `None` path serves callers resolving grids from looser marker lists.
pub fn resolve_grid_step<I>(distances: I) -> Result<i64, FiguresError>
where
    I: IntoIterator<Item = Option<i64>>,
{
    let mut min_diff: Option<i64> = None;
    let mut last: Option<i64> = None;
    for value in distances.into_iter().flatten() {
        if let Some(prev) = last {
            let diff = value - prev;
            if diff > 0 {
                min_diff = Some(min_diff.map_or(diff, |m| m.min(diff)));
            }
        }
        last = Some(value);
    }
    min_diff.ok_or(FiguresError::UndefinedGrid)
}
