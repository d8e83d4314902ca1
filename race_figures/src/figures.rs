use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::grid::DistanceLookup;
use crate::{
    DistanceSummary, EmptyDistancePolicy, Figures, FiguresError, Params, RaceFigures,
    ResultTimeOrCode, Split,
};

/// State carried from one distance to the next during the ascending walk.
struct WalkState<'a> {
    last_distance: i64,
    last_valid_by_boat: HashMap<&'a str, &'a Split>,
    is_first: bool,
}

impl WalkState<'_> {
    fn start() -> Self {
        Self {
            last_distance: 0,
            last_valid_by_boat: HashMap::new(),
            is_first: true,
        }
    }
}

pub(crate) fn walk_distances(
    lookup: &DistanceLookup<'_>,
    grid_step: i64,
    params: &Params,
) -> Result<RaceFigures, FiguresError> {
    let mut out = RaceFigures {
        grid_step: Some(grid_step),
        ..RaceFigures::default()
    };

    let mut state = WalkState::start();
    for (&distance, splits) in lookup {
        let (at_distance, summary, next) =
            figures_at_distance(state, distance, splits, grid_step, params)?;
        for (boat, figures) in at_distance {
            out.boats
                .entry(boat.to_string())
                .or_insert_with(BTreeMap::new)
                .insert(distance, figures);
        }
        out.distances.insert(distance, summary);
        state = next;
    }

    Ok(out)
}

type DistanceStep<'a> = (Vec<(&'a str, Figures)>, DistanceSummary, WalkState<'a>);

fn figures_at_distance<'a>(
    state: WalkState<'a>,
    distance: i64,
    splits: &[(&'a str, &'a Split)],
    grid_step: i64,
    params: &Params,
) -> Result<DistanceStep<'a>, FiguresError> {
    let valid: Vec<(&'a str, &'a Split, i64)> = splits
        .iter()
        .filter_map(|&(boat, split)| {
            split
                .usable_time(params.unknown_outlier_is_valid)
                .map(|time| (boat, split, time))
        })
        .collect();

    let best_time = valid.iter().map(|&(_, _, time)| time).min();
    if best_time.is_none() {
        match params.empty_distance {
            EmptyDistancePolicy::Fault => {
                return Err(FiguresError::NoValidDataAtDistance { distance });
            }
            EmptyDistancePolicy::Skip => {
                warn!(distance, reported = splits.len(), "no valid split; skipping aggregates");
            }
        }
    }

    let consecutive_step = distance - state.last_distance == grid_step;

    let mut at_distance = Vec::with_capacity(splits.len());
    for &(boat, split) in splits {
        let mut figures = Figures::default();
        match split.usable_time(params.unknown_outlier_is_valid) {
            None => {
                // Outliers stay fully suppressed; only official marks are surfaced.
                figures.result_time_or_code = split
                    .invalid_mark_reason
                    .clone()
                    .map(ResultTimeOrCode::Code);
            }
            Some(time) => {
                figures.result_time_or_code = Some(ResultTimeOrCode::Time(time));
                figures.deficit = best_time.map(|best| time - best);
                figures.pace = if !consecutive_step {
                    None
                } else if state.is_first {
                    Some(time)
                } else {
                    state
                        .last_valid_by_boat
                        .get(boat)
                        .and_then(|prev| prev.result_time_ms)
                        .map(|prev| time - prev)
                };
                if let Some(pace) = figures.pace.filter(|&p| p < 0) {
                    return Err(FiguresError::MalformedInput(format!(
                        "boat '{}': result time decreases by {} ms into {} m",
                        boat, -pace, distance
                    )));
                }
                figures.speed = figures
                    .pace
                    .and_then(|pace| speed_mps(grid_step, pace, boat, distance));
            }
        }
        at_distance.push((boat, figures));
    }

    let avg_speed = mean(at_distance.iter().filter_map(|(_, f)| f.speed));
    if let Some(avg) = avg_speed {
        for (_, figures) in at_distance.iter_mut() {
            if let Some(speed) = figures.speed {
                figures.rel_diff_to_avg_speed = Some((speed - avg) / avg * 100.0);
            }
        }
    }

    debug!(
        distance,
        reported = splits.len(),
        valid = valid.len(),
        consecutive_step,
        ?best_time,
        ?avg_speed,
        "distance figures"
    );

    let summary = DistanceSummary {
        best_time_ms: best_time,
        avg_speed,
        reported: splits.len(),
        valid: valid.len(),
        consecutive_step,
    };
    let next = WalkState {
        last_distance: distance,
        last_valid_by_boat: valid
            .into_iter()
            .map(|(boat, split, _)| (boat, split))
            .collect(),
        is_first: false,
    };
    Ok((at_distance, summary, next))
}

fn speed_mps(grid_step: i64, pace_ms: i64, boat: &str, distance: i64) -> Option<f64> {
    if pace_ms == 0 {
        warn!(boat, distance, "zero pace; speed left empty");
        return None;
    }
    Some(grid_step as f64 / (pace_ms as f64 / 1000.0))
}

fn mean<I: Iterator<Item = f64>>(values: I) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 {
        None
    } else {
        Some(sum / count as f64)
    }
}

#[cfg(test)]
mod tests {
    use crate::{compute_figures, BoatEntry, OutlierFlag};

    use super::*;

    const EPS: f64 = 1e-9;

    fn close(a: Option<f64>, b: f64, tol: f64) -> bool {
        a.map_or(false, |a| (a - b).abs() < tol)
    }

    fn figures(boats: &[BoatEntry]) -> RaceFigures {
        compute_figures(boats, &Params::default()).unwrap()
    }

    #[test]
    fn test_first_distance_pace() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
        ];
        let result = figures(&boats);
        let first = result.get("A", 500).unwrap();
        assert_eq!(first.pace, Some(100_000));
        assert!(close(first.speed, 5.0, EPS));
        assert_eq!(first.deficit, Some(0));
        assert_eq!(
            first.result_time_or_code,
            Some(ResultTimeOrCode::Time(100_000))
        );
    }

    #[test]
    fn test_interior_pace() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
        ];
        let result = figures(&boats);
        let second = result.get("A", 1000).unwrap();
        assert_eq!(second.pace, Some(105_000));
        assert!(close(second.speed, 500.0 / 105.0, EPS));
    }

    #[test]
    fn test_two_boat_average_and_relative_speed() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
            BoatEntry::new("B", vec![Split::new(500, 102_000), Split::new(1000, 206_000)]),
        ];
        let result = figures(&boats);
        let a = result.get("A", 500).unwrap();
        let b = result.get("B", 500).unwrap();

        assert!(close(a.speed, 5.0, EPS));
        assert!(close(b.speed, 500.0 / 102.0, EPS));
        let avg = (5.0 + 500.0 / 102.0) / 2.0;
        assert!(close(result.distances[&500].avg_speed, avg, EPS));
        assert!(close(a.rel_diff_to_avg_speed, 0.990_099, 1e-4));
        assert!(close(b.rel_diff_to_avg_speed, -0.990_099, 1e-4));
        assert_eq!(a.deficit, Some(0));
        assert_eq!(b.deficit, Some(2000));
        assert_eq!(result.distances[&500].best_time_ms, Some(100_000));
    }

    #[test]
    fn test_non_consecutive_gap_has_no_pace() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
            BoatEntry::new("B", vec![Split::new(500, 101_000), Split::new(1600, 230_000)]),
        ];
        let result = figures(&boats);
        assert_eq!(result.grid_step, Some(500));
        let jump = result.get("B", 1600).unwrap();
        assert_eq!(jump.pace, None);
        assert_eq!(jump.speed, None);
        assert_eq!(jump.rel_diff_to_avg_speed, None);
        assert_eq!(jump.deficit, Some(0));
        assert!(!result.distances[&1600].consecutive_step);
        assert_eq!(result.distances[&1600].avg_speed, None);
    }

    #[test]
    fn test_invalid_mark_is_surfaced_and_excluded() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
            BoatEntry::new(
                "B",
                vec![
                    Split::new(500, 90_000).with_invalid_mark("DNS"),
                    Split::new(1000, 200_000),
                ],
            ),
        ];
        let result = figures(&boats);
        let dns = result.get("B", 500).unwrap();
        assert_eq!(
            dns.result_time_or_code,
            Some(ResultTimeOrCode::Code("DNS".into()))
        );
        assert_eq!(dns.deficit, None);
        assert_eq!(dns.pace, None);
        assert_eq!(dns.speed, None);
        assert_eq!(dns.rel_diff_to_avg_speed, None);

        let summary = &result.distances[&500];
        assert_eq!(summary.best_time_ms, Some(100_000));
        assert!(close(summary.avg_speed, 5.0, EPS));
        assert_eq!(summary.reported, 2);
        assert_eq!(summary.valid, 1);

        // B had nothing usable at 500, so its 1000 m pace cannot be formed.
        let after = result.get("B", 1000).unwrap();
        assert_eq!(after.pace, None);
        assert_eq!(after.deficit, Some(0));
        assert_eq!(result.get("A", 1000).unwrap().deficit, Some(5000));
    }

    #[test]
    fn test_outlier_is_fully_suppressed() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
            BoatEntry::new(
                "B",
                vec![
                    Split::new(500, 40_000).with_outlier(OutlierFlag::Outlier),
                    Split::new(1000, 207_000),
                ],
            ),
        ];
        let result = figures(&boats);
        assert_eq!(result.get("B", 500).unwrap(), &Figures::default());
        assert_eq!(result.distances[&500].best_time_ms, Some(100_000));
        assert_eq!(result.get("A", 500).unwrap().deficit, Some(0));
        assert_eq!(result.get("B", 1000).unwrap().pace, None);
    }

    #[test]
    fn test_unknown_outlier_can_be_treated_as_unusable() {
        let boats = vec![
            BoatEntry::new(
                "A",
                vec![
                    Split::new(500, 100_000).with_outlier(OutlierFlag::NotOutlier),
                    Split::new(1000, 205_000).with_outlier(OutlierFlag::NotOutlier),
                ],
            ),
            BoatEntry::new("B", vec![Split::new(500, 99_000), Split::new(1000, 200_000)]),
        ];
        let params = Params {
            unknown_outlier_is_valid: false,
            ..Params::default()
        };
        let result = compute_figures(&boats, &params).unwrap();
        assert_eq!(result.get("B", 500).unwrap().result_time_or_code, None);
        assert_eq!(result.get("A", 500).unwrap().deficit, Some(0));

        let lenient = figures(&boats);
        assert_eq!(lenient.get("A", 500).unwrap().deficit, Some(1000));
    }

    #[test]
    fn test_distance_without_valid_split_faults_by_default() {
        let boats = vec![
            BoatEntry::new(
                "A",
                vec![
                    Split::new(500, 100_000),
                    Split::new(1000, 205_000).with_invalid_mark("DNF"),
                ],
            ),
            BoatEntry::new("B", vec![Split::new(500, 102_000), Split::untimed(1000)]),
        ];
        assert_eq!(
            compute_figures(&boats, &Params::default()),
            Err(FiguresError::NoValidDataAtDistance { distance: 1000 })
        );
    }

    #[test]
    fn test_distance_without_valid_split_can_be_skipped() {
        let boats = vec![
            BoatEntry::new(
                "A",
                vec![
                    Split::new(500, 100_000),
                    Split::new(1000, 205_000).with_invalid_mark("DNF"),
                    Split::new(1500, 310_000),
                ],
            ),
            BoatEntry::new(
                "B",
                vec![Split::new(500, 102_000), Split::untimed(1000), Split::new(1500, 312_000)],
            ),
        ];
        let params = Params {
            empty_distance: EmptyDistancePolicy::Skip,
            ..Params::default()
        };
        let result = compute_figures(&boats, &params).unwrap();

        let summary = &result.distances[&1000];
        assert_eq!(summary.best_time_ms, None);
        assert_eq!(summary.avg_speed, None);
        assert_eq!(summary.valid, 0);
        assert_eq!(
            result.get("A", 1000).unwrap().result_time_or_code,
            Some(ResultTimeOrCode::Code("DNF".into()))
        );
        assert_eq!(result.get("B", 1000).unwrap(), &Figures::default());

        // Nobody has a valid 1000 m split to pace 1500 m from.
        assert_eq!(result.get("A", 1500).unwrap().pace, None);
        assert_eq!(result.get("B", 1500).unwrap().deficit, Some(2000));
    }

    #[test]
    fn test_boats_without_split_get_no_entry() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
            BoatEntry::new("B", vec![Split::new(1000, 204_000)]),
            BoatEntry::new("C", vec![]),
        ];
        let result = figures(&boats);
        assert!(result.get("B", 500).is_none());
        assert!(result.get("B", 1000).is_some());
        assert!(!result.boats.contains_key("C"));
        // B has no 500 m split, so no pace at 1000 m.
        assert_eq!(result.get("B", 1000).unwrap().pace, None);
        assert_eq!(result.get("A", 1000).unwrap().deficit, Some(1000));
    }

    #[test]
    fn test_zero_pace_leaves_speed_empty() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 100_000)]),
            BoatEntry::new("B", vec![Split::new(500, 101_000), Split::new(1000, 206_000)]),
        ];
        let result = figures(&boats);
        let stalled = result.get("A", 1000).unwrap();
        assert_eq!(stalled.pace, Some(0));
        assert_eq!(stalled.speed, None);
        assert_eq!(stalled.rel_diff_to_avg_speed, None);
        let b = result.get("B", 1000).unwrap();
        assert!(close(b.rel_diff_to_avg_speed, 0.0, EPS));
    }

    #[test]
    fn test_decreasing_result_time_is_malformed() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 90_000)]),
            BoatEntry::new("B", vec![Split::new(500, 101_000), Split::new(1000, 206_000)]),
        ];
        assert!(matches!(
            compute_figures(&boats, &Params::default()),
            Err(FiguresError::MalformedInput(msg)) if msg.contains("'A'") && msg.contains("1000 m")
        ));
    }

    #[test]
    fn test_decreasing_time_across_gap_is_not_paced() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(500, 100_000), Split::new(1000, 205_000)]),
            BoatEntry::new("B", vec![Split::new(500, 101_000), Split::new(1500, 95_000)]),
        ];
        let result = figures(&boats);
        assert_eq!(result.get("B", 1500).unwrap().pace, None);
    }

    #[test]
    fn test_first_marker_off_grid_has_no_pace() {
        let boats = vec![BoatEntry::new(
            "A",
            vec![
                Split::new(500, 100_000),
                Split::new(750, 150_000),
                Split::new(1000, 201_000),
            ],
        )];
        let result = figures(&boats);
        assert_eq!(result.grid_step, Some(250));

        let first = result.get("A", 500).unwrap();
        assert_eq!(first.pace, None);
        assert_eq!(first.speed, None);
        assert!(!result.distances[&500].consecutive_step);

        let second = result.get("A", 750).unwrap();
        assert_eq!(second.pace, Some(50_000));
        assert!(close(second.speed, 5.0, EPS));
        assert_eq!(result.get("A", 1000).unwrap().pace, Some(51_000));
    }

    #[test]
    fn test_single_distance_race_is_empty() {
        let boats = vec![
            BoatEntry::new("A", vec![Split::new(1000, 205_000)]),
            BoatEntry::new("B", vec![Split::new(1000, 206_000)]),
        ];
        let result = figures(&boats);
        assert!(result.is_empty());
        assert_eq!(result.grid_step, None);

        let strict = Params {
            strict_grid: true,
            ..Params::default()
        };
        assert_eq!(
            compute_figures(&boats, &strict),
            Err(FiguresError::UndefinedGrid)
        );
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(std::iter::empty()), None);
        assert_eq!(mean([1.0, 2.0, 6.0].into_iter()), Some(3.0));
    }
}
