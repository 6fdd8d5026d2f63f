//! Weighted trace distance and minimally-different selection.

use similar::{ChangeTag, TextDiff};

/// Weight of an inserted/removed call-entry line. Crossing a function
/// boundary matters far more than an internal statement difference.
const CALL_WEIGHT: u64 = 10;
const LINE_WEIGHT: u64 = 1;

/// Distance between two reconstructed traces: a line-level diff where every
/// inserted or removed line costs 1, call-entry lines cost 10, and
/// synthesized exit markers cost nothing (they are derived from the entries
/// around them).
pub fn distance(trace_new: &str, trace_old: &str) -> u64 {
    let diff = TextDiff::from_lines(trace_old, trace_new);
    let mut total = 0;
    for change in diff.iter_all_changes() {
        if change.value().contains(" ||| exiting modulename: ") {
            continue;
        }
        match change.tag() {
            ChangeTag::Equal => {}
            ChangeTag::Delete | ChangeTag::Insert => {
                total += if change.value().contains(" --- modulename: ") {
                    CALL_WEIGHT
                } else {
                    LINE_WEIGHT
                };
            }
        }
    }
    total
}

/// Partition `results` into failing and passing, then keep the `k` members
/// of each partition closest to the original trace (whole partitions of at
/// most `k` are kept as-is). Ties break toward the first-found element.
pub fn select_closest<'a, T, TraceOf, Failed>(
    results: &'a [T],
    original_trace: &str,
    k: usize,
    trace_of: TraceOf,
    failed: Failed,
) -> (Vec<&'a T>, Vec<&'a T>)
where
    TraceOf: Fn(&T) -> &str,
    Failed: Fn(&T) -> bool,
{
    let (failing, passing): (Vec<&T>, Vec<&T>) = results.iter().partition(|r| failed(r));
    (
        keep_closest(failing, original_trace, k, &trace_of),
        keep_closest(passing, original_trace, k, &trace_of),
    )
}

fn keep_closest<'a, T, TraceOf>(
    partition: Vec<&'a T>,
    original_trace: &str,
    k: usize,
    trace_of: &TraceOf,
) -> Vec<&'a T>
where
    TraceOf: Fn(&T) -> &str,
{
    if partition.len() <= k {
        return partition;
    }
    let mut distances: Vec<u64> = partition
        .iter()
        .map(|r| distance(trace_of(r), original_trace))
        .collect();
    let mut kept = Vec::with_capacity(k);
    for _ in 0..k {
        let Some((closest, _)) = distances.iter().enumerate().min_by_key(|(_, d)| **d) else {
            break;
        };
        kept.push(partition[closest]);
        distances[closest] = u64::MAX;
    }
    kept
}
