//! Consecutive limit-up counting.

/// Streak length per row.
///
/// Every non-hit row opens a new group; within a group, hits are counted
/// cumulatively. A non-hit row is 0 and a run of hits reads 1, 2, 3...
pub fn consecutive_days(hits: &[bool]) -> Vec<u32> {
    let mut out = Vec::with_capacity(hits.len());
    let mut group = 0u64;
    let mut current_group = u64::MAX;
    let mut count = 0u32;

    for &hit in hits {
        if !hit {
            group += 1;
        }
        if group != current_group {
            current_group = group;
            count = 0;
        }
        if hit {
            count += 1;
        }
        out.push(if hit { count } else { 0 });
    }
    out
}
