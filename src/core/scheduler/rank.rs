//! Candidate selection and affinity ranking for one queue item.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use super::slot::Slot;
use crate::core::repository::{ActiveWorker, QueueItem};
use crate::util::types::{DesiredLabel, LabelComparator, StickyStrategy, WorkerId, WorkerLabel};

/// Ordered candidate slots for `item`.
///
/// HARD stickiness restricts candidates to the desired worker's slots; affinity
/// labels filter and rank; SOFT stickiness moves the desired worker's slots to
/// the front without excluding anyone else.
pub(crate) fn candidate_slots(
    slots: &[Arc<Slot>],
    item: &QueueItem,
    desired: &[DesiredLabel],
    workers: &HashMap<WorkerId, ActiveWorker>,
) -> Vec<Arc<Slot>> {
    let sticky_worker = item.desired_worker_id.as_deref();

    let eligible: Vec<Arc<Slot>> = match (item.sticky, sticky_worker) {
        (StickyStrategy::Hard, Some(worker_id)) => slots
            .iter()
            .filter(|s| s.worker_id() == worker_id)
            .cloned()
            .collect(),
        _ => slots.to_vec(),
    };

    let mut ranked = if desired.is_empty() {
        eligible
    } else {
        rank_slots(&eligible, desired, workers)
    };

    if let (StickyStrategy::Soft, Some(worker_id)) = (item.sticky, sticky_worker) {
        // Stable sort keeps the ranking within each group.
        ranked.sort_by_key(|s| s.worker_id() != worker_id);
    }
    ranked
}

/// Drop slots whose worker misses a required label and order the rest by
/// descending weight, spreading ties across workers.
pub(crate) fn rank_slots(
    slots: &[Arc<Slot>],
    desired: &[DesiredLabel],
    workers: &HashMap<WorkerId, ActiveWorker>,
) -> Vec<Arc<Slot>> {
    let mut worker_ranks: HashMap<&str, Option<i32>> = HashMap::new();
    let mut appearances: HashMap<&str, usize> = HashMap::new();
    let mut ranked: Vec<(i32, usize, &Arc<Slot>)> = Vec::with_capacity(slots.len());

    for slot in slots {
        let worker_id = slot.worker_id();
        let rank = *worker_ranks.entry(worker_id).or_insert_with(|| {
            let labels = workers
                .get(worker_id)
                .map_or(&[][..], |w| w.labels.as_slice());
            worker_rank(labels, desired)
        });
        let Some(weight) = rank else {
            continue;
        };
        let seen = appearances.entry(worker_id).or_default();
        ranked.push((weight, *seen, slot));
        *seen += 1;
    }

    ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    ranked.into_iter().map(|(_, _, s)| Arc::clone(s)).collect()
}

/// Summed weight of the satisfied labels, or `None` if a required label fails.
pub(crate) fn worker_rank(labels: &[WorkerLabel], desired: &[DesiredLabel]) -> Option<i32> {
    let mut total: i32 = 0;
    for want in desired {
        let satisfied = labels
            .iter()
            .find(|l| l.key == want.key)
            .is_some_and(|l| label_satisfies(l, want));
        if satisfied {
            total = total.saturating_add(want.weight);
        } else if want.required {
            return None;
        }
    }
    Some(total)
}

/// Compare a worker label against a desired label. Integer values win over
/// strings; a worker label missing the compared kind never satisfies.
pub(crate) fn label_satisfies(have: &WorkerLabel, want: &DesiredLabel) -> bool {
    if let Some(want_int) = want.int_value {
        return have
            .int_value
            .is_some_and(|h| comparator_holds(h.cmp(&want_int), want.comparator));
    }
    if let Some(want_str) = want.str_value.as_deref() {
        return have
            .str_value
            .as_deref()
            .is_some_and(|h| comparator_holds(h.cmp(want_str), want.comparator));
    }
    false
}

const fn comparator_holds(ord: Ordering, comparator: LabelComparator) -> bool {
    match comparator {
        LabelComparator::Equal => matches!(ord, Ordering::Equal),
        LabelComparator::NotEqual => !matches!(ord, Ordering::Equal),
        LabelComparator::GreaterThan => matches!(ord, Ordering::Greater),
        LabelComparator::GreaterThanOrEqual => !matches!(ord, Ordering::Less),
        LabelComparator::LessThan => matches!(ord, Ordering::Less),
        LabelComparator::LessThanOrEqual => !matches!(ord, Ordering::Greater),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn worker(id: &str, labels: Vec<WorkerLabel>) -> (WorkerId, ActiveWorker) {
        (
            id.to_string(),
            ActiveWorker {
                id: id.to_string(),
                dispatcher_id: None,
                max_runs: 10,
                labels,
            },
        )
    }

    fn slots(layout: &[(&str, usize)]) -> Vec<Arc<Slot>> {
        layout
            .iter()
            .flat_map(|(w, n)| {
                (0..*n).map(move |_| Arc::new(Slot::new((*w).to_string(), Duration::from_secs(5))))
            })
            .collect()
    }

    fn item(sticky: StickyStrategy, desired_worker: Option<&str>) -> QueueItem {
        QueueItem {
            id: 1,
            tenant_id: "t".into(),
            queue: "q".into(),
            task_id: 1,
            step_id: "s".into(),
            action_id: "a".into(),
            schedule_timeout_at_ms: u128::MAX,
            sticky,
            desired_worker_id: desired_worker.map(str::to_string),
            priority: 0,
        }
    }

    fn worker_order(slots: &[Arc<Slot>]) -> Vec<&str> {
        slots.iter().map(|s| s.worker_id()).collect()
    }

    #[test]
    fn hard_sticky_without_desired_worker_yields_nothing() {
        let workers: HashMap<_, _> = [
            worker("w1", vec![WorkerLabel::string("gpu", "a100")]),
            worker("w2", vec![WorkerLabel::string("gpu", "a100")]),
        ]
        .into_iter()
        .collect();
        let pool = slots(&[("w1", 2), ("w2", 2)]);
        let desired = [DesiredLabel::string("gpu", "a100").with_weight(1_000)];

        let ranked = candidate_slots(
            &pool,
            &item(StickyStrategy::Hard, Some("w9")),
            &desired,
            &workers,
        );
        assert!(ranked.is_empty());

        let ranked = candidate_slots(
            &pool,
            &item(StickyStrategy::Hard, Some("w2")),
            &desired,
            &workers,
        );
        assert_eq!(worker_order(&ranked), ["w2", "w2"]);
    }

    #[test]
    fn soft_sticky_prefers_but_does_not_exclude() {
        let workers = HashMap::new();
        let pool = slots(&[("w1", 1), ("w2", 1), ("w3", 1)]);
        let ranked = candidate_slots(&pool, &item(StickyStrategy::Soft, Some("w3")), &[], &workers);
        assert_eq!(worker_order(&ranked), ["w3", "w1", "w2"]);
    }

    #[test]
    fn required_label_excludes_worker() {
        let workers: HashMap<_, _> = [
            worker("w1", vec![WorkerLabel::int("memory", 8)]),
            worker("w2", vec![WorkerLabel::int("memory", 32)]),
            worker("w3", vec![]),
        ]
        .into_iter()
        .collect();
        let pool = slots(&[("w1", 1), ("w2", 1), ("w3", 1)]);
        let desired = [DesiredLabel::int("memory", LabelComparator::GreaterThanOrEqual, 16).required()];

        let ranked = rank_slots(&pool, &desired, &workers);
        assert_eq!(worker_order(&ranked), ["w2"]);
    }

    #[test]
    fn higher_weight_first_and_ties_interleave() {
        let workers: HashMap<_, _> = [
            worker("w1", vec![WorkerLabel::string("zone", "east")]),
            worker("w2", vec![WorkerLabel::string("zone", "west")]),
            worker("w3", vec![WorkerLabel::string("zone", "west")]),
        ]
        .into_iter()
        .collect();
        let pool = slots(&[("w1", 2), ("w2", 2), ("w3", 2)]);
        let desired = [DesiredLabel::string("zone", "west")];

        let ranked = rank_slots(&pool, &desired, &workers);
        assert_eq!(
            worker_order(&ranked),
            ["w2", "w3", "w2", "w3", "w1", "w1"]
        );
    }

    #[test]
    fn negative_weights_push_workers_down() {
        let workers: HashMap<_, _> = [
            worker("w1", vec![WorkerLabel::string("tier", "spot")]),
            worker("w2", vec![WorkerLabel::string("tier", "reserved")]),
        ]
        .into_iter()
        .collect();
        let pool = slots(&[("w1", 1), ("w2", 1)]);
        let desired = [DesiredLabel::string("tier", "spot").with_weight(-50)];

        let ranked = rank_slots(&pool, &desired, &workers);
        assert_eq!(worker_order(&ranked), ["w2", "w1"]);
    }

    #[test]
    fn comparators_use_worker_value_on_the_left() {
        let have = WorkerLabel::int("cpu", 4);
        let check = |cmp, v| label_satisfies(&have, &DesiredLabel::int("cpu", cmp, v));
        assert!(check(LabelComparator::Equal, 4));
        assert!(check(LabelComparator::NotEqual, 5));
        assert!(check(LabelComparator::GreaterThan, 3));
        assert!(!check(LabelComparator::GreaterThan, 4));
        assert!(check(LabelComparator::GreaterThanOrEqual, 4));
        assert!(check(LabelComparator::LessThan, 5));
        assert!(check(LabelComparator::LessThanOrEqual, 4));
        assert!(!check(LabelComparator::LessThanOrEqual, 3));

        let textual = WorkerLabel::string("cpu", "arm");
        assert!(!label_satisfies(&textual, &DesiredLabel::int("cpu", LabelComparator::Equal, 4)));
    }
}
