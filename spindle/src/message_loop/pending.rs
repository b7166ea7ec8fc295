use crate::task::Task;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::time::Instant;

/// A queued unit of work plus its scheduling metadata.
pub(crate) struct PendingTask {
    pub(crate) task: Box<dyn Task>,
    /// Absent for tasks posted without a delay.
    pub(crate) delayed_run_time: Option<Instant>,
    /// Assigned when the task enters the delayed queue, so ties on the
    /// deadline resolve in promotion order rather than post order.
    pub(crate) sequence_num: i64,
}

impl PendingTask {
    pub(crate) fn new(task: Box<dyn Task>, delayed_run_time: Option<Instant>) -> Self {
        Self {
            task,
            delayed_run_time,
            sequence_num: 0,
        }
    }
}

impl PartialEq for PendingTask {
    fn eq(&self, other: &Self) -> bool {
        self.delayed_run_time == other.delayed_run_time && self.sequence_num == other.sequence_num
    }
}

impl Eq for PendingTask {}

impl PartialOrd for PendingTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTask {
    // Inverted so that `BinaryHeap`, a max-heap, surfaces the entry with the
    // earliest deadline, breaking ties toward the lower sequence number.
    fn cmp(&self, other: &Self) -> Ordering {
        (other.delayed_run_time, other.sequence_num)
            .cmp(&(self.delayed_run_time, self.sequence_num))
    }
}

/// FIFO queue of pending tasks. The incoming→work transfer is an O(1) swap.
pub(crate) type TaskQueue = VecDeque<PendingTask>;

/// Min-heap over (deadline, promotion sequence).
pub(crate) type DelayedTaskQueue = BinaryHeap<PendingTask>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    fn pending(deadline_ms: u64, sequence_num: i64, epoch: Instant) -> PendingTask {
        let mut task = PendingTask::new(
            Box::new(|| {}),
            Some(epoch + Duration::from_millis(deadline_ms)),
        );
        task.sequence_num = sequence_num;
        task
    }

    #[rstest]
    #[case::earlier_deadline_first(&[(50, 0), (10, 1)], &[1, 0])]
    #[case::equal_deadline_lower_sequence_first(&[(10, 2), (10, 1)], &[1, 2])]
    #[case::mixed(&[(50, 0), (10, 1), (10, 2)], &[1, 2, 0])]
    fn heap_pops_in_deadline_then_sequence_order(
        #[case] entries: &[(u64, i64)],
        #[case] expected: &[i64],
    ) {
        let epoch = Instant::now();
        let mut heap = DelayedTaskQueue::new();
        for &(deadline_ms, seq) in entries {
            heap.push(pending(deadline_ms, seq, epoch));
        }

        let mut popped = Vec::new();
        while let Some(task) = heap.pop() {
            popped.push(task.sequence_num);
        }
        assert_eq!(popped, expected);
    }

    #[test]
    fn work_queue_swap_is_wholesale() {
        let epoch = Instant::now();
        let mut incoming: TaskQueue = VecDeque::new();
        incoming.push_back(pending(0, 0, epoch));
        incoming.push_back(pending(0, 1, epoch));
        let mut work: TaskQueue = VecDeque::new();

        std::mem::swap(&mut incoming, &mut work);
        assert!(incoming.is_empty());
        assert_eq!(work.len(), 2);
    }
}
