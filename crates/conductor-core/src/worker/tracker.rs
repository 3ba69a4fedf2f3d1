//! TaskStateTracker - worker 側のタスク状態と capacity
//!
//! - 終端状態（COMPLETED / FAILED / CANCELLED）になったエントリは消す
//! - `reserve` は RUNNING として枠を取る。受け付けの判定と報告する capacity は同じ値
//! - `running = |RUNNING ∪ CANCELLING|`, `available = max_parallel - running`
//! - 変更のたびに RUNNER_CAPACITY と RUNNER_STATUS を outbox に積む

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use crate::domain::{TaskId, WorkerCapacity};
use crate::protocol::{RunnerStatus, WorkerMessage};
use crate::worker::Outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackedState {
    Running,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl TrackedState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackedState::Completed | TrackedState::Failed | TrackedState::Cancelled
        )
    }

    pub fn is_running(self) -> bool {
        matches!(self, TrackedState::Running | TrackedState::Cancelling)
    }
}

pub struct TaskStateTracker {
    max_parallel: usize,
    states: Mutex<HashMap<TaskId, TrackedState>>,
    outbox: Outbox,
}

impl TaskStateTracker {
    pub fn new(max_parallel: usize, outbox: Outbox) -> Self {
        Self {
            max_parallel,
            states: Mutex::new(HashMap::new()),
            outbox,
        }
    }

    fn states(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, TrackedState>> {
        self.states.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Claim a slot by marking the task RUNNING. Refused when the task is
    /// already tracked or the reported capacity has no free slot, so the
    /// admission rule and RUNNER_CAPACITY are the same number.
    pub fn reserve(&self, task_id: TaskId) -> bool {
        let capacity = {
            let mut states = self.states();
            if states.contains_key(&task_id) || capacity_of(self.max_parallel, &states).available == 0 {
                return false;
            }
            states.insert(task_id, TrackedState::Running);
            capacity_of(self.max_parallel, &states)
        };
        self.report(capacity);
        true
    }

    /// Move `task_id` to `state`; terminal states drop the entry.
    /// Returns the previous state.
    pub fn set_state(&self, task_id: TaskId, state: TrackedState) -> Option<TrackedState> {
        let (previous, capacity) = {
            let mut states = self.states();
            let previous = if state.is_terminal() {
                states.remove(&task_id)
            } else {
                states.insert(task_id, state)
            };
            (previous, capacity_of(self.max_parallel, &states))
        };
        debug!(task = %task_id, ?previous, ?state, "tracked state changed");
        self.report(capacity);
        previous
    }

    pub fn state(&self, task_id: TaskId) -> Option<TrackedState> {
        self.states().get(&task_id).copied()
    }

    pub fn capacity(&self) -> WorkerCapacity {
        capacity_of(self.max_parallel, &self.states())
    }

    /// Push the current capacity and status (also used right after reconnecting).
    pub fn report_now(&self) {
        self.report(self.capacity());
    }

    fn report(&self, capacity: WorkerCapacity) {
        // 切断中は receiver 側に溜まる。client が落ちた後の送信失敗は無視
        let _ = self.outbox.send(WorkerMessage::RunnerCapacity(capacity));
        let _ = self.outbox.send(WorkerMessage::RunnerStatus {
            status: RunnerStatus::from_capacity(&capacity),
        });
    }
}

fn capacity_of(max_parallel: usize, states: &HashMap<TaskId, TrackedState>) -> WorkerCapacity {
    let running = states.values().filter(|s| s.is_running()).count();
    WorkerCapacity::new(max_parallel, running)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::sync::mpsc;

    fn tracker(max: usize) -> (TaskStateTracker, mpsc::UnboundedReceiver<WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TaskStateTracker::new(max, tx), rx)
    }

    fn last_capacity(rx: &mut mpsc::UnboundedReceiver<WorkerMessage>) -> Option<WorkerCapacity> {
        let mut last = None;
        while let Ok(msg) = rx.try_recv() {
            if let WorkerMessage::RunnerCapacity(cap) = msg {
                last = Some(cap);
            }
        }
        last
    }

    #[test]
    fn capacity_is_conserved_across_transitions() {
        let (t, mut rx) = tracker(3);
        let ids: Vec<TaskId> = (1..=3).map(TaskId::new).collect();
        let steps = [
            (ids[0], TrackedState::Running),
            (ids[1], TrackedState::Running),
            (ids[1], TrackedState::Cancelling),
            (ids[2], TrackedState::Running),
            (ids[0], TrackedState::Completed),
            (ids[1], TrackedState::Cancelled),
            (ids[2], TrackedState::Failed),
        ];
        for id in &ids {
            assert!(t.reserve(*id));
        }
        for (id, state) in steps {
            t.set_state(id, state);
            let cap = t.capacity();
            assert_eq!(cap.running + cap.available, cap.max_parallel);
            assert_eq!(last_capacity(&mut rx), Some(cap));
        }
        assert_eq!(t.capacity(), WorkerCapacity::new(3, 0));
    }

    #[rstest]
    #[case(TrackedState::Completed)]
    #[case(TrackedState::Failed)]
    #[case(TrackedState::Cancelled)]
    fn terminal_states_drop_the_entry(#[case] terminal: TrackedState) {
        let (t, _rx) = tracker(1);
        t.reserve(TaskId::new(1));
        t.set_state(TaskId::new(1), TrackedState::Running);
        assert_eq!(t.set_state(TaskId::new(1), terminal), Some(TrackedState::Running));
        assert_eq!(t.state(TaskId::new(1)), None);
        assert!(t.reserve(TaskId::new(2)));
    }

    #[test]
    fn reserve_refuses_duplicates_and_full_pools() {
        let (t, _rx) = tracker(1);
        assert!(t.reserve(TaskId::new(1)));
        assert!(!t.reserve(TaskId::new(1)));
        assert!(!t.reserve(TaskId::new(2)));
        assert_eq!(t.capacity(), WorkerCapacity::new(1, 1));
    }

    #[test]
    fn reported_capacity_matches_admission() {
        let (t, mut rx) = tracker(2);
        for id in 1..=3 {
            let reported = last_capacity(&mut rx).unwrap_or(t.capacity());
            // 空きがあると報告していれば受け入れる。逆も同じ
            assert_eq!(t.reserve(TaskId::new(id)), reported.available > 0);
        }
        assert_eq!(last_capacity(&mut rx), Some(WorkerCapacity::new(2, 2)));

        t.set_state(TaskId::new(1), TrackedState::Completed);
        assert_eq!(last_capacity(&mut rx).map(|c| c.available), Some(1));
        assert!(t.reserve(TaskId::new(4)));
    }

    #[test]
    fn every_mutation_reports_status_too() {
        let (t, mut rx) = tracker(2);
        t.reserve(TaskId::new(1));
        t.set_state(TaskId::new(1), TrackedState::Running);

        let frames: Vec<WorkerMessage> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(frames.len(), 4);
        assert_eq!(
            frames[3],
            WorkerMessage::RunnerStatus {
                status: RunnerStatus::Busy
            }
        );
    }
}
