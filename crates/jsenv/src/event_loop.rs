use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, VecDeque},
    sync::Arc,
};

use crate::clock::Clock;

pub type TaskId = u32;

/// Largest delay honoured as given; anything above fires after 1 ms.
const TIMEOUT_MAX_MS: u64 = 2_147_483_647;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Timeout,
    Interval,
    Immediate,
}

impl TaskKind {
    pub(crate) const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Timeout),
            1 => Some(Self::Interval),
            2 => Some(Self::Immediate),
            _ => None,
        }
    }
}

/// A callback whose turn has come. `repeat` is set for intervals, which stay
/// scheduled after firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadyTask {
    pub id: TaskId,
    pub repeat: bool,
}

#[derive(Debug, Clone, Copy)]
enum Schedule {
    Timeout,
    Interval { period_ms: u64 },
    Immediate,
}

#[derive(Debug, Clone, Copy)]
struct Task {
    schedule: Schedule,
    /// Sequence number of the queue entry that currently represents this
    /// task. Entries with any other token are stale.
    token: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TimerEntry {
    deadline_ms: u64,
    seq: u64,
    id: TaskId,
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.deadline_ms, self.seq, self.id).cmp(&(other.deadline_ms, other.seq, other.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Timer and immediate queues of one environment.
///
/// The loop only does bookkeeping: it decides which task ids are due and in
/// which order. Running the callbacks is the caller's job.
pub struct EventLoop {
    clock: Arc<dyn Clock>,
    next_id: TaskId,
    seq: u64,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    immediates: VecDeque<(TaskId, u64)>,
    ready: VecDeque<(TaskId, u64)>,
    active: HashMap<TaskId, Task>,
    /// Queue entries left behind by cancelled tasks.
    stale: usize,
}

impl EventLoop {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            next_id: 1,
            seq: 0,
            timers: BinaryHeap::new(),
            immediates: VecDeque::new(),
            ready: VecDeque::new(),
            active: HashMap::new(),
            stale: 0,
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn schedule(&mut self, kind: TaskKind, delay_ms: f64) -> TaskId {
        let id = self.allocate_id();
        let token = self.next_seq();
        match kind {
            TaskKind::Immediate => {
                self.active.insert(
                    id,
                    Task {
                        schedule: Schedule::Immediate,
                        token,
                    },
                );
                self.immediates.push_back((id, token));
            }
            TaskKind::Timeout | TaskKind::Interval => {
                let delay = clamp_delay(delay_ms);
                let schedule = if kind == TaskKind::Interval {
                    Schedule::Interval { period_ms: delay }
                } else {
                    Schedule::Timeout
                };
                self.active.insert(id, Task { schedule, token });
                self.timers.push(Reverse(TimerEntry {
                    deadline_ms: self.clock.now_ms().saturating_add(delay),
                    seq: token,
                    id,
                }));
            }
        }
        id
    }

    /// Returns `false` if `id` was not scheduled.
    pub fn cancel(&mut self, id: TaskId) -> bool {
        if self.active.remove(&id).is_none() {
            return false;
        }
        self.stale += 1;
        if self.stale * 2 > self.queued() {
            self.compact();
        }
        true
    }

    /// Start a pass: queue every timer due at `now`, then every immediate
    /// scheduled so far. Returns the number of queued tasks.
    pub fn begin_pass(&mut self, now_ms: u64) -> usize {
        while let Some(Reverse(entry)) = self.timers.peek() {
            if entry.deadline_ms > now_ms {
                break;
            }
            let Some(Reverse(entry)) = self.timers.pop() else {
                break;
            };
            if self.is_current(entry.id, entry.seq) {
                self.ready.push_back((entry.id, entry.seq));
            } else {
                self.stale = self.stale.saturating_sub(1);
            }
        }
        while let Some((id, token)) = self.immediates.pop_front() {
            if self.is_current(id, token) {
                self.ready.push_back((id, token));
            } else {
                self.stale = self.stale.saturating_sub(1);
            }
        }
        self.ready.len()
    }

    /// Pop the next queued task of the current pass, skipping cancelled
    /// ones. Intervals are re-armed at `now + period` before being handed out.
    pub fn next_ready(&mut self, now_ms: u64) -> Option<ReadyTask> {
        while let Some((id, token)) = self.ready.pop_front() {
            if !self.is_current(id, token) {
                self.stale = self.stale.saturating_sub(1);
                continue;
            }
            let Some(task) = self.active.get(&id).copied() else {
                continue;
            };
            if let Schedule::Interval { period_ms } = task.schedule {
                let seq = self.next_seq();
                self.timers.push(Reverse(TimerEntry {
                    deadline_ms: now_ms.saturating_add(period_ms),
                    seq,
                    id,
                }));
                if let Some(task) = self.active.get_mut(&id) {
                    task.token = seq;
                }
                return Some(ReadyTask { id, repeat: true });
            }
            self.active.remove(&id);
            return Some(ReadyTask { id, repeat: false });
        }
        None
    }

    pub fn pending(&self) -> usize {
        self.active.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.active.is_empty()
    }

    /// Earliest time at which a tick would find work, if any is scheduled.
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let immediate = self
            .ready
            .iter()
            .chain(self.immediates.iter())
            .any(|&(id, token)| self.is_current(id, token));
        if immediate {
            return Some(self.clock.now_ms());
        }
        self.timers
            .iter()
            .filter(|Reverse(entry)| self.is_current(entry.id, entry.seq))
            .map(|Reverse(entry)| entry.deadline_ms)
            .min()
    }

    pub fn clear(&mut self) {
        self.timers.clear();
        self.immediates.clear();
        self.ready.clear();
        self.active.clear();
        self.stale = 0;
    }

    fn queued(&self) -> usize {
        self.timers.len() + self.immediates.len() + self.ready.len()
    }

    /// Drop every queue entry whose task was cancelled.
    fn compact(&mut self) {
        let active = &self.active;
        let current =
            |id: &TaskId, token: &u64| active.get(id).is_some_and(|task| task.token == *token);
        self.timers.retain(|Reverse(entry)| current(&entry.id, &entry.seq));
        self.immediates.retain(|(id, token)| current(id, token));
        self.ready.retain(|(id, token)| current(id, token));
        self.stale = 0;
    }

    fn is_current(&self, id: TaskId, token: u64) -> bool {
        self.active.get(&id).is_some_and(|task| task.token == token)
    }

    fn allocate_id(&mut self) -> TaskId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.active.contains_key(&id) {
                return id;
            }
        }
    }

    const fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_delay(delay_ms: f64) -> u64 {
    if delay_ms.is_nan() || delay_ms < 1.0 {
        return 1;
    }
    let delay = delay_ms as u64;
    if delay > TIMEOUT_MAX_MS { 1 } else { delay }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn new_loop() -> (Arc<ManualClock>, EventLoop) {
        let clock = Arc::new(ManualClock::new(1_000));
        let event_loop = EventLoop::new(clock.clone());
        (clock, event_loop)
    }

    fn drain(event_loop: &mut EventLoop, now: u64) -> Vec<ReadyTask> {
        event_loop.begin_pass(now);
        std::iter::from_fn(|| event_loop.next_ready(now)).collect()
    }

    #[test]
    fn timers_fire_by_deadline_then_schedule_order() {
        let (clock, mut event_loop) = new_loop();
        let late = event_loop.schedule(TaskKind::Timeout, 20.0);
        let first = event_loop.schedule(TaskKind::Timeout, 10.0);
        let second = event_loop.schedule(TaskKind::Timeout, 10.0);

        assert!(drain(&mut event_loop, clock.now_ms() + 5).is_empty());

        clock.advance(20);
        let ids: Vec<_> = drain(&mut event_loop, clock.now_ms())
            .into_iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(ids, vec![first, second, late]);
        assert!(!event_loop.has_pending());
    }

    #[test]
    fn cancelled_tasks_never_run() {
        let (clock, mut event_loop) = new_loop();
        let kept = event_loop.schedule(TaskKind::Timeout, 1.0);
        let dropped = event_loop.schedule(TaskKind::Timeout, 1.0);
        assert!(event_loop.cancel(dropped));
        assert!(!event_loop.cancel(dropped));

        clock.advance(1);
        let now = clock.now_ms();
        assert_eq!(event_loop.begin_pass(now), 1);
        assert_eq!(
            event_loop.next_ready(now),
            Some(ReadyTask {
                id: kept,
                repeat: false
            })
        );
        assert_eq!(event_loop.next_ready(now), None);
    }

    #[test]
    fn cancel_mid_pass_skips_queued_task() {
        let (clock, mut event_loop) = new_loop();
        let a = event_loop.schedule(TaskKind::Immediate, 0.0);
        let b = event_loop.schedule(TaskKind::Immediate, 0.0);

        let now = clock.now_ms();
        assert_eq!(event_loop.begin_pass(now), 2);
        assert_eq!(event_loop.next_ready(now).map(|t| t.id), Some(a));
        event_loop.cancel(b);
        assert_eq!(event_loop.next_ready(now), None);
    }

    #[test]
    fn interval_rearms_after_firing() {
        let (clock, mut event_loop) = new_loop();
        let id = event_loop.schedule(TaskKind::Interval, 10.0);

        clock.advance(10);
        let fired = drain(&mut event_loop, clock.now_ms());
        assert_eq!(fired, vec![ReadyTask { id, repeat: true }]);
        assert_eq!(event_loop.next_deadline_ms(), Some(clock.now_ms() + 10));

        clock.advance(10);
        assert_eq!(drain(&mut event_loop, clock.now_ms()).len(), 1);

        event_loop.cancel(id);
        clock.advance(10);
        assert!(drain(&mut event_loop, clock.now_ms()).is_empty());
    }

    #[test]
    fn immediates_scheduled_during_a_pass_wait_for_the_next() {
        let (clock, mut event_loop) = new_loop();
        let first = event_loop.schedule(TaskKind::Immediate, 0.0);
        let now = clock.now_ms();

        event_loop.begin_pass(now);
        assert_eq!(event_loop.next_ready(now).map(|t| t.id), Some(first));
        let second = event_loop.schedule(TaskKind::Immediate, 0.0);
        assert_eq!(event_loop.next_ready(now), None);

        assert_eq!(event_loop.begin_pass(now), 1);
        assert_eq!(event_loop.next_ready(now).map(|t| t.id), Some(second));
    }

    #[test]
    fn reused_id_ignores_stale_timer_entry() {
        let (clock, mut event_loop) = new_loop();
        let id = event_loop.schedule(TaskKind::Timeout, 5.0);
        event_loop.cancel(id);
        event_loop.next_id = id;
        let reused = event_loop.schedule(TaskKind::Timeout, 50.0);
        assert_eq!(reused, id);

        clock.advance(5);
        assert!(drain(&mut event_loop, clock.now_ms()).is_empty());
        assert!(event_loop.has_pending());
    }

    #[test]
    fn cancelled_timers_do_not_accumulate() {
        let (_clock, mut event_loop) = new_loop();
        let live: Vec<_> = (0..10)
            .map(|_| event_loop.schedule(TaskKind::Timeout, 1e9))
            .collect();

        for _ in 0..100_000 {
            let id = event_loop.schedule(TaskKind::Timeout, 1e9);
            assert!(event_loop.cancel(id));
            let id = event_loop.schedule(TaskKind::Immediate, 0.0);
            assert!(event_loop.cancel(id));
        }

        assert_eq!(event_loop.pending(), live.len());
        assert!(event_loop.queued() <= 2 * live.len() + 2);
        assert_eq!(event_loop.next_deadline_ms(), Some(1_000_001_000));
    }

    #[test]
    fn compaction_keeps_live_tasks_in_order() {
        let (clock, mut event_loop) = new_loop();
        let first = event_loop.schedule(TaskKind::Timeout, 5.0);
        let doomed: Vec<_> = (0..8)
            .map(|_| event_loop.schedule(TaskKind::Timeout, 1.0))
            .collect();
        let second = event_loop.schedule(TaskKind::Timeout, 5.0);
        for id in doomed {
            event_loop.cancel(id);
        }

        clock.advance(5);
        let ran: Vec<_> = drain(&mut event_loop, clock.now_ms())
            .into_iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(ran, [first, second]);
    }

    #[test]
    fn delays_are_clamped() {
        assert_eq!(clamp_delay(f64::NAN), 1);
        assert_eq!(clamp_delay(-4.0), 1);
        assert_eq!(clamp_delay(0.5), 1);
        assert_eq!(clamp_delay(25.9), 25);
        assert_eq!(clamp_delay(1e12), 1);
    }
}
