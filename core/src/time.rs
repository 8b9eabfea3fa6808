//! System-time abstraction, grounded in `inc/time.h` + `inc/timer.h`: a
//! coarse monotonic tick for scheduling, and a deadline-ordered timer queue
//! dispatched at a single priority. Wraparound is modular; comparisons use
//! signed differences over the modular domain, never a direct `<`.

use ff_floppy::SampleTicks;

/// Coarse (low-MHz) monotonic tick, used for scheduling deadlines.
pub type Ticks = u32;

/// `y - x` as a signed quantity, correct across `Ticks` wraparound.
pub fn time_diff(x: Ticks, y: Ticks) -> i32 {
    y.wrapping_sub(x) as i32
}

/// `x + d`, wrapping.
pub fn time_add(x: Ticks, d: i32) -> Ticks {
    x.wrapping_add(d as u32)
}

/// `x - d`, wrapping.
pub fn time_sub(x: Ticks, d: i32) -> Ticks {
    x.wrapping_sub(d as u32)
}

/// Convert a sample-clock tick count to the coarse clock, rounding down.
/// `sample_hz` and `tick_hz` are both compile-time constants of the target;
/// callers pass the ratio directly since this crate has no MCU to query.
pub fn sample_to_ticks(sample_ticks: SampleTicks, sample_per_tick: u32) -> Ticks {
    sample_ticks / sample_per_tick.max(1)
}

/// A cooperative yield point, standing in for `thread_yield()` in
/// `src/file_cache.c`'s `progress_io`: called at the top of every
/// scheduler tick so a driving loop with other work to do gets a chance
/// to run it before this tick's I/O step is issued.
pub trait Scheduler {
    fn yield_now(&mut self);
}

/// The default scheduler: nothing else to hand control to, so the tick
/// proceeds immediately. What a single-tasked caller (and every existing
/// test) gets without having to name a scheduler at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullScheduler;

impl Scheduler for NullScheduler {
    fn yield_now(&mut self) {}
}

/// A deadline-ordered timer. Timers are owned by their client and chained
/// into a [`TimerQueue`] by deadline; `callback` fires once the queue's
/// "now" reaches or passes `deadline`, then the timer returns to `Inactive`.
///
/// Mirrors `struct timer` from `inc/timer.h` (`deadline`, `cb_fn`, `cb_dat`,
/// `next`), with the callback held as a boxed closure instead of a raw
/// function pointer plus opaque context.
pub struct Timer<F: FnMut()> {
    state: TimerState,
    deadline: Ticks,
    callback: F,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerState {
    Inactive,
    Queued,
    Firing,
}

impl<F: FnMut()> Timer<F> {
    pub fn new(callback: F) -> Self {
        Self {
            state: TimerState::Inactive,
            deadline: 0,
            callback,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state != TimerState::Inactive
    }

    pub fn deadline(&self) -> Ticks {
        self.deadline
    }
}

/// Singly-linked, deadline-ordered queue of pending timers. `next_deadline`
/// arms the next hardware interrupt; `fire(now)` dispatches every timer
/// whose deadline has passed, in deadline order.
///
/// Timers are identified by index into `entries` rather than by pointer,
/// since Rust has no stable address for a moved struct the way the C
/// original relies on `struct timer *next` links between fixed objects.
pub struct TimerQueue<F: FnMut()> {
    entries: Vec<Option<Timer<F>>>,
    order: Vec<usize>,
}

/// Opaque handle into a [`TimerQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

impl<F: FnMut()> TimerQueue<F> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            order: Vec::new(),
        }
    }

    /// Registers a new, initially-inactive timer and returns its handle.
    /// Safe to call from any priority at or below TIMER priority.
    pub fn init(&mut self, timer: Timer<F>) -> TimerHandle {
        self.entries.push(Some(timer));
        TimerHandle(self.entries.len() - 1)
    }

    /// Arms `handle` to fire at `deadline`, inserting it into the queue in
    /// deadline order. Re-arming an already-queued timer first cancels it.
    pub fn set(&mut self, handle: TimerHandle, deadline: Ticks, now: Ticks) {
        self.cancel(handle);
        let t = self.entries[handle.0].as_mut().expect("live timer handle");
        t.state = TimerState::Queued;
        t.deadline = deadline;

        let pos = self
            .order
            .iter()
            .position(|&idx| {
                let other = self.entries[idx].as_ref().expect("queued entry present");
                time_diff(now, other.deadline) > time_diff(now, deadline)
            })
            .unwrap_or(self.order.len());
        self.order.insert(pos, handle.0);
    }

    /// Removes `handle` from the queue if queued. Safe from any priority
    /// at or below TIMER priority, including interrupt context.
    pub fn cancel(&mut self, handle: TimerHandle) {
        if let Some(t) = self.entries[handle.0].as_mut() {
            t.state = TimerState::Inactive;
        }
        self.order.retain(|&idx| idx != handle.0);
    }

    /// Dispatches every timer whose deadline has passed as of `now`, in
    /// deadline order, and returns the next arming deadline if any timer
    /// remains queued.
    pub fn fire(&mut self, now: Ticks) -> Option<Ticks> {
        while let Some(&idx) = self.order.first() {
            let due = {
                let t = self.entries[idx].as_ref().expect("queued entry present");
                time_diff(t.deadline, now) >= 0
            };
            if !due {
                break;
            }
            self.order.remove(0);
            let t = self.entries[idx].as_mut().expect("queued entry present");
            t.state = TimerState::Firing;
            (t.callback)();
            if t.state == TimerState::Firing {
                t.state = TimerState::Inactive;
            }
        }
        self.order.first().map(|&idx| {
            self.entries[idx]
                .as_ref()
                .expect("queued entry present")
                .deadline
        })
    }
}

impl<F: FnMut()> Default for TimerQueue<F> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn diff_handles_wraparound() {
        assert_eq!(time_diff(u32::MAX, 0), 1);
        assert_eq!(time_diff(0, u32::MAX), -1);
        assert_eq!(time_diff(100, 150), 50);
    }

    #[test]
    fn fires_in_deadline_order() {
        let log: Rc<Cell<Vec<u32>>> = Rc::new(Cell::new(Vec::new()));
        let mut q: TimerQueue<Box<dyn FnMut()>> = TimerQueue::new();

        let mk = |tag: u32, log: Rc<Cell<Vec<u32>>>| -> Box<dyn FnMut()> {
            Box::new(move || {
                let mut v = log.take();
                v.push(tag);
                log.set(v);
            })
        };

        let a = q.init(Timer::new(mk(1, log.clone())));
        let b = q.init(Timer::new(mk(2, log.clone())));
        let c = q.init(Timer::new(mk(3, log.clone())));

        q.set(a, 300, 0);
        q.set(b, 100, 0);
        q.set(c, 200, 0);

        q.fire(1000);
        assert_eq!(log.take(), vec![2, 3, 1]);
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let fired = Rc::new(Cell::new(false));
        let f = fired.clone();
        let mut q = TimerQueue::new();
        let h = q.init(Timer::new(move || f.set(true)));
        q.set(h, 10, 0);
        q.cancel(h);
        q.fire(1000);
        assert!(!fired.get());
    }

    #[test]
    fn not_yet_due_is_left_queued() {
        let mut q: TimerQueue<Box<dyn FnMut()>> = TimerQueue::new();
        let h = q.init(Timer::new(Box::new(|| {}) as Box<dyn FnMut()>));
        q.set(h, 500, 0);
        let next = q.fire(100);
        assert_eq!(next, Some(500));
    }
}
