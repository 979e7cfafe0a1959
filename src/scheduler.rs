// Copyright (c) 2024 Mike Tsao. All rights reserved.

//! A generic ordered task runner over named queues.
//!
//! Tasks land in named FIFO lanes; an explicit, mutable priority list
//! decides which lane drains first. The downstream MIDI cable cannot
//! multiplex overlapping requests, so exactly one task runs at a time, on a
//! single drain thread that lives only while there is work.

use core::fmt;
use crossbeam_channel::Receiver;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

type Action = Box<dyn FnOnce() + Send>;

struct Queue {
    id: String,
    tasks: VecDeque<Action>,
}

#[derive(Default)]
struct SchedulerState {
    // Creation order; a queue is removed the instant it drains empty, so
    // presence in this list means it has work.
    queues: Vec<Queue>,
    priority_order: Vec<String>,
    draining: bool,
}
impl SchedulerState {
    fn queue_mut(&mut self, id: &str) -> &mut Queue {
        if let Some(index) = self.queues.iter().position(|q| q.id == id) {
            &mut self.queues[index]
        } else {
            self.queues.push(Queue {
                id: id.to_string(),
                tasks: VecDeque::new(),
            });
            self.queues.last_mut().unwrap()
        }
    }

    // The next task: first non-empty prioritized queue, FIFO within it;
    // queues absent from the priority list drain afterwards in creation
    // order.
    fn next_action(&mut self) -> Option<Action> {
        let index = self
            .priority_order
            .iter()
            .find_map(|id| self.queues.iter().position(|q| q.id == *id))
            .or(if self.queues.is_empty() { None } else { Some(0) })?;
        let action = self.queues[index].tasks.pop_front();
        if self.queues[index].tasks.is_empty() {
            self.queues.remove(index);
        }
        action
    }
}

/// Serializes asynchronous work onto one drain thread, in queue-priority
/// order. Cloning is cheap and clones share the same queues.
#[derive(Clone, Default)]
pub struct Scheduler {
    state: Arc<Mutex<SchedulerState>>,
}
impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("Scheduler")
            .field(
                "queues",
                &state
                    .queues
                    .iter()
                    .map(|q| (q.id.clone(), q.tasks.len()))
                    .collect::<Vec<_>>(),
            )
            .field("priority_order", &state.priority_order)
            .field("draining", &state.draining)
            .finish()
    }
}
impl Scheduler {
    /// Appends `action` to the named queue (creating it if needed), wakes a
    /// drain thread if none is running, and returns a handle for the
    /// eventual result.
    pub fn enqueue<T, F>(&self, queue_id: &str, action: F) -> TaskHandle<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let needs_drain = {
            let Ok(mut state) = self.state.lock() else {
                return TaskHandle { receiver };
            };
            state.queue_mut(queue_id).tasks.push_back(Box::new(move || {
                let _ = sender.send(action());
            }));
            let needs_drain = !state.draining;
            state.draining = true;
            needs_drain
        };
        if needs_drain {
            let state = Arc::clone(&self.state);
            std::thread::spawn(move || Self::drain(state));
        }
        TaskHandle { receiver }
    }

    /// Replaces the priority order. Takes effect at the next dequeue
    /// decision; the in-flight task is unaffected. The order is copied, so
    /// later mutation of the caller's list changes nothing here.
    pub fn set_priority_order<S: Into<String>>(&self, order: impl IntoIterator<Item = S>) {
        if let Ok(mut state) = self.state.lock() {
            state.priority_order = order.into_iter().map(Into::into).collect();
        }
    }

    fn drain(state: Arc<Mutex<SchedulerState>>) {
        loop {
            let action = {
                let Ok(mut state) = state.lock() else {
                    return;
                };
                match state.next_action() {
                    Some(action) => action,
                    None => {
                        state.draining = false;
                        return;
                    }
                }
            };
            // Run outside the lock so tasks may enqueue or re-prioritize. A
            // panicking task must not take the drain thread down with it;
            // the remaining queues still have work.
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(action)) {
                eprintln!("Scheduler task panicked: {e:?}");
            }
        }
    }
}

/// The caller's half of an enqueued task.
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: Receiver<T>,
}
impl<T> TaskHandle<T> {
    /// Blocks until the task has run. `None` means the task will never run
    /// (its scheduler disappeared).
    pub fn wait(self) -> Option<T> {
        self.receiver.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use std::sync::{Arc, Mutex};

    // Holds the drain thread on a gate task so later enqueues pile up and
    // the dequeue order is observable deterministically.
    fn gated(scheduler: &Scheduler) -> crossbeam_channel::Sender<()> {
        let (open, gate) = bounded::<()>(1);
        let _ = scheduler.enqueue("gate", move || {
            let _ = gate.recv();
        });
        open
    }

    #[test]
    fn priority_order_beats_enqueue_order() {
        let scheduler = Scheduler::default();
        scheduler.set_priority_order(["high", "medium", "low"]);
        let open = gated(&scheduler);

        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for queue in ["low", "medium", "high"] {
            let ran = Arc::clone(&ran);
            handles.push(scheduler.enqueue(queue, move || {
                ran.lock().unwrap().push(queue);
            }));
        }
        open.send(()).unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*ran.lock().unwrap(), vec!["high", "medium", "low"]);
    }

    #[test]
    fn fifo_within_a_queue() {
        let scheduler = Scheduler::default();
        let open = gated(&scheduler);
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for n in 0..5 {
            let ran = Arc::clone(&ran);
            handles.push(scheduler.enqueue("only", move || {
                ran.lock().unwrap().push(n);
            }));
        }
        open.send(()).unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*ran.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn unprioritized_queues_drain_in_creation_order_after_prioritized_ones() {
        let scheduler = Scheduler::default();
        scheduler.set_priority_order(["favored"]);
        let open = gated(&scheduler);
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for queue in ["stray_b", "stray_a", "favored"] {
            let ran = Arc::clone(&ran);
            handles.push(scheduler.enqueue(queue, move || {
                ran.lock().unwrap().push(queue);
            }));
        }
        open.send(()).unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        // "gate" was created first but is already gone; strays keep their
        // creation order.
        assert_eq!(
            *ran.lock().unwrap(),
            vec!["favored", "stray_b", "stray_a"]
        );
    }

    #[test]
    fn reprioritizing_inside_a_task_affects_only_later_dequeues() {
        let scheduler = Scheduler::default();
        scheduler.set_priority_order(["high", "medium", "low"]);
        let open = gated(&scheduler);
        let ran = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        {
            let ran = Arc::clone(&ran);
            let scheduler_inside = scheduler.clone();
            handles.push(scheduler.enqueue("high", move || {
                scheduler_inside.set_priority_order(["low", "medium"]);
                ran.lock().unwrap().push("high");
            }));
        }
        for queue in ["medium", "low"] {
            let ran = Arc::clone(&ran);
            handles.push(scheduler.enqueue(queue, move || {
                ran.lock().unwrap().push(queue);
            }));
        }

        open.send(()).unwrap();
        for handle in handles {
            handle.wait().unwrap();
        }
        assert_eq!(*ran.lock().unwrap(), vec!["high", "low", "medium"]);
    }

    #[test]
    fn a_failing_task_does_not_stall_the_queue() {
        let scheduler = Scheduler::default();
        let open = gated(&scheduler);
        let failing: TaskHandle<Result<(), String>> =
            scheduler.enqueue("work", || Err("deliberate".to_string()));
        let succeeding = scheduler.enqueue("work", || Ok::<_, String>(42));
        open.send(()).unwrap();
        assert!(failing.wait().unwrap().is_err());
        assert_eq!(succeeding.wait().unwrap().unwrap(), 42);
    }

    #[test]
    fn a_panicking_task_does_not_wedge_the_scheduler() {
        let scheduler = Scheduler::default();
        let open = gated(&scheduler);
        let panicking: TaskHandle<()> = scheduler.enqueue("work", || panic!("deliberate"));
        let surviving = scheduler.enqueue("work", || 7);
        open.send(()).unwrap();
        // The panicking task never resolves its handle; the next task on
        // the same queue still runs, as does one enqueued afterwards.
        assert_eq!(panicking.wait(), None);
        assert_eq!(surviving.wait(), Some(7));
        assert_eq!(scheduler.enqueue("later", || 8).wait(), Some(8));
    }

    #[test]
    fn drain_thread_restarts_after_going_idle() {
        let scheduler = Scheduler::default();
        assert_eq!(scheduler.enqueue("q", || 1).wait(), Some(1));
        assert_eq!(scheduler.enqueue("q", || 2).wait(), Some(2));
    }

    #[test]
    fn dropping_the_handle_abandons_the_result_but_not_the_task() {
        let scheduler = Scheduler::default();
        let ran = Arc::new(Mutex::new(false));
        {
            let ran = Arc::clone(&ran);
            drop(scheduler.enqueue("q", move || {
                *ran.lock().unwrap() = true;
            }));
        }
        // The next task on the same queue proves the first one ran.
        scheduler.enqueue("q", || ()).wait().unwrap();
        assert!(*ran.lock().unwrap());
    }
}
