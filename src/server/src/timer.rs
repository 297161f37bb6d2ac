// Copyright 2022 The Engula Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{cmp::Reverse, collections::BinaryHeap, sync::Mutex, time::Duration};

pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task);
}

/// Schedules tasks on a tokio runtime.
#[derive(Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        TokioScheduler { handle }
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Schedule {
    deadline: Duration,
    task_id: usize,
}

#[derive(Default)]
struct Timeline {
    now: Duration,
    next_id: usize,
    schedules: BinaryHeap<Reverse<Schedule>>,
    tasks: Vec<Option<Task>>,
}

/// A scheduler driven by an explicit clock, for tests and simulations.
#[derive(Default)]
pub struct ManualScheduler {
    timeline: Mutex<Timeline>,
}

impl ManualScheduler {
    /// Moves the clock forward and runs every task that became due, in
    /// deadline order.
    pub fn advance(&self, elapsed: Duration) {
        let now = {
            let mut timeline = self.lock();
            timeline.now += elapsed;
            timeline.now
        };
        loop {
            let task = {
                let mut timeline = self.lock();
                match timeline.schedules.peek() {
                    Some(Reverse(schedule)) if schedule.deadline <= now => {
                        let task_id = schedule.task_id;
                        timeline.schedules.pop();
                        timeline.tasks[task_id].take()
                    }
                    _ => break,
                }
            };
            if let Some(task) = task {
                task();
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.lock().schedules.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Timeline> {
        match self.timeline.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut timeline = self.lock();
        let task_id = timeline.next_id;
        timeline.next_id += 1;
        let deadline = timeline.now + delay;
        timeline.tasks.push(Some(task));
        timeline.schedules.push(Reverse(Schedule { deadline, task_id }));
    }
}
