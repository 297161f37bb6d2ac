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

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use crate::timer::Scheduler;

type Action = Box<dyn FnOnce() + Send>;

struct State {
    remaining: usize,
    met: bool,
    cancelled: bool,
    action: Option<Action>,
    on_cancel: Option<Action>,
}

/// A one shot barrier for `parties` participants.
///
/// The action runs exactly once, on the thread of the party that meets
/// last. Once cancelled the rendezvous can never complete and further
/// meetings are ignored. Actions always run outside the internal lock, so
/// they may call back into the rendezvous.
pub struct Rendezvous {
    parties: usize,
    state: Mutex<State>,
}

impl Rendezvous {
    pub fn new<F>(parties: usize, action: F) -> Arc<Rendezvous>
    where
        F: FnOnce() + Send + 'static,
    {
        let rendezvous = Arc::new(Rendezvous {
            parties,
            state: Mutex::new(State {
                remaining: parties,
                met: false,
                cancelled: false,
                action: Some(Box::new(action)),
                on_cancel: None,
            }),
        });
        if parties == 0 {
            rendezvous.complete();
        }
        rendezvous
    }

    /// Registers one party. Returns true if this meeting completed the
    /// rendezvous.
    pub fn meet(&self) -> bool {
        let action = {
            let mut state = self.state();
            if state.met || state.cancelled || state.remaining == 0 {
                return false;
            }
            state.remaining -= 1;
            if state.remaining > 0 {
                return false;
            }
            state.met = true;
            state.action.take()
        };
        if let Some(action) = action {
            action();
        }
        true
    }

    /// Cancels the rendezvous unless it has already completed. Returns true
    /// if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        let on_cancel = {
            let mut state = self.state();
            if state.met || state.cancelled {
                return false;
            }
            state.cancelled = true;
            state.action = None;
            state.on_cancel.take()
        };
        if let Some(on_cancel) = on_cancel {
            on_cancel();
        }
        true
    }

    /// Arms a deadline: if the rendezvous has not completed after `delay`
    /// it is cancelled. `on_cancel` runs once on any cancellation, including
    /// an explicit `cancel`.
    pub fn schedule_cancellation<F>(
        self: &Arc<Self>,
        delay: Duration,
        scheduler: &dyn Scheduler,
        on_cancel: F,
    ) where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.state();
            if state.met || state.cancelled {
                return;
            }
            state.on_cancel = Some(Box::new(on_cancel));
        }
        let rendezvous = Arc::downgrade(self);
        scheduler.schedule(
            delay,
            Box::new(move || {
                if let Some(rendezvous) = rendezvous.upgrade() {
                    if rendezvous.cancel() {
                        tracing::warn!("rendezvous of {} parties timed out", rendezvous.parties);
                    }
                }
            }),
        );
    }

    pub fn is_met(&self) -> bool {
        self.state().met
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    fn complete(&self) {
        let action = {
            let mut state = self.state();
            state.met = true;
            state.action.take()
        };
        if let Some(action) = action {
            action();
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Rendezvous")
            .field("parties", &self.parties)
            .field("remaining", &state.remaining)
            .field("met", &state.met)
            .field("cancelled", &state.cancelled)
            .finish()
    }
}
