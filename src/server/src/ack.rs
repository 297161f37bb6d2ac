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
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use uuid::Uuid;

use crate::{
    frame::{AckFrame, WriteBuf},
    reactor::Wakeup,
};

/// Delivers acknowledgements to the producer of a batch.
pub trait Acknowledger: Send + Sync {
    fn acknowledge(&self, channel: Uuid, sequence: i64);
}

/// Acknowledgements waiting to be written to one producer connection.
pub struct AckQueue {
    pending: Mutex<VecDeque<AckFrame>>,
    wakeup: Arc<dyn Wakeup>,
}

impl AckQueue {
    pub fn new(wakeup: Arc<dyn Wakeup>) -> Self {
        AckQueue {
            pending: Mutex::new(VecDeque::new()),
            wakeup,
        }
    }

    /// Moves every pending acknowledgement into `buf`. Returns the number
    /// moved.
    pub fn drain_into(&self, buf: &mut WriteBuf) -> usize {
        let mut pending = self.pending();
        let n = pending.len();
        for frame in pending.drain(..) {
            buf.push(&frame);
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }

    fn pending(&self) -> MutexGuard<'_, VecDeque<AckFrame>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Acknowledger for AckQueue {
    fn acknowledge(&self, channel: Uuid, sequence: i64) {
        self.pending().push_back(AckFrame { channel, sequence });
        self.wakeup.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::frame::{Frame, ACK_MAGIC};

    #[derive(Default)]
    struct CountingWakeup(AtomicUsize);

    impl Wakeup for CountingWakeup {
        fn wakeup(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn acknowledgements_are_framed_in_order() {
        let wakeup = Arc::new(CountingWakeup::default());
        let queue = AckQueue::new(wakeup.clone());
        let channel = Uuid::new_v4();
        queue.acknowledge(channel, 1);
        queue.acknowledge(channel, 2);
        assert_eq!(wakeup.0.load(Ordering::SeqCst), 2);

        let mut buf = WriteBuf::new();
        assert_eq!(queue.drain_into(&mut buf), 2);
        assert!(queue.is_empty());

        let mut out = Vec::new();
        assert!(buf.flush(&mut out).unwrap());
        assert_eq!(out.len(), 2 * AckFrame::SIZE);
        let first = AckFrame::parse(&out[..AckFrame::SIZE], ACK_MAGIC).unwrap();
        let second = AckFrame::parse(&out[AckFrame::SIZE..], ACK_MAGIC).unwrap();
        assert_eq!((first.channel, first.sequence), (channel, 1));
        assert_eq!(second.sequence, 2);
    }
}
