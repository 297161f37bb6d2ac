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
    io::{self, Read, Write},
    sync::{Arc, Mutex, MutexGuard},
};

struct Buffer {
    data: VecDeque<u8>,
    capacity: usize,
    closed: bool,
}

/// One end of an in-memory, non-blocking duplex stream. Reads on an empty
/// buffer and writes on a full one fail with `WouldBlock`, like a socket
/// registered with the reactor.
pub struct Endpoint {
    incoming: Arc<Mutex<Buffer>>,
    outgoing: Arc<Mutex<Buffer>>,
    chunk: usize,
}

/// Creates a connected pair of endpoints, each direction buffering at most
/// `capacity` bytes.
pub fn pipe(capacity: usize) -> (Endpoint, Endpoint) {
    let buffer = || {
        Arc::new(Mutex::new(Buffer {
            data: VecDeque::new(),
            capacity,
            closed: false,
        }))
    };
    let (forward, backward) = (buffer(), buffer());
    let left = Endpoint {
        incoming: backward.clone(),
        outgoing: forward.clone(),
        chunk: usize::MAX,
    };
    let right = Endpoint {
        incoming: forward,
        outgoing: backward,
        chunk: usize::MAX,
    };
    (left, right)
}

fn lock(buffer: &Mutex<Buffer>) -> MutexGuard<'_, Buffer> {
    buffer.lock().unwrap()
}

impl Endpoint {
    /// Caps the number of bytes a single read returns.
    pub fn with_chunk(mut self, chunk: usize) -> Self {
        self.chunk = chunk.max(1);
        self
    }

    /// Bytes waiting to be read from this end.
    pub fn pending(&self) -> usize {
        lock(&self.incoming).data.len()
    }

    /// Hangs up: the peer reads EOF once drained and its writes fail.
    pub fn close(&self) {
        lock(&self.outgoing).closed = true;
        lock(&self.incoming).closed = true;
    }
}

impl Read for Endpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut incoming = lock(&self.incoming);
        if incoming.data.is_empty() {
            if incoming.closed {
                return Ok(0);
            }
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(self.chunk).min(incoming.data.len());
        for (slot, byte) in buf.iter_mut().zip(incoming.data.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for Endpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut outgoing = lock(&self.outgoing);
        if outgoing.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let free = outgoing.capacity - outgoing.data.len();
        if free == 0 {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(free);
        outgoing.data.extend(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
