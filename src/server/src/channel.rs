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
    collections::{HashSet, VecDeque},
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    config::ChannelConfig,
    frame::{BatchHeader, BatchIdentity},
    layout,
    node::Node,
    segment::Segment,
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Primary,
    Mirror,
}

/// The prefix of the segment that holds `offset`.
pub fn prefix_for(offset: u64, max_segment_size: u64) -> u64 {
    (offset / max_segment_size) * max_segment_size
}

/// The prefix of the segment a batch of `size` bytes starting at `offset`
/// is written to. A batch never straddles two segments; it goes to the
/// segment holding its end.
pub fn segment_for(offset: u64, size: u64, max_segment_size: u64) -> u64 {
    let home = prefix_for(offset, max_segment_size);
    let end = prefix_for(offset + size, max_segment_size);
    if end != home {
        end
    } else {
        home
    }
}

/// Where a batch is to be written.
#[derive(Clone, Debug)]
pub struct AppendSegment {
    pub segment: Arc<Segment>,
    /// The logical offset of the first byte of the batch.
    pub offset: u64,
    /// The position within the segment file.
    pub position: u64,
}

/// A bounded, insertion ordered set of recently appended batches.
struct RecentBatches {
    capacity: usize,
    order: VecDeque<BatchIdentity>,
    members: HashSet<BatchIdentity>,
}

impl RecentBatches {
    fn new(capacity: usize) -> Self {
        RecentBatches {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            members: HashSet::new(),
        }
    }

    fn contains(&self, identity: &BatchIdentity) -> bool {
        self.members.contains(identity)
    }

    fn insert(&mut self, identity: BatchIdentity) {
        if !self.members.insert(identity) {
            return;
        }
        self.order.push_back(identity);
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
    }
}

struct ChannelCore {
    role: Role,
    partner: Option<Node>,
    next_offset: u64,
    committed_offset: u64,
    recent: RecentBatches,
    append_segment: Option<Arc<Segment>>,
}

/// The log of one channel on this node.
pub struct EventChannel {
    id: Uuid,
    dir: PathBuf,
    max_segment_size: u64,
    core: Mutex<ChannelCore>,
}

impl EventChannel {
    /// Opens the channel rooted at `root_dir/<id>`, resuming after any
    /// segments already on disk.
    pub fn open<P: AsRef<Path>>(
        id: Uuid,
        root_dir: P,
        role: Role,
        partner: Option<Node>,
        config: &ChannelConfig,
    ) -> Result<EventChannel> {
        if config.max_segment_size == 0 {
            return Err(Error::InvalidArgument(
                "max segment size must be positive".to_owned(),
            ));
        }
        let dir = layout::channel_dir(root_dir, &id);
        fs::create_dir_all(&dir)?;

        let mut next_offset = 0;
        for prefix in list_segments(&dir)? {
            let size = fs::metadata(layout::segment(&dir, prefix))?.len();
            next_offset = next_offset.max(prefix + size);
        }
        if next_offset > 0 {
            info!("channel {} resumes at offset {}", id, next_offset);
        }

        Ok(EventChannel {
            id,
            dir,
            max_segment_size: config.max_segment_size,
            core: Mutex::new(ChannelCore {
                role,
                partner,
                next_offset,
                committed_offset: next_offset,
                recent: RecentBatches::new(config.dedup_capacity),
                append_segment: None,
            }),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_segment_size(&self) -> u64 {
        self.max_segment_size
    }

    pub fn role(&self) -> Role {
        self.core().role
    }

    /// The other node of the replication pair, if it is alive.
    pub fn partner(&self) -> Option<Node> {
        self.core().partner
    }

    pub fn set_placement(&self, role: Role, partner: Option<Node>) {
        let mut core = self.core();
        if core.role != role || core.partner != partner {
            debug!(
                "channel {} placement {:?} -> {:?}, partner {:?}",
                self.id, core.role, role, partner
            );
        }
        core.role = role;
        core.partner = partner;
    }

    pub fn next_offset(&self) -> u64 {
        self.core().next_offset
    }

    pub fn committed_offset(&self) -> u64 {
        self.core().committed_offset
    }

    pub fn is_duplicate(&self, header: &BatchHeader) -> bool {
        self.core().recent.contains(&header.identity())
    }

    /// Reserves room for the batch at the end of the log and returns the
    /// segment and position to write it at.
    pub fn append_segment_for(&self, header: &BatchHeader) -> Result<AppendSegment> {
        let size = header.batch_len as u64;
        if size > self.max_segment_size {
            return Err(Error::InvalidArgument(format!(
                "batch of {} bytes exceeds max segment size {}",
                size, self.max_segment_size
            )));
        }
        let mut core = self.core();
        let home = prefix_for(core.next_offset, self.max_segment_size);
        let prefix = segment_for(core.next_offset, size, self.max_segment_size);
        let offset = if prefix != home {
            prefix
        } else {
            core.next_offset
        };
        let segment = self.append_segment(&mut core, prefix)?;
        core.next_offset = offset + size;
        Ok(AppendSegment {
            segment,
            offset,
            position: offset - prefix,
        })
    }

    /// Resolves the segment for a batch whose offset was assigned by the
    /// primary.
    pub fn segment_for(&self, offset: u64, size: u64) -> Result<AppendSegment> {
        let prefix = prefix_for(offset, self.max_segment_size);
        if offset + size > prefix + self.max_segment_size {
            return Err(Error::InvalidArgument(format!(
                "batch at {} of {} bytes crosses segment {:x}",
                offset, size, prefix
            )));
        }
        let mut core = self.core();
        let segment = self.append_segment(&mut core, prefix)?;
        core.next_offset = core.next_offset.max(offset + size);
        Ok(AppendSegment {
            segment,
            offset,
            position: offset - prefix,
        })
    }

    /// Records that the batch has been fully written.
    pub fn appended(&self, header: &BatchHeader) {
        self.core().recent.insert(header.identity());
    }

    /// Advances the committed offset; lower offsets are ignored.
    pub fn commit(&self, offset: u64) {
        let mut core = self.core();
        if offset > core.committed_offset {
            core.committed_offset = offset;
        }
    }

    /// Appends one batch read from a blocking source. Returns the offset the
    /// batch was written at, or `None` if it was a duplicate.
    pub fn append<R: Read>(&self, header: &BatchHeader, src: &mut R) -> Result<Option<u64>> {
        if self.is_duplicate(header) {
            return Ok(None);
        }
        let target = self.append_segment_for(header)?;
        let size = header.batch_len as u64;
        let mut moved = 0;
        while moved < size {
            let n = target
                .segment
                .transfer_from(src, target.position + moved, size - moved)?;
            if n == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock).into());
            }
            moved += n;
        }
        self.appended(header);
        Ok(Some(target.offset))
    }

    /// Reads back log content at a logical offset.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let prefix = prefix_for(offset, self.max_segment_size);
        let segment = Segment::open_for_read(&self.dir, prefix)?;
        segment.read_at(buf, offset - prefix)
    }

    /// The prefixes of all segments on disk, in offset order.
    pub fn segments(&self) -> Result<Vec<u64>> {
        list_segments(&self.dir)
    }

    pub fn open_read_segment(&self, prefix: u64) -> Result<Segment> {
        Segment::open_for_read(&self.dir, prefix)
    }

    /// Opens a segment to be filled by a bulk transfer.
    pub fn sink_segment_for(&self, prefix: u64) -> Result<Segment> {
        if prefix % self.max_segment_size != 0 {
            return Err(Error::InvalidArgument(format!(
                "{:x} is not a segment boundary",
                prefix
            )));
        }
        Segment::open_for_append(&self.dir, prefix)
    }

    /// Records a segment restored by a bulk transfer.
    pub fn restored(&self, prefix: u64, size: u64) {
        let mut core = self.core();
        core.next_offset = core.next_offset.max(prefix + size);
        core.committed_offset = core.committed_offset.max(prefix + size);
        if let Some(segment) = &core.append_segment {
            if segment.prefix() == prefix {
                core.append_segment = None;
            }
        }
    }

    /// Releases open file handles. Segments stay on disk.
    pub fn close(&self) {
        if let Some(segment) = self.core().append_segment.take() {
            if let Err(err) = segment.force() {
                tracing::error!("channel {} force segment {:x}: {}", self.id, segment.prefix(), err);
            }
        }
        debug!("channel {} closed", self.id);
    }

    fn append_segment(&self, core: &mut ChannelCore, prefix: u64) -> Result<Arc<Segment>> {
        if let Some(segment) = &core.append_segment {
            if segment.prefix() == prefix {
                return Ok(segment.clone());
            }
        }
        let segment = Arc::new(Segment::open_for_append(&self.dir, prefix)?);
        core.append_segment = Some(segment.clone());
        Ok(segment)
    }

    fn core(&self) -> MutexGuard<'_, ChannelCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    let mut prefixes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(prefix) = layout::parse_segment_name(entry.path()) {
            prefixes.push(prefix);
        }
    }
    prefixes.sort_unstable();
    Ok(prefixes)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tempdir::TempDir;

    use super::*;

    fn config(max_segment_size: u64) -> ChannelConfig {
        ChannelConfig {
            max_segment_size,
            dedup_capacity: 16,
        }
    }

    #[test]
    fn segment_boundary_law() {
        let m = 1024;
        for o in (0..4 * m).step_by(37) {
            for s in [0, 1, 100, 511, 1023, 1024] {
                let expected = if o / m == (o + s) / m {
                    prefix_for(o, m)
                } else {
                    prefix_for(o + s, m)
                };
                assert_eq!(segment_for(o, s, m), expected, "o={} s={}", o, s);
            }
        }
        assert_eq!(prefix_for(0, m), 0);
        assert_eq!(prefix_for(1023, m), 0);
        assert_eq!(prefix_for(1024, m), 1024);
        assert_eq!(segment_for(1000, 100, m), 1024);
    }

    #[test]
    fn append_is_idempotent() -> Result<()> {
        let dir = TempDir::new("channel")?;
        let id = Uuid::new_v4();
        let channel = EventChannel::open(id, dir.path(), Role::Primary, None, &config(1024))?;
        let header = BatchHeader::new(1, id, 7, 5);

        assert_eq!(channel.append(&header, &mut Cursor::new(b"hello"))?, Some(0));
        assert_eq!(channel.next_offset(), 5);
        assert!(channel.is_duplicate(&header));
        assert_eq!(channel.append(&header, &mut Cursor::new(b"hello"))?, None);
        assert_eq!(channel.next_offset(), 5);

        let mut buf = [0u8; 5];
        channel.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"hello");
        Ok(())
    }

    #[test]
    fn straddling_batch_moves_to_next_segment() -> Result<()> {
        let dir = TempDir::new("channel")?;
        let id = Uuid::new_v4();
        let channel = EventChannel::open(id, dir.path(), Role::Primary, None, &config(16))?;

        let first = BatchHeader::new(1, id, 1, 10);
        assert_eq!(channel.append(&first, &mut Cursor::new([1u8; 10]))?, Some(0));
        let second = BatchHeader::new(1, id, 2, 10);
        let target = channel.append_segment_for(&second)?;
        assert_eq!(target.segment.prefix(), 16);
        assert_eq!(target.offset, 16);
        assert_eq!(target.position, 0);
        assert_eq!(channel.next_offset(), 26);
        Ok(())
    }

    #[test]
    fn oversized_batch_is_rejected() -> Result<()> {
        let dir = TempDir::new("channel")?;
        let id = Uuid::new_v4();
        let channel = EventChannel::open(id, dir.path(), Role::Primary, None, &config(16))?;
        assert!(channel
            .append_segment_for(&BatchHeader::new(1, id, 1, 17))
            .is_err());
        assert_eq!(channel.next_offset(), 0);
        Ok(())
    }

    #[test]
    fn commit_never_regresses() -> Result<()> {
        let dir = TempDir::new("channel")?;
        let channel =
            EventChannel::open(Uuid::new_v4(), dir.path(), Role::Mirror, None, &config(64))?;
        channel.commit(40);
        channel.commit(12);
        assert_eq!(channel.committed_offset(), 40);
        Ok(())
    }

    #[test]
    fn mirror_places_batch_at_assigned_offset() -> Result<()> {
        let dir = TempDir::new("channel")?;
        let id = Uuid::new_v4();
        let channel = EventChannel::open(id, dir.path(), Role::Mirror, None, &config(64))?;
        let target = channel.segment_for(70, 5)?;
        assert_eq!(target.segment.prefix(), 64);
        assert_eq!(target.position, 6);
        assert_eq!(channel.next_offset(), 75);
        assert!(channel.segment_for(60, 5).is_err());
        Ok(())
    }

    #[test]
    fn reopen_resumes_after_existing_segments() -> Result<()> {
        let dir = TempDir::new("channel")?;
        let id = Uuid::new_v4();
        {
            let channel = EventChannel::open(id, dir.path(), Role::Primary, None, &config(16))?;
            for sequence in 0..3 {
                let header = BatchHeader::new(1, id, sequence, 10);
                channel.append(&header, &mut Cursor::new([sequence as u8; 10]))?;
            }
            channel.close();
            assert_eq!(channel.segments()?, vec![0, 16, 32]);
        }
        let channel = EventChannel::open(id, dir.path(), Role::Primary, None, &config(16))?;
        assert_eq!(channel.next_offset(), 42);
        Ok(())
    }

    #[test]
    fn recent_batches_are_bounded() {
        let mut recent = RecentBatches::new(2);
        let channel = Uuid::new_v4();
        for sequence in 0..3 {
            recent.insert(BatchIdentity { channel, sequence });
        }
        assert!(!recent.contains(&BatchIdentity {
            channel,
            sequence: 0
        }));
        assert!(recent.contains(&BatchIdentity {
            channel,
            sequence: 2
        }));
    }
}
