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
    fs::{File, OpenOptions},
    io::{self, Read, Write},
    os::unix::fs::FileExt,
    path::{Path, PathBuf},
};

use crate::{
    error::{closed_by_peer, interrupted, would_block},
    layout, Error, Result,
};

const TRANSFER_CHUNK: usize = 8 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Append,
    Read,
}

/// One extent of a channel log, stored in a file named after the offset of
/// its first byte.
#[derive(Debug)]
pub struct Segment {
    path: PathBuf,
    prefix: u64,
    mode: Mode,
    file: File,
}

impl Segment {
    pub fn open_for_append<P: AsRef<Path>>(channel_dir: P, prefix: u64) -> Result<Segment> {
        Self::open(layout::segment(channel_dir, prefix), Mode::Append)
    }

    pub fn open_for_read<P: AsRef<Path>>(channel_dir: P, prefix: u64) -> Result<Segment> {
        Self::open(layout::segment(channel_dir, prefix), Mode::Read)
    }

    pub fn open(path: PathBuf, mode: Mode) -> Result<Segment> {
        let prefix = layout::parse_segment_name(&path).ok_or_else(|| {
            Error::InvalidArgument(format!("{} is not a segment", path.display()))
        })?;
        let file = match mode {
            Mode::Append => OpenOptions::new().write(true).create(true).open(&path)?,
            Mode::Read => OpenOptions::new().read(true).open(&path)?,
        };
        Ok(Segment {
            path,
            prefix,
            mode,
            file,
        })
    }

    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn write_at(&self, buf: &[u8], position: u64) -> Result<()> {
        self.expect_mode(Mode::Append)?;
        self.file.write_all_at(buf, position)?;
        Ok(())
    }

    pub fn read_at(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        self.expect_mode(Mode::Read)?;
        Ok(self.file.read_at(buf, position)?)
    }

    /// Flushes written content to durable storage.
    pub fn force(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Copies up to `count` bytes from a non-blocking source into the
    /// segment starting at `position`. Returns the number of bytes moved
    /// before the source ran dry; a closed source is an error.
    pub fn transfer_from<R: Read>(&self, src: &mut R, position: u64, count: u64) -> Result<u64> {
        self.expect_mode(Mode::Append)?;
        let mut chunk = [0u8; TRANSFER_CHUNK];
        let mut moved = 0u64;
        while moved < count {
            let want = (count - moved).min(TRANSFER_CHUNK as u64) as usize;
            match src.read(&mut chunk[..want]) {
                Ok(0) => return Err(closed_by_peer().into()),
                Ok(n) => {
                    self.file.write_all_at(&chunk[..n], position + moved)?;
                    moved += n as u64;
                }
                Err(ref e) if would_block(e) => break,
                Err(ref e) if interrupted(e) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(moved)
    }

    /// Copies up to `count` bytes starting at `position` into a
    /// non-blocking sink. Returns the number of bytes the sink accepted.
    pub fn transfer_to<W: Write>(&self, position: u64, count: u64, dst: &mut W) -> Result<u64> {
        self.expect_mode(Mode::Read)?;
        let mut chunk = [0u8; TRANSFER_CHUNK];
        let mut moved = 0u64;
        'outer: while moved < count {
            let want = (count - moved).min(TRANSFER_CHUNK as u64) as usize;
            let read = self.file.read_at(&mut chunk[..want], position + moved)?;
            if read == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("segment {} is shorter than expected", self.path.display()),
                )));
            }
            let mut sent = 0;
            while sent < read {
                match dst.write(&chunk[sent..read]) {
                    Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                    Ok(n) => {
                        sent += n;
                        moved += n as u64;
                    }
                    Err(ref e) if would_block(e) => break 'outer,
                    Err(ref e) if interrupted(e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(moved)
    }

    fn expect_mode(&self, mode: Mode) -> Result<()> {
        if self.mode != mode {
            return Err(Error::InvalidArgument(format!(
                "segment {} is opened for {:?}",
                self.path.display(),
                self.mode
            )));
        }
        Ok(())
    }
}
