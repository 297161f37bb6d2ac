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

use std::path::{Path, PathBuf};

use uuid::Uuid;

const SEGMENT_SUFFIX: &str = ".segment";

pub fn channel_dir<P: AsRef<Path>>(root_dir: P, channel: &Uuid) -> PathBuf {
    root_dir.as_ref().join(format!("{:032x}", channel.as_u128()))
}

pub fn segment_name(prefix: u64) -> String {
    format!("{:x}{}", prefix, SEGMENT_SUFFIX)
}

pub fn segment<P: AsRef<Path>>(channel_dir: P, prefix: u64) -> PathBuf {
    channel_dir.as_ref().join(segment_name(prefix))
}

/// Returns the prefix encoded in a segment file name, or `None` for files
/// that are not segments.
pub fn parse_segment_name<P: AsRef<Path>>(path: P) -> Option<u64> {
    let name = path.as_ref().file_name()?.to_str()?;
    let stem = name.strip_suffix(SEGMENT_SUFFIX)?;
    if stem.is_empty() || stem.chars().any(|c| c.is_ascii_uppercase()) {
        return None;
    }
    u64::from_str_radix(stem, 16).ok()
}
