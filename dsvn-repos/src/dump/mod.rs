//! Dump streams
//!
//! A dump stream is a portable encoding of a range of revisions: a format
//! header, the repository UUID, then one revision record per revision
//! followed by the node records describing what it changed. [`dump_fs`]
//! writes one, [`DumpReader`] parses one and [`load_fs`] replays one into a
//! repository, one transaction per revision.

mod format;
mod load;
mod reader;
mod writer;

pub use format::DUMP_FORMAT_VERSION;
pub use load::{LoadStats, load_fs};
pub use reader::{DumpReader, DumpRecord, NodeRecord, RevisionRecord};
pub use writer::dump_fs;

use crate::config::{DumpDefaults, LoadDefaults};
use crate::types::Revnum;
use serde::{Deserialize, Serialize};

/// What `load_fs` does with the UUID found in a stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UuidAction {
    /// Take it only if the repository has no revisions yet
    #[default]
    Default,
    Ignore,
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpOptions {
    pub start: Revnum,
    /// Last revision to dump; youngest when `None`
    pub end: Option<Revnum>,
    /// Dump the first revision as a change against its predecessor
    /// instead of as a full tree, and omit the UUID
    pub incremental: bool,
    /// Write file texts as deltas against their previous version
    pub use_deltas: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            start: 0,
            end: None,
            incremental: false,
            use_deltas: false,
        }
    }
}

impl DumpOptions {
    pub fn from_config(defaults: &DumpDefaults) -> Self {
        Self {
            incremental: defaults.incremental,
            use_deltas: defaults.use_deltas,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub uuid_action: UuidAction,
    /// Directory every loaded path is placed under
    pub parent_dir: Option<String>,
    /// Keep the dumped revision numbers; only valid for an empty repository
    pub preserve_revisions: bool,
    pub use_pre_commit_hook: bool,
    pub use_post_commit_hook: bool,
}

impl LoadOptions {
    pub fn from_config(defaults: &LoadDefaults) -> Self {
        Self {
            uuid_action: defaults.uuid_action,
            use_pre_commit_hook: defaults.use_pre_commit_hook,
            use_post_commit_hook: defaults.use_post_commit_hook,
            ..Default::default()
        }
    }
}
