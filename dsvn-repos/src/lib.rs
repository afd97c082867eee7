//! DSvn repository core
//!
//! Versioned tree storage with the Subversion repository protocols on top:
//! - Binary text deltas (windowed, streaming encoder/decoder)
//! - The tree-delta editor protocol and the drivers that feed it
//! - Reporter: client working-copy state in, minimal update out
//! - Transactions, commit editor and atomic commit with merge
//! - Portable dump streams (writer, strict reader, loader)
//! - Authorization, hooks, locks and revision properties
//! - In-memory and sled-backed storage

pub mod admin;
pub mod authz;
pub mod config;
pub mod delta;
pub mod dump;
pub mod editor;
pub mod error;
pub mod hooks;
pub mod node_editor;
pub mod path;
pub mod props;
pub mod replay;
pub mod reporter;
pub mod repos;
pub mod storage;
pub mod tree;
pub mod txn;
pub mod types;

mod compare;

pub use authz::{Access, AccessCheck, AllowAll, Authz, DenyAll, SvnAuthz};
pub use config::ReposConfig;
pub use delta::{
    DeltaDecoder, DeltaEncoder, DeltaWindow, Instruction, TextDelta, apply_delta, apply_delta_stream, apply_window,
    compute_delta,
};
pub use dump::{DumpOptions, DumpReader, DumpRecord, LoadOptions, LoadStats, UuidAction, dump_fs, load_fs};
pub use editor::{BatonStack, DirBaton, EditRecorder, Editor, FileBaton, send_text_delta};
pub use error::{ReposError, Result};
pub use hooks::{Hooks, NoHooks, ScriptHooks, TxnInfo};
pub use node_editor::{ChangeNode, NodeEditor};
pub use props::{PropChange, PropertySet, svn_props};
pub use replay::ReplayOptions;
pub use reporter::{ReportOptions, Reporter};
pub use repos::{FileRev, LogEntry, LogOptions, Repository, RevisionAccess};
pub use storage::{Lock, MemoryStore, Revision, SledStore, Storage};
pub use tree::{ChangedPath, NodeRev, Tree};
pub use txn::{CommitEditor, Transaction, TxnKind};
pub use types::{CancelFn, CopyFrom, NodeAction, NodeKind, Revnum, never_cancel};
