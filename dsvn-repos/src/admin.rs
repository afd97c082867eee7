//! Async entry points for dump and load
//!
//! Both run the synchronous codec on Tokio's blocking pool so that a server
//! can serve requests while a large stream is imported or exported.

use crate::dump::{DumpOptions, LoadOptions, LoadStats, dump_fs, load_fs};
use crate::hooks::Hooks;
use crate::repos::Repository;
use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task;

/// Shared cancellation flag for a running dump or load
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Dump `repos` into any writer; the writer is handed back when done.
pub async fn dump_to_writer<W: Write + Send + 'static>(
    repos: Arc<Repository>,
    mut out: W,
    options: DumpOptions,
    cancel: CancelFlag,
) -> Result<W> {
    task::spawn_blocking(move || -> Result<W> {
        let is_cancelled = || cancel.is_cancelled();
        dump_fs(&repos, &mut out, &options, &is_cancelled, &mut |line| tracing::debug!("{}", line))?;
        Ok(out)
    })
    .await
    .map_err(|e| anyhow::anyhow!("Dump task failed: {:?}", e))?
}

/// Dump `repos` into a new file at `dest`.
pub async fn dump_to_file(
    repos: Arc<Repository>,
    dest: impl AsRef<Path>,
    options: DumpOptions,
    cancel: CancelFlag,
) -> Result<()> {
    let dest: PathBuf = dest.as_ref().to_path_buf();
    let file = File::create(&dest).with_context(|| format!("Failed to create {}", dest.display()))?;
    let writer = dump_to_writer(repos, BufWriter::new(file), options, cancel).await?;
    writer
        .into_inner()
        .map_err(|e| anyhow::anyhow!("Failed to flush {}: {}", dest.display(), e.error()))?;
    tracing::info!("Dump written to {}", dest.display());
    Ok(())
}

/// Load a dump stream from any buffered reader.
pub async fn load_from_reader<R: BufRead + Send + 'static>(
    repos: Arc<Repository>,
    input: R,
    options: LoadOptions,
    hooks: Arc<dyn Hooks>,
    cancel: CancelFlag,
) -> Result<LoadStats> {
    let stats = task::spawn_blocking(move || {
        let is_cancelled = || cancel.is_cancelled();
        load_fs(&repos, input, &options, hooks.as_ref(), &is_cancelled, &mut |line| {
            tracing::debug!("{}", line)
        })
    })
    .await
    .map_err(|e| anyhow::anyhow!("Load task failed: {:?}", e))??;
    tracing::info!("Load finished: {}", serde_json::to_string(&stats)?);
    Ok(stats)
}

/// Load the dump file at `src`.
pub async fn load_from_file(
    repos: Arc<Repository>,
    src: impl AsRef<Path>,
    options: LoadOptions,
    hooks: Arc<dyn Hooks>,
    cancel: CancelFlag,
) -> Result<LoadStats> {
    let src = src.as_ref();
    let file = File::open(src).with_context(|| format!("Failed to open {}", src.display()))?;
    load_from_reader(repos, BufReader::new(file), options, hooks, cancel)
        .await
        .with_context(|| format!("Failed to load {}", src.display()))
}
