//! Chunked fetch/transform/load pipeline
//!
//! Walks `[0, total_units)` in fixed-size chunks, strictly one at a time:
//!
//! ```text
//!   fetch ─► transform ─► (artifact exists?) ─► load ─► purge ─► next chunk
//! ```
//!
//! Chunking only bounds peak scratch usage. At most one chunk's transient
//! files exist at any moment: they are removed whether the chunk succeeded,
//! failed, or the run was cancelled mid-chunk. Any failure aborts the whole
//! run; a half-ingested chunk is never retried.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::common::{BenchError, BenchResult};
use crate::config::{CommandTemplate, DatasetConfig, TrialConfig};
use crate::host::{CommandRunner, CommandSpec};

/// One bounded slice of the dataset
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: usize,
    /// Inclusive
    pub range_start: u64,
    /// Exclusive
    pub range_end: u64,
    /// Where `fetch` writes the raw download
    pub download_path: PathBuf,
    /// Where `transform` writes the loadable artifact
    pub artifact_path: PathBuf,
}

impl Chunk {
    fn new(index: usize, range_start: u64, range_end: u64, staging_dir: &Path) -> Self {
        let stem = format!("chunk-{:06}-{}-{}", index, range_start, range_end);
        Self {
            index,
            range_start,
            range_end,
            download_path: staging_dir.join(format!("{}.download", stem)),
            artifact_path: staging_dir.join(format!("{}.artifact", stem)),
        }
    }

    pub fn len(&self) -> u64 {
        self.range_end - self.range_start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove both transient files; missing files are fine
    fn purge(&self) {
        for path in [&self.download_path, &self.artifact_path] {
            if let Err(e) = remove_path(path) {
                warn!(
                    chunk = self.index,
                    path = %path.display(),
                    error = %e,
                    "Failed to purge chunk file"
                );
            }
        }
    }
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Purges a chunk's files when dropped, including on cancellation
struct PurgeGuard<'a>(&'a Chunk);

impl Drop for PurgeGuard<'_> {
    fn drop(&mut self) {
        self.0.purge();
        debug!(chunk = self.0.index, "Chunk purged");
    }
}

/// Split `[0, total_units)` into `chunk_size` slices, the last one short
pub fn plan_chunks(
    total_units: u64,
    chunk_size: u64,
    staging_dir: &Path,
) -> BenchResult<Vec<Chunk>> {
    if chunk_size == 0 {
        return Err(BenchError::config("chunk size must be positive"));
    }
    let mut chunks = Vec::new();
    let mut cursor = 0;
    while cursor < total_units {
        let end = cursor.saturating_add(chunk_size).min(total_units);
        chunks.push(Chunk::new(chunks.len(), cursor, end, staging_dir));
        cursor = end;
    }
    Ok(chunks)
}

/// The three per-chunk steps
#[async_trait]
pub trait ChunkStages: Send + Sync {
    /// Materialise the raw data for the chunk's range
    async fn fetch(&self, chunk: &Chunk) -> BenchResult<()>;

    /// Produce `chunk.artifact_path`
    async fn transform(&self, chunk: &Chunk) -> BenchResult<()>;

    /// Ingest the artifact into the durable store
    async fn load(&self, chunk: &Chunk) -> BenchResult<()>;
}

/// Totals of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineSummary {
    pub chunks: usize,
    pub units: u64,
    pub elapsed: Duration,
}

fn stage_error(chunk: &Chunk, stage: &str, err: BenchError) -> BenchError {
    match err {
        BenchError::Pipeline { .. } => err,
        other => BenchError::pipeline(
            chunk.index,
            format!(
                "{} [{}, {}): {}",
                stage, chunk.range_start, chunk.range_end, other
            ),
        ),
    }
}

/// Run every chunk of `[0, total_units)` through `stages`
///
/// `load` is called exactly `ceil(total_units / chunk_size)` times on
/// success. `total_units == 0` runs nothing.
pub async fn run_chunked(
    total_units: u64,
    chunk_size: u64,
    staging_dir: &Path,
    stages: &dyn ChunkStages,
) -> BenchResult<PipelineSummary> {
    let chunks = plan_chunks(total_units, chunk_size, staging_dir)?;
    let started = Instant::now();
    if chunks.is_empty() {
        info!("Empty dataset range, nothing to load");
        return Ok(PipelineSummary {
            chunks: 0,
            units: 0,
            elapsed: started.elapsed(),
        });
    }
    std::fs::create_dir_all(staging_dir)?;
    info!(
        total_units,
        chunk_size,
        chunks = chunks.len(),
        staging = %staging_dir.display(),
        "Starting chunked pipeline"
    );

    let count = chunks.len();
    for chunk in &chunks {
        process_chunk(chunk, stages).await?;
        info!(
            chunk = chunk.index + 1,
            of = count,
            start = chunk.range_start,
            end = chunk.range_end,
            "Chunk loaded"
        );
    }

    let summary = PipelineSummary {
        chunks: count,
        units: total_units,
        elapsed: started.elapsed(),
    };
    info!(
        chunks = summary.chunks,
        units = summary.units,
        elapsed_secs = summary.elapsed.as_secs(),
        "Pipeline complete"
    );
    Ok(summary)
}

async fn process_chunk(chunk: &Chunk, stages: &dyn ChunkStages) -> BenchResult<()> {
    let _purge = PurgeGuard(chunk);

    stages
        .fetch(chunk)
        .await
        .map_err(|e| stage_error(chunk, "fetch", e))?;
    stages
        .transform(chunk)
        .await
        .map_err(|e| stage_error(chunk, "transform", e))?;

    if !chunk.artifact_path.exists() {
        return Err(BenchError::pipeline(
            chunk.index,
            format!("artifact {} was not produced", chunk.artifact_path.display()),
        ));
    }

    stages
        .load(chunk)
        .await
        .map_err(|e| stage_error(chunk, "load", e))
}

/// Fetch and transform one explicit range, keeping the files
pub async fn fetch_range(
    stages: &dyn ChunkStages,
    start: u64,
    end: u64,
    staging_dir: &Path,
) -> BenchResult<Chunk> {
    let chunk = single_chunk(start, end, staging_dir)?;
    stages
        .fetch(&chunk)
        .await
        .map_err(|e| stage_error(&chunk, "fetch", e))?;
    info!(start, end, path = %chunk.download_path.display(), "Range fetched");
    Ok(chunk)
}

/// Transform a range previously fetched with `fetch_range`, keeping the files
pub async fn transform_range(
    stages: &dyn ChunkStages,
    start: u64,
    end: u64,
    staging_dir: &Path,
) -> BenchResult<Chunk> {
    let chunk = single_chunk(start, end, staging_dir)?;
    if !chunk.download_path.exists() {
        return Err(BenchError::missing(format!(
            "fetched data {} (run fetch for [{}, {}) first)",
            chunk.download_path.display(),
            start,
            end
        )));
    }
    stages
        .transform(&chunk)
        .await
        .map_err(|e| stage_error(&chunk, "transform", e))?;
    if !chunk.artifact_path.exists() {
        return Err(BenchError::pipeline(
            chunk.index,
            format!("artifact {} was not produced", chunk.artifact_path.display()),
        ));
    }
    info!(start, end, path = %chunk.artifact_path.display(), "Range transformed");
    Ok(chunk)
}

fn single_chunk(start: u64, end: u64, staging_dir: &Path) -> BenchResult<Chunk> {
    if start >= end {
        return Err(BenchError::config(format!(
            "empty range [{}, {})",
            start, end
        )));
    }
    std::fs::create_dir_all(staging_dir)?;
    Ok(Chunk::new(0, start, end, staging_dir))
}

/// `ChunkStages` running the configured external commands
///
/// Template arguments may use `{start}`, `{end}`, `{count}`, `{index}`,
/// `{download}`, `{artifact}` plus every trial placeholder (`{store}`,
/// `{tier:NAME}`, ...) once a trial is attached.
pub struct CommandStages {
    runner: Arc<dyn CommandRunner>,
    fetch: Option<CommandTemplate>,
    transform: Option<CommandTemplate>,
    load: Option<CommandTemplate>,
    trial: Option<TrialConfig>,
}

impl CommandStages {
    pub fn new(runner: Arc<dyn CommandRunner>, dataset: &DatasetConfig) -> Self {
        Self {
            runner,
            fetch: dataset.fetch.clone(),
            transform: dataset.transform.clone(),
            load: dataset.load.clone(),
            trial: None,
        }
    }

    /// Expand trial placeholders and pass the trial environment to every stage
    pub fn with_trial(mut self, trial: &TrialConfig) -> Self {
        self.trial = Some(trial.clone());
        self
    }

    /// Concrete command for `stage` on `chunk`
    pub fn command_for(&self, stage: &str, chunk: &Chunk) -> BenchResult<CommandSpec> {
        let template = match stage {
            "fetch" => self.fetch.as_ref(),
            "transform" => self.transform.as_ref(),
            "load" => self.load.as_ref(),
            _ => None,
        }
        .ok_or_else(|| BenchError::config(format!("dataset.{} is not configured", stage)))?;

        let download = chunk.download_path.to_string_lossy();
        let artifact = chunk.artifact_path.to_string_lossy();
        let expand = |raw: &str| {
            let s = raw
                .replace("{start}", &chunk.range_start.to_string())
                .replace("{end}", &chunk.range_end.to_string())
                .replace("{count}", &chunk.len().to_string())
                .replace("{index}", &chunk.index.to_string())
                .replace("{download}", &download)
                .replace("{artifact}", &artifact);
            match self.trial {
                Some(ref trial) => trial.expand(&s),
                None => s,
            }
        };

        let mut cmd = CommandSpec::new(expand(&template.program))
            .args(template.args.iter().map(|a| expand(a)));
        if let Some(ref trial) = self.trial {
            for (key, value) in trial.process_env() {
                cmd = cmd.env(key, value);
            }
        }
        Ok(cmd)
    }

    async fn run_stage(&self, stage: &str, chunk: &Chunk) -> BenchResult<()> {
        let cmd = self.command_for(stage, chunk)?;
        debug!(stage, chunk = chunk.index, command = %cmd.command_line(), "Running stage");
        self.runner.run_checked(&cmd).await.map(|_| ())
    }
}

#[async_trait]
impl ChunkStages for CommandStages {
    async fn fetch(&self, chunk: &Chunk) -> BenchResult<()> {
        self.run_stage("fetch", chunk).await
    }

    async fn transform(&self, chunk: &Chunk) -> BenchResult<()> {
        self.run_stage("transform", chunk).await
    }

    async fn load(&self, chunk: &Chunk) -> BenchResult<()> {
        self.run_stage("load", chunk).await
    }
}
