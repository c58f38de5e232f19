use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use futures::StreamExt;
use tracing::{debug, error, info};

use crate::config::{ArchiveCompression, ArchiveConfig, ArchiveMode};
use crate::database::{ArchiveRow, Storage};
use crate::error::{PoolError, Result};
use crate::metrics::{ARCHIVED_ROWS, CLEANUP_RETRIES};

/// Rows handed to the blocking pool per write.
const WRITE_CHUNK_ROWS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveOutcome {
    Disabled,
    NothingToArchive,
    Archived {
        cutoff: i64,
        rows: u64,
        /// Export file, in file mode.
        file: Option<PathBuf>,
    },
}

enum ArchiveWriter {
    Plain(BufWriter<File>),
    Gzip(flate2::write::GzEncoder<BufWriter<File>>),
    Bzip2(bzip2::write::BzEncoder<BufWriter<File>>),
}

/// CSV export target, opened in append mode.
///
/// Appending to a compressed file adds another stream to it; gzip and
/// bzip2 readers that handle multi-stream input read it back whole.
pub struct ArchiveFile {
    path: PathBuf,
    writer: ArchiveWriter,
    rows: u64,
}

impl ArchiveFile {
    /// `<file>[-%Y-%m-%d-%H-%M-%S].csv[.gz|.bz2]`, timestamp from the cutoff in UTC.
    pub fn path_for(config: &ArchiveConfig, cutoff: i64) -> PathBuf {
        let mut name = config.file.as_os_str().to_os_string();
        if config.file_append_time {
            let suffix = match DateTime::from_timestamp(cutoff, 0) {
                Some(at) => at.format("%Y-%m-%d-%H-%M-%S").to_string(),
                None => cutoff.to_string(),
            };
            name.push(format!("-{}", suffix));
        }
        name.push(".csv");
        if let Some(ext) = config.compression.extension() {
            name.push(format!(".{}", ext));
        }
        PathBuf::from(name)
    }

    pub fn open(config: &ArchiveConfig, cutoff: i64) -> Result<Self> {
        let path = Self::path_for(config, cutoff);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let file = BufWriter::new(file);
        let writer = match config.compression {
            ArchiveCompression::None => ArchiveWriter::Plain(file),
            ArchiveCompression::Gzip => ArchiveWriter::Gzip(flate2::write::GzEncoder::new(
                file,
                flate2::Compression::default(),
            )),
            ArchiveCompression::Bzip2 => ArchiveWriter::Bzip2(bzip2::write::BzEncoder::new(
                file,
                bzip2::Compression::default(),
            )),
        };

        Ok(Self {
            path,
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        match &mut self.writer {
            ArchiveWriter::Plain(w) => w.write_all(line),
            ArchiveWriter::Gzip(w) => w.write_all(line),
            ArchiveWriter::Bzip2(w) => w.write_all(line),
        }
    }

    pub fn write_rows(&mut self, rows: &[ArchiveRow]) -> Result<()> {
        for row in rows {
            self.write_line(format_row(row).as_bytes())?;
        }
        self.rows += rows.len() as u64;
        Ok(())
    }

    /// Finish the compressed stream and flush everything to disk.
    pub fn finish(self) -> Result<(PathBuf, u64)> {
        let mut file = match self.writer {
            ArchiveWriter::Plain(w) => w,
            ArchiveWriter::Gzip(w) => w.finish()?,
            ArchiveWriter::Bzip2(w) => w.finish()?,
        };
        file.flush()?;
        file.get_ref().sync_all()?;
        Ok((self.path, self.rows))
    }
}

/// `"f1","f2",...` plus a newline.
pub fn format_row(row: &[String]) -> String {
    format!("\"{}\"\n", row.join("\",\""))
}

/// Moves share rows older than the store's cutoff out of the hot set.
pub struct ArchivalManager {
    storage: Arc<dyn Storage>,
    config: ArchiveConfig,
}

impl ArchivalManager {
    pub fn new(storage: Arc<dyn Storage>, config: ArchiveConfig) -> Self {
        Self { storage, config }
    }

    pub async fn run_cycle(&self) -> Result<ArchiveOutcome> {
        if !self.config.enabled {
            return Ok(ArchiveOutcome::Disabled);
        }

        let Some(cutoff) = self.storage.find_archive_cutoff().await? else {
            debug!("No shares old enough to archive");
            return Ok(ArchiveOutcome::NothingToArchive);
        };

        info!("Archiving shares older than timestamp {}", cutoff);
        self.storage.mark_archive_cutoff(cutoff).await?;

        let (rows, file) = match self.config.mode {
            ArchiveMode::Store => {
                let rows = self.storage.export_rows_to_secondary_store(cutoff).await?;
                (rows, None)
            }
            ArchiveMode::File => {
                let (path, rows) = self.export_to_file(cutoff).await?;
                info!("Wrote {} archived shares to {}", rows, path.display());
                (rows, Some(path))
            }
        };

        let deleted = self.cleanup(cutoff).await;
        ARCHIVED_ROWS.inc_by(rows);
        info!("Archived {} shares, removed {} from the hot store", rows, deleted);

        Ok(ArchiveOutcome::Archived { cutoff, rows, file })
    }

    async fn export_to_file(&self, cutoff: i64) -> Result<(PathBuf, u64)> {
        let config = self.config.clone();
        let mut file = tokio::task::spawn_blocking(move || ArchiveFile::open(&config, cutoff)).await??;

        let mut rows = self.storage.stream_rows_older_than(cutoff).await?;
        let mut chunk = Vec::with_capacity(WRITE_CHUNK_ROWS);
        while let Some(row) = rows.next().await {
            chunk.push(row?);
            if chunk.len() >= WRITE_CHUNK_ROWS {
                file = write_chunk(file, std::mem::take(&mut chunk)).await?;
            }
        }
        if !chunk.is_empty() {
            file = write_chunk(file, chunk).await?;
        }

        tokio::task::spawn_blocking(move || file.finish()).await?
    }

    /// Delete archived rows, retrying until the store accepts it.
    async fn cleanup(&self, cutoff: i64) -> u64 {
        loop {
            match self.storage.delete_rows_older_than(cutoff).await {
                Ok(deleted) => return deleted,
                Err(e) => {
                    CLEANUP_RETRIES.inc();
                    error!(
                        "Archive cleanup failed, retrying in {:?}: {}",
                        self.config.cleanup_retry_delay, e
                    );
                    tokio::time::sleep(self.config.cleanup_retry_delay).await;
                }
            }
        }
    }
}

async fn write_chunk(mut file: ArchiveFile, chunk: Vec<ArchiveRow>) -> Result<ArchiveFile> {
    tokio::task::spawn_blocking(move || {
        file.write_rows(&chunk)?;
        Ok::<_, PoolError>(file)
    })
    .await?
}
