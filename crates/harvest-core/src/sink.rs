//! Append-only NDJSON output, one file per partition.
//!
//! A partition in progress writes to `<stem>.ndjson.part`. Finishing it
//! renames the file to `<stem>.ndjson`, so a non-empty final file is
//! evidence of completion on its own, independent of any checkpoint.

use std::collections::HashSet;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, BufWriter,
};

use crate::error::HarvestError;
use crate::models::{Partition, Record};

const COMPLETE_EXT: &str = "ndjson";
const PARTIAL_EXT: &str = "ndjson.part";
const TAIL_CHUNK: u64 = 8 * 1024;

#[derive(Debug, Clone)]
pub struct RecordSink {
    dir: PathBuf,
}

impl RecordSink {
    /// Creates the output directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, HarvestError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn complete_path(&self, partition: &Partition) -> PathBuf {
        self.dir
            .join(format!("{}.{COMPLETE_EXT}", partition.file_stem()))
    }

    pub fn partial_path(&self, partition: &Partition) -> PathBuf {
        self.dir.join(format!("{}.{PARTIAL_EXT}", partition.file_stem()))
    }

    /// True if the partition's final file exists and is non-empty.
    pub async fn completed_on_disk(&self, partition: &Partition) -> bool {
        match fs::metadata(self.complete_path(partition)).await {
            Ok(meta) => meta.is_file() && meta.len() > 0,
            Err(_) => false,
        }
    }

    /// Open the partition's in-progress file for appending.
    ///
    /// The returned writer is owned by exactly one walker; it is not `Clone`.
    /// A torn trailing line from an earlier crash is cut off first so the
    /// next append starts on a fresh line.
    pub async fn writer(&self, partition: &Partition) -> Result<PartitionWriter, HarvestError> {
        let path = self.partial_path(partition);
        truncate_torn_tail(&path).await?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(PartitionWriter {
            partial: path,
            complete: self.complete_path(partition),
            writer: BufWriter::new(file),
            written: 0,
        })
    }

    /// Collect the natural ids of every record already written, in final and
    /// in-progress files alike. A torn trailing line left by a crash is
    /// skipped.
    pub async fn scan_ids(&self) -> Result<HashSet<String>, HarvestError> {
        let mut ids = HashSet::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if !(name.ends_with(&format!(".{COMPLETE_EXT}"))
                || name.ends_with(&format!(".{PARTIAL_EXT}")))
            {
                continue;
            }
            // Another instance may promote a `.part` file while we scan.
            let file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            // Raw bytes: a crash can cut a line inside a multi-byte character.
            let mut reader = BufReader::new(file);
            let mut line = Vec::new();
            loop {
                line.clear();
                if reader.read_until(b'\n', &mut line).await? == 0 {
                    break;
                }
                let trimmed = line.trim_ascii();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<IdOnly>(trimmed) {
                    Ok(record) => {
                        ids.insert(record.id);
                    }
                    Err(e) => {
                        tracing::warn!(
                            file = %path.display(),
                            error = %e,
                            "Skipping unparseable output line"
                        );
                    }
                }
            }
        }
        Ok(ids)
    }
}

/// Cut everything after the last newline of `path`, scanning backwards from
/// the end so only the torn tail is read.
async fn truncate_torn_tail(path: &Path) -> Result<(), HarvestError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }

    let mut buf = vec![0u8; TAIL_CHUNK as usize];
    let mut end = len;
    let keep = loop {
        let start = end.saturating_sub(TAIL_CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;
        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(());
        }
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            break start + pos as u64 + 1;
        }
        if start == 0 {
            break 0;
        }
        end = start;
    };

    tracing::warn!(
        file = %path.display(),
        dropped_bytes = len - keep,
        "Truncating torn trailing line"
    );
    file.set_len(keep).await?;
    file.sync_all().await?;
    Ok(())
}

#[derive(serde::Deserialize)]
struct IdOnly {
    id: String,
}

/// Single-threaded appender for one partition.
#[derive(Debug)]
pub struct PartitionWriter {
    partial: PathBuf,
    complete: PathBuf,
    writer: BufWriter<File>,
    written: u64,
}

impl PartitionWriter {
    /// Append one record as one self-contained JSON line.
    pub async fn append(&mut self, record: &Record) -> Result<(), HarvestError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.written += 1;
        Ok(())
    }

    /// Push buffered lines to disk. Called once per page, before the
    /// checkpoint records the page's offset.
    pub async fn flush(&mut self) -> Result<(), HarvestError> {
        self.writer.flush().await?;
        self.writer.get_ref().sync_data().await?;
        Ok(())
    }

    /// Flush and promote the in-progress file to its final name.
    pub async fn finish(mut self) -> Result<PathBuf, HarvestError> {
        self.flush().await?;
        let PartitionWriter {
            partial,
            complete,
            writer,
            written,
        } = self;
        drop(writer);
        fs::rename(&partial, &complete).await?;
        tracing::debug!(
            file = %complete.display(),
            appended = written,
            "Promoted partition file"
        );
        Ok(complete)
    }
}
