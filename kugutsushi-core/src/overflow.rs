//! On-disk overflow buffer for embeddings computed before the Vector
//! Index is trained. A batch embedded while untrained can't be added
//! yet — `VectorIndex::add` requires trained state — so the Driver
//! appends it here and drains it once training completes, re-adding
//! every buffered vector in original order.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::PassageId;

#[derive(Serialize, Deserialize)]
struct OverflowEntry {
    id: u64,
    vector: Vec<f32>,
    text: String,
}

pub struct OverflowBuffer {
    path: PathBuf,
}

impl OverflowBuffer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn push(&self, id: PassageId, vector: &[f32], text: &str) -> Result<()> {
        let entry = OverflowEntry { id: id.0, vector: vector.to_vec(), text: text.to_string() };
        let line = serde_json::to_string(&entry)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Reads every buffered entry, in the order they were pushed, without
    /// clearing the file — callers clear via [`OverflowBuffer::clear`]
    /// only after the drained batch has been durably added to both
    /// indices, so a crash mid-drain can safely retry.
    pub fn drain_all(&self) -> Result<Vec<(PassageId, Vec<f32>, String)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: OverflowEntry = serde_json::from_str(&line)?;
            out.push((PassageId(entry.id), entry.vector, entry.text));
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
