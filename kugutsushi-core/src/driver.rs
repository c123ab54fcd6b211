//! C6 — Indexing Driver.
//!
//! Drives a directory of PDFs through C2 → C1 → chunk → C3.assign_ids →
//! embed-in-batches → C4.add → C5.add → C3.finish_file, in a way that
//! survives a crash at any point: before the adds that complete a file,
//! the file record is written with `status = pending` and its id range
//! reserved; only once all three stores have durably received every
//! chunk does it flip to `indexed`. A crash in between leaves exactly
//! that pending marker behind, and [`IndexingDriver::recover`] deletes
//! the reserved range from all three stores so the file is reprocessed
//! from scratch rather than left half-indexed.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::config::Config;
use crate::embedder::Embedder;
use crate::error::{CoreError, EmbedderError, Result};
use crate::extractor;
use crate::overflow::OverflowBuffer;
use crate::stores::{SharedStores, StoreLayout};
use crate::types::{Chunk, FileStatus, Passage, PassageId, PassageIdRange};

/// Outcome of indexing one file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileOutcome {
    pub source_path: String,
    pub status: FileStatus,
    pub passages_indexed: u64,
    pub error: Option<String>,
}

/// Outcome of an [`IndexingDriver::ingest_directory`] call.
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    pub files: Vec<FileOutcome>,
}

impl IngestReport {
    pub fn total_passages(&self) -> u64 {
        self.files.iter().map(|f| f.passages_indexed).sum()
    }

    pub fn failed(&self) -> Vec<&FileOutcome> {
        self.files.iter().filter(|f| f.status == FileStatus::Failed).collect()
    }
}

struct PendingChunk {
    id: PassageId,
    source_path: String,
    page_number: u32,
    chunk_index: u32,
    text: String,
}

pub struct IndexingDriver {
    stores: SharedStores,
    config: Config,
    overflow: OverflowBuffer,
    embedder: Arc<dyn Embedder>,
    buffer: Vec<PendingChunk>,
}

impl IndexingDriver {
    pub fn new(stores: SharedStores, layout: &StoreLayout, config: Config, embedder: Arc<dyn Embedder>) -> Self {
        let overflow = OverflowBuffer::new(layout.overflow_path());
        Self { stores, config, overflow, embedder, buffer: Vec::new() }
    }

    /// Startup recovery: rolls back any file left
    /// `pending` by a prior crash, deleting its reserved id range from
    /// all three stores, so the next ingest reprocesses it from scratch.
    pub fn recover(&mut self) -> Result<()> {
        let pending = {
            let guard = self.stores.read().expect("stores lock poisoned");
            guard.catalogue.pending_files()?
        };
        for file in pending {
            tracing::warn!(
                path = %file.source_path,
                "rolling back partially-indexed file left pending by a prior crash"
            );
            self.rollback_range(&file.source_path, file.passage_id_range)?;
        }
        Ok(())
    }

    fn rollback_range(&mut self, source_path: &str, range: PassageIdRange) -> Result<()> {
        let mut guard = self.stores.write().expect("stores lock poisoned");
        guard.catalogue.delete_passages_in_range(range)?;
        guard.lexical_index.delete_in_range(range)?;
        if guard.vector_index.is_trained() {
            guard.vector_index.remove_range(range)?;
        }
        guard.catalogue.finish_file(source_path, range, false)?;
        Ok(())
    }

    /// Walks `root` recursively for `.pdf` files and indexes each in
    /// turn. Files are visited in sorted path order so a re-run over an
    /// unchanged directory produces an identical report. Runs corpus
    /// finalisation once the whole directory is indexed.
    pub fn ingest_directory(&mut self, root: &Path) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        for path in walk_pdfs(root)? {
            report.files.push(self.ingest_file(&path)?);
        }
        self.finalize()?;
        Ok(report)
    }

    /// Corpus finalisation: prunes lexical-index terms below `min_df`.
    /// Safe to call repeatedly (idempotent) and meant to run once an
    /// indexing run is considered complete — a caller driving
    /// [`IndexingDriver::ingest_file`] directly rather than through
    /// [`IndexingDriver::ingest_directory`] should call this itself when
    /// done, before handing the stores to a [`crate::searcher::HybridSearcher`].
    pub fn finalize(&mut self) -> Result<()> {
        let mut guard = self.stores.write().expect("stores lock poisoned");
        guard.lexical_index.finalize()
    }

    /// Indexes a single file, applying the skip-or-reindex algorithm
    /// against its content hash. A whole-file extraction failure is
    /// recovered here: the file is marked `failed` and `Ok` is returned
    /// so a directory walk continues past it.
    pub fn ingest_file(&mut self, path: &Path) -> Result<FileOutcome> {
        let source_path = path.to_string_lossy().into_owned();
        let bytes = std::fs::read(path)?;
        let hash = content_hash(&bytes);

        let existing = {
            let guard = self.stores.read().expect("stores lock poisoned");
            guard.catalogue.file_state(&source_path)?
        };
        if let Some(record) = &existing {
            if record.content_hash == hash && record.status == FileStatus::Indexed {
                tracing::debug!(path = %source_path, "content hash unchanged, skipping");
                return Ok(FileOutcome {
                    source_path,
                    status: FileStatus::Indexed,
                    passages_indexed: record.passage_id_range.len(),
                    error: None,
                });
            }
        }
        let superseded_range = existing
            .filter(|r| r.status == FileStatus::Indexed)
            .map(|r| r.passage_id_range);

        match extractor::extract_kept_pages_from_bytes(bytes) {
            Ok(pages) => self.index_pages(&source_path, &hash, pages, superseded_range),
            Err(err) => {
                tracing::warn!(path = %source_path, error = %err, "extraction failed, marking file failed");
                self.mark_failed(&source_path, &hash)?;
                Ok(FileOutcome {
                    source_path,
                    status: FileStatus::Failed,
                    passages_indexed: 0,
                    error: Some(err.to_string()),
                })
            }
        }
    }

    fn mark_failed(&mut self, source_path: &str, hash: &str) -> Result<()> {
        let guard = self.stores.write().expect("stores lock poisoned");
        let range = guard.catalogue.assign_ids(0)?;
        guard.catalogue.begin_file(source_path, hash, range)?;
        guard.catalogue.finish_file(source_path, range, false)?;
        Ok(())
    }

    fn index_pages(
        &mut self,
        source_path: &str,
        hash: &str,
        pages: Vec<(u32, String)>,
        superseded_range: Option<PassageIdRange>,
    ) -> Result<FileOutcome> {
        let chunks = extractor::chunk_pages(&pages, &self.config.extraction);
        let deduped = dedup_within_file(chunks);
        let total = deduped.len() as u64;

        let range = {
            let guard = self.stores.write().expect("stores lock poisoned");
            let range = guard.catalogue.assign_ids(total)?;
            guard.catalogue.begin_file(source_path, hash, range)?;
            range
        };

        for (offset, chunk) in deduped.into_iter().enumerate() {
            self.buffer.push(PendingChunk {
                id: PassageId(range.first + offset as u64),
                source_path: source_path.to_string(),
                page_number: chunk.page_number,
                chunk_index: chunk.chunk_index,
                text: chunk.text,
            });
            if self.buffer.len() >= self.config.driver.batch_size {
                if let Err(err) = self.flush() {
                    return self.fail_file(source_path, range, err);
                }
            }
        }
        if let Err(err) = self.flush() {
            return self.fail_file(source_path, range, err);
        }

        {
            let guard = self.stores.write().expect("stores lock poisoned");
            guard.catalogue.finish_file(source_path, range, true)?;
            guard.bump_generation();
        }

        // Only a whole-file reindex is supported, so once the new range is
        // durably in place the superseded range is removed immediately
        // rather than swept by a separate compaction pass.
        if let Some(old_range) = superseded_range {
            self.rollback_range(source_path, old_range)?;
            // rollback_range also flips status to failed via finish_file;
            // restore it since the new range did complete successfully.
            let guard = self.stores.write().expect("stores lock poisoned");
            guard.catalogue.finish_file(source_path, range, true)?;
        }

        Ok(FileOutcome {
            source_path: source_path.to_string(),
            status: FileStatus::Indexed,
            passages_indexed: total,
            error: None,
        })
    }

    fn fail_file(&mut self, source_path: &str, range: PassageIdRange, err: CoreError) -> Result<FileOutcome> {
        tracing::error!(path = %source_path, error = %err, "batch failed, rolling back file's partial id allocation");
        self.buffer.retain(|c| c.source_path != source_path);
        self.rollback_range(source_path, range)?;
        Ok(FileOutcome {
            source_path: source_path.to_string(),
            status: FileStatus::Failed,
            passages_indexed: 0,
            error: Some(err.to_string()),
        })
    }

    /// Flushes the pending buffer: embed → add to C4 (or overflow-buffer
    /// it, if untrained) → add to C5 → commit passage rows to C3, all in
    /// one pass. An embedding failure aborts the whole flush and
    /// surfaces to the caller, which rolls the enclosing file back.
    fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.buffer);
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed_with_retry(&texts)?;
        if vectors.len() != texts.len() {
            return Err(CoreError::Embedder(EmbedderError::CountMismatch {
                expected: texts.len(),
                got: vectors.len(),
            }));
        }

        let ids: Vec<PassageId> = batch.iter().map(|c| c.id).collect();
        let passages: Vec<Passage> = batch
            .iter()
            .map(|c| Passage {
                id: c.id,
                source_path: c.source_path.clone(),
                page_number: c.page_number,
                chunk_index: c.chunk_index,
                text: c.text.clone(),
            })
            .collect();

        {
            let mut guard = self.stores.write().expect("stores lock poisoned");
            if guard.vector_index.is_trained() {
                guard.vector_index.add(&ids, &vectors)?;
            } else {
                for ((id, vector), c) in ids.iter().zip(vectors.iter()).zip(batch.iter()) {
                    self.overflow.push(*id, vector, &c.text)?;
                    guard.vector_index.buffer_for_training(vector.clone())?;
                }
            }
            for (id, c) in ids.iter().zip(batch.iter()) {
                guard.lexical_index.add(*id, &c.text);
            }
            guard.lexical_index.flush()?;
            guard.catalogue.commit_passages(&passages)?;
        }

        self.maybe_train_and_drain()?;
        Ok(())
    }

    /// If the vector index is untrained and has buffered at least
    /// `training_threshold` vectors, forces training, then drains every
    /// embedding buffered since ingestion began (including those used
    /// as the training sample, which training alone does not make
    /// searchable) and adds them to the now-trained index.
    fn maybe_train_and_drain(&mut self) -> Result<()> {
        {
            let mut guard = self.stores.write().expect("stores lock poisoned");
            if guard.vector_index.is_trained() {
                return Ok(());
            }
            if guard.vector_index.buffered_training_count() < guard.vector_index.training_threshold() {
                return Ok(());
            }
            guard.vector_index.train(false)?;
        }

        let drained = self.overflow.drain_all()?;
        if drained.is_empty() {
            return Ok(());
        }
        let ids: Vec<PassageId> = drained.iter().map(|(id, _, _)| *id).collect();
        let vectors: Vec<Vec<f32>> = drained.iter().map(|(_, v, _)| v.clone()).collect();
        {
            let mut guard = self.stores.write().expect("stores lock poisoned");
            guard.vector_index.add(&ids, &vectors)?;
        }
        self.overflow.clear()?;
        Ok(())
    }

    fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let attempts = 1 + self.config.driver.embed_retry_count;
        let mut last_err = None;
        for attempt in 0..attempts {
            match self.embedder.embed(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "embedding batch failed");
                    last_err = Some(err);
                    if attempt + 1 < attempts {
                        std::thread::sleep(Duration::from_millis(self.config.driver.embed_retry_backoff_ms));
                    }
                }
            }
        }
        Err(CoreError::Embedder(last_err.expect("loop runs at least once since attempts >= 1")))
    }
}

/// Drops any chunk whose text exactly matches one already seen earlier
/// in the same file — cheap page-header/footer suppression.
fn dedup_within_file(chunks: Vec<Chunk>) -> Vec<Chunk> {
    let mut seen = HashSet::new();
    chunks.into_iter().filter(|c| seen.insert(c.text.clone())).collect()
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn walk_pdfs(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case("pdf"))
                .unwrap_or(false)
            {
                out.push(path);
            }
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedder::test_double::HashEmbedder;
    use crate::stores::Stores;
    use std::sync::RwLock;

    /// Builds a hand-rolled single-page PDF with one `Tj`-drawn text run
    /// under an `Identity-H`/`ToUnicode` font, a real classic xref table,
    /// and a `startxref` trailer — enough for the from-scratch reader in
    /// [`crate::pdf`] to recover the page text byte-for-byte, the same way
    /// a CID-keyed Japanese font producer would encode it.
    fn write_minimal_pdf(path: &Path, text: &str) {
        std::fs::write(path, build_test_pdf(&[text])).unwrap();
    }

    /// Assigns each distinct character in `pages` a 2-byte CID, renders
    /// every page's text as a hex `Tj` string under those CIDs, and emits
    /// a matching `/ToUnicode` CMap so the codes decode back to the
    /// original characters — mirroring how real CID-keyed Japanese font
    /// producers encode text, and exercising the CMap decode path rather
    /// than the byte-for-byte fallback.
    fn build_test_pdf(pages: &[&str]) -> Vec<u8> {
        let n = pages.len();
        let tounicode_obj = 3 + 2 * n;
        let font_obj = 4 + 2 * n;
        let object_count = font_obj;

        let mut char_codes: std::collections::HashMap<char, u16> = std::collections::HashMap::new();
        let mut next_code: u16 = 1;
        let mut page_hex = Vec::with_capacity(n);
        for page_text in pages {
            let mut hex = String::new();
            for ch in page_text.chars() {
                let code = *char_codes.entry(ch).or_insert_with(|| {
                    let code = next_code;
                    next_code += 1;
                    code
                });
                hex.push_str(&format!("{code:04X}"));
            }
            page_hex.push(hex);
        }

        let mut bfchar_entries = String::new();
        for (&ch, &code) in &char_codes {
            let mut units = [0u16; 2];
            let encoded = ch.encode_utf16(&mut units);
            let dst_hex: String = encoded.iter().map(|u| format!("{u:04X}")).collect();
            bfchar_entries.push_str(&format!("<{code:04X}> <{dst_hex}>\n"));
        }
        let cmap_body = format!(
            "/CIDInit /ProcSet findresource begin\n\
             1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n\
             {} beginbfchar\n{bfchar_entries}endbfchar\n\
             end",
            char_codes.len(),
        );

        let mut buf: Vec<u8> = Vec::new();
        let mut offsets = vec![0u64; object_count + 1];
        buf.extend_from_slice(b"%PDF-1.4\n");

        offsets[1] = buf.len() as u64;
        buf.extend_from_slice(b"1 0 obj<</Type/Catalog/Pages 2 0 R>>endobj\n");

        let kids: Vec<String> = (0..n).map(|i| format!("{} 0 R", 3 + i)).collect();
        offsets[2] = buf.len() as u64;
        buf.extend_from_slice(
            format!("2 0 obj<</Type/Pages/Kids[{}]/Count {n}>>endobj\n", kids.join(" ")).as_bytes(),
        );

        for i in 0..n {
            let obj_num = 3 + i;
            let content_obj = 3 + n + i;
            offsets[obj_num] = buf.len() as u64;
            buf.extend_from_slice(
                format!(
                    "{obj_num} 0 obj<</Type/Page/Parent 2 0 R/Resources<</Font<</F1 {font_obj} 0 R>>>>/MediaBox[0 0 612 792]/Contents {content_obj} 0 R>>endobj\n"
                )
                .as_bytes(),
            );
        }

        for (i, hex) in page_hex.iter().enumerate() {
            let obj_num = 3 + n + i;
            let content = format!("BT /F1 12 Tf 72 720 Td <{hex}> Tj ET");
            offsets[obj_num] = buf.len() as u64;
            buf.extend_from_slice(
                format!("{obj_num} 0 obj<</Length {}>>stream\n{content}\nendstream endobj\n", content.len())
                    .as_bytes(),
            );
        }

        offsets[tounicode_obj] = buf.len() as u64;
        buf.extend_from_slice(
            format!(
                "{tounicode_obj} 0 obj<</Length {}>>stream\n{cmap_body}\nendstream endobj\n",
                cmap_body.len()
            )
            .as_bytes(),
        );

        offsets[font_obj] = buf.len() as u64;
        buf.extend_from_slice(
            format!(
                "{font_obj} 0 obj<</Type/Font/Subtype/Type0/BaseFont/Identity-H/ToUnicode {tounicode_obj} 0 R>>endobj\n"
            )
            .as_bytes(),
        );

        let xref_offset = buf.len() as u64;
        buf.extend_from_slice(format!("xref\n0 {}\n", object_count + 1).as_bytes());
        buf.extend_from_slice(b"0000000000 65535 f \n");
        for offset in offsets.iter().skip(1) {
            buf.extend_from_slice(format!("{offset:010} 00000 n \n").as_bytes());
        }
        buf.extend_from_slice(format!("trailer<</Size {}/Root 1 0 R>>\n", object_count + 1).as_bytes());
        buf.extend_from_slice(format!("startxref\n{xref_offset}\n%%EOF").as_bytes());

        buf
    }

    fn driver(dir: &Path) -> (IndexingDriver, SharedStores) {
        let cfg = Config {
            vector_index: crate::config::VectorIndexConfig {
                dim: 8,
                nlist: 2,
                pq_m: 2,
                pq_nbits: 4,
                nprobe: 2,
                training_threshold: 4,
                expected_corpus: 4,
            },
            ..Config::default()
        };
        let stores: SharedStores = Arc::new(RwLock::new(Stores::open_in_memory(&cfg).unwrap()));
        let layout = StoreLayout::new(dir);
        let embedder = Arc::new(HashEmbedder { dim: 8 });
        (IndexingDriver::new(stores.clone(), &layout, cfg, embedder), stores)
    }

    #[test]
    fn ingesting_a_directory_indexes_every_pdf() {
        let dir = tempfile::tempdir().unwrap();
        write_minimal_pdf(&dir.path().join("a.pdf"), "日本語のテキストです。これは十分に長い本文です。");
        write_minimal_pdf(&dir.path().join("b.pdf"), "別のファイルの本文、これも十分な長さがあります。");

        let (mut drv, stores) = driver(dir.path());
        let report = drv.ingest_directory(dir.path()).unwrap();

        assert_eq!(report.files.len(), 2);
        assert!(report.files.iter().all(|f| f.status == FileStatus::Indexed));
        let counts = stores.read().unwrap().catalogue.counts().unwrap();
        assert_eq!(counts.files, 2);
    }

    #[test]
    fn reindexing_unchanged_file_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pdf");
        write_minimal_pdf(&path, "日本語のテキストです。これは十分に長い本文です。");

        let (mut drv, stores) = driver(dir.path());
        drv.ingest_file(&path).unwrap();
        let before = stores.read().unwrap().catalogue.counts().unwrap();

        let outcome = drv.ingest_file(&path).unwrap();
        let after = stores.read().unwrap().catalogue.counts().unwrap();

        assert_eq!(outcome.status, FileStatus::Indexed);
        assert_eq!(before, after);
    }

    #[test]
    fn unreadable_extraction_marks_file_failed_without_aborting() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.pdf");
        std::fs::write(&path, b"not a pdf at all").unwrap();

        let (mut drv, _stores) = driver(dir.path());
        let outcome = drv.ingest_file(&path).unwrap();
        assert_eq!(outcome.status, FileStatus::Failed);
        assert!(outcome.error.is_some());
    }

    #[test]
    fn recover_rolls_back_a_pending_file_left_by_a_crash() {
        let dir = tempfile::tempdir().unwrap();
        let (mut drv, stores) = driver(dir.path());
        let range = {
            let guard = stores.write().unwrap();
            let range = guard.catalogue.assign_ids(2).unwrap();
            guard.catalogue.begin_file("crashed.pdf", "deadbeef", range).unwrap();
            range
        };

        drv.recover().unwrap();

        let state = stores.read().unwrap().catalogue.file_state("crashed.pdf").unwrap().unwrap();
        assert_eq!(state.status, FileStatus::Failed);
        assert_eq!(stores.read().unwrap().catalogue.count_passages_in(range).unwrap(), 0);
    }

    #[test]
    fn duplicate_chunk_text_within_a_file_is_dropped() {
        let header = "第一章".repeat(20);
        let chunks = vec![
            Chunk { page_number: 1, chunk_index: 0, text: header.clone() },
            Chunk { page_number: 2, chunk_index: 0, text: header },
            Chunk { page_number: 2, chunk_index: 1, text: "固有の本文です".to_string() },
        ];
        let deduped = dedup_within_file(chunks);
        assert_eq!(deduped.len(), 2);
    }
}
