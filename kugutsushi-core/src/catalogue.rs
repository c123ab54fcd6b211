//! C3 — Catalogue.
//!
//! The authoritative id-assigning store: a persistent, embedded,
//! single-writer mapping of passage id ↔ (file, page, chunk, text), plus
//! per-file lifecycle state. Backed by `rusqlite` (bundled SQLite) behind
//! an `r2d2` connection pool opened in WAL mode, matching the embedded-
//! store idiom used throughout the retrieval pack for exactly this shape
//! of single-writer/multi-reader store.

use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};

use crate::error::{CoreError, Result};
use crate::types::{Counts, FileRecord, FileStatus, Passage, PassageId, PassageIdRange};

pub struct Catalogue {
    pool: Pool<SqliteConnectionManager>,
}

impl Catalogue {
    /// Opens (creating if absent) the Catalogue at `path`, e.g.
    /// `embeddings/metadata.db` per the persisted-state layout.
    pub fn open(path: &Path) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;
                 PRAGMA foreign_keys = ON;",
            )
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(CoreError::from)?;
        let catalogue = Self { pool };
        catalogue.init_schema()?;
        Ok(catalogue)
    }

    /// An in-memory catalogue, for tests and ephemeral/"no persistence
    /// needed" callers.
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(CoreError::from)?;
        let catalogue = Self { pool };
        catalogue.init_schema()?;
        Ok(catalogue)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS passage (
                id INTEGER PRIMARY KEY,
                source_path TEXT NOT NULL,
                page_number INTEGER NOT NULL,
                chunk_index INTEGER NOT NULL,
                text TEXT NOT NULL,
                UNIQUE(source_path, page_number, chunk_index)
            );
            CREATE TABLE IF NOT EXISTS file_record (
                source_path TEXT PRIMARY KEY,
                content_hash TEXT NOT NULL,
                indexed_at TEXT NOT NULL,
                first_id INTEGER NOT NULL,
                last_id INTEGER NOT NULL,
                status TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS catalogue_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            INSERT OR IGNORE INTO catalogue_meta(key, value) VALUES ('next_id', '0');
            INSERT OR IGNORE INTO catalogue_meta(key, value) VALUES ('schema_version', '1');",
        )?;
        Ok(())
    }

    /// Reserves `n` consecutive ids atomically, returning `[first, last]`.
    /// Reservation alone does not make the ids visible to search; they
    /// become real passages only once [`Catalogue::commit_passages`] is
    /// called for them within a successful file commit.
    pub fn assign_ids(&self, n: u64) -> Result<PassageIdRange> {
        if n == 0 {
            let next = self.peek_next_id()?;
            return Ok(PassageIdRange::empty_at(next));
        }
        let mut conn = self.pool.get().map_err(CoreError::from)?;
        let tx = conn.transaction()?;
        let current: i64 = tx.query_row(
            "SELECT value FROM catalogue_meta WHERE key = 'next_id'",
            [],
            |row| row.get::<_, String>(0),
        )?.parse().map_err(|_| CoreError::CatalogueConflict("corrupt next_id counter".into()))?;
        let first = current as u64;
        let last = first + n - 1;
        tx.execute(
            "UPDATE catalogue_meta SET value = ?1 WHERE key = 'next_id'",
            params![(last + 1).to_string()],
        )?;
        tx.commit()?;
        Ok(PassageIdRange { first, last })
    }

    fn peek_next_id(&self) -> Result<u64> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        let value: String = conn.query_row(
            "SELECT value FROM catalogue_meta WHERE key = 'next_id'",
            [],
            |row| row.get(0),
        )?;
        value.parse().map_err(|_| CoreError::CatalogueConflict("corrupt next_id counter".into()))
    }

    /// Upserts passage rows. Idempotent on `id`: re-committing the same
    /// id with the same fields is a no-op, which is how re-indexing an
    /// unchanged file becomes a no-op end to end.
    pub fn commit_passages(&self, records: &[Passage]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(CoreError::from)?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO passage (id, source_path, page_number, chunk_index, text)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   source_path = excluded.source_path,
                   page_number = excluded.page_number,
                   chunk_index = excluded.chunk_index,
                   text = excluded.text",
            )?;
            for p in records {
                stmt.execute(params![
                    p.id.0 as i64,
                    p.source_path,
                    p.page_number,
                    p.chunk_index,
                    p.text,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Fetches passages by id, preserving the order of `ids`. A missing id
    /// fails the whole call, per contract.
    pub fn get_passages_by_ids(&self, ids: &[PassageId]) -> Result<Vec<Passage>> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        let mut out = Vec::with_capacity(ids.len());
        let mut stmt = conn.prepare(
            "SELECT source_path, page_number, chunk_index, text FROM passage WHERE id = ?1",
        )?;
        for id in ids {
            let row = stmt
                .query_row(params![id.0 as i64], |row| {
                    Ok(Passage {
                        id: *id,
                        source_path: row.get(0)?,
                        page_number: row.get(1)?,
                        chunk_index: row.get(2)?,
                        text: row.get(3)?,
                    })
                })
                .optional()?;
            match row {
                Some(p) => out.push(p),
                None => {
                    return Err(CoreError::CatalogueConflict(format!(
                        "passage id {} not found",
                        id.0
                    )))
                }
            }
        }
        Ok(out)
    }

    /// Deletes a range of passage ids (used by the Driver to roll back a
    /// partial file, or at compaction to sweep a tombstoned file).
    pub fn delete_passages_in_range(&self, range: PassageIdRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let conn = self.pool.get().map_err(CoreError::from)?;
        conn.execute(
            "DELETE FROM passage WHERE id BETWEEN ?1 AND ?2",
            params![range.first as i64, range.last as i64],
        )?;
        Ok(())
    }

    /// Begins tracking a file: inserts or replaces its record with
    /// `status = pending`, reserved id range `first..=last` (caller has
    /// already called [`Catalogue::assign_ids`]).
    pub fn begin_file(&self, path: &str, hash: &str, range: PassageIdRange) -> Result<FileRecord> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        let now = chrono::Utc::now();
        conn.execute(
            "INSERT INTO file_record (source_path, content_hash, indexed_at, first_id, last_id, status)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending')
             ON CONFLICT(source_path) DO UPDATE SET
               content_hash = excluded.content_hash,
               indexed_at = excluded.indexed_at,
               first_id = excluded.first_id,
               last_id = excluded.last_id,
               status = 'pending'",
            params![path, hash, now.to_rfc3339(), range.first as i64, range.last as i64],
        )?;
        Ok(FileRecord {
            source_path: path.to_string(),
            content_hash: hash.to_string(),
            indexed_at: now,
            passage_id_range: range,
            status: FileStatus::Pending,
        })
    }

    /// Transitions a file's status on flush completion: `indexed` on
    /// success, `failed` otherwise. `range` must match the range recorded
    /// by [`Catalogue::begin_file`].
    pub fn finish_file(&self, path: &str, range: PassageIdRange, ok: bool) -> Result<()> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        let status = if ok { FileStatus::Indexed } else { FileStatus::Failed };
        conn.execute(
            "UPDATE file_record SET status = ?1, first_id = ?2, last_id = ?3 WHERE source_path = ?4",
            params![status.as_str(), range.first as i64, range.last as i64, path],
        )?;
        Ok(())
    }

    pub fn file_state(&self, path: &str) -> Result<Option<FileRecord>> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        conn.query_row(
            "SELECT content_hash, indexed_at, first_id, last_id, status FROM file_record WHERE source_path = ?1",
            params![path],
            |row| {
                let hash: String = row.get(0)?;
                let indexed_at: String = row.get(1)?;
                let first: i64 = row.get(2)?;
                let last: i64 = row.get(3)?;
                let status: String = row.get(4)?;
                Ok(FileRecord {
                    source_path: path.to_string(),
                    content_hash: hash,
                    indexed_at: chrono::DateTime::parse_from_rfc3339(&indexed_at)
                        .map(|dt| dt.with_timezone(&chrono::Utc))
                        .unwrap_or_else(|_| chrono::Utc::now()),
                    passage_id_range: PassageIdRange { first: first as u64, last: last as u64 },
                    status: FileStatus::parse(&status).unwrap_or(FileStatus::Failed),
                })
            },
        ).optional().map_err(CoreError::from)
    }

    /// File records left in `pending` status: a crash between
    /// [`Catalogue::begin_file`] and [`Catalogue::finish_file`] leaves
    /// exactly these behind, and startup recovery rolls them back.
    pub fn pending_files(&self) -> Result<Vec<FileRecord>> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        let mut stmt = conn.prepare(
            "SELECT source_path, content_hash, indexed_at, first_id, last_id FROM file_record WHERE status = 'pending'",
        )?;
        let rows = stmt.query_map([], |row| {
            let source_path: String = row.get(0)?;
            let hash: String = row.get(1)?;
            let indexed_at: String = row.get(2)?;
            let first: i64 = row.get(3)?;
            let last: i64 = row.get(4)?;
            Ok(FileRecord {
                source_path,
                content_hash: hash,
                indexed_at: chrono::DateTime::parse_from_rfc3339(&indexed_at)
                    .map(|dt| dt.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|_| chrono::Utc::now()),
                passage_id_range: PassageIdRange { first: first as u64, last: last as u64 },
                status: FileStatus::Pending,
            })
        })?;
        rows.collect::<std::result::Result<Vec<_>, _>>().map_err(CoreError::from)
    }

    pub fn counts(&self) -> Result<Counts> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        let passages: i64 = conn.query_row("SELECT COUNT(*) FROM passage", [], |r| r.get(0))?;
        let files: i64 = conn.query_row(
            "SELECT COUNT(*) FROM file_record WHERE status = 'indexed'",
            [],
            |r| r.get(0),
        )?;
        Ok(Counts { passages: passages as u64, files: files as u64 })
    }

    /// Number of passages in the Catalogue whose id falls within `range`
    /// (used to check the cross-store count equality invariant against the Vector Index and Lexical Index).
    pub fn count_passages_in(&self, range: PassageIdRange) -> Result<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        let conn = self.pool.get().map_err(CoreError::from)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM passage WHERE id BETWEEN ?1 AND ?2",
            params![range.first as i64, range.last as i64],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: u64, path: &str, page: u32, chunk: u32, text: &str) -> Passage {
        Passage {
            id: PassageId(id),
            source_path: path.to_string(),
            page_number: page,
            chunk_index: chunk,
            text: text.to_string(),
        }
    }

    #[test]
    fn assign_ids_reserves_a_gapless_increasing_range() {
        let cat = Catalogue::open_in_memory().unwrap();
        let r1 = cat.assign_ids(3).unwrap();
        assert_eq!((r1.first, r1.last), (0, 2));
        let r2 = cat.assign_ids(2).unwrap();
        assert_eq!((r2.first, r2.last), (3, 4));
    }

    #[test]
    fn commit_and_fetch_round_trips_text_byte_identical() {
        let cat = Catalogue::open_in_memory().unwrap();
        let range = cat.assign_ids(1).unwrap();
        let p = passage(range.first, "a.pdf", 1, 0, "機械学習は統計と最適化の交点にある");
        cat.commit_passages(&[p.clone()]).unwrap();
        let fetched = cat.get_passages_by_ids(&[PassageId(range.first)]).unwrap();
        assert_eq!(fetched[0].text, p.text);
    }

    #[test]
    fn missing_id_fails_the_fetch_call() {
        let cat = Catalogue::open_in_memory().unwrap();
        let err = cat.get_passages_by_ids(&[PassageId(999)]).unwrap_err();
        assert!(matches!(err, CoreError::CatalogueConflict(_)));
    }

    #[test]
    fn commit_is_idempotent_on_id() {
        let cat = Catalogue::open_in_memory().unwrap();
        let range = cat.assign_ids(1).unwrap();
        let p = passage(range.first, "a.pdf", 1, 0, "text");
        cat.commit_passages(&[p.clone()]).unwrap();
        cat.commit_passages(&[p]).unwrap();
        assert_eq!(cat.counts().unwrap().passages, 1);
    }

    #[test]
    fn begin_then_finish_file_transitions_status() {
        let cat = Catalogue::open_in_memory().unwrap();
        let range = cat.assign_ids(2).unwrap();
        cat.begin_file("a.pdf", "hash1", range).unwrap();
        assert_eq!(cat.file_state("a.pdf").unwrap().unwrap().status, FileStatus::Pending);
        cat.finish_file("a.pdf", range, true).unwrap();
        assert_eq!(cat.file_state("a.pdf").unwrap().unwrap().status, FileStatus::Indexed);
    }

    #[test]
    fn pending_files_lists_incomplete_commits() {
        let cat = Catalogue::open_in_memory().unwrap();
        let range = cat.assign_ids(1).unwrap();
        cat.begin_file("partial.pdf", "hash", range).unwrap();
        let pending = cat.pending_files().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].source_path, "partial.pdf");
    }

    #[test]
    fn empty_range_assign_reports_next_id_with_no_reservation() {
        let cat = Catalogue::open_in_memory().unwrap();
        let first = cat.assign_ids(5).unwrap();
        let empty = cat.assign_ids(0).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.first, first.last + 1);
    }

    #[test]
    fn count_passages_in_range_matches_commits() {
        let cat = Catalogue::open_in_memory().unwrap();
        let range = cat.assign_ids(3).unwrap();
        let records: Vec<Passage> = (range.first..=range.last)
            .map(|id| passage(id, "a.pdf", 1, (id - range.first) as u32, "x"))
            .collect();
        cat.commit_passages(&records).unwrap();
        assert_eq!(cat.count_passages_in(range).unwrap(), 3);
    }
}
