//! C5 — Lexical Index.
//!
//! Character 2-gram BM25 over NFKC-normalised text, backed by an
//! embedded relational store (the same `rusqlite`/WAL idiom as
//! [`crate::catalogue`]) with posting lists stored as varint-delta-
//! encoded blobs rather than one row per `(term, passage)` pair — the
//! compact representation the design calls for at roughly a million
//! passages.

use std::collections::HashMap;
use std::path::Path;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use unicode_normalization::UnicodeNormalization;

use crate::config::LexicalIndexConfig;
use crate::error::{CoreError, Result};
use crate::types::PassageId;

/// Tokenises NFKC-normalised text into character 2-grams. Whitespace and
/// punctuation are hard breaks: no bigram crosses one. An input shorter
/// than two characters between breaks (or empty) yields no tokens for
/// that run.
pub fn tokenize(text: &str) -> Vec<String> {
    let normalised: String = text.nfkc().collect();
    let mut tokens = Vec::new();
    let mut run: Vec<char> = Vec::new();

    let mut flush = |run: &mut Vec<char>, tokens: &mut Vec<String>| {
        for window in run.windows(2) {
            tokens.push(window.iter().collect());
        }
        run.clear();
    };

    for c in normalised.chars() {
        if is_break(c) {
            flush(&mut run, &mut tokens);
        } else {
            run.push(c);
        }
    }
    flush(&mut run, &mut tokens);
    tokens
}

fn is_break(c: char) -> bool {
    c.is_whitespace() || c.is_ascii_punctuation() || is_cjk_punctuation(c)
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(c as u32, 0x3000..=0x303F | 0xFF00..=0xFF0F | 0xFF1A..=0xFF20 | 0xFF3B..=0xFF40 | 0xFF5B..=0xFF65)
}

/// A pending add: accumulated in memory until the Driver's checkpoint
/// boundary flushes a batch in one transaction.
struct PendingDoc {
    id: PassageId,
    tokens: Vec<String>,
}

pub struct LexicalIndex {
    pool: Pool<SqliteConnectionManager>,
    cfg: LexicalIndexConfig,
    pending: Vec<PendingDoc>,
}

impl LexicalIndex {
    pub fn open(path: &Path, cfg: LexicalIndexConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = Pool::builder().max_size(8).build(manager).map_err(CoreError::from)?;
        let index = Self { pool, cfg, pending: Vec::new() };
        index.init_schema()?;
        Ok(index)
    }

    pub fn open_in_memory(cfg: LexicalIndexConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager).map_err(CoreError::from)?;
        let index = Self { pool, cfg, pending: Vec::new() };
        index.init_schema()?;
        Ok(index)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get().map_err(CoreError::from)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS term (
                term_id INTEGER PRIMARY KEY,
                term_text TEXT NOT NULL UNIQUE,
                df INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS posting (
                term_id INTEGER PRIMARY KEY REFERENCES term(term_id),
                blob BLOB NOT NULL
            );
            CREATE TABLE IF NOT EXISTS stats (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                corpus_size INTEGER NOT NULL,
                avg_doc_length REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS doc_length (
                passage_id INTEGER PRIMARY KEY,
                length INTEGER NOT NULL
            );
            INSERT OR IGNORE INTO stats (id, corpus_size, avg_doc_length) VALUES (0, 0, 0.0);",
        )?;
        Ok(())
    }

    /// Tokenises `text` and buffers the result; the actual posting-blob
    /// rewrite happens at [`LexicalIndex::flush`].
    pub fn add(&mut self, id: PassageId, text: &str) {
        self.pending.push(PendingDoc { id, tokens: tokenize(text) });
    }

    /// Commits all pending adds in a single transaction: rewrites the
    /// posting blob for every touched term (blobs are replaced, not
    /// patched in place), updates `term.df`, `doc_length`, and `stats`.
    /// Vocabulary reduction (`min_df`) does *not* run here — it runs once
    /// at [`LexicalIndex::finalize`], at corpus-finalisation time, not
    /// mid-stream (a term under `min_df` while a single-document corpus is
    /// still being built must stay searchable).
    pub fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(CoreError::from)?;
        let tx = conn.transaction()?;

        for doc in &self.pending {
            let mut tf: HashMap<&str, u32> = HashMap::new();
            for t in &doc.tokens {
                *tf.entry(t.as_str()).or_insert(0) += 1;
            }
            tx.execute(
                "INSERT INTO doc_length (passage_id, length) VALUES (?1, ?2)
                 ON CONFLICT(passage_id) DO UPDATE SET length = excluded.length",
                params![doc.id.0 as i64, doc.tokens.len() as i64],
            )?;
            for (term, freq) in tf {
                let term_id = get_or_create_term(&tx, term)?;
                append_posting(&tx, term_id, doc.id, freq)?;
            }
        }

        refresh_stats(&tx)?;

        tx.commit()?;
        self.pending.clear();
        Ok(())
    }

    /// Corpus finalisation: flushes any still-pending adds, then prunes
    /// every term whose document frequency is below `min_df`. Meant to be
    /// called once, when a driver run considers indexing complete — not
    /// per flush, so a term that hasn't yet reached `min_df` within a
    /// single batch isn't mistaken for one that never will.
    pub fn finalize(&mut self) -> Result<()> {
        self.flush()?;
        let mut conn = self.pool.get().map_err(CoreError::from)?;
        let tx = conn.transaction()?;
        prune_low_df_terms(&tx, self.cfg.min_df)?;
        refresh_stats(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// BM25 search: tokenise the query, decode each present term's
    /// posting blob, k-way-merge-accumulate scores keyed by passage id,
    /// return the top-`k` by score with ties broken by ascending id.
    pub fn search(&self, query_text: &str, k: usize) -> Result<Vec<(PassageId, f32)>> {
        if k == 0 || query_text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.pool.get().map_err(CoreError::from)?;
        let (corpus_size, avg_doc_length): (i64, f64) = conn.query_row(
            "SELECT corpus_size, avg_doc_length FROM stats WHERE id = 0",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if corpus_size == 0 {
            return Ok(Vec::new());
        }

        let tokens = tokenize(query_text);
        let mut query_tf: HashMap<String, u32> = HashMap::new();
        for t in tokens {
            *query_tf.entry(t).or_insert(0) += 1;
        }

        let k1 = self.cfg.k1;
        let b = self.cfg.b;
        let mut scores: HashMap<u64, f32> = HashMap::new();

        for term in query_tf.keys() {
            let row: Option<(i64, i64, Vec<u8>)> = conn
                .query_row(
                    "SELECT t.term_id, t.df, p.blob FROM term t JOIN posting p ON p.term_id = t.term_id WHERE t.term_text = ?1",
                    params![term],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((_term_id, df, blob)) = row else { continue };
            if df == 0 {
                continue;
            }
            let idf = idf(corpus_size as f64, df as f64);
            for (passage_id, tf) in decode_postings(&blob) {
                let doc_len = doc_length(&conn, passage_id)?;
                let score = bm25_term_score(idf, tf as f64, doc_len as f64, avg_doc_length, k1, b);
                *scores.entry(passage_id).or_insert(0.0) += score as f32;
            }
        }

        let mut ranked: Vec<(PassageId, f32)> =
            scores.into_iter().map(|(id, score)| (PassageId(id), score)).collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(k);
        Ok(ranked)
    }

    pub fn count_in(&self, range: crate::types::PassageIdRange) -> Result<u64> {
        if range.is_empty() {
            return Ok(0);
        }
        let conn = self.pool.get().map_err(CoreError::from)?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM doc_length WHERE passage_id BETWEEN ?1 AND ?2",
            params![range.first as i64, range.last as i64],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    }

    /// Whole-file reindex only (non-goal: incremental deletion of a single
    /// passage): removes `doc_length` rows for `range`, and rewrites the
    /// posting blob of every term that references an id inside `range` so
    /// it no longer does, updating `term.df` to match. A passage id must
    /// never outlive its Catalogue row in a posting blob — a later BM25
    /// hit against a deleted id would otherwise fail the whole query
    /// (the Catalogue can't hydrate a row that no longer exists) instead
    /// of simply not finding it.
    pub fn delete_in_range(&self, range: crate::types::PassageIdRange) -> Result<()> {
        if range.is_empty() {
            return Ok(());
        }
        let mut conn = self.pool.get().map_err(CoreError::from)?;
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM doc_length WHERE passage_id BETWEEN ?1 AND ?2",
            params![range.first as i64, range.last as i64],
        )?;

        let touched: Vec<(i64, Vec<u8>)> = {
            let mut stmt = tx.prepare("SELECT term_id, blob FROM posting")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };
        for (term_id, blob) in touched {
            let postings = decode_postings(&blob);
            let before = postings.len();
            let kept: Vec<(u64, u32)> =
                postings.into_iter().filter(|(pid, _)| !range.contains(*pid)).collect();
            if kept.len() == before {
                continue;
            }
            if kept.is_empty() {
                tx.execute("DELETE FROM posting WHERE term_id = ?1", params![term_id])?;
                tx.execute("UPDATE term SET df = 0 WHERE term_id = ?1", params![term_id])?;
            } else {
                let blob = encode_postings(&kept);
                tx.execute(
                    "UPDATE posting SET blob = ?1 WHERE term_id = ?2",
                    params![blob, term_id],
                )?;
                tx.execute(
                    "UPDATE term SET df = ?1 WHERE term_id = ?2",
                    params![kept.len() as i64, term_id],
                )?;
            }
        }

        refresh_stats(&tx)?;
        tx.commit()?;
        Ok(())
    }
}

fn idf(corpus_size: f64, df: f64) -> f64 {
    ((corpus_size - df + 0.5) / (df + 0.5) + 1.0).ln()
}

fn bm25_term_score(idf: f64, tf: f64, doc_len: f64, avg_doc_len: f64, k1: f64, b: f64) -> f64 {
    let denom = tf + k1 * (1.0 - b + b * (doc_len / avg_doc_len.max(1e-9)));
    idf * (tf * (k1 + 1.0)) / denom.max(1e-9)
}

fn doc_length(conn: &rusqlite::Connection, passage_id: u64) -> Result<u64> {
    let len: i64 = conn
        .query_row(
            "SELECT length FROM doc_length WHERE passage_id = ?1",
            params![passage_id as i64],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(len as u64)
}

fn get_or_create_term(tx: &rusqlite::Transaction, term: &str) -> Result<i64> {
    tx.execute(
        "INSERT INTO term (term_text, df) VALUES (?1, 0) ON CONFLICT(term_text) DO NOTHING",
        params![term],
    )?;
    let id: i64 = tx.query_row(
        "SELECT term_id FROM term WHERE term_text = ?1",
        params![term],
        |r| r.get(0),
    )?;
    Ok(id)
}

/// Decodes the existing blob (if any), merges in `(id, freq)`, and
/// rewrites the whole blob and the term's `df`. Blobs are rewritten
/// wholesale, not patched in place.
fn append_posting(tx: &rusqlite::Transaction, term_id: i64, id: PassageId, freq: u32) -> Result<()> {
    let existing: Option<Vec<u8>> = tx
        .query_row("SELECT blob FROM posting WHERE term_id = ?1", params![term_id], |r| r.get(0))
        .optional()?;
    let mut postings = existing.map(|b| decode_postings(&b)).unwrap_or_default();
    match postings.iter_mut().find(|(pid, _)| *pid == id.0) {
        Some(entry) => entry.1 = freq,
        None => postings.push((id.0, freq)),
    }
    postings.sort_by_key(|(pid, _)| *pid);
    let blob = encode_postings(&postings);

    tx.execute(
        "INSERT INTO posting (term_id, blob) VALUES (?1, ?2)
         ON CONFLICT(term_id) DO UPDATE SET blob = excluded.blob",
        params![term_id, blob],
    )?;
    tx.execute(
        "UPDATE term SET df = ?1 WHERE term_id = ?2",
        params![postings.len() as i64, term_id],
    )?;
    Ok(())
}

fn prune_low_df_terms(tx: &rusqlite::Transaction, min_df: u64) -> Result<()> {
    tx.execute(
        "DELETE FROM posting WHERE term_id IN (SELECT term_id FROM term WHERE df < ?1)",
        params![min_df as i64],
    )?;
    tx.execute("DELETE FROM term WHERE df < ?1", params![min_df as i64])?;
    Ok(())
}

fn refresh_stats(tx: &rusqlite::Transaction) -> Result<()> {
    let (count, total_len): (i64, Option<i64>) = tx.query_row(
        "SELECT COUNT(*), SUM(length) FROM doc_length",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let avg = if count > 0 { total_len.unwrap_or(0) as f64 / count as f64 } else { 0.0 };
    tx.execute(
        "UPDATE stats SET corpus_size = ?1, avg_doc_length = ?2 WHERE id = 0",
        params![count, avg],
    )?;
    Ok(())
}

/// Varint (LEB128-style) delta encoding of `(passage_id, tf)` pairs, in
/// ascending id order: each entry is `varint(id_delta)` then
/// `varint(tf)`.
fn encode_postings(postings: &[(u64, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut prev = 0u64;
    for &(id, tf) in postings {
        write_varint(&mut out, id - prev);
        write_varint(&mut out, tf as u64);
        prev = id;
    }
    out
}

fn decode_postings(blob: &[u8]) -> Vec<(u64, u32)> {
    let mut out = Vec::new();
    let mut cursor = 0usize;
    let mut prev = 0u64;
    while cursor < blob.len() {
        let Some(delta) = read_varint(blob, &mut cursor) else { break };
        let Some(tf) = read_varint(blob, &mut cursor) else { break };
        prev += delta;
        out.push((prev, tf as u32));
    }
    out
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_varint(data: &[u8], cursor: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*cursor)?;
        *cursor += 1;
        result |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}
