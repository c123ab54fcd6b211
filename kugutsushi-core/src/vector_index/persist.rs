//! On-disk artefact layout for the Vector Index: a single hand-rolled
//! binary file (centroids, PQ codebooks, inverted lists) prefixed by a
//! magic marker and version, plus a `serde`-derived JSON sidecar for
//! [`super::TrainingState`]. Loading validates the magic/version and the
//! sidecar's parameter compatibility; either failing is fatal
//! (`IndexCorruption`), per the External Interfaces contract.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use crate::error::{CoreError, Result};
use crate::types::PassageId;

use super::pq::ProductQuantizer;
use super::{InvertedList, TrainingState};

pub const MAGIC: &[u8; 6] = b"KGSV01";
pub const FORMAT_VERSION: u32 = 1;

const ARTIFACT_FILE: &str = "faiss.index";
const STATE_FILE: &str = "index_state.json";

pub fn save(
    dir: &Path,
    state: &TrainingState,
    centroids: &[Vec<f32>],
    pq: Option<&ProductQuantizer>,
    lists: &[InvertedList],
) -> Result<()> {
    fs::create_dir_all(dir)?;

    let mut buf = Vec::new();
    buf.extend_from_slice(MAGIC);
    write_u32(&mut buf, FORMAT_VERSION);
    write_u32(&mut buf, state.dim as u32);
    write_u32(&mut buf, centroids.len() as u32);

    for c in centroids {
        for &x in c {
            write_f32(&mut buf, x);
        }
    }

    match pq {
        Some(pq) => {
            buf.push(1);
            write_u32(&mut buf, pq.m as u32);
            write_u32(&mut buf, pq.nbits as u32);
            write_u32(&mut buf, pq.sub_dim as u32);
            for codebook in &pq.codebooks {
                write_u32(&mut buf, codebook.len() as u32);
                for entry in codebook {
                    for &x in entry {
                        write_f32(&mut buf, x);
                    }
                }
            }
        }
        None => buf.push(0),
    }

    write_u32(&mut buf, lists.len() as u32);
    for list in lists {
        write_u32(&mut buf, list.entries.len() as u32);
        for (id, code) in &list.entries {
            write_u64(&mut buf, id.0);
            write_u32(&mut buf, code.len() as u32);
            buf.extend_from_slice(code);
        }
    }

    fs::write(dir.join(ARTIFACT_FILE), &buf)?;

    let json = serde_json::to_vec_pretty(state)?;
    fs::write(dir.join(STATE_FILE), json)?;

    Ok(())
}

pub fn load(
    dir: &Path,
) -> Result<(TrainingState, Vec<Vec<f32>>, Option<ProductQuantizer>, Vec<InvertedList>)> {
    let state_bytes = fs::read(dir.join(STATE_FILE))?;
    let state: TrainingState = serde_json::from_slice(&state_bytes)?;

    let mut file = fs::File::open(dir.join(ARTIFACT_FILE))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let mut cursor = 0usize;
    let magic = read_exact(&data, &mut cursor, 6)?;
    if magic != MAGIC {
        return Err(CoreError::IndexCorruption(format!(
            "bad magic prefix: expected {MAGIC:?}, got {magic:?}"
        )));
    }
    let version = read_u32(&data, &mut cursor)?;
    if version != FORMAT_VERSION {
        return Err(CoreError::IndexCorruption(format!(
            "unsupported artefact version {version}, expected {FORMAT_VERSION}"
        )));
    }
    let dim = read_u32(&data, &mut cursor)? as usize;
    if dim != state.dim {
        return Err(CoreError::IndexCorruption(
            "artefact dimension does not match sidecar state".into(),
        ));
    }

    let nlist = read_u32(&data, &mut cursor)? as usize;
    let mut centroids = Vec::with_capacity(nlist);
    for _ in 0..nlist {
        let mut c = Vec::with_capacity(dim);
        for _ in 0..dim {
            c.push(read_f32(&data, &mut cursor)?);
        }
        centroids.push(c);
    }

    let has_pq = read_u8(&data, &mut cursor)?;
    let pq = if has_pq == 1 {
        let m = read_u32(&data, &mut cursor)? as usize;
        let nbits = read_u32(&data, &mut cursor)? as usize;
        let sub_dim = read_u32(&data, &mut cursor)? as usize;
        let mut codebooks = Vec::with_capacity(m);
        for _ in 0..m {
            let count = read_u32(&data, &mut cursor)? as usize;
            let mut codebook = Vec::with_capacity(count);
            for _ in 0..count {
                let mut entry = Vec::with_capacity(sub_dim);
                for _ in 0..sub_dim {
                    entry.push(read_f32(&data, &mut cursor)?);
                }
                codebook.push(entry);
            }
            codebooks.push(codebook);
        }
        Some(ProductQuantizer { m, nbits, sub_dim, codebooks })
    } else {
        None
    };

    let list_count = read_u32(&data, &mut cursor)? as usize;
    let mut lists = Vec::with_capacity(list_count);
    for _ in 0..list_count {
        let entry_count = read_u32(&data, &mut cursor)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let id = read_u64(&data, &mut cursor)?;
            let code_len = read_u32(&data, &mut cursor)? as usize;
            let code = read_exact(&data, &mut cursor, code_len)?.to_vec();
            entries.push((PassageId(id), code));
        }
        lists.push(InvertedList { entries });
    }

    Ok((state, centroids, pq, lists))
}

fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn write_f32(buf: &mut Vec<u8>, v: f32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn read_exact<'a>(data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    if *cursor + len > data.len() {
        return Err(CoreError::IndexCorruption("artefact truncated".into()));
    }
    let slice = &data[*cursor..*cursor + len];
    *cursor += len;
    Ok(slice)
}

fn read_u8(data: &[u8], cursor: &mut usize) -> Result<u8> {
    Ok(read_exact(data, cursor, 1)?[0])
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32> {
    let bytes = read_exact(data, cursor, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(data: &[u8], cursor: &mut usize) -> Result<u64> {
    let bytes = read_exact(data, cursor, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_f32(data: &[u8], cursor: &mut usize) -> Result<f32> {
    let bytes = read_exact(data, cursor, 4)?;
    Ok(f32::from_le_bytes(bytes.try_into().unwrap()))
}
