use crate::core::math::bigexp::{BigExp, ENCODED_LEN};
use crate::core::models::sequence::Sequence;
use crate::core::models::space::StateId;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const MAGIC: &[u8; 8] = b"ZBLEDG01";
const HEADER_LEN: usize = 8 + 4;

const KIND_ENTRY: u8 = 0;
const KIND_TOTALS: u8 = 1;

#[derive(Debug, Error)]
pub enum LedgerFileError {
    #[error("I/O error on ledger file '{path}': {source}", path = path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("'{path}' is not a ledger file", path = path.display())]
    BadMagic { path: PathBuf },

    #[error(
        "Ledger file '{path}' stores sequences of {found} positions, expected {expected}",
        path = path.display()
    )]
    WidthMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },

    #[error("Ledger file '{path}' has a corrupt record at byte {offset}", path = path.display())]
    Corrupt { path: PathBuf, offset: usize },
}

/// One persisted ledger value. Later records for the same key replace earlier ones.
#[derive(Debug, Clone, PartialEq)]
pub enum LedgerRecord {
    Entry {
        state: StateId,
        seq: Sequence,
        exact: BigExp,
        pending: BigExp,
        dropped: BigExp,
    },
    Totals {
        state: StateId,
        roots: BigExp,
        tightened: BigExp,
    },
}

/// Append-only log of ledger values keyed by `(state, sequence)`.
///
/// Opening replays the log and compacts it to one record per key; commits then
/// append the new values of every key they touched.
#[derive(Debug)]
pub struct LedgerFile {
    path: PathBuf,
    writer: BufWriter<File>,
    seq_width: usize,
}

impl LedgerFile {
    fn record_size(seq_width: usize) -> usize {
        2 + 2 * seq_width + 3 * ENCODED_LEN
    }

    /// Opens (or creates) the log and returns the merged records it contained.
    pub fn open(
        path: &Path,
        seq_width: usize,
    ) -> Result<(Self, Vec<LedgerRecord>), LedgerFileError> {
        let records = if path.exists() {
            Self::replay(path, seq_width)?
        } else {
            Vec::new()
        };
        let file = Self::rewrite(path, seq_width, &records)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                writer: BufWriter::new(file),
                seq_width,
            },
            records,
        ))
    }

    /// Truncates the log to an empty ledger.
    pub fn create(path: &Path, seq_width: usize) -> Result<Self, LedgerFileError> {
        let file = Self::rewrite(path, seq_width, &[])?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            seq_width,
        })
    }

    pub fn append(&mut self, records: &[LedgerRecord]) -> Result<(), LedgerFileError> {
        let io = io_err(&self.path);
        for record in records {
            let bytes = encode(record, self.seq_width);
            self.writer.write_all(&bytes).map_err(&io)?;
        }
        self.writer.flush().map_err(&io)
    }

    pub fn sync(&mut self) -> Result<(), LedgerFileError> {
        let io = io_err(&self.path);
        self.writer.flush().map_err(&io)?;
        self.writer.get_ref().sync_data().map_err(&io)
    }

    fn replay(path: &Path, seq_width: usize) -> Result<Vec<LedgerRecord>, LedgerFileError> {
        let io = io_err(path);
        let mut bytes = Vec::new();
        File::open(path)
            .and_then(|mut f| f.read_to_end(&mut bytes))
            .map_err(&io)?;

        if bytes.len() < HEADER_LEN || &bytes[..8] != MAGIC {
            return Err(LedgerFileError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let found = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if found != seq_width {
            return Err(LedgerFileError::WidthMismatch {
                path: path.to_path_buf(),
                expected: seq_width,
                found,
            });
        }

        let size = Self::record_size(seq_width);
        let mut merged: Vec<LedgerRecord> = Vec::new();
        let mut slots: std::collections::HashMap<(u8, u8, Sequence), usize> =
            std::collections::HashMap::new();

        let mut offset = HEADER_LEN;
        while offset + size <= bytes.len() {
            let record = decode(&bytes[offset..offset + size], seq_width).ok_or(
                LedgerFileError::Corrupt {
                    path: path.to_path_buf(),
                    offset,
                },
            )?;
            let key = match &record {
                LedgerRecord::Entry { state, seq, .. } => (KIND_ENTRY, state.0, seq.clone()),
                LedgerRecord::Totals { state, .. } => (KIND_TOTALS, state.0, Sequence::wildcard(0)),
            };
            match slots.get(&key) {
                Some(&slot) => merged[slot] = record,
                None => {
                    slots.insert(key, merged.len());
                    merged.push(record);
                }
            }
            offset += size;
        }
        if offset != bytes.len() {
            // a torn final record from an interrupted append
            tracing::warn!(
                path = %path.display(),
                trailing = bytes.len() - offset,
                "Ignoring incomplete trailing ledger record."
            );
        }
        Ok(merged)
    }

    fn rewrite(
        path: &Path,
        seq_width: usize,
        records: &[LedgerRecord],
    ) -> Result<File, LedgerFileError> {
        let io = io_err(path);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .map_err(&io)?;
        let mut buf = Vec::with_capacity(HEADER_LEN + records.len() * Self::record_size(seq_width));
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&(seq_width as u32).to_le_bytes());
        for record in records {
            buf.extend_from_slice(&encode(record, seq_width));
        }
        file.write_all(&buf).map_err(&io)?;
        file.sync_data().map_err(&io)?;
        Ok(file)
    }
}

fn encode(record: &LedgerRecord, seq_width: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(LedgerFile::record_size(seq_width));
    let (kind, state, labels, values) = match record {
        LedgerRecord::Entry {
            state,
            seq,
            exact,
            pending,
            dropped,
        } => (KIND_ENTRY, *state, Some(seq), [*exact, *pending, *dropped]),
        LedgerRecord::Totals {
            state,
            roots,
            tightened,
        } => (KIND_TOTALS, *state, None, [*roots, *tightened, BigExp::ZERO]),
    };
    out.push(kind);
    out.push(state.0);
    for pos in 0..seq_width {
        let label = labels
            .and_then(|s| s.labels().get(pos).copied())
            .unwrap_or(crate::core::models::sequence::WILDCARD);
        out.extend_from_slice(&label.to_le_bytes());
    }
    for value in values {
        out.extend_from_slice(&value.to_bytes());
    }
    out
}

fn decode(bytes: &[u8], seq_width: usize) -> Option<LedgerRecord> {
    let kind = bytes[0];
    let state = StateId(bytes[1]);
    let labels_end = 2 + 2 * seq_width;
    let labels = bytes[2..labels_end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect::<Vec<_>>();
    let mut values = bytes[labels_end..].chunks_exact(ENCODED_LEN).map(|c| {
        let mut buf = [0u8; ENCODED_LEN];
        buf.copy_from_slice(c);
        BigExp::from_bytes(&buf)
    });
    let (a, b, c) = (values.next()?, values.next()?, values.next()?);
    match kind {
        KIND_ENTRY => Some(LedgerRecord::Entry {
            state,
            seq: Sequence::from_labels(labels),
            exact: a,
            pending: b,
            dropped: c,
        }),
        KIND_TOTALS => Some(LedgerRecord::Totals {
            state,
            roots: a,
            tightened: b,
        }),
        _ => None,
    }
}

fn io_err(path: &Path) -> impl Fn(std::io::Error) -> LedgerFileError + '_ {
    move |source| LedgerFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(state: u8, labels: Vec<u16>, exact: f64) -> LedgerRecord {
        LedgerRecord::Entry {
            state: StateId(state),
            seq: Sequence::from_labels(labels),
            exact: BigExp::from_f64(exact),
            pending: BigExp::from_f64(2.0 * exact),
            dropped: BigExp::ZERO,
        }
    }

    #[test]
    fn reopening_merges_later_records_over_earlier_ones() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");

        let (mut file, existing) = LedgerFile::open(&path, 2).unwrap();
        assert!(existing.is_empty());
        file.append(&[entry(0, vec![0, 1], 1.0), entry(1, vec![0, 1], 5.0)])
            .unwrap();
        file.append(&[
            entry(0, vec![0, 1], 3.0),
            LedgerRecord::Totals {
                state: StateId(0),
                roots: BigExp::from_f64(10.0),
                tightened: BigExp::from_f64(-0.5),
            },
        ])
        .unwrap();
        drop(file);

        let (_, merged) = LedgerFile::open(&path, 2).unwrap();
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0], entry(0, vec![0, 1], 3.0));
        assert_eq!(merged[1], entry(1, vec![0, 1], 5.0));
        assert!(matches!(merged[2], LedgerRecord::Totals { state: StateId(0), .. }));
    }

    #[test]
    fn width_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        LedgerFile::create(&path, 2).unwrap();
        assert!(matches!(
            LedgerFile::open(&path, 3),
            Err(LedgerFileError::WidthMismatch { expected: 3, found: 2, .. })
        ));
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger");
        std::fs::write(&path, b"not a ledger at all").unwrap();
        assert!(matches!(
            LedgerFile::open(&path, 1),
            Err(LedgerFileError::BadMagic { .. })
        ));
    }
}
