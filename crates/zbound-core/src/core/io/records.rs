use crate::core::math::bigexp::{BigExp, ENCODED_LEN};
use crate::core::models::conf::{Conf, UNASSIGNED};
use crate::core::models::node::Node;
use crate::core::models::space::StateId;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record has {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("Record refers to unknown state {0}")]
    UnknownState(u8),

    #[error("Conformation of {len} positions does not fit a record of width {width}")]
    TooWide { len: usize, width: usize },
}

/// Fixed-size binary encoding of frontier nodes.
///
/// Layout (little endian): `state: u8`, `conf: i32 x width`, `z_upper: 16 bytes`,
/// `score: f64`. States with fewer positions than `width` pad with the
/// unassigned sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordCodec {
    widths: Vec<usize>,
    width: usize,
}

impl RecordCodec {
    /// `widths[state]` is the number of positions of each state.
    pub fn new(widths: Vec<usize>) -> Self {
        let width = widths.iter().copied().max().unwrap_or(0);
        Self { widths, width }
    }

    #[inline]
    pub fn record_size(&self) -> usize {
        1 + 4 * self.width + ENCODED_LEN + 8
    }

    pub fn encode_into(&self, node: &Node, out: &mut Vec<u8>) -> Result<(), RecordError> {
        let values = node.conf.as_slice();
        if values.len() > self.width {
            return Err(RecordError::TooWide {
                len: values.len(),
                width: self.width,
            });
        }
        out.push(node.state.0);
        for i in 0..self.width {
            let v = values.get(i).copied().unwrap_or(UNASSIGNED);
            out.extend_from_slice(&v.to_le_bytes());
        }
        out.extend_from_slice(&node.z_upper.to_bytes());
        out.extend_from_slice(&node.score.to_le_bytes());
        Ok(())
    }

    pub fn encode(&self, node: &Node) -> Result<Vec<u8>, RecordError> {
        let mut out = Vec::with_capacity(self.record_size());
        self.encode_into(node, &mut out)?;
        Ok(out)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Node, RecordError> {
        if bytes.len() != self.record_size() {
            return Err(RecordError::Length {
                expected: self.record_size(),
                actual: bytes.len(),
            });
        }
        let state = bytes[0];
        let len = *self
            .widths
            .get(state as usize)
            .ok_or(RecordError::UnknownState(state))?;

        let conf_bytes = &bytes[1..1 + 4 * self.width];
        let values = conf_bytes
            .chunks_exact(4)
            .take(len)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        let z_start = 1 + 4 * self.width;
        let mut z = [0u8; ENCODED_LEN];
        z.copy_from_slice(&bytes[z_start..z_start + ENCODED_LEN]);
        let mut score = [0u8; 8];
        score.copy_from_slice(&bytes[z_start + ENCODED_LEN..]);

        Ok(Node {
            state: StateId(state),
            conf: Conf::from_raw(values),
            z_upper: BigExp::from_bytes(&z),
            score: f64::from_le_bytes(score),
        })
    }
}
