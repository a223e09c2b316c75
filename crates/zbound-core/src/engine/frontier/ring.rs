use super::FrontierError;
use crate::core::io::records::RecordCodec;
use crate::core::io::ring_file::{RingFile, RingLayout};
use crate::core::models::node::Node;
use std::collections::VecDeque;
use std::path::Path;

/// Bounded FIFO rings of nodes, held in memory or in a ring file.
#[derive(Debug)]
pub enum RingStore {
    Memory {
        rings: Vec<VecDeque<Node>>,
        tags: Vec<u64>,
        capacity: usize,
    },
    Disk {
        file: RingFile,
        codec: RecordCodec,
    },
}

impl RingStore {
    pub fn memory(num_regions: usize, capacity: usize) -> Self {
        RingStore::Memory {
            rings: vec![VecDeque::new(); num_regions],
            tags: vec![0; num_regions],
            capacity,
        }
    }

    /// Opens the ring file at `path`, creating it when absent or when `fresh`.
    /// Returns the store and whether existing contents were kept.
    pub fn disk(
        path: &Path,
        codec: RecordCodec,
        num_regions: usize,
        bytes: u64,
        fresh: bool,
    ) -> Result<(Self, bool), FrontierError> {
        let layout = RingLayout::fitting(bytes, codec.record_size(), num_regions);
        let (file, resumed) = if fresh {
            (RingFile::create(path, layout)?, false)
        } else {
            RingFile::open_or_create(path, layout)?
        };
        Ok((RingStore::Disk { file, codec }, resumed))
    }

    pub fn capacity(&self) -> usize {
        match self {
            RingStore::Memory { capacity, .. } => *capacity,
            RingStore::Disk { file, .. } => file.capacity(),
        }
    }

    pub fn len(&self, region: usize) -> usize {
        match self {
            RingStore::Memory { rings, .. } => rings.get(region).map_or(0, VecDeque::len),
            RingStore::Disk { file, .. } => file.len(region),
        }
    }

    pub fn is_empty(&self, region: usize) -> bool {
        self.len(region) == 0
    }

    pub fn tag(&self, region: usize) -> u64 {
        match self {
            RingStore::Memory { tags, .. } => tags.get(region).copied().unwrap_or(0),
            RingStore::Disk { file, .. } => file.tag(region),
        }
    }

    pub fn set_tag(&mut self, region: usize, tag: u64) -> Result<(), FrontierError> {
        match self {
            RingStore::Memory { tags, .. } => {
                if let Some(slot) = tags.get_mut(region) {
                    *slot = tag;
                }
                Ok(())
            }
            RingStore::Disk { file, .. } => Ok(file.set_tag(region, tag)?),
        }
    }

    /// Appends a node; hands it back when the region is full.
    pub fn push_back(&mut self, region: usize, node: Node) -> Result<Option<Node>, FrontierError> {
        match self {
            RingStore::Memory {
                rings, capacity, ..
            } => match rings.get_mut(region) {
                Some(ring) if ring.len() < *capacity => {
                    ring.push_back(node);
                    Ok(None)
                }
                _ => Ok(Some(node)),
            },
            RingStore::Disk { file, codec } => {
                let record = codec.encode(&node)?;
                if file.push_back(region, &record)? {
                    Ok(None)
                } else {
                    Ok(Some(node))
                }
            }
        }
    }

    pub fn pop_front(&mut self, region: usize) -> Result<Option<Node>, FrontierError> {
        match self {
            RingStore::Memory { rings, .. } => {
                Ok(rings.get_mut(region).and_then(VecDeque::pop_front))
            }
            RingStore::Disk { file, codec } => match file.pop_front(region)? {
                Some(record) => Ok(Some(codec.decode(&record)?)),
                None => Ok(None),
            },
        }
    }

    /// Copies out the nodes of a region in FIFO order.
    pub fn nodes(&mut self, region: usize) -> Result<Vec<Node>, FrontierError> {
        match self {
            RingStore::Memory { rings, .. } => Ok(rings
                .get(region)
                .map(|ring| ring.iter().cloned().collect())
                .unwrap_or_default()),
            RingStore::Disk { file, codec } => file
                .read_all(region)?
                .iter()
                .map(|record| codec.decode(record).map_err(FrontierError::from))
                .collect(),
        }
    }

    pub fn flush(&mut self) -> Result<(), FrontierError> {
        match self {
            RingStore::Memory { .. } => Ok(()),
            RingStore::Disk { file, .. } => Ok(file.flush()?),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::math::bigexp::BigExp;
    use crate::core::models::conf::Conf;
    use crate::core::models::space::StateId;

    fn node(choice: usize) -> Node {
        Node::new(
            StateId(0),
            Conf::from_choices(&[choice, 0]).unwrap(),
            BigExp::from_f64(choice as f64 + 1.0),
        )
    }

    fn exercise(store: &mut RingStore) {
        assert_eq!(store.capacity(), 2);
        assert!(store.push_back(1, node(0)).unwrap().is_none());
        assert!(store.push_back(1, node(1)).unwrap().is_none());
        assert_eq!(store.push_back(1, node(2)).unwrap(), Some(node(2)));
        assert_eq!(store.nodes(1).unwrap(), vec![node(0), node(1)]);
        assert_eq!(store.pop_front(1).unwrap(), Some(node(0)));
        assert_eq!(store.len(1), 1);
        assert!(store.is_empty(0));
        store.set_tag(0, 7).unwrap();
        assert_eq!(store.tag(0), 7);
    }

    #[test]
    fn memory_rings_are_bounded_fifos() {
        let mut store = RingStore::memory(2, 2);
        exercise(&mut store);
    }

    #[test]
    fn disk_rings_are_bounded_fifos_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frontier");
        let codec = RecordCodec::new(vec![2]);
        let bytes = (codec.record_size() * 2 * 2) as u64;

        let (mut store, resumed) =
            RingStore::disk(&path, codec.clone(), 2, bytes, false).unwrap();
        assert!(!resumed);
        exercise(&mut store);
        store.flush().unwrap();
        drop(store);

        let (mut store, resumed) =
            RingStore::disk(&path, codec.clone(), 2, bytes, false).unwrap();
        assert!(resumed);
        assert_eq!(store.tag(0), 7);
        assert_eq!(store.pop_front(1).unwrap(), Some(node(1)));

        let (store, resumed) = RingStore::disk(&path, codec, 2, bytes, true).unwrap();
        assert!(!resumed);
        assert!(store.is_empty(1));
    }
}
