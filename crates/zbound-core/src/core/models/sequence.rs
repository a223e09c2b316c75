use std::fmt;

/// Label index marking a sequence position whose residue type is still open.
pub const WILDCARD: u16 = u16::MAX;

/// One designable position of the sequence space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeqPosition {
    pub name: String,
    /// Residue types allowed at this position; a label index points into this list.
    pub labels: Vec<String>,
}

/// The shared space of sequences that every state projects its conformations onto.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SeqSpace {
    pub positions: Vec<SeqPosition>,
}

impl SeqSpace {
    pub fn new(positions: Vec<SeqPosition>) -> Self {
        Self { positions }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn position_index(&self, name: &str) -> Option<usize> {
        self.positions.iter().position(|p| p.name == name)
    }

    pub fn label_index(&self, pos: usize, label: &str) -> Option<u16> {
        self.positions
            .get(pos)?
            .labels
            .iter()
            .position(|l| l == label)
            .and_then(|i| u16::try_from(i).ok())
    }

    /// Parses a whitespace-separated list of residue types, `*` meaning wildcard.
    pub fn parse_sequence(&self, text: &str) -> Option<Sequence> {
        let tokens: Vec<&str> = text.split_whitespace().collect();
        if tokens.len() != self.len() {
            return None;
        }
        tokens
            .iter()
            .enumerate()
            .map(|(pos, &token)| {
                if token == "*" {
                    Some(WILDCARD)
                } else {
                    self.label_index(pos, token)
                }
            })
            .collect::<Option<Vec<_>>>()
            .map(Sequence::from_labels)
    }

    /// Every fully defined sequence of the space, in lexicographic label order.
    pub fn complete_sequences(&self) -> Vec<Sequence> {
        let mut out = vec![Vec::with_capacity(self.len())];
        for pos in &self.positions {
            out = out
                .into_iter()
                .flat_map(|prefix| {
                    (0..pos.labels.len()).map(move |label| {
                        let mut next = prefix.clone();
                        next.push(label as u16);
                        next
                    })
                })
                .collect();
        }
        out.into_iter().map(Sequence::from_labels).collect()
    }

    pub fn format(&self, seq: &Sequence) -> String {
        seq.labels()
            .iter()
            .enumerate()
            .map(|(pos, &label)| {
                if label == WILDCARD {
                    "*".to_string()
                } else {
                    self.positions
                        .get(pos)
                        .and_then(|p| p.labels.get(label as usize))
                        .cloned()
                        .unwrap_or_else(|| format!("#{label}"))
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// The projection of a conformation onto the sequence space.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sequence(Box<[u16]>);

impl Sequence {
    pub fn wildcard(len: usize) -> Self {
        Self(vec![WILDCARD; len].into_boxed_slice())
    }

    pub fn from_labels(labels: Vec<u16>) -> Self {
        Self(labels.into_boxed_slice())
    }

    #[inline]
    pub fn labels(&self) -> &[u16] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn label(&self, pos: usize) -> Option<u16> {
        self.0.get(pos).copied().filter(|&l| l != WILDCARD)
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|&l| l != WILDCARD)
    }

    /// True when every position of `self` is a wildcard or matches `other`.
    pub fn generalizes(&self, other: &Sequence) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(other.0.iter())
                .all(|(&a, &b)| a == WILDCARD || a == b)
    }

    pub(crate) fn set(&mut self, pos: usize, label: u16) {
        self.0[pos] = label;
    }
}

impl fmt::Debug for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence{}", self)
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, &label) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if label == WILDCARD {
                write!(f, "*")?;
            } else {
                write!(f, "{label}")?;
            }
        }
        write!(f, "]")
    }
}
