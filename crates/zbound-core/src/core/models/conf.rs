use std::fmt;
use thiserror::Error;

/// Sentinel for a position whose choice has not been made yet.
pub const UNASSIGNED: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfError {
    #[error("Position {pos} is already assigned to choice {choice}")]
    AlreadyAssigned { pos: usize, choice: usize },

    #[error("Position {pos} is not assigned")]
    NotAssigned { pos: usize },

    #[error("Position {pos} is out of range for a conformation of {len} positions")]
    PositionOutOfRange { pos: usize, len: usize },

    #[error("Choice {choice} does not fit the conformation encoding")]
    ChoiceOutOfRange { choice: usize },
}

/// A partial or complete assignment of one choice (residue conformation) per position.
///
/// Conformations are immutable values: [`Conf::assign`] returns a new conformation
/// and leaves the receiver untouched, so they can be shared and hashed freely.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Conf(Box<[i32]>);

impl Conf {
    pub fn unassigned(num_positions: usize) -> Self {
        Self(vec![UNASSIGNED; num_positions].into_boxed_slice())
    }

    pub fn from_raw(values: Vec<i32>) -> Self {
        Self(values.into_boxed_slice())
    }

    /// Builds a complete conformation from choice indices.
    pub fn from_choices(choices: &[usize]) -> Result<Self, ConfError> {
        choices
            .iter()
            .map(|&choice| encode_choice(choice))
            .collect::<Result<Vec<_>, _>>()
            .map(Self::from_raw)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    /// The choice at `pos`, or `None` when the position is unassigned or out of range.
    pub fn get(&self, pos: usize) -> Option<usize> {
        match self.0.get(pos) {
            Some(&v) if v != UNASSIGNED => Some(v as usize),
            _ => None,
        }
    }

    pub fn assign(&self, pos: usize, choice: usize) -> Result<Conf, ConfError> {
        let current = *self.0.get(pos).ok_or(ConfError::PositionOutOfRange {
            pos,
            len: self.len(),
        })?;
        if current != UNASSIGNED {
            return Err(ConfError::AlreadyAssigned {
                pos,
                choice: current as usize,
            });
        }
        let mut values = self.0.clone();
        values[pos] = encode_choice(choice)?;
        Ok(Conf(values))
    }

    pub fn is_complete(&self) -> bool {
        self.0.iter().all(|&v| v != UNASSIGNED)
    }

    pub fn num_defined(&self) -> usize {
        self.0.iter().filter(|&&v| v != UNASSIGNED).count()
    }
}

fn encode_choice(choice: usize) -> Result<i32, ConfError> {
    i32::try_from(choice).map_err(|_| ConfError::ChoiceOutOfRange { choice })
}

impl fmt::Debug for Conf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Conf{}", self)
    }
}

impl fmt::Display for Conf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, &v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            if v == UNASSIGNED {
                write!(f, "*")?;
            } else {
                write!(f, "{v}")?;
            }
        }
        write!(f, "]")
    }
}

/// An owned cursor decomposing a conformation into defined and undefined positions.
///
/// Both lists stay sorted by position. `assign_in_place` and `unassign_in_place`
/// are exact inverses, which lets recursive enumeration walk a subtree with a
/// single cursor instead of rebuilding the decomposition at every level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfIndex {
    defined: Vec<(usize, usize)>,
    undefined: Vec<usize>,
}

impl ConfIndex {
    pub fn new(conf: &Conf) -> Self {
        let mut defined = Vec::with_capacity(conf.len());
        let mut undefined = Vec::with_capacity(conf.len());
        for pos in 0..conf.len() {
            match conf.get(pos) {
                Some(choice) => defined.push((pos, choice)),
                None => undefined.push(pos),
            }
        }
        Self { defined, undefined }
    }

    #[inline]
    pub fn defined(&self) -> &[(usize, usize)] {
        &self.defined
    }

    #[inline]
    pub fn undefined(&self) -> &[usize] {
        &self.undefined
    }

    #[inline]
    pub fn num_positions(&self) -> usize {
        self.defined.len() + self.undefined.len()
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.undefined.is_empty()
    }

    pub fn choice_at(&self, pos: usize) -> Option<usize> {
        self.defined
            .binary_search_by_key(&pos, |&(p, _)| p)
            .ok()
            .map(|i| self.defined[i].1)
    }

    pub fn assign_in_place(&mut self, pos: usize, choice: usize) -> Result<(), ConfError> {
        let slot = match self.undefined.binary_search(&pos) {
            Ok(slot) => slot,
            Err(_) => {
                return match self.choice_at(pos) {
                    Some(choice) => Err(ConfError::AlreadyAssigned { pos, choice }),
                    None => Err(ConfError::PositionOutOfRange {
                        pos,
                        len: self.num_positions(),
                    }),
                };
            }
        };
        self.undefined.remove(slot);
        let insert_at = self.defined.partition_point(|&(p, _)| p < pos);
        self.defined.insert(insert_at, (pos, choice));
        Ok(())
    }

    pub fn unassign_in_place(&mut self, pos: usize) -> Result<usize, ConfError> {
        let slot = self
            .defined
            .binary_search_by_key(&pos, |&(p, _)| p)
            .map_err(|_| ConfError::NotAssigned { pos })?;
        let (_, choice) = self.defined.remove(slot);
        let insert_at = self.undefined.partition_point(|&p| p < pos);
        self.undefined.insert(insert_at, pos);
        Ok(choice)
    }

    /// Materializes the cursor back into a conformation.
    pub fn to_conf(&self) -> Conf {
        let mut values = vec![UNASSIGNED; self.num_positions()];
        for &(pos, choice) in &self.defined {
            values[pos] = choice as i32;
        }
        Conf::from_raw(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_returns_new_conf_and_leaves_original_untouched() {
        let root = Conf::unassigned(3);
        let child = root.assign(1, 4).unwrap();
        assert_eq!(root.num_defined(), 0);
        assert_eq!(child.get(1), Some(4));
        assert_eq!(child.get(0), None);
    }

    #[test]
    fn assign_fails_on_defined_position() {
        let conf = Conf::unassigned(2).assign(0, 1).unwrap();
        assert_eq!(
            conf.assign(0, 0),
            Err(ConfError::AlreadyAssigned { pos: 0, choice: 1 })
        );
    }

    #[test]
    fn assign_fails_on_out_of_range_position() {
        assert_eq!(
            Conf::unassigned(2).assign(5, 0),
            Err(ConfError::PositionOutOfRange { pos: 5, len: 2 })
        );
    }

    #[test]
    fn is_complete_requires_every_position() {
        let conf = Conf::unassigned(2).assign(0, 0).unwrap();
        assert!(!conf.is_complete());
        assert!(conf.assign(1, 1).unwrap().is_complete());
        assert!(Conf::from_choices(&[0, 2, 1]).unwrap().is_complete());
    }

    #[test]
    fn display_marks_unassigned_positions() {
        let conf = Conf::unassigned(3).assign(1, 2).unwrap();
        assert_eq!(conf.to_string(), "[* 2 *]");
    }

    #[test]
    fn index_splits_defined_and_undefined_positions() {
        let conf = Conf::from_raw(vec![UNASSIGNED, 3, UNASSIGNED, 0]);
        let index = ConfIndex::new(&conf);
        assert_eq!(index.defined(), &[(1, 3), (3, 0)]);
        assert_eq!(index.undefined(), &[0, 2]);
        assert_eq!(index.choice_at(3), Some(0));
        assert_eq!(index.choice_at(0), None);
    }

    #[test]
    fn assign_and_unassign_in_place_are_inverses() {
        let conf = Conf::from_raw(vec![UNASSIGNED, 3, UNASSIGNED, 0]);
        let original = ConfIndex::new(&conf);
        let mut index = original.clone();

        index.assign_in_place(2, 7).unwrap();
        assert_eq!(index.defined(), &[(1, 3), (2, 7), (3, 0)]);
        assert_eq!(index.to_conf(), conf.assign(2, 7).unwrap());

        assert_eq!(index.unassign_in_place(2).unwrap(), 7);
        assert_eq!(index, original);
    }

    #[test]
    fn assign_in_place_rejects_defined_position() {
        let mut index = ConfIndex::new(&Conf::from_raw(vec![1, UNASSIGNED]));
        assert_eq!(
            index.assign_in_place(0, 2),
            Err(ConfError::AlreadyAssigned { pos: 0, choice: 1 })
        );
        assert_eq!(
            index.unassign_in_place(1),
            Err(ConfError::NotAssigned { pos: 1 })
        );
    }
}
