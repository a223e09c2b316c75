use thiserror::Error;
use zbound::core::models::sequence::{SeqSpace, Sequence};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid --set format: '{0}'. Expected KEY=VALUE.")]
    InvalidKeyValue(String),

    #[error(
        "Sequence '{text}' names {found} residue types, but the space has {expected} sequence positions."
    )]
    SequenceLength {
        text: String,
        found: usize,
        expected: usize,
    },

    #[error("Sequence '{text}': '{token}' is not a residue type of position {position}.")]
    UnknownResidueType {
        text: String,
        token: String,
        position: usize,
    },
}

/// Splits `KEY=VALUE` at the first `=`.
pub fn parse_key_value(pair: &str) -> Result<(&str, &str), ParseError> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => Ok((key.trim(), value.trim())),
        _ => Err(ParseError::InvalidKeyValue(pair.to_string())),
    }
}

/// Parses residue types separated by spaces or commas, one per sequence
/// position; `*` leaves a position open.
pub fn parse_sequence(seq_space: &SeqSpace, text: &str) -> Result<Sequence, ParseError> {
    let tokens: Vec<&str> = text
        .split([',', ' '])
        .filter(|t| !t.is_empty())
        .collect();
    if tokens.len() != seq_space.len() {
        return Err(ParseError::SequenceLength {
            text: text.to_string(),
            found: tokens.len(),
            expected: seq_space.len(),
        });
    }
    let joined = tokens.join(" ");
    seq_space.parse_sequence(&joined).ok_or_else(|| {
        let (position, token) = tokens
            .iter()
            .enumerate()
            .find(|(pos, token)| **token != "*" && seq_space.label_index(*pos, token).is_none())
            .map(|(pos, token)| (pos, token.to_string()))
            .unwrap_or_default();
        ParseError::UnknownResidueType {
            text: text.to_string(),
            token,
            position,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use zbound::core::models::sequence::{SeqPosition, WILDCARD};

    fn seq_space() -> SeqSpace {
        SeqSpace::new(vec![
            SeqPosition {
                name: "A1".to_string(),
                labels: vec!["ALA".to_string(), "GLY".to_string()],
            },
            SeqPosition {
                name: "B2".to_string(),
                labels: vec!["SER".to_string(), "THR".to_string()],
            },
        ])
    }

    #[test]
    fn key_value_pairs_split_at_the_first_equals_sign() {
        assert_eq!(parse_key_value("a.b=c=d"), Ok(("a.b", "c=d")));
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=1").is_err());
    }

    #[test]
    fn sequences_accept_spaces_commas_and_wildcards() {
        let space = seq_space();
        let seq = parse_sequence(&space, "GLY, THR").unwrap();
        assert_eq!(seq.labels(), &[1, 1]);
        let open = parse_sequence(&space, "ALA *").unwrap();
        assert_eq!(open.labels(), &[0, WILDCARD]);
    }

    #[test]
    fn unknown_residue_types_and_wrong_lengths_are_reported() {
        let space = seq_space();
        assert_eq!(
            parse_sequence(&space, "ALA"),
            Err(ParseError::SequenceLength {
                text: "ALA".to_string(),
                found: 1,
                expected: 2,
            })
        );
        assert_eq!(
            parse_sequence(&space, "ALA TRP"),
            Err(ParseError::UnknownResidueType {
                text: "ALA TRP".to_string(),
                token: "TRP".to_string(),
                position: 1,
            })
        );
    }
}
