//! Identity of a measured isotope/mass position.
//!
//! Channels are ordered with an "intuitive" alphanumeric comparison so that
//! `Pb204` sorts before `Pb206` and `Ch9` sorts before `Ch10`.
use std::cmp::Ordering;
use std::fmt::Display;
use std::str::Chars;
use std::iter::Peekable;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// A named detector channel, e.g. `Pb206` or `U238`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Channel {
    name: String,
}

impl Channel {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Channel {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Channel {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl PartialOrd for Channel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Channel {
    fn cmp(&self, other: &Self) -> Ordering {
        intuitive_cmp(&self.name, &other.name)
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    Digits(String),
    Text(String),
}

fn next_chunk(chars: &mut Peekable<Chars>) -> Option<Chunk> {
    let first = *chars.peek()?;
    let digits = first.is_ascii_digit();
    let mut buf = String::new();
    while let Some(c) = chars.peek() {
        if c.is_ascii_digit() != digits {
            break;
        }
        buf.push(*c);
        chars.next();
    }
    if digits {
        Some(Chunk::Digits(buf))
    } else {
        Some(Chunk::Text(buf))
    }
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a_trim = a.trim_start_matches('0');
    let b_trim = b.trim_start_matches('0');
    a_trim
        .len()
        .cmp(&b_trim.len())
        .then_with(|| a_trim.cmp(b_trim))
}

/// Compare two strings treating runs of digits as numbers and
/// ignoring case in the remaining text. Falls back to plain lexical
/// order so that distinct strings never compare equal.
pub fn intuitive_cmp(a: &str, b: &str) -> Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (next_chunk(&mut ai), next_chunk(&mut bi)) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                let ord = match (&x, &y) {
                    (Chunk::Digits(p), Chunk::Digits(q)) => compare_digit_runs(p, q),
                    (Chunk::Text(p), Chunk::Text(q)) => {
                        p.to_lowercase().cmp(&q.to_lowercase())
                    }
                    (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
                    (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_natural_order() {
        let mut channels: Vec<Channel> = ["U238", "Pb206", "Ch10", "Pb204", "Ch9", "Hg202"]
            .into_iter()
            .map(Channel::from)
            .collect();
        channels.sort();
        let names: Vec<_> = channels.iter().map(|c| c.name()).collect();
        assert_eq!(names, ["Ch9", "Ch10", "Hg202", "Pb204", "Pb206", "U238"]);
    }

    #[test]
    fn test_case_and_ties() {
        assert_eq!(intuitive_cmp("pb206", "Pb207"), Ordering::Less);
        assert_ne!(intuitive_cmp("Pb206", "pb206"), Ordering::Equal);
        assert_eq!(intuitive_cmp("Pb206", "Pb206"), Ordering::Equal);
        assert_eq!(intuitive_cmp("Pb06", "Pb6"), "Pb06".cmp("Pb6"));
        assert_eq!(intuitive_cmp("Pb", "Pb206"), Ordering::Less);
    }
}
