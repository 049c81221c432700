use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{CrnnError, Result};

/// Class 0: the CTC blank and the label padding value.
pub const BLANK_INDEX: i64 = 0;

/// Maps characters to class indices 1..=n.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Charset {
    chars: Vec<char>,
    index: HashMap<char, i64>,
}

impl Charset {
    pub fn new(chars: &str) -> Result<Self> {
        let chars: Vec<char> = chars.chars().collect();
        if chars.is_empty() {
            return Err(CrnnError::InvalidConfig("charset is empty".into()));
        }
        let mut index = HashMap::with_capacity(chars.len());
        for (i, c) in chars.iter().enumerate() {
            if index.insert(*c, i as i64 + 1).is_some() {
                return Err(CrnnError::InvalidConfig(format!("charset repeats {:?}", c)));
            }
        }
        Ok(Self { chars, index })
    }

    /// Sorted set of every character used by the labels.
    pub fn from_labels<'a, I>(labels: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut chars: Vec<char> = labels.into_iter().flat_map(|l| l.chars()).collect();
        chars.sort_unstable();
        chars.dedup();
        Self::new(&chars.into_iter().collect::<String>())
    }

    pub fn len(&self) -> usize {
        self.chars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// Characters plus the blank.
    pub fn num_classes(&self) -> usize {
        self.chars.len() + 1
    }

    pub fn index_of(&self, c: char) -> Option<i64> {
        self.index.get(&c).copied()
    }

    /// Class indices right-padded with [`BLANK_INDEX`] to `max_len`.
    pub fn encode(&self, label: &str, max_len: usize) -> Result<Vec<i64>> {
        let length = label.chars().count();
        if length > max_len {
            return Err(CrnnError::LabelTooLong {
                label: label.to_string(),
                length,
                max: max_len,
            });
        }
        let mut encoded = Vec::with_capacity(max_len);
        for c in label.chars() {
            let idx = self.index_of(c).ok_or_else(|| CrnnError::UnknownCharacter {
                label: label.to_string(),
                character: c,
            })?;
            encoded.push(idx);
        }
        encoded.resize(max_len, BLANK_INDEX);
        Ok(encoded)
    }

    /// Inverse of [`encode`](Self::encode); padding and unknown indices are skipped.
    pub fn decode(&self, indices: &[i64]) -> String {
        indices
            .iter()
            .filter(|&&i| i != BLANK_INDEX)
            .filter_map(|&i| usize::try_from(i - 1).ok().and_then(|i| self.chars.get(i)))
            .collect()
    }

    pub fn as_string(&self) -> String {
        self.chars.iter().collect()
    }
}

impl TryFrom<String> for Charset {
    type Error = CrnnError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(&value)
    }
}

impl From<Charset> for String {
    fn from(charset: Charset) -> Self {
        charset.as_string()
    }
}
