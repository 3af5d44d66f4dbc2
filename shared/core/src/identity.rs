use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Identity of one logical training job. Also used as the top-level prefix of
/// everything the job writes to remote storage, so it must be path-safe.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(String);

#[derive(Error, Debug, PartialEq)]
pub enum InvalidJobId {
    #[error("job id is empty")]
    Empty,

    #[error("job id {0:?} contains characters outside [A-Za-z0-9._-]")]
    InvalidCharacters(String),

    #[error("job id {0:?} may not start with '.'")]
    LeadingDot(String),
}

impl JobId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidJobId> {
        let id = id.into();
        if id.is_empty() {
            return Err(InvalidJobId::Empty);
        }
        if id.starts_with('.') {
            return Err(InvalidJobId::LeadingDot(id));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        {
            return Err(InvalidJobId::InvalidCharacters(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = InvalidJobId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for JobId {
    type Error = InvalidJobId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.0
    }
}

/// Ordinal identity of one worker process within a job's topology.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Rank(pub u32);

impl Rank {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Rank {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_job_ids() {
        for id in ["gemma2-9b", "run_01", "a.b.c", "X"] {
            assert_eq!(JobId::new(id).unwrap().as_str(), id);
        }
    }

    #[test]
    fn test_invalid_job_ids() {
        assert_eq!(JobId::new(""), Err(InvalidJobId::Empty));
        assert!(matches!(
            JobId::new("a/b"),
            Err(InvalidJobId::InvalidCharacters(_))
        ));
        assert!(matches!(
            JobId::new("..escape"),
            Err(InvalidJobId::LeadingDot(_))
        ));
    }

    #[test]
    fn test_job_id_serde_validates() {
        let id: JobId = serde_json::from_str("\"finetune-7\"").unwrap();
        assert_eq!(id.to_string(), "finetune-7");
        assert!(serde_json::from_str::<JobId>("\"bad id\"").is_err());
    }
}
