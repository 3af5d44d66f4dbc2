use kestrel_core::sha256;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
use thiserror::Error;

/// Location of a model artifact outside the local cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ArtifactRef {
    /// `hf://org/name[@revision]`
    Hub {
        repo: String,
        revision: Option<String>,
    },
    /// `gs://bucket[/prefix]`
    Gcs {
        bucket: String,
        prefix: Option<String>,
    },
    /// `file:///absolute/path`
    Local(PathBuf),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseArtifactError {
    #[error("artifact reference {0:?} has no scheme, expected hf://, gs:// or file://")]
    MissingScheme(String),

    #[error("unsupported artifact scheme {0:?}")]
    UnknownScheme(String),

    #[error("artifact reference {0:?} names no repository, bucket or path")]
    Empty(String),

    #[error("local artifact path {0:?} must be absolute")]
    NotAbsolute(String),
}

impl ArtifactRef {
    pub fn hub(repo: impl Into<String>) -> Self {
        Self::Hub {
            repo: repo.into(),
            revision: None,
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            Self::Hub { .. } => "hf",
            Self::Gcs { .. } => "gs",
            Self::Local(_) => "file",
        }
    }

    /// Stable, path-safe directory name for this artifact.
    pub fn cache_key(&self) -> String {
        let rendered = self.to_string();
        let body = rendered
            .split_once("://")
            .map_or(rendered.as_str(), |(_, body)| body);
        let mut readable: String = body
            .chars()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
                _ => '_',
            })
            .collect();
        readable = readable.trim_matches(|c| c == '_' || c == '.').to_owned();
        readable.truncate(64);
        let digest = hex::encode(&sha256(rendered.as_bytes())[..6]);
        format!("{}-{readable}-{digest}", self.scheme())
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub { repo, revision } => {
                write!(f, "hf://{repo}")?;
                if let Some(revision) = revision {
                    write!(f, "@{revision}")?;
                }
                Ok(())
            }
            Self::Gcs { bucket, prefix } => {
                write!(f, "gs://{bucket}")?;
                if let Some(prefix) = prefix {
                    write!(f, "/{prefix}")?;
                }
                Ok(())
            }
            Self::Local(path) => write!(f, "file://{}", path.display()),
        }
    }
}

impl FromStr for ArtifactRef {
    type Err = ParseArtifactError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, body) = s
            .split_once("://")
            .ok_or_else(|| ParseArtifactError::MissingScheme(s.to_owned()))?;
        let empty = || ParseArtifactError::Empty(s.to_owned());
        match scheme {
            "hf" => {
                let (repo, revision) = match body.split_once('@') {
                    Some((repo, revision)) if !revision.is_empty() => {
                        (repo, Some(revision.to_owned()))
                    }
                    Some(_) => return Err(empty()),
                    None => (body, None),
                };
                let repo = repo.trim_matches('/');
                if repo.is_empty() {
                    return Err(empty());
                }
                Ok(Self::Hub {
                    repo: repo.to_owned(),
                    revision,
                })
            }
            "gs" => {
                let (bucket, prefix) = match body.split_once('/') {
                    Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                    None => (body, ""),
                };
                if bucket.is_empty() {
                    return Err(empty());
                }
                Ok(Self::Gcs {
                    bucket: bucket.to_owned(),
                    prefix: (!prefix.is_empty()).then(|| prefix.to_owned()),
                })
            }
            "file" => {
                if body.is_empty() {
                    return Err(empty());
                }
                let path = Path::new(body);
                if !path.is_absolute() {
                    return Err(ParseArtifactError::NotAbsolute(body.to_owned()));
                }
                Ok(Self::Local(path.to_owned()))
            }
            other => Err(ParseArtifactError::UnknownScheme(other.to_owned())),
        }
    }
}

impl TryFrom<String> for ArtifactRef {
    type Error = ParseArtifactError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ArtifactRef> for String {
    fn from(value: ArtifactRef) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse() {
        assert_eq!(
            "hf://meta-llama/Llama-3.2-1B@main".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Hub {
                repo: "meta-llama/Llama-3.2-1B".into(),
                revision: Some("main".into()),
            }
        );
        assert_eq!(
            "gs://models/llama/8b/".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Gcs {
                bucket: "models".into(),
                prefix: Some("llama/8b".into()),
            }
        );
        assert_eq!(
            "gs://models".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::Gcs {
                bucket: "models".into(),
                prefix: None,
            }
        );
        assert_eq!(
            "file:///srv/models/tiny".parse::<ArtifactRef>().unwrap(),
            ArtifactRef::local("/srv/models/tiny")
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            "models/tiny".parse::<ArtifactRef>(),
            Err(ParseArtifactError::MissingScheme(_))
        ));
        assert!(matches!(
            "s3://bucket/x".parse::<ArtifactRef>(),
            Err(ParseArtifactError::UnknownScheme(s)) if s == "s3"
        ));
        assert!(matches!(
            "hf://org/name@".parse::<ArtifactRef>(),
            Err(ParseArtifactError::Empty(_))
        ));
        assert!(matches!(
            "file://relative/path".parse::<ArtifactRef>(),
            Err(ParseArtifactError::NotAbsolute(_))
        ));
    }

    #[test]
    fn test_display_roundtrip() {
        for s in [
            "hf://org/name",
            "hf://org/name@v1.0",
            "gs://bucket/some/prefix",
            "file:///tmp/model",
        ] {
            assert_eq!(s.parse::<ArtifactRef>().unwrap().to_string(), s);
        }
    }

    #[test]
    fn test_cache_key_is_stable_and_distinct() {
        let a: ArtifactRef = "hf://org/name@main".parse().unwrap();
        let b: ArtifactRef = "hf://org/name@dev".parse().unwrap();
        assert_eq!(a.cache_key(), a.clone().cache_key());
        assert_ne!(a.cache_key(), b.cache_key());
        assert!(a.cache_key().starts_with("hf-org_name_main-"));
        assert!(a
            .cache_key()
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "._-".contains(c)));
    }
}
