//! Agent identifier syntax: `[publisher/]id[@version]`.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Version selector for a published agent template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSpec {
    Latest,
    /// A concrete semver, kept verbatim.
    Exact(String),
}

impl fmt::Display for VersionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latest => write!(f, "latest"),
            Self::Exact(v) => write!(f, "{v}"),
        }
    }
}

/// Parsed agent identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentifier {
    pub publisher: Option<String>,
    pub id: String,
    pub version: Option<VersionSpec>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentifierError {
    #[error("empty agent identifier")]
    Empty,
    #[error("malformed agent identifier '{0}'")]
    Malformed(String),
    #[error("invalid version '{version}' in '{identifier}'")]
    InvalidVersion { identifier: String, version: String },
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
}

fn is_semver(version: &str) -> bool {
    let parts: Vec<&str> = version.split('.').collect();
    parts.len() == 3 && parts.iter().all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

impl AgentIdentifier {
    /// Parse `[publisher/]id[@version]` where version is a semver or `latest`.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(IdentifierError::Empty);
        }

        let (path, version) = match input.split_once('@') {
            Some((path, version)) => {
                let spec = if version == "latest" {
                    VersionSpec::Latest
                } else if is_semver(version) {
                    VersionSpec::Exact(version.to_string())
                } else {
                    return Err(IdentifierError::InvalidVersion {
                        identifier: input.to_string(),
                        version: version.to_string(),
                    });
                };
                (path, Some(spec))
            }
            None => (input, None),
        };

        let (publisher, id) = match path.split_once('/') {
            Some((publisher, id)) => (Some(publisher), id),
            None => (None, path),
        };

        if !is_valid_segment(id) || publisher.is_some_and(|p| !is_valid_segment(p)) {
            return Err(IdentifierError::Malformed(input.to_string()));
        }

        Ok(Self {
            publisher: publisher.map(str::to_string),
            id: id.to_string(),
            version,
        })
    }
}

impl fmt::Display for AgentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(publisher) = &self.publisher {
            write!(f, "{publisher}/")?;
        }
        write!(f, "{}", self.id)?;
        if let Some(version) = &self.version {
            write!(f, "@{version}")?;
        }
        Ok(())
    }
}
