//! Artifact identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Source platform an artifact lives on.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactNamespace {
    Github,
    Gitlab,
    NpmRegistry,
    Ethereum,
    Optimism,
    Goerli,
}

impl ArtifactNamespace {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Kind of artifact within a namespace.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArtifactType {
    GitRepository,
    GitEmail,
    GitName,
    GithubOrg,
    GithubUser,
    EoaAddress,
    SafeAddress,
    ContractAddress,
    FactoryAddress,
    NpmPackage,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

/// Identity of an artifact that may or may not be persisted yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub namespace: ArtifactNamespace,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub name: String,
}

impl ArtifactKey {
    pub fn new(
        namespace: ArtifactNamespace,
        artifact_type: ArtifactType,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace,
            artifact_type,
            name: name.into(),
        }
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.artifact_type, self.name)
    }
}

/// A persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: i64,
    pub namespace: ArtifactNamespace,
    #[serde(rename = "type")]
    pub artifact_type: ArtifactType,
    pub name: String,
}

impl Artifact {
    pub fn key(&self) -> ArtifactKey {
        ArtifactKey::new(self.namespace, self.artifact_type, self.name.clone())
    }
}

/// Namespaces and types an operation is allowed to touch.
///
/// An empty list on either side means "no restriction" for that side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactScope {
    pub namespaces: Vec<ArtifactNamespace>,
    pub types: Vec<ArtifactType>,
}

impl ArtifactScope {
    pub fn new(namespaces: Vec<ArtifactNamespace>, types: Vec<ArtifactType>) -> Self {
        Self { namespaces, types }
    }

    pub fn allows(&self, key: &ArtifactKey) -> bool {
        (self.namespaces.is_empty() || self.namespaces.contains(&key.namespace))
            && (self.types.is_empty() || self.types.contains(&key.artifact_type))
    }
}
