//! Manifest resolution
//!
//! Turns a Lab's `given`/`givenFile` and `expected`/`expectedFile`/`expectedRef`
//! into ordered lists of [`ManifestDocument`]s. Source order is preserved
//! because status entries are reported positionally.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde_json::Value;

use lab_common::crd::{ExpectedRef, ExpectedSource, Lab, ManifestSource};
use lab_common::yaml::parse_yaml_multi;
use lab_common::{Error, Step};

use crate::client::LabClient;

/// Identity of a resource in the cluster
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceKey {
    /// apiVersion, e.g. "apps/v1"
    pub api_version: String,
    /// Kind, e.g. "Deployment"
    pub kind: String,
    /// Namespace; None only for keys built outside a Lab context
    pub namespace: Option<String>,
    /// metadata.name
    pub name: String,
}

impl ResourceKey {
    /// Key for a namespaced core/v1 Secret
    pub fn secret(namespace: &str, name: &str) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Secret".to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// A single parsed resource definition
///
/// `body` is the document exactly as written; the defaulted namespace lives
/// only in `key` so comparisons never judge fields the author didn't write.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestDocument {
    /// Resource identity
    pub key: ResourceKey,
    /// Full document tree
    pub body: Value,
}

impl ManifestDocument {
    /// Build a document from a parsed YAML tree
    ///
    /// `index` is the document's position in its source, used in errors.
    pub fn from_value(
        lab: &str,
        index: usize,
        body: Value,
        default_namespace: &str,
    ) -> Result<Self, Error> {
        let Value::Object(map) = &body else {
            return Err(Error::manifest_at(
                lab,
                index,
                format!("document {} is not a mapping", index),
            ));
        };

        let required = |field: &str, value: Option<&Value>| -> Result<String, Error> {
            match value.and_then(Value::as_str) {
                Some(s) if !s.trim().is_empty() => Ok(s.to_string()),
                _ => Err(Error::manifest_at(
                    lab,
                    index,
                    format!("document {} is missing {}", index, field),
                )),
            }
        };

        let api_version = required("apiVersion", map.get("apiVersion"))?;
        let kind = required("kind", map.get("kind"))?;
        let name = required("metadata.name", body.pointer("/metadata/name"))?;
        let namespace = body
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .filter(|ns| !ns.is_empty())
            .unwrap_or(default_namespace)
            .to_string();

        Ok(Self {
            key: ResourceKey {
                api_version,
                kind,
                namespace: Some(namespace),
                name,
            },
            body,
        })
    }
}

/// Parse multi-document YAML text into manifest documents
///
/// Empty documents (e.g. a trailing `---`) are skipped. Any other document
/// that isn't a mapping with apiVersion, kind and metadata.name is an error.
pub fn parse_documents(
    lab: &str,
    text: &str,
    default_namespace: &str,
) -> Result<Vec<ManifestDocument>, Error> {
    let values = parse_yaml_multi(text)
        .map_err(|e| Error::manifest(lab, format!("invalid YAML: {}", e)))?;

    values
        .into_iter()
        .filter(|v| !v.is_null())
        .enumerate()
        .map(|(index, value)| ManifestDocument::from_value(lab, index, value, default_namespace))
        .collect()
}

/// Resolves Lab manifest sources to text and documents
///
/// File references are resolved under a fixed root; paths that are absolute
/// or climb out of the root are rejected.
#[derive(Clone, Debug)]
pub struct ManifestResolver {
    root: PathBuf,
}

impl ManifestResolver {
    /// Create a resolver sandboxed to `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Read a manifest file referenced by a Lab
    pub async fn read_file(&self, lab: &str, relative: &str) -> Result<String, Error> {
        let rel = Path::new(relative);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if relative.trim().is_empty() || escapes {
            return Err(Error::manifest(
                lab,
                format!(
                    "file reference {:?} must be a relative path inside the manifest root",
                    relative
                ),
            ));
        }

        let path = self.root.join(rel);
        // Symlinks inside the root may not point outside of it
        let canonical_root = tokio::fs::canonicalize(&self.root).await.map_err(|e| {
            Error::manifest(
                lab,
                format!("manifest root {} unavailable: {}", self.root.display(), e),
            )
        })?;
        let canonical = tokio::fs::canonicalize(&path)
            .await
            .map_err(|_| Error::manifest(lab, format!("manifest file {:?} not found", relative)))?;
        if !canonical.starts_with(&canonical_root) {
            return Err(Error::manifest(
                lab,
                format!("file reference {:?} resolves outside the manifest root", relative),
            ));
        }

        tokio::fs::read_to_string(&canonical)
            .await
            .map_err(|e| Error::manifest(lab, format!("failed to read {:?}: {}", relative, e)))
    }

    /// Text of the Lab's given manifests
    pub async fn given_text(&self, lab: &Lab) -> Result<String, Error> {
        let name = lab_name(lab);
        let source = lab
            .spec
            .given_source()
            .map_err(|msg| Error::validation_for_field(&name, "spec.given", msg))?;
        match source {
            ManifestSource::Inline(text) => Ok(text.to_string()),
            ManifestSource::File(path) => self.read_file(&name, path).await,
        }
    }

    /// Given manifests as documents
    pub async fn given_docs(&self, lab: &Lab) -> Result<Vec<ManifestDocument>, Error> {
        let text = self.given_text(lab).await?;
        parse_documents(&lab_name(lab), &text, &lab_namespace(lab))
    }

    /// Plaintext expected manifests still held in the spec, if any
    pub async fn plaintext_expected_text(&self, lab: &Lab) -> Result<Option<String>, Error> {
        let name = lab_name(lab);
        let source = lab
            .spec
            .expected_source()
            .map_err(|msg| Error::validation_for_field(&name, "spec.expected", msg))?;
        match source {
            ExpectedSource::Inline(text) => Ok(Some(text.to_string())),
            ExpectedSource::File(path) => self.read_file(&name, path).await.map(Some),
            ExpectedSource::Secret(_) => Ok(None),
        }
    }

    /// Text of the expected manifests, dereferencing `expectedRef` if set
    pub async fn expected_text(&self, lab: &Lab, client: &dyn LabClient) -> Result<String, Error> {
        if let Some(text) = self.plaintext_expected_text(lab).await? {
            return Ok(text);
        }
        match &lab.spec.expected_ref {
            Some(r) => read_expected_secret(client, lab, r).await,
            None => Err(Error::validation_for_field(
                lab_name(lab),
                "spec.expectedRef",
                "expected manifests are not defined",
            )),
        }
    }
}

/// Read the expected manifest text from the Secret named by `expectedRef`
///
/// A missing Secret or key is an input error; API failures keep their
/// retryability.
pub async fn read_expected_secret(
    client: &dyn LabClient,
    lab: &Lab,
    expected_ref: &ExpectedRef,
) -> Result<String, Error> {
    let name = lab_name(lab);
    let namespace = lab_namespace(lab);
    let secret = client
        .get_secret(&namespace, &expected_ref.secret_name)
        .await
        .map_err(|e| {
            Error::at_step(
                Step::Resolve,
                ResourceKey::secret(&namespace, &expected_ref.secret_name).to_string(),
                e,
            )
        })?
        .ok_or_else(|| {
            Error::validation_for_field(
                &name,
                "spec.expectedRef.secretName",
                format!("secret {} not found", expected_ref.secret_name),
            )
        })?;

    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(&expected_ref.key))
        .map(|b| b.0.clone())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|d| d.get(&expected_ref.key))
                .map(|s| s.clone().into_bytes())
        })
        .ok_or_else(|| {
            Error::validation_for_field(
                &name,
                "spec.expectedRef.key",
                format!(
                    "secret {} does not have key {}",
                    expected_ref.secret_name, expected_ref.key
                ),
            )
        })?;

    String::from_utf8(bytes).map_err(|_| {
        Error::validation_for_field(
            &name,
            "spec.expectedRef.key",
            format!("secret {} key {} is not UTF-8", expected_ref.secret_name, expected_ref.key),
        )
    })
}

/// Name of a Lab, for messages and derived names
pub fn lab_name(lab: &Lab) -> String {
    lab.metadata.name.clone().unwrap_or_default()
}

/// Namespace of a Lab, falling back to "default"
pub fn lab_namespace(lab: &Lab) -> String {
    lab.metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string())
}
