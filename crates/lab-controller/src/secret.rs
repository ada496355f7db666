//! Expected-state materializer
//!
//! Moves plaintext `expected`/`expectedFile` out of the Lab spec into a
//! Secret owned by the Lab, then rewrites the spec to reference it. Running
//! it again for the same content writes nothing.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::Resource;
use serde_json::json;
use tracing::{debug, info};

use lab_common::crd::Lab;
use lab_common::kube_utils::deterministic_hash;
use lab_common::{
    Error, Step, EXPECTED_SECRET_KEY, LABEL_LAB_NAME, LABEL_MANAGED_BY,
    LABEL_MANAGED_BY_LAB_OPERATOR,
};

use crate::client::LabClient;
use crate::manifest::{
    lab_name, lab_namespace, read_expected_secret, ManifestResolver, ResourceKey,
};

/// Longest object name the API server accepts for a Secret
const MAX_NAME_LEN: usize = 253;

/// Name of the Secret holding a Lab's expected manifests
///
/// Derived from the Lab name so retries and teardown agree on it. Names that
/// would exceed the API limit are shortened with a hash suffix.
pub fn expected_secret_name(lab: &str) -> String {
    let name = format!("lab-{}-expected", lab);
    if name.len() <= MAX_NAME_LEN {
        return name;
    }
    let hash = deterministic_hash(lab);
    // "lab-" + prefix + "-" + hash + "-expected"
    let keep = MAX_NAME_LEN - "lab--".len() - hash.len() - "-expected".len();
    let prefix: String = lab.chars().take(keep).collect();
    format!("lab-{}-{}-expected", prefix.trim_end_matches(['-', '.']), hash)
}

/// Result of materializing the expected manifests
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Materialized {
    /// Expected manifest text now stored in the Secret
    pub expected_text: String,
    /// Whether this call moved plaintext out of the spec
    pub migrated: bool,
}

/// Build the Secret holding `text` for a Lab
pub fn build_expected_secret(lab: &Lab, text: &str) -> Secret {
    let name = lab_name(lab);
    let labels = BTreeMap::from([
        (
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_LAB_OPERATOR.to_string(),
        ),
        (LABEL_LAB_NAME.to_string(), name.clone()),
    ]);
    Secret {
        metadata: ObjectMeta {
            name: Some(expected_secret_name(&name)),
            namespace: Some(lab_namespace(lab)),
            labels: Some(labels),
            owner_references: lab.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(BTreeMap::from([(
            EXPECTED_SECRET_KEY.to_string(),
            ByteString(text.as_bytes().to_vec()),
        )])),
        ..Default::default()
    }
}

fn secret_holds(secret: &Secret, text: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(EXPECTED_SECRET_KEY))
        .is_some_and(|b| b.0 == text.as_bytes())
}

/// Ensure the Lab's expected manifests live in a Secret
///
/// If the spec already references a Secret, its content is read back and
/// nothing is written. Otherwise the plaintext is stored (skipping the write
/// when an identical Secret already exists) and the spec is rewritten to
/// drop the plaintext in favor of `expectedRef`.
pub async fn materialize_expected(
    lab: &Lab,
    client: &dyn LabClient,
    resolver: &ManifestResolver,
) -> Result<Materialized, Error> {
    let Some(text) = resolver.plaintext_expected_text(lab).await? else {
        let expected_ref = lab.spec.expected_ref.as_ref().ok_or_else(|| {
            Error::validation_for_field(lab_name(lab), "spec.expectedRef", "missing")
        })?;
        let expected_text = read_expected_secret(client, lab, expected_ref).await?;
        return Ok(Materialized {
            expected_text,
            migrated: false,
        });
    };

    let name = lab_name(lab);
    let namespace = lab_namespace(lab);
    let secret_name = expected_secret_name(&name);
    let secret_key = ResourceKey::secret(&namespace, &secret_name);
    let tag = |e: Error| Error::at_step(Step::Materialize, secret_key.to_string(), e);

    let existing = client.get_secret(&namespace, &secret_name).await.map_err(tag)?;
    if existing.as_ref().is_some_and(|s| secret_holds(s, &text)) {
        debug!(secret = %secret_key, "expected secret already up to date");
    } else {
        client
            .apply_secret(&build_expected_secret(lab, &text))
            .await
            .map_err(tag)?;
        info!(secret = %secret_key, "stored expected manifests");
    }

    let patch = json!({
        "spec": {
            "expected": null,
            "expectedFile": null,
            "expectedRef": {
                "secretName": secret_name,
                "key": EXPECTED_SECRET_KEY,
            }
        }
    });
    client
        .patch_lab(&namespace, &name, &patch)
        .await
        .map_err(|e| Error::at_step(Step::Materialize, format!("Lab {}/{}", namespace, name), e))?;
    info!(lab = %name, "removed plaintext expected manifests from spec");

    Ok(Materialized {
        expected_text: text,
        migrated: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLabClient;
    use lab_common::crd::{ExpectedRef, LabSpec};

    const EXPECTED: &str = "apiVersion: v1\nkind: Pod\nmetadata:\n  name: busybox\n";

    fn lab(spec: LabSpec) -> Lab {
        let mut lab = Lab::new("debug-pod", spec);
        lab.metadata.namespace = Some("training".to_string());
        lab.metadata.uid = Some("uid-1".to_string());
        lab
    }

    fn plaintext_lab() -> Lab {
        lab(LabSpec {
            task: "t".to_string(),
            given: Some(String::new()),
            expected: Some(EXPECTED.to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn secret_name_is_derived_from_lab() {
        assert_eq!(expected_secret_name("debug-pod"), "lab-debug-pod-expected");
    }

    #[test]
    fn long_secret_names_are_shortened_deterministically() {
        let long = "a".repeat(300);
        let name = expected_secret_name(&long);
        assert!(name.len() <= MAX_NAME_LEN);
        assert!(name.starts_with("lab-a"));
        assert!(name.ends_with("-expected"));
        assert_eq!(name, expected_secret_name(&long));
        assert_ne!(name, expected_secret_name(&"a".repeat(299)));
    }

    #[test]
    fn built_secret_is_owned_and_labeled() {
        let secret = build_expected_secret(&plaintext_lab(), EXPECTED);
        assert_eq!(secret.metadata.name.as_deref(), Some("lab-debug-pod-expected"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("training"));
        let owners = secret.metadata.owner_references.unwrap();
        assert_eq!(owners[0].kind, "Lab");
        assert_eq!(owners[0].uid, "uid-1");
        assert!(secret_holds(
            &build_expected_secret(&plaintext_lab(), EXPECTED),
            EXPECTED
        ));
        assert_eq!(
            secret.metadata.labels.unwrap()[LABEL_MANAGED_BY],
            LABEL_MANAGED_BY_LAB_OPERATOR
        );
    }

    #[tokio::test]
    async fn migrates_plaintext_into_secret() {
        let mut client = MockLabClient::new();
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_apply_secret()
            .times(1)
            .withf(|s| secret_holds(s, EXPECTED))
            .returning(|_| Ok(()));
        client
            .expect_patch_lab()
            .times(1)
            .withf(|ns, name, patch| {
                ns.to_string() == "training"
                    && name.to_string() == "debug-pod"
                    && patch["spec"]["expected"].is_null()
                    && patch["spec"]["expectedRef"]["secretName"] == "lab-debug-pod-expected"
            })
            .returning(|_, _, _| Ok(()));

        let resolver = ManifestResolver::new("/nonexistent");
        let result = materialize_expected(&plaintext_lab(), &client, &resolver)
            .await
            .unwrap();
        assert!(result.migrated);
        assert_eq!(result.expected_text, EXPECTED);
    }

    #[tokio::test]
    async fn migrates_expected_file_into_secret() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("pods")).unwrap();
        std::fs::write(root.path().join("pods/expected.yaml"), EXPECTED).unwrap();
        let file_lab = lab(LabSpec {
            task: "t".to_string(),
            given: Some(String::new()),
            expected_file: Some("pods/expected.yaml".to_string()),
            ..Default::default()
        });

        let mut client = MockLabClient::new();
        client.expect_get_secret().returning(|_, _| Ok(None));
        client
            .expect_apply_secret()
            .times(1)
            .withf(|s| secret_holds(s, EXPECTED))
            .returning(|_| Ok(()));
        client
            .expect_patch_lab()
            .times(1)
            .withf(|_, _, patch| {
                patch["spec"].get("expectedFile") == Some(&serde_json::Value::Null)
                    && patch["spec"].get("expected") == Some(&serde_json::Value::Null)
                    && patch["spec"]["expectedRef"]["key"] == EXPECTED_SECRET_KEY
            })
            .returning(|_, _, _| Ok(()));

        let resolver = ManifestResolver::new(root.path());
        let result = materialize_expected(&file_lab, &client, &resolver)
            .await
            .unwrap();
        assert!(result.migrated);
        assert_eq!(result.expected_text, EXPECTED);
    }

    #[tokio::test]
    async fn missing_expected_file_writes_nothing() {
        let root = tempfile::tempdir().unwrap();
        let file_lab = lab(LabSpec {
            task: "t".to_string(),
            given: Some(String::new()),
            expected_file: Some("pods/expected.yaml".to_string()),
            ..Default::default()
        });
        let mut client = MockLabClient::new();
        client.expect_apply_secret().never();
        client.expect_patch_lab().never();

        let resolver = ManifestResolver::new(root.path());
        let err = materialize_expected(&file_lab, &client, &resolver)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn identical_secret_is_not_rewritten() {
        let lab = plaintext_lab();
        let existing = build_expected_secret(&lab, EXPECTED);
        let mut client = MockLabClient::new();
        client
            .expect_get_secret()
            .returning(move |_, _| Ok(Some(existing.clone())));
        client.expect_apply_secret().never();
        client.expect_patch_lab().times(1).returning(|_, _, _| Ok(()));

        let resolver = ManifestResolver::new("/nonexistent");
        let result = materialize_expected(&lab, &client, &resolver).await.unwrap();
        assert!(result.migrated);
    }

    #[tokio::test]
    async fn already_migrated_lab_reads_secret_and_writes_nothing() {
        let migrated = lab(LabSpec {
            task: "t".to_string(),
            given: Some(String::new()),
            expected_ref: Some(ExpectedRef {
                secret_name: "lab-debug-pod-expected".to_string(),
                key: EXPECTED_SECRET_KEY.to_string(),
            }),
            ..Default::default()
        });
        let existing = build_expected_secret(&migrated, EXPECTED);
        let mut client = MockLabClient::new();
        client
            .expect_get_secret()
            .returning(move |_, _| Ok(Some(existing.clone())));
        client.expect_apply_secret().never();
        client.expect_patch_lab().never();

        let resolver = ManifestResolver::new("/nonexistent");
        let result = materialize_expected(&migrated, &client, &resolver)
            .await
            .unwrap();
        assert!(!result.migrated);
        assert_eq!(result.expected_text, EXPECTED);
    }

    #[tokio::test]
    async fn missing_referenced_secret_is_input_error() {
        let migrated = lab(LabSpec {
            task: "t".to_string(),
            given: Some(String::new()),
            expected_ref: Some(ExpectedRef {
                secret_name: "nope".to_string(),
                key: EXPECTED_SECRET_KEY.to_string(),
            }),
            ..Default::default()
        });
        let mut client = MockLabClient::new();
        client.expect_get_secret().returning(|_, _| Ok(None));

        let resolver = ManifestResolver::new("/nonexistent");
        let err = materialize_expected(&migrated, &client, &resolver)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("nope"));
    }
}
