//! State comparison
//!
//! An expected document matches a live object when every field the expected
//! document declares is present in the live object with an equal value.
//! Fields only the live object carries (status, defaults, managed metadata)
//! are ignored.
//!
//! Sequences compare positionally; every missing or extra element is a
//! mismatch at its index. A mapping the live object lacks is reported at
//! each expected leaf beneath it, not at the mapping itself. Scalars
//! compare after normalization: numbers by numeric value (`1 == 1.0`), and a
//! string equals a number or bool whose textual form it parses as. Mismatch
//! entries are field paths only, so the solution never leaks through status.

use base64::Engine;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use lab_common::crd::{ResourceState, ResourceStatus};
use lab_common::{Error, Step};

use crate::client::LabClient;
use crate::manifest::{ManifestDocument, ResourceKey};

/// Mismatch entry reported when the live object does not exist
pub const RESOURCE_NOT_FOUND: &str = "resource not found";

/// Outcome of comparing one expected document against one live object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ComparisonResult {
    /// Whether every expected field matched
    pub matched: bool,
    /// Diverging field paths, in document order
    pub mismatches: Vec<String>,
}

#[derive(Clone, Debug)]
enum Segment<'a> {
    Key(&'a str),
    Index(usize),
}

fn render(path: &[Segment<'_>]) -> String {
    let mut out = String::new();
    for seg in path {
        match seg {
            Segment::Key(k) if needs_quoting(k) => {
                out.push_str("[\"");
                out.push_str(k);
                out.push_str("\"]");
            }
            Segment::Key(k) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(k);
            }
            Segment::Index(i) => {
                out.push('[');
                out.push_str(&i.to_string());
                out.push(']');
            }
        }
    }
    out
}

fn needs_quoting(key: &str) -> bool {
    key.is_empty() || key.contains(['.', '[', ']', '"'])
}

/// Compare an expected tree against a live tree
///
/// Pure: the result depends only on the two inputs.
pub fn compare(expected: &Value, live: &Value) -> ComparisonResult {
    let mut path = Vec::new();
    let mut mismatches = Vec::new();
    walk(expected, Some(live), &mut path, &mut mismatches);
    ComparisonResult {
        matched: mismatches.is_empty(),
        mismatches,
    }
}

fn walk<'a>(
    expected: &'a Value,
    live: Option<&Value>,
    path: &mut Vec<Segment<'a>>,
    out: &mut Vec<String>,
) {
    match expected {
        Value::Object(exp) => match live {
            Some(Value::Object(live)) => {
                for (key, value) in exp {
                    path.push(Segment::Key(key));
                    walk(value, live.get(key), path, out);
                    path.pop();
                }
            }
            // The API server drops emptied maps, so descend to the leaves
            None | Some(Value::Null) => {
                for (key, value) in exp {
                    path.push(Segment::Key(key));
                    walk(value, None, path, out);
                    path.pop();
                }
            }
            _ => out.push(render(path)),
        },
        Value::Array(exp) => match live {
            Some(Value::Array(live)) => {
                for (i, e) in exp.iter().enumerate() {
                    path.push(Segment::Index(i));
                    match live.get(i) {
                        Some(l) => walk(e, Some(l), path, out),
                        None => walk_missing(e, path, out),
                    }
                    path.pop();
                }
                for i in exp.len()..live.len() {
                    path.push(Segment::Index(i));
                    out.push(render(path));
                    path.pop();
                }
            }
            None | Some(Value::Null) => {
                for (i, e) in exp.iter().enumerate() {
                    path.push(Segment::Index(i));
                    walk_missing(e, path, out);
                    path.pop();
                }
            }
            _ => out.push(render(path)),
        },
        Value::Null => {
            if !matches!(live, None | Some(Value::Null)) {
                out.push(render(path));
            }
        }
        scalar => {
            if !live.is_some_and(|l| scalars_equal(scalar, l)) {
                out.push(render(path));
            }
        }
    }
}

/// A sequence element with no live counterpart is always a mismatch, at its
/// leaves when it has any and at the element otherwise
fn walk_missing<'a>(expected: &'a Value, path: &mut Vec<Segment<'a>>, out: &mut Vec<String>) {
    let before = out.len();
    walk(expected, None, path, out);
    if out.len() == before {
        out.push(render(path));
    }
}

/// Scalar equality after normalization
pub fn scalars_equal(expected: &Value, live: &Value) -> bool {
    match (expected, live) {
        (Value::Number(a), Value::Number(b)) => numbers_equal(a, b),
        (Value::Number(n), Value::String(s)) | (Value::String(s), Value::Number(n)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .zip(n.as_f64())
            .is_some_and(|(a, b)| a == b),
        (Value::Bool(b), Value::String(s)) | (Value::String(s), Value::Bool(b)) => {
            s.trim() == b.to_string()
        }
        (a, b) => a == b,
    }
}

fn numbers_equal(a: &serde_json::Number, b: &serde_json::Number) -> bool {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_u64(), b.as_u64()) {
        return x == y;
    }
    matches!((a.as_f64(), b.as_f64()), (Some(x), Some(y)) if x == y)
}

/// The tree a live object is judged against for one expected document
///
/// The API server never returns a Secret's `stringData`; it is folded into
/// base64 `data` so expected Secrets can be written either way.
pub fn comparable_body(doc: &ManifestDocument) -> Value {
    if doc.key.api_version != "v1" || doc.key.kind != "Secret" {
        return doc.body.clone();
    }
    let mut body = doc.body.clone();
    let Some(obj) = body.as_object_mut() else {
        return body;
    };
    let Some(Value::Object(string_data)) = obj.remove("stringData") else {
        return body;
    };

    let data = obj
        .entry("data")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(data) = data {
        for (k, v) in string_data {
            let text = match v {
                Value::String(s) => s,
                other => other.to_string(),
            };
            data.insert(
                k,
                Value::String(base64::engine::general_purpose::STANDARD.encode(text)),
            );
        }
    }
    body
}

/// Judgement for one expected document
#[derive(Clone, Debug, PartialEq)]
pub enum Judgement {
    /// The live object was read and compared
    Compared(ComparisonResult),
    /// The live object does not exist
    NotFound,
    /// The live object could not be read for a reason a retry won't fix
    Unreadable(String),
}

/// Per-resource verdict in expected-document order
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceJudgement {
    /// Resource identity
    pub key: ResourceKey,
    /// What was found
    pub judgement: Judgement,
}

impl ResourceJudgement {
    /// Whether this resource counts as matched
    pub fn matched(&self) -> bool {
        matches!(&self.judgement, Judgement::Compared(r) if r.matched)
    }

    /// Status entry for this resource
    pub fn to_status(&self) -> ResourceStatus {
        let (status, error, mismatches) = match &self.judgement {
            Judgement::Compared(r) if r.matched => (ResourceState::Matched, None, Vec::new()),
            Judgement::Compared(r) => (ResourceState::Mismatched, None, r.mismatches.clone()),
            Judgement::NotFound => (
                ResourceState::NotFound,
                None,
                vec![RESOURCE_NOT_FOUND.to_string()],
            ),
            Judgement::Unreadable(e) => (ResourceState::Error, Some(e.clone()), Vec::new()),
        };
        ResourceStatus {
            kind: self.key.kind.clone(),
            name: self.key.name.clone(),
            namespace: self.key.namespace.clone(),
            status,
            error,
            mismatches,
        }
    }
}

/// Fetch and judge every expected document
///
/// Transient fetch failures abort the pass so nothing partial is reported;
/// permanent ones (forbidden, unknown kind) are recorded on the resource and
/// count as unmatched.
pub async fn judge_all(
    client: &dyn LabClient,
    expected: &[ManifestDocument],
) -> Result<Vec<ResourceJudgement>, Error> {
    let mut out = Vec::with_capacity(expected.len());
    for doc in expected {
        let judgement = match client.get_resource(&doc.key).await {
            Ok(Some(live)) => Judgement::Compared(compare(&comparable_body(doc), &live)),
            Ok(None) => Judgement::NotFound,
            Err(e) if e.is_retryable() => {
                return Err(Error::at_step(Step::Fetch, doc.key.to_string(), e));
            }
            Err(e) => {
                warn!(resource = %doc.key, error = %e, "expected resource unreadable");
                Judgement::Unreadable(e.to_string())
            }
        };
        debug!(resource = %doc.key, ?judgement, "judged resource");
        out.push(ResourceJudgement {
            key: doc.key.clone(),
            judgement,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockLabClient;
    use crate::manifest::parse_documents;
    use serde_json::json;

    fn live_pod() -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "busybox",
                "namespace": "default",
                "uid": "1234",
                "resourceVersion": "42",
                "labels": {"app": "busybox", "app.kubernetes.io/name": "bb"}
            },
            "spec": {
                "containers": [{
                    "name": "busybox-container",
                    "image": "busybox",
                    "command": ["sleep", "3600"],
                    "resources": {}
                }],
                "restartPolicy": "Always"
            },
            "status": {"phase": "Running"}
        })
    }

    #[test]
    fn subset_matches_ignoring_extra_live_fields() {
        let expected = json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {"name": "busybox"},
            "spec": {"containers": [{
                "name": "busybox-container",
                "image": "busybox",
                "command": ["sleep", "3600"]
            }]}
        });
        let result = compare(&expected, &live_pod());
        assert!(result.matched, "{:?}", result.mismatches);
        assert!(result.mismatches.is_empty());
    }

    #[test]
    fn diverging_field_reports_its_path() {
        let expected = json!({
            "metadata": {"name": "busybox"},
            "spec": {"containers": [{"name": "busybox-lab"}]}
        });
        let result = compare(&expected, &live_pod());
        assert!(!result.matched);
        assert_eq!(result.mismatches, vec!["spec.containers[0].name"]);
    }

    #[test]
    fn mismatches_never_contain_expected_values() {
        let expected = json!({"spec": {"containers": [{"name": "the-secret-answer"}]}});
        let result = compare(&expected, &live_pod());
        assert!(result
            .mismatches
            .iter()
            .all(|m| !m.contains("the-secret-answer")));
    }

    #[test]
    fn shorter_live_sequence_reports_missing_index() {
        let expected = json!({"spec": {"containers": [{
            "name": "busybox-container",
            "command": ["sleep", "3600", "--verbose"]
        }]}});
        let result = compare(&expected, &live_pod());
        assert!(!result.matched);
        assert_eq!(result.mismatches, vec!["spec.containers[0].command[2]"]);
    }

    #[test]
    fn missing_sequence_element_reports_its_leaves() {
        let expected = json!({"spec": {"containers": [
            {"name": "busybox-container"},
            {"image": "envoy", "name": "sidecar"}
        ]}});
        assert_eq!(
            compare(&expected, &live_pod()).mismatches,
            vec!["spec.containers[1].image", "spec.containers[1].name"]
        );
    }

    #[test]
    fn missing_empty_sequence_element_still_mismatches() {
        let expected = json!({"spec": {"containers": [{"name": "busybox-container"}, {}]}});
        assert_eq!(
            compare(&expected, &live_pod()).mismatches,
            vec!["spec.containers[1]"]
        );
    }

    #[test]
    fn longer_live_sequence_reports_extra_index() {
        let expected = json!({"spec": {"containers": [{
            "name": "busybox-container",
            "command": ["sleep"]
        }]}});
        assert_eq!(
            compare(&expected, &live_pod()).mismatches,
            vec!["spec.containers[0].command[1]"]
        );
    }

    #[test]
    fn missing_parent_mapping_reports_the_leaf() {
        let expected = json!({"spec": {
            "nodeSelector": {"disk": "ssd"},
            "securityContext": {"runAsUser": 1000, "seccompProfile": {"type": "RuntimeDefault"}}
        }});
        assert_eq!(
            compare(&expected, &live_pod()).mismatches,
            vec![
                "spec.nodeSelector.disk",
                "spec.securityContext.runAsUser",
                "spec.securityContext.seccompProfile.type"
            ]
        );
    }

    #[test]
    fn missing_parent_with_only_nulls_matches() {
        let expected = json!({"spec": {"affinity": {"nodeAffinity": null}, "tolerations": []}});
        assert!(compare(&expected, &live_pod()).matched);
    }

    #[test]
    fn missing_field_is_mismatch() {
        let expected = json!({"spec": {"nodeName": "worker-1"}});
        assert_eq!(compare(&expected, &live_pod()).mismatches, vec!["spec.nodeName"]);
    }

    #[test]
    fn type_mismatch_reports_path() {
        let expected = json!({"spec": {"containers": {"name": "x"}}});
        assert_eq!(compare(&expected, &live_pod()).mismatches, vec!["spec.containers"]);
    }

    #[test]
    fn dotted_keys_are_bracketed() {
        let expected = json!({"metadata": {"labels": {"app.kubernetes.io/name": "other"}}});
        assert_eq!(
            compare(&expected, &live_pod()).mismatches,
            vec![r#"metadata.labels["app.kubernetes.io/name"]"#]
        );
    }

    #[test]
    fn empty_expected_collections_match_absence() {
        let expected = json!({"spec": {"containers": [{
            "name": "busybox-container",
            "env": [],
            "securityContext": {}
        }]}});
        assert!(compare(&expected, &live_pod()).matched);
    }

    #[test]
    fn null_expected_requires_absent_or_null() {
        assert!(compare(&json!({"spec": {"nodeName": null}}), &live_pod()).matched);
        assert!(!compare(&json!({"spec": {"restartPolicy": null}}), &live_pod()).matched);
    }

    #[test]
    fn scalar_normalization() {
        assert!(scalars_equal(&json!(1), &json!(1.0)));
        assert!(scalars_equal(&json!(8080), &json!("8080")));
        assert!(scalars_equal(&json!("8080"), &json!(8080)));
        assert!(scalars_equal(&json!(true), &json!("true")));
        assert!(scalars_equal(&json!("false"), &json!(false)));
        assert!(!scalars_equal(&json!(1), &json!("one")));
        assert!(!scalars_equal(&json!(true), &json!(1)));
        assert!(!scalars_equal(&json!("a"), &json!("b")));
        assert!(scalars_equal(&json!(u64::MAX), &json!(u64::MAX)));
    }

    #[test]
    fn comparison_is_pure() {
        let expected = json!({"spec": {"containers": [{"name": "x"}]}});
        let live = live_pod();
        assert_eq!(compare(&expected, &live), compare(&expected, &live));
    }

    #[test]
    fn secret_string_data_is_folded_into_data() {
        let docs = parse_documents(
            "lab",
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: creds\nstringData:\n  password: hunter2\n",
            "default",
        )
        .unwrap();
        let body = comparable_body(&docs[0]);
        assert!(body.get("stringData").is_none());
        assert_eq!(body["data"]["password"], "aHVudGVyMg==");

        let live = json!({
            "apiVersion": "v1", "kind": "Secret",
            "metadata": {"name": "creds", "namespace": "default"},
            "data": {"password": "aHVudGVyMg=="},
            "type": "Opaque"
        });
        assert!(compare(&body, &live).matched);
    }

    #[test]
    fn non_secret_body_is_untouched() {
        let docs = parse_documents(
            "lab",
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: c\nstringData:\n  a: b\n",
            "default",
        )
        .unwrap();
        assert_eq!(comparable_body(&docs[0]), docs[0].body);
    }

    #[test]
    fn judgement_status_entries() {
        let key = ResourceKey {
            api_version: "v1".into(),
            kind: "Pod".into(),
            namespace: Some("default".into()),
            name: "busybox".into(),
        };
        let missing = ResourceJudgement {
            key: key.clone(),
            judgement: Judgement::NotFound,
        };
        let entry = missing.to_status();
        assert_eq!(entry.status, ResourceState::NotFound);
        assert_eq!(entry.mismatches, vec![RESOURCE_NOT_FOUND]);
        assert!(!missing.matched());

        let unreadable = ResourceJudgement {
            key,
            judgement: Judgement::Unreadable("forbidden".into()),
        };
        let entry = unreadable.to_status();
        assert_eq!(entry.status, ResourceState::Error);
        assert_eq!(entry.error.as_deref(), Some("forbidden"));
    }

    fn api_error(code: u16) -> Error {
        Error::from(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[tokio::test]
    async fn judge_all_keeps_document_order() {
        let docs = parse_documents(
            "lab",
            "apiVersion: v1\nkind: Pod\nmetadata:\n  name: busybox\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: gone\n",
            "default",
        )
        .unwrap();

        let mut client = MockLabClient::new();
        client
            .expect_get_resource()
            .returning(|key| Ok((key.kind == "Pod").then(live_pod)));

        let judged = judge_all(&client, &docs).await.unwrap();
        assert_eq!(judged.len(), 2);
        assert!(judged[0].matched());
        assert_eq!(judged[1].key.name, "gone");
        assert_eq!(judged[1].to_status().status, ResourceState::NotFound);
    }

    #[tokio::test]
    async fn judge_all_aborts_on_transient_fetch_error() {
        let docs =
            parse_documents("lab", "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n", "default")
                .unwrap();
        let mut client = MockLabClient::new();
        client
            .expect_get_resource()
            .returning(|_| Err(api_error(503)));

        let err = judge_all(&client, &docs).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.step(), Some(Step::Fetch));
    }

    #[tokio::test]
    async fn judge_all_records_permanent_fetch_error() {
        let docs =
            parse_documents("lab", "apiVersion: v1\nkind: Pod\nmetadata:\n  name: p\n", "default")
                .unwrap();
        let mut client = MockLabClient::new();
        client
            .expect_get_resource()
            .returning(|_| Err(api_error(403)));

        let judged = judge_all(&client, &docs).await.unwrap();
        assert!(!judged[0].matched());
        assert!(matches!(judged[0].judgement, Judgement::Unreadable(_)));
    }
}
