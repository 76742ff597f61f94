use k8s_openapi::api::core::v1::Pod;
use kube::{core::DynamicObject, Resource};
use serde::de::DeserializeOwned;
use thiserror::Error;

type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;

/// A typed resource under review.
///
/// Each variant is a kind the webhook knows how to decode. Requests for any
/// other kind fail with [`DecodeError::UnsupportedKind`].
#[derive(Clone, Debug)]
pub enum Object {
    Pod(Pod),
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("admission request missing 'object'")]
    MissingObject,

    #[error("unsupported resource type: {group}.{version}.{kind}")]
    UnsupportedKind {
        group: String,
        version: String,
        kind: String,
    },

    #[error("failed to decode {kind}: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// === impl Object ===

impl TryFrom<AdmissionRequest> for Object {
    type Error = DecodeError;

    fn try_from(req: AdmissionRequest) -> Result<Self, DecodeError> {
        if is_kind::<Pod>(&req) {
            return decode::<Pod>(req).map(Self::Pod);
        }

        Err(DecodeError::UnsupportedKind {
            group: req.kind.group,
            version: req.kind.version,
            kind: req.kind.kind,
        })
    }
}

fn is_kind<T>(req: &AdmissionRequest) -> bool
where
    T: Resource,
    T::DynamicType: Default,
{
    let dt = Default::default();
    req.kind.group.eq_ignore_ascii_case(&T::group(&dt))
        && req.kind.kind.eq_ignore_ascii_case(&T::kind(&dt))
}

/// Decodes the request's object as a `T`.
fn decode<T>(req: AdmissionRequest) -> Result<T, DecodeError>
where
    T: Resource + DeserializeOwned,
    T::DynamicType: Default,
{
    let obj = req.object.ok_or(DecodeError::MissingObject)?;
    serde_json::to_value(obj)
        .and_then(serde_json::from_value)
        .map_err(|source| DecodeError::Malformed {
            kind: T::kind(&Default::default()).into_owned(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(kind: serde_json::Value, object: Option<serde_json::Value>) -> AdmissionRequest {
        let mut req = json!({
            "uid": "d5fd3b0c-1f3a-4b8c-9d8e-3c0e2a6b7f10",
            "kind": kind,
            "resource": { "group": "", "version": "v1", "resource": "pods" },
            "name": "web-0",
            "namespace": "default",
            "operation": "CREATE",
            "userInfo": { "username": "system:serviceaccount:default:deployer" },
            "dryRun": false,
        });
        if let Some(object) = object {
            req["object"] = object;
        }
        serde_json::from_value(req).expect("request must parse")
    }

    fn pod_kind() -> serde_json::Value {
        json!({ "group": "", "version": "v1", "kind": "Pod" })
    }

    #[test]
    fn decodes_pod() {
        let req = request(
            pod_kind(),
            Some(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {
                    "name": "web-0",
                    "namespace": "default",
                    "annotations": { "policy/owner": "allow" },
                },
                "spec": { "containers": [{ "name": "web", "image": "nginx" }] },
            })),
        );
        let Object::Pod(pod) = Object::try_from(req).expect("pod must decode");
        assert_eq!(pod.metadata.name.as_deref(), Some("web-0"));
        assert_eq!(
            pod.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get("policy/owner"))
                .map(String::as_str),
            Some("allow")
        );
    }

    #[test]
    fn decodes_pod_without_annotations() {
        let req = request(
            pod_kind(),
            Some(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "generateName": "web-" },
            })),
        );
        let Object::Pod(pod) = Object::try_from(req).expect("pod must decode");
        assert!(pod.metadata.annotations.is_none());
    }

    #[test]
    fn kind_match_ignores_case() {
        let req = request(
            json!({ "group": "", "version": "v1", "kind": "pod" }),
            Some(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": {} })),
        );
        assert!(Object::try_from(req).is_ok());
    }

    #[test]
    fn rejects_other_kinds() {
        let req = request(
            json!({ "group": "apps", "version": "v1", "kind": "Deployment" }),
            Some(json!({ "apiVersion": "apps/v1", "kind": "Deployment", "metadata": {} })),
        );
        let err = Object::try_from(req).unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedKind { .. }));
        assert_eq!(err.to_string(), "unsupported resource type: apps.v1.Deployment");
    }

    #[test]
    fn rejects_pod_kind_in_another_group() {
        let req = request(
            json!({ "group": "example.com", "version": "v1", "kind": "Pod" }),
            Some(json!({ "metadata": {} })),
        );
        assert!(matches!(
            Object::try_from(req),
            Err(DecodeError::UnsupportedKind { .. })
        ));
    }

    #[test]
    fn rejects_missing_object() {
        let req = request(pod_kind(), None);
        assert!(matches!(
            Object::try_from(req),
            Err(DecodeError::MissingObject)
        ));
    }

    #[test]
    fn rejects_malformed_pod() {
        let req = request(
            pod_kind(),
            Some(json!({
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "broken" },
                "spec": { "containers": "not-a-list" },
            })),
        );
        let err = Object::try_from(req).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed { .. }));
        assert!(err.to_string().starts_with("failed to decode Pod"));
    }
}
