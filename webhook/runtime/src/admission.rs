use crate::{
    core::{Decision, PolicyConfig},
    object::{DecodeError, Object},
};
use futures::future;
use http_body_util::BodyExt;
use hyper::{http, Request, Response};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    core::{DynamicObject, TypeMeta},
    ResourceExt,
};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn};

/// Serves the annotation policy as a validating admission webhook.
#[derive(Clone, Debug)]
pub struct Admission {
    policy: Arc<PolicyConfig>,
}

/// Fails a single exchange. Never surfaced in a response body.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read request body: {0}")]
    Body(#[source] BoxError),

    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type Review = kube::core::admission::AdmissionReview<DynamicObject>;
type AdmissionRequest = kube::core::admission::AdmissionRequest<DynamicObject>;
type AdmissionResponse = kube::core::admission::AdmissionResponse;

type Body = http_body_util::Full<bytes::Bytes>;

/// The parts of an AdmissionReview needed to answer it, used when the full
/// review fails to decode.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(flatten)]
    types: TypeMeta,
    request: EnvelopeRequest,
}

#[derive(Debug, Deserialize)]
struct EnvelopeRequest {
    uid: String,
}

// === impl Admission ===

impl<B> tower::Service<Request<B>> for Admission
where
    B: hyper::body::Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::BoxFuture<'static, Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri());
        if req.method() != http::Method::POST {
            return Box::pin(future::ok(
                Response::builder()
                    .status(http::StatusCode::METHOD_NOT_ALLOWED)
                    .header(http::header::ALLOW, "POST")
                    .body(Body::default())
                    .expect("method not allowed response must be valid"),
            ));
        }

        let admission = self.clone();
        Box::pin(async move {
            let bytes = req
                .into_body()
                .collect()
                .await
                .map_err(|e| Error::Body(e.into()))?
                .to_bytes();

            // A review that fails to decode is still answered if its uid can
            // be recovered. Without a uid the exchange fails instead.
            let review: Review = match serde_json::from_slice(&bytes) {
                Ok(review) => review,
                Err(error) => match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(envelope) => return json_response(envelope.deny(error)),
                    Err(_) => {
                        warn!(%error, "Failed to parse request body");
                        return Ok(bad_request("malformed AdmissionReview"));
                    }
                },
            };
            let req: AdmissionRequest = match review.try_into() {
                Ok(req) => req,
                Err(error) => {
                    warn!(%error, "Invalid admission request");
                    return Ok(bad_request("AdmissionReview has no request"));
                }
            };

            let rsp = admission.admit(req);
            debug!(?rsp);
            json_response(rsp)
        })
    }
}

impl Admission {
    pub fn new(policy: PolicyConfig) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    /// Produces a response for `req`, always carrying its uid.
    pub fn admit(&self, req: AdmissionRequest) -> AdmissionResponse {
        let rsp = AdmissionResponse::from(&req);
        let span = info_span!(
            "admit",
            uid = %req.uid,
            ns = req.namespace.as_deref().unwrap_or_default(),
            operation = ?req.operation,
        );
        let _enter = span.enter();

        match Object::try_from(req) {
            Ok(Object::Pod(pod)) => {
                let decision = self.validate_pod(&pod);
                correlate(rsp, &decision)
            }
            Err(error) => {
                info!(%error, "Denied");
                rsp.deny(error)
            }
        }
    }

    fn validate_pod(&self, pod: &Pod) -> Decision {
        let decision = self
            .policy
            .evaluate(pod.metadata.annotations.iter().flatten());

        let name = pod.name_any();
        match &decision.matched {
            Some(annotation) => info!(pod = %name, %annotation, "Allowed"),
            None => info!(pod = %name, "Denied"),
        }
        decision
    }
}

// === impl Envelope ===

impl Envelope {
    /// Denies a request whose object failed to decode along with the review.
    fn deny(self, source: serde_json::Error) -> AdmissionResponse {
        let Self { types, request } = self;
        let error = DecodeError::Malformed {
            kind: "AdmissionRequest".to_string(),
            source,
        };
        let _span = info_span!("admit", uid = %request.uid).entered();
        info!(%error, "Denied");

        let mut rsp = AdmissionResponse::invalid(error);
        rsp.types = types;
        rsp.uid = request.uid;
        rsp
    }
}

/// Carries `decision` on the response built from the originating request.
fn correlate(mut rsp: AdmissionResponse, decision: &Decision) -> AdmissionResponse {
    if !decision.allowed {
        return rsp.deny(decision.message);
    }

    rsp.result.message = decision.message.to_string();
    rsp
}

fn json_response(rsp: AdmissionResponse) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(&rsp.into_review())?;
    Ok(Response::builder()
        .status(http::StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("admission review response must be valid"))
}

fn bad_request(msg: &'static str) -> Response<Body> {
    Response::builder()
        .status(http::StatusCode::BAD_REQUEST)
        .header(http::header::CONTENT_TYPE, "text/plain")
        .body(Body::from(msg))
        .expect("bad request response must be valid")
}
