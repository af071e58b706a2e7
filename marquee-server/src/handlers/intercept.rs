use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri, header},
    response::{IntoResponse, Response},
};
use marquee_core::{CacheResponse, InterceptRequest, Interception};

use crate::infra::app_state::AppState;

/// Request headers relayed to the origin on bypassed requests.
const FORWARDED_HEADERS: &[header::HeaderName] = &[
    header::ACCEPT,
    header::ACCEPT_LANGUAGE,
    header::AUTHORIZATION,
    header::CONTENT_TYPE,
    header::COOKIE,
    header::USER_AGENT,
];

/// Fallback for every renderer request: serve from cache or relay.
pub async fn intercept_handler(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = InterceptRequest {
        method,
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        range: headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    match state.router.intercept(&request).await {
        Interception::Respond(response) => into_http(response),
        Interception::Bypass(descriptor) => {
            let mut forwarded = HeaderMap::new();
            for name in FORWARDED_HEADERS {
                if let Some(value) = headers.get(name) {
                    forwarded.insert(name.clone(), value.clone());
                }
            }
            let response = state
                .router
                .forward(&descriptor, forwarded, body.to_vec())
                .await;
            into_http(response)
        }
    }
}

pub(crate) fn into_http(response: CacheResponse) -> Response {
    (response.status, response.headers, response.body).into_response()
}
