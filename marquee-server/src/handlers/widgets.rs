use axum::{
    extract::{Path, State},
    http::{HeaderName, HeaderValue, header},
    response::{IntoResponse, Response},
};

use crate::infra::app_state::AppState;

pub const MARKUP_SOURCE_HEADER: &str = "x-marquee-markup";

/// GET /_marquee/widgets/{id} - Widget markup that never fails: fresh,
/// stale or placeholder.
pub async fn widget_markup_handler(
    State(state): State<AppState>,
    Path(widget_id): Path<String>,
) -> Response {
    let outcome = state.widgets.fetch_widget_markup(&widget_id).await;
    let source = outcome.source();
    (
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/html; charset=utf-8"),
            ),
            (
                HeaderName::from_static(MARKUP_SOURCE_HEADER),
                HeaderValue::from_static(source),
            ),
        ],
        outcome.into_markup(),
    )
        .into_response()
}
