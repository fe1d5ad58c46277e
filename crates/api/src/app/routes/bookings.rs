use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use reservo_core::BookingId;

use crate::app::dto::{
    BookingResponse, CreateBookingRequest, DataResponse, ListBookingsQuery, ListResponse,
};
use crate::app::errors;
use crate::app::services::AppServices;

pub const IDEMPOTENCY_KEY_HEADER: &str = "x-idempotency-key";

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_bookings).post(create_booking))
        .route("/:id", get(get_booking))
}

pub async fn create_booking(
    Extension(services): Extension<Arc<AppServices>>,
    headers: HeaderMap,
    body: Result<Json<CreateBookingRequest>, JsonRejection>,
) -> axum::response::Response {
    // The key is checked before the body so a keyless request never gets further.
    let key = match headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
    {
        Some(key) if !key.is_empty() => key.to_string(),
        _ => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                "X-Idempotency-Key header is required",
            );
        }
    };

    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", rejection.body_text());
        }
    };

    match services.bookings().create_booking(body.into_new_booking(key)).await {
        Ok(booking) => (
            StatusCode::CREATED,
            Json(DataResponse {
                data: BookingResponse::from(booking),
            }),
        )
            .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn get_booking(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: BookingId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid booking id"),
    };

    match services.bookings().get_booking(id).await {
        Ok(booking) => Json(DataResponse {
            data: BookingResponse::from(booking),
        })
        .into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}

pub async fn list_bookings(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListBookingsQuery>,
) -> axum::response::Response {
    match services.bookings().list_bookings(query.page_request()).await {
        Ok(page) => Json(ListResponse::from(page)).into_response(),
        Err(e) => errors::service_error_to_response(e),
    }
}
