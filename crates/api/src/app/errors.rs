use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use reservo_infra::BookingServiceError;

pub fn service_error_to_response(err: BookingServiceError) -> axum::response::Response {
    match err {
        BookingServiceError::InvalidRequest(msg) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", msg)
        }
        BookingServiceError::Conflict(_) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        BookingServiceError::NotFound(_) => {
            json_error(StatusCode::NOT_FOUND, "not_found", err.to_string())
        }
        BookingServiceError::EnqueueFailure { booking_id, .. } => {
            tracing::error!(%booking_id, error = %err, "booking left without a fulfillment job");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({
                    "error": "enqueue_failed",
                    "message": format!("booking {booking_id} was created but could not be queued"),
                    "bookingId": booking_id.get(),
                })),
            )
                .into_response()
        }
        // Store errors carry driver text; clients only get the generic message.
        BookingServiceError::StoreUnavailable(msg) => {
            tracing::error!(error = %msg, "booking store unavailable");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "store_error",
                "booking store unavailable",
            )
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reservo_core::BookingId;

    #[test]
    fn service_errors_map_to_status_codes() {
        let cases = [
            (BookingServiceError::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
            (BookingServiceError::Conflict("k1".into()), StatusCode::CONFLICT),
            (BookingServiceError::NotFound(BookingId::new(7)), StatusCode::NOT_FOUND),
            (
                BookingServiceError::EnqueueFailure {
                    booking_id: BookingId::new(7),
                    reason: "queue down".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BookingServiceError::StoreUnavailable("db down".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(service_error_to_response(err).status(), status);
        }
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn infrastructure_detail_is_not_sent_to_clients() {
        let body = body_json(service_error_to_response(BookingServiceError::StoreUnavailable(
            "database error in create: connection refused to 10.0.0.5".into(),
        )))
        .await;
        assert_eq!(body["error"], "store_error");
        assert_eq!(body["message"], "booking store unavailable");

        let body = body_json(service_error_to_response(BookingServiceError::EnqueueFailure {
            booking_id: BookingId::new(7),
            reason: "storage error: pool closed".into(),
        }))
        .await;
        assert_eq!(body["bookingId"], 7);
        assert!(!body["message"].as_str().unwrap().contains("pool closed"));
    }
}
