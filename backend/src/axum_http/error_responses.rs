use axum::{
    Json,
    extract::rejection::JsonRejection,
    response::{IntoResponse, Response},
};
use crates::domain::value_objects::plans::InvalidInput;
use serde::Serialize;
use serde_json::{Value, json};

use crate::usecases::subscriptions::SubscriptionError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl From<&SubscriptionError> for ErrorResponse {
    fn from(err: &SubscriptionError) -> Self {
        let message = match err {
            // Don't leak processor or database detail to the client
            SubscriptionError::Processor(_) => "Payment processor request failed".to_string(),
            SubscriptionError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        };

        let details = match err {
            SubscriptionError::InvalidInput(invalid) => serde_json::to_value(invalid).ok(),
            SubscriptionError::PaymentNotCompleted { current_status } => {
                Some(json!({ "currentStatus": current_status }))
            }
            _ => None,
        };

        Self {
            code: err.status_code().as_u16(),
            error: err.error_code(),
            message,
            details,
        }
    }
}

impl From<JsonRejection> for SubscriptionError {
    fn from(rejection: JsonRejection) -> Self {
        SubscriptionError::InvalidInput(InvalidInput::new(
            "body",
            &rejection.body_text(),
            vec!["JSON object with application/json content type"],
        ))
    }
}

impl IntoResponse for SubscriptionError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorResponse::from(&self))).into_response()
    }
}
