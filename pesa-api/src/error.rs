use pesa_engine::EngineError;
use serde::Deserialize;
use serde::Serialize;

/// The machine-readable error envelope: a human message, the HTTP status
/// code, and a stable `name` clients can branch on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub code: u16,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>, code: u16, name: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code,
            name: name.into(),
            correlation_id: None,
        }
    }

    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Maps engine failures onto the wire contract. Unknown errors
    /// surface as `INTERNAL_ERROR` with the message preserved.
    pub fn from_engine(error: &EngineError, correlation_id: Option<&str>) -> Self {
        let (code, name) = match error {
            EngineError::DuplicateIdempotencyConflict => (409, "DUPLICATE_IDEMPOTENCY_CONFLICT"),
            EngineError::IdempotencyInProgress => (409, "IDEMPOTENCY_IN_PROGRESS"),
            EngineError::InsufficientFunds { .. } => (409, "INSUFFICIENT_FUNDS"),
            EngineError::UnbalancedJournal(_) => (422, "UNBALANCED_JOURNAL"),
            EngineError::CrossCurrencyNotAllowed(_) => (422, "CROSS_CURRENCY_NOT_ALLOWED"),
            // Zero and malformed amounts are request-shape errors; the
            // contract has no finer-grained name for them.
            EngineError::InvalidAmount(_) => (400, "MISSING_REQUIRED_FIELD"),
            EngineError::MissingRequiredField(_) => (400, "MISSING_REQUIRED_FIELD"),
            EngineError::NotFound(_) => (404, "NOT_FOUND"),
            EngineError::Internal(_) => (500, "INTERNAL_ERROR"),
        };
        let body = Self::new(error.to_string(), code, name);
        match correlation_id {
            Some(correlation_id) => body.with_correlation(correlation_id),
            None => body,
        }
    }

    pub fn missing_field(field: &str, correlation_id: Option<&str>) -> Self {
        let body = Self::new(
            format!("missing required field: {field}"),
            400,
            "MISSING_REQUIRED_FIELD",
        );
        match correlation_id {
            Some(correlation_id) => body.with_correlation(correlation_id),
            None => body,
        }
    }

    pub fn malformed_amount(raw: &str, correlation_id: Option<&str>) -> Self {
        let body = Self::new(
            format!("amount is not a valid decimal string: {raw:?}"),
            400,
            "MISSING_REQUIRED_FIELD",
        );
        match correlation_id {
            Some(correlation_id) => body.with_correlation(correlation_id),
            None => body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn engine_errors_map_to_the_contract() {
        let cases = [
            (
                EngineError::DuplicateIdempotencyConflict,
                409,
                "DUPLICATE_IDEMPOTENCY_CONFLICT",
            ),
            (EngineError::IdempotencyInProgress, 409, "IDEMPOTENCY_IN_PROGRESS"),
            (
                EngineError::InsufficientFunds {
                    account_id: "wallet-1".into(),
                    required: 300,
                    available: 100,
                },
                409,
                "INSUFFICIENT_FUNDS",
            ),
            (
                EngineError::UnbalancedJournal("DR 100 != CR 90".into()),
                422,
                "UNBALANCED_JOURNAL",
            ),
            (
                EngineError::CrossCurrencyNotAllowed("mixed".into()),
                422,
                "CROSS_CURRENCY_NOT_ALLOWED",
            ),
            (EngineError::InvalidAmount(0), 400, "MISSING_REQUIRED_FIELD"),
            (
                EngineError::MissingRequiredField("currency"),
                400,
                "MISSING_REQUIRED_FIELD",
            ),
            (EngineError::NotFound("account x".into()), 404, "NOT_FOUND"),
            (EngineError::Internal("boom".into()), 500, "INTERNAL_ERROR"),
        ];
        for (error, code, name) in cases {
            let body = ErrorBody::from_engine(&error, Some("corr-1"));
            assert_eq!(body.code, code);
            assert_eq!(body.name, name);
            assert_eq!(body.correlation_id.as_deref(), Some("corr-1"));
            assert!(!body.error.is_empty());
        }
    }

    #[test]
    fn envelope_serializes_snake_case() {
        let body = ErrorBody::new("insufficient funds on wallet-1", 409, "INSUFFICIENT_FUNDS")
            .with_correlation("corr-9");
        let json = serde_json::to_value(&body).expect("serializes");
        assert_eq!(json["error"], "insufficient funds on wallet-1");
        assert_eq!(json["code"], 409);
        assert_eq!(json["name"], "INSUFFICIENT_FUNDS");
        assert_eq!(json["correlation_id"], "corr-9");
    }
}
