use std::fmt;

use serde_json::Value;

/// A non-2xx answer from the platform's REST API.
///
/// The platform reports failures as
///
/// ```json
/// {
///   "message": "CUDRS0007E: The request was not valid. Review the constraint violations provided.",
///   "exception": {"id": "CUDRS0007E", "properties": []},
///   "violations": [{"message": "CUDRS0012E: ...", "exception": {"id": "CUDRS0012E"}}]
/// }
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct ApiError {
    status: u16,
    reason: String,
    url: String,
    text: String,
    json: Option<Value>,
}

impl ApiError {
    pub fn new(status: u16, reason: impl Into<String>, url: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        let json = serde_json::from_str(&text).ok();
        Self {
            status,
            reason: reason.into(),
            url: url.into(),
            text,
            json,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Raw response body.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn message(&self) -> Option<&str> {
        self.json.as_ref()?.get("message")?.as_str()
    }

    /// Platform error code such as `CUDRS0007E`.
    pub fn exception_id(&self) -> Option<&str> {
        self.json.as_ref()?.pointer("/exception/id")?.as_str()
    }

    /// Messages of the individual constraint violations, if any were reported.
    pub fn violations(&self) -> Option<Vec<&str>> {
        let violations = self.json.as_ref()?.get("violations")?.as_array()?;
        Some(
            violations
                .iter()
                .filter_map(|v| v.get("message").and_then(Value::as_str))
                .collect(),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(message) => f.write_str(message),
            None => write!(
                f,
                "Unexpected return code from API: {} ({}) - {}\n{}",
                self.status, self.reason, self.url, self.text
            ),
        }
    }
}

impl std::error::Error for ApiError {}
