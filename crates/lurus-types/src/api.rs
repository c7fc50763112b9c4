//! API request/response types

use serde::{Deserialize, Serialize};

use crate::ErrorCode;

/// Standard API response envelope
///
/// Every endpoint answers with `{success, message, error_code?, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the request succeeded
    pub success: bool,
    /// Human-readable message (empty on most successes)
    #[serde(default)]
    pub message: String,
    /// Machine-readable error code (failures only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// Response payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    /// Create a successful response
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            error_code: None,
            data: Some(data),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

impl ApiResponse<()> {
    /// Success carrying only a message
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            error_code: None,
            data: None,
        }
    }

    /// Failure envelope; `data` is omitted
    pub fn error(code: Option<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error_code: code,
            data: None,
        }
    }
}

/// `?page=&page_size=` query; pages are 1-indexed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default = "default_page")]
    pub page: u32,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

fn default_page() -> u32 {
    1
}

fn default_page_size() -> u32 {
    10
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 10,
        }
    }
}

impl Pagination {
    /// Clamp out-of-range values to the defaults
    pub fn normalized(&self) -> Self {
        Self {
            page: self.page.max(1),
            page_size: if (1..=100).contains(&self.page_size) {
                self.page_size
            } else {
                10
            },
        }
    }

    /// Row offset
    pub fn offset(&self) -> i64 {
        let p = self.normalized();
        i64::from(p.page - 1) * i64::from(p.page_size)
    }

    /// Row limit
    pub fn limit(&self) -> i64 {
        i64::from(self.normalized().page_size)
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: i64, pagination: &Pagination) -> Self {
        let p = pagination.normalized();
        Self {
            items,
            total,
            page: p.page,
            page_size: p.page_size,
        }
    }
}

/// Body of `/health` and `/ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentHealth>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// One dependency probed by `/ready`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_omits_data() {
        let body = ApiResponse::error(Some(ErrorCode::UserNotFound), "User not found");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "USER_NOT_FOUND");
        assert!(json.get("data").is_none());
    }

    #[test]
    fn success_envelope_omits_error_code() {
        let json = serde_json::to_value(ApiResponse::success(42)).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["data"], 42);
        assert!(json.get("error_code").is_none());
    }

    #[test]
    fn pagination_clamps() {
        let p = Pagination {
            page: 0,
            page_size: 500,
        };
        assert_eq!(p.offset(), 0);
        assert_eq!(p.limit(), 10);

        let p = Pagination {
            page: 3,
            page_size: 20,
        };
        assert_eq!(p.offset(), 40);
        assert_eq!(p.limit(), 20);
    }
}
