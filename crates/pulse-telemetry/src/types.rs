use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Classification of an error event into a small closed set of kinds.
///
/// Non-exception HTTP errors carry the status code; faults carry the
/// original type name as a diagnostic payload only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Http { status_code: u16 },
    Fault { type_name: String },
}

impl ErrorKind {
    pub fn label(&self) -> String {
        match self {
            Self::Http { status_code } => format!("HTTP {}", status_code),
            Self::Fault { type_name } => type_name.clone(),
        }
    }

    pub fn from_label(label: &str) -> Self {
        if let Some(code) = label.strip_prefix("HTTP ") {
            if let Ok(status_code) = code.parse::<u16>() {
                return Self::Http { status_code };
            }
        }
        Self::Fault {
            type_name: label.to_string(),
        }
    }
}

/// Request metadata supplied explicitly by the framework integration
/// layer. Bodies are never captured, only whether one was present.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub had_body: bool,
    pub principal: Option<String>,
    pub client_ip: Option<String>,
}

impl RequestContext {
    /// Build a context from a method and a raw request target. Any query
    /// string is stripped from the stored path.
    pub fn new(method: impl Into<String>, raw_path: impl Into<String>) -> Self {
        let raw_path = raw_path.into();
        let path = raw_path
            .split_once('?')
            .map(|(path, _)| path.to_string())
            .unwrap_or(raw_path);
        Self {
            method: method.into(),
            path,
            ..Self::default()
        }
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_body(mut self) -> Self {
        self.had_body = true;
        self
    }

    pub fn with_principal(mut self, principal: impl Into<String>) -> Self {
        self.principal = Some(principal.into());
        self
    }

    pub fn with_client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }
}

/// The sanitized slice of a [`RequestContext`] persisted alongside an
/// error event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SanitizedContext {
    pub method: String,
    pub path: String,
    pub query_params: HashMap<String, String>,
    pub content_type: Option<String>,
    pub user_agent: Option<String>,
    pub had_body: bool,
    pub client_ip: Option<String>,
}

impl From<&RequestContext> for SanitizedContext {
    fn from(ctx: &RequestContext) -> Self {
        Self {
            method: ctx.method.clone(),
            path: ctx.path.clone(),
            query_params: ctx.query_params.clone(),
            content_type: ctx.content_type.clone(),
            user_agent: ctx.user_agent.clone(),
            had_body: ctx.had_body,
            client_ip: ctx.client_ip.clone(),
        }
    }
}

/// How an instrumented request ended: a produced response, or a fault
/// caught before any response existed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RequestOutcome {
    Response {
        status_code: u16,
    },
    Fault {
        type_name: String,
        message: String,
        stack_trace: String,
    },
}

impl RequestOutcome {
    /// Status recorded for the request event. Faults with no response
    /// default to 500.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Response { status_code } => *status_code,
            Self::Fault { .. } => 500,
        }
    }

    pub fn is_fault(&self) -> bool {
        matches!(self, Self::Fault { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawRequestEvent {
    pub request_id: String,
    pub occurred_at: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub latency_ms: u64,
    pub principal: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawErrorEvent {
    pub request_id: String,
    pub occurred_at: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub kind: ErrorKind,
    pub message: String,
    pub stack_trace: String,
    pub principal: Option<String>,
    pub context: SanitizedContext,
}

/// Per-endpoint slice of one day's traffic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EndpointDaily {
    pub request_count: u64,
    pub error_count: u64,
    pub mean_latency_ms: f64,
}

/// One row per calendar date, recomputable from raw events at any time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DailySummary {
    pub date: NaiveDate,
    pub total_requests: u64,
    pub error_count: u64,
    pub client_error_count: u64,
    pub server_error_count: u64,
    pub mean_latency_ms: f64,
    pub p50_latency_ms: u64,
    pub p95_latency_ms: u64,
    pub max_latency_ms: u64,
    pub endpoints: HashMap<String, EndpointDaily>,
}

/// Upstream API vendor inferred from a model identifier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Mistral,
    Unknown,
}

impl Provider {
    /// Case-insensitive substring match on known vendor fragments,
    /// first match wins. Unmatched identifiers land in `Unknown`.
    pub fn classify(model: &str) -> Self {
        let model = model.to_ascii_lowercase();
        const FRAGMENTS: &[(&str, Provider)] = &[
            ("gpt", Provider::OpenAi),
            ("openai", Provider::OpenAi),
            ("claude", Provider::Anthropic),
            ("anthropic", Provider::Anthropic),
            ("gemini", Provider::Google),
            ("mistral", Provider::Mistral),
        ];
        for (fragment, provider) in FRAGMENTS {
            if model.contains(fragment) {
                return *provider;
            }
        }
        Self::Unknown
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "OpenAI",
            Self::Anthropic => "Anthropic",
            Self::Google => "Google",
            Self::Mistral => "Mistral",
            Self::Unknown => "Unknown",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "OpenAI" => Some(Self::OpenAi),
            "Anthropic" => Some(Self::Anthropic),
            "Google" => Some(Self::Google),
            "Mistral" => Some(Self::Mistral),
            "Unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// One row per (date, provider, model), upserted by the aggregator.
/// Cost is fixed-point; binary floats never touch money.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCostSummary {
    pub date: NaiveDate,
    pub provider: Provider,
    pub model: String,
    pub request_count: u64,
    pub total_cost: Decimal,
    pub total_tokens: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// A usage ledger record, persisted by the host's API client layer and
/// consumed read-only here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsageRecord {
    pub occurred_at: DateTime<Utc>,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost: Decimal,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_context_strips_query_string_from_path() {
        let ctx = RequestContext::new("GET", "/api/sessions?page=2&sort=desc");
        assert_eq!(ctx.path, "/api/sessions");
        assert!(ctx.query_params.is_empty());
    }

    #[test]
    fn error_kind_labels_round_trip() {
        let http = ErrorKind::Http { status_code: 404 };
        assert_eq!(http.label(), "HTTP 404");
        assert_eq!(ErrorKind::from_label("HTTP 404"), http);

        let fault = ErrorKind::Fault {
            type_name: "ValueError".to_string(),
        };
        assert_eq!(fault.label(), "ValueError");
        assert_eq!(ErrorKind::from_label("ValueError"), fault);
    }

    #[test]
    fn provider_classification_matches_known_fragments() {
        assert_eq!(Provider::classify("gpt-4o-mini"), Provider::OpenAi);
        assert_eq!(Provider::classify("GPT-4"), Provider::OpenAi);
        assert_eq!(Provider::classify("claude-3-opus"), Provider::Anthropic);
        assert_eq!(Provider::classify("CLAUDE-instant"), Provider::Anthropic);
        assert_eq!(Provider::classify("gemini-1.5-pro"), Provider::Google);
        assert_eq!(Provider::classify("mistral-large"), Provider::Mistral);
        assert_eq!(Provider::classify("llama-3-70b"), Provider::Unknown);
    }

    #[test]
    fn fault_outcome_defaults_to_status_500() {
        let outcome = RequestOutcome::Fault {
            type_name: "TimeoutError".to_string(),
            message: "upstream timed out".to_string(),
            stack_trace: String::new(),
        };
        assert_eq!(outcome.status_code(), 500);
        assert!(outcome.is_fault());
    }

    #[test]
    fn sanitized_context_carries_no_principal() {
        let ctx = RequestContext::new("POST", "/api/answers")
            .with_principal("user-17")
            .with_content_type("application/json")
            .with_body();
        let sanitized = SanitizedContext::from(&ctx);
        let json = serde_json::to_string(&sanitized).expect("serialize");
        assert!(!json.contains("user-17"));
        assert!(json.contains("had_body"));
    }
}
