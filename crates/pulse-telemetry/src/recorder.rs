use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use uuid::Uuid;

use crate::storage::TelemetryStore;
use crate::types::{
    ErrorKind, RawErrorEvent, RawRequestEvent, RequestContext, RequestOutcome, SanitizedContext,
};

/// Monotonic latency timer for one request dispatch. Started by the
/// framework hook immediately before dispatch; wall-clock jumps do not
/// affect the measurement.
#[derive(Debug)]
pub struct RequestTimer {
    started: Instant,
}

impl RequestTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

/// Persists raw telemetry for every instrumented request.
///
/// Reliability contract: `record` never fails and never blocks the
/// request beyond its own awaited writes. Storage errors are logged and
/// discarded so observability failures stay isolated from application
/// failures.
#[derive(Clone)]
pub struct EventRecorder {
    store: Arc<dyn TelemetryStore>,
}

impl EventRecorder {
    pub fn new(store: Arc<dyn TelemetryStore>) -> Self {
        Self { store }
    }

    /// Record one request/response (or request/fault) pair.
    ///
    /// Always attempts a request event; when the status is >= 400 or the
    /// outcome is a fault, also attempts a companion error event. The two
    /// writes are independent.
    pub async fn record(&self, ctx: &RequestContext, outcome: &RequestOutcome, latency_ms: u64) {
        let request_id = Uuid::new_v4().to_string();
        let occurred_at = Utc::now();
        let status_code = outcome.status_code();

        let event = RawRequestEvent {
            request_id: request_id.clone(),
            occurred_at,
            endpoint: ctx.path.clone(),
            method: ctx.method.clone(),
            status_code,
            latency_ms,
            principal: ctx.principal.clone(),
        };
        if let Err(error) = self.store.insert_request_event(event).await {
            log::warn!(
                "failed to persist request event for {} {}: {}",
                ctx.method,
                ctx.path,
                error
            );
        }

        if status_code < 400 && !outcome.is_fault() {
            return;
        }

        let (kind, message, stack_trace) = match outcome {
            RequestOutcome::Fault {
                type_name,
                message,
                stack_trace,
            } => (
                ErrorKind::Fault {
                    type_name: type_name.clone(),
                },
                message.clone(),
                stack_trace.clone(),
            ),
            RequestOutcome::Response { status_code } => (
                ErrorKind::Http {
                    status_code: *status_code,
                },
                format!("HTTP {}", status_code),
                String::new(),
            ),
        };

        let error_event = RawErrorEvent {
            request_id,
            occurred_at,
            endpoint: ctx.path.clone(),
            method: ctx.method.clone(),
            status_code,
            kind,
            message,
            stack_trace,
            principal: ctx.principal.clone(),
            context: SanitizedContext::from(ctx),
        };
        if let Err(error) = self.store.insert_error_event(error_event).await {
            log::warn!(
                "failed to persist error event for {} {}: {}",
                ctx.method,
                ctx.path,
                error
            );
        }
    }
}
