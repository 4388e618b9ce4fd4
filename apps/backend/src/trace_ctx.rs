//! Task-local trace id for admin requests.
//!
//! `RequestTrace` opens the scope; error rendering and handlers read it
//! without threading the request through every call. Core crates never read
//! this; they log with their own tenant fields.

use tokio::task_local;

task_local! {
    static TRACE_ID: String;
}

const UNKNOWN: &str = "unknown";

/// Trace id of the current request, or `"unknown"` outside a request scope.
pub fn trace_id() -> String {
    current().unwrap_or_else(|| UNKNOWN.to_string())
}

pub fn current() -> Option<String> {
    TRACE_ID.try_with(Clone::clone).ok()
}

/// Run `future` with `trace_id` visible through [`trace_id`].
pub async fn with_trace_id<F, R>(trace_id: String, future: F) -> R
where
    F: std::future::Future<Output = R>,
{
    TRACE_ID.scope(trace_id, future).await
}

/// Accept a caller-supplied request id only if it is short printable ASCII.
pub fn accept_inbound(value: &str) -> Option<String> {
    let value = value.trim();
    let ok = !value.is_empty()
        && value.len() <= 128
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'));
    ok.then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn outside_a_scope_is_unknown() {
        assert_eq!(trace_id(), "unknown");
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn nested_scopes_restore_the_outer_id() {
        let seen = with_trace_id("outer".into(), async {
            let inner = with_trace_id("inner".into(), async { trace_id() }).await;
            (inner, trace_id())
        })
        .await;
        assert_eq!(seen, ("inner".to_string(), "outer".to_string()));
        assert_eq!(trace_id(), "unknown");
    }

    #[test]
    fn inbound_ids_are_filtered() {
        assert_eq!(accept_inbound(" req-42 "), Some("req-42".to_string()));
        assert_eq!(accept_inbound(""), None);
        assert_eq!(accept_inbound("has space"), None);
        assert_eq!(accept_inbound(&"x".repeat(129)), None);
    }
}
