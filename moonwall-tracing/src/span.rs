use std::future::Future;

use tracing::{Instrument as _, Span, info_span};

pub const FOUNDATION_SPAN_PREFIX: &str = "moonwall.foundation";

/// Renders `moonwall.foundation.<kind>.<operation>[<name>]`, omitting the
/// bracketed suffix when no foundation name is given.
#[must_use]
pub fn foundation_span_name(kind: &str, operation: &str, name: Option<&str>) -> String {
    let base = format!("{FOUNDATION_SPAN_PREFIX}.{kind}.{operation}");
    match name {
        Some(name) => format!("{base}[{name}]"),
        None => base,
    }
}

/// Span wrapping one lifecycle operation. Exporters pick the display name up
/// from `otel.name`; field values are only rendered when the span is enabled.
#[must_use]
pub fn foundation_span(kind: &str, operation: &str, name: Option<&str>) -> Span {
    info_span!(
        "foundation",
        otel.name = %foundation_span_name(kind, operation, name),
        foundation.kind = kind,
        foundation.operation = operation,
        foundation.name = name.unwrap_or_default(),
    )
}

pub async fn in_foundation_span<F>(
    kind: &str,
    operation: &str,
    name: Option<&str>,
    future: F,
) -> F::Output
where
    F: Future,
{
    future
        .instrument(foundation_span(kind, operation, name))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_name_includes_foundation_name() {
        assert_eq!(
            foundation_span_name("dev", "startup", Some("moonbeam")),
            "moonwall.foundation.dev.startup[moonbeam]"
        );
    }

    #[test]
    fn span_name_without_foundation_name() {
        assert_eq!(
            foundation_span_name("dev", "startup", None),
            "moonwall.foundation.dev.startup"
        );
        assert_eq!(
            foundation_span_name("read_only", "health_check", None),
            "moonwall.foundation.read_only.health_check"
        );
    }

    #[tokio::test]
    async fn instrumentation_does_not_alter_output() {
        let value = in_foundation_span("chopsticks", "create_block", Some("fork"), async {
            Err::<(), _>("boom")
        })
        .await;

        assert_eq!(value, Err("boom"));
    }
}
