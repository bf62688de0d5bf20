//! Helper macro keeping the `service` field present on lifecycle logs.

/// Log a lifecycle event for a service plus any extra display fields.
///
/// ```ignore
/// service_event!(info, "service restarted", service = "db", attempt = 2);
/// ```
#[macro_export]
macro_rules! service_event {
    ($level:ident, $message:literal, service = $service:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            service = %$service,
            $($field = %$value,)*
            $message
        )
    };
}
