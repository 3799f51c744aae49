pub mod retry;
pub mod timeout;

pub use retry::RetryPolicy;
pub use timeout::{
    OperationKind, TimeoutError, TimeoutSpec, defaults, format_duration, format_timeout_error,
    with_timeout,
};
