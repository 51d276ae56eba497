use std::{error::Error, sync::Arc};

/// Every failure a stream can surface.
///
/// Errors are cloneable because a single terminal reason is observed by many
/// parties at once: pending reads, the reader's `closed` promise, the pipe future.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StreamError {
    #[error("Stream operation was canceled")]
    Canceled,
    #[error("Stream was aborted{}", .0.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Aborted(Option<String>),
    #[error("Stream is closing")]
    Closing,
    #[error("Stream is closed")]
    Closed,
    #[error("Stream task was dropped")]
    TaskDropped,
    /// Invalid API sequencing, or a protocol violation reported to the caller.
    #[error("TypeError: {0}")]
    TypeError(String),
    #[error("Memory limit exceeded before EOF.")]
    LimitExceeded { limit: u64 },
    #[error("{0}")]
    Other(Arc<dyn Error + Send + Sync>),
}

impl StreamError {
    /// Wrap any error type into `StreamError`
    pub fn other<E>(e: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        StreamError::Other(Arc::new(e))
    }

    /// Wrap a boxed error
    pub fn other_boxed(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        StreamError::TypeError(message.into())
    }

    /// Usage errors never change stream state beyond what was already true.
    pub fn is_usage_error(&self) -> bool {
        matches!(self, StreamError::TypeError(_))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct Message(String);

impl From<&str> for StreamError {
    fn from(s: &str) -> Self {
        StreamError::Other(Arc::new(Message(s.to_string())))
    }
}

impl From<String> for StreamError {
    fn from(s: String) -> Self {
        StreamError::Other(Arc::new(Message(s)))
    }
}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        StreamError::Other(Arc::new(e))
    }
}

impl From<Box<dyn Error + Send + Sync>> for StreamError {
    fn from(e: Box<dyn Error + Send + Sync>) -> Self {
        StreamError::Other(e.into())
    }
}

impl From<StreamError> for std::io::Error {
    fn from(e: StreamError) -> Self {
        std::io::Error::other(e)
    }
}

/// Add direct `From` implementations for user error types so `?` works inside
/// sources, sinks and transformers.
///
/// ```rust
/// use flow_streams::{StreamError, impl_stream_error_from};
///
/// #[derive(Debug)]
/// struct ParseError;
/// impl std::fmt::Display for ParseError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         f.write_str("parse error")
///     }
/// }
/// impl std::error::Error for ParseError {}
///
/// impl_stream_error_from!(ParseError);
///
/// fn parse() -> Result<(), StreamError> {
///     let parsed: Result<(), ParseError> = Err(ParseError);
///     parsed?;
///     Ok(())
/// }
/// assert!(parse().is_err());
/// ```
#[macro_export]
macro_rules! impl_stream_error_from {
    ($($error_type:ty),* $(,)?) => {
        $(
            impl From<$error_type> for $crate::StreamError {
                fn from(e: $error_type) -> Self {
                    $crate::StreamError::Other(std::sync::Arc::new(e))
                }
            }
        )*
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[test]
    fn conversions_wrap_into_other() {
        let e: StreamError = "error message".into();
        assert_eq!(e.to_string(), "error message");
        let e: StreamError = String::from("error").into();
        assert!(matches!(e, StreamError::Other(_)));

        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "io error");
        let e: StreamError = io_err.into();
        assert_eq!(e.to_string(), "io error");
    }

    #[test]
    fn aborted_display_includes_reason() {
        assert_eq!(StreamError::Aborted(None).to_string(), "Stream was aborted");
        assert_eq!(
            StreamError::Aborted(Some("gone".into())).to_string(),
            "Stream was aborted: gone"
        );
    }

    #[test]
    fn usage_errors_are_classified() {
        assert!(StreamError::type_error("This ReadableStream is closed.").is_usage_error());
        assert!(!StreamError::Canceled.is_usage_error());
        assert!(!StreamError::LimitExceeded { limit: 4 }.is_usage_error());
    }

    #[test]
    fn macro_enables_question_mark() -> Result<(), Box<dyn Error>> {
        #[derive(Debug)]
        struct UserCustomError(String);
        impl fmt::Display for UserCustomError {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "User error: {}", self.0)
            }
        }
        impl Error for UserCustomError {}

        impl_stream_error_from!(UserCustomError);

        fn user_function() -> Result<(), StreamError> {
            fn might_fail() -> Result<(), UserCustomError> {
                Err(UserCustomError("something went wrong".to_string()))
            }
            might_fail()?;
            Ok(())
        }

        let err = user_function().unwrap_err();
        assert_eq!(err.to_string(), "User error: something went wrong");
        Ok(())
    }

    #[test]
    fn round_trips_through_io_error() {
        let io: std::io::Error = StreamError::Closed.into();
        assert_eq!(io.to_string(), "Stream is closed");
    }
}
