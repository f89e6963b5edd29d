//! Errors raised by streams. Every variant travels through the `error` event
//! and, where a write was involved, through that write's completion callback,
//! so the type is cheap to clone.
use std::fmt::{Debug, Display, Formatter};
use std::io::ErrorKind;

/// Default error type for this crate
#[derive(Clone, PartialEq, Eq)]
pub enum StreamError {
    /// A chunk was pushed after the terminal `None`
    PushAfterEnd,
    /// A chunk was unshifted after `end` was emitted
    UnshiftAfterEnd,
    /// A write was attempted after `end()` was called
    WriteAfterEnd,
    /// A transform completed while no write was waiting on it
    MissingTransformCallback,
    /// A hook operation the implementation does not provide
    NotImplemented(&'static str),
    /// An I/O failure reported by a hook
    Io(ErrorKind, String),
    /// Any other failure reported by a hook
    Generic(String),
}

impl StreamError {
    pub fn generic<T: Into<String>>(msg: T) -> Self {
        Self::Generic(msg.into())
    }

    pub fn msg(&self) -> String {
        match self {
            Self::PushAfterEnd => "stream.push() after end".to_string(),
            Self::UnshiftAfterEnd => "stream.unshift() after end event".to_string(),
            Self::WriteAfterEnd => "write after end".to_string(),
            Self::MissingTransformCallback => {
                "transform completed with no pending write callback".to_string()
            }
            Self::NotImplemented(op) => format!("{op} not implemented"),
            Self::Io(kind, msg) => format!("I/O error ({kind:?}): {msg}"),
            Self::Generic(msg) => msg.clone(),
        }
    }

    pub fn into_string(self) -> String {
        match self {
            Self::Generic(msg) => msg,
            other => other.msg(),
        }
    }

    /// True for misuse of the stream API itself, as opposed to a hook failure
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::PushAfterEnd
                | Self::UnshiftAfterEnd
                | Self::WriteAfterEnd
                | Self::MissingTransformCallback
        )
    }
}

impl Debug for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.msg())
    }
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

impl std::error::Error for StreamError {}

impl From<anyhow::Error> for StreamError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<std::io::Error>() {
            Ok(err) => Self::from(err),
            Err(err) => Self::Generic(err.to_string()),
        }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.kind(), err.to_string())
    }
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Io(kind, msg) => std::io::Error::new(kind, msg),
            other => std::io::Error::other(other.into_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StreamError;
    use std::io::ErrorKind;

    #[test]
    fn messages() {
        assert_eq!(StreamError::WriteAfterEnd.to_string(), "write after end");
        assert_eq!(
            StreamError::NotImplemented("writev").to_string(),
            "writev not implemented"
        );
        assert_eq!(StreamError::generic("boom").into_string(), "boom");
        assert!(StreamError::PushAfterEnd.is_protocol_violation());
        assert!(!StreamError::generic("boom").is_protocol_violation());
    }

    #[test]
    fn io_round_trip_keeps_kind() {
        let err = StreamError::from(std::io::Error::new(ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(err, StreamError::Io(ErrorKind::BrokenPipe, _)));
        let back: std::io::Error = err.into();
        assert_eq!(back.kind(), ErrorKind::BrokenPipe);
    }

    #[test]
    fn anyhow_interop() {
        let err = StreamError::from(anyhow::anyhow!("hook failed"));
        assert_eq!(err, StreamError::generic("hook failed"));

        let io = anyhow::Error::from(std::io::Error::new(ErrorKind::TimedOut, "slow"));
        assert!(matches!(
            StreamError::from(io),
            StreamError::Io(ErrorKind::TimedOut, _)
        ));
    }
}
