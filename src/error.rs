use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// The error type for MySQL protocol and associated I/O operations.
///
/// Errors are `Clone` because a single failure may complete a pending
/// query future and also be recorded as the connection's last error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A query was issued while another one was still in flight.
    #[error("connection {connection_id} is still running a query")]
    StillRunningQuery {
        connection_id: String,
        /// True when the slot was observed empty but another caller won
        /// the compare-and-set.
        race_lost: bool,
    },

    /// Placeholder count in the statement does not match the number of
    /// supplied values.
    #[error("statement has {expected} placeholders but {actual} values were supplied")]
    InsufficientParameters { expected: usize, actual: usize },

    /// Operation attempted on a connection that is not connected.
    #[error("connection is not connected")]
    NotConnected,

    /// Error reported by the server as a native `(code, state, message)` triple.
    #[error("server error {code} ({sql_state}): {message}")]
    Protocol {
        code: u16,
        sql_state: String,
        message: String,
    },

    /// A decoded message left bytes unread in its frame.
    #[error("{remaining} bytes left unread in frame")]
    BufferNotFullyConsumed { remaining: usize },

    /// Underlying transport failure.
    #[error("encountered I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The pending query exceeded its configured deadline.
    #[error("query timed out")]
    TimedOut,

    /// The pending query was abandoned because the connection is closing.
    #[error("connection is being closed")]
    ConnectionBeingClosed,

    /// The configured charset name does not resolve to a server charset id.
    #[error("unknown charset {0:?}")]
    UnknownCharset(String),

    /// Protocol drift: a frame that cannot be decoded in the current state.
    #[error("{0}")]
    Unexpected(String),
}

impl Error {
    /// Whether this error invalidates the connection as a whole, as
    /// opposed to failing only the query that triggered it.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::TimedOut
                | Error::BufferNotFullyConsumed { .. }
                | Error::Unexpected(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(Arc::new(value))
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Unexpected(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Unexpected(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatality() {
        let server = Error::Protocol {
            code: 1064,
            sql_state: "42000".into(),
            message: "syntax error".into(),
        };
        assert!(!server.is_fatal());

        let io = Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(io.is_fatal());

        assert!(Error::BufferNotFullyConsumed { remaining: 3 }.is_fatal());
        assert!(!Error::NotConnected.is_fatal());
    }

    #[test]
    fn test_display() {
        let err = Error::Protocol {
            code: 1045,
            sql_state: "28000".into(),
            message: "Access denied".into(),
        };
        assert_eq!(err.to_string(), "server error 1045 (28000): Access denied");

        let err = Error::InsufficientParameters {
            expected: 2,
            actual: 1,
        };
        assert_eq!(
            err.to_string(),
            "statement has 2 placeholders but 1 values were supplied"
        );
    }
}
