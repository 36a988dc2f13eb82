//! Pure categorization of transport/upstream errors into a closed tag set.
//!
//! Classification never inspects config or shared state: same input always
//! yields the same tag. Platform error codes are checked first; substring
//! matching on the message text is the fallback. The substring match is
//! case-sensitive on purpose — see `ErrorKind::classify` below.

use std::fmt;
use std::io;

/// Closed set of transport/upstream failure categories.
///
/// Ordering here is also priority order for the substring fallback: the
/// first matching pattern in `classify` wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SocketHangup,
    BrokenPipe,
    ConnectionAborted,
    StreamPrematureClose,
    HttpParseError,
    ConnectionRefused,
    DnsError,
    TlsError,
    Timeout,
    RateLimited,
    /// Upstream responded with a 5xx status. Distinct from `Other` so a
    /// definite server-side failure always counts toward the circuit
    /// breaker's threshold, per spec.md §4.3's "5xx above a counted
    /// threshold" fatal kind.
    ServerError,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SocketHangup => "socket_hangup",
            ErrorKind::BrokenPipe => "broken_pipe",
            ErrorKind::ConnectionAborted => "connection_aborted",
            ErrorKind::StreamPrematureClose => "stream_premature_close",
            ErrorKind::HttpParseError => "http_parse_error",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::DnsError => "dns_error",
            ErrorKind::TlsError => "tls_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Other => "other",
        }
    }

    /// True for kinds the retry engine treats as fatal-to-circuit (i.e. the
    /// circuit breaker's failure counter should advance). Transient hangups
    /// are excluded by default to avoid oscillation — see `spec.md` §4.3.
    pub fn advances_circuit_breaker(self) -> bool {
        matches!(
            self,
            ErrorKind::ConnectionRefused
                | ErrorKind::TlsError
                | ErrorKind::DnsError
                | ErrorKind::ServerError
        )
    }

    /// Classify an `io::ErrorKind` platform code. Returns `None` when the
    /// platform code doesn't map cleanly and the caller should fall back to
    /// message matching.
    fn from_io_kind(kind: io::ErrorKind) -> Option<Self> {
        match kind {
            io::ErrorKind::ConnectionRefused => Some(ErrorKind::ConnectionRefused),
            io::ErrorKind::ConnectionReset => Some(ErrorKind::SocketHangup),
            io::ErrorKind::ConnectionAborted => Some(ErrorKind::ConnectionAborted),
            io::ErrorKind::BrokenPipe => Some(ErrorKind::BrokenPipe),
            io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
            io::ErrorKind::UnexpectedEof => Some(ErrorKind::StreamPrematureClose),
            _ => None,
        }
    }

    /// Classify from a raw message string, case-sensitive substring match.
    /// `spec.md` §9 calls this out explicitly: lowercasing for "robustness"
    /// would silently change behavior tests depend on. Don't do it.
    fn from_message(msg: &str) -> Self {
        const PATTERNS: &[(&str, ErrorKind)] = &[
            ("socket hang up", ErrorKind::SocketHangup),
            ("ECONNRESET", ErrorKind::SocketHangup),
            ("broken pipe", ErrorKind::BrokenPipe),
            ("EPIPE", ErrorKind::BrokenPipe),
            ("ECONNABORTED", ErrorKind::ConnectionAborted),
            ("connection aborted", ErrorKind::ConnectionAborted),
            ("premature close", ErrorKind::StreamPrematureClose),
            ("unexpected end of", ErrorKind::StreamPrematureClose),
            ("invalid HTTP", ErrorKind::HttpParseError),
            ("parse error", ErrorKind::HttpParseError),
            ("ECONNREFUSED", ErrorKind::ConnectionRefused),
            ("connection refused", ErrorKind::ConnectionRefused),
            ("ENOTFOUND", ErrorKind::DnsError),
            ("dns error", ErrorKind::DnsError),
            ("name resolution", ErrorKind::DnsError),
            ("certificate", ErrorKind::TlsError),
            ("TLS", ErrorKind::TlsError),
            ("SSL", ErrorKind::TlsError),
            ("ETIMEDOUT", ErrorKind::Timeout),
            ("timed out", ErrorKind::Timeout),
            ("timeout", ErrorKind::Timeout),
            ("429", ErrorKind::RateLimited),
            ("rate limit", ErrorKind::RateLimited),
            ("Too Many Requests", ErrorKind::RateLimited),
        ];
        for (pattern, kind) in PATTERNS {
            if msg.contains(pattern) {
                return *kind;
            }
        }
        ErrorKind::Other
    }

    /// Classify a `std::io::Error`, falling back to message matching.
    pub fn classify_io(err: &io::Error) -> Self {
        if let Some(kind) = Self::from_io_kind(err.kind()) {
            return kind;
        }
        Self::from_message(&err.to_string())
    }

    /// Classify a `reqwest::Error`.
    pub fn classify_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return ErrorKind::Timeout;
        }
        if err.is_connect() {
            return ErrorKind::ConnectionRefused;
        }
        if let Some(status) = err.status() {
            if status.as_u16() == 429 {
                return ErrorKind::RateLimited;
            }
        }
        if let Some(source) = err.source() {
            if let Some(io_err) = source.downcast_ref::<io::Error>() {
                return Self::classify_io(io_err);
            }
        }
        Self::from_message(&err.to_string())
    }

    /// Classify an arbitrary message string. `None`/empty input returns `Other`.
    pub fn classify_message(msg: Option<&str>) -> Self {
        match msg {
            None => ErrorKind::Other,
            Some(s) if s.is_empty() => ErrorKind::Other,
            Some(s) => Self::from_message(s),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

use std::error::Error as StdError;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_message_null_is_other() {
        assert_eq!(ErrorKind::classify_message(None), ErrorKind::Other);
        assert_eq!(ErrorKind::classify_message(Some("")), ErrorKind::Other);
    }

    #[test]
    fn classify_message_is_a_pure_function() {
        for msg in [
            "socket hang up",
            "broken pipe",
            "ECONNREFUSED: connection refused",
            "certificate verify failed",
            "request timed out",
            "429 Too Many Requests",
            "something unrecognized entirely",
        ] {
            let a = ErrorKind::classify_message(Some(msg));
            let b = ErrorKind::classify_message(Some(msg));
            assert_eq!(a, b);
        }
    }

    #[test]
    fn exhaustive_message_mapping() {
        assert_eq!(
            ErrorKind::classify_message(Some("socket hang up")),
            ErrorKind::SocketHangup
        );
        assert_eq!(
            ErrorKind::classify_message(Some("broken pipe")),
            ErrorKind::BrokenPipe
        );
        assert_eq!(
            ErrorKind::classify_message(Some("ECONNABORTED")),
            ErrorKind::ConnectionAborted
        );
        assert_eq!(
            ErrorKind::classify_message(Some("premature close")),
            ErrorKind::StreamPrematureClose
        );
        assert_eq!(
            ErrorKind::classify_message(Some("invalid HTTP response")),
            ErrorKind::HttpParseError
        );
        assert_eq!(
            ErrorKind::classify_message(Some("ECONNREFUSED")),
            ErrorKind::ConnectionRefused
        );
        assert_eq!(
            ErrorKind::classify_message(Some("ENOTFOUND api.example.com")),
            ErrorKind::DnsError
        );
        assert_eq!(
            ErrorKind::classify_message(Some("certificate has expired")),
            ErrorKind::TlsError
        );
        assert_eq!(
            ErrorKind::classify_message(Some("ETIMEDOUT")),
            ErrorKind::Timeout
        );
        assert_eq!(
            ErrorKind::classify_message(Some("429")),
            ErrorKind::RateLimited
        );
        assert_eq!(
            ErrorKind::classify_message(Some("nonsense")),
            ErrorKind::Other
        );
    }

    #[test]
    fn case_sensitive_match_is_preserved() {
        // Lowercase "tls" does not match the "TLS" pattern; this is
        // intentional per spec.md's case-sensitivity note and must not
        // be "fixed" by lowercasing inputs.
        assert_eq!(
            ErrorKind::classify_message(Some("tls handshake failure")),
            ErrorKind::Other
        );
        assert_eq!(
            ErrorKind::classify_message(Some("TLS handshake failure")),
            ErrorKind::TlsError
        );
    }

    #[test]
    fn io_kind_takes_priority_over_message() {
        let err = io::Error::new(io::ErrorKind::ConnectionRefused, "some unrelated text");
        assert_eq!(ErrorKind::classify_io(&err), ErrorKind::ConnectionRefused);
    }

    #[test]
    fn unmapped_io_kind_falls_back_to_message() {
        let err = io::Error::new(io::ErrorKind::Other, "premature close of connection");
        assert_eq!(
            ErrorKind::classify_io(&err),
            ErrorKind::StreamPrematureClose
        );
    }

    #[test]
    fn advances_circuit_breaker_only_for_fatal_kinds() {
        assert!(ErrorKind::ConnectionRefused.advances_circuit_breaker());
        assert!(ErrorKind::TlsError.advances_circuit_breaker());
        assert!(ErrorKind::ServerError.advances_circuit_breaker());
        assert!(!ErrorKind::SocketHangup.advances_circuit_breaker());
        assert!(!ErrorKind::Timeout.advances_circuit_breaker());
    }
}
