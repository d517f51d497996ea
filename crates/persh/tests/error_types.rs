//! Unit tests for persh error types.
//!
//! Tests verify:
//! - Display formatting carries session id or target
//! - Classification helpers
//! - Error chaining (source)
//! - Result type alias

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use persh::{AuthMethod, DisposeReason, Error, Result, SessionId};

mod display_tests {
    use super::*;

    #[test]
    fn test_connection_display() {
        let e = Error::Connection {
            target: "ops@db:22".into(),
            message: "connection refused".into(),
        };
        let msg = e.to_string();
        assert!(msg.contains("ops@db:22"));
        assert!(msg.contains("connection refused"));
    }

    #[test]
    fn test_authentication_failed_display() {
        let e = Error::AuthenticationFailed {
            target: "ops@db:22".into(),
            method: AuthMethod::PublicKey,
        };
        assert_eq!(e.to_string(), "authentication failed for ops@db:22 using publickey");
    }

    #[test]
    fn test_key_errors_are_distinguishable() {
        let missing = Error::KeyPassphraseRequired {
            path: "/home/ops/.ssh/id_ed25519".into(),
        };
        let wrong = Error::KeyDecryption {
            path: "/home/ops/.ssh/id_ed25519".into(),
            message: "bad passphrase".into(),
        };
        assert!(missing.to_string().contains("no passphrase"));
        assert!(wrong.to_string().contains("failed to decrypt"));
    }

    #[test]
    fn test_session_transport_names_session_and_target() {
        let e = Error::SessionTransport {
            session: SessionId::from("S1"),
            target: "user@box.test:22".into(),
            message: "connection reset by peer".into(),
        };
        assert_eq!(
            e.to_string(),
            "transport error on session S1 (user@box.test:22): connection reset by peer"
        );
        assert!(e.is_fatal());
    }

    #[test]
    fn test_session_errors_name_the_session() {
        let id = SessionId::from("build-1");
        assert!(Error::Busy(id.clone()).to_string().contains("build-1"));
        assert!(Error::Disposed(id.clone()).to_string().contains("build-1"));
        assert!(Error::NotConnected(id.clone()).to_string().contains("build-1"));
        let closed = Error::SessionClosed {
            session: id,
            reason: DisposeReason::InactivityTimeout,
        };
        assert_eq!(closed.to_string(), "session build-1 closed: inactivity timeout");
    }

    #[test]
    fn test_not_found_display() {
        assert_eq!(
            Error::SessionNotFound("s9".into()).to_string(),
            "session s9 does not exist"
        );
        assert_eq!(Error::HostNotFound("h9".into()).to_string(), "unknown host h9");
    }

    #[test]
    fn test_ready_timeout_display() {
        let e = Error::ReadyTimeout {
            target: "ops@db:22".into(),
            timeout: Duration::from_secs(15),
        };
        assert!(e.to_string().contains("15s"));
    }

    #[test]
    fn test_max_sessions_display() {
        assert_eq!(
            Error::MaxSessionsReached { max: 3 }.to_string(),
            "maximum sessions reached (3)"
        );
    }
}

mod classification_tests {
    use super::*;

    #[test]
    fn test_connection_class_is_fatal() {
        assert!(Error::Key("agent gone".into()).is_fatal());
        assert!(
            Error::ReadyTimeout {
                target: "t".into(),
                timeout: Duration::from_secs(1),
            }
            .is_fatal()
        );
    }

    #[test]
    fn test_caller_errors_are_not_fatal() {
        assert!(!Error::HostNotFound("h".into()).is_fatal());
        assert!(!Error::Configuration("bad".into()).is_fatal());
        assert!(!Error::SessionExists("s".into()).is_fatal());
    }

    #[test]
    fn test_only_busy_is_busy() {
        assert!(Error::Busy(SessionId::from("s")).is_busy());
        assert!(!Error::Disposed(SessionId::from("s")).is_busy());
    }
}

mod chaining_tests {
    use super::*;

    #[test]
    fn test_io_error_source() {
        let e: Error = io::Error::new(io::ErrorKind::PermissionDenied, "hosts.json").into();
        let source = e.source().unwrap();
        assert!(source.to_string().contains("hosts.json"));
    }

    #[test]
    fn test_string_variants_have_no_source() {
        assert!(Error::Transport("reset".into()).source().is_none());
    }
}

mod result_tests {
    use super::*;

    fn lookup(found: bool) -> Result<u16> {
        if found {
            Ok(22)
        } else {
            Err(Error::HostNotFound("web".into()))
        }
    }

    #[test]
    fn test_result_alias() {
        assert_eq!(lookup(true).unwrap(), 22);
        assert!(matches!(lookup(false), Err(Error::HostNotFound(_))));
    }

    #[test]
    fn test_question_mark_converts_io() {
        fn read() -> Result<()> {
            Err(io::Error::other("disk"))?;
            Ok(())
        }
        assert!(matches!(read(), Err(Error::Io(_))));
    }
}
