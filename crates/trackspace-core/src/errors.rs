/// Why an upgrade request was refused before a connection existed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("not a websocket upgrade: {0}")]
    NotUpgrade(String),
    #[error("origin not allowed: {0}")]
    OriginRejected(String),
    #[error("connection limit reached ({0})")]
    AtCapacity(usize),
    #[error("hub is shutting down")]
    HubClosed,
}

impl HandshakeError {
    /// HTTP status returned to the caller instead of `101 Switching Protocols`.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotUpgrade(_) => 400,
            Self::OriginRejected(_) => 403,
            Self::AtCapacity(_) | Self::HubClosed => 503,
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotUpgrade(_) => "not_upgrade",
            Self::OriginRejected(_) => "origin_rejected",
            Self::AtCapacity(_) => "at_capacity",
            Self::HubClosed => "hub_closed",
        }
    }
}

/// Failures on an established connection, or while the hub is processing
/// its commands.
///
/// Read and write failures tear down the connection they happened on and
/// never the hub.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("read failed: {0}")]
    Read(String),
    #[error("write failed: {0}")]
    Write(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("hub is closed")]
    Closed,
}

impl HubError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Handshake(inner) => inner.error_kind(),
            Self::Read(_) => "read_error",
            Self::Write(_) => "write_error",
            Self::MalformedMessage(_) => "malformed_message",
            Self::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_status_mapping() {
        assert_eq!(HandshakeError::NotUpgrade("GET".into()).http_status(), 400);
        assert_eq!(HandshakeError::OriginRejected("http://evil".into()).http_status(), 403);
        assert_eq!(HandshakeError::AtCapacity(8).http_status(), 503);
        assert_eq!(HandshakeError::HubClosed.http_status(), 503);
    }

    #[test]
    fn handshake_converts_into_hub_error() {
        let err: HubError = HandshakeError::AtCapacity(2).into();
        assert_eq!(err.error_kind(), "at_capacity");
        assert_eq!(err.to_string(), "connection limit reached (2)");
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(HubError::Read(String::new()).error_kind(), "read_error");
        assert_eq!(HubError::Write(String::new()).error_kind(), "write_error");
        assert_eq!(HandshakeError::OriginRejected(String::new()).error_kind(), "origin_rejected");
    }

    #[test]
    fn display_includes_detail() {
        let err = HubError::Write("timed out after 5s".into());
        assert_eq!(err.to_string(), "write failed: timed out after 5s");
    }
}
