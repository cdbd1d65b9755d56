/// NTRIP client error types
///
/// Failures come in two kinds: soft errors (the caster or the network let us
/// down, a reconnect may succeed) and fatal errors (bad options, a framing
/// violation, a broken environment). [`NtripError::is_fatal`] is what the
/// reconnect loop consults.
#[derive(Debug, thiserror::Error)]
pub enum NtripError {
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server name lookup failed for '{0}'.")]
    HostLookup(String),

    #[error("Can't resolve port {0}.")]
    PortLookup(String),

    #[error("Could not get the requested data: {0}")]
    CasterResponse(String),

    #[error("Connection closed.")]
    SessionClosed,

    #[error("{0}")]
    ControlConnection(&'static str),

    #[error("{0}")]
    Response(&'static str),

    #[error("Could not send NMEA")]
    NmeaSend,

    #[error("No server port number found")]
    MissingServerPort,

    #[error("No session number found")]
    MissingSession,

    #[error("Could not extract {0}")]
    MalformedField(&'static str),

    #[error("NTRIP version 2 HTTP connection failed.")]
    ModeMismatch,

    #[error("Error in chunky transfer encoding")]
    ChunkFraming,

    #[error("Requested data too long")]
    RequestTooLong,

    #[error("Username and/or password too long")]
    CredentialsTooLong,

    #[error("{0}")]
    InvalidUrl(String),

    #[error("{field} '{value}' invalid (expected 1..65535)")]
    InvalidPort { field: &'static str, value: String },

    #[error("Could not access serial device")]
    SerialAccess,

    #[error("{0}")]
    Environment(String),
}

impl NtripError {
    /// Fatal errors terminate the client; everything else goes back through
    /// the reconnect loop.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::HostLookup(_)
            | Self::CasterResponse(_)
            | Self::SessionClosed
            | Self::ControlConnection(_)
            | Self::Response(_)
            | Self::NmeaSend => false,

            Self::PortLookup(_)
            | Self::MissingServerPort
            | Self::MissingSession
            | Self::MalformedField(_)
            | Self::ModeMismatch
            | Self::ChunkFraming
            | Self::RequestTooLong
            | Self::CredentialsTooLong
            | Self::InvalidUrl(_)
            | Self::InvalidPort { .. }
            | Self::SerialAccess
            | Self::Environment(_) => true,
        }
    }

    /// Process exit code for a terminal error.
    ///
    /// Environment failures (serial device, serial logfile) use 20, every
    /// other terminal condition exits 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Environment(_) => 20,
            _ => 1,
        }
    }
}
