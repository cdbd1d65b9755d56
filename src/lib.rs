//! NTRIP streaming client library
//!
//! Connects to an NTRIP caster, subscribes to a mountpoint and relays the
//! opaque correction stream to a sink (stdout, a serial GNSS receiver, or a
//! channel). Speaks NTRIP 1.0, NTRIP 2.0 over HTTP (plain and chunked),
//! NTRIP 2.0 over RTSP/RTP and NTRIP 2.0 over plain UDP, with automatic
//! fallback from 2.0 to 1.0.

pub mod chunked;
pub mod config;
pub mod credentials;
pub mod dialer;
pub mod nmea;
pub mod rtp;
pub mod rtsp;
pub mod serial;
pub mod session;
pub mod sourcetable;
pub mod watchdog;

mod error;
pub use error::NtripError;

pub use config::{Mode, MountRequest, NtripOptions};
pub use credentials::NtripCredentials;
pub use session::{PayloadStream, SessionEngine, Sink};

/// User-Agent value announced in every request.
pub(crate) fn user_agent() -> String {
    format!(
        "NTRIP {}/{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
}
