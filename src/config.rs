//! Request descriptor and the `ntrip:` URL grammar

use std::{fmt, path::PathBuf, str::FromStr};

use strum::{Display, EnumString, VariantNames};

use crate::{credentials::NtripCredentials, serial::SerialSettings, NtripError};

/// Caster contacted when no server is given anywhere.
pub const DEFAULT_CASTER: &str = "www.euref-ip.net";

/// Default NTRIP caster port, also used for the proxy when unset.
pub const DEFAULT_PORT: &str = "2101";

/// Transport / protocol generation used to reach the caster.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, EnumString, Display, VariantNames)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[strum(ascii_case_insensitive)]
pub enum Mode {
    /// NTRIP 2.0 caster in plain TCP/IP (HTTP) mode
    #[strum(serialize = "1", serialize = "h", serialize = "http")]
    Http,
    /// NTRIP 2.0 caster in RTSP/RTP mode
    #[strum(serialize = "2", serialize = "r", serialize = "rtsp")]
    Rtsp,
    /// NTRIP 1.0 caster
    #[strum(serialize = "3", serialize = "n", serialize = "ntrip1")]
    Ntrip1,
    /// Try NTRIP 2.0 first, fall back to 1.0 on an ICY answer
    #[default]
    #[strum(serialize = "4", serialize = "a", serialize = "auto")]
    Auto,
    /// NTRIP 2.0 caster in UDP mode
    #[strum(serialize = "5", serialize = "u", serialize = "udp")]
    Udp,
}

/// What to ask the caster for.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum MountRequest {
    /// No mountpoint: fetch the caster's sourcetable.
    #[default]
    SourceTable,
    /// A `?…` sourcetable filter (kept raw here, percent-encoded on the
    /// wire). Filter responses are one-shot like sourcetables.
    Filtered(String),
    /// Subscribe to a named stream; the only variant that reconnects.
    Stream(String),
}

impl MountRequest {
    /// Classify a raw mountpoint argument (`-m` or the URL field).
    pub fn from_arg(arg: &str) -> Self {
        if arg.is_empty() {
            Self::SourceTable
        } else if arg.starts_with('?') {
            Self::Filtered(arg.to_string())
        } else {
            Self::Stream(arg.to_string())
        }
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Path component for the request line, without the leading slash.
    pub fn path(&self) -> String {
        match self {
            Self::SourceTable => String::new(),
            Self::Filtered(filter) => percent_encode(filter),
            Self::Stream(mount) => mount.clone(),
        }
    }
}

/// Percent-encode a sourcetable filter: alphanumerics and `-`, `_`, `.` are
/// kept, everything else becomes `%hh` with lowercase hex.
pub fn percent_encode(raw: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let mut out = String::with_capacity(raw.len());
    for &b in raw.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.') {
            out.push(b as char);
        } else {
            out.push('%');
            out.push(HEX[(b >> 4) as usize] as char);
            out.push(HEX[(b & 0x0f) as usize] as char);
        }
    }
    out
}

/// Immutable request descriptor: everything one caster session needs.
///
/// Built once from the URL and/or command line flags, never mutated by the
/// session engine.
#[derive(Clone, PartialEq, Debug)]
pub struct NtripOptions {
    /// Caster host name or address.
    pub server: String,
    /// Caster port: numeric string or a service name.
    pub port: String,
    pub credentials: NtripCredentials,
    pub mount: MountRequest,
    /// Initial NMEA GGA sentence uploaded with the subscription.
    pub nmea: Option<String>,
    pub proxy_host: Option<String>,
    pub proxy_port: String,
    pub mode: Mode,
    /// Local UDP port hint for the UDP and RTSP transports (0 = OS chooses).
    pub udp_port: u16,
    /// Punch a NAT pinhole with a zero RTP packet after RTSP SETUP.
    pub init_udp: bool,
    /// Emit a bitrate line every 60 s.
    pub bitrate: bool,
    /// When set, payload goes to the serial device instead of stdout.
    pub serial: Option<SerialSettings>,
    /// Append-only tee for bytes read back from the serial receiver.
    pub serial_log: Option<PathBuf>,
}

impl Default for NtripOptions {
    fn default() -> Self {
        Self {
            server: DEFAULT_CASTER.to_string(),
            port: DEFAULT_PORT.to_string(),
            credentials: NtripCredentials::default(),
            mount: MountRequest::SourceTable,
            nmea: None,
            proxy_host: None,
            proxy_port: DEFAULT_PORT.to_string(),
            mode: Mode::Auto,
            udp_port: 0,
            init_udp: false,
            bitrate: false,
            serial: None,
            serial_log: None,
        }
    }
}

impl NtripOptions {
    /// Check the fields the parser cannot reject on its own.
    ///
    /// Numeric ports must fall in 1..=65535; non-numeric ports are service
    /// names and resolved at dial time.
    pub fn validate(&self) -> Result<(), NtripError> {
        validate_port("port", &self.port)?;
        validate_port("proxy port", &self.proxy_port)?;
        Ok(())
    }
}

fn validate_port(field: &'static str, value: &str) -> Result<(), NtripError> {
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        match value.parse::<u32>() {
            Ok(n) if (1..=65535).contains(&n) => {}
            _ => {
                return Err(NtripError::InvalidPort {
                    field,
                    value: value.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn take_until<'a>(rest: &mut &'a str, stop: &[char]) -> &'a str {
    let end = rest.find(|c| stop.contains(&c)).unwrap_or(rest.len());
    let (head, tail) = rest.split_at(end);
    *rest = tail;
    head
}

/// Parse an [NtripOptions] descriptor from an `ntrip:` URL
///
/// Grammar:
/// `ntrip:[mountpoint][/user[:password]][@[server][:port][@proxyhost[:proxyport]]][;nmea]`
///
/// Every field but the mountpoint and the NMEA sentence may be empty, in
/// which case its default applies.
///
/// ```
/// use ntrip_relay::config::{MountRequest, NtripOptions};
///
/// let opts = "ntrip:RTCM3/user:pw@caster.example.com:2101"
///     .parse::<NtripOptions>()
///     .unwrap();
///
/// assert_eq!(opts.mount, MountRequest::Stream("RTCM3".into()));
/// assert_eq!(opts.server, "caster.example.com");
/// assert_eq!(opts.credentials.user, "user");
/// ```
impl FromStr for NtripOptions {
    type Err = NtripError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut opts = NtripOptions::default();

        let mut rest = s
            .strip_prefix("ntrip:")
            .ok_or_else(|| NtripError::InvalidUrl("URL must start with 'ntrip:'.".into()))?;

        if !rest.is_empty() && !rest.starts_with('@') && !rest.starts_with('/') {
            if rest.starts_with('?') {
                // sourcetable filter: ';' belongs to the filter expression
                let filter = take_until(&mut rest, &['@', '/']);
                opts.mount = MountRequest::Filtered(filter.to_string());
            } else {
                let mount = take_until(&mut rest, &['@', '/', ';']);
                opts.mount = MountRequest::from_arg(mount);
            }
        }

        if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            let user = take_until(&mut rest, &['@', ';', ':']);
            let password = match rest.strip_prefix(':') {
                Some(r) => {
                    rest = r;
                    take_until(&mut rest, &['@', ';'])
                }
                None => "",
            };
            opts.credentials = NtripCredentials::new(user, password);
        }

        if let Some(r) = rest.strip_prefix('@') {
            rest = r;
            if !rest.starts_with('@') && !rest.starts_with(':') {
                let server = take_until(&mut rest, &['@', ':', ';']);
                if !server.is_empty() {
                    opts.server = server.to_string();
                }
            }
            if let Some(r) = rest.strip_prefix(':') {
                rest = r;
                let port = take_until(&mut rest, &['@', ';']);
                if !port.is_empty() {
                    opts.port = port.to_string();
                }
            }
            if let Some(r) = rest.strip_prefix('@') {
                rest = r;
                let proxy = take_until(&mut rest, &[':', ';']);
                if !proxy.is_empty() {
                    opts.proxy_host = Some(proxy.to_string());
                }
                if let Some(r) = rest.strip_prefix(':') {
                    rest = r;
                    let proxy_port = take_until(&mut rest, &[';']);
                    if !proxy_port.is_empty() {
                        opts.proxy_port = proxy_port.to_string();
                    }
                }
            }
        }

        if let Some(nmea) = rest.strip_prefix(';') {
            if !nmea.is_empty() {
                opts.nmea = Some(nmea.to_string());
            }
            rest = "";
        }

        if !rest.is_empty() {
            return Err(NtripError::InvalidUrl(
                "Garbage at end of server string.".into(),
            ));
        }

        opts.validate()?;
        Ok(opts)
    }
}

/// Format the descriptor back into its `ntrip:` URL form.
///
/// Only the fields the URL grammar carries appear; re-parsing the output
/// yields an equal descriptor.
impl fmt::Display for NtripOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ntrip:")?;
        match &self.mount {
            MountRequest::SourceTable => {}
            MountRequest::Filtered(filter) => write!(f, "{filter}")?,
            MountRequest::Stream(mount) => write!(f, "{mount}")?,
        }
        if !self.credentials.is_empty() {
            write!(f, "/{}", self.credentials.user)?;
            if !self.credentials.password.is_empty() {
                write!(f, ":{}", self.credentials.password)?;
            }
        }
        write!(f, "@{}:{}", self.server, self.port)?;
        if let Some(proxy) = &self.proxy_host {
            write!(f, "@{}:{}", proxy, self.proxy_port)?;
        }
        if let Some(nmea) = &self.nmea {
            write!(f, ";{nmea}")?;
        }
        Ok(())
    }
}
