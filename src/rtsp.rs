//! RTSP 1.0 control messages for the RTP data transport
//!
//! Only the four methods the caster understands are spoken: SETUP, PLAY,
//! GET_PARAMETER (as keepalive) and TEARDOWN. Responses are scanned, not
//! parsed: all the session needs back is the `server_port` from the
//! Transport header and the `Session` id.

use crate::credentials::NtripCredentials;

pub const OK_LINE: &[u8] = b"RTSP/1.0 200 OK\r\n";

/// `rtsp://host[:port]/mount` — the port only appears when the control
/// connection goes through a proxy and the origin must stay explicit.
pub fn url(server: &str, origin_port: Option<&str>, mount: &str) -> String {
    match origin_port {
        Some(port) => format!("rtsp://{server}:{port}/{mount}"),
        None => format!("rtsp://{server}/{mount}"),
    }
}

pub fn setup(
    url: &str,
    cseq: u32,
    agent: &str,
    nmea: Option<&str>,
    client_port: u16,
    credentials: &NtripCredentials,
) -> String {
    let mut req = format!(
        "SETUP {url} RTSP/1.0\r\n\
         CSeq: {cseq}\r\n\
         Ntrip-Version: Ntrip/2.0\r\n\
         Ntrip-Component: Ntripclient\r\n\
         User-Agent: {agent}\r\n"
    );
    if let Some(nmea) = nmea {
        req.push_str(&format!("Ntrip-GGA: {nmea}\r\n"));
    }
    req.push_str(&format!(
        "Transport: RTP/GNSS;unicast;client_port={client_port}"
    ));
    if !credentials.is_empty() {
        req.push_str(&format!(
            "\r\nAuthorization: {}",
            credentials.header_value()
        ));
    }
    req.push_str("\r\n\r\n");
    req
}

pub fn play(url: &str, cseq: u32, session: u32) -> String {
    format!("PLAY {url} RTSP/1.0\r\nCSeq: {cseq}\r\nSession: {session}\r\n\r\n")
}

pub fn get_parameter(url: &str, cseq: u32, session: u32) -> String {
    format!("GET_PARAMETER {url} RTSP/1.0\r\nCSeq: {cseq}\r\nSession: {session}\r\n\r\n")
}

pub fn teardown(url: &str, cseq: u32, session: u32) -> String {
    format!("TEARDOWN {url} RTSP/1.0\r\nCSeq: {cseq}\r\nSession: {session}\r\n\r\n")
}

pub fn is_ok(response: &[u8]) -> bool {
    response.starts_with(OK_LINE)
}

/// Case-insensitive substring search.
pub(crate) fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len()).find(|&i| {
        haystack[i..i + needle.len()]
            .iter()
            .zip(needle)
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Find `needle` (case-insensitively), parse the decimal digits that follow
/// and require the run to end on one of `terminators`.
///
/// `Ok(None)` when the field is absent, `Err(())` when it is present but
/// malformed.
pub(crate) fn scan_digits(
    response: &[u8],
    needle: &[u8],
    terminators: &[u8],
) -> Result<Option<u32>, ()> {
    let Some(start) = find_ci(response, needle) else {
        return Ok(None);
    };

    let mut pos = start + needle.len();
    let mut value: u32 = 0;
    let mut digits = 0;
    while pos < response.len() && response[pos].is_ascii_digit() {
        value = value
            .wrapping_mul(10)
            .wrapping_add((response[pos] - b'0') as u32);
        pos += 1;
        digits += 1;
    }

    if digits == 0 || pos >= response.len() || !terminators.contains(&response[pos]) {
        return Err(());
    }
    Ok(Some(value))
}

/// `server_port=<digits>` from the SETUP reply's Transport header,
/// terminated by `\r` or `;`.
pub fn server_port(response: &[u8]) -> Result<Option<u16>, ()> {
    Ok(scan_digits(response, b"server_port=", b"\r;")?.map(|p| p as u16))
}

/// `Session: <digits>` terminated by `\r`.
pub fn session_id(response: &[u8]) -> Result<Option<u32>, ()> {
    scan_digits(response, b"session: ", b"\r")
}
