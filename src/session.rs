//! The NTRIP session engine
//!
//! One engine drives one subscription: it picks the transport from the
//! configured [Mode], speaks the protocol handshake, demultiplexes the
//! payload and pushes it into the selected [Sink]. Soft failures loop back
//! through an additive backoff; fatal ones surface to the caller.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, UdpSocket},
    sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
};
use tracing::{debug, error, info, warn};

use crate::{
    chunked::ChunkDecoder,
    config::{Mode, MountRequest, NtripOptions},
    dialer,
    rtp::{self, RtpHeader, SequenceWindow, Verdict, HEADER_LEN, PT_DATA, PT_REQUEST, PT_TEARDOWN},
    rtsp,
    serial::SerialBridge,
    sourcetable::SourceTable,
    watchdog::{Shutdown, Watchdog},
    NtripError,
};

/// Upper bound for a TCP protocol message, request or response header.
const MAX_REQUEST: usize = 1000;

/// Largest datagram either side sends.
const MAX_DATAGRAM: usize = 1526;

/// Response headers larger than this are not a caster.
const HEADER_CAP: usize = 16 * 1024;

/// Cadence of RTP / GET_PARAMETER keepalives.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Cadence of `--bitrate` reporting.
const REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Where payload bytes go.
pub enum Sink {
    /// Binary stdout, flushed per packet.
    Stdout(tokio::io::Stdout),
    /// A GNSS receiver on a serial line.
    Serial(SerialBridge),
    /// Payload blocks handed to a [PayloadStream].
    Channel(UnboundedSender<Vec<u8>>),
    /// In-memory capture, for tests.
    Capture(Vec<u8>),
}

impl Sink {
    pub fn stdout() -> Self {
        Self::Stdout(tokio::io::stdout())
    }

    pub fn capture() -> Self {
        Self::Capture(Vec::new())
    }

    /// A sink feeding a [PayloadStream] of payload blocks.
    pub fn channel() -> (Self, PayloadStream) {
        let (tx, rx) = unbounded_channel();
        (Self::Channel(tx), PayloadStream(rx))
    }

    /// Serial bridge when a device is configured, stdout otherwise.
    pub fn for_options(opts: &NtripOptions) -> Result<Self, NtripError> {
        match &opts.serial {
            Some(settings) => Ok(Self::Serial(SerialBridge::new(
                settings,
                opts.serial_log.as_deref(),
            )?)),
            None => Ok(Self::stdout()),
        }
    }

    async fn deliver(&mut self, data: &[u8]) -> Result<(), NtripError> {
        match self {
            Self::Stdout(out) => {
                out.write_all(data).await?;
                out.flush().await?;
                Ok(())
            }
            Self::Serial(bridge) => bridge.deliver(data).await,
            Self::Channel(tx) => {
                let _ = tx.send(data.to_vec());
                Ok(())
            }
            Self::Capture(buf) => {
                buf.extend_from_slice(data);
                Ok(())
            }
        }
    }
}

/// Payload blocks from a [Sink::channel] sink.
pub struct PayloadStream(UnboundedReceiver<Vec<u8>>);

impl futures::Stream for PayloadStream {
    type Item = Vec<u8>;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}

/// Additive reconnect backoff: sleep grows by 2 s per consecutive failure
/// and any forwarded payload byte resets it.
#[derive(Default)]
struct Backoff {
    sleeptime: u64,
}

impl Backoff {
    /// Delay to wait before the next attempt.
    fn delay(&mut self) -> Duration {
        if self.sleeptime == 0 {
            self.sleeptime = 1;
            Duration::ZERO
        } else {
            let delay = self.sleeptime;
            self.sleeptime += 2;
            Duration::from_secs(delay)
        }
    }

    fn reset(&mut self) {
        self.sleeptime = 0;
    }
}

/// Throughput counters for the 60-second bitrate report.
struct Throughput {
    enabled: bool,
    start: Instant,
    last_report: Instant,
    total: u64,
}

impl Throughput {
    fn new(enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            enabled,
            start: now,
            last_report: now,
            total: 0,
        }
    }

    fn add(&mut self, n: usize) {
        match self.total.checked_add(n as u64) {
            Some(total) => self.total = total,
            None => {
                // counter overflow resets the whole window
                self.total = 0;
                self.start = Instant::now();
                self.last_report = self.start;
            }
        }
    }

    fn report(&mut self) {
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_report) > REPORT_INTERVAL {
            self.last_report = now;
            let secs = now.duration_since(self.start).as_secs().max(1);
            info!(
                "Bitrate is {}byte/s ({} seconds accumulated).",
                self.total / secs,
                secs
            );
        }
    }
}

/// RTP keepalive clock: sequence counter plus a timestamp that advances with
/// wallclock at the caster's resolution.
struct RtpClock {
    seq: u16,
    tim: u32,
    last: Instant,
}

impl RtpClock {
    fn new(seq: u16, tim: u32) -> Self {
        Self {
            seq,
            tim,
            last: Instant::now(),
        }
    }

    fn due(&self) -> bool {
        self.last.elapsed() > KEEPALIVE_INTERVAL
    }

    /// Advance to now; returns the sequence/timestamp to stamp on the next
    /// packet.
    fn tick(&mut self) -> (u16, u32) {
        let secs = self.last.elapsed().as_secs() as u32;
        self.tim = self
            .tim
            .wrapping_add(secs.wrapping_mul(1_000_000 / rtp::TIME_RESOLUTION));
        self.last = Instant::now();
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        (seq, self.tim)
    }
}

/// Where a connection attempt dials, and how the request line names the
/// origin when a proxy sits in between.
struct DialPlan {
    host: String,
    port: String,
    /// `(origin server, numeric origin port)` for absolute-URI request lines.
    absolute: Option<(String, u16)>,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// First line of a response with non-printables replaced by `.`, for
/// one-line diagnostics.
fn printable_line(bytes: &[u8]) -> String {
    bytes
        .iter()
        .take_while(|&&b| b != b'\r' && b != b'\n')
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '.'
            }
        })
        .collect()
}

/// How the caster answered an HTTP subscription request.
enum HttpIntro {
    /// NTRIP 2.0: full headers plus whatever body bytes came with them.
    Ntrip2 { headers: Vec<u8>, body: Vec<u8> },
    /// NTRIP 1.0 `ICY` banner; everything after it is payload.
    Icy { body: Vec<u8> },
    /// Anything else, reduced to a printable status line.
    Other { line: String },
}

async fn read_http_intro(
    stream: &mut TcpStream,
    watchdog: &Watchdog,
) -> Result<HttpIntro, NtripError> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);

    let eol = loop {
        if let Some(eol) = find(&buf, b"\r\n") {
            break eol;
        }
        if buf.len() > HEADER_CAP {
            return Ok(HttpIntro::Other {
                line: printable_line(&buf),
            });
        }
        let n = stream.read_buf(&mut buf).await?;
        watchdog.rearm();
        if n == 0 {
            return Ok(HttpIntro::Other {
                line: printable_line(&buf),
            });
        }
    };

    if buf.starts_with(b"ICY 200 OK") {
        // data follows the status line; swallow the blank line if the
        // caster sends one
        while buf.len() < eol + 4 {
            let n = stream.read_buf(&mut buf).await?;
            watchdog.rearm();
            if n == 0 {
                break;
            }
        }
        let mut body_start = (eol + 2).min(buf.len());
        if buf[body_start..].starts_with(b"\r\n") {
            body_start += 2;
        }
        return Ok(HttpIntro::Icy {
            body: buf.split_off(body_start),
        });
    }

    if buf.starts_with(b"HTTP/1.1 200 OK") || buf.starts_with(b"HTTP/1.0 200 OK") {
        let header_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if buf.len() > HEADER_CAP {
                return Ok(HttpIntro::Other {
                    line: printable_line(&buf),
                });
            }
            let n = stream.read_buf(&mut buf).await?;
            watchdog.rearm();
            if n == 0 {
                return Ok(HttpIntro::Other {
                    line: printable_line(&buf),
                });
            }
        };

        let body = buf.split_off(header_end);
        // a proxy may wrap an NTRIP 1.0 caster's ICY banner in its own
        // status line
        if find(&buf, b"ICY 200 OK").is_some() {
            return Ok(HttpIntro::Icy { body });
        }
        return Ok(HttpIntro::Ntrip2 { headers: buf, body });
    }

    Ok(HttpIntro::Other {
        line: printable_line(&buf),
    })
}

async fn read_rtsp_reply(
    stream: &mut TcpStream,
    watchdog: &Watchdog,
) -> Result<Vec<u8>, NtripError> {
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        if find(&buf, b"\r\n\r\n").is_some() {
            return Ok(buf);
        }
        if buf.len() > HEADER_CAP {
            return Err(NtripError::CasterResponse(printable_line(&buf)));
        }
        let n = stream.read_buf(&mut buf).await?;
        watchdog.rearm();
        if n == 0 {
            return Err(NtripError::ControlConnection("Control connection closed"));
        }
    }
}

/// Drives one subscription from connect to teardown, reconnecting on soft
/// failures.
pub struct SessionEngine {
    opts: NtripOptions,
    sink: Sink,
    watchdog: Arc<Watchdog>,
    shutdown: Shutdown,
}

impl SessionEngine {
    pub fn new(
        opts: NtripOptions,
        sink: Sink,
        watchdog: Arc<Watchdog>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            opts,
            sink,
            watchdog,
            shutdown,
        }
    }

    /// Run until the stream ends, the user interrupts, or a fatal error.
    ///
    /// Only stream subscriptions reconnect; sourcetable and filter fetches
    /// are one-shot.
    pub async fn run(&mut self) -> Result<(), NtripError> {
        let mut backoff = Backoff::default();
        let mut exit_rx = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_set() {
                return Ok(());
            }

            let delay = backoff.delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = exit_rx.recv() => return Ok(()),
                }
            }
            self.watchdog.rearm();

            match self.attempt(&mut backoff).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("{e}");
                    if !self.opts.mount.is_stream() || self.shutdown.is_set() {
                        return Err(e);
                    }
                    debug!("reconnecting");
                }
            }
        }
    }

    async fn attempt(&mut self, backoff: &mut Backoff) -> Result<(), NtripError> {
        match (self.opts.mode, self.opts.mount.is_stream()) {
            (Mode::Udp, _) => self.run_udp(backoff).await,
            (Mode::Rtsp, true) => self.run_rtsp(backoff).await,
            _ => self.run_http(backoff).await,
        }
    }

    fn dial_plan(&self) -> Result<DialPlan, NtripError> {
        match &self.opts.proxy_host {
            Some(proxy) => Ok(DialPlan {
                host: proxy.clone(),
                port: self.opts.proxy_port.clone(),
                absolute: Some((self.opts.server.clone(), dialer::service_port(&self.opts.port)?)),
            }),
            None => Ok(DialPlan {
                host: self.opts.server.clone(),
                port: self.opts.port.clone(),
                absolute: None,
            }),
        }
    }

    /// The HTTP request for the TCP transports (NTRIP 1 and 2 share it).
    fn http_request(&self, plan: &DialPlan) -> Result<String, NtripError> {
        let prefix = match &plan.absolute {
            Some((server, port)) => format!("http://{server}:{port}"),
            None => String::new(),
        };
        let path = self.opts.mount.path();

        let mut req = format!("GET {prefix}/{path} HTTP/1.1\r\nHost: {}\r\n", self.opts.server);
        if self.opts.mode != Mode::Ntrip1 {
            req.push_str("Ntrip-Version: Ntrip/2.0\r\n");
        }
        req.push_str(&format!("User-Agent: {}\r\n", crate::user_agent()));

        if self.opts.mount == MountRequest::SourceTable {
            req.push_str("Connection: close\r\n\r\n");
            return Ok(req);
        }

        // NTRIP 2 carries the position as a header, NTRIP 1 as request body
        let nmea_header = self
            .opts
            .nmea
            .as_deref()
            .filter(|_| self.opts.mode == Mode::Http);
        if let Some(nmea) = nmea_header {
            req.push_str(&format!("Ntrip-GGA: {nmea}\r\n"));
        }
        req.push_str("Connection: close");
        if req.len() > MAX_REQUEST - 40 {
            return Err(NtripError::RequestTooLong);
        }

        if !self.opts.credentials.is_empty() {
            req.push_str(&format!(
                "\r\nAuthorization: {}",
                self.opts.credentials.header_value()
            ));
            if req.len() > MAX_REQUEST - 4 {
                return Err(NtripError::CredentialsTooLong);
            }
        }
        req.push_str("\r\n\r\n");

        if let Some(nmea) = self.opts.nmea.as_deref() {
            if nmea_header.is_none() {
                req.push_str(&format!("{nmea}\r\n"));
                if req.len() > MAX_REQUEST {
                    return Err(NtripError::RequestTooLong);
                }
            }
        }
        Ok(req)
    }

    /// The HTTP request carried inside the initial UDP RTP packet.
    fn udp_request(&self) -> Result<String, NtripError> {
        let mut req = format!(
            "GET /{} HTTP/1.1\r\nHost: {}\r\nNtrip-Version: Ntrip/2.0\r\nUser-Agent: {}\r\n",
            self.opts.mount.path(),
            self.opts.server,
            crate::user_agent()
        );
        if let Some(nmea) = self.opts.nmea.as_deref() {
            req.push_str(&format!("Ntrip-GGA: {nmea}\r\n"));
        }
        req.push_str("Connection: close");
        if req.len() > MAX_DATAGRAM - HEADER_LEN - 40 {
            return Err(NtripError::RequestTooLong);
        }
        if !self.opts.credentials.is_empty() {
            req.push_str(&format!(
                "\r\nAuthorization: {}",
                self.opts.credentials.header_value()
            ));
            if req.len() > MAX_DATAGRAM - HEADER_LEN - 4 {
                return Err(NtripError::CredentialsTooLong);
            }
        }
        req.push_str("\r\n\r\n");
        Ok(req)
    }

    // --- HTTP / NTRIP1 / AUTO -------------------------------------------

    async fn run_http(&mut self, backoff: &mut Backoff) -> Result<(), NtripError> {
        let plan = self.dial_plan()?;
        let addr = dialer::resolve(&plan.host, &plan.port).await?;
        let mut stream = dialer::connect_tcp(addr).await?;

        let request = self.http_request(&plan)?;
        stream.write_all(request.as_bytes()).await?;
        debug!("connected to {addr}, request sent");

        if !self.opts.mount.is_stream() {
            return self.fetch_oneshot(stream).await;
        }

        let intro = read_http_intro(&mut stream, &self.watchdog).await?;
        let (chunked, residual) = match intro {
            HttpIntro::Other { line } => return Err(NtripError::CasterResponse(line)),
            HttpIntro::Icy { body } => {
                match self.opts.mode {
                    Mode::Http => return Err(NtripError::ModeMismatch),
                    Mode::Auto => {
                        error!("NTRIP version 2 HTTP connection failed, falling back to NTRIP1.")
                    }
                    _ => {}
                }
                (false, body)
            }
            HttpIntro::Ntrip2 { headers, body } => {
                if find(&headers, b"Content-Type: gnss/data\r\n").is_none() {
                    return Err(NtripError::Response("No 'Content-Type: gnss/data' found"));
                }
                let chunked = find(&headers, b"Transfer-Encoding: chunked\r\n").is_some();
                (chunked, body)
            }
        };

        self.pump_http(stream, residual, chunked, backoff).await
    }

    async fn pump_http(
        &mut self,
        mut stream: TcpStream,
        residual: Vec<u8>,
        chunked: bool,
        backoff: &mut Backoff,
    ) -> Result<(), NtripError> {
        let mut decoder = if chunked { Some(ChunkDecoder::new()) } else { None };
        let mut throughput = Throughput::new(self.opts.bitrate);
        let mut exit_rx = self.shutdown.subscribe();
        let mut buf = [0u8; 1024];

        if !residual.is_empty() {
            self.forward(&residual, &mut decoder, &mut throughput, backoff)
                .await?;
            self.serial_reverse(&mut stream).await?;
        }

        loop {
            if self.shutdown.is_set() {
                return Ok(());
            }

            let n = tokio::select! {
                biased;
                r = stream.read(&mut buf) => r?,
                _ = exit_rx.recv() => return Ok(()),
            };
            self.watchdog.rearm();
            if n == 0 {
                // the caster ended the stream
                return Ok(());
            }

            self.forward(&buf[..n], &mut decoder, &mut throughput, backoff)
                .await?;
            self.serial_reverse(&mut stream).await?;
            throughput.report();
        }
    }

    async fn forward(
        &mut self,
        data: &[u8],
        decoder: &mut Option<ChunkDecoder>,
        throughput: &mut Throughput,
        backoff: &mut Backoff,
    ) -> Result<(), NtripError> {
        backoff.reset();
        match decoder {
            Some(decoder) => {
                let mut out = Vec::with_capacity(data.len());
                decoder.feed(data, &mut out)?;
                throughput.add(out.len());
                self.sink.deliver(&out).await
            }
            None => {
                throughput.add(data.len());
                self.sink.deliver(data).await
            }
        }
    }

    /// Serial return path: mirror receiver bytes and upload completed GGA
    /// sentences on the control socket.
    async fn serial_reverse(&mut self, stream: &mut TcpStream) -> Result<(), NtripError> {
        if let Sink::Serial(bridge) = &mut self.sink {
            for sentence in bridge.drain().await? {
                stream
                    .write_all(&sentence)
                    .await
                    .map_err(|_| NtripError::NmeaSend)?;
            }
        }
        Ok(())
    }

    /// One-shot fetch: sourcetables and filter queries. The response
    /// envelope is stripped, the body relayed until EOF.
    async fn fetch_oneshot(&mut self, mut stream: TcpStream) -> Result<(), NtripError> {
        let mut buf: Vec<u8> = Vec::with_capacity(4096);
        let header_end = loop {
            if let Some(pos) = find(&buf, b"\r\n\r\n") {
                break pos + 4;
            }
            if buf.len() > HEADER_CAP {
                return Err(NtripError::CasterResponse(printable_line(&buf)));
            }
            let n = stream.read_buf(&mut buf).await?;
            self.watchdog.rearm();
            if n == 0 {
                return Err(NtripError::CasterResponse(printable_line(&buf)));
            }
        };

        if find(&buf[..header_end], b"200 OK").is_none() {
            return Err(NtripError::CasterResponse(printable_line(&buf)));
        }

        let mut archive = buf.split_off(header_end);
        if !archive.is_empty() {
            self.sink.deliver(&archive).await?;
        }

        let mut exit_rx = self.shutdown.subscribe();
        let mut chunk = [0u8; 1024];
        loop {
            if self.shutdown.is_set() {
                break;
            }
            let n = tokio::select! {
                biased;
                r = stream.read(&mut chunk) => r?,
                _ = exit_rx.recv() => break,
            };
            self.watchdog.rearm();
            if n == 0 {
                break;
            }
            self.sink.deliver(&chunk[..n]).await?;
            archive.extend_from_slice(&chunk[..n]);
        }

        self.log_sourcetable(&archive);
        Ok(())
    }

    fn log_sourcetable(&self, body: &[u8]) {
        let text = String::from_utf8_lossy(body);
        let table = SourceTable::parse(text.lines());
        if !table.mounts.is_empty() {
            debug!("sourcetable lists {} mounts", table.mounts.len());
        }
    }

    // --- UDP (NTRIP 2 over plain UDP) -----------------------------------

    async fn run_udp(&mut self, backoff: &mut Backoff) -> Result<(), NtripError> {
        let plan = self.dial_plan()?;
        let addr = dialer::resolve(&plan.host, &plan.port).await?;
        let sock = dialer::bind_connect_udp(self.opts.udp_port, addr).await?;

        let request_header = RtpHeader {
            payload_type: PT_REQUEST,
            sequence: rand::random(),
            timestamp: rand::random(),
            ssrc: rand::random(),
        };
        let request = self.udp_request()?;
        let mut packet = BytesMut::with_capacity(HEADER_LEN + request.len());
        request_header.encode_into(&mut packet);
        packet.extend_from_slice(request.as_bytes());

        let mut clock = RtpClock::new(
            request_header.sequence.wrapping_add(1),
            request_header.timestamp,
        );
        let mut session = request_header.ssrc;

        sock.send(&packet).await?;
        debug!("UDP request sent to {addr}");

        let mut dgram = [0u8; MAX_DATAGRAM];
        let mut exit_rx = self.shutdown.subscribe();
        let n = tokio::select! {
            r = sock.recv(&mut dgram) => r?,
            _ = exit_rx.recv() => return Ok(()),
        };
        self.watchdog.rearm();

        if n < HEADER_LEN + 17 {
            return Err(NtripError::CasterResponse(printable_line(
                &dgram[HEADER_LEN.min(n)..n],
            )));
        }
        let response = &dgram[HEADER_LEN..n];
        if !response.starts_with(b"HTTP/1.1 200 OK\r\n")
            && !response.starts_with(b"HTTP/1.0 200 OK\r\n")
        {
            return Err(NtripError::CasterResponse(printable_line(response)));
        }

        if find(response, b"Content-Type: gnss/data\r\n").is_some() {
            // adopt the caster's session id when it assigns one
            match rtsp::session_id(response) {
                Ok(Some(id)) => session = id,
                Ok(None) => {}
                Err(()) => return Err(NtripError::MalformedField("session number")),
            }
        } else if find(response, b"Content-Type: gnss/sourcetable\r\n").is_some() {
            let response = response.to_vec();
            return self.udp_sourcetable(&sock, response).await;
        } else {
            return Err(NtripError::Response(
                "No 'Content-Type: gnss/data' or 'Content-Type: gnss/sourcetable' found",
            ));
        }

        let result = self.udp_pump(&sock, session, &mut clock, backoff).await;

        // end-of-session packet, best effort
        let (seq, tim) = clock.tick();
        let bye = RtpHeader {
            payload_type: PT_TEARDOWN,
            sequence: seq,
            timestamp: tim,
            ssrc: session,
        };
        let _ = sock.send(&bye.encode()).await;
        result
    }

    /// A sourcetable served over UDP: bounded by Content-Length, spanning as
    /// many datagrams as it takes.
    async fn udp_sourcetable(
        &mut self,
        sock: &UdpSocket,
        response: Vec<u8>,
    ) -> Result<(), NtripError> {
        let Some(header_end) = find(&response, b"\r\n\r\n") else {
            return Err(NtripError::MalformedField("content length"));
        };
        let length = match rtsp::scan_digits(&response, b"Content-Length: ", b"\r") {
            Ok(Some(length)) => length as usize,
            _ => return Err(NtripError::MalformedField("content length")),
        };

        let mut archive = Vec::with_capacity(length);
        archive.extend_from_slice(&response[header_end + 4..]);
        if !archive.is_empty() {
            self.sink.deliver(&archive).await?;
        }

        let mut dgram = [0u8; MAX_DATAGRAM];
        while archive.len() < length {
            let n = sock.recv(&mut dgram).await?;
            self.watchdog.rearm();
            if n <= HEADER_LEN {
                break;
            }
            let payload = &dgram[HEADER_LEN..n];
            self.sink.deliver(payload).await?;
            archive.extend_from_slice(payload);
        }

        self.log_sourcetable(&archive);
        Ok(())
    }

    async fn udp_pump(
        &mut self,
        sock: &UdpSocket,
        session: u32,
        clock: &mut RtpClock,
        backoff: &mut Backoff,
    ) -> Result<(), NtripError> {
        let mut window = SequenceWindow::new(session);
        let mut dgram = [0u8; MAX_DATAGRAM];
        let mut exit_rx = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_set() {
                return Ok(());
            }

            tokio::select! {
                biased;
                r = sock.recv(&mut dgram) => {
                    let n = r?;
                    self.watchdog.rearm();
                    match rtp::split_packet(&dgram[..n]) {
                        Some((header, payload))
                            if (PT_DATA..=PT_TEARDOWN).contains(&header.payload_type) =>
                        {
                            match window.observe(&header, true) {
                                Verdict::Reject => warn!("Illegal UDP data received."),
                                Verdict::Forward => {
                                    if header.payload_type == PT_TEARDOWN {
                                        return Err(NtripError::SessionClosed);
                                    }
                                    if header.payload_type == PT_DATA && !payload.is_empty() {
                                        backoff.reset();
                                        self.sink.deliver(payload).await?;
                                    }
                                }
                                Verdict::Drop => {}
                            }
                        }
                        _ => warn!("Illegal UDP header."),
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = exit_rx.recv() => return Ok(()),
            }

            if clock.due() {
                let (seq, tim) = clock.tick();
                let keepalive = RtpHeader {
                    payload_type: PT_DATA,
                    sequence: seq,
                    timestamp: tim,
                    ssrc: session,
                };
                sock.send(&keepalive.encode()).await?;
            }
        }
    }

    // --- RTSP -----------------------------------------------------------

    async fn run_rtsp(&mut self, backoff: &mut Backoff) -> Result<(), NtripError> {
        let plan = self.dial_plan()?;
        let addr = dialer::resolve(&plan.host, &plan.port).await?;

        // data socket first, its local port goes into the Transport header
        let udp = dialer::bind_udp(self.opts.udp_port, addr).await?;
        let local_port = udp.local_addr()?.port();
        let mut tcp = dialer::connect_tcp(addr).await?;

        let origin_port = plan.absolute.as_ref().map(|(_, port)| port.to_string());
        let url = rtsp::url(
            &self.opts.server,
            origin_port.as_deref(),
            &self.opts.mount.path(),
        );
        let mut cseq: u32 = 1;

        let setup = rtsp::setup(
            &url,
            cseq,
            &crate::user_agent(),
            self.opts.nmea.as_deref(),
            local_port,
            &self.opts.credentials,
        );
        cseq += 1;
        if setup.len() > MAX_REQUEST {
            return Err(NtripError::RequestTooLong);
        }
        tcp.write_all(setup.as_bytes()).await?;

        let reply = read_rtsp_reply(&mut tcp, &self.watchdog).await?;
        if !rtsp::is_ok(&reply) {
            return Err(NtripError::Response(
                "Could not setup initial control connection.",
            ));
        }
        let server_port = match rtsp::server_port(&reply) {
            Ok(Some(port)) => port,
            Ok(None) => return Err(NtripError::MissingServerPort),
            Err(()) => return Err(NtripError::MalformedField("server port")),
        };
        let session = match rtsp::session_id(&reply) {
            Ok(Some(session)) => session,
            Ok(None) => return Err(NtripError::MissingSession),
            Err(()) => return Err(NtripError::MalformedField("session number")),
        };
        debug!("RTSP session {session}, caster data port {server_port}");

        if self.opts.init_udp {
            info!("Sending initial UDP packet");
            let pinhole = RtpHeader {
                payload_type: PT_DATA,
                sequence: 0,
                timestamp: 0,
                ssrc: session,
            };
            let caster_rtp = SocketAddr::new(addr.ip(), server_port);
            if udp.send_to(&pinhole.encode(), caster_rtp).await.is_err() {
                warn!("could not send initial UDP packet");
            }
        }

        let play = rtsp::play(&url, cseq, session);
        cseq += 1;
        tcp.write_all(play.as_bytes()).await?;
        let reply = read_rtsp_reply(&mut tcp, &self.watchdog).await?;
        if !rtsp::is_ok(&reply) {
            return Err(NtripError::Response("Could not start data stream."));
        }

        let result = self
            .rtsp_pump(&udp, &mut tcp, &url, &mut cseq, session, backoff)
            .await;

        let bye = rtsp::teardown(&url, cseq, session);
        let _ = tcp.write_all(bye.as_bytes()).await;
        result
    }

    async fn rtsp_pump(
        &mut self,
        udp: &UdpSocket,
        tcp: &mut TcpStream,
        url: &str,
        cseq: &mut u32,
        session: u32,
        backoff: &mut Backoff,
    ) -> Result<(), NtripError> {
        let mut window = SequenceWindow::new(session);
        let mut keepalive: Option<Instant> = None;
        let mut dgram = [0u8; MAX_DATAGRAM];
        let mut ctl = [0u8; 1024];
        let mut exit_rx = self.shutdown.subscribe();

        loop {
            if self.shutdown.is_set() {
                return Ok(());
            }

            tokio::select! {
                biased;
                r = udp.recv_from(&mut dgram) => {
                    let (n, _from) = r?;
                    self.watchdog.rearm();
                    match rtp::split_packet(&dgram[..n]) {
                        Some((header, payload))
                            if header.payload_type == PT_DATA && n > HEADER_LEN =>
                        {
                            if !window.is_primed() {
                                // first packet initialises the marks and
                                // arms the keepalive
                                window.observe(&header, false);
                                keepalive = Some(Instant::now());
                            } else {
                                match window.observe(&header, false) {
                                    Verdict::Reject => warn!("Illegal UDP data received."),
                                    Verdict::Forward => {
                                        backoff.reset();
                                        self.sink.deliver(payload).await?;
                                    }
                                    Verdict::Drop => {}
                                }
                            }
                        }
                        _ => warn!("Illegal UDP header."),
                    }
                }
                r = tcp.read(&mut ctl) => {
                    self.watchdog.rearm();
                    match r {
                        Ok(0) => {
                            return Err(NtripError::ControlConnection(
                                "Control connection read error",
                            ))
                        }
                        Ok(_) => {} // RTSP replies are ignored
                        Err(_) => {
                            return Err(NtripError::ControlConnection(
                                "Control connection closed",
                            ))
                        }
                    }
                }
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = exit_rx.recv() => return Ok(()),
            }

            if keepalive.is_some_and(|last| last.elapsed() > KEEPALIVE_INTERVAL) {
                let message = rtsp::get_parameter(url, *cseq, session);
                *cseq += 1;
                tcp.write_all(message.as_bytes()).await?;
                keepalive = Some(Instant::now());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::watchdog::ALARM_TIME;
    use tokio::net::TcpListener;

    fn local_opts(port: u16) -> NtripOptions {
        NtripOptions {
            server: "127.0.0.1".to_string(),
            port: port.to_string(),
            ..Default::default()
        }
    }

    fn test_engine(opts: NtripOptions) -> SessionEngine {
        SessionEngine::new(
            opts,
            Sink::capture(),
            Watchdog::new(ALARM_TIME),
            Shutdown::new(),
        )
    }

    fn captured(engine: &SessionEngine) -> &[u8] {
        match &engine.sink {
            Sink::Capture(buf) => buf,
            _ => &[],
        }
    }

    async fn read_request(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        loop {
            if find(&buf, b"\r\n\r\n").is_some() {
                return String::from_utf8_lossy(&buf).to_string();
            }
            let n = stream.read_buf(&mut buf).await.unwrap();
            if n == 0 {
                return String::from_utf8_lossy(&buf).to_string();
            }
        }
    }

    #[test]
    fn reconnect_backoff_schedule() {
        let mut backoff = Backoff::default();
        assert_eq!(backoff.delay(), Duration::ZERO); // first attempt
        assert_eq!(backoff.delay(), Duration::from_secs(1));
        assert_eq!(backoff.delay(), Duration::from_secs(3));
        assert_eq!(backoff.delay(), Duration::from_secs(5));

        backoff.reset(); // a payload byte arrived
        assert_eq!(backoff.delay(), Duration::ZERO);
        assert_eq!(backoff.delay(), Duration::from_secs(1));
    }

    #[test]
    fn printable_lines_mask_binary() {
        assert_eq!(printable_line(b"HTTP/1.1 404 Not Found\r\nrest"), "HTTP/1.1 404 Not Found");
        assert_eq!(printable_line(b"bad\x01\xd3byte"), "bad..byte");
    }

    #[test]
    fn nmea_placement_depends_on_mode() {
        let mut opts = local_opts(2101);
        opts.mount = MountRequest::Stream("RTCM3".into());
        opts.nmea = Some("$GPGGA,1*33".into());

        opts.mode = Mode::Http;
        let engine = test_engine(opts.clone());
        let req = engine.http_request(&engine.dial_plan().unwrap()).unwrap();
        assert!(req.contains("Ntrip-GGA: $GPGGA,1*33\r\n"));
        assert!(req.ends_with("\r\n\r\n"));

        opts.mode = Mode::Auto;
        let engine = test_engine(opts.clone());
        let req = engine.http_request(&engine.dial_plan().unwrap()).unwrap();
        assert!(!req.contains("Ntrip-GGA"));
        assert!(req.ends_with("\r\n\r\n$GPGGA,1*33\r\n"));

        opts.mode = Mode::Ntrip1;
        let engine = test_engine(opts);
        let req = engine.http_request(&engine.dial_plan().unwrap()).unwrap();
        assert!(!req.contains("Ntrip-Version"));
    }

    #[test]
    fn proxied_requests_use_absolute_uris() {
        let mut opts = local_opts(2101);
        opts.server = "caster.example.com".into();
        opts.mount = MountRequest::Stream("RTCM3".into());
        opts.proxy_host = Some("proxy.example.com".into());
        opts.proxy_port = "8080".into();

        let engine = test_engine(opts);
        let plan = engine.dial_plan().unwrap();
        assert_eq!(plan.host, "proxy.example.com");
        assert_eq!(plan.port, "8080");

        let req = engine.http_request(&plan).unwrap();
        assert!(req.starts_with("GET http://caster.example.com:2101/RTCM3 HTTP/1.1\r\n"));
        assert!(req.contains("Host: caster.example.com\r\n"));
    }

    #[test]
    fn anonymous_requests_have_no_authorization() {
        let mut opts = local_opts(2101);
        opts.mount = MountRequest::Stream("RTCM3".into());
        let engine = test_engine(opts.clone());
        let req = engine.http_request(&engine.dial_plan().unwrap()).unwrap();
        assert!(!req.contains("Authorization"));

        opts.credentials = crate::credentials::NtripCredentials::new("user", "pw");
        let engine = test_engine(opts);
        let req = engine.http_request(&engine.dial_plan().unwrap()).unwrap();
        assert!(req.contains(&format!(
            "Authorization: Basic {}\r\n",
            crate::credentials::NtripCredentials::new("user", "pw").encode()
        )));
    }

    #[tokio::test]
    async fn sourcetable_fetch_strips_the_envelope() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let caster = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            assert!(request.starts_with("GET / HTTP/1.1\r\n"), "{request}");
            assert!(request.contains("Ntrip-Version: Ntrip/2.0\r\n"));
            assert!(request.contains("Connection: close\r\n"));

            stream
                .write_all(
                    b"SOURCETABLE 200 OK\r\nContent-Type: gnss/sourcetable\r\nContent-Length: 9\r\n\r\nSTR;A;B\r\n",
                )
                .await
                .unwrap();
        });

        let mut engine = test_engine(local_opts(port));
        engine.run().await.unwrap();
        caster.await.unwrap();

        assert_eq!(captured(&engine), b"STR;A;B\r\n");
    }

    #[tokio::test]
    async fn ntrip1_stream_is_relayed_until_eof() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let payload: Vec<u8> = (0..3072u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();

        let caster = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            assert!(request.starts_with("GET /RTCM3 HTTP/1.1\r\n"), "{request}");
            assert!(!request.contains("Ntrip-Version"));

            stream.write_all(b"ICY 200 OK\r\n\r\n").await.unwrap();
            stream.write_all(&payload).await.unwrap();
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Ntrip1;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        engine.run().await.unwrap();
        caster.await.unwrap();

        assert_eq!(captured(&engine), expected);
    }

    #[tokio::test]
    async fn chunked_ntrip2_stream_is_decoded() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let caster = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream).await;

            stream
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: gnss/data\r\nTransfer-Encoding: chunked\r\n\r\n",
                )
                .await
                .unwrap();
            stream
                .write_all(b"5\r\nhello\r\nA\r\n0123456789\r\n0\r\n\r\n")
                .await
                .unwrap();
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Http;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        engine.run().await.unwrap();
        caster.await.unwrap();

        assert_eq!(captured(&engine), b"hello0123456789");
    }

    #[tokio::test]
    async fn auto_mode_falls_back_to_ntrip1() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let caster = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream).await;
            stream.write_all(b"ICY 200 OK\r\n\r\nstream-bytes").await.unwrap();
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Auto;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        engine.run().await.unwrap();
        caster.await.unwrap();

        assert_eq!(captured(&engine), b"stream-bytes");
    }

    #[tokio::test]
    async fn http_mode_rejects_an_icy_caster() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let caster = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream).await;
            let _ = stream.write_all(b"ICY 200 OK\r\n\r\ndata").await;
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Http;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, NtripError::ModeMismatch));
        caster.await.unwrap();
    }

    #[tokio::test]
    async fn error_statuses_become_soft_diagnostics() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let caster = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_request(&mut stream).await;
            let _ = stream
                .write_all(b"HTTP/1.1 401 Unauthorized\r\n\r\n")
                .await;
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Http;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        let err = engine.attempt(&mut Backoff::default()).await.unwrap_err();
        match err {
            NtripError::CasterResponse(line) => assert!(line.contains("401"), "{line}"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!NtripError::CasterResponse(String::new()).is_fatal());
        caster.await.unwrap();
    }

    #[tokio::test]
    async fn udp_reordering_is_filtered_before_the_sink() {
        let caster = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = caster.local_addr().unwrap().port();
        const SESSION: u32 = 4_342_338;

        let caster_task = tokio::spawn(async move {
            let mut buf = [0u8; 1600];
            let (n, client) = caster.recv_from(&mut buf).await.unwrap();
            let (header, payload) = rtp::split_packet(&buf[..n]).unwrap();
            assert_eq!(header.payload_type, PT_REQUEST);
            let request = String::from_utf8_lossy(payload).to_string();
            assert!(request.starts_with("GET /RTCM3 HTTP/1.1\r\n"), "{request}");
            assert!(request.contains("Ntrip-Version: Ntrip/2.0\r\n"));

            let mut reply = RtpHeader {
                payload_type: PT_DATA,
                sequence: 1,
                timestamp: 1,
                ssrc: SESSION,
            }
            .encode()
            .to_vec();
            reply.extend_from_slice(
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: gnss/data\r\nSession: {SESSION}\r\n\r\n"
                )
                .as_bytes(),
            );
            caster.send_to(&reply, client).await.unwrap();

            for (seq, body) in [(10u16, b"a1"), (12, b"b2"), (11, b"c3"), (13, b"d4")] {
                let mut packet = RtpHeader {
                    payload_type: PT_DATA,
                    sequence: seq,
                    timestamp: 5,
                    ssrc: SESSION,
                }
                .encode()
                .to_vec();
                packet.extend_from_slice(body);
                caster.send_to(&packet, client).await.unwrap();
            }

            let bye = RtpHeader {
                payload_type: PT_TEARDOWN,
                sequence: 14,
                timestamp: 6,
                ssrc: SESSION,
            }
            .encode();
            caster.send_to(&bye, client).await.unwrap();

            // the client answers the close with its own teardown packet
            let (n, _) = caster.recv_from(&mut buf).await.unwrap();
            let (header, _) = rtp::split_packet(&buf[..n]).unwrap();
            assert_eq!(header.payload_type, PT_TEARDOWN);
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Udp;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        let err = engine.attempt(&mut Backoff::default()).await.unwrap_err();
        assert!(matches!(err, NtripError::SessionClosed));
        caster_task.await.unwrap();

        // 10, 12, 13 forwarded in order; the late 11 dropped
        assert_eq!(captured(&engine), b"a1b2d4");
    }

    #[tokio::test]
    async fn udp_sourcetable_is_length_bounded() {
        let caster = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = caster.local_addr().unwrap().port();

        let caster_task = tokio::spawn(async move {
            let mut buf = [0u8; 1600];
            let (n, client) = caster.recv_from(&mut buf).await.unwrap();
            let (header, payload) = rtp::split_packet(&buf[..n]).unwrap();
            assert_eq!(header.payload_type, PT_REQUEST);
            assert!(payload.starts_with(b"GET / HTTP/1.1\r\n"));

            let mut reply = RtpHeader {
                payload_type: PT_DATA,
                sequence: 1,
                timestamp: 1,
                ssrc: 7,
            }
            .encode()
            .to_vec();
            reply.extend_from_slice(
                b"HTTP/1.1 200 OK\r\nContent-Type: gnss/sourcetable\r\nContent-Length: 18\r\n\r\nSTR;A;B\r\n",
            );
            caster.send_to(&reply, client).await.unwrap();

            let mut cont = RtpHeader {
                payload_type: PT_DATA,
                sequence: 2,
                timestamp: 2,
                ssrc: 7,
            }
            .encode()
            .to_vec();
            cont.extend_from_slice(b"STR;C;D\r\n");
            caster.send_to(&cont, client).await.unwrap();
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Udp;

        let mut engine = test_engine(opts);
        engine.attempt(&mut Backoff::default()).await.unwrap();
        caster_task.await.unwrap();

        assert_eq!(captured(&engine), b"STR;A;B\r\nSTR;C;D\r\n");
    }

    #[tokio::test]
    async fn rtsp_handshake_streams_and_survives_priming() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let caster_udp = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_port = caster_udp.local_addr().unwrap().port();
        const SESSION: u32 = 335_643;

        let caster = tokio::spawn(async move {
            let (mut control, _) = listener.accept().await.unwrap();

            let setup = read_request(&mut control).await;
            assert!(setup.starts_with("SETUP rtsp://127.0.0.1/RTCM3 RTSP/1.0\r\n"), "{setup}");
            assert!(setup.contains("CSeq: 1\r\n"));
            assert!(setup.contains("Ntrip-Component: Ntripclient\r\n"));
            let client_port: u16 = setup
                .split("client_port=")
                .nth(1)
                .unwrap()
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap();

            control
                .write_all(
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: 1\r\nSession: {SESSION}\r\n\
                         Transport: RTP/GNSS;unicast;client_port={client_port};server_port={server_port}\r\n\r\n"
                    )
                    .as_bytes(),
                )
                .await
                .unwrap();

            let play = read_request(&mut control).await;
            assert!(play.starts_with("PLAY rtsp://127.0.0.1/RTCM3 RTSP/1.0\r\n"), "{play}");
            assert!(play.contains(&format!("Session: {SESSION}\r\n")));
            control
                .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 2\r\n\r\n")
                .await
                .unwrap();

            let target = ("127.0.0.1", client_port);
            for (seq, body) in [(1u16, &b"prime"[..]), (2, &b"rtcm-a"[..]), (3, &b"rtcm-b"[..])] {
                let mut packet = RtpHeader {
                    payload_type: PT_DATA,
                    sequence: seq,
                    timestamp: 4,
                    ssrc: SESSION,
                }
                .encode()
                .to_vec();
                packet.extend_from_slice(body);
                caster_udp.send_to(&packet, target).await.unwrap();
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
            // closing the control connection ends the session
        });

        let mut opts = local_opts(port);
        opts.mode = Mode::Rtsp;
        opts.mount = MountRequest::Stream("RTCM3".into());

        let mut engine = test_engine(opts);
        let err = engine.attempt(&mut Backoff::default()).await.unwrap_err();
        assert!(matches!(err, NtripError::ControlConnection(_)));
        caster.await.unwrap();

        // the first packet only primes the window; the rest flows
        assert_eq!(captured(&engine), b"rtcm-artcm-b");
    }
}
