use std::path::PathBuf;

use clap::Parser;
use tokio_serial::{DataBits, FlowControl, Parity, StopBits};
use tracing::{debug, error, level_filters::LevelFilter};
use tracing_subscriber::{fmt::Subscriber as FmtSubscriber, EnvFilter};

use ntrip_relay::{
    config::{Mode, MountRequest, NtripOptions},
    serial::{self, SerialSettings},
    session::{SessionEngine, Sink},
    watchdog::{Shutdown, Watchdog, ALARM_TIME},
    NtripError,
};

/// NTRIP command line client: relay caster corrections to stdout or a GNSS
/// receiver
#[derive(Clone, PartialEq, Debug, Parser)]
#[command(version, about)]
struct Args {
    /// the server name or address
    #[arg(short = 's', long)]
    server: Option<String>,

    /// the server port number (default 2101)
    #[arg(short = 'r', long)]
    port: Option<String>,

    /// the user name
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// the login password
    #[arg(short = 'p', long)]
    password: Option<String>,

    /// the requested data set or sourcetable filtering criteria
    #[arg(short = 'm', long, short_alias = 'd', alias = "data")]
    mountpoint: Option<String>,

    /// NMEA string for sending to server
    #[arg(short = 'n', long)]
    nmea: Option<String>,

    /// output bitrate
    #[arg(short = 'b', long)]
    bitrate: bool,

    /// proxy name or address
    #[arg(short = 'S', long)]
    proxyhost: Option<String>,

    /// proxy port, optional (default 2101)
    #[arg(short = 'R', long)]
    proxyport: Option<String>,

    /// mode for data request: 1|h|http, 2|r|rtsp, 3|n|ntrip1, 4|a|auto,
    /// 5|u|udp
    #[arg(short = 'M', long, value_parser = parse_mode)]
    mode: Option<Mode>,

    /// send initial UDP packet for firewall handling
    #[arg(short = 'I', long)]
    initudp: bool,

    /// set the local UDP port
    #[arg(short = 'P', long)]
    udpport: Option<u16>,

    /// serial device for output
    #[arg(short = 'D', long)]
    serdevice: Option<String>,

    /// baudrate for serial device
    #[arg(short = 'B', long, value_parser = serial::parse_baud)]
    baud: Option<u32>,

    /// stopbits for serial device
    #[arg(short = 'T', long, value_parser = serial::parse_stop_bits)]
    stopbits: Option<StopBits>,

    /// protocol for serial device
    #[arg(short = 'C', long, value_parser = serial::parse_flow_control)]
    protocol: Option<FlowControl>,

    /// parity for serial device
    #[arg(short = 'Y', long, value_parser = serial::parse_parity)]
    parity: Option<Parity>,

    /// databits for serial device
    #[arg(short = 'A', long, value_parser = serial::parse_data_bits)]
    databits: Option<DataBits>,

    /// logfile for serial data
    #[arg(short = 'l', long)]
    serlogfile: Option<PathBuf>,

    /// set log level
    #[arg(long, default_value = "info")]
    log_level: LevelFilter,

    /// ntrip:mountpoint[/user[:password]][@[server][:port][@proxyhost[:proxyport]]][;nmea]
    url: Option<String>,
}

fn parse_mode(s: &str) -> Result<Mode, String> {
    s.parse::<Mode>().map_err(|_| format!("Mode {s} unknown"))
}

/// Fold the URL (base layer) and the explicit flags (overrides) into one
/// request descriptor.
fn build_options(args: &Args) -> Result<NtripOptions, NtripError> {
    let mut opts = match &args.url {
        Some(url) => url.parse::<NtripOptions>()?,
        None => NtripOptions::default(),
    };

    if let Some(server) = &args.server {
        opts.server = server.clone();
    }
    if let Some(port) = &args.port {
        opts.port = port.clone();
    }
    if let Some(user) = &args.user {
        opts.credentials.user = user.clone();
    }
    if let Some(password) = &args.password {
        opts.credentials.password = password.clone();
    }
    if let Some(mount) = &args.mountpoint {
        opts.mount = MountRequest::from_arg(mount);
    }
    if let Some(nmea) = &args.nmea {
        opts.nmea = Some(nmea.clone());
    }
    if args.bitrate {
        opts.bitrate = true;
    }
    if let Some(proxy) = &args.proxyhost {
        opts.proxy_host = Some(proxy.clone());
    }
    if let Some(proxy_port) = &args.proxyport {
        opts.proxy_port = proxy_port.clone();
    }
    if let Some(mode) = args.mode {
        opts.mode = mode;
    }
    if args.initudp {
        opts.init_udp = true;
    }
    if let Some(udp_port) = args.udpport {
        opts.udp_port = udp_port;
    }

    if let Some(device) = &args.serdevice {
        let mut settings = SerialSettings::new(device);
        if let Some(baud) = args.baud {
            settings.baud = baud;
        }
        if let Some(data_bits) = args.databits {
            settings.data_bits = data_bits;
        }
        if let Some(stop_bits) = args.stopbits {
            settings.stop_bits = stop_bits;
        }
        if let Some(parity) = args.parity {
            settings.parity = parity;
        }
        if let Some(flow) = args.protocol {
            settings.flow_control = flow;
        }
        opts.serial = Some(settings);
        opts.serial_log = args.serlogfile.clone();
    }

    opts.validate()?;
    Ok(opts)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let args = Args::parse();

    // stdout carries the caster's bytes; everything else goes to stderr
    let filter = EnvFilter::from_default_env().add_directive(args.log_level.into());
    let _ = FmtSubscriber::builder()
        .compact()
        .without_time()
        .with_max_level(args.log_level)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let opts = match build_options(&args) {
        Ok(opts) => opts,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };
    debug!("request descriptor: {opts:?}");

    let watchdog = Watchdog::new(ALARM_TIME);
    watchdog.watch();

    let shutdown = Shutdown::new();
    {
        let shutdown = shutdown.clone();
        let watchdog = watchdog.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("interrupt: shutting down");
                watchdog.interrupt();
                shutdown.trigger();
            }
        });
    }

    let sink = match Sink::for_options(&opts) {
        Ok(sink) => sink,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    let mut engine = SessionEngine::new(opts, sink, watchdog, shutdown);
    match engine.run().await {
        Ok(()) => 0,
        Err(e) => {
            error!("{e}");
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(argv: &[&str]) -> Args {
        Args::parse_from(std::iter::once("ntrip-relay").chain(argv.iter().copied()))
    }

    #[test]
    fn flags_override_url_fields() {
        let args = args(&[
            "-s",
            "flag-server",
            "-M",
            "ntrip1",
            "ntrip:RTCM3/u:p@url-server:2102",
        ]);
        let opts = build_options(&args).unwrap();

        assert_eq!(opts.server, "flag-server");
        assert_eq!(opts.port, "2102");
        assert_eq!(opts.mode, Mode::Ntrip1);
        assert_eq!(opts.mount, MountRequest::Stream("RTCM3".into()));
    }

    #[test]
    fn serial_flags_build_a_line_discipline() {
        let args = args(&[
            "-m", "RTCM3", "-D", "/dev/ttyUSB0", "-B", "115200", "-Y", "even", "-T", "2",
        ]);
        let opts = build_options(&args).unwrap();

        let serial = opts.serial.unwrap();
        assert_eq!(serial.device, "/dev/ttyUSB0");
        assert_eq!(serial.baud, 115200);
        assert_eq!(serial.parity, Parity::Even);
        assert_eq!(serial.stop_bits, StopBits::Two);
    }

    #[test]
    fn mode_spellings_and_diagnostics() {
        assert_eq!(parse_mode("u").unwrap(), Mode::Udp);
        assert_eq!(parse_mode("2").unwrap(), Mode::Rtsp);
        assert_eq!(parse_mode("tcp").unwrap_err(), "Mode tcp unknown");
    }

    #[test]
    fn deprecated_data_flag_still_selects_the_mount() {
        let args = args(&["-d", "RTCM3"]);
        let opts = build_options(&args).unwrap();
        assert_eq!(opts.mount, MountRequest::Stream("RTCM3".into()));
    }

    #[test]
    fn bad_ports_are_rejected() {
        let args = args(&["-r", "99999"]);
        assert!(matches!(
            build_options(&args),
            Err(NtripError::InvalidPort { .. })
        ));
    }
}
