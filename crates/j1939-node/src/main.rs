//! Run a J1939 node against a real `SocketCAN` interface.
//!
//! Claims an address, logs everything `handle_data`/`handle_ack` delivers, and optionally fires
//! a one-shot request-for-PGN or application message at startup -- enough to exercise
//! [j1939_link::Link] end to end against a real (or virtual, `vcan0`) CAN interface.
use std::io::IsTerminal;
use std::time::Instant;

use clap::Parser;
use eyre::WrapErr;
use j1939_link::{Application, Link, LinkStatus, Name};
use libc::c_int;

mod socketcan;

use socketcan::CanRawSocket;

/// Run a J1939 / ISO 11783-5 node against a SocketCAN interface.
///
/// Claims an address, logs delivered application messages and acks, and optionally sends a
/// one-shot request-for-PGN or application message at startup.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// CAN interface to bind, e.g. can0 or vcan0
    interface: String,

    /// Preferred source address to claim (0-253)
    #[clap(long, default_value_t = 0x80)]
    preferred_sa: u8,

    /// 64-bit NAME to claim with, as hex (no 0x prefix)
    #[clap(long, value_parser = parse_hex_u64, default_value = "0000000000000000")]
    name: u64,

    /// How often to call the link's tick() housekeeping hook, driving TP/ETP timeouts and the
    /// address-claim quiet interval
    #[clap(long, default_value_t = 50)]
    tick_interval_ms: u64,

    /// Send a request-for-PGN to this destination address at startup (hex, e.g. FF for broadcast)
    #[clap(long, value_parser = parse_hex_u8)]
    request_dest: Option<u8>,

    /// PGN to request (hex), used with --request-dest
    #[clap(long, value_parser = parse_hex_u32, requires = "request_dest")]
    request_pgn: Option<u32>,
}

fn parse_hex_u64(s: &str) -> Result<u64, String> {
    u64::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn parse_hex_u32(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 16).map_err(|e| e.to_string())
}

fn parse_hex_u8(s: &str) -> Result<u8, String> {
    u8::from_str_radix(s, 16).map_err(|e| e.to_string())
}

/// Logs every delivered application message and ack; does nothing else.
struct LoggingApp;

impl Application for LoggingApp {
    fn handle_data(&mut self, pf: u8, da: u8, sa: u8, payload: &[u8]) {
        tracing::info!(
            pf, da, sa, len = payload.len(), data = %hex::encode_upper(payload),
            "delivered application message"
        );
    }

    fn handle_ack(&mut self, da: u8, sa: u8, ok: bool, pgn: u32) {
        tracing::info!(da, sa, ok, pgn, "received ack/nack");
    }
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("J1939_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let socket = CanRawSocket::open(&args.interface)
        .wrap_err_with(|| format!("failed to open {}", args.interface))?;
    let mut link = Link::new(socket, LoggingApp, args.preferred_sa, Name::from(args.name));

    let now = Instant::now();
    link.start_address_claim(now);
    if let Some(dest) = args.request_dest {
        let pgn = args.request_pgn.unwrap_or(0);
        link.send_request_pgn(dest, pgn)?;
    }

    tracing::info!(interface = %args.interface, preferred_sa = %format!("{:#X}", args.preferred_sa), "node starting");

    loop {
        let events: i16 = libc::POLLIN as i16
            | if link.has_queued_frames() { libc::POLLOUT as i16 } else { 0 };
        let mut fds = [libc::pollfd { fd: link.as_raw_fd(), events, revents: 0 }];
        let rv = unsafe { libc::poll(fds.as_mut_ptr(), 1, args.tick_interval_ms as c_int) };
        if rv < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err).wrap_err("poll() failed");
        }

        let now = Instant::now();
        if rv > 0 {
            let revents = fds[0].revents;
            if revents & libc::POLLIN as i16 != 0 {
                link.on_readable(now)?;
            }
            if revents & libc::POLLOUT as i16 != 0 {
                link.on_writable()?;
            }
        }
        link.tick(now);

        if matches!(link.status(), LinkStatus::Ready) && args.request_dest.is_none() {
            tracing::trace!(sa = ?link.sa(), "idle, address claimed");
        }
    }
}
