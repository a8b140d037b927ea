mod checksum;
mod cli;
mod error;
mod packet;
mod session;
mod transport;

use colored::*;

use anyhow::Context;
use log::info;

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use error::PingError;
use session::{Completion, ProbeOutcome, SessionStats};
use transport::{DnsResolver, RawSocket};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let options = cli::parse().unwrap_or_else(|e| e.exit());

    let interrupted = Arc::new(AtomicBool::new(false));
    let mut session = session::open_session(&DnsResolver, &options, interrupted.clone(), |config| {
        RawSocket::open(config.target, config.ttl).map_err(PingError::Open)
    })?;

    let destination_host = options.destination.as_str();
    println!("{} {} ({}) {} bytes of data.",
        "PING".cyan(), destination_host.bold(), session.config().target, packet::PACKET_LEN - packet::HEADER_LEN);

    let r = interrupted.clone();
    ctrlc::set_handler(move || {
        r.store(true, Ordering::SeqCst);
    }).context("Error setting Ctrl-C handler")?;

    let result = session.run(print_outcome);
    let stats = session.stats();

    // The socket closes here on every path
    drop(session);
    conclude(&mut io::stdout(), destination_host, &stats, result)
}

/// Prints the statistics whatever the outcome, then turns a fatal session
/// error into the exit status.
fn conclude<W: Write>(out: &mut W, destination_host: &str, stats: &SessionStats,
    result: Result<Completion, PingError>) -> anyhow::Result<()> {
    match &result {
        Ok(Completion::Finished) => info!("finished after {} pings", stats.sent()),
        Ok(Completion::Interrupted) => info!("interrupted after {} pings", stats.sent()),
        Err(e) => info!("aborted after {} pings: {}", stats.sent(), e),
    }

    print_statistics(out, destination_host, stats).context("Error printing statistics")?;
    result.context("Ping session aborted")?;
    Ok(())
}

fn print_outcome(outcome: &ProbeOutcome) {
    match outcome {
        ProbeOutcome::Replied { reply, rtt } => {
            print!("{} bytes from {}: ", reply.size, reply.source.to_string().yellow());
            print!("icmp_seq={} ", reply.sequence.to_string().bold());
            print!("ttl={} ", reply.ttl.to_string().bold());
            println!("time={}ms", format!("{:.2}", rtt.as_micros() as f32 / 1000f32).bold());
        }

        ProbeOutcome::TimedOut { sequence } => {
            println!("Request timeout for icmp_seq={}", sequence.to_string().red().bold());
        }

        ProbeOutcome::TimeExceeded { sequence, router } => {
            print!("From {}: ", router);
            print!("icmp_seq={} ", sequence);
            println!("{}", "Time to live exceeded".red());
        }
    }
}

fn print_statistics<W: Write>(out: &mut W, destination_host: &str, stats: &SessionStats) -> io::Result<()> {
    writeln!(out)?; // New line
    writeln!(out, "{} {} {} {}", "===".yellow(), destination_host.bold(), "ping statistics".cyan(), "===".yellow())?;
    writeln!(out, "{} packets transmitted, {} received, {}% packet loss",
        stats.sent().to_string().bold(), stats.received().to_string().bold(),
        format!("{:.2}", stats.loss_percent()).bold())?;

    if let Some(rtt) = stats.rtt_summary() {
        writeln!(out, "rtt min/avg/max = {:.3}/{:.3}/{:.3} ms",
            rtt.min.as_secs_f64() * 1000.0, rtt.avg.as_secs_f64() * 1000.0, rtt.max.as_secs_f64() * 1000.0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::testing::echo_back;
    use crate::packet::Timestamp;
    use crate::session::{Session, SessionConfig, IDENTIFIER};
    use std::io::ErrorKind;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use crate::transport::MockTransport;

    const TARGET: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    /// One good reply, then the socket fails on the second ping.
    fn broken_session() -> (SessionStats, Result<Completion, PingError>) {
        let mut transport = MockTransport::new();
        transport.expect_send().returning(|p| Ok(p.len()));
        let mut calls = 0;
        transport.expect_recv_timeout().returning(move |buf, _| {
            calls += 1;
            if calls == 1 {
                let request = packet::encode(IDENTIFIER, 0, Timestamp::now()).unwrap();
                let reply = echo_back(TARGET, &request);
                buf[..reply.len()].copy_from_slice(&reply);
                Ok(Some(reply.len()))
            } else {
                Err(io::Error::new(ErrorKind::ConnectionReset, "reset"))
            }
        });

        let config = SessionConfig {
            target: TARGET,
            count: Some(3),
            interval: Duration::from_secs(0),
            timeout: Duration::from_millis(200),
            ttl: None,
        };
        let mut session = Session::new(transport, config, Arc::new(AtomicBool::new(false)));
        let result = session.run(|_| {});
        (session.stats(), result)
    }

    #[test]
    fn fatal_error_still_prints_statistics() {
        colored::control::set_override(false);
        let (stats, result) = broken_session();
        let mut out = Vec::new();

        let exit = conclude(&mut out, "example.net", &stats, result);

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("=== example.net ping statistics ==="), "{}", printed);
        assert!(printed.contains("1 packets transmitted, 1 received, 0.00% packet loss"), "{}", printed);
        assert!(printed.contains("rtt min/avg/max"), "{}", printed);

        let err = exit.unwrap_err();
        assert!(format!("{:#}", err).contains("error receiving pong"), "{:#}", err);
    }

    #[test]
    fn clean_finish_exits_ok() {
        colored::control::set_override(false);
        let mut out = Vec::new();

        conclude(&mut out, "example.net", &SessionStats::default(), Ok(Completion::Finished)).unwrap();

        let printed = String::from_utf8(out).unwrap();
        assert!(printed.contains("0 packets transmitted, 0 received, 0.00% packet loss"), "{}", printed);
        assert!(!printed.contains("rtt min/avg/max"));
    }
}
