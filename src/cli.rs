use std::net::Ipv4Addr;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches};

use crate::session::SessionConfig;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_TIMEOUT: Duration = Duration::from_millis(200);
const MAX_BARE_DURATION: f64 = 1e9;

/// Settings taken from the command line, before the destination is resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Options {
    pub destination: String,
    pub count: Option<u64>,
    pub interval: Duration,
    pub timeout: Duration,
    pub ttl: Option<u32>,
}

impl Options {
    pub fn session_config(&self, target: Ipv4Addr) -> SessionConfig {
        SessionConfig {
            target,
            count: self.count,
            interval: self.interval,
            timeout: self.timeout,
            ttl: self.ttl,
        }
    }
}

pub fn app() -> App<'static, 'static> {
    App::new("ring")
        .setting(AppSettings::ColoredHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .author("Bryan Becar <becar.bryan@gmail.com>")
        .about("Sends ICMP echo requests to a host and reports round trip times and packet loss.\nNeeds permission to open raw sockets.")
        .arg(Arg::with_name("DESTINATION")
            .help("Hostname or IPv4 address")
            .required(true)
            .index(1))
        .arg(Arg::with_name("count")
            .help("Stop after sending this many pings (Default: until interrupted)")
            .short("c")
            .takes_value(true))
        .arg(Arg::with_name("interval")
            .help("Wait between pings, in seconds or as a duration like 250ms (Default 1s)")
            .short("i")
            .takes_value(true))
        .arg(Arg::with_name("timeout")
            .help("Wait for each pong, in milliseconds or as a duration like 2s (Default 200ms)")
            .short("W")
            .takes_value(true))
        .arg(Arg::with_name("ttl")
            .help("Set ttl on outgoing packets")
            .short("t")
            .takes_value(true))
}

pub fn parse() -> clap::Result<Options> {
    from_matches(&app().get_matches_safe()?)
}

fn from_matches(matches: &ArgMatches) -> clap::Result<Options> {
    // DESTINATION is required, clap rejects the command line without it
    let destination = matches.value_of("DESTINATION").unwrap_or_default().to_string();

    let count = matches
        .value_of("count")
        .map(|c| parse_number::<u64>("count", c))
        .transpose()?;
    let ttl = matches
        .value_of("ttl")
        .map(|t| parse_number::<u32>("ttl", t))
        .transpose()?;

    let interval = matches
        .value_of("interval")
        .map(|i| parse_duration("interval", i, Duration::from_secs_f64))
        .transpose()?
        .unwrap_or(DEFAULT_INTERVAL);
    let timeout = matches
        .value_of("timeout")
        .map(|t| parse_duration("timeout", t, |ms| Duration::from_secs_f64(ms / 1000.0)))
        .transpose()?
        .unwrap_or(DEFAULT_TIMEOUT);

    Ok(Options { destination, count, interval, timeout, ttl })
}

fn invalid(name: &str, value: &str, expected: &str) -> clap::Error {
    clap::Error::with_description(
        &format!("Invalid {}: {} ({})", name, value, expected),
        clap::ErrorKind::InvalidValue,
    )
}

fn parse_number<N: std::str::FromStr>(name: &str, value: &str) -> clap::Result<N> {
    value.parse().map_err(|_| invalid(name, value, "ex: 64"))
}

/// A bare number is taken in the option's unit, anything else goes through
/// humantime.
fn parse_duration<F>(name: &str, value: &str, from_unit: F) -> clap::Result<Duration>
where
    F: Fn(f64) -> Duration,
{
    match value.parse::<f64>() {
        Ok(n) if n >= 0.0 && n < MAX_BARE_DURATION => Ok(from_unit(n)),
        Ok(_) => Err(invalid(name, value, "out of range")),
        Err(_) => humantime::parse_duration(value)
            .map_err(|_| invalid(name, value, "ex: 1s, 400ms, 1m")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse_args(args: &[&str]) -> clap::Result<Options> {
        let argv = std::iter::once("ring").chain(args.iter().copied());
        from_matches(&app().get_matches_from_safe(argv)?)
    }

    #[test]
    fn defaults() {
        assert_eq!(
            parse_args(&["example.com"]).unwrap(),
            Options {
                destination: "example.com".to_string(),
                count: None,
                interval: Duration::from_secs(1),
                timeout: Duration::from_millis(200),
                ttl: None,
            }
        );
    }

    #[test]
    fn bare_numbers_use_option_units() {
        let options = parse_args(&["-c", "3", "-i", "0.5", "-W", "50", "-t", "12", "10.0.0.1"]).unwrap();
        assert_eq!(options.count, Some(3));
        assert_eq!(options.interval, Duration::from_millis(500));
        assert_eq!(options.timeout, Duration::from_millis(50));
        assert_eq!(options.ttl, Some(12));
    }

    #[test]
    fn humantime_durations() {
        let options = parse_args(&["-i", "250ms", "-W", "2s", "10.0.0.1"]).unwrap();
        assert_eq!(options.interval, Duration::from_millis(250));
        assert_eq!(options.timeout, Duration::from_secs(2));
    }

    #[test]
    fn zero_interval_is_allowed() {
        let options = parse_args(&["-i", "0", "10.0.0.1"]).unwrap();
        assert_eq!(options.interval, Duration::from_secs(0));
    }

    #[test]
    fn rejects_bad_values() {
        assert!(parse_args(&[]).is_err());
        assert!(parse_args(&["-c", "three", "host"]).is_err());
        assert!(parse_args(&["-c", "-1", "host"]).is_err());
        assert!(parse_args(&["-W", "soon", "host"]).is_err());
        assert!(parse_args(&["-i", "-2", "host"]).is_err());
        assert!(parse_args(&["-t", "256x", "host"]).is_err());
    }

    #[test]
    fn config_keeps_every_setting() {
        let options = parse_args(&["-c", "2", "-W", "75", "host"]).unwrap();
        let target = Ipv4Addr::new(203, 0, 113, 5);
        let config = options.session_config(target);

        assert_eq!(config.target, target);
        assert_eq!(config.count, Some(2));
        assert_eq!(config.timeout, Duration::from_millis(75));
        assert_eq!(config.interval, Duration::from_secs(1));
    }
}
