//! CLI argument parsing for timewarp

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Parser};

use crate::signals;

/// Separator between the command lines of several programs
pub const COMMAND_SEPARATOR: &str = "--";

#[derive(Parser, Debug)]
#[command(name = "timewarp")]
#[command(version)]
#[command(
    about = "Run programs under a virtual clock that skips ahead whenever they all wait on a timer",
    long_about = None
)]
#[command(override_usage = "timewarp [OPTIONS] -- COMMAND [ARGS...] [-- COMMAND [ARGS...]]...")]
pub struct Cli {
    /// Load libtimewarp_preload.so from this directory
    #[arg(long, value_name = "PATH")]
    pub libpath: Option<PathBuf>,

    /// Signal used to interrupt blocking syscalls
    #[arg(
        long,
        value_name = "SIGNAL",
        default_value = "SIGURG",
        value_parser = signal_arg
    )]
    pub signal: i32,

    /// Speed up time only after all processes were idle this long
    #[arg(
        long,
        value_name = "TIMEOUT",
        default_value = "50ms",
        value_parser = idleness_arg
    )]
    pub idleness: Duration,

    /// Print more (repeat for even more)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Do not preload the time interception library
    #[arg(long = "no-preload")]
    pub no_preload: bool,

    /// Programs to run, each introduced by --
    #[arg(last = true, required = true, value_name = "COMMAND")]
    pub command: Vec<String>,
}

impl Cli {
    /// One argv per program
    pub fn commands(&self) -> Result<Vec<Vec<String>>, String> {
        split_commands(&self.command)
    }
}

/// Parse a duration such as `50ms`, `2s`, `100us` or `7` (nanoseconds)
///
/// Suffixes are case-insensitive: `ns`/`nsec`, `us`/`usec`, `ms`/`msec`,
/// `s`/`sec`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match unit.to_ascii_lowercase().as_str() {
        "" | "ns" | "nsec" => Some(Duration::from_nanos(value)),
        "us" | "usec" => Some(Duration::from_micros(value)),
        "ms" | "msec" => Some(Duration::from_millis(value)),
        "s" | "sec" => Some(Duration::from_secs(value)),
        _ => None,
    }
}

fn signal_arg(s: &str) -> Result<i32, String> {
    signals::parse_signal(s).ok_or_else(|| format!("unrecognised signal \"{}\"", s))
}

fn idleness_arg(s: &str) -> Result<Duration, String> {
    match parse_duration(s) {
        Some(d) if !d.is_zero() => Ok(d),
        _ => Err(format!("wrong TIMEOUT \"{}\"", s)),
    }
}

/// Split trailing arguments on `--` into one argv per program
///
/// A leading separator is tolerated; empty groups are rejected.
pub fn split_commands(args: &[String]) -> Result<Vec<Vec<String>>, String> {
    let args = match args.first() {
        Some(first) if first == COMMAND_SEPARATOR => &args[1..],
        _ => args,
    };
    if args.is_empty() {
        return Err("you must specify at least one command to execute".to_string());
    }

    let groups: Vec<Vec<String>> = args
        .split(|a| a == COMMAND_SEPARATOR)
        .map(<[String]>::to_vec)
        .collect();
    if groups.iter().any(Vec::is_empty) {
        return Err("empty command between separators".to_string());
    }
    Ok(groups)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_cli_parses_command() {
        let cli = Cli::parse_from(["timewarp", "--", "sleep", "10"]);
        assert_eq!(cli.command, strings(&["sleep", "10"]));
        assert_eq!(cli.commands().unwrap(), vec![strings(&["sleep", "10"])]);
    }

    #[test]
    fn test_cli_requires_command() {
        assert!(Cli::try_parse_from(["timewarp"]).is_err());
        assert!(Cli::try_parse_from(["timewarp", "-v"]).is_err());
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["timewarp", "--", "true"]);
        assert_eq!(cli.signal, libc::SIGURG);
        assert_eq!(cli.idleness, Duration::from_millis(50));
        assert_eq!(cli.verbose, 0);
        assert!(cli.libpath.is_none());
        assert!(!cli.no_preload);
    }

    #[test]
    fn test_cli_verbose_counts() {
        let cli = Cli::parse_from(["timewarp", "-vv", "--verbose", "--", "true"]);
        assert_eq!(cli.verbose, 3);
    }

    #[test]
    fn test_cli_options() {
        let cli = Cli::parse_from([
            "timewarp",
            "--libpath=/opt/tw",
            "--signal=USR2",
            "--idleness=2s",
            "--no-preload",
            "--",
            "true",
        ]);
        assert_eq!(cli.libpath, Some(PathBuf::from("/opt/tw")));
        assert_eq!(cli.signal, libc::SIGUSR2);
        assert_eq!(cli.idleness, Duration::from_secs(2));
        assert!(cli.no_preload);
    }

    #[test]
    fn test_cli_rejects_bad_values() {
        assert!(Cli::try_parse_from(["timewarp", "--signal=SIGNOPE", "--", "true"]).is_err());
        assert!(Cli::try_parse_from(["timewarp", "--idleness=fast", "--", "true"]).is_err());
        assert!(Cli::try_parse_from(["timewarp", "--idleness=0", "--", "true"]).is_err());
    }

    #[test]
    fn test_cli_multiple_commands() {
        let cli = Cli::parse_from(["timewarp", "--", "sleep", "2", "--", "sleep", "5"]);
        assert_eq!(
            cli.commands().unwrap(),
            vec![strings(&["sleep", "2"]), strings(&["sleep", "5"])]
        );
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("7"), Some(Duration::from_nanos(7)));
        assert_eq!(parse_duration("7ns"), Some(Duration::from_nanos(7)));
        assert_eq!(parse_duration("3usec"), Some(Duration::from_micros(3)));
        assert_eq!(parse_duration("50ms"), Some(Duration::from_millis(50)));
        assert_eq!(parse_duration("50MS"), Some(Duration::from_millis(50)));
        assert_eq!(parse_duration("2s"), Some(Duration::from_secs(2)));
        assert_eq!(parse_duration("2sec"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("ms"), None);
        assert_eq!(parse_duration("5min"), None);
        assert_eq!(parse_duration("-5ms"), None);
        assert_eq!(parse_duration("1.5s"), None);
    }

    #[test]
    fn test_split_commands() {
        let groups = split_commands(&strings(&["a", "1", "--", "b", "--", "c", "x", "y"])).unwrap();
        assert_eq!(
            groups,
            vec![strings(&["a", "1"]), strings(&["b"]), strings(&["c", "x", "y"])]
        );
    }

    #[test]
    fn test_split_commands_leading_separator() {
        let groups = split_commands(&strings(&["--", "a"])).unwrap();
        assert_eq!(groups, vec![strings(&["a"])]);
    }

    #[test]
    fn test_split_commands_rejects_empty_groups() {
        assert!(split_commands(&[]).is_err());
        assert!(split_commands(&strings(&["a", "--"])).is_err());
        assert!(split_commands(&strings(&["a", "--", "--", "b"])).is_err());
    }
}
