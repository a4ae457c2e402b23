//! CLI argument parsing for ptsentry

use crate::config::{Creds, TracerOptions};
use clap::Parser;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "ptsentry")]
#[command(version)]
#[command(about = "Trace a process tree with ptrace and stream security events to a collector", long_about = None)]
pub struct Cli {
    /// Attach to running processes by PID, comma separated (mutually exclusive with command)
    #[arg(short = 'p', long = "pid", value_name = "PID", value_delimiter = ',')]
    pub pids: Vec<i32>,

    /// Collector address (HOST:PORT); events are only logged without it
    #[arg(long = "probe-addr", value_name = "ADDR")]
    pub probe_addr: Option<String>,

    /// Run the command as this uid
    #[arg(long)]
    pub uid: Option<u32>,

    /// Run the command as this gid
    #[arg(long)]
    pub gid: Option<u32>,

    /// Debug logging, including every outgoing message
    #[arg(short, long)]
    pub verbose: bool,

    /// Connect to the collector in the background
    #[arg(long = "async")]
    pub async_connect: bool,

    /// Skip file stats and user/group name resolution
    #[arg(long = "disable-stats")]
    pub disable_stats: bool,

    /// Do not snapshot processes from procfs
    #[arg(long = "disable-proc-scan")]
    pub disable_proc_scan: bool,

    /// Proc scan period in milliseconds
    #[arg(long = "scan-proc-every", value_name = "MS", default_value = "500")]
    pub scan_proc_every: u64,

    /// Step every syscall instead of filtering with seccomp
    #[arg(long = "disable-seccomp")]
    pub disable_seccomp: bool,

    /// Command to trace (everything after --)
    #[arg(last = true)]
    pub command: Option<Vec<String>>,
}

impl Cli {
    pub fn tracer_options(&self) -> TracerOptions {
        TracerOptions::default()
            .with_creds(Creds {
                uid: self.uid,
                gid: self.gid,
            })
            .with_verbose(self.verbose)
            .with_async_connect(self.async_connect)
            .with_stats_disabled(self.disable_stats)
            .with_proc_scan(
                self.disable_proc_scan,
                Duration::from_millis(self.scan_proc_every),
            )
            .with_seccomp_disabled(self.disable_seccomp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_command() {
        let cli = Cli::parse_from(["ptsentry", "--", "echo", "hello"]);
        let cmd = cli.command.unwrap();
        assert_eq!(cmd, vec!["echo", "hello"]);
        assert!(cli.pids.is_empty());
    }

    #[test]
    fn test_cli_empty_without_command() {
        let cli = Cli::parse_from(["ptsentry"]);
        assert!(cli.command.is_none());
        assert!(cli.probe_addr.is_none());
    }

    #[test]
    fn test_cli_pid_list() {
        let cli = Cli::parse_from(["ptsentry", "-p", "12,34"]);
        assert_eq!(cli.pids, vec![12, 34]);
        let cli = Cli::parse_from(["ptsentry", "-p", "12", "-p", "56"]);
        assert_eq!(cli.pids, vec![12, 56]);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::parse_from(["ptsentry", "--", "true"]);
        assert_eq!(cli.scan_proc_every, 500);
        assert!(!cli.verbose);
        assert!(!cli.async_connect);
        assert!(!cli.disable_seccomp);
    }

    #[test]
    fn test_cli_maps_onto_options() {
        let cli = Cli::parse_from([
            "ptsentry",
            "--probe-addr",
            "127.0.0.1:5678",
            "--uid",
            "1000",
            "--async",
            "--disable-stats",
            "--scan-proc-every",
            "250",
            "--",
            "true",
        ]);
        assert_eq!(cli.probe_addr.as_deref(), Some("127.0.0.1:5678"));
        let options = cli.tracer_options();
        assert_eq!(options.creds.uid, Some(1000));
        assert_eq!(options.creds.gid, None);
        assert!(options.async_connect);
        assert!(options.stats_disabled);
        assert!(!options.proc_scan_disabled);
        assert_eq!(options.scan_proc_every, Duration::from_millis(250));
    }
}
