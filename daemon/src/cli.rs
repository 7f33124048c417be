use std::path::PathBuf;

use clap::Parser;

/// Matches the original's option set: `-p/--port`, `-c/--config`,
/// `-vv/--logstdout`, `-v/--version`, `-h/--help`.
///
/// `-vv` is a single two-character token in the original (not `-v` given
/// twice), which clap has no direct way to express as a short flag; `main`
/// rewrites a literal `-vv` argv entry to `--logstdout` before parsing.
#[derive(Parser, Debug)]
#[command(name = "mptund", disable_version_flag = true)]
pub struct Cli {
    /// Local bearer port.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Path to the INI-style config file.
    #[arg(short = 'c', long, default_value = "acsgw.cfg")]
    pub config: PathBuf,

    /// Log to stdout instead of syslog.
    #[arg(long = "logstdout")]
    pub logstdout: bool,

    /// Print the version and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,
}
