//! Command-line argument surface.

use clap::{ArgAction, ArgGroup, Parser, ValueEnum};

use crate::protocol::DEFAULT_PORT;
use crate::{KeepWhose, Options};

// --hash claims -h, so the automatic help shorthand is disabled and --help
// is declared explicitly below.
#[derive(Debug, Parser)]
#[command(
    name = "zync",
    about = "Two-way file tree synchronization over TCP",
    disable_help_flag = true,
    group(ArgGroup::new("mode").required(true).args(["server", "connect"]))
)]
pub struct Args {
    /// Serve the working directory to connecting clients
    #[arg(short = 's', long)]
    pub server: bool,

    /// Connect to a server (host, host:port, or zync://host[:port])
    #[arg(short = 'c', long, value_name = "URI")]
    pub connect: Option<String>,

    /// Reserved: checksum-based comparison
    #[arg(short = 'h', long)]
    pub hash: bool,

    /// Trace per-file activity on stdout
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Ask before acting on each difference
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Port to listen on (server)
    #[arg(short = 'p', long, value_name = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Refuse deletion requests (server)
    #[arg(short = 'r', long)]
    pub restrict: bool,

    /// Refuse deletion requests and overwrites (server)
    #[arg(short = 'R', long = "Restrict")]
    pub restrict_all: bool,

    /// Which side wins when versions differ (client)
    #[arg(short = 'k', long, value_enum, value_name = "WHOSE")]
    pub keep: Option<KeepArg>,

    /// Delete files missing from the kept side (client)
    #[arg(short = 'd', long, requires = "keep")]
    pub delete: bool,

    /// Reserved: swap the transfer direction
    #[arg(long)]
    pub reverse: bool,

    /// Print help
    #[arg(long, action = ArgAction::Help)]
    pub help: Option<bool>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum KeepArg {
    Mine,
    Theirs,
}

impl Args {
    pub fn options(&self) -> Options {
        Options {
            port: self.port,
            hash: self.hash,
            verbose: self.verbose,
            interactive: self.interactive,
            restrict: self.restrict,
            restrict_all: self.restrict_all,
            keep: self.keep.map(|k| match k {
                KeepArg::Mine => KeepWhose::Mine,
                KeepArg::Theirs => KeepWhose::Theirs,
            }),
            auto_delete: self.delete,
            reverse: self.reverse,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_exactly_one_mode_required() {
        assert!(Args::try_parse_from(["zync"]).is_err());
        assert!(Args::try_parse_from(["zync", "-s", "-c", "host"]).is_err());
        assert!(Args::try_parse_from(["zync", "-s"]).is_ok());
        assert!(Args::try_parse_from(["zync", "-c", "host"]).is_ok());
    }

    #[test]
    fn test_delete_requires_keep() {
        assert!(Args::try_parse_from(["zync", "-c", "host", "-d"]).is_err());
        let args = Args::try_parse_from(["zync", "-c", "host", "-k", "mine", "-d"]).unwrap();
        let opts = args.options();
        assert_eq!(opts.keep, Some(KeepWhose::Mine));
        assert!(opts.auto_delete);
    }

    #[test]
    fn test_server_flags() {
        let args = Args::try_parse_from(["zync", "-s", "-p", "9000", "-R"]).unwrap();
        let opts = args.options();
        assert_eq!(opts.port, 9000);
        assert!(opts.restrict_all);
        assert!(!opts.restrict);

        let args = Args::try_parse_from(["zync", "--server", "--Restrict"]).unwrap();
        assert!(args.options().restrict_all);
        assert_eq!(args.options().port, DEFAULT_PORT);
    }

    #[test]
    fn test_short_h_is_hash_not_help() {
        let args = Args::try_parse_from(["zync", "-s", "-h"]).unwrap();
        assert!(args.options().hash);
    }

    #[test]
    fn test_reserved_flags_accepted() {
        let args =
            Args::try_parse_from(["zync", "-c", "host", "--reverse", "-h", "-v", "-i"]).unwrap();
        let opts = args.options();
        assert!(opts.reverse && opts.hash && opts.verbose && opts.interactive);
    }
}
