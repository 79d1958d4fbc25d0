use clap::{ArgAction, Args, Parser, Subcommand};
use nixrm_core::{ConfigOverrides, LibraryPathMode};

pub const NIXRM_HELP_TEMPLATE: &str =
    "{before-help}\nUsage:\n    {usage}\n\nGlobal options:\n{options}\n";

pub const NIXRM_BEFORE_HELP: &str = concat!(
    "nixrm ",
    env!("CARGO_PKG_VERSION"),
    " – Run store closures on hosts without a store\n\n",
    "\x1b[1;36mCommands\x1b[0m\n",
    "  run              Relocate an installable's closure, ship it over ssh, and run it.\n",
);

const RUN_AFTER_HELP: &str = "\
Examples:
  nixrm run nixpkgs#hello build-box
  nixrm run .#server prod-1 -c server --port 8080
  nixrm run nixpkgs#ripgrep box --dry-run

The closure is copied under --remap (default /tmp/nixrm), which must have as
many characters as --store (default /nix/store).";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    propagate_version = false,
    disable_help_subcommand = true,
    before_help = NIXRM_BEFORE_HELP,
    help_template = NIXRM_HELP_TEMPLATE
)]
pub struct NixrmCli {
    #[arg(
        short,
        long,
        help = "Suppress human output (errors still print to stderr)",
        global = true
    )]
    pub quiet: bool,
    #[arg(
        short,
        long,
        action = ArgAction::Count,
        help = "Increase logging (-vvv reaches trace)",
        global = true
    )]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(
        long,
        help = "Emit {status,message,details} JSON envelopes",
        global = true
    )]
    pub json: bool,
    #[arg(long, help = "Disable colored human output", global = true)]
    pub no_color: bool,
    #[command(subcommand)]
    pub command: CommandCli,
}

#[derive(Subcommand, Debug)]
pub enum CommandCli {
    #[command(
        about = "Relocate a closure, publish it on <HOST>, and run a program from it.",
        override_usage = "nixrm run <INSTALLABLE> <HOST> [-c <COMMAND> [ARGS...]]",
        after_help = RUN_AFTER_HELP
    )]
    Run(RunArgs),
}

#[derive(Args, Debug)]
#[allow(clippy::struct_excessive_bools)]
pub struct RunArgs {
    #[arg(value_name = "INSTALLABLE", help = "Flake reference, attribute or store path")]
    pub installable: String,
    #[arg(value_name = "HOST", help = "ssh destination (user@host or a config alias)")]
    pub host: String,
    #[arg(
        short = 'c',
        long = "command",
        value_name = "COMMAND",
        num_args = 1..,
        allow_hyphen_values = true,
        help = "Program to run and its arguments (defaults to the main program)"
    )]
    pub command: Vec<String>,
    #[arg(long, value_name = "DIR", help = "Local store root [env: NIXRM_STORE]")]
    pub store: Option<String>,
    #[arg(
        long,
        value_name = "DIR",
        help = "Remote root replacing the store root [env: NIXRM_REMAP]"
    )]
    pub remap: Option<String>,
    #[arg(
        long,
        value_name = "DIR",
        help = "Remote staging directory, on the same filesystem as --remap [env: NIXRM_REMOTE_TMP]"
    )]
    pub remote_tmp: Option<String>,
    #[arg(
        short = 'j',
        long,
        value_name = "N",
        help = "Parallel rewrite and transfer workers [env: NIXRM_JOBS]"
    )]
    pub jobs: Option<usize>,
    #[arg(
        long,
        value_name = "N",
        help = "Attempts per transfer before giving up [env: NIXRM_RETRIES]"
    )]
    pub retries: Option<u32>,
    #[arg(
        long,
        value_name = "MODE",
        value_parser = parse_library_path,
        help = "LD_LIBRARY_PATH entries: primary, closure or none [env: NIXRM_LIBRARY_PATH]"
    )]
    pub library_path: Option<LibraryPathMode>,
    #[arg(long, help = "Query the store without building the installable first")]
    pub no_build: bool,
    #[arg(long, help = "Stop after comparing with the remote manifest")]
    pub dry_run: bool,
}

impl RunArgs {
    pub fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            store: self.store.clone(),
            remap: self.remap.clone(),
            remote_tmp: self.remote_tmp.clone(),
            jobs: self.jobs,
            retries: self.retries,
            library_path: self.library_path,
        }
    }

    /// Splits `-c` into the program and its arguments.
    pub fn command_and_args(&self) -> (Option<String>, Vec<String>) {
        match self.command.split_first() {
            Some((command, args)) => (Some(command.clone()), args.to_vec()),
            None => (None, Vec::new()),
        }
    }
}

fn parse_library_path(value: &str) -> Result<LibraryPathMode, String> {
    value.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_swallows_its_own_flags() {
        let cli = NixrmCli::try_parse_from([
            "nixrm", "run", "nixpkgs#hello", "box", "--dry-run", "-c", "hello", "-g", "hi",
        ])
        .unwrap();
        let CommandCli::Run(args) = cli.command;
        assert!(args.dry_run);
        assert_eq!(
            args.command_and_args(),
            (Some("hello".into()), vec!["-g".into(), "hi".into()])
        );
    }

    #[test]
    fn library_path_modes_parse() {
        let cli = NixrmCli::try_parse_from([
            "nixrm",
            "run",
            "x",
            "box",
            "--library-path",
            "closure",
            "-j",
            "4",
        ])
        .unwrap();
        let CommandCli::Run(args) = cli.command;
        assert_eq!(args.library_path, Some(LibraryPathMode::Closure));
        assert_eq!(args.overrides().jobs, Some(4));
        assert!(NixrmCli::try_parse_from(["nixrm", "run", "x", "box", "--library-path", "lib"])
            .is_err());
    }
}
