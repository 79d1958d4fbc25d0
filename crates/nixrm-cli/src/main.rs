use atty::Stream;
use clap::Parser;
use color_eyre::Result;
use nixrm_core::{
    outcome_from_run, run_remote, Cancellation, CommandStatus, Config, ExecutionOutcome,
    GlobalOptions, RunRequest, SystemEffects,
};
use serde_json::{json, Value};

mod cli;
mod style;

use cli::{CommandCli, NixrmCli, RunArgs};
use style::Style;

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = NixrmCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let global = GlobalOptions {
        quiet: cli.quiet,
        verbose: cli.verbose,
        trace: cli.trace,
        json: cli.json,
    };

    let outcome = match &cli.command {
        CommandCli::Run(args) => run(args),
    };
    let code = emit_output(&global, cli.no_color, &outcome)?;

    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("nixrm={level},nixrm_core={level},nixrm_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn run(args: &RunArgs) -> ExecutionOutcome {
    let config = match Config::from_env() {
        Ok(config) => config.with_overrides(args.overrides()),
        Err(err) => {
            return ExecutionOutcome::user_error(
                format!("invalid configuration: {err:#}"),
                json!({ "hint": "check the NIXRM_* environment variables" }),
            );
        }
    };
    let cancel = Cancellation::new();
    cancel.install_signal_handlers();
    let effects = SystemEffects::new(&config);
    let (command, command_args) = args.command_and_args();
    let request = RunRequest {
        installable: args.installable.clone(),
        host: args.host.clone(),
        command,
        args: command_args,
        build: !args.no_build,
        dry_run: args.dry_run,
        tty: atty::is(Stream::Stdin),
    };
    tracing::debug!(
        cache = %config.cache.path.display(),
        source = config.cache.source,
        "using rewrite cache"
    );
    outcome_from_run(run_remote(&request, &config, &effects, &cancel))
}

/// Prints the outcome and returns the process exit code.
///
/// Stdout belongs to the remote command, so human status for a finished run
/// goes to stderr; dry runs report on stdout.
fn emit_output(global: &GlobalOptions, no_color: bool, outcome: &ExecutionOutcome) -> Result<i32> {
    let code = outcome.exit_code();

    if global.json {
        let payload = json!({
            "status": outcome.status.as_str(),
            "message": outcome.message,
            "details": outcome.details,
            "exit_code": code,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(code);
    }

    match outcome.status {
        CommandStatus::Ok if is_dry_run(&outcome.details) => {
            if !global.quiet {
                let style = Style::new(no_color, atty::is(Stream::Stdout));
                println!("{}", style.status(outcome.status, &outcome.message));
                for object in missing_objects(&outcome.details) {
                    println!("  {}", style.dimmed(object));
                }
            }
        }
        CommandStatus::Ok => {
            if global.verbose > 0 && !global.quiet {
                let style = Style::new(no_color, atty::is(Stream::Stderr));
                eprintln!("{}", style.status(outcome.status, &outcome.message));
                if let Some(transfer) = outcome.details.get("transfer") {
                    eprintln!("{}", style.info(&transfer_line(transfer)));
                }
            }
        }
        CommandStatus::UserError | CommandStatus::Failure => {
            let style = Style::new(no_color, atty::is(Stream::Stderr));
            eprintln!("{}", style.status(outcome.status, &failure_line(outcome)));
            if let Some(hint) = hint_from_details(&outcome.details) {
                eprintln!("{}", style.hint(hint));
            }
        }
    }

    Ok(code)
}

/// Prefixes the message with the pipeline stage that failed, when known.
fn failure_line(outcome: &ExecutionOutcome) -> String {
    match outcome.details.get("stage").and_then(Value::as_str) {
        Some(stage) => format!("{stage}: {}", outcome.message),
        None => outcome.message.clone(),
    }
}

fn hint_from_details(details: &Value) -> Option<&str> {
    details
        .as_object()
        .and_then(|map| map.get("hint"))
        .and_then(Value::as_str)
}

fn is_dry_run(details: &Value) -> bool {
    details
        .get("dry_run")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn missing_objects(details: &Value) -> impl Iterator<Item = &str> {
    details
        .get("missing")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
}

fn transfer_line(transfer: &Value) -> String {
    let field = |name: &str| transfer.get(name).and_then(Value::as_u64).unwrap_or(0);
    format!(
        "sent {} objects ({} bytes), {} already present",
        field("sent"),
        field("bytes"),
        field("skipped")
    )
}
