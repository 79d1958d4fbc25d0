use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use crate::core::errors::ResolutionError;
use crate::core::process::{run_command, RunOutput};

/// One record of `nix path-info --json`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PathInfo {
    pub path: String,
    pub references: Vec<String>,
    pub nar_size: Option<u64>,
}

/// Read-only access to the local store's query tooling.
pub trait StoreQuery: Send + Sync {
    /// Realises `installable` without creating result links.
    fn build(&self, installable: &str) -> Result<(), ResolutionError>;

    /// Store paths of `installable`, or of its whole closure when `recursive`.
    fn path_info(&self, installable: &str, recursive: bool)
        -> Result<Vec<PathInfo>, ResolutionError>;

    /// `meta.mainProgram` of the installable, when it declares one.
    fn main_program(&self, installable: &str) -> Option<String>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListRecord {
    path: String,
    #[serde(default)]
    references: Vec<String>,
    nar_size: Option<u64>,
    #[serde(default = "valid_default")]
    valid: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapRecord {
    #[serde(default)]
    references: Vec<String>,
    nar_size: Option<u64>,
}

fn valid_default() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PathInfoDocument {
    List(Vec<ListRecord>),
    Map(BTreeMap<String, Option<MapRecord>>),
}

/// Parses both JSON shapes emitted by `nix path-info --json`: the older array of
/// records carrying their own `path`, and the newer object keyed by path where
/// invalid paths map to `null`.
pub fn parse_path_info(json: &str) -> Result<Vec<PathInfo>, ResolutionError> {
    let document: PathInfoDocument = serde_json::from_str(json)
        .map_err(|err| ResolutionError::MalformedOutput(err.to_string()))?;
    let invalid =
        |path: &str| ResolutionError::MalformedOutput(format!("{path} is not a valid store path"));
    match document {
        PathInfoDocument::List(records) => records
            .into_iter()
            .map(|record| {
                if !record.valid {
                    return Err(invalid(&record.path));
                }
                Ok(PathInfo {
                    path: record.path,
                    references: record.references,
                    nar_size: record.nar_size,
                })
            })
            .collect(),
        PathInfoDocument::Map(records) => records
            .into_iter()
            .map(|(path, record)| {
                let record = record.ok_or_else(|| invalid(&path))?;
                Ok(PathInfo {
                    path,
                    references: record.references,
                    nar_size: record.nar_size,
                })
            })
            .collect(),
    }
}

/// [`StoreQuery`] backed by the `nix` command line tool.
#[derive(Clone, Debug)]
pub struct NixCli {
    program: String,
}

impl NixCli {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<RunOutput, ResolutionError> {
        let mut argv = vec![
            "--extra-experimental-features".to_string(),
            "nix-command flakes".to_string(),
        ];
        argv.extend(args.iter().map(|arg| (*arg).to_string()));
        debug!(program = %self.program, args = ?args, "store query");
        run_command(&self.program, &argv).map_err(|err| ResolutionError::Unavailable {
            program: self.program.clone(),
            reason: format!("{err:#}"),
        })
    }
}

impl StoreQuery for NixCli {
    fn build(&self, installable: &str) -> Result<(), ResolutionError> {
        let output = self.run(&["build", "--no-link", installable])?;
        if output.success() {
            Ok(())
        } else {
            Err(ResolutionError::BuildFailed {
                installable: installable.to_string(),
                stderr: output.stderr_summary(),
            })
        }
    }

    fn path_info(
        &self,
        installable: &str,
        recursive: bool,
    ) -> Result<Vec<PathInfo>, ResolutionError> {
        let mut args = vec!["path-info", "--json"];
        if recursive {
            args.push("--recursive");
        }
        args.push(installable);
        let output = self.run(&args)?;
        if !output.success() {
            return Err(ResolutionError::QueryFailed {
                installable: installable.to_string(),
                command: format!("nix {}", args.join(" ")),
                stderr: output.stderr_summary(),
            });
        }
        parse_path_info(&output.stdout)
    }

    fn main_program(&self, installable: &str) -> Option<String> {
        let attr = format!("{installable}.meta.mainProgram");
        let output = self.run(&["eval", "--raw", &attr]).ok()?;
        if !output.success() {
            debug!(installable, "no meta.mainProgram");
            return None;
        }
        let program = output.stdout.trim();
        (!program.is_empty() && !program.contains('/')).then(|| program.to_string())
    }
}
