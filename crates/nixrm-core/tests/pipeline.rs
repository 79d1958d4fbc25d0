#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use nixrm_core::{
    run_remote, Cancellation, Config, Effects, EnvSnapshot, LocalShell, PathInfo, PipelineError,
    RemoteShell, ResolutionError, RewriteError, RunRequest, Stage, StoreQuery, TransferError,
};

const PRIMARY: &str = "abcd-hello-1.0";
const DATA: &str = "wxyz-greeting";

struct FakeStore {
    root: String,
}

impl FakeStore {
    fn info(&self, basename: &str, references: &[&str]) -> PathInfo {
        PathInfo {
            path: format!("{}/{basename}", self.root),
            references: references
                .iter()
                .map(|reference| format!("{}/{reference}", self.root))
                .collect(),
            nar_size: None,
        }
    }
}

impl StoreQuery for FakeStore {
    fn build(&self, _installable: &str) -> Result<(), ResolutionError> {
        Ok(())
    }

    fn path_info(
        &self,
        _installable: &str,
        recursive: bool,
    ) -> Result<Vec<PathInfo>, ResolutionError> {
        let primary = self.info(PRIMARY, &[DATA]);
        if recursive {
            Ok(vec![primary, self.info(DATA, &[])])
        } else {
            Ok(vec![primary])
        }
    }

    fn main_program(&self, _installable: &str) -> Option<String> {
        None
    }
}

struct LoopbackEffects {
    store: FakeStore,
    connects: AtomicUsize,
}

impl Effects for LoopbackEffects {
    fn store(&self) -> &dyn StoreQuery {
        &self.store
    }

    fn connect(&self, _host: &str) -> Result<Box<dyn RemoteShell>, TransferError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(LocalShell::new()))
    }
}

/// A local store and a same-length remote root inside one temp dir.
struct Fixture {
    temp: tempfile::TempDir,
    store: PathBuf,
    remote: PathBuf,
    cache: PathBuf,
}

impl Fixture {
    fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let store = temp.path().join("store");
        let remote = temp.path().join("remot");
        let cache = temp.path().join("cache");

        let data = store.join(DATA).join("share");
        fs::create_dir_all(&data)?;
        fs::write(data.join("message"), "hello from the closure\n")?;

        let bin = store.join(PRIMARY).join("bin");
        fs::create_dir_all(&bin)?;
        let script = format!(
            "#!/bin/sh\ncat {}/{DATA}/share/message > \"$1\"\nexit 42\n",
            store.display()
        );
        fs::write(bin.join("hello"), script)?;
        fs::set_permissions(bin.join("hello"), fs::Permissions::from_mode(0o755))?;

        Ok(Self {
            temp,
            store,
            remote,
            cache,
        })
    }

    fn config(&self, remap: &Path) -> Result<Config> {
        let store = self.store.display().to_string();
        let remap = remap.display().to_string();
        let cache = self.cache.display().to_string();
        Config::from_snapshot(&EnvSnapshot::from_pairs(&[
            ("NIXRM_STORE", store.as_str()),
            ("NIXRM_REMAP", remap.as_str()),
            ("NIXRM_CACHE_DIR", cache.as_str()),
            ("NIXRM_JOBS", "2"),
            ("NIXRM_RETRIES", "1"),
            ("NIXRM_RETRY_BACKOFF_MS", "0"),
        ]))
    }

    fn effects(&self) -> LoopbackEffects {
        LoopbackEffects {
            store: FakeStore {
                root: self.store.display().to_string(),
            },
            connects: AtomicUsize::new(0),
        }
    }

    fn request(&self, out: &Path) -> RunRequest {
        RunRequest {
            installable: "demo#hello".into(),
            host: "loopback".into(),
            command: None,
            args: vec![out.display().to_string()],
            build: true,
            dry_run: false,
            tty: false,
        }
    }
}

#[test]
fn runs_the_relocated_closure_and_reuses_it() -> Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&fx.remote)?;
    let effects = fx.effects();
    let out = fx.temp.path().join("out.txt");

    let first = run_remote(&fx.request(&out), &config, &effects, &Cancellation::new())?;
    assert_eq!(first.exit_code, Some(42));
    assert_eq!(first.command, "hello");
    assert_eq!(first.transfer.sent, 2);
    assert!(first.replacements >= 1);
    assert_eq!(fs::read_to_string(&out)?, "hello from the closure\n");

    let published = fs::read_to_string(fx.remote.join(PRIMARY).join("bin/hello"))?;
    assert!(published.contains(&format!("{}/{DATA}/share/message", fx.remote.display())));
    assert!(!published.contains(&fx.store.display().to_string()));
    let original = fs::read_to_string(fx.store.join(PRIMARY).join("bin/hello"))?;
    assert!(original.contains(&fx.store.display().to_string()));

    fs::remove_file(&out)?;
    let second = run_remote(&fx.request(&out), &config, &effects, &Cancellation::new())?;
    assert_eq!(second.exit_code, Some(42));
    assert!(second.missing.is_empty());
    assert_eq!(second.transfer.sent, 0);
    assert_eq!(second.transfer.bytes, 0);
    assert_eq!(fs::read_to_string(&out)?, "hello from the closure\n");
    assert_eq!(effects.connects.load(Ordering::SeqCst), 2);
    Ok(())
}

#[test]
fn shorter_remap_fails_before_any_contact() -> Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&fx.temp.path().join("remo"))?;
    let effects = fx.effects();
    let out = fx.temp.path().join("out.txt");

    let err = run_remote(&fx.request(&out), &config, &effects, &Cancellation::new()).unwrap_err();
    assert!(matches!(err, PipelineError::Rewrite(RewriteError::Mapping(_))));
    assert!(err.is_user_error());
    assert_eq!(effects.connects.load(Ordering::SeqCst), 0);
    assert!(!fx.cache.exists());
    Ok(())
}

#[test]
fn dry_run_reports_without_publishing() -> Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&fx.remote)?;
    let out = fx.temp.path().join("out.txt");
    let mut request = fx.request(&out);
    request.dry_run = true;

    let summary = run_remote(&request, &config, &fx.effects(), &Cancellation::new())?;
    assert!(summary.dry_run);
    assert_eq!(summary.exit_code, None);
    assert_eq!(summary.missing.len(), 2);
    assert!(summary.missing_bytes > 0);
    assert!(!fx.remote.join(PRIMARY).exists());
    assert!(!out.exists());
    Ok(())
}

#[test]
fn rerun_after_an_interrupted_transfer_converges() -> Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&fx.remote)?;
    let out = fx.temp.path().join("out.txt");

    // Object renamed into place but the run died before writing its marker.
    let partial = fx.remote.join(PRIMARY).join("bin");
    fs::create_dir_all(&partial)?;
    fs::write(partial.join("hello"), "#!/bin/sh\nexit 1\n")?;
    fs::create_dir_all(fx.remote.join(".staging").join(format!("{DATA}.dead")))?;

    let summary = run_remote(&fx.request(&out), &config, &fx.effects(), &Cancellation::new())?;
    assert_eq!(summary.exit_code, Some(42));
    assert_eq!(summary.transfer.sent, 2);
    assert_eq!(fs::read_to_string(&out)?, "hello from the closure\n");
    assert!(fx.remote.join(".manifest").join(PRIMARY).is_file());
    Ok(())
}

#[test]
fn conflicting_remote_copy_is_reported() -> Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&fx.remote)?;
    let out = fx.temp.path().join("out.txt");

    fs::create_dir_all(fx.remote.join(".manifest"))?;
    fs::create_dir_all(fx.remote.join(DATA))?;
    fs::write(fx.remote.join(".manifest").join(DATA), "0000 5\n")?;

    let err = run_remote(&fx.request(&out), &config, &fx.effects(), &Cancellation::new())
        .unwrap_err();
    assert!(matches!(
        err,
        PipelineError::Transfer(TransferError::VerificationMismatch { .. }, Stage::Manifest)
    ));
    assert_eq!(err.object(), Some(DATA));
    assert!(!out.exists());
    Ok(())
}

#[test]
fn cancelled_runs_stop_before_the_host() -> Result<()> {
    let fx = Fixture::new()?;
    let config = fx.config(&fx.remote)?;
    let effects = fx.effects();
    let cancel = Cancellation::new();
    cancel.cancel();

    let err = run_remote(&fx.request(&fx.temp.path().join("out")), &config, &effects, &cancel)
        .unwrap_err();
    assert!(matches!(err, PipelineError::Cancelled(Stage::Rewrite)));
    assert_eq!(effects.connects.load(Ordering::SeqCst), 0);
    Ok(())
}
