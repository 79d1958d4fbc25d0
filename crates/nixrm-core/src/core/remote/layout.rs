use super::shell::shell_quote;

const STALE_MINUTES: u32 = 24 * 60;
/// Seconds a publisher waits on another writer's lock before breaking it.
const LOCK_WAIT_SECONDS: u32 = 30;

/// Paths of the object cache on the remote host.
///
/// Objects live directly under the replacement root so that rewritten
/// references resolve; bookkeeping uses dot-directories, which can never
/// collide with a store basename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
    staging: String,
}

impl RemoteLayout {
    /// `staging` defaults to `<root>/.staging`. A custom staging directory must
    /// be on the same filesystem as `root` for the final rename to be atomic.
    #[must_use]
    pub fn new(root: &str, staging: Option<&str>) -> Self {
        Self {
            root: root.to_string(),
            staging: staging.map_or_else(|| format!("{root}/.staging"), ToOwned::to_owned),
        }
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    #[must_use]
    pub fn staging(&self) -> &str {
        &self.staging
    }

    #[must_use]
    pub fn manifest_dir(&self) -> String {
        format!("{}/.manifest", self.root)
    }

    #[must_use]
    pub fn launch_dir(&self) -> String {
        format!("{}/.launch", self.root)
    }

    #[must_use]
    pub fn object_path(&self, basename: &str) -> String {
        format!("{}/{basename}", self.root)
    }

    #[must_use]
    pub fn pid_path(&self, token: &str) -> String {
        format!("{}/{token}.pid", self.launch_dir())
    }

    /// Creates the layout and prunes staging and launch leftovers older than a day.
    pub(crate) fn prepare_script(&self) -> String {
        let staging = shell_quote(&self.staging);
        let launch = shell_quote(&self.launch_dir());
        format!(
            "set -eu\n\
             mkdir -p {root} {manifest} {staging} {launch}\n\
             find {staging} {launch} -mindepth 1 -maxdepth 1 -mmin +{STALE_MINUTES} \
             -exec chmod -R u+w {{}} + -exec rm -rf {{}} + 2>/dev/null || true\n",
            root = shell_quote(&self.root),
            manifest = shell_quote(&self.manifest_dir()),
        )
    }

    /// Prints `<basename> <digest> <size>` for every marker whose object exists.
    pub(crate) fn manifest_script(&self) -> String {
        format!(
            "cd {manifest} || exit 3\n\
             for marker in *; do\n\
             \x20 [ -f \"$marker\" ] || continue\n\
             \x20 [ -e {root}/\"$marker\" ] || [ -L {root}/\"$marker\" ] || continue\n\
             \x20 read -r digest size < \"$marker\" || continue\n\
             \x20 printf '%s %s %s\\n' \"$marker\" \"$digest\" \"$size\"\n\
             done\n",
            manifest = shell_quote(&self.manifest_dir()),
            root = shell_quote(&self.root),
        )
    }

    /// Extracts a gzip tar from stdin into a fresh staging directory, then
    /// renames the object into place and writes its marker last.
    ///
    /// Prints `present` when a marked copy with the same digest and size
    /// already exists (possibly written by a concurrent writer while
    /// extracting), `mismatch <digest> <size>` when the marked copy differs,
    /// and `published` otherwise. Markers are only removed, and objects only
    /// renamed, under a per-object `mkdir` lock. An object directory without a
    /// marker is a leftover from an interrupted transfer and is replaced.
    pub(crate) fn publish_script(
        &self,
        basename: &str,
        digest: &str,
        size: u64,
        token: &str,
    ) -> String {
        format!(
            "set -eu\n\
             name={name}\n\
             dest={root}/\"$name\"\n\
             marker={manifest}/\"$name\"\n\
             stage={staging}/\"$name.{token}\"\n\
             want={want}\n\
             present() {{ [ -f \"$marker\" ] && {{ [ -e \"$dest\" ] || [ -L \"$dest\" ]; }}; }}\n\
             settle() {{\n\
             \x20 present || return 0\n\
             \x20 have=$(cat \"$marker\" 2>/dev/null || true)\n\
             \x20 chmod -R u+w \"$stage\" 2>/dev/null || true\n\
             \x20 rm -rf \"$stage\"\n\
             \x20 if [ \"$have\" = \"$want\" ]; then echo present; else echo \"mismatch $have\"; fi\n\
             \x20 exit 0\n\
             }}\n\
             settle\n\
             mkdir -p {staging} {manifest}\n\
             rm -rf \"$stage\"\n\
             mkdir \"$stage\"\n\
             tar -xzf - -C \"$stage\"\n\
             lock={manifest}/\".lock.$name\"\n\
             tries=0\n\
             until mkdir \"$lock\" 2>/dev/null; do\n\
             \x20 settle\n\
             \x20 tries=$((tries + 1))\n\
             \x20 if [ \"$tries\" -ge {LOCK_WAIT_SECONDS} ]; then rm -rf \"$lock\"; fi\n\
             \x20 sleep 1\n\
             done\n\
             trap 'rmdir \"$lock\" 2>/dev/null || true' EXIT\n\
             settle\n\
             rm -f \"$marker\"\n\
             if [ -e \"$dest\" ] || [ -L \"$dest\" ]; then\n\
             \x20 echo \"nixrm: removing unmarked $dest left by an interrupted transfer\" >&2\n\
             \x20 mv \"$dest\" \"$stage.stale\"\n\
             \x20 chmod -R u+w \"$stage.stale\" 2>/dev/null || true\n\
             \x20 rm -rf \"$stage.stale\"\n\
             fi\n\
             mv \"$stage/$name\" \"$dest\"\n\
             rmdir \"$stage\"\n\
             tmp={manifest}/\".tmp.$name.{token}\"\n\
             printf '%s %s\\n' {digest} {size} > \"$tmp\"\n\
             mv -f \"$tmp\" \"$marker\"\n\
             echo published\n",
            name = shell_quote(basename),
            root = shell_quote(&self.root),
            manifest = shell_quote(&self.manifest_dir()),
            staging = shell_quote(&self.staging),
            want = shell_quote(&format!("{digest} {size}")),
            digest = shell_quote(digest),
        )
    }
}
