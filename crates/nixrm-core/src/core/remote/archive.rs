use std::fs::File;
use std::io::{self, Seek, SeekFrom};
use std::path::PathBuf;

use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Builder, EntryType, Header};

use nixrm_domain::FileKind;

use crate::core::rewrite::RewrittenObject;

/// Packs the rewritten tree into a gzip tar spooled to an anonymous temp file.
///
/// Entry paths start with the object basename; the empty listing path is the
/// object itself. Modes, owners and mtimes are normalized so the archive only
/// depends on the tree's content. Returns the file rewound to the start and
/// its compressed size.
pub(crate) fn pack_object(object: &RewrittenObject) -> Result<(File, u64)> {
    let spool = tempfile::tempfile().context("failed to create archive spool file")?;
    let encoder = GzEncoder::new(spool, Compression::fast());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    let basename = object.basename();

    for entry in &object.files {
        let name = if entry.path.as_os_str().is_empty() {
            PathBuf::from(&basename)
        } else {
            PathBuf::from(&basename).join(&entry.path)
        };
        let mut header = Header::new_gnu();
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(1);
        match &entry.kind {
            FileKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                builder
                    .append_data(&mut header, &name, io::empty())
                    .with_context(|| format!("failed to add {}", name.display()))?;
            }
            FileKind::Regular | FileKind::Executable => {
                let source = entry.resolve(&object.tree);
                let file = File::open(&source)
                    .with_context(|| format!("failed to open {}", source.display()))?;
                let len = file
                    .metadata()
                    .with_context(|| format!("failed to stat {}", source.display()))?
                    .len();
                header.set_entry_type(EntryType::Regular);
                header.set_mode(if entry.kind == FileKind::Executable {
                    0o755
                } else {
                    0o644
                });
                header.set_size(len);
                builder
                    .append_data(&mut header, &name, file)
                    .with_context(|| format!("failed to add {}", name.display()))?;
            }
            FileKind::Symlink { target } => {
                header.set_entry_type(EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                builder
                    .append_link(&mut header, &name, target)
                    .with_context(|| format!("failed to add link {}", name.display()))?;
            }
        }
    }

    let encoder = builder.into_inner().context("failed to finish archive")?;
    let mut spool = encoder.finish().context("failed to finish compression")?;
    let size = spool.seek(SeekFrom::End(0))?;
    spool.seek(SeekFrom::Start(0))?;
    Ok((spool, size))
}
