//! # Unioning change layers into a commit
//!
//! The base commit is checked out into a scratch directory, and each change
//! directory is merged on top of it in order, using the same algorithm as
//! overlayfs: directories merge, anything else replaces what was there.
//! Deletions are expressed with container whiteouts: `.wh.<name>` removes
//! `<name>`, `.wh..wh..opq` hides everything the directory contained in
//! lower layers, and overlayfs style `0:0` character devices remove the path
//! of the same name. The result is written as a new commit whose parent is
//! the base; neither the base nor the change directories are modified.

use std::sync::atomic::{AtomicI64, Ordering};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::{Dir, DirBuilder, DirEntry};
use cap_std::io_lifetimes::AsFilelike;
use cap_std_ext::cap_tempfile::TempFile;
use cap_std_ext::dirext::CapStdExtDirExt;
use cap_std_ext::{
    cap_primitives::{
        self,
        fs::{DirBuilderExt, MetadataExt, OpenOptionsExt},
    },
    cap_std,
};
use rustix::fd::AsFd;

use crate::error::{Error, Result};
use crate::repo::CommitStore;
use crate::storage::OSTREE_BASE_REF;

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// What to union and how to label the resulting commit.
#[derive(Debug, Clone)]
pub struct UnionOptions {
    /// Change directories, lowest first.
    pub change_dirs: Vec<Utf8PathBuf>,
    /// Ref or checksum of the base commit.
    pub base: String,
    /// Ref to point at the new commit.
    pub branch: String,
    /// Commit subject.
    pub subject: String,
    /// Commit body.
    pub body: String,
}

impl UnionOptions {
    /// Union `change_dirs` on top of the `base` ref into `branch`.
    pub fn new(change_dirs: Vec<Utf8PathBuf>, branch: impl Into<String>) -> Self {
        Self {
            change_dirs,
            base: OSTREE_BASE_REF.to_owned(),
            branch: branch.into(),
            subject: String::new(),
            body: String::new(),
        }
    }
}

struct MergeState<'a> {
    trash: &'a Dir,
    // Unique integer for naming trashed files
    trashid: AtomicI64,
    can_clone: bool,
}

impl MergeState<'_> {
    /// Move `path` of `output` out of the way.
    fn move_to_trash(&self, output: &Dir, path: &Utf8Path) -> Result<()> {
        let id = self.trashid.fetch_add(1, Ordering::SeqCst);
        let inum = output
            .symlink_metadata(path)
            .map_err(Error::io_at(path))?
            .ino();
        let tempname = format!("t{id:X}-{inum:X}");
        output
            .rename(path, self.trash, &tempname)
            .map_err(Error::io_at(path))
    }
}

fn entry_name(elt: &DirEntry, parent: &Utf8Path) -> Result<String> {
    elt.file_name().into_string().map_err(|n| Error::Malformed {
        what: "change layer",
        detail: format!("non UTF-8 file name {n:?} in {parent}"),
    })
}

/// Given one directory entry, perform an overlayfs-style merge operation.
fn merge_one_entry(
    layer: &Dir,
    elt: DirEntry,
    pathbuf: &mut Utf8PathBuf,
    output: &Dir,
    state: &MergeState,
) -> Result<()> {
    let name = entry_name(&elt, pathbuf)?;
    if name == OPAQUE_WHITEOUT {
        // Handled before any sibling by merge_layer
        return Ok(());
    }
    if let Some(target) = name.strip_prefix(WHITEOUT_PREFIX) {
        if target.is_empty() || target.contains('/') {
            return Err(Error::Malformed {
                what: "whiteout",
                detail: format!("{}", pathbuf.join(&name)),
            });
        }
        let target = pathbuf.join(target);
        if output.symlink_metadata_optional(&target)?.is_some() {
            state.move_to_trash(output, &target)?;
        }
        return Ok(());
    }

    // We operate on a shared path buffer; append the name of the target file.
    pathbuf.push(&name);
    let src_meta = elt.metadata().map_err(Error::io_at(&*pathbuf))?;
    let src_ftype = src_meta.file_type();

    let target_meta = output.symlink_metadata_optional(&*pathbuf)?;
    if src_ftype.is_dir() {
        // The source layer type is a directory.  Check if we need to create it.
        let mut needs_create = true;
        if let Some(target_meta) = target_meta {
            if target_meta.is_dir() {
                needs_create = false;
            } else {
                // The target exists and is not a directory.  Trash it.
                state.move_to_trash(output, pathbuf)?;
            }
        }
        if needs_create {
            let mut db = DirBuilder::new();
            db.mode(src_meta.mode());
            output
                .create_dir_with(&*pathbuf, &db)
                .map_err(Error::io_at(&*pathbuf))?;
        }
        merge_layer(layer, pathbuf, output, state)?;
    } else if (src_meta.mode() & libc::S_IFMT) == libc::S_IFCHR && src_meta.rdev() == 0 {
        // The layer specifies a whiteout entry; remove the target path.
        if target_meta.is_some() {
            state.move_to_trash(output, pathbuf)?;
        }
    } else {
        // A non-directory replaces whatever the target was.
        if target_meta.is_some() {
            state.move_to_trash(output, pathbuf)?;
        }
        if src_meta.is_symlink() {
            let path = pathbuf.as_std_path();
            let target = cap_primitives::fs::read_link_contents(&layer.as_filelike_view(), path)
                .map_err(Error::io_at(&*pathbuf))?;
            cap_primitives::fs::symlink_contents(target, &output.as_filelike_view(), path)
                .map_err(Error::io_at(&*pathbuf))?;
        } else {
            let src = layer.open(&*pathbuf).map_err(Error::io_at(&*pathbuf))?;
            // Use reflinks if available, otherwise fall back to hard linking; the
            // output is only ever renamed away, never written through.
            if state.can_clone {
                let mut openopts = cap_std::fs::OpenOptions::new();
                openopts.write(true);
                openopts.create_new(true);
                openopts.mode(src_meta.mode());
                let dest = output
                    .open_with(&*pathbuf, &openopts)
                    .map_err(Error::io_at(&*pathbuf))?;
                rustix::fs::ioctl_ficlone(dest.as_fd(), src.as_fd())
                    .map_err(|e| Error::io_at(&*pathbuf)(e.into()))?;
            } else {
                layer
                    .hard_link(&*pathbuf, output, &*pathbuf)
                    .map_err(Error::io_at(&*pathbuf))?;
            }
        }
    }
    pathbuf.pop();
    Ok(())
}

/// Merge one directory of a layer, including processing whiteouts.
fn merge_layer(
    layer: &Dir,
    pathbuf: &mut Utf8PathBuf,
    output: &Dir,
    state: &MergeState,
) -> Result<()> {
    if layer.try_exists(pathbuf.join(OPAQUE_WHITEOUT))? {
        tracing::debug!("Opaque directory: {pathbuf}");
        for elt in output.read_dir(&*pathbuf).map_err(Error::io_at(&*pathbuf))? {
            let name = entry_name(&elt?, pathbuf)?;
            state.move_to_trash(output, &pathbuf.join(name))?;
        }
    }
    for elt in layer.read_dir(&*pathbuf).map_err(Error::io_at(&*pathbuf))? {
        let elt = elt?;
        merge_one_entry(layer, elt, pathbuf, output, state)?;
    }
    Ok(())
}

fn open_dir(path: &Utf8Path) -> Result<Dir> {
    match Dir::open_ambient_dir(path, cap_std::ambient_authority()) {
        Ok(d) => Ok(d),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(Error::not_found("changes directory", path.as_str()))
        }
        Err(e) => Err(Error::io_at(path)(e)),
    }
}

/// Merge `change_dirs`, in order, into the directory tree at `output`.
pub fn merge_change_dirs(
    change_dirs: &[Utf8PathBuf],
    output: &Utf8Path,
    trash: &Utf8Path,
) -> Result<()> {
    let outdir = open_dir(output)?;
    let trashdir = open_dir(trash)?;
    // The trash is shared by every layer, so names must stay unique across them
    let mut state = MergeState {
        trash: &trashdir,
        trashid: Default::default(),
        can_clone: false,
    };
    let mut clone_support = None;
    for layer_path in change_dirs {
        tracing::debug!("Merging layer: {layer_path}");
        let layer = open_dir(layer_path)?;
        // Determine if we can do reflinks
        state.can_clone = match clone_support {
            Some(v) => v,
            None => {
                let src = TempFile::new(&layer)?;
                let dest = TempFile::new(&outdir)?;
                let did_clone =
                    rustix::fs::ioctl_ficlone(dest.as_file().as_fd(), src.as_file().as_fd())
                        .is_ok();
                clone_support = Some(did_clone);
                did_clone
            }
        };
        let mut pathbuf = Utf8PathBuf::from(".");
        merge_layer(&layer, &mut pathbuf, &outdir, &state)?;
    }
    Ok(())
}

/// Union the change directories on top of the base commit and write the
/// result as a new commit, returning its checksum.
///
/// Scratch space is taken from `scratch`, which should be on the same
/// filesystem as the change directories.
pub fn union(store: &dyn CommitStore, scratch: &Utf8Path, opts: &UnionOptions) -> Result<String> {
    let base = store.resolve_rev(&opts.base)?;
    for d in &opts.change_dirs {
        if !d.is_dir() {
            return Err(Error::not_found("changes directory", d.as_str()));
        }
    }
    let td = tempfile::Builder::new()
        .prefix(".tcbuilder-union-")
        .tempdir_in(scratch)
        .map_err(Error::io_at(scratch))?;
    let td_path = Utf8Path::from_path(td.path()).ok_or_else(|| {
        Error::InvalidOperation(format!("non UTF-8 scratch path: {}", td.path().display()))
    })?;
    let tree = td_path.join("tree");
    let trash = td_path.join("trash");
    std::fs::create_dir(&trash).map_err(Error::io_at(&trash))?;

    tracing::debug!("Checking out {base} into {tree}");
    store.checkout(&base, &tree)?;
    merge_change_dirs(&opts.change_dirs, &tree, &trash)?;
    let checksum = store.write_commit(&tree, &base, &opts.branch, &opts.subject, &opts.body)?;
    tracing::info!("Commit {checksum} has been generated for changes and ready to be deployed.");
    Ok(checksum)
}
