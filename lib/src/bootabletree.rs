//! Helper functions for bootable OSTree checkouts: locating the kernel
//! directory and the device tree blob the image boots with.

use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;

use crate::error::{Error, Result};
use crate::storage::WorkingTree;

const MODULES: &str = "usr/lib/modules";
const VMLINUZ: &str = "vmlinuz";
const DTB_SUBDIR: &str = "dtb";
/// Bootloader environment carrying the `fdtfile=` selection.
pub(crate) const UENV_TXT: &str = "usr/lib/ostree-boot/uEnv.txt";
const FDTFILE_KEY: &str = "fdtfile";
pub(crate) const DTB_EXTENSION: &str = "dtb";

fn read_dir_optional(
    d: &Dir,
    p: impl AsRef<Path>,
) -> std::io::Result<Option<cap_std::fs::ReadDir>> {
    match d.read_dir(p.as_ref()) {
        Ok(r) => Ok(Some(r)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Find the kernel modules directory in checked out directory tree.
/// The target directory will have a `vmlinuz` file representing the kernel binary.
pub fn find_kernel_dir_fs(root: &Dir) -> Result<Option<Utf8PathBuf>> {
    let mut r = None;
    let Some(entries) = read_dir_optional(root, MODULES)? else {
        return Ok(None);
    };
    for child in entries {
        let child = &child?;
        if !child.file_type()?.is_dir() {
            continue;
        }
        let name = child.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let mut pbuf = Utf8Path::new(MODULES).to_owned();
        pbuf.push(name);
        pbuf.push(VMLINUZ);
        if !root.try_exists(&pbuf)? {
            continue;
        }
        pbuf.pop();
        if let Some(prev) = r.replace(pbuf) {
            return Err(Error::InvalidOperation(format!(
                "found multiple kernel directories in {MODULES}: {prev} and {name}"
            )));
        }
    }
    Ok(r)
}

/// The device tree blob directory relative to a deployment root,
/// i.e. `usr/lib/modules/<kver>/dtb`.
pub fn dtb_kernel_subdir(root: &Dir) -> Result<Utf8PathBuf> {
    let kdir = find_kernel_dir_fs(root)?
        .ok_or_else(|| Error::not_found("kernel directory", MODULES))?;
    Ok(kdir.join(DTB_SUBDIR))
}

/// Parse the `fdtfile=` selection out of a bootloader environment file.
pub(crate) fn parse_fdtfile(uenv: &str) -> Option<&str> {
    uenv.lines()
        .filter_map(|l| l.trim().split_once('='))
        .filter_map(|(k, v)| (k.trim() == FDTFILE_KEY).then_some(v.trim()))
        .find(|v| !v.is_empty())
}

/// The device tree blob an image boots with, as far as it can be determined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTreeBlob {
    /// Directory holding the image's device tree blobs.
    pub dir: Utf8PathBuf,
    /// The (assumed) enabled blob, if any candidate exists.
    pub basename: Option<String>,
    /// `true` if the blob is known to be the enabled one; `false` if it is
    /// merely a guess and callers need the user to disambiguate.
    pub exact: bool,
    /// All device tree blobs found next to the expected location.
    pub candidates: Vec<String>,
}

impl DeviceTreeBlob {
    /// Full path of the (assumed) enabled blob.
    pub fn path(&self) -> Option<Utf8PathBuf> {
        self.basename.as_ref().map(|b| self.dir.join(b))
    }

    /// Human readable name for messages.
    pub fn display_name(&self) -> &str {
        match (&self.basename, self.exact) {
            (Some(b), true) => b.as_str(),
            _ => "unknown device tree",
        }
    }

    /// Select a device tree given by the user: either a path to an existing
    /// file, or the basename of one of the image's blobs.
    pub fn select(&self, name: &Utf8Path) -> Result<Utf8PathBuf> {
        if name.is_file() {
            return Ok(name.to_owned());
        }
        let candidate = self.dir.join(name);
        if candidate.is_file() {
            return Ok(candidate);
        }
        Err(Error::not_found("device tree", name.as_str()))
    }

    /// Require an exact match, failing with the list of candidates otherwise.
    pub fn require_exact(&self, message: &str) -> Result<Utf8PathBuf> {
        match (self.path(), self.exact) {
            (Some(p), true) => Ok(p),
            _ => Err(Error::AmbiguousTarget {
                message: message.to_owned(),
                candidates: self.candidates.clone(),
            }),
        }
    }
}

/// Discover the enabled device tree blob of the deployment checked out at `root`.
///
/// The blob directory is found via the kernel directory. The enabled blob
/// is the one named by `fdtfile=` in the bootloader environment when that
/// exists; otherwise a single blob in the directory is unambiguous, and zero
/// or several blobs leave the match inexact.
pub fn discover_dtb(root: &Dir) -> Result<(Utf8PathBuf, DeviceTreeBlob)> {
    let subdir = dtb_kernel_subdir(root)?;
    let mut candidates = Vec::new();
    if let Some(entries) = read_dir_optional(root, &subdir)? {
        for ent in entries {
            let ent = ent?;
            if !ent.file_type()?.is_file() {
                continue;
            }
            let name = ent.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if Utf8Path::new(name).extension() == Some(DTB_EXTENSION) {
                candidates.push(name.to_owned());
            }
        }
    }
    candidates.sort();

    let selected = match root.read_to_string(UENV_TXT) {
        Ok(s) => parse_fdtfile(&s).map(ToOwned::to_owned),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };
    let (basename, exact) = match selected {
        Some(s) if candidates.contains(&s) => (Some(s), true),
        Some(s) => {
            tracing::debug!("{FDTFILE_KEY}={s} does not name an existing blob");
            (candidates.first().cloned(), false)
        }
        None if candidates.len() == 1 => (candidates.first().cloned(), true),
        None => (candidates.first().cloned(), false),
    };
    let dtb = DeviceTreeBlob {
        dir: subdir.clone(),
        basename,
        exact,
        candidates,
    };
    Ok((subdir, dtb))
}

/// Discover the device tree blob `tree` boots with, with `dir` resolved to
/// an absolute path. A device tree staged in the device tree changes
/// takes precedence over the base image's.
pub fn current_dtb(tree: &WorkingTree) -> Result<DeviceTreeBlob> {
    let deployment = tree.deployment()?;
    let root = tree.open_root()?;
    let deployroot = root
        .open_dir(&deployment.path)
        .map_err(Error::io_at(&deployment.path))?;
    let (subdir, mut dtb) = discover_dtb(&deployroot)?;

    let dt_changes = tree.dt_changes_dir();
    let staged = match std::fs::read_to_string(dt_changes.join(UENV_TXT)) {
        Ok(s) => parse_fdtfile(&s).map(ToOwned::to_owned),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(Error::io_at(dt_changes.join(UENV_TXT))(e)),
    };
    if let Some(name) = staged {
        let dir = dt_changes.join(&subdir);
        if dir.join(&name).is_file() {
            tracing::debug!("Using staged device tree {name}");
            return Ok(DeviceTreeBlob {
                dir,
                candidates: vec![name.clone()],
                basename: Some(name),
                exact: true,
            });
        }
    }

    dtb.dir = tree.root().join(&deployment.path).join(subdir);
    Ok(dtb)
}

/// The bootloader environment `tree` boots with: a staged one takes
/// precedence over the base image's. `None` if the image has neither.
pub fn current_uenv(tree: &WorkingTree) -> Result<Option<String>> {
    let staged = tree.dt_changes_dir().join(UENV_TXT);
    let base = tree.root().join(tree.deployment()?.path).join(UENV_TXT);
    for p in [staged, base] {
        match std::fs::read_to_string(&p) {
            Ok(s) => return Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::io_at(p)(e)),
        }
    }
    Ok(None)
}
