//! # Applied overlays of a working tree
//!
//! The set of enabled device tree overlays is an ordered list of blob
//! basenames stored in an `overlays.txt` manifest next to the device tree
//! blobs, as a single `fdt_overlays=<name> <name>...` line. The base image
//! ships its own manifest and overlay blobs inside its deployment; once
//! changed, the manifest and any newly compiled blobs live in the `dt`
//! change layer, which later is unioned on top of the base image.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::bootabletree::dtb_kernel_subdir;
use crate::error::{Error, Result};
use crate::storage::WorkingTree;

/// The manifest file name.
pub const OVERLAYS_TXT: &str = "overlays.txt";
/// The extension of compiled overlay blobs.
pub const OVERLAY_EXTENSION: &str = "dtbo";
const OVERLAYS_DIR: &str = "overlays";
const MANIFEST_KEY: &str = "fdt_overlays";

/// One applied overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayRecord {
    /// Basename of the blob, unique within a working tree.
    pub basename: String,
    /// Where the blob currently lives (staged or base image directory).
    pub blob_path: Utf8PathBuf,
    /// Position in application order.
    pub order_index: usize,
}

/// Parse a manifest into the ordered list of basenames.
///
/// Lines other than the `fdt_overlays=` directive are ignored, as is
/// surrounding whitespace.
pub fn parse_manifest(contents: &str) -> Vec<String> {
    contents
        .lines()
        .filter_map(|l| l.trim().strip_prefix(MANIFEST_KEY))
        .filter_map(|l| l.trim_start().strip_prefix('='))
        .flat_map(|v| v.split_whitespace())
        .map(ToOwned::to_owned)
        .collect()
}

/// Serialize an ordered list of basenames as a manifest.
pub fn render_manifest<S: AsRef<str>>(names: &[S]) -> String {
    let names = names.iter().map(|n| n.as_ref()).collect::<Vec<_>>();
    format!("{MANIFEST_KEY}={}\n", names.join(" "))
}

/// The overlay locations of one working tree.
#[derive(Debug, Clone)]
pub struct OverlayStore {
    staged_dtb_dir: Utf8PathBuf,
    base_dtb_dir: Utf8PathBuf,
}

impl OverlayStore {
    /// Locate the overlay directories of an unpacked working tree.
    pub fn open(tree: &WorkingTree) -> Result<Self> {
        let deployment = tree.deployment()?;
        let deployroot = tree.root().join(&deployment.path);
        let d = Dir::open_ambient_dir(&deployroot, cap_std::ambient_authority())
            .map_err(Error::io_at(&deployroot))?;
        let subdir = dtb_kernel_subdir(&d)?;
        Ok(Self {
            staged_dtb_dir: tree.dt_changes_dir().join(&subdir),
            base_dtb_dir: deployroot.join(subdir),
        })
    }

    /// Directory holding overlays compiled but not yet unioned into a commit.
    pub fn staged_dir(&self) -> Utf8PathBuf {
        self.staged_dtb_dir.join(OVERLAYS_DIR)
    }

    /// Directory holding the overlays shipped by the base image.
    pub fn base_dir(&self) -> Utf8PathBuf {
        self.base_dtb_dir.join(OVERLAYS_DIR)
    }

    /// The manifest written by this store.
    pub fn manifest_path(&self) -> Utf8PathBuf {
        self.staged_dtb_dir.join(OVERLAYS_TXT)
    }

    fn read_manifest(path: &Utf8Path) -> Result<Option<Vec<String>>> {
        match std::fs::read_to_string(path) {
            Ok(s) => Ok(Some(parse_manifest(&s))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::io_at(path)(e)),
        }
    }

    /// The applied overlays in application order. The staged manifest takes
    /// precedence over the base image's; no manifest means no overlays.
    pub fn list_applied(&self) -> Result<Vec<String>> {
        if let Some(r) = Self::read_manifest(&self.manifest_path())? {
            return Ok(r);
        }
        let base = self.base_dtb_dir.join(OVERLAYS_TXT);
        Ok(Self::read_manifest(&base)?.unwrap_or_default())
    }

    /// Whether `basename` exists in the staged overlays directory.
    pub fn is_staged(&self, basename: &str) -> bool {
        self.staged_dir().join(basename).is_file()
    }

    /// Find an overlay blob, preferring a staged one over the base image's.
    pub fn find_blob_path(&self, basename: &str) -> Result<Utf8PathBuf> {
        [self.staged_dir(), self.base_dir()]
            .into_iter()
            .map(|d| d.join(basename))
            .find(|p| p.is_file())
            .ok_or_else(|| Error::not_found("overlay", basename))
    }

    /// Replace the manifest with `names`, atomically.
    pub fn write_manifest<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let dir = &self.staged_dtb_dir;
        std::fs::create_dir_all(dir).map_err(Error::io_at(dir))?;
        let d = Dir::open_ambient_dir(dir, cap_std::ambient_authority())
            .map_err(Error::io_at(dir))?;
        d.atomic_write(OVERLAYS_TXT, render_manifest(names))
            .map_err(Error::io_at(self.manifest_path()))?;
        tracing::debug!("Wrote {}", self.manifest_path());
        Ok(())
    }

    /// The applied overlays with their blob locations.
    pub fn records(&self) -> Result<Vec<OverlayRecord>> {
        self.list_applied()?
            .into_iter()
            .enumerate()
            .map(|(order_index, basename)| {
                let blob_path = self.find_blob_path(&basename)?;
                Ok(OverlayRecord {
                    basename,
                    blob_path,
                    order_index,
                })
            })
            .collect()
    }

    /// Make sure the staged overlays directory exists and return it.
    pub(crate) fn ensure_staged_dir(&self) -> Result<Dir> {
        let dir = self.staged_dir();
        std::fs::create_dir_all(&dir).map_err(Error::io_at(&dir))?;
        Dir::open_ambient_dir(&dir, cap_std::ambient_authority()).map_err(Error::io_at(&dir))
    }

    /// Remove a staged blob, returning whether it existed.
    pub(crate) fn remove_staged(&self, basename: &str) -> Result<bool> {
        let path = self.staged_dir().join(basename);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::io_at(path)(e)),
        }
    }

    /// Recursively delete the staged overlays directory.
    pub(crate) fn remove_staged_dir(&self) -> Result<()> {
        let dir = self.staged_dir();
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io_at(dir)(e)),
        }
    }

    /// Basenames of all blobs in the staged overlays directory, sorted.
    pub fn staged_blobs(&self) -> Result<Vec<String>> {
        let dir = self.staged_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_at(dir)(e)),
        };
        let mut r = Vec::new();
        for ent in entries {
            let ent = ent?;
            if let Some(name) = ent.file_name().to_str() {
                r.push(name.to_owned());
            }
        }
        r.sort();
        Ok(r)
    }
}
