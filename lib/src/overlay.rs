//! # Applying and removing device tree overlays
//!
//! An overlay goes from source to applied in one step: it is compiled to a
//! temporary blob, optionally test-applied together with every overlay
//! already enabled, and only then moved into the staged overlays directory
//! and appended to the manifest. Nothing in the working tree changes
//! unless every check passed.

use camino::{Utf8Path, Utf8PathBuf};

use crate::bootabletree::{current_dtb, DeviceTreeBlob};
use crate::dtc::{DeviceTreeCompiler, OverlayTester};
use crate::error::{Error, Result};
use crate::fdt;
use crate::overlay_store::{OverlayStore, OVERLAY_EXTENSION};
use crate::storage::WorkingTree;

/// Options for [`OverlayApplier::apply`].
#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Search path for `#include` directives of the overlay source.
    pub include_dirs: Vec<Utf8PathBuf>,
    /// Test against this device tree instead of the image's own.
    pub device_tree: Option<Utf8PathBuf>,
    /// Replace an already applied overlay of the same name.
    pub allow_reapply: bool,
    /// Verify the overlay applies on top of the device tree and the
    /// overlays already enabled.
    pub test_apply: bool,
}

/// The device tree and overlays a working tree will boot with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayStatus {
    /// The image's device tree.
    pub device_tree: DeviceTreeBlob,
    /// Applied overlays in application order.
    pub applied: Vec<String>,
}

impl std::fmt::Display for OverlayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Currently enabled device tree: {}", self.device_tree.display_name())?;
        if self.applied.is_empty() {
            return writeln!(f, "No overlays are currently applied.");
        }
        writeln!(f, "Currently applied overlays:")?;
        for o in &self.applied {
            writeln!(f, "- {o}")?;
        }
        Ok(())
    }
}

/// The compiled blob name of an overlay source: its extension replaced by `.dtbo`.
pub fn blob_basename(source: &Utf8Path) -> Result<String> {
    let stem = source
        .file_stem()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidOperation(format!("invalid overlay source name: {source}")))?;
    Ok(format!("{stem}.{OVERLAY_EXTENSION}"))
}

/// Applies and removes overlays in one working tree.
pub struct OverlayApplier<'a> {
    tree: &'a WorkingTree,
    compiler: &'a dyn DeviceTreeCompiler,
    tester: &'a dyn OverlayTester,
}

impl std::fmt::Debug for OverlayApplier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayApplier")
            .field("tree", &self.tree)
            .finish_non_exhaustive()
    }
}

impl<'a> OverlayApplier<'a> {
    /// Create an applier driving the given toolchain.
    pub fn new(
        tree: &'a WorkingTree,
        compiler: &'a dyn DeviceTreeCompiler,
        tester: &'a dyn OverlayTester,
    ) -> Self {
        Self {
            tree,
            compiler,
            tester,
        }
    }

    fn store(&self) -> Result<OverlayStore> {
        self.tree.require_dt_capable()?;
        OverlayStore::open(self.tree)
    }

    /// Compile `source` and enable it, returning the blob basename.
    pub fn apply(&self, source: &Utf8Path, opts: &ApplyOptions) -> Result<String> {
        let store = self.store()?;
        let basename = blob_basename(source)?;

        let mut applied = store.list_applied()?;
        if let Some(pos) = applied.iter().position(|o| *o == basename) {
            if !opts.allow_reapply {
                return Err(Error::Conflict(format!(
                    "overlay {basename} is already applied"
                )));
            }
            // Reapplying moves the overlay to the end of the list
            applied.remove(pos);
        }

        // Everything is compiled into the storage so the final move is a rename
        let compiled = tempfile::Builder::new()
            .prefix(".tcbuilder-")
            .suffix(&format!(".{OVERLAY_EXTENSION}"))
            .tempfile_in(self.tree.root())?;
        let compiled_path = utf8_temp_path(compiled.path())?;
        self.compiler
            .compile(source, &opts.include_dirs, &compiled_path)?;

        if opts.test_apply {
            let base = self.test_target(opts)?;
            let mut chain = applied
                .iter()
                .map(|o| store.find_blob_path(o))
                .collect::<Result<Vec<_>>>()?;
            chain.push(compiled_path.clone());
            let merged = tempfile::Builder::new()
                .prefix(".tcbuilder-merged-")
                .tempfile_in(self.tree.root())?;
            let merged_path = utf8_temp_path(merged.path())?;
            self.tester
                .try_apply(&base, &chain, &merged_path)
                .map_err(|e| match e {
                    Error::NotApplicable {
                        device_tree, detail, ..
                    } => Error::NotApplicable {
                        overlay: basename.clone(),
                        device_tree,
                        detail,
                    },
                    e => e,
                })?;
            tracing::debug!("{basename} applies on top of {base}");
        }

        store.ensure_staged_dir()?;
        let target = store.staged_dir().join(&basename);
        // A reapplied blob is only dropped once the manifest names its successor
        let previous = if target.is_file() {
            let backup = tempfile::Builder::new()
                .prefix(".tcbuilder-prev-")
                .tempfile_in(self.tree.root())?
                .into_temp_path();
            std::fs::rename(&target, &backup).map_err(Error::io_at(&target))?;
            Some(backup)
        } else {
            None
        };
        let staged = compiled
            .persist(&target)
            .map_err(|e| Error::io_at(&target)(e.error))
            .and_then(|_| {
                applied.push(basename.clone());
                store.write_manifest(&applied)
            });
        if let Err(e) = staged {
            restore_blob(previous, &target);
            return Err(e);
        }
        tracing::info!("Overlay {basename} successfully applied");
        Ok(basename)
    }

    fn test_target(&self, opts: &ApplyOptions) -> Result<Utf8PathBuf> {
        let dtb = current_dtb(self.tree)?;
        match &opts.device_tree {
            Some(d) => dtb.select(d),
            None => dtb.require_exact(
                "could not determine the device tree to check the overlay against",
            ),
        }
    }

    /// Disable one overlay. Returns whether it was applied.
    ///
    /// The blob is deleted only if it was staged; blobs shipped by the base
    /// image are left in place.
    pub fn remove(&self, basename: &str, presence_required: bool) -> Result<bool> {
        let store = self.store()?;
        let mut applied = store.list_applied()?;
        let Some(pos) = applied.iter().position(|o| o == basename) else {
            if presence_required {
                return Err(Error::not_found("applied overlay", basename));
            }
            return Ok(false);
        };
        applied.remove(pos);
        store.write_manifest(&applied)?;
        if store.remove_staged(basename)? {
            tracing::debug!("Removed staged blob {basename}");
        }
        tracing::info!("Overlay {basename} removed");
        Ok(true)
    }

    /// Disable all overlays and delete every staged blob.
    pub fn remove_all(&self) -> Result<()> {
        let store = self.store()?;
        store.write_manifest::<&str>(&[])?;
        store.remove_staged_dir()?;
        let left = store.list_applied()?;
        if !left.is_empty() {
            return Err(Error::InvariantViolation(format!(
                "overlays still applied after removing all: {}",
                left.join(" ")
            )));
        }
        tracing::info!("All overlays removed");
        Ok(())
    }

    /// The image's device tree and the applied overlays.
    pub fn status(&self) -> Result<OverlayStatus> {
        let store = self.store()?;
        Ok(OverlayStatus {
            device_tree: current_dtb(self.tree)?,
            applied: store.list_applied()?,
        })
    }

    /// The overlay sources in `overlays_dir` compatible with a device tree:
    /// the given `.dtb`/`.dts` file, or the image's own.
    pub fn list_compatible(
        &self,
        overlays_dir: &Utf8Path,
        device_tree: Option<&Utf8Path>,
    ) -> Result<Vec<Utf8PathBuf>> {
        let labels = match device_tree {
            Some(p) => labels_of(p)?,
            None => {
                self.tree.require_dt_capable()?;
                let dtb = current_dtb(self.tree)?;
                let path = match (dtb.path(), dtb.exact, dtb.candidates.len()) {
                    (Some(p), true, _) => p,
                    (Some(p), false, 1) => {
                        tracing::info!("Using {} as the current device tree", dtb.display_name());
                        p
                    }
                    _ => {
                        return Err(Error::AmbiguousTarget {
                            message: "could not determine the current device tree".into(),
                            candidates: dtb.candidates,
                        })
                    }
                };
                labels_of(&path)?
            }
        };
        tracing::debug!("Compatible labels: {}", labels.join(" "));
        if labels.is_empty() {
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(overlays_dir).map_err(Error::io_at(overlays_dir))?;
        let mut r = Vec::new();
        for ent in entries {
            let ent = ent?;
            let Ok(path) = Utf8PathBuf::from_path_buf(ent.path()) else {
                continue;
            };
            if path.extension() != Some("dts") || !path.is_file() {
                continue;
            }
            let src = std::fs::read_to_string(&path).map_err(Error::io_at(&path))?;
            if fdt::is_overlay_source(&src) && fdt::overlay_matches(&src, &labels) {
                r.push(path);
            }
        }
        r.sort();
        Ok(r)
    }
}

/// Put back the blob a failed apply displaced, or drop the new one.
fn restore_blob(previous: Option<tempfile::TempPath>, target: &Utf8Path) {
    let r = match previous {
        Some(backup) => std::fs::rename(&backup, target),
        None => std::fs::remove_file(target),
    };
    if let Err(e) = r {
        tracing::warn!("Failed to restore {target}: {e}");
    }
}

fn utf8_temp_path(p: &std::path::Path) -> Result<Utf8PathBuf> {
    Utf8PathBuf::from_path_buf(p.to_owned()).map_err(|p| {
        Error::InvalidOperation(format!("non UTF-8 temporary path: {}", p.display()))
    })
}

/// The root `compatible` labels of a device tree blob or source file.
fn labels_of(path: &Utf8Path) -> Result<Vec<String>> {
    if path.extension() == Some("dts") {
        let src = std::fs::read_to_string(path).map_err(Error::io_at(path))?;
        Ok(fdt::compatible_from_source(&src))
    } else {
        let blob = std::fs::read(path).map_err(Error::io_at(path))?;
        fdt::compatible_from_blob(&blob)
    }
}
