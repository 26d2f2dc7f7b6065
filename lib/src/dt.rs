//! # Whole device trees
//!
//! Fetching the device tree sources, reporting the device tree an image
//! boots with and replacing it by one compiled from source.

use camino::{Utf8Path, Utf8PathBuf};
use tcbuilder_utils::Task;

use crate::bootabletree::{current_dtb, dtb_kernel_subdir, parse_fdtfile, DeviceTreeBlob, UENV_TXT};
use crate::dtc::DeviceTreeCompiler;
use crate::error::{Error, Result};
use crate::fdt;
use crate::overlay_store::{render_manifest, OVERLAYS_TXT};
use crate::storage::WorkingTree;

/// Where device tree sources are checked out, relative to the working directory.
pub const DEVICE_TREES_DIR: &str = "device-trees";
/// The public device tree and overlay sources.
pub const DEFAULT_DEVICE_TREES_URL: &str = "https://github.com/toradex/device-trees";

/// Where to get the device tree sources from.
#[derive(Debug, Clone)]
pub struct CheckoutOptions {
    /// Git repository URL.
    pub url: String,
    /// Branch to check out; the repository's default branch if unset.
    pub branch: Option<String>,
    /// Update an existing checkout instead of failing.
    pub update: bool,
}

impl Default for CheckoutOptions {
    fn default() -> Self {
        Self {
            url: DEFAULT_DEVICE_TREES_URL.to_owned(),
            branch: None,
            update: false,
        }
    }
}

fn git(description: impl AsRef<str>) -> Task {
    Task::new(description, "git")
}

/// Clone the device tree sources into `dest`, or update them.
pub fn checkout(dest: &Utf8Path, opts: &CheckoutOptions) -> Result<()> {
    if dest.exists() {
        if !opts.update {
            return Err(Error::InvalidOperation(format!(
                "'{dest}' directory already exists; use --update to update it"
            )));
        }
        return git(format!("Updating {dest}"))
            .args(["-C", dest.as_str(), "pull", "--ff-only"])
            .run()
            .map_err(|e| Error::Transport(format!("{e:#}")));
    }
    let mut t = git(format!("Cloning {} into {dest}", opts.url)).args(["clone", "--depth=1"]);
    if let Some(b) = &opts.branch {
        t = t.args(["--branch", b.as_str()]);
    }
    t.args([opts.url.as_str(), dest.as_str()])
        .run()
        .map_err(|e| Error::Transport(format!("{e:#}")))
}

/// The device tree the image in `tree` boots with.
pub fn status(tree: &WorkingTree) -> Result<DeviceTreeBlob> {
    tree.require_dt_capable()?;
    current_dtb(tree)
}

/// The base image's bootloader environment without its `fdtfile=` line.
fn base_uenv(tree: &WorkingTree) -> Result<String> {
    let deployment = tree.deployment()?;
    let p = tree.root().join(&deployment.path).join(UENV_TXT);
    let s = match std::fs::read_to_string(&p) {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(String::new()),
        Err(e) => return Err(Error::io_at(p)(e)),
    };
    Ok(s.lines()
        .filter(|l| parse_fdtfile(l).is_none())
        .map(|l| format!("{l}\n"))
        .collect())
}

/// Compile the device tree `source` and make the image boot with it.
///
/// This replaces any device tree change made before, and disables every
/// overlay, including those enabled by the base image.
pub fn apply_device_tree(
    tree: &WorkingTree,
    compiler: &dyn DeviceTreeCompiler,
    source: &Utf8Path,
    include_dirs: &[Utf8PathBuf],
) -> Result<String> {
    tree.require_dt_capable()?;
    let contents = std::fs::read_to_string(source).map_err(Error::io_at(source))?;
    if fdt::is_overlay_source(&contents) {
        return Err(Error::InvalidOperation(format!(
            "{source} is a device tree overlay and cannot be applied as a device tree"
        )));
    }
    let stem = source
        .file_stem()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::InvalidOperation(format!("invalid device tree source name: {source}")))?;
    let basename = format!("{stem}.dtb");

    let compiled = tempfile::Builder::new()
        .prefix(".tcbuilder-")
        .suffix(".dtb")
        .tempfile_in(tree.root())?;
    let compiled_path = Utf8Path::from_path(compiled.path())
        .ok_or_else(|| Error::InvalidOperation("non-UTF-8 storage path".into()))?
        .to_owned();
    compiler.compile(source, include_dirs, &compiled_path)?;

    let uenv = format!("fdtfile={basename}\n{}", base_uenv(tree)?);
    let deployment = tree.deployment()?;
    let subdir = {
        let root = tree.open_root()?;
        let d = root
            .open_dir(&deployment.path)
            .map_err(Error::io_at(&deployment.path))?;
        dtb_kernel_subdir(&d)?
    };

    let dt_changes = tree.dt_changes_dir();
    if dt_changes.exists() {
        std::fs::remove_dir_all(&dt_changes).map_err(Error::io_at(&dt_changes))?;
    }
    let dtb_dir = dt_changes.join(&subdir);
    std::fs::create_dir_all(&dtb_dir).map_err(Error::io_at(&dtb_dir))?;
    let target = dtb_dir.join(&basename);
    compiled
        .persist(&target)
        .map_err(|e| Error::io_at(&target)(e.error))?;

    let uenv_path = dt_changes.join(UENV_TXT);
    if let Some(parent) = uenv_path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::io_at(parent))?;
    }
    std::fs::write(&uenv_path, uenv).map_err(Error::io_at(&uenv_path))?;

    tracing::warn!("Removing currently applied device tree overlays");
    let manifest = dtb_dir.join(OVERLAYS_TXT);
    std::fs::write(&manifest, render_manifest::<&str>(&[])).map_err(Error::io_at(&manifest))?;

    tracing::info!("Device tree {basename} successfully applied.");
    Ok(basename)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{FakeCompiler, Fixture, BASE_DTB};
    use crate::overlay_store::OverlayStore;

    #[test]
    fn test_checkout_existing_requires_update() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let dest = Utf8Path::from_path(td.path()).unwrap().join(DEVICE_TREES_DIR);
        std::fs::create_dir(&dest)?;
        let e = checkout(&dest, &CheckoutOptions::default()).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidOperation);
        assert!(e.to_string().contains("--update"));
        Ok(())
    }

    #[test]
    fn test_status() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let dtb = status(&fixture.tree)?;
        assert!(dtb.exact);
        assert_eq!(dtb.basename.as_deref(), Some(BASE_DTB));
        Ok(())
    }

    #[test]
    fn test_apply_device_tree() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let base_uenv = fixture.deployroot().join(UENV_TXT);
        std::fs::create_dir_all(base_uenv.parent().unwrap())?;
        std::fs::write(&base_uenv, format!("fdtfile={BASE_DTB}\nbootcmd=run distro\n"))?;
        // Staged overlays from before are dropped
        let store = OverlayStore::open(&fixture.tree)?;
        store.ensure_staged_dir()?.write("old.dtbo", "x")?;
        store.write_manifest(&["old.dtbo"])?;

        let src = fixture.write_source("imx8mm-verdin-custom.dts", "/ { model = \"custom\"; };")?;
        let name = apply_device_tree(&fixture.tree, &FakeCompiler, &src, &[])?;
        assert_eq!(name, "imx8mm-verdin-custom.dtb");

        let uenv = std::fs::read_to_string(fixture.tree.dt_changes_dir().join(UENV_TXT))?;
        similar_asserts::assert_eq!(uenv, "fdtfile=imx8mm-verdin-custom.dtb\nbootcmd=run distro\n");
        assert!(store.list_applied()?.is_empty());
        assert!(store.staged_blobs()?.is_empty());

        let dtb = status(&fixture.tree)?;
        assert!(dtb.exact);
        assert_eq!(dtb.basename.as_deref(), Some("imx8mm-verdin-custom.dtb"));
        assert!(dtb.dir.starts_with(fixture.tree.dt_changes_dir()));
        assert!(fixture.stray_temp_files()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_apply_rejects_overlay() -> anyhow::Result<()> {
        let fixture = Fixture::new()?;
        let src = fixture.write_source("hdmi.dts", "/dts-v1/;\n/plugin/;\n")?;
        let e = apply_device_tree(&fixture.tree, &FakeCompiler, &src, &[]).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidOperation);
        assert!(!fixture.tree.dt_changes_dir().exists());
        Ok(())
    }
}
