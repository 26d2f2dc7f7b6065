//! End to end tests of overlay handling through the public API.

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tcbuilder_lib::dtc::{DeviceTreeCompiler, OverlayTester};
use tcbuilder_lib::overlay::{ApplyOptions, OverlayApplier};
use tcbuilder_lib::overlay_store::OverlayStore;
use tcbuilder_lib::storage::WorkingTree;
use tcbuilder_lib::{Error, ErrorKind};

const CHECKSUM: &str = "9f1c2e4a7b0d6c3f5e8a1b2c4d6e8f0a1b3c5d7e9f1a2b4c6d8e0f1a3b5c7d9e";
const DTB: &str = "imx8mp-verdin-nonwifi-dahlia.dtb";

/// Compiling copies the source through.
struct CopyCompiler;

impl DeviceTreeCompiler for CopyCompiler {
    fn compile(
        &self,
        source: &Utf8Path,
        _include_dirs: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> tcbuilder_lib::Result<()> {
        std::fs::copy(source, output)?;
        Ok(())
    }
}

/// Overlays mentioning a missing label do not apply.
struct LabelTester;

impl OverlayTester for LabelTester {
    fn try_apply(
        &self,
        base: &Utf8Path,
        overlays: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> tcbuilder_lib::Result<()> {
        for o in overlays {
            if std::fs::read_to_string(o)?.contains("&missing_label") {
                return Err(Error::NotApplicable {
                    overlay: o.to_string(),
                    device_tree: base.to_string(),
                    detail: "FDT_ERR_NOTFOUND".into(),
                });
            }
        }
        std::fs::copy(base, output)?;
        Ok(())
    }
}

/// An unpacked Easy Installer image with one device tree.
fn unpacked(root: &Utf8Path) -> Result<WorkingTree> {
    let tree = WorkingTree::new(root.join("storage"));
    std::fs::create_dir_all(tree.tezi_dir())?;
    std::fs::create_dir_all(tree.archive_repo())?;
    let kdir = tree
        .sysroot_dir()
        .join("ostree/deploy/torizon/deploy")
        .join(format!("{CHECKSUM}.0"))
        .join("usr/lib/modules/6.6.54-7.1.0");
    std::fs::create_dir_all(kdir.join("dtb"))?;
    std::fs::write(kdir.join("vmlinuz"), "kernel")?;
    std::fs::write(kdir.join("dtb").join(DTB), "base blob")?;
    Ok(tree)
}

fn source(dir: &Utf8Path, name: &str, contents: &str) -> Result<Utf8PathBuf> {
    let p = dir.join(name);
    std::fs::write(&p, contents)?;
    Ok(p)
}

#[test]
fn overlay_lifecycle() -> Result<()> {
    let td = tempfile::tempdir()?;
    let td = Utf8Path::from_path(td.path()).unwrap();
    let tree = unpacked(td)?;
    assert_eq!(tree.deployment()?.checksum, CHECKSUM);

    let applier = OverlayApplier::new(&tree, &CopyCompiler, &LabelTester);
    let opts = ApplyOptions {
        test_apply: true,
        ..Default::default()
    };
    let hdmi = source(td, "verdin-imx8mp_dsi-to-hdmi_overlay.dts", "/plugin/; &hdmi {};")?;
    let spi = source(td, "verdin-imx8mp_spidev_overlay.dts", "/plugin/; &ecspi1 {};")?;
    let bad = source(td, "broken_overlay.dts", "/plugin/; &missing_label {};")?;

    assert_eq!(
        applier.apply(&hdmi, &opts)?,
        "verdin-imx8mp_dsi-to-hdmi_overlay.dtbo"
    );
    applier.apply(&spi, &opts)?;

    // A second apply of the same overlay needs reapply, which moves it last
    let e = applier.apply(&hdmi, &opts).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Conflict);
    let reapply = ApplyOptions {
        allow_reapply: true,
        ..opts.clone()
    };
    applier.apply(&hdmi, &reapply)?;

    let e = applier.apply(&bad, &opts).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NotApplicable);

    let status = applier.status()?;
    assert_eq!(status.device_tree.display_name(), DTB);
    assert_eq!(
        status.applied,
        [
            "verdin-imx8mp_spidev_overlay.dtbo",
            "verdin-imx8mp_dsi-to-hdmi_overlay.dtbo"
        ]
    );
    let printed = status.to_string();
    assert!(printed.contains("- verdin-imx8mp_spidev_overlay.dtbo\n"));

    let store = OverlayStore::open(&tree)?;
    let manifest = std::fs::read_to_string(store.manifest_path())?;
    assert_eq!(
        manifest,
        "fdt_overlays=verdin-imx8mp_spidev_overlay.dtbo verdin-imx8mp_dsi-to-hdmi_overlay.dtbo\n"
    );

    assert!(applier.remove("verdin-imx8mp_spidev_overlay.dtbo", true)?);
    assert!(!applier.remove("verdin-imx8mp_spidev_overlay.dtbo", false)?);
    let e = applier
        .remove("verdin-imx8mp_spidev_overlay.dtbo", true)
        .unwrap_err();
    assert_eq!(e.kind(), ErrorKind::NotFound);

    applier.remove_all()?;
    assert!(applier.status()?.applied.is_empty());
    assert!(store.staged_blobs()?.is_empty());
    Ok(())
}

#[test]
fn raw_images_reject_overlays() -> Result<()> {
    let td = tempfile::tempdir()?;
    let td = Utf8Path::from_path(td.path()).unwrap();
    let tree = unpacked(td)?;
    std::fs::remove_dir_all(tree.tezi_dir())?;

    let applier = OverlayApplier::new(&tree, &CopyCompiler, &LabelTester);
    let src = source(td, "a.dts", "/plugin/;")?;
    let e = applier.apply(&src, &ApplyOptions::default()).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidOperation);
    Ok(())
}

#[test]
fn commands_need_unpacked_image() -> Result<()> {
    let td = tempfile::tempdir()?;
    let td = Utf8Path::from_path(td.path()).unwrap();
    let tree = WorkingTree::new(td.join("storage"));
    assert!(!tree.is_unpacked());
    let e = tree.require_unpacked().unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidOperation);
    assert!(e.to_string().contains("images unpack"));
    Ok(())
}
