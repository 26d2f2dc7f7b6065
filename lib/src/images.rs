//! # Unpacking base images
//!
//! An Easy Installer image is a directory (or an archive of one) with an
//! `image*.json` describing the partitions; the root filesystem content is
//! a tarball of an OSTree sysroot. Unpacking extracts that sysroot into the
//! storage and copies the deployed commit into the archive repository as
//! ref `base`, which every later operation builds upon.
//!
//! An archive with an `ostree/` directory at the top is taken to be the
//! root filesystem of a raw (WIC) image; such images get no `tezi/`
//! directory and do not support device tree operations.

use std::fs::File;
use std::io::{BufReader, Read};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Deserialize;
use tcbuilder_utils::Task;

use crate::error::{Error, Result};
use crate::repo::{CommitStore, OstreeRepo};
use crate::storage::{ImageType, WorkingTree, OSTREE_BASE_REF};

/// Label of the partition holding the OSTree sysroot.
pub const ROOTFS_LABEL: &str = "otaroot";
const SYSROOT_REPO: &str = "ostree/repo";

/// Options for [`unpack`].
#[derive(Debug, Clone, Default)]
pub struct UnpackOptions {
    /// Replace whatever a previous unpack left in the storage.
    pub force: bool,
}

/// What was unpacked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unpacked {
    /// The packaging format.
    pub image_type: ImageType,
    /// The commit deployed by the image, now ref `base`.
    pub checksum: String,
    /// Subject of that commit.
    pub subject: String,
}

#[derive(Debug, Deserialize)]
struct ImageJson {
    #[serde(default)]
    blockdevs: Vec<BlockDev>,
}

#[derive(Debug, Deserialize)]
struct BlockDev {
    #[serde(default)]
    partitions: Vec<Partition>,
}

#[derive(Debug, Deserialize)]
struct Partition {
    content: Option<PartitionContent>,
}

#[derive(Debug, Deserialize)]
struct PartitionContent {
    label: Option<String>,
    filename: Option<String>,
}

/// The root filesystem tarball named by an `image.json`.
pub(crate) fn rootfs_filename(image_json: &str) -> Result<String> {
    let j: ImageJson = serde_json::from_str(image_json).map_err(|e| Error::Malformed {
        what: "image.json",
        detail: e.to_string(),
    })?;
    j.blockdevs
        .into_iter()
        .flat_map(|b| b.partitions)
        .filter_map(|p| p.content)
        .filter(|c| c.label.as_deref() == Some(ROOTFS_LABEL))
        .find_map(|c| c.filename)
        .ok_or_else(|| Error::Malformed {
            what: "image.json",
            detail: format!("no root file system content labeled {ROOTFS_LABEL}"),
        })
}

fn find_image_json(dir: &Utf8Path) -> Result<Option<Utf8PathBuf>> {
    let mut found = Vec::new();
    for ent in dir.read_dir_utf8().map_err(Error::io_at(dir))? {
        let ent = ent?;
        let name = ent.file_name();
        if name.starts_with("image") && name.ends_with(".json") && ent.file_type()?.is_file() {
            found.push(ent.path().to_owned());
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}

/// Create a decompressor for a tarball, or `None` if the format is best
/// left to GNU tar.
fn decompressor(path: &Utf8Path) -> Result<Option<Box<dyn Read>>> {
    let name = path.file_name().unwrap_or_default();
    let open = || File::open(path).map_err(Error::io_at(path));
    let r: Box<dyn Read> = if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Box::new(flate2::bufread::GzDecoder::new(BufReader::new(open()?)))
    } else if name.ends_with(".tar.zst") {
        Box::new(zstd::stream::read::Decoder::new(open()?)?)
    } else if name.ends_with(".tar") {
        Box::new(BufReader::new(open()?))
    } else {
        return Ok(None);
    };
    Ok(Some(r))
}

fn is_archive(path: &Utf8Path) -> bool {
    let name = path.file_name().unwrap_or_default();
    [".tar", ".tar.gz", ".tgz", ".tar.zst", ".tar.xz", ".tar.bz2"]
        .iter()
        .any(|s| name.ends_with(s))
}

/// Extract a tarball into `dest`, keeping permissions and extended
/// attributes; the sysroot repository depends on both.
fn extract(tarball: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    tracing::debug!("Extracting {tarball} into {dest}");
    match decompressor(tarball)? {
        Some(src) => {
            let mut a = tar::Archive::new(src);
            a.set_preserve_permissions(true);
            a.set_unpack_xattrs(true);
            a.set_preserve_ownerships(rustix::process::getuid().is_root());
            a.unpack(dest).map_err(Error::io_at(tarball))
        }
        None => Task::new(format!("Extracting {tarball}"), "tar")
            .quiet()
            .args(["--xattrs", "--xattrs-include=*", "-xhf"])
            .args([tarball.as_str(), "-C", dest.as_str()])
            .run()
            .map_err(|e| Error::Malformed {
                what: "image archive",
                detail: format!("{e:#}"),
            }),
    }
}

fn copy_dir(src: &Utf8Path, dest: &Utf8Path) -> Result<()> {
    std::fs::create_dir(dest).map_err(Error::io_at(dest))?;
    for ent in src.read_dir_utf8().map_err(Error::io_at(src))? {
        let ent = ent?;
        let to = dest.join(ent.file_name());
        if ent.file_type()?.is_dir() {
            copy_dir(ent.path(), &to)?;
        } else {
            std::fs::copy(ent.path(), &to).map_err(Error::io_at(&to))?;
        }
    }
    Ok(())
}

fn prepare_storage(tree: &WorkingTree, force: bool) -> Result<()> {
    let existing = tree.managed_dirs().filter(|d| d.exists()).collect::<Vec<_>>();
    if !existing.is_empty() && !force {
        return Err(Error::InvalidOperation(format!(
            "storage {} already holds an unpacked image; use --force to replace it",
            tree.root()
        )));
    }
    for d in existing {
        tracing::debug!("Removing {d}");
        std::fs::remove_dir_all(&d).map_err(Error::io_at(&d))?;
    }
    std::fs::create_dir_all(tree.root()).map_err(Error::io_at(tree.root()))?;
    Ok(())
}

/// Put the image into place below the storage, returning its type.
fn import_image(tree: &WorkingTree, image: &Utf8Path) -> Result<ImageType> {
    let sysroot = tree.sysroot_dir();
    let tezi = tree.tezi_dir();

    if image.is_dir() {
        if find_image_json(image)?.is_none() {
            return Err(Error::not_found("image.json in", image.as_str()));
        }
        tracing::info!("Copying Toradex Easy Installer image.");
        copy_dir(image, &tezi)?;
    } else if is_archive(image) {
        tracing::info!("Unpacking image archive {image}.");
        let td = tempfile::Builder::new()
            .prefix(".tcbuilder-extract-")
            .tempdir_in(tree.root())?;
        let extracted = Utf8Path::from_path(td.path())
            .ok_or_else(|| Error::InvalidOperation("non-UTF-8 storage path".into()))?
            .to_owned();
        extract(image, &extracted)?;
        if extracted.join("ostree").is_dir() {
            // A raw image's root filesystem
            std::fs::rename(&extracted, &sysroot).map_err(Error::io_at(&sysroot))?;
            return Ok(ImageType::Raw);
        }
        let dir = if find_image_json(&extracted)?.is_some() {
            extracted.clone()
        } else {
            // Easy Installer archives usually hold one top level directory
            let mut subdirs = Vec::new();
            for ent in extracted.read_dir_utf8()? {
                let ent = ent?;
                if ent.file_type()?.is_dir() && find_image_json(ent.path())?.is_some() {
                    subdirs.push(ent.path().to_owned());
                }
            }
            match subdirs.as_slice() {
                [d] => d.clone(),
                _ => return Err(Error::not_found("image.json in", image.as_str())),
            }
        };
        std::fs::rename(&dir, &tezi).map_err(Error::io_at(&tezi))?;
    } else {
        return Err(Error::InvalidOperation(format!(
            "unsupported image {image}: expected an Easy Installer image directory or archive, \
             or a root file system archive"
        )));
    }

    let json_path = find_image_json(&tezi)?
        .ok_or_else(|| Error::not_found("image.json in", tezi.as_str()))?;
    let json = std::fs::read_to_string(&json_path).map_err(Error::io_at(&json_path))?;
    let tarball = tezi.join(rootfs_filename(&json)?);
    if !tarball.is_file() {
        return Err(Error::not_found("root file system tarball", tarball.as_str()));
    }
    tracing::info!("Unpacking TorizonCore Toradex Easy Installer image.");
    std::fs::create_dir(&sysroot).map_err(Error::io_at(&sysroot))?;
    extract(&tarball, &sysroot)?;
    // The sysroot holds the content now
    std::fs::remove_file(&tarball).map_err(Error::io_at(&tarball))?;
    Ok(ImageType::Tezi)
}

/// Unpack `image` into the storage, creating the archive repository with
/// `init_archive` and pointing ref `base` at the deployed commit.
pub fn unpack_image<S: CommitStore>(
    tree: &WorkingTree,
    image: &Utf8Path,
    opts: &UnpackOptions,
    init_archive: impl FnOnce(&Utf8Path) -> Result<S>,
) -> Result<Unpacked> {
    if !image.exists() {
        return Err(Error::not_found("image", image.as_str()));
    }
    prepare_storage(tree, opts.force)?;
    let image_type = import_image(tree, image)?;

    let deployment = tree.deployment()?;
    let checksum = deployment.checksum;
    tracing::info!("Importing OSTree revision {checksum} from local repository...");
    let archive = init_archive(&tree.archive_repo())?;
    let src_repo = tree.sysroot_dir().join(SYSROOT_REPO);
    archive.pull_local(&src_repo, &checksum, OSTREE_BASE_REF)?;
    let meta = archive.commit_metadata(OSTREE_BASE_REF)?;

    match image_type {
        ImageType::Tezi => tracing::info!("Unpacked OSTree from Toradex Easy Installer image:"),
        ImageType::Raw => tracing::info!("Unpacked OSTree from WIC image:"),
    }
    tracing::info!("  Commit checksum: {checksum}");
    if !meta.subject.is_empty() {
        tracing::info!("  Commit subject: {}", meta.subject);
    }
    Ok(Unpacked {
        image_type,
        checksum,
        subject: meta.subject,
    })
}

/// Unpack `image` into the storage using a new OSTree archive repository.
pub fn unpack(tree: &WorkingTree, image: &Utf8Path, opts: &UnpackOptions) -> Result<Unpacked> {
    unpack_image(tree, image, opts, |p| OstreeRepo::init_archive(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::DirStore;
    use indoc::indoc;

    const IMAGE_JSON: &str = indoc! {r#"
        {
          "config_format": 4,
          "name": "TorizonCore",
          "blockdevs": [
            {
              "name": "emmc",
              "partitions": [
                {
                  "content": {
                    "label": "BOOT",
                    "filesystem_type": "FAT",
                    "filename": "boot.tar.xz"
                  }
                },
                {
                  "content": {
                    "label": "otaroot",
                    "filesystem_type": "ext4",
                    "filename": "rootfs.ota.tar.gz"
                  }
                }
              ]
            }
          ]
        }
    "#};

    fn store_init(p: &Utf8Path) -> Result<DirStore> {
        DirStore::new(p).map_err(|e| Error::InvalidOperation(e.to_string()))
    }

    /// A sysroot tarball whose repository is a [`DirStore`] holding one
    /// deployed commit.
    fn write_rootfs(work: &Utf8Path, dest: &Utf8Path) -> anyhow::Result<String> {
        let src = work.join("rootfs-src");
        let content = work.join("content");
        std::fs::create_dir_all(content.join("etc"))?;
        std::fs::write(content.join("etc/os-release"), "ID=torizon\n")?;
        let repo = DirStore::new(src.join(SYSROOT_REPO))?;
        let csum = repo.import(&content, "torizon/torizon-core")?;
        let deploy = src.join(format!("ostree/deploy/torizon/deploy/{csum}.0"));
        std::fs::create_dir_all(deploy.parent().unwrap())?;
        crate::fixture::copy_tree(&content, &deploy)?;

        let f = File::create(dest)?;
        let enc = flate2::write::GzEncoder::new(f, flate2::Compression::fast());
        let mut b = tar::Builder::new(enc);
        b.append_dir_all(".", &src)?;
        b.into_inner()?.finish()?;
        Ok(csum)
    }

    #[test]
    fn test_rootfs_filename() {
        assert_eq!(rootfs_filename(IMAGE_JSON).unwrap(), "rootfs.ota.tar.gz");
        let e = rootfs_filename(r#"{"blockdevs": []}"#).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::Malformed);
        assert!(rootfs_filename("not json").is_err());
    }

    #[test]
    fn test_unpack_tezi_dir() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let work = Utf8Path::from_path(td.path()).unwrap();
        let image = work.join("image");
        std::fs::create_dir(&image)?;
        std::fs::write(image.join("image.json"), IMAGE_JSON)?;
        let csum = write_rootfs(work, &image.join("rootfs.ota.tar.gz"))?;

        let tree = WorkingTree::new(work.join("storage"));
        let r = unpack_image(&tree, &image, &UnpackOptions::default(), store_init)?;
        assert_eq!(r.image_type, ImageType::Tezi);
        assert_eq!(r.checksum, csum);
        assert!(tree.is_unpacked());
        assert_eq!(tree.image_type(), ImageType::Tezi);
        assert!(tree.tezi_dir().join("image.json").exists());
        assert!(!tree.tezi_dir().join("rootfs.ota.tar.gz").exists());
        // The source image is left alone
        assert!(image.join("rootfs.ota.tar.gz").exists());

        let archive = DirStore::new(tree.archive_repo())?;
        assert_eq!(archive.resolve_rev(OSTREE_BASE_REF)?, csum);

        // A second unpack needs --force
        let e = unpack_image(&tree, &image, &UnpackOptions::default(), store_init).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidOperation);
        let opts = UnpackOptions { force: true };
        unpack_image(&tree, &image, &opts, store_init)?;
        Ok(())
    }

    #[test]
    fn test_unpack_raw_rootfs() -> anyhow::Result<()> {
        let td = tempfile::tempdir()?;
        let work = Utf8Path::from_path(td.path()).unwrap();
        let image = work.join("torizon-rootfs.tar.gz");
        let csum = write_rootfs(work, &image)?;
        let tree = WorkingTree::new(work.join("storage"));
        let r = unpack_image(&tree, &image, &UnpackOptions::default(), store_init)?;
        assert_eq!(r.image_type, ImageType::Raw);
        assert_eq!(r.checksum, csum);
        let e = tree.require_dt_capable().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidOperation);
        Ok(())
    }

    #[test]
    fn test_unpack_missing() {
        let td = tempfile::tempdir().unwrap();
        let work = Utf8Path::from_path(td.path()).unwrap();
        let tree = WorkingTree::new(work.join("storage"));
        let e = unpack_image(
            &tree,
            &work.join("nope"),
            &UnpackOptions::default(),
            store_init,
        )
        .unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotFound);
        assert!(!tree.root().exists());
    }
}
