//! # The working tree
//!
//! All operations act on a "storage" directory which holds the unpacked base
//! image and the not-yet-committed layers of changes on top of it:
//!
//! ```text
//! storage/
//!   sysroot/          unpacked OSTree sysroot of the base image
//!   ostree-archive/   archive repository, ref `base` is the base image commit
//!   tezi/             Easy Installer metadata (absent for raw images)
//!   changes/ splash/ dt/ kernel/
//!                     change layers, unioned in this order
//! ```

use camino::{Utf8Path, Utf8PathBuf};
use cap_std_ext::cap_std;
use cap_std_ext::cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;

use crate::error::{Error, Result};

/// The ref which always denotes the unmodified source image's commit.
pub const OSTREE_BASE_REF: &str = "base";

const SYSROOT: &str = "sysroot";
const ARCHIVE: &str = "ostree-archive";
const TEZI: &str = "tezi";
const DT_CHANGES: &str = "dt";
/// Change layers, in union order.
const CHANGE_DIRS: &[&str] = &["changes", "splash", DT_CHANGES, "kernel"];
const DEPLOY: &str = "ostree/deploy";

/// The packaging format of the unpacked image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// A Toradex Easy Installer image.
    Tezi,
    /// A flat raw/WIC disk image; device tree composition is not supported.
    Raw,
}

/// A storage directory holding an unpacked image plus layered changes.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    root: Utf8PathBuf,
}

impl WorkingTree {
    /// Use `root` as the storage directory; it does not need to exist yet.
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The unpacked sysroot of the base image.
    pub fn sysroot_dir(&self) -> Utf8PathBuf {
        self.root.join(SYSROOT)
    }

    /// The archive repository holding the base and derived commits.
    pub fn archive_repo(&self) -> Utf8PathBuf {
        self.root.join(ARCHIVE)
    }

    /// Easy Installer metadata of the unpacked image.
    pub fn tezi_dir(&self) -> Utf8PathBuf {
        self.root.join(TEZI)
    }

    /// The change layer holding device tree modifications.
    pub fn dt_changes_dir(&self) -> Utf8PathBuf {
        self.root.join(DT_CHANGES)
    }

    /// Every directory managed inside the storage (other than its root).
    pub(crate) fn managed_dirs(&self) -> impl Iterator<Item = Utf8PathBuf> + '_ {
        [SYSROOT, ARCHIVE, TEZI]
            .iter()
            .chain(CHANGE_DIRS)
            .map(|d| self.root.join(d))
    }

    /// The change layers that exist, in the order they must be unioned.
    pub fn default_change_dirs(&self) -> Vec<Utf8PathBuf> {
        CHANGE_DIRS
            .iter()
            .map(|d| self.root.join(d))
            .filter(|d| d.is_dir())
            .collect()
    }

    /// Whether an image was unpacked into this storage.
    pub fn is_unpacked(&self) -> bool {
        self.sysroot_dir().is_dir() && self.archive_repo().is_dir()
    }

    /// Fail unless an image was unpacked into this storage.
    pub fn require_unpacked(&self) -> Result<()> {
        if !self.is_unpacked() {
            return Err(Error::InvalidOperation(format!(
                "could not find an Easy Installer or WIC image in the storage {}; \
                 please use 'images unpack' to unpack an image before running this command",
                self.root
            )));
        }
        Ok(())
    }

    /// The packaging format of the unpacked image.
    pub fn image_type(&self) -> ImageType {
        if self.tezi_dir().is_dir() {
            ImageType::Tezi
        } else {
            ImageType::Raw
        }
    }

    /// Fail unless device tree operations are possible on this storage.
    pub fn require_dt_capable(&self) -> Result<()> {
        self.require_unpacked()?;
        if self.image_type() == ImageType::Raw {
            return Err(Error::InvalidOperation(
                "device tree overlay commands are not supported for WIC/raw images".into(),
            ));
        }
        Ok(())
    }

    /// Open the storage root as a capability directory.
    pub(crate) fn open_root(&self) -> Result<Dir> {
        Dir::open_ambient_dir(&self.root, cap_std::ambient_authority())
            .map_err(Error::io_at(&self.root))
    }

    /// Find the single deployment checkout in the unpacked sysroot, returning
    /// its path relative to the storage root and the deployed commit.
    pub fn deployment(&self) -> Result<Deployment> {
        let root = self.open_root()?;
        let deploy_root = Utf8Path::new(SYSROOT).join(DEPLOY);
        let Some(stateroots) = root.open_dir_optional(&deploy_root)? else {
            return Err(Error::not_found("deployment directory", deploy_root));
        };
        let mut found = None;
        for stateroot in stateroots.entries()? {
            let stateroot = stateroot?;
            if !stateroot.file_type()?.is_dir() {
                continue;
            }
            let Some(osname) = stateroot.file_name().to_str().map(ToOwned::to_owned) else {
                continue;
            };
            let Some(deploydir) = stateroot.open_dir()?.open_dir_optional("deploy")? else {
                continue;
            };
            for ent in deploydir.entries()? {
                let ent = ent?;
                if !ent.file_type()?.is_dir() {
                    continue;
                }
                let Some(name) = ent.file_name().to_str().map(ToOwned::to_owned) else {
                    continue;
                };
                let Some((checksum, _serial)) = name.split_once('.') else {
                    continue;
                };
                let d = Deployment {
                    osname: osname.clone(),
                    checksum: checksum.to_owned(),
                    path: deploy_root.join(&osname).join("deploy").join(&name),
                };
                if let Some(prev) = found.replace(d) {
                    return Err(Error::InvariantViolation(format!(
                        "expected a single deployment in the sysroot, found {} and {}",
                        prev.path, name
                    )));
                }
            }
        }
        found.ok_or_else(|| Error::not_found("deployment", deploy_root.to_string()))
    }
}

/// A deployment checkout inside the unpacked sysroot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    /// The stateroot (OS name) of the deployment.
    pub osname: String,
    /// The deployed commit.
    pub checksum: String,
    /// Path relative to the storage root.
    pub path: Utf8PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::Fixture;

    #[test]
    fn test_unpacked_state() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap();
        let tree = WorkingTree::new(root.join("storage"));
        assert!(!tree.is_unpacked());
        let e = tree.require_dt_capable().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_raw_image_forbids_dt() {
        let fixture = Fixture::new().unwrap();
        std::fs::remove_dir_all(fixture.tree.tezi_dir()).unwrap();
        assert_eq!(fixture.tree.image_type(), ImageType::Raw);
        let e = fixture.tree.require_dt_capable().unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::InvalidOperation);
    }

    #[test]
    fn test_deployment() {
        let fixture = Fixture::new().unwrap();
        let d = fixture.tree.deployment().unwrap();
        assert_eq!(d.osname, "torizon");
        assert_eq!(d.checksum, crate::fixture::BASE_CHECKSUM);
        assert!(d.path.as_str().starts_with("sysroot/ostree/deploy/torizon/deploy/"));
    }

    #[test]
    fn test_default_change_dirs_order() {
        let fixture = Fixture::new().unwrap();
        for d in ["kernel", "changes", "dt"] {
            std::fs::create_dir_all(fixture.tree.root().join(d)).unwrap();
        }
        let dirs = fixture.tree.default_change_dirs();
        let names: Vec<_> = dirs.iter().filter_map(|d| d.file_name()).collect();
        assert_eq!(names, ["changes", "dt", "kernel"]);
    }
}
