//! # The commit store
//!
//! All that is needed from OSTree repositories are a handful of primitives:
//! resolving revisions, checking out and writing commits, listing refs and
//! copying commits between local repositories.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use ostree::glib::object::Cast;
use ostree::{gio, glib};
use regex::Regex;

use crate::error::{Error, Result};
/// Typed metadata of a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitMetadata {
    /// The commit checksum.
    pub checksum: String,
    /// The parent commit, if any.
    pub parent: Option<String>,
    /// One line summary.
    pub subject: String,
    /// Free form description.
    pub body: String,
}

/// A content addressed store of filesystem tree commits.
pub trait CommitStore {
    /// Resolve a ref or (partial) checksum to a full checksum.
    fn resolve_rev(&self, rev: &str) -> Result<String>;

    /// Check out the tree of `rev` into `dest`, which must not exist.
    fn checkout(&self, rev: &str, dest: &Utf8Path) -> Result<()>;

    /// Write the contents of `tree` as a new commit with the given parent,
    /// point `branch` at it and return its checksum.
    fn write_commit(
        &self,
        tree: &Utf8Path,
        parent: &str,
        branch: &str,
        subject: &str,
        body: &str,
    ) -> Result<String>;

    /// All refs with the commit they point to.
    fn list_refs(&self) -> Result<BTreeMap<String, String>>;

    /// The metadata of a commit.
    fn commit_metadata(&self, rev: &str) -> Result<CommitMetadata>;

    /// Copy `rev` and its history from the local repository at `src` and
    /// point `dest_ref` at it.
    fn pull_local(&self, src: &Utf8Path, rev: &str, dest_ref: &str) -> Result<()>;
}

/// Refs ostree creates internally for deployments.
static DEPLOYMENT_REF: Lazy<Regex> = Lazy::new(|| Regex::new(r"^ostree/\d+/\d+/\d+$").unwrap());

/// Strip the `remote:` prefix of a remote ref.
fn local_ref_name(r: &str) -> &str {
    r.split_once(':').map(|(_, r)| r).unwrap_or(r)
}

fn store_err(context: impl std::fmt::Display) -> impl FnOnce(glib::Error) -> Error {
    move |e| Error::Io(std::io::Error::other(format!("{context}: {e}")))
}

/// An OSTree repository on the local filesystem.
pub struct OstreeRepo {
    repo: ostree::Repo,
    path: Utf8PathBuf,
}

impl std::fmt::Debug for OstreeRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OstreeRepo")
            .field("path", &self.path)
            .finish()
    }
}

impl OstreeRepo {
    /// Use the existing repository at `path`.
    pub fn open(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.join("config").is_file() {
            return Err(Error::not_found("OSTree repository", path.as_str()));
        }
        let repo = ostree::Repo::open_at(libc::AT_FDCWD, path.as_str(), gio::Cancellable::NONE)
            .map_err(store_err(format!("Opening {path}")))?;
        Ok(Self { repo, path })
    }

    /// Create a new archive mode repository at `path`.
    pub fn init_archive(path: impl Into<Utf8PathBuf>) -> Result<Self> {
        let path = path.into();
        let repo = ostree::Repo::new_for_path(&path);
        repo.create(ostree::RepoMode::Archive, gio::Cancellable::NONE)
            .map_err(store_err(format!("Creating archive repository {path}")))?;
        Ok(Self { repo, path })
    }

    /// The repository directory.
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}

/// Whether the files we write can carry arbitrary ownership.
fn user_mode() -> bool {
    !rustix::process::getuid().is_root()
}

impl CommitStore for OstreeRepo {
    fn resolve_rev(&self, rev: &str) -> Result<String> {
        self.repo
            .resolve_rev(rev, true)
            .map_err(store_err(format!("Resolving {rev}")))?
            .map(|c| c.to_string())
            .ok_or_else(|| Error::not_found("revision", rev))
    }

    fn checkout(&self, rev: &str, dest: &Utf8Path) -> Result<()> {
        let checksum = self.resolve_rev(rev)?;
        let mode = if user_mode() {
            ostree::RepoCheckoutMode::User
        } else {
            ostree::RepoCheckoutMode::None
        };
        let opts = ostree::RepoCheckoutAtOptions {
            mode,
            ..Default::default()
        };
        self.repo
            .checkout_at(
                Some(&opts),
                ostree::AT_FDCWD,
                dest,
                &checksum,
                gio::Cancellable::NONE,
            )
            .map_err(store_err(format!("Checking out {rev}")))
    }

    fn write_commit(
        &self,
        tree: &Utf8Path,
        parent: &str,
        branch: &str,
        subject: &str,
        body: &str,
    ) -> Result<String> {
        let cancellable = gio::Cancellable::NONE;
        let err = || store_err(format!("Committing {tree} to {branch}"));
        let txn = self.repo.auto_transaction(cancellable).map_err(err())?;
        // Image contents are owned by root no matter who builds them
        let flags = if user_mode() {
            ostree::RepoCommitModifierFlags::CANONICAL_PERMISSIONS
        } else {
            ostree::RepoCommitModifierFlags::NONE
        };
        let modifier = ostree::RepoCommitModifier::new(flags, None);
        let mt = ostree::MutableTree::new();
        self.repo
            .write_dfd_to_mtree(
                ostree::AT_FDCWD,
                tree.as_str(),
                &mt,
                Some(&modifier),
                cancellable,
            )
            .map_err(err())?;
        let root = self.repo.write_mtree(&mt, cancellable).map_err(err())?;
        let root = root
            .downcast::<ostree::RepoFile>()
            .map_err(|_| Error::InvariantViolation(format!("{tree} is not a repository tree")))?;
        let checksum = self
            .repo
            .write_commit(
                Some(parent),
                Some(subject),
                Some(body),
                None,
                &root,
                cancellable,
            )
            .map_err(err())?;
        self.repo
            .transaction_set_ref(None, branch, Some(checksum.as_str()));
        txn.commit(cancellable).map_err(err())?;
        Ok(checksum.to_string())
    }

    fn list_refs(&self) -> Result<BTreeMap<String, String>> {
        let refs = self
            .repo
            .list_refs(None, gio::Cancellable::NONE)
            .map_err(store_err("Listing refs"))?;
        Ok(refs
            .into_iter()
            .filter_map(|(full, checksum)| {
                let name = local_ref_name(&full);
                (!DEPLOYMENT_REF.is_match(name)).then(|| (name.to_owned(), checksum.to_string()))
            })
            .collect())
    }

    fn commit_metadata(&self, rev: &str) -> Result<CommitMetadata> {
        let checksum = self.resolve_rev(rev)?;
        let (commit_v, _) = self
            .repo
            .load_commit(&checksum)
            .map_err(store_err(format!("Reading commit {checksum}")))?;
        let text = |i| commit_v.child_value(i).str().unwrap_or_default().to_owned();
        Ok(CommitMetadata {
            parent: ostree::commit_get_parent(&commit_v).map(|p| p.to_string()),
            subject: text(3),
            body: text(4),
            checksum,
        })
    }

    fn pull_local(&self, src: &Utf8Path, rev: &str, dest_ref: &str) -> Result<()> {
        let src_repo = Self::open(src)?;
        let checksum = src_repo.resolve_rev(rev)?;
        let srcfd = format!("file:///proc/self/fd/{}", src_repo.repo.dfd());
        let opts = glib::VariantDict::new(None);
        let refs = [checksum.as_str()];
        opts.insert("refs", &refs[..]);
        opts.insert("flags", ostree::RepoPullFlags::NONE.bits() as i32);
        let options = opts.end();
        self.repo
            .pull_with_options(&srcfd, &options, None, gio::Cancellable::NONE)
            .map_err(|e| Error::Transport(format!("Pulling {rev} from {src}: {e}")))?;
        self.repo
            .set_ref_immediate(None, dest_ref, Some(&checksum), gio::Cancellable::NONE)
            .map_err(store_err(format!("Setting ref {dest_ref}")))
    }
}
