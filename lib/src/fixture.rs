//! Test suite fixture.  Should only be used by this library.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};

use crate::dtc::{DeviceTreeCompiler, OverlayTester};
use crate::error::Error;
use crate::remote::RemoteSession;
use crate::repo::{CommitMetadata, CommitStore};
use crate::resolve::{HostLookup, MulticastLookup};
use crate::storage::WorkingTree;

pub const BASE_CHECKSUM: &str = "5b3c0f6a9ee4d3f1c59ec3a8e6a41c2d72e0ba7ba3b61e3cc9dd1a7cf02a2b11";
pub const BASE_DTB: &str = "imx8mm-verdin-wifi-dev.dtb";
pub const KVER: &str = "5.15.148-6.7.0+git.ae1f9e4b8a4a";
const OSNAME: &str = "torizon";
pub const BASE_COMPATIBLE: &[&str] = &["toradex,verdin-imx8mm-wifi-dev", "toradex,verdin-imx8mm"];

/// An unpacked Easy Installer image with a single deployment.
#[derive(Debug)]
pub struct Fixture {
    _td: tempfile::TempDir,
    /// Scratch space next to the storage, for sources and such.
    pub workdir: Utf8PathBuf,
    pub tree: WorkingTree,
}

impl Fixture {
    pub fn new() -> Result<Self> {
        let td = tempfile::tempdir()?;
        let workdir = Utf8Path::from_path(td.path())
            .ok_or_else(|| anyhow::anyhow!("non-UTF-8 tempdir"))?
            .to_owned();
        let tree = WorkingTree::new(workdir.join("storage"));
        std::fs::create_dir_all(tree.tezi_dir())?;
        std::fs::create_dir_all(tree.archive_repo())?;
        let r = Self {
            _td: td,
            workdir,
            tree,
        };
        let kdir = r.deployroot().join("usr/lib/modules").join(KVER);
        std::fs::create_dir_all(kdir.join("dtb"))?;
        std::fs::write(kdir.join("vmlinuz"), "kernel")?;
        r.write_base_dtb(BASE_DTB)?;
        Ok(r)
    }

    pub fn deployroot(&self) -> Utf8PathBuf {
        self.tree
            .sysroot_dir()
            .join("ostree/deploy")
            .join(OSNAME)
            .join("deploy")
            .join(format!("{BASE_CHECKSUM}.0"))
    }

    fn dtb_dir(&self) -> Utf8PathBuf {
        self.deployroot()
            .join("usr/lib/modules")
            .join(KVER)
            .join("dtb")
    }

    /// Add an overlay blob shipped by the base image.
    pub fn write_base_overlay(&self, name: &str) -> Result<()> {
        let d = self.dtb_dir().join("overlays");
        std::fs::create_dir_all(&d)?;
        std::fs::write(d.join(name), format!("/plugin/; {name}"))?;
        Ok(())
    }

    /// Add a device tree blob shipped by the base image.
    pub fn write_base_dtb(&self, name: &str) -> Result<()> {
        let blob = crate::fdt::tests::build_blob(BASE_COMPATIBLE);
        std::fs::write(self.dtb_dir().join(name), blob)?;
        Ok(())
    }

    /// Write a source file outside of the storage.
    pub fn write_source(&self, name: &str, contents: &str) -> Result<Utf8PathBuf> {
        let d = self.workdir.join("src");
        std::fs::create_dir_all(&d)?;
        let p = d.join(name);
        std::fs::write(&p, contents)?;
        Ok(p)
    }

    /// Temporary files left behind in the storage root.
    pub fn stray_temp_files(&self) -> Result<Vec<String>> {
        let mut r = Vec::new();
        for ent in std::fs::read_dir(self.tree.root())? {
            let name = ent?.file_name().to_string_lossy().into_owned();
            if name.starts_with(".tcbuilder-") {
                r.push(name);
            }
        }
        Ok(r)
    }
}

/// Copies the source as the "compiled" blob; sources containing
/// `syntax error` fail to compile.
#[derive(Debug, Default)]
pub struct FakeCompiler;

impl DeviceTreeCompiler for FakeCompiler {
    fn compile(
        &self,
        source: &Utf8Path,
        _include_dirs: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> crate::Result<()> {
        let src = std::fs::read_to_string(source).map_err(Error::io_at(source))?;
        if src.contains("syntax error") {
            return Err(Error::Compile {
                path: source.to_owned(),
                detail: "syntax error".into(),
            });
        }
        std::fs::write(output, src).map_err(Error::io_at(output))
    }
}

/// Overlays containing `conflict` do not apply.
#[derive(Debug, Default)]
pub struct FakeTester;

impl OverlayTester for FakeTester {
    fn try_apply(
        &self,
        base: &Utf8Path,
        overlays: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> crate::Result<()> {
        for o in overlays {
            let contents = std::fs::read(o).map_err(Error::io_at(o))?;
            if String::from_utf8_lossy(&contents).contains("conflict") {
                return Err(Error::NotApplicable {
                    overlay: o.file_name().unwrap_or_default().to_owned(),
                    device_tree: base.file_name().unwrap_or_default().to_owned(),
                    detail: "FDT_ERR_NOTFOUND".into(),
                });
            }
        }
        std::fs::copy(base, output).map_err(Error::io_at(output))?;
        Ok(())
    }
}

/// A commit store keeping every commit as a plain directory tree:
/// `commits/<checksum>/{tree,meta.json}` and `refs/<name>`.
#[derive(Debug)]
pub struct DirStore {
    root: Utf8PathBuf,
}

/// Recursively copy directories, regular files and symlinks.
pub fn copy_tree(src: &Utf8Path, dest: &Utf8Path) -> std::io::Result<()> {
    std::fs::create_dir(dest)?;
    for ent in src.read_dir_utf8()? {
        let ent = ent?;
        let from = ent.path();
        let to = dest.join(ent.file_name());
        let ft = ent.file_type()?;
        if ft.is_dir() {
            copy_tree(from, &to)?;
        } else if ft.is_symlink() {
            std::os::unix::fs::symlink(std::fs::read_link(from)?, &to)?;
        } else if ft.is_file() {
            std::fs::copy(from, &to)?;
        }
    }
    Ok(())
}

impl DirStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("commits"))?;
        std::fs::create_dir_all(root.join("refs"))?;
        Ok(Self { root })
    }

    /// Commit `tree` without parent and point `r` at it.
    pub fn import(&self, tree: &Utf8Path, r: &str) -> Result<String> {
        Ok(self.commit(tree, None, r, "import", "")?)
    }

    /// The content of a commit.
    pub fn tree_of(&self, checksum: &str) -> Utf8PathBuf {
        self.commit_dir(checksum).join("tree")
    }

    fn commit_dir(&self, checksum: &str) -> Utf8PathBuf {
        self.root.join("commits").join(checksum)
    }

    fn set_ref(&self, name: &str, checksum: &str) -> crate::Result<()> {
        let p = self.root.join("refs").join(name);
        if let Some(parent) = p.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&p, checksum).map_err(Error::io_at(p))
    }

    fn commit(
        &self,
        tree: &Utf8Path,
        parent: Option<&str>,
        branch: &str,
        subject: &str,
        body: &str,
    ) -> crate::Result<String> {
        let n = std::fs::read_dir(self.root.join("commits"))?.count() + 1;
        let checksum = format!("{n:064x}");
        let d = self.commit_dir(&checksum);
        std::fs::create_dir(&d)?;
        copy_tree(tree, &d.join("tree")).map_err(Error::io_at(tree))?;
        let meta = serde_json::json!({
            "parent": parent,
            "subject": subject,
            "body": body,
        });
        std::fs::write(d.join("meta.json"), meta.to_string())?;
        self.set_ref(branch, &checksum)?;
        Ok(checksum)
    }

    fn walk_refs(
        &self,
        dir: &Utf8Path,
        prefix: &str,
        out: &mut BTreeMap<String, String>,
    ) -> crate::Result<()> {
        for ent in dir.read_dir_utf8()? {
            let ent = ent?;
            let name = format!("{prefix}{}", ent.file_name());
            if ent.file_type()?.is_dir() {
                self.walk_refs(ent.path(), &format!("{name}/"), out)?;
            } else {
                out.insert(name, std::fs::read_to_string(ent.path())?);
            }
        }
        Ok(())
    }
}

impl CommitStore for DirStore {
    fn resolve_rev(&self, rev: &str) -> crate::Result<String> {
        let r = self.root.join("refs").join(rev);
        if r.is_file() {
            return Ok(std::fs::read_to_string(r)?);
        }
        let mut matches = self
            .root
            .join("commits")
            .read_dir_utf8()?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_owned())
            .filter(|c| !rev.is_empty() && c.starts_with(rev));
        match (matches.next(), matches.next()) {
            (Some(c), None) => Ok(c),
            _ => Err(Error::not_found("revision", rev)),
        }
    }

    fn checkout(&self, rev: &str, dest: &Utf8Path) -> crate::Result<()> {
        let csum = self.resolve_rev(rev)?;
        copy_tree(&self.tree_of(&csum), dest).map_err(Error::io_at(dest))
    }

    fn write_commit(
        &self,
        tree: &Utf8Path,
        parent: &str,
        branch: &str,
        subject: &str,
        body: &str,
    ) -> crate::Result<String> {
        self.commit(tree, Some(parent), branch, subject, body)
    }

    fn list_refs(&self) -> crate::Result<BTreeMap<String, String>> {
        let mut r = BTreeMap::new();
        self.walk_refs(&self.root.join("refs"), "", &mut r)?;
        Ok(r)
    }

    fn commit_metadata(&self, rev: &str) -> crate::Result<CommitMetadata> {
        let checksum = self.resolve_rev(rev)?;
        let p = self.commit_dir(&checksum).join("meta.json");
        let meta: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&p)?)
            .map_err(|e| Error::Malformed {
                what: "commit metadata",
                detail: e.to_string(),
            })?;
        let field = |k: &str| meta[k].as_str().unwrap_or_default().to_owned();
        Ok(CommitMetadata {
            parent: meta["parent"].as_str().map(ToOwned::to_owned),
            subject: field("subject"),
            body: field("body"),
            checksum,
        })
    }

    fn pull_local(&self, src: &Utf8Path, rev: &str, dest_ref: &str) -> crate::Result<()> {
        let src = DirStore {
            root: src.to_owned(),
        };
        let checksum = src.resolve_rev(rev)?;
        let mut next = Some(checksum.clone());
        while let Some(c) = next {
            let to = self.commit_dir(&c);
            if !to.exists() {
                std::fs::create_dir(&to)?;
                copy_tree(&src.tree_of(&c), &to.join("tree")).map_err(Error::io_at(&to))?;
                std::fs::copy(src.commit_dir(&c).join("meta.json"), to.join("meta.json"))?;
            }
            next = src.commit_metadata(&c)?.parent;
        }
        self.set_ref(dest_ref, &checksum)
    }
}

/// A unicast resolver with a fixed table.
#[derive(Debug, Default, Clone)]
pub struct FakeDns {
    names: HashMap<String, IpAddr>,
}

impl FakeDns {
    pub fn with(name: &str, addr: &str) -> Self {
        let mut names = HashMap::new();
        names.insert(name.to_owned(), addr.parse().unwrap());
        Self { names }
    }
}

impl HostLookup for FakeDns {
    async fn lookup(&self, name: &str) -> crate::Result<Option<IpAddr>> {
        Ok(self.names.get(name).copied())
    }
}

/// A multicast resolver with a fixed table which records every query.
#[derive(Debug, Default, Clone)]
pub struct FakeMdns {
    names: HashMap<String, Ipv4Addr>,
    queries: Arc<Mutex<Vec<String>>>,
}

impl FakeMdns {
    pub fn with(name: &str, addr: Ipv4Addr) -> Self {
        let mut r = Self::default();
        r.names.insert(name.to_owned(), addr);
        r
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

impl MulticastLookup for FakeMdns {
    async fn query(
        &self,
        name: &str,
        _source: Option<Ipv4Addr>,
        _timeout: Duration,
    ) -> crate::Result<Ipv4Addr> {
        self.queries.lock().unwrap().push(name.to_owned());
        self.names.get(name).copied().ok_or_else(|| {
            Error::Resolution(format!("Resolving hostname \"{name}\" using mDNS failed."))
        })
    }
}

/// A device shell answering commands from a table; the first rule whose
/// key is contained in the command wins, anything else succeeds silently.
#[derive(Debug, Default)]
pub struct FakeSession {
    rules: Vec<(String, std::result::Result<String, String>)>,
    log: Mutex<Vec<(String, Option<String>)>>,
}

impl FakeSession {
    pub fn new(
        rules: impl IntoIterator<Item = (&'static str, std::result::Result<String, String>)>,
    ) -> Self {
        Self {
            rules: rules.into_iter().map(|(k, v)| (k.to_owned(), v)).collect(),
            log: Default::default(),
        }
    }

    /// Without a rule, the device reports the last commit it deployed.
    fn booted_status(&self) -> String {
        let log = self.log.lock().unwrap();
        let deployed = log
            .iter()
            .rev()
            .find(|(c, _)| c.contains("ostree admin deploy"))
            .and_then(|(c, _)| c.split_whitespace().last())
            .map(|c| c.trim_matches('\''));
        match deployed {
            Some(c) => format!("* torizon {c}.0\n"),
            None => "No deployments.\n".to_owned(),
        }
    }

    /// Every command run so far, with its stdin.
    pub fn commands(&self) -> Vec<(String, Option<String>)> {
        self.log.lock().unwrap().clone()
    }
}

impl RemoteSession for FakeSession {
    fn run(&self, cmd: &str, stdin: Option<&str>) -> crate::Result<String> {
        self.log
            .lock()
            .unwrap()
            .push((cmd.to_owned(), stdin.map(ToOwned::to_owned)));
        match self.rules.iter().find(|(k, _)| cmd.contains(k.as_str())) {
            Some((_, Ok(out))) => Ok(out.clone()),
            Some((_, Err(e))) => Err(Error::Transport(e.clone())),
            None if cmd.contains("ostree admin status") => Ok(self.booted_status()),
            None => Ok(String::new()),
        }
    }
}
