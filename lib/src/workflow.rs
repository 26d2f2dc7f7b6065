//! # Deploying overlays in one go
//!
//! `dto deploy` strings the other components together: fetch and unpack
//! the base image, fetch the device tree sources, optionally clear the
//! enabled overlays, apply the requested ones, union everything into a
//! commit and deploy that to the device.

use std::sync::Arc;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use fn_error_context::context;

use crate::download;
use crate::dt::{self, CheckoutOptions};
use crate::dtc::{DeviceTreeCompiler, Dtc, OverlayTester};
use crate::images::{self, UnpackOptions};
use crate::overlay::{ApplyOptions, OverlayApplier};
use crate::remote::{
    self, DeployConfig, DeployReport, ProgressEvent, RemoteDeployer, RemoteSession,
};
use crate::repo::{CommitStore, OstreeRepo};
use crate::storage::WorkingTree;
use crate::union::{self, UnionOptions};

/// Branch the overlays are committed to.
pub const DTO_DEPLOY_BRANCH: &str = "dto_deploy";
/// Subject of the commit.
pub const DTO_DEPLOY_SUBJECT: &str = "dto_deploy_subject";
/// Body of the commit.
pub const DTO_DEPLOY_BODY: &str = "dto_deploy_body";

/// Where `dto deploy` takes the base image from.
#[derive(Debug, Clone, Default)]
pub enum ImageSource {
    /// The image already unpacked in the storage.
    #[default]
    Unpacked,
    /// Unpack this image, replacing the storage contents.
    Local(Utf8PathBuf),
    /// Download the image the device runs and unpack it, replacing the
    /// storage contents.
    Device {
        /// Root of the artifact repository.
        base_url: String,
        /// Directory the image is downloaded to.
        download_dir: Utf8PathBuf,
    },
}

/// Everything `dto deploy` does.
#[derive(Debug, Clone, Default)]
pub struct DtoDeployOptions {
    /// The base image.
    pub image: ImageSource,
    /// Clone the device tree sources here unless they exist.
    pub device_trees: Option<(Utf8PathBuf, CheckoutOptions)>,
    /// Disable every overlay before applying.
    pub clear: bool,
    /// Overlay sources to apply, in order.
    pub overlays: Vec<Utf8PathBuf>,
    /// Device tree to test the overlays against.
    pub device_tree: Option<Utf8PathBuf>,
    /// Include search path for the overlay sources.
    pub include_dirs: Vec<Utf8PathBuf>,
    /// Skip checking the overlays against the device tree.
    pub force: bool,
    /// The device to deploy to.
    pub remote_host: String,
    /// How to deploy.
    pub deploy: DeployConfig,
}

/// Apply the overlays and union all changes into a new commit on
/// [`DTO_DEPLOY_BRANCH`], returning its checksum.
#[context("Composing overlays")]
pub fn compose(
    tree: &WorkingTree,
    compiler: &dyn DeviceTreeCompiler,
    tester: &dyn OverlayTester,
    store: &dyn CommitStore,
    opts: &DtoDeployOptions,
) -> Result<String> {
    let applier = OverlayApplier::new(tree, compiler, tester);
    if opts.clear {
        applier.remove_all().context("Removing applied overlays")?;
    }
    let apply_opts = ApplyOptions {
        include_dirs: opts.include_dirs.clone(),
        device_tree: opts.device_tree.clone(),
        allow_reapply: false,
        test_apply: !opts.force,
    };
    for o in &opts.overlays {
        applier
            .apply(o, &apply_opts)
            .with_context(|| format!("Applying {o}"))?;
    }

    let mut union_opts = UnionOptions::new(tree.default_change_dirs(), DTO_DEPLOY_BRANCH);
    union_opts.subject = DTO_DEPLOY_SUBJECT.to_owned();
    union_opts.body = DTO_DEPLOY_BODY.to_owned();
    let checksum = union::union(store, tree.root(), &union_opts)?;
    Ok(checksum)
}

#[context("Preparing base image")]
async fn prepare<S: RemoteSession>(
    tree: &WorkingTree,
    session: &Arc<S>,
    opts: &DtoDeployOptions,
) -> Result<()> {
    let unpack_opts = UnpackOptions { force: true };
    match &opts.image {
        ImageSource::Unpacked => {}
        ImageSource::Local(image) => {
            images::unpack(tree, image, &unpack_opts)?;
        }
        ImageSource::Device {
            base_url,
            download_dir,
        } => {
            let image =
                download::download_matching_image(Arc::clone(session), base_url, download_dir)
                    .await?;
            images::unpack(tree, &image, &unpack_opts)?;
        }
    }
    tree.require_dt_capable()?;
    if let Some((dest, co)) = &opts.device_trees {
        if dest.exists() {
            tracing::debug!("Using existing device tree sources in {dest}");
        } else {
            dt::checkout(dest, co)?;
        }
    }
    Ok(())
}

fn log_progress(e: ProgressEvent) {
    match e {
        ProgressEvent::Resolved(r) => tracing::debug!("Device address: {}", r.address),
        ProgressEvent::Serving(url) => tracing::debug!("Serving commits at {url}"),
        ProgressEvent::RemoteConfigured => tracing::debug!("Remote configured on device"),
        ProgressEvent::Pulling(c) => tracing::info!("Pulling OSTree with ref {c} from local archive repository..."),
        ProgressEvent::Deploying(c) => tracing::info!("Deploying commit {c}"),
        ProgressEvent::Deployed(c) => tracing::info!("Deploying successfully finished: {c}"),
        ProgressEvent::Rebooting => tracing::info!("Rebooting the device"),
    }
}

/// Run the whole `dto deploy` workflow with the real toolchain.
#[context("Deploying overlays to {}", opts.remote_host)]
pub async fn dto_deploy(tree: &WorkingTree, opts: &DtoDeployOptions) -> Result<DeployReport> {
    let (resolved, session) = remote::connect(&opts.remote_host, &opts.deploy).await?;
    log_progress(ProgressEvent::Resolved(resolved));
    prepare(tree, &session, opts).await?;
    let repo = OstreeRepo::open(tree.archive_repo())?;
    compose_and_deploy(tree, &Dtc, &Dtc, &repo, session, opts).await
}

/// Apply the overlays, union the changes and deploy the resulting commit
/// of `store` through `session`.
pub async fn compose_and_deploy<S: RemoteSession>(
    tree: &WorkingTree,
    compiler: &dyn DeviceTreeCompiler,
    tester: &dyn OverlayTester,
    store: &dyn CommitStore,
    session: Arc<S>,
    opts: &DtoDeployOptions,
) -> Result<DeployReport> {
    let checksum = compose(tree, compiler, tester, store, opts)?;
    let report = RemoteDeployer::new(&tree.archive_repo(), opts.deploy.serve_port)
        .deploy(
            session,
            &checksum,
            opts.deploy.ssh.password.as_deref(),
            opts.deploy.reboot,
            &mut log_progress,
        )
        .await
        .with_context(|| format!("Deploying {checksum}"))?;
    Ok(report)
}

/// Deploy a commit of the archive repository to a device.
#[context("Deploying {checksum}")]
pub async fn deploy_commit(
    archive: &Utf8Path,
    checksum: &str,
    host: &str,
    config: &DeployConfig,
) -> Result<DeployReport> {
    let report =
        remote::deploy_to_host(archive, host, checksum, config, &mut log_progress).await?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::{DirStore, FakeCompiler, FakeSession, FakeTester, Fixture};
    use crate::remote::RebootOutcome;
    use crate::overlay_store::OverlayStore;
    use crate::storage::OSTREE_BASE_REF;

    fn setup() -> anyhow::Result<(Fixture, DirStore)> {
        let fixture = Fixture::new()?;
        let store = DirStore::new(fixture.workdir.join("repo"))?;
        store.import(&fixture.deployroot(), OSTREE_BASE_REF)?;
        Ok((fixture, store))
    }

    #[test]
    fn test_compose() -> anyhow::Result<()> {
        let (fixture, store) = setup()?;
        let a = fixture.write_source("hdmi.dts", "/plugin/; hdmi")?;
        let b = fixture.write_source("spi.dts", "/plugin/; spi")?;
        let opts = DtoDeployOptions {
            overlays: vec![a, b],
            ..Default::default()
        };
        let csum = compose(&fixture.tree, &FakeCompiler, &FakeTester, &store, &opts)?;
        assert_eq!(store.resolve_rev(DTO_DEPLOY_BRANCH)?, csum);

        let meta = store.commit_metadata(&csum)?;
        assert_eq!(meta.subject, DTO_DEPLOY_SUBJECT);
        assert_eq!(meta.body, DTO_DEPLOY_BODY);
        assert_eq!(meta.parent, Some(store.resolve_rev(OSTREE_BASE_REF)?));

        let ovl = OverlayStore::open(&fixture.tree)?;
        let rel = ovl.staged_dir().strip_prefix(fixture.tree.dt_changes_dir())?.to_owned();
        let committed = store.tree_of(&csum);
        assert!(committed.join(&rel).join("hdmi.dtbo").is_file());
        let manifest = std::fs::read_to_string(committed.join(&rel).join("../overlays.txt"))?;
        assert_eq!(manifest, "fdt_overlays=hdmi.dtbo spi.dtbo\n");
        Ok(())
    }

    #[test]
    fn test_compose_clear() -> anyhow::Result<()> {
        let (fixture, store) = setup()?;
        let old = fixture.write_source("old.dts", "/plugin/; old")?;
        let first = DtoDeployOptions {
            overlays: vec![old],
            ..Default::default()
        };
        compose(&fixture.tree, &FakeCompiler, &FakeTester, &store, &first)?;

        let new = fixture.write_source("new.dts", "/plugin/; new")?;
        let second = DtoDeployOptions {
            clear: true,
            overlays: vec![new],
            ..Default::default()
        };
        compose(&fixture.tree, &FakeCompiler, &FakeTester, &store, &second)?;
        let ovl = OverlayStore::open(&fixture.tree)?;
        assert_eq!(ovl.list_applied()?, ["new.dtbo"]);
        assert_eq!(ovl.staged_blobs()?, ["new.dtbo"]);
        Ok(())
    }

    #[test]
    fn test_compose_failure_commits_nothing() -> anyhow::Result<()> {
        let (fixture, store) = setup()?;
        let good = fixture.write_source("good.dts", "/plugin/; good")?;
        let bad = fixture.write_source("bad.dts", "/plugin/; conflict")?;
        let opts = DtoDeployOptions {
            overlays: vec![good, bad.clone()],
            ..Default::default()
        };
        let e = compose(&fixture.tree, &FakeCompiler, &FakeTester, &store, &opts).unwrap_err();
        let kind = e.downcast_ref::<crate::Error>().map(crate::Error::kind);
        assert_eq!(kind, Some(crate::ErrorKind::NotApplicable));
        assert!(!store.list_refs()?.contains_key(DTO_DEPLOY_BRANCH));
        let ovl = OverlayStore::open(&fixture.tree)?;
        assert_eq!(ovl.list_applied()?, ["good.dtbo"]);

        // Without checking, the overlay is taken as is
        let forced = DtoDeployOptions {
            force: true,
            overlays: vec![bad],
            ..Default::default()
        };
        compose(&fixture.tree, &FakeCompiler, &FakeTester, &store, &forced)?;
        assert_eq!(ovl.list_applied()?, ["good.dtbo", "bad.dtbo"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_compose_and_deploy() -> anyhow::Result<()> {
        let (fixture, store) = setup()?;
        let old = fixture.write_source("old.dts", "/plugin/; old")?;
        let first = DtoDeployOptions {
            overlays: vec![old],
            ..Default::default()
        };
        compose(&fixture.tree, &FakeCompiler, &FakeTester, &store, &first)?;

        let new = fixture.write_source("new.dts", "/plugin/; new")?;
        let session = Arc::new(FakeSession::new([(
            "echo $SSH_CONNECTION",
            Ok("127.0.0.1 40000 127.0.0.1 22\n".into()),
        )]));
        let mut opts = DtoDeployOptions {
            clear: true,
            overlays: vec![new],
            ..Default::default()
        };
        opts.deploy.reboot = true;
        let report = compose_and_deploy(
            &fixture.tree,
            &FakeCompiler,
            &FakeTester,
            &store,
            Arc::clone(&session),
            &opts,
        )
        .await?;

        let csum = store.resolve_rev(DTO_DEPLOY_BRANCH)?;
        assert_eq!(report.checksum, csum);
        assert_eq!(report.reboot, RebootOutcome::Requested);
        let ovl = OverlayStore::open(&fixture.tree)?;
        assert_eq!(ovl.list_applied()?, ["new.dtbo"]);
        let cmds: Vec<String> = session.commands().into_iter().map(|(c, _)| c).collect();
        let pos = |needle: &str| cmds.iter().position(|c| c.contains(needle));
        let pull = pos(&format!("ostree pull tcbuilder {csum}")).unwrap();
        let deploy = pos(&format!("ostree admin deploy --karg-proc-cmdline {csum}")).unwrap();
        let reboot = pos("reboot").unwrap();
        assert!(pull < deploy && deploy < reboot);
        Ok(())
    }

    #[tokio::test]
    async fn test_compose_failure_deploys_nothing() -> anyhow::Result<()> {
        let (fixture, store) = setup()?;
        let bad = fixture.write_source("bad.dts", "syntax error")?;
        let session = Arc::new(FakeSession::new([]));
        let opts = DtoDeployOptions {
            overlays: vec![bad],
            ..Default::default()
        };
        let r = compose_and_deploy(
            &fixture.tree,
            &FakeCompiler,
            &FakeTester,
            &store,
            Arc::clone(&session),
            &opts,
        )
        .await;
        assert!(r.is_err());
        assert!(session.commands().is_empty());
        Ok(())
    }
}
