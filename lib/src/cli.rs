//! # TorizonCore Builder CLI
//!
//! Command line tool to customize OSTree based images for embedded devices.

use std::ffi::OsString;
use std::net::Ipv4Addr;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use fn_error_context::context;

use crate::config::Config;
use crate::download;
use crate::dt;
use crate::dtc::Dtc;
use crate::images::{self, UnpackOptions};
use crate::kernel::KernelArgs;
use crate::overlay::{ApplyOptions, OverlayApplier};
use crate::remote::{self, DeployConfig, RebootOutcome};
use crate::repo::{CommitStore, OstreeRepo};
use crate::storage::WorkingTree;
use crate::union::{self, UnionOptions};
use crate::workflow::{self, DtoDeployOptions, ImageSource};

/// Options shared by all commands.
#[derive(Debug, Parser)]
pub(crate) struct GlobalOpts {
    /// Configuration file; defaults to `tcbuilder.toml` if present.
    #[clap(long, global = true)]
    pub(crate) config: Option<Utf8PathBuf>,

    /// Directory holding the unpacked image and the changes to it.
    #[clap(long, global = true)]
    pub(crate) storage_directory: Option<Utf8PathBuf>,
}

/// How to reach a device.
#[derive(Debug, Parser)]
pub(crate) struct DeviceOpts {
    /// Name or address of the device.
    #[clap(long)]
    pub(crate) remote_host: String,

    /// User to log in as.
    #[clap(long)]
    pub(crate) remote_username: Option<String>,

    /// Password for login and sudo.
    #[clap(long)]
    pub(crate) remote_password: Option<String>,

    /// ssh port.
    #[clap(long)]
    pub(crate) remote_port: Option<u16>,

    /// Send mDNS queries from this address.
    #[clap(long)]
    pub(crate) mdns_source: Option<Ipv4Addr>,
}

impl DeviceOpts {
    fn deploy_config(
        &self,
        config: &Config,
        serve_port: Option<u16>,
        reboot: bool,
    ) -> DeployConfig {
        DeployConfig {
            ssh: config.ssh(
                self.remote_username.clone(),
                self.remote_password.clone(),
                self.remote_port,
            ),
            resolver: config.resolver(self.mdns_source),
            serve_port: config.serve_port(serve_port),
            reboot,
        }
    }
}

/// How to deploy to a device.
#[derive(Debug, Parser)]
pub(crate) struct RemoteOpts {
    #[clap(flatten)]
    pub(crate) device: DeviceOpts,

    /// Port of the HTTP server the device pulls from.
    #[clap(long)]
    pub(crate) serve_port: Option<u16>,

    /// Reboot the device after deploying.
    #[clap(long)]
    pub(crate) reboot: bool,
}

impl RemoteOpts {
    fn deploy_config(&self, config: &Config) -> DeployConfig {
        self.device.deploy_config(config, self.serve_port, self.reboot)
    }
}

/// Where to download images to and from.
#[derive(Debug, Parser)]
pub(crate) struct DownloadOpts {
    /// Directory to store the downloaded image in.
    #[clap(long, default_value = ".")]
    pub(crate) download_directory: Utf8PathBuf,

    /// Root of the artifact repository holding the images.
    #[clap(long, default_value = download::ARTIFACTS_URL)]
    pub(crate) artifacts_url: String,
}

/// Manage base images.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum ImagesOpts {
    /// Unpack an Easy Installer image (directory or archive) or a raw
    /// image's root file system archive into the storage.
    Unpack {
        /// The image.
        image: Utf8PathBuf,

        /// Replace a previously unpacked image.
        #[clap(long)]
        force: bool,
    },
    /// Download the Easy Installer image a device runs and unpack it.
    Download {
        #[clap(flatten)]
        device: DeviceOpts,

        #[clap(flatten)]
        download: DownloadOpts,

        /// Replace a previously unpacked image.
        #[clap(long)]
        remove_storage: bool,
    },
}

/// Manage the kernel arguments.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum KernelOpts {
    /// Set the custom kernel arguments, replacing previous ones.
    #[clap(alias = "set_custom_args")]
    SetCustomArgs {
        /// Kernel arguments to add.
        #[clap(required = true, allow_hyphen_values = true)]
        kernel_args: Vec<String>,
    },
    /// Show the custom kernel arguments.
    #[clap(alias = "get_custom_args")]
    GetCustomArgs,
    /// Remove the custom kernel arguments.
    #[clap(alias = "clear_custom_args")]
    ClearCustomArgs,
}

/// Manage device trees.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum DtOpts {
    /// Fetch the device tree sources into `device-trees`.
    Checkout {
        /// Update an existing checkout.
        #[clap(long)]
        update: bool,

        /// Git repository to clone.
        #[clap(long)]
        url: Option<String>,

        /// Branch to check out.
        #[clap(long)]
        branch: Option<String>,
    },
    /// Show the device tree the image boots with.
    Status,
    /// Compile a device tree and make the image boot with it.
    Apply {
        /// Device tree source file.
        dts: Utf8PathBuf,

        /// Include search directory; may be repeated.
        #[clap(long = "include-dir")]
        include_dirs: Vec<Utf8PathBuf>,
    },
}

/// Manage device tree overlays.
#[derive(Debug, clap::Subcommand)]
pub(crate) enum DtoOpts {
    /// Compile an overlay and enable it.
    Apply {
        /// Overlay source file.
        overlay: Utf8PathBuf,

        /// Include search directory; may be repeated.
        #[clap(long = "include-dir")]
        include_dirs: Vec<Utf8PathBuf>,

        /// Check the overlay against this device tree.
        #[clap(long)]
        device_tree: Option<Utf8PathBuf>,

        /// Do not check the overlay against a device tree.
        #[clap(long)]
        force: bool,
    },
    /// List the overlay sources compatible with a device tree.
    List {
        /// Device tree (`.dtb` or `.dts`) to match; the image's own by default.
        #[clap(long)]
        device_tree: Option<Utf8PathBuf>,

        /// Directory of overlay sources.
        #[clap(long, default_value = "device-trees/overlays")]
        overlays_dir: Utf8PathBuf,
    },
    /// Show the device tree and the enabled overlays.
    Status,
    /// Disable an overlay, or all of them.
    Remove {
        /// Overlay blob name, e.g. `verdin-imx8mm_dsi-to-hdmi_overlay.dtbo`.
        #[clap(required_unless_present = "all", conflicts_with = "all")]
        overlay: Option<String>,

        /// Disable every overlay.
        #[clap(long)]
        all: bool,
    },
    /// Apply overlays and deploy the result to a device in one go.
    Deploy {
        /// Overlay source files to apply.
        overlays: Vec<Utf8PathBuf>,

        #[clap(flatten)]
        remote: RemoteOpts,

        /// Unpack this image instead of downloading the one the device runs.
        #[clap(long, conflicts_with = "no_download")]
        image: Option<Utf8PathBuf>,

        /// Use the image already unpacked in the storage.
        #[clap(long)]
        no_download: bool,

        #[clap(flatten)]
        download: DownloadOpts,

        /// Disable all enabled overlays first.
        #[clap(long)]
        clear: bool,

        /// Do not check the overlays against a device tree.
        #[clap(long)]
        force: bool,

        /// Check the overlays against this device tree.
        #[clap(long)]
        device_tree: Option<Utf8PathBuf>,

        /// Include search directory; may be repeated.
        #[clap(long = "include-dir")]
        include_dirs: Vec<Utf8PathBuf>,
    },
}

/// Customize OSTree based images for embedded devices.
#[derive(Debug, clap::Subcommand)]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Manage base images.
    #[clap(subcommand)]
    Images(ImagesOpts),
    /// Manage device trees.
    #[clap(subcommand)]
    Dt(DtOpts),
    /// Manage device tree overlays.
    #[clap(subcommand)]
    Dto(DtoOpts),
    /// Manage the kernel arguments.
    #[clap(subcommand)]
    Kernel(KernelOpts),
    /// Commit the changes on top of the base image.
    Union {
        /// Branch (ref) to create.
        branch: String,

        /// Change directory to union; may be repeated. Defaults to the
        /// storage's change directories.
        #[clap(long = "changes-directory")]
        changes_dirs: Vec<Utf8PathBuf>,

        /// Commit subject.
        #[clap(long)]
        subject: Option<String>,

        /// Commit body.
        #[clap(long)]
        body: Option<String>,
    },
    /// Deploy a commit to a device.
    Deploy {
        /// Ref or checksum to deploy.
        #[clap(value_name = "REF")]
        rev: String,

        #[clap(flatten)]
        remote: RemoteOpts,
    },
}

/// The full command line.
#[derive(Debug, Parser)]
#[clap(name = "tcbuilder", version)]
pub(crate) struct Cli {
    #[clap(flatten)]
    pub(crate) global: GlobalOpts,

    #[clap(subcommand)]
    pub(crate) opt: Opt,
}

/// Everything a command needs besides its own options.
#[derive(Debug)]
struct Env {
    config: Config,
    tree: WorkingTree,
}

impl Env {
    fn new(global: &GlobalOpts) -> Result<Self> {
        let config = Config::load(global.config.as_deref())?;
        let tree = WorkingTree::new(config.storage_directory(global.storage_directory.as_deref()));
        Ok(Self { config, tree })
    }

    fn archive(&self) -> Result<OstreeRepo> {
        self.tree.require_unpacked()?;
        Ok(OstreeRepo::open(self.tree.archive_repo())?)
    }
}

async fn images(env: &Env, opts: ImagesOpts) -> Result<()> {
    match opts {
        ImagesOpts::Unpack { image, force } => {
            images::unpack(&env.tree, &image, &UnpackOptions { force })?;
        }
        ImagesOpts::Download {
            device,
            download,
            remove_storage,
        } => {
            let config = device.deploy_config(&env.config, None, false);
            let (_, session) = remote::connect(&device.remote_host, &config).await?;
            let image = download::download_matching_image(
                session,
                &download.artifacts_url,
                &download.download_directory,
            )
            .await?;
            let opts = UnpackOptions {
                force: remove_storage,
            };
            images::unpack(&env.tree, &image, &opts)?;
        }
    }
    Ok(())
}

fn kernel(env: &Env, opts: KernelOpts) -> Result<()> {
    let kargs = KernelArgs::new(&env.tree, &Dtc, &Dtc);
    match opts {
        KernelOpts::SetCustomArgs { kernel_args } => {
            let set = kargs.set(&kernel_args)?;
            println!("Kernel custom arguments successfully configured with \"{set}\".");
        }
        KernelOpts::GetCustomArgs => match kargs.get()? {
            Some(a) => println!("Currently configured custom kernel arguments: \"{a}\"."),
            None => println!("No custom kernel arguments configured."),
        },
        KernelOpts::ClearCustomArgs => {
            if kargs.clear()? {
                println!("Custom kernel arguments successfully cleared.");
            }
        }
    }
    Ok(())
}

fn dt(env: &Env, opts: DtOpts) -> Result<()> {
    match opts {
        DtOpts::Checkout {
            update,
            url,
            branch,
        } => {
            let mut co = env.config.checkout(update);
            if let Some(url) = url {
                co.url = url;
            }
            if branch.is_some() {
                co.branch = branch;
            }
            dt::checkout(Utf8Path::new(dt::DEVICE_TREES_DIR), &co)?;
        }
        DtOpts::Status => {
            let dtb = dt::status(&env.tree)?;
            if !dtb.exact {
                anyhow::bail!(
                    "cannot identify the enabled device tree in the image; candidates: {}",
                    dtb.candidates.join(" ")
                );
            }
            println!("Current device tree is: {}", dtb.display_name());
        }
        DtOpts::Apply { dts, include_dirs } => {
            let include_dirs = env.config.include_dirs(&include_dirs);
            dt::apply_device_tree(&env.tree, &Dtc, &dts, &include_dirs)?;
        }
    }
    Ok(())
}

#[context("Running dto command")]
async fn dto(env: &Env, opts: DtoOpts) -> Result<()> {
    let applier = OverlayApplier::new(&env.tree, &Dtc, &Dtc);
    match opts {
        DtoOpts::Apply {
            overlay,
            include_dirs,
            device_tree,
            force,
        } => {
            let opts = ApplyOptions {
                include_dirs: env.config.include_dirs(&include_dirs),
                device_tree,
                allow_reapply: false,
                test_apply: !force,
            };
            applier.apply(&overlay, &opts)?;
        }
        DtoOpts::List {
            device_tree,
            overlays_dir,
        } => {
            let found = applier.list_compatible(&overlays_dir, device_tree.as_deref())?;
            if found.is_empty() {
                println!("No compatible overlays found.");
            } else {
                println!("Available overlays are:");
                for p in found {
                    println!("\t- {p}");
                }
            }
        }
        DtoOpts::Status => {
            print!("{}", applier.status()?);
        }
        DtoOpts::Remove { overlay, all } => {
            if all {
                applier.remove_all()?;
            } else if let Some(o) = overlay {
                applier.remove(&o, true)?;
            }
        }
        DtoOpts::Deploy {
            overlays,
            remote,
            image,
            no_download,
            download,
            clear,
            force,
            device_tree,
            include_dirs,
        } => {
            let image = match image {
                Some(i) => ImageSource::Local(i),
                None if no_download => ImageSource::Unpacked,
                None => ImageSource::Device {
                    base_url: download.artifacts_url,
                    download_dir: download.download_directory,
                },
            };
            let opts = DtoDeployOptions {
                image,
                device_trees: Some((
                    dt::DEVICE_TREES_DIR.into(),
                    env.config.checkout(false),
                )),
                clear,
                overlays,
                device_tree,
                include_dirs: env.config.include_dirs(&include_dirs),
                force,
                deploy: remote.deploy_config(&env.config),
                remote_host: remote.device.remote_host,
            };
            let report = workflow::dto_deploy(&env.tree, &opts).await?;
            report_deploy(report.reboot);
        }
    }
    Ok(())
}

fn report_deploy(reboot: RebootOutcome) {
    if let RebootOutcome::Failed(e) = reboot {
        tracing::warn!("The deployment is in place but rebooting the device failed: {e}");
    }
}

#[context("Creating union commit")]
fn union_cmd(
    env: &Env,
    branch: String,
    changes_dirs: Vec<Utf8PathBuf>,
    subject: Option<String>,
    body: Option<String>,
) -> Result<()> {
    let repo = env.archive()?;
    let dirs = if changes_dirs.is_empty() {
        env.tree.default_change_dirs()
    } else {
        changes_dirs
    };
    let mut opts = UnionOptions::new(dirs, branch);
    opts.subject = subject.unwrap_or_default();
    opts.body = body.unwrap_or_default();
    let checksum = union::union(&repo, env.tree.root(), &opts)?;
    println!("{checksum}");
    Ok(())
}

async fn deploy(env: &Env, rev: String, remote: RemoteOpts) -> Result<()> {
    let repo = env.archive()?;
    let checksum = repo
        .resolve_rev(&rev)
        .with_context(|| format!("Resolving {rev}"))?;
    let config = remote.deploy_config(&env.config);
    let host = &remote.device.remote_host;
    let report = workflow::deploy_commit(repo.path(), &checksum, host, &config).await?;
    report_deploy(report.reboot);
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Cli::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(cli: Cli) -> Result<()> {
    let env = Env::new(&cli.global)?;
    match cli.opt {
        Opt::Images(opts) => images(&env, opts).await,
        Opt::Dt(opts) => dt(&env, opts),
        Opt::Dto(opts) => dto(&env, opts).await,
        Opt::Kernel(opts) => kernel(&env, opts),
        Opt::Union {
            branch,
            changes_dirs,
            subject,
            body,
        } => union_cmd(&env, branch, changes_dirs, subject, body),
        Opt::Deploy { rev, remote } => deploy(&env, rev, remote).await,
    }
}

#[test]
fn test_parse_dto_args() {
    let c = Cli::try_parse_from([
        "tcbuilder",
        "--storage-directory",
        "/work/storage",
        "dto",
        "apply",
        "--include-dir",
        "a",
        "--include-dir",
        "b",
        "overlays/hdmi.dts",
    ])
    .unwrap();
    assert_eq!(c.global.storage_directory.as_deref(), Some(Utf8Path::new("/work/storage")));
    let Opt::Dto(DtoOpts::Apply {
        overlay,
        include_dirs,
        force,
        ..
    }) = c.opt
    else {
        panic!("Expected dto apply, not {:?}", c.opt);
    };
    assert_eq!(overlay, "overlays/hdmi.dts");
    assert_eq!(include_dirs, ["a", "b"]);
    assert!(!force);

    // Exactly one of an overlay name or --all
    assert!(Cli::try_parse_from(["tcbuilder", "dto", "remove"]).is_err());
    assert!(Cli::try_parse_from(["tcbuilder", "dto", "remove", "x.dtbo", "--all"]).is_err());
    assert!(Cli::try_parse_from(["tcbuilder", "dto", "remove", "--all"]).is_ok());
}

#[test]
fn test_parse_deploy_args() {
    let c = Cli::try_parse_from([
        "tcbuilder",
        "dto",
        "deploy",
        "--remote-host",
        "verdin-imx8mm-06827728",
        "--mdns-source",
        "192.168.1.10",
        "--reboot",
        "--clear",
        "a.dts",
        "b.dts",
    ])
    .unwrap();
    let Opt::Dto(DtoOpts::Deploy {
        overlays,
        remote,
        clear,
        ..
    }) = c.opt
    else {
        panic!("Expected dto deploy, not {:?}", c.opt);
    };
    assert_eq!(overlays, ["a.dts", "b.dts"]);
    assert!(clear);
    assert!(remote.reboot);
    assert_eq!(remote.device.mdns_source, Some(Ipv4Addr::new(192, 168, 1, 10)));

    let cfg = remote.deploy_config(&Config::default());
    assert_eq!(cfg.ssh.username, "torizon");
    assert_eq!(cfg.serve_port, 8080);

    // The remote host is mandatory
    assert!(Cli::try_parse_from(["tcbuilder", "deploy", "base"]).is_err());
}

#[test]
fn test_parse_download_and_kernel_args() {
    let c = Cli::try_parse_from([
        "tcbuilder",
        "images",
        "download",
        "--remote-host",
        "192.168.1.42",
        "--remove-storage",
    ])
    .unwrap();
    let Opt::Images(ImagesOpts::Download {
        device,
        download,
        remove_storage,
    }) = c.opt
    else {
        panic!("Expected images download, not {:?}", c.opt);
    };
    assert_eq!(device.remote_host, "192.168.1.42");
    assert_eq!(download.artifacts_url, download::ARTIFACTS_URL);
    assert_eq!(download.download_directory, ".");
    assert!(remove_storage);

    let c = Cli::try_parse_from([
        "tcbuilder",
        "kernel",
        "set_custom_args",
        "console=ttymxc0,115200",
        "quiet",
    ])
    .unwrap();
    let Opt::Kernel(KernelOpts::SetCustomArgs { kernel_args }) = c.opt else {
        panic!("Expected kernel set-custom-args, not {:?}", c.opt);
    };
    assert_eq!(kernel_args, ["console=ttymxc0,115200", "quiet"]);
    assert!(Cli::try_parse_from(["tcbuilder", "kernel", "set-custom-args"]).is_err());
    assert!(Cli::try_parse_from(["tcbuilder", "kernel", "clear-custom-args"]).is_ok());

    // A local image and keeping the unpacked one are exclusive
    assert!(Cli::try_parse_from([
        "tcbuilder",
        "dto",
        "deploy",
        "--remote-host",
        "d",
        "--image",
        "i.tar",
        "--no-download",
    ])
    .is_err());
}
