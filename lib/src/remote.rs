//! # Deploying a commit to a device
//!
//! The device pulls the commit from us: the archive repository is served
//! over HTTP, the device is told (over ssh) to add it as an OSTree remote,
//! pull the commit and deploy it. `ostree admin deploy` switches the
//! deployment atomically; we only report success once the device lists the
//! new commit as its first deployment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tcbuilder_utils::{shell_join, shell_quote, Task};

use crate::error::{Error, Result};
use crate::resolve::{AddressResolver, Resolved, ResolverConfig};
use crate::serve::RepoServer;

/// Name of the OSTree remote configured on the device.
pub const DEVICE_REMOTE: &str = "tcbuilder";
/// Default user on Torizon devices.
pub const DEFAULT_USERNAME: &str = "torizon";
/// Default ssh port.
pub const DEFAULT_SSH_PORT: u16 = 22;
/// Default port of the HTTP server the device pulls from.
pub const DEFAULT_SERVE_PORT: u16 = 8080;

/// How to log into the device.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Login user.
    pub username: String,
    /// Password for ssh and sudo; key based login if unset.
    pub password: Option<String>,
    /// ssh port.
    pub port: u16,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            username: DEFAULT_USERNAME.to_owned(),
            password: None,
            port: DEFAULT_SSH_PORT,
        }
    }
}

/// Everything needed to deploy to a device.
#[derive(Debug, Clone, Default)]
pub struct DeployConfig {
    /// Login settings.
    pub ssh: SshConfig,
    /// Host name resolution settings.
    pub resolver: ResolverConfig,
    /// Port to serve the repository on; 0 picks a free one.
    pub serve_port: u16,
    /// Reboot the device once the new deployment is in place.
    pub reboot: bool,
}

/// A shell on the device.
pub trait RemoteSession: Send + Sync + 'static {
    /// Run `cmd` with the login shell, feeding `stdin` if given, and return
    /// its output. A non-zero exit is a [`Error::Transport`].
    fn run(&self, cmd: &str, stdin: Option<&str>) -> Result<String>;
}

/// A session driven by the OpenSSH client, one connection per command.
#[derive(Debug, Clone)]
pub struct SshSession {
    host: String,
    config: SshConfig,
}

impl SshSession {
    /// A session to `host` (an address or name ssh can resolve).
    pub fn new(host: impl Into<String>, config: SshConfig) -> Self {
        Self {
            host: host.into(),
            config,
        }
    }

    fn task(&self, cmd: &str) -> Task {
        let description = format!("Running on {}: {cmd}", self.host);
        let t = match &self.config.password {
            Some(pw) => Task::new(description, "sshpass")
                .env("SSHPASS", pw)
                .args(["-e", "ssh"]),
            None => Task::new(description, "ssh").args(["-o", "BatchMode=yes"]),
        };
        t.quiet()
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "LogLevel=ERROR",
                "-p",
            ])
            .args([self.config.port.to_string()])
            .args([format!("{}@{}", self.config.username, self.host), cmd.to_owned()])
    }
}

impl RemoteSession for SshSession {
    fn run(&self, cmd: &str, stdin: Option<&str>) -> Result<String> {
        self.task(cmd)
            .read_with_stdin(stdin.map(str::as_bytes))
            .map_err(|e| Error::Transport(format!("{e:#}")))
    }
}

/// Progress of a remote deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The device name was resolved.
    Resolved(Resolved),
    /// The repository is being served at this URL.
    Serving(String),
    /// The device knows the repository as a remote.
    RemoteConfigured,
    /// The device is pulling the commit.
    Pulling(String),
    /// The device is deploying the commit.
    Deploying(String),
    /// The new deployment is in place.
    Deployed(String),
    /// A reboot was requested.
    Rebooting,
}

/// What happened about rebooting the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebootOutcome {
    /// No reboot was requested.
    NotRequested,
    /// The device accepted the reboot request.
    Requested,
    /// The reboot request failed; the deployment stays in place.
    Failed(String),
}

/// The result of a successful deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReport {
    /// The deployed commit.
    pub checksum: String,
    /// Whether the device reboots into it.
    pub reboot: RebootOutcome,
}

/// The client address of the ssh connection, as seen by the device.
pub(crate) fn parse_ssh_connection(s: &str) -> Result<IpAddr> {
    s.split_whitespace()
        .next()
        .and_then(|a| a.parse().ok())
        .ok_or_else(|| {
            Error::Transport(format!(
                "cannot determine our address from SSH_CONNECTION \"{}\"",
                s.trim()
            ))
        })
}

/// The checksum of the first (default) deployment in `ostree admin status`.
pub(crate) fn parse_admin_status(s: &str) -> Option<String> {
    s.lines()
        .filter_map(|l| l.strip_prefix("* ").or_else(|| l.strip_prefix("  ")))
        .filter(|l| !l.starts_with(char::is_whitespace))
        .filter_map(|l| l.split_whitespace().nth(1))
        .filter_map(|id| id.split_once('.').map(|(csum, _)| csum.to_owned()))
        .next()
}

fn sudo(cmd: &str, password: Option<&str>) -> (String, Option<String>) {
    let inner = shell_quote(cmd);
    match password {
        Some(pw) => (format!("sudo -S -p '' sh -c {inner}"), Some(format!("{pw}\n"))),
        None => (format!("sudo -n sh -c {inner}"), None),
    }
}

/// Deploys commits from a local archive repository to devices.
#[derive(Debug, Clone)]
pub struct RemoteDeployer {
    archive: Utf8PathBuf,
    serve_port: u16,
}

impl RemoteDeployer {
    /// Serve `archive` on `serve_port` while deploying.
    pub fn new(archive: &Utf8Path, serve_port: u16) -> Self {
        Self {
            archive: archive.to_owned(),
            serve_port,
        }
    }

    async fn run<S: RemoteSession>(
        session: &Arc<S>,
        cmd: String,
        stdin: Option<String>,
    ) -> Result<String> {
        let session = Arc::clone(session);
        tokio::task::spawn_blocking(move || session.run(&cmd, stdin.as_deref()))
            .await
            .map_err(|e| Error::InvariantViolation(format!("remote command task: {e}")))?
    }

    async fn run_sudo<S: RemoteSession>(
        session: &Arc<S>,
        cmd: &str,
        password: Option<&str>,
    ) -> Result<String> {
        let (cmd, stdin) = sudo(cmd, password);
        Self::run(session, cmd, stdin).await
    }

    /// Make the device pull and deploy `checksum`, optionally rebooting it.
    pub async fn deploy<S: RemoteSession>(
        &self,
        session: Arc<S>,
        checksum: &str,
        password: Option<&str>,
        reboot: bool,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<DeployReport> {
        let conn = Self::run(&session, "echo $SSH_CONNECTION".into(), None).await?;
        let local = parse_ssh_connection(&conn)?;

        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.serve_port);
        let server = RepoServer::start(&self.archive, bind)?;
        let url = format!("http://{}/", SocketAddr::new(local, server.port()));
        progress(ProgressEvent::Serving(url.clone()));
        tracing::info!("Serving {} at {url}", self.archive);

        let r = self
            .pull_and_deploy(&session, &url, checksum, password, progress)
            .await;
        let stopped = server.stop().await;
        r?;
        stopped?;
        progress(ProgressEvent::Deployed(checksum.to_owned()));
        tracing::info!("Deployment of {checksum} succeeded");

        let reboot = if reboot {
            progress(ProgressEvent::Rebooting);
            let cmd = "nohup sh -c 'sleep 1 && reboot' >/dev/null 2>&1 &";
            match Self::run_sudo(&session, cmd, password).await {
                Ok(_) => {
                    tracing::info!("Rebooting device");
                    RebootOutcome::Requested
                }
                Err(e) => {
                    tracing::warn!("Requesting reboot failed: {e}");
                    RebootOutcome::Failed(e.to_string())
                }
            }
        } else {
            tracing::info!("Please reboot the device to boot into the new deployment");
            RebootOutcome::NotRequested
        };
        Ok(DeployReport {
            checksum: checksum.to_owned(),
            reboot,
        })
    }

    async fn pull_and_deploy<S: RemoteSession>(
        &self,
        session: &Arc<S>,
        url: &str,
        checksum: &str,
        password: Option<&str>,
        progress: &mut dyn FnMut(ProgressEvent),
    ) -> Result<()> {
        let add = shell_join([
            "ostree",
            "remote",
            "add",
            "--no-gpg-verify",
            "--force",
            DEVICE_REMOTE,
            url,
        ]);
        Self::run_sudo(session, &add, password).await?;
        progress(ProgressEvent::RemoteConfigured);

        progress(ProgressEvent::Pulling(checksum.to_owned()));
        tracing::info!("Pulling {checksum} on the device");
        let pull = shell_join(["ostree", "pull", DEVICE_REMOTE, checksum]);
        Self::run_sudo(session, &pull, password).await?;

        progress(ProgressEvent::Deploying(checksum.to_owned()));
        tracing::info!("Deploying {checksum}");
        let deploy = shell_join(["ostree", "admin", "deploy", "--karg-proc-cmdline", checksum]);
        Self::run_sudo(session, &deploy, password).await?;

        let status = Self::run(session, "ostree admin status".into(), None).await?;
        match parse_admin_status(&status) {
            Some(c) if c == checksum => Ok(()),
            Some(c) => Err(Error::Transport(format!(
                "device did not deploy {checksum}; its default deployment is {c}"
            ))),
            None => Err(Error::Transport(format!(
                "cannot parse the device deployment status:\n{status}"
            ))),
        }
    }
}

/// Resolve `host` and open a session to it.
pub async fn connect(host: &str, config: &DeployConfig) -> Result<(Resolved, Arc<SshSession>)> {
    let resolved = AddressResolver::new(config.resolver.clone())
        .resolve(host)
        .await?;
    if resolved.used_mdns {
        tracing::info!("Resolved {host} to {} using mDNS", resolved.address);
    }
    let session = Arc::new(SshSession::new(
        resolved.address.to_string(),
        config.ssh.clone(),
    ));
    Ok((resolved, session))
}

/// Resolve `host` and deploy `checksum` from `archive` to it.
pub async fn deploy_to_host(
    archive: &Utf8Path,
    host: &str,
    checksum: &str,
    config: &DeployConfig,
    progress: &mut dyn FnMut(ProgressEvent),
) -> Result<DeployReport> {
    let (resolved, session) = connect(host, config).await?;
    progress(ProgressEvent::Resolved(resolved));
    RemoteDeployer::new(archive, config.serve_port)
        .deploy(
            session,
            checksum,
            config.ssh.password.as_deref(),
            config.reboot,
            progress,
        )
        .await
}
