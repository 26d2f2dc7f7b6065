//! # Downloading the image a device runs
//!
//! The device is asked over ssh what it runs; from its `/etc/os-release`,
//! host name and container engine we derive the location of the matching
//! Easy Installer image in the artifact repository and fetch it.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::remote::RemoteSession;

/// Where released and prerelease images are published.
pub const ARTIFACTS_URL: &str = "https://artifacts.toradex.com/artifactory";

/// Yocto release series by code name.
const YOCTO_SERIES: &[(&str, &str)] = &[("dunfell", "dunfell-5.x.y"), ("kirkstone", "kirkstone-6.x.y")];

static BUILD_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r".*-(.*?)\+").unwrap());
static BUILD_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"build\.(\S+)\s").unwrap());
static SEMVER: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.\d+\.\d+)").unwrap());

/// What a device tells about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// `PRETTY_NAME` of `/etc/os-release`.
    pub version: String,
    /// The device host name, `<module>-<serial>`.
    pub hostname: String,
    /// `podman` or `docker`.
    pub container: String,
}

fn malformed(detail: impl Into<String>) -> Error {
    Error::Malformed {
        what: "device information",
        detail: detail.into(),
    }
}

/// The value of `key` in an os-release file.
pub fn os_release_value<'a>(contents: &'a str, key: &str) -> Option<&'a str> {
    contents.lines().find_map(|l| {
        let (k, v) = l.trim().split_once('=')?;
        (k == key).then(|| v.trim_matches(|c| c == '"' || c == '\''))
    })
}

/// Ask the device what it runs.
pub async fn device_info<S: RemoteSession>(session: Arc<S>) -> Result<DeviceInfo> {
    tokio::task::spawn_blocking(move || {
        let os_release = session.run("cat /etc/os-release", None)?;
        let version = os_release_value(&os_release, "PRETTY_NAME")
            .ok_or_else(|| malformed("no PRETTY_NAME in /etc/os-release"))?
            .to_owned();
        let hostname = session.run("cat /etc/hostname", None)?.trim().to_owned();
        let container = session
            .run(
                "if test -e /usr/bin/podman; then echo podman; else echo docker; fi",
                None,
            )?
            .trim()
            .to_owned();
        Ok(DeviceInfo {
            version,
            hostname,
            container,
        })
    })
    .await
    .map_err(|e| Error::InvariantViolation(format!("remote command task: {e}")))?
}

/// Location of the Easy Installer image matching `info` under `base`.
pub fn image_url(base: &str, info: &DeviceInfo) -> Result<String> {
    let version = info.version.as_str();
    let (prod, devel) = if version.contains("devel") {
        ("torizoncore-oe-prerelease-frankfurt", "-devel-")
    } else {
        ("torizoncore-oe-prod-frankfurt", "")
    };
    let yocto = YOCTO_SERIES
        .iter()
        .find(|(k, _)| version.contains(k))
        .map(|(_, v)| *v)
        .ok_or_else(|| malformed(format!("unknown release series in {version:?}")))?;
    let (build_type, date) = match BUILD_DATE.captures(version).and_then(|c| c.get(1)) {
        None => ("release", ""),
        Some(d) if d.len() == 6 => ("monthly", d.as_str()),
        Some(d) if d.len() == 8 => ("nightly", d.as_str()),
        Some(d) => {
            return Err(malformed(format!(
                "unexpected build date {:?} in {version:?}",
                d.as_str()
            )))
        }
    };
    let build_number = BUILD_NUMBER
        .captures(version)
        .and_then(|c| c.get(1))
        .ok_or_else(|| malformed(format!("no build number in {version:?}")))?
        .as_str();
    let kernel_type = if version.contains("Upstream") {
        "-upstream"
    } else {
        ""
    };
    let rt = if version.contains("PREEMPT") { "-rt" } else { "" };
    let semver = SEMVER
        .captures(version)
        .and_then(|c| c.get(1))
        .ok_or_else(|| malformed(format!("no version number in {version:?}")))?
        .as_str();
    let module = info
        .hostname
        .rsplit_once('-')
        .map(|(m, _serial)| m)
        .ok_or_else(|| malformed(format!("unexpected host name {:?}", info.hostname)))?;
    let container = &info.container;
    Ok(format!(
        "{base}/{prod}/{yocto}/{build_type}/{build_number}/{module}/\
         torizon{kernel_type}{rt}/torizon-core-{container}/oedeploy/\
         torizon-core-{container}{rt}-{module}-Tezi_{semver}{devel}{date}+build.{build_number}.tar"
    ))
}

/// Download `url` into `dest_dir`, returning the path of the file.
pub async fn fetch(url: &str, dest_dir: &Utf8Path) -> Result<Utf8PathBuf> {
    let name = url
        .rsplit('/')
        .next()
        .filter(|n| !n.is_empty())
        .ok_or_else(|| Error::InvalidOperation(format!("no file name in {url}")))?;
    let target = dest_dir.join(name);
    let partial = dest_dir.join(format!(".{name}.partial"));

    tracing::info!("Downloading image from: {url}");
    tracing::info!("The download may take some time. Please wait...");
    let transport = |e: reqwest::Error| Error::Transport(format!("downloading {url}: {e}"));
    let mut response = reqwest::get(url).await.map_err(transport)?;
    if !response.status().is_success() {
        return Err(Error::not_found(
            "image in the artifact repository",
            format!("{url} (HTTP {})", response.status()),
        ));
    }
    let mut f = tokio::fs::File::create(&partial)
        .await
        .map_err(Error::io_at(&partial))?;
    let r = async {
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            f.write_all(&chunk).await.map_err(Error::io_at(&partial))?;
        }
        f.flush().await.map_err(Error::io_at(&partial))?;
        Ok(())
    }
    .await;
    if let Err(e) = r {
        let _ = tokio::fs::remove_file(&partial).await;
        return Err(e);
    }
    tokio::fs::rename(&partial, &target)
        .await
        .map_err(Error::io_at(&target))?;
    tracing::info!("Download complete: {target}");
    Ok(target)
}

/// Download the image `session`'s device runs into `dest_dir`.
pub async fn download_matching_image<S: RemoteSession>(
    session: Arc<S>,
    base: &str,
    dest_dir: &Utf8Path,
) -> Result<Utf8PathBuf> {
    let info = device_info(session).await?;
    tracing::debug!("Device runs {info:?}");
    let url = image_url(base, &info)?;
    fetch(&url, dest_dir).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::FakeSession;
    use crate::serve::RepoServer;
    use indoc::indoc;
    use std::net::{Ipv4Addr, SocketAddr};

    fn info(version: &str) -> DeviceInfo {
        DeviceInfo {
            version: version.into(),
            hostname: "verdin-imx8mm-06827728".into(),
            container: "docker".into(),
        }
    }

    #[test]
    fn test_os_release_value() {
        let s = indoc! {r#"
            ID=torizon
            NAME="TorizonCore"
            PRETTY_NAME="TorizonCore 5.7.0+build.17 (dunfell)"
        "#};
        assert_eq!(
            os_release_value(s, "PRETTY_NAME"),
            Some("TorizonCore 5.7.0+build.17 (dunfell)")
        );
        assert_eq!(os_release_value(s, "ID"), Some("torizon"));
        assert_eq!(os_release_value(s, "VERSION"), None);
    }

    #[test]
    fn test_release_url() {
        let url = image_url(ARTIFACTS_URL, &info("TorizonCore 5.7.0+build.17 (dunfell)")).unwrap();
        assert_eq!(
            url,
            "https://artifacts.toradex.com/artifactory/torizoncore-oe-prod-frankfurt/\
             dunfell-5.x.y/release/17/verdin-imx8mm/torizon/torizon-core-docker/oedeploy/\
             torizon-core-docker-verdin-imx8mm-Tezi_5.7.0+build.17.tar"
        );
    }

    #[test]
    fn test_nightly_rt_url() {
        let i = DeviceInfo {
            container: "podman".into(),
            ..info("Torizon 6.4.0-devel-20230801+build.3 (kirkstone) PREEMPT")
        };
        let url = image_url("http://mirror", &i).unwrap();
        assert_eq!(
            url,
            "http://mirror/torizoncore-oe-prerelease-frankfurt/kirkstone-6.x.y/nightly/3/\
             verdin-imx8mm/torizon-rt/torizon-core-podman/oedeploy/\
             torizon-core-podman-rt-verdin-imx8mm-Tezi_6.4.0-devel-20230801+build.3.tar"
        );
    }

    #[test]
    fn test_unknown_series() {
        let e = image_url(ARTIFACTS_URL, &info("Poky 4.0.1+build.1 (honister)")).unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::Malformed);
    }

    #[tokio::test]
    async fn test_device_info() {
        let session = Arc::new(FakeSession::new([
            (
                "os-release",
                Ok("NAME=\"TorizonCore\"\nPRETTY_NAME=\"TorizonCore 5.7.0+build.17 (dunfell)\"\n"
                    .into()),
            ),
            ("hostname", Ok("verdin-imx8mm-06827728\n".into())),
            ("podman", Ok("podman\n".into())),
        ]));
        let i = device_info(session).await.unwrap();
        assert_eq!(i.version, "TorizonCore 5.7.0+build.17 (dunfell)");
        assert_eq!(i.hostname, "verdin-imx8mm-06827728");
        assert_eq!(i.container, "podman");
    }

    #[tokio::test]
    async fn test_fetch() {
        let td = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let served = root.join("served");
        let dest = root.join("dest");
        std::fs::create_dir_all(&served).unwrap();
        std::fs::create_dir_all(&dest).unwrap();
        std::fs::write(served.join("image.tar"), "not really a tarball").unwrap();

        let server =
            RepoServer::start(&served, SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        let base = format!("http://{}", server.local_addr());
        let p = fetch(&format!("{base}/image.tar"), &dest).await.unwrap();
        assert_eq!(p, dest.join("image.tar"));
        assert_eq!(std::fs::read_to_string(&p).unwrap(), "not really a tarball");

        let e = fetch(&format!("{base}/missing.tar"), &dest).await.unwrap_err();
        assert_eq!(e.kind(), crate::ErrorKind::NotFound);
        assert!(!dest.join(".missing.tar.partial").exists());
        server.stop().await.unwrap();
    }
}
