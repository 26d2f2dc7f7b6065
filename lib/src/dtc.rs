//! The device tree toolchain: compiling sources into blobs and checking
//! that overlays apply on top of a base device tree.

use camino::{Utf8Path, Utf8PathBuf};
use tcbuilder_utils::Task;

use crate::error::{Error, Result};

/// Compiles device tree (overlay) sources into blobs.
pub trait DeviceTreeCompiler {
    /// Compile `source` into `output`, resolving `#include` directives
    /// against `include_dirs`.
    fn compile(
        &self,
        source: &Utf8Path,
        include_dirs: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> Result<()>;
}

/// Applies overlay blobs onto a base device tree blob.
pub trait OverlayTester {
    /// Apply `overlays` in order on top of `base`, writing the merged blob to
    /// `output`. Fails with [`Error::NotApplicable`] if any of them does not apply.
    fn try_apply(&self, base: &Utf8Path, overlays: &[Utf8PathBuf], output: &Utf8Path)
        -> Result<()>;
}

/// The `cpp` + `dtc` + `fdtoverlay` toolchain.
#[derive(Debug, Default, Clone, Copy)]
pub struct Dtc;

fn file_name(p: &Utf8Path) -> &str {
    p.file_name().unwrap_or(p.as_str())
}

impl DeviceTreeCompiler for Dtc {
    fn compile(
        &self,
        source: &Utf8Path,
        include_dirs: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> Result<()> {
        let compile_err = |e: anyhow::Error| Error::Compile {
            path: source.to_owned(),
            detail: format!("{e:#}"),
        };
        let preprocessed = tempfile::Builder::new()
            .prefix("tcbuilder-")
            .suffix(".dts")
            .tempfile()?;
        let Some(preprocessed_path) = Utf8Path::from_path(preprocessed.path()) else {
            return Err(Error::InvalidOperation(format!(
                "non UTF-8 temporary path: {}",
                preprocessed.path().display()
            )));
        };

        let mut cpp = Task::new(format!("Preprocessing {}", file_name(source)), "cpp")
            .quiet()
            .args(["-nostdinc", "-undef", "-x", "assembler-with-cpp"]);
        for d in include_dirs {
            cpp = cpp.args(["-I", d.as_str()]);
        }
        cpp.args([source.as_str(), "-o", preprocessed_path.as_str()])
            .run()
            .map_err(compile_err)?;

        // Includes of the source's own directory, for /include/ directives
        let srcdir = source.parent().unwrap_or(Utf8Path::new("."));
        Task::new(format!("Compiling {}", file_name(source)), "dtc")
            .quiet()
            .args(["-@", "-I", "dts", "-O", "dtb", "-i", srcdir.as_str()])
            .args(["-o", output.as_str(), preprocessed_path.as_str()])
            .run()
            .map_err(compile_err)?;
        Ok(())
    }
}

impl OverlayTester for Dtc {
    fn try_apply(
        &self,
        base: &Utf8Path,
        overlays: &[Utf8PathBuf],
        output: &Utf8Path,
    ) -> Result<()> {
        Task::new(
            format!("Testing overlays on top of {}", file_name(base)),
            "fdtoverlay",
        )
        .quiet()
        .args(["-i", base.as_str(), "-o", output.as_str()])
        .args(overlays.iter().map(|o| o.as_str()))
        .run()
        .map_err(|e| Error::NotApplicable {
            overlay: overlays
                .iter()
                .map(|o| file_name(o))
                .collect::<Vec<_>>()
                .join(" "),
            device_tree: file_name(base).to_owned(),
            detail: format!("{e:#}"),
        })
    }
}
