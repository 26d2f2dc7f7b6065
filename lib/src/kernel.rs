//! # Custom kernel arguments
//!
//! Extra kernel arguments are carried by a device tree overlay setting the
//! `bootargs_custom` property of `/chosen`; the boot script of images that
//! support it appends the property to the kernel command line. Setting the
//! arguments is therefore an overlay apply, and clearing them an overlay
//! removal, both in the device tree change layer.

use camino::Utf8Path;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::bootabletree::current_uenv;
use crate::dtc::{DeviceTreeCompiler, OverlayTester};
use crate::error::{Error, Result};
use crate::fdt;
use crate::overlay::{ApplyOptions, OverlayApplier};
use crate::overlay_store::OverlayStore;
use crate::storage::WorkingTree;

/// Source name of the overlay; the boot script expects the matching blob.
const CUSTOM_KARGS_SOURCE: &str = "custom-kargs_overlay.dts";
/// The overlay blob carrying the arguments.
pub const CUSTOM_KARGS_OVERLAY: &str = "custom-kargs_overlay.dtbo";
const CUSTOM_KARGS_NODE: &str = "/fragment@0/__overlay__";
const CUSTOM_KARGS_PROPERTY: &str = "bootargs_custom";

/// The boot script function consuming `bootargs_custom`.
static UENV_CUSTOM_KARGS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*set_bootargs_custom=").unwrap());

/// The overlay source setting `kargs`.
pub fn render_overlay(kargs: &str) -> String {
    let escaped = kargs.replace('\\', "\\\\").replace('"', "\\\"");
    format!(
        "/dts-v1/;\n/plugin/;\n\n&{{/chosen}} {{\n    {CUSTOM_KARGS_PROPERTY} = \"{escaped}\";\n}};\n"
    )
}

/// Manages the custom kernel arguments of a working tree.
#[derive(Debug)]
pub struct KernelArgs<'a> {
    tree: &'a WorkingTree,
    applier: OverlayApplier<'a>,
}

impl<'a> KernelArgs<'a> {
    /// Manage the arguments of `tree`, compiling with `compiler`.
    pub fn new(
        tree: &'a WorkingTree,
        compiler: &'a dyn DeviceTreeCompiler,
        tester: &'a dyn OverlayTester,
    ) -> Self {
        Self {
            tree,
            applier: OverlayApplier::new(tree, compiler, tester),
        }
    }

    fn require_support(&self) -> Result<()> {
        self.tree.require_dt_capable()?;
        let supported = current_uenv(self.tree)?
            .is_some_and(|uenv| UENV_CUSTOM_KARGS.is_match(&uenv));
        if !supported {
            return Err(Error::InvalidOperation(
                "the image being customized does not support custom kernel arguments; \
                 please update it to a newer release"
                    .into(),
            ));
        }
        Ok(())
    }

    /// Replace the custom arguments with `args`, joined by spaces.
    pub fn set<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let kargs = args
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(" ");
        if kargs.trim().is_empty() {
            return Err(Error::InvalidOperation(
                "please pass a valid string for the custom kernel arguments".into(),
            ));
        }
        self.require_support()?;

        let td = tempfile::Builder::new()
            .prefix(".tcbuilder-kargs-")
            .tempdir_in(self.tree.root())?;
        let Some(td_path) = Utf8Path::from_path(td.path()) else {
            return Err(Error::InvalidOperation(format!(
                "non UTF-8 temporary path: {}",
                td.path().display()
            )));
        };
        let source = td_path.join(CUSTOM_KARGS_SOURCE);
        std::fs::write(&source, render_overlay(&kargs)).map_err(Error::io_at(&source))?;
        // The source includes nothing and cannot conflict with anything
        let opts = ApplyOptions {
            allow_reapply: true,
            test_apply: false,
            ..Default::default()
        };
        self.applier.apply(&source, &opts)?;
        tracing::info!("Kernel custom arguments successfully configured with \"{kargs}\"");
        Ok(kargs)
    }

    /// The configured custom arguments, if any.
    pub fn get(&self) -> Result<Option<String>> {
        self.require_support()?;
        let store = OverlayStore::open(self.tree)?;
        if !store
            .list_applied()?
            .iter()
            .any(|o| o == CUSTOM_KARGS_OVERLAY)
        {
            tracing::debug!("No custom kernel arguments configured");
            return Ok(None);
        }
        let path = store.find_blob_path(CUSTOM_KARGS_OVERLAY)?;
        tracing::debug!("Custom arguments overlay is applied: {path}");
        let blob = std::fs::read(&path).map_err(Error::io_at(&path))?;
        let value = fdt::property(&blob, CUSTOM_KARGS_NODE, CUSTOM_KARGS_PROPERTY)?
            .ok_or_else(|| Error::Malformed {
                what: "custom kernel arguments overlay",
                detail: format!("{path} has no {CUSTOM_KARGS_PROPERTY} property"),
            })?;
        Ok(Some(fdt::string_value(value)))
    }

    /// Drop the custom arguments, returning whether any were set.
    pub fn clear(&self) -> Result<bool> {
        self.require_support()?;
        let removed = self.applier.remove(CUSTOM_KARGS_OVERLAY, false)?;
        if removed {
            tracing::info!("Custom kernel arguments successfully cleared");
        } else {
            tracing::info!("No custom kernel arguments configured");
        }
        Ok(removed)
    }
}
