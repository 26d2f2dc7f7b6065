//! # Customizing OSTree based images for embedded devices
//!
//! This crate unpacks a base image into a storage directory, stages device
//! tree and overlay changes on top of it, unions those changes into new
//! OSTree commits and deploys them to a device over ssh.

// See https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]
#![forbid(unused_must_use)]
#![deny(unsafe_code)]
#![deny(clippy::dbg_macro)]
#![deny(clippy::todo)]

pub mod bootabletree;
pub mod cli;
pub mod config;
pub mod dt;
pub mod dtc;
pub mod download;
mod error;
pub mod fdt;
pub mod images;
pub mod kernel;
pub mod mdns;
pub mod overlay;
pub mod overlay_store;
pub mod remote;
pub mod repo;
pub mod resolve;
pub mod serve;
pub mod storage;
pub mod union;
pub mod workflow;

#[cfg(test)]
mod fixture;

pub use error::{Error, ErrorKind, Result};
