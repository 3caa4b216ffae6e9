// src/lib.rs

//! pkgsync Package Synchronization Client
//!
//! Keeps a directory of installed package files in sync with a remote
//! catalog. Each catalog entry is one opaque package file.
//!
//! # Architecture
//!
//! - Catalog: fetched from a primary or alternate mirror, cached on disk
//! - Reconciliation: tracked names vs catalog vs install directory
//! - Installer: atomic downloads whose mtime records the release date
//! - Control: command adapters guarded by a single command gate

pub mod catalog;
pub mod control;
mod error;
pub mod filesystem;
pub mod gate;
pub mod installer;
pub mod reconcile;
pub mod repository;
pub mod settings;

pub use error::{Error, Result};
