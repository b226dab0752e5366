//! Shared plumbing for cluster end-to-end suites.
//!
//! This crate provides:
//! - a wrapper around the cluster CLI (`oc` / `kubectl`) with user and admin
//!   identities
//! - manifest templates rendered with Handlebars and edited by JSON path
//! - bounded polling in the style of Eventually / Consistently
//! - a deferred cleanup stack for scenario teardown
//!
//! # Example
//!
//! ```ignore
//! use e2e_util::{E2eConfig, wait};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = E2eConfig::from_env("testdata/storage")?;
//!     let mut cli = config.cli();
//!     cli.setup_project().await?;
//!     let phase = cli
//!         .run("get")
//!         .args(["pvc", "my-pvc", "-o=jsonpath={.status.phase}"])
//!         .output()
//!         .await?;
//!     println!("{phase}");
//!     cli.teardown_project().await;
//!     Ok(())
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Error docs are carried by the E2eError variants
#![allow(clippy::missing_errors_doc)]

pub mod cleanup;
pub mod cli;
pub mod config;
pub mod error;
pub mod jsonpath;
pub mod random;
pub mod template;
pub mod wait;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cleanup::Cleanup;
pub use cli::{Cli, CommandOutput, CommandRunner, ProcessRunner};
pub use config::E2eConfig;
pub use error::{E2eError, E2eResult};
pub use jsonpath::JsonEdit;
pub use random::{random_num, random_string};
