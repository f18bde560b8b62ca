//! Multi-instance TFTP file server
//!
//! Serves downloads from, and accepts uploads into, a directory root per
//! named server. The wire protocol lives in the [`tftp`] crate; this crate
//! provides what sits on top of it:
//!
//! - [`App`]: provisions instances from an [`AppConfig`], starts them
//!   together and stops them together
//! - [`ServerInstance`]: one root on one UDP port
//! - [`FileHandler`]: the read/write callbacks, with access logging
//! - [`safe_path`] and [`resolve_path`]: confinement of client filenames to a root
//!
//! # Example
//!
//! ```rust,no_run
//! use tftpd::{App, AppConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::from_json(r#"{"servers": {"boot": {"listen": ":6969", "logs": true}}}"#)?
//!         .with_default_root(std::path::Path::new("/srv/tftp"));
//!
//!     let mut app = App::provision(&config)?;
//!     app.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     app.stop().await?;
//!     Ok(())
//! }
//! ```

mod address;
mod app;
mod config;
mod error;
mod handler;
mod instance;
mod path;

pub use address::{DEFAULT_NETWORK, DEFAULT_PORT, NetworkAddress};
pub use app::App;
pub use config::{AppConfig, DEFAULT_TIMEOUT, ServerConfig};
pub use error::{Error, Result};
pub use handler::{ACCESS_LOG_TARGET, FileHandler};
pub use instance::{InstanceState, ServerInstance};
pub use path::{resolve_path, safe_path};
