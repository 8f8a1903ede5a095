// src/lib.rs
pub mod buffer;
pub mod config;
pub mod conn;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod server;
pub mod stats;
pub mod syscalls;
pub mod workers;

// Re-exports for users
pub use config::{ListenAddr, ServerConfig};
pub use conn::{Connection, HttpState};
pub use control::Control;
pub use error::{VaranError, VaranResult};
pub use handler::{Handler, Method, Outcome, Task};
pub use server::{Server, ShutdownHandle};

pub const SERVER_NAME: &str = "varan";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
