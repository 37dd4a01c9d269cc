//! virtualization-mcp: an MCP server exposing a typed, portmanteau-tool API
//! over Oracle VirtualBox's `VBoxManage`.
//!
//! Five tools (`vm_management`, `network_management`, `storage_management`,
//! `snapshot_management`, `system_management`) fan out to 80+ actions via a
//! required `action` discriminator; five meta-tools (`job_get`, `job_list`,
//! `job_cancel`, `session_get`, `session_end`) expose long-running job
//! tracking and session bookkeeping.

pub mod adapter;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod locks;
pub mod mcp;
pub mod model;
pub mod pool;
pub mod session;

pub use error::{Error, Result};

pub mod prelude {
    pub use crate::adapter::{Adapter, FakeAdapter, VBoxManageAdapter};
    pub use crate::config::Config;
    pub use crate::context::AppContext;
    pub use crate::dispatch::{dispatch, Response};
    pub use crate::error::{Error, ErrorKind, Result};
}
