//! # etude-core
//!
//! Static-file HTTP/1.1 server built on an edge-triggered, one-shot epoll loop.
//! The loop thread accepts and reads; a bounded worker pool parses requests,
//! maps files and writes responses with `writev`.
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod metrics;
pub mod parser;
pub mod pool;
pub mod resource;
pub mod server;
pub mod slab;
pub mod syscalls;

pub use config::ServerConfig;
pub use conn::{Conn, ServeContext, Verdict};
pub use error::{EtudeError, EtudeResult};
pub use http::{Method, Status};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use parser::RequestParser;
pub use pool::{Job, SubmitError, ThreadPool};
pub use resource::{DocumentRoot, MappedFile};
pub use server::Server;
pub use slab::{ConnId, ConnectionSlab};
