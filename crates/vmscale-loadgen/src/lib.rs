//! vmscale-loadgen: talking to the load generator.
//!
//! The load generator exposes a plain-text HTTP control surface. Tests are
//! started with a GET, and their progress is published as an append-only
//! INI-style log that has to be polled.
//!
//! # Architecture
//!
//! ```text
//! LoadGenClient
//!   ├── http_get() → RpcError (every transport failure is retryable)
//!   ├── retry_until() for start / warmup / add-target calls
//!   └── TestLogPoller
//!       ├── GET /log?name=test.<id>.log
//!       ├── persist raw body to <log_dir>/test.<id>.log
//!       └── StatusArtifact::parse() → finished flag, current rps
//! ```

pub mod artifact;
pub mod client;
pub mod poller;
pub mod rpc;

pub use artifact::{ArtifactError, StatusArtifact, TestId};
pub use client::LoadGenClient;
pub use poller::{ParsedLog, PollError, TestLogPoller};
pub use rpc::{RpcError, http_get};
