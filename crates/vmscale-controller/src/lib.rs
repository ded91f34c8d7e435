//! vmscale-controller: the elastic capacity controller.
//!
//! Stands up the test infrastructure, drives a load test, grows and
//! shrinks the web-service fleet from the throughput the load generator
//! reports, and tears everything down again.
//!
//! # Architecture
//!
//! ```text
//! ElasticController::run()
//!   ├── Provisioning
//!   │     ├── default network, security groups (idempotent by name)
//!   │     ├── load generator instance
//!   │     ├── target group + load balancer + listener   (balanced mode)
//!   │     ├── CPU alarms                                 (when enabled)
//!   │     └── initial web services, registered
//!   ├── WarmingUp   GET /warmup → wait for "Test finished"  (balanced mode)
//!   ├── Testing
//!   │     ├── GET /autoscaling or /test/horizontal → test id
//!   │     └── loop: poll log → Autoscaler::evaluate → scale out / in
//!   ├── Draining    teardown(), best effort, leftovers reported
//!   └── Terminated
//! ```
//!
//! A stop flag raised by the operator is honoured at every iteration
//! boundary and while sleeping between retries. Teardown runs regardless.

pub mod controller;
pub mod error;
pub mod phase;
pub mod teardown;

pub use controller::{ElasticController, RunReport, TestSummary};
pub use error::{ControllerError, ControllerResult};
pub use phase::ControllerPhase;
pub use teardown::{Leftover, TeardownReport, teardown};
