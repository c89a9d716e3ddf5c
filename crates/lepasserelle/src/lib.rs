// lepasserelle - Bridge & CLI
//
// *La Passerelle* (The Bridge) - Wires ledeploy.toml to the system capabilities,
// the provisioners and the phase controller, and exposes the `ledeploy` CLI.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod bridge;
pub mod cli;
pub mod config;
pub mod errors;
pub mod liveness;

pub use bridge::{Capabilities, Deployment};
pub use config::DeployConfig;
pub use errors::{DeployError, Result};
pub use liveness::PsutilProbe;
