//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Networking API surface for external integrations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Local RPC surface of the updater.
//!
//! Every method is served as `POST /<identity>/<Method>` on a loopback HTTP
//! listener. The same handler set is mounted once per configured identity so
//! callers that still use the legacy name keep working.

use std::fmt;
use std::str::FromStr;

pub mod client;
pub mod server;

pub use client::{ClientError, RpcClient};
pub use server::{spawn_rpc_server, ErrorBody, RpcError, RpcServer, RpcState};

/// Methods exposed on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcMethod {
    IsRunning,
    RunUpdate,
    ForceUpdate,
    RunPing,
    RunPingSync,
    State,
    SetAutoUpdate,
    IsAutoUpdateOn,
}

impl RpcMethod {
    pub const ALL: [RpcMethod; 8] = [
        RpcMethod::IsRunning,
        RpcMethod::RunUpdate,
        RpcMethod::ForceUpdate,
        RpcMethod::RunPing,
        RpcMethod::RunPingSync,
        RpcMethod::State,
        RpcMethod::SetAutoUpdate,
        RpcMethod::IsAutoUpdateOn,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::IsRunning => "IsRunning",
            Self::RunUpdate => "RunUpdate",
            Self::ForceUpdate => "ForceUpdate",
            Self::RunPing => "RunPing",
            Self::RunPingSync => "RunPingSync",
            Self::State => "State",
            Self::SetAutoUpdate => "SetAutoUpdate",
            Self::IsAutoUpdateOn => "IsAutoUpdateOn",
        }
    }
}

impl fmt::Display for RpcMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RpcMethod {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|method| method.as_str() == value)
            .ok_or_else(|| format!("unknown method {value}"))
    }
}

/// Fully qualified error name, `<identity>.<Method>`.
pub fn error_name(identity: &str, method: &str) -> String {
    format!("{identity}.{method}")
}
