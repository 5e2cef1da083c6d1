//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Client for the loopback RPC surface."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use reqwest::StatusCode;
use salt_updater_common::RpcConfig;
use salt_updater_persistence::UpdateState;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::{ErrorBody, RpcMethod};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("unable to reach salt-updater: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{name}: {message}")]
    Remote {
        status: u16,
        name: String,
        message: String,
    },
    #[error("unexpected response status {status} from {method}")]
    UnexpectedStatus { status: u16, method: RpcMethod },
}

impl ClientError {
    /// The daemon refused because another call was in flight.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Remote { status, .. } if *status == StatusCode::CONFLICT.as_u16())
    }
}

/// Calls the RPC surface of a running daemon.
#[derive(Debug, Clone)]
pub struct RpcClient {
    base: String,
    client: reqwest::Client,
}

impl RpcClient {
    pub fn new(
        addr: SocketAddr,
        identity: &str,
        timeout: Duration,
    ) -> Result<Self, ClientError> {
        // A wildcard listener is still reached over loopback.
        let addr = if addr.ip().is_unspecified() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), addr.port())
        } else {
            addr
        };
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            base: format!("http://{addr}/{identity}"),
            client,
        })
    }

    pub fn from_config(config: &RpcConfig) -> Result<Self, ClientError> {
        Self::new(
            config.listen,
            config.primary_identity(),
            config.client_timeout,
        )
    }

    pub async fn is_running(&self) -> Result<bool, ClientError> {
        self.call_json(RpcMethod::IsRunning, None::<&()>).await
    }

    pub async fn run_update(&self) -> Result<(), ClientError> {
        self.call_unit(RpcMethod::RunUpdate, None::<&()>).await
    }

    pub async fn force_update(&self) -> Result<(), ClientError> {
        self.call_unit(RpcMethod::ForceUpdate, None::<&()>).await
    }

    pub async fn run_ping(&self) -> Result<(), ClientError> {
        self.call_unit(RpcMethod::RunPing, None::<&()>).await
    }

    pub async fn run_ping_sync(&self) -> Result<UpdateState, ClientError> {
        self.call_json(RpcMethod::RunPingSync, None::<&()>).await
    }

    pub async fn state(&self) -> Result<UpdateState, ClientError> {
        self.call_json(RpcMethod::State, None::<&()>).await
    }

    pub async fn set_auto_update(&self, enabled: bool) -> Result<(), ClientError> {
        self.call_unit(RpcMethod::SetAutoUpdate, Some(&enabled)).await
    }

    pub async fn is_auto_update_on(&self) -> Result<bool, ClientError> {
        self.call_json(RpcMethod::IsAutoUpdateOn, None::<&()>).await
    }

    async fn call_json<T, B>(&self, method: RpcMethod, body: Option<&B>) -> Result<T, ClientError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let response = self.send(method, body).await?;
        Ok(response.json::<T>().await?)
    }

    async fn call_unit<B>(&self, method: RpcMethod, body: Option<&B>) -> Result<(), ClientError>
    where
        B: Serialize + ?Sized,
    {
        let response = self.send(method, body).await?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(ClientError::UnexpectedStatus {
                status: response.status().as_u16(),
                method,
            });
        }
        Ok(())
    }

    async fn send<B>(
        &self,
        method: RpcMethod,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}/{}", self.base, method);
        debug!(url = %url, "calling salt-updater");
        let mut request = self.client.post(&url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match response.json::<ErrorBody>().await {
            Ok(body) => Err(ClientError::Remote {
                status: status.as_u16(),
                name: body.name,
                message: body.message,
            }),
            Err(_) => Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                method,
            }),
        }
    }
}
