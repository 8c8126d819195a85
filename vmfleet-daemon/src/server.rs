//! gRPC server and gateway lifecycle.

use anyhow::{Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::info;

use vmfleet_proto::{ImagesServer, InstancesServer, VolumesServer};

use crate::config::Config;
use crate::gateway;
use crate::service::{AggregationService, RegistrySource};

/// Address a local client should dial to reach a listener bound on `addr`.
fn loopback(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) if v4.ip().is_unspecified() => {
            SocketAddr::from((Ipv4Addr::LOCALHOST, v4.port()))
        }
        SocketAddr::V6(v6) if v6.ip().is_unspecified() => {
            SocketAddr::from((Ipv6Addr::LOCALHOST, v6.port()))
        }
        other => other,
    }
}

fn parse_addr(value: &str, what: &str) -> Result<SocketAddr> {
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {} address {:?}: {}", what, value, e))
}

async fn joined<E>(task: JoinHandle<std::result::Result<(), E>>, what: &'static str) -> Result<()>
where
    E: std::error::Error + Send + Sync + 'static,
{
    task.await
        .with_context(|| format!("{} task panicked", what))?
        .with_context(|| format!("{} error", what))
}

/// Run the gRPC server and the JSON gateway until either fails.
pub async fn run(config: Config) -> Result<()> {
    let service = AggregationService::new(Arc::new(RegistrySource::new(&config.provider)));

    let grpc_addr = parse_addr(&config.server.listen_address, "listen")?;
    let gateway_addr = parse_addr(&config.server.gateway_address, "gateway")?;

    let listener = TcpListener::bind(grpc_addr)
        .await
        .with_context(|| format!("Failed to bind gRPC listener on {}", grpc_addr))?;
    let bound = listener.local_addr()?;

    info!(address = %bound, provider = %config.provider.name, "Starting gRPC server");
    let grpc = tokio::spawn(
        Server::builder()
            .add_service(InstancesServer::new(service.clone()))
            .add_service(ImagesServer::new(service.clone()))
            .add_service(VolumesServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener)),
    );

    let channel = gateway::connect(loopback(bound)).await?;
    let gateway_listener = TcpListener::bind(gateway_addr)
        .await
        .with_context(|| format!("Failed to bind gateway listener on {}", gateway_addr))?;

    info!(address = %gateway_addr, "Starting HTTP gateway");
    let http = tokio::spawn(async move {
        axum::serve(gateway_listener, gateway::router(channel)).await
    });

    tokio::try_join!(joined(grpc, "gRPC server"), joined(http, "HTTP gateway"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_replaces_unspecified() {
        assert_eq!(
            loopback("0.0.0.0:8080".parse().unwrap()),
            "127.0.0.1:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            loopback("[::]:8080".parse().unwrap()),
            "[::1]:8080".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(
            loopback("10.1.2.3:8080".parse().unwrap()),
            "10.1.2.3:8080".parse::<SocketAddr>().unwrap()
        );
    }

    #[test]
    fn test_invalid_address() {
        assert!(parse_addr("localhost", "listen").is_err());
    }

    #[tokio::test]
    async fn test_occupied_port_fails_startup() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = Config::default();
        config.server.listen_address = taken.local_addr().unwrap().to_string();

        let err = run(config).await.unwrap_err();
        assert!(err.to_string().contains("Failed to bind gRPC listener"));
    }
}
