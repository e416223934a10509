use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;

use kubetap_relay::fixtures::Fixtures;
use kubetap_relay::RelayState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kubetap_relay=info".into()),
        )
        .init();

    let token = std::env::var("KUBETAP_RELAY_TOKEN")
        .context("KUBETAP_RELAY_TOKEN must be set to the token clients present")?;
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);
    let fixtures = match std::env::var_os("KUBETAP_RELAY_FIXTURES") {
        Some(path) => Fixtures::load(&PathBuf::from(path))?,
        None => Fixtures::default(),
    };
    let forward_host =
        std::env::var("KUBETAP_FORWARD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

    let state = RelayState::new(token, fixtures).with_forward_host(forward_host.clone());

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("kubetap loopback relay on ws://{} (forwarding to {})", addr, forward_host);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    kubetap_relay::serve(listener, state).await?;
    Ok(())
}
