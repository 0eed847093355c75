//! Polls a URL over mTLS and prints which client certificate is in use.
//!
//! ```text
//! CF_INSTANCE_CERT=... CF_INSTANCE_KEY=... CF_SYSTEM_CERT_PATH=... \
//!     cargo run --example rotating_client -- https://service.internal/
//! ```

use anyhow::Context;
use mutual_rustls::{mtls_client, MtlsConfig};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let url = std::env::args()
        .nth(1)
        .context("usage: rotating_client <https-url>")?;

    let config = MtlsConfig::from_env()?;
    let (client, watch_error) = mtls_client(config)
        .with_http_customizer(|http| http.timeout(Duration::from_secs(10)))
        .shutdown_timeout(Some(Duration::from_secs(5)))
        .build()?
        .into_parts();
    if let Some(e) = watch_error {
        println!("not watching credential files, rotation disabled: {e}");
    }

    let mut updates = client.credential_updates();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            res = updates.changed() => {
                let generation = res?;
                if let Some(pair) = client.current_credential() {
                    println!("credential rotated: generation={generation} subject={}", pair.subject());
                }
            }

            _ = ticker.tick() => {
                let subject = client
                    .current_credential()
                    .map(|pair| pair.subject().to_owned())
                    .unwrap_or_default();
                match client.get(&url).send().await {
                    Ok(resp) => println!("{} as {subject}", resp.status()),
                    Err(e) => println!("request failed as {subject}: {e}"),
                }
            }
        }
    }

    client.shutdown_configured().await?;
    Ok(())
}
