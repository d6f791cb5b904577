//! Gateway - Bootstraps the retrieval service from configuration.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;

use crate::application_service::retrieval_service::RetrievalService;
use crate::config::{GatewayConfig, IpfsConfig};
use crate::infrastructure::ipfs::IpfsContentFetcher;
use crate::infrastructure::jwe::JweDecryptor;
use crate::infrastructure::key_store::KeyStore;
use crate::presentation::scgi::{ScgiListener, ScgiServer};

/// Type alias for the production retrieval service.
pub type IpfsRetrievalService = RetrievalService<IpfsContentFetcher, JweDecryptor>;

/// A fully initialized gateway: keys loaded and content store reachable.
pub struct Gateway {
    config: GatewayConfig,
    service: Arc<IpfsRetrievalService>,
}

impl Gateway {
    /// Load the key collection named in `config` and connect to IPFS.
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let key_store = KeyStore::load_file(&config.keys.file).with_context(|| {
            format!("Failed to load keys from {}", config.keys.file.display())
        })?;
        tracing::info!(
            "Loaded {} keys from {}",
            key_store.len(),
            config.keys.file.display()
        );

        Self::with_key_store(config, key_store).await
    }

    /// Connect to IPFS and serve from an already built key store.
    pub async fn with_key_store(config: GatewayConfig, key_store: KeyStore) -> Result<Self> {
        let fetcher = connect_ipfs(&config.ipfs).await?;
        let service = Arc::new(RetrievalService::new(
            Arc::new(key_store),
            fetcher,
            JweDecryptor,
        ));

        Ok(Self { config, service })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<IpfsRetrievalService> {
        &self.service
    }

    /// Bind the configured SCGI socket and serve until `shutdown` completes.
    pub async fn serve_scgi<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        let target = self.config.scgi.listen_target();
        let listener = ScgiListener::bind(&target)
            .await
            .with_context(|| format!("Failed to bind SCGI listener on {target}"))?;
        tracing::info!("Listening for SCGI requests on {}", target);

        ScgiServer::new(self.service.clone(), self.config.scgi.max_header_len)
            .serve(listener, shutdown)
            .await;

        Ok(())
    }
}

async fn connect_ipfs(config: &IpfsConfig) -> Result<IpfsContentFetcher> {
    let fetcher = IpfsContentFetcher::connect(&config.api, config.timeout())
        .context("Failed to configure IPFS client")?;
    tracing::info!("Using IPFS API at {}", fetcher.base_url());

    if config.check_on_startup {
        let version = fetcher
            .check_version()
            .await
            .with_context(|| format!("IPFS API at {} is unreachable", fetcher.base_url()))?;
        tracing::info!("Connected to IPFS {}", version);
    }

    Ok(fetcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presentation::scgi::ListenTarget;
    use std::path::PathBuf;

    fn offline_config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.ipfs.api = "http://127.0.0.1:9".to_string();
        config.ipfs.check_on_startup = false;
        config
    }

    #[tokio::test]
    async fn test_missing_key_file_is_fatal() {
        let mut config = offline_config();
        config.keys.file = PathBuf::from("/nonexistent/keys.jsonarray");

        let err = Gateway::new(config).await.err().unwrap();
        assert!(err.to_string().contains("Failed to load keys"));
    }

    #[tokio::test]
    async fn test_invalid_ipfs_address_is_fatal() {
        let mut config = offline_config();
        config.ipfs.api = "/ip4/127.0.0.1/udp/5001".to_string();

        let err = Gateway::with_key_store(config, KeyStore::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("Failed to configure IPFS client"));
    }

    #[tokio::test]
    async fn test_unreachable_ipfs_is_fatal_when_probing() {
        let mut config = offline_config();
        config.ipfs.check_on_startup = true;

        let err = Gateway::with_key_store(config, KeyStore::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("is unreachable"));
    }

    #[tokio::test]
    async fn test_gateway_loads_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"kty":"oct","kid":"abc","k":"AAAA","mime":"text/plain","ipfs":{"cid":"bafkqaaa"}}"#,
        )
        .unwrap();

        let mut config = offline_config();
        config.keys.file = file.path().to_path_buf();
        config.scgi.listen = Some("127.0.0.1:0".parse().unwrap());

        let gateway = Gateway::new(config).await.unwrap();
        assert_eq!(gateway.service().key_store().len(), 1);
        assert!(gateway.service().key_store().lookup("abc").is_some());
        assert!(matches!(
            gateway.config().scgi.listen_target(),
            ListenTarget::Tcp(_)
        ));
    }
}
