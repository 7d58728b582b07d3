//! Shared context threaded through every stage of a backup run
use crate::config::BackupConfig;
use crate::consts::ZARR_LIMIT;
use crate::github::RepoHost;
use crate::httputil::{BuildClientError, Client};
use crate::s3::ObjectStore;
use std::sync::Arc;
use tokio::sync::{OnceCell, Semaphore};

/// Configuration, capacity limiters, and external-service handles, cheap to
/// clone into every task
#[derive(Clone, Debug)]
pub(crate) struct Manager {
    pub(crate) config: Arc<BackupConfig>,
    /// Bounds the number of Zarrs synced at once across the whole process
    pub(crate) zarr_limit: Arc<Semaphore>,
    /// Plain HTTP client (bucket HEADs, region discovery)
    pub(crate) http: Client,
    /// Hosting-service client; `None` when no GitHub org is configured
    pub(crate) gh: Option<Arc<dyn RepoHost>>,
    /// Archive API token, needed to download embargoed assets
    pub(crate) token: Option<String>,
    s3: Arc<OnceCell<Arc<ObjectStore>>>,
}

impl Manager {
    pub(crate) fn new(
        config: BackupConfig,
        gh: Option<Arc<dyn RepoHost>>,
        token: Option<String>,
    ) -> Result<Manager, BuildClientError> {
        Ok(Manager {
            config: Arc::new(config),
            zarr_limit: Arc::new(Semaphore::new(ZARR_LIMIT)),
            http: Client::new(None)?,
            gh,
            token,
            s3: Arc::new(OnceCell::new()),
        })
    }

    /// The object-store client for the configured bucket, constructed on
    /// first use (region discovery requires a network round-trip)
    pub(crate) async fn object_store(&self) -> anyhow::Result<Arc<ObjectStore>> {
        let store = self
            .s3
            .get_or_try_init(|| async {
                ObjectStore::for_config(&self.config).await.map(Arc::new)
            })
            .await?;
        Ok(store.clone())
    }
}
