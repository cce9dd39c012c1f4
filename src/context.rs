use std::sync::Arc;

use crate::config::Config;
use crate::net::{LoadError, Loader};
use crate::storage::Database;
use crate::sync::Reconciler;

/// Shared services handed to every job.
pub struct AppContext {
    pub db: Arc<Database>,
    pub loader: Loader,
    pub reconciler: Reconciler<Database>,
    pub config: Config,
}

impl AppContext {
    pub fn new(db: Database, config: Config) -> Result<Self, LoadError> {
        let db = Arc::new(db);
        let loader = Loader::from_config(&config)?;
        let reconciler = Reconciler::new(Arc::clone(&db), config.download_dir.clone());
        Ok(Self {
            db,
            loader,
            reconciler,
            config,
        })
    }
}
