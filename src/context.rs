use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    error::{Error, Result},
    settings::Settings,
    storage::KeyCache,
};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// Process-wide state handed to commands and backends: the data
/// directory, durable settings and background tasks that must be torn
/// down before exit.
pub struct Context {
    data_dir: PathBuf,
    settings: Settings,
    flush_interval: Duration,
    token: CancellationToken,
    tasks: JoinSet<Result<()>>,
}

impl Context {
    #[instrument(err)]
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)?;
        let settings = Settings::open(&data_dir.join("settings"))?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            settings,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            token: CancellationToken::new(),
            tasks: JoinSet::new(),
        })
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    /// Token cancelled on shutdown. Commands derive child tokens from it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Loads `<data_dir>/<name>.keys` and keeps it flushed in the
    /// background until [`Context::shutdown`].
    pub fn key_cache(&mut self, name: &str) -> Result<KeyCache> {
        let cache = KeyCache::load(&self.data_dir.join(format!("{name}.keys")))?;

        let flushed = cache.clone();
        let token = self.token.clone();
        let period = self.flush_interval;
        let name = name.to_string();
        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = flushed.flush().await {
                            warn!(cache = %name, error = %e, "key cache flush failed");
                        }
                    }
                }
            }
            flushed.flush().await
        });

        Ok(cache)
    }

    /// Cancels background work and waits for it, returning the first error.
    pub async fn shutdown(mut self) -> Result<()> {
        self.token.cancel();

        let mut first: Option<Error> = None;
        while let Some(joined) = self.tasks.join_next().await {
            let result = joined.map_err(Error::from).and_then(|r| r);
            if let Err(e) = result {
                warn!(error = %e, "background task failed");
                first.get_or_insert(e);
            }
        }

        match first {
            Some(e) => Err(e),
            None => {
                info!("shutdown complete");
                Ok(())
            }
        }
    }
}
