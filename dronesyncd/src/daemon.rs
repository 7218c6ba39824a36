use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dronesync_core::{ConnectionParams, Connector, HttpConnector, LocalDirConnector};

use crate::manager::Manager;
use crate::sync::error::EngineError;
use crate::sync::quota::DEFAULT_SPACE_PERCENT;
use crate::sync::worker::{
    DEFAULT_DATA_FOLDER, DEFAULT_POLL_SECS, DEFAULT_REMOTE_ROOT, PassReport, SyncConfig,
};

const DEFAULT_LOCAL_DIR_NAME: &str = "DroneSync";
const DEFAULT_DEVICE_HOST: &str = "192.168.42.1";
const DEFAULT_DEVICE_PORT: u64 = 80;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub device: ConnectionParams,
    /// Directory served in place of the device, e.g. a USB mount.
    pub remote_dir: Option<PathBuf>,
    pub local_dir: PathBuf,
    pub sync: SyncConfig,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        Self::from_vars(&home, |name| std::env::var(name).ok())
    }

    /// Builds the config from a variable lookup; `from_env` passes the
    /// process environment.
    pub fn from_vars<F>(home: &Path, var: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let local_dir = var("DRONESYNC_LOCAL_DIR")
            .map(|value| expand_with_home(&value, home))
            .unwrap_or_else(|| home.join(DEFAULT_LOCAL_DIR_NAME));
        let remote_dir = var("DRONESYNC_REMOTE_DIR").map(|value| expand_with_home(&value, home));
        let port = parse_u64(var("DRONESYNC_DEVICE_PORT"), DEFAULT_DEVICE_PORT);
        let device = ConnectionParams {
            host: var("DRONESYNC_DEVICE_HOST").unwrap_or_else(|| DEFAULT_DEVICE_HOST.to_string()),
            port: u16::try_from(port).context("DRONESYNC_DEVICE_PORT is out of range")?,
            username: var("DRONESYNC_DEVICE_USER").unwrap_or_default(),
            password: var("DRONESYNC_DEVICE_PASSWORD").unwrap_or_default(),
        };
        let sync = SyncConfig {
            remote_root: var("DRONESYNC_REMOTE_ROOT")
                .unwrap_or_else(|| DEFAULT_REMOTE_ROOT.to_string()),
            data_folder: var("DRONESYNC_DATA_FOLDER")
                .unwrap_or_else(|| DEFAULT_DATA_FOLDER.to_string()),
            categories: parse_list(var("DRONESYNC_CATEGORIES")),
            poll_interval: Duration::from_secs(parse_u64(
                var("DRONESYNC_POLL_SECS"),
                DEFAULT_POLL_SECS,
            )),
            space_percent: parse_percent(var("DRONESYNC_SPACE_PERCENT"), DEFAULT_SPACE_PERCENT),
        };

        Ok(Self {
            device,
            remote_dir,
            local_dir,
            sync,
        })
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        match &self.remote_dir {
            Some(dir) => Box::new(LocalDirConnector::new(dir.clone())),
            None => Box::new(HttpConnector::new(self.device.clone())),
        }
    }

    fn source_label(&self) -> String {
        match &self.remote_dir {
            Some(dir) => dir.display().to_string(),
            None => format!("http://{}:{}", self.device.host, self.device.port),
        }
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    manager: Manager,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.local_dir)
            .await
            .with_context(|| format!("failed to create local dir at {:?}", config.local_dir))?;

        let connector = config.connector();
        let mut manager = Manager::new();
        manager
            .new_data_downloader(connector.as_ref(), &config.local_dir, config.sync.clone())
            .await
            .with_context(|| format!("failed to open device at {}", config.source_label()))?;

        Ok(Self { config, manager })
    }

    /// Runs a single pass and returns its report.
    pub async fn run_once(&self) -> anyhow::Result<PassReport> {
        let report = self.manager.data_downloader()?.run_pass().await?;
        Ok(report)
    }

    /// Syncs until Ctrl-C, then cancels and tears the worker down.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let downloader = self.manager.data_downloader()?;
        tracing::info!(
            source = %self.config.source_label(),
            local_root = %downloader.local_root().display(),
            data_folder = %downloader.config().data_folder,
            poll_secs = downloader.config().poll_interval.as_secs(),
            "dronesyncd started"
        );
        downloader.start()?;

        let signal = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        downloader.cancel();
        match downloader.join().await {
            Ok(()) | Err(EngineError::Canceled) => {}
            Err(err) => return Err(err).context("data downloader failed"),
        }
        self.manager.delete_data_downloader()?;
        signal.context("failed waiting for shutdown signal")
    }
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
