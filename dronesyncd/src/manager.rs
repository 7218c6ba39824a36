use std::path::Path;
use std::sync::Arc;

use dronesync_core::Connector;

use crate::sync::error::EngineError;
use crate::sync::media::{MediaConfig, MediaDownloader};
use crate::sync::worker::{DataDownloader, SyncConfig};

/// Owns at most one data downloader and one media downloader.
#[derive(Default)]
pub struct Manager {
    data: Option<DataDownloader>,
    medias: Option<MediaDownloader>,
}

impl Manager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn new_data_downloader(
        &mut self,
        connector: &dyn Connector,
        local_directory: &Path,
        config: SyncConfig,
    ) -> Result<&DataDownloader, EngineError> {
        if self.data.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        let downloader = DataDownloader::new(connector, local_directory, config).await?;
        Ok(self.data.insert(downloader))
    }

    pub fn data_downloader(&self) -> Result<&DataDownloader, EngineError> {
        self.data.as_ref().ok_or(EngineError::NotInitialized)
    }

    /// Frees the data downloader. It must have been canceled and joined.
    pub fn delete_data_downloader(&mut self) -> Result<(), EngineError> {
        let downloader = self.data.as_ref().ok_or(EngineError::NotInitialized)?;
        if downloader.is_running() {
            return Err(EngineError::ThreadProcessing);
        }
        self.data = None;
        tracing::debug!("data downloader deleted");
        Ok(())
    }

    pub async fn new_media_downloader(
        &mut self,
        connector: Arc<dyn Connector>,
        local_directory: &Path,
        config: MediaConfig,
    ) -> Result<&MediaDownloader, EngineError> {
        if self.medias.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        let downloader = MediaDownloader::new(connector, local_directory, config).await?;
        Ok(self.medias.insert(downloader))
    }

    pub fn media_downloader(&self) -> Result<&MediaDownloader, EngineError> {
        self.medias.as_ref().ok_or(EngineError::NotInitialized)
    }

    pub fn delete_media_downloader(&mut self) -> Result<(), EngineError> {
        let downloader = self.medias.as_ref().ok_or(EngineError::NotInitialized)?;
        if downloader.is_running() {
            return Err(EngineError::ThreadProcessing);
        }
        self.medias = None;
        tracing::debug!("media downloader deleted");
        Ok(())
    }
}
