use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::cancel::CancelSignal;
use crate::transport::{
    ConnectionParams, Connector, ProgressFn, ProgressReporter, RemoteEntry, Transport,
    TransportError,
};

/// Connects to the device's HTTP media server.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    params: ConnectionParams,
}

impl HttpConnector {
    pub fn new(params: ConnectionParams) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, signal: CancelSignal) -> Result<Arc<dyn Transport>, TransportError> {
        let base_url = format!("http://{}:{}/", self.params.host, self.params.port);
        let mut transport = HttpTransport::with_base_url(&base_url, signal)?;
        if !self.params.is_anonymous() {
            transport = transport.with_credentials(&self.params.username, &self.params.password);
        }
        tracing::debug!(%base_url, "opened http transport");
        Ok(Arc::new(transport))
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    base_url: Url,
    credentials: Option<(String, String)>,
    signal: CancelSignal,
}

impl HttpTransport {
    pub fn with_base_url(base_url: &str, signal: CancelSignal) -> Result<Self, TransportError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            credentials: None,
            signal,
        })
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        Ok(self.base_url.join(path)?)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.credentials {
            Some((user, password)) => request.basic_auth(user, Some(password)),
            None => request,
        }
    }

    async fn check(response: Response, path: &str) -> Result<Response, TransportError> {
        let status = response.status();
        if status.is_success() {
            Ok(response)
        } else if status == StatusCode::NOT_FOUND {
            Err(TransportError::NotFound(path.to_string()))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(TransportError::Api { status, body })
        }
    }

    async fn request_content(
        &self,
        remote_path: &str,
        offset: u64,
    ) -> Result<Response, TransportError> {
        let mut url = self.endpoint("/api/v1/files/content")?;
        url.query_pairs_mut().append_pair("path", remote_path);
        let mut request = self.authorize(self.http.get(url));
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={offset}-"));
        }
        Ok(request.send().await?)
    }

    async fn download(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        progress: Option<ProgressFn>,
    ) -> Result<(), TransportError> {
        let mut offset = if resume {
            match tokio::fs::metadata(local_path).await {
                Ok(meta) => meta.len(),
                Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
                Err(err) => return Err(err.into()),
            }
        } else {
            0
        };

        let mut response = self.request_content(remote_path, offset).await?;
        if offset > 0 && response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            if complete_length(&response) == Some(offset) {
                if let Some(callback) = progress.as_ref() {
                    callback(100);
                }
                return Ok(());
            }
            tracing::debug!(
                path = remote_path,
                local_len = offset,
                "local copy does not match remote length, restarting"
            );
            offset = 0;
            response = self.request_content(remote_path, 0).await?;
        }
        let response = Self::check(response, remote_path).await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = response.status() == StatusCode::PARTIAL_CONTENT;
        let (mut file, mut done) = if partial {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(local_path)
                .await?;
            (file, offset)
        } else {
            (tokio::fs::File::create(local_path).await?, 0)
        };

        let total = response.content_length().map(|len| len + done);
        let mut reporter = ProgressReporter::new(progress, total);
        reporter.update(done);

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            done += chunk.len() as u64;
            reporter.update(done);
        }
        file.flush().await?;
        file.sync_all().await?;
        reporter.finish();
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn list(&self, path: &str) -> Result<Vec<RemoteEntry>, TransportError> {
        self.signal
            .guard(async {
                let mut url = self.endpoint("/api/v1/files")?;
                url.query_pairs_mut().append_pair("path", path);
                let response = self.authorize(self.http.get(url)).send().await?;
                let listing: Listing = Self::check(response, path).await?.json().await?;
                Ok(listing.items)
            })
            .await
    }

    async fn get(
        &self,
        remote_path: &str,
        local_path: &Path,
        resume: bool,
        progress: Option<ProgressFn>,
    ) -> Result<(), TransportError> {
        self.signal
            .guard(self.download(remote_path, local_path, resume, progress))
            .await
    }

    async fn get_bytes(&self, remote_path: &str) -> Result<Vec<u8>, TransportError> {
        self.signal
            .guard(async {
                let mut url = self.endpoint("/api/v1/files/content")?;
                url.query_pairs_mut().append_pair("path", remote_path);
                let response = self.authorize(self.http.get(url)).send().await?;
                let bytes = Self::check(response, remote_path).await?.bytes().await?;
                Ok(bytes.to_vec())
            })
            .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.signal
            .guard(async {
                let mut url = self.endpoint("/api/v1/files/rename")?;
                url.query_pairs_mut()
                    .append_pair("from", from)
                    .append_pair("to", to);
                let response = self.authorize(self.http.post(url)).send().await?;
                Self::check(response, from).await?;
                Ok(())
            })
            .await
    }

    async fn delete(&self, path: &str) -> Result<(), TransportError> {
        self.signal
            .guard(async {
                let mut url = self.endpoint("/api/v1/files")?;
                url.query_pairs_mut().append_pair("path", path);
                let response = self.authorize(self.http.delete(url)).send().await?;
                Self::check(response, path).await?;
                Ok(())
            })
            .await
    }
}

/// Full length from a `Content-Range: bytes */<len>` header.
fn complete_length(response: &Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .strip_prefix("bytes */")?
        .trim()
        .parse()
        .ok()
}

#[derive(Debug, Deserialize, Serialize)]
struct Listing {
    #[serde(default)]
    items: Vec<RemoteEntry>,
}
