use crate::error::{Error, Result};
use console::style;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Url;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tokio_util::sync::CancellationToken;

/// Streaming HTTP client shared by every strategy.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    credentials: Option<Credentials>,
    retries: usize,
    cancel: CancellationToken,
}

/// A bearer token and the origin it may be sent to.
#[derive(Clone)]
struct Credentials {
    token: String,
    scope: Url,
}

impl Downloader {
    /// An anonymous client. See [`Downloader::with_token`].
    pub fn new(retries: usize, cancel: CancellationToken) -> Result<Self> {
        let client = reqwest::Client::builder().user_agent("toolpin").build()?;
        Ok(Self {
            client,
            credentials: None,
            retries,
            cancel,
        })
    }

    /// Sends `token` on requests to the origin of `api_base` only.
    /// Asset mirrors and vendor hosts never see it.
    pub fn with_token(mut self, token: Option<String>, api_base: &str) -> Result<Self> {
        self.credentials = match token {
            Some(token) => {
                let scope = Url::parse(api_base)
                    .map_err(|e| Error::Config(format!("invalid API base '{api_base}': {e}")))?;
                Some(Credentials { token, scope })
            }
            None => None,
        };
        Ok(self)
    }

    pub fn has_token(&self) -> bool {
        self.credentials.is_some()
    }

    /// The token to send to `url`, if its origin matches the API base.
    fn token_for(&self, url: &str) -> Option<&str> {
        let credentials = self.credentials.as_ref()?;
        let target = Url::parse(url).ok()?;
        (target.origin() == credentials.scope.origin()).then_some(credentials.token.as_str())
    }

    /// A request builder carrying the user agent, plus the bearer token when
    /// `url` is on the API host.
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, url);
        match self.token_for(url) {
            Some(token) => builder.header(AUTHORIZATION, format!("Bearer {token}")),
            None => builder,
        }
    }

    /// Backoff used for transient failures: 500ms, 1s, 2s, ... with jitter.
    pub fn retry_strategy(&self) -> impl Iterator<Item = Duration> + use<> {
        ExponentialBackoff::from_millis(2)
            .factor(250)
            .max_delay(Duration::from_secs(8))
            .map(jitter)
            .take(self.retries)
    }

    /// Fetches `url` and decodes the JSON body, retrying transient failures.
    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        RetryIf::start(
            self.retry_strategy(),
            || async {
                let response = self.send_checked(self.request(reqwest::Method::GET, url), url).await?;
                Ok::<T, Error>(response.json::<T>().await?)
            },
            is_transient,
        )
        .await
    }

    /// Fetches `url` as text, retrying transient failures.
    pub async fn get_text(&self, url: &str) -> Result<String> {
        RetryIf::start(
            self.retry_strategy(),
            || async {
                let response = self.send_checked(self.request(reqwest::Method::GET, url), url).await?;
                Ok::<String, Error>(response.text().await?)
            },
            is_transient,
        )
        .await
    }

    /// Streams `url` into `dest`, creating or truncating it.
    pub async fn download(&self, url: &str, dest: &Path, pb: &ProgressBar) -> Result<u64> {
        self.download_with_accept(url, dest, None, pb).await
    }

    /// Like [`Downloader::download`], with an explicit `Accept` header.
    #[tracing::instrument(skip(self, dest, pb), fields(dest = %dest.display()))]
    pub async fn download_with_accept(
        &self,
        url: &str,
        dest: &Path,
        accept: Option<&'static str>,
        pb: &ProgressBar,
    ) -> Result<u64> {
        let bytes = RetryIf::start(
            self.retry_strategy(),
            || self.stream_once(url, dest, accept, pb),
            is_transient,
        )
        .await?;
        tracing::debug!(bytes, "Download complete");
        Ok(bytes)
    }

    /// Downloads `url` into a fresh temporary file named after `prefix`.
    pub async fn download_temp(
        &self,
        url: &str,
        prefix: &str,
        pb: &ProgressBar,
    ) -> Result<NamedTempFile> {
        let temp_file = tempfile::Builder::new().prefix(prefix).tempfile()?;
        self.download(url, temp_file.path(), pb).await?;
        Ok(temp_file)
    }

    async fn stream_once(
        &self,
        url: &str,
        dest: &Path,
        accept: Option<&'static str>,
        pb: &ProgressBar,
    ) -> Result<u64> {
        // Reset progress on each attempt.
        pb.set_position(0);

        let mut request = self.request(reqwest::Method::GET, url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, HeaderValue::from_static(accept));
        }
        let response = self.send_checked(request, url).await?;
        let total_size = response.content_length().unwrap_or(0);

        if let Ok(download_style) = ProgressStyle::with_template(
            "{spinner:.green} {msg}\n{wide_bar:.cyan/blue} {bytes}/{total_bytes} ({eta})",
        ) {
            pb.set_style(download_style.progress_chars("#>-"));
        }
        pb.set_length(total_size);
        let label = url.rsplit('/').next().unwrap_or(url);
        pb.set_message(format!("Downloading {}", style(label).cyan()));

        let mut file = File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written = 0u64;

        loop {
            let item = tokio::select! {
                _ = self.cancel.cancelled() => return Err(Error::Cancelled),
                item = stream.next() => item,
            };
            let Some(chunk) = item else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            pb.inc(chunk.len() as u64);
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn send_checked(
        &self,
        request: reqwest::RequestBuilder,
        url: &str,
    ) -> Result<reqwest::Response> {
        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(Error::Cancelled),
            response = request.send() => response,
        };
        let response = response.map_err(|e| {
            tracing::debug!(error = %e, url, "Request failed");
            Error::DownloadFailed {
                url: url.to_string(),
                status: None,
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            tracing::debug!(%status, url, "Request returned an error status");
            return Err(Error::DownloadFailed {
                url: url.to_string(),
                status: Some(status.as_u16()),
            });
        }
        Ok(response)
    }
}

/// Connection failures and server errors are retried; client errors are not.
fn is_transient(err: &Error) -> bool {
    match err {
        Error::DownloadFailed { status: None, .. } => true,
        Error::DownloadFailed {
            status: Some(code), ..
        } => *code >= 500 || *code == 429,
        Error::Http(e) => e.is_timeout() || e.is_connect() || e.is_body(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn downloader(retries: usize) -> Downloader {
        Downloader::new(retries, CancellationToken::new()).unwrap()
    }

    #[tokio::test]
    async fn streams_the_body_to_disk() -> Result<()> {
        let server = MockServer::start().await;
        let body = vec![7u8; 64 * 1024];
        Mock::given(method("GET"))
            .and(path("/files/task.tar.gz"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir()?;
        let dest = dir.path().join("task.tar.gz");
        let pb = ProgressBar::hidden();
        let written = downloader(0)
            .download(&format!("{}/files/task.tar.gz", server.uri()), &dest, &pb)
            .await?;

        assert_eq!(written, body.len() as u64);
        assert_eq!(std::fs::read(&dest)?, body);
        assert_eq!(pb.position(), body.len() as u64);
        Ok(())
    }

    #[tokio::test]
    async fn non_success_status_is_a_download_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let err = downloader(3)
            .download(&format!("{}/missing", server.uri()), &dir.path().join("x"), &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownloadFailed { status: Some(404), .. }));
    }

    #[tokio::test]
    async fn server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let err = downloader(1)
            .get_text(&format!("{}/latest", server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DownloadFailed { status: Some(503), .. }));
    }

    #[tokio::test]
    async fn temp_downloads_use_the_prefix() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
            .mount(&server)
            .await;

        let temp = downloader(0)
            .download_temp(&server.uri(), "manifest-", &ProgressBar::hidden())
            .await?;
        let file_name = temp.path().file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("manifest-"));
        assert_eq!(std::fs::read_to_string(temp.path())?, "payload");
        Ok(())
    }

    #[tokio::test]
    async fn sends_the_bearer_token_to_the_api_host() -> Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let client = Downloader::new(0, CancellationToken::new())?
            .with_token(Some("s3cret".into()), &server.uri())?;
        assert_eq!(client.get_text(&format!("{}/repos/x", server.uri())).await?, "ok");
        Ok(())
    }

    #[tokio::test]
    async fn other_hosts_never_see_the_token() -> Result<()> {
        let api = MockServer::start().await;
        let mirror = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&mirror)
            .await;

        let client = Downloader::new(0, CancellationToken::new())?
            .with_token(Some("s3cret".into()), &api.uri())?;
        assert_eq!(client.get_text(&format!("{}/file", mirror.uri())).await?, "ok");

        let requests = mirror.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 1);
        assert!(!requests[0].headers.contains_key("authorization"));
        Ok(())
    }

    #[test]
    fn invalid_api_base_is_a_config_error() {
        let err = Downloader::new(0, CancellationToken::new())
            .unwrap()
            .with_token(Some("s3cret".into()), "not a url")
            .err()
            .unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn cancelled_downloads_stop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let cancel = CancellationToken::new();
        let client = Downloader::new(0, cancel.clone()).unwrap();
        cancel.cancel();
        let dir = tempdir().unwrap();
        let err = client
            .download(&server.uri(), &dir.path().join("x"), &ProgressBar::hidden())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
