//! # Downloader module - asynchronous HTTP downloads to a file.
//!
//! Lua surface:
//! ```lua
//! local err = downloader.createDownloader("d1", "/tmp/pkg.zip", url, "onDone", 30)
//! downloader.deleteDownloader("d1")
//! ```
//!
//! A download delivers exactly one [`ScriptEvent::Download`] unless it was deleted
//! (or its generation stopped) before it finished. The tag frees up once the
//! download finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mlua::{Lua, Table, Value};
use tokio::io::AsyncWriteExt;
use tokio::select;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checksum;
use crate::core::Registry;
use crate::error::TaskStartError;
use crate::events::{EventSender, ScriptEvent, TaskId};

/// Metadata of a running download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadInfo {
    /// Exported function invoked on completion.
    pub callback: Arc<str>,
    /// Source location.
    pub url: String,
    /// Destination file.
    pub path: PathBuf,
    /// Deadline of the whole transfer.
    pub timeout: Duration,
}

/// Download registry of one generation.
pub struct Downloads {
    registry: Arc<Registry<DownloadInfo>>,
    events: EventSender,
    client: reqwest::Client,
    default_timeout: Duration,
}

impl Downloads {
    /// Creates an empty download registry.
    pub fn new(events: EventSender, client: reqwest::Client, default_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::new(Registry::new("download")),
            events,
            client,
            default_timeout,
        })
    }

    /// Starts downloading `url` into `path` under `tag`.
    ///
    /// `timeout = None` (or zero) uses the default deadline.
    pub fn create(
        &self,
        tag: &str,
        path: impl Into<PathBuf>,
        url: &str,
        callback: &str,
        timeout: Option<Duration>,
    ) -> Result<TaskId, TaskStartError> {
        let timeout = timeout
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_timeout);
        let path = path.into();
        let info = DownloadInfo {
            callback: Arc::from(callback),
            url: url.to_string(),
            path,
            timeout,
        };

        let tag_arc: Arc<str> = Arc::from(tag);
        let registry = Arc::clone(&self.registry);
        let events = self.events.clone();
        let client = self.client.clone();

        self.registry.try_register(tag, move |id, token| {
            let fut = serve_download(id, tag_arc, info.clone(), client, token, registry, events);
            Ok((info, fut))
        })
    }

    /// Cancels the download under `tag`; its result will never be delivered.
    pub fn delete(&self, tag: &str) -> bool {
        self.registry.cancel(tag)
    }

    /// Returns metadata for `tag`.
    pub fn get(&self, tag: &str) -> Option<DownloadInfo> {
        self.registry.get(tag)
    }

    /// Returns sorted tags of running downloads.
    pub fn tags(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Cancels every download; returns their join handles.
    pub fn clear(&self) -> Vec<JoinHandle<()>> {
        self.registry.cancel_all()
    }

    /// Builds the `downloader` Lua module.
    pub(crate) fn loader(self: &Arc<Self>, lua: &Lua) -> mlua::Result<Table> {
        let module = lua.create_table()?;

        let downloads = Arc::clone(self);
        module.set(
            "createDownloader",
            lua.create_function(
                move |lua, (tag, path, url, callback, timeout): (Value, Value, Value, Value, Value)| {
                    let tag = super::arg_string(&tag);
                    let path = super::arg_string(&path);
                    let url = super::arg_string(&url);
                    let callback = super::arg_string(&callback);
                    info!(%tag, %path, %url, %callback, "createDownloader");
                    let timeout = super::arg_number(&timeout)
                        .filter(|secs| secs.is_finite() && *secs > 0.0)
                        .and_then(|secs| Duration::try_from_secs_f64(secs).ok());
                    let res = super::resolve_callback(lua, &callback)
                        .and_then(|()| downloads.create(&tag, &path, &url, &callback, timeout));
                    Ok(super::err_value(res))
                },
            )?,
        )?;

        let downloads = Arc::clone(self);
        module.set(
            "deleteDownloader",
            lua.create_function(move |_, tag: Value| {
                let tag = super::arg_string(&tag);
                if downloads.delete(&tag) {
                    info!(%tag, "deleteDownloader");
                }
                Ok(())
            })?,
        )?;

        Ok(module)
    }
}

async fn serve_download(
    id: TaskId,
    tag: Arc<str>,
    info: DownloadInfo,
    client: reqwest::Client,
    token: CancellationToken,
    registry: Arc<Registry<DownloadInfo>>,
    events: EventSender,
) {
    let res = select! {
        _ = token.cancelled() => {
            debug!(%tag, task = %id, "download cancelled");
            return;
        }
        res = time::timeout(info.timeout, fetch_to_file(&client, &info.url, &info.path)) => res,
    };

    let outcome = match res {
        Ok(Ok(())) => finish_checksum(&info.path).await,
        Ok(Err(e)) => Err(e),
        Err(_) => Err(format!(
            "download timeout after {:?}, url: {}",
            info.timeout, info.url
        )),
    };

    if !registry.complete(&tag, id) {
        debug!(%tag, task = %id, "download result discarded");
        return;
    }

    let ev = match outcome {
        Ok(sum) => {
            info!(%tag, path = %info.path.display(), checksum = %sum, "download finished");
            ScriptEvent::download_ok(id, tag, info.callback, info.path, sum)
        }
        Err(e) => {
            warn!(%tag, url = %info.url, error = %e, "download failed");
            ScriptEvent::download_failed(id, tag, info.callback, info.path, e)
        }
    };
    events.send(ev).await;
}

/// Streams the response body of `url` into `path`.
async fn fetch_to_file(client: &reqwest::Client, url: &str, path: &Path) -> Result<(), String> {
    let mut resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}, url: {url}"))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(format!(
            "status code: {}, msg: {}, url: {}",
            status.as_u16(),
            body,
            url
        ));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("create {}: {e}", parent.display()))?;
    }

    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| format!("create {}: {e}", path.display()))?;

    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|e| format!("read body: {e}, url: {url}"))?
    {
        file.write_all(&chunk)
            .await
            .map_err(|e| format!("write {}: {e}", path.display()))?;
    }
    file.flush()
        .await
        .map_err(|e| format!("write {}: {e}", path.display()))?;
    Ok(())
}

async fn finish_checksum(path: &Path) -> Result<String, String> {
    let owned = path.to_path_buf();
    match tokio::task::spawn_blocking(move || checksum::file_md5_hex(&owned)).await {
        Ok(Ok(sum)) => Ok(sum),
        Ok(Err(e)) => Err(format!("checksum {}: {e}", path.display())),
        Err(e) => Err(format!("checksum {}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventQueue;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn next(rx: &mut crate::events::EventReceiver) -> ScriptEvent {
        time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event expected")
            .expect("queue open")
    }

    fn downloads(tx: EventSender) -> Arc<Downloads> {
        Downloads::new(tx, reqwest::Client::new(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_download_writes_file_and_reports_checksum() {
        let server = MockServer::start().await;
        let body = vec![7u8; 200];
        Mock::given(method("GET"))
            .and(url_path("/blob"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("blob.bin");
        let (tx, mut rx) = EventQueue::bounded(4);
        let dl = downloads(tx);

        let id = dl
            .create("d1", &dest, &format!("{}/blob", server.uri()), "onDone", None)
            .unwrap();

        match next(&mut rx).await {
            ScriptEvent::Download {
                id: got,
                path,
                checksum: sum,
                error,
                ..
            } => {
                assert_eq!(got, id);
                assert_eq!(path, dest);
                assert_eq!(sum, checksum::md5_hex(&body));
                assert_eq!(error, None);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        assert!(dl.tags().is_empty(), "tag must be free after completion");
    }

    #[tokio::test]
    async fn test_http_error_reports_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = EventQueue::bounded(4);
        let dl = downloads(tx);
        dl.create("d1", dir.path().join("x"), &server.uri(), "onDone", None)
            .unwrap();

        match next(&mut rx).await {
            ScriptEvent::Download { checksum, error, .. } => {
                assert!(checksum.is_empty());
                let error = error.expect("error expected");
                assert!(error.contains("404"), "{error}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deleted_download_is_never_delivered() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = EventQueue::bounded(4);
        let dl = downloads(tx);
        dl.create("d1", dir.path().join("x"), &server.uri(), "onDone", None)
            .unwrap();
        assert!(dl.delete("d1"));

        let got = time::timeout(Duration::from_millis(600), rx.recv()).await;
        assert!(got.is_err(), "cancelled download delivered {got:?}");
    }

    #[tokio::test]
    async fn test_timeout_reports_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = EventQueue::bounded(4);
        let dl = downloads(tx);
        dl.create(
            "slow",
            dir.path().join("x"),
            &server.uri(),
            "onDone",
            Some(Duration::from_millis(100)),
        )
        .unwrap();

        match next(&mut rx).await {
            ScriptEvent::Download { error, .. } => {
                assert!(error.unwrap().contains("timeout"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
