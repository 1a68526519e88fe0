//! reqwest-backed transport

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::{Client, Proxy, Response};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{TaskControl, Transport, TransportBody, TransportCall, TransportResponse};
use crate::config::TransportSettings;
use crate::error::{RequestError, TransportErrorKind};
use crate::request::{Authorization, Method};

pub type Result<T> = std::result::Result<T, RequestError>;

/// Where partial data for `path` is kept between attempts
pub fn partial_download_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".download");
    PathBuf::from(name)
}

/// HTTP transport on a shared reqwest client
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a new HTTP transport
    pub fn new(settings: &TransportSettings) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(settings.connect_timeout())
            .user_agent(&settings.user_agent)
            .redirect(reqwest::redirect::Policy::limited(settings.max_redirects));

        if let Some(url) = settings.proxy.as_deref() {
            let proxy = Proxy::all(url)
                .map_err(|e| RequestError::InvalidUrl(format!("Invalid proxy: {}", e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| RequestError::transport(TransportErrorKind::Other, e.to_string()))?;

        Ok(Self { client })
    }

    async fn execute_once(&self, call: &TransportCall, control: &TaskControl) -> Result<TransportResponse> {
        let mut request = self
            .client
            .request(to_reqwest_method(call.method), call.url.clone())
            .timeout(call.timeout);

        for (name, value) in &call.headers {
            request = request.header(name, value);
        }

        request = match &call.authorization {
            Some(Authorization::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            Some(Authorization::Bearer(token)) => request.bearer_auth(token),
            None => request,
        };

        if let Some(body) = &call.body {
            request = request.body(body.clone());
        }

        let resume_from = match &call.download_path {
            Some(path) => partial_len(&partial_download_path(path)).await,
            None => 0,
        };
        if resume_from > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={}-", resume_from));
        }

        debug!(
            url = %call.url,
            method = call.method.as_str(),
            priority = ?call.priority,
            allows_cellular = call.allows_cellular,
            resume_from,
            "Sending request"
        );

        let mut response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let body = match &call.download_path {
            Some(path) if status.is_success() => {
                let append = resume_from > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
                stream_to_file(&mut response, path, append, control).await?;
                TransportBody::File(path.clone())
            }
            _ => {
                let mut buffer = BytesMut::new();
                loop {
                    if !control.checkpoint().await {
                        return Err(cancelled());
                    }
                    match response.chunk().await.map_err(map_reqwest_error)? {
                        Some(chunk) => buffer.extend_from_slice(&chunk),
                        None => break,
                    }
                }
                if buffer.is_empty() {
                    TransportBody::Empty
                } else {
                    TransportBody::Bytes(buffer.freeze())
                }
            }
        };

        debug!(url = %call.url, status = status.as_u16(), "Response received");

        Ok(TransportResponse {
            status: Some(status.as_u16()),
            headers,
            body,
            error: None,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, call: TransportCall, control: TaskControl) -> TransportResponse {
        if !control.checkpoint().await {
            return TransportResponse::cancelled();
        }

        match self.execute_once(&call, &control).await {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %call.url, error = %e, "Request failed");
                TransportResponse::failed(e)
            }
        }
    }
}

/// Stream a successful body into `<path>.download`, then move it into place.
/// On cancellation or a broken body the partial file is flushed and left
/// behind as resume data.
async fn stream_to_file(
    response: &mut Response,
    path: &Path,
    append: bool,
    control: &TaskControl,
) -> Result<()> {
    let partial = partial_download_path(path);
    if let Some(parent) = partial.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
    }

    let mut file = if append {
        OpenOptions::new()
            .append(true)
            .open(&partial)
            .await
            .map_err(io_error)?
    } else {
        File::create(&partial).await.map_err(io_error)?
    };

    loop {
        let chunk = tokio::select! {
            _ = control.cancelled() => None,
            chunk = response.chunk() => Some(chunk),
        };

        match chunk {
            None => {
                file.flush().await.map_err(io_error)?;
                debug!(path = %partial.display(), "Download cancelled, partial data kept");
                return Err(cancelled());
            }
            Some(Ok(Some(bytes))) => file.write_all(&bytes).await.map_err(io_error)?,
            Some(Ok(None)) => break,
            Some(Err(e)) => {
                file.flush().await.map_err(io_error)?;
                debug!(path = %partial.display(), error = %e, "Download interrupted, partial data kept");
                return Err(map_reqwest_error(e));
            }
        }

        if !control.checkpoint().await {
            file.flush().await.map_err(io_error)?;
            return Err(cancelled());
        }
    }

    file.flush().await.map_err(io_error)?;
    drop(file);
    tokio::fs::rename(&partial, path).await.map_err(io_error)?;

    Ok(())
}

async fn partial_len(path: &Path) -> u64 {
    tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0)
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Head => reqwest::Method::HEAD,
        Method::Put => reqwest::Method::PUT,
        Method::Delete => reqwest::Method::DELETE,
        Method::Patch => reqwest::Method::PATCH,
    }
}

fn map_reqwest_error(e: reqwest::Error) -> RequestError {
    let kind = if e.is_timeout() {
        TransportErrorKind::Timeout
    } else if e.is_connect() {
        TransportErrorKind::Connect
    } else if e.is_redirect() {
        TransportErrorKind::Redirect
    } else if e.is_body() || e.is_decode() {
        TransportErrorKind::Body
    } else {
        TransportErrorKind::Other
    };
    RequestError::transport(kind, e.to_string())
}

fn io_error(e: std::io::Error) -> RequestError {
    RequestError::transport(TransportErrorKind::Io, e.to_string())
}

fn cancelled() -> RequestError {
    RequestError::transport(TransportErrorKind::Cancelled, "task cancelled")
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[test]
    fn test_partial_download_path() {
        let path = Path::new("/tmp/archive.zip");
        assert_eq!(
            partial_download_path(path),
            PathBuf::from("/tmp/archive.zip.download")
        );
    }

    #[test]
    fn test_transport_from_default_settings() {
        let transport = HttpTransport::new(&TransportSettings::default());
        assert!(transport.is_ok());
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let settings = TransportSettings {
            proxy: Some("::not a proxy::".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            HttpTransport::new(&settings),
            Err(RequestError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_send() {
        let transport = HttpTransport::new(&TransportSettings::default()).unwrap();
        let control = TaskControl::new(Default::default());
        control.cancel();

        let call = TransportCall {
            method: Method::Get,
            url: url::Url::parse("http://127.0.0.1:9/").unwrap(),
            headers: vec![],
            authorization: None,
            body: None,
            timeout: Duration::from_secs(1),
            allows_cellular: true,
            priority: Default::default(),
            download_path: None,
        };

        let response = transport.execute(call, control).await;
        assert!(response.error.unwrap().is_cancellation());
    }

    /// One canned raw HTTP reply; the connection stays open for `hold`
    struct Reply {
        raw: &'static str,
        hold: Duration,
    }

    impl Reply {
        fn new(raw: &'static str) -> Self {
            Self {
                raw,
                hold: Duration::ZERO,
            }
        }
    }

    /// Answer consecutive connections with `replies`, recording each request head
    async fn serve(replies: Vec<Reply>) -> (url::Url, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = url::Url::parse(&format!(
            "http://{}/file.bin",
            listener.local_addr().unwrap()
        ))
        .unwrap();
        let heads = Arc::new(Mutex::new(Vec::new()));

        let seen = heads.clone();
        tokio::spawn(async move {
            for reply in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                seen.lock()
                    .push(String::from_utf8_lossy(&head).to_lowercase());

                socket.write_all(reply.raw.as_bytes()).await.unwrap();
                tokio::time::sleep(reply.hold).await;
                let _ = socket.shutdown().await;
            }
        });

        (url, heads)
    }

    fn download_call(url: url::Url, path: &Path) -> TransportCall {
        TransportCall {
            method: Method::Get,
            url,
            headers: vec![],
            authorization: None,
            body: None,
            timeout: Duration::from_secs(5),
            allows_cellular: true,
            priority: Default::default(),
            download_path: Some(path.to_path_buf()),
        }
    }

    #[tokio::test]
    async fn test_interrupted_download_resumes_with_range() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let partial = partial_download_path(&target);
        let (url, heads) = serve(vec![
            Reply::new("HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello"),
            Reply::new(
                "HTTP/1.1 206 Partial Content\r\nContent-Length: 5\r\nContent-Range: bytes 5-9/10\r\n\r\nworld",
            ),
        ])
        .await;
        let transport = HttpTransport::new(&TransportSettings::default()).unwrap();

        let first = transport
            .execute(download_call(url.clone(), &target), TaskControl::new(Default::default()))
            .await;
        assert!(first.error.is_some());
        assert_eq!(tokio::fs::read(&partial).await.unwrap(), b"hello");
        assert!(!target.exists());

        let second = transport
            .execute(download_call(url, &target), TaskControl::new(Default::default()))
            .await;
        assert!(second.error.is_none());
        assert_eq!(second.status, Some(206));
        assert!(matches!(&second.body, TransportBody::File(path) if path == &target));
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"helloworld");
        assert!(!partial.exists());

        let heads = heads.lock().clone();
        assert!(!heads[0].contains("range:"));
        assert!(heads[1].contains("range: bytes=5-"));
    }

    #[tokio::test]
    async fn test_full_response_replaces_stale_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let partial = partial_download_path(&target);
        tokio::fs::write(&partial, b"stale").await.unwrap();

        let (url, heads) = serve(vec![Reply::new(
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhelloworld",
        )])
        .await;
        let transport = HttpTransport::new(&TransportSettings::default()).unwrap();

        let response = transport
            .execute(download_call(url, &target), TaskControl::new(Default::default()))
            .await;

        assert!(response.error.is_none());
        assert_eq!(tokio::fs::read(&target).await.unwrap(), b"helloworld");
        assert!(!partial.exists());
        assert!(heads.lock()[0].contains("range: bytes=5-"));
    }

    #[tokio::test]
    async fn test_cancelled_download_keeps_partial_data() {
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("file.bin");
        let partial = partial_download_path(&target);
        let (url, _) = serve(vec![Reply {
            raw: "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello",
            hold: Duration::from_secs(2),
        }])
        .await;

        let control = TaskControl::new(Default::default());
        let task = {
            let control = control.clone();
            let call = download_call(url, &target);
            tokio::spawn(async move {
                let transport = HttpTransport::new(&TransportSettings::default()).unwrap();
                transport.execute(call, control).await
            })
        };

        for _ in 0..200 {
            if partial_len(&partial).await == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        control.cancel();

        let response = task.await.unwrap();
        assert!(response.error.unwrap().is_cancellation());
        assert_eq!(tokio::fs::read(&partial).await.unwrap(), b"hello");
        assert!(!target.exists());
    }

    #[test]
    fn test_method_mapping() {
        assert_eq!(to_reqwest_method(Method::Patch), reqwest::Method::PATCH);
        assert_eq!(to_reqwest_method(Method::Head), reqwest::Method::HEAD);
    }
}
