//! Minimal HTTP/1.1 server to stub remote APIs in tests. Every connection
//! serves a single request and is closed afterwards.

use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

#[derive(Debug, Clone)]
pub(crate) struct Request {
    pub(crate) method: String,
    pub(crate) path: String,
    pub(crate) query: Option<String>,
    pub(crate) authorization: Option<String>,
    pub(crate) body: String,
}

pub(crate) struct Response {
    status: u16,
    content_type: &'static str,
    chunks: Vec<Vec<u8>>,
    chunk_delay: Duration,
    declared_len: Option<usize>,
}

impl Response {
    pub(crate) fn json(body: &str) -> Self {
        Self {
            content_type: "application/json",
            ..Self::bytes(body.as_bytes().to_vec())
        }
    }

    pub(crate) fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            ..Self::bytes(body.into().into_bytes())
        }
    }

    pub(crate) fn bytes(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/octet-stream",
            chunks: vec![body],
            chunk_delay: Duration::ZERO,
            declared_len: None,
        }
    }

    /// Body is written chunk by chunk with the given delay before each one
    pub(crate) fn chunked(chunks: Vec<Vec<u8>>, chunk_delay: Duration) -> Self {
        Self {
            chunks,
            chunk_delay,
            ..Self::bytes(vec![])
        }
    }

    /// Overrides the `Content-Length` header, e.g. to emulate a server that
    /// promises more than it sends.
    pub(crate) fn with_declared_len(mut self, len: usize) -> Self {
        self.declared_len = Some(len);
        self
    }
}

type Handler = dyn Fn(&Request) -> Response + Send + Sync;

pub(crate) struct TestServer {
    base: Url,
    requests: Arc<SyncMutex<Vec<Request>>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestServer {
    pub(crate) fn url(&self, path: &str) -> Url {
        self.base
            .join(path)
            .unwrap_or_else(|err| panic!("bad test URL path {path:?}: {err}"))
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub(crate) async fn spawn(
    handler: impl Fn(&Request) -> Response + Send + Sync + 'static,
) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let base = Url::parse(&format!("http://{addr}/")).unwrap();

    let requests = Arc::<SyncMutex<Vec<Request>>>::default();
    let handler: Arc<Handler> = Arc::new(handler);

    let task = tokio::spawn({
        let requests = requests.clone();
        async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let requests = requests.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    // Errors here mean the client went away, e.g. cancelled
                    // the download, which is a legit scenario in tests.
                    let _ = serve(stream, &*handler, &requests).await;
                });
            }
        }
    });

    TestServer {
        base,
        requests,
        task,
    }
}

async fn serve(
    stream: TcpStream,
    handler: &Handler,
    requests: &SyncMutex<Vec<Request>>,
) -> std::io::Result<()> {
    let mut stream = BufReader::new(stream);

    let mut request_line = String::new();
    stream.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_owned();
    let target = parts.next().unwrap_or_default();
    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
        None => (target.to_owned(), None),
    };

    let mut content_len = 0;
    let mut authorization = None;
    loop {
        let mut line = String::new();
        stream.read_line(&mut line).await?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => content_len = value.parse().unwrap_or(0),
            "authorization" => authorization = Some(value.to_owned()),
            _ => {}
        }
    }

    let mut body = vec![0; content_len];
    stream.read_exact(&mut body).await?;

    let request = Request {
        method,
        path,
        query,
        authorization,
        body: String::from_utf8_lossy(&body).into_owned(),
    };

    requests.lock().push(request.clone());

    let response = handler(&request);

    let actual_len: usize = response.chunks.iter().map(Vec::len).sum();
    let head = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        response.content_type,
        response.declared_len.unwrap_or(actual_len),
    );

    let stream = stream.get_mut();
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await?;

    for chunk in &response.chunks {
        if !response.chunk_delay.is_zero() {
            tokio::time::sleep(response.chunk_delay).await;
        }
        stream.write_all(chunk).await?;
        stream.flush().await?;
    }

    stream.shutdown().await
}
