//! TCP server exposing a [`MemoryStore`] to other processes.

use std::collections::HashSet;
use std::future::Future;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tracing::{debug, error, info, warn};

use super::protocol::{Request, Response};
use super::{BackingStore, MemoryStore};
use crate::error::Result;

/// Longest request line accepted, newline included.
pub const MAX_REQUEST_BYTES: usize = 64 * 1024;

/// Serves a shared [`MemoryStore`] over line-delimited JSON.
///
/// Locks taken through a connection are released when that connection goes
/// away, so a crashed client cannot wedge a bucket.
pub struct StoreServer {
    listener: TcpListener,
    store: MemoryStore,
}

impl StoreServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind<A: ToSocketAddrs>(addr: A, store: MemoryStore) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, store })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until the process exits.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `signal` resolves.
    ///
    /// Connections already accepted keep running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, "Starting store server");

        tokio::pin!(signal);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };
                    let store = self.store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, store).await {
                            warn!(peer = %peer, error = %e, "Store connection failed");
                        }
                    });
                }
                _ = &mut signal => {
                    info!(addr = %addr, "Store server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, store: MemoryStore) -> Result<()> {
    debug!(peer = %peer, "Accepted store connection");
    stream.set_nodelay(true)?;
    let (read, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read);
    let mut line = String::new();
    let mut held: HashSet<String> = HashSet::new();

    let outcome = async {
        loop {
            line.clear();
            let limit = MAX_REQUEST_BYTES as u64 + 1;
            let bytes = (&mut reader).take(limit).read_line(&mut line).await?;
            if bytes == 0 {
                break;
            }
            if bytes > MAX_REQUEST_BYTES && !line.ends_with('\n') {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("request line exceeds {} bytes", MAX_REQUEST_BYTES),
                ));
            }
            let request = line.trim();
            if request.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(request) {
                Ok(request) => dispatch(request, &store, &mut held).await,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Malformed store request");
                    Response::Error {
                        message: format!("malformed request: {}", e),
                    }
                }
            };

            let mut payload = serde_json::to_vec(&response)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            payload.push(b'\n');
            writer.write_all(&payload).await?;
        }
        Ok::<(), std::io::Error>(())
    }
    .await;

    for key in held.drain() {
        debug!(peer = %peer, key = %key, "Releasing lock held by closed connection");
        if let Err(e) = store.unlock(&key).await {
            warn!(peer = %peer, key = %key, error = %e, "Failed to release lock");
        }
    }
    debug!(peer = %peer, "Store connection closed");

    Ok(outcome?)
}

async fn dispatch(request: Request, store: &MemoryStore, held: &mut HashSet<String>) -> Response {
    let lock_key = match &request {
        Request::Lock { key } => Some(key.clone()),
        Request::Unlock { key } => {
            held.remove(key);
            None
        }
        _ => None,
    };

    let response = request.apply(store).await;
    if let (Some(key), Response::Locked { acquired: true }) = (lock_key, &response) {
        held.insert(key);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RemoteStore;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn start() -> (SocketAddr, MemoryStore, oneshot::Sender<()>) {
        let store = MemoryStore::new();
        let server = StoreServer::bind("127.0.0.1:0", store.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(server.serve_with_shutdown(async {
            let _ = rx.await;
        }));
        (addr, store, tx)
    }

    #[tokio::test]
    async fn test_remote_round_trip() {
        let (addr, backing, _shutdown) = start().await;
        let remote = RemoteStore::connect(addr).await.unwrap();

        assert_eq!(remote.get("v").await.unwrap(), None);
        remote.set("v", 12).await.unwrap();
        assert_eq!(remote.get("v").await.unwrap(), Some(12));
        assert_eq!(backing.get("v").await.unwrap(), Some(12));

        assert!(remote.lock("l").await.unwrap());
        assert!(!remote.lock("l").await.unwrap());
        remote.unlock("l").await.unwrap();
        assert!(!backing.is_locked("l"));
    }

    #[tokio::test]
    async fn test_locks_shared_between_clients() {
        let (addr, _backing, _shutdown) = start().await;
        let a = RemoteStore::connect(addr).await.unwrap();
        let b = RemoteStore::connect(addr).await.unwrap();

        assert!(a.lock("bucket//lock").await.unwrap());
        assert!(!b.lock("bucket//lock").await.unwrap());
        a.unlock("bucket//lock").await.unwrap();
        assert!(b.lock("bucket//lock").await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_client_releases_locks() {
        let (addr, backing, _shutdown) = start().await;
        let client = RemoteStore::connect(addr).await.unwrap();
        assert!(client.lock("orphan").await.unwrap());
        assert!(backing.is_locked("orphan"));

        drop(client);

        let mut released = false;
        for _ in 0..100 {
            if !backing.is_locked("orphan") {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(released, "lock should be released after disconnect");
    }

    #[tokio::test]
    async fn test_malformed_request_gets_error_response() {
        let (addr, _backing, _shutdown) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"{\"op\":\"explode\"}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert!(matches!(response, Response::Error { .. }));

        // The connection stays usable.
        write.write_all(b"{\"op\":\"get\",\"key\":\"x\"}\n").await.unwrap();
        let line = lines.next_line().await.unwrap().unwrap();
        let response: Response = serde_json::from_str(&line).unwrap();
        assert_eq!(response, Response::Value { value: None });
    }

    #[tokio::test]
    async fn test_abandoned_call_does_not_shift_replies() {
        let (addr, backing, _shutdown) = start().await;
        backing.set("a", 111).await.unwrap();
        backing.set("b", 222).await.unwrap();
        let remote = RemoteStore::connect(addr).await.unwrap();

        // Give up on a call after its first poll.
        let abandoned = tokio::time::timeout(Duration::ZERO, remote.get("a")).await;
        assert!(abandoned.is_err());

        assert_eq!(remote.get("b").await.unwrap(), Some(222));
        assert_eq!(remote.get("a").await.unwrap(), Some(111));
    }

    #[tokio::test]
    async fn test_abandoned_lock_is_handed_back() {
        let (addr, backing, _shutdown) = start().await;
        let remote = RemoteStore::connect(addr).await.unwrap();

        let abandoned = tokio::time::timeout(Duration::ZERO, remote.lock("l")).await;
        assert!(abandoned.is_err());

        // Calls run in order, so the abandoned lock is settled by now.
        assert_eq!(remote.get("x").await.unwrap(), None);
        assert!(!backing.is_locked("l"));
        assert!(remote.lock("l").await.unwrap());
    }

    #[tokio::test]
    async fn test_oversized_request_closes_connection() {
        let (addr, backing, _shutdown) = start().await;
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut read, mut write) = stream.into_split();

        let junk = vec![b'a'; MAX_REQUEST_BYTES + 4096];
        let _ = write.write_all(&junk).await;

        // The server hangs up instead of buffering without end.
        let mut sink = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(5), read.read_to_end(&mut sink)).await;
        assert!(closed.is_ok(), "server should close an oversized request");

        let remote = RemoteStore::connect(addr).await.unwrap();
        remote.set("still", 1).await.unwrap();
        assert_eq!(backing.get("still").await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let store = MemoryStore::new();
        let server = StoreServer::bind("127.0.0.1:0", store).await.unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.serve_with_shutdown(async {
            let _ = rx.await;
        }));

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }
}
