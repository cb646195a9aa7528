//! Client for a backing store owned by another process.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use super::protocol::{Request, Response};
use super::{BackingStore, StoreError};

/// Calls waiting for the connection task.
const CALL_QUEUE_DEPTH: usize = 64;

type Reply = oneshot::Sender<Result<Response, StoreError>>;

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    line: String,
}

impl Connection {
    async fn exchange(&mut self, request: &Request) -> Result<Response, StoreError> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');

        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;

        self.line.clear();
        if self.reader.read_line(&mut self.line).await? == 0 {
            return Err(StoreError::Closed);
        }
        Ok(serde_json::from_str(self.line.trim_end())?)
    }
}

/// A [`BackingStore`] reached over a TCP connection to a
/// [`StoreServer`](super::StoreServer).
///
/// The socket is owned by a background task that answers calls one at a
/// time, in order. A caller that stops waiting does not abandon its exchange
/// half way, so the next call never reads a stale reply. Lock atomicity is
/// provided by the server side store.
pub struct RemoteStore {
    peer: String,
    calls: mpsc::Sender<(Request, Reply)>,
}

impl std::fmt::Debug for RemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStore").field("peer", &self.peer).finish()
    }
}

impl RemoteStore {
    /// Connect to a store server.
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, StoreError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        debug!(peer = %peer, "Connected to remote store");

        let (read, writer) = stream.into_split();
        let conn = Connection {
            reader: BufReader::new(read),
            writer,
            line: String::new(),
        };
        let (calls, queue) = mpsc::channel(CALL_QUEUE_DEPTH);
        tokio::spawn(drive(conn, queue, peer.clone()));

        Ok(Self { peer, calls })
    }

    /// Address of the server this handle talks to.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn call(&self, request: Request) -> Result<Response, StoreError> {
        let op = request.op();
        let (reply, response) = oneshot::channel();
        self.calls
            .send((request, reply))
            .await
            .map_err(|_| StoreError::Closed)?;

        let response = response.await.map_err(|_| StoreError::Closed)??;
        trace!(op, response = ?response, "Remote store call");
        Ok(response)
    }
}

/// Run queued calls against the connection until every handle is gone or the
/// connection fails.
///
/// A lock granted to a caller that is no longer listening is handed straight
/// back, since nobody would ever release it otherwise.
async fn drive(mut conn: Connection, mut queue: mpsc::Receiver<(Request, Reply)>, peer: String) {
    while let Some((request, reply)) = queue.recv().await {
        let result = conn.exchange(&request).await;
        let broken = matches!(result, Err(StoreError::Io(_) | StoreError::Closed));
        let granted = match (&request, &result) {
            (Request::Lock { key }, Ok(Response::Locked { acquired: true })) => Some(key.clone()),
            _ => None,
        };

        if reply.send(result).is_err() {
            if let Some(key) = granted {
                debug!(peer = %peer, key = %key, "Releasing lock nobody waited for");
                if let Err(e) = conn.exchange(&Request::Unlock { key }).await {
                    warn!(peer = %peer, error = %e, "Failed to release abandoned lock");
                    break;
                }
            }
        }
        if broken {
            break;
        }
    }
    debug!(peer = %peer, "Remote store connection closed");
}

#[async_trait]
impl BackingStore for RemoteStore {
    async fn get(&self, key: &str) -> Result<Option<u64>, StoreError> {
        self.call(Request::Get { key: key.to_string() })
            .await?
            .into_value()
    }

    async fn set(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.call(Request::Set {
            key: key.to_string(),
            value,
        })
        .await?
        .into_unit()
    }

    async fn lock(&self, key: &str) -> Result<bool, StoreError> {
        self.call(Request::Lock { key: key.to_string() })
            .await?
            .into_acquired()
    }

    async fn unlock(&self, key: &str) -> Result<(), StoreError> {
        self.call(Request::Unlock { key: key.to_string() })
            .await?
            .into_unit()
    }
}
