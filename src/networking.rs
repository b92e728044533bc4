use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::wire::Frame;
use crate::FRAME_HEADER_SIZE;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

pub type LinkId = u64;

/// Shared handle to one socket's write half. Forwarding tasks write to
/// sockets they did not accept, so every write goes through this lock.
#[derive(Clone)]
pub struct FrameSink {
    inner: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
}

impl FrameSink {
    pub fn new(half: OwnedWriteHalf) -> Self {
        FrameSink {
            inner: Arc::new(tokio::sync::Mutex::new(half)),
        }
    }

    pub async fn send(&self, frame: &Frame) -> io::Result<()> {
        let bytes = frame
            .serialize()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.send_raw(&bytes).await
    }

    /// Write pre-serialized frame bytes, e.g. when forwarding verbatim.
    pub async fn send_raw(&self, bytes: &[u8]) -> io::Result<()> {
        let mut half = self.inner.lock().await;
        half.write_all(bytes).await?;
        half.flush().await
    }

    /// Whether two handles refer to the same underlying socket.
    pub fn same(&self, other: &FrameSink) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// One live connection as the hop table sees it: a process-unique id to
/// tell arrival directions apart, plus the shared write half.
#[derive(Clone)]
pub struct Link {
    pub id: LinkId,
    pub sink: FrameSink,
    pub peer_addr: Option<SocketAddr>,
}

impl Link {
    pub fn new(half: OwnedWriteHalf, peer_addr: Option<SocketAddr>) -> Self {
        Link {
            id: NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed),
            sink: FrameSink::new(half),
            peer_addr,
        }
    }
}

/// Await a fallible io future, turning elapsed time into `TimedOut`.
pub async fn timed<T, F>(limit: Duration, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "socket operation timed out",
        )),
    }
}

pub async fn connect(addr: SocketAddr, limit: Duration) -> io::Result<TcpStream> {
    debug!("Connecting to peer at {}", addr);
    timed(limit, TcpStream::connect(addr)).await
}

/// Read one length-prefixed frame off the socket, returning its raw bytes
/// including the four header bytes. The length prefix is read first, then
/// exactly that many bytes, so frames of any size stay in sync on the
/// stream. Returns `None` on a clean close before the next frame.
pub async fn read_frame(
    read_half: &mut OwnedReadHalf,
    limit: Duration,
) -> io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match timed(limit, read_half.read_exact(&mut header)).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let declared = u16::from_be_bytes([header[0], header[1]]) as usize;
    if declared < FRAME_HEADER_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame length below header size",
        ));
    }
    let mut buf = vec![0u8; declared];
    buf[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    timed(limit, read_half.read_exact(&mut buf[FRAME_HEADER_SIZE..])).await?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_frame_survives_the_stream() {
        let (client, server) = socket_pair().await;
        let (_client_read, client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        let frame = Frame::ApiNextHopQuery { tunnel_id: 77 };
        FrameSink::new(client_write).send(&frame).await.unwrap();

        let bytes = read_frame(&mut server_read, Duration::from_secs(2))
            .await
            .unwrap()
            .expect("Frame should arrive");
        assert_eq!(wire::parse(&bytes).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_back_to_back_frames_stay_in_sync() {
        let (client, server) = socket_pair().await;
        let (_client_read, client_write) = client.into_split();
        let (mut server_read, _server_write) = server.into_split();

        let sink = FrameSink::new(client_write);
        let first = Frame::TunnelIncoming { tunnel_id: 1 };
        let second = Frame::TunnelData {
            tunnel_id: 2,
            payload: vec![9u8; 300],
        };
        sink.send(&first).await.unwrap();
        sink.send(&second).await.unwrap();

        let limit = Duration::from_secs(2);
        let a = read_frame(&mut server_read, limit).await.unwrap().unwrap();
        let b = read_frame(&mut server_read, limit).await.unwrap().unwrap();
        assert_eq!(wire::parse(&a).unwrap(), first);
        assert_eq!(wire::parse(&b).unwrap(), second);
    }

    #[tokio::test]
    async fn test_clean_close_reads_as_none() {
        let (client, server) = socket_pair().await;
        drop(client);
        let (mut server_read, _server_write) = server.into_split();
        let got = read_frame(&mut server_read, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_idle_socket_times_out() {
        let (_client, server) = socket_pair().await;
        let (mut server_read, _server_write) = server.into_split();
        let err = read_frame(&mut server_read, Duration::from_millis(50))
            .await
            .expect_err("Read should time out");
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_link_ids_are_unique() {
        let (client, server) = socket_pair().await;
        let (_r1, w1) = client.into_split();
        let (_r2, w2) = server.into_split();
        let a = Link::new(w1, None);
        let b = Link::new(w2, None);
        assert_ne!(a.id, b.id);
    }
}
