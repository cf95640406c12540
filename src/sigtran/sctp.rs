//! SCTP association transport
//!
//! Manages one association toward a signalling gateway. Where kernel SCTP
//! is unavailable the association runs over TCP with a small chunk header
//! carrying the stream number; adaptation messages are self-delimiting so
//! stream reassembly stays trivial. Reader and writer run as their own
//! tasks feeding the adaptation layer's receiver.

use super::{SigtranReceiver, SigtranTransport};
use crate::errors::SigtranError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Chunk header: stream number and payload length
const CHUNK_HEADER: usize = 6;

/// One SCTP association (TCP fallback framing)
pub struct SctpAssociation {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    established: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<(u16, Bytes)>,
    receiver: Arc<RwLock<Weak<dyn SigtranReceiver>>>,
}

impl SctpAssociation {
    /// Connect to the remote peer and spawn the I/O tasks
    pub async fn connect(remote_addr: SocketAddr) -> Result<Arc<Self>, SigtranError> {
        info!(%remote_addr, "connecting association");
        let stream = TcpStream::connect(remote_addr)
            .await
            .map_err(|e| SigtranError::AssociationFailed(e.to_string()))?;
        let local_addr =
            stream.local_addr().map_err(|e| SigtranError::AssociationFailed(e.to_string()))?;
        Ok(Self::from_stream(stream, local_addr, remote_addr))
    }

    /// Wrap an accepted connection (the server side of an association)
    pub fn accept(stream: TcpStream) -> Result<Arc<Self>, SigtranError> {
        let local_addr =
            stream.local_addr().map_err(|e| SigtranError::AssociationFailed(e.to_string()))?;
        let remote_addr =
            stream.peer_addr().map_err(|e| SigtranError::AssociationFailed(e.to_string()))?;
        Ok(Self::from_stream(stream, local_addr, remote_addr))
    }

    fn from_stream(stream: TcpStream, local_addr: SocketAddr, remote_addr: SocketAddr) -> Arc<Self> {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<(u16, Bytes)>();
        let established = Arc::new(AtomicBool::new(true));
        let receiver: Arc<RwLock<Weak<dyn SigtranReceiver>>> = Arc::new(RwLock::new(
            Weak::<NullReceiver>::new() as Weak<dyn SigtranReceiver>,
        ));

        // Writer task drains the queue
        let write_established = established.clone();
        tokio::spawn(async move {
            while let Some((stream_no, payload)) = rx.recv().await {
                let mut chunk = BytesMut::with_capacity(CHUNK_HEADER + payload.len());
                chunk.put_u16(stream_no);
                chunk.put_u32(payload.len() as u32);
                chunk.put_slice(&payload);
                if let Err(err) = write_half.write_all(&chunk).await {
                    error!(%err, "association write failed");
                    write_established.store(false, Ordering::Release);
                    break;
                }
            }
        });

        // Reader task reassembles chunks and calls upward
        let read_established = established.clone();
        let read_receiver = receiver.clone();
        tokio::spawn(async move {
            let mut pending = BytesMut::new();
            let mut buf = [0u8; 4096];
            loop {
                match read_half.read(&mut buf).await {
                    Ok(0) => {
                        debug!("association closed by peer");
                        break;
                    }
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        while pending.len() >= CHUNK_HEADER {
                            let len = u32::from_be_bytes([
                                pending[2], pending[3], pending[4], pending[5],
                            ]) as usize;
                            if pending.len() < CHUNK_HEADER + len {
                                break;
                            }
                            let mut chunk = pending.split_to(CHUNK_HEADER + len).freeze();
                            chunk.advance(CHUNK_HEADER);
                            let up = read_receiver.read().unwrap().upgrade();
                            if let Some(up) = up {
                                up.receive_message(chunk);
                            }
                        }
                    }
                    Err(err) => {
                        warn!(%err, "association read failed");
                        break;
                    }
                }
            }
            read_established.store(false, Ordering::Release);
            let up = read_receiver.read().unwrap().upgrade();
            if let Some(up) = up {
                up.transport_status(false);
            }
        });

        Arc::new(Self { local_addr, remote_addr, established, tx, receiver })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Send on a specific stream
    pub fn send_on_stream(&self, stream_no: u16, payload: Bytes) -> Result<(), SigtranError> {
        if !self.established.load(Ordering::Acquire) {
            return Err(SigtranError::SendFailed("association down".to_string()));
        }
        self.tx
            .send((stream_no, payload))
            .map_err(|_| SigtranError::SendFailed("writer gone".to_string()))
    }
}

struct NullReceiver;

impl SigtranReceiver for NullReceiver {
    fn receive_message(&self, _data: Bytes) {}

    fn transport_status(&self, _up: bool) {}
}

impl SigtranTransport for SctpAssociation {
    fn send_message(&self, data: Bytes) -> Result<(), SigtranError> {
        // Stream 0 carries management, stream 1 user data; adaptation
        // layers that care pick the stream explicitly
        self.send_on_stream(0, data)
    }

    fn set_receiver(&self, receiver: Weak<dyn SigtranReceiver>) {
        *self.receiver.write().unwrap() = receiver;
    }

    fn transport_up(&self) -> bool {
        self.established.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    struct Sink {
        messages: Mutex<Vec<Bytes>>,
        notify: tokio::sync::Notify,
    }

    impl Sink {
        fn new() -> Arc<Self> {
            Arc::new(Self { messages: Mutex::new(Vec::new()), notify: tokio::sync::Notify::new() })
        }
    }

    impl SigtranReceiver for Sink {
        fn receive_message(&self, data: Bytes) {
            self.messages.lock().unwrap().push(data);
            self.notify.notify_one();
        }

        fn transport_status(&self, _up: bool) {}
    }

    #[tokio::test]
    async fn chunked_messages_cross_the_association() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            SctpAssociation::accept(stream).unwrap()
        });
        let client = SctpAssociation::connect(addr).await.unwrap();
        let server = server.await.unwrap();

        let sink = Sink::new();
        server.set_receiver(Arc::downgrade(&sink) as Weak<dyn SigtranReceiver>);

        client.send_on_stream(1, Bytes::from_static(b"first")).unwrap();
        client.send_on_stream(1, Bytes::from_static(b"second")).unwrap();
        sink.notify.notified().await;
        // Both messages may land in one read
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let got = sink.messages.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].as_ref(), b"first");
        assert_eq!(got[1].as_ref(), b"second");
    }
}
