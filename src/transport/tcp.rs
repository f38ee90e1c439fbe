//! TCP engine provider
//!
//! One TCP connection per port. Frames are bincode-encoded [`Frame`] values
//! behind a big-endian u32 length prefix. The connecting side sends `Hello`;
//! the accepting provider asks its listener to create the local engine for
//! the port, then answers `HelloAck` (or `Reject`) and both sides report
//! [`EngineEvent::ChannelOpened`].
//!
//! Event types travel as raw integers so a peer speaking a newer protocol
//! cannot tear down the channel with a type we do not know.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::engine::{
    Delivery, DeliveryQueue, EngineEvent, EngineListener, EngineProvider, EngineRole,
    ProviderListener, TransEngine,
};
use crate::audio::data::AudioData;
use crate::audio::param::DhId;
use crate::config::TransportConfig;
use crate::constants::{CHANNEL_WAIT_TIMEOUT, MAX_ENGINE_FRAME};
use crate::error::{Error, Result, TransportError};
use crate::protocol::{AudioEvent, AudioEventType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Frame {
    Hello {
        dev_id: String,
        dh_id: DhId,
        role: EngineRole,
        session: Uuid,
    },
    HelloAck {
        session: Uuid,
    },
    Reject {
        reason: String,
    },
    Message {
        event_type: i32,
        content: String,
    },
    Data {
        payload: Vec<u8>,
        pts: Option<i64>,
    },
    Close,
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let len = reader.read_u32().await? as usize;
    if len > MAX_ENGINE_FRAME {
        return Err(TransportError::FrameTooLarge(len).into());
    }
    let mut buf = BytesMut::zeroed(len);
    reader.read_exact(&mut buf).await?;
    bincode::deserialize(&buf).map_err(|e| TransportError::InvalidFrame(e.to_string()).into())
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let bytes =
        bincode::serialize(frame).map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
    if bytes.len() > MAX_ENGINE_FRAME {
        return Err(TransportError::FrameTooLarge(bytes.len()).into());
    }
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read frames until the peer closes or the stream fails, handing each
/// inbound message or data frame to `deliver`. Stops early once `deliver`
/// returns false.
async fn read_deliveries<R, F>(reader: &mut R, dh_id: DhId, mut deliver: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(Delivery) -> bool,
{
    loop {
        let delivery = match read_frame(reader).await {
            Ok(Frame::Message {
                event_type,
                content,
            }) => match AudioEventType::try_from(event_type) {
                Ok(event_type) => Delivery::Message(AudioEvent::new(event_type, content)),
                Err(_) => {
                    tracing::warn!("Ignoring unknown event type {} on port {}", event_type, dh_id);
                    continue;
                }
            },
            Ok(Frame::Data { payload, pts }) => {
                let mut data = AudioData::from_vec(payload);
                if let Some(pts) = pts {
                    data.set_pts(pts);
                }
                Delivery::Data(data)
            }
            Ok(Frame::Close) => break,
            Ok(other) => {
                tracing::warn!("Unexpected frame on open channel: {:?}", other);
                continue;
            }
            // the whole frame was consumed, the stream is still in step
            Err(Error::Transport(TransportError::InvalidFrame(e))) => {
                tracing::warn!("Dropping undecodable frame on port {}: {}", dh_id, e);
                continue;
            }
            Err(e) => {
                tracing::debug!("Channel read ended: {}", e);
                break;
            }
        };
        if !deliver(delivery) {
            break;
        }
    }
}

/// Queue a frame for the writer task. Audio is dropped when the peer is not
/// keeping up; control frames report the failure.
fn enqueue_frame(tx: &mpsc::Sender<Frame>, frame: Frame) -> Result<()> {
    match tx.try_send(frame) {
        Ok(()) => Ok(()),
        Err(mpsc::error::TrySendError::Full(Frame::Data { .. })) => {
            tracing::warn!("Channel write queue full, audio frame dropped");
            Ok(())
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            Err(TransportError::SendFailed("write queue full".into()).into())
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            Err(TransportError::SendFailed("writer task gone".into()).into())
        }
    }
}

fn configure_stream(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    SockRef::from(stream).set_keepalive(true)?;
    Ok(())
}

pub struct TcpProvider {
    dev_id: String,
    handle: Handle,
    local_addr: SocketAddr,
    peers: DashMap<String, SocketAddr>,
    write_queue_frames: usize,
    engines: DashMap<(String, DhId), Weak<TcpEngine>>,
    listener: Mutex<Option<Weak<dyn ProviderListener>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpProvider {
    /// Bind the listen address and start accepting channels on `handle`
    pub fn bind(config: &TransportConfig, handle: Handle) -> Result<Arc<Self>> {
        let addr = config.listen;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&addr.into())?;
        socket.listen(128)?;
        socket.set_nonblocking(true)?;
        let std_listener: std::net::TcpListener = socket.into();
        let local_addr = std_listener.local_addr()?;

        let listener = {
            let _guard = handle.enter();
            TcpListener::from_std(std_listener)?
        };

        let provider = Arc::new(Self {
            dev_id: config.local_dev_id.clone(),
            handle: handle.clone(),
            local_addr,
            peers: config
                .peers
                .iter()
                .map(|(id, addr)| (id.clone(), *addr))
                .collect(),
            write_queue_frames: config.write_queue_frames.max(1),
            engines: DashMap::new(),
            listener: Mutex::new(None),
            accept_task: Mutex::new(None),
        });

        let task = handle.spawn(accept_loop(listener, Arc::downgrade(&provider)));
        *provider.accept_task.lock() = Some(task);
        tracing::info!("TCP engine provider {} listening on {}", provider.dev_id, local_addr);
        Ok(provider)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn add_peer(&self, dev_id: &str, addr: SocketAddr) {
        self.peers.insert(dev_id.to_string(), addr);
    }

    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }

    fn engine(&self, key: &(String, DhId)) -> Option<Arc<TcpEngine>> {
        self.engines.get(key).and_then(|e| e.upgrade())
    }

    fn provider_listener(&self) -> Option<Arc<dyn ProviderListener>> {
        self.listener.lock().as_ref().and_then(Weak::upgrade)
    }

    async fn accept_channel(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        configure_stream(&stream)?;
        let frame = tokio::time::timeout(CHANNEL_WAIT_TIMEOUT, read_frame(&mut stream))
            .await
            .map_err(|_| Error::WaitTimeout("channel hello"))??;
        let Frame::Hello {
            dev_id,
            dh_id,
            role,
            session,
        } = frame
        else {
            return Err(TransportError::InvalidFrame("expected hello".into()).into());
        };
        tracing::info!("Channel request from {} for port {} ({:?})", dev_id, dh_id, role);

        let key = (dev_id.clone(), dh_id);
        if self.engine(&key).is_none() {
            let listener = self
                .provider_listener()
                .ok_or_else(|| TransportError::UnknownPeer(dev_id.clone()))?;
            let peer = dev_id.clone();
            let result = tokio::task::spawn_blocking(move || listener.on_channel_request(&peer, dh_id))
                .await
                .map_err(|e| Error::Failed(e.to_string()))?;
            if let Err(e) = result {
                let reject = Frame::Reject {
                    reason: e.to_string(),
                };
                let _ = write_frame(&mut stream, &reject).await;
                return Err(e);
            }
        }

        let engine = self
            .engine(&key)
            .ok_or_else(|| Error::ChannelCreateFailed(format!("no engine for port {}", dh_id)))?;
        write_frame(&mut stream, &Frame::HelloAck { session }).await?;
        engine.attach(stream);
        Ok(())
    }
}

async fn accept_loop(listener: TcpListener, provider: Weak<TcpProvider>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let Some(provider) = provider.upgrade() else {
                    break;
                };
                tokio::spawn(async move {
                    if let Err(e) = provider.accept_channel(stream).await {
                        tracing::warn!("Rejected channel from {}: {}", addr, e);
                    }
                });
            }
            Err(e) => tracing::warn!("Accept failed: {}", e),
        }
    }
}

impl EngineProvider for TcpProvider {
    fn local_dev_id(&self) -> &str {
        &self.dev_id
    }

    fn create_engine(
        &self,
        peer_dev_id: &str,
        dh_id: DhId,
        role: EngineRole,
    ) -> Result<Arc<dyn TransEngine>> {
        let delivery = DeliveryQueue::spawn(format!("tcp-engine-{}", dh_id))?;
        let engine = Arc::new_cyclic(|me| TcpEngine {
            local_dev_id: self.dev_id.clone(),
            peer_dev_id: peer_dev_id.to_string(),
            peer_addr: self.peers.get(peer_dev_id).map(|a| *a),
            dh_id,
            role,
            handle: self.handle.clone(),
            write_queue_frames: self.write_queue_frames,
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            started: AtomicBool::new(false),
            delivery,
            me: me.clone(),
        });
        self.engines
            .insert((peer_dev_id.to_string(), dh_id), Arc::downgrade(&engine));
        Ok(engine)
    }

    fn set_listener(&self, listener: Weak<dyn ProviderListener>) {
        *self.listener.lock() = Some(listener);
    }
}

impl Drop for TcpProvider {
    fn drop(&mut self) {
        self.shutdown();
    }
}

pub struct TcpEngine {
    local_dev_id: String,
    peer_dev_id: String,
    peer_addr: Option<SocketAddr>,
    dh_id: DhId,
    role: EngineRole,
    handle: Handle,
    write_queue_frames: usize,
    writer: Mutex<Option<mpsc::Sender<Frame>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    delivery: DeliveryQueue,
    me: Weak<TcpEngine>,
}

impl TcpEngine {
    fn attach(&self, stream: TcpStream) {
        let (mut rd, mut wr) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Frame>(self.write_queue_frames);

        self.handle.spawn(async move {
            while let Some(frame) = rx.recv().await {
                let close = frame == Frame::Close;
                if let Err(e) = write_frame(&mut wr, &frame).await {
                    tracing::warn!("Channel write failed: {}", e);
                    break;
                }
                if close {
                    break;
                }
            }
            let _ = wr.shutdown().await;
        });

        *self.writer.lock() = Some(tx);
        tracing::info!(
            "Channel to {} for port {} open ({:?})",
            self.peer_dev_id,
            self.dh_id,
            self.role
        );
        // opened must reach the listener before anything the peer sends
        self.delivery
            .deliver(Delivery::Event(EngineEvent::ChannelOpened));

        let me = self.me.clone();
        let dh_id = self.dh_id;
        let reader = self.handle.spawn(async move {
            read_deliveries(&mut rd, dh_id, |delivery| match me.upgrade() {
                Some(engine) => {
                    engine.delivery.deliver(delivery);
                    true
                }
                None => false,
            })
            .await;
            if let Some(engine) = me.upgrade() {
                engine.writer.lock().take();
                engine
                    .delivery
                    .deliver(Delivery::Event(EngineEvent::ChannelClosed));
            }
        });

        if let Some(old) = self.reader.lock().replace(reader) {
            old.abort();
        }
    }

    fn send_frame(&self, frame: Frame) -> Result<()> {
        let writer = self.writer.lock();
        let tx = writer.as_ref().ok_or(TransportError::ChannelClosed)?;
        enqueue_frame(tx, frame)
    }
}

async fn connect(addr: SocketAddr, hello: Frame) -> Result<TcpStream> {
    let Frame::Hello { session, .. } = &hello else {
        return Err(TransportError::InvalidFrame("expected hello".into()).into());
    };
    let session = *session;
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;
    configure_stream(&stream)?;
    write_frame(&mut stream, &hello).await?;
    match read_frame(&mut stream).await? {
        Frame::HelloAck { session: ack } if ack == session => Ok(stream),
        Frame::Reject { reason } => Err(Error::ChannelCreateFailed(reason)),
        other => Err(TransportError::InvalidFrame(format!("expected ack, got {:?}", other)).into()),
    }
}

impl TransEngine for TcpEngine {
    fn initialize(&self, listener: Arc<dyn EngineListener>) -> Result<()> {
        self.delivery.set_listener(listener);
        Ok(())
    }

    fn create_control_channel(&self) -> Result<()> {
        if !self.delivery.has_listener() {
            return Err(TransportError::EngineNotInit.into());
        }
        let addr = self
            .peer_addr
            .ok_or_else(|| TransportError::UnknownPeer(self.peer_dev_id.clone()))?;
        let hello = Frame::Hello {
            dev_id: self.local_dev_id.clone(),
            dh_id: self.dh_id,
            role: self.role,
            session: Uuid::new_v4(),
        };
        let me = self.me.clone();
        self.handle.spawn(async move {
            let result = tokio::time::timeout(CHANNEL_WAIT_TIMEOUT, connect(addr, hello))
                .await
                .unwrap_or(Err(Error::WaitTimeout("channel handshake")));
            let Some(engine) = me.upgrade() else {
                return;
            };
            match result {
                Ok(stream) => engine.attach(stream),
                Err(e) => {
                    tracing::error!("Channel to {} failed: {}", addr, e);
                    engine
                        .delivery
                        .deliver(Delivery::Event(EngineEvent::TransError(e.to_string())));
                }
            }
        });
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::Release);
        self.delivery.deliver(Delivery::Event(EngineEvent::Started));
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.started.swap(false, Ordering::AcqRel) {
            self.delivery.deliver(Delivery::Event(EngineEvent::Stopped));
        }
        Ok(())
    }

    fn release(&self) -> Result<()> {
        self.started.store(false, Ordering::Release);
        if let Some(tx) = self.writer.lock().take() {
            // close waits behind queued audio rather than being dropped
            if let Err(mpsc::error::TrySendError::Full(close)) = tx.try_send(Frame::Close) {
                self.handle.spawn(async move {
                    let _ = tx.send(close).await;
                });
            }
        }
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        self.delivery.close();
        Ok(())
    }

    fn send_message(&self, event: &AudioEvent) -> Result<()> {
        self.send_frame(Frame::Message {
            event_type: event.event_type.into(),
            content: event.content.clone(),
        })
    }

    fn push_audio_data(&self, data: &AudioData) -> Result<()> {
        self.send_frame(Frame::Data {
            payload: data.data().to_vec(),
            pts: data.pts(),
        })
    }
}
