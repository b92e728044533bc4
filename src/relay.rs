use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::cryptography::Identity;
use crate::hops::HopTable;
use crate::networking::{read_frame, FrameSink, Link};
use crate::tunnel;
use crate::wire::{self, Frame};

/// One relay instance: configuration, local keypair, the hop table and the
/// currently connected control client. Constructed once at startup and
/// shared by every connection task, so several relays can coexist in one
/// process (which is how the integration tests run whole tunnels locally).
pub struct Relay {
    pub config: Config,
    pub identity: Identity,
    pub tunnels: HopTable,
    control_port: u16,
    api_port: u16,
    control: tokio::sync::Mutex<Option<FrameSink>>,
}

impl Relay {
    /// Bind both listeners and spawn their accept loops. Returns once the
    /// relay is reachable; the returned handle stays valid for the process
    /// lifetime.
    pub async fn start(config: Config, identity: Identity) -> Result<Arc<Relay>, Box<dyn Error>> {
        config.validate()?;

        let control_listener =
            TcpListener::bind((config.hostname.as_str(), config.module_port)).await?;
        let peer_listener = TcpListener::bind((config.hostname.as_str(), config.api_port)).await?;
        let control_port = control_listener.local_addr()?.port();
        let api_port = peer_listener.local_addr()?.port();
        info!("Control listener on {}:{}", config.hostname, control_port);
        info!("Peer listener on {}:{}", config.hostname, api_port);

        let relay = Arc::new(Relay {
            config,
            identity,
            tunnels: HopTable::new(),
            control_port,
            api_port,
            control: tokio::sync::Mutex::new(None),
        });

        tokio::spawn(relay.clone().accept_control(control_listener));
        tokio::spawn(relay.clone().accept_peers(peer_listener));
        Ok(relay)
    }

    /// Actual control listener port, resolved after binding.
    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    /// Actual peer listener port, resolved after binding.
    pub fn api_port(&self) -> u16 {
        self.api_port
    }

    async fn accept_control(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("Control client connected from {}", addr);
                    let relay = self.clone();
                    tokio::spawn(relay.serve_control(stream, addr));
                }
                Err(e) => warn!("Control accept failed: {}", e),
            }
        }
    }

    async fn accept_peers(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    info!("Peer connected from {}", addr);
                    let relay = self.clone();
                    tokio::spawn(async move {
                        let (read_half, write_half) = stream.into_split();
                        let link = Link::new(write_half, Some(addr));
                        relay.peer_read_loop(read_half, link, addr).await;
                    });
                }
                Err(e) => warn!("Peer accept failed: {}", e),
            }
        }
    }

    /// Serve one control client connection. Commands are dispatched to the
    /// tunnel engine; long-running builds are spawned so the client can
    /// keep issuing commands meanwhile.
    async fn serve_control(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (mut read_half, write_half) = stream.into_split();
        let sink = FrameSink::new(write_half);
        self.set_control(Some(sink.clone())).await;

        loop {
            let bytes = match read_frame(&mut read_half, self.config.timeout).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    info!("Control client {} disconnected", addr);
                    break;
                }
                Err(e) => {
                    warn!("Control socket {} failed: {}", addr, e);
                    break;
                }
            };
            let frame = match wire::parse(&bytes) {
                Ok(frame) => frame,
                Err(e) => {
                    // protocol errors do not imply a broken transport
                    warn!("Dropping bad frame from control client {}: {}", addr, e);
                    continue;
                }
            };
            match frame {
                Frame::TunnelBuild {
                    dest_addr,
                    dest_port,
                    hostkey,
                } => {
                    let relay = self.clone();
                    tokio::spawn(tunnel::handle_build(relay, dest_addr, dest_port, hostkey));
                }
                Frame::TunnelDestroy { tunnel_id } => {
                    tunnel::handle_destroy_command(&self, tunnel_id).await;
                }
                Frame::TunnelData { tunnel_id, payload } => {
                    tunnel::handle_outbound_data(&self, tunnel_id, payload).await;
                }
                Frame::TunnelCover { cover_size } => {
                    let relay = self.clone();
                    tokio::spawn(tunnel::handle_cover(relay, cover_size));
                }
                other => {
                    warn!(
                        "Unexpected frame type {} on control socket",
                        other.type_tag()
                    );
                }
            }
        }

        self.clear_control(&sink).await;
    }

    /// Read frames off one peer socket until it dies, dispatching each to
    /// the tunnel engine. Used for accepted peer connections and for
    /// connections this relay dialed once their ping exchange is done. On
    /// exit every tunnel routed over the socket is torn down.
    pub(crate) async fn peer_read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        link: Link,
        addr: SocketAddr,
    ) {
        loop {
            let bytes = match read_frame(&mut read_half, self.config.timeout).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    info!("Peer {} disconnected", addr);
                    break;
                }
                Err(e) => {
                    warn!("Peer socket {} failed: {}", addr, e);
                    break;
                }
            };
            match wire::parse(&bytes) {
                Ok(frame) => {
                    if !tunnel::handle_peer_frame(&self, &link, frame, &bytes).await {
                        debug!("Peer socket {} carries no tunnel anymore, closing", addr);
                        break;
                    }
                }
                Err(e) => {
                    // logged and dropped, the connection stays usable
                    warn!("Dropping bad frame from peer {}: {}", addr, e);
                }
            }
        }
        tunnel::reap_link(&self, link.id).await;
    }

    pub(crate) async fn set_control(&self, sink: Option<FrameSink>) {
        *self.control.lock().await = sink;
    }

    /// Forget the control sink only if it is still the one that is leaving,
    /// so a reconnected client is not clobbered by the old task's exit.
    pub(crate) async fn clear_control(&self, sink: &FrameSink) {
        let mut guard = self.control.lock().await;
        if matches!(guard.as_ref(), Some(current) if current.same(sink)) {
            *guard = None;
        }
    }

    /// Emit a frame to the connected control client, if any.
    pub async fn notify_control(&self, frame: Frame) {
        let guard = self.control.lock().await;
        match guard.as_ref() {
            Some(sink) => {
                if let Err(e) = sink.send(&frame).await {
                    warn!("Control client write failed: {}", e);
                }
            }
            None => debug!(
                "No control client connected, dropping frame type {}",
                frame.type_tag()
            ),
        }
    }

    /// Report a failed request for a tunnel to the control client.
    pub async fn emit_error(&self, request_type: u16, tunnel_id: u32) {
        self.notify_control(Frame::TunnelError {
            request_type,
            tunnel_id,
        })
        .await;
    }
}
