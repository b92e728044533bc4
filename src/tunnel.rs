use std::error::Error;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use log::{debug, info, warn};
use rand::Rng;
use tokio::net::tcp::OwnedReadHalf;

use crate::cryptography;
use crate::hops::{Hop, TunnelState};
use crate::networking::{self, read_frame, Link, LinkId};
use crate::relay::Relay;
use crate::rps;
use crate::wire::{self, Frame};

type EngineResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// Control-plane tunnel ids are 32 bits wide; the process keeps 16-bit ids
/// and zero-extends on the way out, so a wider id refers to no tunnel.
fn internal_id(wire_id: u32) -> Option<u16> {
    u16::try_from(wire_id).ok()
}

// ---------------------------------------------------------------------------
// Initiator role
// ---------------------------------------------------------------------------

/// Build one tunnel on behalf of the local control client and report the
/// outcome as TUNNEL_READY or TUNNEL_ERROR.
pub async fn handle_build(
    relay: Arc<Relay>,
    dest_addr: IpAddr,
    dest_port: u16,
    dest_hostkey: Vec<u8>,
) {
    let Some(id) = relay.tunnels.allocate().await else {
        warn!("Tunnel id space exhausted");
        relay.emit_error(wire::TUNNEL_BUILD, 0).await;
        return;
    };
    info!("Building tunnel {} toward {}:{}", id, dest_addr, dest_port);
    let dest = SocketAddr::new(dest_addr, dest_port);
    match construct(&relay, id, dest, &dest_hostkey).await {
        Ok((link, read_half, first_addr)) => {
            // from here on the first-hop socket carries steady-state traffic
            tokio::spawn(relay.clone().peer_read_loop(read_half, link, first_addr));
            relay
                .notify_control(Frame::TunnelReady {
                    tunnel_id: u32::from(id),
                    hostkey: dest_hostkey,
                })
                .await;
            info!("Tunnel {} is ready", id);
        }
        Err(e) => {
            warn!("Building tunnel {} failed: {}", id, e);
            teardown_partial(&relay, id).await;
            relay.emit_error(wire::TUNNEL_BUILD, u32::from(id)).await;
        }
    }
}

/// The hop-by-hop construction sequence: reach the first relay from the
/// peer source, lengthen the tunnel one relay at a time until the minimum
/// hop count is met, then bind the destination and verify its hostkey.
/// Each step is one synchronous request/response exchange on the first-hop
/// socket. Returns that socket for promotion into a read loop.
async fn construct(
    relay: &Arc<Relay>,
    id: u16,
    dest: SocketAddr,
    dest_hostkey: &[u8],
) -> EngineResult<(Link, OwnedReadHalf, SocketAddr)> {
    let peer = rps::get_random_peer(&relay.config.rps_addr, relay.config.timeout).await?;
    let first_addr = SocketAddr::new(peer.addr, peer.port);
    let (link, mut read_half, first_key) = ping_hop(relay, id, first_addr).await?;
    relay
        .tunnels
        .insert_or_update(id, |t| {
            t.next = Some(Hop::connected(
                Some(first_addr),
                first_key.clone(),
                link.clone(),
            ));
            t.hop_keys.push(first_key.clone());
        })
        .await;

    let mut last_key = first_key;
    for _ in 1..relay.config.min_hops {
        let query = Frame::ApiNextHopQuery { tunnel_id: id };
        let reply = exchange_sealed(relay, &link, &mut read_half, id, &last_key, &query).await?;
        let hostkey = match reply {
            Frame::ApiNextHopResponse { tunnel_id, hostkey } if tunnel_id == id => hostkey,
            other => {
                return Err(format!(
                    "expected a next hop response, got frame type {}",
                    other.type_tag()
                )
                .into())
            }
        };
        debug!("Tunnel {} extended by one hop", id);
        relay
            .tunnels
            .insert_or_update(id, |t| t.hop_keys.push(hostkey.clone()))
            .await;
        last_key = hostkey;
    }

    // the destination is dialed by the last intermediate, not sampled
    let query = Frame::ApiFinalHopQuery {
        tunnel_id: id,
        dest_addr: dest.ip(),
        dest_port: dest.port(),
        hostkey: dest_hostkey.to_vec(),
    };
    let reply = exchange_sealed(relay, &link, &mut read_half, id, &last_key, &query).await?;
    let observed = match reply {
        Frame::ApiNextHopResponse { tunnel_id, hostkey } if tunnel_id == id => hostkey,
        other => {
            return Err(format!(
                "expected the final hop response, got frame type {}",
                other.type_tag()
            )
            .into())
        }
    };
    if observed != dest_hostkey {
        return Err("destination hostkey does not match the requested one".into());
    }
    relay
        .tunnels
        .insert_or_update(id, |t| {
            t.hop_keys.push(observed);
            t.state = TunnelState::Active;
        })
        .await;
    Ok((link, read_half, first_addr))
}

/// Dial a peer, introduce this relay on the given tunnel and learn the
/// peer's hostkey from its sealed ping response.
async fn ping_hop(
    relay: &Arc<Relay>,
    tunnel_id: u16,
    addr: SocketAddr,
) -> EngineResult<(Link, OwnedReadHalf, Vec<u8>)> {
    let stream = networking::connect(addr, relay.config.timeout).await?;
    let (mut read_half, write_half) = stream.into_split();
    let link = Link::new(write_half, Some(addr));
    link.sink
        .send(&Frame::ApiPing {
            tunnel_id,
            hostkey: relay.identity.hostkey().to_vec(),
        })
        .await?;

    let bytes = read_frame(&mut read_half, relay.config.timeout)
        .await?
        .ok_or_else(|| format!("peer {} closed during the ping exchange", addr))?;
    let (outer_id, hop_fingerprint, payload) = match wire::parse(&bytes)? {
        Frame::ApiData {
            tunnel_id,
            hop_fingerprint,
            payload,
        } => (tunnel_id, hop_fingerprint, payload),
        other => {
            return Err(format!(
                "peer {} answered the ping with frame type {}",
                addr,
                other.type_tag()
            )
            .into())
        }
    };
    if outer_id != tunnel_id {
        return Err(format!("ping reply names tunnel {} instead of {}", outer_id, tunnel_id).into());
    }
    if hop_fingerprint != relay.identity.short_fingerprint() {
        return Err("ping reply is not addressed to this relay".into());
    }
    let plain = relay.identity.open(&payload)?;
    match wire::parse(&plain)? {
        Frame::ApiPingResponse { tunnel_id: id, hostkey } if id == tunnel_id => {
            Ok((link, read_half, hostkey))
        }
        other => Err(format!(
            "unexpected frame type {} inside the ping reply",
            other.type_tag()
        )
        .into()),
    }
}

/// Send a query sealed to the hop at `target_key` and wait for the sealed
/// reply on the same socket. Only the construction path reads inline like
/// this; afterwards the socket belongs to a read loop.
async fn exchange_sealed(
    relay: &Arc<Relay>,
    link: &Link,
    read_half: &mut OwnedReadHalf,
    id: u16,
    target_key: &[u8],
    query: &Frame,
) -> EngineResult<Frame> {
    send_sealed(link, id, target_key, query).await?;
    let bytes = read_frame(read_half, relay.config.timeout)
        .await?
        .ok_or("first hop closed mid construction")?;
    let (outer_id, hop_fingerprint, payload) = match wire::parse(&bytes)? {
        Frame::ApiData {
            tunnel_id,
            hop_fingerprint,
            payload,
        } => (tunnel_id, hop_fingerprint, payload),
        other => {
            return Err(format!(
                "expected a data envelope mid construction, got frame type {}",
                other.type_tag()
            )
            .into())
        }
    };
    if outer_id != id {
        return Err(format!("reply names tunnel {} instead of {}", outer_id, id).into());
    }
    if hop_fingerprint != relay.identity.short_fingerprint() {
        return Err("construction reply is not addressed to this relay".into());
    }
    let plain = relay.identity.open(&payload)?;
    Ok(wire::parse(&plain)?)
}

// ---------------------------------------------------------------------------
// Intermediate role
// ---------------------------------------------------------------------------

/// Dispatch one frame read off a peer socket. Returns false once the
/// socket no longer routes any tunnel and should close.
pub async fn handle_peer_frame(relay: &Arc<Relay>, link: &Link, frame: Frame, raw: &[u8]) -> bool {
    match frame {
        Frame::ApiPing { tunnel_id, hostkey } => handle_ping(relay, link, tunnel_id, hostkey).await,
        Frame::ApiData {
            tunnel_id,
            hop_fingerprint,
            payload,
        } => handle_api_data(relay, link, tunnel_id, hop_fingerprint, payload, raw).await,
        Frame::TunnelDestroy { tunnel_id } => {
            handle_peer_destroy(relay, link, tunnel_id).await;
            return relay.tunnels.link_in_use(link.id).await;
        }
        other => warn!(
            "Dropping unexpected frame type {} on peer socket",
            other.type_tag()
        ),
    }
    true
}

/// A ping opens a tunnel: the sending connection becomes the previous hop,
/// fixed for the tunnel's lifetime, and the sender learns our hostkey from
/// a response sealed to the key it announced.
async fn handle_ping(relay: &Arc<Relay>, link: &Link, tunnel_id: u16, sender_hostkey: Vec<u8>) {
    let hop = Hop::connected(link.peer_addr, sender_hostkey.clone(), link.clone());
    if !relay.tunnels.adopt(tunnel_id, hop).await {
        warn!("Ignoring ping for already known tunnel {}", tunnel_id);
        return;
    }
    debug!("New inbound tunnel {} from {:?}", tunnel_id, link.peer_addr);
    let response = Frame::ApiPingResponse {
        tunnel_id,
        hostkey: relay.identity.hostkey().to_vec(),
    };
    if let Err(e) = send_sealed(link, tunnel_id, &sender_hostkey, &response).await {
        warn!("Answering ping on tunnel {} failed: {}", tunnel_id, e);
    }
}

/// The forward-or-terminate rule. The cleartext fingerprint decides in O(1)
/// whether this relay may decrypt the payload or must pass the frame on
/// unchanged to the tunnel's other side.
async fn handle_api_data(
    relay: &Arc<Relay>,
    link: &Link,
    tunnel_id: u16,
    hop_fingerprint: u16,
    payload: Vec<u8>,
    raw: &[u8],
) {
    if hop_fingerprint == relay.identity.short_fingerprint() {
        let plain = match relay.identity.open(&payload) {
            Ok(plain) => plain,
            Err(e) => {
                warn!(
                    "Cannot open frame addressed to us on tunnel {}: {}",
                    tunnel_id, e
                );
                return;
            }
        };
        match wire::parse(&plain) {
            Ok(inner) => handle_peeled(relay, link, inner).await,
            Err(e) => warn!("Peeled garbage on tunnel {}: {}", tunnel_id, e),
        }
    } else {
        forward_verbatim(relay, link, tunnel_id, raw).await;
    }
}

/// Act on a frame recovered from under our encryption layer.
async fn handle_peeled(relay: &Arc<Relay>, link: &Link, inner: Frame) {
    match inner {
        Frame::ApiNextHopQuery { tunnel_id } => extend_tunnel(relay, tunnel_id, None).await,
        Frame::ApiFinalHopQuery {
            tunnel_id,
            dest_addr,
            dest_port,
            hostkey,
        } => {
            let dest = SocketAddr::new(dest_addr, dest_port);
            extend_tunnel(relay, tunnel_id, Some((dest, hostkey))).await;
        }
        Frame::ApiNextHopResponse { tunnel_id, hostkey } => {
            let response = Frame::ApiNextHopResponse { tunnel_id, hostkey };
            relay_upstream(relay, tunnel_id, response).await
        }
        Frame::TunnelData { tunnel_id, payload } => {
            deliver_or_climb(relay, link, tunnel_id, payload).await
        }
        Frame::ApiData {
            tunnel_id,
            hop_fingerprint,
            payload,
        } => {
            // nested envelope: run the addressing decision again
            let nested = Frame::ApiData {
                tunnel_id,
                hop_fingerprint,
                payload: payload.clone(),
            };
            match nested.serialize() {
                Ok(raw) => {
                    Box::pin(handle_api_data(
                        relay,
                        link,
                        tunnel_id,
                        hop_fingerprint,
                        payload,
                        &raw,
                    ))
                    .await
                }
                Err(e) => warn!("Cannot reframe nested envelope: {}", e),
            }
        }
        other => warn!("Dropping unexpected peeled frame type {}", other.type_tag()),
    }
}

/// Lengthen a tunnel by one relay. For a next-hop query the new relay comes
/// from the peer source; for a final-hop query it is the given destination.
/// Either way the previous hop receives the new relay's observed hostkey,
/// sealed to it, so only the initiator ever learns the full chain of keys.
fn extend_tunnel(
    relay: &Arc<Relay>,
    tunnel_id: u16,
    dest: Option<(SocketAddr, Vec<u8>)>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        let Some(tunnel) = relay.tunnels.lookup(tunnel_id).await else {
            warn!("Extension request for unknown tunnel {}", tunnel_id);
            return;
        };
        let Some(prev) = tunnel.prev.clone() else {
            warn!("Extension request on tunnel {} without a previous hop", tunnel_id);
            return;
        };
        if tunnel.next.is_some() {
            warn!("Tunnel {} already has a next hop", tunnel_id);
            return;
        }
        let target_addr = match &dest {
            Some((addr, _)) => *addr,
            None => match rps::get_random_peer(&relay.config.rps_addr, relay.config.timeout).await {
                Ok(peer) => SocketAddr::new(peer.addr, peer.port),
                Err(e) => {
                    warn!("Peer source failed while extending tunnel {}: {}", tunnel_id, e);
                    return;
                }
            },
        };

        match ping_hop(relay, tunnel_id, target_addr).await {
            Ok((new_link, read_half, observed_hostkey)) => {
                relay
                    .tunnels
                    .insert_or_update(tunnel_id, |t| {
                        t.next = Some(Hop::connected(
                            Some(target_addr),
                            observed_hostkey.clone(),
                            new_link.clone(),
                        ));
                    })
                    .await;
                tokio::spawn(
                    relay
                        .clone()
                        .peer_read_loop(read_half, new_link, target_addr),
                );
                debug!("Tunnel {} extended to {}", tunnel_id, target_addr);
                let response = Frame::ApiNextHopResponse {
                    tunnel_id,
                    hostkey: observed_hostkey,
                };
                if let Err(e) = send_sealed_to_hop(&prev, tunnel_id, &response).await {
                    warn!("Answering extension on tunnel {} failed: {}", tunnel_id, e);
                }
            }
            Err(e) => warn!(
                "Extending tunnel {} to {} failed: {}",
                tunnel_id, target_addr, e
            ),
        }
    })
}

/// Pass a frame on unchanged to whichever side of the tunnel the sender is
/// not. Exactly one socket receives it; a missing tunnel or far side is
/// reported and the frame dropped.
async fn forward_verbatim(relay: &Arc<Relay>, link: &Link, tunnel_id: u16, raw: &[u8]) {
    let Some(tunnel) = relay.tunnels.lookup(tunnel_id).await else {
        warn!("No tunnel {} for forwarded frame", tunnel_id);
        relay.emit_error(wire::TUNNEL_DATA, u32::from(tunnel_id)).await;
        return;
    };
    let outbound = tunnel.opposite(link.id).and_then(|hop| hop.link.clone());
    match outbound {
        Some(out) => {
            if let Err(e) = out.sink.send_raw(raw).await {
                warn!("Forwarding on tunnel {} failed: {}", tunnel_id, e);
            }
        }
        None => {
            warn!("Tunnel {} has no far side for a forwarded frame", tunnel_id);
            relay.emit_error(wire::TUNNEL_DATA, u32::from(tunnel_id)).await;
        }
    }
}

/// Responses travel hop by hop toward the initiator, re-sealed at each
/// relay for its upstream neighbor.
async fn relay_upstream(relay: &Arc<Relay>, tunnel_id: u16, frame: Frame) {
    let Some(tunnel) = relay.tunnels.lookup(tunnel_id).await else {
        warn!("Response for unknown tunnel {}", tunnel_id);
        return;
    };
    match &tunnel.prev {
        Some(prev) => {
            if let Err(e) = send_sealed_to_hop(prev, tunnel_id, &frame).await {
                warn!("Relaying response on tunnel {} failed: {}", tunnel_id, e);
            }
        }
        None => warn!(
            "Dropping response on tunnel {} with no upstream neighbor",
            tunnel_id
        ),
    }
}

/// User payload recovered from under our layer: climb further toward the
/// initiator, or hand it to the local control client at either tunnel end.
async fn deliver_or_climb(relay: &Arc<Relay>, link: &Link, wire_id: u32, payload: Vec<u8>) {
    let Some(id) = internal_id(wire_id) else {
        warn!("Data frame with out of range tunnel id {}", wire_id);
        return;
    };
    let Some(tunnel) = relay.tunnels.lookup(id).await else {
        warn!("Data for unknown tunnel {}", id);
        return;
    };
    if tunnel.is_next_link(link.id) {
        // came up from the destination side
        match &tunnel.prev {
            Some(prev) => {
                let frame = Frame::TunnelData {
                    tunnel_id: wire_id,
                    payload,
                };
                if let Err(e) = send_sealed_to_hop(prev, id, &frame).await {
                    warn!("Climbing data on tunnel {} failed: {}", id, e);
                }
            }
            None => {
                // this relay initiated the tunnel
                relay
                    .notify_control(Frame::TunnelData {
                        tunnel_id: wire_id,
                        payload,
                    })
                    .await;
            }
        }
    } else if tunnel.next.is_none() {
        // the tunnel terminates here; announce it on first data
        if !tunnel.announced {
            relay.tunnels.insert_or_update(id, |t| t.announced = true).await;
            relay
                .notify_control(Frame::TunnelIncoming { tunnel_id: wire_id })
                .await;
        }
        relay
            .notify_control(Frame::TunnelData {
                tunnel_id: wire_id,
                payload,
            })
            .await;
    } else {
        warn!("Dropping data frame addressed to mid-tunnel relay on {}", id);
    }
}

// ---------------------------------------------------------------------------
// Teardown, user data, cover traffic
// ---------------------------------------------------------------------------

/// TUNNEL_DESTROY from the control client: drop the tunnel, tell each live
/// neighbor first so they can reap their own state.
pub async fn handle_destroy_command(relay: &Arc<Relay>, wire_id: u32) {
    let Some(id) = internal_id(wire_id) else {
        relay.emit_error(wire::TUNNEL_DESTROY, wire_id).await;
        return;
    };
    let Some(tunnel) = relay.tunnels.lookup(id).await else {
        warn!("Destroy for unknown tunnel {}", id);
        relay.emit_error(wire::TUNNEL_DESTROY, wire_id).await;
        return;
    };
    info!("Destroying tunnel {}", id);
    relay
        .tunnels
        .insert_or_update(id, |t| t.state = TunnelState::TearingDown)
        .await;
    for hop in [&tunnel.prev, &tunnel.next].into_iter().flatten() {
        if let Some(out) = &hop.link {
            if let Err(e) = out.sink.send(&Frame::TunnelDestroy { tunnel_id: wire_id }).await {
                debug!("Destroy notification on tunnel {} failed: {}", id, e);
            }
        }
    }
    relay.tunnels.remove(id).await;
}

/// A destroy arriving over a peer socket: reap and pass it along the
/// remaining direction.
async fn handle_peer_destroy(relay: &Arc<Relay>, link: &Link, wire_id: u32) {
    let Some(id) = internal_id(wire_id) else {
        return;
    };
    let Some(tunnel) = relay.tunnels.remove(id).await else {
        debug!("Destroy for unknown tunnel {}", id);
        return;
    };
    info!("Tunnel {} destroyed by a neighbor", id);
    if let Some(out) = tunnel.opposite(link.id).and_then(|hop| hop.link.clone()) {
        let _ = out.sink.send(&Frame::TunnelDestroy { tunnel_id: wire_id }).await;
    }
}

/// TUNNEL_DATA from the local control client. At the initiator the payload
/// is sealed straight to the destination so intermediates only forward; at
/// the far end it climbs the tunnel hop by hop.
pub async fn handle_outbound_data(relay: &Arc<Relay>, wire_id: u32, payload: Vec<u8>) {
    let Some(id) = internal_id(wire_id) else {
        relay.emit_error(wire::TUNNEL_DATA, wire_id).await;
        return;
    };
    let Some(tunnel) = relay.tunnels.lookup(id).await else {
        relay.emit_error(wire::TUNNEL_DATA, wire_id).await;
        return;
    };
    if tunnel.state != TunnelState::Active {
        warn!("Data for tunnel {} in state {:?}", id, tunnel.state);
        relay.emit_error(wire::TUNNEL_DATA, wire_id).await;
        return;
    }
    let frame = Frame::TunnelData {
        tunnel_id: wire_id,
        payload,
    };
    let sent = if tunnel.prev.is_none() {
        let dest_key = tunnel.hop_keys.last().cloned();
        let out = tunnel.next.as_ref().and_then(|hop| hop.link.clone());
        match (dest_key, out) {
            (Some(key), Some(out)) => send_sealed(&out, id, &key, &frame).await,
            _ => Err("tunnel has no destination key or next hop".into()),
        }
    } else if tunnel.next.is_none() {
        match &tunnel.prev {
            Some(prev) => send_sealed_to_hop(prev, id, &frame).await,
            None => Err("tunnel has no hops at all".into()),
        }
    } else {
        Err("control client cannot inject data on a transit tunnel".into())
    };
    if let Err(e) = sent {
        warn!("Sending data on tunnel {} failed: {}", id, e);
        relay.emit_error(wire::TUNNEL_DATA, wire_id).await;
    }
}

/// TUNNEL_COVER: build an ephemeral tunnel to a random destination, push
/// the requested amount of noise through it, then tear it down. Only legal
/// while no tunnel is active, and never acknowledged with TUNNEL_READY.
pub async fn handle_cover(relay: Arc<Relay>, cover_size: u16) {
    if relay.tunnels.any_active().await {
        warn!("Rejecting cover traffic while a tunnel is active");
        relay.emit_error(wire::TUNNEL_COVER, 0).await;
        return;
    }
    let dest = match rps::get_random_peer(&relay.config.rps_addr, relay.config.timeout).await {
        Ok(peer) => peer,
        Err(e) => {
            warn!("Peer source failed for cover traffic: {}", e);
            relay.emit_error(wire::TUNNEL_COVER, 0).await;
            return;
        }
    };
    let Some(id) = relay.tunnels.allocate().await else {
        relay.emit_error(wire::TUNNEL_COVER, 0).await;
        return;
    };
    let dest_addr = SocketAddr::new(dest.addr, dest.port);
    match construct(&relay, id, dest_addr, &dest.hostkey).await {
        Ok((link, _read_half, _first_addr)) => {
            let mut noise = vec![0u8; usize::from(cover_size)];
            rand::thread_rng().fill(&mut noise[..]);
            let frame = Frame::TunnelData {
                tunnel_id: u32::from(id),
                payload: noise,
            };
            if let Err(e) = send_sealed(&link, id, &dest.hostkey, &frame).await {
                warn!("Sending cover payload on tunnel {} failed: {}", id, e);
            }
            let _ = link
                .sink
                .send(&Frame::TunnelDestroy {
                    tunnel_id: u32::from(id),
                })
                .await;
            relay.tunnels.remove(id).await;
            info!("Cover tunnel {} carried {} bytes and was torn down", id, cover_size);
        }
        Err(e) => {
            warn!("Cover tunnel {} failed: {}", id, e);
            teardown_partial(&relay, id).await;
            relay.emit_error(wire::TUNNEL_COVER, u32::from(id)).await;
        }
    }
}

/// A socket died: every tunnel routed over it is gone. The surviving side
/// is told, and tunnels this relay initiated surface as TUNNEL_ERROR.
pub async fn reap_link(relay: &Arc<Relay>, link: LinkId) {
    let dead = relay.tunnels.remove_by_link(link).await;
    for tunnel in dead {
        warn!("Tunnel {} lost its socket, tearing down", tunnel.id);
        for hop in [&tunnel.prev, &tunnel.next].into_iter().flatten() {
            if let Some(out) = &hop.link {
                if out.id != link {
                    let _ = out
                        .sink
                        .send(&Frame::TunnelDestroy {
                            tunnel_id: u32::from(tunnel.id),
                        })
                        .await;
                }
            }
        }
        if tunnel.prev.is_none() {
            let request_type = if tunnel.state == TunnelState::Building {
                wire::TUNNEL_BUILD
            } else {
                wire::TUNNEL_DATA
            };
            relay.emit_error(request_type, u32::from(tunnel.id)).await;
        }
    }
}

/// Reap whatever a failed construction left behind.
async fn teardown_partial(relay: &Arc<Relay>, id: u16) {
    if relay.tunnels.remove(id).await.is_some() {
        debug!("Reaped partial state of tunnel {}", id);
    }
}

// ---------------------------------------------------------------------------
// Sealing helpers
// ---------------------------------------------------------------------------

/// Seal a frame to `target_key` and send it as an API_DATA envelope whose
/// cleartext fingerprint routes it to the matching hop.
async fn send_sealed(
    link: &Link,
    tunnel_id: u16,
    target_key: &[u8],
    frame: &Frame,
) -> EngineResult<()> {
    let payload = cryptography::seal(&frame.serialize()?, target_key)?;
    link.sink
        .send(&Frame::ApiData {
            tunnel_id,
            hop_fingerprint: cryptography::short_fingerprint(target_key),
            payload,
        })
        .await?;
    Ok(())
}

async fn send_sealed_to_hop(hop: &Hop, tunnel_id: u16, frame: &Frame) -> EngineResult<()> {
    let hostkey = hop.hostkey.as_ref().ok_or("hop hostkey unknown")?;
    let link = hop.link.as_ref().ok_or("hop not connected")?;
    send_sealed(link, tunnel_id, hostkey, frame).await
}
