use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use thiserror::Error;

use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

// Control-plane frame types (32-bit tunnel ids on the wire)
pub const TUNNEL_BUILD: u16 = 560;
pub const TUNNEL_READY: u16 = 561;
pub const TUNNEL_INCOMING: u16 = 562;
pub const TUNNEL_DESTROY: u16 = 563;
pub const TUNNEL_DATA: u16 = 564;
pub const TUNNEL_ERROR: u16 = 565;
pub const TUNNEL_COVER: u16 = 566;

// Peer sampling service
pub const RPS_QUERY: u16 = 540;
pub const RPS_PEER: u16 = 541;

// Relay-to-relay API (16-bit tunnel ids on the wire)
pub const API_PING: u16 = 9000;
pub const API_PING_RESPONSE: u16 = 9001;
pub const API_NEXT_HOP_QUERY: u16 = 9002;
pub const API_NEXT_HOP_RESPONSE: u16 = 9003;
pub const API_FINAL_HOP_QUERY: u16 = 9004;
pub const API_DATA: u16 = 9005;

/// Low bit of an address flags field. Set means the address is IPv6 (16
/// bytes on the wire), clear means IPv4 (4 bytes).
const FLAG_IPV6: u16 = 0x0001;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("frame is shorter than its length header declares")]
    Truncated,
    #[error("unknown frame type {0}")]
    UnknownType(u16),
    #[error("malformed {0} body")]
    Malformed(&'static str),
    #[error("frame would exceed the 16-bit length space")]
    Oversize,
}

/// One frame of the fixed wire vocabulary. Every frame starts with a 16-bit
/// big-endian length covering header and body, followed by a 16-bit
/// big-endian type tag selecting the body layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    TunnelBuild {
        dest_addr: IpAddr,
        dest_port: u16,
        hostkey: Vec<u8>,
    },
    TunnelReady {
        tunnel_id: u32,
        hostkey: Vec<u8>,
    },
    TunnelIncoming {
        tunnel_id: u32,
    },
    TunnelDestroy {
        tunnel_id: u32,
    },
    TunnelData {
        tunnel_id: u32,
        payload: Vec<u8>,
    },
    TunnelError {
        request_type: u16,
        tunnel_id: u32,
    },
    TunnelCover {
        cover_size: u16,
    },
    RpsQuery,
    RpsPeer {
        port: u16,
        portmap: Vec<(u16, u16)>,
        addr: IpAddr,
        hostkey: Vec<u8>,
    },
    ApiPing {
        tunnel_id: u16,
        hostkey: Vec<u8>,
    },
    ApiPingResponse {
        tunnel_id: u16,
        hostkey: Vec<u8>,
    },
    ApiNextHopQuery {
        tunnel_id: u16,
    },
    ApiNextHopResponse {
        tunnel_id: u16,
        hostkey: Vec<u8>,
    },
    ApiFinalHopQuery {
        tunnel_id: u16,
        dest_addr: IpAddr,
        dest_port: u16,
        hostkey: Vec<u8>,
    },
    ApiData {
        tunnel_id: u16,
        hop_fingerprint: u16,
        payload: Vec<u8>,
    },
}

impl Frame {
    pub fn type_tag(&self) -> u16 {
        match self {
            Frame::TunnelBuild { .. } => TUNNEL_BUILD,
            Frame::TunnelReady { .. } => TUNNEL_READY,
            Frame::TunnelIncoming { .. } => TUNNEL_INCOMING,
            Frame::TunnelDestroy { .. } => TUNNEL_DESTROY,
            Frame::TunnelData { .. } => TUNNEL_DATA,
            Frame::TunnelError { .. } => TUNNEL_ERROR,
            Frame::TunnelCover { .. } => TUNNEL_COVER,
            Frame::RpsQuery => RPS_QUERY,
            Frame::RpsPeer { .. } => RPS_PEER,
            Frame::ApiPing { .. } => API_PING,
            Frame::ApiPingResponse { .. } => API_PING_RESPONSE,
            Frame::ApiNextHopQuery { .. } => API_NEXT_HOP_QUERY,
            Frame::ApiNextHopResponse { .. } => API_NEXT_HOP_RESPONSE,
            Frame::ApiFinalHopQuery { .. } => API_FINAL_HOP_QUERY,
            Frame::ApiData { .. } => API_DATA,
        }
    }

    /// Serialize the frame into its on-wire byte representation.
    /// `parse(serialize(f))` returns `f` for every valid frame.
    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut body = Vec::new();
        match self {
            Frame::TunnelBuild {
                dest_addr,
                dest_port,
                hostkey,
            } => {
                body.extend_from_slice(&addr_flags(dest_addr).to_be_bytes());
                body.extend_from_slice(&dest_port.to_be_bytes());
                push_addr(&mut body, dest_addr);
                body.extend_from_slice(hostkey);
            }
            Frame::TunnelReady { tunnel_id, hostkey } => {
                body.extend_from_slice(&[0, 0]);
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(hostkey);
            }
            Frame::TunnelIncoming { tunnel_id } | Frame::TunnelDestroy { tunnel_id } => {
                body.extend_from_slice(&[0, 0]);
                body.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::TunnelData { tunnel_id, payload } => {
                body.extend_from_slice(&[0, 0]);
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(payload);
            }
            Frame::TunnelError {
                request_type,
                tunnel_id,
            } => {
                body.extend_from_slice(&request_type.to_be_bytes());
                body.extend_from_slice(&[0, 0]);
                body.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::TunnelCover { cover_size } => {
                body.extend_from_slice(&cover_size.to_be_bytes());
                body.extend_from_slice(&[0, 0]);
            }
            Frame::RpsQuery => {}
            Frame::RpsPeer {
                port,
                portmap,
                addr,
                hostkey,
            } => {
                if portmap.len() > u8::MAX as usize {
                    return Err(WireError::Oversize);
                }
                body.extend_from_slice(&port.to_be_bytes());
                body.push(portmap.len() as u8);
                body.push((addr_flags(addr) & 0x00FF) as u8);
                for (module, module_port) in portmap {
                    body.extend_from_slice(&module.to_be_bytes());
                    body.extend_from_slice(&module_port.to_be_bytes());
                }
                push_addr(&mut body, addr);
                body.extend_from_slice(hostkey);
            }
            Frame::ApiPing { tunnel_id, hostkey }
            | Frame::ApiPingResponse { tunnel_id, hostkey } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(hostkey);
            }
            Frame::ApiNextHopQuery { tunnel_id } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
            }
            Frame::ApiNextHopResponse { tunnel_id, hostkey } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(&[0, 0]);
                body.extend_from_slice(hostkey);
            }
            Frame::ApiFinalHopQuery {
                tunnel_id,
                dest_addr,
                dest_port,
                hostkey,
            } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(&dest_port.to_be_bytes());
                body.extend_from_slice(&addr_flags(dest_addr).to_be_bytes());
                push_addr(&mut body, dest_addr);
                body.extend_from_slice(hostkey);
            }
            Frame::ApiData {
                tunnel_id,
                hop_fingerprint,
                payload,
            } => {
                body.extend_from_slice(&tunnel_id.to_be_bytes());
                body.extend_from_slice(&hop_fingerprint.to_be_bytes());
                body.extend_from_slice(payload);
            }
        }
        finish(self.type_tag(), body)
    }
}

/// Parse one frame from `bytes`. The buffer may be longer than the frame;
/// anything past the declared length is ignored. Never panics on short or
/// garbage input.
pub fn parse(bytes: &[u8]) -> Result<Frame, WireError> {
    if bytes.len() < FRAME_HEADER_SIZE {
        return Err(WireError::Truncated);
    }
    let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let tag = u16::from_be_bytes([bytes[2], bytes[3]]);
    if declared < FRAME_HEADER_SIZE {
        return Err(WireError::Malformed("header"));
    }
    if bytes.len() < declared {
        return Err(WireError::Truncated);
    }
    let body = &bytes[FRAME_HEADER_SIZE..declared];
    match tag {
        TUNNEL_BUILD => parse_tunnel_build(body),
        TUNNEL_READY => Ok(Frame::TunnelReady {
            tunnel_id: u32_at(body, 2, "TUNNEL_READY")?,
            hostkey: rest(body, 6),
        }),
        TUNNEL_INCOMING => Ok(Frame::TunnelIncoming {
            tunnel_id: u32_at(body, 2, "TUNNEL_INCOMING")?,
        }),
        TUNNEL_DESTROY => Ok(Frame::TunnelDestroy {
            tunnel_id: u32_at(body, 2, "TUNNEL_DESTROY")?,
        }),
        TUNNEL_DATA => Ok(Frame::TunnelData {
            tunnel_id: u32_at(body, 2, "TUNNEL_DATA")?,
            payload: rest(body, 6),
        }),
        TUNNEL_ERROR => Ok(Frame::TunnelError {
            request_type: u16_at(body, 0, "TUNNEL_ERROR")?,
            tunnel_id: u32_at(body, 4, "TUNNEL_ERROR")?,
        }),
        TUNNEL_COVER => {
            // two reserved bytes follow the size
            u16_at(body, 2, "TUNNEL_COVER")?;
            Ok(Frame::TunnelCover {
                cover_size: u16_at(body, 0, "TUNNEL_COVER")?,
            })
        }
        RPS_QUERY => Ok(Frame::RpsQuery),
        RPS_PEER => parse_rps_peer(body),
        API_PING => Ok(Frame::ApiPing {
            tunnel_id: u16_at(body, 0, "API_PING")?,
            hostkey: rest(body, 2),
        }),
        API_PING_RESPONSE => Ok(Frame::ApiPingResponse {
            tunnel_id: u16_at(body, 0, "API_PING_RESPONSE")?,
            hostkey: rest(body, 2),
        }),
        API_NEXT_HOP_QUERY => Ok(Frame::ApiNextHopQuery {
            tunnel_id: u16_at(body, 0, "API_NEXT_HOP_QUERY")?,
        }),
        API_NEXT_HOP_RESPONSE => {
            u16_at(body, 2, "API_NEXT_HOP_RESPONSE")?;
            Ok(Frame::ApiNextHopResponse {
                tunnel_id: u16_at(body, 0, "API_NEXT_HOP_RESPONSE")?,
                hostkey: rest(body, 4),
            })
        }
        API_FINAL_HOP_QUERY => parse_final_hop_query(body),
        API_DATA => Ok(Frame::ApiData {
            tunnel_id: u16_at(body, 0, "API_DATA")?,
            hop_fingerprint: u16_at(body, 2, "API_DATA")?,
            payload: rest(body, 4),
        }),
        other => Err(WireError::UnknownType(other)),
    }
}

fn parse_tunnel_build(body: &[u8]) -> Result<Frame, WireError> {
    let flags = u16_at(body, 0, "TUNNEL_BUILD")?;
    let dest_port = u16_at(body, 2, "TUNNEL_BUILD")?;
    let (dest_addr, hostkey_at) = take_addr(body, 4, flags & FLAG_IPV6 != 0, "TUNNEL_BUILD")?;
    Ok(Frame::TunnelBuild {
        dest_addr,
        dest_port,
        hostkey: rest(body, hostkey_at),
    })
}

fn parse_final_hop_query(body: &[u8]) -> Result<Frame, WireError> {
    let tunnel_id = u16_at(body, 0, "API_FINAL_HOP_QUERY")?;
    let dest_port = u16_at(body, 2, "API_FINAL_HOP_QUERY")?;
    let flags = u16_at(body, 4, "API_FINAL_HOP_QUERY")?;
    // the hostkey starts right after the 4- or 16-byte address
    let (dest_addr, hostkey_at) =
        take_addr(body, 6, flags & FLAG_IPV6 != 0, "API_FINAL_HOP_QUERY")?;
    Ok(Frame::ApiFinalHopQuery {
        tunnel_id,
        dest_addr,
        dest_port,
        hostkey: rest(body, hostkey_at),
    })
}

fn parse_rps_peer(body: &[u8]) -> Result<Frame, WireError> {
    let port = u16_at(body, 0, "RPS_PEER")?;
    let count = *body.get(2).ok_or(WireError::Malformed("RPS_PEER"))? as usize;
    let flags = *body.get(3).ok_or(WireError::Malformed("RPS_PEER"))? as u16;
    let mut portmap = Vec::with_capacity(count);
    let mut at = 4;
    for _ in 0..count {
        portmap.push((
            u16_at(body, at, "RPS_PEER")?,
            u16_at(body, at + 2, "RPS_PEER")?,
        ));
        at += 4;
    }
    let (addr, hostkey_at) = take_addr(body, at, flags & FLAG_IPV6 != 0, "RPS_PEER")?;
    Ok(Frame::RpsPeer {
        port,
        portmap,
        addr,
        hostkey: rest(body, hostkey_at),
    })
}

fn finish(tag: u16, body: Vec<u8>) -> Result<Vec<u8>, WireError> {
    let total = body.len() + FRAME_HEADER_SIZE;
    if total > MAX_FRAME_SIZE {
        return Err(WireError::Oversize);
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&(total as u16).to_be_bytes());
    out.extend_from_slice(&tag.to_be_bytes());
    out.extend(body);
    Ok(out)
}

fn addr_flags(addr: &IpAddr) -> u16 {
    match addr {
        IpAddr::V4(_) => 0,
        IpAddr::V6(_) => FLAG_IPV6,
    }
}

fn push_addr(body: &mut Vec<u8>, addr: &IpAddr) {
    match addr {
        IpAddr::V4(a) => body.extend_from_slice(&a.octets()),
        IpAddr::V6(a) => body.extend_from_slice(&a.octets()),
    }
}

fn take_addr(
    body: &[u8],
    at: usize,
    v6: bool,
    ctx: &'static str,
) -> Result<(IpAddr, usize), WireError> {
    if v6 {
        let raw: [u8; 16] = fixed(body, at, ctx)?;
        Ok((IpAddr::V6(Ipv6Addr::from(raw)), at + 16))
    } else {
        let raw: [u8; 4] = fixed(body, at, ctx)?;
        Ok((IpAddr::V4(Ipv4Addr::from(raw)), at + 4))
    }
}

fn fixed<const N: usize>(body: &[u8], at: usize, ctx: &'static str) -> Result<[u8; N], WireError> {
    body.get(at..at + N)
        .and_then(|s| <[u8; N]>::try_from(s).ok())
        .ok_or(WireError::Malformed(ctx))
}

fn u16_at(body: &[u8], at: usize, ctx: &'static str) -> Result<u16, WireError> {
    Ok(u16::from_be_bytes(fixed(body, at, ctx)?))
}

fn u32_at(body: &[u8], at: usize, ctx: &'static str) -> Result<u32, WireError> {
    Ok(u32::from_be_bytes(fixed(body, at, ctx)?))
}

fn rest(body: &[u8], at: usize) -> Vec<u8> {
    body.get(at..).unwrap_or_default().to_vec()
}

// Testing Suite:
// - Round trip for every frame variant, both address versions
// - Payload/hostkey lengths 0, 1, 16, 1024
// - Truncation on every prefix of a valid frame
// - Unknown tag and malformed body rejection

#[cfg(test)]
mod tests {
    use super::*;

    fn v4() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn v6() -> IpAddr {
        IpAddr::V6(Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 9))
    }

    fn payload_sizes() -> Vec<Vec<u8>> {
        vec![vec![], vec![0xAB], vec![7u8; 16], vec![42u8; 1024]]
    }

    fn sample_frames() -> Vec<Frame> {
        let mut frames = Vec::new();
        for addr in [v4(), v6()] {
            for bytes in payload_sizes() {
                frames.push(Frame::TunnelBuild {
                    dest_addr: addr,
                    dest_port: 1400,
                    hostkey: bytes.clone(),
                });
                frames.push(Frame::ApiFinalHopQuery {
                    tunnel_id: 7,
                    dest_addr: addr,
                    dest_port: 1400,
                    hostkey: bytes.clone(),
                });
                frames.push(Frame::RpsPeer {
                    port: 6001,
                    portmap: vec![(560, 6301), (520, 6201)],
                    addr,
                    hostkey: bytes.clone(),
                });
            }
        }
        for bytes in payload_sizes() {
            frames.push(Frame::TunnelReady {
                tunnel_id: 0xDEAD,
                hostkey: bytes.clone(),
            });
            frames.push(Frame::TunnelData {
                tunnel_id: 99,
                payload: bytes.clone(),
            });
            frames.push(Frame::ApiPing {
                tunnel_id: 1,
                hostkey: bytes.clone(),
            });
            frames.push(Frame::ApiPingResponse {
                tunnel_id: 2,
                hostkey: bytes.clone(),
            });
            frames.push(Frame::ApiNextHopResponse {
                tunnel_id: 3,
                hostkey: bytes.clone(),
            });
            frames.push(Frame::ApiData {
                tunnel_id: 4,
                hop_fingerprint: 0xBEEF,
                payload: bytes.clone(),
            });
        }
        frames.push(Frame::TunnelIncoming { tunnel_id: 17 });
        frames.push(Frame::TunnelDestroy { tunnel_id: 42 });
        frames.push(Frame::TunnelError {
            request_type: TUNNEL_BUILD,
            tunnel_id: 5,
        });
        frames.push(Frame::TunnelCover { cover_size: 512 });
        frames.push(Frame::RpsQuery);
        frames.push(Frame::RpsPeer {
            port: 6001,
            portmap: vec![],
            addr: v4(),
            hostkey: vec![1, 2, 3],
        });
        frames.push(Frame::ApiNextHopQuery { tunnel_id: 6 });
        frames
    }

    // ============================================================================
    // Round Trip Tests
    // ============================================================================

    #[test]
    fn test_round_trip_every_variant() {
        for frame in sample_frames() {
            let bytes = frame.serialize().expect("Serialization should succeed");
            let parsed = parse(&bytes).expect("Parsing serialized frame should succeed");
            assert_eq!(parsed, frame, "Round trip mismatch for {:?}", frame);
        }
    }

    #[test]
    fn test_length_header_covers_whole_frame() {
        for frame in sample_frames() {
            let bytes = frame.serialize().unwrap();
            let declared = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
            assert_eq!(declared, bytes.len());
        }
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let frame = Frame::TunnelIncoming { tunnel_id: 17 };
        let mut bytes = frame.serialize().unwrap();
        bytes.extend_from_slice(&[0xFF; 8]);
        assert_eq!(parse(&bytes).unwrap(), frame);
    }

    // ============================================================================
    // Truncation and Malformed Input Tests
    // ============================================================================

    #[test]
    fn test_every_prefix_is_truncated() {
        for frame in sample_frames() {
            let bytes = frame.serialize().unwrap();
            for cut in 0..bytes.len() {
                assert_eq!(
                    parse(&bytes[..cut]),
                    Err(WireError::Truncated),
                    "Prefix of length {} of {:?} should be truncated",
                    cut,
                    frame
                );
            }
        }
    }

    #[test]
    fn test_unknown_tag_is_reported() {
        assert_eq!(
            parse(&[0x00, 0x04, 0xFF, 0xFF]),
            Err(WireError::UnknownType(0xFFFF))
        );
        assert_eq!(
            parse(&[0x00, 0x04, 0x00, 0x00]),
            Err(WireError::UnknownType(0))
        );
    }

    #[test]
    fn test_declared_length_below_header_is_malformed() {
        assert_eq!(
            parse(&[0x00, 0x03, 0x02, 0x30, 0x00]),
            Err(WireError::Malformed("header"))
        );
    }

    #[test]
    fn test_short_body_is_malformed() {
        // TUNNEL_READY with a 3-byte body cannot hold its tunnel id
        let bytes = [0x00, 0x07, 0x02, 0x31, 0x00, 0x00, 0x00];
        assert_eq!(parse(&bytes), Err(WireError::Malformed("TUNNEL_READY")));
    }

    #[test]
    fn test_build_body_shorter_than_address_is_malformed() {
        // v6 flag set but only 4 address bytes present
        let mut body = vec![0x00, 0x01, 0x05, 0x78];
        body.extend_from_slice(&[1, 2, 3, 4]);
        let mut bytes = ((body.len() + 4) as u16).to_be_bytes().to_vec();
        bytes.extend_from_slice(&TUNNEL_BUILD.to_be_bytes());
        bytes.extend(body);
        assert_eq!(parse(&bytes), Err(WireError::Malformed("TUNNEL_BUILD")));
    }

    #[test]
    fn test_rps_peer_portmap_longer_than_body_is_malformed() {
        // claims 5 portmap entries but the body ends immediately
        let bytes = [0x00, 0x08, 0x02, 0x1D, 0x17, 0x71, 0x05, 0x00];
        assert_eq!(parse(&bytes), Err(WireError::Malformed("RPS_PEER")));
    }

    #[test]
    fn test_oversize_frame_is_rejected() {
        let frame = Frame::TunnelData {
            tunnel_id: 1,
            payload: vec![0; MAX_FRAME_SIZE],
        };
        assert_eq!(frame.serialize(), Err(WireError::Oversize));
    }

    // ============================================================================
    // Layout Pin Tests
    // ============================================================================

    #[test]
    fn test_api_data_layout() {
        let frame = Frame::ApiData {
            tunnel_id: 0x0102,
            hop_fingerprint: 0x0304,
            payload: vec![0xAA, 0xBB],
        };
        let bytes = frame.serialize().unwrap();
        assert_eq!(
            bytes,
            vec![0x00, 0x0A, 0x23, 0x2D, 0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB]
        );
    }

    #[test]
    fn test_final_hop_query_hostkey_follows_v4_address() {
        let frame = Frame::ApiFinalHopQuery {
            tunnel_id: 7,
            dest_addr: v4(),
            dest_port: 1400,
            hostkey: vec![0xEE; 3],
        };
        let bytes = frame.serialize().unwrap();
        // header(4) + id(2) + port(2) + flags(2) + addr(4), hostkey at 14
        assert_eq!(&bytes[14..], &[0xEE; 3]);
    }

    #[test]
    fn test_tunnel_cover_reserved_bytes_are_zero() {
        let bytes = Frame::TunnelCover { cover_size: 768 }.serialize().unwrap();
        assert_eq!(bytes, vec![0x00, 0x08, 0x02, 0x36, 0x03, 0x00, 0x00, 0x00]);
    }
}
