use std::error::Error;
use std::net::IpAddr;
use std::time::Duration;

use log::debug;
use tokio::net::TcpStream;

use crate::networking::{read_frame, timed, FrameSink};
use crate::wire::{self, Frame};
use crate::ONION_MODULE_TYPE;

/// One relay candidate as returned by the random peer sampling service.
#[derive(Clone, Debug)]
pub struct RandomPeer {
    pub addr: IpAddr,
    pub port: u16,
    pub hostkey: Vec<u8>,
}

/// Ask the sampling service for one random peer over a short-lived
/// connection. Every failure here is recoverable; callers decide whether a
/// missing peer fails a tunnel construction.
pub async fn get_random_peer(
    rps_addr: &str,
    limit: Duration,
) -> Result<RandomPeer, Box<dyn Error + Send + Sync>> {
    debug!("Querying peer source at {}", rps_addr);
    let stream = timed(limit, TcpStream::connect(rps_addr)).await?;
    let (mut read_half, write_half) = stream.into_split();

    let sink = FrameSink::new(write_half);
    sink.send(&Frame::RpsQuery).await?;

    let bytes = read_frame(&mut read_half, limit)
        .await?
        .ok_or("peer source closed the connection without answering")?;
    match wire::parse(&bytes) {
        Ok(Frame::RpsPeer {
            port,
            portmap,
            addr,
            hostkey,
        }) => {
            // the port to dial is the peer's onion module entry, falling
            // back to the leading port field
            let onion_port = portmap
                .iter()
                .find(|(module, _)| *module == ONION_MODULE_TYPE)
                .map(|(_, p)| *p)
                .unwrap_or(port);
            debug!("Peer source returned {}:{}", addr, onion_port);
            Ok(RandomPeer {
                addr,
                port: onion_port,
                hostkey,
            })
        }
        Ok(other) => Err(format!(
            "peer source answered with unexpected frame type {}",
            other.type_tag()
        )
        .into()),
        Err(e) => Err(format!("peer source reply unparsable: {}", e).into()),
    }
}
