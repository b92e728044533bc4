use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tokio::sync::RwLock;

use crate::networking::{Link, LinkId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TunnelState {
    Building,
    Active,
    TearingDown,
    Inactive,
}

/// A directly adjacent peer in the context of one tunnel. Hops learned
/// through the tunnel (a next hop of a next hop) carry a hostkey but no
/// address; hops we dialed carry both.
#[derive(Clone, Default)]
pub struct Hop {
    pub addr: Option<SocketAddr>,
    pub hostkey: Option<Vec<u8>>,
    pub link: Option<Link>,
}

impl Hop {
    pub fn connected(addr: Option<SocketAddr>, hostkey: Vec<u8>, link: Link) -> Self {
        Hop {
            addr,
            hostkey: Some(hostkey),
            link: Some(link),
        }
    }
}

/// One onion route as this process sees it: the initiator has only a next
/// hop, the final hop only a previous one, intermediates both.
#[derive(Clone)]
pub struct Tunnel {
    pub id: u16,
    pub state: TunnelState,
    pub prev: Option<Hop>,
    pub next: Option<Hop>,
    /// Initiator only: hostkeys of hops 1..k followed by the destination.
    pub hop_keys: Vec<Vec<u8>>,
    /// Whether TUNNEL_INCOMING has been emitted for this inbound tunnel.
    pub announced: bool,
}

impl Tunnel {
    pub fn new(id: u16) -> Self {
        Tunnel {
            id,
            state: TunnelState::Building,
            prev: None,
            next: None,
            hop_keys: Vec::new(),
            announced: false,
        }
    }

    pub fn is_prev_link(&self, link: LinkId) -> bool {
        matches!(&self.prev, Some(hop) if matches!(&hop.link, Some(l) if l.id == link))
    }

    pub fn is_next_link(&self, link: LinkId) -> bool {
        matches!(&self.next, Some(hop) if matches!(&hop.link, Some(l) if l.id == link))
    }

    pub fn uses_link(&self, link: LinkId) -> bool {
        self.is_prev_link(link) || self.is_next_link(link)
    }

    /// The hop on the other side of the tunnel relative to the link a frame
    /// arrived on. `None` when the link is not part of this tunnel or the
    /// far side is absent.
    pub fn opposite(&self, arrived: LinkId) -> Option<&Hop> {
        if self.is_prev_link(arrived) {
            self.next.as_ref()
        } else if self.is_next_link(arrived) {
            self.prev.as_ref()
        } else {
            None
        }
    }
}

/// Process-wide tunnel id to adjacency mapping. The single source of truth
/// for routing and liveness decisions; connections are borrowed, never
/// owned, so dropping a tunnel here does not by itself close sockets.
pub struct HopTable {
    tunnels: RwLock<HashMap<u16, Tunnel>>,
}

impl Default for HopTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HopTable {
    pub fn new() -> Self {
        HopTable {
            tunnels: RwLock::new(HashMap::new()),
        }
    }

    /// Atomic read-modify-write. Creates the tunnel if the id is new, then
    /// applies `mutate` under the write lock and returns the result.
    pub async fn insert_or_update<F>(&self, id: u16, mutate: F) -> Tunnel
    where
        F: FnOnce(&mut Tunnel),
    {
        let mut map = self.tunnels.write().await;
        let tunnel = map.entry(id).or_insert_with(|| Tunnel::new(id));
        mutate(tunnel);
        tunnel.clone()
    }

    pub async fn lookup(&self, id: u16) -> Option<Tunnel> {
        self.tunnels.read().await.get(&id).cloned()
    }

    pub async fn remove(&self, id: u16) -> Option<Tunnel> {
        self.tunnels.write().await.remove(&id)
    }

    /// Reserve a random 16-bit id not currently in use and park a tunnel in
    /// Building state under it. `None` when the id space is exhausted.
    pub async fn allocate(&self) -> Option<u16> {
        let mut map = self.tunnels.write().await;
        if map.len() > u16::MAX as usize {
            return None;
        }
        let mut rng = rand::thread_rng();
        loop {
            let id: u16 = rng.gen();
            if let Entry::Vacant(entry) = map.entry(id) {
                entry.insert(Tunnel::new(id));
                return Some(id);
            }
        }
    }

    /// Record a previously unknown tunnel learned from an inbound ping.
    /// Fails when the id is already taken, locally allocated ids included,
    /// so a remote peer can never hijack a tunnel this relay owns.
    pub async fn adopt(&self, id: u16, prev: Hop) -> bool {
        let mut map = self.tunnels.write().await;
        match map.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                let mut tunnel = Tunnel::new(id);
                tunnel.prev = Some(prev);
                tunnel.state = TunnelState::Active;
                entry.insert(tunnel);
                true
            }
        }
    }

    pub async fn any_active(&self) -> bool {
        self.tunnels
            .read()
            .await
            .values()
            .any(|t| t.state == TunnelState::Active)
    }

    /// Whether any tunnel still routes over the given link. Read loops use
    /// this to decide when a destroyed tunnel's socket can close.
    pub async fn link_in_use(&self, link: LinkId) -> bool {
        self.tunnels
            .read()
            .await
            .values()
            .any(|t| t.uses_link(link))
    }

    /// Drop every tunnel routed over the given link, returning the removed
    /// tunnels so the caller can notify the surviving direction.
    pub async fn remove_by_link(&self, link: LinkId) -> Vec<Tunnel> {
        let mut map = self.tunnels.write().await;
        let ids: Vec<u16> = map
            .values()
            .filter(|t| t.uses_link(link))
            .map(|t| t.id)
            .collect();
        ids.into_iter().filter_map(|id| map.remove(&id)).collect()
    }
}
