//! # client
//!
//! why: one outbound rpc handle per peer, rebuilt in place when the transport fails
//! relations: dialed through transport.rs Connector, held in node.rs under the node lock
//! what: PeerClient, PeerTable (arena indexed by peer id)

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::message::{AppendEntryRequest, AppendEntryResponse, VoteRequest, VoteResponse};
use crate::transport::{Connector, RaftService};
use crate::{RaftError, Result};

/// outbound handle for one peer
///
/// `service` is None when the last dial failed; calls on a disconnected client
/// fail with a transport error so the caller's reconnect path runs.
#[derive(Clone)]
pub struct PeerClient {
    id: u64,
    addr: String,
    service: Option<Arc<dyn RaftService>>,
}

impl std::fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerClient")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("connected", &self.service.is_some())
            .finish()
    }
}

impl PeerClient {
    /// dial `addr`; a failed dial is logged and leaves the client disconnected
    pub async fn connect(id: u64, addr: impl Into<String>, connector: &dyn Connector) -> Self {
        let addr = addr.into();
        let service = match connector.connect(id, &addr).await {
            Ok(service) => {
                tracing::debug!(peer_id = id, addr = %addr, "connected to peer");
                Some(service)
            }
            Err(e) => {
                tracing::warn!(peer_id = id, addr = %addr, error = %e, "failed to connect to peer");
                None
            }
        };
        Self { id, addr, service }
    }

    /// a client that is never dialed, used for this node's own slot
    pub fn local(id: u64, addr: impl Into<String>) -> Self {
        Self {
            id,
            addr: addr.into(),
            service: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.service.is_some()
    }

    /// both clients hold the same connection handle, or are both disconnected
    pub fn same_connection(&self, other: &PeerClient) -> bool {
        match (&self.service, &other.service) {
            (Some(a), Some(b)) => {
                std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
            }
            (None, None) => true,
            _ => false,
        }
    }

    fn service(&self) -> Result<&Arc<dyn RaftService>> {
        self.service.as_ref().ok_or_else(|| RaftError::Transport {
            peer: self.id,
            reason: "not connected".into(),
        })
    }

    pub async fn request_vote(&self, req: VoteRequest, limit: Duration) -> Result<VoteResponse> {
        let service = self.service()?;
        tokio::time::timeout(limit, service.request_vote(req))
            .await
            .map_err(|_| self.timed_out(limit))?
    }

    pub async fn append_entry(
        &self,
        req: AppendEntryRequest,
        limit: Duration,
    ) -> Result<AppendEntryResponse> {
        let service = self.service()?;
        tokio::time::timeout(limit, service.append_entry(req))
            .await
            .map_err(|_| self.timed_out(limit))?
    }

    fn timed_out(&self, limit: Duration) -> RaftError {
        RaftError::Timeout {
            peer: self.id,
            millis: limit.as_millis() as u64,
        }
    }
}

/// fixed table of peers, slot `i` holds peer id `i`
///
/// the table is built once; reconnection swaps a slot's handle and never its id.
#[derive(Debug, Default)]
pub struct PeerTable {
    slots: Vec<Option<PeerClient>>,
}

impl PeerTable {
    /// build the table from the static membership map, dialing every peer but `self_id`
    pub async fn dial(
        peers: &BTreeMap<u64, String>,
        self_id: u64,
        connector: &dyn Connector,
    ) -> Self {
        let size = peers.keys().next_back().map_or(0, |max| *max as usize + 1);
        let mut slots = vec![None; size];
        for (&id, addr) in peers {
            let client = if id == self_id {
                PeerClient::local(id, addr.clone())
            } else {
                PeerClient::connect(id, addr.clone(), connector).await
            };
            slots[id as usize] = Some(client);
        }
        Self { slots }
    }

    /// number of members, this node included
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// one past the largest peer id, the size of per-peer arrays
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, id: u64) -> Option<&PeerClient> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    /// every member id in ascending order
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.slots
            .iter()
            .flatten()
            .map(PeerClient::id)
    }

    /// swap the connection handle of `id`, returning the old one for the caller to close
    pub fn replace(
        &mut self,
        id: u64,
        service: Option<Arc<dyn RaftService>>,
    ) -> Option<Arc<dyn RaftService>> {
        let client = self.slots.get_mut(id as usize)?.as_mut()?;
        std::mem::replace(&mut client.service, service)
    }

    /// swap the handle `failed` was using, unless the slot moved on since
    ///
    /// `Ok` carries the old handle for the caller to close; `Err` hands `service`
    /// back untouched because another task already rebuilt the connection.
    pub fn replace_if_current(
        &mut self,
        failed: &PeerClient,
        service: Option<Arc<dyn RaftService>>,
    ) -> std::result::Result<Option<Arc<dyn RaftService>>, Option<Arc<dyn RaftService>>> {
        match self.get(failed.id()) {
            Some(current) if current.same_connection(failed) => {
                Ok(self.replace(failed.id(), service))
            }
            _ => Err(service),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Refusing;

    #[async_trait]
    impl Connector for Refusing {
        async fn connect(&self, peer_id: u64, _addr: &str) -> Result<Arc<dyn RaftService>> {
            Err(RaftError::Transport {
                peer: peer_id,
                reason: "connection refused".into(),
            })
        }
    }

    struct Silent;

    #[async_trait]
    impl RaftService for Silent {
        async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
            Ok(VoteResponse {
                term: req.term,
                vote_granted: false,
            })
        }

        async fn append_entry(&self, req: AppendEntryRequest) -> Result<AppendEntryResponse> {
            Ok(AppendEntryResponse {
                term: req.term,
                success: false,
                conflict_index: 0,
                conflict_term: 0,
            })
        }
    }

    struct Accepting;

    #[async_trait]
    impl Connector for Accepting {
        async fn connect(&self, _peer_id: u64, _addr: &str) -> Result<Arc<dyn RaftService>> {
            Ok(Arc::new(Silent))
        }
    }

    fn membership() -> BTreeMap<u64, String> {
        (0..3u64)
            .map(|id| (id, format!("127.0.0.1:{}", 8000 + id)))
            .collect()
    }

    #[tokio::test]
    async fn failed_dial_still_builds_a_client() {
        let client = PeerClient::connect(100, "127.0.0.1:8080", &Refusing).await;

        assert_eq!(client.id(), 100);
        assert_eq!(client.addr(), "127.0.0.1:8080");
        assert!(!client.is_connected());

        let req = VoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        };
        let err = client
            .request_vote(req, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RaftError::Transport { peer: 100, .. }));
    }

    #[tokio::test]
    async fn table_is_indexed_by_peer_id() {
        let table = PeerTable::dial(&membership(), 1, &Refusing).await;

        assert_eq!(table.len(), 3);
        assert_eq!(table.capacity(), 3);
        assert_eq!(table.ids().collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(table.get(2).unwrap().addr(), "127.0.0.1:8002");
        assert!(table.get(7).is_none());
    }

    #[tokio::test]
    async fn sparse_ids_leave_empty_slots() {
        let peers: BTreeMap<u64, String> =
            [(1, "a".to_string()), (3, "c".to_string())].into_iter().collect();
        let mut table = PeerTable::dial(&peers, 1, &Refusing).await;

        assert_eq!(table.len(), 2);
        assert_eq!(table.capacity(), 4);
        assert!(table.get(2).is_none());
        assert!(table.replace(2, None).is_none());
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_replace_a_rebuilt_slot() {
        let mut table = PeerTable::dial(&membership(), 0, &Accepting).await;
        let snapshot = table.get(2).cloned().unwrap();
        assert!(snapshot.is_connected());

        // the first task to notice the failure rebuilds the slot
        let first: Arc<dyn RaftService> = Arc::new(Silent);
        let old = table.replace_if_current(&snapshot, Some(first.clone())).ok().unwrap();
        assert!(old.is_some());

        // a second task holding the same stale snapshot must leave it alone
        let second: Arc<dyn RaftService> = Arc::new(Silent);
        let refused = table.replace_if_current(&snapshot, Some(second)).err().unwrap();
        assert!(refused.is_some());

        let installed = PeerClient {
            id: 2,
            addr: String::new(),
            service: Some(first),
        };
        assert!(table.get(2).unwrap().same_connection(&installed));
    }

    #[tokio::test]
    async fn disconnected_snapshots_match_a_disconnected_slot() {
        let mut table = PeerTable::dial(&membership(), 0, &Refusing).await;
        let snapshot = table.get(1).cloned().unwrap();

        assert!(table.replace_if_current(&snapshot, None).is_ok());
        let again = table.get(1).cloned().unwrap();
        assert!(table.replace_if_current(&again, None).is_ok());
    }
}
