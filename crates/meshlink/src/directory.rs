//! The device directory: dual-keyed store of discovered peer identities.
//!
//! Peers are identified by two independent, partially-known address
//! spaces. The directory keeps one map per space and merges observations
//! so that a given physical peer has exactly one [`RemoteNode`] instance
//! no matter how many times it is rediscovered or under which address it
//! was first seen.
//!
//! Concurrent reads from application tasks and merges from the discovery
//! worker need no caller-side locking; mutable peer fields are
//! last-writer-wins.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use meshlink_core::addr::{Addr16, Addr64};
use meshlink_core::error::{Error, Result};
use meshlink_core::types::RadioProtocol;

use crate::device::RemoteNode;

/// Registry of previously observed peers, keyed independently by both
/// address spaces.
///
/// Neither map is ever keyed by an unknown address value.
pub struct DeviceDirectory {
    protocol: RadioProtocol,
    by_addr64: RwLock<HashMap<Addr64, Arc<RemoteNode>>>,
    by_addr16: RwLock<HashMap<Addr16, Arc<RemoteNode>>>,
}

impl DeviceDirectory {
    /// Create an empty directory for a network of the given protocol
    /// family.
    pub fn new(protocol: RadioProtocol) -> Self {
        DeviceDirectory {
            protocol,
            by_addr64: RwLock::new(HashMap::new()),
            by_addr16: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or merge a peer observation.
    ///
    /// Returns the directory's instance for the peer: the existing one
    /// (updated in place) when the identity was already known, otherwise
    /// the inserted `node`. A record already present in the 16-bit map
    /// whose 64-bit address becomes known is promoted: removed from the
    /// 16-bit map, its fields folded into the incoming record, and the
    /// result inserted under the 64-bit key -- so `count()` never double
    /// counts.
    ///
    /// Records with no known address are rejected.
    pub fn add(&self, node: Arc<RemoteNode>) -> Result<Arc<RemoteNode>> {
        let addr64 = node.addr64();
        let addr16 = node.addr16();

        if addr64.is_unknown() && addr16.is_unknown() {
            return Err(Error::InvalidParameter(
                "peer record has no known address".into(),
            ));
        }

        let mut by_addr64 = self.by_addr64.write().unwrap();
        let mut by_addr16 = self.by_addr16.write().unwrap();

        if !addr64.is_unknown() {
            if let Some(existing) = by_addr64.get(&addr64) {
                if !Arc::ptr_eq(existing, &node) {
                    existing.merge_node(&node);
                }
                return Ok(Arc::clone(existing));
            }
            if !addr16.is_unknown() {
                if let Some(promoted) = by_addr16.remove(&addr16) {
                    debug!(%addr64, %addr16, "promoting peer to the 64-bit map");
                    node.absorb_missing_from(&promoted);
                    by_addr64.insert(addr64, Arc::clone(&node));
                    return Ok(node);
                }
            }
            by_addr64.insert(addr64, Arc::clone(&node));
            return Ok(node);
        }

        // Only the 16-bit address is known. The 64-bit map takes
        // precedence in the search order.
        if let Some(existing) = by_addr64.values().find(|n| n.addr16() == addr16) {
            if !Arc::ptr_eq(existing, &node) {
                existing.merge_node(&node);
            }
            return Ok(Arc::clone(existing));
        }
        if let Some(existing) = by_addr16.get(&addr16) {
            if !Arc::ptr_eq(existing, &node) {
                existing.merge_node(&node);
            }
            return Ok(Arc::clone(existing));
        }
        by_addr16.insert(addr16, Arc::clone(&node));
        Ok(node)
    }

    /// Remove a peer, mirroring the add/lookup order: 64-bit direct hit,
    /// then 64-bit map scan by 16-bit address, then the 16-bit map.
    ///
    /// Returns the removed instance, if any.
    pub fn remove(&self, node: &RemoteNode) -> Option<Arc<RemoteNode>> {
        let mut by_addr64 = self.by_addr64.write().unwrap();
        let mut by_addr16 = self.by_addr16.write().unwrap();

        let addr64 = node.addr64();
        let addr16 = node.addr16();

        if !addr64.is_unknown() {
            if let Some(found) = by_addr64.remove(&addr64) {
                return Some(found);
            }
        }
        if !addr16.is_unknown() {
            if let Some(key) = by_addr64
                .iter()
                .find(|(_, n)| n.addr16() == addr16)
                .map(|(&key, _)| key)
            {
                return by_addr64.remove(&key);
            }
            if let Some(found) = by_addr16.remove(&addr16) {
                return Some(found);
            }
        }
        None
    }

    /// Look up a peer by its 64-bit address.
    pub fn find_by_addr64(&self, addr: Addr64) -> Option<Arc<RemoteNode>> {
        if addr.is_unknown() {
            return None;
        }
        self.by_addr64.read().unwrap().get(&addr).cloned()
    }

    /// Look up a peer by its 16-bit address.
    ///
    /// The 64-bit map is scanned first (it takes precedence), then the
    /// 16-bit map. Fails with [`Error::Unsupported`] on networks whose
    /// protocol family has no 16-bit address space.
    pub fn find_by_addr16(&self, addr: Addr16) -> Result<Option<Arc<RemoteNode>>> {
        if !self.protocol.capabilities().supports_16bit_addressing {
            return Err(Error::Unsupported(format!(
                "{} has no 16-bit address space",
                self.protocol
            )));
        }
        if addr.is_unknown() {
            return Ok(None);
        }
        let by_addr64 = self.by_addr64.read().unwrap();
        if let Some(found) = by_addr64.values().find(|n| n.addr16() == addr) {
            return Ok(Some(Arc::clone(found)));
        }
        Ok(self.by_addr16.read().unwrap().get(&addr).cloned())
    }

    /// Look up a peer by its configured node identifier.
    pub fn find_by_node_id(&self, node_id: &str) -> Option<Arc<RemoteNode>> {
        let by_addr64 = self.by_addr64.read().unwrap();
        if let Some(found) = by_addr64
            .values()
            .find(|n| n.node_id().as_deref() == Some(node_id))
        {
            return Some(Arc::clone(found));
        }
        drop(by_addr64);
        self.by_addr16
            .read()
            .unwrap()
            .values()
            .find(|n| n.node_id().as_deref() == Some(node_id))
            .cloned()
    }

    /// Number of stored peers.
    ///
    /// The sum of both maps' sizes; promotion always removes from one map
    /// before inserting into the other, so nothing is counted twice.
    pub fn count(&self) -> usize {
        self.by_addr64.read().unwrap().len() + self.by_addr16.read().unwrap().len()
    }

    /// Returns `true` when no peers are stored.
    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// A snapshot of every stored peer.
    pub fn nodes(&self) -> Vec<Arc<RemoteNode>> {
        let mut nodes: Vec<Arc<RemoteNode>> =
            self.by_addr64.read().unwrap().values().cloned().collect();
        nodes.extend(self.by_addr16.read().unwrap().values().cloned());
        nodes
    }

    /// Remove every stored peer.
    pub fn clear(&self) {
        self.by_addr64.write().unwrap().clear();
        self.by_addr16.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlink_core::events::NodeRecord;
    use std::sync::Weak;

    fn node(addr64: Addr64, addr16: Addr16, node_id: Option<&str>) -> Arc<RemoteNode> {
        let mut record = NodeRecord::new(addr64, addr16);
        record.node_id = node_id.map(str::to_string);
        RemoteNode::from_record(Weak::new(), RadioProtocol::ZigBee, &record)
    }

    #[test]
    fn add_rejects_addressless_records() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        let result = dir.add(node(Addr64::UNKNOWN, Addr16::UNKNOWN, None));
        assert!(matches!(result.unwrap_err(), Error::InvalidParameter(_)));
        assert_eq!(dir.count(), 0);
    }

    #[test]
    fn merge_is_idempotent_for_the_same_identity() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        let a64 = Addr64::new(0xA);

        let first = dir.add(node(a64, Addr16::UNKNOWN, None)).unwrap();
        let second = dir
            .add(node(a64, Addr16::new(0xB), Some("NODE")))
            .unwrap();

        // One stored record; the earliest instance survived and was
        // updated in place.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(dir.count(), 1);
        assert_eq!(first.addr16(), Addr16::new(0xB));
        assert_eq!(first.node_id().as_deref(), Some("NODE"));
    }

    #[test]
    fn merge_does_not_erase_node_id_with_empty_value() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        let a64 = Addr64::new(0xA);

        let stored = dir.add(node(a64, Addr16::UNKNOWN, Some("KEEP"))).unwrap();
        dir.add(node(a64, Addr16::UNKNOWN, Some(""))).unwrap();
        dir.add(node(a64, Addr16::UNKNOWN, None)).unwrap();

        assert_eq!(stored.node_id().as_deref(), Some("KEEP"));
    }

    #[test]
    fn promotion_moves_record_from_16_map_to_64_map() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        let a16 = Addr16::new(0xB);

        let early = dir.add(node(Addr64::UNKNOWN, a16, Some("EARLY"))).unwrap();
        assert_eq!(dir.count(), 1);

        let promoted = dir.add(node(Addr64::new(0xA), a16, None)).unwrap();

        // One record total, now in the 64-keyed store only.
        assert_eq!(dir.count(), 1);
        assert!(dir.find_by_addr64(Addr64::new(0xA)).is_some());
        // The promoted record inherited the fields the incoming one lacked.
        assert_eq!(promoted.node_id().as_deref(), Some("EARLY"));
        assert_eq!(promoted.addr16(), a16);
        // The pre-promotion instance is no longer stored.
        assert!(!dir
            .nodes()
            .iter()
            .any(|stored| Arc::ptr_eq(stored, &early)));
    }

    #[test]
    fn sixteen_bit_only_observation_merges_into_64_map_first() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);

        let full = dir
            .add(node(Addr64::new(0xA), Addr16::new(0xB), None))
            .unwrap();
        let merged = dir
            .add(node(Addr64::UNKNOWN, Addr16::new(0xB), Some("LATE")))
            .unwrap();

        assert!(Arc::ptr_eq(&full, &merged));
        assert_eq!(dir.count(), 1);
        assert_eq!(full.node_id().as_deref(), Some("LATE"));
    }

    #[test]
    fn remove_mirrors_lookup_order() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);

        dir.add(node(Addr64::new(0xA), Addr16::new(0xB), None))
            .unwrap();
        dir.add(node(Addr64::UNKNOWN, Addr16::new(0xC), None))
            .unwrap();
        assert_eq!(dir.count(), 2);

        // 64-map direct hit.
        let probe = node(Addr64::new(0xA), Addr16::UNKNOWN, None);
        assert!(dir.remove(&probe).is_some());
        assert_eq!(dir.count(), 1);

        // 16-map hit after the (empty) 64-map scan.
        let probe = node(Addr64::UNKNOWN, Addr16::new(0xC), None);
        assert!(dir.remove(&probe).is_some());
        assert_eq!(dir.count(), 0);

        // Removing a record that is no longer stored returns None.
        assert!(dir.remove(&probe).is_none());
    }

    #[test]
    fn remove_scans_64_map_by_16_bit_address() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        dir.add(node(Addr64::new(0xA), Addr16::new(0xB), None))
            .unwrap();

        let probe = node(Addr64::UNKNOWN, Addr16::new(0xB), None);
        assert!(dir.remove(&probe).is_some());
        assert_eq!(dir.count(), 0);
    }

    #[test]
    fn find_by_addr16_prefers_the_64_map() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);

        let in64 = dir
            .add(node(Addr64::new(0xA), Addr16::new(0xB), Some("IN64")))
            .unwrap();
        let found = dir.find_by_addr16(Addr16::new(0xB)).unwrap().unwrap();
        assert!(Arc::ptr_eq(&in64, &found));
    }

    #[test]
    fn find_by_addr16_unsupported_without_16bit_space() {
        let dir = DeviceDirectory::new(RadioProtocol::DigiMesh);
        let result = dir.find_by_addr16(Addr16::new(0xB));
        assert!(matches!(result.unwrap_err(), Error::Unsupported(_)));
    }

    #[test]
    fn find_by_node_id() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        dir.add(node(Addr64::new(0xA), Addr16::UNKNOWN, Some("NODE1")))
            .unwrap();
        dir.add(node(Addr64::new(0xB), Addr16::UNKNOWN, Some("NODE2")))
            .unwrap();

        let found = dir.find_by_node_id("NODE2").unwrap();
        assert_eq!(found.addr64(), Addr64::new(0xB));
        assert!(dir.find_by_node_id("NODE3").is_none());
    }

    #[test]
    fn clear_empties_both_maps() {
        let dir = DeviceDirectory::new(RadioProtocol::ZigBee);
        dir.add(node(Addr64::new(0xA), Addr16::UNKNOWN, None))
            .unwrap();
        dir.add(node(Addr64::UNKNOWN, Addr16::new(0xC), None))
            .unwrap();
        assert_eq!(dir.count(), 2);

        dir.clear();
        assert!(dir.is_empty());
        assert!(dir.nodes().is_empty());
    }
}
