//! Active upstream connections and the device paths they produced

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use vmthunder_common::{ConnectionDescriptor, ConnectionKey};

/// One logged-in upstream
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upstream {
    pub connection: ConnectionDescriptor,
    /// Resolved local device
    pub path: PathBuf,
}

/// Ordered set of active connections keyed by portal and IQN.
///
/// Every active connection has exactly one recorded path; the two cannot
/// drift apart because they are stored together.
#[derive(Clone, Debug, Default)]
pub struct ConnectionTable {
    order: Vec<ConnectionKey>,
    entries: HashMap<ConnectionKey, Upstream>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, connection: &ConnectionDescriptor) -> bool {
        self.entries.contains_key(&connection.key())
    }

    /// Record a login. Returns false (and keeps the old path) if the
    /// connection is already active.
    pub fn insert(&mut self, connection: ConnectionDescriptor, path: PathBuf) -> bool {
        let key = connection.key();
        if self.entries.contains_key(&key) {
            return false;
        }
        self.order.push(key.clone());
        self.entries.insert(key, Upstream { connection, path });
        true
    }

    pub fn remove(&mut self, connection: &ConnectionDescriptor) -> Option<Upstream> {
        let key = connection.key();
        let upstream = self.entries.remove(&key)?;
        self.order.retain(|k| k != &key);
        Some(upstream)
    }

    pub fn path_of(&self, connection: &ConnectionDescriptor) -> Option<&Path> {
        self.entries
            .get(&connection.key())
            .map(|upstream| upstream.path.as_path())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Upstream> {
        self.order.iter().filter_map(|key| self.entries.get(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &ConnectionKey> {
        self.order.iter()
    }

    /// Active connections in login order
    pub fn descriptors(&self) -> Vec<ConnectionDescriptor> {
        self.iter().map(|u| u.connection.clone()).collect()
    }

    /// Device paths in login order
    pub fn paths(&self) -> Vec<PathBuf> {
        self.iter().map(|u| u.path.clone()).collect()
    }

    /// Put entries in the order of `connections`; entries not listed keep
    /// their relative order after the listed ones.
    pub fn reorder(&mut self, connections: &[ConnectionDescriptor]) {
        let mut order: Vec<ConnectionKey> = Vec::with_capacity(self.order.len());
        for connection in connections {
            let key = connection.key();
            if self.entries.contains_key(&key) && !order.contains(&key) {
                order.push(key);
            }
        }
        for key in &self.order {
            if !order.contains(key) {
                order.push(key.clone());
            }
        }
        self.order = order;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn(portal: &str, iqn: &str) -> ConnectionDescriptor {
        ConnectionDescriptor::new(portal, iqn, 1)
    }

    #[test]
    fn test_insert_and_lookup() {
        let mut table = ConnectionTable::new();
        assert!(table.is_empty());
        assert!(table.insert(conn("10.0.0.1:3260", "iqn.a"), PathBuf::from("/dev/sdb")));
        assert!(table.insert(conn("10.0.0.2:3260", "iqn.b"), PathBuf::from("/dev/sdc")));

        assert_eq!(table.len(), 2);
        assert!(table.contains(&conn("10.0.0.1:3260", "iqn.a")));
        assert_eq!(
            table.path_of(&conn("10.0.0.2:3260", "iqn.b")),
            Some(Path::new("/dev/sdc"))
        );
        assert_eq!(
            table.paths(),
            vec![PathBuf::from("/dev/sdb"), PathBuf::from("/dev/sdc")]
        );
    }

    #[test]
    fn test_lun_does_not_distinguish() {
        let mut table = ConnectionTable::new();
        table.insert(
            ConnectionDescriptor::new("10.0.0.1:3260", "iqn.a", 1),
            PathBuf::from("/dev/sdb"),
        );
        let other_lun = ConnectionDescriptor::new("10.0.0.1:3260", "iqn.a", 7);
        assert!(table.contains(&other_lun));
        assert!(!table.insert(other_lun, PathBuf::from("/dev/sdz")));
        assert_eq!(table.paths(), vec![PathBuf::from("/dev/sdb")]);
    }

    #[test]
    fn test_remove() {
        let mut table = ConnectionTable::new();
        table.insert(conn("10.0.0.1:3260", "iqn.a"), PathBuf::from("/dev/sdb"));
        table.insert(conn("10.0.0.2:3260", "iqn.b"), PathBuf::from("/dev/sdc"));

        let removed = table.remove(&conn("10.0.0.1:3260", "iqn.a")).unwrap();
        assert_eq!(removed.path, PathBuf::from("/dev/sdb"));
        assert!(table.remove(&conn("10.0.0.1:3260", "iqn.a")).is_none());
        assert_eq!(table.descriptors(), vec![conn("10.0.0.2:3260", "iqn.b")]);
        assert_eq!(table.keys().count(), 1);
    }

    #[test]
    fn test_reorder() {
        let mut table = ConnectionTable::new();
        let a = conn("10.0.0.1:3260", "iqn.a");
        let b = conn("10.0.0.2:3260", "iqn.b");
        let c = conn("10.0.0.3:3260", "iqn.c");
        table.insert(a.clone(), PathBuf::from("/dev/sdb"));
        table.insert(b.clone(), PathBuf::from("/dev/sdc"));
        table.insert(c.clone(), PathBuf::from("/dev/sdd"));

        table.reorder(&[c.clone(), a.clone(), conn("10.9.9.9:3260", "iqn.gone")]);
        assert_eq!(table.descriptors(), vec![c, a, b]);
    }
}
