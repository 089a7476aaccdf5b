//! Endpoint addresses and hierarchical path partitioning.
//!
//! Parent policies route addresses down the tree by the first element of
//! each address's hierarchical path; the element is consumed on the way
//! down so the child sees paths relative to itself.

use std::net::SocketAddr;

/// Resolver-reported health of an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// No health information.
    Unknown,
    /// Serving.
    Healthy,
    /// Being drained; only sticky sessions should use it.
    Draining,
}

/// Ordered list of child names an address routes through. Compared
/// lexicographically element by element.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HierarchicalPath(Vec<String>);

impl HierarchicalPath {
    /// Build a path from its elements.
    pub fn new(elements: Vec<String>) -> Self {
        Self(elements)
    }

    /// The next routing element, if any.
    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// The path with its leading element removed.
    pub fn strip_first(&self) -> HierarchicalPath {
        HierarchicalPath(self.0.iter().skip(1).cloned().collect())
    }

    /// Whether the path is exhausted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The elements.
    pub fn elements(&self) -> &[String] {
        &self.0
    }
}

impl From<&[&str]> for HierarchicalPath {
    fn from(elements: &[&str]) -> Self {
        Self(elements.iter().map(|s| s.to_string()).collect())
    }
}

/// A socket address plus its routing attributes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EndpointAddress {
    /// The socket address.
    pub address: SocketAddr,
    /// Hierarchical routing path.
    pub path: HierarchicalPath,
    /// Locality the address belongs to.
    pub locality: Option<String>,
    /// Resolver-reported health.
    pub health: HealthStatus,
}

impl EndpointAddress {
    /// An address with no attributes.
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            path: HierarchicalPath::default(),
            locality: None,
            health: HealthStatus::Unknown,
        }
    }

    /// Attach a hierarchical path.
    #[must_use]
    pub fn with_path(mut self, path: HierarchicalPath) -> Self {
        self.path = path;
        self
    }

    /// Attach a locality name.
    #[must_use]
    pub fn with_locality(mut self, locality: impl Into<String>) -> Self {
        self.locality = Some(locality.into());
        self
    }

    /// Attach a health status.
    #[must_use]
    pub fn with_health(mut self, health: HealthStatus) -> Self {
        self.health = health;
        self
    }
}

/// Lazy partition of a parent's addresses by leading path element.
///
/// Child iterators re-walk the parent slice on every pass and share it
/// by reference; nothing is copied until a child address is yielded.
/// Addresses without a path are dropped; an empty *remaining* path is
/// preserved so the next level can drop them itself.
pub struct HierarchicalAddressMap<'a> {
    parent: &'a [EndpointAddress],
    children: Vec<String>,
}

impl<'a> HierarchicalAddressMap<'a> {
    /// Partition `parent`.
    pub fn new(parent: &'a [EndpointAddress]) -> Self {
        let mut children: Vec<String> = Vec::new();
        for address in parent {
            if let Some(first) = address.path.first() {
                if !children.iter().any(|c| c == first) {
                    children.push(first.to_string());
                }
            }
        }
        Self { parent, children }
    }

    /// Child names in first-appearance order.
    pub fn child_names(&self) -> &[String] {
        &self.children
    }

    /// The subset of addresses routed to `child`, with the leading path
    /// element stripped.
    pub fn addresses_of<'b>(
        &'b self,
        child: &'b str,
    ) -> impl Iterator<Item = EndpointAddress> + 'b {
        self.parent
            .iter()
            .filter(move |address| address.path.first() == Some(child))
            .map(|address| {
                let mut stripped = address.clone();
                stripped.path = address.path.strip_first();
                stripped
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, path: &[&str]) -> EndpointAddress {
        EndpointAddress::new(format!("{ip}:443").parse().unwrap())
            .with_path(HierarchicalPath::from(path))
    }

    #[test]
    fn partitions_and_strips() {
        let addresses = vec![
            addr("10.0.0.1", &["c0", "lA"]),
            addr("10.0.0.2", &["c0", "lB"]),
            addr("10.0.0.3", &["c1", "lC"]),
        ];
        let map = HierarchicalAddressMap::new(&addresses);
        assert_eq!(map.child_names(), &["c0".to_string(), "c1".to_string()]);

        let c0: Vec<_> = map.addresses_of("c0").collect();
        assert_eq!(c0.len(), 2);
        assert_eq!(c0[0].address, "10.0.0.1:443".parse().unwrap());
        assert_eq!(c0[0].path, HierarchicalPath::from(&["lA"][..]));
        assert_eq!(c0[1].path, HierarchicalPath::from(&["lB"][..]));

        let c1: Vec<_> = map.addresses_of("c1").collect();
        assert_eq!(c1.len(), 1);
        assert_eq!(c1[0].address, "10.0.0.3:443".parse().unwrap());
        assert_eq!(c1[0].path, HierarchicalPath::from(&["lC"][..]));
    }

    #[test]
    fn pathless_addresses_are_dropped() {
        let addresses = vec![addr("10.0.0.1", &[]), addr("10.0.0.2", &["c0"])];
        let map = HierarchicalAddressMap::new(&addresses);
        assert_eq!(map.child_names(), &["c0".to_string()]);
        // The surviving address keeps its (now empty) remaining path so
        // the next level drops it.
        let c0: Vec<_> = map.addresses_of("c0").collect();
        assert_eq!(c0.len(), 1);
        assert!(c0[0].path.is_empty());
    }

    #[test]
    fn recursive_filtering_visits_each_address_once() {
        let addresses = vec![
            addr("10.0.0.1", &["a", "x"]),
            addr("10.0.0.2", &["a", "y"]),
            addr("10.0.0.3", &["b", "x"]),
        ];

        fn count_leaves(addresses: &[EndpointAddress]) -> usize {
            let map = HierarchicalAddressMap::new(addresses);
            if map.child_names().is_empty() {
                return addresses.len();
            }
            let mut total = 0;
            for child in map.child_names() {
                let subset: Vec<_> = map.addresses_of(child).collect();
                total += count_leaves(&subset);
            }
            total
        }

        assert_eq!(count_leaves(&addresses), 3);
    }

    #[test]
    fn lazy_iterator_re_walks_parent() {
        let addresses = vec![addr("10.0.0.1", &["c0"])];
        let map = HierarchicalAddressMap::new(&addresses);
        // Two passes over the same child yield the same subset.
        assert_eq!(map.addresses_of("c0").count(), 1);
        assert_eq!(map.addresses_of("c0").count(), 1);
    }
}
