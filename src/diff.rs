//! Snapshot differs.
//!
//! Both functions are pure: they look at the previous and current
//! snapshot and return the events that turn one into the other.  Only
//! point-in-time snapshots are compared, so an instance that leaves and
//! comes back between two polls looks exactly like one that never left.

use crate::types::{DeltaEvent, InstanceSnapshot, ServiceSnapshot};

/// Symmetric difference of two service-name sets.
///
/// Names present in both snapshots produce nothing; services carry no
/// attributes beyond their name.
pub fn diff_services(prev: &ServiceSnapshot, curr: &ServiceSnapshot) -> Vec<DeltaEvent> {
    let removed = prev
        .difference(curr)
        .map(|name| DeltaEvent::ServiceRemoved { name: name.clone() });
    let added = curr
        .difference(prev)
        .map(|name| DeltaEvent::ServiceAdded { name: name.clone() });
    removed.chain(added).collect()
}

/// Keyed diff of two instance snapshots of `service`.
///
/// Instances present in both snapshots only produce an event when their
/// aggregated health changed.
pub fn diff_instances(
    service: &str,
    prev: &InstanceSnapshot,
    curr: &InstanceSnapshot,
) -> Vec<DeltaEvent> {
    let mut events = Vec::new();

    for (id, record) in curr {
        match prev.get(id) {
            None => events.push(DeltaEvent::InstanceAdded {
                service: service.to_string(),
                id: id.clone(),
            }),
            Some(before) => {
                let old = before.health();
                let new = record.health();
                if old != new {
                    events.push(DeltaEvent::InstanceHealthChanged {
                        service: service.to_string(),
                        id: id.clone(),
                        old,
                        new,
                    });
                }
            }
        }
    }

    for id in prev.keys().filter(|id| !curr.contains_key(*id)) {
        events.push(DeltaEvent::InstanceRemoved {
            service: service.to_string(),
            id: id.clone(),
        });
    }

    events
}
