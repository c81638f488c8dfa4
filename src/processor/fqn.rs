use std::collections::HashMap;

use serde_json::Value;
use tracing::debug;

use crate::event::{EventList, Operation};
use crate::processor::EventProcessor;
use crate::SyncError;

/// Payload field receiving the resolved name of a reference target
pub const TO_FQ_NAME_FIELD: &str = "to_fq_name";

/// Caches `uuid -> fully qualified name` and embeds the target name into
/// reference events.
///
/// A reference to a UUID that has not been seen yet rejects the whole unit.
#[derive(Debug, Default)]
pub struct FqnCache {
    names: HashMap<String, Vec<String>>,
}

impl FqnCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, uuid: &str) -> Option<&[String]> {
        self.names.get(uuid).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl EventProcessor for FqnCache {
    fn name(&self) -> &'static str {
        "fqn-cache"
    }

    fn process(&mut self, events: EventList) -> Result<EventList, SyncError> {
        let mut forwarded = EventList::new();
        for mut event in events {
            match (event.operation, &event.reference) {
                (Operation::Create | Operation::Update, Some(reference)) => {
                    let fq_name = self.names.get(&reference.to_uuid).ok_or_else(|| {
                        SyncError::MissingFqn {
                            kind: reference.to_kind.clone(),
                            uuid: reference.to_uuid.clone(),
                        }
                    })?;
                    let fq_name = Value::from(fq_name.clone());
                    event.payload.insert(TO_FQ_NAME_FIELD.to_string(), fq_name);
                }
                (Operation::Create | Operation::Update, None) => {
                    if let (Some(uuid), Some(fq_name)) = (event.uuid(), &event.fq_name) {
                        self.names.insert(uuid.to_string(), fq_name.clone());
                    }
                }
                (Operation::Delete, None) => {
                    if let Some(uuid) = event.uuid() {
                        if self.names.remove(uuid).is_some() {
                            debug!("Forgot fully qualified name of {uuid}");
                        }
                    }
                }
                (Operation::Delete, Some(_)) => {}
            }
            forwarded.push(event);
        }
        Ok(forwarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, Reference};
    use serde_json::json;

    fn network(operation: Operation, uuid: &str, fq_name: Option<&[&str]>) -> Event {
        let mut event = Event::new(operation, "virtual_network", vec![uuid.to_string()]);
        event.fq_name = fq_name.map(|n| n.iter().map(|s| s.to_string()).collect());
        event
    }

    fn reference(operation: Operation, to_uuid: &str) -> Event {
        let mut event = Event::new(
            operation,
            "virtual_machine_interface_virtual_network",
            vec!["vmi-1".to_string(), to_uuid.to_string()],
        );
        event.reference = Some(Reference {
            from_uuid: "vmi-1".into(),
            to_kind: "virtual_network".into(),
            to_uuid: to_uuid.into(),
        });
        event
    }

    #[test]
    fn test_reference_resolves_cached_name() {
        let mut cache = FqnCache::new();
        let created = network(Operation::Create, "vn-1", Some(&["default", "admin", "blue"]));
        cache.process(EventList::single(created)).unwrap();
        assert_eq!(cache.len(), 1);

        let out = cache
            .process(EventList::single(reference(Operation::Create, "vn-1")))
            .unwrap();
        let event = out.iter().next().unwrap();
        assert_eq!(
            event.payload.get(TO_FQ_NAME_FIELD),
            Some(&json!(["default", "admin", "blue"]))
        );
    }

    #[test]
    fn test_reference_within_same_unit() {
        let mut cache = FqnCache::new();
        let events = EventList::from(vec![
            network(Operation::Create, "vn-1", Some(&["default", "blue"])),
            reference(Operation::Create, "vn-1"),
        ]);
        let out = cache.process(events).unwrap();
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_unknown_reference_target_is_rejected() {
        let mut cache = FqnCache::new();
        let err = cache
            .process(EventList::single(reference(Operation::Create, "vn-404")))
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingFqn { uuid, .. } if uuid == "vn-404"));
    }

    #[test]
    fn test_delete_forgets_name() {
        let mut cache = FqnCache::new();
        cache
            .process(EventList::single(network(
                Operation::Create,
                "vn-1",
                Some(&["default", "blue"]),
            )))
            .unwrap();
        cache
            .process(EventList::single(network(Operation::Delete, "vn-1", None)))
            .unwrap();
        assert!(cache.get("vn-1").is_none());

        // Reference deletes need no name
        cache
            .process(EventList::single(reference(Operation::Delete, "vn-1")))
            .unwrap();
        assert!(cache
            .process(EventList::single(reference(Operation::Update, "vn-1")))
            .is_err());
    }

    #[test]
    fn test_update_without_name_keeps_entry() {
        let mut cache = FqnCache::new();
        cache
            .process(EventList::single(network(
                Operation::Create,
                "vn-1",
                Some(&["default", "blue"]),
            )))
            .unwrap();
        cache
            .process(EventList::single(network(Operation::Update, "vn-1", None)))
            .unwrap();
        assert_eq!(
            cache.get("vn-1"),
            Some(&["default".to_string(), "blue".to_string()][..])
        );
    }
}
