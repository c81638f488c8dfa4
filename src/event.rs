//! Domain-level change events

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of change requested against a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Create => write!(f, "create"),
            Operation::Update => write!(f, "update"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// Link from one resource to another, carried by reference rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub from_uuid: String,
    pub to_kind: String,
    pub to_uuid: String,
}

/// A single change against a named resource.
///
/// Built by the event decoder and handed by value through the processor
/// chain to the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub operation: Operation,
    pub resource_kind: String,
    /// Key column values; the first one is the resource UUID
    pub primary_key: Vec<String>,
    /// Non-key column values
    pub payload: Map<String, Value>,
    pub version: i64,
    /// Fully qualified name, when the row carries one
    pub fq_name: Option<Vec<String>>,
    pub reference: Option<Reference>,
}

impl Event {
    pub fn new(operation: Operation, resource_kind: impl Into<String>, primary_key: Vec<String>) -> Self {
        Self {
            operation,
            resource_kind: resource_kind.into(),
            primary_key,
            payload: Map::new(),
            version: 0,
            fq_name: None,
            reference: None,
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn uuid(&self) -> Option<&str> {
        self.primary_key.first().map(String::as_str)
    }

    /// Store key of the resource under `root`: `/<root>/<kind>/<pk...>`.
    ///
    /// Key values are percent-encoded, so each one maps to exactly one path
    /// segment.
    pub fn key(&self, root: &str) -> String {
        let root = root.trim_matches('/');
        let path = self
            .primary_key
            .iter()
            .map(|value| key_segment(value.as_str()))
            .collect::<Vec<_>>()
            .join("/");
        if root.is_empty() {
            format!("/{}/{}", self.resource_kind, path)
        } else {
            format!("/{}/{}/{}", root, self.resource_kind, path)
        }
    }
}

fn key_segment(value: &str) -> String {
    match value {
        "." | ".." => value.replace('.', "%2E"),
        _ => urlencoding::encode(value).into_owned(),
    }
}

/// Ordered events applied downstream as one atomic unit
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventList {
    events: Vec<Event>,
}

impl EventList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(event: Event) -> Self {
        Self {
            events: vec![event],
        }
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.events.iter()
    }
}

impl From<Vec<Event>> for EventList {
    fn from(events: Vec<Event>) -> Self {
        Self { events }
    }
}

impl Extend<Event> for EventList {
    fn extend<T: IntoIterator<Item = Event>>(&mut self, iter: T) {
        self.events.extend(iter);
    }
}

impl FromIterator<Event> for EventList {
    fn from_iter<T: IntoIterator<Item = Event>>(iter: T) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for EventList {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventList {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let event = Event::new(Operation::Create, "virtual_network", vec!["vn-blue".into()]);
        assert_eq!(event.key("/prefix"), "/prefix/virtual_network/vn-blue");
        assert_eq!(event.key("prefix/"), "/prefix/virtual_network/vn-blue");
        assert_eq!(event.key("/"), "/virtual_network/vn-blue");

        let reference = Event::new(
            Operation::Create,
            "ref_vmi_vn",
            vec!["vmi-1".into(), "vn-1".into()],
        );
        assert_eq!(reference.key("/prefix"), "/prefix/ref_vmi_vn/vmi-1/vn-1");
        assert_eq!(reference.uuid(), Some("vmi-1"));
    }

    #[test]
    fn test_key_values_stay_in_their_segment() {
        let single = Event::new(Operation::Create, "virtual_network", vec!["a/b".into()]);
        let composite = Event::new(
            Operation::Create,
            "virtual_network",
            vec!["a".into(), "b".into()],
        );
        assert_eq!(single.key("/prefix"), "/prefix/virtual_network/a%2Fb");
        assert_eq!(composite.key("/prefix"), "/prefix/virtual_network/a/b");
        assert_ne!(single.key("/prefix"), composite.key("/prefix"));

        let escape = Event::new(
            Operation::Delete,
            "virtual_network",
            vec!["..".into(), "network_ipam".into()],
        );
        assert_eq!(
            escape.key("/prefix"),
            "/prefix/virtual_network/%2E%2E/network_ipam"
        );

        let spaced = Event::new(Operation::Create, "virtual_network", vec!["blue net%".into()]);
        assert_eq!(spaced.key("/prefix"), "/prefix/virtual_network/blue%20net%25");
    }

    #[test]
    fn test_event_list_preserves_order() {
        let list: EventList = ["a", "b", "c"]
            .into_iter()
            .map(|id| Event::new(Operation::Create, "kind", vec![id.to_string()]))
            .collect();
        let ids: Vec<_> = list.iter().filter_map(Event::uuid).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(list.len(), 3);
    }
}
