use std::fmt;

use sonic_rs::Value;

use super::event::Directive;
use super::types::{SyncError, SyncResult};

/// Logical subscription target family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Truck,
    Bin,
    Simulation,
    Optimization,
}

impl TopicKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TopicKind::Truck => "truck",
            TopicKind::Bin => "bin",
            TopicKind::Simulation => "simulation",
            TopicKind::Optimization => "optimization",
        }
    }

    /// Truck and bin topics address one entity; feed topics address none.
    pub fn requires_id(self) -> bool {
        matches!(self, TopicKind::Truck | TopicKind::Bin)
    }

    pub fn subscribe_event(self) -> &'static str {
        match self {
            TopicKind::Truck => "subscribe_truck",
            TopicKind::Bin => "subscribe_bin",
            TopicKind::Simulation => "subscribe_simulation",
            TopicKind::Optimization => "subscribe_optimization",
        }
    }

    pub fn unsubscribe_event(self) -> &'static str {
        match self {
            TopicKind::Truck => "unsubscribe_truck",
            TopicKind::Bin => "unsubscribe_bin",
            TopicKind::Simulation => "unsubscribe_simulation",
            TopicKind::Optimization => "unsubscribe_optimization",
        }
    }
}

/// A `(kind, identifier)` subscription pair, validated at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    kind: TopicKind,
    id: Option<String>,
}

impl Topic {
    pub fn new(kind: TopicKind, id: Option<String>) -> SyncResult<Self> {
        match (kind.requires_id(), id) {
            (true, Some(id)) if !id.trim().is_empty() => Ok(Self { kind, id: Some(id) }),
            (true, _) => Err(SyncError::InvalidTopic(format!(
                "{} topic requires a non-empty identifier",
                kind.as_str()
            ))),
            (false, None) => Ok(Self { kind, id: None }),
            (false, Some(id)) => Err(SyncError::InvalidTopic(format!(
                "{} topic takes no identifier (got {id:?})",
                kind.as_str()
            ))),
        }
    }

    pub fn truck(id: impl Into<String>) -> SyncResult<Self> {
        Self::new(TopicKind::Truck, Some(id.into()))
    }

    pub fn bin(id: impl Into<String>) -> SyncResult<Self> {
        Self::new(TopicKind::Bin, Some(id.into()))
    }

    pub fn simulation() -> Self {
        Self {
            kind: TopicKind::Simulation,
            id: None,
        }
    }

    pub fn optimization() -> Self {
        Self {
            kind: TopicKind::Optimization,
            id: None,
        }
    }

    pub fn kind(&self) -> TopicKind {
        self.kind
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn subscribe_directive(&self) -> Directive {
        Directive::new(self.kind.subscribe_event(), self.directive_payload())
    }

    pub fn unsubscribe_directive(&self) -> Directive {
        Directive::new(self.kind.unsubscribe_event(), self.directive_payload())
    }

    fn directive_payload(&self) -> Value {
        match &self.id {
            Some(id) => sonic_rs::json!({ "id": id.as_str() }),
            None => sonic_rs::json!({}),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.id {
            Some(id) => write!(f, "{}:{id}", self.kind.as_str()),
            None => f.write_str(self.kind.as_str()),
        }
    }
}

/// Application subscription intent, kept in insertion order for deterministic replay.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    topics: Vec<Topic>,
    applied: bool,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the topic was not tracked yet.
    pub fn insert(&mut self, topic: Topic) -> bool {
        if self.topics.contains(&topic) {
            return false;
        }
        self.topics.push(topic);
        true
    }

    /// Returns `true` when the topic was tracked.
    pub fn remove(&mut self, topic: &Topic) -> bool {
        let before = self.topics.len();
        self.topics.retain(|t| t != topic);
        self.topics.len() != before
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    pub fn topics(&self) -> &[Topic] {
        &self.topics
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// One subscribe directive per tracked topic, in insertion order. Marks the set applied.
    pub fn replay(&mut self) -> Vec<Directive> {
        self.applied = true;
        self.topics.iter().map(Topic::subscribe_directive).collect()
    }

    pub fn is_applied(&self) -> bool {
        self.applied
    }

    pub fn mark_unapplied(&mut self) {
        self.applied = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_topics_need_an_identifier() {
        assert!(Topic::truck("T-004").is_ok());
        assert!(matches!(Topic::truck(""), Err(SyncError::InvalidTopic(_))));
        assert!(matches!(Topic::bin("  "), Err(SyncError::InvalidTopic(_))));
        assert!(matches!(
            Topic::new(TopicKind::Bin, None),
            Err(SyncError::InvalidTopic(_))
        ));
        assert!(matches!(
            Topic::new(TopicKind::Simulation, Some("x".into())),
            Err(SyncError::InvalidTopic(_))
        ));
        assert_eq!(
            Topic::new(TopicKind::Optimization, None).unwrap(),
            Topic::optimization()
        );
    }

    #[test]
    fn directives_use_fixed_names() {
        let truck = Topic::truck("T1").unwrap();
        let sub = truck.subscribe_directive();
        assert_eq!(sub.name, "subscribe_truck");
        assert_eq!(sub.payload, sonic_rs::json!({ "id": "T1" }));
        assert_eq!(truck.unsubscribe_directive().name, "unsubscribe_truck");

        let feed = Topic::simulation().subscribe_directive();
        assert_eq!(feed.name, "subscribe_simulation");
        assert_eq!(feed.payload, sonic_rs::json!({}));
        assert_eq!(
            Topic::optimization().unsubscribe_directive().name,
            "unsubscribe_optimization"
        );
        assert_eq!(Topic::bin("B7").unwrap().to_string(), "bin:B7");
    }

    #[test]
    fn registry_is_idempotent_and_ordered() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.insert(Topic::truck("T1").unwrap()));
        assert!(registry.insert(Topic::simulation()));
        assert!(!registry.insert(Topic::truck("T1").unwrap()));
        assert!(registry.insert(Topic::bin("B1").unwrap()));
        assert_eq!(registry.len(), 3);

        let names: Vec<_> = registry.replay().into_iter().map(|d| d.name).collect();
        assert_eq!(
            names,
            vec!["subscribe_truck", "subscribe_simulation", "subscribe_bin"]
        );
        assert!(registry.is_applied());

        assert!(registry.remove(&Topic::simulation()));
        assert!(!registry.remove(&Topic::simulation()));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unapplied_registry_keeps_entries() {
        let mut registry = SubscriptionRegistry::new();
        registry.insert(Topic::simulation());
        registry.replay();
        registry.mark_unapplied();
        assert!(!registry.is_applied());
        assert!(registry.contains(&Topic::simulation()));
    }
}
