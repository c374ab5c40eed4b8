use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("no active subscriber owns that stream")]
    SubscriberNotFound,
    #[error("not subscribed to topic {0:?}")]
    TopicNotFound(String),
}

/// One `(topic, store-and-forward)` interest declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topic: String,
    pub store_forward: bool,
}

/// A subscriber's interest list. Topics are unique; insertion order is
/// preserved so matching scans are deterministic.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    entries: Vec<Subscription>,
}

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscription, or updates the flag in place when the topic is
    /// already present (last writer wins).
    pub fn subscribe(&mut self, topic: &str, store_forward: bool) {
        if let Some(existing) = self.entries.iter_mut().find(|s| s.topic == topic) {
            existing.store_forward = store_forward;
            return;
        }
        self.entries.push(Subscription { topic: topic.to_owned(), store_forward });
    }

    /// Removes a subscription, keeping the relative order of the rest.
    pub fn unsubscribe(&mut self, topic: &str) -> Result<(), SubscriptionError> {
        match self.entries.iter().position(|s| s.topic == topic) {
            Some(idx) => {
                self.entries.remove(idx);
                Ok(())
            }
            None => Err(SubscriptionError::TopicNotFound(topic.to_owned())),
        }
    }

    /// First subscription matching `topic` exactly. Topic uniqueness makes
    /// the first match the only match.
    pub fn find(&self, topic: &str) -> Option<&Subscription> {
        self.entries.iter().find(|s| s.topic == topic)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
