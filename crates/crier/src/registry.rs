use mio::Token;
use thiserror::Error;

use crate::{
    store::PubId,
    subscription::{SubscriptionError, SubscriptionSet},
};

/// Where a subscriber currently lives. A DEAD subscriber keeps its record
/// (subscriptions and backlog) but owns no stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Active(Token),
    Dead,
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registered {
    /// First time this identity was seen.
    New,
    /// A DEAD record was rebound to a fresh stream.
    Reconnected,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("client {0} already connected")]
    AlreadyConnected(String),
    #[error("no active subscriber on that stream")]
    NotFound,
}

/// Per-identity subscriber state. Created on first registration, kept until
/// broker shutdown regardless of how often the subscriber disconnects.
#[derive(Debug)]
pub struct SubscriberRecord {
    id: String,
    attachment: Attachment,
    pub subscriptions: SubscriptionSet,
    backlog: Vec<PubId>,
}

impl SubscriberRecord {
    fn new(id: String, token: Token) -> Self {
        Self {
            id,
            attachment: Attachment::Active(token),
            subscriptions: SubscriptionSet::new(),
            backlog: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attachment(&self) -> Attachment {
        self.attachment
    }

    pub fn backlog(&self) -> &[PubId] {
        &self.backlog
    }

    /// Queues a publication for delivery on the next reconnect. No
    /// deduplication: the caller decides eligibility per fanout.
    pub fn push_backlog(&mut self, id: PubId) {
        self.backlog.push(id);
    }

    /// Most recently enqueued backlog entry, if any.
    pub fn last_backlog(&self) -> Option<PubId> {
        self.backlog.last().copied()
    }

    /// Drops the most recently enqueued backlog entry after delivery.
    pub fn pop_backlog(&mut self) -> Option<PubId> {
        self.backlog.pop()
    }
}

/// Identity-keyed subscriber map with the ACTIVE/DEAD lifecycle.
///
/// Lookups are linear scans; the registry is control-plane sized and the
/// scan keeps registration order stable for fanout.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    records: Vec<SubscriberRecord>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `id` to a stream. An ACTIVE holder of the same identity wins:
    /// the new stream is refused. A DEAD record is rebound, keeping its
    /// subscriptions and backlog. Identities compare byte-exact.
    pub fn register(
        &mut self,
        id: &str,
        token: Token,
    ) -> Result<(usize, Registered), RegistryError> {
        if let Some(idx) = self.records.iter().position(|r| r.id == id) {
            let record = &mut self.records[idx];
            return match record.attachment {
                Attachment::Active(_) => Err(RegistryError::AlreadyConnected(id.to_owned())),
                Attachment::Dead => {
                    record.attachment = Attachment::Active(token);
                    Ok((idx, Registered::Reconnected))
                }
            };
        }
        self.records.push(SubscriberRecord::new(id.to_owned(), token));
        Ok((self.records.len() - 1, Registered::New))
    }

    /// Transitions the record bound to `token` to DEAD, detaching the
    /// stream but preserving subscriptions and backlog.
    pub fn close(&mut self, token: Token) -> Result<usize, RegistryError> {
        let idx = self.index_of(token).ok_or(RegistryError::NotFound)?;
        self.records[idx].attachment = Attachment::Dead;
        Ok(idx)
    }

    /// Index of the ACTIVE record bound to `token`.
    pub fn index_of(&self, token: Token) -> Option<usize> {
        self.records.iter().position(|r| r.attachment == Attachment::Active(token))
    }

    pub fn subscribe(
        &mut self,
        token: Token,
        topic: &str,
        store_forward: bool,
    ) -> Result<(), SubscriptionError> {
        let idx = self.index_of(token).ok_or(SubscriptionError::SubscriberNotFound)?;
        self.records[idx].subscriptions.subscribe(topic, store_forward);
        Ok(())
    }

    pub fn unsubscribe(&mut self, token: Token, topic: &str) -> Result<(), SubscriptionError> {
        let idx = self.index_of(token).ok_or(SubscriptionError::SubscriberNotFound)?;
        self.records[idx].subscriptions.unsubscribe(topic)
    }

    pub fn get(&self, idx: usize) -> &SubscriberRecord {
        &self.records[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut SubscriberRecord {
        &mut self.records[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriberRecord> {
        self.records.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubscriberRecord> {
        self.records.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_close_reconnect_lifecycle() {
        let mut registry = SubscriberRegistry::new();

        let (idx, outcome) = registry.register("alice", Token(4)).unwrap();
        assert_eq!(outcome, Registered::New);
        assert_eq!(registry.get(idx).attachment(), Attachment::Active(Token(4)));

        registry.subscribe(Token(4), "weather", true).unwrap();
        let mut store = crate::store::PublicationStore::new();
        let pub_id = store.append(crier_wire::Publication {
            topic: "weather".into(),
            source: "127.0.0.1:1".parse().unwrap(),
            value: crier_wire::PayloadValue::Int(1),
        });
        registry.get_mut(idx).push_backlog(pub_id);

        let closed = registry.close(Token(4)).unwrap();
        assert_eq!(closed, idx);
        assert_eq!(registry.get(idx).attachment(), Attachment::Dead);
        // Subscriptions and backlog survive the DEAD interval.
        assert_eq!(registry.get(idx).subscriptions.len(), 1);
        assert_eq!(registry.get(idx).backlog().len(), 1);

        let (again, outcome) = registry.register("alice", Token(9)).unwrap();
        assert_eq!(again, idx);
        assert_eq!(outcome, Registered::Reconnected);
        assert_eq!(registry.get(idx).attachment(), Attachment::Active(Token(9)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn duplicate_active_identity_is_refused() {
        let mut registry = SubscriberRegistry::new();
        registry.register("bob", Token(4)).unwrap();

        let err = registry.register("bob", Token(5)).unwrap_err();
        assert_eq!(err, RegistryError::AlreadyConnected("bob".into()));
        // The existing stream binding is untouched.
        assert_eq!(registry.index_of(Token(4)), Some(0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn close_unknown_stream_fails() {
        let mut registry = SubscriberRegistry::new();
        assert_eq!(registry.close(Token(77)), Err(RegistryError::NotFound));
    }

    #[test]
    fn subscribe_requires_active_record() {
        let mut registry = SubscriberRegistry::new();
        registry.register("carol", Token(4)).unwrap();
        registry.close(Token(4)).unwrap();

        assert_eq!(
            registry.subscribe(Token(4), "weather", false),
            Err(SubscriptionError::SubscriberNotFound)
        );
    }
}
