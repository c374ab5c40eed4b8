use crier_wire::Publication;

/// Stable reference to a stored publication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubId(usize);

/// Append-only store of every publication the broker has received.
///
/// Entries are never mutated or removed while the broker runs, so a
/// [`PubId`] stays valid for the broker's lifetime and backlogs can hold
/// indices instead of copies.
#[derive(Debug, Default)]
pub struct PublicationStore {
    entries: Vec<Publication>,
}

impl PublicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, publication: Publication) -> PubId {
        let id = PubId(self.entries.len());
        self.entries.push(publication);
        id
    }

    pub fn get(&self, id: PubId) -> &Publication {
        &self.entries[id.0]
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
    use crier_wire::PayloadValue;

    use super::*;

    fn publication(topic: &str) -> Publication {
        Publication {
            topic: topic.into(),
            source: "127.0.0.1:9".parse().unwrap(),
            value: PayloadValue::Int(1),
        }
    }

    #[test]
    fn ids_stay_valid_across_growth() {
        let mut store = PublicationStore::new();
        let first = store.append(publication("a"));
        let ids: Vec<PubId> = (0..1000).map(|i| store.append(publication(&i.to_string()))).collect();
        assert_eq!(store.get(first).topic, "a");
        assert_eq!(store.get(ids[500]).topic, "500");
        assert_eq!(store.len(), 1001);
    }
}
