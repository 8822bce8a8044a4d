use std::collections::HashMap;

use dashmap::DashMap;

/// Secondary index from an owner id to an ordered list of member ids
///
/// An absent owner means "not derived yet" and prompts a lazy fill; an
/// owner mapped to an empty list means "derived, no members".
#[derive(Debug, Default)]
pub struct IdIndex {
    lists: DashMap<String, Vec<String>>,
}

impl IdIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, owner: &str) -> Option<Vec<String>> {
        self.lists.get(owner).map(|list| list.value().clone())
    }

    pub fn set(&self, owner: impl Into<String>, members: Vec<String>) {
        self.lists.insert(owner.into(), members);
    }

    /// Append a member to an owner's list, creating the list if needed
    pub fn add(&self, owner: &str, member: &str) {
        let mut list = self.lists.entry(owner.to_owned()).or_default();
        if !list.iter().any(|m| m == member) {
            list.push(member.to_owned());
        }
    }

    /// Drop a member from every owner's list
    pub fn remove_member(&self, member: &str) {
        for mut list in self.lists.iter_mut() {
            list.retain(|m| m != member);
        }
    }

    pub fn remove_owner(&self, owner: &str) {
        self.lists.remove(owner);
    }

    /// Owners whose list currently contains `member`
    pub fn owners_of(&self, member: &str) -> Vec<String> {
        self.lists
            .iter()
            .filter(|list| list.value().iter().any(|m| m == member))
            .map(|list| list.key().clone())
            .collect()
    }

    /// Swap in a freshly derived index
    pub fn replace_all(&self, lists: HashMap<String, Vec<String>>) {
        let owners: Vec<String> = lists.keys().cloned().collect();
        for (owner, members) in lists {
            self.lists.insert(owner, members);
        }
        self.lists.retain(|owner, _| owners.contains(owner));
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }
}
