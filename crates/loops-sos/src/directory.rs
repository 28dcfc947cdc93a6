//! Read access to profiles, contacts and circle membership.
//!
//! Profile and circle management live outside the engine. [`Directory`] is
//! the seam; [`InMemoryDirectory`] backs tests and single-process deployments.

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use loops_core::{CircleId, UserId};

use crate::contact::{Contact, UserProfile};
use crate::error::{Result, SosError};

/// Read-only view of user-owned data the engine depends on.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Loads the profile of `user`, if one exists.
    async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>>;

    /// Loads the contacts of `user`, most urgent tier first.
    async fn contacts_for_user(&self, user: &UserId) -> Result<Vec<Contact>>;

    /// Returns true if `user` belongs to `circle`.
    async fn is_circle_member(&self, user: &UserId, circle: &CircleId) -> Result<bool>;
}

fn poison_err<T>(_: PoisonError<T>) -> SosError {
    SosError::internal("directory lock poisoned")
}

#[derive(Debug, Default)]
struct DirectoryState {
    profiles: HashMap<UserId, UserProfile>,
    contacts: HashMap<UserId, Vec<Contact>>,
    circles: HashMap<CircleId, HashSet<UserId>>,
}

/// In-memory [`Directory`].
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    state: RwLock<DirectoryState>,
}

impl InMemoryDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a profile.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn upsert_profile(&self, profile: UserProfile) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.profiles.insert(profile.user_id.clone(), profile);
        Ok(())
    }

    /// Adds a contact to its owner's list.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_contact(&self, contact: Contact) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state
            .contacts
            .entry(contact.user_id.clone())
            .or_default()
            .push(contact);
        Ok(())
    }

    /// Adds `user` to `circle`, creating the circle if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn add_circle_member(&self, circle: CircleId, user: UserId) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.circles.entry(circle).or_default().insert(user);
        Ok(())
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.profiles.get(user).cloned())
    }

    async fn contacts_for_user(&self, user: &UserId) -> Result<Vec<Contact>> {
        let state = self.state.read().map_err(poison_err)?;
        let mut contacts = state.contacts.get(user).cloned().unwrap_or_default();
        drop(state);
        contacts.sort_by(|a, b| {
            a.priority_tier
                .cmp(&b.priority_tier)
                .then_with(|| a.contact_id.cmp(&b.contact_id))
        });
        Ok(contacts)
    }

    async fn is_circle_member(&self, user: &UserId, circle: &CircleId) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .circles
            .get(circle)
            .is_some_and(|members| members.contains(user)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contact::PriorityTier;
    use loops_core::ContactId;

    #[tokio::test]
    async fn contacts_sorted_by_tier() -> Result<()> {
        let directory = InMemoryDirectory::new();
        let user = UserId::new("u1")?;
        for (id, tier) in [
            ("k3", PriorityTier::Tertiary),
            ("k1", PriorityTier::Primary),
            ("k2", PriorityTier::Secondary),
        ] {
            directory.add_contact(Contact::new(ContactId::new(id)?, user.clone(), tier))?;
        }

        let ids: Vec<_> = directory
            .contacts_for_user(&user)
            .await?
            .into_iter()
            .map(|c| c.contact_id.to_string())
            .collect();
        assert_eq!(ids, ["k1", "k2", "k3"]);
        Ok(())
    }

    #[tokio::test]
    async fn membership_is_per_circle() -> Result<()> {
        let directory = InMemoryDirectory::new();
        let user = UserId::new("u1")?;
        directory.add_circle_member(CircleId::new("c1")?, user.clone())?;

        assert!(directory.is_circle_member(&user, &CircleId::new("c1")?).await?);
        assert!(!directory.is_circle_member(&user, &CircleId::new("c2")?).await?);
        assert!(directory.profile(&user).await?.is_none());
        Ok(())
    }
}
