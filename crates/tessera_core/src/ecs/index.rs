//! # Archetype Index
//!
//! Owns every [`Archetype`], keyed by canonical signature. At most one
//! archetype exists per key.
//!
//! Ids are slots in a table and are never reused: an archetype dropped by
//! [`ArchetypeIndex::cleanup_empty`] leaves a hole, so stale ids resolve to
//! `None` instead of to a different archetype.

use std::collections::HashMap;

use super::archetype::{Archetype, ArchetypeId};
use super::component::ComponentTypes;
use super::signature::{Signature, SignatureKey};
use crate::error::CoreResult;

/// Registry of signature → archetype.
#[derive(Debug, Default)]
pub struct ArchetypeIndex {
    slots: Vec<Option<Archetype>>,
    by_key: HashMap<SignatureKey, ArchetypeId>,
}

impl ArchetypeIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the archetype for `signature`, creating an empty one if unseen.
    ///
    /// # Errors
    ///
    /// Fails if the signature names an unregistered component.
    pub fn get_or_create(
        &mut self,
        signature: &Signature,
        types: &ComponentTypes,
    ) -> CoreResult<ArchetypeId> {
        let key = signature.key();
        if let Some(&id) = self.by_key.get(&key) {
            return Ok(id);
        }

        #[allow(clippy::cast_possible_truncation)]
        let id = ArchetypeId::new(self.slots.len() as u32);
        let archetype = Archetype::new(id, Signature::from_ids(signature.iter()), types)?;
        tracing::debug!("created {} for signature {}", id, key);
        self.slots.push(Some(archetype));
        self.by_key.insert(key, id);
        Ok(id)
    }

    /// Looks up an archetype by exact signature.
    #[must_use]
    pub fn find(&self, signature: &Signature) -> Option<ArchetypeId> {
        self.by_key.get(&signature.key()).copied()
    }

    /// Archetype by id.
    #[inline]
    #[must_use]
    pub fn get(&self, id: ArchetypeId) -> Option<&Archetype> {
        self.slots.get(id.index())?.as_ref()
    }

    /// Mutable archetype by id.
    #[inline]
    pub fn get_mut(&mut self, id: ArchetypeId) -> Option<&mut Archetype> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Two distinct archetypes, mutably. `None` if equal or missing.
    pub fn get_pair_mut(
        &mut self,
        a: ArchetypeId,
        b: ArchetypeId,
    ) -> Option<(&mut Archetype, &mut Archetype)> {
        let (ai, bi) = (a.index(), b.index());
        if ai == bi || ai.max(bi) >= self.slots.len() {
            return None;
        }
        if ai < bi {
            let (lo, hi) = self.slots.split_at_mut(bi);
            Some((lo[ai].as_mut()?, hi[0].as_mut()?))
        } else {
            let (lo, hi) = self.slots.split_at_mut(ai);
            Some((hi[0].as_mut()?, lo[bi].as_mut()?))
        }
    }

    /// Lazily yields archetypes whose signature is a superset of `required`
    /// and disjoint from `forbidden`.
    pub fn matching<'a>(
        &'a self,
        required: &'a Signature,
        forbidden: &'a Signature,
    ) -> impl Iterator<Item = &'a Archetype> + 'a {
        self.iter()
            .filter(move |a| a.signature().matches(required, forbidden))
    }

    /// Ids of archetypes matching the query, in id order.
    #[must_use]
    pub fn matching_ids(&self, required: &Signature, forbidden: &Signature) -> Vec<ArchetypeId> {
        self.matching(required, forbidden).map(Archetype::id).collect()
    }

    /// All live archetypes in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Archetype> {
        self.slots.iter().flatten()
    }

    /// Number of live archetypes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    /// Checks if no archetype exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Drops every empty archetype. Returns how many were dropped.
    pub fn cleanup_empty(&mut self) -> usize {
        let mut dropped = 0;
        for slot in &mut self.slots {
            if slot.as_ref().is_some_and(Archetype::is_empty) {
                if let Some(archetype) = slot.take() {
                    self.by_key.remove(archetype.key());
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            tracing::debug!("dropped {} empty archetypes", dropped);
        }
        dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ecs::{ColumnStorage, ComponentTypeId, Entity};

    fn registry(n: u32) -> (ComponentTypes, Vec<ComponentTypeId>) {
        let mut types = ComponentTypes::new();
        let names = ["A", "B", "C", "D"];
        let ids = (0..n as usize)
            .map(|i| match i {
                0 => types.register_record::<u8>(names[0], ColumnStorage::Plain),
                1 => types.register_record::<u16>(names[1], ColumnStorage::Plain),
                2 => types.register_record::<u32>(names[2], ColumnStorage::Plain),
                _ => types.register_record::<u64>(names[3], ColumnStorage::Plain),
            })
            .collect::<CoreResult<Vec<_>>>()
            .unwrap();
        (types, ids)
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let (types, ids) = registry(2);
        let mut index = ArchetypeIndex::new();
        let sig = Signature::from_ids([ids[0], ids[1]]);
        let mut padded = Signature::with_words(4);
        padded.insert(ids[1]);
        padded.insert(ids[0]);

        let a = index.get_or_create(&sig, &types).unwrap();
        let b = index.get_or_create(&padded, &types).unwrap();
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);
        assert_eq!(index.find(&padded), Some(a));
    }

    #[test]
    fn test_matching_required_and_forbidden() {
        let (types, ids) = registry(3);
        let mut index = ArchetypeIndex::new();
        let ab = index.get_or_create(&Signature::from_ids([ids[0], ids[1]]), &types).unwrap();
        let abc = index
            .get_or_create(&Signature::from_ids([ids[0], ids[1], ids[2]]), &types)
            .unwrap();
        let c = index.get_or_create(&Signature::from_ids([ids[2]]), &types).unwrap();

        let required = Signature::from_ids([ids[0]]);
        assert_eq!(index.matching_ids(&required, &Signature::new()), vec![ab, abc]);

        let forbidden = Signature::from_ids([ids[2]]);
        assert_eq!(index.matching_ids(&required, &forbidden), vec![ab]);

        assert_eq!(index.matching_ids(&Signature::new(), &Signature::new()), vec![ab, abc, c]);
    }

    #[test]
    fn test_cleanup_empty_keeps_ids_stable() {
        let (types, ids) = registry(2);
        let mut index = ArchetypeIndex::new();
        let a = index.get_or_create(&Signature::from_ids([ids[0]]), &types).unwrap();
        let b = index.get_or_create(&Signature::from_ids([ids[1]]), &types).unwrap();
        index
            .get_mut(b)
            .unwrap()
            .push(Entity::new(1), |ty| types.default_value(ty).unwrap())
            .unwrap();

        assert_eq!(index.cleanup_empty(), 1);
        assert!(index.get(a).is_none());
        assert!(index.get(b).is_some());

        let again = index.get_or_create(&Signature::from_ids([ids[0]]), &types).unwrap();
        assert_ne!(again, a);
    }

    #[test]
    fn test_get_pair_mut() {
        let (types, ids) = registry(2);
        let mut index = ArchetypeIndex::new();
        let a = index.get_or_create(&Signature::from_ids([ids[0]]), &types).unwrap();
        let b = index.get_or_create(&Signature::from_ids([ids[1]]), &types).unwrap();
        let (x, y) = index.get_pair_mut(b, a).unwrap();
        assert_eq!((x.id(), y.id()), (b, a));
        assert!(index.get_pair_mut(a, a).is_none());
    }
}
