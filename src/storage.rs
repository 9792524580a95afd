use std::fmt::{Debug, Formatter, Result};
use std::time::Duration as StdDuration;
use time::{Duration, OffsetDateTime};

use crate::identifier::Identifier;
use crate::protocol::ListEntry;
use crate::reactor::{Timer, TimerKind};

/// Whether this node holds an object because it is responsible for the key or as a copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Original,
    Replica,
}

/// One stored value.
#[derive(Clone, PartialEq, Eq)]
pub struct DataObject {
    pub key: Identifier,
    pub data_type: u32,
    pub payload: Vec<u8>,
    /// Lifetime in seconds, counted from `inserted_at`.
    pub expiration: u32,
    pub inserted_at: OffsetDateTime,
    pub origin: Origin,
}

impl DataObject {
    pub fn new(
        key: Identifier,
        data_type: u32,
        payload: Vec<u8>,
        expiration: u32,
        inserted_at: OffsetDateTime,
        origin: Origin,
    ) -> Self {
        DataObject {
            key,
            data_type,
            payload,
            expiration,
            inserted_at,
            origin,
        }
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        now - self.inserted_at >= Duration::seconds(i64::from(self.expiration))
    }

    /// Seconds left before the object expires, never negative.
    pub fn remaining(&self, now: OffsetDateTime) -> u32 {
        let elapsed = (now - self.inserted_at).whole_seconds().max(0);
        (i64::from(self.expiration) - elapsed).max(0) as u32
    }
}

impl Debug for DataObject {
    fn fmt(&self, f: &mut Formatter) -> Result {
        write!(
            f,
            "{} type {} ({} bytes, {}s, {:?})",
            self.key,
            self.data_type,
            self.payload.len(),
            self.expiration,
            self.origin
        )
    }
}

/// A node's local objects. Keys are not unique: several values may be stored under one key.
pub struct Storage {
    objects: Vec<DataObject>,
    sweep_period: StdDuration,
}

impl Storage {
    pub fn new(sweep_period: StdDuration) -> Self {
        Storage {
            objects: Vec::new(),
            sweep_period,
        }
    }

    /// Inserts `object`, arming the expiration sweep if the store was empty.
    pub fn store(&mut self, object: DataObject, timer: &mut dyn Timer) {
        if self.objects.is_empty() {
            timer.schedule(self.sweep_period, TimerKind::StorageSweep);
        }
        self.objects.push(object);
    }

    pub fn fetch(&self, key: &Identifier, data_type: u32) -> Vec<&DataObject> {
        self.objects
            .iter()
            .filter(|object| object.key == *key && object.data_type == data_type)
            .collect()
    }

    pub fn fetch_by_id(&self, key: &Identifier) -> Vec<&DataObject> {
        self.objects.iter().filter(|object| object.key == *key).collect()
    }

    /// Returns every object whose key lies strictly between `low` and `high` on the ring.
    pub fn fetch_range(&self, low: &Identifier, high: &Identifier) -> Vec<&DataObject> {
        self.objects
            .iter()
            .filter(|object| Identifier::between(low, high, &object.key))
            .collect()
    }

    /// Re-flags every object with key in `(low, high]` as a replica and returns copies of them.
    pub fn demote_range(&mut self, low: &Identifier, high: &Identifier) -> Vec<DataObject> {
        let mut ret = Vec::new();
        for object in &mut self.objects {
            if object.key == *high || Identifier::between(low, high, &object.key) {
                object.origin = Origin::Replica;
                ret.push(object.clone());
            }
        }
        ret
    }

    /// Removes expired objects and re-arms the sweep if anything is left. Returns the number of
    /// objects removed.
    pub fn sweep(&mut self, now: OffsetDateTime, timer: &mut dyn Timer) -> usize {
        let before = self.objects.len();
        self.objects.retain(|object| {
            if object.is_expired(now) {
                debug!("Removed {:?}", object);
                false
            } else {
                true
            }
        });
        if !self.objects.is_empty() {
            timer.schedule(self.sweep_period, TimerKind::StorageSweep);
        }
        before - self.objects.len()
    }

    /// Lists `(key, type)` for every object with key in `(low, high]`.
    pub fn list(&self, low: &Identifier, high: &Identifier) -> Vec<ListEntry> {
        self.objects
            .iter()
            .filter(|object| object.key == *high || Identifier::between(low, high, &object.key))
            .map(|object| ListEntry {
                key: object.key,
                data_type: object.data_type,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataObject> {
        self.objects.iter()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
