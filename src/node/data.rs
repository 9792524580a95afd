use super::{FetchOutcome, Node, Outcome};
use crate::envelope::LabelStack;
use crate::error::Result;
use crate::forwarding::Delivery;
use crate::identifier::Identifier;
use crate::node::peer_info::PeerInfo;
use crate::protocol::{
    Command, Directory, Fetch, List, ListEntry, Retrieved, Store, StoreKind, TransactionId,
};
use crate::storage::{DataObject, Origin};

impl Node {
    /// Stores `payload` under `(key, data_type)` for `ttl` seconds, on this node if it is
    /// responsible for `key` and on the responsible node otherwise.
    pub fn store(
        &mut self,
        key: Identifier,
        data_type: u32,
        ttl: u32,
        payload: Vec<u8>,
    ) -> Result<()> {
        self.ensure_joined()?;
        let store = Store {
            key,
            data_type,
            payload,
            ttl,
            kind: StoreKind::Original,
        };
        if self.is_responsible(&key) {
            self.on_store(store);
            return Ok(());
        }
        debug!("{} - routing store for {}", self.id, key);
        self.route(LabelStack::to_identifier(&key), Command::Store(store))
    }

    /// Looks up `(key, data_type)`. Remote answers arrive later as `Outcome::Retrieved`.
    pub fn fetch(&mut self, key: Identifier, data_type: u32) -> Result<FetchOutcome> {
        self.ensure_joined()?;
        if self.is_responsible(&key) {
            let objects: Vec<DataObject> = self
                .storage
                .fetch(&key, data_type)
                .into_iter()
                .cloned()
                .collect();
            info!("{} - found {} local objects for {}", self.id, objects.len(), key);
            return Ok(FetchOutcome::Local(objects));
        }
        let fetch = Command::Fetch(Fetch { key, data_type });
        self.route(LabelStack::to_identifier(&key), fetch)?;
        Ok(FetchOutcome::Routed)
    }

    /// Lists the keys held in `(low, high]` by the node responsible for `high`. Returns `None` if
    /// the request was routed; the answer then arrives as `Outcome::Listed`.
    pub fn directory(
        &mut self,
        low: Identifier,
        high: Identifier,
    ) -> Result<Option<Vec<ListEntry>>> {
        self.ensure_joined()?;
        if self.is_responsible(&high) {
            return Ok(Some(self.storage.list(&low, &high)));
        }
        let directory = Command::Directory(Directory {
            peer_id: self.id,
            low,
            high,
        });
        self.route(LabelStack::to_identifier(&high), directory)?;
        Ok(None)
    }

    pub(super) fn on_store(&mut self, store: Store) {
        let origin = match store.kind {
            StoreKind::Original => Origin::Original,
            StoreKind::Replica => Origin::Replica,
        };
        let object = DataObject::new(
            store.key,
            store.data_type,
            store.payload,
            store.ttl,
            self.timer.now(),
            origin,
        );
        debug!("{} - storing {:?}", self.id, object);
        if origin == Origin::Original {
            self.replicate(&object);
        }
        self.storage.store(object, &mut *self.timer);
    }

    /// Copies an original object to the first `num_replicas` successors. Successors that are not
    /// connected yet get the copy once they are.
    fn replicate(&mut self, object: &DataObject) {
        let targets: Vec<Identifier> = self
            .routing_table
            .successors()
            .iter()
            .take(self.config.num_replicas)
            .cloned()
            .collect();
        for id in targets {
            let connected = self
                .routing_table
                .lookup_by_id(&id)
                .map_or(false, PeerInfo::is_connected);
            if connected {
                if let Err(err) = self.send_replica(&id, object) {
                    warn!("{} - replicating to {} failed: {}", self.id, id, err);
                }
            } else if let Some(peer) = self.routing_table.lookup_by_id_mut(&id) {
                debug!("{} - queueing replica for {}", self.id, id);
                peer.pending_stores.push(object.clone());
            }
        }
    }

    fn send_replica(&mut self, id: &Identifier, object: &DataObject) -> Result<()> {
        let store = Command::Store(Store {
            key: object.key,
            data_type: object.data_type,
            payload: object.payload.clone(),
            ttl: object.remaining(self.timer.now()),
            kind: StoreKind::Replica,
        });
        self.send_to_peer(id, store)
    }

    /// Sends the replicas queued for `id` while it was connecting.
    pub(super) fn flush_pending_stores(&mut self, id: &Identifier) -> Result<()> {
        let pending = match self.routing_table.lookup_by_id_mut(id) {
            Some(peer) => std::mem::replace(&mut peer.pending_stores, Vec::new()),
            None => return Ok(()),
        };
        for object in &pending {
            self.send_replica(id, object)?;
        }
        Ok(())
    }

    /// Gives a new predecessor copies of the objects in `(low, id]`, which it now owns.
    pub(super) fn hand_off(&mut self, id: &Identifier, low: &Identifier) -> Result<()> {
        let objects = self.storage.demote_range(low, id);
        info!("{} - handing {} objects to {}", self.id, objects.len(), id);
        for object in &objects {
            self.send_replica(id, object)?;
        }
        Ok(())
    }

    pub(super) fn on_fetch(
        &mut self,
        fetch: Fetch,
        transaction_id: TransactionId,
        delivery: Delivery,
    ) -> Result<()> {
        let now = self.timer.now();
        let answers: Vec<Retrieved> = self
            .storage
            .fetch(&fetch.key, fetch.data_type)
            .into_iter()
            .map(|object| Retrieved {
                key: object.key,
                data_type: object.data_type,
                payload: object.payload.clone(),
                ttl: object.remaining(now),
            })
            .collect();
        if answers.is_empty() {
            debug!("{} - nothing stored for {}", self.id, fetch.key);
        }
        for retrieved in answers {
            self.reply(&delivery, transaction_id, Command::Retrieved(retrieved))?;
        }
        Ok(())
    }

    pub(super) fn on_retrieved(&mut self, retrieved: Retrieved) {
        let object = DataObject::new(
            retrieved.key,
            retrieved.data_type,
            retrieved.payload,
            retrieved.ttl,
            self.timer.now(),
            Origin::Replica,
        );
        info!("{} - retrieved {:?}", self.id, object);
        self.outcomes.push(Outcome::Retrieved(object));
    }

    pub(super) fn on_directory(
        &mut self,
        directory: Directory,
        transaction_id: TransactionId,
        delivery: Delivery,
    ) -> Result<()> {
        let entries = self.storage.list(&directory.low, &directory.high);
        debug!(
            "{} - listing {} keys for {}",
            self.id,
            entries.len(),
            directory.peer_id
        );
        self.reply(&delivery, transaction_id, Command::List(List { entries }))
    }
}
