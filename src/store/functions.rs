//! Caller-supplied record logic.
//!
//! The store never interprets values itself. Reads, writes and read-modify-write
//! updates are delegated to a [`Functions`] implementation, and every operation
//! reports its final status through one of the completion callbacks.

use std::marker::PhantomData;

use uuid::Uuid;

use crate::checkpoint::CommitPoint;
use crate::codec::{PersistKey, PersistValue};
use crate::status::Status;

/// Record logic and completion sink for a store.
///
/// Readers and updaters run while the calling session is epoch protected and
/// must not block. `concurrent_*` variants run on records in the mutable region
/// under the record lock; `single_*` variants run on private copies.
pub trait Functions: Send + Sync + 'static {
    /// Key type
    type Key: PersistKey;
    /// Value type
    type Value: PersistValue + Default;
    /// Per-operation input for reads and RMW
    type Input: Send + 'static;
    /// Read output
    type Output: Default + Send + 'static;
    /// Caller context handed back in completion callbacks
    type Context: Send + 'static;

    /// Copy `value` into `output` for a record that nobody else can modify.
    fn single_reader(
        &self,
        key: &Self::Key,
        input: &Self::Input,
        value: &Self::Value,
        output: &mut Self::Output,
        ctx: &Self::Context,
    );

    /// Copy `value` into `output` for a record in the mutable region.
    fn concurrent_reader(
        &self,
        key: &Self::Key,
        input: &Self::Input,
        value: &Self::Value,
        output: &mut Self::Output,
        ctx: &Self::Context,
    ) {
        self.single_reader(key, input, value, output, ctx)
    }

    /// Fill a new record's value. Returning `false` cancels the upsert.
    fn single_writer(
        &self,
        _key: &Self::Key,
        src: &Self::Value,
        dst: &mut Self::Value,
        _ctx: &Self::Context,
    ) -> bool {
        *dst = src.clone();
        true
    }

    /// Overwrite a mutable record's value. Returning `false` falls back to
    /// appending a new version.
    fn concurrent_writer(
        &self,
        key: &Self::Key,
        src: &Self::Value,
        dst: &mut Self::Value,
        ctx: &Self::Context,
    ) -> bool {
        self.single_writer(key, src, dst, ctx)
    }

    /// Create the value of a key that has no live version. Returning `false`
    /// leaves the key absent and the RMW reports `NotFound`.
    fn initial_updater(
        &self,
        key: &Self::Key,
        input: &Self::Input,
        value: &mut Self::Value,
        ctx: &Self::Context,
    ) -> bool;

    /// Derive a new version from an immutable old one. Returning `false` keeps
    /// the old version and the RMW reports `Ok`.
    fn copy_updater(
        &self,
        key: &Self::Key,
        input: &Self::Input,
        old_value: &Self::Value,
        new_value: &mut Self::Value,
        ctx: &Self::Context,
    ) -> bool;

    /// Update a mutable record in place. Returning `false` falls back to
    /// [`Functions::copy_updater`].
    fn in_place_updater(
        &self,
        key: &Self::Key,
        input: &Self::Input,
        value: &mut Self::Value,
        ctx: &Self::Context,
    ) -> bool;

    /// Final status of a read.
    fn read_completion_callback(
        &self,
        _key: &Self::Key,
        _input: &Self::Input,
        _output: &Self::Output,
        _ctx: Self::Context,
        _status: Status,
    ) {
    }

    /// Final status of an upsert.
    fn upsert_completion_callback(
        &self,
        _key: &Self::Key,
        _value: &Self::Value,
        _ctx: Self::Context,
        _status: Status,
    ) {
    }

    /// Final status of an RMW.
    fn rmw_completion_callback(
        &self,
        _key: &Self::Key,
        _input: &Self::Input,
        _ctx: Self::Context,
        _status: Status,
    ) {
    }

    /// Final status of a delete.
    fn delete_completion_callback(&self, _key: &Self::Key, _ctx: Self::Context, _status: Status) {}

    /// A checkpoint covering `commit_point` of session `session_id` is durable.
    fn checkpoint_completion_callback(&self, _session_id: Uuid, _commit_point: &CommitPoint) {}
}

/// Plain key-value semantics: reads copy the value out, RMW replaces it with the input.
pub struct SimpleFunctions<K, V> {
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> SimpleFunctions<K, V> {
    /// Create the functions object.
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<K, V> Default for SimpleFunctions<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Functions for SimpleFunctions<K, V>
where
    K: PersistKey,
    V: PersistValue + Default,
{
    type Key = K;
    type Value = V;
    type Input = V;
    type Output = Option<V>;
    type Context = ();

    fn single_reader(&self, _key: &K, _input: &V, value: &V, output: &mut Option<V>, _ctx: &()) {
        *output = Some(value.clone());
    }

    fn initial_updater(&self, _key: &K, input: &V, value: &mut V, _ctx: &()) -> bool {
        *value = input.clone();
        true
    }

    fn copy_updater(&self, _key: &K, input: &V, _old: &V, new_value: &mut V, _ctx: &()) -> bool {
        *new_value = input.clone();
        true
    }

    fn in_place_updater(&self, _key: &K, input: &V, value: &mut V, _ctx: &()) -> bool {
        *value = input.clone();
        true
    }
}
