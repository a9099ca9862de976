//! Partitioned binary key/value storage over pooled memory blocks.
//!
//! Records are packed as `[key_len][key][value_len][value][next_slot]` with
//! length and link fields in the store's configured endianness. Each
//! partition keeps an open-addressed hash index over its records plus an
//! insertion-order slot vector; duplicate keys chain through `next_slot` in
//! insertion order.

use bytes::Bytes;

use crate::memory::{BlockChain, ChainingRule, MemoryContext, MemoryError, SlotAddr};

use super::{Accumulator, Codec, StorageConfig, StorageError};

/// Sentinel for "no next record" in a key's chain.
const NULL_NEXT: u64 = u64::MAX;

/// Sentinel for an unoccupied index bucket.
const EMPTY: u32 = u32::MAX;

/// Record header overhead: two u32 length fields plus the u64 next link.
const RECORD_OVERHEAD: usize = 16;

/// Stable 64-bit hash of key bytes.
///
/// The same function assigns keys to partitions and probes the per-partition
/// index, so equal keys always land in the same partition.
#[inline]
#[must_use]
pub(crate) fn hash_bytes(key: &[u8]) -> u64 {
    fxhash::hash64(key)
}

/// Handle to a committed record: partition plus in-chain address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    /// Partition the record lives in.
    pub partition: usize,
    /// Address of the record within the partition's chain.
    pub addr: SlotAddr,
}

#[derive(Clone, Copy)]
struct IndexEntry {
    hash: u64,
    /// Position of the key's head record in the slot vector.
    head: u32,
    /// Address of the key's most recently appended record.
    tail: SlotAddr,
}

impl IndexEntry {
    const fn vacant() -> Self {
        Self {
            hash: 0,
            head: EMPTY,
            tail: SlotAddr {
                block: 0,
                offset: 0,
            },
        }
    }

    fn is_vacant(self) -> bool {
        self.head == EMPTY
    }
}

enum Probe {
    Found(usize),
    Vacant(usize),
}

/// One partition: a block chain, its hash index, and its insertion order.
pub(crate) struct Partition {
    chain: BlockChain,
    index: Vec<IndexEntry>,
    occupied: usize,
    slots: Vec<SlotAddr>,
    codec: Codec,
    ctx: MemoryContext,
    rule: ChainingRule,
}

impl Partition {
    fn new(ctx: MemoryContext, rule: ChainingRule, codec: Codec) -> Self {
        Self {
            chain: BlockChain::new(ctx.clone(), rule),
            index: vec![IndexEntry::vacant(); 16],
            occupied: 0,
            slots: Vec::new(),
            codec,
            ctx,
            rule,
        }
    }

    /// Drops all records and blocks, leaving the partition ready for reuse.
    pub(crate) fn reset(&mut self) {
        self.chain = BlockChain::new(self.ctx.clone(), self.rule);
        self.index.clear();
        self.index.resize(16, IndexEntry::vacant());
        self.occupied = 0;
        self.slots.clear();
    }

    /// Record addresses in insertion order.
    pub(crate) fn slots(&self) -> &[SlotAddr] {
        &self.slots
    }

    /// Takes the slot vector out for sorting; pair with [`put_slots`].
    pub(crate) fn take_slots(&mut self) -> Vec<SlotAddr> {
        std::mem::take(&mut self.slots)
    }

    /// Restores a slot vector taken by [`take_slots`].
    pub(crate) fn put_slots(&mut self, slots: Vec<SlotAddr>) {
        self.slots = slots;
    }

    pub(crate) fn record_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn byte_usage(&self) -> usize {
        self.chain.byte_usage()
    }

    /// Key bytes of the record at `addr`.
    pub(crate) fn key_at(&self, addr: SlotAddr) -> &[u8] {
        let key_len = self.codec.read_u32(self.chain.bytes(addr, 4)) as usize;
        self.chain.bytes(Self::at(addr, 4), key_len)
    }

    /// Value bytes of the record at `addr`.
    pub(crate) fn value_at(&self, addr: SlotAddr) -> &[u8] {
        let key_len = self.codec.read_u32(self.chain.bytes(addr, 4)) as usize;
        let value_len = self
            .codec
            .read_u32(self.chain.bytes(Self::at(addr, 4 + key_len), 4))
            as usize;
        self.chain.bytes(Self::at(addr, 8 + key_len), value_len)
    }

    /// Address of the next record in the key's chain, if any.
    pub(crate) fn next_of(&self, addr: SlotAddr) -> Option<SlotAddr> {
        let key_len = self.codec.read_u32(self.chain.bytes(addr, 4)) as usize;
        let value_len = self
            .codec
            .read_u32(self.chain.bytes(Self::at(addr, 4 + key_len), 4))
            as usize;
        let next = self
            .codec
            .read_u64(self.chain.bytes(Self::at(addr, 8 + key_len + value_len), 8));
        (next != NULL_NEXT).then(|| SlotAddr::from_u64(next))
    }

    fn at(addr: SlotAddr, delta: usize) -> SlotAddr {
        #[allow(clippy::cast_possible_truncation)]
        SlotAddr {
            block: addr.block,
            offset: addr.offset + delta as u32,
        }
    }

    fn probe(&self, hash: u64, key: &[u8]) -> Probe {
        let mask = self.index.len() - 1;
        #[allow(clippy::cast_possible_truncation)]
        let mut i = (hash as usize) & mask;
        loop {
            let entry = self.index[i];
            if entry.is_vacant() {
                return Probe::Vacant(i);
            }
            if entry.hash == hash && self.key_at(self.slots[entry.head as usize]) == key {
                return Probe::Found(i);
            }
            i = (i + 1) & mask;
        }
    }

    fn grow_index_if_needed(&mut self) {
        if self.occupied * 4 < self.index.len() * 3 {
            return;
        }
        let new_cap = self.index.len() * 2;
        let old = std::mem::replace(&mut self.index, vec![IndexEntry::vacant(); new_cap]);
        let mask = new_cap - 1;
        for entry in old {
            if entry.is_vacant() {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let mut i = (entry.hash as usize) & mask;
            while !self.index[i].is_vacant() {
                i = (i + 1) & mask;
            }
            self.index[i] = entry;
        }
    }

    fn append_record(&mut self, key: &[u8], value: &[u8]) -> Result<SlotAddr, MemoryError> {
        let addr = self.chain.alloc(RECORD_OVERHEAD + key.len() + value.len())?;
        let mut word = [0u8; 8];

        #[allow(clippy::cast_possible_truncation)]
        self.codec.write_u32(&mut word, key.len() as u32);
        self.chain.write(addr, &word[..4]);
        self.chain.write(Self::at(addr, 4), key);

        #[allow(clippy::cast_possible_truncation)]
        self.codec.write_u32(&mut word, value.len() as u32);
        self.chain.write(Self::at(addr, 4 + key.len()), &word[..4]);
        self.chain.write(Self::at(addr, 8 + key.len()), value);

        self.codec.write_u64(&mut word, NULL_NEXT);
        self.chain
            .write(Self::at(addr, 8 + key.len() + value.len()), &word);

        Ok(addr)
    }

    fn write_next(&mut self, addr: SlotAddr, next: SlotAddr) {
        let key_len = self.codec.read_u32(self.chain.bytes(addr, 4)) as usize;
        let value_len = self
            .codec
            .read_u32(self.chain.bytes(Self::at(addr, 4 + key_len), 4))
            as usize;
        let mut word = [0u8; 8];
        self.codec.write_u64(&mut word, next.to_u64());
        self.chain
            .write(Self::at(addr, 8 + key_len + value_len), &word);
    }

    fn insert(
        &mut self,
        hash: u64,
        key: &[u8],
        value: &[u8],
        accumulator: Option<&dyn Accumulator>,
        scratch: &mut Vec<u8>,
    ) -> Result<(), MemoryError> {
        match self.probe(hash, key) {
            Probe::Vacant(pos) => {
                let addr = self.append_record(key, value)?;
                self.slots.push(addr);
                #[allow(clippy::cast_possible_truncation)]
                let head = (self.slots.len() - 1) as u32;
                self.index[pos] = IndexEntry {
                    hash,
                    head,
                    tail: addr,
                };
                self.occupied += 1;
                self.grow_index_if_needed();
                Ok(())
            }
            Probe::Found(pos) => {
                let entry = self.index[pos];
                if let Some(acc) = accumulator {
                    let head_addr = self.slots[entry.head as usize];
                    scratch.clear();
                    acc.combine(self.value_at(head_addr), value, scratch);
                    let old_len = self.value_at(head_addr).len();
                    if scratch.len() == old_len {
                        // Same serialized width: update the slot in place so
                        // scan order and addresses stay stable.
                        let key_len =
                            self.codec.read_u32(self.chain.bytes(head_addr, 4)) as usize;
                        let value_addr = Self::at(head_addr, 8 + key_len);
                        self.chain.write(value_addr, scratch);
                    } else {
                        let new_addr = self.append_record(key, scratch)?;
                        self.slots[entry.head as usize] = new_addr;
                        self.index[pos].tail = new_addr;
                    }
                } else {
                    // Duplicate key: append and link onto the chain tail.
                    let new_addr = self.append_record(key, value)?;
                    self.slots.push(new_addr);
                    self.write_next(entry.tail, new_addr);
                    self.index[pos].tail = new_addr;
                }
                Ok(())
            }
        }
    }

    fn lookup(&self, hash: u64, key: &[u8]) -> Option<SlotAddr> {
        match self.probe(hash, key) {
            Probe::Found(pos) => {
                let entry = self.index[pos];
                Some(self.slots[entry.head as usize])
            }
            Probe::Vacant(_) => None,
        }
    }
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("records", &self.slots.len())
            .field("keys", &self.occupied)
            .field("byte_usage", &self.byte_usage())
            .finish()
    }
}

/// Partitioned binary key/value store with hashed lookup and per-key
/// accumulation on insert.
pub struct BinaryStorage {
    partitions: Vec<Partition>,
    codec: Codec,
    scratch: Vec<u8>,
}

impl BinaryStorage {
    /// Creates a store over the context's pools per the configuration.
    ///
    /// # Panics
    ///
    /// Panics if `partition_count` is not a power of two.
    #[must_use]
    pub fn new(ctx: &MemoryContext, config: &StorageConfig) -> Self {
        config.assert_valid();
        let codec = Codec::new(config.use_big_endian);
        let partitions = (0..config.partition_count)
            .map(|_| Partition::new(ctx.clone(), config.chaining_rule, codec))
            .collect();
        Self {
            partitions,
            codec,
            scratch: Vec::new(),
        }
    }

    /// Appends a record, chaining duplicates of the key in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MemoryExhausted`] when no block can hold the
    /// record.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.put_with(key, value, None)
    }

    /// Appends a record, or combines it into the key's accumulator slot.
    ///
    /// With an accumulator present and a record of equal key bytes already
    /// stored, the slot value is replaced by
    /// `accumulator.combine(existing, value)`: in place when the combined
    /// serialization has the same width, otherwise by appending a fresh
    /// record and repointing the key at it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MemoryExhausted`] when no block can hold the
    /// record.
    pub fn put_with(
        &mut self,
        key: &[u8],
        value: &[u8],
        accumulator: Option<&dyn Accumulator>,
    ) -> Result<(), StorageError> {
        let hash = hash_bytes(key);
        let partition = self.partition_of(hash);
        self.partitions[partition].insert(hash, key, value, accumulator, &mut self.scratch)?;
        Ok(())
    }

    /// Finds the head record of a key.
    #[must_use]
    pub fn lookup(&self, key: &[u8]) -> Option<Slot> {
        let hash = hash_bytes(key);
        let partition = self.partition_of(hash);
        self.partitions[partition]
            .lookup(hash, key)
            .map(|addr| Slot { partition, addr })
    }

    /// Returns the head value for a key, copied out of the store.
    #[must_use]
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.lookup(key)
            .map(|slot| Bytes::copy_from_slice(self.partitions[slot.partition].value_at(slot.addr)))
    }

    /// Key bytes of the record behind `slot`.
    #[must_use]
    pub fn key(&self, slot: Slot) -> &[u8] {
        self.partitions[slot.partition].key_at(slot.addr)
    }

    /// Value bytes of the record behind `slot`.
    #[must_use]
    pub fn value(&self, slot: Slot) -> &[u8] {
        self.partitions[slot.partition].value_at(slot.addr)
    }

    /// Iterates every value recorded for a key, in insertion order.
    pub fn values_for<'a>(&'a self, key: &[u8]) -> impl Iterator<Item = &'a [u8]> + 'a {
        let mut cursor = self.lookup(key);
        std::iter::from_fn(move || {
            let slot = cursor?;
            let partition = &self.partitions[slot.partition];
            cursor = partition.next_of(slot.addr).map(|addr| Slot {
                partition: slot.partition,
                addr,
            });
            Some(partition.value_at(slot.addr))
        })
    }

    /// Iterates all records, partition by partition in insertion order,
    /// copying keys and values out of the store.
    pub fn scan(&self) -> impl Iterator<Item = (Bytes, Bytes)> + '_ {
        self.partitions.iter().flat_map(|p| {
            p.slots().iter().map(move |&addr| {
                (
                    Bytes::copy_from_slice(p.key_at(addr)),
                    Bytes::copy_from_slice(p.value_at(addr)),
                )
            })
        })
    }

    /// Total number of live records across all partitions.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.partitions.iter().map(Partition::record_count).sum()
    }

    /// Whether the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record_count() == 0
    }

    /// Total committed bytes across all partitions.
    #[must_use]
    pub fn byte_usage(&self) -> usize {
        self.partitions.iter().map(Partition::byte_usage).sum()
    }

    /// Number of partitions.
    #[must_use]
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub(crate) fn partition(&self, i: usize) -> &Partition {
        &self.partitions[i]
    }

    pub(crate) fn partition_mut(&mut self, i: usize) -> &mut Partition {
        &mut self.partitions[i]
    }

    pub(crate) fn codec(&self) -> Codec {
        self.codec
    }

    fn partition_of(&self, hash: u64) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        {
            (hash as usize) & (self.partitions.len() - 1)
        }
    }
}

impl std::fmt::Debug for BinaryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinaryStorage")
            .field("partitions", &self.partitions.len())
            .field("records", &self.record_count())
            .field("byte_usage", &self.byte_usage())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BlockPool;
    use crate::storage::IntSumAccumulator;
    use std::sync::Arc;

    fn test_context(blocks: usize) -> MemoryContext {
        MemoryContext::new(
            Arc::new(BlockPool::new(4096, blocks)),
            Arc::new(BlockPool::new(4096, blocks)),
        )
    }

    fn small_config() -> StorageConfig {
        StorageConfig {
            heap_block_bytes: 4096,
            native_block_bytes: 4096,
            partition_count: 4,
            ..StorageConfig::default()
        }
    }

    #[test]
    fn put_then_get_roundtrips() {
        let ctx = test_context(16);
        let mut store = BinaryStorage::new(&ctx, &small_config());

        store.put(b"alpha", b"1").unwrap();
        store.put(b"beta", b"2").unwrap();

        assert_eq!(store.get(b"alpha").unwrap().as_ref(), b"1");
        assert_eq!(store.get(b"beta").unwrap().as_ref(), b"2");
        assert!(store.get(b"gamma").is_none());
        assert_eq!(store.record_count(), 2);
        assert!(!store.is_empty());
        assert!(store.byte_usage() > 0);
    }

    #[test]
    fn duplicate_keys_chain_in_insertion_order() {
        let ctx = test_context(16);
        let mut store = BinaryStorage::new(&ctx, &small_config());

        for v in [b"x" as &[u8], b"y", b"z"] {
            store.put(b"key", v).unwrap();
        }

        let values: Vec<&[u8]> = store.values_for(b"key").collect();
        assert_eq!(values, vec![b"x" as &[u8], b"y", b"z"]);
        assert_eq!(store.record_count(), 3);
        // Lookup still resolves to the head record.
        let slot = store.lookup(b"key").unwrap();
        assert_eq!(store.value(slot), b"x");
    }

    #[test]
    fn accumulator_collapses_equal_keys() {
        let ctx = test_context(16);
        let mut store = BinaryStorage::new(&ctx, &small_config());
        let acc = IntSumAccumulator::new(false);

        for _ in 0..10 {
            store
                .put_with(b"counter", &acc.encode(1), Some(&acc))
                .unwrap();
        }

        assert_eq!(store.record_count(), 1);
        assert_eq!(acc.decode(&store.get(b"counter").unwrap()), 10);
    }

    #[test]
    fn growing_accumulator_repoints_the_slot() {
        struct ConcatAccumulator;
        impl Accumulator for ConcatAccumulator {
            fn combine(&self, existing: &[u8], incoming: &[u8], out: &mut Vec<u8>) {
                out.extend_from_slice(existing);
                out.extend_from_slice(incoming);
            }
        }

        let ctx = test_context(16);
        let mut store = BinaryStorage::new(&ctx, &small_config());
        for value in [b"a" as &[u8], b"b", b"c"] {
            store.put_with(b"key", value, Some(&ConcatAccumulator)).unwrap();
        }

        // The combined value no longer fits in place, so a fresh record is
        // appended and the key repointed; the store still sees one record.
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.get(b"key").unwrap().as_ref(), b"abc");
        let keys: Vec<Bytes> = store.scan().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["key"]);
    }

    #[test]
    fn many_keys_survive_index_growth() {
        let ctx = test_context(64);
        let mut store = BinaryStorage::new(&ctx, &small_config());

        for i in 0..1000u32 {
            store
                .put(format!("key-{i}").as_bytes(), &i.to_le_bytes())
                .unwrap();
        }
        for i in (0..1000u32).rev() {
            let value = store.get(format!("key-{i}").as_bytes()).unwrap();
            assert_eq!(value.as_ref(), &i.to_le_bytes());
        }
        assert_eq!(store.record_count(), 1000);
    }

    #[test]
    fn big_endian_layout_roundtrips() {
        let ctx = test_context(16);
        let config = StorageConfig {
            use_big_endian: true,
            ..small_config()
        };
        let mut store = BinaryStorage::new(&ctx, &config);
        store.put(b"key", b"value").unwrap();
        assert_eq!(store.get(b"key").unwrap().as_ref(), b"value");
    }

    #[test]
    fn exhausted_pool_surfaces_memory_error() {
        let ctx = MemoryContext::new(
            Arc::new(BlockPool::new(256, 1)),
            Arc::new(BlockPool::new(256, 0)),
        );
        let config = StorageConfig {
            partition_count: 1,
            ..StorageConfig::default()
        };
        let mut store = BinaryStorage::new(&ctx, &config);

        let mut failed = false;
        for i in 0..64u32 {
            if let Err(StorageError::MemoryExhausted(_)) =
                store.put(&i.to_le_bytes(), &[0u8; 16])
            {
                failed = true;
                break;
            }
        }
        assert!(failed, "pool of one block must run out");
    }

    #[test]
    fn scan_yields_insertion_order_within_partition() {
        let ctx = test_context(16);
        let config = StorageConfig {
            partition_count: 1,
            ..small_config()
        };
        let mut store = BinaryStorage::new(&ctx, &config);
        store.put(b"b", b"1").unwrap();
        store.put(b"a", b"2").unwrap();
        store.put(b"c", b"3").unwrap();

        let keys: Vec<Bytes> = store.scan().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn dropping_store_returns_all_blocks() {
        let ctx = test_context(16);
        {
            let mut store = BinaryStorage::new(&ctx, &small_config());
            for i in 0..100u32 {
                store.put(&i.to_le_bytes(), &[7u8; 32]).unwrap();
            }
            assert!(ctx.heap_pool().in_use() > 0);
        }
        assert_eq!(ctx.heap_pool().in_use(), 0);
        assert_eq!(ctx.native_pool().in_use(), 0);
    }
}
