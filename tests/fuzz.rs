//! Fuzz Test - Compares the queue and pools against reference models.
//!
//! Uses naive but obviously correct models (a bounded `VecDeque`, a free
//! counter with a cap) and drives both sides with the same seeded random
//! operation stream.

use std::collections::{HashSet, VecDeque};

use flash_mev::{rlp, Block, ObjectPool, PoolConfig, PushError, RingQueue, SpinPolicy};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

const SEED: u64 = 0xF1A5_43E7;

/// Bounded FIFO with the same full/empty rules as `RingQueue`.
struct ReferenceQueue {
    items: VecDeque<u64>,
    capacity: usize,
}

impl ReferenceQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, item: u64) -> bool {
        if self.items.len() == self.capacity {
            return false;
        }
        self.items.push_back(item);
        true
    }

    fn pop(&mut self) -> Option<u64> {
        self.items.pop_front()
    }
}

/// Free-count bookkeeping for one pool.
struct ReferencePool {
    free: usize,
    max_blocks: usize,
    fallback_allocs: u64,
    overflow_frees: u64,
    foreign_frees: u64,
}

impl ReferencePool {
    fn get(&mut self) {
        if self.free == 0 {
            self.fallback_allocs += 1;
        } else {
            self.free -= 1;
        }
    }

    fn put(&mut self) {
        if self.free == self.max_blocks {
            self.overflow_frees += 1;
        } else {
            self.free += 1;
        }
    }
}

// ============================================================================
// Queue
// ============================================================================

#[test]
fn test_fuzz_queue_matches_reference() {
    const OPS: usize = 200_000;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);

    for capacity in [1usize, 4, 16, 100] {
        let queue = RingQueue::shared(capacity).unwrap();
        let mut consumer = queue.consumer().unwrap();
        let mut reference = ReferenceQueue::new(queue.capacity());
        let mut next = 0u64;

        for _ in 0..OPS {
            match rng.gen_range(0..10) {
                0..=4 => {
                    let accepted = reference.push(next);
                    match queue.push(next) {
                        Ok(()) => assert!(accepted),
                        Err(PushError::Full(item)) => {
                            assert!(!accepted);
                            assert_eq!(item, next);
                        }
                        Err(PushError::Contended(_)) => panic!("no contention in one thread"),
                    }
                    next += 1;
                }
                5..=8 => assert_eq!(consumer.pop(), reference.pop()),
                _ => {
                    let max = rng.gen_range(0..=8);
                    let batch = consumer.pop_batch::<8>(max);
                    let expected: Vec<u64> = (0..max).map_while(|_| reference.pop()).collect();
                    assert_eq!(batch.as_slice(), expected.as_slice());
                }
            }
            assert_eq!(queue.len(), reference.items.len());
        }
    }
}

// ============================================================================
// Pools
// ============================================================================

#[test]
fn test_fuzz_pool_matches_reference() {
    const OPS: usize = 50_000;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 1);

    let config = PoolConfig {
        max_blocks: 24,
        ..PoolConfig::new(64, 8)
    };
    let pool = ObjectPool::new(config, SpinPolicy::DEFAULT).unwrap();
    let mut reference = ReferencePool {
        free: 8,
        max_blocks: 24,
        fallback_allocs: 0,
        overflow_frees: 0,
        foreign_frees: 0,
    };
    let mut held: Vec<Block> = Vec::new();

    for _ in 0..OPS {
        match rng.gen_range(0..20) {
            0..=9 => {
                let block = pool.get();
                reference.get();
                assert_eq!(block.capacity(), 64);
                held.push(block);
            }
            10..=18 if !held.is_empty() => {
                let index = rng.gen_range(0..held.len());
                pool.put(held.swap_remove(index));
                reference.put();
            }
            _ => {
                pool.put(Block::try_alloc(128).unwrap());
                reference.foreign_frees += 1;
            }
        }

        let unique: HashSet<*const u8> = held.iter().map(|b| b.as_ptr()).collect();
        assert_eq!(unique.len(), held.len(), "block handed out twice");

        let stats = pool.stats();
        assert_eq!(stats.free, reference.free);
        assert_eq!(stats.fallback_allocs, reference.fallback_allocs);
        assert_eq!(stats.overflow_frees, reference.overflow_frees);
        assert_eq!(stats.foreign_frees, reference.foreign_frees);
    }
}

// ============================================================================
// RLP
// ============================================================================

#[test]
fn test_fuzz_rlp_string_round_trip() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 2);
    let mut out = vec![0u8; 4096];

    for _ in 0..5_000 {
        let len = match rng.gen_range(0..4) {
            0 => 0,
            1 => 1,
            2 => rng.gen_range(2..=55),
            _ => rng.gen_range(56..1024),
        };
        let mut input = vec![0u8; len];
        rng.fill(input.as_mut_slice());

        let written = rlp::encode_string(&input, &mut out).unwrap();
        assert!(written <= rlp::encoded_len(len));

        let decoded = rlp::decode_string(&out[..written]).unwrap();
        assert_eq!(decoded.data, input.as_slice());
        assert_eq!(decoded.consumed, written);
    }
}

#[test]
fn test_fuzz_rlp_decode_never_overreads() {
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 3);

    for _ in 0..20_000 {
        let len = rng.gen_range(0..64);
        let mut input = vec![0u8; len];
        rng.fill(input.as_mut_slice());

        if let Ok(decoded) = rlp::decode_string(&input) {
            assert!(decoded.consumed <= input.len());
            assert!(decoded.data.len() < decoded.consumed || decoded.consumed == 1);
        }
    }
}
