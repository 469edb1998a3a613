//! Consistent-hashing ring used to decide which shard owns a key.
//!
//! The hash space is `[0, 2^64)` viewed as a circle. Every shard is placed on the circle
//! `weight * replication_factor` times (virtual nodes) and a key is owned by the first
//! virtual node whose hash is higher or equal to the hash of the key, wrapping around to the
//! first point when no such node exists.
//!
//! Example with a hash space that goes from 0 to 10 and one virtual node per shard:
//! Shards:     ['A', 'B', 'C']
//! Points:     [ 2 ,  5 ,  8 ]
//!
//! key 'foo', hash('foo') = 4 -> owned by shard B (point 5)
//! key 'bar', hash('bar') = 7 -> owned by shard C (point 8)
//! key 'zoo', hash('zoo') = 9 -> owned by shard A (point 2), going around the circle
//!
//! **The important property here is that appending or removing a shard only moves the keys that
//! fall in the ranges owned by that shard's points. Every other key keeps its owner.**
//!
//! A [`Ring`] is immutable once built. Reconfiguring means building a new one.
use std::io::Cursor;

use murmur3::murmur3_x64_128;
use tracing::{event, Level};

use crate::{
    config::{RingConfig, ShardInfo},
    error::{Error, Result},
};

type HashFunctionReturnType = u64;

/// A point on the ring: the hash of a virtual node label and the index of the shard that owns it
type Point = (HashFunctionReturnType, usize);

/// Upper bound on the number of virtual nodes of a ring, across all shards
pub const MAX_VIRTUAL_NODES: usize = 1 << 24;

#[derive(Clone, Debug)]
pub struct Ring {
    shards: Vec<ShardInfo>,
    points: Vec<Point>,
    hash_tags: bool,
    hash_fn: fn(&[u8]) -> HashFunctionReturnType,
}

impl Ring {
    pub fn new(shards: Vec<ShardInfo>, config: &RingConfig) -> Result<Self> {
        Self::new_with_hash_fn(shards, config, murmur3_hash)
    }

    pub fn new_with_hash_fn(
        shards: Vec<ShardInfo>,
        config: &RingConfig,
        hash_fn: fn(&[u8]) -> HashFunctionReturnType,
    ) -> Result<Self> {
        let total_points = validate_shards(&shards, config)?;
        let mut points = Vec::with_capacity(total_points);

        for (index, shard) in shards.iter().enumerate() {
            let n_virtual_nodes = shard.weight * config.replication_factor;
            for virtual_node in 0..n_virtual_nodes {
                let label = virtual_node_label(index, shard, virtual_node);
                points.push((hash_fn(label.as_bytes()), index));
            }
        }

        // sorting by (hash, index) and deduping by hash means a collision is won by the lowest shard index
        points.sort_unstable();
        points.dedup_by_key(|point| point.0);
        if points.len() != total_points {
            event!(
                Level::WARN,
                "{} virtual node collisions while building the ring",
                total_points - points.len()
            );
        }

        Ok(Self {
            shards,
            points,
            hash_tags: config.hash_tags,
            hash_fn,
        })
    }

    /// Index of the shard that owns `key`
    pub fn resolve(&self, key: &[u8]) -> usize {
        let key_hash = (self.hash_fn)(self.routing_key(key));
        let index = self.points.partition_point(|(hash, _)| *hash < key_hash);
        self.points[index % self.points.len()].1
    }

    /// The [`ShardInfo`] that owns `key`
    pub fn shard_for(&self, key: &[u8]) -> &ShardInfo {
        &self.shards[self.resolve(key)]
    }

    pub fn shards(&self) -> &[ShardInfo] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    /// Number of points each shard ended up with, indexed by shard
    pub fn points_per_shard(&self) -> Vec<usize> {
        let mut counts = vec![0; self.shards.len()];
        for (_, index) in self.points.iter() {
            counts[*index] += 1;
        }
        counts
    }

    /// The part of the key that gets hashed. With hash tags enabled, `user:{42}:name` routes by `42`.
    fn routing_key<'a>(&self, key: &'a [u8]) -> &'a [u8] {
        if !self.hash_tags {
            return key;
        }

        extract_hash_tag(key).unwrap_or(key)
    }
}

/// Checks the shard list and returns the total number of virtual nodes it produces
fn validate_shards(shards: &[ShardInfo], config: &RingConfig) -> Result<usize> {
    if shards.is_empty() {
        return Err(Error::Configuration {
            reason: "Can't build a ring without shards".to_string(),
        });
    }

    if config.replication_factor == 0 {
        return Err(Error::Configuration {
            reason: "replication_factor must be greater than 0".to_string(),
        });
    }

    let mut names = std::collections::HashSet::new();
    let mut total_points: usize = 0;
    for (index, shard) in shards.iter().enumerate() {
        if shard.weight == 0 {
            return Err(Error::Configuration {
                reason: format!("shard {} ({}) has weight 0", index, shard.addr()),
            });
        }

        total_points = shard
            .weight
            .checked_mul(config.replication_factor)
            .and_then(|n_virtual_nodes| total_points.checked_add(n_virtual_nodes as usize))
            .filter(|total| *total <= MAX_VIRTUAL_NODES)
            .ok_or_else(|| Error::Configuration {
                reason: format!(
                    "shard {} ({}) with weight {} and replication_factor {} exceeds {} virtual nodes",
                    index,
                    shard.addr(),
                    shard.weight,
                    config.replication_factor,
                    MAX_VIRTUAL_NODES
                ),
            })?;

        if let Some(name) = &shard.name {
            if !names.insert(name.as_str()) {
                return Err(Error::Configuration {
                    reason: format!("shard name {} is used more than once", name),
                });
            }
        }
    }

    Ok(total_points)
}

fn virtual_node_label(index: usize, shard: &ShardInfo, virtual_node: u32) -> String {
    match &shard.name {
        Some(name) => format!("{}*{}", name, virtual_node),
        None => format!("SHARD-{}-NODE-{}", index, virtual_node),
    }
}

fn extract_hash_tag(key: &[u8]) -> Option<&[u8]> {
    let start = key.iter().position(|b| *b == b'{')? + 1;
    let len = key[start..].iter().position(|b| *b == b'}')?;
    if len == 0 {
        return None;
    }

    Some(&key[start..start + len])
}

/// 64 bit murmur3: the lower half of murmur3_x64_128
pub fn murmur3_hash(key: &[u8]) -> HashFunctionReturnType {
    murmur3_x64_128(&mut Cursor::new(key), 0)
        .expect("reading from an in-memory cursor can't fail") as HashFunctionReturnType
}

#[cfg(test)]
mod tests {
    use super::{extract_hash_tag, Ring};
    use crate::{
        config::{RingConfig, ShardInfo},
        error::Error,
    };
    use quickcheck::Arbitrary;
    use rand::{distributions::Alphanumeric, Rng};
    use std::{collections::HashMap, ops::Range};

    fn generate_random_ascii_string(range_size: Range<usize>) -> String {
        let string_size = rand::thread_rng().gen_range(range_size);
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(string_size)
            .map(char::from)
            .collect()
    }

    fn generate_random_shards(range: Range<usize>) -> Vec<ShardInfo> {
        let n_shards = rand::thread_rng().gen_range(range);
        (0..n_shards)
            .map(|i| {
                ShardInfo::new(generate_random_ascii_string(5..15), 6379 + i as u16)
                    .with_weight(rand::thread_rng().gen_range(1..4))
            })
            .collect()
    }

    fn generate_keys(n_keys: usize) -> Vec<String> {
        (0..n_keys).map(|i| format!("a-test-{}", i)).collect()
    }

    fn small_ring_config() -> RingConfig {
        RingConfig {
            replication_factor: 40,
            hash_tags: false,
        }
    }

    #[derive(Debug, Clone)]
    struct ResolveTestInput {
        shards: Vec<ShardInfo>,
        keys: Vec<String>,
    }

    impl Arbitrary for ResolveTestInput {
        fn arbitrary(_: &mut quickcheck::Gen) -> Self {
            let n_keys = rand::thread_rng().gen_range(50..100);
            Self {
                shards: generate_random_shards(1..10),
                keys: (0..n_keys)
                    .map(|_| generate_random_ascii_string(1..20))
                    .collect(),
            }
        }
    }

    /// This test asserts on the following invariants
    /// 1. resolving never panics and always returns a valid shard index
    /// 2. resolving the same key twice (even on an identically built ring) yields the same shard
    #[quickcheck]
    fn test_resolve_is_deterministic(test_input: ResolveTestInput) {
        let ring = Ring::new(test_input.shards.clone(), &small_ring_config()).unwrap();
        let rebuilt = Ring::new(test_input.shards.clone(), &small_ring_config()).unwrap();

        for key in test_input.keys.iter() {
            let index = ring.resolve(key.as_bytes());
            assert!(index < test_input.shards.len());
            assert_eq!(index, ring.resolve(key.as_bytes()));
            assert_eq!(index, rebuilt.resolve(key.as_bytes()));
        }
    }

    /// Appending a shard to the tail can only move keys TO the new shard, and only about 1/N of them.
    #[test]
    fn test_append_shard_moves_keys_only_to_new_shard() {
        let shards: Vec<ShardInfo> = (0..4)
            .map(|i| ShardInfo::new("127.0.0.1", 6379 + i))
            .collect();
        let mut extended = shards.clone();
        extended.push(ShardInfo::new("127.0.0.1", 6383));

        let before = Ring::new(shards, &RingConfig::default()).unwrap();
        let after = Ring::new(extended, &RingConfig::default()).unwrap();

        let keys = generate_keys(10000);
        let mut moved = 0;
        for key in keys.iter() {
            let old_owner = before.resolve(key.as_bytes());
            let new_owner = after.resolve(key.as_bytes());
            if old_owner != new_owner {
                assert_eq!(new_owner, 4);
                moved += 1;
            }
        }

        // ideal is 1/5 of the keyspace
        let moved_fraction = moved as f64 / keys.len() as f64;
        assert!(
            moved_fraction > 0.1 && moved_fraction < 0.3,
            "moved fraction {}",
            moved_fraction
        );
    }

    #[test]
    fn test_weights_are_respected() {
        let shards = vec![
            ShardInfo::new("127.0.0.1", 6379).with_weight(3),
            ShardInfo::new("127.0.0.1", 6380),
        ];
        let ring = Ring::new(shards, &RingConfig::default()).unwrap();
        assert_eq!(ring.points_per_shard(), vec![480, 160]);

        let mut counts = [0usize; 2];
        for key in generate_keys(10000) {
            counts[ring.resolve(key.as_bytes())] += 1;
        }

        let ratio = counts[0] as f64 / counts[1] as f64;
        assert!(ratio > 2.0 && ratio < 4.5, "ratio {}", ratio);
    }

    #[test]
    fn test_named_shards_ignore_position() {
        let a = ShardInfo::new("127.0.0.1", 6379).with_name("a");
        let b = ShardInfo::new("127.0.0.1", 6380).with_name("b");
        let ring = Ring::new(vec![a.clone(), b.clone()], &RingConfig::default()).unwrap();
        let reversed = Ring::new(vec![b, a], &RingConfig::default()).unwrap();

        for key in generate_keys(1000) {
            assert_eq!(
                ring.shard_for(key.as_bytes()),
                reversed.shard_for(key.as_bytes())
            );
        }
    }

    fn test_hash_fn(key: &[u8]) -> u64 {
        // this table precisely maps known virtual nodes and keys to known hashes.
        // we will build test cases to cover all cases based on these known keys.
        let table: HashMap<&[u8], u64> = vec![
            (&b"A*0"[..], 10u64),
            (&b"B*0"[..], 20u64),
            (&b"C*0"[..], 30u64),
            (&b"D*0"[..], 40u64),
            (&b"key 1"[..], 1u64),
            (&b"key 2"[..], 10u64),
            (&b"key 3"[..], 11u64),
            (&b"key 4"[..], 20u64),
            (&b"key 5"[..], 25u64),
            (&b"key 6"[..], 31u64),
            (&b"key 7"[..], 40u64),
            (&b"key 8"[..], 41u64),
        ]
        .into_iter()
        .collect();

        table[key]
    }

    fn test_shards() -> Vec<ShardInfo> {
        ["A", "B", "C", "D"]
            .iter()
            .enumerate()
            .map(|(i, name)| ShardInfo::new("127.0.0.1", 7000 + i as u16).with_name(*name))
            .collect()
    }

    fn single_point_config() -> RingConfig {
        RingConfig {
            replication_factor: 1,
            hash_tags: false,
        }
    }

    struct TableTest {
        key: &'static str,
        owner: usize,
    }

    #[test]
    fn test_resolve_table() {
        let test_cases = vec![
            TableTest {
                key: "key 1",
                owner: 0,
            },
            TableTest {
                key: "key 2",
                owner: 0,
            },
            TableTest {
                key: "key 3",
                owner: 1,
            },
            TableTest {
                key: "key 4",
                owner: 1,
            },
            TableTest {
                key: "key 5",
                owner: 2,
            },
            TableTest {
                key: "key 6",
                owner: 3,
            },
            TableTest {
                key: "key 7",
                owner: 3,
            },
            TableTest {
                key: "key 8", // this is where we go around the circular buffer back to shard A
                owner: 0,
            },
        ];

        let ring =
            Ring::new_with_hash_fn(test_shards(), &single_point_config(), test_hash_fn).unwrap();

        for test_case in test_cases {
            assert_eq!(
                test_case.owner,
                ring.resolve(test_case.key.as_bytes()),
                "{}",
                test_case.key
            );
        }
    }

    #[test]
    fn test_single_shard() {
        let shards = test_shards()[..1].to_vec();
        let ring = Ring::new_with_hash_fn(shards, &single_point_config(), test_hash_fn).unwrap();

        for i in 1..=8 {
            assert_eq!(ring.resolve(format!("key {}", i).as_bytes()), 0);
        }
    }

    #[test]
    fn test_append_shard_table() {
        let shards = test_shards();
        let before =
            Ring::new_with_hash_fn(shards[..2].to_vec(), &single_point_config(), test_hash_fn)
                .unwrap();
        let after =
            Ring::new_with_hash_fn(shards[..3].to_vec(), &single_point_config(), test_hash_fn)
                .unwrap();

        // with A(10) and B(20) everything above 20 wraps to A
        assert_eq!(before.resolve(b"key 5"), 0);
        assert_eq!(before.resolve(b"key 6"), 0);
        // C(30) takes over (20, 30] only
        assert_eq!(after.resolve(b"key 5"), 2);
        assert_eq!(after.resolve(b"key 6"), 0);
        for key in ["key 1", "key 2", "key 3", "key 4"] {
            assert_eq!(before.resolve(key.as_bytes()), after.resolve(key.as_bytes()));
        }
    }

    #[test]
    fn test_hash_tags() {
        let shards: Vec<ShardInfo> = (0..8)
            .map(|i| ShardInfo::new("127.0.0.1", 6379 + i))
            .collect();
        let ring = Ring::new(
            shards,
            &RingConfig {
                hash_tags: true,
                ..Default::default()
            },
        )
        .unwrap();

        let owner = ring.resolve(b"42");
        for key in generate_keys(100) {
            let tagged = format!("{}:{{42}}", key);
            assert_eq!(ring.resolve(tagged.as_bytes()), owner);
        }

        assert_eq!(extract_hash_tag(b"user:{42}:name"), Some(&b"42"[..]));
        assert_eq!(extract_hash_tag(b"user:{}:name"), None);
        assert_eq!(extract_hash_tag(b"user:{42"), None);
        assert_eq!(extract_hash_tag(b"no tag"), None);
    }

    #[test]
    fn test_invalid_configurations() {
        let err = Ring::new(vec![], &RingConfig::default()).err().unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = Ring::new(
            vec![ShardInfo::new("127.0.0.1", 6379).with_weight(0)],
            &RingConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = Ring::new(
            vec![
                ShardInfo::new("127.0.0.1", 6379).with_name("a"),
                ShardInfo::new("127.0.0.1", 6380).with_name("a"),
            ],
            &RingConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        let err = Ring::new(
            vec![ShardInfo::new("127.0.0.1", 6379)],
            &RingConfig {
                replication_factor: 0,
                hash_tags: false,
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        // weight * replication_factor doesn't fit in a u32
        let err = Ring::new(
            vec![ShardInfo::new("127.0.0.1", 6379).with_weight(u32::MAX / 100)],
            &RingConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));

        // every shard fits on its own, the sum doesn't
        let err = Ring::new(
            vec![
                ShardInfo::new("127.0.0.1", 6379).with_weight(60_000),
                ShardInfo::new("127.0.0.1", 6380).with_weight(60_000),
            ],
            &RingConfig::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}
