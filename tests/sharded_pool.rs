use std::sync::Arc;

use bytes::Bytes;
use shardpool::{
    cmd::{Command, Reply},
    config::{Config, PoolConfig, ShardInfo},
    connection::{
        mock::{MockConnectionFactoryBuilder, MockConnectionStats, MockNodes},
        Connection,
    },
    error::Error,
    ShardedPool,
};

const ADDRS: [&str; 2] = ["127.0.0.1:6379", "127.0.0.1:6380"];
const CONFIG_PATH: &str = "conf/two_shards.json";

fn nodes_with_password(password: &str) -> MockNodes {
    let nodes = MockNodes::new();
    for addr in ADDRS {
        nodes.add_node_with_password(addr, password).unwrap();
    }
    nodes
}

fn two_shards(pool: PoolConfig) -> (ShardedPool, MockNodes, Arc<MockConnectionStats>) {
    let nodes = MockNodes::new();
    for addr in ADDRS {
        nodes.add_node(addr).unwrap();
    }
    let factory = MockConnectionFactoryBuilder::new(nodes.clone()).build();
    let stats = factory.stats();
    let config = Config::new(vec![
        ShardInfo::new("127.0.0.1", 6379),
        ShardInfo::new("127.0.0.1", 6380),
    ])
    .with_pool(pool);

    (
        ShardedPool::new(config, Arc::new(factory)).unwrap(),
        nodes,
        stats,
    )
}

/// A key owned by `shard`
fn key_on(pool: &ShardedPool, shard: usize) -> String {
    (0..)
        .map(|i| format!("key-{}", i))
        .find(|key| pool.ring().resolve(key.as_bytes()) == shard)
        .unwrap()
}

/// SET followed by GET on a pool built from a config file (password protected shards)
#[tokio::test]
async fn test_set_get_from_config_file() {
    let nodes = nodes_with_password("foobared");
    let factory = Arc::new(MockConnectionFactoryBuilder::new(nodes.clone()).build());
    let pool = ShardedPool::from_config_path(CONFIG_PATH, factory).unwrap();

    let mut handle = pool.acquire().unwrap();
    handle.set("foo", "bar").await.unwrap();
    assert_eq!(handle.get("foo").await.unwrap(), Some(Bytes::from("bar")));

    let owner = handle.shard_index_for(b"foo");
    assert_eq!(
        nodes.value(ADDRS[owner], b"foo").unwrap(),
        Some(Bytes::from("bar"))
    );
    assert_eq!(nodes.db_size(ADDRS[1 - owner]).unwrap(), 0);

    for connection in handle.all_shards().await.unwrap() {
        connection.ping().await.unwrap();
    }
    pool.release(handle).await;
}

#[tokio::test]
async fn test_wrong_password() {
    let nodes = nodes_with_password("something else");
    let factory = Arc::new(MockConnectionFactoryBuilder::new(nodes).build());
    let pool = ShardedPool::from_config_path(CONFIG_PATH, factory).unwrap();

    let mut handle = pool.acquire().unwrap();
    let err = handle.get("foo").await.err().unwrap();
    assert!(err.is_shard_unavailable());
}

/// Keys sharing a hash tag land on the same shard (hash tags are enabled in the config file)
#[tokio::test]
async fn test_hash_tags_keep_related_keys_together() {
    let nodes = nodes_with_password("foobared");
    let factory = Arc::new(MockConnectionFactoryBuilder::new(nodes.clone()).build());
    let pool = ShardedPool::from_config_path(CONFIG_PATH, factory).unwrap();

    let mut handle = pool.acquire().unwrap();
    let mut pipeline = handle.pipelined();
    for field in ["name", "email", "age", "city"] {
        pipeline.set(format!("user:{{42}}:{}", field), field).unwrap();
    }
    let results = pipeline.sync().await.unwrap();
    assert!(results.iter().all(|result| result.is_ok()));

    let owner = handle.shard_index_for(b"42");
    assert_eq!(nodes.db_size(ADDRS[owner]).unwrap(), 4);
    assert_eq!(nodes.db_size(ADDRS[1 - owner]).unwrap(), 0);
}

/// `incr x` and `incr y` on two different shards within one pipeline
#[tokio::test]
async fn test_pipeline_across_shards() {
    let (pool, _, _) = two_shards(PoolConfig::default());
    let mut handle = pool.acquire().unwrap();
    let x = key_on(&pool, 0);
    let y = key_on(&pool, 1);

    let mut pipeline = handle.pipelined();
    pipeline.incr(x).unwrap();
    pipeline.incr(y).unwrap();
    let results: Vec<i64> = pipeline
        .sync()
        .await
        .unwrap()
        .into_iter()
        .map(|result| result.unwrap().into_integer().unwrap())
        .collect();

    assert_eq!(results, vec![1, 1]);
}

/// With a single connection per shard and fail fast exhaustion, resetting a pipeline must not
/// leak connections or commands
#[tokio::test]
async fn test_reset_state_then_sync() {
    let (pool, _, _) = two_shards(PoolConfig {
        max_total: 1,
        max_idle: 1,
        block_when_exhausted: false,
        ..Default::default()
    });
    let mut handle = pool.acquire().unwrap();

    let mut pipeline = handle.pipelined();
    pipeline.set("foo", "bar").unwrap();
    pipeline.get("foo").unwrap();
    handle.reset_state();

    let mut pipeline = handle.pipelined();
    pipeline.set("foo", "baz").unwrap();
    pipeline.get("foo").unwrap();
    let results = pipeline.sync().await.unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(
        results[1].as_ref().unwrap(),
        &Reply::Bulk(Some(Bytes::from("baz")))
    );
}

#[tokio::test]
async fn test_pool_exhausted_across_sessions() {
    let (pool, _, _) = two_shards(PoolConfig {
        max_total: 1,
        max_idle: 1,
        block_when_exhausted: false,
        ..Default::default()
    });
    let key = key_on(&pool, 0);

    let mut first = pool.acquire().unwrap();
    first.set(key.clone(), "a").await.unwrap();

    let mut second = pool.acquire().unwrap();
    let err = second.get(key.clone()).await.err().unwrap();
    assert!(matches!(
        err,
        Error::PoolExhausted {
            shard: 0,
            waited_ms: None
        }
    ));

    // other shards are not affected
    second.set(key_on(&pool, 1), "b").await.unwrap();

    pool.release(first).await;
    assert_eq!(second.get(key).await.unwrap(), Some(Bytes::from("a")));
}

#[tokio::test]
async fn test_sessions_never_share_connections() {
    let (pool, _, _) = two_shards(PoolConfig::default());
    let key = key_on(&pool, 0);

    let mut first = pool.acquire().unwrap();
    let mut second = pool.acquire().unwrap();
    first.get(key.clone()).await.unwrap();
    second.get(key).await.unwrap();

    let first_id = first.all_shards().await.unwrap()[0].id();
    let second_id = second.all_shards().await.unwrap()[0].id();
    assert_ne!(first_id, second_id);
    assert_eq!(pool.stats()[0].active, 2);
}

#[tokio::test]
async fn test_connections_are_reused_across_sessions() {
    let (pool, _, stats) = two_shards(PoolConfig::default());
    let key = key_on(&pool, 0);

    for _ in 0..10 {
        let mut handle = pool.acquire().unwrap();
        handle.incr(key.clone()).await.unwrap();
        pool.release(handle).await;
    }

    assert_eq!(stats.created.n_calls(), 1);
    assert_eq!(pool.stats()[0].idle, 1);
}

/// 1000 keys are written, then one shard goes offline. Reads on the remaining shard succeed and
/// reads on the offline shard fail, in exactly the proportion each shard owns.
#[tokio::test]
async fn test_one_shard_offline() {
    let (pool, nodes, _) = two_shards(PoolConfig::default());
    let mut handle = pool.acquire().unwrap();

    let mut pipeline = handle.pipelined();
    for i in 0..1000 {
        pipeline.set(format!("key-{}", i), i.to_string()).unwrap();
    }
    assert!(pipeline
        .sync()
        .await
        .unwrap()
        .iter()
        .all(|result| result.is_ok()));

    let online = nodes.db_size(ADDRS[0]).unwrap();
    let offline = nodes.db_size(ADDRS[1]).unwrap();
    assert_eq!(online + offline, 1000);
    nodes.set_online(ADDRS[1], false).unwrap();

    let mut successes = 0;
    let mut failures = 0;
    for i in 0..1000 {
        match handle.get(format!("key-{}", i)).await {
            Ok(value) => {
                assert_eq!(value, Some(Bytes::from(i.to_string())));
                successes += 1;
            }
            Err(Error::ShardUnavailable { shard, .. }) => {
                assert_eq!(shard, 1);
                failures += 1;
            }
            Err(err) => panic!("Unexpected error {}", err),
        }
    }

    assert_eq!(successes, online);
    assert_eq!(failures, offline);
}

/// Once a node comes back, the session reconnects by itself on the next command
#[tokio::test]
async fn test_shard_recovers_after_outage() {
    let (pool, nodes, _) = two_shards(PoolConfig::default());
    let mut handle = pool.acquire().unwrap();
    let key = key_on(&pool, 1);
    handle.set(key.clone(), "value").await.unwrap();

    nodes.set_online(ADDRS[1], false).unwrap();
    assert!(handle.get(key.clone()).await.err().unwrap().is_shard_unavailable());
    assert!(handle.get(key.clone()).await.err().unwrap().is_shard_unavailable());

    nodes.set_online(ADDRS[1], true).unwrap();
    assert_eq!(
        handle.get(key).await.unwrap(),
        Some(Bytes::from("value"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sessions() {
    let (pool, _, stats) = two_shards(PoolConfig {
        max_total: 2,
        max_idle: 2,
        ..Default::default()
    });

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let pool = pool.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..25 {
                let mut handle = pool.acquire().unwrap();
                let mut pipeline = handle.pipelined();
                pipeline.incr("a").unwrap();
                pipeline.incr("b").unwrap();
                pipeline.incr("c").unwrap();
                for result in pipeline.sync().await.unwrap() {
                    result.unwrap();
                }
                pool.release(handle).await;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let mut handle = pool.acquire().unwrap();
    for key in ["a", "b", "c"] {
        assert_eq!(handle.get(key).await.unwrap(), Some(Bytes::from("200")));
    }
    assert!(stats.created.n_calls() <= 4);
}

#[tokio::test]
async fn test_keyless_commands_through_all_shards() {
    let (pool, nodes, _) = two_shards(PoolConfig::default());
    let mut handle = pool.acquire().unwrap();
    handle.set(key_on(&pool, 0), "a").await.unwrap();
    handle.set(key_on(&pool, 1), "b").await.unwrap();

    for connection in handle.all_shards().await.unwrap() {
        assert_eq!(
            connection.execute(&Command::FlushAll).await.unwrap(),
            Reply::Status("OK".to_string())
        );
    }

    assert_eq!(nodes.db_size(ADDRS[0]).unwrap(), 0);
    assert_eq!(nodes.db_size(ADDRS[1]).unwrap(), 0);
}

#[tokio::test]
async fn test_close() {
    let (pool, _, stats) = two_shards(PoolConfig::default());
    let mut handle = pool.acquire().unwrap();
    handle.set(key_on(&pool, 0), "a").await.unwrap();
    let mut released = pool.acquire().unwrap();
    released.set(key_on(&pool, 1), "b").await.unwrap();
    pool.release(released).await;

    pool.close().await;
    assert!(matches!(pool.acquire().err().unwrap(), Error::PoolClosed));
    assert!(matches!(
        handle.get("foo").await.err().unwrap(),
        Error::PoolClosed
    ));

    // the idle connection of shard 1 is destroyed right away, the borrowed one of
    // shard 0 once its session gives it back
    assert_eq!(stats.disconnect.n_calls(), 1);
    pool.release(handle).await;
    assert_eq!(stats.disconnect.n_calls(), 2);
}
