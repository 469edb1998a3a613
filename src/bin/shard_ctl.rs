use std::path::PathBuf;

use clap::{Parser, Subcommand};
use rand::{distributions::Alphanumeric, Rng};
use shardpool::{config::Config, ring::Ring, telemetry::initialize_subscriber};

#[derive(Debug, Parser)]
#[command(name = "shardpool-ctl")]
#[command(about = "Inspects how a shardpool configuration distributes keys", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prints the shard that owns each key
    #[command()]
    Route {
        #[arg(long)]
        config_path: PathBuf,
        keys: Vec<String>,
    },
    /// Prints how many generated keys each shard owns
    #[command()]
    Distribution {
        #[arg(long)]
        config_path: PathBuf,
        #[arg(short, long, default_value = "10000")]
        keys: usize,
        #[arg(short, long, default_value = "key:")]
        prefix: String,
        /// Random alphanumeric keys instead of `{prefix}{n}`
        #[arg(short, long, default_value = "false")]
        random: bool,
    },
    /// Validates a configuration file and prints the virtual nodes of every shard
    #[command()]
    Check {
        #[arg(long)]
        config_path: PathBuf,
    },
}

fn load(config_path: PathBuf) -> anyhow::Result<(Config, Ring)> {
    let config = Config::from_path(config_path)?;
    config.validate()?;
    let ring = Ring::new(config.shards.clone(), &config.ring)?;
    Ok((config, ring))
}

fn main() -> anyhow::Result<()> {
    let args = Cli::parse();
    initialize_subscriber(args.json_logs);

    match args.command {
        Commands::Route { config_path, keys } => {
            let (_, ring) = load(config_path)?;
            for key in keys {
                let shard = ring.resolve(key.as_bytes());
                println!("{} -> {} ({})", key, shard, ring.shards()[shard].addr());
            }
        }
        Commands::Distribution {
            config_path,
            keys,
            prefix,
            random,
        } => {
            let (_, ring) = load(config_path)?;
            let mut counts = vec![0usize; ring.len()];
            let mut rng = rand::thread_rng();
            for n in 0..keys {
                let key = if random {
                    (&mut rng)
                        .sample_iter(&Alphanumeric)
                        .take(16)
                        .map(char::from)
                        .collect::<String>()
                } else {
                    format!("{}{}", prefix, n)
                };
                counts[ring.resolve(key.as_bytes())] += 1;
            }

            for (shard, count) in counts.iter().enumerate() {
                println!(
                    "{} ({}, weight {}): {} keys ({:.2}%)",
                    shard,
                    ring.shards()[shard].addr(),
                    ring.shards()[shard].weight,
                    count,
                    100.0 * *count as f64 / keys.max(1) as f64
                );
            }
        }
        Commands::Check { config_path } => {
            let (config, ring) = load(config_path)?;
            println!(
                "{} shards, replication factor {}, hash tags {}",
                ring.len(),
                config.ring.replication_factor,
                if config.ring.hash_tags { "on" } else { "off" }
            );
            for (shard, points) in ring.points_per_shard().into_iter().enumerate() {
                let info = &ring.shards()[shard];
                println!(
                    "{} {} ({}): {} virtual nodes",
                    shard,
                    info.name.as_deref().unwrap_or("-"),
                    info.addr(),
                    points
                );
            }
            println!("{}", serde_json::to_string_pretty(&config.pool)?);
        }
    }

    Ok(())
}
