use std::env;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use transactional_outbox::{BackoffPolicy, OutboxStore, SqlxOutboxStore};
use uuid::Uuid;

fn usage() -> ! {
    eprintln!("Usage:");
    eprintln!("  outbox-cli stats <DATABASE_URL>");
    eprintln!("  outbox-cli requeue-dead <uuid> <DATABASE_URL>");
    eprintln!("  outbox-cli requeue-dead-since <rfc3339_ts> <DATABASE_URL>");
    std::process::exit(1);
}

async fn connect(db_url: &str) -> Result<SqlxOutboxStore, sqlx::Error> {
    let pool = PgPool::connect(db_url).await?;
    Ok(SqlxOutboxStore::new(pool, BackoffPolicy::default()))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        usage();
    }

    let cmd = args[1].as_str();

    match cmd {
        "stats" if args.len() == 3 => {
            let store = connect(&args[2]).await?;
            let stats = store.pending_stats(Utc::now()).await?;
            println!("pending: {}", stats.pending);
            println!("oldest_pending_age_seconds: {}", stats.oldest_pending_age_seconds);

            let mut counts: Vec<_> = store.count_by_status().await?.into_iter().collect();
            counts.sort_by_key(|(status, _)| status.as_str());
            for (status, count) in counts {
                println!("{}: {}", status, count);
            }
        }
        "requeue-dead" if args.len() == 4 => {
            let id = Uuid::parse_str(&args[2])?;
            let store = connect(&args[3]).await?;
            if store.requeue_dead(id, Utc::now()).await? {
                println!("Requeued dead event {}", id);
            } else {
                eprintln!("Event {} not found or not DEAD", id);
                std::process::exit(2);
            }
        }
        "requeue-dead-since" if args.len() == 4 => {
            let ts: DateTime<Utc> = DateTime::parse_from_rfc3339(&args[2])?.with_timezone(&Utc);
            let store = connect(&args[3]).await?;
            let count = store.requeue_dead_since(ts, Utc::now()).await?;
            println!("Requeued {} dead events since {}", count, ts);
        }
        _ => {
            eprintln!("Invalid arguments");
            usage();
        }
    }

    Ok(())
}
