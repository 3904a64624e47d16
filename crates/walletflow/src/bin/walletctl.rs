use std::env;

use sqlx::PgPool;
use uuid::Uuid;
use walletflow::chain_events::ListenerStatusRepo;
use walletflow::config::Config;
use walletflow::db;
use walletflow::jobs::{JobState, JobsRepo, ListOptions};
use walletflow::system::SystemRepo;
use walletflow::telemetry;

const USAGE: &str = "walletctl <command>\n\
Commands:\n\
- status                     job count per state\n\
- jobs [limit] [offset]      newest jobs first\n\
- job <id>                   one job as JSON\n\
- schedulable                jobs the scheduler would pick up now\n\
- enqueue <type> [json]      insert a job in INIT\n\
- cursor                     chain event listener cursor\n\
- set-cursor <height>        move the listener cursor (takes the row lock)\n\
- maintenance [on|off]       show or set maintenance mode\n\
- migrate                    apply migrations\n\
\n\
Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    telemetry::init(false);

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1) else {
        eprint!("{USAGE}");
        std::process::exit(2);
    };

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .map_err(|_| anyhow::anyhow!("DATABASE_URL or TEST_DATABASE_URL must be set"))?;
    let pool = db::make_pool(&url).await?;

    match command.as_str() {
        "status" => status(&pool).await?,
        "jobs" => {
            let limit = parse_arg(&args, 2)?.unwrap_or(20);
            let offset = parse_arg(&args, 3)?.unwrap_or(0);
            jobs(&pool, ListOptions::new(limit, offset)).await?;
        }
        "job" => {
            let id: Uuid = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: walletctl job <id>"))?
                .parse()?;
            let job = JobsRepo::new(pool.clone()).get_job(id).await?;
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        "schedulable" => schedulable(&pool).await?,
        "enqueue" => {
            let job_type = args
                .get(2)
                .ok_or_else(|| anyhow::anyhow!("usage: walletctl enqueue <type> [json]"))?;
            let payload = match args.get(3) {
                Some(raw) => serde_json::from_str(raw)?,
                None => serde_json::json!({}),
            };
            let job = JobsRepo::new(pool.clone()).enqueue(job_type, payload).await?;
            println!("+ enqueued job {} id={}", job.job_type, job.id);
        }
        "cursor" => match ListenerStatusRepo::new(pool.clone()).current().await? {
            Some(status) => println!(
                "latest_height={} updated_at={}",
                status.latest_height,
                status.updated_at.to_rfc3339()
            ),
            None => println!("listener not initialised"),
        },
        "set-cursor" => {
            let height: u64 = parse_arg(&args, 2)?
                .ok_or_else(|| anyhow::anyhow!("usage: walletctl set-cursor <height>"))?;
            let mut locked = ListenerStatusRepo::new(pool.clone()).lock().await?;
            let previous = locked.latest_height();
            locked.set_latest_height(height);
            let status = locked.commit().await?;
            println!("cursor {previous} -> {}", status.latest_height);
        }
        "maintenance" => {
            let system = SystemRepo::new(pool.clone());
            match args.get(2).map(String::as_str) {
                Some("on") => system.set_maintenance_mode(true).await?,
                Some("off") => system.set_maintenance_mode(false).await?,
                Some(other) => anyhow::bail!("expected on|off, got {other:?}"),
                None => {}
            }
            println!("maintenance_mode={}", system.maintenance_mode().await?);
        }
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations OK");
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprint!("{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn parse_arg<T>(args: &[String], index: usize) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    args.get(index)
        .map(|raw| {
            raw.parse()
                .map_err(|e| anyhow::anyhow!("argument {raw:?} is invalid: {e}"))
        })
        .transpose()
}

async fn status(pool: &PgPool) -> anyhow::Result<()> {
    let counts = JobsRepo::new(pool.clone()).status().await?;
    let total: i64 = counts.iter().map(|c| c.count).sum();

    for state in JobState::ALL {
        let count = counts
            .iter()
            .find(|c| c.state == state)
            .map(|c| c.count)
            .unwrap_or(0);
        println!("{:<22}{count}", state.as_str());
    }
    println!("{:<22}{total}", "TOTAL");
    Ok(())
}

async fn jobs(pool: &PgPool, opts: ListOptions) -> anyhow::Result<()> {
    for job in JobsRepo::new(pool.clone()).list_jobs(opts).await? {
        print_row(&job);
    }
    Ok(())
}

async fn schedulable(pool: &PgPool) -> anyhow::Result<()> {
    // Grace periods from the environment when a full config is available.
    let cfg = Config::from_env()
        .map(|c| c.worker_config())
        .unwrap_or_default();
    let jobs = JobsRepo::new(pool.clone())
        .schedulable_jobs(
            cfg.accepted_grace_period,
            cfg.reschedulable_grace_period,
            ListOptions::default(),
        )
        .await?;

    println!("{} schedulable", jobs.len());
    for job in &jobs {
        print_row(job);
    }
    Ok(())
}

fn print_row(job: &walletflow::jobs::Job) {
    println!(
        "{} | {:<20} | {:<20} | exec_count={} | updated_at={} | error={}",
        job.id,
        job.job_type,
        job.state.as_str(),
        job.exec_count,
        job.updated_at.to_rfc3339(),
        job.error.as_deref().unwrap_or("-")
    );
}
