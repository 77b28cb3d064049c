//! Operator tool: enqueue notifications and inspect queues.
//!
//! Usage:
//!   bellwork remind --user-id u1 --message "Buy milk" --delay-ms 2000
//!   bellwork schedule --channel-id grade-5 --message "Assembly at 9" --cron "0 9 * * 1-5" --timezone Asia/Kolkata
//!   bellwork show 42 --logs
//!   bellwork remove 42
//!   bellwork counts

use anyhow::{Context, Result, bail};
use bellwork::{
    BellworkConfig, BrokerQueueService, JobOptions, NewJob, QueueService, RedisBroker,
    logging::init_logging,
    tasks::{ReminderJob, ScheduledMessageJob},
};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use std::{sync::Arc, time::Duration};

#[derive(Parser)]
#[command(name = "bellwork")]
#[command(about = "Enqueue and inspect bellwork notification jobs")]
#[command(version, propagate_version = true)]
struct Cli {
    /// Broker URL; defaults to BELLWORK_REDIS_URL / REDIS_URL
    #[arg(long, global = true, value_name = "URL")]
    redis_url: Option<String>,

    /// Deployment environment; defaults to BELLWORK_ENV / APP_ENV
    #[arg(long, global = true)]
    environment: Option<String>,

    /// Logical queue name
    #[arg(long, short, global = true, default_value = "default")]
    queue: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Enqueue a reminder for a user")]
    Remind {
        #[arg(long)]
        user_id: String,

        #[command(flatten)]
        delivery: Delivery,
    },

    #[command(about = "Enqueue a message for a channel")]
    Schedule {
        #[arg(long)]
        channel_id: String,

        #[command(flatten)]
        delivery: Delivery,
    },

    #[command(about = "Remove a job that has not started")]
    Remove { job_id: String },

    #[command(about = "Show a job")]
    Show {
        job_id: String,

        /// Print the job's log lines too
        #[arg(long)]
        logs: bool,
    },

    #[command(about = "Show job counts per state")]
    Counts,
}

#[derive(Args)]
struct Delivery {
    #[arg(long)]
    message: String,

    /// When to deliver (RFC 3339); sets the delay if --delay-ms is absent
    #[arg(long, value_name = "TIME")]
    at: Option<DateTime<Utc>>,

    #[arg(long, value_name = "MILLIS")]
    delay_ms: Option<u64>,

    /// Repeat on a cron schedule instead of running once
    #[arg(long)]
    cron: Option<String>,

    /// IANA timezone for --cron
    #[arg(long, requires = "cron")]
    timezone: Option<String>,

    #[arg(long)]
    email: Option<String>,

    #[arg(long)]
    phone: Option<String>,
}

impl Delivery {
    /// Delivery time plus the options that get the job there.
    fn plan(&self, now: DateTime<Utc>) -> (DateTime<Utc>, JobOptions) {
        let delay = match (self.delay_ms, self.at) {
            (Some(ms), _) => Some(Duration::from_millis(ms)),
            (None, Some(at)) => (at - now).to_std().ok(),
            (None, None) => None,
        };
        let when = self
            .at
            .unwrap_or_else(|| now + chrono::Duration::milliseconds(self.delay_ms.unwrap_or(0) as i64));

        let options = JobOptions {
            delay,
            cron: self.cron.clone(),
            timezone: self.timezone.clone(),
        };
        (when, options)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BellworkConfig::load().context("failed to load configuration")?;
    if let Some(url) = cli.redis_url.clone() {
        config.broker.url = Some(url);
    }
    if let Some(environment) = cli.environment.clone() {
        config.environment = environment;
    }
    config.logging.level = "warn".to_string();
    init_logging(&config.logging);

    let connection = config.connection();
    if connection.is_placeholder() {
        bail!("no usable broker URL; set BELLWORK_REDIS_URL or pass --redis-url");
    }

    let broker = RedisBroker::new(&connection).context("failed to create broker client")?;
    let service = BrokerQueueService::from_config(Arc::new(broker), &config);
    let result = run(&service, &cli).await;
    service.close().await?;
    result
}

async fn run(service: &BrokerQueueService, cli: &Cli) -> Result<()> {
    let queue = cli.queue.as_str();
    let now = Utc::now();

    match &cli.command {
        Command::Remind { user_id, delivery } => {
            let (when, options) = delivery.plan(now);
            let mut job = ReminderJob::new(user_id, &delivery.message, when);
            job.email = delivery.email.clone();
            job.phone_number = delivery.phone.clone();

            let id = service
                .add_job(queue, NewJob::new(job).with_options(options))
                .await
                .context("failed to enqueue reminder")?;
            println!("{}", id);
        }
        Command::Schedule {
            channel_id,
            delivery,
        } => {
            let (when, options) = delivery.plan(now);
            let mut job = ScheduledMessageJob::new(channel_id, &delivery.message, when);
            job.email = delivery.email.clone();
            job.phone_number = delivery.phone.clone();

            let id = service
                .add_job(queue, NewJob::new(job).with_options(options))
                .await
                .context("failed to enqueue scheduled message")?;
            println!("{}", id);
        }
        Command::Remove { job_id } => {
            service.remove_job(queue, job_id).await?;
            println!("removed {}", job_id);
        }
        Command::Show { job_id, logs } => {
            let Some(job) = service.get_job(queue, job_id).await? else {
                bail!("job {} not found in {}", job_id, service.qualified_name(queue));
            };
            println!("{}", serde_json::to_string_pretty(&job)?);

            if *logs {
                for line in service.job_logs(queue, job_id).await? {
                    println!("{}", line);
                }
            }
        }
        Command::Counts => {
            let counts = service.job_counts(queue).await?;
            println!("queue:     {}", service.qualified_name(queue));
            println!("waiting:   {}", counts.waiting);
            println!("delayed:   {}", counts.delayed);
            println!("active:    {}", counts.active);
            println!("completed: {}", counts.completed);
            println!("failed:    {}", counts.failed);
        }
    }

    Ok(())
}
