use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{CommandFactory, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use taskpoints_core::config::{
    config_path, resolve_config_with_source, starter_config, write_config, TaskpointsConfig,
};
use taskpoints_core::digest::{run_digest, DigestOptions};
use taskpoints_core::lifecycle::Engine;
use taskpoints_core::model::NewUser;
use taskpoints_core::notify::notifier_for;
use taskpoints_core::store::SqliteStore;
use taskpoints_render::{daily_points_csv, leaderboard_table, DailyPointsLine, LeaderboardLine};

mod version;

#[derive(Parser)]
#[command(name = "taskpoints", version = version::FULL, about = "Taskpoints admin CLI")]
struct Cli {
    /// Config file; defaults to ./taskpoints.toml, then $TASKPOINTS_HOME/config.toml.
    #[arg(long, global = true, env = "TASKPOINTS_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database path; overrides the config.
    #[arg(long, global = true, env = "TASKPOINTS_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information
    Version,
    /// Write a starter taskpoints.toml
    Init {
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        #[arg(long)]
        force: bool,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommand,
    },
    /// Manage the goal catalog
    Goal {
        #[command(subcommand)]
        command: GoalCommand,
    },
    /// Manage tasks
    Task {
        #[command(subcommand)]
        command: TaskCommand,
    },
    /// Users by points
    Leaderboard {
        #[arg(long)]
        json: bool,
    },
    /// Settled points per day for one user
    Stats {
        #[arg(long)]
        username: String,
        /// Only the last N days.
        #[arg(long)]
        days: Option<u32>,
        #[arg(long, conflicts_with = "json")]
        csv: bool,
        #[arg(long)]
        json: bool,
    },
    /// Run the daily digest now
    Digest {
        /// Day to settle (YYYY-MM-DD); defaults to today in the configured offset.
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum UserCommand {
    Add {
        #[arg(long)]
        username: String,
        #[arg(long)]
        full_name: String,
        #[arg(long, default_value = "")]
        email: String,
        #[arg(long, env = "TASKPOINTS_PASSWORD")]
        password: String,
        #[arg(long)]
        admin: bool,
    },
    List,
}

#[derive(Subcommand)]
enum GoalCommand {
    Add {
        #[arg(long)]
        label: String,
        #[arg(long)]
        points: i64,
    },
    /// Remove a goal no user has selected
    Remove {
        #[arg(long)]
        id: i64,
    },
    List,
}

#[derive(Subcommand)]
enum TaskCommand {
    Assign {
        #[arg(long)]
        title: String,
        #[arg(long)]
        points: i64,
        #[arg(long)]
        to: String,
    },
    List {
        #[arg(long)]
        username: String,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let mut cli = Cli::parse();
    let Some(command) = cli.command.take() else {
        Cli::command().print_help()?;
        println!();
        return Ok(());
    };

    match command {
        Command::Version => {
            println!("taskpoints {}", version::FULL);
        }
        Command::Init { dir, force } => {
            let path = config_path(&dir);
            if path.exists() && !force {
                bail!("{} already exists (use --force to overwrite)", path.display());
            }
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create {}", dir.display()))?;
            let path = write_config(&dir, &starter_config())?;
            println!("Wrote {}", path.display());
        }
        Command::User { command } => {
            let (engine, _) = open_engine(&cli)?;
            match command {
                UserCommand::Add {
                    username,
                    full_name,
                    email,
                    password,
                    admin,
                } => {
                    let user = engine.create_user(&NewUser {
                        username,
                        full_name,
                        password,
                        email,
                        is_admin: admin,
                    })?;
                    let role = if user.is_admin { " (admin)" } else { "" };
                    println!("Created user {}{}", user.username, role);
                }
                UserCommand::List => {
                    for user in engine.users()? {
                        println!("{}\t{}", user.username, user.full_name);
                    }
                }
            }
        }
        Command::Goal { command } => {
            let (engine, _) = open_engine(&cli)?;
            match command {
                GoalCommand::Add { label, points } => {
                    let goal = engine.create_goal(&label, points)?;
                    println!("Goal {}: {} ({} points)", goal.id, goal.label, goal.points);
                }
                GoalCommand::Remove { id } => {
                    engine.remove_goal(id)?;
                    println!("Removed goal {}", id);
                }
                GoalCommand::List => {
                    for goal in engine.goals()? {
                        println!("{}\t{}\t{}", goal.id, goal.label, goal.points);
                    }
                }
            }
        }
        Command::Task { command } => {
            let (engine, _) = open_engine(&cli)?;
            match command {
                TaskCommand::Assign { title, points, to } => {
                    let task = engine.assign(&title, points, &to)?;
                    println!(
                        "Task {} assigned to {} ({} points)",
                        task.id, task.assigned_to, task.points
                    );
                }
                TaskCommand::List { username } => {
                    for task in engine.tasks_for(&username)? {
                        println!("{}\t{}\t{}\t{}", task.id, task.status, task.points, task.title);
                    }
                }
            }
        }
        Command::Leaderboard { json } => {
            let (engine, _) = open_engine(&cli)?;
            let entries = engine.leaderboard()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                let rows: Vec<LeaderboardLine> = entries
                    .into_iter()
                    .map(|entry| LeaderboardLine {
                        full_name: entry.full_name,
                        points: entry.points,
                        level: entry.level,
                    })
                    .collect();
                print!("{}", leaderboard_table(&rows));
            }
        }
        Command::Stats {
            username,
            days,
            csv,
            json,
        } => {
            let (engine, _) = open_engine(&cli)?;
            let records = engine.weekly_stats(&username, days)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if csv {
                let rows: Vec<DailyPointsLine> = records
                    .into_iter()
                    .map(|record| DailyPointsLine {
                        username: record.username,
                        date: record.date,
                        points_earned: record.points_earned,
                    })
                    .collect();
                print!("{}", daily_points_csv(&rows)?);
            } else if records.is_empty() {
                println!("No settled points for {}", username);
            } else {
                for record in records {
                    println!("{}\t{}", record.date, record.points_earned);
                }
            }
        }
        Command::Digest { date, json } => {
            let (engine, config) = open_engine(&cli)?;
            let notifier = notifier_for(config.outbox_path());
            let day = date.unwrap_or_else(|| engine.today());
            let report = run_digest(
                &engine,
                notifier.as_ref(),
                &DigestOptions::from_config(&config),
                day,
            )?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "Digest {}: {} records, {} points, {} notifications, {} failures",
                    report.day,
                    report.records_written(),
                    report.points_settled(),
                    report.notifications_sent + report.admin_notifications,
                    report.notification_failures.len() + report.settlement_failures.len()
                );
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(explicit: Option<&Path>) -> Result<TaskpointsConfig> {
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let (config, _) = resolve_config_with_source(explicit, &cwd).context("load configuration")?;
    Ok(config)
}

fn open_engine(cli: &Cli) -> Result<(Engine, TaskpointsConfig)> {
    let config = load_config(cli.config.as_deref())?;
    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open database {}", db_path.display()))?;
    let engine = Engine::new(Arc::new(store)).with_utc_offset(config.utc_offset()?);
    Ok((engine, config))
}
