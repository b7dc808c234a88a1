use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;

use taskdash::app::App;
use taskdash::config::Config;
use taskdash::read_status::SqliteReadStatus;

#[derive(Parser, Debug)]
#[command(name = "taskdash")]
#[command(about = "Employee task dashboard backed by a spreadsheet API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/taskdash/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// User whose tasks to show (overrides `subject` in the config)
  #[arg(short, long)]
  subject: Option<String>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Keep every resource refreshed and report new tasks until Ctrl-C
  Watch,
  /// Print a resource's rows as JSON lines
  Show {
    resource: String,
    /// Bypass the cache
    #[arg(short, long)]
    refresh: bool,
  },
  /// Mark rows read (all current rows if no identity is given)
  MarkRead {
    resource: String,
    identities: Vec<String>,
  },
  /// Mark one row unread
  MarkUnread { resource: String, identity: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = taskdash::logging::init(&config.log)?;

  let subject = args
    .subject
    .or_else(|| config.subject.clone())
    .ok_or_else(|| eyre!("No subject given. Pass --subject or set `subject` in the config."))?;

  let read_status = SqliteReadStatus::open()?;
  let mut app = App::new(config, subject.into(), Box::new(read_status))?;

  match args.command {
    Command::Watch => app.watch().await?,
    Command::Show { resource, refresh } => app.show(&resource, refresh).await?,
    Command::MarkRead {
      resource,
      identities,
    } => {
      let count = app.mark_read(&resource, identities).await?;
      println!("marked {} row(s) read in {}", count, resource);
    }
    Command::MarkUnread { resource, identity } => {
      app.mark_unread(&resource, &identity)?;
      println!("marked {} unread in {}", identity, resource);
    }
  }

  Ok(())
}
