use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::Result;
use std::path::PathBuf;

use lineup::cache::EntityType;
use lineup::config::Config;
use lineup::festival::{FestivalClient, VoteType};
use lineup::{logging, SyncReport, WriteOutcome};

#[derive(Parser, Debug)]
#[command(name = "lineup")]
#[command(about = "Festival voting client that keeps working offline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lineup/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity, queue size and sync state
  Status,
  /// Read one record (artists, votes, profiles, group-votes, notes)
  Read { entity_type: EntityType, key: String },
  /// Vote on a set
  Vote { artist_id: String, vote: VoteArg },
  /// Remove your vote on a set
  Unvote { artist_id: String },
  /// Save a private note on a set
  Note { artist_id: String, text: String },
  /// Delete your note on a set
  Unnote { artist_id: String },
  /// Replay queued writes now
  Sync,
  /// List queued writes
  Pending,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum VoteArg {
  MustGo,
  Interested,
  WontGo,
}

impl From<VoteArg> for VoteType {
  fn from(arg: VoteArg) -> Self {
    match arg {
      VoteArg::MustGo => VoteType::MustGo,
      VoteArg::Interested => VoteType::Interested,
      VoteArg::WontGo => VoteType::WontGo,
    }
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = logging::init(&logging::default_dir()?)?;

  let config = Config::load(args.config.as_deref())?;
  let client = FestivalClient::connect(&config).await?;

  match args.command {
    Command::Status => {
      let status = client.cache().status();
      println!("online:  {}", status.online);
      println!("queued:  {}", status.queue_size);
      println!("state:   {}", serde_json::to_string(&client.cache().sync_state())?);
    }
    Command::Read { entity_type, key } => {
      let result = client.cache().read(entity_type, &key).await?;
      println!("{}", serde_json::to_string_pretty(&result.data)?);
      match result.cached_at {
        Some(at) => eprintln!("(from cache, synced {})", at.to_rfc3339()),
        None => eprintln!("(from network)"),
      }
    }
    Command::Vote { artist_id, vote } => {
      let outcome = client.cast_vote(&artist_id, vote.into()).await?;
      after_write(&client, outcome).await?;
    }
    Command::Unvote { artist_id } => {
      let outcome = client.remove_vote(&artist_id).await?;
      after_write(&client, outcome).await?;
    }
    Command::Note { artist_id, text } => {
      let outcome = client.save_note(&artist_id, &text).await?;
      after_write(&client, outcome).await?;
    }
    Command::Unnote { artist_id } => {
      let outcome = client.delete_note(&artist_id).await?;
      after_write(&client, outcome).await?;
    }
    Command::Sync => {
      if !client.cache().probe().await {
        println!("offline; {} write(s) stay queued", client.cache().queue_size()?);
        return Ok(());
      }
      let report = client.cache().sync_now().await?;
      print_report(&report);
    }
    Command::Pending => {
      let pending = client.cache().queue().list()?;
      if pending.is_empty() {
        println!("nothing queued");
      }
      for op in pending {
        println!(
          "#{:<6} {:<12} {:<24} {}",
          op.sequence,
          op.kind,
          op.lock_key(),
          op.created_at.to_rfc3339()
        );
      }
    }
  }

  Ok(())
}

async fn after_write(client: &FestivalClient, outcome: WriteOutcome) -> Result<()> {
  match outcome {
    WriteOutcome::Confirmed { .. } => println!("saved"),
    WriteOutcome::Queued { sequence } => {
      println!("queued as #{}", sequence);
      if client.cache().monitor().is_online() {
        let report = client.cache().sync_now().await?;
        print_report(&report);
      }
    }
  }
  Ok(())
}

fn print_report(report: &SyncReport) {
  println!(
    "replayed {}, still queued {}, rejected {}",
    report.replayed,
    report.remaining(),
    report.lost.len()
  );
  for lost in &report.lost {
    println!(
      "  rejected {} on {}: {}",
      lost.operation.kind,
      lost.operation.lock_key(),
      lost.error
    );
  }
}
