//! pitchlab - grading pipeline CLI
//!
//! Operator tooling around the session grading pipeline: import practice
//! sessions, run rubric grading and line-rating batches, replay webhook
//! deliveries, and inspect the phrase cache.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use pitchlab_core::batch::{LineRatingProcessor, SpeakerNames};
use pitchlab_core::cache::{DegradingPhraseCache, SqlitePhraseCache};
use pitchlab_core::correlate::ConversationCorrelator;
use pitchlab_core::llm::create_client;
use pitchlab_core::orchestrator::GradingOrchestrator;
use pitchlab_core::webhook::WebhookHandler;
use pitchlab_core::{Config, Database, SessionStore, StoredSession, Transcript};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "pitchlab")]
#[command(about = "Grade and analyze door-to-door sales practice sessions")]
#[command(version)]
struct Cli {
    /// Database path (defaults to the XDG data dir)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a session from a JSON file
    Import {
        /// Path to the session JSON
        file: PathBuf,
    },

    /// Run rubric grading on a session
    Grade {
        /// Session id
        session: String,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run line-rating batches on a session
    RateLines {
        /// Session id
        session: String,
        /// Single batch index to process; all batches when omitted
        #[arg(short, long)]
        batch: Option<u32>,
        /// Rep display name for prompt context
        #[arg(long)]
        rep_name: Option<String>,
        /// Customer display name for prompt context
        #[arg(long)]
        customer_name: Option<String>,
    },

    /// Ingest a webhook delivery from a file (replay/debug)
    Webhook {
        /// Path to the raw delivery body
        file: PathBuf,
        /// Hex HMAC-SHA256 signature, with or without the sha256= prefix
        #[arg(short, long)]
        signature: Option<String>,
    },

    /// Correlate an already-stored conversation against sessions
    Correlate {
        /// Conversation id
        conversation: String,
        /// Persist the link for high/medium confidence matches
        #[arg(long)]
        link: bool,
    },

    /// Phrase cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count
    Stats,
    /// Drop every cached rating
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    Config::ensure_xdg_env();
    let config = Config::load().context("failed to load configuration")?;
    let _log_guard =
        pitchlab_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let db_path = cli.db.clone().unwrap_or_else(Config::database_path);
    tracing::info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).context("failed to open database")?;
    db.migrate().context("failed to run database migrations")?;
    let db = Arc::new(db);

    match cli.command {
        Command::Import { file } => import_session(&db, &file),
        Command::Grade { session, json } => grade(&db, &config, &session, json),
        Command::RateLines {
            session,
            batch,
            rep_name,
            customer_name,
        } => {
            let names = SpeakerNames {
                rep: rep_name,
                customer: customer_name,
            };
            rate_lines(&db, &config, &session, batch, &names)
        }
        Command::Webhook { file, signature } => webhook(&db, &config, &file, signature.as_deref()),
        Command::Correlate { conversation, link } => correlate(&db, &conversation, link),
        Command::Cache { action } => cache(&db, action),
    }
}

/// Wire shape accepted by `pitchlab import`.
#[derive(serde::Deserialize)]
struct ImportPayload {
    #[serde(default)]
    id: Option<String>,
    user_id: String,
    #[serde(default)]
    agent_id: Option<String>,
    started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    ended_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    duration_secs: i64,
    transcript: Transcript,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

fn import_session(db: &Database, file: &PathBuf) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let payload: ImportPayload =
        serde_json::from_str(&content).context("malformed session JSON")?;

    let id = payload
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let session = StoredSession {
        id: id.clone(),
        user_id: payload.user_id,
        agent_id: payload.agent_id,
        started_at: payload.started_at,
        ended_at: payload.ended_at,
        duration_secs: payload.duration_secs,
        transcript: payload.transcript,
        scores: None,
        summary: None,
        feedback: None,
        line_ratings: BTreeMap::new(),
        rated_batches: 0,
        total_batches: None,
        conversation_id: None,
        analytics: None,
        metadata: payload.metadata.unwrap_or_else(|| serde_json::json!({})),
    };
    db.upsert_session(&session)
        .context("failed to store session")?;

    println!("Imported session {} ({} turns)", id, session.transcript.len());
    Ok(())
}

fn grade(db: &Arc<Database>, config: &Config, session: &str, json: bool) -> Result<()> {
    let llm = config
        .llm
        .as_ref()
        .context("no [llm] section configured; grading needs an LLM provider")?;
    let client = create_client(llm, &config.grading).context("failed to create LLM client")?;

    let orchestrator = GradingOrchestrator::new(db, client.as_ref(), config.grading.clone());
    let report = orchestrator
        .grade_session(session)
        .with_context(|| format!("grading failed for session {session}"))?;

    if json {
        println!(
            "{}",
            serde_json::json!({
                "session_id": report.session_id,
                "scores": report.scores,
                "overall": report.overall,
                "summary": report.summary,
                "partial": report.partial,
                "downgraded": report.downgraded,
                "line_ratings": report.line_ratings,
                "duration_ms": report.duration_ms,
            })
        );
    } else {
        println!("Session {} graded in {}ms", report.session_id, report.duration_ms);
        println!(
            "  rapport {}  discovery {}  objections {}  closing {}  safety {}",
            report.scores.rapport,
            report.scores.discovery,
            report.scores.objection_handling,
            report.scores.closing,
            report.scores.safety
        );
        println!("  overall {}", report.overall);
        println!("  {}", report.summary);
        if report.partial {
            println!("  (partial: assembled from isolated response sections)");
        }
        if report.downgraded {
            println!("  (downgraded: persisted via reduced payload)");
        }
    }
    Ok(())
}

fn rate_lines(
    db: &Arc<Database>,
    config: &Config,
    session: &str,
    batch: Option<u32>,
    names: &SpeakerNames,
) -> Result<()> {
    let llm = config
        .llm
        .as_ref()
        .context("no [llm] section configured; line rating needs an LLM provider")?;
    let client = create_client(llm, &config.grading).context("failed to create LLM client")?;
    let cache = DegradingPhraseCache::new(SqlitePhraseCache::new(db.clone()));
    let processor = LineRatingProcessor::new(db.as_ref(), &cache, client.as_ref());

    let stored = db
        .load_session(session)
        .context("failed to load session")?
        .with_context(|| format!("no session {session}"))?;
    let total = LineRatingProcessor::batch_count(&stored.transcript);
    if total == 0 {
        bail!("session {session} has no rep turns to rate");
    }

    let indices: Vec<u32> = match batch {
        Some(index) => vec![index],
        None => (0..total as u32).collect(),
    };

    for index in indices {
        let outcome = processor
            .process_batch(session, index, names)
            .with_context(|| format!("batch {index} failed"))?;
        println!(
            "Batch {index}: {} rated, {} cached, {} failed ({}/{} complete)",
            outcome.newly_rated,
            outcome.cache_hits,
            outcome.failed,
            outcome.completed_batches,
            outcome.total_batches
        );
    }
    Ok(())
}

fn webhook(db: &Arc<Database>, config: &Config, file: &PathBuf, signature: Option<&str>) -> Result<()> {
    let body = std::fs::read(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let handler = WebhookHandler::new(db.as_ref(), config.webhook.secret.clone());
    let outcome = handler
        .ingest(&body, signature)
        .context("webhook ingestion failed")?;

    println!(
        "Ingested conversation {} (signature: {:?})",
        outcome.conversation_id, outcome.signature
    );
    match (&outcome.correlation.session_id, outcome.correlation.confidence) {
        (Some(session_id), Some(confidence)) => println!(
            "  matched session {} with {} confidence{}",
            session_id,
            confidence.as_str(),
            if outcome.correlation.linked { ", linked" } else { "" }
        ),
        _ => println!("  no session matched"),
    }
    Ok(())
}

fn correlate(db: &Arc<Database>, conversation: &str, link: bool) -> Result<()> {
    let record = db
        .get_conversation(conversation)
        .context("failed to load conversation")?
        .with_context(|| format!("no conversation {conversation}"))?;

    let correlator = ConversationCorrelator::new(db.as_ref());
    let outcome = if link {
        correlator.correlate_and_link(&record)?
    } else {
        correlator.correlate(&record)?
    };

    match (&outcome.session_id, outcome.confidence) {
        (Some(session_id), Some(confidence)) => {
            println!(
                "Conversation {} -> session {} ({} confidence{})",
                conversation,
                session_id,
                confidence.as_str(),
                if outcome.linked { ", linked" } else { "" }
            );
        }
        _ => println!("Conversation {conversation} matched no session"),
    }
    Ok(())
}

fn cache(db: &Arc<Database>, action: CacheAction) -> Result<()> {
    match action {
        CacheAction::Stats => {
            let count = db.phrase_cache_len().context("failed to read cache")?;
            println!("{count} cached line ratings");
        }
        CacheAction::Clear => {
            let removed = db.phrase_cache_clear().context("failed to clear cache")?;
            println!("Removed {removed} cached line ratings");
        }
    }
    Ok(())
}
