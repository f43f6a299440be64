use anyhow::{Context, Result, anyhow};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::db::{Database, InsertOutcome};
use crate::events::EventSink;
use crate::models::{CandidateProfile, RawPosting};
use crate::relay::{Envelope, RelayReceiver};
use crate::score::{self, Scorer};

/// Shared state handed to every scoring worker. The run id is published
/// by the collector thread shortly after the workers start; workers poll
/// for it rather than racing ahead.
#[derive(Clone)]
pub struct WorkerContext {
    pub db_path: PathBuf,
    pub run_id: Arc<OnceLock<i64>>,
    pub processed: Arc<AtomicUsize>,
    pub sink: Arc<dyn EventSink>,
}

/// Start `count` scoring workers on the receiving end of the relay queue.
/// Each worker opens its own store connection and builds its own
/// long-lived scoring client; the store's uniqueness constraint is the
/// only synchronization between them.
pub fn spawn_scoring_workers<S, F>(
    count: usize,
    receiver: RelayReceiver,
    ctx: WorkerContext,
    make_scorer: F,
) -> Result<Vec<JoinHandle<()>>>
where
    S: Scorer + 'static,
    F: Fn() -> Result<S> + Send + Clone + 'static,
{
    (0..count)
        .map(|worker_id| {
            let receiver = receiver.clone();
            let ctx = ctx.clone();
            let make_scorer = make_scorer.clone();
            thread::Builder::new()
                .name(format!("scoring-worker-{worker_id}"))
                .spawn(move || {
                    let scorer = match make_scorer() {
                        Ok(scorer) => Some(scorer),
                        Err(e) => {
                            error!("Worker {worker_id}: could not build scoring client: {e:#}");
                            None
                        }
                    };
                    worker_loop(worker_id, receiver, ctx, scorer);
                })
                .context("Failed to spawn scoring worker thread")
        })
        .collect()
}

fn worker_loop<S: Scorer>(
    worker_id: usize,
    receiver: RelayReceiver,
    ctx: WorkerContext,
    scorer: Option<S>,
) {
    let db = match Database::open_at(&ctx.db_path) {
        Ok(db) => db,
        Err(e) => {
            error!("Worker {worker_id}: cannot open store, draining queue: {e:#}");
            drain(worker_id, receiver);
            return;
        }
    };
    let profile = match db.load_profile() {
        Ok(profile) => profile,
        Err(e) => {
            warn!("Worker {worker_id}: could not load candidate profile: {e:#}");
            CandidateProfile::default()
        }
    };

    debug!("Worker {worker_id} ready");
    loop {
        let posting = match receiver.recv() {
            Ok(Envelope::Posting(posting)) => posting,
            Ok(Envelope::Shutdown) => {
                debug!("Worker {worker_id} received shutdown signal");
                break;
            }
            // Producer side gone without sentinels; nothing more will come.
            Err(_) => break,
        };

        if let Err(e) = process_posting(&db, &profile, scorer.as_ref(), &posting, &ctx) {
            error!(
                "Worker {worker_id}: error processing '{}' @ {}: {e:#}",
                posting.title, posting.company
            );
        }
    }
    debug!("Worker {worker_id} exiting");
}

/// Consume envelopes without processing so a broken worker never leaves
/// the producer blocked on a full queue.
fn drain(worker_id: usize, receiver: RelayReceiver) {
    loop {
        match receiver.recv() {
            Ok(Envelope::Posting(posting)) => {
                error!(
                    "Worker {worker_id}: dropped '{}' @ {} (store unavailable)",
                    posting.title, posting.company
                );
            }
            Ok(Envelope::Shutdown) | Err(_) => break,
        }
    }
}

fn wait_for_run_id(ctx: &WorkerContext) -> i64 {
    loop {
        if let Some(id) = ctx.run_id.get() {
            return *id;
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn process_posting<S: Scorer>(
    db: &Database,
    profile: &CandidateProfile,
    scorer: Option<&S>,
    posting: &RawPosting,
    ctx: &WorkerContext,
) -> Result<()> {
    let run_id = wait_for_run_id(ctx);

    if db.link_exists(&posting.application_link)? {
        info!("Duplicate posting skipped: {} @ {}", posting.title, posting.company);
        return Ok(());
    }

    let result = if profile.is_empty() {
        debug!("No candidate profile captured, assigning default score");
        score::missing_profile_score()
    } else {
        let scorer = scorer.ok_or_else(|| anyhow!("Scoring client unavailable"))?;
        scorer
            .score(posting, &profile.cv_text, &profile.preferences_text)
            .with_context(|| format!("Scoring failed for '{}'", posting.title))?
    };

    let details = serde_json::to_string(&result)?;
    match db.insert_job(posting, f64::from(result.overall), &details, run_id)? {
        InsertOutcome::Inserted(_) => {
            ctx.processed.fetch_add(1, Ordering::SeqCst);
            ctx.sink.job_processed(
                &posting.title,
                &posting.company,
                &posting.location,
                result.overall,
            );
            info!(
                "Saved job: {} @ {} - {}",
                posting.title, posting.company, posting.location
            );
        }
        InsertOutcome::DuplicateLink => {
            // Benign race: a sibling worker inserted the same link between
            // our lookup and insert. The existing row wins.
            debug!(
                "Concurrent insert for {}, keeping the existing row",
                posting.application_link
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingSink;
    use crate::models::{Reasoning, ScoreResult};
    use crate::relay;
    use std::sync::atomic::AtomicU32;

    /// Deterministic stand-in for the external scoring capability.
    /// Postings whose link contains "poison" fail to score.
    #[derive(Clone)]
    struct FakeScorer;

    impl Scorer for FakeScorer {
        fn score(&self, posting: &RawPosting, _cv: &str, _prefs: &str) -> Result<ScoreResult> {
            if posting.application_link.contains("poison") {
                return Err(anyhow!("scoring backend unavailable"));
            }
            Ok(ScoreResult {
                skillset: 70,
                academic: 70,
                experience: 70,
                professional: 70,
                language: 70,
                preference: 70,
                overall: 70,
                reasoning: Reasoning {
                    strengths: "s".to_string(),
                    concerns: "c".to_string(),
                    summary: "scored".to_string(),
                },
            })
        }
    }

    fn temp_db_path() -> PathBuf {
        static COUNTER: AtomicU32 = AtomicU32::new(0);
        let n = COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = std::env::temp_dir().join(format!(
            "jobscout-worker-test-{}-{n}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    fn init_db(path: &PathBuf, with_profile: bool) -> i64 {
        let db = Database::open_at(path).unwrap();
        db.init().unwrap();
        if with_profile {
            db.save_cv("a cv").unwrap();
            db.save_preferences("some preferences").unwrap();
        }
        let template_id = db
            .add_template("rust", "Munich", None, None, None, None, 1)
            .unwrap();
        let template = db.get_template(template_id).unwrap().unwrap();
        db.create_run(&template, None).unwrap()
    }

    fn context(path: &PathBuf, run_id: i64) -> (WorkerContext, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let once = Arc::new(OnceLock::new());
        once.set(run_id).unwrap();
        (
            WorkerContext {
                db_path: path.clone(),
                run_id: once,
                processed: Arc::new(AtomicUsize::new(0)),
                sink: sink.clone(),
            },
            sink,
        )
    }

    fn posting(link: &str) -> RawPosting {
        RawPosting {
            title: format!("Job {link}"),
            company: "Acme".to_string(),
            location: "Munich".to_string(),
            description: "desc".to_string(),
            application_link: link.to_string(),
        }
    }

    #[test]
    fn five_postings_through_two_workers_all_persist_once() {
        let path = temp_db_path();
        let run_id = init_db(&path, true);
        let (ctx, _sink) = context(&path, run_id);

        // Capacity below the posting count: the senders below exercise the
        // backpressure path while the workers drain.
        let (tx, rx) = relay::channel(2);
        let workers = spawn_scoring_workers(2, rx, ctx.clone(), || Ok(FakeScorer)).unwrap();

        for n in 0..5 {
            tx.send(Envelope::Posting(posting(&format!("https://example.com/{n}"))))
                .unwrap();
        }
        for _ in 0..2 {
            tx.send(Envelope::Shutdown).unwrap();
        }
        for handle in workers {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let jobs = db.list_jobs(Some(run_id), None).unwrap();
        assert_eq!(jobs.len(), 5);
        assert_eq!(ctx.processed.load(Ordering::SeqCst), 5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn shared_link_persists_exactly_once() {
        let path = temp_db_path();
        let run_id = init_db(&path, true);
        let (ctx, _sink) = context(&path, run_id);

        let (tx, rx) = relay::channel(8);
        let workers = spawn_scoring_workers(2, rx, ctx.clone(), || Ok(FakeScorer)).unwrap();

        // The same application link surfaces twice (different titles, as
        // happens across search variants).
        for n in 0..2 {
            let mut p = posting("https://example.com/shared");
            p.title = format!("Variant {n}");
            tx.send(Envelope::Posting(p)).unwrap();
        }
        for _ in 0..2 {
            tx.send(Envelope::Shutdown).unwrap();
        }
        for handle in workers {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.list_jobs(None, None).unwrap().len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_profile_gets_flagged_default_score() {
        let path = temp_db_path();
        let run_id = init_db(&path, false);
        let (ctx, sink) = context(&path, run_id);

        let (tx, rx) = relay::channel(8);
        let workers = spawn_scoring_workers(1, rx, ctx, || Ok(FakeScorer)).unwrap();

        tx.send(Envelope::Posting(posting("https://example.com/default")))
            .unwrap();
        tx.send(Envelope::Shutdown).unwrap();
        for handle in workers {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let jobs = db.list_jobs(None, None).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].matching_score, 80.0);
        let details: ScoreResult =
            serde_json::from_str(jobs[0].score_details.as_deref().unwrap()).unwrap();
        assert_eq!(details.overall, 80);
        assert!(details.reasoning.summary.contains("no candidate profile"));

        let processed = sink.processed.lock().unwrap();
        assert_eq!(processed.len(), 1);
        assert_eq!(processed[0].1, 80);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn scoring_failure_skips_item_but_not_siblings() {
        let path = temp_db_path();
        let run_id = init_db(&path, true);
        let (ctx, _sink) = context(&path, run_id);

        let (tx, rx) = relay::channel(8);
        let workers = spawn_scoring_workers(1, rx, ctx.clone(), || Ok(FakeScorer)).unwrap();

        tx.send(Envelope::Posting(posting("https://example.com/ok1"))).unwrap();
        tx.send(Envelope::Posting(posting("https://example.com/poison"))).unwrap();
        tx.send(Envelope::Posting(posting("https://example.com/ok2"))).unwrap();
        tx.send(Envelope::Shutdown).unwrap();
        for handle in workers {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let jobs = db.list_jobs(None, None).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| !job.application_link.contains("poison")));
        assert_eq!(ctx.processed.load(Ordering::SeqCst), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn known_duplicate_is_not_rescored() {
        let path = temp_db_path();
        let run_id = init_db(&path, true);

        // Pre-persist the link so the lookup, not the constraint, catches it.
        {
            let db = Database::open_at(&path).unwrap();
            db.insert_job(&posting("https://example.com/known"), 50.0, "{}", run_id)
                .unwrap();
        }

        let (ctx, sink) = context(&path, run_id);
        let (tx, rx) = relay::channel(8);
        let workers = spawn_scoring_workers(1, rx, ctx.clone(), || Ok(FakeScorer)).unwrap();

        tx.send(Envelope::Posting(posting("https://example.com/known")))
            .unwrap();
        tx.send(Envelope::Shutdown).unwrap();
        for handle in workers {
            handle.join().unwrap();
        }

        let db = Database::open_at(&path).unwrap();
        let jobs = db.list_jobs(None, None).unwrap();
        assert_eq!(jobs.len(), 1);
        // The original score is untouched and no event was emitted.
        assert_eq!(jobs[0].matching_score, 50.0);
        assert_eq!(ctx.processed.load(Ordering::SeqCst), 0);
        assert!(sink.processed.lock().unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
