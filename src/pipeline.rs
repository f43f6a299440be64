use anyhow::{Context, Result, anyhow, bail};
use log::{error, info, warn};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;

use crate::db::Database;
use crate::events::EventSink;
use crate::relay::{self, Envelope, RelaySender};
use crate::score::{HttpScorer, Scorer};
use crate::scraper::{self, JobScraper};
use crate::worker::{WorkerContext, spawn_scoring_workers};

/// Cooperative stop signal for one run. The orchestrator owns it; the
/// collector polls it; workers never see it - they observe termination
/// only through the queue's shutdown envelopes.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Terminal state of a pipeline run.
#[derive(Debug)]
pub enum RunOutcome {
    /// The collector exhausted all locations and pages.
    Completed { processed: usize },
    /// Cancellation was requested before natural completion; everything
    /// queued up to that point was still scored and persisted.
    Stopped { processed: usize },
    /// The session could not be established; no postings were collected.
    Errored { message: String },
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed { processed } => {
                write!(f, "Completed: {processed} job(s) processed")
            }
            RunOutcome::Stopped { processed } => {
                write!(f, "Stopped: {processed} job(s) processed before the stop request")
            }
            RunOutcome::Errored { message } => write!(f, "Errored: {message}"),
        }
    }
}

pub struct RunOptions {
    pub template_id: i64,
    pub pages: Option<u32>,
    pub workers: usize,
    pub capacity: usize,
    pub scorer_url: String,
    pub model: String,
    pub webdriver_url: String,
}

/// Everything the collector thread needs: the sending half of the relay
/// queue, the stop token, the slot where it publishes the run id, and its
/// own path to the store.
pub(crate) struct ProducerHandle {
    pub sender: RelaySender,
    pub token: CancelToken,
    pub run_id: Arc<OnceLock<i64>>,
    pub db_path: PathBuf,
}

/// Execute one scrape-and-score run end to end.
pub fn run(
    db_path: &Path,
    opts: &RunOptions,
    token: &CancelToken,
    sink: Arc<dyn EventSink>,
) -> Result<RunOutcome> {
    if opts.workers == 0 {
        bail!("At least one scoring worker is required");
    }

    let db = Database::open_at(db_path)?;
    db.ensure_initialized()?;

    let template = db
        .get_template(opts.template_id)?
        .ok_or_else(|| anyhow!("Search template #{} not found", opts.template_id))?;
    if !template.is_template {
        bail!("#{} is a past run, not a template", opts.template_id);
    }
    // Invalid filter values never reach the collector.
    scraper::validate(&template)?;

    let cookie_path = db.data_dir().join("session_cookies.json");
    let webdriver_url = opts.webdriver_url.clone();
    let pages = opts.pages;
    drop(db);

    let scorer_url = opts.scorer_url.clone();
    let model = opts.model.clone();

    run_with_source(
        db_path,
        opts.workers,
        opts.capacity,
        token,
        sink,
        move || HttpScorer::new(&scorer_url, &model),
        move |handle: ProducerHandle| -> Result<()> {
            let db = Database::open_at(&handle.db_path)?;
            let run_row = db
                .create_run(&template, pages)
                .context("Failed to create the search run")?;
            db.touch_last_run(template.id)?;
            let run = db
                .get_template(run_row)?
                .ok_or_else(|| anyhow!("Search run #{run_row} vanished"))?;
            let _ = handle.run_id.set(run_row);
            info!("Created search run #{run_row}");

            let collector = JobScraper::connect(&webdriver_url, &cookie_path)?;
            if let Err(e) = collector.establish_session() {
                let _ = collector.quit();
                return Err(e);
            }

            let sender = handle.sender;
            let mut emit =
                |posting| sender.send(Envelope::Posting(posting)).is_ok();
            let result = collector.collect(&run, &handle.token, &mut emit);
            if let Err(e) = collector.quit() {
                warn!("Browser session cleanup failed: {e:#}");
            }
            result.map(|_| ())
        },
    )
}

/// The orchestration core, generic over the posting source so the wiring
/// can be exercised without a browser: start W workers, start the
/// producer on its own thread, wait for it, enqueue one shutdown envelope
/// per worker, wait for the drain, report the outcome.
pub(crate) fn run_with_source<S, F, P>(
    db_path: &Path,
    workers: usize,
    capacity: usize,
    token: &CancelToken,
    sink: Arc<dyn EventSink>,
    make_scorer: F,
    producer: P,
) -> Result<RunOutcome>
where
    S: Scorer + 'static,
    F: Fn() -> Result<S> + Send + Clone + 'static,
    P: FnOnce(ProducerHandle) -> Result<()> + Send + 'static,
{
    let (sender, receiver) = relay::channel(capacity);
    let run_id = Arc::new(OnceLock::new());
    let processed = Arc::new(AtomicUsize::new(0));

    info!("Starting {workers} scoring workers");
    let worker_handles = spawn_scoring_workers(
        workers,
        receiver,
        WorkerContext {
            db_path: db_path.to_path_buf(),
            run_id: run_id.clone(),
            processed: processed.clone(),
            sink: sink.clone(),
        },
        make_scorer,
    )?;

    sink.log_line("Scraping task started...");
    info!("Starting collector thread");
    let producer_handle = ProducerHandle {
        sender: sender.clone(),
        token: token.clone(),
        run_id,
        db_path: db_path.to_path_buf(),
    };
    let collector_thread = thread::Builder::new()
        .name("collector".to_string())
        .spawn(move || producer(producer_handle))
        .context("Failed to spawn the collector thread")?;

    let producer_result = match collector_thread.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("Collector thread panicked")),
    };

    info!("Collector finished, signalling workers");
    for _ in 0..workers {
        if sender.send(Envelope::Shutdown).is_err() {
            warn!("Relay queue closed before all shutdown signals were sent");
            break;
        }
    }
    drop(sender);

    for handle in worker_handles {
        if handle.join().is_err() {
            warn!("A scoring worker panicked");
        }
    }
    info!("All workers exited");

    let processed = processed.load(Ordering::SeqCst);
    let outcome = match producer_result {
        Err(e) => RunOutcome::Errored {
            message: format!("{e:#}"),
        },
        Ok(()) if token.is_cancelled() => RunOutcome::Stopped { processed },
        Ok(()) => RunOutcome::Completed { processed },
    };

    match &outcome {
        RunOutcome::Completed { processed } => {
            sink.log_line(&format!(
                "Scraping and scoring complete. {processed} job(s) processed."
            ));
        }
        RunOutcome::Stopped { processed } => {
            sink.log_line(&format!(
                "Scraping was stopped; {processed} queued job(s) were still processed."
            ));
        }
        RunOutcome::Errored { message } => {
            error!("Run failed: {message}");
            sink.log_line(&format!("Scraping failed: {message}"));
        }
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::test_support::RecordingSink;
    use crate::models::{RawPosting, Reasoning, ScoreResult};
    use std::sync::atomic::AtomicU32;

    #[derive(Clone)]
    struct FixedScorer(u8);

    impl Scorer for FixedScorer {
        fn score(&self, _p: &RawPosting, _cv: &str, _prefs: &str) -> Result<ScoreResult> {
            let value = self.0;
            Ok(ScoreResult {
                skillset: value,
                academic: value,
                experience: value,
                professional: value,
                language: value,
                preference: value,
                overall: value,
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
            "jobscout-pipeline-test-{}-{n}.db",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Create the schema, a profile and a run row; return the run id.
    fn seed_db(path: &Path) -> i64 {
        let db = Database::open_at(path).unwrap();
        db.init().unwrap();
        db.save_cv("cv").unwrap();
        db.save_preferences("prefs").unwrap();
        let template_id = db
            .add_template("rust", "Munich", None, None, None, None, 1)
            .unwrap();
        let template = db.get_template(template_id).unwrap().unwrap();
        db.create_run(&template, None).unwrap()
    }

    fn posting(n: usize) -> RawPosting {
        RawPosting {
            title: format!("Job {n}"),
            company: "Acme".to_string(),
            location: "Munich".to_string(),
            description: "desc".to_string(),
            application_link: format!("https://example.com/{n}"),
        }
    }

    #[test]
    fn token_flips_once_and_stays() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
        // Clones observe the same flag.
        let clone = token.clone();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn natural_completion_reports_completed() {
        let path = temp_db_path();
        let run_id = seed_db(&path);
        let sink = Arc::new(RecordingSink::default());
        let token = CancelToken::new();

        let outcome = run_with_source(
            &path,
            2,
            2, // capacity below the posting count to exercise backpressure
            &token,
            sink.clone(),
            || Ok(FixedScorer(75)),
            move |handle| {
                handle.run_id.set(run_id).unwrap();
                for n in 0..5 {
                    if handle.sender.send(Envelope::Posting(posting(n))).is_err() {
                        break;
                    }
                }
                Ok(())
            },
        )
        .unwrap();

        match outcome {
            RunOutcome::Completed { processed } => assert_eq!(processed, 5),
            other => panic!("expected Completed, got {other}"),
        }

        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.list_jobs(Some(run_id), None).unwrap().len(), 5);
        assert_eq!(sink.processed.lock().unwrap().len(), 5);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn cancellation_keeps_already_queued_postings() {
        let path = temp_db_path();
        let run_id = seed_db(&path);
        let token = CancelToken::new();

        let outcome = run_with_source(
            &path,
            2,
            8,
            &token,
            Arc::new(RecordingSink::default()),
            || Ok(FixedScorer(75)),
            move |handle| {
                handle.run_id.set(run_id).unwrap();
                // Two postings make it into the queue, then the stop
                // request arrives and nothing more is produced.
                for n in 0..2 {
                    handle.sender.send(Envelope::Posting(posting(n))).ok();
                }
                handle.token.cancel();
                Ok(())
            },
        )
        .unwrap();

        match outcome {
            RunOutcome::Stopped { processed } => assert_eq!(processed, 2),
            other => panic!("expected Stopped, got {other}"),
        }

        // Nothing already queued was dropped.
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.list_jobs(Some(run_id), None).unwrap().len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn session_failure_reports_errored_before_any_work() {
        let path = temp_db_path();
        seed_db(&path);
        let sink = Arc::new(RecordingSink::default());
        let token = CancelToken::new();
        let before = Database::open_at(&path).unwrap().list_jobs(None, None).unwrap().len();

        let outcome = run_with_source(
            &path,
            3,
            8,
            &token,
            sink.clone(),
            || Ok(FixedScorer(75)),
            |_handle| -> Result<()> { Err(anyhow!("Login timeout exceeded (180s)")) },
        )
        .unwrap();

        match outcome {
            RunOutcome::Errored { message } => assert!(message.contains("Login timeout")),
            other => panic!("expected Errored, got {other}"),
        }

        // All three workers were shut down and nothing was persisted.
        let db = Database::open_at(&path).unwrap();
        assert_eq!(db.list_jobs(None, None).unwrap().len(), before);
        assert!(sink.processed.lock().unwrap().is_empty());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn collector_panic_is_contained() {
        let path = temp_db_path();
        seed_db(&path);
        let token = CancelToken::new();

        let outcome = run_with_source(
            &path,
            1,
            8,
            &token,
            Arc::new(RecordingSink::default()),
            || Ok(FixedScorer(75)),
            |_handle| -> Result<()> { panic!("boom") },
        )
        .unwrap();

        match outcome {
            RunOutcome::Errored { message } => assert!(message.contains("panicked")),
            other => panic!("expected Errored, got {other}"),
        }
        let _ = std::fs::remove_file(&path);
    }
}
