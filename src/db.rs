use anyhow::{Context, Result, anyhow};
use rusqlite::{Connection, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::{CandidateProfile, PersistedJob, RawPosting, SearchTemplate};

/// Result of trying to persist a scored posting. The unique constraint on
/// `application_link` is the store-level dedup authority: concurrent
/// workers may race check-then-insert, and the loser sees `DuplicateLink`.
#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(i64),
    DuplicateLink,
}

pub struct Database {
    conn: Connection,
    path: PathBuf,
}

impl Database {
    pub fn open() -> Result<Self> {
        Self::open_at(&Self::default_path()?)
    }

    /// Open at an explicit path. Each scoring worker opens its own
    /// connection here; SQLite serializes the writers.
    pub fn open_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        conn.busy_timeout(Duration::from_secs(10))?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn default_path() -> Result<PathBuf> {
        if let Some(proj_dirs) = directories::ProjectDirs::from("", "", "jobscout") {
            Ok(proj_dirs.data_dir().join("jobscout.db"))
        } else {
            Ok(PathBuf::from("jobscout.db"))
        }
    }

    /// Directory holding the database; the persisted browser session
    /// lives next to it.
    pub fn data_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn init(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS search_configs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                keywords TEXT NOT NULL,
                locations TEXT NOT NULL,
                distance_km INTEGER,
                date_posted TEXT,
                exp_level TEXT,
                job_type TEXT,
                pages INTEGER NOT NULL DEFAULT 1,
                is_template INTEGER NOT NULL DEFAULT 1,
                last_run TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                company TEXT,
                location TEXT,
                description TEXT,
                application_link TEXT NOT NULL UNIQUE,
                matching_score REAL NOT NULL DEFAULT 0.0,
                score_details TEXT,
                search_run_id INTEGER REFERENCES search_configs(id),
                scraped_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS profile (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                cv_text TEXT,
                preferences_text TEXT,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_run ON jobs(search_run_id);
            CREATE INDEX IF NOT EXISTS idx_configs_template ON search_configs(is_template);
            "#,
        )?;
        Ok(())
    }

    pub fn ensure_initialized(&self) -> Result<()> {
        let tables: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='jobs'",
            [],
            |row| row.get(0),
        )?;
        if tables == 0 {
            return Err(anyhow!("Database not initialized. Run 'jobscout init' first."));
        }
        Ok(())
    }

    // --- Search template operations ---

    #[allow(clippy::too_many_arguments)]
    pub fn add_template(
        &self,
        keywords: &str,
        locations: &str,
        distance_km: Option<u32>,
        date_posted: Option<&str>,
        exp_level: Option<&str>,
        job_type: Option<&str>,
        pages: u32,
    ) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO search_configs (keywords, locations, distance_km, date_posted, exp_level, job_type, pages, is_template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1)",
            params![keywords, locations, distance_km, date_posted, exp_level, job_type, pages],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn list_templates(&self) -> Result<Vec<SearchTemplate>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, keywords, locations, distance_km, date_posted, exp_level, job_type,
                    pages, is_template, last_run, created_at
             FROM search_configs WHERE is_template = 1 ORDER BY id",
        )?;
        let rows = stmt.query_map([], Self::row_to_template)?;
        rows.collect::<Result<Vec<_>, _>>()
            .context("Failed to list search templates")
    }

    pub fn get_template(&self, id: i64) -> Result<Option<SearchTemplate>> {
        let result = self.conn.query_row(
            "SELECT id, keywords, locations, distance_km, date_posted, exp_level, job_type,
                    pages, is_template, last_run, created_at
             FROM search_configs WHERE id = ?1",
            [id],
            Self::row_to_template,
        );
        match result {
            Ok(t) => Ok(Some(t)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn delete_template(&self, id: i64) -> Result<bool> {
        let changed = self
            .conn
            .execute("DELETE FROM search_configs WHERE id = ?1 AND is_template = 1", [id])?;
        Ok(changed > 0)
    }

    /// Derive a point-in-time run from a template. The run is an immutable
    /// copy; the pipeline never mutates it afterwards.
    pub fn create_run(&self, template: &SearchTemplate, pages_override: Option<u32>) -> Result<i64> {
        let pages = pages_override.unwrap_or(template.pages);
        self.conn.execute(
            "INSERT INTO search_configs (keywords, locations, distance_km, date_posted, exp_level, job_type, pages, is_template)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
            params![
                template.keywords,
                template.locations,
                template.distance_km,
                template.date_posted,
                template.exp_level,
                template.job_type,
                pages
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn touch_last_run(&self, template_id: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE search_configs SET last_run = datetime('now') WHERE id = ?1",
            [template_id],
        )?;
        Ok(())
    }

    fn row_to_template(row: &rusqlite::Row) -> rusqlite::Result<SearchTemplate> {
        Ok(SearchTemplate {
            id: row.get(0)?,
            keywords: row.get(1)?,
            locations: row.get(2)?,
            distance_km: row.get(3)?,
            date_posted: row.get(4)?,
            exp_level: row.get(5)?,
            job_type: row.get(6)?,
            pages: row.get(7)?,
            is_template: row.get(8)?,
            last_run: row.get(9)?,
            created_at: row.get(10)?,
        })
    }

    // --- Job operations ---

    pub fn link_exists(&self, application_link: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM jobs WHERE application_link = ?1",
                [application_link],
                |row| row.get(0),
            )
            .ok();
        Ok(found.is_some())
    }

    pub fn insert_job(
        &self,
        posting: &RawPosting,
        matching_score: f64,
        score_details: &str,
        search_run_id: i64,
    ) -> Result<InsertOutcome> {
        let result = self.conn.execute(
            "INSERT INTO jobs (title, company, location, description, application_link, matching_score, score_details, search_run_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                posting.title,
                posting.company,
                posting.location,
                posting.description,
                posting.application_link,
                matching_score,
                score_details,
                search_run_id
            ],
        );
        match result {
            Ok(_) => Ok(InsertOutcome::Inserted(self.conn.last_insert_rowid())),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(InsertOutcome::DuplicateLink)
            }
            Err(e) => Err(e).context("Failed to insert job"),
        }
    }

    pub fn list_jobs(&self, run_id: Option<i64>, min_score: Option<f64>) -> Result<Vec<PersistedJob>> {
        let mut sql = String::from(
            "SELECT id, title, company, location, description, application_link,
                    matching_score, score_details, search_run_id, scraped_at
             FROM jobs WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = vec![];

        if let Some(run) = run_id {
            sql.push_str(&format!(" AND search_run_id = ?{}", args.len() + 1));
            args.push(Box::new(run));
        }
        if let Some(score) = min_score {
            sql.push_str(&format!(" AND matching_score >= ?{}", args.len() + 1));
            args.push(Box::new(score));
        }
        sql.push_str(" ORDER BY matching_score DESC, id");

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::row_to_job,
        )?;
        rows.collect::<Result<Vec<_>, _>>().context("Failed to list jobs")
    }

    pub fn get_job(&self, id: i64) -> Result<Option<PersistedJob>> {
        let result = self.conn.query_row(
            "SELECT id, title, company, location, description, application_link,
                    matching_score, score_details, search_run_id, scraped_at
             FROM jobs WHERE id = ?1",
            [id],
            Self::row_to_job,
        );
        match result {
            Ok(job) => Ok(Some(job)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<PersistedJob> {
        Ok(PersistedJob {
            id: row.get(0)?,
            title: row.get(1)?,
            company: row.get(2)?,
            location: row.get(3)?,
            description: row.get(4)?,
            application_link: row.get(5)?,
            matching_score: row.get(6)?,
            score_details: row.get(7)?,
            search_run_id: row.get(8)?,
            scraped_at: row.get(9)?,
        })
    }

    // --- Candidate profile ---

    pub fn save_cv(&self, cv_text: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO profile (id, cv_text) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET cv_text = ?1, updated_at = datetime('now')",
            [cv_text],
        )?;
        Ok(())
    }

    pub fn save_preferences(&self, preferences_text: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO profile (id, preferences_text) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET preferences_text = ?1, updated_at = datetime('now')",
            [preferences_text],
        )?;
        Ok(())
    }

    pub fn load_profile(&self) -> Result<CandidateProfile> {
        let result = self.conn.query_row(
            "SELECT cv_text, preferences_text FROM profile WHERE id = 1",
            [],
            |row| {
                Ok(CandidateProfile {
                    cv_text: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    preferences_text: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                })
            },
        );
        match result {
            Ok(profile) => Ok(profile),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(CandidateProfile::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawPosting;

    fn db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.init().unwrap();
        db
    }

    fn posting(link: &str) -> RawPosting {
        RawPosting {
            title: "AI Engineer".to_string(),
            company: "Acme".to_string(),
            location: "Munich".to_string(),
            description: "Build things".to_string(),
            application_link: link.to_string(),
        }
    }

    #[test]
    fn template_round_trip() {
        let db = db();
        let id = db
            .add_template(
                "rust developer",
                "Munich, Berlin",
                Some(40),
                Some("past week"),
                Some("entry level, associate"),
                Some("full-time"),
                3,
            )
            .unwrap();

        let t = db.get_template(id).unwrap().unwrap();
        assert_eq!(t.keywords, "rust developer");
        assert_eq!(t.locations(), vec!["Munich", "Berlin"]);
        assert_eq!(t.distance_km, Some(40));
        assert_eq!(t.pages, 3);
        assert!(t.is_template);
        assert!(t.last_run.is_none());

        assert_eq!(db.list_templates().unwrap().len(), 1);
        assert!(db.delete_template(id).unwrap());
        assert!(db.get_template(id).unwrap().is_none());
    }

    #[test]
    fn run_is_a_copy_with_template_flag_cleared() {
        let db = db();
        let id = db
            .add_template("rust", "Munich", None, None, None, None, 1)
            .unwrap();
        let template = db.get_template(id).unwrap().unwrap();

        let run_id = db.create_run(&template, Some(5)).unwrap();
        assert_ne!(run_id, id);

        let run = db.get_template(run_id).unwrap().unwrap();
        assert!(!run.is_template);
        assert_eq!(run.keywords, "rust");
        assert_eq!(run.pages, 5);

        // Runs never show up in the template listing.
        assert_eq!(db.list_templates().unwrap().len(), 1);

        db.touch_last_run(id).unwrap();
        assert!(db.get_template(id).unwrap().unwrap().last_run.is_some());
    }

    #[test]
    fn duplicate_link_is_reported_not_raised() {
        let db = db();
        let template = {
            let id = db.add_template("x", "y", None, None, None, None, 1).unwrap();
            db.get_template(id).unwrap().unwrap()
        };
        let run = db.create_run(&template, None).unwrap();

        let first = db
            .insert_job(&posting("https://example.com/1"), 75.0, "{}", run)
            .unwrap();
        assert!(matches!(first, InsertOutcome::Inserted(_)));

        let second = db
            .insert_job(&posting("https://example.com/1"), 60.0, "{}", run)
            .unwrap();
        assert_eq!(second, InsertOutcome::DuplicateLink);

        assert_eq!(db.list_jobs(Some(run), None).unwrap().len(), 1);
        assert!(db.link_exists("https://example.com/1").unwrap());
        assert!(!db.link_exists("https://example.com/2").unwrap());
    }

    #[test]
    fn job_listing_filters_by_run_and_score() {
        let db = db();
        let template = {
            let id = db.add_template("x", "y", None, None, None, None, 1).unwrap();
            db.get_template(id).unwrap().unwrap()
        };
        let run_a = db.create_run(&template, None).unwrap();
        let run_b = db.create_run(&template, None).unwrap();

        db.insert_job(&posting("https://a/1"), 90.0, "{}", run_a).unwrap();
        db.insert_job(&posting("https://a/2"), 40.0, "{}", run_a).unwrap();
        db.insert_job(&posting("https://b/1"), 70.0, "{}", run_b).unwrap();

        assert_eq!(db.list_jobs(None, None).unwrap().len(), 3);
        assert_eq!(db.list_jobs(Some(run_a), None).unwrap().len(), 2);
        let high = db.list_jobs(None, Some(60.0)).unwrap();
        assert_eq!(high.len(), 2);
        // Ordered by score descending.
        assert!(high[0].matching_score >= high[1].matching_score);

        let job = db.get_job(high[0].id).unwrap().unwrap();
        assert_eq!(job.matching_score, 90.0);
    }

    #[test]
    fn profile_upserts_each_side_independently() {
        let db = db();
        assert!(db.load_profile().unwrap().is_empty());

        db.save_cv("my cv").unwrap();
        let partial = db.load_profile().unwrap();
        assert_eq!(partial.cv_text, "my cv");
        assert!(partial.is_empty());

        db.save_preferences("remote only").unwrap();
        let full = db.load_profile().unwrap();
        assert_eq!(full.preferences_text, "remote only");
        assert!(!full.is_empty());

        db.save_cv("updated cv").unwrap();
        let updated = db.load_profile().unwrap();
        assert_eq!(updated.cv_text, "updated cv");
        assert_eq!(updated.preferences_text, "remote only");
    }
}
