mod db;
mod events;
mod logger;
mod models;
mod pipeline;
mod relay;
mod score;
mod scraper;
mod worker;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use db::Database;
use events::LogSink;
use models::SearchTemplate;
use pipeline::{CancelToken, RunOptions};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "jobscout")]
#[command(about = "Job search automation - scrape postings and score them against your profile")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Manage search templates
    Template {
        #[command(subcommand)]
        command: TemplateCommands,
    },

    /// Manage the candidate profile (CV and preferences)
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Run the scrape-and-score pipeline for a template
    Run {
        /// Search template ID
        #[arg(short, long)]
        template: i64,

        /// Override the template's page count
        #[arg(short, long)]
        pages: Option<u32>,

        /// Number of scoring workers
        #[arg(short, long, default_value_t = 3)]
        workers: usize,

        /// Relay queue capacity
        #[arg(long, default_value_t = relay::DEFAULT_CAPACITY)]
        capacity: usize,

        /// Base URL of the scoring endpoint (OpenAI-compatible)
        #[arg(long, default_value = score::DEFAULT_SCORER_URL)]
        scorer_url: String,

        /// Scoring model name
        #[arg(short, long, default_value = score::DEFAULT_MODEL)]
        model: String,

        /// WebDriver server URL
        #[arg(long, default_value = "http://localhost:4444")]
        webdriver_url: String,
    },

    /// Browse stored jobs
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
enum TemplateCommands {
    /// Add a search template
    Add {
        /// Search keywords
        keywords: String,

        /// Comma-separated list of locations
        locations: String,

        /// Search radius in km (0, 8, 16, 40, 80 or 160)
        #[arg(short, long)]
        distance: Option<u32>,

        /// Recency filter: "past month", "past week" or "past 24 hours"
        #[arg(long)]
        date_posted: Option<String>,

        /// Comma-separated experience levels (internship, entry level,
        /// associate, mid-senior level, director, executive)
        #[arg(long)]
        exp_level: Option<String>,

        /// Comma-separated job types (full-time, part-time, contract,
        /// temporary, other, internship)
        #[arg(long)]
        job_type: Option<String>,

        /// Result pages to walk per location
        #[arg(short, long, default_value_t = 1)]
        pages: u32,
    },

    /// List saved templates
    List,

    /// Show template details
    Show {
        /// Template ID
        id: i64,
    },

    /// Delete a template
    Delete {
        /// Template ID
        id: i64,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Set the CV text from a file
    Cv {
        /// Path to a plain-text CV
        file: PathBuf,
    },

    /// Set the preference statement from a file
    Prefs {
        /// Path to a plain-text preference statement
        file: PathBuf,
    },

    /// Show the stored profile
    Show,
}

#[derive(Subcommand)]
enum JobCommands {
    /// List stored jobs, best matches first
    List {
        /// Only jobs from this search run
        #[arg(short, long)]
        run: Option<i64>,

        /// Only jobs with at least this overall score
        #[arg(long)]
        min_score: Option<f64>,
    },

    /// Show job details including the full score breakdown
    Show {
        /// Job ID
        id: i64,
    },
}

fn main() -> Result<()> {
    logger::init();
    let cli = Cli::parse();
    let db = Database::open()?;

    match cli.command {
        Commands::Init => {
            db.init()?;
            println!("Database initialized at {}", db.path().display());
        }

        Commands::Template { command } => {
            db.ensure_initialized()?;
            match command {
                TemplateCommands::Add {
                    keywords,
                    locations,
                    distance,
                    date_posted,
                    exp_level,
                    job_type,
                    pages,
                } => {
                    let candidate = SearchTemplate {
                        id: 0,
                        keywords: keywords.clone(),
                        locations: locations.clone(),
                        distance_km: distance,
                        date_posted: date_posted.clone(),
                        exp_level: exp_level.clone(),
                        job_type: job_type.clone(),
                        pages,
                        is_template: true,
                        last_run: None,
                        created_at: String::new(),
                    };
                    scraper::validate(&candidate)?;

                    let id = db.add_template(
                        &keywords,
                        &locations,
                        distance,
                        date_posted.as_deref(),
                        exp_level.as_deref(),
                        job_type.as_deref(),
                        pages,
                    )?;
                    println!("Added search template #{id}");
                }

                TemplateCommands::List => {
                    let templates = db.list_templates()?;
                    if templates.is_empty() {
                        println!("No search templates found.");
                    } else {
                        println!(
                            "{:<6} {:<25} {:<25} {:>6} {:<20}",
                            "ID", "KEYWORDS", "LOCATIONS", "PAGES", "LAST RUN"
                        );
                        println!("{}", "-".repeat(86));
                        for t in templates {
                            println!(
                                "{:<6} {:<25} {:<25} {:>6} {:<20}",
                                t.id,
                                truncate(&t.keywords, 23),
                                truncate(&t.locations, 23),
                                t.pages,
                                t.last_run.as_deref().unwrap_or("-")
                            );
                        }
                    }
                }

                TemplateCommands::Show { id } => match db.get_template(id)? {
                    Some(t) => {
                        println!("Template #{}", t.id);
                        println!("Keywords: {}", t.keywords);
                        println!("Locations: {}", t.locations);
                        if let Some(km) = t.distance_km {
                            println!("Distance: {km} km");
                        }
                        if let Some(date) = &t.date_posted {
                            println!("Date posted: {date}");
                        }
                        if let Some(exp) = &t.exp_level {
                            println!("Experience: {exp}");
                        }
                        if let Some(job_type) = &t.job_type {
                            println!("Job types: {job_type}");
                        }
                        println!("Pages: {}", t.pages);
                        if let Some(last_run) = &t.last_run {
                            println!("Last run: {last_run}");
                        }
                        println!("Created: {}", t.created_at);
                    }
                    None => {
                        println!("Template #{id} not found.");
                    }
                },

                TemplateCommands::Delete { id } => {
                    if db.delete_template(id)? {
                        println!("Deleted template #{id}");
                    } else {
                        println!("Template #{id} not found.");
                    }
                }
            }
        }

        Commands::Profile { command } => {
            db.ensure_initialized()?;
            match command {
                ProfileCommands::Cv { file } => {
                    let text = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read CV file: {}", file.display()))?;
                    db.save_cv(&text)?;
                    println!("CV saved ({} characters)", text.len());
                }

                ProfileCommands::Prefs { file } => {
                    let text = std::fs::read_to_string(&file).with_context(|| {
                        format!("Failed to read preferences file: {}", file.display())
                    })?;
                    db.save_preferences(&text)?;
                    println!("Preferences saved ({} characters)", text.len());
                }

                ProfileCommands::Show => {
                    let profile = db.load_profile()?;
                    if profile.cv_text.trim().is_empty() {
                        println!("CV: (not set)");
                    } else {
                        println!("--- CV ---\n{}", profile.cv_text);
                    }
                    if profile.preferences_text.trim().is_empty() {
                        println!("Preferences: (not set)");
                    } else {
                        println!("\n--- Preferences ---\n{}", profile.preferences_text);
                    }
                    if profile.is_empty() {
                        println!(
                            "\nNote: with an incomplete profile, postings receive a default score of 80."
                        );
                    }
                }
            }
        }

        Commands::Run {
            template,
            pages,
            workers,
            capacity,
            scorer_url,
            model,
            webdriver_url,
        } => {
            db.ensure_initialized()?;
            let db_path = db.path().clone();

            let opts = RunOptions {
                template_id: template,
                pages,
                workers,
                capacity,
                scorer_url,
                model,
                webdriver_url,
            };

            let token = CancelToken::new();
            {
                let token = token.clone();
                std::thread::spawn(move || {
                    let mut line = String::new();
                    if std::io::stdin().read_line(&mut line).is_ok() {
                        token.cancel();
                    }
                });
            }

            println!("Starting run for template #{template}. Press Enter to stop early.");
            let outcome = pipeline::run(&db_path, &opts, &token, Arc::new(LogSink))?;
            println!("{outcome}");
        }

        Commands::Jobs { command } => {
            db.ensure_initialized()?;
            match command {
                JobCommands::List { run, min_score } => {
                    let jobs = db.list_jobs(run, min_score)?;
                    if jobs.is_empty() {
                        println!("No jobs found.");
                    } else {
                        println!(
                            "{:<6} {:>6} {:<30} {:<20} {:<18} {:>6}",
                            "ID", "SCORE", "TITLE", "COMPANY", "LOCATION", "RUN"
                        );
                        println!("{}", "-".repeat(92));
                        for job in jobs {
                            println!(
                                "{:<6} {:>6.1} {:<30} {:<20} {:<18} {:>6}",
                                job.id,
                                job.matching_score,
                                truncate(&job.title, 28),
                                truncate(&job.company, 18),
                                truncate(&job.location, 16),
                                job.search_run_id
                                    .map(|id| id.to_string())
                                    .unwrap_or_else(|| "-".to_string())
                            );
                        }
                    }
                }

                JobCommands::Show { id } => match db.get_job(id)? {
                    Some(job) => {
                        println!("Job #{}", job.id);
                        println!("Title: {}", job.title);
                        println!("Company: {}", job.company);
                        println!("Location: {}", job.location);
                        println!("Application link: {}", job.application_link);
                        println!("Overall score: {:.1}", job.matching_score);
                        if let Some(run_id) = job.search_run_id {
                            println!("Search run: #{run_id}");
                        }
                        println!("Scraped: {}", job.scraped_at);
                        if let Some(details) = &job.score_details {
                            match serde_json::from_str::<serde_json::Value>(details) {
                                Ok(value) => println!(
                                    "\n--- Score Breakdown ---\n{}",
                                    serde_json::to_string_pretty(&value)?
                                ),
                                Err(_) => println!("\n--- Score Breakdown ---\n{details}"),
                            }
                        }
                        println!("\n--- Description ---\n{}", job.description);
                    }
                    None => {
                        println!("Job #{id} not found.");
                    }
                },
            }
        }
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}...", &s[..max.saturating_sub(3)])
    }
}
