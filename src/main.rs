use anyhow::{anyhow, bail, Context, Result};
use chrono::TimeDelta;
use clap::{Parser, Subcommand};
use scout::acquisition::{Acquisition, CandidateFilter, SearchLimits};
use scout::config::Config;
use scout::gateway::{CallbackPayload, Destination, DispatchState, JobData, WebhookGateway};
use scout::models::{Candidate, CandidateQuery, SearchParams, StatusPatch, WebhookTool};
use scout::{Pipeline, RateLimitedTransport, Store};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "scout")]
#[command(about = "Candidate sourcing - search a job portal, track candidates, trigger screening calls")]
struct Cli {
    /// Database file (defaults to SCOUT_DB_PATH or the user data directory)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Run a portal search and store the candidates found
    Search {
        /// Job role or keyword (e.g. "python developer")
        keyword: String,

        /// Location to search in
        #[arg(short, long)]
        location: String,

        /// Minimum years of experience
        #[arg(long)]
        exp_min: Option<f64>,

        /// Maximum years of experience
        #[arg(long)]
        exp_max: Option<f64>,

        /// Job type (full-time, contract, ...)
        #[arg(long)]
        job_type: Option<String>,

        /// Maximum pages to fetch
        #[arg(short, long, default_value = "1")]
        pages: u32,

        /// Maximum candidates to keep
        #[arg(short, long, default_value = "100")]
        max_results: usize,

        /// Only keep candidates in these locations (comma separated)
        #[arg(long, value_delimiter = ',')]
        only_locations: Vec<String>,

        /// Only keep candidates from these companies (comma separated)
        #[arg(long, value_delimiter = ',')]
        only_companies: Vec<String>,
    },

    /// List searches, or candidates of one search or matching criteria
    List {
        /// Search ID
        search_id: Option<i64>,

        /// Only candidates not yet contacted
        #[arg(long)]
        uncontacted: bool,

        /// Only candidates with all of these skills (comma separated)
        #[arg(long, value_delimiter = ',')]
        skills: Vec<String>,

        /// Only candidates whose location contains this text
        #[arg(long)]
        location: Option<String>,

        /// Minimum years of experience
        #[arg(long)]
        min_exp: Option<f64>,
    },

    /// Show candidate details
    Show {
        /// Candidate ID
        id: i64,
    },

    /// Update a candidate's status
    Status {
        /// Candidate ID
        id: i64,

        #[arg(long)]
        contacted: Option<bool>,

        #[arg(long)]
        interested: Option<bool>,

        #[arg(long)]
        interview: Option<bool>,

        #[arg(short, long)]
        comments: Option<String>,

        /// Allow clearing contacted / interview flags
        #[arg(long)]
        force: bool,
    },

    /// Show statistics for a search
    Stats {
        /// Search ID
        search_id: i64,
    },

    /// Show call history for a candidate
    Calls {
        /// Candidate ID
        candidate_id: i64,
    },

    /// Send uncontacted candidates of a search to a call-automation webhook
    Dispatch {
        /// Search ID
        search_id: i64,

        /// Automation tool (n8n, make, custom)
        #[arg(short, long, default_value = "n8n")]
        tool: String,

        /// Webhook URL (required for custom, overrides configured URLs)
        #[arg(short, long)]
        url: Option<String>,

        /// Role mentioned in the call script
        #[arg(long)]
        job_role: String,

        #[arg(long)]
        company_name: Option<String>,

        /// Job location mentioned in the call script
        #[arg(long)]
        job_location: Option<String>,

        /// Only candidates already marked interested
        #[arg(long)]
        interested_only: bool,

        /// Call script template file
        #[arg(long)]
        script: Option<PathBuf>,
    },

    /// Apply a callback payload (JSON file, or - for stdin)
    Callback {
        file: String,
    },

    /// Fail pending calls older than the given age
    Expire {
        /// Age in minutes
        #[arg(short, long, default_value = "60")]
        minutes: i64,
    },

    /// Permanently delete a candidate and their call history
    Erase {
        /// Candidate ID
        id: i64,

        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,scout=debug".into()))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let db_path = cli.db.or_else(|| config.db_path.clone()).unwrap_or_else(Store::default_path);
    let store = Store::open(&db_path).with_context(|| format!("Failed to open database {}", db_path.display()))?;

    if let Commands::Init = cli.command {
        store.init()?;
        println!("Database initialized at {}", db_path.display());
        return Ok(());
    }
    store.ensure_initialized()?;

    let transport = RateLimitedTransport::new(config.transport.clone())?;

    match cli.command {
        Commands::Init => {}

        Commands::Search {
            keyword,
            location,
            exp_min,
            exp_max,
            job_type,
            pages,
            max_results,
            only_locations,
            only_companies,
        } => {
            let portal = config
                .portal
                .clone()
                .ok_or_else(|| anyhow!("SCOUT_PORTAL_URL is not set"))?;
            let acquisition = Acquisition::new(portal, transport)?;

            let mut params = SearchParams::new(keyword, location).with_experience(exp_min, exp_max);
            if let Some(job_type) = job_type {
                params = params.with_job_type(job_type);
            }
            let filter = CandidateFilter::default()
                .with_locations(only_locations)
                .with_companies(only_companies);
            let limits = SearchLimits {
                max_pages: pages,
                max_results,
            };

            println!("Searching for '{}' in {}...", params.keyword, params.location);
            let report = Pipeline::new(&acquisition, &store).run_search(&params, limits, filter)?;

            println!("\nSearch #{}", report.search.id);
            println!("  Pages fetched: {}", report.pages);
            println!("  New:           {}", report.inserted);
            println!("  Merged:        {}", report.deduped);
            if report.skipped > 0 {
                println!("  Skipped:       {}", report.skipped);
            }
            if report.filtered > 0 {
                println!("  Filtered:      {}", report.filtered);
            }
            if let Some(err) = &report.error {
                println!("\nStopped early: {}", err);
            }
        }

        Commands::List {
            search_id,
            uncontacted,
            skills,
            location,
            min_exp,
        } => {
            let query = CandidateQuery {
                search_id,
                skills,
                location,
                min_experience: min_exp,
            };
            if !query.is_empty() {
                let mut candidates = store.search_candidates(&query)?;
                if uncontacted {
                    candidates.retain(|c| !c.status.contacted);
                }
                print_candidates(&candidates);
                return Ok(());
            }

            let searches = store.list_searches(50)?;
            if searches.is_empty() {
                println!("No searches found.");
            } else {
                println!("{:<6} {:<25} {:<15} {:<10} {:<8} {:<20}", "ID", "KEYWORD", "LOCATION", "EXP", "STATE", "CREATED");
                println!("{}", "-".repeat(89));
                for search in searches {
                    let exp = match (search.experience_min, search.experience_max) {
                        (Some(min), Some(max)) => format!("{}-{}", min, max),
                        (Some(min), None) => format!("{}+", min),
                        (None, Some(max)) => format!("<{}", max),
                        (None, None) => "-".to_string(),
                    };
                    println!(
                        "{:<6} {:<25} {:<15} {:<10} {:<8} {:<20}",
                        search.id,
                        truncate(&search.keyword, 23),
                        truncate(&search.location, 13),
                        exp,
                        if search.closed { "closed" } else { "open" },
                        truncate(&search.created_at, 19)
                    );
                }
            }
        }

        Commands::Show { id } => match store.get_candidate(id)? {
            Some(candidate) => {
                let profile = &candidate.profile;
                println!("Candidate #{} (search #{})", candidate.id, candidate.search_id);
                println!("Name: {}", profile.name);
                for (label, value) in [
                    ("Email", &profile.email),
                    ("Phone", &profile.phone),
                    ("Company", &profile.current_company),
                    ("Designation", &profile.current_designation),
                    ("Location", &profile.location),
                    ("Salary", &profile.salary),
                    ("Posted", &profile.posted_date),
                    ("Profile", &profile.profile_url),
                ] {
                    if let Some(value) = value {
                        println!("{}: {}", label, value);
                    }
                }
                if let Some(years) = profile.experience_years {
                    println!("Experience: {} years", years);
                }
                if !profile.skills.is_empty() {
                    let skills: Vec<&str> = profile.skills.iter().map(String::as_str).collect();
                    println!("Skills: {}", skills.join(", "));
                }
                println!("\nContacted: {}", yes_no(candidate.status.contacted));
                println!(
                    "Interested: {}",
                    candidate.status.interested.map(yes_no).unwrap_or("unknown")
                );
                println!("Interview scheduled: {}", yes_no(candidate.status.interview_scheduled));
                if let Some(comments) = &candidate.status.comments {
                    println!("Comments:\n{}", textwrap::indent(&textwrap::fill(comments, 76), "  "));
                }
                println!("Updated: {}", candidate.status.last_updated);
            }
            None => {
                println!("Candidate #{} not found.", id);
            }
        },

        Commands::Status {
            id,
            contacted,
            interested,
            interview,
            comments,
            force,
        } => {
            let patch = StatusPatch {
                contacted,
                interested,
                interview_scheduled: interview,
                comments,
                override_clear: force,
            };
            if patch.is_empty() {
                bail!("Nothing to update. Use --contacted, --interested, --interview or --comments");
            }
            let candidate = store.update_status(id, &patch)?;
            println!("Updated candidate #{} ({}).", candidate.id, candidate.profile.name);
        }

        Commands::Stats { search_id } => {
            let search = store
                .get_search(search_id)?
                .ok_or_else(|| anyhow!("Search #{} not found", search_id))?;
            let stats = store.statistics(search_id)?;
            println!("Search #{}: {} in {}", search.id, search.keyword, search.location);
            println!("  Total candidates:    {}", stats.total);
            println!("  Contacted:           {}", stats.contacted);
            println!("  Interested:          {}", stats.interested);
            println!("  Interviews:          {}", stats.interview_scheduled);
        }

        Commands::Calls { candidate_id } => {
            let calls = store.call_logs(candidate_id)?;
            if calls.is_empty() {
                println!("No calls found for candidate #{}.", candidate_id);
            } else {
                println!("{:<6} {:<8} {:<11} {:<28} {:<28}", "ID", "TOOL", "STATE", "DISPATCHED", "RESOLVED");
                println!("{}", "-".repeat(85));
                for call in &calls {
                    println!(
                        "{:<6} {:<8} {:<11} {:<28} {:<28}",
                        call.id,
                        call.tool,
                        DispatchState::of(call).as_str(),
                        truncate(&call.dispatched_at, 27),
                        truncate(&call.resolved_at.clone().unwrap_or_else(|| "-".to_string()), 27)
                    );
                }
                if let Some(latest) = calls.first() {
                    println!("\nLatest script:\n{}", textwrap::indent(&textwrap::fill(&latest.script, 76), "  "));
                    if let Some(response) = &latest.response {
                        println!("Response:\n{}", textwrap::indent(&textwrap::fill(response, 76), "  "));
                    }
                }
            }
        }

        Commands::Dispatch {
            search_id,
            tool,
            url,
            job_role,
            company_name,
            job_location,
            interested_only,
            script,
        } => {
            let tool: WebhookTool = tool.parse()?;
            let mut gateway_config = config.gateway.clone();
            if let Some(path) = script {
                gateway_config.call_script = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read script file: {}", path.display()))?;
            }
            let destination = Destination::for_tool(tool, &gateway_config, url.as_deref())?;

            let ids = store.candidates_for_calling(search_id, false, interested_only)?;
            if ids.is_empty() {
                println!("No candidates to call.");
                return Ok(());
            }
            let gateway = WebhookGateway::new(Arc::new(store), transport, gateway_config);

            let mut job = JobData::new();
            job.insert("job_role".into(), job_role);
            if let Some(company) = company_name {
                job.insert("company_name".into(), company);
            }
            if let Some(location) = job_location {
                job.insert("location".into(), location);
            }

            println!("Dispatching {} candidate(s) to {}...", ids.len(), tool);
            let reports = gateway.dispatch_many(&ids, &job, &destination);
            println!("{:<6} {:<11} {:<38} {:<30}", "ID", "STATE", "TOKEN", "ERROR");
            println!("{}", "-".repeat(88));
            let mut sent = 0;
            for report in &reports {
                if report.state == DispatchState::Dispatched {
                    sent += 1;
                }
                println!(
                    "{:<6} {:<11} {:<38} {:<30}",
                    report.candidate_id,
                    report.state.as_str(),
                    report
                        .call_log
                        .as_ref()
                        .map(|log| log.correlation_token.clone())
                        .unwrap_or_else(|| "-".to_string()),
                    truncate(&report.error.as_ref().map(|e| e.to_string()).unwrap_or_default(), 30)
                );
            }
            println!("\n{} of {} dispatched.", sent, reports.len());
        }

        Commands::Callback { file } => {
            let raw = if file == "-" {
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                std::fs::read_to_string(&file).with_context(|| format!("Failed to read callback file: {}", file))?
            };
            let payload: CallbackPayload = serde_json::from_str(&raw).context("Invalid callback payload")?;
            let gateway = WebhookGateway::new(Arc::new(store), transport, config.gateway.clone());
            let log = gateway.receive_callback(&payload)?;
            println!("Call #{} for candidate #{} is {}.", log.id, log.candidate_id, log.status.as_str());
        }

        Commands::Expire { minutes } => {
            let expired = store.expire_pending(expiry_age(minutes)?)?;
            println!("Timed out {} pending call(s).", expired);
        }

        Commands::Erase { id, yes } => {
            if !yes {
                bail!("Refusing to erase candidate #{} without --yes", id);
            }
            if store.erase_candidate(id)? {
                println!("Erased candidate #{} and their call history.", id);
            } else {
                println!("Candidate #{} not found.", id);
            }
        }
    }

    Ok(())
}

fn print_candidates(candidates: &[Candidate]) {
    if candidates.is_empty() {
        println!("No candidates found.");
        return;
    }
    println!("{:<6} {:<22} {:<26} {:>5} {:<18} {:<10}", "ID", "NAME", "EMAIL", "EXP", "COMPANY", "STATUS");
    println!("{}", "-".repeat(92));
    for candidate in candidates {
        let status = match (candidate.status.contacted, candidate.status.interested) {
            (_, Some(true)) if candidate.status.interview_scheduled => "interview",
            (_, Some(true)) => "interested",
            (_, Some(false)) => "declined",
            (true, None) => "contacted",
            (false, None) => "new",
        };
        println!(
            "{:<6} {:<22} {:<26} {:>5} {:<18} {:<10}",
            candidate.id,
            truncate(&candidate.profile.name, 20),
            truncate(&candidate.profile.email.clone().unwrap_or_default(), 24),
            candidate
                .profile
                .experience_years
                .map(|y| format!("{:.1}", y))
                .unwrap_or_else(|| "-".to_string()),
            truncate(&candidate.profile.current_company.clone().unwrap_or_default(), 16),
            status
        );
    }
}

fn expiry_age(minutes: i64) -> Result<TimeDelta> {
    TimeDelta::try_minutes(minutes).ok_or_else(|| anyhow!("--minutes {} is out of range", minutes))
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
