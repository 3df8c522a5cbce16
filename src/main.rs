use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use rank_tracker_lib::config::Settings;
use rank_tracker_lib::delay_manager::CancelToken;
use rank_tracker_lib::orchestrator::BatchOrchestrator;
use rank_tracker_lib::ranking_client::RankingClient;
use rank_tracker_lib::result_sink::StateFileSink;
use rank_tracker_lib::{input_loader, keyword_expander, logger, report, signal_handler};

#[derive(Parser, Debug)]
#[command(
    name = "rank_tracker",
    version,
    about = "Expand keyword templates and track where a domain ranks for them",
    after_help = "Examples:\n  \
    rank_tracker expand --templates templates.txt --niche niche.csv --locations cities.csv --output keywords.csv\n  \
    rank_tracker run --jobs keywords.csv --state state.json\n  \
    rank_tracker export --state state.json --output rankings.csv"
)]
struct Cli {
    /// TOML settings file. Missing file means built-in defaults.
    #[arg(long, global = true, env = "RANK_TRACKER_CONFIG", default_value = "rank_tracker.toml")]
    config: PathBuf,

    /// Overrides `[logging] level`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate the keyword table from templates, niche rows and locations
    Expand {
        #[arg(long)]
        templates: PathBuf,
        /// Two columns after the header: service, core_keyword
        #[arg(long)]
        niche: PathBuf,
        #[arg(long)]
        locations: PathBuf,
        #[arg(long, default_value = "{kw}")]
        niche_placeholder: String,
        #[arg(long, default_value = "{loc}")]
        location_placeholder: String,
        /// Only expand niche rows whose service contains this (case-insensitive)
        #[arg(long)]
        service: Option<String>,
        /// Drop repeated (service, core_keyword) rows before expanding
        #[arg(long)]
        dedupe: bool,
        #[arg(long)]
        output: PathBuf,
    },
    /// Submit, wait for and collect rankings for every unfinished job
    Run {
        #[arg(long)]
        jobs: PathBuf,
        #[arg(long)]
        state: PathBuf,
        #[command(flatten)]
        overrides: OrchestratorArgs,
    },
    /// Submit the next batch after the resume cursor, without waiting
    Submit {
        #[arg(long)]
        jobs: PathBuf,
        #[arg(long)]
        state: PathBuf,
        #[command(flatten)]
        overrides: OrchestratorArgs,
    },
    /// Poll every submitted task once
    Fetch {
        #[arg(long)]
        state: PathBuf,
        #[command(flatten)]
        overrides: OrchestratorArgs,
    },
    /// Write the recorded outcomes as CSV
    Export {
        #[arg(long)]
        state: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Add the provider's raw task payload as a last column
        #[arg(long)]
        raw: bool,
    },
    /// Validate settings and credentials without calling the provider
    Check,
}

/// Command line overrides for the `[provider]` and `[orchestrator]` settings.
#[derive(Args, Debug, Clone, Default)]
struct OrchestratorArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    dwell_secs: Option<u64>,
    #[arg(long)]
    retry_rounds: Option<u32>,
    #[arg(long)]
    retry_interval_secs: Option<u64>,
    #[arg(long, env = "RANK_TRACKER_TARGET_DOMAIN")]
    target_domain: Option<String>,
    /// Creating this file while a run is in progress stops it gracefully
    #[arg(long)]
    stop_file: Option<PathBuf>,
}

impl OrchestratorArgs {
    fn apply(&self, settings: &mut Settings) {
        let o = &mut settings.orchestrator;
        if self.limit.is_some() {
            o.limit = self.limit;
        }
        if let Some(v) = self.batch_size {
            o.batch_size = v;
        }
        if let Some(v) = self.dwell_secs {
            o.dwell_secs = v;
        }
        if let Some(v) = self.retry_rounds {
            o.retry_rounds = v;
        }
        if let Some(v) = self.retry_interval_secs {
            o.retry_interval_secs = v;
        }
        if let Some(v) = &self.target_domain {
            settings.provider.target_domain = v.clone();
        }
    }

    /// Cancelled by SIGINT/SIGTERM and, when `--stop-file` is given, by
    /// that file appearing.
    fn cancel_token(&self) -> CancelToken {
        let token = match &self.stop_file {
            Some(path) => {
                if path.exists() {
                    warn!("Stop file {:?} already exists, the run will stop at once", path);
                }
                info!("Create {:?} to stop the run after the current wait", path);
                CancelToken::with_stop_file(path)
            }
            None => CancelToken::new(),
        };
        if let Err(e) = signal_handler::install(token.clone()) {
            warn!("Could not install the signal handler, Ctrl+C will kill the run: {}", e);
        }
        token
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let mut settings = Settings::load(&cli.config)?;
    logger::init(cli.log_level.as_deref().unwrap_or(&settings.logging.level));
    info!("Starting rank_tracker {}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Expand {
            templates,
            niche,
            locations,
            niche_placeholder,
            location_placeholder,
            service,
            dedupe,
            output,
        } => {
            let templates = input_loader::load_list(&templates)?;
            let mut niche = input_loader::load_niche(&niche)?;
            if let Some(service) = &service {
                niche = keyword_expander::filter_service(niche, service);
                if niche.is_empty() {
                    return Err(format!("no niche rows match service {:?}", service).into());
                }
                info!("{} niche rows match service {:?}", niche.len(), service);
            }
            if dedupe {
                let before = niche.len();
                niche = keyword_expander::dedupe_niche(niche);
                info!("Dropped {} repeated niche rows", before - niche.len());
            }
            let locations = input_loader::load_locations(&locations)?;
            let names: Vec<&str> = locations.iter().map(|l| l.name.as_str()).collect();
            let keywords = keyword_expander::expand(
                &templates,
                &niche,
                &names,
                &niche_placeholder,
                &location_placeholder,
            )?;
            info!(
                "Generated {} keywords from {} templates, {} niche rows, {} locations",
                keywords.len(),
                templates.len(),
                niche.len(),
                names.len()
            );
            report::write_keywords_file(&output, &keywords, &locations)?;
        }
        Commands::Run { jobs, state, overrides } => {
            overrides.apply(&mut settings);
            let client = connect(&settings)?;
            let jobs = load_jobs(&jobs)?;
            let mut sink = StateFileSink::open(&state)?;
            let orchestrator = BatchOrchestrator::new(client, settings.orchestrator.clone())
                .with_cancel(overrides.cancel_token());
            let summary = orchestrator.run(&jobs, &mut sink)?;
            info!("Run finished. {}", summary);
            info!("State saved to {:?}", sink.path());
        }
        Commands::Submit { jobs, state, overrides } => {
            overrides.apply(&mut settings);
            let client = connect(&settings)?;
            let jobs = load_jobs(&jobs)?;
            let mut sink = StateFileSink::open(&state)?;
            let orchestrator = BatchOrchestrator::new(client, settings.orchestrator.clone())
                .with_cancel(overrides.cancel_token());
            let report = orchestrator.submit_phase(&jobs, &mut sink)?;
            info!(
                "Submitted {} tasks. {}. Next position {}, more to submit: {}",
                report.submitted, report.summary, report.next_cursor, report.has_more
            );
        }
        Commands::Fetch { state, overrides } => {
            overrides.apply(&mut settings);
            let client = connect(&settings)?;
            let mut sink = StateFileSink::open(&state)?;
            let orchestrator = BatchOrchestrator::new(client, settings.orchestrator.clone())
                .with_cancel(overrides.cancel_token());
            let report = orchestrator.fetch_phase(&mut sink)?;
            info!("{}. Still pending: {}", report.summary, report.still_pending);
        }
        Commands::Export { state, output, raw } => {
            if !state.exists() {
                error!("State file {:?} does not exist, nothing to export", state);
                return Err(format!("state file {:?} not found", state).into());
            }
            let sink = StateFileSink::open(&state)?;
            let n = report::write_outcomes_file(&output, sink.state().outcomes.values(), raw)?;
            if n == 0 {
                warn!("State file {:?} holds no outcomes yet", state);
            }
        }
        Commands::Check => {
            let client = connect(&settings)?;
            info!("Target domain: {}", settings.provider.target_domain);
            info!("Submit endpoint: {}", client.task_post_url());
            info!("Fetch endpoint: {}", client.task_get_url("{task_id}")?);
            info!(
                "Batches of {}, dwell {}s, {} retry rounds every {}s",
                settings.orchestrator.batch_size,
                settings.orchestrator.dwell_secs,
                settings.orchestrator.retry_rounds,
                settings.orchestrator.retry_interval_secs
            );
            info!("Configuration OK");
        }
    }
    Ok(())
}

/// Validates settings and reads the token before anything touches the network.
fn connect(settings: &Settings) -> Result<RankingClient, Box<dyn Error>> {
    settings.validate()?;
    let token = settings.auth_token()?;
    Ok(RankingClient::new(settings.provider.clone(), &token)?)
}

fn load_jobs(path: &Path) -> Result<Vec<rank_tracker_lib::model::KeywordJob>, Box<dyn Error>> {
    let jobs = input_loader::load_jobs(path)?;
    if jobs.is_empty() {
        return Err(format!("no usable jobs in {:?}", path).into());
    }
    Ok(jobs)
}
