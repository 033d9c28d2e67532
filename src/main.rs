use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

use research_discovery::workflow::model::{ExperienceLevel, PaperUpload, ProfileRequest};
use research_discovery::{
    DiscoveryConfig, Error, HttpResearchApi, REQUIRED_SELECTION, Transition, WorkflowController,
    WorkflowSession, WorkflowStep,
};

type Input = Lines<BufReader<Stdin>>;

/// Counts deep research runs so a session that comes back to the selected
/// ideas, after a failure, a timeout or Ctrl-C, is only resubmitted when
/// the user asks for it.
#[derive(Debug, Default)]
struct DeepResearchGate {
    attempts: u32,
}

impl DeepResearchGate {
    fn needs_confirmation(&self, session: &WorkflowSession) -> bool {
        self.attempts > 0 || session.last_error.is_some()
    }

    fn record_attempt(&mut self) {
        self.attempts += 1;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DiscoveryConfig::from_env().context("invalid configuration")?;

    eprintln!("🔬 Research Discovery v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: {}", config.api_base_url);
    eprintln!(
        "   Deep research timeout: {}s (poll every {}s)",
        config.poll.timeout.as_secs(),
        config.poll.poll_interval.as_secs()
    );
    eprintln!("   Ctrl-C cancels the running step.\n");

    let api = Arc::new(HttpResearchApi::new(&config)?);
    let controller = Arc::new(WorkflowController::new(api, &config));

    // Job progress while deep research runs.
    let mut snapshots = controller.snapshots();
    tokio::spawn(async move {
        let mut last = None;
        while let Some(session) = snapshots.next().await {
            if let Some(job) = session.job.as_ref() {
                let seen = (job.status, job.progress);
                if last != Some(seen) {
                    match job.progress {
                        Some(p) => eprintln!("   … {} job {}: {} ({p}%)", job.kind, job.id, job.status),
                        None => eprintln!("   … {} job {}: {}", job.kind, job.id, job.status),
                    }
                    last = Some(seen);
                }
            }
        }
    });

    {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                let session = controller.cancel();
                eprintln!("\n   Cancelled; back at {}", session.step);
            }
        });
    }

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    run(&controller, &mut input).await
}

async fn run(controller: &WorkflowController, input: &mut Input) -> anyhow::Result<()> {
    let mut gate = DeepResearchGate::default();
    loop {
        let session = controller.snapshot();
        match session.step {
            WorkflowStep::Idle => {
                let request = ask_profile(input).await?;
                report(controller.submit_profile(request).await)?;
            }
            WorkflowStep::ProfileReady => {
                if let Some(profile) = session.profile.as_ref() {
                    eprintln!(
                        "Profile {} ({}): {}",
                        profile.user_id,
                        profile.experience_level,
                        profile.research_areas.iter().cloned().collect::<Vec<_>>().join(", ")
                    );
                }
                let path = PathBuf::from(prompt(input, "Path to paper (PDF)").await?);
                let upload = match PaperUpload::from_path(&path).await {
                    Ok(upload) => upload,
                    Err(e) => {
                        eprintln!("   Cannot read {}: {e}", path.display());
                        continue;
                    }
                };
                report(controller.upload_paper(upload).await)?;
            }
            WorkflowStep::PaperUploaded => {
                if let Some(paper) = session.paper.as_ref() {
                    eprintln!("Detected topics: {}", paper.detected_topics.join(", "));
                }
                let extra = prompt(input, "Extra topics, comma separated (blank for none)").await?;
                let manual: Vec<String> = extra
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect();
                report(controller.set_manual_topics(manual))?;
                report(controller.request_quick_read().await)?;
            }
            WorkflowStep::QuickReadReady => {
                if let Some(qr) = session.quick_read.as_ref() {
                    eprintln!("\n{}\n", qr.summary);
                }
                for idea in session.ideas() {
                    let mark = if idea.selected { "x" } else { " " };
                    eprintln!("  [{mark}] {}. {}", idea.index, idea.title);
                }
                let line = prompt(
                    input,
                    &format!("Toggle idea numbers, or 'ok' once {REQUIRED_SELECTION} are picked"),
                )
                .await?;
                if line.eq_ignore_ascii_case("ok") {
                    report(controller.confirm_selection())?;
                    continue;
                }
                for token in line.split([',', ' ']).filter(|t| !t.is_empty()) {
                    match token.parse::<usize>() {
                        Ok(index) => report(controller.toggle_idea(index))?,
                        Err(_) => eprintln!("   Not an idea number: {token}"),
                    }
                }
            }
            WorkflowStep::IdeasSelected => {
                if gate.needs_confirmation(&session) {
                    if let Some(failure) = session.last_error.as_ref() {
                        eprintln!("   Last attempt failed: {}", failure.message);
                    }
                    let again = prompt(input, "Run deep research again? [y/N]").await?;
                    if !again.eq_ignore_ascii_case("y") {
                        return Ok(());
                    }
                }
                gate.record_attempt();
                eprintln!("Running deep research, this can take several minutes…");
                report(controller.run_deep_research().await)?;
            }
            WorkflowStep::DeepResearchRunning => {
                // Another task owns the run; wait for it to settle.
                let mut rx = controller.subscribe();
                rx.changed().await?;
            }
            WorkflowStep::FinalReady => {
                if let Some(result) = session.final_result.as_ref() {
                    println!("{}", result.to_markdown());
                }
                return Ok(());
            }
        }
    }
}

/// Print a step failure and keep going; only configuration mistakes abort.
fn report(outcome: Result<Transition, Error>) -> anyhow::Result<()> {
    match outcome {
        Ok(Transition::Applied(session)) => {
            tracing::debug!(step = %session.step, revision = session.revision, "Advanced");
        }
        Ok(Transition::InFlight(stage)) => eprintln!("   {stage} is still running"),
        Ok(Transition::Discarded) => eprintln!("   Result arrived after cancellation, ignored"),
        Err(Error::Config(e)) => bail!(e),
        Err(e) if e.is_local() => eprintln!("   {e}"),
        Err(e) => eprintln!("   Step failed: {e}"),
    }
    Ok(())
}

async fn ask_profile(input: &mut Input) -> anyhow::Result<ProfileRequest> {
    let method = prompt(input, "Profile from (m)anual description or (s)cholar URL?").await?;
    if method.starts_with(['s', 'S']) {
        let url = prompt(input, "Google Scholar profile URL").await?;
        return Ok(ProfileRequest::scholar(url));
    }
    let description = prompt(input, "Describe your research background").await?;
    let level = loop {
        let raw = prompt(input, "Experience level (beginner/intermediate/advanced)").await?;
        match raw.parse::<ExperienceLevel>() {
            Ok(level) => break level,
            Err(e) => eprintln!("   {e}"),
        }
    };
    Ok(ProfileRequest::manual(description, level))
}

async fn prompt(input: &mut Input, question: &str) -> anyhow::Result<String> {
    eprint!("{question}: ");
    match input.next_line().await? {
        Some(line) => Ok(line.trim().to_string()),
        None => bail!("input closed"),
    }
}
