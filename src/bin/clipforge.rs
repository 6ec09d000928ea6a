use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use clipforge::{
    AudioContainer, Config, EditDescriptor, ErrorReport, ExportPipeline, ExportProfile,
    OperationHandle, OperationState, Outcome, PathResolver, ProcessRunner, SourceReference,
    Toolchain,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let report = ErrorReport::from(&e);
            eprintln!("error [{}]: {}", report.code, report.message);
            if let Some(log) = &report.log_path {
                eprintln!("session log: {}", log.display());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> clipforge::Result<()> {
    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(root) = cli.root {
        config.data_root = root;
    }

    match cli.command {
        Commands::Repair => run_repair(&config),
        Commands::Doctor => run_doctor(&config).await,
        Commands::Download { url, playlist } => {
            config.download.allow_playlist = playlist;
            run_acquire(config, SourceReference::parse(&url)?).await
        }
        Commands::Import { file } => run_acquire(config, SourceReference::Local(file)).await,
        Commands::Export {
            file,
            profile,
            trim_start,
            trim_end,
            volume,
            fade_in,
            fade_out,
            dest,
        } => {
            let edits = EditDescriptor::build(trim_start, trim_end, volume, fade_in, fade_out, None)?;
            let dest = dest.unwrap_or_else(|| config.data_root.clone());
            run_export(config, &file, edits, profile.into(), &dest).await
        }
    }
}

fn run_repair(config: &Config) -> clipforge::Result<()> {
    let report = PathResolver::new(&config.data_root).repair_layout()?;
    if report.created.is_empty() {
        println!("layout ok: {}", config.data_root.display());
    }
    for dir in report.created {
        println!("created {}", dir.display());
    }
    Ok(())
}

async fn run_doctor(config: &Config) -> clipforge::Result<()> {
    run_repair(config)?;
    let tools = Toolchain::locate(config)?;
    let versions = tools
        .probe_versions(&ProcessRunner::new(&config.process))
        .await?;
    println!("downloader: {} ({})", tools.downloader.display(), versions.downloader);
    println!("transcoder: {} ({})", tools.transcoder.display(), versions.transcoder);
    Ok(())
}

async fn run_acquire(config: Config, source: SourceReference) -> clipforge::Result<()> {
    tracing::info!(%source, root = ?config.data_root, "acquiring");
    let tools = Toolchain::locate(&config)?;
    let manager = clipforge::AcquisitionManager::new(config, tools)?;

    let handle = manager.start(source)?;
    if let Some(file) = drive(handle).await? {
        println!("{}", file.file_path.display());
    }
    Ok(())
}

async fn run_export(
    config: Config,
    file: &Path,
    edits: EditDescriptor,
    profile: ExportProfile,
    dest: &Path,
) -> clipforge::Result<()> {
    tracing::info!(?file, tag = %profile.tag(), "exporting");
    let tools = Toolchain::locate(&config)?;
    let pipeline = ExportPipeline::new(config, tools)?;

    let handle = pipeline.export(file, edits, profile, dest)?;
    if let Some(exported) = drive(handle).await? {
        println!("{}", exported.file_path.display());
    }
    Ok(())
}

/// Follow an operation to its end; Ctrl-C cancels it
async fn drive<S: OperationState, T: Send + 'static>(
    mut handle: OperationHandle<S, T>,
) -> clipforge::Result<Option<T>> {
    tracing::info!(session_id = %handle.id(), log = ?handle.log_path(), "operation started");
    loop {
        tokio::select! {
            state = handle.changed() => match state {
                Some(state) => tracing::info!(?state, "state changed"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cancelling");
                handle.cancel();
            }
        }
    }

    match handle.wait().await? {
        Outcome::Completed(value) => Ok(Some(value)),
        Outcome::Cancelled => {
            eprintln!("cancelled");
            Ok(None)
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio acquisition and export core", long_about = None)]
struct Cli {
    /// JSON configuration file; missing fields take their defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Data root overriding the configured one.
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recreate missing data-root directories.
    Repair,
    /// Check the layout and report the external tools and their versions.
    Doctor,
    /// Download the best audio stream of a URL.
    Download {
        /// Media page URL.
        url: String,
        /// Allow playlist expansion.
        #[arg(long)]
        playlist: bool,
    },
    /// Import a local audio file into the downloads folder.
    Import {
        /// Audio file to import.
        file: PathBuf,
    },
    /// Render an edited clip.
    Export {
        /// Source audio file.
        file: PathBuf,
        /// Output profile.
        #[arg(short, long, value_enum, default_value_t = ProfileArg::M4a)]
        profile: ProfileArg,
        /// Trim start in seconds.
        #[arg(long, default_value_t = 0.0)]
        trim_start: f64,
        /// Trim end in seconds.
        #[arg(long)]
        trim_end: f64,
        /// Linear gain, 0.0 to 2.0.
        #[arg(long, default_value_t = 1.0)]
        volume: f64,
        /// Fade-in length in seconds.
        #[arg(long, default_value_t = 0.0)]
        fade_in: f64,
        /// Fade-out length in seconds.
        #[arg(long, default_value_t = 0.0)]
        fade_out: f64,
        /// Destination root (defaults to the data root).
        #[arg(long)]
        dest: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileArg {
    M4a,
    Wav,
    Video,
}

impl From<ProfileArg> for ExportProfile {
    fn from(arg: ProfileArg) -> Self {
        match arg {
            ProfileArg::M4a => ExportProfile::Audio(AudioContainer::M4a),
            ProfileArg::Wav => ExportProfile::Audio(AudioContainer::Wav),
            ProfileArg::Video => ExportProfile::BlackScreenVideo,
        }
    }
}
