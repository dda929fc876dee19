use std::{
    path::{Path, PathBuf},
    thread,
};

use clap::{Parser, Subcommand};
use metronome_core::{
    AudioOutputContext, Metronome, MetronomeConfig, MetronomeError, SpinStrategy, TimeSignature,
    ToneAnalyser, ToneSelector,
};
use tracing_subscriber::EnvFilter;

fn main() -> metronome_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_metronome(args),
        Commands::Inspect { tone, config } => run_inspect(&tone, config.as_deref()),
        Commands::InitConfig { path, force } => run_init_config(&path, force),
    }
}

fn run_metronome(args: RunArgs) -> metronome_core::Result<()> {
    let config = args.resolve()?;
    tracing::info!(
        bpm = config.bpm,
        time_signature = %config.time_signature,
        sound = config.sound,
        "starting metronome"
    );

    let ctx = if config.sound {
        AudioOutputContext::cpal(config.audio)
    } else {
        AudioOutputContext::silent(config.audio)
    };
    let mut metronome = Metronome::from_config(&config, &ctx)?;

    let events = metronome.events();
    let printer = thread::spawn(move || {
        for event in events.iter() {
            let marker = if event.accent { "TICK" } else { "tock" };
            println!("{marker} {}.{}", event.bar, event.ordinal);
            tracing::debug!(
                lateness_micros = event.tick.lateness_micros,
                budget_micros = event.tick.budget_micros,
                "beat"
            );
        }
    });

    metronome.start()?;
    // Without a bar count this runs until the process is interrupted.
    metronome.wait()?;
    drop(metronome);

    printer
        .join()
        .map_err(|_| MetronomeError::msg("beat printer panicked"))
}

fn run_inspect(tone: &ToneSelector, config: Option<&Path>) -> metronome_core::Result<()> {
    let audio = match config {
        Some(path) => MetronomeConfig::load(path)?.audio,
        None => MetronomeConfig::default().audio,
    };
    tracing::info!(%tone, "inspecting tone");

    let mut stream = tone.open(audio.pcm_format())?;
    let analysis = ToneAnalyser::new().analyse(stream.as_mut())?;

    println!("tone:            {tone}");
    println!("format:          {} Hz, {} ch", analysis.sample_rate, analysis.channels);
    println!("duration:        {:.3} s", analysis.duration_seconds);
    println!("peak / rms:      {:.3} / {:.3}", analysis.peak, analysis.rms);
    match analysis.dominant_hz {
        Some(hz) => println!("dominant pitch:  {hz:.1} Hz"),
        None => println!("dominant pitch:  none (silent)"),
    }
    println!(
        "audible:         {:.3} s ({:.1}%)",
        analysis.active_seconds,
        analysis.active_fraction * 100.0
    );
    println!(
        "trim:            {}% configured, {}% suggested",
        audio.trim_percent,
        analysis.suggested_trim_percent()
    );
    Ok(())
}

fn run_init_config(path: &Path, force: bool) -> metronome_core::Result<()> {
    if path.exists() && !force {
        return Err(MetronomeError::msg(format!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        )));
    }

    MetronomeConfig::default().save(path)?;
    tracing::info!(?path, "wrote default configuration");
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drift-corrected metronome", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the metronome.
    Run(RunArgs),
    /// Decode a tone and print its level, pitch and audible length.
    Inspect {
        /// Built-in pitch (low, mid, high) or path to an audio file.
        tone: ToneSelector,
        /// Configuration file providing the output format.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Write the default configuration to a file.
    InitConfig {
        path: PathBuf,
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// JSON configuration file; flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Beats per minute.
    #[arg(short, long)]
    bpm: Option<u32>,
    /// Time signature such as 4/4 or 6/8.
    #[arg(short, long)]
    time_signature: Option<TimeSignature>,
    /// Tick without playing any tones.
    #[arg(long)]
    mute: bool,
    /// Stop after this many bars.
    #[arg(long)]
    bars: Option<u32>,
    /// Tone for the first beat of each bar.
    #[arg(long)]
    accent: Option<ToneSelector>,
    /// Tone for the remaining beats.
    #[arg(long)]
    regular: Option<ToneSelector>,
    /// Percentage of each tone that is played.
    #[arg(long)]
    trim_percent: Option<u8>,
    /// Poll deadlines without yielding the scheduler thread.
    #[arg(long)]
    busy: bool,
}

impl RunArgs {
    fn resolve(self) -> metronome_core::Result<MetronomeConfig> {
        let mut config = match &self.config {
            Some(path) => MetronomeConfig::load(path)?,
            None => MetronomeConfig::default(),
        };

        if let Some(bpm) = self.bpm {
            config.bpm = bpm;
        }
        if let Some(time_signature) = self.time_signature {
            config.time_signature = time_signature;
        }
        if self.mute {
            config.sound = false;
        }
        if self.bars.is_some() {
            config.bars = self.bars;
        }
        if let Some(accent) = self.accent {
            config.tones.accent = accent;
        }
        if let Some(regular) = self.regular {
            config.tones.regular = regular;
        }
        if let Some(trim_percent) = self.trim_percent {
            config.audio.trim_percent = trim_percent;
        }
        if self.busy {
            config.scheduler.spin = SpinStrategy::Busy;
        }

        config.validate()?;
        Ok(config)
    }
}
