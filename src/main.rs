use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use hearth::config::WakeMode;
use hearth::device::{
    Command as DeviceCommand, DeviceLink, DisplayDriver, Renderer, SharedLink, SystemPorts,
    discover_port, list_ports,
};
use hearth::dialogue::{DialogueSession, OpenAiDialogue};
use hearth::voice::{
    AudioOutput, AudioPlayback, Capture, CpalMicrophones, EnergyOnly,
    EnergyWakeDetector, MicrophoneFactory, TONE_SAMPLE_RATE, TranscriptWakeDetector, TurnRecorder,
    VoiceActivity, WakeWordDetector, WebRtcVad, rms, tone,
};
use hearth::{Config, ConversationOrchestrator, ConversationSettings, OrchestratorParts};

/// Hearth - voice companion with a serial display
#[derive(Parser)]
#[command(name = "hearth", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Config file (defaults to ~/.config/hearth/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port of the display controller (skips discovery)
    #[arg(short, long)]
    port: Option<String>,

    /// Run audio-only, without opening the display
    #[arg(long)]
    no_display: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
    /// List serial ports and the one discovery would pick
    ListPorts,
    /// Send one command to the display controller and print the reply
    SendCommand {
        /// Method name
        method: String,
        /// Parameters as a JSON value
        params: Option<String>,
    },
    /// Show an image on the display
    ShowImage {
        /// Image file (PNG, JPEG or GIF)
        path: PathBuf,
    },
    /// Record one turn and save it as WAV
    Record {
        /// Output file
        #[arg(short, long, default_value = "turn.wav")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,hearth=info",
        1 => "info,hearth=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

#[allow(clippy::future_not_send)]
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.device.port = Some(port);
    }

    if let Some(cmd) = cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(&config, duration),
            Command::TestSpeaker => test_speaker(),
            Command::ListPorts => cmd_list_ports(&config),
            Command::SendCommand { method, params } => {
                cmd_send_command(&config, method, params.as_deref()).await
            }
            Command::ShowImage { path } => cmd_show_image(&config, &path).await,
            Command::Record { output } => cmd_record(&config, &output),
        };
    }

    tracing::info!(
        wake_mode = ?config.conversation.wake_mode,
        no_display = cli.no_display,
        "starting hearth"
    );
    tracing::debug!(
        chat_model = %config.dialogue.chat_model,
        max_silence = config.conversation.max_silence,
        vad = config.audio.vad_enabled,
        "loaded configuration"
    );

    let shutdown = CancellationToken::new();
    hearth::orchestrator::spawn_signal_listener(shutdown.clone());

    let dialogue: Arc<dyn DialogueSession> = Arc::new(OpenAiDialogue::new(
        &config.dialogue,
        &config.conversation.end_marker,
    )?);

    let display = if cli.no_display {
        None
    } else {
        Some(open_display(&config)?)
    };

    let parts = OrchestratorParts {
        detector: build_detector(&config, Arc::clone(&dialogue))?,
        dialogue,
        microphones: Box::new(microphones(&config)),
        recorder: build_recorder(&config)?,
        output: Box::new(AudioPlayback::new()?),
        display,
    };

    let mut orchestrator =
        ConversationOrchestrator::new(parts, ConversationSettings::from_config(&config), shutdown)?;

    match config.conversation.wake_mode {
        WakeMode::Transcript => {
            let words = config.conversation.wake_words.join("\", \"");
            tracing::info!("hearth ready - say \"{words}\"");
        }
        WakeMode::Energy => tracing::info!("hearth ready - start speaking to wake it"),
    }

    orchestrator.run().await?;
    Ok(())
}

fn microphones(config: &Config) -> CpalMicrophones {
    CpalMicrophones {
        sample_rate: config.audio.sample_rate,
        frame_len: config.audio.frame_len(),
        read_timeout: config.audio.read_timeout,
    }
}

fn build_recorder(config: &Config) -> anyhow::Result<TurnRecorder> {
    let vad: Box<dyn VoiceActivity> = if config.audio.vad_enabled {
        Box::new(WebRtcVad::new(config.audio.sample_rate, config.audio.vad_mode)?)
    } else {
        Box::new(EnergyOnly)
    };
    Ok(TurnRecorder::new(config.audio.recorder_settings(), vad))
}

fn build_detector(
    config: &Config,
    dialogue: Arc<dyn DialogueSession>,
) -> anyhow::Result<Box<dyn WakeWordDetector>> {
    let threshold = config.audio.energy_threshold;
    let rate = config.audio.sample_rate;

    Ok(match config.conversation.wake_mode {
        WakeMode::Transcript => Box::new(TranscriptWakeDetector::new(
            config.conversation.wake_words.clone(),
            dialogue,
            threshold,
            rate,
        )?),
        WakeMode::Energy => Box::new(EnergyWakeDetector::new(threshold, rate)),
    })
}

fn open_link(config: &Config) -> SharedLink {
    let path = config.device.port.clone().unwrap_or_else(|| {
        discover_port(&config.device.description_match, &config.device.fallback_port)
    });

    let link = DeviceLink::new(Box::new(SystemPorts), config.device.link_settings());
    SharedLink::new(link, config.device.link_policy(path))
}

fn open_display(config: &Config) -> anyhow::Result<DisplayDriver> {
    let renderer = Renderer::new(
        config.device.canvas,
        config.device.pixel_format,
        config.device.jpeg_quality,
    )?;
    Ok(DisplayDriver::new(open_link(config), renderer))
}

/// Test microphone input
fn test_mic(config: &Config, duration: u64) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let mut source = microphones(config).open()?;
    let mut vad = WebRtcVad::new(config.audio.sample_rate, config.audio.vad_mode)?;

    println!("Sample rate: {} Hz", source.sample_rate());
    println!("---");

    for i in 0..duration {
        let started = Instant::now();
        let mut peak = 0.0_f32;
        let mut voiced = 0_u32;
        let mut frames = 0_u32;

        while started.elapsed() < Duration::from_secs(1) {
            let frame = source.read_frame()?;
            peak = peak.max(rms(&frame));
            frames += 1;
            if vad.is_speech(&frame).unwrap_or(false) {
                voiced += 1;
            }
        }

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (peak / 200.0).min(50.0) as usize;
        let meter: String = "#".repeat(meter_len) + &" ".repeat(50 - meter_len);
        let active = peak > config.audio.energy_threshold;

        println!(
            "[{:2}s] RMS: {:7.1} | VAD: {voiced:2}/{frames} | {} | [{meter}]",
            i + 1,
            peak,
            if active { "ACTIVE" } else { "quiet " },
        );
    }

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("Frames above {:.0} RMS count as speech.", config.audio.energy_threshold);

    Ok(())
}

/// Test speaker output with a sine wave
fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let mut playback = AudioPlayback::new()?;
    let samples = tone(440.0, Duration::from_secs(2), TONE_SAMPLE_RATE, 0.3);

    println!("Playing {} samples at {} Hz...", samples.len(), TONE_SAMPLE_RATE);
    playback.play_samples(&samples, TONE_SAMPLE_RATE)?;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");

    Ok(())
}

fn cmd_list_ports(config: &Config) -> anyhow::Result<()> {
    let ports = list_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in &ports {
        println!("{:<24} {}", port.path, port.description);
    }

    let picked = config.device.port.clone().unwrap_or_else(|| {
        discover_port(&config.device.description_match, &config.device.fallback_port)
    });
    println!("\nHearth would use: {picked}");
    Ok(())
}

async fn cmd_send_command(
    config: &Config,
    method: String,
    params: Option<&str>,
) -> anyhow::Result<()> {
    let command = match params {
        Some(raw) => DeviceCommand::with_params(method, serde_json::from_str(raw)?),
        None => DeviceCommand::new(method),
    };

    let link = open_link(config);
    if !link.ensure_open().await {
        anyhow::bail!("cannot open {}", link.policy().path);
    }

    let reply = link.send_command(command).await;
    link.close().await;

    println!("{}", serde_json::to_string_pretty(&reply?)?);
    Ok(())
}

async fn cmd_show_image(config: &Config, path: &Path) -> anyhow::Result<()> {
    let mut display = open_display(config)?;
    if !display.link().ensure_open().await {
        anyhow::bail!("cannot open {}", display.link().policy().path);
    }

    let acknowledged = display.show_still(path).await?;
    display.link().close().await;

    if acknowledged {
        println!("Image shown");
        Ok(())
    } else {
        anyhow::bail!("display did not acknowledge the image")
    }
}

fn cmd_record(config: &Config, output: &Path) -> anyhow::Result<()> {
    let mut source = microphones(config).open()?;
    let mut recorder = build_recorder(config)?;

    println!("Listening... speak now");
    match recorder.capture(source.as_mut(), &CancellationToken::new()) {
        Capture::Utterance(utterance) => {
            utterance.write_wav(output)?;
            println!(
                "Saved {:.2}s to {}",
                utterance.duration().as_secs_f32(),
                output.display()
            );
            Ok(())
        }
        Capture::Nothing => {
            println!("No speech detected");
            Ok(())
        }
        Capture::StreamFailed(reason) => anyhow::bail!("microphone failed: {reason}"),
    }
}
