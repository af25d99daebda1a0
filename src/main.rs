use anyhow::Context;
use clap::Parser;
use live_voice::{
    config::{load_config, UpstreamGate},
    devices::{list_devices, CpalBackend, Direction},
    error::VoiceError,
    session::{self, SessionListener, SessionState},
    transport::LiveTransport,
    turn::{Speaker, Turn},
};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "live-voice")]
#[command(about = "Real-time spoken conversation with a hosted voice model")]
#[command(long_about = "
Streams the microphone to a hosted voice model and plays its spoken replies.

The API key is read from GEMINI_API_KEY (or API_KEY), optionally from a .env file.

EXAMPLES:
  # List available audio devices
  live-voice --list-devices

  # Talk with a custom persona and voice
  live-voice --voice Puck --system-prompt \"You are a patient language tutor.\"

  # Use a specific microphone and mute it while the model speaks
  live-voice --input-device \"USB Audio\" --upstream-gate mute
")]
struct Args {
    /// List available audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Prebuilt voice of the model
    #[arg(long)]
    voice: Option<String>,

    /// System instruction for the session
    #[arg(long)]
    system_prompt: Option<String>,

    /// Model id (without the "models/" prefix)
    #[arg(long)]
    model: Option<String>,

    /// Input device name for audio capture
    #[arg(long)]
    input_device: Option<String>,

    /// Input channel to capture from (0-based index)
    #[arg(long, default_value = "0")]
    input_channel: u16,

    /// Output device name for audio playback
    #[arg(long)]
    output_device: Option<String>,

    /// What to send upstream while the model is speaking
    #[arg(long, value_enum, default_value_t = UpstreamGate::MeterOnly)]
    upstream_gate: UpstreamGate,
}

/// Prints the conversation to the terminal
struct ConsoleListener;

impl SessionListener for ConsoleListener {
    fn on_status_change(&self, state: SessionState) {
        match state {
            SessionState::Connecting => println!("🔌 Connecting..."),
            SessionState::Listening => println!("🎧 Listening"),
            SessionState::Speaking => println!("🗣️  Speaking"),
            SessionState::Error => println!("❌ Session failed"),
            SessionState::Closed => println!("👋 Session closed"),
            SessionState::Idle => {}
        }
    }

    fn on_turn_complete(&self, turn: &Turn) {
        println!("✨ You: {}", turn.user_text.trim());
        println!("🤖 Model: {}", turn.model_text.trim());
    }

    fn on_transcript(&self, speaker: Speaker, text: &str) {
        log::debug!("Transcript ({}): {}", speaker, text);
    }

    fn on_error(&self, error: &VoiceError) {
        eprintln!("❌ {}", error);
    }
}

fn print_devices() -> anyhow::Result<()> {
    let devices = list_devices().context("Failed to enumerate audio devices")?;

    for direction in [Direction::Input, Direction::Output] {
        println!("\n🎵 {} devices:", direction);
        let mut count = 0;
        for device in devices.iter().filter(|d| d.direction == direction) {
            count += 1;
            let default_marker = if device.is_default { " (default)" } else { "" };
            println!(
                "  {}. {}{} - {} channels @ {}Hz",
                count, device.name, default_marker, device.channel_count, device.sample_rate
            );
        }
        if count == 0 {
            println!("  No {} devices found", direction);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        return print_devices();
    }

    let (api, mut config) = load_config()?;
    if let Some(voice) = args.voice {
        config.params.voice = voice;
    }
    if let Some(system_prompt) = args.system_prompt {
        config.params.system_prompt = system_prompt;
    }
    if let Some(model) = args.model {
        config.params.model = model;
    }
    config.input_device = args.input_device;
    config.input_channel = args.input_channel;
    config.output_device = args.output_device;
    config.upstream_gate = args.upstream_gate;
    config.validate()?;

    log::info!(
        "🚀 Starting live-voice (model: {}, voice: {})",
        config.params.model,
        config.params.voice
    );
    let transport = Arc::new(LiveTransport::new(config.endpoint.clone(), api));
    let mut handle = session::start(
        config,
        Arc::new(CpalBackend),
        transport,
        Arc::new(ConsoleListener),
    );

    println!("   Press Ctrl+C to exit");
    tokio::select! {
        _ = handle.closed() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("Received Ctrl+C, shutting down...");
            handle.close();
        }
    }

    Ok(())
}
