//! Connects to the local sound server, prints its information as JSON and,
//! with `--tone`, plays a short test tone.
//!
//! ```text
//! RUST_LOG=debug cargo run -p pulse-bridge-linux --features playground -- [--server ADDR] [--tone]
//! ```

use std::error::Error;
use std::io::Write;
use std::sync::Arc;

use clap::Parser;

use pulse_bridge_core::{
    Context, ContextConfiguration, ContextFlags, Mainloop, MainloopConfiguration, SampleFormat,
    SampleSpec, SimpleStream, SimpleStreamConfiguration,
};
use pulse_bridge_linux::{LibPulse, LibPulseSimple};

/// Connect to a sound server and print what it reports.
#[derive(Parser, Debug)]
#[command(name = "playground")]
struct Options {
    /// Server address, e.g. `unix:/run/user/1000/pulse/native` or `tcp:host`
    #[arg(long)]
    server: Option<String>,

    /// Play a one-second 440 Hz tone after printing the server information
    #[arg(long)]
    tone: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let options = Options::parse();

    let mainloop = Mainloop::with_configuration(
        Arc::new(LibPulse::new()),
        MainloopConfiguration {
            thread_name: Some("pulse-playground".into()),
        },
    )?;

    let context = Context::with_configuration(
        &mainloop,
        ContextConfiguration {
            application_name: "pulse-bridge playground".into(),
            server: options.server.clone(),
            flags: ContextFlags::NOAUTOSPAWN,
        },
    )?;
    context.set_state_callback(|state| log::info!("context state: {:?}", state));

    if context.connect_async()?.wait().is_err() {
        return Err("connection failed".into());
    }

    let info = context.get_server_info_async()?.wait()?;
    println!("{}", serde_json::to_string_pretty(&info)?);

    context.disconnect_async()?.wait()?;
    drop(context);

    if options.tone {
        play_tone(options.server)?;
    }
    Ok(())
}

/// One second of a 440 Hz sine.
fn play_tone(server: Option<String>) -> Result<(), Box<dyn Error>> {
    let spec = SampleSpec {
        format: SampleFormat::S16Le,
        rate: 44100,
        channels: 1,
    };
    let mut config = SimpleStreamConfiguration::playback("pulse-bridge playground", spec);
    config.server = server;
    config.stream_name = "Test tone".into();

    let mut stream = SimpleStream::open(Arc::new(LibPulseSimple::new()), &config)?;
    log::info!("playback latency: {:?}", stream.latency()?);

    let samples: Vec<u8> = (0..spec.rate)
        .flat_map(|n| {
            let t = n as f32 / spec.rate as f32;
            let value = (t * 440.0 * std::f32::consts::TAU).sin() * 0.3;
            ((value * i16::MAX as f32) as i16).to_le_bytes()
        })
        .collect();
    stream.write_all(&samples)?;
    stream.flush()?;
    Ok(())
}
