mod logging;

use arts_mcop::audio::{AudioPump, AudioSource, ThreadedDeviceIO};
use arts_mcop::{Dispatcher, McopConfig, MethodSignature, Skeleton, TypeCode, init};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};

const CONFIG_ENV: &str = "ARTS_CONFIG";
const DEFAULT_CONFIG: &str = "arts.toml";

const USAGE: &str = "usage: arts serve <address> | arts play <raw pcm file>";

fn load_config() -> arts_mcop::Result<McopConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    if Path::new(&path).exists() {
        info!("config from {path}");
        return McopConfig::load(&path);
    }
    let mut config = McopConfig::default();
    config.apply_env();
    Ok(config)
}

/// Raw PCM in the device's format, read straight from a file.
struct FileSource(File);

impl AudioSource for FileSource {
    fn fill(&mut self, buf: &mut [u8]) -> usize {
        loop {
            match self.0.read(buf) {
                Ok(n) => return n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!("reading input: {err}");
                    return 0;
                }
            }
        }
    }
}

fn server_object() -> Skeleton {
    let mut skeleton = Skeleton::new("Arts::SoundServer");
    skeleton.add_method(
        MethodSignature::new("ping", &[TypeCode::Long], TypeCode::Long),
        |request, result| result.write_long(request.read_long()),
    );
    skeleton.add_method(
        MethodSignature::new("log", &[TypeCode::String], TypeCode::Void),
        |request, _| info!("client says: {}", request.read_string()),
    );
    skeleton
}

async fn serve(dispatcher: Arc<Dispatcher>, address: &str) -> arts_mcop::Result<()> {
    let object = dispatcher.add_object(server_object());
    info!("sound server is object {}", object.object_id());
    let listener = TcpListener::bind(address).await?;
    dispatcher.serve(listener).await
}

async fn play(dispatcher: Arc<Dispatcher>, path: &str) -> arts_mcop::Result<()> {
    let file = File::open(path)?;
    let params = dispatcher.config().audio.clone();
    let mut io = ThreadedDeviceIO::new(dispatcher.threads().clone(), params);
    if !io.open() {
        return Err(std::io::Error::other(io.last_error()).into());
    }
    let period = fragment_period(io.params());
    let mut pump = AudioPump::new(io).with_source(FileSource(file));
    pump.run(period).await;
    // Let the writer drain what is still queued
    while pump.io().buffered_chunks() > 0 && !pump.io().failed() {
        tokio::time::sleep(period).await;
    }
    let io = pump.io_mut();
    io.close();
    if io.failed() {
        return Err(std::io::Error::other(io.last_error()).into());
    }
    info!("finished {path}");
    Ok(())
}

fn fragment_period(params: &arts_mcop::audio::AudioParams) -> Duration {
    let frame_bytes = (params.channels.max(1) * params.bits.max(8) / 8) as u64;
    let frames = params.fragment_size as u64 / frame_bytes;
    // Two ticks per fragment
    let micros = frames * 1_000_000 / params.sample_rate.max(1) as u64 / 2;
    Duration::from_micros(micros).max(Duration::from_millis(1))
}

#[tokio::main]
async fn main() {
    logging::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let config = match load_config() {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(2);
        }
    };
    let dispatcher = init(config);
    dispatcher.start_notifications();
    let result = match args.as_slice() {
        [command, address] if command == "serve" => serve(dispatcher, address).await,
        [command, path] if command == "play" => play(dispatcher, path).await,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };
    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}
