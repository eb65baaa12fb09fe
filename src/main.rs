use clap::Parser;
use globalcache_bridge::{config::Config, link::TcpConnector, thing::Command, Thing};
use std::{error::Error, path::PathBuf, sync::Arc};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    runtime, select, signal,
};

/// Drive the channels of a GlobalCache device from standard input.
///
/// Each input line is `<channel-id> <command>`, where command is `ON`, `OFF`,
/// `REFRESH` or a code name / serial text.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Device configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Talk to an in-process emulated device instead of the configured host.
    #[cfg(feature = "emul")]
    #[arg(long)]
    emulate: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    use env_logger::Env;
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let rt = runtime::Builder::new_current_thread().enable_all().build()?;
    rt.block_on(async_main(args, config))
}

#[cfg_attr(not(feature = "emul"), allow(unused_variables))]
fn start(args: &Args, config: &Config) -> Result<Arc<Thing>, Box<dyn Error>> {
    let tcp = || TcpConnector::new(&config.host, &config.link);
    #[cfg(feature = "emul")]
    let thing = if args.emulate {
        use globalcache_bridge::emulator::Emulator;
        log::info!("Using emulated device for {}", config.id);
        Thing::start(config, Emulator::default().with_relays(1, 3).connector())?
    } else {
        Thing::start(config, tcp())?
    };
    #[cfg(not(feature = "emul"))]
    let thing = Thing::start(config, tcp())?;
    Ok(thing)
}

async fn async_main(args: Args, config: Config) -> Result<(), Box<dyn Error>> {
    log::info!("start");
    let thing = start(&args, &config)?;
    let mut events = thing.status().subscribe();
    let mut lines = BufReader::new(stdin()).lines();

    loop {
        select! {
            _ = signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(status) => log::info!("Thing {} is {}", thing.id(), status),
                Err(err) => log::debug!("Status events: {}", err),
            },
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let (channel, command) = match line.trim().split_once(char::is_whitespace) {
                    Some((channel, command)) => (channel.to_string(), command.parse::<Command>()?),
                    None if line.trim().is_empty() => continue,
                    None => {
                        log::warn!("Expected '<channel> <command>', got '{}'", line.trim());
                        continue;
                    }
                };
                match thing.handle_command(&channel, command).await {
                    Ok(()) => {
                        if let Some(relay) = thing.relay(&channel).and_then(|s| s.get()) {
                            log::info!("{} = {:?}", channel, relay);
                        }
                    }
                    Err(err) => log::error!("{}: {}", channel, err),
                }
            }
        }
    }

    thing.stop().await;
    log::info!("stop");
    Ok(())
}
