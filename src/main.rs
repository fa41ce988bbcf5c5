use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use stun::config::{ClientConfigFile, ServerConfigFile, SAMPLE_CLIENT_CONFIG, SAMPLE_SERVER_CONFIG};
use stun::event::EventLoop;
use stun::logger::StructuredLogger;
use stun::tun::linux::device_factory;
use stun::{Client, Server};

const SERVER_CONFIG_PATH: &str = "stun-server.toml";
const CLIENT_CONFIG_PATH: &str = "stun-client.toml";

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the server side with the given config file.
    Server {
        #[clap(value_parser)]
        config_file: String,
    },
    /// Run the client side with the given config file.
    Client {
        #[clap(value_parser)]
        config_file: String,
    },
    /// Write sample server and client config files.
    GenConfig,
    /// Generate a random pre-shared secret.
    GenSecret,
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    // SAFETY: the handler only touches an atomic flag, which is
    // async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn run_until_signalled(lp: &EventLoop) {
    while !STOP.load(Ordering::Relaxed) {
        lp.tick();
    }
    info!(target: "main", "shutdown signal received");
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server { config_file } => {
            let file = ServerConfigFile::load(&config_file)
                .with_context(|| format!("Failed to load server config '{}'", config_file))?;
            StructuredLogger::init(&file.log)?;
            install_signal_handlers();

            let lp = EventLoop::new();
            let factory = device_factory(&lp, &file.server.tunnel_prefix, file.server.mtu);
            let server = Server::new(&lp, file.server, factory).context("Failed to start server")?;
            run_until_signalled(&lp);
            drop(server); // removes the NAT rules
        }
        Commands::Client { config_file } => {
            let file = ClientConfigFile::load(&config_file)
                .with_context(|| format!("Failed to load client config '{}'", config_file))?;
            StructuredLogger::init(&file.log)?;
            install_signal_handlers();

            let lp = EventLoop::new();
            let factory = device_factory(&lp, &file.client.tunnel_prefix, file.client.mtu);
            let _client = Client::new(&lp, file.client, factory);
            run_until_signalled(&lp);
        }
        Commands::GenConfig => {
            fs::write(SERVER_CONFIG_PATH, SAMPLE_SERVER_CONFIG)?;
            fs::write(CLIENT_CONFIG_PATH, SAMPLE_CLIENT_CONFIG)?;
            println!("Wrote {} and {}.", SERVER_CONFIG_PATH, CLIENT_CONFIG_PATH);
        }
        Commands::GenSecret => {
            println!("{}", stun::crypto::generate_secret());
        }
    }
    Ok(())
}
