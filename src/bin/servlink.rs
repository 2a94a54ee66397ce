use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::{runtime, signal};
use tracing::{debug, error, info};

use servlink::{
    setup_tracing, AppResult, Codec, LengthFieldCodec, LinkConfig, Message, Server, SessionHandle,
    SessionListener, SessionManager, ShutdownNotifier,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Replies with whatever arrived; the stock listener for running the
/// transport stand-alone.
struct EchoListener;

impl SessionListener for EchoListener {
    fn on_message_received(&self, message: Message, session: &SessionHandle) -> Option<Message> {
        debug!(
            session_id = session.id(),
            "echoing {} bytes",
            message.len()
        );
        Some(message)
    }
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();

    if std::env::var("RUST_LOG").is_err() {
        let level = match commandline.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("conf");
            path.push("servlink.toml");
            path
        },
        PathBuf::from,
    );
    let link_config = LinkConfig::from_file(&config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", link_config);
        return Ok(());
    }

    let worker_threads = if link_config.server.selector_count == 0 {
        num_cpus::get()
    } else {
        link_config.server.selector_count
    };
    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let _log_guard = setup_tracing("logs", "servlink.log");

        let server_config = link_config.server.clone();
        let codec: Arc<dyn Codec> = Arc::new(LengthFieldCodec::new(
            &server_config.charset,
            server_config.max_frame_size,
        )?);
        let manager = SessionManager::new();
        let shutdown = ShutdownNotifier::new();
        let server = Server::new(
            server_config,
            codec,
            Arc::new(EchoListener),
            manager.clone(),
            shutdown.clone(),
        );

        tokio::select! {
            res = server.run() => {
                if let Err(err) = res {
                    error!(cause = %err, "server terminated");
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
            }
        }

        shutdown.shutdown();
        manager.close();
        info!("servlink shutdown complete");
        Ok::<(), servlink::AppError>(())
    })?;

    Ok(())
}
