use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};

use modem_sms::config::CONFIG_FILE;
use modem_sms::port::PortLister;
use modem_sms::prelude::*;

#[derive(Parser, Debug)]
#[command(name = "modem_sms", version, about = "SMS over a serial GSM modem")]
struct Cli {
    /// RON configuration file
    #[arg(short, long, default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Receive messages until the modem goes away (default)
    Listen,
    /// Send one message to one or more numbers
    Send {
        /// Recipient numbers, local or +international
        #[arg(short, long, required = true, num_args = 1..)]
        to: Vec<String>,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// List serial ports and their manufacturers
    Ports,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = ModemConfig::load(&cli.config)?;
    let service = ModemService::new(config, Arc::new(SystemPorts), Arc::new(LogStore));

    match cli.command.unwrap_or(Command::Listen) {
        Command::Listen => {
            let handle = service.start_listening().await?;
            let link = handle.link().clone();
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupted, closing {}", link.settings().port_name);
                    link.close();
                }
                () = handle.join() => {}
            }
        }
        Command::Send { to, message } => {
            let batch = service.send_batch(&to, &message).await?;
            info!("Sent {}/{}", batch.sent_count(), batch.messages.len());
        }
        Command::Ports => {
            for port in SystemPorts.list()? {
                println!(
                    "{}\t{}",
                    port.path,
                    port.manufacturer.as_deref().unwrap_or("-")
                );
            }
        }
    }
    Ok(())
}
