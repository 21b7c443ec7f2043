use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "mvbox", version, about = "Move chat messages out of the inbox")]
pub struct Cli {
    /// Configuration file, instead of the default locations
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// SQLite state file
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Watch both folders and move chat messages until interrupted
    Run {
        host: Option<String>,
        user: Option<String>,
        password: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Print what the local state knows about the mailbox
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Cli {
    /// Let command line arguments override the loaded configuration
    pub fn apply(&self, config: &mut AppConfig) {
        if let Some(db) = &self.db {
            config.database.path = Some(db.clone());
        }

        if let Commands::Run {
            host,
            user,
            password,
            port,
        } = &self.command
        {
            if let Some(host) = host {
                config.imap.host = host.clone();
            }
            if let Some(user) = user {
                config.imap.user = user.clone();
            }
            if let Some(password) = password {
                config.imap.password = password.clone();
            }
            if let Some(port) = port {
                config.imap.port = *port;
            }
        }
    }
}
