mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use tracing_subscriber::{EnvFilter, fmt};

use crate::commands::{
    cmd_attribute_list, cmd_recipe_list, cmd_user_create, cmd_user_list, cmd_user_token,
};
use crate::config::Config;
use cookbook_core::db::Database;
use cookbook_core::media::ImageStore;
use cookbook_core::models::AttributeKind;

#[derive(Parser)]
#[command(
    name = "cookbook",
    version,
    about = "A multi-user recipe API server",
    long_about = "Serves a token-authenticated recipe API backed by SQLite.\n\
                  The remaining subcommands administer the same database directly."
)]
struct Cli {
    /// Directory for the database (default: the platform data directory)
    #[arg(long, global = true, env = "COOKBOOK_DATA_DIR", value_name = "PATH")]
    data_dir: Option<PathBuf>,
    /// Directory for uploaded images (default: <data-dir>/media)
    #[arg(long, global = true, env = "COOKBOOK_MEDIA_DIR", value_name = "PATH")]
    media_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8000", env = "COOKBOOK_PORT")]
        port: u16,
        /// Address to bind to (default: 127.0.0.1, use 0.0.0.0 to expose to network)
        #[arg(short, long, default_value = "127.0.0.1", env = "COOKBOOK_BIND")]
        bind: String,
    },
    /// Manage accounts and API tokens
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Inspect a user's recipes
    Recipe {
        #[command(subcommand)]
        command: RecipeCommands,
    },
    /// Inspect a user's tags
    Tag {
        #[command(subcommand)]
        command: AttributeCommands,
    },
    /// Inspect a user's ingredients
    Ingredient {
        #[command(subcommand)]
        command: AttributeCommands,
    },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create an account
    Create {
        /// Email address (the domain part is lowercased)
        email: String,
        /// Password, at least 5 characters
        #[arg(long)]
        password: String,
        /// Display name
        #[arg(long, default_value = "")]
        name: String,
        /// Grant staff and superuser flags
        #[arg(long)]
        superuser: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List all accounts
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print a user's API token, creating it if needed
    Token {
        /// Email address of the account
        email: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum RecipeCommands {
    /// List recipes, newest first
    List {
        /// Owner's email address
        #[arg(short, long)]
        user: String,
        /// Comma-separated tag ids; keeps recipes with any of them
        #[arg(long)]
        tags: Option<String>,
        /// Comma-separated ingredient ids; keeps recipes with any of them
        #[arg(long)]
        ingredients: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum AttributeCommands {
    /// List entries by name, descending
    List {
        /// Owner's email address
        #[arg(short, long)]
        user: String,
        /// Only show entries used by at least one recipe
        #[arg(long)]
        assigned_only: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.data_dir, cli.media_dir)?;
    let db = Database::open(&config.db_path)?;

    match cli.command {
        Commands::Serve { port, bind } => {
            fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .init();
            tracing::info!("Data directory: {}", config.data_dir.display());
            let images = ImageStore::new(config.media_dir);
            server::start_server(db, images, port, &bind).await
        }
        Commands::User { command } => match command {
            UserCommands::Create {
                email,
                password,
                name,
                superuser,
                json,
            } => cmd_user_create(&db, &email, &password, &name, superuser, json),
            UserCommands::List { json } => cmd_user_list(&db, json),
            UserCommands::Token { email, json } => cmd_user_token(&db, &email, json),
        },
        Commands::Recipe { command } => match command {
            RecipeCommands::List {
                user,
                tags,
                ingredients,
                json,
            } => cmd_recipe_list(&db, &user, tags.as_deref(), ingredients.as_deref(), json),
        },
        Commands::Tag { command } => run_attribute(&db, AttributeKind::Tag, command),
        Commands::Ingredient { command } => run_attribute(&db, AttributeKind::Ingredient, command),
    }
}

fn run_attribute(db: &Database, kind: AttributeKind, command: AttributeCommands) -> Result<()> {
    match command {
        AttributeCommands::List {
            user,
            assigned_only,
            json,
        } => cmd_attribute_list(db, kind, &user, assigned_only, json),
    }
}
