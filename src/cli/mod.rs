//! Command-line interface for tsk
//!
//! This module defines the CLI structure using clap derive macros.
//! Command implementations live in [`task`].

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::error::{Error, Result};

mod task;

/// tsk - task tracking over a synchronized, quota-limited store
///
/// Tasks are kept in a small key-value store shared by every tsk process
/// pointed at the same document. Edits are written in fragments sized to
/// the store's per-item limit.
#[derive(Parser, Debug)]
#[command(name = "tsk")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Store document (defaults to the platform data directory)
    #[arg(long, global = true, env = "TASKSYNC_STORE")]
    pub store: Option<PathBuf>,

    /// Configuration file (defaults to ./.tasksync.toml when present)
    #[arg(long, global = true, env = "TASKSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Emit bus events as JSON lines to a file, or "-" for stdout
    #[arg(long, global = true)]
    pub events: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a task
    Add {
        /// Task title
        title: String,

        /// Longer description
        #[arg(short, long)]
        description: Option<String>,

        /// Priority: low, medium, high, critical (or 0-3)
        #[arg(short, long)]
        priority: Option<String>,

        /// Status: backlog, todo, in-progress, review, done (or 0-4)
        #[arg(short, long)]
        status: Option<String>,

        /// Due date (YYYY-MM-DD or RFC 3339)
        #[arg(long)]
        due: Option<String>,

        /// Link to an outside tracker
        #[arg(long)]
        link: Option<String>,
    },

    /// List tasks
    #[command(alias = "ls")]
    List {
        /// Case-insensitive text to find in title or description
        #[arg(long)]
        search: Option<String>,

        /// Only tasks with this priority
        #[arg(short, long)]
        priority: Option<String>,

        /// Only tasks with this status
        #[arg(short, long)]
        status: Option<String>,

        /// Sort field: created, due, priority, status, title
        #[arg(long, default_value = "created")]
        sort: String,

        /// Sort ascending (default is descending)
        #[arg(long)]
        asc: bool,
    },

    /// Show one task
    Show {
        /// Task ID
        id: String,
    },

    /// Change fields of a task
    Edit {
        /// Task ID
        id: String,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        description: Option<String>,

        #[arg(short, long)]
        priority: Option<String>,

        #[arg(short, long)]
        status: Option<String>,

        /// New due date (YYYY-MM-DD or RFC 3339)
        #[arg(long, conflicts_with = "clear_due")]
        due: Option<String>,

        /// Remove the due date
        #[arg(long)]
        clear_due: bool,

        /// New external link
        #[arg(long, conflicts_with = "clear_link")]
        link: Option<String>,

        /// Remove the external link
        #[arg(long)]
        clear_link: bool,
    },

    /// Delete a task
    #[command(alias = "delete")]
    Rm {
        /// Task ID
        id: String,
    },

    /// Move a task to another status column
    Move {
        /// Task ID
        id: String,

        /// Target status
        status: String,
    },

    /// Task counts and storage usage
    Stats,

    /// Storage usage against the quota
    Usage,

    /// Print the collection whenever another process changes it
    Watch,
}

impl Cli {
    /// Run the selected command on a single-threaded runtime.
    pub fn run(self) -> Result<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| Error::NoRuntime(err.to_string()))?;
        runtime.block_on(self.dispatch())
    }

    async fn dispatch(self) -> Result<()> {
        let global = task::GlobalOptions {
            store: self.store,
            config: self.config,
            json: self.json,
            quiet: self.quiet,
            events: self.events,
        };

        match self.command {
            Commands::Add {
                title,
                description,
                priority,
                status,
                due,
                link,
            } => {
                task::run_add(
                    global,
                    task::AddOptions {
                        title,
                        description,
                        priority,
                        status,
                        due,
                        link,
                    },
                )
                .await
            }
            Commands::List {
                search,
                priority,
                status,
                sort,
                asc,
            } => {
                task::run_list(
                    global,
                    task::ListOptions {
                        search,
                        priority,
                        status,
                        sort,
                        asc,
                    },
                )
                .await
            }
            Commands::Show { id } => task::run_show(global, id).await,
            Commands::Edit {
                id,
                title,
                description,
                priority,
                status,
                due,
                clear_due,
                link,
                clear_link,
            } => {
                task::run_edit(
                    global,
                    task::EditOptions {
                        id,
                        title,
                        description,
                        priority,
                        status,
                        due,
                        clear_due,
                        link,
                        clear_link,
                    },
                )
                .await
            }
            Commands::Rm { id } => task::run_rm(global, id).await,
            Commands::Move { id, status } => task::run_move(global, id, status).await,
            Commands::Stats => task::run_stats(global).await,
            Commands::Usage => task::run_usage(global).await,
            Commands::Watch => task::run_watch(global).await,
        }
    }
}
