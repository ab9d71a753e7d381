//! # layerkeeper CLI
//!
//! ## Commands
//!
//! - `init` - Create a new database
//! - `server` - Start the HTTP server
//! - `layer create|list|stats|delete` - Layer registry
//! - `ci create|show|list` - Configuration items and their merged view
//! - `attr set|remove|history` - Attribute writes with layer policies
//! - `relation add|remove` - Relation writes
//! - `trait list|effective` - Active traits and the CIs having one
//! - `predicate list|set` - Predicate definitions
//! - `changesets` - Changesets in a timespan
//! - `export` / `import` - Layer export streams
//! - `compact` - Compact a redb database

mod commands;

use crate::config::AppConfig;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use layerkeeper_core::{MaskHandlingForRemoval, OtherLayersValueHandling};
use std::path::PathBuf;

pub use commands::*;

// =============================================================================
// CLI STRUCTURE
// =============================================================================

/// layerkeeper - temporal layered configuration management database
///
/// Configuration items carry attributes and relations in ordered layers;
/// what a CI is gets computed from traits over the merged data.
#[derive(Parser, Debug)]
#[command(name = "layerkeeper")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress banner output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to the database
    #[arg(short = 'D', long, global = true, default_value = "layerkeeper.redb")]
    pub database: PathBuf,

    /// Storage backend
    #[arg(short = 'B', long, global = true, value_enum, default_value_t = Backend::Redb)]
    pub backend: Backend,

    /// Configuration file (default: ./layerkeeper.toml when present)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Output in JSON format (for programmatic access)
    #[arg(long, global = true)]
    pub json_mode: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// Volatile; everything is lost on exit.
    Memory,
    /// ACID file database.
    Redb,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Redb => write!(f, "redb"),
        }
    }
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new empty database
    Init {
        /// Force initialization even if database exists
        #[arg(short, long)]
        force: bool,
    },

    /// Start HTTP server
    Server {
        /// Host to bind to (default from config)
        #[arg(short = 'H', long)]
        host: Option<String>,

        /// Port to bind to (default from config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Layer registry
    #[command(subcommand)]
    Layer(LayerCommand),

    /// Configuration items
    #[command(subcommand)]
    Ci(CiCommand),

    /// Attribute writes
    #[command(subcommand)]
    Attr(AttrCommand),

    /// Relation writes
    #[command(subcommand)]
    Relation(RelationCommand),

    /// Traits
    #[command(subcommand)]
    Trait(TraitCommand),

    /// Predicate definitions
    #[command(subcommand)]
    Predicate(PredicateCommand),

    /// Changesets written in a timespan, newest first
    Changesets {
        /// Layers to look at (comma-separated)
        #[arg(short, long)]
        layers: String,

        #[arg(long)]
        from: Option<DateTime<Utc>>,

        #[arg(long)]
        to: Option<DateTime<Utc>>,

        /// Only changesets touching this CI
        #[arg(long)]
        ci: Option<String>,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Export the live content of a layer
    Export {
        #[arg(short, long)]
        layer: String,

        /// Output file path
        #[arg(short, long)]
        output: PathBuf,

        /// Export as of this time instead of the latest state
        #[arg(long)]
        at: Option<DateTime<Utc>>,
    },

    /// Replace the content of a layer with an export stream
    Import {
        /// Target layer, created when missing
        #[arg(short, long)]
        layer: String,

        /// Input file path
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        user: UserArg,
    },

    /// Compact the redb database
    Compact,
}

#[derive(Subcommand, Debug)]
pub enum LayerCommand {
    /// Register a layer
    Create {
        id: String,

        #[arg(short, long, default_value = "")]
        description: String,

        #[command(flatten)]
        user: UserArg,
    },
    /// List registered layers
    List,
    /// Record and changeset counts of a layer
    Stats { id: String },
    /// Delete a layer that holds no records
    Delete {
        id: String,

        #[command(flatten)]
        user: UserArg,
    },
}

#[derive(Subcommand, Debug)]
pub enum CiCommand {
    /// Create a CI, with a random id unless one is given
    Create {
        #[arg(long)]
        id: Option<String>,

        #[command(flatten)]
        user: UserArg,
    },
    /// Merged view of a CI
    Show {
        id: String,

        #[command(flatten)]
        read: ReadArgs,
    },
    /// Every CI id
    List,
}

#[derive(Subcommand, Debug)]
pub enum AttrCommand {
    /// Write an attribute value
    Set {
        ci: String,
        name: String,

        /// Value items; several with --array
        #[arg(long = "value", required = true)]
        values: Vec<String>,

        /// Value type (text, multiline_text, integer, boolean, json, yaml)
        #[arg(short = 't', long = "type", default_value = "text")]
        value_type: String,

        #[arg(long)]
        array: bool,

        #[command(flatten)]
        target: WriteTarget,

        #[arg(long, value_enum, default_value_t = WritePolicy::ForceWrite)]
        policy: WritePolicy,

        #[command(flatten)]
        user: UserArg,
    },
    /// Remove an attribute
    Remove {
        ci: String,
        name: String,

        #[command(flatten)]
        target: WriteTarget,

        #[arg(long, value_enum, default_value_t = MaskPolicy::NoMask)]
        mask: MaskPolicy,

        #[command(flatten)]
        user: UserArg,
    },
    /// Full record history of an attribute in one layer
    History {
        ci: String,
        name: String,

        #[arg(short, long)]
        layer: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum RelationCommand {
    /// Write a relation
    Add {
        from: String,
        to: String,
        predicate: String,

        #[command(flatten)]
        target: WriteTarget,

        #[arg(long, value_enum, default_value_t = WritePolicy::ForceWrite)]
        policy: WritePolicy,

        /// Require the predicate to be defined in the meta layers
        #[arg(long)]
        checked: bool,

        #[command(flatten)]
        user: UserArg,
    },
    /// Remove a relation
    Remove {
        from: String,
        to: String,
        predicate: String,

        #[command(flatten)]
        target: WriteTarget,

        #[arg(long, value_enum, default_value_t = MaskPolicy::NoMask)]
        mask: MaskPolicy,

        #[command(flatten)]
        user: UserArg,
    },
}

#[derive(Subcommand, Debug)]
pub enum TraitCommand {
    /// Active traits of the meta layers
    List,
    /// CIs having a trait
    Effective {
        id: String,

        #[command(flatten)]
        read: ReadArgs,
    },
}

#[derive(Subcommand, Debug)]
pub enum PredicateCommand {
    /// Predicates defined in the meta layers
    List,
    /// Create or update a predicate
    Set {
        id: String,
        wording_from: String,
        wording_to: String,

        #[command(flatten)]
        user: UserArg,
    },
}

// =============================================================================
// SHARED ARGUMENTS
// =============================================================================

/// Layers of a merged read.
#[derive(Args, Debug, Clone)]
pub struct ReadArgs {
    /// Layers, most precedent first (comma-separated)
    #[arg(short, long)]
    pub layers: String,

    /// Read as of this time instead of the latest state
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

/// Write layer and the read set its policy looks at.
#[derive(Args, Debug, Clone)]
pub struct WriteTarget {
    /// Layer to write to
    #[arg(short, long)]
    pub layer: String,

    /// Read set for the policy check (comma-separated); the write layer alone when absent
    #[arg(long, default_value = "")]
    pub read_layers: String,
}

#[derive(Args, Debug, Clone)]
pub struct UserArg {
    /// User recorded on the changeset (default from config)
    #[arg(short, long)]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum WritePolicy {
    /// Write even when the merged value already matches
    ForceWrite,
    /// Skip the write when the merged value already matches
    TakeIntoAccount,
}

impl From<WritePolicy> for OtherLayersValueHandling {
    fn from(policy: WritePolicy) -> Self {
        match policy {
            WritePolicy::ForceWrite => Self::ForceWrite,
            WritePolicy::TakeIntoAccount => Self::TakeIntoAccount,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MaskPolicy {
    /// Mask lower layers that would otherwise show through
    Mask,
    /// Only remove from the write layer
    NoMask,
}

impl From<MaskPolicy> for MaskHandlingForRemoval {
    fn from(policy: MaskPolicy) -> Self {
        match policy {
            MaskPolicy::Mask => Self::ApplyMaskIfNecessary,
            MaskPolicy::NoMask => Self::ApplyNoMask,
        }
    }
}

// =============================================================================
// COMMAND EXECUTION
// =============================================================================

/// Execute the CLI with parsed arguments.
pub async fn execute(cli: Cli) -> Result<(), AppError> {
    let config = AppConfig::load(cli.config.as_deref())?;
    let ctx = Context {
        database: cli.database,
        backend: cli.backend,
        json_mode: cli.json_mode,
        config,
    };

    match cli.command {
        Some(Commands::Init { force }) => cmd_init(&ctx, force),
        Some(Commands::Server { host, port }) => cmd_server(ctx, host, port).await,
        Some(Commands::Layer(command)) => cmd_layer(&ctx, command),
        Some(Commands::Ci(command)) => cmd_ci(&ctx, command),
        Some(Commands::Attr(command)) => cmd_attr(&ctx, command),
        Some(Commands::Relation(command)) => cmd_relation(&ctx, command),
        Some(Commands::Trait(command)) => cmd_trait(&ctx, command),
        Some(Commands::Predicate(command)) => cmd_predicate(&ctx, command),
        Some(Commands::Changesets {
            layers,
            from,
            to,
            ci,
            limit,
        }) => cmd_changesets(&ctx, &layers, from, to, ci.as_deref(), limit),
        Some(Commands::Export { layer, output, at }) => cmd_export(&ctx, &layer, &output, at),
        Some(Commands::Import { layer, input, user }) => cmd_import(&ctx, &layer, &input, user),
        Some(Commands::Compact) => cmd_compact(&ctx),
        // No subcommand: list layers
        None => cmd_layer(&ctx, LayerCommand::List),
    }
}
