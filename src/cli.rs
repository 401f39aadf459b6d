use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "pathdex",
    about = "An always-on sharded file path index with live search"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search the index for a keyword
    Search(SearchArgs),
    /// Rescan every configured volume
    Rebuild(RebuildArgs),
    /// Compact every shard-group
    Optimize,
    /// Manage suffix priorities
    Suffix {
        #[command(subcommand)]
        action: SuffixAction,
    },
    /// Manage the frequently used paths
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Inspect or edit settings.json
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Show index status
    Status(StatusArgs),
    /// Run the service with a JSON-lines facade on stdin/stdout
    Serve,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The keyword, optionally followed by `|flag;flag`
    pub query: String,

    /// Stop after this many results
    #[arg(short = 'n', long)]
    pub max: Option<usize>,

    /// Seconds to wait for the search to finish
    #[arg(long, default_value = "30")]
    pub timeout: u64,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Rebuild --

#[derive(Debug, Parser)]
pub struct RebuildArgs {
    /// Discard the existing datasets before scanning
    #[arg(long)]
    pub drop_previous: bool,
}

// -- Suffix subcommands --

#[derive(Debug, Subcommand)]
pub enum SuffixAction {
    /// Add a suffix or change its priority
    Add {
        suffix: String,
        #[arg(allow_negative_numbers = true)]
        priority: i32,
    },
    /// Remove a suffix
    Remove { suffix: String },
    /// Replace a suffix with another
    Update {
        old_suffix: String,
        suffix: String,
        #[arg(allow_negative_numbers = true)]
        priority: i32,
    },
    /// Remove every suffix but the built-in ones
    Clear,
    /// List suffix priorities
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Cache subcommands --

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Record a use of a path
    Add { path: String },
    /// Forget a path
    Remove { path: String },
    /// List the most used paths
    List {
        /// Number of paths to list
        #[arg(short = 'n', long, default_value = "20")]
        count: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

// -- Config subcommands --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print the effective settings
    Show,
    /// Replace the monitored volume roots
    SetDisks {
        #[arg(required = true)]
        roots: Vec<PathBuf>,
    },
    /// Replace the ignored path prefixes
    SetIgnore { paths: Vec<String> },
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "pathdex",
            &mut std::io::stdout(),
        );
    }
}
