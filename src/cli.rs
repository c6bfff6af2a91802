//! CLI argument parsing using Clap.

use clap::{Parser, Subcommand};
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::str::FromStr;

/// tub - inspect and edit recorded driving datastores
#[derive(Parser, Debug)]
#[command(name = "tub")]
#[command(version, about, long_about = None)]
#[command(after_help = "Examples:
  tub info ./data/tub_3                Show schema, counts and sessions
  tub cat ./data/tub_3 --indexed       Print live records with their index
  tub get ./data/tub_3 42              Print record 42, even if deleted
  tub delete ./data/tub_3 10-19 25     Mark records 10..=19 and 25 deleted
")]
pub struct Cli {
    /// Settings file (JSON)
    #[arg(long, global = true, env = "TUB_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show schema, record counts, segments and sessions
    Info {
        /// Datastore directory
        path: PathBuf,
    },

    /// Print live records as JSON lines
    Cat {
        /// Datastore directory
        path: PathBuf,
        /// Prefix each record with its logical index
        #[arg(long)]
        indexed: bool,
        /// Stop after this many records
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Print one record by logical index, deleted or not
    Get {
        /// Datastore directory
        path: PathBuf,
        index: u64,
    },

    /// Mark records as deleted
    Delete {
        /// Datastore directory
        path: PathBuf,
        /// Indexes or inclusive ranges (`7`, `10-19`)
        #[arg(required = true)]
        indexes: Vec<IndexArg>,
    },

    /// Undo a deletion
    Restore {
        /// Datastore directory
        path: PathBuf,
        /// Indexes or inclusive ranges (`7`, `10-19`)
        #[arg(required = true)]
        indexes: Vec<IndexArg>,
    },
}

/// One index (`7`) or an inclusive range (`10-19`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexArg(pub RangeInclusive<u64>);

impl FromStr for IndexArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<u64>()
                .map_err(|e| format!("invalid index '{part}': {e}"))
        };
        match value.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if start > end {
                    return Err(format!("empty range '{value}'"));
                }
                Ok(Self(start..=end))
            }
            None => {
                let index = parse(value)?;
                Ok(Self(index..=index))
            }
        }
    }
}

/// Flatten index arguments into individual indexes.
pub fn expand_indexes(args: &[IndexArg]) -> impl Iterator<Item = u64> + '_ {
    args.iter().flat_map(|arg| arg.0.clone())
}
