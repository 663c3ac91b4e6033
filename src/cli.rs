use clap::{Parser, Subcommand};

use crate::items::ExtractionStatus;
use crate::queue::JobKind;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Use an in-process queue and item store instead of Redis and items.json.
    /// Nothing survives the process.
    #[clap(long, global = true, default_value = "false")]
    pub memory: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Consume extraction jobs until Ctrl+C
    Worker {},

    /// Print the platform links found in a message
    Detect {
        /// message text
        text: String,
    },

    /// Show which platform a link belongs to
    Check {
        url: String,
    },

    /// Run the extraction pipeline for one link and print the result
    Meta {
        url: String,

        /// Skip the rendered-page tier
        #[clap(long, default_value = "false")]
        no_headless: bool,
    },

    /// Ingest a chat message: create items for new links and queue them
    Ingest {
        /// message text
        text: String,

        #[clap(long, default_value = "cli")]
        server: String,

        #[clap(long, default_value = "cli")]
        channel: String,

        /// Message id; generated when omitted
        #[clap(long)]
        message: Option<String>,

        /// Treat the author as a bot (message is ignored)
        #[clap(long, default_value = "false")]
        bot: bool,
    },

    /// Reset a failed or complete item and queue it again
    Resubmit {
        item_id: String,
    },

    /// List tracked items
    Items {
        #[clap(long)]
        status: Option<ExtractionStatus>,

        #[clap(long)]
        server: Option<String>,

        #[clap(long)]
        limit: Option<usize>,
    },

    /// Queue counters and current sizes
    Stats {
        #[clap(long, value_enum, default_value = "extract-metadata")]
        kind: JobKind,
    },

    /// Jobs that exhausted their retries
    DeadLetters {
        #[clap(long, value_enum, default_value = "extract-metadata")]
        kind: JobKind,

        #[clap(long, default_value = "20")]
        limit: usize,
    },

    /// Enabled platforms in detection order
    Platforms {},
}
