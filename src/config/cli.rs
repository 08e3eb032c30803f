use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use url::Url;

use crate::application::pagination::SortOrder;

/// Command-line arguments for the Folio binary.
#[derive(Debug, Parser)]
#[command(name = "folio", version, about = "Folio data-access console")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "FOLIO_CONFIG_FILE",
        value_name = "PATH",
        global = true,
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        global = true,
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Talk to a simple-REST backend at this base URL.
    #[arg(long = "rest-url", value_name = "URL", global = true, conflicts_with = "fixture")]
    pub rest_url: Option<Url>,

    /// Seed the in-memory backend from a JSON fixture (`{ "resource": [records] }`).
    #[arg(
        long = "fixture",
        value_name = "PATH",
        global = true,
        value_hint = ValueHint::FilePath
    )]
    pub fixture: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Fetch one page of a resource.
    List(ListArgs),
    /// Fetch one record by id.
    Show(ShowArgs),
    /// Fetch records of a resource that point at another record.
    References(ReferencesArgs),
}

#[derive(Debug, Args, Clone)]
pub struct PageArgs {
    /// 1-based page number.
    #[arg(long, default_value_t = 1)]
    pub page: u32,

    /// Records per page.
    #[arg(long = "per-page", default_value_t = 10)]
    pub per_page: u32,

    /// Field to sort by.
    #[arg(long, default_value = "id")]
    pub sort: String,

    /// Sort direction (ASC|DESC).
    #[arg(long, default_value = "ASC")]
    pub order: SortOrder,

    /// Filter as a JSON object, e.g. '{"status":"published"}'.
    #[arg(long, value_name = "JSON")]
    pub filter: Option<String>,
}

#[derive(Debug, Args, Clone)]
pub struct ListArgs {
    /// Resource name, e.g. `posts`.
    pub resource: String,

    #[command(flatten)]
    pub page: PageArgs,
}

#[derive(Debug, Args, Clone)]
pub struct ShowArgs {
    pub resource: String,
    pub id: String,
}

#[derive(Debug, Args, Clone)]
pub struct ReferencesArgs {
    /// Resource holding the references, e.g. `comments`.
    pub resource: String,
    /// Field of `resource` pointing at the referenced record, e.g. `post_id`.
    pub target: String,
    /// Id of the referenced record.
    pub id: String,

    #[command(flatten)]
    pub page: PageArgs,
}
