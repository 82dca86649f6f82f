//! Application related stuff

#![allow(dead_code)]
use clap::Parser;

lazy_static! {
    /// The global application options.
    pub static ref OPTIONS: Options = Options::parse();
}

/// Returns the global application options.
pub fn options() -> &'static Options {
    &OPTIONS
}

/// System wide options for the treelet inspector.
#[derive(Parser, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Suppress all text output other than error messages.
    #[arg(long, help = "Suppress all text output other than error messages.")]
    pub quiet: bool,

    /// Verify cross-treelet child links of every treelet.
    #[arg(
        long = "check-links",
        help = "Verify cross-treelet child links of every treelet."
    )]
    pub check_links: bool,

    /// Only inspect the treelet with the given id.
    #[arg(
        long = "treelet",
        short = 't',
        value_name = "ID",
        help = "Only inspect the treelet with the given id."
    )]
    pub treelet: Option<u32>,

    /// Path to a dumped scene directory.
    #[arg(help = "Dumped scene directory")]
    pub scene_path: String,
}
