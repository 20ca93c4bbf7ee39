use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "tidal",
    about = "Stage a release drive and seed it until idle",
    version
)]
pub struct Cli {
    /// Key of the staging drive (hex)
    pub stage_key: String,

    /// Metadata length of the staging drive to release
    pub stage_checkout: u64,

    /// Key of the production drive that seeds an empty release (hex)
    pub prod_key: String,

    /// Report the diff and stop without writing
    #[arg(long)]
    pub dry_run: bool,

    /// Directory holding the core store
    #[arg(long, default_value = "./corestore")]
    pub storage: PathBuf,

    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Address to accept peers on
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Peer to dial (repeatable)
    #[arg(long = "peer")]
    pub peers: Vec<SocketAddr>,

    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn positionals_and_flags() {
        let cli = Cli::try_parse_from([
            "tidal",
            "aa",
            "42",
            "bb",
            "--dry-run",
            "--peer",
            "10.0.0.1:4977",
            "--peer",
            "10.0.0.2:4977",
        ])
        .unwrap();
        assert_eq!(cli.stage_key, "aa");
        assert_eq!(cli.stage_checkout, 42);
        assert_eq!(cli.prod_key, "bb");
        assert!(cli.dry_run);
        assert_eq!(cli.peers.len(), 2);
        assert_eq!(cli.storage, PathBuf::from("./corestore"));
        assert!(cli.listen.is_none());
    }

    #[test]
    fn checkout_must_be_a_number() {
        assert!(Cli::try_parse_from(["tidal", "aa", "latest", "bb"]).is_err());
    }

    #[test]
    fn all_positionals_required() {
        assert!(Cli::try_parse_from(["tidal", "aa", "42"]).is_err());
    }
}
