//! CLI argument definitions using clap derive macros.

use std::ops::RangeInclusive;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use manuscript_core::OutputFormat;

/// Download digitized manuscripts from library platforms.
///
/// Resolves a viewer or manifest URL into an ordered page list, downloads
/// the pages, and assembles them into one PDF or CBZ document.
#[derive(Parser, Debug)]
#[command(name = "manuscript-downloader")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Resolve a URL and print its canonical manifest
    Resolve {
        /// Manuscript viewer or manifest URL
        url: String,

        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,

        /// Bypass the manifest cache
        #[arg(long)]
        no_cache: bool,

        /// Job state database (also holds the manifest cache)
        #[arg(long, value_name = "PATH")]
        state_db: Option<PathBuf>,
    },

    /// Resolve a URL, download its pages, and assemble the document
    Download(DownloadArgs),

    /// Resume a persisted job by id
    Resume {
        /// Job id printed by `download`
        job_id: String,

        /// Job state database
        #[arg(long, value_name = "PATH")]
        state_db: Option<PathBuf>,
    },

    /// List persisted jobs
    Jobs {
        /// Job state database
        #[arg(long, value_name = "PATH")]
        state_db: Option<PathBuf>,
    },

    /// List supported sources
    Sources,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Manuscript viewer or manifest URL
    pub url: String,

    /// Output file (default: <title>.<format> in the configured output directory)
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Output format
    #[arg(long, value_enum)]
    pub format: Option<FormatArg>,

    /// Pages fetched concurrently (1-32; the source may cap this lower)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub concurrency: Option<u8>,

    /// 1-based inclusive page range, e.g. `5-20` or `7`
    #[arg(long, value_name = "A-B", value_parser = parse_page_range)]
    pub pages: Option<RangeInclusive<usize>>,

    /// Invert page colors (negative microfilm scans)
    #[arg(long)]
    pub invert: bool,

    /// Minimum delay between requests to one host in milliseconds (0-60000)
    #[arg(short = 'l', long, value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub rate_limit: Option<u64>,

    /// Maximum attempts per page for transient failures (1-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_attempts: Option<u32>,

    /// Bypass the manifest cache
    #[arg(long)]
    pub no_cache: bool,

    /// Job state database
    #[arg(long, value_name = "PATH")]
    pub state_db: Option<PathBuf>,
}

/// Output formats accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FormatArg {
    Pdf,
    Cbz,
}

impl From<FormatArg> for OutputFormat {
    fn from(value: FormatArg) -> Self {
        match value {
            FormatArg::Pdf => Self::Pdf,
            FormatArg::Cbz => Self::Cbz,
        }
    }
}

/// Parses `A-B` or a single page `A`; pages are 1-based.
pub fn parse_page_range(value: &str) -> Result<RangeInclusive<usize>, String> {
    let parse = |part: &str| {
        part.trim()
            .parse::<usize>()
            .map_err(|_| format!("'{}' is not a page number", part.trim()))
    };
    let (start, end) = match value.split_once('-') {
        Some((start, end)) => (parse(start)?, parse(end)?),
        None => {
            let page = parse(value)?;
            (page, page)
        }
    };
    if start == 0 {
        return Err("pages are numbered from 1".to_string());
    }
    if end < start {
        return Err(format!("range end {end} is before start {start}"));
    }
    Ok(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_download_defaults() {
        let cli = Cli::try_parse_from(["manuscript-downloader", "download", "https://x/manifest"]).unwrap();
        assert_eq!(cli.verbose, 0);
        assert!(!cli.quiet);
        let Command::Download(args) = cli.command else {
            panic!("expected download");
        };
        assert_eq!(args.url, "https://x/manifest");
        assert!(args.output.is_none());
        assert!(args.format.is_none());
        assert!(args.concurrency.is_none());
        assert!(args.pages.is_none());
        assert!(!args.invert);
    }

    #[test]
    fn test_cli_download_all_flags() {
        let cli = Cli::try_parse_from([
            "manuscript-downloader",
            "-vv",
            "download",
            "https://x/manifest",
            "-o",
            "out.cbz",
            "--format",
            "cbz",
            "-c",
            "8",
            "--pages",
            "3-9",
            "--invert",
            "--state-db",
            "/tmp/s.db",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        let Command::Download(args) = cli.command else {
            panic!("expected download");
        };
        assert_eq!(args.output, Some(PathBuf::from("out.cbz")));
        assert_eq!(args.format, Some(FormatArg::Cbz));
        assert_eq!(args.concurrency, Some(8));
        assert_eq!(args.pages, Some(3..=9));
        assert!(args.invert);
        assert_eq!(args.state_db, Some(PathBuf::from("/tmp/s.db")));
    }

    #[test]
    fn test_cli_quiet_is_global() {
        let cli = Cli::try_parse_from(["manuscript-downloader", "sources", "-q"]).unwrap();
        assert!(cli.quiet);
    }

    #[test]
    fn test_cli_concurrency_out_of_range() {
        let result = Cli::try_parse_from(["manuscript-downloader", "download", "u", "-c", "33"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_resolve_json() {
        let cli = Cli::try_parse_from(["manuscript-downloader", "resolve", "https://x", "--json"]).unwrap();
        assert!(matches!(cli.command, Command::Resolve { json: true, .. }));
    }

    #[test]
    fn test_cli_resume_requires_job_id() {
        let result = Cli::try_parse_from(["manuscript-downloader", "resume"]);
        assert_eq!(
            result.unwrap_err().kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let result = Cli::try_parse_from(["manuscript-downloader", "--help"]);
        assert_eq!(result.unwrap_err().kind(), clap::error::ErrorKind::DisplayHelp);
    }

    #[test]
    fn test_parse_page_range() {
        assert_eq!(parse_page_range("5-20"), Ok(5..=20));
        assert_eq!(parse_page_range(" 7 "), Ok(7..=7));
        assert_eq!(parse_page_range("3 - 4"), Ok(3..=4));
        assert!(parse_page_range("0-3").is_err());
        assert!(parse_page_range("9-2").is_err());
        assert!(parse_page_range("a-b").is_err());
    }

    #[test]
    fn test_format_arg_maps_to_output_format() {
        assert_eq!(OutputFormat::from(FormatArg::Pdf), OutputFormat::Pdf);
        assert_eq!(OutputFormat::from(FormatArg::Cbz), OutputFormat::Cbz);
    }
}
