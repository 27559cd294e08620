//! Wharf CLI entry point.
//!
//! Thin shell around the pull engine: parses the reference and options,
//! injects the default Harbor credentials when none are given, and maps
//! the result to exit codes. On success the tarball path is printed to
//! stdout; on failure the error goes to stderr and the exit code is 1.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use wharf_core::config::{Credentials, Platform, PullConfig};
use wharf_core::error::Result;
use wharf_pull::{ImagePuller, ImageReference};

/// Pull an image from a Docker/OCI registry into a docker-loadable tarball.
#[derive(Debug, Parser)]
#[command(name = "wharf", version)]
struct Cli {
    /// Image reference: host[:port]/project/image[:tag|@sha256:<hex>]
    reference: String,

    /// Registry username
    #[arg(long, default_value = "admin")]
    username: String,

    /// Registry password
    #[arg(long, default_value = "Harbor12345")]
    password: String,

    /// Output tarball path (default: <image>_<tag>.tar in the current directory)
    #[arg(long)]
    output: Option<PathBuf>,

    /// Platform to select from a multi-arch image, as os/architecture
    #[arg(long, value_parser = parse_platform)]
    platform: Option<Platform>,

    /// Host header override, for registries that advertise an internally
    /// unreachable address
    #[arg(long)]
    hostname: Option<String>,

    /// Skip TLS certificate verification
    #[arg(long)]
    insecure: bool,
}

fn parse_platform(s: &str) -> std::result::Result<Platform, String> {
    Platform::parse(s).ok_or_else(|| format!("expected os/architecture, got '{}'", s))
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let reference = ImageReference::parse(&cli.reference)?;
    let output = cli
        .output
        .unwrap_or_else(|| default_output_path(&reference));

    let config = PullConfig {
        platform: cli.platform,
        hostname: cli.hostname,
        insecure: cli.insecure,
        ..Default::default()
    };

    let credentials = Credentials::new(cli.username, cli.password);
    let puller = ImagePuller::new(Some(credentials), config);
    let packed = puller.pull(&reference, &output).await?;

    println!("{}", packed.path.display());
    Ok(())
}

/// Default tarball name: repository and tag, slashes and colons flattened.
fn default_output_path(reference: &ImageReference) -> PathBuf {
    PathBuf::from(format!(
        "{}_{}.tar",
        reference.repository.replace('/', "_"),
        reference.output_tag().replace(':', "_")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_credentials() {
        let cli = Cli::parse_from(["wharf", "registry.example.com/lib/app:1.0"]);
        assert_eq!(cli.username, "admin");
        assert_eq!(cli.password, "Harbor12345");
    }

    #[test]
    fn test_default_output_path() {
        let reference = ImageReference::parse("registry.example.com/lib/app:1.0").unwrap();
        assert_eq!(default_output_path(&reference), PathBuf::from("lib_app_1.0.tar"));
    }

    #[test]
    fn test_default_output_path_digest_pull() {
        let digest = format!("sha256:{}", "a".repeat(64));
        let reference =
            ImageReference::parse(&format!("registry.example.com/lib/app@{}", digest)).unwrap();
        let name = default_output_path(&reference);
        assert!(name.to_string_lossy().starts_with("lib_app_sha256-"));
    }

    #[test]
    fn test_platform_argument() {
        let cli = Cli::parse_from([
            "wharf",
            "registry.example.com/lib/app:1.0",
            "--platform",
            "linux/arm64",
        ]);
        assert_eq!(cli.platform, Some(Platform::new("linux", "arm64")));
    }

    #[test]
    fn test_rejects_bad_platform_argument() {
        let result = Cli::try_parse_from([
            "wharf",
            "registry.example.com/lib/app:1.0",
            "--platform",
            "sparc",
        ]);
        assert!(result.is_err());
    }
}
