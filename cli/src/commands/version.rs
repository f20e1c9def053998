//! `chartpack version` command.

use chartpack::bundle::DESCRIPTOR_PATH;
use chartpack_core::{DEFAULT_CONCURRENCY, DEFAULT_STAGE};
use clap::Args;

#[derive(Args)]
pub struct VersionArgs {
    /// Print only the version number
    #[arg(long)]
    pub short: bool,
}

pub async fn execute(args: VersionArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", version_text(args.short));
    Ok(())
}

/// Version line, followed by the bundle layout and built-in defaults unless `short`.
fn version_text(short: bool) -> String {
    if short {
        return chartpack::VERSION.to_string();
    }
    format!(
        "chartpack {}\nbundle: {} + chart/ manifests/ blobs/\ndefaults: stage {}, concurrency {}",
        chartpack::VERSION,
        DESCRIPTOR_PATH,
        DEFAULT_STAGE,
        DEFAULT_CONCURRENCY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_version_is_bare_number() {
        assert_eq!(version_text(true), env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn test_version_lists_bundle_layout() {
        let text = version_text(false);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("chartpack "));
        assert!(lines[1].contains("proto.yaml"));
        assert!(lines[2].contains(DEFAULT_STAGE));
    }
}
