//! Inspection of the arguments passed through to the node binary.

use tracing::warn;

/// Node flag listing heights at which due upgrades are skipped.
pub const SKIP_UPGRADES_FLAG: &str = "--unsafe-skip-upgrades";

/// Heights given to the child via `--unsafe-skip-upgrades`.
///
/// Accepts both `--unsafe-skip-upgrades 10 20` (values run until the next
/// argument starting with `-`) and `--unsafe-skip-upgrades=10,20`. Values
/// that are not heights are logged and ignored.
pub fn parse_skip_heights(args: &[String]) -> Vec<i64> {
    let mut heights = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        if let Some(list) = arg.strip_prefix(SKIP_UPGRADES_FLAG).and_then(|r| r.strip_prefix('=')) {
            heights.extend(list.split(',').filter_map(parse_height));
        } else if arg == SKIP_UPGRADES_FLAG {
            while let Some(value) = iter.next_if(|v| !v.starts_with('-')) {
                heights.extend(parse_height(value));
            }
        }
    }
    heights
}

fn parse_height(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<i64>() {
        Ok(h) if h > 0 => Some(h),
        _ => {
            warn!(value = raw, "ignoring invalid skip height");
            None
        }
    }
}
