//! Build version metadata and the loose semver comparison used when the
//! mothership advertises a minimum compatible agent version.

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Compare two version strings by their numeric `X.Y.Z` prefix.
/// Pre-release suffixes (`-dev`, `-rc1`) are ignored.
/// Returns `Ordering::Less` if `a < b`, etc.
pub fn compare(a: &str, b: &str) -> std::cmp::Ordering {
    parse_numeric(a).cmp(&parse_numeric(b))
}

fn parse_numeric(v: &str) -> [u64; 3] {
    let v = v.split('-').next().unwrap_or(v);
    let mut nums = [0u64; 3];
    for (i, part) in v.splitn(3, '.').enumerate() {
        nums[i] = part.parse().unwrap_or(0);
    }
    nums
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn compare_orders_numerically() {
        assert_eq!(compare("1.2.3", "1.2.3"), Ordering::Equal);
        assert_eq!(compare("0.9.0", "0.10.0"), Ordering::Less);
        assert_eq!(compare("2.0.0", "1.99.99"), Ordering::Greater);
    }

    #[test]
    fn compare_ignores_prerelease_suffix() {
        assert_eq!(compare("1.2.3-dev", "1.2.3"), Ordering::Equal);
        assert_eq!(compare("0.1.0-rc1", "0.2.0"), Ordering::Less);
    }

    #[test]
    fn compare_tolerates_short_versions() {
        assert_eq!(compare("1", "1.0.0"), Ordering::Equal);
        assert_eq!(compare("1.2", "1.2.1"), Ordering::Less);
    }
}
