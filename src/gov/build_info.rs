/// Git revision captured by build.rs; empty when built outside a checkout.
pub fn git_revision() -> &'static str {
    option_env!("GOVERNATOR_GIT_REVISION").unwrap_or("")
}

pub fn build_date() -> String {
    let epoch: i64 = option_env!("GOVERNATOR_BUILD_EPOCH")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    format_epoch_date(epoch)
}

fn format_epoch_date(epoch: i64) -> String {
    if epoch <= 0 {
        return "unknown".to_string();
    }
    match chrono::DateTime::<chrono::Utc>::from_timestamp(epoch, 0) {
        Some(dt) => dt.format("%Y-%m-%d").to_string(),
        None => "unknown".to_string(),
    }
}

pub fn banner() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match git_revision() {
        "" => format!("governator {version} (built {})", build_date()),
        rev => format!("governator {version} {rev} (built {})", build_date()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_date_rendering() {
        assert_eq!(format_epoch_date(0), "unknown");
        assert_eq!(format_epoch_date(-5), "unknown");
        assert_eq!(format_epoch_date(86_400), "1970-01-02");
        assert_eq!(format_epoch_date(1_754_092_800), "2025-08-02");
    }

    #[test]
    fn banner_carries_the_version() {
        let b = banner();
        assert!(b.starts_with("governator "));
        assert!(b.contains(env!("CARGO_PKG_VERSION")));
    }
}
