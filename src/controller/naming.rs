//! Deterministic object names, addresses and schedule conversion

use crate::error::{Error, Result};

/// Manual trigger that makes the source run its last sync from the temporary claim
pub const FINAL_SYNC_TRIGGER: &str = "vrg-final-sync";
/// Manual trigger that parks the source while the application is being stopped
pub const PREPARE_FOR_FINAL_SYNC_TRIGGER: &str = "PREPARE-FOR-FINAL-SYNC-STOP-SCHEDULING";

/// Used when no scheduling interval is configured
pub const DEFAULT_SCHEDULE_CRON: &str = "*/10 * * * *";

const LOCAL_REPLICATION_SUFFIX: &str = "-local";
const FINAL_SYNC_CLAIM_SUFFIX: &str = "-for-finalsync";
const RSYNC_DST_SERVICE_PREFIX: &str = "volsync-rsync-tls-dst-";
const RSYNC_SRC_JOB_PREFIX: &str = "volsync-rsync-tls-src-";
const CLUSTERSET_DOMAIN: &str = "svc.clusterset.local";
const PSK_SECRET_SUFFIX: &str = "-vs-secret";

const MIN_INTERVAL_LENGTH: usize = 2;
const MAX_DAY_OF_MONTH: u64 = 28;
const MAX_NAME_LENGTH: usize = 63;

pub fn destination_name(claim: &str) -> String {
    claim.to_string()
}

pub fn source_name(claim: &str) -> String {
    claim.to_string()
}

/// Name shared by the local destination/source pair used for rollback.
pub fn local_replication_name(claim: &str) -> String {
    format!("{claim}{LOCAL_REPLICATION_SUFFIX}")
}

pub fn final_sync_claim_name(claim: &str) -> String {
    format!("{claim}{FINAL_SYNC_CLAIM_SUFFIX}")
}

/// Service the data mover creates in front of a destination.
pub fn local_service_name(destination: &str) -> String {
    truncate(format!("{RSYNC_DST_SERVICE_PREFIX}{destination}"))
}

/// Cluster-set address a peer cluster uses to reach the destination of `claim`.
pub fn remote_service_address(claim: &str, namespace: &str) -> String {
    format!(
        "{}.{namespace}.{CLUSTERSET_DOMAIN}",
        local_service_name(&destination_name(claim))
    )
}

pub fn source_job_name(claim: &str) -> String {
    truncate(format!("{RSYNC_SRC_JOB_PREFIX}{claim}"))
}

pub fn psk_secret_name(group: &str) -> String {
    format!("{group}{PSK_SECRET_SUFFIX}")
}

fn truncate(mut name: String) -> String {
    if name.len() > MAX_NAME_LENGTH {
        let cut = name
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|&i| i <= MAX_NAME_LENGTH)
            .last()
            .unwrap_or(0);
        name.truncate(cut);
    }
    name
}

/// Converts `<N><m|h|d>` into a cron expression. Day intervals beyond the
/// shortest month are clamped.
pub fn cron_from_interval(interval: &str) -> Result<String> {
    let invalid = || Error::ValidationError(format!("scheduling interval {interval:?} is invalid"));

    if interval.chars().count() < MIN_INTERVAL_LENGTH {
        return Err(invalid());
    }

    let mut chars = interval.chars();
    let unit = chars.next_back().ok_or_else(invalid)?;
    let value = chars.as_str();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let n: u64 = value.parse().map_err(|_| invalid())?;
    if n == 0 {
        return Err(invalid());
    }

    match unit.to_ascii_lowercase() {
        'm' => Ok(format!("*/{n} * * * *")),
        'h' => Ok(format!("0 */{n} * * *")),
        'd' => Ok(format!("0 0 */{} * *", n.min(MAX_DAY_OF_MONTH))),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cron_minutes_hours_days() {
        assert_eq!(cron_from_interval("30m").unwrap(), "*/30 * * * *");
        assert_eq!(cron_from_interval("6h").unwrap(), "0 */6 * * *");
        assert_eq!(cron_from_interval("2d").unwrap(), "0 0 */2 * *");
        assert_eq!(cron_from_interval("5M").unwrap(), "*/5 * * * *");
    }

    #[test]
    fn test_cron_days_clamped() {
        assert_eq!(cron_from_interval("40d").unwrap(), "0 0 */28 * *");
        assert_eq!(cron_from_interval("28d").unwrap(), "0 0 */28 * *");
    }

    #[test]
    fn test_cron_rejects_malformed() {
        for bad in ["2", "5x", "m", "", "0h", "+5m", "1.5h", "h5"] {
            assert!(cron_from_interval(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_cron_is_deterministic() {
        assert_eq!(cron_from_interval("15m").unwrap(), cron_from_interval("15m").unwrap());
    }

    #[test]
    fn test_derived_names() {
        assert_eq!(destination_name("app-data"), "app-data");
        assert_eq!(local_replication_name("app-data"), "app-data-local");
        assert_eq!(final_sync_claim_name("app-data"), "app-data-for-finalsync");
        assert_eq!(psk_secret_name("vrg-app"), "vrg-app-vs-secret");
        assert_eq!(source_job_name("app-data"), "volsync-rsync-tls-src-app-data");
        assert_eq!(
            remote_service_address("app-data", "app"),
            "volsync-rsync-tls-dst-app-data.app.svc.clusterset.local"
        );
    }

    #[test]
    fn test_service_name_truncated() {
        let long = "a".repeat(80);
        let name = local_service_name(&long);
        assert_eq!(name.len(), 63);
        assert!(name.starts_with("volsync-rsync-tls-dst-"));
    }
}
