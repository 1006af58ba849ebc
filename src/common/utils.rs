//! Utility functions for sds-controller

use std::net::IpAddr;
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (seconds)
pub fn timestamp_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// New identifier for a workflow intent.
pub fn generate_workflow_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Validate a cluster object name (node, pool, resource, snapshot, gateway).
///
/// Names end up in device paths, unit names and config file names on the
/// nodes, so only a conservative character set is allowed.
pub fn validate_object_name(what: &str, name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(crate::Error::InvalidArgument(format!(
            "{} name cannot be empty",
            what
        )));
    }

    if name.len() > 64 {
        return Err(crate::Error::InvalidArgument(format!(
            "{} name too long (max 64 chars)",
            what
        )));
    }

    if name.starts_with('-') || name.starts_with('.') {
        return Err(crate::Error::InvalidArgument(format!(
            "{} name cannot start with '{}'",
            what,
            &name[..1]
        )));
    }

    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(crate::Error::InvalidArgument(format!(
            "{} name '{}' contains invalid character {:?}",
            what, name, bad
        )));
    }

    Ok(())
}

/// Validate an absolute mount path.
pub fn validate_mount_path(path: &str) -> crate::Result<()> {
    if !path.starts_with('/') || path == "/" {
        return Err(crate::Error::InvalidArgument(format!(
            "mount path must be absolute and not '/': {}",
            path
        )));
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(crate::Error::InvalidArgument(format!(
            "mount path cannot contain '..': {}",
            path
        )));
    }
    if path.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        return Err(crate::Error::InvalidArgument(format!(
            "mount path contains invalid characters: {}",
            path
        )));
    }
    Ok(())
}

/// Service-manager mount unit name for a path: `/mnt/data` -> `mnt-data.mount`.
pub fn mount_unit_name(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("{}.mount", trimmed.replace('/', "-"))
}

/// Parse `addr/prefix` into its address and prefix length.
pub fn parse_cidr(cidr: &str) -> crate::Result<(IpAddr, u8)> {
    let (addr, prefix) = cidr.split_once('/').ok_or_else(|| {
        crate::Error::InvalidArgument(format!("expected address/prefix, got '{}'", cidr))
    })?;

    let ip: IpAddr = addr
        .parse()
        .map_err(|_| crate::Error::InvalidArgument(format!("invalid IP address '{}'", addr)))?;

    let prefix: u8 = prefix
        .parse()
        .map_err(|_| crate::Error::InvalidArgument(format!("invalid prefix '{}'", prefix)))?;

    let max = if ip.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(crate::Error::InvalidArgument(format!(
            "prefix /{} out of range for {}",
            prefix, ip
        )));
    }

    Ok((ip, prefix))
}

/// Retry with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;
    let max_retries = max_retries.max(1);

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                tracing::warn!(
                    attempt = attempt + 1,
                    error = %e,
                    "retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("retry loop exhausted".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_validate_object_name() {
        assert!(validate_object_name("resource", "r0").is_ok());
        assert!(validate_object_name("resource", "data_vol-1.a").is_ok());
        assert!(validate_object_name("resource", "").is_err());
        assert!(validate_object_name("resource", "a/b").is_err());
        assert!(validate_object_name("resource", "a;rm").is_err());
        assert!(validate_object_name("resource", "-x").is_err());
        assert!(validate_object_name("resource", &"x".repeat(65)).is_err());
    }

    #[test]
    fn test_mount_unit_name() {
        assert_eq!(mount_unit_name("/mnt/data"), "mnt-data.mount");
        assert_eq!(mount_unit_name("/srv/"), "srv.mount");
    }

    #[test]
    fn test_validate_mount_path() {
        assert!(validate_mount_path("/mnt/data").is_ok());
        assert!(validate_mount_path("mnt").is_err());
        assert!(validate_mount_path("/").is_err());
        assert!(validate_mount_path("/mnt/../etc").is_err());
    }

    #[test]
    fn test_parse_cidr() {
        let (ip, prefix) = parse_cidr("10.0.0.50/24").unwrap();
        assert_eq!(ip.to_string(), "10.0.0.50");
        assert_eq!(prefix, 24);
        assert!(parse_cidr("10.0.0.50").is_err());
        assert!(parse_cidr("10.0.0.50/33").is_err());
        assert!(parse_cidr("nope/24").is_err());
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: crate::Result<()> = retry_with_backoff(
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(crate::Error::NotFound("x".into())) }
            },
            3,
            Duration::from_millis(1),
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_retries_transient_error() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(crate::Error::Timeout("slow".into()))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            Duration::from_millis(1),
        )
        .await
        .unwrap();
        assert_eq!(result, 2);
    }
}
