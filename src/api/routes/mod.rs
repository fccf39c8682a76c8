pub mod actions;
pub mod agents;
pub mod backups;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Ids carry a `/kind_id/` prefix that cannot travel in a path segment.
pub(crate) fn prefixed_id(prefix: &str, id: &str) -> String {
    if id.starts_with('/') {
        id.to_string()
    } else {
        format!("/{prefix}/{id}")
    }
}
