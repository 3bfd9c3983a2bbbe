//! Data model shared by the scheduler, the state engine, and the
//! notification backends.

pub mod labels;
pub mod settings;
pub mod types;

/// Converts a std duration into a chrono one, saturating at a century.
pub fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::weeks(52 * 100))
}
