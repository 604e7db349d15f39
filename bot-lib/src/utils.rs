use chrono::{DateTime, TimeDelta, Utc};

pub trait GetRelativeTimestamp {
    fn discord_relative_timestamp(&self) -> String;
}

impl GetRelativeTimestamp for DateTime<Utc> {
    fn discord_relative_timestamp(&self) -> String {
        format!("<t:{}:R>", self.timestamp())
    }
}

/// "4m 30s" style text for a cooldown, never less than a second.
pub fn format_remaining(remaining: TimeDelta) -> String {
    let seconds = remaining.num_seconds().max(1) as u64;
    humantime::format_duration(std::time::Duration::from_secs(seconds)).to_string()
}
