use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

/// Seconds since the unix epoch. All persisted timestamps use this form.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before 1970")
        .as_secs() as i64
}
