use crate::db;
use chrono::{Duration, NaiveTime, Timelike};
use rusqlite::Connection;
use std::collections::HashSet;

pub const SETTINGS_KEY: &str = "scheduling";

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingConfig {
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub slot_minutes: i64,
    pub lunch_hour: u32,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        SchedulingConfig {
            start: NaiveTime::from_hms_opt(9, 0, 0).expect("valid default start"),
            end: NaiveTime::from_hms_opt(18, 0, 0).expect("valid default end"),
            slot_minutes: 30,
            lunch_hour: 13,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleError {
    pub code: String,
    pub message: String,
}

impl ScheduleError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Reads the `scheduling` settings section, falling back to defaults
/// field by field so a partial section never breaks slot generation.
pub fn load_scheduling_config(conn: &Connection) -> SchedulingConfig {
    let defaults = SchedulingConfig::default();
    let Some(obj) = db::settings_get_json(conn, SETTINGS_KEY)
        .ok()
        .flatten()
        .and_then(|v| v.as_object().cloned())
    else {
        return defaults;
    };

    let parse_time = |key: &str| -> Option<NaiveTime> {
        obj.get(key)
            .and_then(|v| v.as_str())
            .and_then(|s| NaiveTime::parse_from_str(s, "%H:%M").ok())
    };

    let start = parse_time("startTime").unwrap_or(defaults.start);
    let end = parse_time("endTime").unwrap_or(defaults.end);
    let slot_minutes = obj
        .get("slotMinutes")
        .and_then(|v| v.as_i64())
        .filter(|v| *v > 0 && *v <= 120)
        .unwrap_or(defaults.slot_minutes);
    let lunch_hour = obj
        .get("lunchHour")
        .and_then(|v| v.as_u64())
        .filter(|v| *v < 24)
        .map(|v| v as u32)
        .unwrap_or(defaults.lunch_hour);

    SchedulingConfig {
        start,
        end,
        slot_minutes,
        lunch_hour,
    }
}

pub fn scheduling_config_json(cfg: &SchedulingConfig) -> serde_json::Value {
    serde_json::json!({
        "startTime": cfg.start.format("%H:%M").to_string(),
        "endTime": cfg.end.format("%H:%M").to_string(),
        "slotMinutes": cfg.slot_minutes,
        "lunchHour": cfg.lunch_hour,
    })
}

/// Candidate start times in [start, end), fixed increments, with every
/// slot inside the lunch hour removed.
pub fn generate_slots(cfg: &SchedulingConfig) -> Vec<String> {
    let mut out = Vec::new();
    if cfg.slot_minutes <= 0 {
        return out;
    }
    let mut t = cfg.start;
    while t < cfg.end {
        if t.hour() != cfg.lunch_hour {
            out.push(t.format("%H:%M").to_string());
        }
        // overflowing_add_signed wraps at midnight; stop instead of looping.
        let (next, wrapped) = t.overflowing_add_signed(Duration::minutes(cfg.slot_minutes));
        if wrapped != 0 || next <= t {
            break;
        }
        t = next;
    }
    out
}

pub fn subtract_booked(all: &[String], booked: &HashSet<String>) -> Vec<String> {
    all.iter()
        .filter(|s| !booked.contains(s.as_str()))
        .cloned()
        .collect()
}

/// Start times already taken on a date. Cancelled appointments do not
/// hold their slot.
pub fn booked_start_times(conn: &Connection, date: &str) -> Result<HashSet<String>, ScheduleError> {
    let mut stmt = conn
        .prepare(
            "SELECT start_time FROM appointments
             WHERE date = ? AND status != 'cancelled'",
        )
        .map_err(|e| ScheduleError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map([date], |r| r.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| ScheduleError::new("db_query_failed", e.to_string()))?;
    Ok(rows.into_iter().collect())
}

pub fn compute_available_slots(
    conn: &Connection,
    date: &str,
) -> Result<Vec<String>, ScheduleError> {
    let cfg = load_scheduling_config(conn);
    let all = generate_slots(&cfg);
    let booked = booked_start_times(conn, date)?;
    Ok(subtract_booked(&all, &booked))
}

pub fn end_time_for(start: &str, cfg: &SchedulingConfig) -> Option<String> {
    let t = NaiveTime::parse_from_str(start, "%H:%M").ok()?;
    let end = t.overflowing_add_signed(Duration::minutes(cfg.slot_minutes)).0;
    Some(end.format("%H:%M").to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> SchedulingConfig {
        SchedulingConfig::default()
    }

    #[test]
    fn default_day_skips_lunch_hour() {
        let slots = generate_slots(&cfg());
        assert_eq!(slots.first().map(String::as_str), Some("09:00"));
        assert_eq!(slots.last().map(String::as_str), Some("17:30"));
        assert!(!slots.contains(&"13:00".to_string()));
        assert!(!slots.contains(&"13:30".to_string()));
        // 18 half-hours 09:00..18:00 minus the two lunch slots.
        assert_eq!(slots.len(), 16);
    }

    #[test]
    fn booked_slot_is_subtracted_exactly() {
        let all = generate_slots(&cfg());
        let booked: HashSet<String> = ["10:00".to_string()].into_iter().collect();
        let free = subtract_booked(&all, &booked);
        let expected = vec![
            "09:00", "09:30", "10:30", "11:00", "11:30", "12:00", "12:30", "14:00", "14:30",
            "15:00", "15:30", "16:00", "16:30", "17:00", "17:30",
        ];
        assert_eq!(free, expected);
    }

    #[test]
    fn degenerate_window_yields_no_slots() {
        let mut c = cfg();
        c.end = c.start;
        assert!(generate_slots(&c).is_empty());
    }

    #[test]
    fn end_time_advances_one_slot() {
        assert_eq!(end_time_for("09:00", &cfg()).as_deref(), Some("09:30"));
        assert_eq!(end_time_for("17:30", &cfg()).as_deref(), Some("18:00"));
        assert!(end_time_for("junk", &cfg()).is_none());
    }
}
