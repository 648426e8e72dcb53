use chrono::{NaiveDate, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

static CEDULA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{10}$").expect("invalid cedula regex"));

// Ecuadorian mobile numbers: ten digits, 09 prefix.
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^09[0-9]{8}$").expect("invalid phone regex"));

pub fn validate_cedula(cedula: &str) -> Result<(), &'static str> {
    if !CEDULA_RE.is_match(cedula) {
        return Err("cedula must be exactly 10 digits");
    }
    Ok(())
}

pub fn validate_phone(phone: &str) -> Result<(), &'static str> {
    if !PHONE_RE.is_match(phone) {
        return Err("phone must start with 09 and be exactly 10 digits");
    }
    Ok(())
}

pub fn validate_date(date: &str) -> Result<(), &'static str> {
    NaiveDate::parse_from_str(date, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| "date must be YYYY-MM-DD")
}

pub fn validate_time(time: &str) -> Result<(), &'static str> {
    NaiveTime::parse_from_str(time, "%H:%M")
        .map(|_| ())
        .map_err(|_| "time must be HH:MM")
}
