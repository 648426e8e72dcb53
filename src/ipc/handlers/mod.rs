pub mod activities;
pub mod appointments;
pub mod backup_exchange;
pub mod cases;
pub mod core;
pub mod courses;
pub mod followups;
pub mod pregnancy;
pub mod representatives;
pub mod reports;
pub mod roster;
pub mod settings;
pub mod students;
pub mod subscriptions;
pub mod teachers;
