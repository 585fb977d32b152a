pub mod auth;
pub mod backup_exchange;
pub mod catalog;
pub mod chat;
pub mod core;
pub mod dashboard;
pub mod documents;
pub mod grades;
pub mod groups;
pub mod meetings;
pub mod milestones;
pub mod notifications;
pub mod projects;
pub mod setup;
pub mod users;
