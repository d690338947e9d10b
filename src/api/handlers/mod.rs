pub mod assessment_types;
pub mod auth;
pub mod classes;
pub mod core;
pub mod marks;
pub mod reports;
pub mod schools;
pub mod subjects;
pub mod users;
