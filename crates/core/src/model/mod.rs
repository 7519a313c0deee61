pub mod dashboard;
pub mod datasource;
pub mod point;
