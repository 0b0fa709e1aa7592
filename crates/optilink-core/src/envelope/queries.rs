//! Builders for the queries the session itself issues.

use super::QueryEnvelope;
use crate::error::Result;

pub const BASIC_PROJECT_INFO: &str = "BASIC_PROJECT_INFO";
pub const FULL_PROJECT_STATUS_INFO: &str = "FULL_PROJECT_STATUS_INFO";
pub const SERVER_INFO: &str = "SERVER_INFO";
pub const SERVER_IS_ALIVE: &str = "SERVER_IS_ALIVE";

pub fn basic_project_info(password: Option<&str>) -> Result<String> {
    QueryEnvelope::what(BASIC_PROJECT_INFO, password).to_json()
}

pub fn full_project_status_info(password: Option<&str>) -> Result<String> {
    QueryEnvelope::what(FULL_PROJECT_STATUS_INFO, password).to_json()
}

pub fn server_info(password: Option<&str>) -> Result<String> {
    QueryEnvelope::what(SERVER_INFO, password).to_json()
}

pub fn server_is_alive(password: Option<&str>) -> Result<String> {
    QueryEnvelope::what(SERVER_IS_ALIVE, password).to_json()
}
