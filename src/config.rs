// src/config.rs

use chrono_tz::Tz;
use dotenvy::dotenv;
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub database_url: String,
    /// Zone used when an activity carries no timezone of its own.
    pub default_timezone: Tz,
    pub maps_base_url: String,
    pub maps_api_key: String,
    /// Minutes of grace past the daily start time before a first check-in
    /// counts as late.
    pub late_grace_minutes: i64,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .expect("SERVER_PORT must be a valid port number"),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            default_timezone: env::var("DEFAULT_TIMEZONE")
                .unwrap_or_else(|_| "Asia/Kolkata".to_string())
                .parse()
                .expect("DEFAULT_TIMEZONE must be a valid IANA zone"),
            maps_base_url: env::var("MAPS_BASE_URL")
                .unwrap_or_else(|_| "https://maps.googleapis.com".to_string()),
            maps_api_key: env::var("MAPS_API_KEY").expect("MAPS_API_KEY must be set"),
            late_grace_minutes: env::var("LATE_GRACE_MINUTES")
                .unwrap_or_else(|_| "15".to_string())
                .parse()
                .expect("LATE_GRACE_MINUTES must be a number"),
        }
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
