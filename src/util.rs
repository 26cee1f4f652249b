use std::path::PathBuf;

const DATABASE_PATH: &str = "UPTIME_DATABASE_PATH";

const DEFAULT_DATABASE_PATH: &str = "./uptime.db";

pub fn get_database_path() -> PathBuf {
    let path_from_env = std::env::var(DATABASE_PATH);
    path_from_env.map_or_else(|_| PathBuf::from(DEFAULT_DATABASE_PATH), PathBuf::from)
}

const WEBHOOK_URL: &str = "UPTIME_WEBHOOK_URL";

/// Overrides the configured notifier with a webhook relay when set
pub fn get_webhook_url() -> Option<String> {
    let url_from_env = std::env::var(WEBHOOK_URL);
    url_from_env.ok().filter(|url| !url.is_empty())
}
