pub mod paths;
pub mod settings;

pub use paths::PathManager;
pub use settings::{RetrySettings, Settings, SyncSettings};

/// Read `.env` files into the process environment: `~/.env` first, then
/// `./.env`, so project values override home values. Call before parsing CLI
/// args so `env` fallbacks such as `CHATSYNC_DB` see them.
pub fn load_env_file() {
    let home_env = dirs::home_dir().map(|home| home.join(".env"));
    if let Some(path) = home_env.filter(|p| p.is_file()) {
        dotenv::from_path(path).ok();
    }
    dotenv::dotenv().ok();
}
