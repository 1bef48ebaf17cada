use std::env;
#[cfg(test)]
use std::sync::Mutex;

/// Campus application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// The platform API server address (defaults to "https://api.campus.sh")
    pub server: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let server =
            env::var("CAMPUS_SERVER").unwrap_or_else(|_| "https://api.campus.sh".to_string());
        Self {
            server: normalize_server(server),
        }
    }
}

/// Normalize localhost to IPv4 to avoid IPv6 (::1) preference on macOS
pub fn normalize_server(server: String) -> String {
    if server.starts_with("localhost:") {
        server.replacen("localhost", "127.0.0.1", 1)
    } else {
        server
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: "https://api.campus.sh".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Mutex to ensure environment variable tests don't run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server, "https://api.campus.sh");
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();

        unsafe {
            env::remove_var("CAMPUS_SERVER");
        }
        let config = Config::from_env();
        assert_eq!(config.server, "https://api.campus.sh");
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original = env::var("CAMPUS_SERVER").ok();

        unsafe {
            env::set_var("CAMPUS_SERVER", "campus.example.edu");
        }
        let config = Config::from_env();
        assert_eq!(config.server, "campus.example.edu");

        unsafe {
            if let Some(orig) = original {
                env::set_var("CAMPUS_SERVER", orig);
            } else {
                env::remove_var("CAMPUS_SERVER");
            }
        }
    }

    #[test]
    fn test_config_normalizes_localhost() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let original = env::var("CAMPUS_SERVER").ok();

        unsafe {
            env::set_var("CAMPUS_SERVER", "localhost:4280");
        }
        let config = Config::from_env();
        assert_eq!(config.server, "127.0.0.1:4280");

        unsafe {
            if let Some(orig) = original {
                env::set_var("CAMPUS_SERVER", orig);
            } else {
                env::remove_var("CAMPUS_SERVER");
            }
        }
    }
}
