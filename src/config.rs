use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration shared by the API server and the worker.
///
/// | Env Var                  | Required | Default                  |
/// |--------------------------|----------|--------------------------|
/// | `DATABASE_URL`           | **yes**  | --                       |
/// | `JWT_SECRET`             | **yes**  | --                       |
/// | `REDIS_URL`              | no       | `redis://localhost:6379` |
/// | `UPLOAD_DIR`             | no       | `uploads`                |
/// | `PUBLIC_BASE_URL`        | no       | `http://localhost:8000`  |
/// | `FFMPEG_BIN`             | no       | `ffmpeg`                 |
/// | `WATERMARK_TIMEOUT_SECS` | no       | `600`                    |
/// | `WATERMARK_CONCURRENCY`  | no       | available parallelism    |
/// | `WATERMARK_MAX_RETRIES`  | no       | `2`                      |
/// | `WORKER_CONCURRENCY`     | no       | `3`                      |
/// | `ROSTER_URL`             | no       | unset (static roster)    |
/// | `ROSTER_TIMEOUT_SECS`    | no       | `5`                      |
/// | `EMBED_TOKEN_TTL_SECS`   | no       | `900`                    |
/// | `MAX_UPLOAD_BYTES`       | no       | `524288000`              |
/// | `PORT`                   | no       | `8000`                   |
/// | `CORS_ORIGIN`            | no       | `http://localhost:3000`  |
/// | `TRUSTED_PROXIES`        | no       | empty (comma-separated)  |
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub upload_dir: PathBuf,
    pub public_base_url: String,
    pub ffmpeg_bin: PathBuf,
    pub watermark_timeout: Duration,
    pub watermark_concurrency: usize,
    pub watermark_max_retries: i32,
    pub worker_concurrency: usize,
    pub roster_url: Option<String>,
    pub roster_timeout: Duration,
    pub embed_token_ttl: Duration,
    pub max_upload_bytes: usize,
    pub port: u16,
    pub cors_origin: String,
    /// Peers whose `X-Forwarded-For`/`X-Real-IP` headers are believed.
    pub trusted_proxies: Vec<IpAddr>,
}

const DEFAULT_WATERMARK_TIMEOUT_SECS: u64 = 600;
const DEFAULT_MAX_RETRIES: i32 = 2;
const DEFAULT_WORKER_CONCURRENCY: usize = 3;
const DEFAULT_ROSTER_TIMEOUT_SECS: u64 = 5;
const DEFAULT_EMBED_TTL_SECS: u64 = 900;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 500 * 1024 * 1024;

impl AppConfig {
    /// Load configuration from the process environment.
    ///
    /// # Panics
    ///
    /// Panics if `DATABASE_URL` or `JWT_SECRET` is missing, or a numeric
    /// variable does not parse. Both binaries call this once at startup.
    pub fn from_env() -> Self {
        let jwt_secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set");
        assert!(!jwt_secret.is_empty(), "JWT_SECRET must not be empty");

        let default_parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Self {
            database_url: std::env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            redis_url: env_or("REDIS_URL", "redis://localhost:6379"),
            jwt_secret,
            upload_dir: PathBuf::from(env_or("UPLOAD_DIR", "uploads")),
            public_base_url: env_or("PUBLIC_BASE_URL", "http://localhost:8000")
                .trim_end_matches('/')
                .to_string(),
            ffmpeg_bin: PathBuf::from(env_or("FFMPEG_BIN", "ffmpeg")),
            watermark_timeout: Duration::from_secs(parse_env(
                "WATERMARK_TIMEOUT_SECS",
                DEFAULT_WATERMARK_TIMEOUT_SECS,
            )),
            watermark_concurrency: parse_env("WATERMARK_CONCURRENCY", default_parallelism).max(1),
            watermark_max_retries: parse_env("WATERMARK_MAX_RETRIES", DEFAULT_MAX_RETRIES),
            worker_concurrency: parse_env("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY).max(1),
            roster_url: std::env::var("ROSTER_URL").ok().filter(|s| !s.is_empty()),
            roster_timeout: Duration::from_secs(parse_env(
                "ROSTER_TIMEOUT_SECS",
                DEFAULT_ROSTER_TIMEOUT_SECS,
            )),
            embed_token_ttl: Duration::from_secs(parse_env(
                "EMBED_TOKEN_TTL_SECS",
                DEFAULT_EMBED_TTL_SECS,
            )),
            max_upload_bytes: parse_env("MAX_UPLOAD_BYTES", DEFAULT_MAX_UPLOAD_BYTES),
            port: parse_env("PORT", 8000),
            cors_origin: env_or("CORS_ORIGIN", "http://localhost:3000"),
            trusted_proxies: parse_ip_list("TRUSTED_PROXIES", &env_or("TRUSTED_PROXIES", "")),
        }
    }
}

impl AppConfig {
    /// How long a queued or in-flight video may sit unchanged before the
    /// owner can force a retry.
    pub fn stale_job_after(&self) -> Duration {
        self.watermark_timeout * 2 + self.roster_timeout
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number, got {raw:?}")),
        Err(_) => default,
    }
}

fn parse_ip_list(key: &str, raw: &str) -> Vec<IpAddr> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse()
                .unwrap_or_else(|_| panic!("{key} must list IP addresses, got {s:?}"))
        })
        .collect()
}

#[cfg(test)]
impl AppConfig {
    /// Config for tests that never touch postgres or redis.
    pub fn for_tests(upload_dir: PathBuf) -> Self {
        Self {
            database_url: "postgres://localhost/secureteach_test".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            jwt_secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            upload_dir,
            public_base_url: "https://videos.example.test".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            watermark_timeout: Duration::from_secs(5),
            watermark_concurrency: 1,
            watermark_max_retries: DEFAULT_MAX_RETRIES,
            worker_concurrency: 1,
            roster_url: None,
            roster_timeout: Duration::from_secs(1),
            embed_token_ttl: Duration::from_secs(DEFAULT_EMBED_TTL_SECS),
            max_upload_bytes: 1024 * 1024,
            port: 0,
            cors_origin: "http://localhost:3000".to_string(),
            trusted_proxies: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trusted_proxy_list_parses_and_skips_blanks() {
        let ips = parse_ip_list("TRUSTED_PROXIES", " 10.0.0.1, ,::1 ");
        assert_eq!(ips, vec!["10.0.0.1".parse::<IpAddr>().unwrap(), "::1".parse().unwrap()]);
        assert!(parse_ip_list("TRUSTED_PROXIES", "").is_empty());
    }
}
