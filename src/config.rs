use std::path::PathBuf;

use clap::Parser;
use url::Url;

/// Sports lines server: polls upstream scores, persists them, and streams
/// deltas to subscribers
#[derive(Parser, Debug, Clone)]
#[command(name = "sportlines", version, about)]
pub struct Config {
    /// Streaming RPC listen address
    #[arg(long, env = "RPC_ADDR", default_value = "127.0.0.1:50502")]
    pub rpc_addr: String,

    /// Status HTTP listen address
    #[arg(long, env = "HTTP_ADDR", default_value = "127.0.0.1:10052")]
    pub http_addr: String,

    /// Upstream score source host
    #[arg(long, env = "LINES_HOST", default_value = "http://localhost:8000")]
    pub lines_host: String,

    /// Upstream score source API path
    #[arg(long, env = "LINES_API", default_value = "api/v1/lines")]
    pub lines_api: String,

    /// Directory holding the embedded database
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    pub data_dir: PathBuf,

    /// Tracked sport as `<sport>:<polling-period-seconds>`; repeat per sport
    #[arg(long = "line", value_name = "SPORT:PERIOD")]
    pub lines: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if Url::parse(&self.lines_host).is_err() {
            anyhow::bail!("lines_host must be a valid URL, got {:?}", self.lines_host);
        }
        self.tracked_lines()?;
        Ok(())
    }

    /// Parsed `(sport, polling period in seconds)` pairs.
    pub fn tracked_lines(&self) -> anyhow::Result<Vec<(String, u64)>> {
        self.lines.iter().map(|line| parse_line(line)).collect()
    }
}

fn parse_line(arg: &str) -> anyhow::Result<(String, u64)> {
    let Some((sport, period)) = arg.split_once(':') else {
        anyhow::bail!("line {arg:?} must look like <sport>:<period-seconds>");
    };
    if sport.is_empty() {
        anyhow::bail!("line {arg:?} is missing the sport name");
    }
    let period: u64 = period
        .parse()
        .map_err(|_| anyhow::anyhow!("line {arg:?} has a non-numeric period"))?;
    if period == 0 {
        anyhow::bail!("line {arg:?} must poll at least every second");
    }
    Ok((sport.to_string(), period))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sport_and_period() {
        assert_eq!(parse_line("baseball:5").unwrap(), ("baseball".to_string(), 5));
    }

    #[test]
    fn rejects_malformed_lines() {
        for bad in ["baseball", ":5", "baseball:", "baseball:x", "baseball:0"] {
            assert!(parse_line(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn defaults_validate() {
        let config = Config::parse_from(["sportlines"]);
        config.validate().unwrap();
        assert!(config.tracked_lines().unwrap().is_empty());
    }

    #[test]
    fn repeated_line_arguments_accumulate() {
        let config = Config::parse_from([
            "sportlines",
            "--line",
            "baseball:5",
            "--line",
            "football:10",
        ]);
        assert_eq!(
            config.tracked_lines().unwrap(),
            vec![("baseball".to_string(), 5), ("football".to_string(), 10)]
        );
    }

    #[test]
    fn bad_host_fails_validation() {
        let mut config = Config::parse_from(["sportlines"]);
        config.lines_host = "not a url".to_string();
        assert!(config.validate().is_err());
    }
}
