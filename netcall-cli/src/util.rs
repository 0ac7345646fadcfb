use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Error, Result};
use fnv::FnvHashMap;

use netcall_core::{Kwargs, Value};
use netcall_net::{BalancerConfig, Discovery, WorkerId};

/// Balancer settings as read from a TOML file. Everything is optional,
/// command line arguments take precedence.
///
/// ```toml
/// clients = ["tcp://0.0.0.0:9900"]
/// interval = 30.0
///
/// [workers]
/// "tcp://10.0.0.2:9910" = "worker-a"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct BalancerFile {
    pub clients: Vec<String>,
    /// Seconds between discovery rounds
    pub interval: Option<f64>,
    /// Seconds until the next round when no workers were found
    pub empty_backoff: Option<f64>,
    /// Seconds before fresh workers become selectable
    pub settle_delay: Option<f64>,
    /// Identity of the worker-facing socket
    pub identity: Option<String>,
    /// Map of worker address to worker id
    pub workers: BTreeMap<String, String>,
}

impl BalancerFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| Error::msg(format!("failed reading {}: {}", path.display(), e)))?;
        Ok(toml::from_str(&content)?)
    }

    pub fn apply(&self, config: &mut BalancerConfig) -> Result<()> {
        if let Some(secs) = self.interval {
            config.interval = seconds(secs)?;
        }
        if let Some(secs) = self.empty_backoff {
            config.empty_backoff = seconds(secs)?;
        }
        if let Some(secs) = self.settle_delay {
            config.settle_delay = seconds(secs)?;
        }
        if let Some(identity) = &self.identity {
            config.identity = Some(identity.as_bytes().to_vec());
        }
        Ok(())
    }

    pub fn workers(&self) -> FnvHashMap<String, WorkerId> {
        self.workers
            .iter()
            .map(|(a, w)| (a.clone(), WorkerId::from(w.as_str())))
            .collect()
    }
}

/// Discovery reading the worker table from the config file on every round,
/// merged with workers given on the command line.
pub(crate) fn file_discovery(
    path: Option<PathBuf>,
    extra: Vec<(String, WorkerId)>,
) -> impl Discovery {
    move || -> netcall_net::Result<FnvHashMap<String, WorkerId>> {
        let mut workers = match &path {
            Some(p) => BalancerFile::load(p)
                .map_err(|e| netcall_net::Error::Other(e.to_string()))?
                .workers(),
            None => FnvHashMap::default(),
        };
        workers.extend(extra.iter().cloned());
        Ok(workers)
    }
}

/// Parses a duration given in seconds.
pub(crate) fn seconds(secs: f64) -> Result<Duration> {
    if !secs.is_finite() || secs < 0. {
        return Err(Error::msg(format!("invalid number of seconds: {}", secs)));
    }
    Ok(Duration::from_secs_f64(secs))
}

/// Parses `address=worker-id`.
pub(crate) fn parse_worker(s: &str) -> Result<(String, WorkerId)> {
    match s.rfind('=') {
        Some(i) if i > 0 && i + 1 < s.len() => {
            Ok((s[..i].to_string(), WorkerId::from(&s[i + 1..])))
        }
        _ => Err(Error::msg(format!(
            "expected worker as address=id, got: {}",
            s
        ))),
    }
}

/// Reads a command line argument as a value, trying nil, booleans and
/// numbers before falling back to a string.
pub(crate) fn parse_value(s: &str) -> Value {
    match s {
        "nil" | "none" | "null" => return Value::Nil,
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => (),
    }
    if let Ok(i) = s.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = s.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(s.to_string())
}

/// Parses `key=value` pairs into keyword arguments.
pub(crate) fn parse_kwargs<'a, I: IntoIterator<Item = &'a str>>(pairs: I) -> Result<Kwargs> {
    let mut kwargs = Kwargs::new();
    for pair in pairs {
        match pair.find('=') {
            Some(i) if i > 0 => {
                kwargs.insert(pair[..i].to_string(), parse_value(&pair[i + 1..]));
            }
            _ => {
                return Err(Error::msg(format!(
                    "expected keyword argument as key=value, got: {}",
                    pair
                )))
            }
        }
    }
    Ok(kwargs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_from_arguments() {
        assert_eq!(parse_value("12"), Value::Int(12));
        assert_eq!(parse_value("-1.5"), Value::Float(-1.5));
        assert_eq!(parse_value("none"), Value::Nil);
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("hi"), Value::from("hi"));
    }

    #[test]
    fn workers_and_kwargs() {
        let (addr, id) = parse_worker("tcp://127.0.0.1:9910=worker-a").unwrap();
        assert_eq!(addr, "tcp://127.0.0.1:9910");
        assert_eq!(id, WorkerId::from("worker-a"));
        assert!(parse_worker("tcp://127.0.0.1:9910").is_err());
        assert!(parse_worker("addr=").is_err());

        let kwargs = parse_kwargs(vec!["n=3", "label=x=y"]).unwrap();
        assert_eq!(kwargs["n"], Value::Int(3));
        assert_eq!(kwargs["label"], Value::from("x=y"));
        assert!(parse_kwargs(vec!["=3"]).is_err());
    }

    #[test]
    fn balancer_file() {
        let file: BalancerFile = toml::from_str(
            r#"
            clients = ["inproc://lb"]
            interval = 5.0
            settle_delay = 0.25

            [workers]
            "inproc://a" = "a"
            "#,
        )
        .unwrap();
        let mut config = BalancerConfig::default();
        file.apply(&mut config).unwrap();
        assert_eq!(config.interval, Duration::from_secs(5));
        assert_eq!(config.settle_delay, Duration::from_millis(250));
        assert_eq!(config.empty_backoff, Duration::from_secs(3));
        assert_eq!(file.workers()["inproc://a"], WorkerId::from("a"));
        assert!(seconds(-1.).is_err());
    }
}
