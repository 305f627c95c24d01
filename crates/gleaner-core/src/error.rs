use serde::{Deserialize, Serialize};

/// Stable classification strings recorded in the failure tables and attempt
/// journal. Wire format is the snake_case name; never rename a variant
/// without migrating stored rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Timeout,
    Http,
    RateLimited,
    Auth,
    Parse,
    Validation,
    Quota,
    UnknownChannel,
    Config,
    Io,
    Unknown,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Http => "http",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Parse => "parse",
            Self::Validation => "validation",
            Self::Quota => "quota",
            Self::UnknownChannel => "unknown_channel",
            Self::Config => "config",
            Self::Io => "io",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "network" => Ok(Self::Network),
            "timeout" => Ok(Self::Timeout),
            "http" => Ok(Self::Http),
            "rate_limited" => Ok(Self::RateLimited),
            "auth" => Ok(Self::Auth),
            "parse" => Ok(Self::Parse),
            "validation" => Ok(Self::Validation),
            "quota" => Ok(Self::Quota),
            "unknown_channel" => Ok(Self::UnknownChannel),
            "config" => Ok(Self::Config),
            "io" => Ok(Self::Io),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown error class: {other}")),
        }
    }
}
