use regex::Regex;
use serde::Deserialize;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IperfParseError {
    #[error("iperf3 JSON could not be decoded: {0}")]
    Json(#[from] serde_json::Error),
    #[error("iperf3 reported an error: {0}")]
    Tool(String),
    #[error("no sender/receiver summary in iperf3 output")]
    NoSummary,
    #[error("invalid number '{0}' in iperf3 output")]
    InvalidNumber(String),
    #[error("unknown speed unit '{0}'")]
    UnknownUnit(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeedUnit {
    Bps,
    Kbps,
    Mbps,
    Gbps,
}

impl SpeedUnit {
    fn from_label(label: &str) -> Option<Self> {
        match label {
            "bits/sec" => Some(Self::Bps),
            "Kbits/sec" => Some(Self::Kbps),
            "Mbits/sec" => Some(Self::Mbps),
            "Gbits/sec" => Some(Self::Gbps),
            _ => None,
        }
    }

    /// Multiplier into Kbit/s. iperf3 scales by 1024, so do we.
    fn kbps_factor(self) -> f64 {
        match self {
            Self::Bps => 1.0 / 1024.0,
            Self::Kbps => 1.0,
            Self::Mbps => 1024.0,
            Self::Gbps => 1024.0 * 1024.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Speed {
    pub value: f64,
    pub unit: SpeedUnit,
}

impl Speed {
    pub fn to_kbps(self) -> f64 {
        self.value * self.unit.kbps_factor()
    }

    pub fn rounded_kbps(self) -> u32 {
        let kbps = self.to_kbps().round();
        if kbps <= 0.0 {
            0
        } else if kbps >= f64::from(u32::MAX) {
            u32::MAX
        } else {
            kbps as u32
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IperfResult {
    pub sender: Speed,
    pub receiver: Speed,
}

#[derive(Debug, Deserialize)]
struct JsonReport {
    #[serde(default)]
    end: Option<JsonEnd>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JsonEnd {
    #[serde(default)]
    streams: Vec<JsonStream>,
}

#[derive(Debug, Deserialize)]
struct JsonStream {
    sender: JsonEndpoint,
    receiver: JsonEndpoint,
}

#[derive(Debug, Deserialize)]
struct JsonEndpoint {
    bits_per_second: f64,
}

/// Parses iperf3 client output, either `-J` JSON or the plain text report.
pub fn parse_output(output: &str) -> Result<IperfResult, IperfParseError> {
    if output.trim_start().starts_with('{') {
        parse_json(output)
    } else {
        parse_text(output)
    }
}

fn parse_json(output: &str) -> Result<IperfResult, IperfParseError> {
    let report: JsonReport = serde_json::from_str(output)?;
    if let Some(err) = report.error {
        return Err(IperfParseError::Tool(err));
    }

    let stream = report
        .end
        .and_then(|end| end.streams.into_iter().next())
        .ok_or(IperfParseError::NoSummary)?;

    Ok(IperfResult {
        sender: Speed {
            value: stream.sender.bits_per_second,
            unit: SpeedUnit::Bps,
        },
        receiver: Speed {
            value: stream.receiver.bits_per_second,
            unit: SpeedUnit::Bps,
        },
    })
}

fn summary_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\[\s*(?:\d+|SUM)\]\s+[\d.]+-[\d.]+\s+sec\s+[\d.]+\s+\w*Bytes\s+([\d.]+)\s+(\S+/sec)(?:\s+\d+)?\s+(sender|receiver)\s*$",
        )
        .expect("summary regex is valid")
    })
}

fn parse_text(output: &str) -> Result<IperfResult, IperfParseError> {
    let mut sender = None;
    let mut receiver = None;

    for line in output.lines() {
        let Some(caps) = summary_line().captures(line.trim_end()) else {
            continue;
        };

        let raw_value = &caps[1];
        let value = raw_value
            .parse::<f64>()
            .map_err(|_| IperfParseError::InvalidNumber(raw_value.to_string()))?;
        let unit = SpeedUnit::from_label(&caps[2])
            .ok_or_else(|| IperfParseError::UnknownUnit(caps[2].to_string()))?;
        let speed = Speed { value, unit };

        match &caps[3] {
            "sender" if sender.is_none() => sender = Some(speed),
            "receiver" if receiver.is_none() => receiver = Some(speed),
            _ => {}
        }
    }

    match (sender, receiver) {
        (Some(sender), Some(receiver)) => Ok(IperfResult { sender, receiver }),
        _ => Err(IperfParseError::NoSummary),
    }
}
