//! Identity of a running Nailgun server, in the `exe:fingerprint:pid:port` string form the
//! resolver and the CLI exchange.
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::errors::EndpointParseError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub exe: String,
    pub fingerprint: String,
    pub pid: u32,
    pub port: u16,
}

impl Endpoint {
    pub fn new(
        exe: impl Into<String>,
        fingerprint: impl Into<String>,
        pid: u32,
        port: u16,
    ) -> Self {
        Self {
            exe: exe.into(),
            fingerprint: fingerprint.into(),
            pid,
            port,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, EndpointParseError> {
        raw.parse()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}:{}", self.exe, self.fingerprint, self.pid, self.port)
    }
}

fn positive<N: FromStr + Default + PartialEq>(
    field: &'static str,
    value: &str,
    raw: &str,
) -> Result<N, EndpointParseError> {
    match value.parse::<N>() {
        Ok(n) if n != N::default() => Ok(n),
        _ => Err(EndpointParseError::InvalidNumber {
            field,
            value: value.to_string(),
            raw: raw.to_string(),
        }),
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = raw.split(':').collect();
        let [exe, fingerprint, pid, port] = fields.as_slice() else {
            return Err(EndpointParseError::FieldCount(fields.len(), raw.to_string()));
        };
        Ok(Endpoint {
            exe: exe.to_string(),
            fingerprint: fingerprint.to_string(),
            pid: positive("pid", pid, raw)?,
            port: positive("port", port, raw)?,
        })
    }
}
