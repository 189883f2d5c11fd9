//! Header names of the wire protocol and typed accessors for them.

use std::str::FromStr;

use axum::http::HeaderMap;

use crate::error::{NetrenderError, Result};

pub const SLAVE_ID: &str = "slave-id";
pub const JOB_ID: &str = "job-id";
pub const JOB_FRAME: &str = "job-frame";
pub const JOB_RESULT: &str = "job-result";
pub const JOB_TIME: &str = "job-time";
pub const JOB_FILE: &str = "job-file";
pub const RESET_ALL: &str = "reset-all";
pub const RULE_ID: &str = "rule-id";
pub const RULE_ENABLE: &str = "rule-enable";
pub const RULE_LIMIT: &str = "rule-limit";

pub fn optional<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<Option<&'a str>> {
    match headers.get(name) {
        None => Ok(None),
        Some(value) => value
            .to_str()
            .map(|v| Some(v.trim()))
            .map_err(|_| NetrenderError::InvalidHeader {
                name,
                value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
            }),
    }
}

pub fn required<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str> {
    optional(headers, name)?.ok_or(NetrenderError::MissingHeader(name))
}

pub fn parse_optional<T: FromStr>(headers: &HeaderMap, name: &'static str) -> Result<Option<T>> {
    optional(headers, name)?
        .map(|v| {
            v.parse().map_err(|_| NetrenderError::InvalidHeader {
                name,
                value: v.to_string(),
            })
        })
        .transpose()
}

pub fn parse<T: FromStr>(headers: &HeaderMap, name: &'static str) -> Result<T> {
    parse_optional(headers, name)?.ok_or(NetrenderError::MissingHeader(name))
}

/// Accepts `true`/`false`, `yes`/`no` and `1`/`0`, case-insensitively.
pub fn flag(headers: &HeaderMap, name: &'static str) -> Result<Option<bool>> {
    optional(headers, name)?
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            _ => Err(NetrenderError::InvalidHeader {
                name,
                value: v.to_string(),
            }),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(*k, HeaderValue::from_static(*v));
        }
        map
    }

    #[test]
    fn required_header_missing() {
        let map = headers(&[]);
        assert!(matches!(
            required(&map, JOB_ID),
            Err(NetrenderError::MissingHeader("job-id"))
        ));
    }

    #[test]
    fn parse_frame_number() {
        let map = headers(&[(JOB_FRAME, "12"), (JOB_TIME, "abc")]);
        assert_eq!(parse::<i32>(&map, JOB_FRAME).unwrap(), 12);
        assert!(parse::<f64>(&map, JOB_TIME).is_err());
        assert_eq!(parse_optional::<i32>(&map, RESET_ALL).unwrap(), None);
    }

    #[test]
    fn flags() {
        let map = headers(&[(RESET_ALL, "True"), (RULE_ENABLE, "0")]);
        assert_eq!(flag(&map, RESET_ALL).unwrap(), Some(true));
        assert_eq!(flag(&map, RULE_ENABLE).unwrap(), Some(false));
        assert_eq!(flag(&map, JOB_ID).unwrap(), None);
    }
}
