//! Beacon ("dig") extraction from raw access-log lines.
//!
//! The web page fires a request like
//! `GET /dig?time=..&refer=..&url=..&ua=.. HTTP/1.1`; the access log records it
//! verbatim. We cut out the query string and decode the four fields we count on.

/// Marks the start of a beacon query string in an access-log line.
pub const DIG_MARKER: &str = " /dig?";

/// Marks the end of the request target.
pub const HTTP_MARKER: &str = " HTTP/";

/// Fields decoded from one beacon.
///
/// The emitter names its parameters the other way around: `refer` carries the
/// page being measured and `url` carries the page the visitor came from.
/// The fields here are named by what they hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawEvent {
    pub time: String,
    /// Page the beacon fired on (the `refer` parameter).
    pub target_url: String,
    /// Page the visitor arrived from (the `url` parameter).
    pub referrer: String,
    pub user_agent: String,
}

impl RawEvent {
    /// A line without a beacon parses to an empty event.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
            && self.target_url.is_empty()
            && self.referrer.is_empty()
            && self.user_agent.is_empty()
    }

    /// Parse one raw log line.
    ///
    /// Lines without a beacon, or with a query string that won't decode, yield
    /// `RawEvent::default()`. Most access-log lines are not beacons.
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(start) = line.find(DIG_MARKER) else {
            return Self::default();
        };
        let query = &line[start + DIG_MARKER.len()..];
        let query = match query.find(HTTP_MARKER) {
            Some(end) => &query[..end],
            None => query,
        };

        // Decode the same way a browser would resolve the beacon URL.
        let Ok(url) = url::Url::parse(&format!("http://localhost/?{query}")) else {
            return Self::default();
        };

        let mut event = Self::default();
        for (name, value) in url.query_pairs() {
            let slot = match name.as_ref() {
                "time" => &mut event.time,
                "refer" => &mut event.target_url,
                "url" => &mut event.referrer,
                "ua" => &mut event.user_agent,
                _ => continue,
            };
            // First occurrence wins.
            if slot.is_empty() {
                *slot = value.into_owned();
            }
        }
        event
    }

    /// Pseudo-stable visitor id for this event.
    pub fn visitor_id(&self) -> VisitorId {
        VisitorId::new(&self.referrer, &self.user_agent)
    }
}

/// Hex-encoded MD5 of `referrer ++ user_agent`.
///
/// Not a secret and not salted: the same visitor must hash the same way across
/// restarts, or the daily UV sets stop deduplicating.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VisitorId(String);

impl VisitorId {
    pub fn new(referrer: &str, user_agent: &str) -> Self {
        let mut ctx = md5::Context::new();
        ctx.consume(referrer.as_bytes());
        ctx.consume(user_agent.as_bytes());
        Self(format!("{:x}", ctx.compute()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VisitorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINE: &str = r#"127.0.0.1 - - [03/May/2021:00:00:00 +0000] "GET /dig?time=1620000000&refer=/movie/100.html&url=http%3A%2F%2Fref&ua=UA HTTP/1.1" 200 43 "-" "UA""#;

    #[test]
    fn parses_beacon_with_swapped_names() {
        let event = RawEvent::parse(LINE);
        assert_eq!(
            event,
            RawEvent {
                time: "1620000000".into(),
                target_url: "/movie/100.html".into(),
                referrer: "http://ref".into(),
                user_agent: "UA".into(),
            }
        );
    }

    #[test]
    fn non_beacon_is_empty() {
        let event = RawEvent::parse(r#"127.0.0.1 - - "GET /index.html HTTP/1.1" 200 512"#);
        assert!(event.is_empty());
        assert!(RawEvent::parse("").is_empty());
    }

    #[test]
    fn missing_fields_are_empty_strings() {
        let event = RawEvent::parse("GET /dig?refer=/list/3.html HTTP/1.1");
        assert_eq!(event.target_url, "/list/3.html");
        assert_eq!(event.time, "");
        assert_eq!(event.referrer, "");
        assert_eq!(event.user_agent, "");
    }

    #[test]
    fn tolerates_missing_http_version() {
        let event = RawEvent::parse("GET /dig?time=5&ua=curl");
        assert_eq!(event.time, "5");
        assert_eq!(event.user_agent, "curl");
    }

    #[test]
    fn visitor_id_is_md5_of_referrer_then_agent() {
        let id = VisitorId::new("http://ref", "UA");
        assert_eq!(id.as_str(), format!("{:x}", md5::compute("http://refUA")));
        assert_eq!(id.as_str().len(), 32);
        assert_eq!(id, RawEvent::parse(LINE).visitor_id());
        assert_ne!(id, VisitorId::new("UA", "http://ref"));
    }
}
